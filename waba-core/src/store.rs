use anyhow::Result;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};

use crate::db::DbConnection;
use crate::schema::{
    waba_interactions, waba_message_recipients, waba_messages, waba_templates, waba_tenants,
};
use crate::types::{aggregate_status, MessageRecord, MessageStatus, RecipientOutcome, Template, Tenant};

// ---------------------------------------------------------------------------
// Tenants
// ---------------------------------------------------------------------------

type TenantRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<DateTime<Utc>>,
);

fn tenant_columns() -> (
    waba_tenants::id,
    waba_tenants::name,
    waba_tenants::phone_number_id,
    waba_tenants::access_token_enc,
    waba_tenants::webhook_verify_token,
    waba_tenants::webhook_verified_at,
) {
    (
        waba_tenants::id,
        waba_tenants::name,
        waba_tenants::phone_number_id,
        waba_tenants::access_token_enc,
        waba_tenants::webhook_verify_token,
        waba_tenants::webhook_verified_at,
    )
}

fn tenant_from_row(row: TenantRow) -> Tenant {
    Tenant {
        id: row.0,
        name: row.1,
        phone_number_id: row.2,
        access_token_enc: row.3,
        webhook_verify_token: row.4,
        webhook_verified_at: row.5,
    }
}

pub async fn get_tenant(conn: &mut DbConnection, tenant_id: &str) -> Result<Option<Tenant>> {
    let row: Option<TenantRow> = waba_tenants::table
        .filter(waba_tenants::id.eq(tenant_id))
        .select(tenant_columns())
        .first(conn)
        .await
        .optional()?;

    Ok(row.map(tenant_from_row))
}

/// Webhook events carry the provider's phone-number identifier, not our
/// tenant id; this is the resolution path for ingestion.
pub async fn get_tenant_by_phone_number_id(
    conn: &mut DbConnection,
    phone_number_id: &str,
) -> Result<Option<Tenant>> {
    let row: Option<TenantRow> = waba_tenants::table
        .filter(waba_tenants::phone_number_id.eq(phone_number_id))
        .select(tenant_columns())
        .first(conn)
        .await
        .optional()?;

    Ok(row.map(tenant_from_row))
}

pub async fn mark_webhook_verified(conn: &mut DbConnection, tenant_id: &str) -> Result<()> {
    diesel::update(waba_tenants::table.filter(waba_tenants::id.eq(tenant_id)))
        .set((
            waba_tenants::webhook_verified_at.eq(Utc::now()),
            waba_tenants::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Messages and per-recipient outcomes
// ---------------------------------------------------------------------------

pub struct NewMessage<'a> {
    pub id: &'a str,
    pub tenant_id: &'a str,
    pub message_type: &'a str,
    pub content: serde_json::Value,
    pub status: MessageStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub recipients: &'a [String],
}

/// Persist a message together with one outcome row per recipient, all in the
/// initial status. One transaction: a message row must never exist without
/// its outcome rows.
pub async fn insert_message(conn: &mut DbConnection, msg: &NewMessage<'_>) -> Result<()> {
    conn.transaction::<_, anyhow::Error, _>(|conn| {
        async move {
            diesel::insert_into(waba_messages::table)
                .values((
                    waba_messages::id.eq(msg.id),
                    waba_messages::tenant_id.eq(msg.tenant_id),
                    waba_messages::message_type.eq(msg.message_type),
                    waba_messages::content.eq(&msg.content),
                    waba_messages::status.eq(msg.status.as_str()),
                    waba_messages::scheduled_at.eq(msg.scheduled_at),
                ))
                .execute(conn)
                .await?;

            let rows: Vec<_> = msg
                .recipients
                .iter()
                .map(|r| {
                    (
                        waba_message_recipients::message_id.eq(msg.id),
                        waba_message_recipients::recipient.eq(r.as_str()),
                        waba_message_recipients::status.eq(msg.status.as_str()),
                    )
                })
                .collect();

            diesel::insert_into(waba_message_recipients::table)
                .values(rows)
                .execute(conn)
                .await?;

            Ok(())
        }
        .scope_boxed()
    })
    .await
}

pub async fn get_message(conn: &mut DbConnection, message_id: &str) -> Result<Option<MessageRecord>> {
    let row: Option<(
        String,
        String,
        String,
        serde_json::Value,
        String,
        Option<DateTime<Utc>>,
        Option<String>,
        Option<String>,
        DateTime<Utc>,
        DateTime<Utc>,
    )> = waba_messages::table
        .filter(waba_messages::id.eq(message_id))
        .select((
            waba_messages::id,
            waba_messages::tenant_id,
            waba_messages::message_type,
            waba_messages::content,
            waba_messages::status,
            waba_messages::scheduled_at,
            waba_messages::provider_message_id,
            waba_messages::error,
            waba_messages::created_at,
            waba_messages::updated_at,
        ))
        .first(conn)
        .await
        .optional()?;

    Ok(row.map(
        |(id, tenant_id, message_type, content, status, scheduled_at, provider_message_id, error, created_at, updated_at)| MessageRecord {
            id,
            tenant_id,
            message_type,
            content,
            status,
            scheduled_at,
            provider_message_id,
            error,
            created_at,
            updated_at,
        },
    ))
}

pub async fn list_messages(
    conn: &mut DbConnection,
    tenant_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<MessageRecord>> {
    let rows: Vec<(
        String,
        String,
        String,
        serde_json::Value,
        String,
        Option<DateTime<Utc>>,
        Option<String>,
        Option<String>,
        DateTime<Utc>,
        DateTime<Utc>,
    )> = waba_messages::table
        .filter(waba_messages::tenant_id.eq(tenant_id))
        .order(waba_messages::created_at.desc())
        .limit(limit)
        .offset(offset)
        .select((
            waba_messages::id,
            waba_messages::tenant_id,
            waba_messages::message_type,
            waba_messages::content,
            waba_messages::status,
            waba_messages::scheduled_at,
            waba_messages::provider_message_id,
            waba_messages::error,
            waba_messages::created_at,
            waba_messages::updated_at,
        ))
        .load(conn)
        .await?;

    Ok(rows
        .into_iter()
        .map(
            |(id, tenant_id, message_type, content, status, scheduled_at, provider_message_id, error, created_at, updated_at)| MessageRecord {
                id,
                tenant_id,
                message_type,
                content,
                status,
                scheduled_at,
                provider_message_id,
                error,
                created_at,
                updated_at,
            },
        )
        .collect())
}

/// Due-sweep query: SCHEDULED messages whose scheduled time has passed,
/// bounded to one batch.
pub async fn find_due_scheduled(
    conn: &mut DbConnection,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = waba_messages::table
        .filter(waba_messages::status.eq(MessageStatus::Scheduled.as_str()))
        .filter(waba_messages::scheduled_at.le(now))
        .order(waba_messages::scheduled_at.asc())
        .limit(limit)
        .select((waba_messages::id, waba_messages::tenant_id))
        .load(conn)
        .await?;

    Ok(rows)
}

/// Crash-recovery query: messages that were claimed as QUEUED but never got
/// a provider id and have not been touched since `cutoff`. These were either
/// published and lost by a crashed consumer, or never published at all; the
/// per-recipient idempotence guard makes re-enqueueing them safe.
pub async fn find_stuck_queued(
    conn: &mut DbConnection,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = waba_messages::table
        .filter(waba_messages::status.eq(MessageStatus::Queued.as_str()))
        .filter(waba_messages::provider_message_id.is_null())
        .filter(waba_messages::updated_at.lt(cutoff))
        .order(waba_messages::updated_at.asc())
        .limit(limit)
        .select((waba_messages::id, waba_messages::tenant_id))
        .load(conn)
        .await?;

    Ok(rows)
}

/// Bump `updated_at` so a just-requeued message waits a full threshold
/// before the recovery sweep considers it again.
pub async fn touch_message(conn: &mut DbConnection, message_id: &str) -> Result<()> {
    diesel::update(waba_messages::table.filter(waba_messages::id.eq(message_id)))
        .set(waba_messages::updated_at.eq(Utc::now()))
        .execute(conn)
        .await?;
    Ok(())
}

/// Atomic claim of a due message: only the replica whose conditional update
/// flips SCHEDULED→QUEUED gets to enqueue it. Recipient rows follow the
/// message in the same transaction, so a claimed message can never carry
/// SCHEDULED outcome rows the consumer's forward-only writes would reject.
pub async fn claim_scheduled(conn: &mut DbConnection, message_id: &str) -> Result<bool> {
    conn.transaction::<_, anyhow::Error, _>(|conn| {
        async move {
            let updated = diesel::update(
                waba_messages::table
                    .filter(waba_messages::id.eq(message_id))
                    .filter(waba_messages::status.eq(MessageStatus::Scheduled.as_str())),
            )
            .set((
                waba_messages::status.eq(MessageStatus::Queued.as_str()),
                waba_messages::updated_at.eq(Utc::now()),
            ))
            .execute(conn)
            .await?;

            if updated == 1 {
                diesel::update(
                    waba_message_recipients::table
                        .filter(waba_message_recipients::message_id.eq(message_id))
                        .filter(
                            waba_message_recipients::status
                                .eq(MessageStatus::Scheduled.as_str()),
                        ),
                )
                .set((
                    waba_message_recipients::status.eq(MessageStatus::Queued.as_str()),
                    waba_message_recipients::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;
            }

            Ok(updated == 1)
        }
        .scope_boxed()
    })
    .await
}

/// Conditional forward-only transition of the message-level status. Returns
/// false when the guard rejects the write (already past `to`, or terminal).
pub async fn advance_message_status(
    conn: &mut DbConnection,
    message_id: &str,
    to: MessageStatus,
    error: Option<&str>,
) -> Result<bool> {
    let preds: Vec<&str> = MessageStatus::predecessors(to)
        .iter()
        .map(|s| s.as_str())
        .collect();

    let target = waba_messages::table
        .filter(waba_messages::id.eq(message_id))
        .filter(waba_messages::status.eq_any(preds));

    let updated = if let Some(err) = error {
        diesel::update(target)
            .set((
                waba_messages::status.eq(to.as_str()),
                waba_messages::error.eq(err),
                waba_messages::updated_at.eq(Utc::now()),
            ))
            .execute(conn)
            .await?
    } else {
        diesel::update(target)
            .set((
                waba_messages::status.eq(to.as_str()),
                waba_messages::updated_at.eq(Utc::now()),
            ))
            .execute(conn)
            .await?
    };

    Ok(updated == 1)
}

pub async fn get_recipient_status(
    conn: &mut DbConnection,
    message_id: &str,
    recipient: &str,
) -> Result<Option<MessageStatus>> {
    let status: Option<String> = waba_message_recipients::table
        .filter(waba_message_recipients::message_id.eq(message_id))
        .filter(waba_message_recipients::recipient.eq(recipient))
        .select(waba_message_recipients::status)
        .first(conn)
        .await
        .optional()?;

    Ok(status.and_then(|s| MessageStatus::parse(&s)))
}

/// Conditional transition of one (message, recipient) outcome row.
pub async fn advance_recipient_status(
    conn: &mut DbConnection,
    message_id: &str,
    recipient: &str,
    to: MessageStatus,
    provider_message_id: Option<&str>,
    error: Option<&str>,
) -> Result<bool> {
    let preds: Vec<&str> = MessageStatus::predecessors(to)
        .iter()
        .map(|s| s.as_str())
        .collect();

    let target = waba_message_recipients::table
        .filter(waba_message_recipients::message_id.eq(message_id))
        .filter(waba_message_recipients::recipient.eq(recipient))
        .filter(waba_message_recipients::status.eq_any(preds));

    let updated = diesel::update(target)
        .set((
            waba_message_recipients::status.eq(to.as_str()),
            waba_message_recipients::provider_message_id.eq(provider_message_id),
            waba_message_recipients::error.eq(error),
            waba_message_recipients::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;

    Ok(updated == 1)
}

/// Status webhooks reference the provider's message id, not ours; advance the
/// matching outcome row and hand back our message id for re-aggregation.
pub async fn advance_recipient_by_provider_id(
    conn: &mut DbConnection,
    provider_message_id: &str,
    to: MessageStatus,
    error: Option<&str>,
) -> Result<Option<String>> {
    let row: Option<(String, String, String)> = waba_message_recipients::table
        .filter(waba_message_recipients::provider_message_id.eq(provider_message_id))
        .select((
            waba_message_recipients::message_id,
            waba_message_recipients::recipient,
            waba_message_recipients::status,
        ))
        .first(conn)
        .await
        .optional()?;

    let (message_id, recipient, _status) = match row {
        Some(r) => r,
        None => return Ok(None),
    };

    advance_recipient_status(
        conn,
        &message_id,
        &recipient,
        to,
        Some(provider_message_id),
        error,
    )
    .await?;

    Ok(Some(message_id))
}

pub async fn recipient_outcomes(
    conn: &mut DbConnection,
    message_id: &str,
) -> Result<Vec<RecipientOutcome>> {
    let rows: Vec<(String, String, String, Option<String>, Option<String>, DateTime<Utc>)> =
        waba_message_recipients::table
            .filter(waba_message_recipients::message_id.eq(message_id))
            .order(waba_message_recipients::id.asc())
            .select((
                waba_message_recipients::message_id,
                waba_message_recipients::recipient,
                waba_message_recipients::status,
                waba_message_recipients::provider_message_id,
                waba_message_recipients::error,
                waba_message_recipients::updated_at,
            ))
            .load(conn)
            .await?;

    Ok(rows
        .into_iter()
        .map(
            |(message_id, recipient, status, provider_message_id, error, updated_at)| RecipientOutcome {
                message_id,
                recipient,
                status,
                provider_message_id,
                error,
                updated_at,
            },
        )
        .collect())
}

/// Outcome rows for a page of messages in one query, for the list endpoint.
pub async fn recipient_outcomes_for_messages(
    conn: &mut DbConnection,
    message_ids: &[String],
) -> Result<Vec<RecipientOutcome>> {
    if message_ids.is_empty() {
        return Ok(Vec::new());
    }

    let rows: Vec<(String, String, String, Option<String>, Option<String>, DateTime<Utc>)> =
        waba_message_recipients::table
            .filter(waba_message_recipients::message_id.eq_any(message_ids))
            .order(waba_message_recipients::id.asc())
            .select((
                waba_message_recipients::message_id,
                waba_message_recipients::recipient,
                waba_message_recipients::status,
                waba_message_recipients::provider_message_id,
                waba_message_recipients::error,
                waba_message_recipients::updated_at,
            ))
            .load(conn)
            .await?;

    Ok(rows
        .into_iter()
        .map(
            |(message_id, recipient, status, provider_message_id, error, updated_at)| RecipientOutcome {
                message_id,
                recipient,
                status,
                provider_message_id,
                error,
                updated_at,
            },
        )
        .collect())
}

/// Re-derive the message-level status from its recipient outcomes and apply
/// it through the conditional guard. Returns the status that was applied, if
/// the aggregate is settled and the guard accepted it.
pub async fn sync_aggregate_status(
    conn: &mut DbConnection,
    message_id: &str,
) -> Result<Option<MessageStatus>> {
    let raw: Vec<(String, Option<String>)> = waba_message_recipients::table
        .filter(waba_message_recipients::message_id.eq(message_id))
        .select((
            waba_message_recipients::status,
            waba_message_recipients::error,
        ))
        .load(conn)
        .await?;

    let statuses: Vec<MessageStatus> = raw
        .iter()
        .filter_map(|(s, _)| MessageStatus::parse(s))
        .collect();

    let aggregate = match aggregate_status(&statuses) {
        Some(s) => s,
        None => return Ok(None),
    };

    let error = if aggregate == MessageStatus::Failed {
        raw.iter().filter_map(|(_, e)| e.as_deref()).last()
    } else {
        None
    };

    let applied = advance_message_status(conn, message_id, aggregate, error).await?;
    Ok(applied.then_some(aggregate))
}

/// Record (or refresh) the provider message id on the message row the first
/// time a recipient send is accepted.
pub async fn record_provider_message_id(
    conn: &mut DbConnection,
    message_id: &str,
    provider_message_id: &str,
) -> Result<()> {
    diesel::update(
        waba_messages::table
            .filter(waba_messages::id.eq(message_id))
            .filter(waba_messages::provider_message_id.is_null()),
    )
    .set((
        waba_messages::provider_message_id.eq(provider_message_id),
        waba_messages::updated_at.eq(Utc::now()),
    ))
    .execute(conn)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Interactions (24-hour service window)
// ---------------------------------------------------------------------------

/// Upsert the most recent inbound contact for (tenant, recipient). Only ever
/// moves the timestamp forward.
pub async fn touch_interaction(
    conn: &mut DbConnection,
    tenant_id: &str,
    recipient: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    use diesel::query_dsl::methods::FilterDsl;
    diesel::insert_into(waba_interactions::table)
        .values((
            waba_interactions::tenant_id.eq(tenant_id),
            waba_interactions::recipient.eq(recipient),
            waba_interactions::last_inbound_at.eq(at),
        ))
        .on_conflict((waba_interactions::tenant_id, waba_interactions::recipient))
        .do_update()
        .set(waba_interactions::last_inbound_at.eq(at))
        .filter(waba_interactions::last_inbound_at.lt(at))
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn last_interaction_at(
    conn: &mut DbConnection,
    tenant_id: &str,
    recipient: &str,
) -> Result<Option<DateTime<Utc>>> {
    let at: Option<DateTime<Utc>> = waba_interactions::table
        .filter(waba_interactions::tenant_id.eq(tenant_id))
        .filter(waba_interactions::recipient.eq(recipient))
        .select(waba_interactions::last_inbound_at)
        .first(conn)
        .await
        .optional()?;

    Ok(at)
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

pub async fn find_template(
    conn: &mut DbConnection,
    tenant_id: &str,
    name: &str,
    language: &str,
) -> Result<Option<Template>> {
    let row: Option<(String, String, String, String, String, Option<String>, i64)> =
        waba_templates::table
            .filter(waba_templates::tenant_id.eq(tenant_id))
            .filter(waba_templates::name.eq(name))
            .filter(waba_templates::language.eq(language))
            .select((
                waba_templates::provider_template_id,
                waba_templates::name,
                waba_templates::language,
                waba_templates::category,
                waba_templates::status,
                waba_templates::rejection_reason,
                waba_templates::id,
            ))
            .first(conn)
            .await
            .optional()?;

    Ok(row.map(
        |(provider_template_id, name, language, category, status, rejection_reason, id)| Template {
            id,
            tenant_id: tenant_id.to_string(),
            provider_template_id,
            name,
            language,
            category,
            status,
            rejection_reason,
        },
    ))
}

/// Template review webhooks carry the provider's template id; returns the
/// owning tenant id so ingestion can notify the right channel.
pub async fn update_template_status(
    conn: &mut DbConnection,
    provider_template_id: &str,
    status: &str,
    rejection_reason: Option<&str>,
) -> Result<Option<String>> {
    let tenant_id: Option<String> = waba_templates::table
        .filter(waba_templates::provider_template_id.eq(provider_template_id))
        .select(waba_templates::tenant_id)
        .first(conn)
        .await
        .optional()?;

    if tenant_id.is_some() {
        diesel::update(
            waba_templates::table
                .filter(waba_templates::provider_template_id.eq(provider_template_id)),
        )
        .set((
            waba_templates::status.eq(status),
            waba_templates::rejection_reason.eq(rejection_reason),
            waba_templates::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;
    }

    Ok(tenant_id)
}
