use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing;

use waba_core::notify::Notifier;
use waba_core::store;
use waba_core::types::MessageStatus;
use waba_core::AppContext;

/// Webhook verification handshake: echo the challenge iff the presented
/// token matches the tenant's stored verify token. Records the verification
/// timestamp on first success; a wrong token changes nothing.
pub async fn verify(
    ctx: &AppContext,
    tenant_id: &str,
    mode: &str,
    token: &str,
    challenge: &str,
) -> Result<Option<String>> {
    if mode != "subscribe" {
        return Ok(None);
    }

    let mut conn = ctx.db_pool.get().await?;
    let tenant = match store::get_tenant(&mut conn, tenant_id).await? {
        Some(t) => t,
        None => return Ok(None),
    };

    match handshake_challenge(mode, tenant.webhook_verify_token.as_deref(), token, challenge) {
        Some(echoed) => {
            store::mark_webhook_verified(&mut conn, tenant_id).await?;
            tracing::info!(tenant_id = %tenant_id, "Webhook verified");
            Ok(Some(echoed))
        }
        None => {
            tracing::warn!(tenant_id = %tenant_id, "Webhook verification token mismatch");
            Ok(None)
        }
    }
}

/// The handshake decision itself: echo the challenge only for a `subscribe`
/// request whose token matches the tenant's stored verify token. A tenant
/// with no stored token can never verify.
fn handshake_challenge(
    mode: &str,
    expected_token: Option<&str>,
    token: &str,
    challenge: &str,
) -> Option<String> {
    if mode != "subscribe" {
        return None;
    }
    match expected_token {
        Some(expected) if expected == token => Some(challenge.to_string()),
        _ => None,
    }
}

/// Process one event-delivery payload. Every change is handled independently:
/// a malformed or failing entry is logged and skipped so the rest of the
/// batch (and the 200 acknowledgment) is never blocked.
pub async fn process_event(ctx: &AppContext, notifier: &dyn Notifier, payload: &Value) -> Result<()> {
    for change in extract_changes(payload) {
        let field = change.get("field").and_then(|f| f.as_str()).unwrap_or("");
        let value = match change.get("value") {
            Some(v) => v,
            None => continue,
        };

        let outcome = match field {
            "messages" => handle_messages(ctx, notifier, value).await,
            "message_template_status_update" => handle_template_update(ctx, notifier, value).await,
            _ => {
                tracing::debug!(field = %field, "Ignoring webhook change field");
                Ok(())
            }
        };

        if let Err(e) = outcome {
            tracing::warn!(field = %field, "Failed to process webhook change: {}", e);
        }
    }

    Ok(())
}

fn extract_changes(payload: &Value) -> Vec<&Value> {
    payload
        .get("entry")
        .and_then(|e| e.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.get("changes").and_then(|c| c.as_array()))
                .flatten()
                .collect()
        })
        .unwrap_or_default()
}

/// A `messages` change carries inbound messages and/or delivery statuses.
async fn handle_messages(ctx: &AppContext, notifier: &dyn Notifier, value: &Value) -> Result<()> {
    let phone_number_id = value
        .get("metadata")
        .and_then(|m| m.get("phone_number_id"))
        .and_then(|p| p.as_str())
        .ok_or_else(|| anyhow!("missing metadata.phone_number_id"))?;

    let mut conn = ctx.db_pool.get().await?;
    let tenant = store::get_tenant_by_phone_number_id(&mut conn, phone_number_id)
        .await?
        .ok_or_else(|| anyhow!("no tenant for phone_number_id {}", phone_number_id))?;

    if let Some(messages) = value.get("messages").and_then(|m| m.as_array()) {
        for inbound in messages {
            if let Err(e) = handle_inbound(ctx, notifier, &tenant.id, inbound).await {
                tracing::warn!(tenant_id = %tenant.id, "Skipping inbound message: {}", e);
            }
        }
    }

    if let Some(statuses) = value.get("statuses").and_then(|s| s.as_array()) {
        for status in statuses {
            if let Err(e) = handle_status(ctx, notifier, &tenant.id, status).await {
                tracing::warn!(tenant_id = %tenant.id, "Skipping status update: {}", e);
            }
        }
    }

    Ok(())
}

/// An inbound customer message opens (or refreshes) the 24-hour service
/// window for that sender.
async fn handle_inbound(
    ctx: &AppContext,
    notifier: &dyn Notifier,
    tenant_id: &str,
    inbound: &Value,
) -> Result<()> {
    let from = inbound
        .get("from")
        .and_then(|f| f.as_str())
        .ok_or_else(|| anyhow!("inbound message missing 'from'"))?;
    let at = parse_provider_timestamp(inbound.get("timestamp")).unwrap_or_else(Utc::now);

    let recipient = waba_core::normalize_recipient(from);

    let mut conn = ctx.db_pool.get().await?;
    store::touch_interaction(&mut conn, tenant_id, &recipient, at).await?;

    tracing::debug!(tenant_id = %tenant_id, from = %recipient, "Service window refreshed");

    let event = serde_json::json!({
        "type": "inbound_message",
        "from": recipient,
        "timestamp": at,
        "message": inbound,
    });
    if let Err(e) = notifier.publish(tenant_id, &event).await {
        tracing::warn!(tenant_id = %tenant_id, "Failed to publish inbound event: {}", e);
    }

    Ok(())
}

/// Delivery status callback: advance the matching (message, recipient)
/// outcome through the forward-only guard and re-derive the message status.
async fn handle_status(
    ctx: &AppContext,
    notifier: &dyn Notifier,
    tenant_id: &str,
    status: &Value,
) -> Result<()> {
    let provider_message_id = status
        .get("id")
        .and_then(|i| i.as_str())
        .ok_or_else(|| anyhow!("status update missing 'id'"))?;
    let reported = status
        .get("status")
        .and_then(|s| s.as_str())
        .ok_or_else(|| anyhow!("status update missing 'status'"))?;

    let mapped = match map_provider_status(reported) {
        Some(s) => s,
        None => {
            tracing::debug!(status = %reported, "Ignoring unknown provider status");
            return Ok(());
        }
    };

    // A failed callback carries the reason in `errors`; keep it for the tenant
    let error_detail = provider_error_detail(status);

    let mut conn = ctx.db_pool.get().await?;
    let message_id = store::advance_recipient_by_provider_id(
        &mut conn,
        provider_message_id,
        mapped,
        error_detail.as_deref(),
    )
    .await?;

    if let Some(message_id) = message_id {
        store::sync_aggregate_status(&mut conn, &message_id).await?;

        let event = serde_json::json!({
            "type": "message_status",
            "message_id": message_id,
            "provider_message_id": provider_message_id,
            "status": mapped.as_str(),
            "error": error_detail,
        });
        if let Err(e) = notifier.publish(tenant_id, &event).await {
            tracing::warn!(tenant_id = %tenant_id, "Failed to publish status event: {}", e);
        }
    } else {
        tracing::debug!(
            provider_message_id = %provider_message_id,
            "Status update for unknown provider message id"
        );
    }

    Ok(())
}

/// Template review outcome from the provider.
async fn handle_template_update(
    ctx: &AppContext,
    notifier: &dyn Notifier,
    value: &Value,
) -> Result<()> {
    let template_id = value
        .get("message_template_id")
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .ok_or_else(|| anyhow!("template update missing message_template_id"))?;
    let event_status = value
        .get("event")
        .and_then(|e| e.as_str())
        .ok_or_else(|| anyhow!("template update missing event"))?;
    let reason = value.get("reason").and_then(|r| r.as_str()).filter(|r| *r != "NONE");

    let mut conn = ctx.db_pool.get().await?;
    let tenant_id =
        store::update_template_status(&mut conn, &template_id, event_status, reason).await?;

    match tenant_id {
        Some(tenant_id) => {
            tracing::info!(
                tenant_id = %tenant_id,
                template_id = %template_id,
                status = %event_status,
                "Template status updated"
            );

            let event = serde_json::json!({
                "type": "template_status",
                "provider_template_id": template_id,
                "status": event_status,
                "reason": reason,
            });
            if let Err(e) = notifier.publish(&tenant_id, &event).await {
                tracing::warn!(tenant_id = %tenant_id, "Failed to publish template event: {}", e);
            }
            Ok(())
        }
        None => Err(anyhow!("no template with provider id {}", template_id)),
    }
}

/// First human-readable entry of a status callback's `errors` array, falling
/// back to the numeric code when the provider sends nothing readable.
fn provider_error_detail(status: &Value) -> Option<String> {
    let first = status.get("errors")?.as_array()?.first()?;
    first
        .get("message")
        .or_else(|| first.get("title"))
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
        .or_else(|| first.get("code").map(|c| format!("provider error code {}", c)))
}

pub fn map_provider_status(reported: &str) -> Option<MessageStatus> {
    match reported {
        "sent" => Some(MessageStatus::Sent),
        "delivered" => Some(MessageStatus::Delivered),
        "read" => Some(MessageStatus::Read),
        "failed" => Some(MessageStatus::Failed),
        _ => None,
    }
}

fn parse_provider_timestamp(raw: Option<&Value>) -> Option<DateTime<Utc>> {
    // Provider timestamps are unix-epoch seconds, as a string or number
    let secs = match raw? {
        Value::String(s) => s.parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    Utc.timestamp_opt(secs, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn provider_status_vocabulary() {
        assert_eq!(map_provider_status("sent"), Some(MessageStatus::Sent));
        assert_eq!(map_provider_status("delivered"), Some(MessageStatus::Delivered));
        assert_eq!(map_provider_status("read"), Some(MessageStatus::Read));
        assert_eq!(map_provider_status("failed"), Some(MessageStatus::Failed));
        assert_eq!(map_provider_status("warning"), None);
    }

    #[test]
    fn changes_are_collected_across_entries() {
        let payload = json!({
            "object": "whatsapp_business_account",
            "entry": [
                { "id": "1", "changes": [ { "field": "messages", "value": {} } ] },
                { "id": "2", "changes": [
                    { "field": "messages", "value": {} },
                    { "field": "message_template_status_update", "value": {} }
                ] }
            ]
        });
        assert_eq!(extract_changes(&payload).len(), 3);
    }

    #[test]
    fn malformed_entries_yield_no_changes() {
        assert!(extract_changes(&json!({})).is_empty());
        assert!(extract_changes(&json!({ "entry": "nope" })).is_empty());
        assert!(extract_changes(&json!({ "entry": [ { "changes": 42 }, {} ] })).is_empty());
    }

    #[test]
    fn handshake_echoes_challenge_on_token_match() {
        assert_eq!(
            handshake_challenge("subscribe", Some("tok-1"), "tok-1", "4242"),
            Some("4242".to_string())
        );
    }

    #[test]
    fn handshake_rejects_everything_else() {
        // wrong token
        assert_eq!(handshake_challenge("subscribe", Some("tok-1"), "tok-2", "c"), None);
        // no stored token at all
        assert_eq!(handshake_challenge("subscribe", None, "tok-1", "c"), None);
        // wrong mode, even with a matching token
        assert_eq!(handshake_challenge("unsubscribe", Some("tok-1"), "tok-1", "c"), None);
    }

    #[test]
    fn failed_status_keeps_the_provider_reason() {
        let status = json!({
            "id": "wamid.X",
            "status": "failed",
            "errors": [
                { "code": 130472, "title": "Experiment number",
                  "message": "User's number is part of an experiment" }
            ]
        });
        assert_eq!(
            provider_error_detail(&status).as_deref(),
            Some("User's number is part of an experiment")
        );

        let title_only = json!({ "errors": [ { "code": 1, "title": "Unknown" } ] });
        assert_eq!(provider_error_detail(&title_only).as_deref(), Some("Unknown"));

        let code_only = json!({ "errors": [ { "code": 131026 } ] });
        assert_eq!(
            provider_error_detail(&code_only).as_deref(),
            Some("provider error code 131026")
        );

        assert_eq!(provider_error_detail(&json!({ "status": "delivered" })), None);
    }

    #[test]
    fn provider_timestamps_parse_from_string_or_number() {
        let at = parse_provider_timestamp(Some(&json!("1767225600"))).unwrap();
        assert_eq!(at.timestamp(), 1767225600);
        let at = parse_provider_timestamp(Some(&json!(1767225600))).unwrap();
        assert_eq!(at.timestamp(), 1767225600);
        assert!(parse_provider_timestamp(Some(&json!("soon"))).is_none());
        assert!(parse_provider_timestamp(None).is_none());
    }
}
