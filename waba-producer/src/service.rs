use anyhow::anyhow;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing;
use uuid::Uuid;

use waba_core::content::MessageContent;
use waba_core::kafka::{produce_message, OUTBOUND_TOPIC};
use waba_core::store;
use waba_core::types::{MessageRecord, MessageStatus, SendJob};
use waba_core::{decrypt_token, AppContext};

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub recipients: Vec<String>,
    pub content: MessageContent,
    #[serde(default)]
    pub schedule_date: Option<String>,
    #[serde(default)]
    pub schedule_time: Option<String>,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Validation(String),
    #[error("tenant not found")]
    TenantNotFound,
    #[error("tenant has no delivery credentials configured")]
    CredentialsMissing,
    #[error("failed to enqueue message: {0}")]
    Queue(#[source] anyhow::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Accept a validated send request: persist the message and either enqueue it
/// now or leave it SCHEDULED for the sweep. At most one queue publish.
pub async fn submit(
    ctx: &AppContext,
    tenant_id: &str,
    request: SubmitRequest,
) -> Result<MessageRecord, SubmitError> {
    if request.recipients.is_empty() {
        return Err(SubmitError::Validation(
            "at least one recipient is required".to_string(),
        ));
    }
    if request.recipients.iter().any(|r| r.trim().is_empty()) {
        return Err(SubmitError::Validation(
            "recipients must not be blank".to_string(),
        ));
    }

    request
        .content
        .validate()
        .map_err(|e| SubmitError::Validation(e.to_string()))?;

    let scheduled_at = parse_schedule(
        request.schedule_date.as_deref(),
        request.schedule_time.as_deref(),
        Utc::now(),
    )
    .map_err(SubmitError::Validation)?;

    let mut conn = ctx
        .db_pool
        .get()
        .await
        .map_err(|e| SubmitError::Internal(anyhow!("database unavailable: {}", e)))?;

    let tenant = store::get_tenant(&mut conn, tenant_id)
        .await?
        .ok_or(SubmitError::TenantNotFound)?;

    let access_token_enc = match tenant.access_token_enc.as_deref() {
        Some(t) if !tenant.phone_number_id.is_empty() => t,
        _ => return Err(SubmitError::CredentialsMissing),
    };

    let message_id = Uuid::new_v4().to_string();
    let status = if scheduled_at.is_some() {
        MessageStatus::Scheduled
    } else {
        MessageStatus::Queued
    };
    let content_json = serde_json::to_value(&request.content).map_err(anyhow::Error::from)?;

    store::insert_message(
        &mut conn,
        &store::NewMessage {
            id: &message_id,
            tenant_id,
            message_type: request.content.type_name(),
            content: content_json,
            status,
            scheduled_at,
            recipients: &request.recipients,
        },
    )
    .await?;

    if let Some(at) = scheduled_at {
        tracing::info!(
            message_id = %message_id,
            tenant_id = %tenant_id,
            scheduled_at = %at,
            "Message scheduled"
        );
    } else {
        let access_token = decrypt_token(
            access_token_enc,
            tenant_id,
            &ctx.config.server.encryption_key,
        )?;

        let job = SendJob {
            message_id: message_id.clone(),
            tenant_id: tenant_id.to_string(),
            phone_number_id: tenant.phone_number_id.clone(),
            access_token,
            recipients: request.recipients.clone(),
            content: request.content.clone(),
        };

        let payload = serde_json::to_vec(&job).map_err(anyhow::Error::from)?;

        // Publish failure is surfaced to the caller; the message stays QUEUED
        // in storage until the scheduler's recovery sweep re-enqueues it.
        produce_message(
            &ctx.kafka_producer,
            OUTBOUND_TOPIC,
            Some(&message_id),
            &payload,
        )
        .await
        .map_err(SubmitError::Queue)?;

        tracing::info!(
            message_id = %message_id,
            tenant_id = %tenant_id,
            recipients = request.recipients.len(),
            "Message queued for delivery"
        );
    }

    store::get_message(&mut conn, &message_id)
        .await?
        .ok_or_else(|| SubmitError::Internal(anyhow!("message {} vanished after insert", message_id)))
}

/// Both schedule fields or neither; the resulting instant must be in the
/// future. Returns None for immediate sends.
pub fn parse_schedule(
    date: Option<&str>,
    time: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, String> {
    let (date, time) = match (date, time) {
        (None, None) => return Ok(None),
        (Some(d), Some(t)) => (d, t),
        _ => {
            return Err("schedule_date and schedule_time must be provided together".to_string());
        }
    };

    let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| format!("invalid schedule_date: {}", date))?;
    let time = NaiveTime::parse_from_str(time, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M:%S"))
        .map_err(|_| format!("invalid schedule_time: {}", time))?;

    let at = Utc.from_utc_datetime(&date.and_time(time));
    if at <= now {
        return Err("scheduled time must be in the future".to_string());
    }

    Ok(Some(at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn no_schedule_means_immediate() {
        assert_eq!(parse_schedule(None, None, now()), Ok(None));
    }

    #[test]
    fn schedule_fields_come_in_pairs() {
        assert!(parse_schedule(Some("2026-03-02"), None, now()).is_err());
        assert!(parse_schedule(None, Some("09:00"), now()).is_err());
    }

    #[test]
    fn future_schedule_parses() {
        let at = parse_schedule(Some("2026-03-02"), Some("09:30"), now())
            .unwrap()
            .unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap());
    }

    #[test]
    fn seconds_are_accepted() {
        let at = parse_schedule(Some("2026-03-02"), Some("09:30:15"), now())
            .unwrap()
            .unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 15).unwrap());
    }

    #[test]
    fn past_schedule_rejected() {
        let err = parse_schedule(Some("2026-02-28"), Some("09:00"), now()).unwrap_err();
        assert!(err.contains("future"));
    }

    #[test]
    fn garbage_dates_rejected() {
        assert!(parse_schedule(Some("02/03/2026"), Some("09:00"), now()).is_err());
        assert!(parse_schedule(Some("2026-03-02"), Some("9 am"), now()).is_err());
    }
}
