use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::StreamExt;
use std::time::Duration;
use tracing;

use waba_core::content::normalize_recipient;
use waba_core::notify::Notifier;
use waba_core::store;
use waba_core::types::{MessageStatus, SendJob};
use waba_core::AppContext;

use crate::graph::{GraphError, SendTransport};
use crate::policy;

/// Process one dequeued work item: fan out over its recipients with bounded
/// concurrency, then re-derive the message-level status. The queue delivers
/// at least once, so every per-recipient step is guarded to be a no-op on
/// redelivery of an already-settled outcome.
pub async fn process_job(
    ctx: &AppContext,
    transport: &dyn SendTransport,
    notifier: &dyn Notifier,
    job: &SendJob,
) -> Result<()> {
    let concurrency = ctx.config.delivery.fanout_concurrency.max(1);

    futures::stream::iter(job.recipients.iter())
        .for_each_concurrent(concurrency, |recipient| async move {
            if let Err(e) = deliver_to_recipient(ctx, transport, notifier, job, recipient).await {
                tracing::error!(
                    message_id = %job.message_id,
                    recipient = %recipient,
                    "Error delivering to recipient: {}",
                    e
                );
            }
        })
        .await;

    let mut conn = ctx.db_pool.get().await?;
    if let Some(aggregate) = store::sync_aggregate_status(&mut conn, &job.message_id).await? {
        tracing::info!(
            message_id = %job.message_id,
            status = %aggregate,
            "Message settled"
        );
    }

    Ok(())
}

async fn deliver_to_recipient(
    ctx: &AppContext,
    transport: &dyn SendTransport,
    notifier: &dyn Notifier,
    job: &SendJob,
    recipient: &str,
) -> Result<()> {
    let mut conn = ctx.db_pool.get().await?;

    // Idempotence guard: redelivered work items skip settled recipients.
    match store::get_recipient_status(&mut conn, &job.message_id, recipient).await? {
        None => {
            tracing::warn!(
                message_id = %job.message_id,
                recipient = %recipient,
                "No outcome row for recipient, skipping"
            );
            return Ok(());
        }
        Some(status) if !outcome_is_pending(status) => {
            tracing::debug!(
                message_id = %job.message_id,
                recipient = %recipient,
                status = %status,
                "Recipient already settled, skipping redelivery"
            );
            return Ok(());
        }
        Some(_) => {}
    }

    let normalized = normalize_recipient(recipient);

    match policy::enforce(&mut conn, job, &normalized, Utc::now()).await? {
        Ok(()) => {}
        Err(rejection) => {
            drop(conn);
            return fail_recipient(ctx, notifier, job, recipient, rejection.message()).await;
        }
    }

    if let Err(e) = job.content.validate() {
        drop(conn);
        return fail_recipient(ctx, notifier, job, recipient, &e.to_string()).await;
    }
    drop(conn);

    let result = send_with_retry(
        transport,
        &job.phone_number_id,
        &job.access_token,
        &normalized,
        &job.content,
        ctx.config.delivery.max_attempts,
        Duration::from_secs(ctx.config.delivery.retry_delay_secs),
    )
    .await;

    match result {
        Ok(provider_id) => {
            let mut conn = ctx.db_pool.get().await?;
            let advanced = store::advance_recipient_status(
                &mut conn,
                &job.message_id,
                recipient,
                MessageStatus::Sent,
                Some(&provider_id),
                None,
            )
            .await?;
            if !advanced {
                // The provider accepted the send but the outcome row refused
                // the transition; surface it instead of losing the provider id.
                return Err(anyhow!(
                    "recipient {} of message {} was not in a sendable state after the provider accepted",
                    recipient,
                    job.message_id
                ));
            }
            store::record_provider_message_id(&mut conn, &job.message_id, &provider_id).await?;

            tracing::info!(
                message_id = %job.message_id,
                recipient = %recipient,
                provider_id = %provider_id,
                "Message sent"
            );

            emit_status(notifier, job, recipient, MessageStatus::Sent, None).await;
            Ok(())
        }
        Err(e) => fail_recipient(ctx, notifier, job, recipient, &e.to_string()).await,
    }
}

/// Whether a recipient outcome still needs a delivery attempt. Anything past
/// QUEUED is settled: the queue delivers at least once, and a redelivered
/// work item must never repeat the remote call for a settled recipient.
fn outcome_is_pending(status: MessageStatus) -> bool {
    matches!(status, MessageStatus::Scheduled | MessageStatus::Queued)
}

async fn fail_recipient(
    ctx: &AppContext,
    notifier: &dyn Notifier,
    job: &SendJob,
    recipient: &str,
    error: &str,
) -> Result<()> {
    let mut conn = ctx.db_pool.get().await?;
    store::advance_recipient_status(
        &mut conn,
        &job.message_id,
        recipient,
        MessageStatus::Failed,
        None,
        Some(error),
    )
    .await?;

    tracing::warn!(
        message_id = %job.message_id,
        recipient = %recipient,
        "Delivery failed: {}",
        error
    );

    emit_status(notifier, job, recipient, MessageStatus::Failed, Some(error)).await;
    Ok(())
}

async fn emit_status(
    notifier: &dyn Notifier,
    job: &SendJob,
    recipient: &str,
    status: MessageStatus,
    error: Option<&str>,
) {
    let event = serde_json::json!({
        "type": "message_status",
        "message_id": job.message_id,
        "recipient": recipient,
        "status": status.as_str(),
        "error": error,
    });

    // Fire-and-forget: realtime fan-out must never fail a delivery
    if let Err(e) = notifier.publish(&job.tenant_id, &event).await {
        tracing::warn!(tenant_id = %job.tenant_id, "Failed to publish realtime event: {}", e);
    }
}

/// Bounded retry with a fixed inter-attempt delay. Only transient errors are
/// retried; the last error is surfaced after exhaustion.
pub async fn send_with_retry(
    transport: &dyn SendTransport,
    phone_number_id: &str,
    access_token: &str,
    to: &str,
    content: &waba_core::content::MessageContent,
    max_attempts: u32,
    delay: Duration,
) -> Result<String, GraphError> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match transport.send(phone_number_id, access_token, to, content).await {
            Ok(provider_id) => return Ok(provider_id),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                tracing::warn!(
                    to = %to,
                    attempt,
                    max_attempts,
                    "Transient delivery error, retrying: {}",
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use waba_core::content::MessageContent;

    /// Transport that fails with a retryable error `failures` times, then
    /// succeeds.
    struct FlakyTransport {
        calls: AtomicU32,
        failures: u32,
        retryable: bool,
    }

    impl FlakyTransport {
        fn new(failures: u32, retryable: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures,
                retryable,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SendTransport for FlakyTransport {
        async fn send(
            &self,
            _phone_number_id: &str,
            _access_token: &str,
            _to: &str,
            _content: &MessageContent,
        ) -> Result<String, GraphError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(GraphError::Api {
                    code: None,
                    message: format!("transient failure {}", n + 1),
                    retryable: self.retryable,
                })
            } else {
                Ok("wamid.OK".to_string())
            }
        }
    }

    fn text() -> MessageContent {
        MessageContent::Text { body: "hi".into() }
    }

    #[test]
    fn redelivery_only_attempts_pending_outcomes() {
        use MessageStatus::*;
        assert!(outcome_is_pending(Scheduled));
        assert!(outcome_is_pending(Queued));
        for settled in [Sent, Delivered, Read, Failed] {
            assert!(!outcome_is_pending(settled));
        }
    }

    #[tokio::test]
    async fn two_failures_then_success_makes_three_calls() {
        let transport = FlakyTransport::new(2, true);
        let id = send_with_retry(&transport, "pn", "tok", "+1", &text(), 3, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(id, "wamid.OK");
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let transport = FlakyTransport::new(5, true);
        let err = send_with_retry(&transport, "pn", "tok", "+1", &text(), 3, Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(transport.calls(), 3);
        assert!(err.to_string().contains("transient failure 3"));
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let transport = FlakyTransport::new(5, false);
        let err = send_with_retry(&transport, "pn", "tok", "+1", &text(), 3, Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(transport.calls(), 1);
        assert!(!err.is_retryable());
    }
}
