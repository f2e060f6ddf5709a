use anyhow::{anyhow, Result};
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing;

use waba_core::content::MessageContent;
use waba_core::kafka::{produce_message, OUTBOUND_TOPIC};
use waba_core::store;
use waba_core::types::SendJob;
use waba_core::{decrypt_token, AppContext};

/// Periodic sweep over due scheduled messages, plus a crash-recovery pass for
/// messages stuck in QUEUED. Each due message is claimed with a conditional
/// SCHEDULED→QUEUED update before it is enqueued, so concurrent scheduler
/// replicas cannot double-enqueue the same message.
pub async fn run(ctx: AppContext) -> Result<()> {
    let interval = Duration::from_secs(ctx.config.scheduler.interval_secs);
    tracing::info!("Starting scheduler sweep, interval {:?}", interval);

    loop {
        match sweep(&ctx).await {
            Ok(enqueued) => {
                if enqueued > 0 {
                    tracing::info!("Scheduler sweep enqueued {} messages", enqueued);
                }
            }
            Err(e) => {
                tracing::error!("Error in scheduler sweep: {}", e);
            }
        }

        match requeue_stuck(&ctx).await {
            Ok(requeued) => {
                if requeued > 0 {
                    tracing::info!("Recovery sweep re-enqueued {} stuck messages", requeued);
                }
            }
            Err(e) => {
                tracing::error!("Error in recovery sweep: {}", e);
            }
        }

        tokio::time::sleep(interval).await;
    }
}

/// One due-message pass. Per-message failures are logged and skipped; a bad
/// message never aborts the batch.
pub async fn sweep(ctx: &AppContext) -> Result<usize> {
    let mut conn = ctx.db_pool.get().await?;

    let due =
        store::find_due_scheduled(&mut conn, Utc::now(), ctx.config.scheduler.batch_size).await?;
    drop(conn);

    if due.is_empty() {
        return Ok(0);
    }

    tracing::debug!("Found {} due scheduled messages", due.len());

    let mut enqueued = 0usize;
    for (message_id, tenant_id) in due {
        match enqueue_due_message(ctx, &message_id, &tenant_id).await {
            Ok(true) => enqueued += 1,
            Ok(false) => {
                // Another replica claimed it first
                tracing::debug!(message_id = %message_id, "Due message already claimed");
            }
            Err(e) => {
                tracing::warn!(message_id = %message_id, "Failed to enqueue due message: {}", e);
            }
        }
    }

    Ok(enqueued)
}

/// Re-enqueue QUEUED messages that never received a provider id (lost work
/// items, or a producer whose publish failed after the insert). Safe under
/// the consumer's per-recipient idempotence guard.
pub async fn requeue_stuck(ctx: &AppContext) -> Result<usize> {
    let cutoff = Utc::now()
        - ChronoDuration::seconds(ctx.config.scheduler.requeue_after_secs as i64);

    let mut conn = ctx.db_pool.get().await?;
    let stuck = store::find_stuck_queued(&mut conn, cutoff, ctx.config.scheduler.batch_size).await?;
    drop(conn);

    let mut requeued = 0usize;
    for (message_id, tenant_id) in stuck {
        match publish_job(ctx, &message_id, &tenant_id).await {
            Ok(()) => {
                let mut conn = ctx.db_pool.get().await?;
                store::touch_message(&mut conn, &message_id).await?;
                tracing::info!(message_id = %message_id, "Stuck message re-enqueued");
                requeued += 1;
            }
            Err(e) => {
                tracing::warn!(message_id = %message_id, "Failed to re-enqueue stuck message: {}", e);
            }
        }
    }

    Ok(requeued)
}

async fn enqueue_due_message(ctx: &AppContext, message_id: &str, tenant_id: &str) -> Result<bool> {
    // Claim before enqueue; losing the claim means another replica owns it.
    let mut conn = ctx.db_pool.get().await?;
    if !store::claim_scheduled(&mut conn, message_id).await? {
        return Ok(false);
    }
    drop(conn);

    publish_job(ctx, message_id, tenant_id).await?;

    tracing::info!(message_id = %message_id, tenant_id = %tenant_id, "Scheduled message enqueued");

    Ok(true)
}

/// Rebuild the work item from storage and publish it, keyed by message id.
async fn publish_job(ctx: &AppContext, message_id: &str, tenant_id: &str) -> Result<()> {
    let mut conn = ctx.db_pool.get().await?;

    let tenant = store::get_tenant(&mut conn, tenant_id)
        .await?
        .ok_or_else(|| anyhow!("tenant {} not found", tenant_id))?;

    let access_token_enc = tenant
        .access_token_enc
        .as_deref()
        .ok_or_else(|| anyhow!("tenant {} has no delivery credentials", tenant_id))?;

    let message = store::get_message(&mut conn, message_id)
        .await?
        .ok_or_else(|| anyhow!("message {} not found", message_id))?;

    let content: MessageContent = serde_json::from_value(message.content.clone())
        .map_err(|e| anyhow!("message {} has malformed content: {}", message_id, e))?;

    let recipients: Vec<String> = store::recipient_outcomes(&mut conn, message_id)
        .await?
        .into_iter()
        .map(|o| o.recipient)
        .collect();
    drop(conn);

    let access_token = decrypt_token(
        access_token_enc,
        tenant_id,
        &ctx.config.server.encryption_key,
    )?;

    let job = SendJob {
        message_id: message_id.to_string(),
        tenant_id: tenant_id.to_string(),
        phone_number_id: tenant.phone_number_id,
        access_token,
        recipients,
        content,
    };

    let payload = serde_json::to_vec(&job)?;
    produce_message(&ctx.kafka_producer, OUTBOUND_TOPIC, Some(message_id), &payload).await
}
