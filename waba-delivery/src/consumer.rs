use anyhow::Result;
use rdkafka::consumer::Consumer;
use rdkafka::Message;
use std::sync::Arc;
use std::time::Duration;
use tracing;

use waba_core::kafka::OUTBOUND_TOPIC;
use waba_core::types::SendJob;
use waba_core::{AppContext, Notifier, RedisNotifier};

use crate::graph::GraphClient;
use crate::worker;

const CONSUMER_GROUP: &str = "waba-delivery";

/// Long-lived delivery worker pulling send jobs from the outbound topic.
pub async fn run(ctx: AppContext) -> Result<()> {
    tracing::info!("Starting delivery consumer");

    let consumer = ctx.create_consumer(Some(CONSUMER_GROUP))?;
    let graph = GraphClient::new(&ctx.config.delivery)?;
    let notifier: Arc<dyn Notifier> = Arc::new(RedisNotifier::new(ctx.redis_pool.clone()));

    consumer.subscribe(&[OUTBOUND_TOPIC])?;

    tracing::info!("Subscribed to topic: {}", OUTBOUND_TOPIC);

    let mut error_count = 0u32;
    let mut last_error_log = std::time::Instant::now();

    loop {
        match consumer.recv().await {
            Ok(message) => {
                error_count = 0;
                if let Some(payload) = message.payload() {
                    match handle_payload(&ctx, &graph, notifier.as_ref(), payload).await {
                        Ok(_) => {
                            tracing::debug!("Processed send job");
                        }
                        Err(e) => {
                            tracing::error!("Error processing send job: {}", e);
                        }
                    }
                }
            }
            Err(e) => {
                error_count += 1;
                // Throttle error logging to one line per 30 seconds
                if last_error_log.elapsed().as_secs() >= 30 {
                    tracing::warn!(
                        "Error receiving message from Kafka (error count: {}): {}",
                        error_count,
                        e
                    );
                    last_error_log = std::time::Instant::now();
                }
                // Exponential backoff: 1s, 2s, 4s, max 30s
                let backoff =
                    Duration::from_secs(1 << error_count.min(5)).min(Duration::from_secs(30));
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

async fn handle_payload(
    ctx: &AppContext,
    graph: &GraphClient,
    notifier: &dyn Notifier,
    payload: &[u8],
) -> Result<()> {
    let job: SendJob = serde_json::from_slice(payload)?;

    tracing::debug!(
        message_id = %job.message_id,
        recipients = job.recipients.len(),
        "Received send job"
    );

    worker::process_job(ctx, graph, notifier, &job).await
}
