use anyhow::Result;
use async_trait::async_trait;

use crate::redis::{get_connection, RedisPool};

/// Fire-and-forget realtime fan-out to connected clients, keyed by tenant id.
/// Injected into the delivery worker and webhook ingestion so the core never
/// depends on a concrete transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, tenant_id: &str, event: &serde_json::Value) -> Result<()>;
}

pub fn tenant_stream_key(tenant_id: &str) -> String {
    format!("STREAM:TENANT:{}", tenant_id)
}

/// Redis-streams implementation; the API's WebSocket bridge reads these
/// streams with blocking XREAD and forwards entries to connected clients.
pub struct RedisNotifier {
    pool: RedisPool,
}

impl RedisNotifier {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn publish(&self, tenant_id: &str, event: &serde_json::Value) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        let stream_key = tenant_stream_key(tenant_id);

        let mut conn = get_connection(&self.pool).await?;
        redis::cmd("XADD")
            .arg(&stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(1000)
            .arg("*")
            .arg("data")
            .arg(payload)
            .query_async::<String>(&mut conn)
            .await?;

        Ok(())
    }
}
