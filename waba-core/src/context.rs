use crate::config::Config;
use crate::db::{create_pool as create_db_pool, DbPool};
use crate::kafka::{create_consumer, create_producer, KafkaConsumer, KafkaProducer};
use crate::redis::{create_pool as create_redis_pool, RedisPool};
use std::sync::Arc;

/// Explicitly owned connection state, built once at startup and injected into
/// every component instead of living in process-wide globals.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub db_pool: Arc<DbPool>,
    pub redis_pool: RedisPool,
    pub kafka_producer: KafkaProducer,
}

impl AppContext {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let db_pool = create_db_pool(&config.database).await?;
        let redis_pool = create_redis_pool(&config.redis).await?;
        let kafka_producer = create_producer(&config.kafka)?;

        Ok(AppContext {
            config: Arc::new(config),
            db_pool,
            redis_pool,
            kafka_producer,
        })
    }

    pub fn create_consumer(&self, group_id: Option<&str>) -> anyhow::Result<KafkaConsumer> {
        create_consumer(&self.config.kafka, group_id)
    }
}
