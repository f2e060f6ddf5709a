pub mod config;
pub mod content;
pub mod context;
pub mod db;
pub mod encryption;
pub mod kafka;
pub mod notify;
pub mod redis;
pub mod schema;
pub mod store;
pub mod types;

pub use config::Config;
pub use content::{normalize_recipient, MessageContent};
pub use context::AppContext;
pub use db::DbPool;
pub use encryption::{decrypt_token, encrypt_token};
pub use kafka::{KafkaConsumer, KafkaProducer, OUTBOUND_TOPIC};
pub use notify::{Notifier, RedisNotifier};
pub use redis::RedisPool;
pub use types::{MessageStatus, SendJob};
