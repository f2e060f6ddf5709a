pub mod service;

pub use service::{map_provider_status, process_event, verify};
