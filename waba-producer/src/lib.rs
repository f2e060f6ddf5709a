pub mod service;

pub use service::{parse_schedule, submit, SubmitError, SubmitRequest};
