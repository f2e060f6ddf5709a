pub mod consumer;
pub mod graph;
pub mod policy;
pub mod worker;

pub use consumer::run;
