pub mod sweeper;

pub use sweeper::run;
