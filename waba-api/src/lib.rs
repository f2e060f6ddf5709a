pub mod auth;
pub mod handlers;
pub mod server;
pub mod webhook;
pub mod websocket;

pub use server::run;
