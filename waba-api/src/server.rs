use anyhow::Result;
use axum::{
    extract::Extension,
    middleware,
    routing::{get, post},
    Router,
};
use std::env;
use std::net::SocketAddr;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing;
use waba_core::AppContext;

use crate::auth;
use crate::handlers;
use crate::webhook;
use crate::websocket;

pub async fn run(ctx: AppContext) -> Result<()> {
    let api_port = ctx.config.server.api_port;
    let ctx_clone = ctx.clone();

    // Allow specific origins when CORS_ORIGINS is set, permissive otherwise
    let cors_layer = if let Ok(origins) = env::var("CORS_ORIGINS") {
        let origin_list: Vec<&str> = origins.split(',').map(|s| s.trim()).collect();
        let mut cors = CorsLayer::new();
        for origin in origin_list {
            if let Ok(parsed) = origin.parse::<axum::http::HeaderValue>() {
                cors = cors.allow_origin(parsed);
            }
        }
        cors.allow_methods(Any)
            .allow_headers(Any)
            .allow_credentials(true)
    } else {
        tracing::warn!("CORS_ORIGINS not set, using permissive CORS. Set CORS_ORIGINS for production!");
        CorsLayer::permissive()
    };

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/ws", get(websocket::websocket_handler))
        .route("/api/v1/auth/token", post(handlers::generate_token))
        .route("/api/v1/messages", post(handlers::send_message))
        .route("/api/v1/messages", get(handlers::get_messages))
        .route("/api/v1/messages/:id", get(handlers::get_message))
        .route("/webhook/:tenant_id", get(webhook::verify_webhook))
        .route("/webhook/:tenant_id", post(webhook::receive_webhook))
        .layer(
            ServiceBuilder::new()
                .layer(Extension(ctx_clone))
                .layer(middleware::from_fn(auth::auth_middleware))
                .layer(cors_layer),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], api_port));
    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
