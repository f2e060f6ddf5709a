use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::collections::HashMap;
use tracing;
use waba_core::{AppContext, RedisNotifier};

/// Meta webhook verification handshake (`GET /webhook/:tenant_id`).
/// Echoes `hub.challenge` byte-for-byte on a token match, 403 otherwise.
pub async fn verify_webhook(
    Extension(ctx): Extension<AppContext>,
    Path(tenant_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").map(String::as_str).unwrap_or("");
    let token = params
        .get("hub.verify_token")
        .map(String::as_str)
        .unwrap_or("");
    let challenge = params
        .get("hub.challenge")
        .map(String::as_str)
        .unwrap_or("");

    match waba_ingest::verify(&ctx, &tenant_id, mode, token, challenge).await {
        Ok(Some(challenge)) => (StatusCode::OK, challenge),
        Ok(None) => (StatusCode::FORBIDDEN, String::new()),
        Err(e) => {
            tracing::error!(tenant_id = %tenant_id, "Webhook verification error: {}", e);
            (StatusCode::FORBIDDEN, String::new())
        }
    }
}

/// Meta webhook event delivery (`POST /webhook/:tenant_id`).
/// Acknowledges with 200 once the payload identifies itself; per-entry
/// processing failures are logged and swallowed so the provider never
/// suspends delivery over an internal error.
pub async fn receive_webhook(
    Extension(ctx): Extension<AppContext>,
    Path(tenant_id): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> impl IntoResponse {
    if payload.get("object").is_none() {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({})));
    }

    let notifier = RedisNotifier::new(ctx.redis_pool.clone());
    if let Err(e) = waba_ingest::process_event(&ctx, &notifier, &payload).await {
        tracing::error!(tenant_id = %tenant_id, "Webhook processing error: {}", e);
    }

    (StatusCode::OK, Json(serde_json::json!({ "status": "received" })))
}
