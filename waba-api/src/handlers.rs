use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use std::collections::HashMap;
use tracing;
use waba_core::types::{MessageRecord, RecipientOutcome};
use waba_core::{store, AppContext};
use waba_producer::{submit, SubmitError, SubmitRequest};

use crate::auth::{self, AuthenticatedTenant};

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "waba-api"
    }))
}

#[derive(Deserialize)]
pub struct TokenRequest {
    pub tenant_id: String,
}

pub async fn generate_token(
    Extension(ctx): Extension<AppContext>,
    Json(req): Json<TokenRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let token = auth::generate_token(&req.tenant_id, &ctx.config.server.jwt_secret, 7)?;
    Ok(Json(serde_json::json!({ "token": token })))
}

/// Send endpoint: validates and submits a message for immediate or scheduled
/// delivery. Validation problems come back as 400 with a human-readable
/// message; infrastructure problems as 500.
pub async fn send_message(
    Extension(ctx): Extension<AppContext>,
    Extension(tenant): Extension<AuthenticatedTenant>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, Json<serde_json::Value>)> {
    match submit(&ctx, &tenant.tenant_id, req).await {
        Ok(message) => Ok((StatusCode::CREATED, Json(serde_json::json!(message)))),
        Err(e) => {
            let status = match &e {
                SubmitError::Validation(_)
                | SubmitError::TenantNotFound
                | SubmitError::CredentialsMissing => StatusCode::BAD_REQUEST,
                SubmitError::Queue(_) | SubmitError::Internal(_) => {
                    tracing::error!(tenant_id = %tenant.tenant_id, "Submit failed: {}", e);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            Err((status, Json(serde_json::json!({ "error": e.to_string() }))))
        }
    }
}

#[derive(Deserialize)]
pub struct MessageQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

pub async fn get_messages(
    Extension(ctx): Extension<AppContext>,
    Extension(tenant): Extension<AuthenticatedTenant>,
    Query(params): Query<MessageQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let limit = params.limit.unwrap_or(50).min(100);
    let offset = params.offset.unwrap_or(0);

    let mut conn = ctx
        .db_pool
        .get()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let messages = store::list_messages(&mut conn, &tenant.tenant_id, limit, offset)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
    let outcomes = store::recipient_outcomes_for_messages(&mut conn, &ids)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(serde_json::json!(with_recipient_outcomes(
        messages, outcomes
    ))))
}

/// Pair each message of a page with its recipient outcome rows.
fn with_recipient_outcomes(
    messages: Vec<MessageRecord>,
    outcomes: Vec<RecipientOutcome>,
) -> Vec<serde_json::Value> {
    let mut by_message: HashMap<String, Vec<RecipientOutcome>> = HashMap::new();
    for outcome in outcomes {
        by_message
            .entry(outcome.message_id.clone())
            .or_default()
            .push(outcome);
    }

    messages
        .into_iter()
        .map(|message| {
            let recipients = by_message.remove(&message.id).unwrap_or_default();
            serde_json::json!({ "message": message, "recipients": recipients })
        })
        .collect()
}

pub async fn get_message(
    Extension(ctx): Extension<AppContext>,
    Extension(tenant): Extension<AuthenticatedTenant>,
    Path(message_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let mut conn = ctx
        .db_pool
        .get()
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let message = store::get_message(&mut conn, &message_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .filter(|m| m.tenant_id == tenant.tenant_id)
        .ok_or(StatusCode::NOT_FOUND)?;

    let recipients = store::recipient_outcomes(&mut conn, &message_id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(serde_json::json!({
        "message": message,
        "recipients": recipients,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(id: &str) -> MessageRecord {
        MessageRecord {
            id: id.to_string(),
            tenant_id: "tenant-1".to_string(),
            message_type: "text".to_string(),
            content: serde_json::json!({ "type": "text", "body": "hi" }),
            status: "SENT".to_string(),
            scheduled_at: None,
            provider_message_id: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn outcome(message_id: &str, recipient: &str) -> RecipientOutcome {
        RecipientOutcome {
            message_id: message_id.to_string(),
            recipient: recipient.to_string(),
            status: "SENT".to_string(),
            provider_message_id: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn list_entries_carry_their_own_recipients() {
        let listed = with_recipient_outcomes(
            vec![message("m1"), message("m2"), message("m3")],
            vec![outcome("m1", "+1"), outcome("m2", "+2"), outcome("m2", "+3")],
        );

        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0]["message"]["id"], "m1");
        assert_eq!(listed[0]["recipients"].as_array().unwrap().len(), 1);
        assert_eq!(listed[1]["recipients"].as_array().unwrap().len(), 2);
        assert_eq!(listed[1]["recipients"][1]["recipient"], "+3");
        // A message whose outcomes are missing still lists, with no recipients
        assert!(listed[2]["recipients"].as_array().unwrap().is_empty());
    }
}
