use axum::{
    extract::Request,
    http::{header::AUTHORIZATION, StatusCode},
    response::Response,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing;
use waba_core::AppContext;

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub tenant_id: String,
    pub exp: usize,
}

/// Authenticated tenant attached to the request after the middleware runs
#[derive(Debug, Clone)]
pub struct AuthenticatedTenant {
    pub tenant_id: String,
}

fn extract_token(auth_header: Option<&str>) -> Option<String> {
    auth_header?
        .strip_prefix("Bearer ")
        .map(|s| s.trim().to_string())
}

/// Generate a JWT token for a tenant
pub fn generate_token(
    tenant_id: &str,
    secret: &str,
    expires_in_days: u64,
) -> Result<String, StatusCode> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .as_secs() as usize;

    let exp = now + (expires_in_days * 24 * 60 * 60) as usize;

    let claims = Claims {
        tenant_id: tenant_id.to_string(),
        exp,
    };

    let encoding_key = EncodingKey::from_secret(secret.as_ref());

    encode(&Header::default(), &claims, &encoding_key).map_err(|e| {
        tracing::error!("Failed to generate JWT token: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Verify a JWT token and extract the tenant id
pub fn verify_token(token: &str, secret: &str) -> Result<String, StatusCode> {
    let decoding_key = DecodingKey::from_secret(secret.as_ref());
    let validation = Validation::default();

    match decode::<Claims>(token, &decoding_key, &validation) {
        Ok(token_data) => Ok(token_data.claims.tenant_id),
        Err(e) => {
            tracing::debug!("JWT verification failed: {}", e);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

/// Axum middleware for JWT authentication
pub async fn auth_middleware(
    mut req: Request,
    next: axum::middleware::Next,
) -> Result<Response, StatusCode> {
    // Provider-facing webhook endpoints and setup routes bypass tenant auth
    let path = req.uri().path();
    if path == "/health"
        || path.starts_with("/ws")
        || path.starts_with("/webhook")
        || path == "/api/v1/auth/token"
    {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let token = match extract_token(auth_header) {
        Some(t) => t,
        None => {
            tracing::debug!("Missing Authorization header");
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    let ctx = req
        .extensions()
        .get::<AppContext>()
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

    let tenant_id = verify_token(&token, &ctx.config.server.jwt_secret)?;

    req.extensions_mut().insert(AuthenticatedTenant {
        tenant_id: tenant_id.clone(),
    });

    tracing::debug!("Authenticated tenant: {}", tenant_id);

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrip() {
        let token = generate_token("tenant-1", "secret", 7).unwrap();
        let tenant = verify_token(&token, "secret").unwrap();
        assert_eq!(tenant, "tenant-1");
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = generate_token("tenant-1", "secret", 7).unwrap();
        assert_eq!(verify_token(&token, "other"), Err(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn bearer_prefix_required() {
        assert_eq!(extract_token(Some("Bearer abc")), Some("abc".to_string()));
        assert_eq!(extract_token(Some("abc")), None);
        assert_eq!(extract_token(None), None);
    }
}
