use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing;

use waba_core::config::DeliveryConfig;
use waba_core::content::MessageContent;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("{message}")]
    Api {
        code: Option<i64>,
        message: String,
        retryable: bool,
    },
    #[error("delivery request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl GraphError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GraphError::Api { retryable, .. } => *retryable,
            // Timeouts and connection failures are worth another attempt
            GraphError::Transport(_) => true,
        }
    }
}

/// The remote send seam. The worker only sees this trait, which keeps the
/// retry and fan-out logic testable without HTTP.
#[async_trait]
pub trait SendTransport: Send + Sync {
    async fn send(
        &self,
        phone_number_id: &str,
        access_token: &str,
        to: &str,
        content: &MessageContent,
    ) -> Result<String, GraphError>;
}

/// Meta Graph API client for `POST /{phone_number_id}/messages`.
pub struct GraphClient {
    http: reqwest::Client,
    base_url: String,
}

impl GraphClient {
    pub fn new(config: &DeliveryConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.graph_api_url.trim_end_matches('/').to_string(),
        })
    }

    #[cfg(test)]
    fn with_base_url(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SendTransport for GraphClient {
    async fn send(
        &self,
        phone_number_id: &str,
        access_token: &str,
        to: &str,
        content: &MessageContent,
    ) -> Result<String, GraphError> {
        let url = format!("{}/{}/messages", self.base_url, phone_number_id);
        let payload = build_payload(to, content);

        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or_default();

        if status.is_success() {
            let provider_id = body
                .get("messages")
                .and_then(|m| m.get(0))
                .and_then(|m| m.get("id"))
                .and_then(|id| id.as_str())
                .map(|s| s.to_string());

            return provider_id.ok_or_else(|| GraphError::Api {
                code: None,
                message: "provider response missing message id".to_string(),
                retryable: false,
            });
        }

        let code = body
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|c| c.as_i64());
        let raw_message = body
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or("unknown provider error");

        tracing::debug!(
            status = %status,
            code = ?code,
            "Graph API rejected send: {}",
            raw_message
        );

        Err(GraphError::Api {
            code,
            message: friendly_send_error(code, raw_message),
            retryable: status.is_server_error() || code == Some(80007),
        })
    }
}

/// Wire body for the Graph send endpoint, per message type.
pub fn build_payload(to: &str, content: &MessageContent) -> serde_json::Value {
    let mut payload = json!({
        "messaging_product": "whatsapp",
        "to": to,
        "type": content.type_name(),
    });

    let body = match content {
        MessageContent::Text { body } => json!({ "body": body }),
        MessageContent::Image { url, caption } => {
            media_object(url, "caption", caption.as_deref())
        }
        MessageContent::Video { url, caption } => {
            media_object(url, "caption", caption.as_deref())
        }
        MessageContent::Document { url, filename } => {
            media_object(url, "filename", filename.as_deref())
        }
        MessageContent::Audio { url } => json!({ "link": url }),
        MessageContent::Location {
            latitude,
            longitude,
            name,
            address,
        } => {
            let mut loc = json!({ "latitude": latitude, "longitude": longitude });
            if let Some(n) = name {
                loc["name"] = json!(n);
            }
            if let Some(a) = address {
                loc["address"] = json!(a);
            }
            loc
        }
        MessageContent::Template {
            name,
            language,
            variables,
        } => {
            let mut tpl = json!({
                "name": name,
                "language": { "code": language },
            });
            if !variables.is_empty() {
                let parameters: Vec<serde_json::Value> = variables
                    .iter()
                    .map(|v| json!({ "type": "text", "text": v }))
                    .collect();
                tpl["components"] = json!([{ "type": "body", "parameters": parameters }]);
            }
            tpl
        }
    };

    payload[content.type_name()] = body;
    payload
}

fn media_object(url: &str, extra_key: &str, extra: Option<&str>) -> serde_json::Value {
    let mut obj = json!({ "link": url });
    if let Some(v) = extra {
        obj[extra_key] = json!(v);
    }
    obj
}

/// Map well-known Graph error codes to tenant-facing messages; anything else
/// falls back to the provider's own text.
pub fn friendly_send_error(code: Option<i64>, raw: &str) -> String {
    match code {
        Some(131047) => "Re-engagement required: more than 24 hours have passed since the \
                         customer last replied. Use an approved template message."
            .to_string(),
        Some(131026) => "Message undeliverable: the recipient may not be on WhatsApp or has \
                         blocked this sender."
            .to_string(),
        Some(131056) => "Too many messages were sent to this recipient in a short time. \
                         Wait before sending again."
            .to_string(),
        Some(133010) => "The sender phone number is not registered on the WhatsApp Business \
                         Platform."
            .to_string(),
        Some(190) => "Access token expired or invalid. Reconnect the WhatsApp Business Account."
            .to_string(),
        Some(100) => "Invalid request parameter. Check the recipient number and message content."
            .to_string(),
        Some(80007) => "WhatsApp Business Account throughput limit reached.".to_string(),
        _ => format!("Message delivery failed: {}", raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_provider_message_id_on_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/123456/messages")
            .match_header("authorization", "Bearer token-abc")
            .with_status(200)
            .with_body(r#"{"messages":[{"id":"wamid.ABC123"}]}"#)
            .create_async()
            .await;

        let client = GraphClient::with_base_url(&server.url());
        let id = client
            .send(
                "123456",
                "token-abc",
                "+14155550100",
                &MessageContent::Text { body: "hi".into() },
            )
            .await
            .unwrap();

        assert_eq!(id, "wamid.ABC123");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/123456/messages")
            .with_status(500)
            .with_body(r#"{"error":{"code":1,"message":"internal"}}"#)
            .create_async()
            .await;

        let client = GraphClient::with_base_url(&server.url());
        let err = client
            .send(
                "123456",
                "t",
                "+14155550100",
                &MessageContent::Text { body: "hi".into() },
            )
            .await
            .unwrap_err();

        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn client_errors_map_to_friendly_text() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/123456/messages")
            .with_status(400)
            .with_body(r#"{"error":{"code":131047,"message":"Re-engagement message"}}"#)
            .create_async()
            .await;

        let client = GraphClient::with_base_url(&server.url());
        let err = client
            .send(
                "123456",
                "t",
                "+14155550100",
                &MessageContent::Text { body: "hi".into() },
            )
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Re-engagement required"));
    }

    #[test]
    fn unknown_codes_fall_back_to_provider_text() {
        let msg = friendly_send_error(Some(424242), "something odd");
        assert!(msg.contains("something odd"));
    }

    #[test]
    fn text_payload_shape() {
        let p = build_payload("+14155550100", &MessageContent::Text { body: "hello".into() });
        assert_eq!(p["messaging_product"], "whatsapp");
        assert_eq!(p["to"], "+14155550100");
        assert_eq!(p["type"], "text");
        assert_eq!(p["text"]["body"], "hello");
    }

    #[test]
    fn template_payload_carries_language_and_variables() {
        let p = build_payload(
            "+14155550100",
            &MessageContent::Template {
                name: "order_update".into(),
                language: "en_US".into(),
                variables: vec!["42".into()],
            },
        );
        assert_eq!(p["type"], "template");
        assert_eq!(p["template"]["name"], "order_update");
        assert_eq!(p["template"]["language"]["code"], "en_US");
        assert_eq!(
            p["template"]["components"][0]["parameters"][0]["text"],
            "42"
        );
    }

    #[test]
    fn location_payload_includes_optional_fields() {
        let p = build_payload(
            "+14155550100",
            &MessageContent::Location {
                latitude: 37.77,
                longitude: -122.42,
                name: Some("Office".into()),
                address: None,
            },
        );
        assert_eq!(p["location"]["latitude"], 37.77);
        assert_eq!(p["location"]["name"], "Office");
        assert!(p["location"].get("address").is_none());
    }
}
