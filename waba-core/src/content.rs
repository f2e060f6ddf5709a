use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed union over the message types the platform supports. The serde tag
/// matches the `type` field clients send and the Graph API's type vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Video {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Document {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    Audio {
        url: String,
    },
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
    },
    Template {
        name: String,
        language: String,
        #[serde(default)]
        variables: Vec<String>,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum ContentError {
    #[error("text message requires a non-empty body")]
    EmptyBody,
    #[error("template message requires a name and language")]
    MissingTemplateFields,
    #[error("location coordinates out of range")]
    InvalidCoordinates,
    #[error("media URL must be http(s): {0}")]
    InvalidMediaUrl(String),
    #[error("unsupported {kind} file extension: {url}")]
    UnsupportedExtension { kind: &'static str, url: String },
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "3gp"];
const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "txt"];
const AUDIO_EXTENSIONS: &[&str] = &["aac", "mp3", "m4a", "amr", "ogg", "opus"];

impl MessageContent {
    /// The wire name of this message type (matches the serde tag).
    pub fn type_name(&self) -> &'static str {
        match self {
            MessageContent::Text { .. } => "text",
            MessageContent::Image { .. } => "image",
            MessageContent::Video { .. } => "video",
            MessageContent::Document { .. } => "document",
            MessageContent::Audio { .. } => "audio",
            MessageContent::Location { .. } => "location",
            MessageContent::Template { .. } => "template",
        }
    }

    pub fn is_template(&self) -> bool {
        matches!(self, MessageContent::Template { .. })
    }

    /// Shape validation shared by the producer boundary and the delivery
    /// worker (the queue payload is still untrusted input after redelivery).
    pub fn validate(&self) -> Result<(), ContentError> {
        match self {
            MessageContent::Text { body } => {
                if body.trim().is_empty() {
                    return Err(ContentError::EmptyBody);
                }
                Ok(())
            }
            MessageContent::Image { url, .. } => validate_media_url(url, "image", IMAGE_EXTENSIONS),
            MessageContent::Video { url, .. } => validate_media_url(url, "video", VIDEO_EXTENSIONS),
            MessageContent::Document { url, .. } => {
                validate_media_url(url, "document", DOCUMENT_EXTENSIONS)
            }
            MessageContent::Audio { url } => validate_media_url(url, "audio", AUDIO_EXTENSIONS),
            MessageContent::Location {
                latitude,
                longitude,
                ..
            } => {
                if !(-90.0..=90.0).contains(latitude) || !(-180.0..=180.0).contains(longitude) {
                    return Err(ContentError::InvalidCoordinates);
                }
                Ok(())
            }
            MessageContent::Template { name, language, .. } => {
                if name.trim().is_empty() || language.trim().is_empty() {
                    return Err(ContentError::MissingTemplateFields);
                }
                Ok(())
            }
        }
    }
}

fn validate_media_url(
    url: &str,
    kind: &'static str,
    allowed: &[&str],
) -> Result<(), ContentError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ContentError::InvalidMediaUrl(url.to_string()));
    }
    // Extension check ignores query string and fragment
    let path = url
        .split(|c| c == '?' || c == '#')
        .next()
        .unwrap_or(url);
    let extension = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    if allowed.contains(&extension.as_str()) {
        Ok(())
    } else {
        Err(ContentError::UnsupportedExtension {
            kind,
            url: url.to_string(),
        })
    }
}

/// Normalize a destination address for the Graph API: strip separators and
/// ensure a leading `+`. Group ids are passed through untouched.
pub fn normalize_recipient(raw: &str) -> String {
    if raw.ends_with("@g.us") {
        return raw.to_string();
    }
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("+{}", digits)
}

/// Country calling code 1 (US/Canada) destinations are paused for marketing
/// templates by the platform.
pub fn is_us_destination(normalized: &str) -> bool {
    let rest = match normalized.strip_prefix('+') {
        Some(r) => r,
        None => return false,
    };
    rest.starts_with('1') && rest.len() == 11
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_requires_body() {
        assert_eq!(
            MessageContent::Text { body: "  ".into() }.validate(),
            Err(ContentError::EmptyBody)
        );
        assert!(MessageContent::Text { body: "hi".into() }.validate().is_ok());
    }

    #[test]
    fn media_extension_enforced_per_type() {
        let ok = MessageContent::Image {
            url: "https://cdn.example.com/pic.JPG?sig=abc".into(),
            caption: None,
        };
        assert!(ok.validate().is_ok());

        let wrong_kind = MessageContent::Image {
            url: "https://cdn.example.com/clip.mp4".into(),
            caption: None,
        };
        assert!(matches!(
            wrong_kind.validate(),
            Err(ContentError::UnsupportedExtension { kind: "image", .. })
        ));

        let not_http = MessageContent::Audio {
            url: "ftp://cdn.example.com/note.mp3".into(),
        };
        assert!(matches!(
            not_http.validate(),
            Err(ContentError::InvalidMediaUrl(_))
        ));
    }

    #[test]
    fn location_bounds_checked() {
        let bad = MessageContent::Location {
            latitude: 91.0,
            longitude: 0.0,
            name: None,
            address: None,
        };
        assert_eq!(bad.validate(), Err(ContentError::InvalidCoordinates));
    }

    #[test]
    fn template_needs_name_and_language() {
        let bad = MessageContent::Template {
            name: "order_update".into(),
            language: "".into(),
            variables: vec![],
        };
        assert_eq!(bad.validate(), Err(ContentError::MissingTemplateFields));
    }

    #[test]
    fn serde_tag_matches_client_vocabulary() {
        let v: MessageContent =
            serde_json::from_str(r#"{"type":"text","body":"hello"}"#).unwrap();
        assert_eq!(v, MessageContent::Text { body: "hello".into() });

        let t: MessageContent = serde_json::from_str(
            r#"{"type":"template","name":"promo","language":"en_US"}"#,
        )
        .unwrap();
        assert_eq!(t.type_name(), "template");
        assert!(t.is_template());
    }

    #[test]
    fn normalization_strips_separators_and_adds_plus() {
        assert_eq!(normalize_recipient("+1 (415) 555-0100"), "+14155550100");
        assert_eq!(normalize_recipient("4915123456789"), "+4915123456789");
        assert_eq!(normalize_recipient("1234-5678@g.us"), "1234-5678@g.us");
    }

    #[test]
    fn us_destination_detection() {
        assert!(is_us_destination("+14155550100"));
        assert!(is_us_destination("+15550001111"));
        assert!(!is_us_destination("+4915123456789"));
        // Country code 1 but not a NANP-length number
        assert!(!is_us_destination("+123"));
    }
}
