use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::MessageContent;

/// Delivery lifecycle of a message or of a single (message, recipient) pair.
///
/// The machine only moves forward: SCHEDULED → QUEUED → SENT → DELIVERED →
/// READ, with FAILED reachable from any non-terminal state. The string
/// vocabulary is part of the client contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Scheduled,
    Queued,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Scheduled => "SCHEDULED",
            MessageStatus::Queued => "QUEUED",
            MessageStatus::Sent => "SENT",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Read => "READ",
            MessageStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCHEDULED" => Some(MessageStatus::Scheduled),
            "QUEUED" => Some(MessageStatus::Queued),
            "SENT" => Some(MessageStatus::Sent),
            "DELIVERED" => Some(MessageStatus::Delivered),
            "READ" => Some(MessageStatus::Read),
            "FAILED" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Read | MessageStatus::Failed)
    }

    /// States a transition to `to` may start from. Used as the guard set of
    /// the conditional UPDATE, so concurrent writers can only advance the
    /// machine, never regress it.
    pub fn predecessors(to: MessageStatus) -> &'static [MessageStatus] {
        use MessageStatus::*;
        match to {
            Scheduled => &[],
            Queued => &[Scheduled],
            Sent => &[Queued],
            Delivered => &[Queued, Sent],
            Read => &[Queued, Sent, Delivered],
            Failed => &[Scheduled, Queued, Sent, Delivered],
        }
    }

    pub fn can_transition_to(&self, to: MessageStatus) -> bool {
        MessageStatus::predecessors(to).contains(self)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message-level status derived from per-recipient outcomes.
///
/// Returns None while any recipient is still pending (the message-level
/// status should not move yet). Once every recipient is settled, any failure
/// wins; otherwise the least-advanced delivery state is reported so the
/// message never claims more progress than its slowest recipient.
pub fn aggregate_status(recipients: &[MessageStatus]) -> Option<MessageStatus> {
    use MessageStatus::*;
    if recipients.is_empty() {
        return None;
    }
    if recipients.iter().any(|s| matches!(s, Scheduled | Queued)) {
        return None;
    }
    if recipients.iter().any(|s| *s == Failed) {
        return Some(Failed);
    }
    let rank = |s: &MessageStatus| match s {
        Sent => 0,
        Delivered => 1,
        Read => 2,
        _ => unreachable!("pending states filtered above"),
    };
    recipients.iter().min_by_key(|s| rank(s)).copied()
}

/// Work item published to the outbound topic. Carries a snapshot of the
/// tenant's delivery credentials so the consumer does not re-read them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendJob {
    pub message_id: String,
    pub tenant_id: String,
    pub phone_number_id: String,
    pub access_token: String,
    pub recipients: Vec<String>,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub tenant_id: String,
    pub message_type: String,
    pub content: serde_json::Value,
    pub status: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientOutcome {
    pub message_id: String,
    pub recipient: String,
    pub status: String,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub phone_number_id: String,
    pub access_token_enc: Option<String>,
    pub webhook_verify_token: Option<String>,
    pub webhook_verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub tenant_id: String,
    pub provider_template_id: String,
    pub name: String,
    pub language: String,
    pub category: String,
    pub status: String,
    pub rejection_reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use MessageStatus::*;

    #[test]
    fn status_roundtrips_exact_vocabulary() {
        for (s, text) in [
            (Scheduled, "SCHEDULED"),
            (Queued, "QUEUED"),
            (Sent, "SENT"),
            (Delivered, "DELIVERED"),
            (Read, "READ"),
            (Failed, "FAILED"),
        ] {
            assert_eq!(s.as_str(), text);
            assert_eq!(MessageStatus::parse(text), Some(s));
        }
        assert_eq!(MessageStatus::parse("sent"), None);
    }

    #[test]
    fn machine_only_moves_forward() {
        assert!(Scheduled.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Read));

        assert!(!Sent.can_transition_to(Queued));
        assert!(!Delivered.can_transition_to(Sent));
        assert!(!Read.can_transition_to(Delivered));
        assert!(!Queued.can_transition_to(Scheduled));
    }

    #[test]
    fn failed_reachable_from_any_non_terminal() {
        for s in [Scheduled, Queued, Sent, Delivered] {
            assert!(s.can_transition_to(Failed));
        }
        assert!(!Read.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn delivered_and_read_can_skip_sent() {
        // Provider status webhooks can arrive before the send response is
        // recorded, so DELIVERED/READ must be reachable straight from QUEUED.
        assert!(Queued.can_transition_to(Delivered));
        assert!(Queued.can_transition_to(Read));
    }

    #[test]
    fn aggregate_waits_for_pending_recipients() {
        assert_eq!(aggregate_status(&[Sent, Queued]), None);
        assert_eq!(aggregate_status(&[Failed, Queued]), None);
        assert_eq!(aggregate_status(&[]), None);
    }

    #[test]
    fn aggregate_failure_wins_once_settled() {
        assert_eq!(aggregate_status(&[Sent, Failed]), Some(Failed));
        assert_eq!(aggregate_status(&[Failed]), Some(Failed));
    }

    #[test]
    fn aggregate_reports_slowest_recipient() {
        assert_eq!(aggregate_status(&[Sent, Delivered, Read]), Some(Sent));
        assert_eq!(aggregate_status(&[Delivered, Read]), Some(Delivered));
        assert_eq!(aggregate_status(&[Read, Read]), Some(Read));
    }
}
