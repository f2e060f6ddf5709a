use chrono::{DateTime, Duration, Utc};

use waba_core::content::{is_us_destination, MessageContent};
use waba_core::db::DbConnection;
use waba_core::store;
use waba_core::types::SendJob;

/// Business-rule checks that must pass before any remote call is attempted.
/// A rejection here is terminal for the recipient: retrying cannot change
/// the outcome.
#[derive(Debug, PartialEq)]
pub enum PolicyRejection {
    MarketingRestricted(String),
    NoServiceWindow(String),
    TemplateNotFound(String),
    TemplateNotApproved(String),
}

impl PolicyRejection {
    pub fn message(&self) -> &str {
        match self {
            PolicyRejection::MarketingRestricted(m)
            | PolicyRejection::NoServiceWindow(m)
            | PolicyRejection::TemplateNotFound(m)
            | PolicyRejection::TemplateNotApproved(m) => m,
        }
    }
}

pub fn service_window() -> Duration {
    Duration::hours(24)
}

/// Free-form messages are only allowed inside the 24-hour customer service
/// window opened by the recipient's last inbound message.
pub fn check_service_window(
    recipient: &str,
    last_inbound: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), PolicyRejection> {
    match last_inbound {
        Some(at) if now - at <= service_window() => Ok(()),
        _ => Err(PolicyRejection::NoServiceWindow(format!(
            "No active customer service window with {}: the recipient has not messaged you \
             within the last 24 hours. Use an approved template message instead.",
            recipient
        ))),
    }
}

/// Marketing templates to US (+1) destinations are paused platform-wide.
pub fn check_marketing_destination(
    category: &str,
    normalized_to: &str,
) -> Result<(), PolicyRejection> {
    if category.eq_ignore_ascii_case("MARKETING") && is_us_destination(normalized_to) {
        return Err(PolicyRejection::MarketingRestricted(format!(
            "Marketing template messages are paused for this region: delivery to United \
             States numbers ({}) is currently restricted by the platform.",
            normalized_to
        )));
    }
    Ok(())
}

/// Run every gate for one (job, recipient) pair. Template sends are checked
/// against the local template read-model (existence, approval, category)
/// before the regional gate; everything else goes through the service-window
/// gate.
pub async fn enforce(
    conn: &mut DbConnection,
    job: &SendJob,
    normalized_to: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<Result<(), PolicyRejection>> {
    match &job.content {
        MessageContent::Template { name, language, .. } => {
            let template = match store::find_template(conn, &job.tenant_id, name, language).await? {
                Some(t) => t,
                None => {
                    return Ok(Err(PolicyRejection::TemplateNotFound(format!(
                        "Template '{}' ({}) does not exist for this account.",
                        name, language
                    ))));
                }
            };

            if !template.status.eq_ignore_ascii_case("APPROVED") {
                return Ok(Err(PolicyRejection::TemplateNotApproved(format!(
                    "Template '{}' is not approved (current status: {}).",
                    name, template.status
                ))));
            }

            Ok(check_marketing_destination(&template.category, normalized_to))
        }
        _ => {
            let last_inbound =
                store::last_interaction_at(conn, &job.tenant_id, normalized_to).await?;
            Ok(check_service_window(normalized_to, last_inbound, now))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn window_open_within_24_hours() {
        let one_hour_ago = now() - Duration::hours(1);
        assert!(check_service_window("+14155550100", Some(one_hour_ago), now()).is_ok());
    }

    #[test]
    fn window_closed_after_24_hours() {
        let stale = now() - Duration::hours(25);
        let err = check_service_window("+14155550100", Some(stale), now()).unwrap_err();
        assert!(err.message().contains("24 hours"));
        assert!(err.message().contains("template"));
    }

    #[test]
    fn window_closed_with_no_interaction() {
        assert!(check_service_window("+14155550100", None, now()).is_err());
    }

    #[test]
    fn window_boundary_is_inclusive() {
        let exactly = now() - service_window();
        assert!(check_service_window("+14155550100", Some(exactly), now()).is_ok());
    }

    #[test]
    fn marketing_to_us_is_rejected() {
        let err = check_marketing_destination("MARKETING", "+15550001111").unwrap_err();
        assert!(err.message().contains("region"));
    }

    #[test]
    fn marketing_category_is_case_insensitive() {
        assert!(check_marketing_destination("marketing", "+15550001111").is_err());
    }

    #[test]
    fn marketing_outside_us_is_allowed() {
        assert!(check_marketing_destination("MARKETING", "+4915123456789").is_ok());
    }

    #[test]
    fn utility_templates_unrestricted() {
        assert!(check_marketing_destination("UTILITY", "+15550001111").is_ok());
    }
}
