//! Operational notifications for cancellation requests.
//!
//! Cancellations are settled manually at the provider, so the request must
//! reach a human. Delivery is best-effort: a failed notification is logged
//! and never fails the subscriber-facing operation.

use serde_json::json;
use time::OffsetDateTime;

/// Posts cancellation requests to an ops webhook (Slack-compatible payload)
#[derive(Clone)]
pub struct CancellationNotifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl CancellationNotifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url,
        }
    }

    /// Read `OPS_WEBHOOK_URL`; unset means notifications are disabled
    pub fn from_env() -> Self {
        Self::new(std::env::var("OPS_WEBHOOK_URL").ok())
    }

    pub async fn notify_cancellation_requested(
        &self,
        email: &str,
        subscription_id: &str,
        paid_until: Option<OffsetDateTime>,
    ) {
        let Some(url) = &self.webhook_url else {
            tracing::debug!("OPS_WEBHOOK_URL not set, skipping cancellation notification");
            return;
        };

        let paid_until_text = paid_until
            .and_then(|d| d.format(&time::format_description::well_known::Rfc3339).ok())
            .unwrap_or_else(|| "unknown".to_string());

        let payload = json!({
            "text": format!(
                "Cancellation requested by {} (subscription {}). Paid until {}. \
                 Cancel the subscription at the payment provider.",
                email, subscription_id, paid_until_text
            ),
        });

        match self.client.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(
                    email = %email,
                    subscription_id = %subscription_id,
                    "Sent cancellation request notification"
                );
            }
            Ok(response) => {
                tracing::error!(
                    email = %email,
                    status = %response.status(),
                    "Cancellation notification rejected by webhook"
                );
            }
            Err(e) => {
                tracing::error!(
                    email = %email,
                    error = %e,
                    "Failed to send cancellation notification"
                );
            }
        }
    }
}
