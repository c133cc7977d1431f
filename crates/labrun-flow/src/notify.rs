//! Operator notification when teardown gives up.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The "deletion failed" message sent to an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownFailureNotice {
    /// Experiment whose resources could not be deleted.
    pub experiment_id: i64,
    /// Environment id, if known.
    pub env_id: Option<String>,
    /// Job id, if known.
    pub job_id: Option<String>,
    /// Laboratory address of the tenant.
    pub lab_address: String,
}

impl TeardownFailureNotice {
    /// One-line subject.
    #[must_use]
    pub fn subject(&self) -> String {
        format!(
            "[labrun] failed to delete resources of experiment {}",
            self.experiment_id
        )
    }

    /// Plain-text body.
    #[must_use]
    pub fn body(&self) -> String {
        format!(
            "Teardown of experiment {} exhausted its retries.\n\
             environment: {}\njob: {}\nlaboratory: {}\n\
             Billable resources may still exist; delete them manually.",
            self.experiment_id,
            self.env_id.as_deref().unwrap_or("-"),
            self.job_id.as_deref().unwrap_or("-"),
            self.lab_address,
        )
    }
}

/// Delivers operator notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends the notice; returns true if it was accepted for delivery.
    async fn send(&self, notice: &TeardownFailureNotice) -> bool;
}

/// Writes notices to the log at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, notice: &TeardownFailureNotice) -> bool {
        tracing::error!(
            experiment_id = notice.experiment_id,
            env_id = notice.env_id.as_deref().unwrap_or_default(),
            job_id = notice.job_id.as_deref().unwrap_or_default(),
            lab_address = %notice.lab_address,
            "{}",
            notice.subject()
        );
        true
    }
}

#[derive(Debug, Serialize)]
struct MailRequest<'a> {
    to: &'a [String],
    subject: String,
    body: String,
    notice: &'a TeardownFailureNotice,
}

/// Posts notices as JSON to a mail relay.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    recipients: Vec<String>,
}

impl WebhookNotifier {
    /// Creates a notifier posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, recipients: Vec<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::configuration(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
            recipients,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, notice: &TeardownFailureNotice) -> bool {
        let request = MailRequest {
            to: &self.recipients,
            subject: notice.subject(),
            body: notice.body(),
            notice,
        };
        match self.client.post(&self.url).json(&request).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(
                    experiment_id = notice.experiment_id,
                    status = %response.status(),
                    "mail relay rejected notification"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    experiment_id = notice.experiment_id,
                    error = %e,
                    "mail relay unreachable"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice() -> TeardownFailureNotice {
        TeardownFailureNotice {
            experiment_id: 12,
            env_id: Some("env-12".into()),
            job_id: None,
            lab_address: "10.0.0.1:9000".into(),
        }
    }

    #[test]
    fn body_lists_all_identifiers() {
        let body = notice().body();
        assert!(body.contains("experiment 12"));
        assert!(body.contains("environment: env-12"));
        assert!(body.contains("job: -"));
        assert!(body.contains("laboratory: 10.0.0.1:9000"));
    }

    #[tokio::test]
    async fn log_notifier_always_accepts() {
        assert!(LogNotifier.send(&notice()).await);
    }

    #[tokio::test]
    async fn webhook_notifier_reports_unreachable_relay() {
        let notifier = WebhookNotifier::new(
            "http://127.0.0.1:9/mail",
            vec!["ops@example.com".into()],
            Duration::from_millis(200),
        )
        .expect("client");
        assert!(!notifier.send(&notice()).await);
    }
}
