use anyhow::{Context, Result};
use reqwest::Client;

use super::{Alert, Notifier, Severity};

pub struct SlackNotifier {
    webhook_url: String,
    client: Client,
}

impl SlackNotifier {
    /// `None` when `SLACK_WEBHOOK_URL` is unset.
    pub fn from_env() -> Option<Self> {
        std::env::var("SLACK_WEBHOOK_URL")
            .ok()
            .filter(|u| !u.trim().is_empty())
            .map(Self::new)
    }

    pub fn new(url: String) -> Self {
        Self {
            webhook_url: url,
            client: Client::new(),
        }
    }
}

pub(crate) fn slack_text(alert: &Alert) -> String {
    let icon = match alert.severity {
        Severity::Critical => ":rotating_light:",
        Severity::Warning => ":warning:",
    };
    format!(
        "{icon} *{}*\n{}\n@ {}",
        alert.title,
        alert.body,
        alert.ts.to_rfc3339()
    )
}

#[async_trait::async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, alert: &Alert) -> Result<()> {
        let body = serde_json::json!({ "text": slack_text(alert) });
        self.client
            .post(&self.webhook_url)
            .timeout(std::time::Duration::from_secs(5))
            .json(&body)
            .send()
            .await
            .context("slack post")?
            .error_for_status()
            .context("slack non-2xx")?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "slack"
    }
}
