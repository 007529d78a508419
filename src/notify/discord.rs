use super::{Alert, Notifier, Severity};
use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

pub struct DiscordNotifier {
    webhook: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl DiscordNotifier {
    pub fn new(webhook: String) -> Self {
        Self {
            webhook,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    async fn post_with_retry(&self, payload: &DiscordWebhookPayload) -> Result<()> {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.webhook)
                .timeout(self.timeout)
                .json(payload)
                .send()
                .await;

            let err = match res {
                Ok(rsp) => match rsp.error_for_status_ref() {
                    Ok(_) => return Ok(()),
                    Err(e) => anyhow!("Discord webhook HTTP error: {e}"),
                },
                Err(e) => anyhow!("Discord webhook request failed: {e}"),
            };
            if attempt >= self.max_retries {
                return Err(err);
            }
            tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
        }
    }
}

#[async_trait::async_trait]
impl Notifier for DiscordNotifier {
    async fn send(&self, alert: &Alert) -> Result<()> {
        let payload = DiscordWebhookPayload::embed(alert);
        self.post_with_retry(&payload).await
    }

    fn name(&self) -> &'static str {
        "discord"
    }
}

#[derive(Serialize)]
struct DiscordEmbed {
    title: String,
    description: String,
    color: u32,
}

#[derive(Serialize)]
struct DiscordWebhookPayload {
    content: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

impl DiscordWebhookPayload {
    fn embed(alert: &Alert) -> Self {
        let color = match alert.severity {
            Severity::Critical => 0xE0_1E_5A,
            Severity::Warning => 0xEC_B2_2E,
        };
        Self {
            content: None,
            embeds: vec![DiscordEmbed {
                title: alert.title.clone(),
                description: format!("{}\n**Time (UTC):** {}", alert.body, alert.ts.to_rfc3339()),
                color,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embed_carries_title_and_color() {
        let p = DiscordWebhookPayload::embed(&Alert::substrate("worker-2", "queue closed"));
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["embeds"][0]["title"], "worker-2 stopped: substrate unavailable");
        assert_eq!(v["embeds"][0]["color"], 0xE01E5A);
        assert!(v["content"].is_null());
    }
}
