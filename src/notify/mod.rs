// src/notify/mod.rs
//! Operator alerts: dead letters and fatal substrate failures.
pub mod antiflutter;
pub mod discord;
pub mod email;
pub mod slack;

use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::counter;

use crate::deadletter::DeadLetter;
use antiflutter::AntiFlutter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// Cooldown key: repeated alerts with the same key are suppressed.
    pub key: String,
    pub severity: Severity,
    pub title: String,
    pub body: String,
    pub ts: DateTime<Utc>,
}

impl Alert {
    pub fn substrate(component: &str, error: &str) -> Self {
        Self {
            key: format!("substrate:{component}"),
            severity: Severity::Critical,
            title: format!("{component} stopped: substrate unavailable"),
            body: error.to_string(),
            ts: Utc::now(),
        }
    }

    pub fn dead_letter(dl: &DeadLetter) -> Self {
        Self {
            key: format!("dead-letter:{}", dl.match_id),
            severity: Severity::Warning,
            title: format!("match {} dead-lettered", dl.match_id),
            body: format!(
                "lane: {}\nattempts: {}\nlast error: {}",
                dl.lane, dl.attempts, dl.last_error
            ),
            ts: dl.at,
        }
    }
}

/// One delivery channel.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Where pipeline components raise alerts. Never fails the caller.
#[async_trait::async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, alert: Alert);
}

/// Writes alerts to the log. Always present.
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            Severity::Critical => {
                tracing::error!(key = %alert.key, body = %alert.body, "ALERT: {}", alert.title)
            }
            Severity::Warning => {
                tracing::warn!(key = %alert.key, body = %alert.body, "ALERT: {}", alert.title)
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Fans an alert out to every configured channel behind a keyed cooldown.
pub struct NotifierMux {
    notifiers: Vec<Box<dyn Notifier>>,
    flutter: Mutex<AntiFlutter>,
}

impl NotifierMux {
    pub fn new(notifiers: Vec<Box<dyn Notifier>>, cooldown_secs: i64) -> Self {
        Self {
            notifiers,
            flutter: Mutex::new(AntiFlutter::new(cooldown_secs)),
        }
    }

    /// Log always; Slack, Discord and e-mail when their env vars are set.
    pub fn from_env(cooldown_secs: i64) -> Self {
        let mut notifiers: Vec<Box<dyn Notifier>> = vec![Box::new(LogNotifier)];
        if let Some(n) = slack::SlackNotifier::from_env() {
            notifiers.push(Box::new(n));
        }
        if let Ok(url) = std::env::var("DISCORD_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                notifiers.push(Box::new(discord::DiscordNotifier::new(url)));
            }
        }
        match email::EmailSender::from_env() {
            Ok(Some(e)) => notifiers.push(Box::new(e)),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = ?e, "email alerts disabled: bad SMTP config"),
        }
        tracing::info!(
            channels = ?notifiers.iter().map(|n| n.name()).collect::<Vec<_>>(),
            "alert channels configured"
        );
        Self::new(notifiers, cooldown_secs)
    }

    pub fn channels(&self) -> Vec<&'static str> {
        self.notifiers.iter().map(|n| n.name()).collect()
    }
}

#[async_trait::async_trait]
impl AlertSink for NotifierMux {
    async fn raise(&self, alert: Alert) {
        let now = Utc::now();
        let allowed = match self.flutter.lock() {
            Ok(mut f) => {
                if f.should_alert(&alert.key, now) {
                    f.record_alert(&alert.key, now);
                    true
                } else {
                    false
                }
            }
            Err(_) => true,
        };
        if !allowed {
            counter!("alerts_total", "outcome" => "suppressed").increment(1);
            tracing::debug!(key = %alert.key, "alert suppressed by cooldown");
            return;
        }
        counter!("alerts_total", "outcome" => "sent").increment(1);
        for n in &self.notifiers {
            if let Err(e) = n.send(&alert).await {
                tracing::warn!(error = ?e, channel = n.name(), "alert delivery failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Counting(Arc<Mutex<Vec<String>>>);

    #[async_trait::async_trait]
    impl Notifier for Counting {
        async fn send(&self, alert: &Alert) -> Result<()> {
            self.0.lock().unwrap().push(alert.key.clone());
            Ok(())
        }
        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tokio::test]
    async fn repeated_key_is_suppressed_other_keys_pass() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mux = NotifierMux::new(vec![Box::new(Counting(seen.clone()))], 600);
        mux.raise(Alert::substrate("dispatcher", "gone")).await;
        mux.raise(Alert::substrate("dispatcher", "gone")).await;
        mux.raise(Alert::substrate("worker-1", "gone")).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["substrate:dispatcher", "substrate:worker-1"]
        );
    }
}
