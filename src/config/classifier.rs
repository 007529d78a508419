// src/config/classifier.rs
use serde::{Deserialize, Serialize};
use std::env;

use crate::error::PipelineError;

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key() -> String {
    "ENV".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// "openai" | "mock" | "disabled" (case-insensitive)
    pub provider: String,
    pub model: String,
    pub base_url: String,
    /// "ENV" means: read from OPENAI_API_KEY at build time.
    pub api_key: String,
    /// Per-attempt bound.
    pub timeout_ms: u64,
    /// Total attempts, not extra retries.
    pub max_retries: u32,
    /// First retry delay; doubles on each further attempt.
    pub backoff_ms: u64,
    pub high_threshold: u8,
    pub mid_threshold: u8,
    /// Text sent to the classifier is cut to this many chars.
    pub max_chars: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: default_base_url(),
            api_key: default_api_key(),
            timeout_ms: 10_000,
            max_retries: 3,
            backoff_ms: 500,
            high_threshold: 7,
            mid_threshold: 4,
            max_chars: 4_000,
        }
    }
}

impl ClassifierConfig {
    /// Resolve `"ENV"` to `OPENAI_API_KEY`. `None` when no key is available.
    pub fn resolved_api_key(&self) -> Option<String> {
        let k = self.api_key.trim();
        if k.is_empty() {
            return None;
        }
        if k.eq_ignore_ascii_case("env") {
            return env::var("OPENAI_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty());
        }
        Some(k.to_string())
    }

    pub(crate) fn normalize(&mut self) {
        self.provider = self.provider.trim().to_lowercase();
        self.base_url = self.base_url.trim_end_matches('/').to_string();
    }

    pub(crate) fn validate(&self) -> Result<(), PipelineError> {
        if !matches!(self.provider.as_str(), "openai" | "mock" | "disabled") {
            return Err(PipelineError::Config(format!(
                "unsupported classifier provider '{}'",
                self.provider
            )));
        }
        for (name, v) in [("high", self.high_threshold), ("mid", self.mid_threshold)] {
            if !(1..=10).contains(&v) {
                return Err(PipelineError::Config(format!(
                    "importance {name} threshold {v} outside 1..=10"
                )));
            }
        }
        if self.mid_threshold > self.high_threshold {
            return Err(PipelineError::Config(format!(
                "mid threshold {} exceeds high threshold {}",
                self.mid_threshold, self.high_threshold
            )));
        }
        if self.max_retries == 0 {
            return Err(PipelineError::Config(
                "classifier max_retries must be at least 1".into(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(PipelineError::Config(
                "classifier timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}
