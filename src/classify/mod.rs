//! Urgency classification: provider abstraction, verdict derivation and the
//! timeout/retry/fallback policy the dispatcher calls through.

pub mod hints;
pub mod llm;
pub mod mock;

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};

use crate::config::ClassifierConfig;
use crate::error::ClassifyError;
use crate::event::SourceKind;

pub use hints::{FixtureIndex, MatchHint};
pub use llm::OpenAiClassifier;
pub use mock::{DisabledClassifier, KeywordClassifier};

// ------------------------------------------------------------
// Public surface
// ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Normal,
    Important,
    Breaking,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Normal => "NORMAL",
            Tier::Important => "IMPORTANT",
            Tier::Breaking => "BREAKING",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub high: u8,
    pub mid: u8,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self { high: 7, mid: 4 }
    }
}

impl Thresholds {
    pub fn tier_for(&self, importance: u8) -> Tier {
        if importance >= self.high {
            Tier::Breaking
        } else if importance >= self.mid {
            Tier::Important
        } else {
            Tier::Normal
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifyRequest {
    pub text: String,
    pub source: SourceKind,
    pub author: Option<String>,
    pub known_match_hints: Vec<MatchHint>,
}

/// What a classifier returns, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierOutput {
    pub importance: i64,
    pub affected_match_ids: Vec<i64>,
    /// The provider's own label. Informational only.
    pub urgency_tier: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub importance: u8,
    pub tier: Tier,
    pub affected_match_ids: BTreeSet<i64>,
    pub should_dispatch_priority: bool,
    /// Set on the fallback verdict.
    pub degraded: bool,
    /// Classifier calls made to reach this verdict.
    pub attempts: u32,
}

impl Verdict {
    /// Validate a raw output and derive tier and priority from importance.
    pub fn from_output(
        out: &ClassifierOutput,
        thresholds: Thresholds,
        attempts: u32,
    ) -> Result<Self, ClassifyError> {
        let importance = u8::try_from(out.importance)
            .ok()
            .filter(|i| (1..=10).contains(i))
            .ok_or_else(|| {
                ClassifyError::Malformed(format!("importance {} outside 1..=10", out.importance))
            })?;
        let affected: BTreeSet<i64> = out
            .affected_match_ids
            .iter()
            .copied()
            .filter(|id| *id > 0)
            .collect();
        Ok(Self {
            importance,
            tier: thresholds.tier_for(importance),
            should_dispatch_priority: importance >= thresholds.high && !affected.is_empty(),
            affected_match_ids: affected,
            degraded: false,
            attempts,
        })
    }

    /// Routine processing when the classifier could not answer.
    pub fn fallback(attempts: u32) -> Self {
        Self {
            importance: 1,
            tier: Tier::Normal,
            affected_match_ids: BTreeSet::new(),
            should_dispatch_priority: false,
            degraded: true,
            attempts,
        }
    }
}

pub type ClassifyFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ClassifierOutput, ClassifyError>> + Send + 'a>>;

/// A single, unbounded classification call. Time bounds and retries are the
/// policy's job.
pub trait UrgencyClassifier: Send + Sync {
    fn classify<'a>(&'a self, req: &'a ClassifyRequest) -> ClassifyFuture<'a>;
    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str;
}

/// Convenient alias used by callers.
pub type DynClassifier = Arc<dyn UrgencyClassifier>;

/// Factory: build a classifier according to config and environment variables.
///
/// * If `AI_TEST_MODE=mock`, returns the deterministic keyword classifier.
/// * `provider = "mock"` does the same, `"disabled"` always falls back.
/// * `"openai"` without an API key degrades to disabled with a warning.
pub fn build_classifier(cfg: &ClassifierConfig) -> anyhow::Result<DynClassifier> {
    if std::env::var("AI_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        return Ok(Arc::new(KeywordClassifier::default()));
    }
    match cfg.provider.as_str() {
        "mock" => Ok(Arc::new(KeywordClassifier::default())),
        "disabled" => Ok(Arc::new(DisabledClassifier)),
        "openai" => match cfg.resolved_api_key() {
            Some(key) => Ok(Arc::new(OpenAiClassifier::new(cfg, key)?)),
            None => {
                tracing::warn!("OPENAI_API_KEY not set; classifier disabled, every event is NORMAL");
                Ok(Arc::new(DisabledClassifier))
            }
        },
        other => anyhow::bail!("unsupported classifier provider: {other}"),
    }
}

// ------------------------------------------------------------
// Policy
// ------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ClassifierPolicy {
    pub timeout: Duration,
    /// Total attempts.
    pub max_attempts: u32,
    pub backoff: Duration,
    pub thresholds: Thresholds,
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        Self::from_config(&ClassifierConfig::default())
    }
}

impl ClassifierPolicy {
    pub fn from_config(cfg: &ClassifierConfig) -> Self {
        Self {
            timeout: Duration::from_millis(cfg.timeout_ms),
            max_attempts: cfg.max_retries.max(1),
            backoff: Duration::from_millis(cfg.backoff_ms),
            thresholds: Thresholds {
                high: cfg.high_threshold,
                mid: cfg.mid_threshold,
            },
        }
    }

    /// Delay after failed attempt `n` (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

fn failure_kind(e: &ClassifyError) -> &'static str {
    match e {
        ClassifyError::Timeout(_) => "timeout",
        ClassifyError::Upstream(_) => "upstream",
        ClassifyError::Malformed(_) => "malformed",
        ClassifyError::Disabled => "disabled",
    }
}

/// Classify with bounded attempts. Never fails: exhaustion yields
/// [`Verdict::fallback`].
pub async fn classify_with_policy(
    classifier: &dyn UrgencyClassifier,
    policy: &ClassifierPolicy,
    req: &ClassifyRequest,
) -> Verdict {
    let provider = classifier.provider_name();
    for attempt in 1..=policy.max_attempts {
        let t0 = tokio::time::Instant::now();
        let res = match tokio::time::timeout(policy.timeout, classifier.classify(req)).await {
            Ok(r) => r,
            Err(_) => Err(ClassifyError::Timeout(policy.timeout)),
        };
        histogram!("classifier_latency_ms", "provider" => provider)
            .record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("classifier_calls_total", "provider" => provider).increment(1);

        let err = match res.and_then(|out| Verdict::from_output(&out, policy.thresholds, attempt)) {
            Ok(v) => return v,
            Err(e) => e,
        };
        counter!("classifier_failures_total", "kind" => failure_kind(&err)).increment(1);
        if err == ClassifyError::Disabled {
            return Verdict::fallback(attempt);
        }
        tracing::warn!(
            error = %err,
            attempt,
            max_attempts = policy.max_attempts,
            provider,
            "classifier attempt failed"
        );
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.backoff_after(attempt)).await;
        }
    }
    counter!("classifier_fallback_total").increment(1);
    Verdict::fallback(policy.max_attempts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(importance: i64, ids: &[i64]) -> ClassifierOutput {
        ClassifierOutput {
            importance,
            affected_match_ids: ids.to_vec(),
            urgency_tier: Some("BREAKING".into()),
            reason: None,
        }
    }

    #[test]
    fn tier_boundaries_follow_thresholds() {
        let t = Thresholds::default();
        assert_eq!(t.tier_for(7), Tier::Breaking);
        assert_eq!(t.tier_for(6), Tier::Important);
        assert_eq!(t.tier_for(4), Tier::Important);
        assert_eq!(t.tier_for(3), Tier::Normal);
    }

    #[test]
    fn provider_label_is_ignored() {
        let v = Verdict::from_output(&out(2, &[5]), Thresholds::default(), 1).unwrap();
        assert_eq!(v.tier, Tier::Normal);
        assert!(!v.should_dispatch_priority);
    }

    #[test]
    fn priority_needs_affected_matches() {
        let v = Verdict::from_output(&out(9, &[]), Thresholds::default(), 1).unwrap();
        assert_eq!(v.tier, Tier::Breaking);
        assert!(!v.should_dispatch_priority);

        let v = Verdict::from_output(&out(9, &[555, 555, 12]), Thresholds::default(), 1).unwrap();
        assert!(v.should_dispatch_priority);
        assert_eq!(v.affected_match_ids.into_iter().collect::<Vec<_>>(), vec![12, 555]);
    }

    #[test]
    fn out_of_range_importance_is_malformed() {
        for bad in [0, 11, -3] {
            assert!(matches!(
                Verdict::from_output(&out(bad, &[1]), Thresholds::default(), 1),
                Err(ClassifyError::Malformed(_))
            ));
        }
    }

    #[test]
    fn backoff_doubles() {
        let p = ClassifierPolicy {
            backoff: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(p.backoff_after(1), Duration::from_millis(100));
        assert_eq!(p.backoff_after(2), Duration::from_millis(200));
        assert_eq!(p.backoff_after(3), Duration::from_millis(400));
    }
}
