// src/classify/mock.rs
//! Offline classifiers: a deterministic keyword scorer and the disabled client.

use super::{ClassifierOutput, ClassifyFuture, ClassifyRequest, UrgencyClassifier};
use crate::error::ClassifyError;

const BREAKING_TERMS: &[&str] = &[
    "ruled out",
    "out for",
    "injured",
    "injury",
    "suspended",
    "suspension",
    "red card",
    "banned",
    "sacked",
    "here we go",
    "will miss",
    "withdrawn",
];

const IMPORTANT_TERMS: &[&str] = &[
    "doubt",
    "doubtful",
    "late fitness test",
    "fitness",
    "transfer",
    "rumour",
    "talks",
    "lineup",
    "line-up",
    "starts",
];

/// Scores text by term lists. Any hinted fixture counts as affected.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    pub breaking: u8,
    pub important: u8,
    pub routine: u8,
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self {
            breaking: 9,
            important: 5,
            routine: 2,
        }
    }
}

impl KeywordClassifier {
    pub fn score(&self, text: &str) -> (u8, &'static str) {
        let lower = text.to_lowercase();
        if BREAKING_TERMS.iter().any(|t| lower.contains(t)) {
            (self.breaking, "BREAKING")
        } else if IMPORTANT_TERMS.iter().any(|t| lower.contains(t)) {
            (self.important, "IMPORTANT")
        } else {
            (self.routine, "NORMAL")
        }
    }
}

impl UrgencyClassifier for KeywordClassifier {
    fn classify<'a>(&'a self, req: &'a ClassifyRequest) -> ClassifyFuture<'a> {
        let (importance, label) = self.score(&req.text);
        let out = ClassifierOutput {
            importance: importance as i64,
            affected_match_ids: req.known_match_hints.iter().map(|h| h.match_id).collect(),
            urgency_tier: Some(label.to_string()),
            reason: Some("keyword match (mock)".to_string()),
        };
        Box::pin(async move { Ok(out) })
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

/// Always `Disabled`; the policy turns that into the fallback verdict at once.
pub struct DisabledClassifier;

impl UrgencyClassifier for DisabledClassifier {
    fn classify<'a>(&'a self, _req: &'a ClassifyRequest) -> ClassifyFuture<'a> {
        Box::pin(async { Err(ClassifyError::Disabled) })
    }

    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}
