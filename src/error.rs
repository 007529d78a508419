//! Error types shared across the pipeline.
//!
//! [`PipelineError`] is what the substrate, dispatcher and worker pool return.
//! Collaborator implementations (adapters, processors, notifiers) use
//! `anyhow::Result` and are folded into the matching variant at the seam.

use std::time::Duration;

use crate::event::SourceKind;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The shared log/queue/dedup substrate cannot serve requests.
    /// Fatal to the component that observes it.
    #[error("substrate unavailable: {resource}")]
    SubstrateUnavailable { resource: String },

    /// The knowledge-base sink rejected or timed out on an event.
    #[error("knowledge sink failed: {0}")]
    Sink(String),

    /// A content source failed as a whole for this poll cycle.
    #[error("source {kind} failed: {message}")]
    Source { kind: SourceKind, message: String },

    /// Invalid or missing configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn unavailable(resource: impl Into<String>) -> Self {
        Self::SubstrateUnavailable {
            resource: resource.into(),
        }
    }

    /// Substrate failures stop the component; everything else is recoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SubstrateUnavailable { .. })
    }
}

/// Failure modes of a single classifier call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifyError {
    #[error("classifier timed out after {0:?}")]
    Timeout(Duration),

    #[error("classifier upstream error: {0}")]
    Upstream(String),

    #[error("classifier returned malformed output: {0}")]
    Malformed(String),

    /// No classifier is configured; callers fall back without retrying.
    #[error("classifier disabled")]
    Disabled,
}

/// Returned when a CLI/config string does not name a known source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown source '{0}' (expected rss, social, odds or fixture)")]
pub struct ParseSourceError(pub String);
