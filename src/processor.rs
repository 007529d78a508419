//! The per-match processing routine the worker pool drives.
//!
//! Regenerating predictions for a match lives outside this crate; workers only
//! need `process(match_id)`. Implementations must be idempotent: the same match
//! can be processed once from each lane.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;

use crate::ingest::providers::http_client;

#[async_trait]
pub trait MatchProcessor: Send + Sync {
    async fn process(&self, match_id: i64) -> Result<()>;
}

/// POSTs `{"match_id": id}` to an external endpoint.
pub struct HttpMatchProcessor {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ProcessBody {
    match_id: i64,
}

impl HttpMatchProcessor {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint.into(),
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl MatchProcessor for HttpMatchProcessor {
    async fn process(&self, match_id: i64) -> Result<()> {
        self.client
            .post(&self.endpoint)
            .json(&ProcessBody { match_id })
            .send()
            .await
            .with_context(|| format!("POST {} for match {match_id}", self.endpoint))?
            .error_for_status()
            .with_context(|| format!("processor rejected match {match_id}"))?;
        Ok(())
    }
}

/// Used when no endpoint is configured.
pub struct LoggingProcessor;

#[async_trait]
impl MatchProcessor for LoggingProcessor {
    async fn process(&self, match_id: i64) -> Result<()> {
        tracing::info!(match_id, "processing match (no processor endpoint configured)");
        Ok(())
    }
}

pub fn build_processor(endpoint: Option<&str>, timeout: Duration) -> Result<Arc<dyn MatchProcessor>> {
    match endpoint.map(str::trim).filter(|e| !e.is_empty()) {
        Some(url) => Ok(Arc::new(HttpMatchProcessor::new(url, timeout)?)),
        None => Ok(Arc::new(LoggingProcessor)),
    }
}
