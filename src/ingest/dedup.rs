// src/ingest/dedup.rs
//! Deduplication gate: fingerprints seen within their TTL are not republished.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::PipelineError;

const RESOURCE: &str = "dedup store";

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically records `fingerprint` unless a live record exists.
    /// Returns `true` when the fingerprint is new (caller may publish).
    async fn check_and_mark(&self, fingerprint: &str, ttl: Duration) -> Result<bool, PipelineError>;

    /// Drop a mark whose publish did not go through.
    async fn release(&self, fingerprint: &str) -> Result<(), PipelineError>;
    fn close(&self);
}

#[derive(Debug, Default)]
struct Inner {
    expiry: HashMap<String, Instant>,
    closed: bool,
}

/// Set with per-key expiry. Expired keys are swept lazily on write.
#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    inner: Mutex<Inner>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        if let Ok(mut g) = self.inner.lock() {
            g.closed = true;
        }
    }

    /// Live records; expired ones are not counted.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .map(|g| g.expiry.values().filter(|exp| **exp > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, PipelineError> {
        let g = self
            .inner
            .lock()
            .map_err(|_| PipelineError::unavailable(RESOURCE))?;
        if g.closed {
            return Err(PipelineError::unavailable(RESOURCE));
        }
        Ok(g)
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn check_and_mark(&self, fingerprint: &str, ttl: Duration) -> Result<bool, PipelineError> {
        let now = Instant::now();
        let mut g = self.lock()?;
        if g.expiry.len() > 4096 {
            g.expiry.retain(|_, exp| *exp > now);
        }
        match g.expiry.get(fingerprint) {
            Some(exp) if *exp > now => Ok(false),
            _ => {
                g.expiry.insert(fingerprint.to_string(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn release(&self, fingerprint: &str) -> Result<(), PipelineError> {
        let mut g = self.lock()?;
        g.expiry.remove(fingerprint);
        Ok(())
    }
    fn close(&self) {
        MemoryDedupStore::close(self)
    }
}
