// src/ingest/types.rs
use anyhow::Result;

use crate::event::{NewEvent, SourceKind};

/// Output of one adapter poll: normalized events plus the items that failed
/// on their own without failing the poll.
#[derive(Debug, Default)]
pub struct PollBatch {
    pub events: Vec<NewEvent>,
    pub item_errors: Vec<String>,
}

impl PollBatch {
    pub fn push_error(&mut self, what: impl Into<String>) {
        self.item_errors.push(what.into());
    }
}

#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceKind;

    fn name(&self) -> &str;

    /// An `Err` means the whole source was unreachable this cycle.
    async fn poll(&self) -> Result<PollBatch>;
}
