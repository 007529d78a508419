//! deadletter.rs: match ids that exhausted their retries, and the
//! `/dead-letters` route that lists them.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::worker::Lane;

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub match_id: i64,
    pub lane: Lane,
    /// Processing attempts made, including the last failed one.
    pub attempts: u32,
    pub last_error: String,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn record(&self, dl: DeadLetter) -> Result<(), PipelineError>;

    /// The newest `n` records, oldest first.
    async fn snapshot_last_n(&self, n: usize) -> Result<Vec<DeadLetter>, PipelineError>;

    async fn len(&self) -> Result<usize, PipelineError>;

    fn close(&self) {}
}

/// In-process, capped list. Evictions are logged and counted.
#[derive(Debug)]
pub struct DeadLetterQueue {
    inner: Mutex<Vec<DeadLetter>>,
    cap: usize,
}

impl DeadLetterQueue {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.clamp(1, 10_000);
        Self {
            inner: Mutex::new(Vec::with_capacity(cap)),
            cap,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<DeadLetter>>, PipelineError> {
        self.inner
            .lock()
            .map_err(|_| PipelineError::unavailable("dead-letter list"))
    }
}

#[async_trait]
impl DeadLetterStore for DeadLetterQueue {
    async fn record(&self, dl: DeadLetter) -> Result<(), PipelineError> {
        let mut v = self.lock()?;
        v.push(dl);
        if v.len() > self.cap {
            let excess = v.len() - self.cap;
            for old in v.drain(0..excess) {
                tracing::warn!(
                    match_id = old.match_id,
                    lane = %old.lane,
                    attempts = old.attempts,
                    error = %old.last_error,
                    "dead letter evicted from capped list"
                );
            }
            counter!("worker_dead_letters_evicted_total").increment(excess as u64);
        }
        Ok(())
    }

    async fn snapshot_last_n(&self, n: usize) -> Result<Vec<DeadLetter>, PipelineError> {
        let v = self.lock()?;
        let start = v.len().saturating_sub(n);
        Ok(v[start..].to_vec())
    }

    async fn len(&self) -> Result<usize, PipelineError> {
        Ok(self.lock()?.len())
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DeadLetterReport {
    pub total: usize,
    pub items: Vec<DeadLetter>,
}

/// `GET /dead-letters?limit=N`, newest last.
pub fn router(store: Arc<dyn DeadLetterStore>) -> Router {
    Router::new()
        .route("/dead-letters", get(list_handler))
        .with_state(store)
}

async fn list_handler(
    State(store): State<Arc<dyn DeadLetterStore>>,
    Query(params): Query<ListParams>,
) -> Result<Json<DeadLetterReport>, (StatusCode, String)> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(1_000);
    let unavailable = |e: PipelineError| (StatusCode::SERVICE_UNAVAILABLE, e.to_string());
    let total = store.len().await.map_err(unavailable)?;
    let items = store.snapshot_last_n(limit).await.map_err(unavailable)?;
    Ok(Json(DeadLetterReport { total, items }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dl(match_id: i64) -> DeadLetter {
        DeadLetter {
            match_id,
            lane: Lane::Normal,
            attempts: 3,
            last_error: "boom".into(),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn keeps_only_the_newest_entries() {
        let q = DeadLetterQueue::with_capacity(2);
        for id in 1..=3 {
            q.record(dl(id)).await.unwrap();
        }
        let ids: Vec<i64> = q
            .snapshot_last_n(10)
            .await
            .unwrap()
            .iter()
            .map(|d| d.match_id)
            .collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(q.snapshot_last_n(1).await.unwrap()[0].match_id, 3);
        assert_eq!(q.len().await.unwrap(), 2);
    }

    #[test]
    fn round_trips_through_json() {
        let d = dl(9);
        let back: DeadLetter = serde_json::from_str(&serde_json::to_string(&d).unwrap()).unwrap();
        assert_eq!(back, d);
    }
}
