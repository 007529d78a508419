// src/lib.rs
// Public library surface for the binary and the integration tests.

pub mod config;
pub mod error;
pub mod event;
pub mod health;
pub mod metrics;
pub mod telemetry;

// Shared log / queue substrate
pub mod substrate;

// Producers: source adapters, dedup gate, fetcher scheduling, fixture scan
pub mod fixtures;
pub mod ingest;

// Urgency classification and dispatch
pub mod classify;
pub mod dispatch;
pub mod knowledge;

// Consumers: worker pool and the per-match routine
pub mod deadletter;
pub mod processor;
pub mod worker;

// Operator alerts
pub mod notify;

pub mod app;

// ---- Re-exports for stable public API ----
pub use crate::app::{Collaborators, Pipeline, RunOptions};
pub use crate::config::PipelineConfig;
pub use crate::dispatch::{DispatchOutcome, Dispatcher};
pub use crate::error::{ClassifyError, PipelineError};
pub use crate::event::{Event, EventId, NewEvent, Payload, SourceKind};
pub use crate::worker::{ItemOutcome, Lane, WorkerPool};
