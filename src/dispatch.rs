//! Dispatcher: drains the event log through a consumer group, classifies
//! urgency, fans match ids out to the priority/normal queues, forwards every
//! event to the knowledge sink and acknowledges.
//!
//! Per event: RECEIVED -> CLASSIFIED -> {DISPATCHED_PRIORITY | SKIPPED} ->
//! ACKNOWLEDGED. The ack is the last step; anything that fails before it
//! leaves the entry pending, to be redelivered after the visibility timeout.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::classify::hints::FixtureIndex;
use crate::classify::{
    classify_with_policy, ClassifierPolicy, ClassifyRequest, DynClassifier, Tier, Verdict,
};
use crate::error::PipelineError;
use crate::event::Event;
use crate::health::Health;
use crate::knowledge::{KnowledgeSink, StoreOutcome};
use crate::notify::{Alert, AlertSink};
use crate::substrate::{Delivery, EventLog, QueueItem, WorkQueue};

pub const COMPONENT: &str = "dispatcher";

/// How one delivery ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Affected match ids went to the priority queue; event acked.
    DispatchedPriority { match_ids: Vec<i64> },
    /// Structural event with a match id went to the normal queue; event acked.
    QueuedNormal { match_id: i64 },
    /// Nothing to push; event stored and acked.
    Skipped,
    /// The knowledge sink failed or timed out. Not acked.
    SinkFailed { reason: String },
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DispatchedPriority { .. } => "dispatched_priority",
            Self::QueuedNormal { .. } => "queued_normal",
            Self::Skipped => "skipped",
            Self::SinkFailed { .. } => "sink_failed",
        }
    }

    pub fn acked(&self) -> bool {
        !matches!(self, Self::SinkFailed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherCfg {
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block: Duration,
    pub sink_timeout: Duration,
}

impl Default for DispatcherCfg {
    fn default() -> Self {
        Self {
            group: "dispatchers".into(),
            consumer: "dispatcher-1".into(),
            batch_size: 16,
            block: Duration::from_secs(2),
            sink_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Clone)]
pub struct DispatcherDeps {
    pub log: Arc<dyn EventLog>,
    pub priority: Arc<dyn WorkQueue>,
    pub normal: Arc<dyn WorkQueue>,
    pub classifier: DynClassifier,
    pub policy: ClassifierPolicy,
    pub sink: Arc<dyn KnowledgeSink>,
    pub index: Arc<FixtureIndex>,
    pub health: Health,
    pub alerts: Arc<dyn AlertSink>,
}

pub struct Dispatcher {
    deps: DispatcherDeps,
    cfg: DispatcherCfg,
}

impl Dispatcher {
    pub fn new(deps: DispatcherDeps, cfg: DispatcherCfg) -> Self {
        Self { deps, cfg }
    }

    async fn classify(&self, event: &Event) -> Option<Verdict> {
        if !event.source.requires_classification() {
            return None;
        }
        let text = event.text();
        let req = ClassifyRequest {
            known_match_hints: self.deps.index.hints_for(&text),
            text,
            source: event.source,
            author: event.payload.author().map(str::to_string),
        };
        Some(classify_with_policy(self.deps.classifier.as_ref(), &self.deps.policy, &req).await)
    }

    /// Handle one delivery end to end. `Err` only for substrate failures.
    pub async fn dispatch(&self, delivery: &Delivery) -> Result<DispatchOutcome, PipelineError> {
        let event = &delivery.event;
        tracing::debug!(id = %event.id, source = %event.source, attempt = delivery.attempt, "received");

        let verdict = self.classify(event).await;
        let tier = verdict.as_ref().map(|v| v.tier);

        let mut outcome = DispatchOutcome::Skipped;
        match &verdict {
            Some(v) if v.should_dispatch_priority => {
                for &match_id in &v.affected_match_ids {
                    self.deps
                        .priority
                        .push(QueueItem::new(match_id, Some(event.id)))
                        .await?;
                }
                counter!("dispatch_priority_pushes_total")
                    .increment(v.affected_match_ids.len() as u64);
                outcome = DispatchOutcome::DispatchedPriority {
                    match_ids: v.affected_match_ids.iter().copied().collect(),
                };
            }
            Some(_) => {}
            None => {
                if let Some(match_id) = event.match_id {
                    self.deps
                        .normal
                        .push(QueueItem::new(match_id, Some(event.id)))
                        .await?;
                    counter!("dispatch_normal_pushes_total").increment(1);
                    outcome = DispatchOutcome::QueuedNormal { match_id };
                }
            }
        }

        let related = verdict
            .as_ref()
            .map(|v| v.affected_match_ids.clone())
            .unwrap_or_default();
        if let Some(reason) = self.forward_to_sink(event, &related).await? {
            counter!("dispatch_sink_failures_total").increment(1);
            let failed = DispatchOutcome::SinkFailed { reason };
            self.record(event, tier, verdict.as_ref(), &failed);
            return Ok(failed);
        }

        self.deps.log.ack(&self.cfg.group, event.id).await?;
        self.record(event, tier, verdict.as_ref(), &outcome);
        Ok(outcome)
    }

    /// `Ok(Some(reason))` when the sink failed in a recoverable way.
    async fn forward_to_sink(
        &self,
        event: &Event,
        related: &BTreeSet<i64>,
    ) -> Result<Option<String>, PipelineError> {
        match tokio::time::timeout(self.cfg.sink_timeout, self.deps.sink.store(event, related)).await {
            Ok(Ok(StoreOutcome::Inserted { chunks })) => {
                tracing::trace!(id = %event.id, chunks, "stored in knowledge base");
                Ok(None)
            }
            Ok(Ok(StoreOutcome::AlreadyPresent)) => Ok(None),
            Ok(Err(e)) if e.is_fatal() => Err(e),
            Ok(Err(e)) => Ok(Some(e.to_string())),
            Err(_) => Ok(Some(format!(
                "knowledge sink timed out after {:?}",
                self.cfg.sink_timeout
            ))),
        }
    }

    fn record(&self, event: &Event, tier: Option<Tier>, verdict: Option<&Verdict>, outcome: &DispatchOutcome) {
        let tier = tier.map(|t| t.as_str()).unwrap_or("STRUCTURAL");
        counter!(
            "dispatch_events_total",
            "source" => event.source.as_str(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        match outcome {
            DispatchOutcome::SinkFailed { reason } => tracing::warn!(
                id = %event.id,
                source = %event.source,
                tier,
                outcome = outcome.as_str(),
                reason = %reason,
                "event left pending"
            ),
            _ => tracing::info!(
                id = %event.id,
                source = %event.source,
                tier,
                importance = verdict.map(|v| v.importance),
                degraded = verdict.map(|v| v.degraded).unwrap_or(false),
                outcome = outcome.as_str(),
                "acknowledged"
            ),
        }
    }

    /// Read and dispatch one batch. Returns the outcomes in delivery order.
    pub async fn poll_once(&self) -> Result<Vec<DispatchOutcome>, PipelineError> {
        let batch = self
            .deps
            .log
            .read_group(&self.cfg.group, &self.cfg.consumer, self.cfg.batch_size, self.cfg.block)
            .await?;
        let mut outcomes = Vec::with_capacity(batch.len());
        for delivery in &batch {
            if delivery.attempt > 1 {
                counter!("dispatch_redeliveries_total").increment(1);
            }
            outcomes.push(self.dispatch(delivery).await?);
        }
        Ok(outcomes)
    }

    /// Loop until shutdown. The in-flight batch always completes; a substrate
    /// failure marks health failed, raises an alert and stops the loop.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), PipelineError> {
        if let Err(e) = self.deps.log.ensure_group(&self.cfg.group).await {
            self.fail(&e).await;
            return Err(e);
        }
        self.deps.health.mark_ok(COMPONENT);
        tracing::info!(group = %self.cfg.group, consumer = %self.cfg.consumer, "dispatcher started");

        while !*shutdown.borrow() {
            match self.poll_once().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    self.fail(&e).await;
                    return Err(e);
                }
                Err(e) => tracing::warn!(error = %e, "dispatcher batch failed"),
            }
        }
        tracing::info!("dispatcher stopped");
        Ok(())
    }

    async fn fail(&self, e: &PipelineError) {
        tracing::error!(error = %e, "dispatcher stopped: substrate failure");
        self.deps.health.mark_failed(COMPONENT, e.to_string());
        self.deps
            .alerts
            .raise(Alert::substrate(COMPONENT, &e.to_string()))
            .await;
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<(), PipelineError>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
