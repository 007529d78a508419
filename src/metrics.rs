use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and describe the pipeline series.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("prometheus: install recorder: {e}"))?;
        describe_pipeline_metrics();
        gauge!("pipeline_healthy").set(1.0);
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

/// One-time registration so every series shows up with help text.
pub fn describe_pipeline_metrics() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        crate::ingest::ensure_metrics_described();
        describe_counter!("classifier_calls_total", "Classifier attempts.");
        describe_counter!("classifier_failures_total", "Failed classifier attempts by kind.");
        describe_counter!("classifier_fallback_total", "Events that got the fallback verdict.");
        describe_histogram!("classifier_latency_ms", "Classifier attempt latency in milliseconds.");
        describe_counter!("dispatch_events_total", "Events handled by the dispatcher, by outcome.");
        describe_counter!("dispatch_priority_pushes_total", "Match ids pushed to the priority queue.");
        describe_counter!("dispatch_normal_pushes_total", "Match ids pushed to the normal queue.");
        describe_counter!("dispatch_sink_failures_total", "Knowledge-sink failures (event left unacked).");
        describe_counter!("dispatch_redeliveries_total", "Events delivered more than once.");
        describe_counter!("worker_items_total", "Processed queue items by lane and outcome.");
        describe_counter!("worker_dead_letters_total", "Items moved to the dead-letter list.");
        describe_counter!("worker_dead_letters_evicted_total", "Dead letters dropped from the capped in-process list.");
        describe_histogram!("worker_process_ms", "Processing time per item in milliseconds.");
        describe_gauge!("worker_normal_starvation_seconds", "Seconds since a normal item was last processed.");
        describe_gauge!("queue_depth", "Items waiting per queue.");
        describe_gauge!("log_entries", "Entries retained in the event log.");
        describe_counter!("log_corrupt_entries_total", "Stored log entries that could not be decoded.");
        describe_counter!("fixture_scan_queued_total", "Fixtures pushed to the normal queue by the scan.");
        describe_counter!("knowledge_chunks_total", "Chunks written to the knowledge base.");
        describe_counter!("alerts_total", "Alerts raised, by outcome.");
        describe_gauge!("fetcher_stale", "1 when a fetcher missed two intervals.");
        describe_gauge!("pipeline_healthy", "0 once a component failed fatally.");
    });
}
