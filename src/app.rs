//! Wiring: builds the substrate and collaborators from a [`PipelineConfig`]
//! and runs the long-lived tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::classify::{build_classifier, ClassifierPolicy, DynClassifier, FixtureIndex};
use crate::config::PipelineConfig;
use crate::deadletter::{self, DeadLetterStore};
use crate::dispatch::{Dispatcher, DispatcherCfg, DispatcherDeps};
use crate::error::PipelineError;
use crate::event::SourceKind;
use crate::fixtures::{
    scan_fixtures_once, spawn_fixture_scan_loop, ApiFootballFixtures, FixtureScanDeps,
    FixtureSource, ScanReport,
};
use crate::health::Health;
use crate::ingest::dedup::DedupStore;
use crate::ingest::providers::{odds::OddsAdapter, rss::RssAdapter, social::SocialAdapter};
use crate::ingest::scheduler::{
    spawn_adapter_loop, spawn_health_report, AdapterLoopCfg, FetcherDeps, FetcherStats,
};
use crate::ingest::types::SourceAdapter;
use crate::ingest::{publish_cycle, terms, CycleReport};
use crate::knowledge::{FileKnowledgeSink, KnowledgeSink, MemoryKnowledgeBase};
use crate::metrics::Metrics;
use crate::notify::{AlertSink, NotifierMux};
use crate::processor::{build_processor, MatchProcessor};
use crate::substrate::{EventLog, Substrate, WorkQueue};
use crate::worker::{WorkerPool, WorkerPoolConfig};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Only dispatch and work; no fetchers, no fixture scan.
    pub no_ingest: bool,
}

/// Collaborators that tests and embedders may want to swap.
pub struct Collaborators {
    pub classifier: DynClassifier,
    pub sink: Arc<dyn KnowledgeSink>,
    pub processor: Arc<dyn MatchProcessor>,
    pub alerts: Arc<dyn AlertSink>,
}

impl Collaborators {
    pub fn from_config(cfg: &PipelineConfig) -> Result<Self> {
        let classifier = build_classifier(&cfg.classifier).context("building classifier")?;
        let sink: Arc<dyn KnowledgeSink> = match &cfg.knowledge.dir {
            Some(dir) => Arc::new(
                FileKnowledgeSink::new(dir, cfg.knowledge.chunk_chars)
                    .with_context(|| format!("opening knowledge dir {}", dir.display()))?,
            ),
            None => Arc::new(MemoryKnowledgeBase::new(cfg.knowledge.chunk_chars)),
        };
        let processor = build_processor(cfg.processor.endpoint.as_deref(), cfg.process_timeout())?;
        let cooldown = i64::try_from(cfg.alerts.cooldown_secs).unwrap_or(i64::MAX);
        let alerts: Arc<dyn AlertSink> = Arc::new(NotifierMux::from_env(cooldown));
        Ok(Self {
            classifier,
            sink,
            processor,
            alerts,
        })
    }
}

pub struct Pipeline {
    pub config: PipelineConfig,
    pub log: Arc<dyn EventLog>,
    pub priority: Arc<dyn WorkQueue>,
    pub normal: Arc<dyn WorkQueue>,
    pub gate: Arc<dyn DedupStore>,
    pub index: Arc<FixtureIndex>,
    pub health: Health,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub stats: Arc<FetcherStats>,
    substrate: Substrate,
    collab: Collaborators,
}

impl Pipeline {
    /// Collaborators and substrate as configured.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let collab = Collaborators::from_config(&config)?;
        Self::open(config, collab).await
    }

    /// Substrate as configured by `substrate.backend`.
    pub async fn open(config: PipelineConfig, collab: Collaborators) -> Result<Self> {
        let substrate = Substrate::open(&config)
            .await
            .with_context(|| format!("opening {:?} substrate", config.substrate.backend))?;
        Ok(Self::with_substrate(config, substrate, collab))
    }

    /// In-process substrate.
    pub fn with_collaborators(config: PipelineConfig, collab: Collaborators) -> Self {
        let substrate = Substrate::memory(&config);
        Self::with_substrate(config, substrate, collab)
    }

    pub fn with_substrate(config: PipelineConfig, substrate: Substrate, collab: Collaborators) -> Self {
        Self {
            log: substrate.log.clone(),
            priority: substrate.priority.clone(),
            normal: substrate.normal.clone(),
            gate: substrate.gate.clone(),
            dead_letters: substrate.dead_letters.clone(),
            index: Arc::new(FixtureIndex::new()),
            health: Health::new(),
            stats: Arc::new(FetcherStats::new()),
            substrate,
            config,
            collab,
        }
    }

    pub fn alerts(&self) -> Arc<dyn AlertSink> {
        Arc::clone(&self.collab.alerts)
    }

    pub fn dispatcher(&self) -> Dispatcher {
        let log = &self.config.log;
        Dispatcher::new(
            DispatcherDeps {
                log: self.log.clone(),
                priority: self.priority.clone(),
                normal: self.normal.clone(),
                classifier: self.collab.classifier.clone(),
                policy: ClassifierPolicy::from_config(&self.config.classifier),
                sink: self.collab.sink.clone(),
                index: self.index.clone(),
                health: self.health.clone(),
                alerts: self.alerts(),
            },
            DispatcherCfg {
                group: log.consumer_group.clone(),
                consumer: log.consumer_name.clone(),
                batch_size: log.batch_size,
                block: Duration::from_millis(log.block_ms),
                sink_timeout: Duration::from_secs(log.sink_timeout_secs),
            },
        )
    }

    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.priority.clone(),
            self.normal.clone(),
            self.collab.processor.clone(),
            self.dead_letters.clone(),
            self.alerts(),
            self.health.clone(),
            WorkerPoolConfig {
                count: self.config.worker.count,
                poll_interval: self.config.worker_poll_interval(),
                max_item_retries: self.config.worker.max_item_retries,
                process_timeout: self.config.process_timeout(),
            },
        )
    }

    /// HTTP-mode adapter for one source.
    pub fn adapter_for(&self, source: SourceKind) -> Result<Arc<dyn SourceAdapter>> {
        let s = &self.config.sources;
        let adapter: Arc<dyn SourceAdapter> = match source {
            SourceKind::Rss => Arc::new(RssAdapter::from_config(&s.rss)?),
            SourceKind::Social => {
                let terms = terms::load_terms_default().unwrap_or_else(|e| {
                    tracing::warn!(error = ?e, "football terms not loaded; using built-in list");
                    terms::default_terms()
                });
                Arc::new(SocialAdapter::from_config(&s.social, terms)?)
            }
            SourceKind::Odds => {
                Arc::new(OddsAdapter::from_config(&s.odds)?.with_index(self.index.clone()))
            }
            SourceKind::Fixture => {
                return Err(anyhow!("fixtures are scanned, not fetched; use scan-fixtures"))
            }
        };
        Ok(adapter)
    }

    fn source_interval(&self, source: SourceKind) -> Option<Duration> {
        let s = &self.config.sources;
        let (enabled, secs) = match source {
            SourceKind::Rss => (s.rss.enabled, s.rss.interval_secs),
            SourceKind::Social => (s.social.enabled, s.social.interval_secs),
            SourceKind::Odds => (s.odds.enabled, s.odds.interval_secs),
            SourceKind::Fixture => (s.fixtures.enabled, s.fixtures.interval_secs),
        };
        enabled.then(|| Duration::from_secs(secs.max(1)))
    }

    pub fn fetcher_deps(&self) -> FetcherDeps {
        FetcherDeps {
            gate: self.gate.clone(),
            log: self.log.clone(),
            stats: self.stats.clone(),
            health: self.health.clone(),
            alerts: self.alerts(),
        }
    }

    /// One publish cycle for `source`.
    pub async fn fetch_once(&self, source: SourceKind) -> Result<CycleReport> {
        let adapter = self.adapter_for(source)?;
        let ttl = self.config.dedup.ttl_for(source);
        let report = publish_cycle(adapter.as_ref(), self.gate.as_ref(), self.log.as_ref(), ttl)
            .await
            .with_context(|| format!("publishing {source}"))?;
        Ok(report)
    }

    pub async fn scan_with(&self, source: &dyn FixtureSource) -> Result<ScanReport> {
        let report = scan_fixtures_once(
            source,
            self.gate.as_ref(),
            self.normal.as_ref(),
            &self.index,
            self.config.dedup.ttl_for(SourceKind::Fixture),
            self.config.sources.fixtures.days_ahead,
        )
        .await?;
        Ok(report)
    }

    pub async fn scan_once(&self) -> Result<ScanReport> {
        let source = ApiFootballFixtures::from_config(&self.config.sources.fixtures)?;
        self.scan_with(&source).await
    }

    /// `/health`, `/dead-letters` and, when a recorder is installed, `/metrics`.
    pub fn http_router(&self, metrics: Option<&Metrics>) -> Router {
        let mut router = self
            .health
            .router()
            .merge(deadletter::router(self.dead_letters.clone()));
        if let Some(m) = metrics {
            router = router.merge(m.router());
        }
        router.layer(CorsLayer::very_permissive())
    }

    /// Stop every substrate operation. Components observing it stop as after
    /// a substrate outage.
    pub fn close_substrate(&self) {
        self.substrate.close();
    }

    async fn queued_items(&self) -> usize {
        let mut total = 0;
        for q in [&self.priority, &self.normal] {
            match q.len().await {
                Ok(n) => total += n,
                Err(e) => tracing::warn!(queue = q.name(), error = %e, "queue depth unavailable"),
            }
        }
        total
    }

    /// Keep workers going until both in-process queues are empty, the
    /// workers are gone or the drain timeout passes.
    async fn drain_queues(&self, workers: &[JoinHandle<Result<(), PipelineError>>]) {
        let timeout = Duration::from_secs(self.config.substrate.drain_timeout_secs);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let left = self.queued_items().await;
            if left == 0 {
                return;
            }
            if workers.iter().all(|w| w.is_finished()) || tokio::time::Instant::now() >= deadline {
                tracing::warn!(left, "drain stopped with items queued");
                return;
            }
            tracing::debug!(left, "draining in-process queues");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Dispatcher + worker pool (+ fetchers and fixture scan unless
    /// `no_ingest`) until `shutdown` resolves. Producers and the dispatcher
    /// stop first; with an in-process substrate the workers then drain both
    /// queues, and items still queued make the run fail.
    pub async fn run(
        &self,
        opts: RunOptions,
        metrics: Option<Metrics>,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<()> {
        let (tx, rx) = watch::channel(false);
        // Workers stop last, after producers and the dispatcher.
        let (workers_tx, workers_rx) = watch::channel(false);

        let dispatcher = Arc::new(self.dispatcher()).spawn(rx.clone());
        let workers = Arc::new(self.worker_pool()).spawn(workers_rx);
        let mut background = Vec::new();

        if !opts.no_ingest {
            for source in [SourceKind::Rss, SourceKind::Social, SourceKind::Odds] {
                let Some(interval) = self.source_interval(source) else {
                    continue;
                };
                match self.adapter_for(source) {
                    Ok(adapter) => background.push(spawn_adapter_loop(
                        adapter,
                        self.fetcher_deps(),
                        AdapterLoopCfg {
                            interval,
                            ttl: self.config.dedup.ttl_for(source),
                        },
                        rx.clone(),
                    )),
                    Err(e) => tracing::warn!(source = %source, error = ?e, "fetcher not started"),
                }
            }
            if let Some(interval) = self.source_interval(SourceKind::Fixture) {
                match ApiFootballFixtures::from_config(&self.config.sources.fixtures) {
                    Ok(src) => background.push(spawn_fixture_scan_loop(
                        Arc::new(src),
                        FixtureScanDeps {
                            gate: self.gate.clone(),
                            normal: self.normal.clone(),
                            index: self.index.clone(),
                            health: self.health.clone(),
                            alerts: self.alerts(),
                        },
                        interval,
                        self.config.dedup.ttl_for(SourceKind::Fixture),
                        self.config.sources.fixtures.days_ahead,
                        rx.clone(),
                    )),
                    Err(e) => tracing::warn!(error = ?e, "fixture scan not started"),
                }
            }
            background.push(spawn_health_report(
                self.stats.clone(),
                Duration::from_secs(300),
                rx.clone(),
            ));
        }

        if let Some(bind) = self.config.http.bind.clone() {
            let router = self.http_router(metrics.as_ref());
            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("binding {bind}"))?;
            tracing::info!(addr = %bind, "serving /health and /metrics");
            let mut http_rx = rx.clone();
            background.push(tokio::spawn(async move {
                let stop = async move {
                    let _ = http_rx.wait_for(|stop| *stop).await;
                };
                if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(stop).await {
                    tracing::error!(error = %e, "http server failed");
                }
            }));
        }

        shutdown.await;
        tracing::info!("shutdown requested; finishing in-flight work");
        let _ = tx.send(true);

        let mut failed = false;
        match dispatcher.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "dispatcher ended with error");
                failed = true;
            }
            Err(e) => {
                tracing::error!(error = %e, "dispatcher task panicked");
                failed = true;
            }
        }
        for h in background {
            let _ = h.await;
        }

        if !self.substrate.durable {
            self.drain_queues(&workers).await;
        }
        let _ = workers_tx.send(true);
        for w in workers {
            if !matches!(w.await, Ok(Ok(()))) {
                failed = true;
            }
        }

        if !self.substrate.durable {
            let left = self.queued_items().await;
            if left > 0 {
                tracing::error!(left, "in-process queues not drained; items lost at exit");
                return Err(anyhow!("{left} queued items were not processed before shutdown"));
            }
        }
        if failed || !self.health.is_healthy() {
            return Err(anyhow!("pipeline stopped with failed components"));
        }
        Ok(())
    }
}
