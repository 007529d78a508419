// src/config/mod.rs
//! Pipeline configuration: TOML file, then environment overrides, then validation.

pub mod classifier;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub use classifier::ClassifierConfig;

use crate::error::PipelineError;
use crate::event::SourceKind;

const ENV_PATH: &str = "PIPELINE_CONFIG_PATH";
const DEFAULT_PATH: &str = "config/pipeline.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub classifier: ClassifierConfig,
    pub queues: QueueConfig,
    pub dedup: DedupConfig,
    pub log: LogConfig,
    pub worker: WorkerConfig,
    pub sources: SourcesConfig,
    pub processor: ProcessorConfig,
    pub knowledge: KnowledgeConfig,
    pub alerts: AlertConfig,
    pub http: HttpConfig,
    pub substrate: SubstrateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub priority: String,
    pub normal: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priority: "queue:priority".into(),
            normal: "queue:normal".into(),
        }
    }
}

/// Dedup record lifetime per source, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub rss_secs: u64,
    pub social_secs: u64,
    pub odds_secs: u64,
    pub fixture_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            rss_secs: 7 * 24 * 3600,
            social_secs: 2 * 24 * 3600,
            odds_secs: 6 * 3600,
            fixture_secs: 24 * 3600,
        }
    }
}

impl DedupConfig {
    pub fn ttl_for(&self, source: SourceKind) -> Duration {
        let secs = match source {
            SourceKind::Rss => self.rss_secs,
            SourceKind::Social => self.social_secs,
            SourceKind::Odds => self.odds_secs,
            SourceKind::Fixture => self.fixture_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub consumer_group: String,
    pub consumer_name: String,
    pub visibility_timeout_secs: u64,
    pub retention_secs: u64,
    pub block_ms: u64,
    pub batch_size: usize,
    /// Bound on a single knowledge-base write.
    pub sink_timeout_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            consumer_group: "dispatchers".into(),
            consumer_name: "dispatcher-1".into(),
            visibility_timeout_secs: 60,
            retention_secs: 3 * 24 * 3600,
            block_ms: 2_000,
            batch_size: 16,
            sink_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub count: usize,
    pub poll_interval_ms: u64,
    pub max_item_retries: u32,
    pub process_timeout_secs: u64,
    pub dead_letter_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            poll_interval_ms: 1_000,
            max_item_retries: 3,
            process_timeout_secs: 300,
            dead_letter_capacity: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub rss: RssSourceConfig,
    pub social: SocialSourceConfig,
    pub odds: OddsSourceConfig,
    pub fixtures: FixtureScanConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RssSourceConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub feeds: Vec<FeedConfig>,
    pub max_items_per_feed: usize,
    pub fetch_full_article: bool,
    pub max_chars: usize,
}

impl Default for RssSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 15 * 60,
            feeds: vec![
                FeedConfig {
                    name: "football_main".into(),
                    url: "https://feeds.bbci.co.uk/sport/football/rss.xml".into(),
                },
                FeedConfig {
                    name: "football_premier_league".into(),
                    url: "https://feeds.bbci.co.uk/sport/football/premier-league/rss.xml".into(),
                },
            ],
            max_items_per_feed: 10,
            fetch_full_article: false,
            max_chars: 8_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocialSourceConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub base_url: String,
    pub expert_accounts: Vec<String>,
    pub keywords: Vec<String>,
    pub hours_back: u32,
    pub max_keyword_results: usize,
    /// Per-author reliability in 0..=1; unknown authors get `default_reliability`.
    pub reliability: BTreeMap<String, f64>,
    pub default_reliability: f64,
}

impl Default for SocialSourceConfig {
    fn default() -> Self {
        let reliability = [
            ("OptaJoe", 0.95),
            ("FabrizioRomano", 0.92),
            ("ESPN_FC", 0.90),
            ("SkySportsNews", 0.88),
            ("TheAthleticFC", 0.88),
            ("BBCSport", 0.85),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect::<BTreeMap<_, _>>();
        Self {
            enabled: true,
            interval_secs: 5 * 60,
            base_url: "https://api.twitterapi.io".into(),
            expert_accounts: reliability.keys().cloned().collect(),
            keywords: ["#PremierLeague", "#UCL", "#transfer", "#injury", "#TeamNews"]
                .into_iter()
                .map(String::from)
                .collect(),
            hours_back: 2,
            max_keyword_results: 50,
            reliability,
            default_reliability: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OddsSourceConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub base_url: String,
    pub sports: Vec<String>,
    pub regions: String,
    pub markets: String,
    /// Minimum relative price move that produces an event.
    pub min_move: f64,
}

impl Default for OddsSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10 * 60,
            base_url: "https://api.the-odds-api.com/v4".into(),
            sports: vec!["soccer_epl".into(), "soccer_uefa_champs_league".into()],
            regions: "eu".into(),
            markets: "h2h".into(),
            min_move: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureScanConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub base_url: String,
    pub leagues: Vec<i64>,
    pub days_ahead: u32,
}

impl Default for FixtureScanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 6 * 3600,
            base_url: "https://v3.football.api-sports.io".into(),
            leagues: vec![39, 140, 78, 61, 135, 2, 3],
            days_ahead: 7,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// When unset, matches are only logged.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// When unset, the knowledge base lives in memory.
    pub dir: Option<PathBuf>,
    pub chunk_chars: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            dir: None,
            chunk_chars: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub cooldown_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstrateBackend {
    /// Gone with the process; `run` drains the queues before it returns.
    Memory,
    #[default]
    Sqlite,
}

impl FromStr for SubstrateBackend {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(PipelineError::Config(format!(
                "unknown substrate backend '{other}' (expected memory or sqlite)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubstrateConfig {
    pub backend: SubstrateBackend,
    /// SQLite database file shared by every process of a deployment.
    pub path: PathBuf,
    /// How long `run` keeps workers going after shutdown to empty in-process queues.
    pub drain_timeout_secs: u64,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            backend: SubstrateBackend::Sqlite,
            path: PathBuf::from("data/matchday-pulse.db"),
            drain_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// e.g. "0.0.0.0:8080". Health/metrics are only served when set.
    pub bind: Option<String>,
}

impl PipelineConfig {
    /// Load from an explicit TOML path, apply env overrides, validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        let cfg: PipelineConfig = toml::from_str(&content)
            .with_context(|| format!("parsing pipeline config {}", path.display()))?;
        cfg.finish()
    }

    /// Load using env var + fallbacks:
    /// 1) explicit path (CLI)
    /// 2) $PIPELINE_CONFIG_PATH
    /// 3) config/pipeline.toml
    /// 4) built-in defaults
    pub fn load_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p);
        }
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_PATH} points to non-existent path"));
        }
        let default_p = PathBuf::from(DEFAULT_PATH);
        if default_p.exists() {
            return Self::load_from(&default_p);
        }
        PipelineConfig::default().finish()
    }

    fn finish(mut self) -> Result<Self> {
        self.apply_env_overrides()?;
        self.classifier.normalize();
        self.validate()?;
        Ok(self)
    }

    /// Environment wins over the file.
    pub fn apply_env_overrides(&mut self) -> Result<(), PipelineError> {
        let c = &mut self.classifier;
        set_from_env("CLASSIFIER_TIMEOUT_MS", &mut c.timeout_ms)?;
        set_from_env("CLASSIFIER_MAX_RETRIES", &mut c.max_retries)?;
        set_from_env("CLASSIFIER_BACKOFF_MS", &mut c.backoff_ms)?;
        set_from_env("IMPORTANCE_HIGH_THRESHOLD", &mut c.high_threshold)?;
        set_from_env("IMPORTANCE_MID_THRESHOLD", &mut c.mid_threshold)?;
        set_from_env("CLASSIFIER_PROVIDER", &mut c.provider)?;
        set_from_env("CLASSIFIER_MODEL", &mut c.model)?;
        set_from_env("CLASSIFIER_BASE_URL", &mut c.base_url)?;

        set_from_env("PRIORITY_QUEUE_NAME", &mut self.queues.priority)?;
        set_from_env("NORMAL_QUEUE_NAME", &mut self.queues.normal)?;

        set_from_env("DEDUP_TTL_RSS_SECS", &mut self.dedup.rss_secs)?;
        set_from_env("DEDUP_TTL_SOCIAL_SECS", &mut self.dedup.social_secs)?;
        set_from_env("DEDUP_TTL_ODDS_SECS", &mut self.dedup.odds_secs)?;
        set_from_env("DEDUP_TTL_FIXTURE_SECS", &mut self.dedup.fixture_secs)?;

        set_from_env("WORKER_COUNT", &mut self.worker.count)?;
        set_from_env("WORKER_POLL_INTERVAL_MS", &mut self.worker.poll_interval_ms)?;
        set_from_env("MAX_ITEM_RETRIES", &mut self.worker.max_item_retries)?;
        set_from_env("PROCESS_TIMEOUT_SECS", &mut self.worker.process_timeout_secs)?;

        set_from_env("CONSUMER_GROUP", &mut self.log.consumer_group)?;
        set_from_env("VISIBILITY_TIMEOUT_SECS", &mut self.log.visibility_timeout_secs)?;
        set_from_env("LOG_RETENTION_SECS", &mut self.log.retention_secs)?;
        set_from_env("SINK_TIMEOUT_SECS", &mut self.log.sink_timeout_secs)?;

        set_from_env("SUBSTRATE_BACKEND", &mut self.substrate.backend)?;
        if let Some(path) = env_nonempty("SUBSTRATE_PATH") {
            self.substrate.path = PathBuf::from(path);
        }
        set_from_env("SUBSTRATE_DRAIN_TIMEOUT_SECS", &mut self.substrate.drain_timeout_secs)?;

        set_opt_from_env("PROCESSOR_ENDPOINT", &mut self.processor.endpoint);
        if let Some(dir) = env_nonempty("KNOWLEDGE_DIR") {
            self.knowledge.dir = Some(PathBuf::from(dir));
        }
        set_opt_from_env("HTTP_BIND", &mut self.http.bind);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        self.classifier.validate()?;
        let positive = [
            ("worker.count", self.worker.count as u64),
            ("worker.max_item_retries", self.worker.max_item_retries as u64),
            ("worker.poll_interval_ms", self.worker.poll_interval_ms),
            ("worker.process_timeout_secs", self.worker.process_timeout_secs),
            ("log.batch_size", self.log.batch_size as u64),
            ("log.visibility_timeout_secs", self.log.visibility_timeout_secs),
            ("log.retention_secs", self.log.retention_secs),
            ("log.sink_timeout_secs", self.log.sink_timeout_secs),
            ("knowledge.chunk_chars", self.knowledge.chunk_chars as u64),
        ];
        for (name, v) in positive {
            if v == 0 {
                return Err(PipelineError::Config(format!("{name} must be at least 1")));
            }
        }
        if self.queues.priority.trim().is_empty()
            || self.queues.normal.trim().is_empty()
            || self.queues.priority == self.queues.normal
        {
            return Err(PipelineError::Config(
                "priority and normal queue names must be distinct and non-empty".into(),
            ));
        }
        if self.log.consumer_group.trim().is_empty() {
            return Err(PipelineError::Config("consumer group must be set".into()));
        }
        // Entries must outlive at least one redelivery window.
        if self.log.retention_secs <= self.log.visibility_timeout_secs {
            return Err(PipelineError::Config(format!(
                "log.retention_secs ({}) must exceed log.visibility_timeout_secs ({})",
                self.log.retention_secs, self.log.visibility_timeout_secs
            )));
        }
        if self.substrate.backend == SubstrateBackend::Sqlite
            && self.substrate.path.as_os_str().is_empty()
        {
            return Err(PipelineError::Config("substrate.path must be set for sqlite".into()));
        }
        Ok(())
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms)
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.process_timeout_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.log.visibility_timeout_secs)
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn set_from_env<T: FromStr>(key: &str, slot: &mut T) -> Result<(), PipelineError> {
    if let Some(raw) = env_nonempty(key) {
        *slot = raw
            .parse()
            .map_err(|_| PipelineError::Config(format!("{key}: cannot parse '{raw}'")))?;
    }
    Ok(())
}

fn set_opt_from_env(key: &str, slot: &mut Option<String>) {
    if let Some(raw) = env_nonempty(key) {
        *slot = Some(raw);
    }
}
