// tests/config_env.rs
//
// Config precedence: built-in defaults < TOML file < environment.

use std::io::Write;
use std::time::Duration;

use matchday_pulse::config::SubstrateBackend;
use matchday_pulse::{PipelineConfig, SourceKind};
use serial_test::serial;

const TOUCHED: &[&str] = &[
    "PIPELINE_CONFIG_PATH",
    "WORKER_COUNT",
    "MAX_ITEM_RETRIES",
    "IMPORTANCE_HIGH_THRESHOLD",
    "IMPORTANCE_MID_THRESHOLD",
    "CLASSIFIER_TIMEOUT_MS",
    "DEDUP_TTL_ODDS_SECS",
    "PROCESSOR_ENDPOINT",
    "HTTP_BIND",
    "LOG_RETENTION_SECS",
    "SINK_TIMEOUT_SECS",
    "SUBSTRATE_BACKEND",
    "SUBSTRATE_PATH",
];

fn clear_env() {
    for k in TOUCHED {
        std::env::remove_var(k);
    }
}

fn write_config(body: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("tempfile");
    f.write_all(body.as_bytes()).expect("write");
    f
}

#[test]
#[serial]
fn file_values_override_defaults() {
    clear_env();
    let f = write_config(
        r#"
        [worker]
        count = 2
        max_item_retries = 5

        [classifier]
        provider = "mock"
        timeout_ms = 2500

        [dedup]
        odds_secs = 60
        "#,
    );
    let cfg = PipelineConfig::load_from(f.path()).unwrap();
    assert_eq!(cfg.worker.count, 2);
    assert_eq!(cfg.worker.max_item_retries, 5);
    assert_eq!(cfg.classifier.provider, "mock");
    assert_eq!(cfg.classifier.timeout_ms, 2500);
    assert_eq!(cfg.dedup.ttl_for(SourceKind::Odds), Duration::from_secs(60));
    assert_eq!(cfg.classifier.high_threshold, 7);
}

#[test]
#[serial]
fn environment_wins_over_the_file() {
    clear_env();
    let f = write_config(
        r#"
        [worker]
        count = 2
        "#,
    );
    std::env::set_var("WORKER_COUNT", "9");
    std::env::set_var("IMPORTANCE_HIGH_THRESHOLD", "8");
    std::env::set_var("PROCESSOR_ENDPOINT", "http://localhost:9000/process");
    let cfg = PipelineConfig::load_from(f.path()).unwrap();
    clear_env();

    assert_eq!(cfg.worker.count, 9);
    assert_eq!(cfg.classifier.high_threshold, 8);
    assert_eq!(
        cfg.processor.endpoint.as_deref(),
        Some("http://localhost:9000/process")
    );
}

#[test]
#[serial]
fn unparsable_env_value_is_a_config_error() {
    clear_env();
    std::env::set_var("MAX_ITEM_RETRIES", "three");
    let err = PipelineConfig::load_default(None).unwrap_err();
    clear_env();
    assert!(format!("{err:#}").contains("MAX_ITEM_RETRIES"));
}

#[test]
#[serial]
fn inverted_thresholds_are_rejected() {
    clear_env();
    std::env::set_var("IMPORTANCE_HIGH_THRESHOLD", "3");
    std::env::set_var("IMPORTANCE_MID_THRESHOLD", "6");
    let res = PipelineConfig::load_default(None);
    clear_env();
    assert!(res.is_err());
}

#[test]
#[serial]
fn config_path_from_env_must_exist() {
    clear_env();
    std::env::set_var("PIPELINE_CONFIG_PATH", "/definitely/not/here.toml");
    let res = PipelineConfig::load_default(None);
    clear_env();
    assert!(res.is_err());
}

#[test]
#[serial]
fn zero_workers_fail_validation() {
    clear_env();
    let f = write_config("[worker]\ncount = 0\n");
    assert!(PipelineConfig::load_from(f.path()).is_err());
}

#[test]
#[serial]
fn zero_retention_is_rejected() {
    clear_env();
    std::env::set_var("LOG_RETENTION_SECS", "0");
    let err = PipelineConfig::load_default(None).unwrap_err();
    clear_env();
    assert!(format!("{err:#}").contains("log.retention_secs"));
}

#[test]
#[serial]
fn zero_sink_timeout_is_rejected() {
    clear_env();
    std::env::set_var("SINK_TIMEOUT_SECS", "0");
    let err = PipelineConfig::load_default(None).unwrap_err();
    clear_env();
    assert!(format!("{err:#}").contains("log.sink_timeout_secs"));
}

#[test]
#[serial]
fn retention_must_outlast_the_visibility_timeout() {
    clear_env();
    let f = write_config("[log]\nvisibility_timeout_secs = 120\nretention_secs = 120\n");
    let err = PipelineConfig::load_from(f.path()).unwrap_err();
    assert!(format!("{err:#}").contains("must exceed log.visibility_timeout_secs"));

    let f = write_config("[log]\nvisibility_timeout_secs = 120\nretention_secs = 121\n");
    assert!(PipelineConfig::load_from(f.path()).is_ok());
}

#[test]
#[serial]
fn substrate_backend_comes_from_the_environment() {
    clear_env();
    let cfg = PipelineConfig::load_default(None).unwrap();
    assert_eq!(cfg.substrate.backend, SubstrateBackend::Sqlite);

    std::env::set_var("SUBSTRATE_BACKEND", "memory");
    std::env::set_var("SUBSTRATE_PATH", "/var/lib/pulse/pulse.db");
    let cfg = PipelineConfig::load_default(None).unwrap();
    clear_env();
    assert_eq!(cfg.substrate.backend, SubstrateBackend::Memory);
    assert_eq!(cfg.substrate.path, std::path::PathBuf::from("/var/lib/pulse/pulse.db"));

    std::env::set_var("SUBSTRATE_BACKEND", "redis");
    let err = PipelineConfig::load_default(None).unwrap_err();
    clear_env();
    assert!(format!("{err:#}").contains("SUBSTRATE_BACKEND"));
}
