// src/ingest/mod.rs
pub mod dedup;
pub mod providers;
pub mod scheduler;
pub mod terms;
pub mod types;

use std::time::Duration;

use crate::error::PipelineError;
use crate::ingest::dedup::DedupStore;
use crate::ingest::types::SourceAdapter;
use crate::substrate::EventLog;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_events_total", "Items parsed from sources.");
        describe_counter!("ingest_published_total", "Events appended to the log.");
        describe_counter!(
            "ingest_duplicates_total",
            "Events skipped by the dedup gate."
        );
        describe_counter!(
            "ingest_item_errors_total",
            "Per-item normalization/fetch failures."
        );
        describe_counter!(
            "ingest_source_errors_total",
            "Whole-source poll failures."
        );
        describe_counter!("ingest_feed_errors_total", "RSS feed fetch failures by feed.");
        describe_counter!("ingest_runs_total", "Scheduled fetcher runs by source.");
        describe_histogram!("ingest_parse_ms", "Source parse time in milliseconds.");
        describe_gauge!(
            "ingest_last_run_ts",
            "Unix ts when a source was last polled."
        );
    });
}

/// Normalize text: decode entities, strip tags, collapse whitespace, cap length.
pub fn normalize_text(s: &str, max_chars: usize) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, " ").to_string();

    // 3) Fold typographic quotes to ASCII
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 5) Length cap
    if out.chars().count() > max_chars {
        out = out.chars().take(max_chars).collect::<String>().trim_end().to_string();
    }

    out
}

/// Lowercased scheme/host, no query string or fragment, no trailing slash.
pub fn canonical_url(url: &str) -> String {
    let trimmed = url.trim();
    let cut = trimmed
        .find(['?', '#'])
        .map(|i| &trimmed[..i])
        .unwrap_or(trimmed);
    let cut = cut.trim_end_matches('/');
    match cut.find("://") {
        Some(i) => {
            let (scheme, rest) = cut.split_at(i + 3);
            let (host, path) = rest.split_at(rest.find('/').unwrap_or(rest.len()));
            format!("{}{}{}", scheme.to_ascii_lowercase(), host.to_ascii_lowercase(), path)
        }
        None => cut.to_string(),
    }
}

/// Short content hash for items without a stable id.
pub fn content_hash(parts: &[&str]) -> String {
    let mut h = Sha256::new();
    for p in parts {
        h.update(p.as_bytes());
        h.update([0u8]);
    }
    let digest = h.finalize();
    digest[..12].iter().map(|b| format!("{b:02x}")).collect()
}

/// Outcome of one `publish_cycle`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub published: usize,
    pub duplicates: usize,
    pub item_errors: usize,
    /// Set when the whole poll failed.
    pub source_error: Option<String>,
}

/// Poll one adapter, push every event through the dedup gate and append the
/// new ones to the log.
///
/// Source failures are reported in the returned [`CycleReport`]; only a
/// substrate failure returns `Err`.
pub async fn publish_cycle(
    adapter: &dyn SourceAdapter,
    gate: &dyn DedupStore,
    log: &dyn EventLog,
    ttl: Duration,
) -> Result<CycleReport, PipelineError> {
    ensure_metrics_described();
    let source = adapter.source();
    let mut report = CycleReport::default();

    let batch = match adapter.poll().await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = ?e, source = %source, adapter = adapter.name(), "source poll failed");
            counter!("ingest_source_errors_total", "source" => source.as_str()).increment(1);
            report.source_error = Some(format!("{e:#}"));
            return Ok(report);
        }
    };

    report.fetched = batch.events.len();
    report.item_errors = batch.item_errors.len();
    for err in &batch.item_errors {
        tracing::warn!(source = %source, adapter = adapter.name(), error = %err, "item skipped");
    }
    counter!("ingest_events_total", "source" => source.as_str()).increment(report.fetched as u64);
    counter!("ingest_item_errors_total", "source" => source.as_str())
        .increment(report.item_errors as u64);

    for ev in batch.events {
        if !gate.check_and_mark(&ev.fingerprint, ttl).await? {
            report.duplicates += 1;
            continue;
        }
        let fingerprint = ev.fingerprint.clone();
        match log.append(ev).await {
            Ok(logged) => {
                tracing::debug!(id = %logged.id, source = %source, fingerprint = %fingerprint, "published");
                report.published += 1;
            }
            Err(e) => {
                // Roll back so the next cycle can publish it.
                if let Err(re) = gate.release(&fingerprint).await {
                    tracing::warn!(error = %re, fingerprint = %fingerprint, "dedup release failed");
                }
                return Err(e);
            }
        }
    }

    counter!("ingest_published_total", "source" => source.as_str())
        .increment(report.published as u64);
    counter!("ingest_duplicates_total", "source" => source.as_str())
        .increment(report.duplicates as u64);
    gauge!("ingest_last_run_ts", "source" => source.as_str())
        .set(chrono::Utc::now().timestamp() as f64);

    tracing::info!(
        target: "ingest",
        source = %source,
        fetched = report.fetched,
        published = report.published,
        duplicates = report.duplicates,
        item_errors = report.item_errors,
        "publish cycle"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_decodes_strips_and_collapses() {
        let s = "  <p>Saka&nbsp;&nbsp; ruled <b>out</b></p>\n\n “hamstring” ";
        assert_eq!(normalize_text(s, 500), "Saka ruled out \"hamstring\"");
    }

    #[test]
    fn normalize_text_caps_length() {
        let s = "a".repeat(50);
        assert_eq!(normalize_text(&s, 10).len(), 10);
    }

    #[test]
    fn canonical_url_drops_query_and_fragment() {
        assert_eq!(
            canonical_url("HTTPS://Www.BBC.co.uk/sport/football/123/?at_medium=rss#top"),
            "https://www.bbc.co.uk/sport/football/123"
        );
    }

    #[test]
    fn content_hash_is_stable_and_separator_aware() {
        assert_eq!(content_hash(&["a", "b"]), content_hash(&["a", "b"]));
        assert_ne!(content_hash(&["ab", ""]), content_hash(&["a", "b"]));
        assert_eq!(content_hash(&["x"]).len(), 24);
    }
}
