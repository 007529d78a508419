//! Knowledge-base sink: every logged event's text, chunked and stored once
//! per fingerprint, plus a small term-overlap retriever over the in-memory
//! store.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PipelineError;
use crate::event::{Event, EventId, SourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted { chunks: usize },
    AlreadyPresent,
}

/// Idempotent by `Event::fingerprint`. `related` holds the match ids the
/// classifier tied the event to; the event's own `match_id` is always added.
#[async_trait]
pub trait KnowledgeSink: Send + Sync {
    async fn store(&self, event: &Event, related: &BTreeSet<i64>) -> Result<StoreOutcome, PipelineError>;
}

/// Retrieval collaborator used by prediction generation.
pub trait Retriever: Send + Sync {
    fn search(&self, query: &str, limit: usize, match_id: Option<i64>) -> Vec<Fragment>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub fingerprint: String,
    pub event_id: EventId,
    pub source: SourceKind,
    /// Matches this fragment is about; empty when none is known.
    pub match_ids: BTreeSet<i64>,
    pub chunk_index: usize,
    pub text: String,
    pub stored_at: DateTime<Utc>,
}

/// On-disk document for one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeDoc {
    pub fingerprint: String,
    pub event: Event,
    #[serde(default)]
    pub match_ids: BTreeSet<i64>,
    pub chunks: Vec<String>,
    pub stored_at: DateTime<Utc>,
}

/// Split into chunks of at most `max_chars` characters, breaking after
/// sentence ends where possible. Sentences longer than `max_chars` are
/// hard-split.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let max = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut cur = String::new();
    let mut cur_len = 0usize;

    for sentence in sentences(text) {
        let len = sentence.chars().count();
        if len > max {
            if !cur.is_empty() {
                chunks.push(std::mem::take(&mut cur));
                cur_len = 0;
            }
            let chars: Vec<char> = sentence.chars().collect();
            for piece in chars.chunks(max) {
                chunks.push(piece.iter().collect::<String>().trim().to_string());
            }
            continue;
        }
        let sep = usize::from(!cur.is_empty());
        if cur_len + sep + len > max {
            chunks.push(std::mem::take(&mut cur));
            cur_len = 0;
        }
        if !cur.is_empty() {
            cur.push(' ');
            cur_len += 1;
        }
        cur.push_str(sentence);
        cur_len += len;
    }
    if !cur.is_empty() {
        chunks.push(cur);
    }
    chunks.retain(|c| !c.is_empty());
    chunks
}

fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut prev_end = false;
    for (i, ch) in text.char_indices() {
        if prev_end && ch.is_whitespace() {
            let s = text[start..i].trim();
            if !s.is_empty() {
                out.push(s);
            }
            start = i;
        }
        prev_end = matches!(ch, '.' | '!' | '?');
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(|w| w.to_lowercase())
        .collect()
}

fn match_ids(event: &Event, related: &BTreeSet<i64>) -> BTreeSet<i64> {
    let mut ids = related.clone();
    ids.extend(event.match_id);
    ids
}

fn record_insert(event: &Event, chunks: usize) {
    counter!("knowledge_chunks_total", "source" => event.source.as_str()).increment(chunks as u64);
}

// ------------------------------------------------------------
// In-memory store
// ------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryKnowledgeBase {
    chunk_chars: usize,
    docs: RwLock<HashMap<String, Vec<Fragment>>>,
}

impl MemoryKnowledgeBase {
    pub fn new(chunk_chars: usize) -> Self {
        Self {
            chunk_chars,
            docs: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.docs
            .read()
            .map(|d| d.contains_key(fingerprint))
            .unwrap_or(false)
    }
}

#[async_trait]
impl KnowledgeSink for MemoryKnowledgeBase {
    async fn store(&self, event: &Event, related: &BTreeSet<i64>) -> Result<StoreOutcome, PipelineError> {
        let mut docs = self
            .docs
            .write()
            .map_err(|_| PipelineError::Sink("knowledge store poisoned".into()))?;
        if docs.contains_key(&event.fingerprint) {
            return Ok(StoreOutcome::AlreadyPresent);
        }
        let now = Utc::now();
        let ids = match_ids(event, related);
        let fragments: Vec<Fragment> = chunk_text(&event.text(), self.chunk_chars)
            .into_iter()
            .enumerate()
            .map(|(i, text)| Fragment {
                fingerprint: event.fingerprint.clone(),
                event_id: event.id,
                source: event.source,
                match_ids: ids.clone(),
                chunk_index: i,
                text,
                stored_at: now,
            })
            .collect();
        let n = fragments.len();
        docs.insert(event.fingerprint.clone(), fragments);
        drop(docs);
        record_insert(event, n);
        Ok(StoreOutcome::Inserted { chunks: n })
    }
}

impl Retriever for MemoryKnowledgeBase {
    /// Ranked by the number of distinct query terms a fragment contains;
    /// newer events win ties.
    fn search(&self, query: &str, limit: usize, match_id: Option<i64>) -> Vec<Fragment> {
        let q = terms(query);
        if q.is_empty() || limit == 0 {
            return Vec::new();
        }
        let Ok(docs) = self.docs.read() else {
            return Vec::new();
        };
        let mut scored: Vec<(usize, &Fragment)> = docs
            .values()
            .flatten()
            .filter(|f| match_id.map_or(true, |id| f.match_ids.contains(&id)))
            .filter_map(|f| {
                let hits = terms(&f.text).intersection(&q).count();
                (hits > 0).then_some((hits, f))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then(b.1.event_id.cmp(&a.1.event_id))
                .then(a.1.chunk_index.cmp(&b.1.chunk_index))
        });
        scored
            .into_iter()
            .take(limit)
            .map(|(_, f)| f.clone())
            .collect()
    }
}

// ------------------------------------------------------------
// File-backed store
// ------------------------------------------------------------

/// One JSON document per fingerprint under `dir`.
#[derive(Debug, Clone)]
pub struct FileKnowledgeSink {
    dir: PathBuf,
    chunk_chars: usize,
}

impl FileKnowledgeSink {
    pub fn new(dir: impl Into<PathBuf>, chunk_chars: usize) -> Result<Self, PipelineError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, chunk_chars })
    }

    pub fn doc_path(&self, fingerprint: &str) -> PathBuf {
        doc_path(&self.dir, fingerprint)
    }
}

fn doc_path(dir: &Path, fingerprint: &str) -> PathBuf {
    let digest = Sha256::digest(fingerprint.as_bytes());
    let name: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
    dir.join(format!("{name}.json"))
}

fn write_doc(path: &Path, doc: &KnowledgeDoc) -> Result<(), PipelineError> {
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(doc)?;
    let mut f = fs::File::create(&tmp)?;
    f.write_all(&json)?;
    f.sync_all()?;
    fs::rename(tmp, path)?;
    Ok(())
}

#[async_trait]
impl KnowledgeSink for FileKnowledgeSink {
    async fn store(&self, event: &Event, related: &BTreeSet<i64>) -> Result<StoreOutcome, PipelineError> {
        let path = self.doc_path(&event.fingerprint);
        let doc = KnowledgeDoc {
            fingerprint: event.fingerprint.clone(),
            match_ids: match_ids(event, related),
            chunks: chunk_text(&event.text(), self.chunk_chars),
            event: event.clone(),
            stored_at: Utc::now(),
        };
        let outcome = tokio::task::spawn_blocking(move || -> Result<StoreOutcome, PipelineError> {
            match fs::metadata(&path) {
                Ok(_) => return Ok(StoreOutcome::AlreadyPresent),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let n = doc.chunks.len();
            write_doc(&path, &doc)?;
            Ok(StoreOutcome::Inserted { chunks: n })
        })
        .await
        .map_err(|e| PipelineError::Sink(format!("knowledge write task failed: {e}")))??;

        if let StoreOutcome::Inserted { chunks } = outcome {
            record_insert(event, chunks);
        }
        Ok(outcome)
    }
}
