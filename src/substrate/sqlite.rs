//! SQLite-backed substrate.
//!
//! One database file holds the log, both queues, the dedup marks and the dead
//! letters, so a long-running `run` and the one-shot CLI commands share them
//! and nothing queued is lost on restart. Timestamps are wall-clock
//! milliseconds, since other processes read them too.
//!
//! Every multi-statement operation runs in one transaction whose first
//! statement writes, so it holds the write lock from the start.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, gauge};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Delivery, EventLog, QueueItem, WorkQueue};
use crate::deadletter::{DeadLetter, DeadLetterStore};
use crate::error::PipelineError;
use crate::event::{Event, EventId, NewEvent};
use crate::ingest::dedup::DedupStore;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS log_entries (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        body        TEXT    NOT NULL,
        appended_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS log_groups (
        name   TEXT    PRIMARY KEY,
        cursor INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS log_pending (
        grp          TEXT    NOT NULL,
        id           INTEGER NOT NULL,
        consumer     TEXT    NOT NULL,
        delivered_at INTEGER NOT NULL,
        deliveries   INTEGER NOT NULL,
        PRIMARY KEY (grp, id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue_items (
        seq   INTEGER PRIMARY KEY AUTOINCREMENT,
        queue TEXT    NOT NULL,
        body  TEXT    NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS queue_items_by_queue ON queue_items (queue, seq)",
    r#"
    CREATE TABLE IF NOT EXISTS dedup_marks (
        fingerprint TEXT    PRIMARY KEY,
        expires_at  INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dead_letters (
        seq      INTEGER PRIMARY KEY AUTOINCREMENT,
        match_id INTEGER NOT NULL,
        body     TEXT    NOT NULL
    )
    "#,
];

/// Appends from other processes are noticed within this interval.
const CROSS_PROCESS_POLL: Duration = Duration::from_millis(200);

/// Expired dedup marks are swept on every Nth mark.
const DEDUP_SWEEP_EVERY: u64 = 256;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn db_err(resource: &str) -> impl Fn(sqlx::Error) -> PipelineError + '_ {
    move |e| PipelineError::unavailable(format!("{resource}: {e}"))
}

/// Shared handle to one database file.
#[derive(Clone)]
pub struct SqliteSubstrate {
    pool: SqlitePool,
    appended: Arc<Notify>,
    visibility_timeout: Duration,
    retention: Duration,
}

impl SqliteSubstrate {
    /// Open (creating if missing) the database at `path` and its schema.
    pub async fn open(
        path: &Path,
        visibility_timeout: Duration,
        retention: Duration,
    ) -> Result<Self, PipelineError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(db_err("sqlite open"))?;
        for stmt in SCHEMA {
            sqlx::query(*stmt)
                .execute(&pool)
                .await
                .map_err(db_err("sqlite schema"))?;
        }
        tracing::info!(path = %path.display(), "sqlite substrate ready");
        Ok(Self {
            pool,
            appended: Arc::new(Notify::new()),
            visibility_timeout,
            retention,
        })
    }

    pub fn event_log(&self) -> SqliteEventLog {
        SqliteEventLog {
            db: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn queue(&self, name: impl Into<String>) -> SqliteQueue {
        SqliteQueue {
            db: self.clone(),
            name: name.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn dedup_store(&self) -> SqliteDedupStore {
        SqliteDedupStore {
            db: self.clone(),
            marks: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn dead_letters(&self) -> SqliteDeadLetters {
        SqliteDeadLetters {
            db: self.clone(),
            closed: AtomicBool::new(false),
        }
    }
}

fn checked<'a>(
    db: &'a SqliteSubstrate,
    closed: &AtomicBool,
    resource: &str,
) -> Result<&'a SqlitePool, PipelineError> {
    if closed.load(Ordering::Acquire) {
        return Err(PipelineError::unavailable(resource));
    }
    Ok(&db.pool)
}

fn decode_event(id: i64, body: &str) -> Option<Event> {
    match serde_json::from_str(body) {
        Ok(ev) => Some(ev),
        Err(e) => {
            tracing::error!(id, error = %e, "undecodable log entry dropped");
            counter!("log_corrupt_entries_total").increment(1);
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

const LOG: &str = "event log";

pub struct SqliteEventLog {
    db: SqliteSubstrate,
    closed: AtomicBool,
}

impl SqliteEventLog {
    fn pool(&self) -> Result<&SqlitePool, PipelineError> {
        checked(&self.db, &self.closed, LOG)
    }

    async fn report_len(&self, pool: &SqlitePool) {
        if let Ok((n,)) = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM log_entries")
            .fetch_one(pool)
            .await
        {
            gauge!("log_entries").set(n as f64);
        }
    }

    /// Claim expired pendings, then fresh entries past the group cursor.
    async fn take_ready(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<Delivery>, PipelineError> {
        let pool = self.pool()?;
        let err = db_err(LOG);
        let now = now_ms();
        let limit = i64::try_from(count).unwrap_or(i64::MAX);
        let mut tx = pool.begin().await.map_err(&err)?;

        sqlx::query("INSERT INTO log_groups (name, cursor) VALUES (?, 0) ON CONFLICT(name) DO NOTHING")
            .bind(group)
            .execute(&mut *tx)
            .await
            .map_err(&err)?;

        // Retention horizon: entries and their pendings go together.
        let horizon = now.saturating_sub(millis(self.db.retention));
        sqlx::query(
            "DELETE FROM log_pending WHERE id IN (SELECT id FROM log_entries WHERE appended_at <= ?)",
        )
        .bind(horizon)
        .execute(&mut *tx)
        .await
        .map_err(&err)?;
        sqlx::query("DELETE FROM log_entries WHERE appended_at <= ?")
            .bind(horizon)
            .execute(&mut *tx)
            .await
            .map_err(&err)?;

        let mut out = Vec::new();

        let visible_before = now.saturating_sub(millis(self.db.visibility_timeout));
        let expired = sqlx::query_as::<_, (i64, i64, String)>(
            r#"
            SELECT p.id, p.deliveries, e.body
            FROM log_pending p JOIN log_entries e ON e.id = p.id
            WHERE p.grp = ? AND p.delivered_at <= ?
            ORDER BY p.id ASC
            LIMIT ?
            "#,
        )
        .bind(group)
        .bind(visible_before)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(&err)?;
        for (id, deliveries, body) in expired {
            let Some(event) = decode_event(id, &body) else {
                sqlx::query("DELETE FROM log_pending WHERE grp = ? AND id = ?")
                    .bind(group)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .map_err(&err)?;
                continue;
            };
            sqlx::query(
                "UPDATE log_pending SET consumer = ?, delivered_at = ?, deliveries = deliveries + 1 WHERE grp = ? AND id = ?",
            )
            .bind(consumer)
            .bind(now)
            .bind(group)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(&err)?;
            out.push(Delivery {
                event,
                attempt: u32::try_from(deliveries + 1).unwrap_or(u32::MAX),
            });
        }

        let room = limit - out.len() as i64;
        if room > 0 {
            let (cursor,): (i64,) = sqlx::query_as("SELECT cursor FROM log_groups WHERE name = ?")
                .bind(group)
                .fetch_one(&mut *tx)
                .await
                .map_err(&err)?;
            let fresh = sqlx::query_as::<_, (i64, String)>(
                "SELECT id, body FROM log_entries WHERE id > ? ORDER BY id ASC LIMIT ?",
            )
            .bind(cursor)
            .bind(room)
            .fetch_all(&mut *tx)
            .await
            .map_err(&err)?;
            let mut last = cursor;
            for (id, body) in fresh {
                last = id;
                let Some(event) = decode_event(id, &body) else {
                    continue;
                };
                sqlx::query(
                    "INSERT INTO log_pending (grp, id, consumer, delivered_at, deliveries) VALUES (?, ?, ?, ?, 1)",
                )
                .bind(group)
                .bind(id)
                .bind(consumer)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(&err)?;
                out.push(Delivery { event, attempt: 1 });
            }
            if last > cursor {
                sqlx::query("UPDATE log_groups SET cursor = ? WHERE name = ?")
                    .bind(last)
                    .bind(group)
                    .execute(&mut *tx)
                    .await
                    .map_err(&err)?;
            }
        }

        tx.commit().await.map_err(&err)?;
        Ok(out)
    }
}

#[async_trait]
impl EventLog for SqliteEventLog {
    async fn append(&self, event: NewEvent) -> Result<Event, PipelineError> {
        let pool = self.pool()?;
        let err = db_err(LOG);
        let mut tx = pool.begin().await.map_err(&err)?;
        let (id,): (i64,) =
            sqlx::query_as("INSERT INTO log_entries (body, appended_at) VALUES ('', ?) RETURNING id")
                .bind(now_ms())
                .fetch_one(&mut *tx)
                .await
                .map_err(&err)?;
        let ev = Event::from_new(EventId(id as u64), event);
        sqlx::query("UPDATE log_entries SET body = ? WHERE id = ?")
            .bind(serde_json::to_string(&ev)?)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(&err)?;
        tx.commit().await.map_err(&err)?;

        self.db.appended.notify_waiters();
        self.report_len(pool).await;
        Ok(ev)
    }

    async fn ensure_group(&self, group: &str) -> Result<(), PipelineError> {
        sqlx::query("INSERT INTO log_groups (name, cursor) VALUES (?, 0) ON CONFLICT(name) DO NOTHING")
            .bind(group)
            .execute(self.pool()?)
            .await
            .map_err(db_err(LOG))?;
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, PipelineError> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.db.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready = self.take_ready(group, consumer, count.max(1)).await?;
            if !ready.is_empty() {
                return Ok(ready);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Local appends wake us at once; other processes' appends on the next poll.
            let _ = tokio::time::timeout((deadline - now).min(CROSS_PROCESS_POLL), notified).await;
        }
    }

    async fn ack(&self, group: &str, id: EventId) -> Result<bool, PipelineError> {
        let pool = self.pool()?;
        let err = db_err(LOG);
        let id = id.0 as i64;
        let mut tx = pool.begin().await.map_err(&err)?;
        let removed = sqlx::query("DELETE FROM log_pending WHERE grp = ? AND id = ?")
            .bind(group)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(&err)?
            .rows_affected()
            > 0;
        if removed {
            // Collect once every group moved past the entry and none holds it.
            sqlx::query(
                r#"
                DELETE FROM log_entries
                WHERE id = ?
                  AND NOT EXISTS (SELECT 1 FROM log_groups WHERE cursor < ?)
                  AND NOT EXISTS (SELECT 1 FROM log_pending WHERE id = ?)
                "#,
            )
            .bind(id)
            .bind(id)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(&err)?;
        }
        tx.commit().await.map_err(&err)?;
        if removed {
            self.report_len(pool).await;
        }
        Ok(removed)
    }

    async fn pending(&self, group: &str) -> Result<usize, PipelineError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM log_pending WHERE grp = ?")
            .bind(group)
            .fetch_one(self.pool()?)
            .await
            .map_err(db_err(LOG))?;
        Ok(n as usize)
    }

    async fn len(&self) -> Result<usize, PipelineError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM log_entries")
            .fetch_one(self.pool()?)
            .await
            .map_err(db_err(LOG))?;
        Ok(n as usize)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.db.appended.notify_waiters();
    }
}

// ---------------------------------------------------------------------------
// Work queues
// ---------------------------------------------------------------------------

pub struct SqliteQueue {
    db: SqliteSubstrate,
    name: String,
    closed: AtomicBool,
}

impl SqliteQueue {
    fn pool(&self) -> Result<&SqlitePool, PipelineError> {
        checked(&self.db, &self.closed, &self.name)
    }
}

#[async_trait]
impl WorkQueue for SqliteQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, item: QueueItem) -> Result<(), PipelineError> {
        sqlx::query("INSERT INTO queue_items (queue, body) VALUES (?, ?)")
            .bind(&self.name)
            .bind(serde_json::to_string(&item)?)
            .execute(self.pool()?)
            .await
            .map_err(db_err(&self.name))?;
        Ok(())
    }

    async fn try_pop(&self) -> Result<Option<QueueItem>, PipelineError> {
        let pool = self.pool()?;
        loop {
            let row: Option<(i64, String)> = sqlx::query_as(
                r#"
                DELETE FROM queue_items
                WHERE seq = (SELECT seq FROM queue_items WHERE queue = ? ORDER BY seq ASC LIMIT 1)
                RETURNING seq, body
                "#,
            )
            .bind(&self.name)
            .fetch_optional(pool)
            .await
            .map_err(db_err(&self.name))?;
            let Some((seq, body)) = row else {
                return Ok(None);
            };
            match serde_json::from_str(&body) {
                Ok(item) => return Ok(Some(item)),
                Err(e) => {
                    tracing::error!(queue = %self.name, seq, error = %e, body = %body, "undecodable queue item dropped");
                }
            }
        }
    }

    async fn len(&self) -> Result<usize, PipelineError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_items WHERE queue = ?")
            .bind(&self.name)
            .fetch_one(self.pool()?)
            .await
            .map_err(db_err(&self.name))?;
        Ok(n as usize)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Dedup marks
// ---------------------------------------------------------------------------

const DEDUP: &str = "dedup store";

pub struct SqliteDedupStore {
    db: SqliteSubstrate,
    marks: AtomicU64,
    closed: AtomicBool,
}

#[async_trait]
impl DedupStore for SqliteDedupStore {
    async fn check_and_mark(&self, fingerprint: &str, ttl: Duration) -> Result<bool, PipelineError> {
        let pool = checked(&self.db, &self.closed, DEDUP)?;
        let now = now_ms();
        if self.marks.fetch_add(1, Ordering::Relaxed) % DEDUP_SWEEP_EVERY == DEDUP_SWEEP_EVERY - 1 {
            sqlx::query("DELETE FROM dedup_marks WHERE expires_at <= ?")
                .bind(now)
                .execute(pool)
                .await
                .map_err(db_err(DEDUP))?;
        }
        // Inserts a new mark or revives an expired one; a live mark changes nothing.
        let changed = sqlx::query(
            r#"
            INSERT INTO dedup_marks (fingerprint, expires_at) VALUES (?, ?)
            ON CONFLICT(fingerprint) DO UPDATE SET expires_at = excluded.expires_at
            WHERE dedup_marks.expires_at <= ?
            "#,
        )
        .bind(fingerprint)
        .bind(now.saturating_add(millis(ttl)))
        .bind(now)
        .execute(pool)
        .await
        .map_err(db_err(DEDUP))?
        .rows_affected();
        Ok(changed > 0)
    }

    async fn release(&self, fingerprint: &str) -> Result<(), PipelineError> {
        sqlx::query("DELETE FROM dedup_marks WHERE fingerprint = ?")
            .bind(fingerprint)
            .execute(checked(&self.db, &self.closed, DEDUP)?)
            .await
            .map_err(db_err(DEDUP))?;
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

const DEAD: &str = "dead-letter store";

/// Unbounded: dead letters stay until an operator removes them.
pub struct SqliteDeadLetters {
    db: SqliteSubstrate,
    closed: AtomicBool,
}

#[async_trait]
impl DeadLetterStore for SqliteDeadLetters {
    async fn record(&self, dl: DeadLetter) -> Result<(), PipelineError> {
        sqlx::query("INSERT INTO dead_letters (match_id, body) VALUES (?, ?)")
            .bind(dl.match_id)
            .bind(serde_json::to_string(&dl)?)
            .execute(checked(&self.db, &self.closed, DEAD)?)
            .await
            .map_err(db_err(DEAD))?;
        Ok(())
    }

    async fn snapshot_last_n(&self, n: usize) -> Result<Vec<DeadLetter>, PipelineError> {
        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT body FROM (
                SELECT seq, body FROM dead_letters ORDER BY seq DESC LIMIT ?
            ) ORDER BY seq ASC
            "#,
        )
        .bind(i64::try_from(n).unwrap_or(i64::MAX))
        .fetch_all(checked(&self.db, &self.closed, DEAD)?)
        .await
        .map_err(db_err(DEAD))?;
        let mut out = Vec::with_capacity(rows.len());
        for (body,) in rows {
            out.push(serde_json::from_str(&body)?);
        }
        Ok(out)
    }

    async fn len(&self) -> Result<usize, PipelineError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letters")
            .fetch_one(checked(&self.db, &self.closed, DEAD)?)
            .await
            .map_err(db_err(DEAD))?;
        Ok(n as usize)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
