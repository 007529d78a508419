//! In-process append-only log with consumer groups.
//!
//! Semantics follow a stream with consumer groups: each group has a cursor
//! and a pending-entries list. A delivered entry stays pending until acked;
//! once its visibility timeout passes, the next reader of the group claims it.
//! Redelivery never holds the cursor back.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use metrics::gauge;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Delivery, EventLog};
use crate::error::PipelineError;
use crate::event::{Event, EventId, NewEvent};

const RESOURCE: &str = "event log";

#[derive(Debug)]
struct Stored {
    event: Event,
    appended_at: Instant,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct Group {
    /// Highest id handed out to this group.
    cursor: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug)]
struct Inner {
    entries: BTreeMap<u64, Stored>,
    next_id: u64,
    groups: HashMap<String, Group>,
    closed: bool,
}

#[derive(Debug)]
pub struct MemoryEventLog {
    inner: Mutex<Inner>,
    appended: Notify,
    visibility_timeout: Duration,
    retention: Duration,
}

impl MemoryEventLog {
    pub fn new(visibility_timeout: Duration, retention: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                next_id: 1,
                groups: HashMap::new(),
                closed: false,
            }),
            appended: Notify::new(),
            visibility_timeout,
            retention,
        }
    }

    /// Mark the log unavailable. Every later call fails with
    /// [`PipelineError::SubstrateUnavailable`].
    pub fn close(&self) {
        if let Ok(mut g) = self.inner.lock() {
            g.closed = true;
        }
        self.appended.notify_waiters();
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, PipelineError> {
        let g = self
            .inner
            .lock()
            .map_err(|_| PipelineError::unavailable(RESOURCE))?;
        if g.closed {
            return Err(PipelineError::unavailable(RESOURCE));
        }
        Ok(g)
    }

    /// Claim expired pendings, then fresh entries. Runs under the lock.
    fn take_ready(&self, inner: &mut Inner, group: &str, consumer: &str, count: usize) -> Vec<Delivery> {
        let now = Instant::now();
        self.expire(inner, now);

        let Inner {
            entries, groups, ..
        } = inner;
        let g = groups.entry(group.to_string()).or_default();
        let mut out = Vec::new();

        for (id, p) in g.pending.iter_mut() {
            if out.len() >= count {
                break;
            }
            if now.duration_since(p.delivered_at) < self.visibility_timeout {
                continue;
            }
            if let Some(stored) = entries.get(id) {
                p.consumer = consumer.to_string();
                p.delivered_at = now;
                p.deliveries += 1;
                out.push(Delivery {
                    event: stored.event.clone(),
                    attempt: p.deliveries,
                });
            }
        }

        let fresh: Vec<u64> = entries
            .range(g.cursor + 1..)
            .take(count.saturating_sub(out.len()))
            .map(|(id, _)| *id)
            .collect();
        for id in fresh {
            if let Some(stored) = entries.get(&id) {
                g.pending.insert(
                    id,
                    PendingEntry {
                        consumer: consumer.to_string(),
                        delivered_at: now,
                        deliveries: 1,
                    },
                );
                g.cursor = id;
                out.push(Delivery {
                    event: stored.event.clone(),
                    attempt: 1,
                });
            }
        }
        out
    }

    /// Drop entries past the retention horizon, along with their pendings.
    fn expire(&self, inner: &mut Inner, now: Instant) {
        let expired: Vec<u64> = inner
            .entries
            .iter()
            .take_while(|(_, s)| now.duration_since(s.appended_at) >= self.retention)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            inner.entries.remove(&id);
            for g in inner.groups.values_mut() {
                g.pending.remove(&id);
            }
        }
    }

    /// An entry can go once every group has moved past it and acked it.
    fn collect_handled(inner: &mut Inner, id: u64) {
        if inner.groups.is_empty() {
            return;
        }
        let handled = inner
            .groups
            .values()
            .all(|g| g.cursor >= id && !g.pending.contains_key(&id));
        if handled {
            inner.entries.remove(&id);
        }
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: NewEvent) -> Result<Event, PipelineError> {
        let stored = {
            let mut g = self.lock()?;
            let id = g.next_id;
            g.next_id += 1;
            let ev = Event::from_new(EventId(id), event);
            g.entries.insert(
                id,
                Stored {
                    event: ev.clone(),
                    appended_at: Instant::now(),
                },
            );
            gauge!("log_entries").set(g.entries.len() as f64);
            ev
        };
        self.appended.notify_waiters();
        Ok(stored)
    }

    async fn ensure_group(&self, group: &str) -> Result<(), PipelineError> {
        let mut g = self.lock()?;
        g.groups.entry(group.to_string()).or_default();
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
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut g = self.lock()?;
                let ready = self.take_ready(&mut g, group, consumer, count.max(1));
                if !ready.is_empty() {
                    return Ok(ready);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Wake on append, or re-check for expired pendings at the deadline.
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn ack(&self, group: &str, id: EventId) -> Result<bool, PipelineError> {
        let mut g = self.lock()?;
        let removed = g
            .groups
            .get_mut(group)
            .and_then(|grp| grp.pending.remove(&id.0))
            .is_some();
        if removed {
            Self::collect_handled(&mut g, id.0);
            gauge!("log_entries").set(g.entries.len() as f64);
        }
        Ok(removed)
    }

    async fn pending(&self, group: &str) -> Result<usize, PipelineError> {
        let g = self.lock()?;
        Ok(g.groups.get(group).map(|grp| grp.pending.len()).unwrap_or(0))
    }

    async fn len(&self) -> Result<usize, PipelineError> {
        let g = self.lock()?;
        Ok(g.entries.len())
    }
    fn close(&self) {
        MemoryEventLog::close(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{FixtureInfo, Payload, SourceKind};
    use chrono::Utc;

    fn ev(n: i64) -> NewEvent {
        NewEvent::new(
            SourceKind::Fixture,
            format!("fixture:{n}"),
            Payload::Fixture(FixtureInfo {
                fixture_id: n,
                league_id: 39,
                home: "A".into(),
                away: "B".into(),
                kickoff: Utc::now(),
                status: "NS".into(),
            }),
        )
    }

    #[tokio::test]
    async fn ids_increase_in_append_order() {
        let log = MemoryEventLog::new(Duration::from_secs(30), Duration::from_secs(3600));
        let a = log.append(ev(1)).await.unwrap();
        let b = log.append(ev(2)).await.unwrap();
        assert!(a.id < b.id);
    }

    #[tokio::test]
    async fn acked_entries_are_collected_once_all_groups_handled_them() {
        let log = MemoryEventLog::new(Duration::from_secs(30), Duration::from_secs(3600));
        log.ensure_group("a").await.unwrap();
        log.ensure_group("b").await.unwrap();
        let e = log.append(ev(1)).await.unwrap();

        let got = log.read_group("a", "c1", 10, Duration::ZERO).await.unwrap();
        assert_eq!(got.len(), 1);
        assert!(log.ack("a", e.id).await.unwrap());
        assert_eq!(log.len().await.unwrap(), 1, "group b has not seen it yet");

        log.read_group("b", "c1", 10, Duration::ZERO).await.unwrap();
        log.ack("b", e.id).await.unwrap();
        assert_eq!(log.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn double_ack_reports_false() {
        let log = MemoryEventLog::new(Duration::from_secs(30), Duration::from_secs(3600));
        let e = log.append(ev(1)).await.unwrap();
        log.read_group("g", "c", 1, Duration::ZERO).await.unwrap();
        assert!(log.ack("g", e.id).await.unwrap());
        assert!(!log.ack("g", e.id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn retention_horizon_drops_unacked_entries() {
        let log = MemoryEventLog::new(Duration::from_secs(30), Duration::from_secs(60));
        log.append(ev(1)).await.unwrap();
        log.read_group("g", "c", 1, Duration::ZERO).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        let again = log.read_group("g", "c", 1, Duration::ZERO).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(log.pending("g").await.unwrap(), 0);
        assert_eq!(log.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closed_log_is_unavailable() {
        let log = MemoryEventLog::new(Duration::from_secs(30), Duration::from_secs(60));
        log.close();
        let err = log.append(ev(1)).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
