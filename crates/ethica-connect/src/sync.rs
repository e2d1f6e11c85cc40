//! Sync Scheduler: periodic and on-demand synchronization into the
//! connector's snapshot, with at most one sync in flight.

use std::collections::{HashMap, HashSet, VecDeque};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheManager, Invalidation};
use crate::error::ConnectorError;
use crate::events::EventSink;
use crate::query::{query_prefix, snapshot_key};
use crate::record::{CanonicalRecord, Domain};
use crate::remote::{FetchRequest, RemoteSource};
use crate::retry::RetryExecutor;
use crate::transform::transform_batch;

/// Oldest tombstones are forgotten past this many.
const TOMBSTONE_CAPACITY: usize = 1024;
/// Changed ids listed in a `records.changed` event.
const EVENT_ID_SAMPLE: usize = 100;

const IDLE: u8 = 0;
const SYNCING: u8 = 1;
const FAILED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing,
    /// The last sync failed; the next trigger starts a new one.
    Failed,
}

impl SyncState {
    fn from_u8(v: u8) -> Self {
        match v {
            SYNCING => SyncState::Syncing,
            FAILED => SyncState::Failed,
            _ => SyncState::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
}

/// Watermark of the last committed sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncCursor {
    pub connector_id: String,
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tombstone {
    pub id: String,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub fetched: usize,
    pub dropped: usize,
    pub changed: usize,
    pub deleted: usize,
    /// Size of the committed snapshot.
    pub records: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another sync was already in flight.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastSync {
    pub at: DateTime<Utc>,
    pub mode: SyncMode,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub cursor: Option<DateTime<Utc>>,
    pub completed_runs: u64,
    pub last: Option<LastSync>,
}

/// Holds the `Syncing` slot. Dropping it returns the state to `Idle`, or to
/// `Failed` after [`SyncSlot::fail`], also when the sync future is cancelled.
struct SyncSlot<'a> {
    state: &'a AtomicU8,
    release_to: u8,
}

impl<'a> SyncSlot<'a> {
    fn try_acquire(state: &'a AtomicU8) -> Option<Self> {
        state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s != SYNCING).then_some(SYNCING)
            })
            .ok()
            .map(|_| Self {
                state,
                release_to: IDLE,
            })
    }

    fn fail(mut self) {
        self.release_to = FAILED;
    }
}

impl Drop for SyncSlot<'_> {
    fn drop(&mut self) {
        self.state.store(self.release_to, Ordering::Release);
    }
}

pub struct SyncScheduler<D: Domain> {
    connector: Arc<str>,
    cache: Arc<CacheManager<D::Record>>,
    source: Arc<dyn RemoteSource>,
    retry: RetryExecutor,
    events: EventSink,
    full_sync_every: u64,
    state: AtomicU8,
    completed_runs: AtomicU64,
    cursor: RwLock<Option<DateTime<Utc>>>,
    last: RwLock<Option<LastSync>>,
    tombstones: RwLock<VecDeque<Tombstone>>,
    nudge: Notify,
    _domain: PhantomData<fn() -> D>,
}

impl<D: Domain> SyncScheduler<D> {
    pub fn new(
        connector: &str,
        cache: Arc<CacheManager<D::Record>>,
        source: Arc<dyn RemoteSource>,
        retry: RetryExecutor,
        events: EventSink,
        full_sync_every: u32,
    ) -> Self {
        Self {
            connector: Arc::from(connector),
            cache,
            source,
            retry,
            events,
            full_sync_every: u64::from(full_sync_every.max(1)),
            state: AtomicU8::new(IDLE),
            completed_runs: AtomicU64::new(0),
            cursor: RwLock::new(None),
            last: RwLock::new(None),
            tombstones: RwLock::new(VecDeque::new()),
            nudge: Notify::new(),
            _domain: PhantomData,
        }
    }

    pub fn state(&self) -> SyncState {
        SyncState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn cursor(&self) -> SyncCursor {
        SyncCursor {
            connector_id: self.connector.to_string(),
            last_sync_at: *self.cursor.read(),
        }
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            state: self.state(),
            cursor: *self.cursor.read(),
            completed_runs: self.completed_runs.load(Ordering::Relaxed),
            last: self.last.read().clone(),
        }
    }

    /// Ids removed by full syncs, oldest first.
    pub fn tombstones(&self) -> Vec<Tombstone> {
        self.tombstones.read().iter().cloned().collect()
    }

    /// Ask the periodic loop for a sync before its next tick.
    pub fn nudge(&self) {
        self.nudge.notify_one();
    }

    fn next_mode(&self) -> SyncMode {
        let runs = self.completed_runs.load(Ordering::Relaxed);
        let have_snapshot = self.cache.peek(&snapshot_key(&self.connector)).is_some();
        if self.cursor.read().is_none() || !have_snapshot || runs % self.full_sync_every == 0 {
            SyncMode::Full
        } else {
            SyncMode::Incremental
        }
    }

    /// Run one sync now. Returns `Skipped` when one is already in flight.
    pub async fn sync(&self, mode: Option<SyncMode>) -> Result<SyncOutcome, ConnectorError> {
        let Some(slot) = SyncSlot::try_acquire(&self.state) else {
            tracing::debug!(target: "ethica::sync", connector = %self.connector, "sync already in flight; skipping");
            self.events
                .emit(ethica_topics::TOPIC_SYNC_SKIPPED, &json!({"reason": "in_flight"}));
            return Ok(SyncOutcome::Skipped);
        };
        let mode = mode.unwrap_or_else(|| self.next_mode());
        let cursor = *self.cursor.read();
        let watermark = D::schema().watermark().map(|c| c.name);
        let request = match (mode, cursor, watermark) {
            (SyncMode::Incremental, Some(since), Some(column)) => FetchRequest::since(column, since),
            _ => FetchRequest::full(),
        };
        let mode = if request.is_incremental() {
            SyncMode::Incremental
        } else {
            SyncMode::Full
        };
        let started_at = Utc::now();
        let started = tokio::time::Instant::now();
        tracing::info!(target: "ethica::sync", connector = %self.connector, ?mode, "sync started");
        self.events
            .emit(ethica_topics::TOPIC_SYNC_STARTED, &json!({"mode": mode}));

        let raw = match self
            .retry
            .execute("sync", |_| {
                let source = Arc::clone(&self.source);
                let request = request.clone();
                async move { source.fetch(&request).await }
            })
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(target: "ethica::sync", connector = %self.connector, ?mode, error = %err, "sync failed");
                self.events.emit(
                    ethica_topics::TOPIC_SYNC_FAILED,
                    &json!({"mode": mode, "error": err.to_string()}),
                );
                *self.last.write() = Some(LastSync {
                    at: started_at,
                    mode,
                    ok: false,
                    error: Some(err.to_string()),
                });
                slot.fail();
                return Err(err);
            }
        };

        let batch = transform_batch::<D>(&self.connector, &raw);
        let previous = self
            .cache
            .peek(&snapshot_key(&self.connector))
            .map(|entry| Arc::clone(&entry.payload))
            .unwrap_or_default();
        let merged = match mode {
            SyncMode::Full => Merge::replace(&previous, batch.records),
            SyncMode::Incremental => Merge::overlay(&previous, batch.records),
        };

        // Commit, then invalidate, then advance the cursor.
        let records = merged.snapshot.len();
        self.cache
            .put_unindexed(&snapshot_key(&self.connector), merged.snapshot);
        if mode == SyncMode::Full || !merged.changed.is_empty() {
            let prefix = query_prefix(&self.connector);
            let evicted = self.cache.invalidate(Invalidation::Prefix(&prefix));
            if evicted > 0 {
                self.events.emit(
                    ethica_topics::TOPIC_CACHE_INVALIDATED,
                    &json!({"scope": "prefix", "prefix": prefix, "evicted": evicted, "cause": "sync"}),
                );
            }
        }
        *self.cursor.write() = Some(started_at);
        let runs = self.completed_runs.fetch_add(1, Ordering::Relaxed) + 1;

        if !merged.deleted.is_empty() {
            let mut tombstones = self.tombstones.write();
            for id in &merged.deleted {
                tombstones.push_back(Tombstone {
                    id: id.clone(),
                    deleted_at: started_at,
                });
            }
            while tombstones.len() > TOMBSTONE_CAPACITY {
                tombstones.pop_front();
            }
            drop(tombstones);
            self.events.emit(
                ethica_topics::TOPIC_RECORDS_DELETED,
                &json!({"count": merged.deleted.len(), "ids": merged.deleted}),
            );
        }
        if !merged.changed.is_empty() {
            let sample: Vec<&String> = merged.changed.iter().take(EVENT_ID_SAMPLE).collect();
            self.events.emit(
                ethica_topics::TOPIC_RECORDS_CHANGED,
                &json!({"count": merged.changed.len(), "ids": sample}),
            );
        }
        if !batch.dropped.is_empty() {
            for dropped in &batch.dropped {
                tracing::info!(
                    target: "ethica::audit",
                    connector = %self.connector,
                    index = dropped.index,
                    reason = %dropped.reason,
                    "record dropped during sync"
                );
            }
            self.events.emit(
                ethica_topics::TOPIC_RECORDS_DROPPED,
                &json!({"op": "sync", "dropped": batch.dropped}),
            );
        }

        let report = SyncReport {
            mode,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            fetched: raw.len(),
            dropped: batch.dropped.len(),
            changed: merged.changed.len(),
            deleted: merged.deleted.len(),
            records,
        };
        tracing::info!(
            target: "ethica::sync",
            connector = %self.connector,
            ?mode,
            run = runs,
            fetched = report.fetched,
            dropped = report.dropped,
            changed = report.changed,
            deleted = report.deleted,
            records,
            "sync committed"
        );
        self.events
            .emit(ethica_topics::TOPIC_SYNC_COMPLETED, &report);
        *self.last.write() = Some(LastSync {
            at: started_at,
            mode,
            ok: true,
            error: None,
        });
        drop(slot);
        Ok(SyncOutcome::Completed(report))
    }

    /// Periodic loop: syncs one `interval` from now and on every tick after,
    /// and whenever nudged, until `cancel` fires. Failures are logged and
    /// the loop keeps going.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let interval = interval.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.nudge.notified() => {
                    tracing::debug!(target: "ethica::sync", connector = %self.connector, "sync nudged");
                }
            }
            // Errors were already logged and published.
            let _ = self.sync(None).await;
        }
        tracing::debug!(target: "ethica::sync", connector = %self.connector, "scheduler stopped");
    }
}

struct Merge<R> {
    snapshot: Vec<R>,
    changed: Vec<String>,
    deleted: Vec<String>,
}

impl<R: CanonicalRecord> Merge<R> {
    /// Full sync: the batch is the new truth; ids missing from it are deleted.
    fn replace(previous: &[R], batch: Vec<R>) -> Self {
        let old: HashMap<&str, &R> = previous.iter().map(|r| (r.id(), r)).collect();
        let mut seen = HashSet::with_capacity(batch.len());
        let mut snapshot = Vec::with_capacity(batch.len());
        let mut changed = Vec::new();
        for record in batch {
            if !seen.insert(record.id().to_string()) {
                continue;
            }
            if old.get(record.id()).map_or(true, |prev| **prev != record) {
                changed.push(record.id().to_string());
            }
            snapshot.push(record);
        }
        let deleted = previous
            .iter()
            .filter(|r| !seen.contains(r.id()))
            .map(|r| r.id().to_string())
            .collect();
        Self {
            snapshot,
            changed,
            deleted,
        }
    }

    /// Incremental sync: batch records replace or extend the previous set.
    /// A record older than the cached copy is a stale replay and is dropped.
    fn overlay(previous: &[R], batch: Vec<R>) -> Self {
        let mut snapshot: Vec<R> = previous.to_vec();
        let mut position: HashMap<String, usize> = snapshot
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id().to_string(), i))
            .collect();
        let mut changed = Vec::new();
        for record in batch {
            match position.get(record.id()) {
                Some(&i) => {
                    let stale = matches!(
                        (snapshot[i].updated_at(), record.updated_at()),
                        (Some(cached), Some(incoming)) if incoming < cached
                    );
                    if !stale && snapshot[i] != record {
                        changed.push(record.id().to_string());
                        snapshot[i] = record;
                    }
                }
                None => {
                    changed.push(record.id().to_string());
                    position.insert(record.id().to_string(), snapshot.len());
                    snapshot.push(record);
                }
            }
        }
        Self {
            snapshot,
            changed,
            deleted: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::{Employee, Employees};
    use crate::error::RemoteError;
    use crate::remote::Cursor;
    use crate::retry::RetryPolicy;
    use crate::test_support::MemorySource;
    use ethica_events::Bus;
    use serde_json::{json, Value};

    fn scheduler(source: Arc<MemorySource>, full_every: u32) -> Arc<SyncScheduler<Employees>> {
        let cache: Arc<CacheManager<Employee>> =
            Arc::new(CacheManager::new(Duration::from_secs(900)));
        let retry = RetryExecutor::new(
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
            },
            Duration::from_secs(5),
        );
        Arc::new(SyncScheduler::new(
            "hris",
            cache,
            source,
            retry,
            EventSink::new(Bus::new(64), "hris"),
            full_every,
        ))
    }

    fn emp(id: &str, updated: &str) -> Value {
        json!({"id": id, "department": "Ops", "updated_at": updated})
    }

    fn snapshot_ids(s: &SyncScheduler<Employees>) -> Vec<String> {
        s.cache
            .peek(&snapshot_key("hris"))
            .map(|e| e.payload.iter().map(|r| r.id.clone()).collect())
            .unwrap_or_default()
    }

    fn report(outcome: SyncOutcome) -> SyncReport {
        match outcome {
            SyncOutcome::Completed(report) => report,
            SyncOutcome::Skipped => panic!("expected a completed sync"),
        }
    }

    #[tokio::test]
    async fn first_sync_is_full_then_incremental_from_cursor() {
        let source = Arc::new(MemorySource::new(vec![
            emp("1", "2025-01-01T00:00:00Z"),
            emp("2", "2025-01-01T00:00:00Z"),
        ]));
        let s = scheduler(Arc::clone(&source), 12);
        assert!(s.cursor().last_sync_at.is_none());

        let first = report(s.sync(None).await.unwrap());
        assert_eq!(first.mode, SyncMode::Full);
        assert_eq!(first.records, 2);
        let cursor = s.cursor().last_sync_at.expect("cursor after commit");

        source.upsert(json!({"id": "3", "updated_at": "2999-01-01T00:00:00Z"}));
        let second = report(s.sync(None).await.unwrap());
        assert_eq!(second.mode, SyncMode::Incremental);
        assert_eq!((second.fetched, second.changed), (1, 1));
        assert_eq!(snapshot_ids(&s), vec!["1", "2", "3"]);
        assert_eq!(
            source.requests()[1].cursor,
            Some(Cursor {
                column: "updated_at",
                since: cursor
            })
        );
        assert_eq!(s.state(), SyncState::Idle);
    }

    #[test]
    fn overlay_ignores_records_older_than_the_cache() {
        let record = |id: &str, updated: &str, dept: &str| {
            let mut raw = emp(id, updated);
            raw["department"] = json!(dept);
            Employees::transform(&raw).unwrap()
        };
        let previous = vec![
            record("1", "2025-03-01T00:00:00Z", "Ops"),
            record("2", "2025-03-01T00:00:00Z", "Ops"),
        ];
        let merged = Merge::overlay(
            &previous,
            vec![
                record("1", "2025-02-01T00:00:00Z", "Legal"),
                record("2", "2025-04-01T00:00:00Z", "Sales"),
            ],
        );
        assert_eq!(merged.changed, vec!["2".to_string()]);
        assert_eq!(merged.snapshot[0].department, "Ops");
        assert_eq!(merged.snapshot[1].department, "Sales");
    }

    #[tokio::test]
    async fn full_sync_records_tombstones() {
        let source = Arc::new(MemorySource::new(vec![
            emp("1", "2025-01-01T00:00:00Z"),
            emp("2", "2025-01-01T00:00:00Z"),
        ]));
        let s = scheduler(Arc::clone(&source), 1);
        s.sync(None).await.unwrap();
        source.remove("1");
        let outcome = report(s.sync(None).await.unwrap());
        assert_eq!(outcome.mode, SyncMode::Full, "full_sync_every = 1");
        assert_eq!(outcome.deleted, 1);
        assert_eq!(snapshot_ids(&s), vec!["2"]);
        let tombstones = s.tombstones();
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].id, "1");
    }

    #[tokio::test]
    async fn overlapping_triggers_are_skipped() {
        let source = Arc::new(
            MemorySource::new(vec![emp("1", "2025-01-01T00:00:00Z")])
                .with_latency(Duration::from_millis(50)),
        );
        let s = scheduler(Arc::clone(&source), 12);
        let (a, b) = tokio::join!(s.sync(None), s.sync(None));
        let outcomes = [a.unwrap(), b.unwrap()];
        let skipped = outcomes
            .iter()
            .filter(|o| matches!(o, SyncOutcome::Skipped))
            .count();
        assert_eq!(skipped, 1);
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn failed_sync_keeps_snapshot_and_cursor() {
        let source = Arc::new(MemorySource::new(vec![emp("1", "2025-01-01T00:00:00Z")]));
        let s = scheduler(Arc::clone(&source), 12);
        s.sync(None).await.unwrap();
        let cursor = s.cursor();

        source.fail_always(RemoteError::Status {
            status: 503,
            message: "down".into(),
        });
        let err = s.sync(Some(SyncMode::Full)).await.unwrap_err();
        assert!(matches!(err, ConnectorError::RemoteUnavailable { attempts: 2, .. }));
        assert_eq!(s.state(), SyncState::Failed);
        assert_eq!(s.cursor(), cursor);
        assert_eq!(snapshot_ids(&s), vec!["1"]);
        assert_eq!(s.status().last.map(|l| l.ok), Some(false));

        source.clear_failures();
        assert!(matches!(s.sync(None).await.unwrap(), SyncOutcome::Completed(_)));
        assert_eq!(s.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn malformed_records_do_not_fail_the_sync() {
        let mut raw: Vec<Value> = (0..10).map(|i| emp(&i.to_string(), "")).collect();
        raw[4] = json!(["not", "an", "object"]);
        let source = Arc::new(MemorySource::new(raw));
        let s = scheduler(source, 12);
        let outcome = report(s.sync(None).await.unwrap());
        assert_eq!((outcome.fetched, outcome.dropped, outcome.records), (10, 1, 9));
    }

    #[tokio::test]
    async fn sync_evicts_query_entries() {
        let source = Arc::new(MemorySource::new(vec![emp("1", "2025-01-01T00:00:00Z")]));
        let s = scheduler(source, 12);
        s.cache.put("hris:query:select:abc", Vec::new());
        s.sync(None).await.unwrap();
        assert!(s.cache.peek("hris:query:select:abc").is_none());
        assert!(s.cache.peek(&snapshot_key("hris")).is_some());
    }
}
