//! In-memory remote source and scripted push channel for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{ChannelError, RemoteError};
use crate::realtime::{ChangeNotification, NotificationStream, PushTransport};
use crate::remote::{FetchRequest, RemoteSource};
use crate::transform::parse_timestamp;

/// Remote source backed by a vector of raw JSON records.
///
/// Honors the incremental cursor (records whose watermark column is at or
/// after it) and plain equality parameters on top-level fields.
#[derive(Default)]
pub struct MemorySource {
    records: Mutex<Vec<Value>>,
    scripted: Mutex<VecDeque<RemoteError>>,
    always: Mutex<Option<RemoteError>>,
    probe_error: Mutex<Option<RemoteError>>,
    probe_scripted: Mutex<VecDeque<RemoteError>>,
    probes: AtomicUsize,
    latency: Duration,
    fetches: AtomicUsize,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MemorySource {
    pub fn new(records: Vec<Value>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_records(&self, records: Vec<Value>) {
        *self.records.lock() = records;
    }

    /// Replace the record with the same `id`, or append.
    pub fn upsert(&self, record: Value) {
        let mut records = self.records.lock();
        let id = record.get("id").cloned();
        match records.iter_mut().find(|r| id.is_some() && r.get("id") == id.as_ref()) {
            Some(slot) => *slot = record,
            None => records.push(record),
        }
    }

    pub fn remove(&self, id: &str) {
        self.records
            .lock()
            .retain(|r| r.get("id").and_then(Value::as_str) != Some(id));
    }

    /// Fail the next `n` fetches with `err`, then recover.
    pub fn fail_next(&self, n: usize, err: RemoteError) {
        let mut scripted = self.scripted.lock();
        for _ in 0..n {
            scripted.push_back(err.clone());
        }
    }

    pub fn fail_always(&self, err: RemoteError) {
        *self.always.lock() = Some(err);
    }

    pub fn clear_failures(&self) {
        self.scripted.lock().clear();
        *self.always.lock() = None;
    }

    pub fn fail_probe(&self, err: RemoteError) {
        *self.probe_error.lock() = Some(err);
    }

    /// Fail the next `n` probes with `err`, then recover.
    pub fn fail_probe_next(&self, n: usize, err: RemoteError) {
        let mut scripted = self.probe_scripted.lock();
        for _ in 0..n {
            scripted.push_back(err.clone());
        }
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Fetch attempts so far, failed ones included.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    fn matches(record: &Value, request: &FetchRequest) -> bool {
        if let Some(cursor) = &request.cursor {
            let updated = record.get(cursor.column).and_then(parse_timestamp);
            if !updated.is_some_and(|t| t >= cursor.since) {
                return false;
            }
        }
        request
            .params
            .iter()
            .filter(|(key, _)| !key.contains('['))
            .all(|(key, expected)| match record.get(key) {
                None => true,
                Some(Value::String(s)) => s.eq_ignore_ascii_case(expected),
                Some(other) => other.to_string() == *expected,
            })
    }
}

#[async_trait]
impl RemoteSource for MemorySource {
    fn describe(&self) -> String {
        "memory://".to_string()
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.probe_scripted.lock().pop_front() {
            return Err(err);
        }
        match self.probe_error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Value>, RemoteError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(err) = self.scripted.lock().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.always.lock().clone() {
            return Err(err);
        }
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| Self::matches(r, request))
            .cloned()
            .collect())
    }
}

/// What the next `open` of a [`ScriptedPush`] does.
#[derive(Debug, Clone)]
pub enum PushStep {
    /// Connect fails.
    Fail(String),
    /// Deliver these, then the channel closes.
    Deliver(Vec<ChangeNotification>),
    /// Deliver these, then stay open.
    Hold(Vec<ChangeNotification>),
}

/// Push transport driven by a script; once the script runs out every
/// `open` yields a channel that stays open and silent.
#[derive(Default)]
pub struct ScriptedPush {
    script: Mutex<VecDeque<PushStep>>,
    opened_at: Mutex<Vec<Instant>>,
}

impl ScriptedPush {
    pub fn new(steps: Vec<PushStep>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            opened_at: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, step: PushStep) {
        self.script.lock().push_back(step);
    }

    pub fn opens(&self) -> usize {
        self.opened_at.lock().len()
    }

    /// Time between consecutive `open` calls.
    pub fn open_gaps(&self) -> Vec<Duration> {
        self.opened_at
            .lock()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }
}

#[async_trait]
impl PushTransport for ScriptedPush {
    fn describe(&self) -> String {
        "scripted://".to_string()
    }

    async fn open(&self) -> Result<NotificationStream, ChannelError> {
        self.opened_at.lock().push(Instant::now());
        let step = self.script.lock().pop_front();
        match step {
            Some(PushStep::Fail(reason)) => Err(ChannelError::Connect(reason)),
            Some(PushStep::Deliver(notes)) => Ok(stream::iter(notes.into_iter().map(Ok)).boxed()),
            Some(PushStep::Hold(notes)) => Ok(stream::iter(notes.into_iter().map(Ok))
                .chain(stream::pending())
                .boxed()),
            None => Ok(stream::pending().boxed()),
        }
    }
}
