//! Real-time Update Listener: turns remote change notifications into cache
//! invalidations and keeps the push channel open with backoff.
//!
//! The channel is best-effort. While it is down the cache simply ages out at
//! its TTL; nothing here ever surfaces an error to query callers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cache::{CacheManager, Invalidation};
use crate::error::{ChannelError, ConnectorError};
use crate::events::EventSink;
use crate::http_client;
use crate::record::CanonicalRecord;
use crate::retry::RetryPolicy;
use crate::transform::scalar_text;

/// Notification types that invalidate the whole connector.
const RESET_TYPES: &[&str] = &["reset", "resync", "bulk"];

/// Open this long before dropping and the retry count starts over.
const STABLE_AFTER: Duration = Duration::from_secs(30);

/// Inbound change notification `{type, affectedId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(
        rename = "affectedId",
        alias = "affected_id",
        alias = "id",
        default,
        deserialize_with = "affected_id"
    )]
    pub affected_id: Option<String>,
}

/// Remote ids arrive as strings or bare numbers; both key the same record.
fn affected_id<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    let raw = Option::<Value>::deserialize(de)?;
    Ok(raw
        .as_ref()
        .and_then(scalar_text)
        .filter(|id| !id.is_empty()))
}

impl ChangeNotification {
    pub fn record(kind: &str, id: &str) -> Self {
        Self {
            kind: kind.to_string(),
            affected_id: Some(id.to_string()),
        }
    }

    pub fn reset() -> Self {
        Self {
            kind: "reset".to_string(),
            affected_id: None,
        }
    }

    fn is_broad(&self) -> bool {
        let kind = self.kind.to_ascii_lowercase();
        self.affected_id.as_deref().map_or(true, str::is_empty)
            || RESET_TYPES.contains(&kind.as_str())
    }
}

pub type NotificationStream = BoxStream<'static, Result<ChangeNotification, ChannelError>>;

/// A persistent push connection. Each `open` yields one connection's worth
/// of notifications; the stream ending means the channel closed.
#[async_trait]
pub trait PushTransport: Send + Sync {
    fn describe(&self) -> String;

    async fn open(&self) -> Result<NotificationStream, ChannelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SocketState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub connector_id: String,
    pub state: SocketState,
    /// Consecutive failed connects or drops since the channel last delivered
    /// a notification (or stayed open for a while).
    pub retry_count: u32,
    pub connected_since: Option<DateTime<Utc>>,
    pub notifications: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct SseFrame {
    event: String,
    data: String,
    id: Option<String>,
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes are buffered until a full line arrives, so a multi-byte character
/// split across chunks decodes intact.
#[derive(Debug, Default)]
struct SseDecoder {
    buf: Vec<u8>,
    frame: SseFrame,
}

impl SseDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let mut line = String::from_utf8_lossy(&raw[..pos]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() {
                if !self.frame.data.is_empty() {
                    out.push(std::mem::take(&mut self.frame));
                } else {
                    self.frame = SseFrame::default();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("event:") {
                self.frame.event = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                if !self.frame.data.is_empty() {
                    self.frame.data.push('\n');
                }
                self.frame.data.push_str(rest.trim_start());
            } else if let Some(rest) = line.strip_prefix("id:") {
                self.frame.id = Some(rest.trim().to_string());
            }
        }
        out
    }
}

fn decode_frame(frame: &SseFrame) -> Result<ChangeNotification, ChannelError> {
    let mut note: ChangeNotification = serde_json::from_str(&frame.data)
        .map_err(|e| ChannelError::Malformed(e.to_string()))?;
    if note.kind.is_empty() {
        note.kind = frame.event.clone();
    }
    Ok(note)
}

/// Server-sent events over HTTP with bearer auth. Resumes with
/// `Last-Event-ID` after a reconnect.
pub struct SseTransport {
    client: reqwest::Client,
    url: Url,
    token: String,
    last_event_id: Arc<RwLock<Option<String>>>,
}

impl SseTransport {
    pub fn new(url: Url, token: String) -> Result<Self, ConnectorError> {
        Ok(Self {
            client: http_client::push_client()?,
            url,
            token,
            last_event_id: Arc::new(RwLock::new(None)),
        })
    }
}

#[async_trait]
impl PushTransport for SseTransport {
    fn describe(&self) -> String {
        self.url.to_string()
    }

    async fn open(&self) -> Result<NotificationStream, ChannelError> {
        let mut req = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, "text/event-stream")
            .bearer_auth(&self.token);
        if let Some(id) = self.last_event_id.read().clone() {
            req = req.header("Last-Event-ID", id);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ChannelError::Connect(format!("status {status}")));
        }
        let last_event_id = Arc::clone(&self.last_event_id);
        let frames = resp
            .bytes_stream()
            .scan(SseDecoder::default(), |decoder, chunk| {
                let items: Vec<Result<SseFrame, ChannelError>> = match chunk {
                    Ok(bytes) => decoder.feed(&bytes).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(ChannelError::Disconnected(e.to_string()))],
                };
                futures_util::future::ready(Some(stream::iter(items)))
            })
            .flatten();
        let notes = frames.map(move |frame| {
            let frame = frame?;
            if let Some(id) = &frame.id {
                *last_event_id.write() = Some(id.clone());
            }
            decode_frame(&frame)
        });
        Ok(notes.boxed())
    }
}

pub type ChangeHook = Arc<dyn Fn(&ChangeNotification) + Send + Sync>;

pub struct RealtimeListener<R> {
    connector: Arc<str>,
    transport: Arc<dyn PushTransport>,
    cache: Arc<CacheManager<R>>,
    events: EventSink,
    backoff: RetryPolicy,
    subscription: RwLock<Subscription>,
    on_change: Option<ChangeHook>,
}

impl<R: CanonicalRecord> RealtimeListener<R> {
    /// `backoff` supplies base and maximum delay; reconnect attempts are unbounded.
    pub fn new(
        connector: &str,
        transport: Arc<dyn PushTransport>,
        cache: Arc<CacheManager<R>>,
        events: EventSink,
        backoff: RetryPolicy,
    ) -> Self {
        Self {
            connector: Arc::from(connector),
            transport,
            cache,
            events,
            backoff,
            subscription: RwLock::new(Subscription {
                connector_id: connector.to_string(),
                state: SocketState::Closed,
                retry_count: 0,
                connected_since: None,
                notifications: 0,
                last_error: None,
            }),
            on_change: None,
        }
    }

    /// Called after each applied notification (the connector nudges its
    /// scheduler from here).
    pub fn on_change(mut self, hook: ChangeHook) -> Self {
        self.on_change = Some(hook);
        self
    }

    pub fn subscription(&self) -> Subscription {
        self.subscription.read().clone()
    }

    fn set_state(&self, state: SocketState, retry_count: u32, error: Option<String>) {
        let mut sub = self.subscription.write();
        if sub.state == state && sub.retry_count == retry_count && error.is_none() {
            return;
        }
        if sub.state != state {
            sub.connected_since = (state == SocketState::Open).then(Utc::now);
        }
        sub.state = state;
        sub.retry_count = retry_count;
        if error.is_some() {
            sub.last_error = error;
        }
        drop(sub);
        self.events.emit(
            ethica_topics::TOPIC_REALTIME_STATE,
            &json!({"state": state, "retry_count": retry_count}),
        );
    }

    /// Invalidate what a notification touches. Returns evicted entries.
    pub fn apply(&self, note: &ChangeNotification) -> usize {
        self.subscription.write().notifications += 1;
        let (scope, evicted) = if note.is_broad() {
            let prefix = format!("{}:", self.connector);
            let evicted = self.cache.invalidate(Invalidation::Prefix(&prefix));
            ("prefix", evicted)
        } else {
            let id = note.affected_id.as_deref().unwrap_or_default();
            ("record", self.cache.invalidate(Invalidation::Record(id)))
        };
        tracing::debug!(
            target: "ethica::realtime",
            connector = %self.connector,
            kind = %note.kind,
            id = note.affected_id.as_deref().unwrap_or(""),
            scope,
            evicted,
            "change notification applied"
        );
        self.events.emit(
            ethica_topics::TOPIC_CACHE_INVALIDATED,
            &json!({"scope": scope, "id": note.affected_id, "evicted": evicted, "cause": "push"}),
        );
        self.events.emit(
            ethica_topics::TOPIC_RECORDS_CHANGED,
            &json!({"source": "push", "type": note.kind, "id": note.affected_id}),
        );
        if let Some(hook) = &self.on_change {
            hook(note);
        }
        evicted
    }

    /// Connect, consume, reconnect with backoff, until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut failures = 0u32;
        tracing::info!(target: "ethica::realtime", connector = %self.connector, target_url = %self.transport.describe(), "push listener starting");
        'outer: loop {
            self.set_state(SocketState::Connecting, failures, None);
            let opened = tokio::select! {
                _ = cancel.cancelled() => break 'outer,
                opened = self.transport.open() => opened,
            };
            let err = match opened {
                Ok(mut notes) => {
                    let opened_at = tokio::time::Instant::now();
                    self.set_state(SocketState::Open, failures, None);
                    tracing::info!(target: "ethica::realtime", connector = %self.connector, "push channel open");
                    let err = loop {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => break 'outer,
                            next = notes.next() => next,
                        };
                        match next {
                            Some(Ok(note)) => {
                                if failures > 0 {
                                    failures = 0;
                                    self.set_state(SocketState::Open, 0, None);
                                }
                                self.apply(&note);
                            }
                            Some(Err(ChannelError::Malformed(msg))) => {
                                tracing::warn!(target: "ethica::realtime", connector = %self.connector, error = %msg, "ignoring malformed push message");
                            }
                            Some(Err(err)) => break err,
                            None => break ChannelError::Disconnected("closed by remote".into()),
                        }
                    };
                    // A channel that stayed up counts as healthy even if it was quiet.
                    if opened_at.elapsed() >= STABLE_AFTER {
                        failures = 0;
                    }
                    err
                }
                Err(err) => err,
            };
            failures = failures.saturating_add(1);
            let delay = self.delay_for(failures);
            tracing::info!(
                target: "ethica::realtime",
                connector = %self.connector,
                retry = failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "push channel down; reconnecting"
            );
            self.set_state(SocketState::Closed, failures, Some(err.to_string()));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let retries = self.subscription.read().retry_count;
        self.set_state(SocketState::Closed, retries, None);
        tracing::debug!(target: "ethica::realtime", connector = %self.connector, "push listener stopped");
    }

    fn delay_for(&self, failures: u32) -> Duration {
        self.backoff.delay_for(failures.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::{Employee, Employees};
    use crate::record::Domain;
    use crate::test_support::{PushStep, ScriptedPush};
    use ethica_events::Bus;

    fn emp(id: &str) -> Employee {
        Employees::transform(&json!({"id": id})).unwrap()
    }

    fn listener(push: Arc<ScriptedPush>) -> (Arc<RealtimeListener<Employee>>, Arc<CacheManager<Employee>>) {
        let cache = Arc::new(CacheManager::new(Duration::from_secs(900)));
        let backoff = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
        };
        let listener = RealtimeListener::new(
            "hris",
            push,
            Arc::clone(&cache),
            EventSink::new(Bus::new(64), "hris"),
            backoff,
        );
        (Arc::new(listener), cache)
    }

    #[test]
    fn sse_decoder_handles_split_frames() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b": keepalive\n\nevent: employee.updated\nda").is_empty());
        let frames = decoder.feed(b"ta: {\"affectedId\": \"42\"}\r\nid: 7\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.as_deref(), Some("7"));
        let note = decode_frame(&frames[0]).unwrap();
        assert_eq!(note, ChangeNotification::record("employee.updated", "42"));
        let bad = decoder.feed(b"data: nope\n\n");
        assert!(matches!(decode_frame(&bad[0]), Err(ChannelError::Malformed(_))));
    }

    #[test]
    fn sse_decoder_keeps_characters_split_across_chunks() {
        let payload = "event: employee.updated\ndata: {\"affectedId\": \"emp-\u{e9}\"}\n\n".as_bytes();
        let split = payload.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(&payload[..split]).is_empty());
        let frames = decoder.feed(&payload[split..]);
        let note = decode_frame(&frames[0]).unwrap();
        assert_eq!(note.affected_id.as_deref(), Some("emp-\u{e9}"));
    }

    #[tokio::test]
    async fn numeric_ids_evict_the_matching_record() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.feed(b"data: {\"type\": \"updated\", \"affectedId\": 42}\n\n");
        let note = decode_frame(&frames[0]).unwrap();
        assert_eq!(note, ChangeNotification::record("updated", "42"));
        let blank: ChangeNotification =
            serde_json::from_str(r#"{"type": "updated", "affectedId": "  "}"#).unwrap();
        assert_eq!(blank.affected_id, None);

        let (listener, cache) = listener(Arc::new(ScriptedPush::default()));
        cache.put("hris:query:a", vec![emp("42")]);
        cache.put("hris:query:b", vec![emp("7")]);
        assert_eq!(listener.apply(&note), 1);
        assert!(cache.peek("hris:query:a").is_none());
        assert!(cache.peek("hris:query:b").is_some());
    }

    #[tokio::test]
    async fn narrow_and_broad_invalidation() {
        let (listener, cache) = listener(Arc::new(ScriptedPush::default()));
        cache.put("hris:query:a", vec![emp("1"), emp("2")]);
        cache.put("hris:query:b", vec![emp("3")]);
        cache.put_unindexed("hris:snapshot", vec![emp("1"), emp("2"), emp("3")]);

        assert_eq!(listener.apply(&ChangeNotification::record("updated", "3")), 1);
        assert!(cache.peek("hris:query:a").is_some());
        assert_eq!(listener.apply(&ChangeNotification::reset()), 2);
        assert!(cache.is_empty());
        assert_eq!(listener.subscription().notifications, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_backoff_and_resets_retry_count() {
        let push = Arc::new(ScriptedPush::new(vec![
            PushStep::Fail("refused".into()),
            PushStep::Fail("refused".into()),
            PushStep::Fail("refused".into()),
            PushStep::Hold(vec![ChangeNotification::record("updated", "1")]),
        ]));
        let (listener, cache) = listener(Arc::clone(&push));
        cache.put("hris:query:a", vec![emp("1")]);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&listener).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.subscription().retry_count, 1);
        assert_eq!(listener.subscription().state, SocketState::Closed);

        // 100 + 200 + 400 ms of backoff.
        tokio::time::sleep(Duration::from_millis(800)).await;
        let sub = listener.subscription();
        assert_eq!(sub.state, SocketState::Open);
        assert_eq!(sub.retry_count, 0);
        assert_eq!(push.opens(), 4);
        assert!(cache.peek("hris:query:a").is_none());

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(listener.subscription().state, SocketState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_drops_keep_growing_the_backoff() {
        let push = Arc::new(ScriptedPush::new(vec![
            PushStep::Deliver(vec![]),
            PushStep::Deliver(vec![]),
            PushStep::Deliver(vec![]),
            PushStep::Deliver(vec![]),
        ]));
        let (listener, _cache) = listener(Arc::clone(&push));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&listener).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(push.opens(), 5);
        let gaps = push.open_gaps();
        assert!(gaps[0] >= Duration::from_millis(100), "{gaps:?}");
        assert!(gaps[1] >= Duration::from_millis(200), "{gaps:?}");
        assert!(gaps[2] >= Duration::from_millis(400), "{gaps:?}");
        assert!(gaps[3] >= Duration::from_millis(400), "{gaps:?}");
        let sub = listener.subscription();
        assert_eq!(sub.state, SocketState::Open);
        assert_eq!(sub.retry_count, 4);

        cancel.cancel();
        task.await.unwrap();
    }
}
