//! One addressable connector per external system, generic over its domain,
//! plus an object-safe facade and a registry for heterogeneous sets.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ethica_events::Bus;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::analytics::{Analyze, AnalyticsReport};
use crate::cache::{CacheManager, CacheStats};
use crate::config::{Config, ConnectorConfig};
use crate::domains::{Employees, Surveys, TrainingEvents};
use crate::error::{ConnectorError, RemoteError};
use crate::events::EventSink;
use crate::query::{snapshot_key, Filter, QueryAst, QueryFacade, QueryResult, ResultSet};
use crate::realtime::{
    ChangeNotification, PushTransport, RealtimeListener, SseTransport, Subscription,
};
use crate::record::{CanonicalRecord, DomainKind};
use crate::remote::{HttpSource, RemoteSource};
use crate::retry::RetryExecutor;
use crate::schema::TableSchema;
use crate::sync::{SyncMode, SyncOutcome, SyncScheduler, SyncStatus, Tombstone};
use crate::tasks::TaskSet;

/// How long background tasks get to wind down on disconnect.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct ConnectorStatus {
    pub id: String,
    pub domain: DomainKind,
    pub connected: bool,
    pub sync: Option<SyncStatus>,
    pub realtime: Option<Subscription>,
    pub cache: CacheStats,
    pub tombstones: usize,
}

/// Pieces that only exist while connected.
struct Live<D: Analyze> {
    facade: QueryFacade<D>,
    scheduler: Arc<SyncScheduler<D>>,
    listener: Option<Arc<RealtimeListener<D::Record>>>,
}

pub struct Connector<D: Analyze> {
    config: ConnectorConfig,
    events: EventSink,
    cache: Arc<CacheManager<D::Record>>,
    source: Option<Arc<dyn RemoteSource>>,
    push: Option<Arc<dyn PushTransport>>,
    live: RwLock<Option<Arc<Live<D>>>>,
    lifecycle: tokio::sync::Mutex<Option<TaskSet>>,
}

impl<D: Analyze> Connector<D> {
    /// HTTP-backed connector; the remote source is built on `connect`.
    pub fn new(config: ConnectorConfig, bus: Bus) -> Self {
        let events = EventSink::new(bus, &config.id);
        Self {
            cache: Arc::new(CacheManager::new(config.cache_ttl())),
            config,
            events,
            source: None,
            push: None,
            live: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    /// Use `source` instead of the configured HTTP endpoint.
    pub fn with_source(mut self, source: Arc<dyn RemoteSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Use `push` as the real-time channel regardless of `realtime.enabled`.
    pub fn with_push(mut self, push: Arc<dyn PushTransport>) -> Self {
        self.push = Some(push);
        self
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn table_schema(&self) -> TableSchema {
        D::schema()
    }

    pub fn cache(&self) -> &CacheManager<D::Record> {
        &self.cache
    }

    /// Receiver for every event on this connector's bus.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ethica_events::Envelope> {
        self.events.bus().subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.live.read().is_some()
    }

    fn live(&self) -> Result<Arc<Live<D>>, ConnectorError> {
        self.live
            .read()
            .clone()
            .ok_or_else(|| ConnectorError::NotConnected(self.config.id.clone()))
    }

    fn build_source(&self) -> Result<Arc<dyn RemoteSource>, ConnectorError> {
        if let Some(source) = &self.source {
            return Ok(Arc::clone(source));
        }
        let source = HttpSource::new(
            self.config.endpoint_url()?,
            self.config.resolve_token()?,
            self.config.request_timeout(),
        )?;
        Ok(Arc::new(source))
    }

    fn build_push(&self) -> Result<Option<Arc<dyn PushTransport>>, ConnectorError> {
        if let Some(push) = &self.push {
            return Ok(Some(Arc::clone(push)));
        }
        if !self.config.realtime.enabled {
            return Ok(None);
        }
        let transport =
            SseTransport::new(self.config.realtime_url()?, self.config.resolve_token()?)?;
        Ok(Some(Arc::new(transport)))
    }

    /// Validate configuration, probe the remote, run the initial sync and
    /// start the scheduler, sweeper and push listener. Idempotent.
    pub async fn connect(&self) -> Result<(), ConnectorError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Ok(());
        }
        self.config.validate()?;
        let source = self.build_source()?;
        let push = self.build_push()?;
        let retry = RetryExecutor::new(self.config.retry_policy(), self.config.request_timeout())
            .with_events(self.events.clone());

        let probe_source = Arc::clone(&source);
        retry
            .execute("probe", |_| {
                let source = Arc::clone(&probe_source);
                async move { source.probe().await }
            })
            .await
            .map_err(|err| match err {
                ConnectorError::Rejected(RemoteError::Auth { status }) => ConnectorError::config(
                    format!("{}: credentials rejected (status {status})", self.config.id),
                ),
                other => other,
            })?;

        let scheduler = Arc::new(SyncScheduler::<D>::new(
            &self.config.id,
            Arc::clone(&self.cache),
            Arc::clone(&source),
            retry.clone(),
            self.events.clone(),
            self.config.full_sync_every,
        ));
        let facade = QueryFacade::<D>::new(
            &self.config.id,
            Arc::clone(&self.cache),
            source,
            retry,
            self.events.clone(),
        );
        let listener = push.map(|transport| {
            let nudge = Arc::clone(&scheduler);
            Arc::new(
                RealtimeListener::new(
                    &self.config.id,
                    transport,
                    Arc::clone(&self.cache),
                    self.events.clone(),
                    self.config.realtime_backoff(),
                )
                .on_change(Arc::new(move |_: &ChangeNotification| nudge.nudge())),
            )
        });

        if let Err(err) = scheduler.sync(Some(SyncMode::Full)).await {
            tracing::warn!(
                target: "ethica::sync",
                connector = %self.config.id,
                error = %err,
                "initial sync failed; scheduler will retry"
            );
        }

        let mut tasks = TaskSet::new(CancellationToken::new());
        tasks.spawn(
            format!("sync:{}", self.config.id),
            Arc::clone(&scheduler).run(self.config.sync_interval(), tasks.token()),
        );
        tasks.spawn(
            format!("sweep:{}", self.config.id),
            sweep_loop(
                Arc::clone(&self.cache),
                self.config.sweep_interval(),
                self.events.clone(),
                tasks.token(),
            ),
        );
        if let Some(listener) = &listener {
            tasks.spawn(
                format!("realtime:{}", self.config.id),
                Arc::clone(listener).run(tasks.token()),
            );
        }

        *self.live.write() = Some(Arc::new(Live {
            facade,
            scheduler,
            listener,
        }));
        *lifecycle = Some(tasks);
        tracing::info!(
            target: "ethica::connector",
            connector = %self.config.id,
            domain = %D::KIND,
            "connector connected"
        );
        self.events.emit(
            ethica_topics::TOPIC_CONNECTOR_CONNECTED,
            &json!({
                "domain": D::KIND,
                "records": self
                    .cache
                    .peek(&snapshot_key(&self.config.id))
                    .map(|entry| entry.payload.len()),
            }),
        );
        Ok(())
    }

    /// Stop timers, close the push channel, clear the cache. Idempotent.
    pub async fn disconnect(&self) -> Result<(), ConnectorError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(tasks) = lifecycle.take() else {
            return Ok(());
        };
        *self.live.write() = None;
        for (task, outcome) in tasks.shutdown_with_grace(SHUTDOWN_GRACE).await {
            tracing::debug!(target: "ethica::connector", connector = %self.config.id, task = %task, ?outcome, "task stopped");
        }
        self.cache.clear();
        tracing::info!(target: "ethica::connector", connector = %self.config.id, "connector disconnected");
        self.events
            .emit(ethica_topics::TOPIC_CONNECTOR_DISCONNECTED, &json!({}));
        Ok(())
    }

    pub async fn query(&self, filter: &Filter) -> Result<QueryResult<D::Record>, ConnectorError> {
        self.live()?.facade.query(filter).await
    }

    pub async fn execute_sql(&self, sql: &str) -> Result<ResultSet, ConnectorError> {
        self.live()?.facade.execute_sql(sql).await
    }

    pub async fn execute_declarative(&self, ast: &QueryAst) -> Result<ResultSet, ConnectorError> {
        self.live()?.facade.execute_declarative(ast).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<D::Record>, ConnectorError> {
        self.live()?.facade.get(id).await
    }

    /// On-demand sync; shares the scheduler's in-flight guard.
    pub async fn sync_now(&self, mode: Option<SyncMode>) -> Result<SyncOutcome, ConnectorError> {
        self.live()?.scheduler.sync(mode).await
    }

    pub fn tombstones(&self) -> Vec<Tombstone> {
        self.live
            .read()
            .as_ref()
            .map(|live| live.scheduler.tombstones())
            .unwrap_or_default()
    }

    /// Report over the last committed snapshot. Never syncs; a snapshot
    /// past its TTL is still used and flagged `stale`.
    pub fn analytics(&self) -> AnalyticsReport<D::Report> {
        let now = Utc::now();
        let snapshot = self.cache.peek(&snapshot_key(&self.config.id));
        let records = snapshot
            .as_ref()
            .map(|entry| Arc::clone(&entry.payload))
            .unwrap_or_default();
        AnalyticsReport {
            connector: self.config.id.clone(),
            generated_at: now,
            as_of: snapshot.as_ref().map(|entry| entry.fetched_at),
            stale: snapshot
                .as_ref()
                .is_some_and(|entry| !entry.is_valid(self.cache.ttl())),
            record_count: records.len(),
            report: D::analyze(&records, now),
        }
    }

    pub fn status(&self) -> ConnectorStatus {
        let live = self.live.read().clone();
        ConnectorStatus {
            id: self.config.id.clone(),
            domain: D::KIND,
            connected: live.is_some(),
            sync: live.as_ref().map(|l| l.scheduler.status()),
            realtime: live
                .as_ref()
                .and_then(|l| l.listener.as_ref())
                .map(|l| l.subscription()),
            cache: self.cache.stats(),
            tombstones: live
                .as_ref()
                .map(|l| l.scheduler.tombstones().len())
                .unwrap_or(0),
        }
    }
}

async fn sweep_loop<R: CanonicalRecord>(
    cache: Arc<CacheManager<R>>,
    every: Duration,
    events: EventSink,
    cancel: CancellationToken,
) {
    let every = every.max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = cache.sweep();
                if evicted > 0 {
                    events.emit(ethica_topics::TOPIC_CACHE_SWEPT, &json!({"evicted": evicted}));
                }
            }
        }
    }
}

/// Domain-erased connector surface, so differently typed connectors can
/// live in one registry.
#[async_trait]
pub trait DynConnector: Send + Sync {
    fn id(&self) -> &str;
    fn domain(&self) -> DomainKind;
    fn table_schema(&self) -> TableSchema;
    fn status(&self) -> ConnectorStatus;
    fn analytics_json(&self) -> Value;
    async fn connect(&self) -> Result<(), ConnectorError>;
    async fn disconnect(&self) -> Result<(), ConnectorError>;
    async fn execute_sql(&self, sql: &str) -> Result<ResultSet, ConnectorError>;
    async fn execute_declarative(&self, ast: &QueryAst) -> Result<ResultSet, ConnectorError>;
    async fn sync_now(&self) -> Result<SyncOutcome, ConnectorError>;
}

#[async_trait]
impl<D: Analyze> DynConnector for Connector<D> {
    fn id(&self) -> &str {
        Connector::id(self)
    }

    fn domain(&self) -> DomainKind {
        D::KIND
    }

    fn table_schema(&self) -> TableSchema {
        D::schema()
    }

    fn status(&self) -> ConnectorStatus {
        Connector::status(self)
    }

    fn analytics_json(&self) -> Value {
        serde_json::to_value(self.analytics()).unwrap_or(Value::Null)
    }

    async fn connect(&self) -> Result<(), ConnectorError> {
        Connector::connect(self).await
    }

    async fn disconnect(&self) -> Result<(), ConnectorError> {
        Connector::disconnect(self).await
    }

    async fn execute_sql(&self, sql: &str) -> Result<ResultSet, ConnectorError> {
        Connector::execute_sql(self, sql).await
    }

    async fn execute_declarative(&self, ast: &QueryAst) -> Result<ResultSet, ConnectorError> {
        Connector::execute_declarative(self, ast).await
    }

    async fn sync_now(&self) -> Result<SyncOutcome, ConnectorError> {
        Connector::sync_now(self, None).await
    }
}

/// Build the connector for `config.domain`.
pub fn build_connector(config: ConnectorConfig, bus: Bus) -> Arc<dyn DynConnector> {
    match config.domain {
        DomainKind::Employees => Arc::new(Connector::<Employees>::new(config, bus)),
        DomainKind::Surveys => Arc::new(Connector::<Surveys>::new(config, bus)),
        DomainKind::Training => Arc::new(Connector::<TrainingEvents>::new(config, bus)),
    }
}

#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, Arc<dyn DynConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config, bus: &Bus) -> Result<Self, ConnectorError> {
        let mut registry = Self::new();
        for connector in &config.connectors {
            registry.register(build_connector(connector.clone(), bus.clone()))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, connector: Arc<dyn DynConnector>) -> Result<(), ConnectorError> {
        let id = connector.id().to_string();
        if self.connectors.contains_key(&id) {
            return Err(ConnectorError::config(format!("duplicate connector id '{id}'")));
        }
        self.connectors.insert(id, connector);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn DynConnector>> {
        self.connectors.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.connectors.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Connect every connector; returns the ones that failed.
    pub async fn connect_all(&self) -> Vec<(String, ConnectorError)> {
        let mut failed = Vec::new();
        for (id, connector) in &self.connectors {
            if let Err(err) = connector.connect().await {
                tracing::error!(target: "ethica::connector", connector = %id, error = %err, "connect failed");
                failed.push((id.clone(), err));
            }
        }
        failed
    }

    pub async fn disconnect_all(&self) {
        for (id, connector) in &self.connectors {
            if let Err(err) = connector.disconnect().await {
                tracing::warn!(target: "ethica::connector", connector = %id, error = %err, "disconnect failed");
            }
        }
    }

    pub fn statuses(&self) -> Vec<ConnectorStatus> {
        self.connectors.values().map(|c| c.status()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemorySource;

    fn config() -> ConnectorConfig {
        ConnectorConfig::new("hris", DomainKind::Employees, "https://hris.example.com")
    }

    #[tokio::test]
    async fn missing_token_fails_fast_without_network() {
        let connector = Connector::<Employees>::new(config(), Bus::new(8));
        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, ConnectorError::Configuration(_)));
        assert!(!connector.is_connected());
    }

    #[tokio::test]
    async fn rejected_credentials_are_a_configuration_error() {
        let source = Arc::new(MemorySource::new(Vec::new()));
        source.fail_probe(RemoteError::Auth { status: 401 });
        let connector = Connector::<Employees>::new(config(), Bus::new(8)).with_source(source);
        assert!(matches!(
            connector.connect().await,
            Err(ConnectorError::Configuration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_a_flaky_probe() {
        let source = Arc::new(MemorySource::new(vec![json!({"id": "1"})]));
        source.fail_probe_next(2, RemoteError::from_status(503, "warming up"));
        let connector =
            Connector::<Employees>::new(config(), Bus::new(64)).with_source(source.clone());
        connector.connect().await.unwrap();
        assert_eq!(source.probe_count(), 3);
        assert!(connector.is_connected());
        connector.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn lifecycle_round_trip() {
        let source = Arc::new(MemorySource::new(vec![json!({"id": "1"})]));
        let connector = Connector::<Employees>::new(config(), Bus::new(64)).with_source(source);
        assert!(matches!(
            connector.query(&Filter::new()).await,
            Err(ConnectorError::NotConnected(_))
        ));
        connector.connect().await.unwrap();
        connector.connect().await.unwrap();
        assert_eq!(connector.status().sync.map(|s| s.completed_runs), Some(1));
        assert_eq!(connector.query(&Filter::new()).await.unwrap().records.len(), 1);
        assert_eq!(connector.analytics().record_count, 1);

        connector.disconnect().await.unwrap();
        assert!(connector.cache().is_empty());
        assert!(!connector.status().connected);
        connector.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn registry_rejects_duplicates_and_builds_per_domain() {
        let mut cfg = Config::default();
        cfg.connectors.push(config());
        cfg.connectors.push(ConnectorConfig::new(
            "lms",
            DomainKind::Training,
            "https://lms.example.com",
        ));
        let bus = Bus::new(8);
        let mut registry = ConnectorRegistry::from_config(&cfg, &bus).unwrap();
        assert_eq!(registry.ids(), vec!["hris", "lms"]);
        assert_eq!(
            registry.get("lms").unwrap().table_schema().table,
            "training_events"
        );
        let dup = build_connector(config(), bus.clone());
        assert!(registry.register(dup).is_err());
        let failures = registry.connect_all().await;
        assert_eq!(failures.len(), 2, "no tokens configured");
    }
}
