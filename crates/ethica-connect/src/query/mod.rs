//! Query Facade: answers structured and declarative queries from the cache,
//! the committed snapshot, or the remote source, in that order.

pub mod declarative;
pub mod filter;

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::time::Instant;

pub use declarative::{QueryAst, QueryPlan, SelectItem};
pub use filter::{query_prefix, snapshot_key, CompareOp, Filter, Predicate};

use crate::cache::CacheManager;
use crate::error::ConnectorError;
use crate::events::EventSink;
use crate::record::{CanonicalRecord, Domain};
use crate::remote::{FetchRequest, RemoteSource};
use crate::retry::RetryExecutor;
use crate::schema::TableSchema;
use crate::singleflight::Singleflight;
use crate::transform::transform_batch;

/// Where a result was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    /// A valid entry under the query's own key.
    Cache,
    /// Filtered locally from the last committed sync snapshot.
    Snapshot,
    Remote,
}

#[derive(Debug, Clone)]
pub struct QueryResult<R> {
    pub records: Arc<Vec<R>>,
    pub source: ResultSource,
    pub fetched_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

/// Tabular answer to a declarative query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    pub source: ResultSource,
    pub fetched_at: DateTime<Utc>,
}

pub struct QueryFacade<D: Domain> {
    connector: Arc<str>,
    schema: TableSchema,
    cache: Arc<CacheManager<D::Record>>,
    source: Arc<dyn RemoteSource>,
    retry: RetryExecutor,
    events: EventSink,
    flights: Singleflight,
    _domain: PhantomData<fn() -> D>,
}

impl<D: Domain> QueryFacade<D> {
    pub fn new(
        connector: &str,
        cache: Arc<CacheManager<D::Record>>,
        source: Arc<dyn RemoteSource>,
        retry: RetryExecutor,
        events: EventSink,
    ) -> Self {
        Self {
            connector: Arc::from(connector),
            schema: D::schema(),
            cache,
            source,
            retry,
            events,
            flights: Singleflight::default(),
            _domain: PhantomData,
        }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Records matching `filter`.
    ///
    /// Only a miss on both the query key and the snapshot reaches the
    /// remote source; concurrent identical misses share that fetch.
    pub async fn query(&self, filter: &Filter) -> Result<QueryResult<D::Record>, ConnectorError> {
        let started = Instant::now();
        let filter = filter.normalize(&self.schema)?;
        let key = filter.cache_key(&self.connector, "select");
        let elapsed = |started: Instant| started.elapsed().as_millis() as u64;

        if let Some(hit) = self.local(&key, &filter) {
            return Ok(QueryResult {
                execution_time_ms: elapsed(started),
                ..hit
            });
        }

        let flight = self.flights.begin(&key);
        if !flight.is_leader() {
            flight.wait().await?;
            if let Some(entry) = self.cache.get(&key) {
                tracing::debug!(target: "ethica::query", connector = %self.connector, %key, "coalesced miss");
                return Ok(QueryResult {
                    records: Arc::clone(&entry.payload),
                    source: ResultSource::Cache,
                    fetched_at: entry.fetched_at,
                    execution_time_ms: elapsed(started),
                });
            }
        }

        let raw = self
            .retry
            .execute("query", |_| {
                let request = FetchRequest::filtered(filter.pushdown(&self.schema));
                let source = Arc::clone(&self.source);
                async move { source.fetch(&request).await }
            })
            .await
            .inspect_err(|err| flight.fail(err))?;
        let batch = transform_batch::<D>(&self.connector, &raw);
        if !batch.dropped.is_empty() {
            self.events.emit(
                ethica_topics::TOPIC_RECORDS_DROPPED,
                &json!({"op": "query", "dropped": batch.dropped}),
            );
        }
        let records = filter.apply(&batch.records, &self.schema, Utc::now());
        let entry = self.cache.put(&key, records);
        drop(flight);
        tracing::debug!(
            target: "ethica::query",
            connector = %self.connector,
            %key,
            rows = entry.payload.len(),
            "answered from remote"
        );
        Ok(QueryResult {
            records: Arc::clone(&entry.payload),
            source: ResultSource::Remote,
            fetched_at: entry.fetched_at,
            execution_time_ms: elapsed(started),
        })
    }

    fn local(&self, key: &str, filter: &Filter) -> Option<QueryResult<D::Record>> {
        if let Some(entry) = self.cache.get(key) {
            return Some(QueryResult {
                records: Arc::clone(&entry.payload),
                source: ResultSource::Cache,
                fetched_at: entry.fetched_at,
                execution_time_ms: 0,
            });
        }
        let snapshot = self.cache.get(&snapshot_key(&self.connector))?;
        Some(QueryResult {
            records: Arc::new(filter.apply(&snapshot.payload, &self.schema, Utc::now())),
            source: ResultSource::Snapshot,
            fetched_at: snapshot.fetched_at,
            execution_time_ms: 0,
        })
    }

    /// Parse and run a declarative query.
    pub async fn execute_sql(&self, sql: &str) -> Result<ResultSet, ConnectorError> {
        let ast = QueryAst::parse(sql)?;
        self.execute_declarative(&ast).await
    }

    pub async fn execute_declarative(&self, ast: &QueryAst) -> Result<ResultSet, ConnectorError> {
        let started = Instant::now();
        let plan = ast.plan(&self.schema)?;
        let result = self.query(&plan.filter).await?;
        let rows = plan.rows(&result.records, Utc::now());
        Ok(ResultSet {
            columns: plan.columns(),
            row_count: rows.len(),
            rows,
            execution_time_ms: started.elapsed().as_millis() as u64,
            source: result.source,
            fetched_at: result.fetched_at,
        })
    }

    /// One record by primary key.
    pub async fn get(&self, id: &str) -> Result<Option<D::Record>, ConnectorError> {
        if let Some(snapshot) = self.cache.get(&snapshot_key(&self.connector)) {
            if let Some(record) = snapshot.payload.iter().find(|r| r.id() == id) {
                return Ok(Some(record.clone()));
            }
        }
        let primary = self
            .schema
            .primary_key()
            .map(|c| c.name)
            .unwrap_or("id");
        let result = self.query(&Filter::new().eq(primary, id).limit(1)).await?;
        Ok(result.records.first().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::Employees;
    use crate::error::RemoteError;
    use crate::retry::RetryPolicy;
    use crate::test_support::MemorySource;
    use ethica_events::Bus;
    use serde_json::json;
    use std::time::Duration;

    fn facade(source: Arc<MemorySource>) -> (QueryFacade<Employees>, Arc<CacheManager<crate::domains::Employee>>) {
        let cache = Arc::new(CacheManager::new(Duration::from_secs(900)));
        let retry = RetryExecutor::new(
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
            },
            Duration::from_secs(5),
        );
        let events = EventSink::new(Bus::new(16), "hris");
        (
            QueryFacade::new("hris", Arc::clone(&cache), source, retry, events),
            cache,
        )
    }

    fn staff() -> Vec<Value> {
        vec![
            json!({"id": "1", "department": "Sales"}),
            json!({"id": "2", "department": "Finance"}),
            json!({"id": "3", "department": "sales"}),
        ]
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let source = Arc::new(MemorySource::new(staff()));
        let (facade, _) = facade(Arc::clone(&source));
        let filter = Filter::new().eq("department", "Sales");

        let first = facade.query(&filter).await.unwrap();
        assert_eq!(first.source, ResultSource::Remote);
        assert_eq!(first.records.len(), 2);
        let second = facade.query(&filter).await.unwrap();
        assert_eq!(second.source, ResultSource::Cache);
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn snapshot_answers_before_remote() {
        let source = Arc::new(MemorySource::new(staff()));
        let (facade, cache) = facade(Arc::clone(&source));
        let snapshot = staff()
            .iter()
            .map(|v| Employees::transform(v).unwrap())
            .collect();
        cache.put_unindexed(&snapshot_key("hris"), snapshot);

        let rs = facade
            .execute_sql("SELECT id FROM employees WHERE department = 'finance'")
            .await
            .unwrap();
        assert_eq!(rs.source, ResultSource::Snapshot);
        assert_eq!(rs.row_count, 1);
        assert_eq!(rs.rows[0]["id"], json!("2"));
        assert_eq!(facade.get("3").await.unwrap().unwrap().department, "sales");
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn unsupported_queries_never_fetch() {
        let source = Arc::new(MemorySource::new(staff()));
        let (facade, _) = facade(Arc::clone(&source));
        let err = facade
            .execute_sql("SELECT * FROM employees WHERE department = 'x' OR id = '1'")
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::UnsupportedQuery(_)));
        assert_eq!(source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_fetch() {
        let source = Arc::new(MemorySource::new(staff()).with_latency(Duration::from_millis(50)));
        let (facade, _) = facade(Arc::clone(&source));
        let facade = Arc::new(facade);
        let filter = Filter::new().eq("department", "Finance");
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let facade = Arc::clone(&facade);
                let filter = filter.clone();
                tokio::spawn(async move { facade.query(&filter).await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().records.len(), 1);
        }
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_failure() {
        let source = Arc::new(MemorySource::new(staff()).with_latency(Duration::from_millis(50)));
        source.fail_always(RemoteError::from_status(503, "maintenance"));
        let (facade, _) = facade(Arc::clone(&source));
        let facade = Arc::new(facade);
        let filter = Filter::new().eq("department", "Finance");
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let facade = Arc::clone(&facade);
                let filter = filter.clone();
                tokio::spawn(async move { facade.query(&filter).await })
            })
            .collect();
        for task in tasks {
            assert!(matches!(
                task.await.unwrap(),
                Err(ConnectorError::RemoteUnavailable { attempts: 2, .. })
            ));
        }
        assert_eq!(source.fetch_count(), 2, "one retry budget for the whole flight");
    }
}
