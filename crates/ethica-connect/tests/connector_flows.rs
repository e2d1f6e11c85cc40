use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ethica_connect::query::snapshot_key;
use ethica_connect::realtime::ChangeNotification;
use ethica_connect::test_support::{MemorySource, PushStep, ScriptedPush};
use ethica_connect::{
    Connector, ConnectorConfig, ConnectorError, DomainKind, Employees, Filter, Invalidation,
    RemoteError, ResultSource, SocketState, SyncMode, SyncOutcome, TrainingEvents,
};
use ethica_events::Bus;
use serde_json::{json, Value};

fn employee(id: usize, department: &str) -> Value {
    json!({
        "id": format!("E{id:04}"),
        "first_name": "Test",
        "last_name": format!("Person{id}"),
        "department": department,
        "employment_status": "active",
        "hire_date": "2021-04-01",
        "updated_at": "2025-01-01T00:00:00Z",
    })
}

fn config() -> ConnectorConfig {
    let mut config =
        ConnectorConfig::new("hris", DomainKind::Employees, "https://hris.example.com/api/");
    config.sync_interval_secs = 24 * 3600;
    config.retry.base_delay_ms = 100;
    config.retry.max_delay_ms = 1_000;
    config
}

fn connector(source: &Arc<MemorySource>) -> Connector<Employees> {
    Connector::new(config(), Bus::new(1024)).with_source(source.clone())
}

#[tokio::test(start_paused = true)]
async fn ttl_bounds_reuse_of_cached_data() {
    let source = Arc::new(MemorySource::new(vec![employee(1, "Finance")]));
    let connector = connector(&source);
    connector.connect().await.unwrap();
    assert_eq!(source.fetch_count(), 1, "initial sync");

    tokio::time::advance(Duration::from_secs(10 * 60)).await;
    let result = connector.query(&Filter::new()).await.unwrap();
    assert_eq!(result.records.len(), 1);
    assert_ne!(result.source, ResultSource::Remote);
    assert_eq!(source.fetch_count(), 1);

    tokio::time::advance(Duration::from_secs(10 * 60)).await;
    let result = connector.query(&Filter::new()).await.unwrap();
    assert_eq!(result.source, ResultSource::Remote);
    assert_eq!(source.fetch_count(), 2);

    let again = connector.query(&Filter::new()).await.unwrap();
    assert_eq!(again.source, ResultSource::Cache);
    assert_eq!(source.fetch_count(), 2);
    connector.disconnect().await.unwrap();
}

#[tokio::test]
async fn malformed_record_is_dropped_not_fatal() {
    let mut raw: Vec<Value> = (1..=1000).map(|i| employee(i, "Sales")).collect();
    raw[500] = json!({"first_name": "No", "last_name": "Identifier"});
    let source = Arc::new(MemorySource::new(raw));
    let bus = Bus::new(1024);
    let mut rx = bus.subscribe();
    let connector = Connector::<Employees>::new(config(), bus).with_source(source.clone());
    connector.connect().await.unwrap();

    match connector.sync_now(Some(SyncMode::Full)).await.unwrap() {
        SyncOutcome::Completed(report) => {
            assert_eq!(report.fetched, 1000);
            assert_eq!(report.dropped, 1);
            assert_eq!(report.records, 999);
        }
        SyncOutcome::Skipped => panic!("nothing else was syncing"),
    }
    assert_eq!(connector.query(&Filter::new()).await.unwrap().records.len(), 999);

    let mut dropped = Vec::new();
    while let Ok(env) = rx.try_recv() {
        if env.kind == "records.dropped" {
            dropped.push(env.payload);
        }
    }
    assert!(!dropped.is_empty());
    assert_eq!(dropped[0]["dropped"][0]["index"], json!(500));
}

#[tokio::test(start_paused = true)]
async fn overlapping_syncs_are_skipped() {
    let source = Arc::new(
        MemorySource::new(vec![employee(1, "Legal")]).with_latency(Duration::from_millis(200)),
    );
    let connector = connector(&source);
    connector.connect().await.unwrap();
    let before = source.fetch_count();

    let (a, b) = tokio::join!(connector.sync_now(None), connector.sync_now(None));
    let outcomes = [a.unwrap(), b.unwrap()];
    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, SyncOutcome::Completed(_)))
        .count();
    assert_eq!(completed, 1);
    assert!(outcomes.iter().any(|o| matches!(o, SyncOutcome::Skipped)));
    assert_eq!(source.fetch_count(), before + 1);
}

#[tokio::test]
async fn incremental_sync_makes_new_records_visible() {
    let source = Arc::new(MemorySource::new(vec![employee(1, "Finance")]));
    let connector = connector(&source);
    connector.connect().await.unwrap();
    let finance = Filter::new().eq("department", "Finance");
    assert_eq!(connector.query(&finance).await.unwrap().records.len(), 1);

    let mut hired = employee(2, "Finance");
    hired["updated_at"] = json!((Utc::now() + chrono::Duration::seconds(5)).to_rfc3339());
    source.upsert(hired);

    match connector.sync_now(Some(SyncMode::Incremental)).await.unwrap() {
        SyncOutcome::Completed(report) => {
            assert_eq!(report.mode, SyncMode::Incremental);
            assert_eq!(report.fetched, 1);
            assert_eq!(report.changed, 1);
        }
        SyncOutcome::Skipped => panic!("nothing else was syncing"),
    }
    let requests = source.requests();
    assert!(requests.last().unwrap().is_incremental());
    assert_eq!(connector.query(&finance).await.unwrap().records.len(), 2);
}

#[tokio::test]
async fn full_sync_tombstones_removed_records() {
    let source = Arc::new(MemorySource::new(vec![employee(1, "IT"), employee(2, "IT")]));
    let connector = connector(&source);
    connector.connect().await.unwrap();
    source.remove("E0002");
    connector.sync_now(Some(SyncMode::Full)).await.unwrap();
    let tombstones = connector.tombstones();
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].id, "E0002");
    assert_eq!(connector.get("E0002").await.unwrap(), None);
    assert!(connector.get("E0001").await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn outage_serves_last_known_good_until_ttl() {
    let source = Arc::new(MemorySource::new(vec![employee(1, "Sales"), employee(2, "Legal")]));
    let connector = connector(&source);
    connector.connect().await.unwrap();
    source.fail_always(RemoteError::from_status(503, "maintenance"));

    let sales = connector
        .query(&Filter::new().eq("department", "Sales"))
        .await
        .unwrap();
    assert_eq!(sales.records.len(), 1);
    assert_eq!(sales.source, ResultSource::Snapshot);

    tokio::time::advance(Duration::from_secs(16 * 60)).await;
    let before = source.fetch_count();
    let err = connector.query(&Filter::new()).await.unwrap_err();
    assert!(matches!(
        err,
        ConnectorError::RemoteUnavailable { attempts: 3, .. }
    ));
    assert_eq!(source.fetch_count() - before, 3);
}

#[tokio::test(start_paused = true)]
async fn push_reconnects_without_disturbing_queries() {
    let source = Arc::new(MemorySource::new(vec![employee(1, "Finance")]));
    let push = Arc::new(ScriptedPush::new(vec![
        PushStep::Deliver(Vec::new()),
        PushStep::Fail("connection refused".into()),
        PushStep::Fail("connection refused".into()),
        PushStep::Fail("connection refused".into()),
        PushStep::Hold(vec![ChangeNotification::record("employee.updated", "E0001")]),
    ]));
    let connector = connector(&source).with_push(push.clone());
    connector.connect().await.unwrap();

    let finance = Filter::new().eq("department", "Finance");
    for _ in 0..10 {
        let result = connector.query(&finance).await;
        assert!(result.is_ok(), "query failed during reconnect: {result:?}");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    assert_eq!(push.opens(), 5);
    let realtime = connector.status().realtime.unwrap();
    assert_eq!(realtime.state, SocketState::Open);
    assert_eq!(realtime.retry_count, 0);
    assert_eq!(realtime.notifications, 1);
    connector.disconnect().await.unwrap();
    assert!(connector.status().realtime.is_none());
}

#[tokio::test]
async fn declarative_and_structured_queries_share_cache_entries() {
    let source = Arc::new(MemorySource::new(vec![
        employee(1, "Finance"),
        employee(2, "Legal"),
    ]));
    let connector = connector(&source);
    connector.connect().await.unwrap();
    connector
        .cache()
        .invalidate(Invalidation::Key(&snapshot_key("hris")));

    let structured = connector
        .query(&Filter::new().eq("department", "Finance"))
        .await
        .unwrap();
    assert_eq!(structured.source, ResultSource::Remote);
    let fetches = source.fetch_count();

    let rows = connector
        .execute_sql("SELECT id, department FROM employees WHERE department = 'Finance'")
        .await
        .unwrap();
    assert_eq!(rows.source, ResultSource::Cache);
    assert_eq!(rows.row_count, 1);
    assert_eq!(rows.columns, vec!["id", "department"]);
    assert_eq!(rows.rows[0]["id"], json!("E0001"));
    assert_eq!(source.fetch_count(), fetches);
}

#[tokio::test]
async fn unsupported_shapes_are_rejected_before_any_fetch() {
    let source = Arc::new(MemorySource::new(vec![employee(1, "Finance")]));
    let connector = connector(&source);
    connector.connect().await.unwrap();
    let fetches = source.fetch_count();

    for sql in [
        "SELECT * FROM employees e JOIN surveys s ON e.id = s.employee_id",
        "SELECT * FROM employees WHERE department = 'Finance' OR department = 'Legal'",
        "SELECT * FROM employees ORDER BY hire_date",
        "SELECT * FROM surveys",
        "SELECT salary FROM employees",
        "SELECT MEDIAN(risk_score) FROM employees",
    ] {
        let err = connector.execute_sql(sql).await.unwrap_err();
        assert!(
            matches!(err, ConnectorError::UnsupportedQuery(_)),
            "{sql}: {err}"
        );
    }
    assert_eq!(source.fetch_count(), fetches);
}

#[tokio::test]
async fn aggregates_over_training_events() {
    let source = Arc::new(MemorySource::new(vec![
        json!({"id": "t1", "course_name": "Anti-bribery", "status": "completed", "score": 80, "passed": true}),
        json!({"id": "t2", "course_name": "Anti-bribery", "status": "completed", "score": 90, "passed": true}),
        json!({"id": "t3", "course_name": "Privacy", "status": "completed", "score": 55, "passed": false}),
    ]));
    let config = ConnectorConfig::new("lms", DomainKind::Training, "https://lms.example.com/");
    let connector =
        Connector::<TrainingEvents>::new(config, Bus::new(64)).with_source(source.clone());
    connector.connect().await.unwrap();

    let result = connector
        .execute_sql(
            "SELECT course_name, COUNT(*) AS n, AVG(score) FROM training_events GROUP BY course_name",
        )
        .await
        .unwrap();
    assert_eq!(result.row_count, 2);
    let bribery = result
        .rows
        .iter()
        .find(|row| row["course_name"] == json!("Anti-bribery"))
        .unwrap();
    assert_eq!(bribery["n"], json!(2));
    assert_eq!(bribery["avg(score)"], json!(85.0));

    let report = connector.analytics();
    assert_eq!(report.record_count, 3);
    assert!(!report.stale);
}

#[tokio::test]
async fn missing_credentials_fail_fast() {
    let connector = Connector::<Employees>::new(config(), Bus::new(8));
    let err = connector.connect().await.unwrap_err();
    assert!(matches!(err, ConnectorError::Configuration(_)), "{err}");
    assert!(matches!(
        connector.execute_sql("SELECT * FROM employees").await,
        Err(ConnectorError::NotConnected(_))
    ));
}

#[tokio::test]
async fn disconnect_stops_work_and_clears_state() {
    let source = Arc::new(MemorySource::new(vec![employee(1, "Finance")]));
    let connector = connector(&source);
    connector.connect().await.unwrap();
    assert!(!connector.cache().is_empty());

    connector.disconnect().await.unwrap();
    assert!(connector.cache().is_empty());
    assert!(matches!(
        connector.query(&Filter::new()).await,
        Err(ConnectorError::NotConnected(_))
    ));
    assert!(matches!(
        connector.sync_now(None).await,
        Err(ConnectorError::NotConnected(_))
    ));

    connector.connect().await.unwrap();
    assert_eq!(connector.query(&Filter::new()).await.unwrap().records.len(), 1);
}
