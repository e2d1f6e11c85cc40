//! Remote API boundary: parameterized fetch with bearer-token auth.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use url::Url;

use crate::error::{ConnectorError, RemoteError};
use crate::http_client;

/// Envelope keys that may wrap the record list, checked in order.
const ENVELOPE_KEYS: &[&str] = &[
    "data",
    "records",
    "items",
    "results",
    "employees",
    "responses",
    "events",
];

/// Incremental lower bound on the schema's watermark column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub column: &'static str,
    pub since: DateTime<Utc>,
}

impl Cursor {
    /// Sent as `{column}[gte]`, the same shape as pushed-down range predicates.
    pub fn param(&self) -> (String, String) {
        (
            format!("{}[gte]", self.column),
            self.since.to_rfc3339_opts(SecondsFormat::Secs, true),
        )
    }
}

/// What to fetch. Pushed-down filter parameters travel as a query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub cursor: Option<Cursor>,
    pub params: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn since(column: &'static str, since: DateTime<Utc>) -> Self {
        Self {
            cursor: Some(Cursor { column, since }),
            params: Vec::new(),
        }
    }

    pub fn filtered(params: Vec<(String, String)>) -> Self {
        Self {
            cursor: None,
            params,
        }
    }

    pub fn is_incremental(&self) -> bool {
        self.cursor.is_some()
    }

    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = self.params.clone();
        pairs.extend(self.cursor.as_ref().map(Cursor::param));
        pairs
    }
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Human-readable target for logs.
    fn describe(&self) -> String;

    /// Reachability check used by `connect()`, run under the connector's
    /// retry policy.
    async fn probe(&self) -> Result<(), RemoteError>;

    /// Raw domain records matching `request`.
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Value>, RemoteError>;
}

/// Accept a bare list or an object wrapping one under a known key.
pub fn unwrap_envelope(body: Value) -> Result<Vec<Value>, RemoteError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            for key in ENVELOPE_KEYS {
                match map.remove(*key) {
                    Some(Value::Array(items)) => return Ok(items),
                    Some(inner @ Value::Object(_)) => return unwrap_envelope(inner),
                    Some(_) | None => continue,
                }
            }
            Err(RemoteError::Decode(format!(
                "no record list under any of {}",
                ENVELOPE_KEYS.join(", ")
            )))
        }
        other => Err(RemoteError::Decode(format!(
            "expected list or envelope, found {}",
            crate::transform::value_kind(&other)
        ))),
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout(timeout.as_millis() as u64)
    } else if err.is_decode() {
        RemoteError::Decode(err.to_string())
    } else if let Some(status) = err.status() {
        RemoteError::from_status(status.as_u16(), err.to_string())
    } else {
        RemoteError::Network(err.to_string())
    }
}

/// HTTP JSON source authenticated with a bearer token.
pub struct HttpSource {
    client: reqwest::Client,
    url: Url,
    token: String,
    timeout: Duration,
}

impl HttpSource {
    pub fn new(url: Url, token: String, timeout: Duration) -> Result<Self, ConnectorError> {
        if token.trim().is_empty() {
            return Err(ConnectorError::config(format!("no API token for {url}")));
        }
        Ok(Self {
            client: http_client::api_client(timeout)?,
            url,
            token,
            timeout,
        })
    }

    async fn get(&self, pairs: &[(String, String)]) -> Result<reqwest::Response, RemoteError> {
        let resp = self
            .client
            .get(self.url.clone())
            .bearer_auth(&self.token)
            .query(pairs)
            .send()
            .await
            .map_err(|e| classify(e, self.timeout))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        Err(RemoteError::from_status(status.as_u16(), snippet))
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    fn describe(&self) -> String {
        self.url.to_string()
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        self.get(&[("limit".to_string(), "1".to_string())])
            .await
            .map(|_| ())
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Value>, RemoteError> {
        let resp = self.get(&request.query_pairs()).await?;
        let body: Value = resp.json().await.map_err(|e| classify(e, self.timeout))?;
        unwrap_envelope(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::Surveys;
    use crate::record::Domain;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn envelopes_unwrap_nested_lists() {
        assert_eq!(unwrap_envelope(json!([1, 2])).unwrap().len(), 2);
        assert_eq!(
            unwrap_envelope(json!({"meta": {}, "records": [{"id": 1}]}))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            unwrap_envelope(json!({"data": {"items": [{"id": 1}, {"id": 2}]}}))
                .unwrap()
                .len(),
            2
        );
        assert!(matches!(
            unwrap_envelope(json!({"status": "ok"})),
            Err(RemoteError::Decode(_))
        ));
        assert!(matches!(
            unwrap_envelope(json!("nope")),
            Err(RemoteError::Decode(_))
        ));
    }

    #[test]
    fn incremental_request_names_cursor_after_watermark_column() {
        let since = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let watermark = Surveys::schema().watermark().map(|c| c.name).unwrap();
        let mut req = FetchRequest::since(watermark, since);
        req.params.push(("department".into(), "Sales".into()));
        assert!(req.is_incremental());
        assert_eq!(
            req.query_pairs(),
            vec![
                ("department".to_string(), "Sales".to_string()),
                ("updated_at[gte]".to_string(), "2025-01-02T03:04:05Z".to_string()),
            ]
        );
        assert!(!FetchRequest::full().is_incremental());
    }

    #[test]
    fn empty_token_is_a_configuration_error() {
        let url = Url::parse("https://hris.example.com/api/employees").unwrap();
        assert!(matches!(
            HttpSource::new(url, "  ".into(), Duration::from_secs(5)),
            Err(ConnectorError::Configuration(_))
        ));
    }
}
