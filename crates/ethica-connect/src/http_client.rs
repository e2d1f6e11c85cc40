//! Shared `reqwest` setup for remote record fetches and the push channel.
//!
//! Socket tuning is read from `ETHICA_HTTP_*` variables so a slow HRIS or
//! LMS can be accommodated without touching connector configuration.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};

use crate::error::ConnectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTuning {
    pub connect_timeout: Duration,
    pub keepalive: Duration,
    pub pool_idle: Duration,
}

impl HttpTuning {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |key: &str, default: u64| {
            let value = lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(default);
            Duration::from_secs(value.max(1))
        };
        Self {
            connect_timeout: secs("ETHICA_HTTP_CONNECT_TIMEOUT_SECS", 3),
            keepalive: secs("ETHICA_HTTP_TCP_KEEPALIVE_SECS", 60),
            pool_idle: secs("ETHICA_HTTP_POOL_IDLE_SECS", 90),
        }
    }
}

/// Remote admins see which side of the connector is calling.
fn user_agent(role: &str) -> String {
    format!("ethica-connect/{} ({role})", env!("CARGO_PKG_VERSION"))
}

fn builder(role: &str) -> reqwest::ClientBuilder {
    let tuning = HttpTuning::from_env();
    reqwest::Client::builder()
        .user_agent(user_agent(role))
        .connect_timeout(tuning.connect_timeout)
        .tcp_keepalive(tuning.keepalive)
        .pool_idle_timeout(tuning.pool_idle)
}

fn build(role: &str, builder: reqwest::ClientBuilder) -> Result<reqwest::Client, ConnectorError> {
    builder
        .build()
        .map_err(|e| ConnectorError::config(format!("http client for {role}: {e}")))
}

/// Client for paged record fetches and probes, each bounded by `timeout`.
pub fn api_client(timeout: Duration) -> Result<reqwest::Client, ConnectorError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    build(
        "records",
        builder("records").default_headers(headers).timeout(timeout),
    )
}

/// Client for the change-notification stream; no overall timeout since the
/// response body stays open for as long as the channel does.
pub fn push_client() -> Result<reqwest::Client, ConnectorError> {
    build("push", builder("push"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn tuning_falls_back_and_clamps() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ETHICA_HTTP_CONNECT_TIMEOUT_SECS", " 10 "),
            ("ETHICA_HTTP_TCP_KEEPALIVE_SECS", "0"),
            ("ETHICA_HTTP_POOL_IDLE_SECS", "soon"),
        ]);
        let tuning = HttpTuning::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(tuning.connect_timeout, Duration::from_secs(10));
        assert_eq!(tuning.keepalive, Duration::from_secs(1));
        assert_eq!(tuning.pool_idle, Duration::from_secs(90));
    }

    #[test]
    fn user_agent_names_the_caller_role() {
        let agent = user_agent("push");
        assert!(agent.starts_with("ethica-connect/"));
        assert!(agent.ends_with("(push)"));
        assert!(api_client(Duration::from_secs(5)).is_ok());
        assert!(push_client().is_ok());
    }
}
