//! Connector configuration: TOML validated against the derived JSON schema.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::OnceCell;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ConnectorError;
use crate::record::DomainKind;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub connectors: Vec<ConnectorConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per remote call, first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RealtimeConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Push channel URL; defaults to `<endpoint>/stream`.
    #[serde(default)]
    pub url: Option<String>,
    /// Reconnect backoff ceiling (default 60000).
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ConnectorConfig {
    /// Unique connector id; prefixes every cache key.
    pub id: String,
    pub domain: DomainKind,
    /// Remote API base, e.g. <https://hris.example.com/api/v1/>
    pub base_url: String,
    /// Path under `base_url`; defaults per domain.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Bearer token. Prefer `token_env` outside of local testing.
    #[serde(default)]
    pub token: Option<String>,
    /// Environment variable holding the bearer token.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Every Nth scheduled sync is a full one.
    #[serde(default = "default_full_sync_every")]
    pub full_sync_every: u32,
    /// Per-call timeout, independent of retries.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_cache_ttl_secs() -> u64 {
    900
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_sync_interval_secs() -> u64 {
    300
}
fn default_full_sync_every() -> u32 {
    12
}
fn default_request_timeout_secs() -> u64 {
    20
}

const DEFAULT_REALTIME_MAX_BACKOFF_MS: u64 = 60_000;

impl ConnectorConfig {
    pub fn new(id: &str, domain: DomainKind, base_url: &str) -> Self {
        Self {
            id: id.to_string(),
            domain,
            base_url: base_url.to_string(),
            endpoint: None,
            token: None,
            token_env: None,
            cache_ttl_secs: default_cache_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            full_sync_every: default_full_sync_every(),
            request_timeout_secs: default_request_timeout_secs(),
            retry: RetryConfig::default(),
            realtime: RealtimeConfig::default(),
        }
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// Structural checks; failing here is a configuration error, never retried.
    pub fn validate(&self) -> Result<(), ConnectorError> {
        if self.id.trim().is_empty() || self.id.contains(':') {
            return Err(ConnectorError::config(format!(
                "connector id '{}' must be non-empty and contain no ':'",
                self.id
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConnectorError::config(format!(
                "{}: retry.max_attempts must be at least 1",
                self.id
            )));
        }
        for (name, value) in [
            ("cache_ttl_secs", self.cache_ttl_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("sync_interval_secs", self.sync_interval_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConnectorError::config(format!(
                    "{}: {name} must be greater than zero",
                    self.id
                )));
            }
        }
        self.endpoint_url()?;
        if self.realtime.enabled {
            self.realtime_url()?;
        }
        Ok(())
    }

    /// Inline token, else the `token_env` variable.
    pub fn resolve_token(&self) -> Result<String, ConnectorError> {
        let token = match (&self.token, &self.token_env) {
            (Some(token), _) => Some(token.clone()),
            (None, Some(var)) => std::env::var(var).ok(),
            (None, None) => None,
        };
        token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ConnectorError::config(format!(
                    "{}: missing credentials (set token or token_env{})",
                    self.id,
                    self.token_env
                        .as_deref()
                        .map(|v| format!("; {v} is unset"))
                        .unwrap_or_default()
                ))
            })
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(match self.domain {
            DomainKind::Employees => "employees",
            DomainKind::Surveys => "survey-responses",
            DomainKind::Training => "training-events",
        })
    }

    pub fn endpoint_url(&self) -> Result<Url, ConnectorError> {
        let mut base = parse_http_url(&self.id, "base_url", &self.base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(self.endpoint().trim_start_matches('/'))
            .map_err(|e| ConnectorError::config(format!("{}: endpoint: {e}", self.id)))
    }

    pub fn realtime_url(&self) -> Result<Url, ConnectorError> {
        match &self.realtime.url {
            Some(url) => parse_http_url(&self.id, "realtime.url", url),
            None => {
                let mut url = self.endpoint_url()?;
                let path = format!("{}/stream", url.path().trim_end_matches('/'));
                url.set_path(&path);
                Ok(url)
            }
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    /// Same backoff shape as remote calls, capped by `realtime.max_backoff_ms`.
    pub fn realtime_backoff(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: u32::MAX,
            base_delay: Duration::from_millis(self.retry.base_delay_ms.max(1)),
            max_delay: Duration::from_millis(
                self.realtime
                    .max_backoff_ms
                    .unwrap_or(DEFAULT_REALTIME_MAX_BACKOFF_MS),
            ),
        }
    }
}

fn parse_http_url(id: &str, field: &str, raw: &str) -> Result<Url, ConnectorError> {
    let url = Url::parse(raw)
        .map_err(|e| ConnectorError::config(format!("{id}: {field} '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConnectorError::config(format!(
            "{id}: {field} must be http(s), got '{}'",
            url.scheme()
        )));
    }
    Ok(url)
}

static CONFIG_SCHEMA: OnceCell<Validator> = OnceCell::new();

fn schema_validator() -> Result<&'static Validator> {
    CONFIG_SCHEMA.get_or_try_init(|| {
        let schema = config_schema_json()?;
        validator_for(&schema).map_err(|e| anyhow::anyhow!("invalid config schema: {e}"))
    })
}

/// JSON schema describing the configuration file.
pub fn config_schema_json() -> Result<serde_json::Value> {
    let schema = schemars::schema_for!(Config);
    Ok(serde_json::to_value(&schema)?)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content).context("parsing config TOML")?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = schema_validator()?
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    let mut seen = HashSet::new();
    for connector in &cfg.connectors {
        if !seen.insert(connector.id.as_str()) {
            anyhow::bail!("duplicate connector id '{}'", connector.id);
        }
    }
    Ok(cfg)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    parse_config(&content).with_context(|| format!("loading config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[connectors]]
id = "hris"
domain = "employees"
base_url = "https://hris.example.com/api/v1"
token = "secret"

[[connectors]]
id = "lms"
domain = "training"
base_url = "https://lms.example.com"
endpoint = "/completions"
token_env = "ETHICA_TEST_UNSET_TOKEN_VAR"
cache_ttl_secs = 60

[connectors.retry]
max_attempts = 5

[connectors.realtime]
enabled = true
"#;

    #[test]
    fn parses_with_defaults() {
        let cfg = parse_config(SAMPLE).unwrap();
        let hris = &cfg.connectors[0];
        assert_eq!(hris.cache_ttl(), Duration::from_secs(900));
        assert_eq!(hris.retry, RetryConfig::default());
        assert_eq!(
            hris.endpoint_url().unwrap().as_str(),
            "https://hris.example.com/api/v1/employees"
        );
        assert_eq!(hris.resolve_token().unwrap(), "secret");

        let lms = &cfg.connectors[1];
        assert_eq!(lms.domain, DomainKind::Training);
        assert_eq!(lms.retry_policy().max_attempts, 5);
        assert_eq!(lms.retry.base_delay_ms, 500);
        assert_eq!(
            lms.realtime_url().unwrap().as_str(),
            "https://lms.example.com/completions/stream"
        );
        assert!(lms.validate().is_ok());
    }

    #[test]
    fn missing_credentials_are_a_configuration_error() {
        let cfg = parse_config(SAMPLE).unwrap();
        let err = cfg.connectors[1].resolve_token().unwrap_err();
        assert!(matches!(err, ConnectorError::Configuration(_)));
        assert!(err.to_string().contains("ETHICA_TEST_UNSET_TOKEN_VAR"));
    }

    #[test]
    fn schema_rejects_bad_shapes() {
        let wrong_type = r#"
[[connectors]]
id = "x"
domain = "employees"
base_url = "https://x"
cache_ttl_secs = "soon"
"#;
        assert!(parse_config(wrong_type).is_err());
        let bad_domain = r#"
[[connectors]]
id = "x"
domain = "payroll"
base_url = "https://x"
"#;
        assert!(parse_config(bad_domain).is_err());
        let duplicate = format!("{SAMPLE}\n[[connectors]]\nid = \"hris\"\ndomain = \"surveys\"\nbase_url = \"https://y\"\n");
        let err = parse_config(&duplicate).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn structural_validation() {
        let mut cfg = ConnectorConfig::new("hris", DomainKind::Employees, "ftp://files");
        assert!(matches!(cfg.validate(), Err(ConnectorError::Configuration(_))));
        cfg.base_url = "https://hris".into();
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());
        cfg.retry.max_attempts = 1;
        assert!(cfg.validate().is_ok());
        cfg.id = "a:b".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_from_file_and_emits_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ethica.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(load_config(&path).unwrap().connectors.len(), 2);
        let schema = config_schema_json().unwrap();
        assert!(schema.to_string().contains("connectors"));
    }
}
