use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TransformError;
use crate::schema::TableSchema;

/// Normalized, domain-typed representation of one remote entity.
///
/// Records store only what the remote sent (after coercion). Derived
/// columns are produced by [`CanonicalRecord::field`] against the caller's
/// clock, so they never go stale inside the cache.
pub trait CanonicalRecord: Clone + PartialEq + Send + Sync + Serialize + 'static {
    /// Stable unique identifier.
    fn id(&self) -> &str;

    /// Column value as of `now`. Unknown columns yield `Value::Null`.
    fn field(&self, column: &str, now: DateTime<Utc>) -> Value;

    /// Remote modification time, when the source reports one.
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// One data domain served by a connector: its schema and its transform.
pub trait Domain: Send + Sync + 'static {
    type Record: CanonicalRecord;

    const KIND: DomainKind;

    fn schema() -> TableSchema;

    /// Map one raw payload into a canonical record.
    ///
    /// Only structurally unusable input (not an object, no identifier) is an
    /// error; every other defect is absorbed by fallbacks.
    fn transform(raw: &Value) -> Result<Self::Record, TransformError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DomainKind {
    Employees,
    Surveys,
    Training,
}

impl DomainKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DomainKind::Employees => "employees",
            DomainKind::Surveys => "surveys",
            DomainKind::Training => "training",
        }
    }
}

impl std::fmt::Display for DomainKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Empty strings stand in for unknown dates; treat them as absent.
pub fn is_absent(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
