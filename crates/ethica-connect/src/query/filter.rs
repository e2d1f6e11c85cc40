//! Structured filters: validation against a table schema, canonical cache
//! keys, remote push-down parameters and local evaluation.

use std::cmp::Ordering;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::ConnectorError;
use crate::record::{is_absent, CanonicalRecord};
use crate::schema::{SemanticType, TableSchema};
use crate::transform::{coerce_bool, coerce_f64, parse_date, parse_timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    pub fn is_range(self) -> bool {
        !matches!(self, CompareOp::Eq | CompareOp::Ne)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Lt => "lt",
            CompareOp::Lte => "lte",
            CompareOp::Gt => "gt",
            CompareOp::Gte => "gte",
        }
    }

    fn accepts(self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Lte => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Gte => ord != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub column: String,
    pub op: CompareOp,
    pub value: Value,
}

/// Equality/range predicates (AND-ed) with optional paging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub predicates: Vec<Predicate>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, op: CompareOp, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate {
            column: column.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.with(column, CompareOp::Eq, value)
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Same predicates without paging.
    pub fn unpaged(&self) -> Self {
        Self {
            predicates: self.predicates.clone(),
            limit: None,
            offset: None,
        }
    }

    /// Validate against `schema`, canonicalize column names, coerce literal
    /// values to the column type and sort predicates so that equivalent
    /// filters produce identical cache keys.
    pub fn normalize(&self, schema: &TableSchema) -> Result<Filter, ConnectorError> {
        let mut predicates = Vec::with_capacity(self.predicates.len());
        for pred in &self.predicates {
            let column = schema.column(&pred.column).ok_or_else(|| {
                ConnectorError::unsupported(format!(
                    "unknown column '{}' on table {}",
                    pred.column, schema.table
                ))
            })?;
            if pred.op.is_range() && !column.ty.is_ordered() {
                return Err(ConnectorError::unsupported(format!(
                    "range predicate on non-ordered column '{}'",
                    column.name
                )));
            }
            let value = coerce_literal(&pred.value, column.ty).ok_or_else(|| {
                ConnectorError::unsupported(format!(
                    "value {} is not a valid {:?} for column '{}'",
                    pred.value, column.ty, column.name
                ))
            })?;
            predicates.push(Predicate {
                column: column.name.to_string(),
                op: pred.op,
                value,
            });
        }
        predicates.sort_by(|a, b| {
            (a.column.as_str(), a.op)
                .cmp(&(b.column.as_str(), b.op))
                .then_with(|| a.value.to_string().cmp(&b.value.to_string()))
        });
        predicates.dedup();
        Ok(Filter {
            predicates,
            limit: self.limit,
            offset: self.offset.filter(|o| *o > 0),
        })
    }

    /// Deterministic key: `{connector}:query:{op}:{sha256 of canonical json}`.
    /// Call on a normalized filter.
    pub fn cache_key(&self, connector: &str, operation: &str) -> String {
        let body = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&body);
        format!("{}{}:{:x}", query_prefix(connector), operation, digest)
    }

    /// Query-string parameters for predicates the remote can evaluate:
    /// those on primary or filterable stored columns. Everything else is
    /// evaluated locally.
    pub fn pushdown(&self, schema: &TableSchema) -> Vec<(String, String)> {
        self.predicates
            .iter()
            .filter(|p| schema.column(&p.column).is_some_and(|c| c.is_pushable()))
            .map(|p| {
                let name = if p.op == CompareOp::Eq {
                    p.column.clone()
                } else {
                    format!("{}[{}]", p.column, p.op.as_str())
                };
                let value = match &p.value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name, value)
            })
            .collect()
    }

    pub fn matches<R: CanonicalRecord>(
        &self,
        record: &R,
        schema: &TableSchema,
        now: DateTime<Utc>,
    ) -> bool {
        self.predicates.iter().all(|pred| {
            let ty = schema
                .column(&pred.column)
                .map(|c| c.ty)
                .unwrap_or(SemanticType::Text);
            let field = record.field(&pred.column, now);
            if is_absent(&field) {
                return false;
            }
            compare(&field, &pred.value, ty)
                .map(|ord| pred.op.accepts(ord))
                .unwrap_or(false)
        })
    }

    /// Filter `records` locally, then apply offset and limit.
    pub fn apply<R: CanonicalRecord>(
        &self,
        records: &[R],
        schema: &TableSchema,
        now: DateTime<Utc>,
    ) -> Vec<R> {
        let matching = records.iter().filter(|r| self.matches(*r, schema, now));
        paginate(matching, self.offset, self.limit)
            .cloned()
            .collect()
    }
}

pub(crate) fn paginate<I: Iterator>(
    iter: I,
    offset: Option<usize>,
    limit: Option<usize>,
) -> impl Iterator<Item = I::Item> {
    iter.skip(offset.unwrap_or(0)).take(limit.unwrap_or(usize::MAX))
}

pub fn query_prefix(connector: &str) -> String {
    format!("{connector}:query:")
}

pub fn snapshot_key(connector: &str) -> String {
    format!("{connector}:snapshot")
}

fn coerce_literal(value: &Value, ty: SemanticType) -> Option<Value> {
    match ty {
        SemanticType::Integer => {
            let f = coerce_f64(value)?;
            (f.fract() == 0.0).then(|| Value::from(f as i64))
        }
        SemanticType::Float => coerce_f64(value).map(Value::from),
        SemanticType::Boolean => coerce_bool(value).map(Value::Bool),
        SemanticType::Date => {
            parse_date(value).map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
        }
        SemanticType::Timestamp => parse_timestamp(value)
            .map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::Secs, true))),
        SemanticType::Text | SemanticType::Enum => match value {
            Value::String(s) => Some(Value::String(s.clone())),
            Value::Number(n) => Some(Value::String(n.to_string())),
            Value::Bool(b) => Some(Value::String(b.to_string())),
            _ => None,
        },
    }
}

/// Order a record field against a normalized literal of column type `ty`.
fn compare(field: &Value, literal: &Value, ty: SemanticType) -> Option<Ordering> {
    match ty {
        SemanticType::Integer | SemanticType::Float => {
            coerce_f64(field)?.partial_cmp(&coerce_f64(literal)?)
        }
        SemanticType::Boolean => {
            let (a, b) = (coerce_bool(field)?, coerce_bool(literal)?);
            Some(a.cmp(&b))
        }
        SemanticType::Date => Some(parse_date(field)?.cmp(&parse_date(literal)?)),
        SemanticType::Timestamp => Some(parse_timestamp(field)?.cmp(&parse_timestamp(literal)?)),
        SemanticType::Text | SemanticType::Enum => {
            let a = field.as_str()?.to_lowercase();
            let b = literal.as_str()?.to_lowercase();
            Some(a.cmp(&b))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::{Employees, TrainingEvents};
    use crate::record::Domain;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap()
    }

    #[test]
    fn equivalent_filters_share_a_cache_key() {
        let schema = Employees::schema();
        let a = Filter::new()
            .eq("Department", "Sales")
            .with("tenure_months", CompareOp::Gte, "12")
            .limit(10)
            .normalize(&schema)
            .unwrap();
        let b = Filter::new()
            .with("tenure_months", CompareOp::Gte, 12)
            .eq("department", "Sales")
            .limit(10)
            .offset(0)
            .normalize(&schema)
            .unwrap();
        assert_eq!(a.cache_key("hris", "select"), b.cache_key("hris", "select"));
        assert!(a.cache_key("hris", "select").starts_with("hris:query:"));
        assert_ne!(
            a.cache_key("hris", "select"),
            a.clone().limit(11).cache_key("hris", "select")
        );
    }

    #[test]
    fn normalization_rejects_bad_shapes() {
        let schema = Employees::schema();
        let unknown = Filter::new().eq("salary", 10).normalize(&schema);
        assert!(matches!(unknown, Err(ConnectorError::UnsupportedQuery(_))));
        let bool_range = Filter::new()
            .with("is_manager", CompareOp::Gt, true)
            .normalize(&schema);
        assert!(matches!(bool_range, Err(ConnectorError::UnsupportedQuery(_))));
        let bad_date = Filter::new()
            .with("hire_date", CompareOp::Gte, "someday")
            .normalize(&schema);
        assert!(matches!(bad_date, Err(ConnectorError::UnsupportedQuery(_))));
    }

    #[test]
    fn pushdown_sends_only_indexed_columns() {
        let schema = TrainingEvents::schema();
        let filter = Filter::new()
            .eq("department", "Ops")
            .with("expires_at", CompareOp::Lt, "2025-07-01")
            .eq("compliance_status", "expired")
            .with("course_id", CompareOp::Ne, "C-9")
            .with("updated_at", CompareOp::Gt, "2025-01-01T00:00:00Z")
            .normalize(&schema)
            .unwrap();
        assert_eq!(
            filter.pushdown(&schema),
            vec![
                ("course_id[ne]".to_string(), "C-9".to_string()),
                ("department".to_string(), "Ops".to_string()),
            ]
        );

        let by_id = Filter::new().eq("id", "T-1").normalize(&schema).unwrap();
        assert_eq!(
            by_id.pushdown(&schema),
            vec![("id".to_string(), "T-1".to_string())]
        );
    }

    #[test]
    fn local_evaluation_uses_derived_fields_and_skips_unknowns() {
        let schema = TrainingEvents::schema();
        let records: Vec<_> = [
            json!({"id": "1", "completed_at": "2024-01-01", "expires_at": "2025-06-01"}),
            json!({"id": "2", "completed_at": "2024-01-01", "expires_at": "2026-06-01"}),
            json!({"id": "3", "completed_at": "2024-01-01", "expires_at": "bogus"}),
        ]
        .iter()
        .map(|v| TrainingEvents::transform(v).unwrap())
        .collect();

        let expired = Filter::new()
            .eq("compliance_status", "EXPIRED")
            .normalize(&schema)
            .unwrap();
        let hits = expired.apply(&records, &schema, now());
        assert_eq!(hits.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["1"]);

        let before = Filter::new()
            .with("expires_at", CompareOp::Lt, "2030-01-01")
            .normalize(&schema)
            .unwrap();
        assert_eq!(before.apply(&records, &schema, now()).len(), 2, "'' never matches");
    }

    #[test]
    fn paging_applies_after_filtering() {
        let schema = Employees::schema();
        let records: Vec<_> = (0..10)
            .map(|i| Employees::transform(&json!({"id": i, "dept": "Ops"})).unwrap())
            .collect();
        let page = Filter::new()
            .eq("department", "ops")
            .offset(3)
            .limit(4)
            .normalize(&schema)
            .unwrap()
            .apply(&records, &schema, now());
        assert_eq!(
            page.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["3", "4", "5", "6"]
        );
    }
}
