//! Transform pipeline helpers: tolerant field extraction and coercion.
//!
//! Remote payloads drift (renamed keys, nested objects, strings where numbers
//! belong). Every extractor here takes a list of candidate names, tries them
//! in order (dotted names walk nested objects) and falls back to a defined
//! default instead of failing.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::TransformError;
use crate::record::Domain;

pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn as_object(raw: &Value) -> Result<&Map<String, Value>, TransformError> {
    raw.as_object()
        .ok_or_else(|| TransformError::NotAnObject(value_kind(raw)))
}

fn lookup<'a>(raw: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    let mut parts = name.split('.');
    let first = parts.next()?;
    let mut current = raw.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// First candidate that is present and not null (or an empty string).
pub fn pick<'a>(raw: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| {
        lookup(raw, name).filter(|v| match v {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        })
    })
}

pub(crate) fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn opt_text(raw: &Map<String, Value>, names: &[&str]) -> Option<String> {
    pick(raw, names).and_then(scalar_text)
}

pub fn text(raw: &Map<String, Value>, names: &[&str]) -> String {
    opt_text(raw, names).unwrap_or_default()
}

pub fn identifier(raw: &Map<String, Value>, names: &[&str]) -> Result<String, TransformError> {
    opt_text(raw, names)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TransformError::MissingId(names.join("|")))
}

pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" | "on" | "t" => Some(true),
            "false" | "no" | "n" | "0" | "off" | "f" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn boolean(raw: &Map<String, Value>, names: &[&str], default: bool) -> bool {
    pick(raw, names).and_then(coerce_bool).unwrap_or(default)
}

pub fn coerce_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

pub fn number(raw: &Map<String, Value>, names: &[&str]) -> Option<f64> {
    pick(raw, names).and_then(coerce_f64)
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y", "%Y%m%d"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"];

/// Epoch numbers above this are taken as milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

fn epoch_to_utc(raw: i64) -> Option<DateTime<Utc>> {
    if raw.abs() >= EPOCH_MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}

pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(epoch_to_utc),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            for fmt in DATETIME_FORMATS {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(Utc.from_utc_datetime(&naive));
                }
            }
            for fmt in DATE_FORMATS {
                if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
                    return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
                }
            }
            if s.chars().all(|c| c.is_ascii_digit()) {
                return s.parse::<i64>().ok().and_then(epoch_to_utc);
            }
            None
        }
        _ => None,
    }
}

pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    parse_timestamp(value).map(|dt| dt.date_naive())
}

/// `YYYY-MM-DD`, or "" when no candidate parses.
pub fn date(raw: &Map<String, Value>, names: &[&str]) -> String {
    names
        .iter()
        .filter_map(|name| lookup(raw, name))
        .find_map(parse_date)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// RFC3339 (UTC, seconds precision), or "" when no candidate parses.
pub fn timestamp(raw: &Map<String, Value>, names: &[&str]) -> String {
    names
        .iter()
        .filter_map(|name| lookup(raw, name))
        .find_map(parse_timestamp)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// Parse a stored `YYYY-MM-DD`; "" yields `None`.
pub fn stored_date(s: &str) -> Option<NaiveDate> {
    if s.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

/// Parse a stored RFC3339 timestamp; "" yields `None`.
pub fn stored_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, Serialize)]
pub struct DroppedRecord {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug)]
pub struct BatchOutcome<R> {
    pub records: Vec<R>,
    pub dropped: Vec<DroppedRecord>,
}

/// Transform a whole batch; malformed records are dropped and logged, never fatal.
pub fn transform_batch<D: Domain>(connector: &str, raw: &[Value]) -> BatchOutcome<D::Record> {
    let mut records = Vec::with_capacity(raw.len());
    let mut dropped = Vec::new();
    for (index, item) in raw.iter().enumerate() {
        match D::transform(item) {
            Ok(record) => records.push(record),
            Err(err) => {
                tracing::warn!(
                    target: "ethica::transform",
                    connector,
                    domain = %D::KIND,
                    index,
                    error = %err,
                    "dropping malformed raw record"
                );
                dropped.push(DroppedRecord {
                    index,
                    reason: err.to_string(),
                });
            }
        }
    }
    BatchOutcome { records, dropped }
}
