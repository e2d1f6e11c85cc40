//! Analytics Aggregator: statistics over the materialized record set.
//!
//! Everything here is a pure function of the records handed in plus the
//! caller's clock. Empty input yields zeroed reports, never errors.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::domains::survey::round2;
use crate::domains::{Employee, Employees, SurveyResponse, Surveys, TrainingEvent, TrainingEvents};
use crate::error::ConnectorError;
use crate::record::{is_absent, Domain};
use crate::transform::{coerce_f64, parse_timestamp, stored_date, stored_timestamp};

/// Length of the day-bucketed trend series, ending today.
pub const TREND_WINDOW_DAYS: u32 = 30;

/// Whitelisted aggregate functions for declarative queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    Count,
    Avg,
    Sum,
    Min,
    Max,
}

impl AggFunc {
    pub fn as_str(self) -> &'static str {
        match self {
            AggFunc::Count => "count",
            AggFunc::Avg => "avg",
            AggFunc::Sum => "sum",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
        }
    }

    /// Reduce one column's values. `COUNT` counts present values, the
    /// numeric functions ignore non-numeric ones. Empty input gives 0
    /// (`MIN`/`MAX` give null).
    pub fn apply(self, values: &[Value]) -> Value {
        let present = values.iter().filter(|v| !is_absent(v));
        match self {
            AggFunc::Count => Value::from(present.count() as u64),
            AggFunc::Sum => {
                Value::from(round2(present.filter_map(coerce_f64).sum::<f64>()))
            }
            AggFunc::Avg => Value::from(average(present.filter_map(coerce_f64))),
            AggFunc::Min | AggFunc::Max => {
                let numbers: Vec<f64> = values.iter().filter_map(coerce_f64).collect();
                if !numbers.is_empty() {
                    let pick = numbers.into_iter().reduce(|a, b| match self {
                        AggFunc::Min => a.min(b),
                        _ => a.max(b),
                    });
                    return pick.map(Value::from).unwrap_or(Value::Null);
                }
                let texts = values.iter().filter_map(|v| v.as_str()).filter(|s| !s.is_empty());
                let pick = match self {
                    AggFunc::Min => texts.min(),
                    _ => texts.max(),
                };
                pick.map(Value::from).unwrap_or(Value::Null)
            }
        }
    }
}

impl FromStr for AggFunc {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "count" => Ok(AggFunc::Count),
            "avg" | "average" => Ok(AggFunc::Avg),
            "sum" => Ok(AggFunc::Sum),
            "min" => Ok(AggFunc::Min),
            "max" => Ok(AggFunc::Max),
            other => Err(ConnectorError::unsupported(format!(
                "aggregate function '{other}' is not supported"
            ))),
        }
    }
}

/// Mean rounded to two decimals; 0 for no values.
pub fn average(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, n) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 {
        0.0
    } else {
        round2(sum / n as f64)
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round2(part as f64 / whole as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub key: String,
    pub count: usize,
    pub share: f64,
}

/// Count records per key, largest first (ties by key). Blank keys are
/// reported as `unknown`.
pub fn breakdown<'a, R: 'a>(
    records: impl IntoIterator<Item = &'a R>,
    key: impl Fn(&R) -> String,
) -> Vec<Bucket> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut total = 0usize;
    for record in records {
        let k = key(record);
        let k = if k.trim().is_empty() { "unknown".to_string() } else { k };
        *counts.entry(k).or_default() += 1;
        total += 1;
    }
    let mut buckets: Vec<Bucket> = counts
        .into_iter()
        .map(|(key, count)| Bucket {
            share: ratio(count, total),
            key,
            count,
        })
        .collect();
    buckets.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    buckets
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub day: NaiveDate,
    pub count: usize,
    /// Mean of the values observed that day; 0 when none.
    pub average: f64,
}

/// One point per day for the `window_days` days ending on `now`'s date,
/// oldest first. Records dated outside the window are ignored.
pub fn daily_trend<'a, R: 'a>(
    records: impl IntoIterator<Item = &'a R>,
    now: DateTime<Utc>,
    window_days: u32,
    day_of: impl Fn(&R) -> Option<NaiveDate>,
    value_of: impl Fn(&R) -> Option<f64>,
) -> Vec<TrendPoint> {
    let window = i64::from(window_days.max(1));
    let today = now.date_naive();
    let first = today - Duration::days(window - 1);
    let mut days: BTreeMap<NaiveDate, (usize, Vec<f64>)> = (0..window)
        .map(|offset| (first + Duration::days(offset), (0, Vec::new())))
        .collect();
    for record in records {
        let Some(day) = day_of(record) else { continue };
        if let Some((count, values)) = days.get_mut(&day) {
            *count += 1;
            values.extend(value_of(record));
        }
    }
    days.into_iter()
        .map(|(day, (count, values))| TrendPoint {
            day,
            count,
            average: average(values),
        })
        .collect()
}

fn day_of_stamp(stamp: &str) -> Option<NaiveDate> {
    stored_timestamp(stamp)
        .or_else(|| parse_timestamp(&Value::from(stamp)))
        .map(|t| t.date_naive())
        .or_else(|| stored_date(stamp))
}

/// Domains that know how to summarize their record set.
pub trait Analyze: Domain {
    type Report: Serialize + Send + Sync + 'static;

    fn analyze(records: &[Self::Record], now: DateTime<Utc>) -> Self::Report;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepartmentRisk {
    pub department: String,
    pub headcount: usize,
    pub average_risk_score: f64,
    pub high_risk: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmployeeReport {
    pub total: usize,
    pub active: usize,
    pub average_risk_score: f64,
    pub risk_levels: Vec<Bucket>,
    pub departments: Vec<DepartmentRisk>,
    pub hires: Vec<TrendPoint>,
}

impl Analyze for Employees {
    type Report = EmployeeReport;

    fn analyze(records: &[Employee], now: DateTime<Utc>) -> EmployeeReport {
        let active: Vec<&Employee> = records.iter().filter(|e| e.is_active()).collect();
        let mut by_department: BTreeMap<String, Vec<&Employee>> = BTreeMap::new();
        for employee in &active {
            let dept = if employee.department.is_empty() {
                "unknown".to_string()
            } else {
                employee.department.clone()
            };
            by_department.entry(dept).or_default().push(employee);
        }
        let mut departments: Vec<DepartmentRisk> = by_department
            .into_iter()
            .map(|(department, members)| DepartmentRisk {
                headcount: members.len(),
                average_risk_score: average(
                    members.iter().map(|e| f64::from(e.risk_score(now))),
                ),
                high_risk: members
                    .iter()
                    .filter(|e| e.risk_level(now) == crate::domains::RiskLevel::High)
                    .count(),
                department,
            })
            .collect();
        departments.sort_by(|a, b| {
            b.average_risk_score
                .total_cmp(&a.average_risk_score)
                .then_with(|| a.department.cmp(&b.department))
        });
        EmployeeReport {
            total: records.len(),
            active: active.len(),
            average_risk_score: average(active.iter().map(|e| f64::from(e.risk_score(now)))),
            risk_levels: breakdown(active.iter().copied(), |e| {
                e.risk_level(now).as_str().to_string()
            }),
            departments,
            hires: daily_trend(
                records,
                now,
                TREND_WINDOW_DAYS,
                |e| stored_date(&e.hire_date),
                |_| None,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurveyReport {
    pub responses: usize,
    pub completion_rate: f64,
    pub average_score: f64,
    pub sentiment: Vec<Bucket>,
    pub concerns: usize,
    pub departments: Vec<Bucket>,
    pub score_trend: Vec<TrendPoint>,
}

impl Analyze for Surveys {
    type Report = SurveyReport;

    fn analyze(records: &[SurveyResponse], now: DateTime<Utc>) -> SurveyReport {
        SurveyReport {
            responses: records.len(),
            completion_rate: ratio(records.iter().filter(|r| r.completed).count(), records.len()),
            average_score: average(records.iter().filter_map(|r| r.average_score())),
            sentiment: breakdown(records, |r| r.sentiment().as_str().to_string()),
            concerns: records.iter().filter(|r| r.concern_flag()).count(),
            departments: breakdown(records, |r| r.department.clone()),
            score_trend: daily_trend(
                records,
                now,
                TREND_WINDOW_DAYS,
                |r| day_of_stamp(&r.submitted_at),
                |r| r.average_score(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseEffectiveness {
    pub course_id: String,
    pub course_name: String,
    pub enrolled: usize,
    pub completed: usize,
    pub completion_rate: f64,
    pub average_score: f64,
    pub pass_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub events: usize,
    pub completion_rate: f64,
    /// Share of graded events that passed.
    pub pass_rate: f64,
    /// Share of required events currently compliant.
    pub compliance_rate: f64,
    pub compliance: Vec<Bucket>,
    pub categories: Vec<Bucket>,
    pub courses: Vec<CourseEffectiveness>,
    pub completions: Vec<TrendPoint>,
}

fn pass_rate<'a>(events: impl IntoIterator<Item = &'a TrainingEvent>) -> f64 {
    let outcomes: Vec<bool> = events.into_iter().filter_map(|e| e.outcome()).collect();
    ratio(outcomes.iter().filter(|p| **p).count(), outcomes.len())
}

impl Analyze for TrainingEvents {
    type Report = TrainingReport;

    fn analyze(records: &[TrainingEvent], now: DateTime<Utc>) -> TrainingReport {
        let mut by_course: BTreeMap<String, Vec<&TrainingEvent>> = BTreeMap::new();
        for event in records {
            let key = if event.course_id.is_empty() {
                event.course_name.clone()
            } else {
                event.course_id.clone()
            };
            by_course.entry(key).or_default().push(event);
        }
        let courses = by_course
            .into_iter()
            .map(|(course_id, events)| {
                let completed = events.iter().filter(|e| e.is_completed()).count();
                CourseEffectiveness {
                    course_name: events
                        .iter()
                        .map(|e| e.course_name.as_str())
                        .find(|n| !n.is_empty())
                        .unwrap_or_default()
                        .to_string(),
                    enrolled: events.len(),
                    completed,
                    completion_rate: ratio(completed, events.len()),
                    average_score: average(events.iter().filter_map(|e| e.score)),
                    pass_rate: pass_rate(events.iter().copied()),
                    course_id,
                }
            })
            .collect();
        let required: Vec<&TrainingEvent> = records.iter().filter(|e| e.required).collect();
        TrainingReport {
            events: records.len(),
            completion_rate: ratio(
                records.iter().filter(|e| e.is_completed()).count(),
                records.len(),
            ),
            pass_rate: pass_rate(records),
            compliance_rate: ratio(
                required
                    .iter()
                    .filter(|e| e.compliance_status(now).is_compliant())
                    .count(),
                required.len(),
            ),
            compliance: breakdown(records, |e| e.compliance_status(now).as_str().to_string()),
            categories: breakdown(records, |e| e.category.clone()),
            courses,
            completions: daily_trend(
                records,
                now,
                TREND_WINDOW_DAYS,
                |e| stored_date(&e.completed_at),
                |e| e.score,
            ),
        }
    }
}

/// Report plus provenance, as returned by `Connector::analytics`.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsReport<T> {
    pub connector: String,
    pub generated_at: DateTime<Utc>,
    /// When the underlying snapshot was fetched; `None` before the first sync.
    pub as_of: Option<DateTime<Utc>>,
    /// The snapshot is older than the cache TTL.
    pub stale: bool,
    pub record_count: usize,
    pub report: T,
}
