//! Training, certification and vaccination events with expiry-driven compliance status.

use chrono::{DateTime, Months, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::TransformError;
use crate::record::{CanonicalRecord, Domain, DomainKind};
use crate::schema::{ColumnDef, SemanticType, TableSchema};
use crate::transform::{self, stored_date, stored_timestamp};

const ID_FIELDS: &[&str] = &["id", "event_id", "eventId", "record_id", "completion_id"];
const EMPLOYEE_FIELDS: &[&str] = &["employee_id", "employeeId", "learner_id", "user_id"];
const DEPARTMENT_FIELDS: &[&str] = &["department", "dept", "employee.department"];
const COURSE_ID_FIELDS: &[&str] = &["course_id", "courseId", "course.id", "module_id"];
const COURSE_NAME_FIELDS: &[&str] = &["course_name", "courseName", "course.title", "title"];
const CATEGORY_FIELDS: &[&str] = &["category", "type", "event_type", "kind"];
const REQUIRED_FIELDS: &[&str] = &["required", "mandatory", "is_required"];
const DUE_FIELDS: &[&str] = &["due_date", "dueDate", "due"];
const COMPLETED_FIELDS: &[&str] = &["completed_at", "completedAt", "completion_date", "administered_at"];
const EXPIRES_FIELDS: &[&str] = &["expires_at", "expiresAt", "expiration_date", "valid_until"];
const VALIDITY_FIELDS: &[&str] = &["validity_months", "validityMonths", "valid_for_months"];
const SCORE_FIELDS: &[&str] = &["score", "result.score", "grade", "percentage"];
const PASSED_FIELDS: &[&str] = &["passed", "result.passed", "is_passed", "success"];
const UPDATED_FIELDS: &[&str] = &["updated_at", "updatedAt", "modified"];

/// Minimum score counted as a pass when the source reports no explicit outcome.
pub const PASS_MARK: f64 = 70.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Current,
    RenewalDue,
    ExpiringSoon,
    Expired,
    Pending,
    Overdue,
}

impl ComplianceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ComplianceStatus::Current => "current",
            ComplianceStatus::RenewalDue => "renewal_due",
            ComplianceStatus::ExpiringSoon => "expiring_soon",
            ComplianceStatus::Expired => "expired",
            ComplianceStatus::Pending => "pending",
            ComplianceStatus::Overdue => "overdue",
        }
    }

    pub fn is_compliant(self) -> bool {
        matches!(
            self,
            ComplianceStatus::Current
                | ComplianceStatus::RenewalDue
                | ComplianceStatus::ExpiringSoon
        )
    }
}

/// Days remaining before expiry (exclusive upper bound) mapped to a status.
/// Anything at or beyond the last bound is `Current`.
const EXPIRY_THRESHOLDS: &[(i64, ComplianceStatus)] = &[
    (0, ComplianceStatus::Expired),
    (31, ComplianceStatus::ExpiringSoon),
    (91, ComplianceStatus::RenewalDue),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingEvent {
    pub id: String,
    pub employee_id: String,
    pub department: String,
    pub course_id: String,
    pub course_name: String,
    pub category: String,
    pub required: bool,
    pub due_date: String,
    pub completed_at: String,
    pub expires_at: String,
    pub score: Option<f64>,
    pub passed: Option<bool>,
    pub updated_at: String,
}

impl TrainingEvent {
    pub fn is_completed(&self) -> bool {
        !self.completed_at.is_empty()
    }

    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> Option<i64> {
        let expires = stored_date(&self.expires_at)?;
        Some((expires - now.date_naive()).num_days())
    }

    pub fn compliance_status(&self, now: DateTime<Utc>) -> ComplianceStatus {
        let today = now.date_naive();
        if !self.is_completed() {
            return match stored_date(&self.due_date) {
                Some(due) if due < today => ComplianceStatus::Overdue,
                _ => ComplianceStatus::Pending,
            };
        }
        match self.days_until_expiry(now) {
            None => ComplianceStatus::Current,
            Some(days) => EXPIRY_THRESHOLDS
                .iter()
                .find(|(bound, _)| days < *bound)
                .map(|(_, status)| *status)
                .unwrap_or(ComplianceStatus::Current),
        }
    }

    /// Explicit outcome when reported, otherwise derived from the score.
    pub fn outcome(&self) -> Option<bool> {
        self.passed
            .or_else(|| self.score.map(|s| s >= PASS_MARK))
    }
}

fn normalize_category(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    if lowered.is_empty() {
        return "training".to_string();
    }
    if ["vaccin", "immuni", "shot", "dose"]
        .iter()
        .any(|kw| lowered.contains(kw))
    {
        return "vaccination".to_string();
    }
    if lowered.contains("cert") {
        return "certification".to_string();
    }
    lowered
}

fn add_months(date: NaiveDate, months: f64) -> Option<NaiveDate> {
    if !(months.is_finite() && months > 0.0) {
        return None;
    }
    date.checked_add_months(Months::new(months.round() as u32))
}

impl CanonicalRecord for TrainingEvent {
    fn id(&self) -> &str {
        &self.id
    }

    fn field(&self, column: &str, now: DateTime<Utc>) -> Value {
        match column {
            "id" => json!(self.id),
            "employee_id" => json!(self.employee_id),
            "department" => json!(self.department),
            "course_id" => json!(self.course_id),
            "course_name" => json!(self.course_name),
            "category" => json!(self.category),
            "required" => json!(self.required),
            "due_date" => json!(self.due_date),
            "completed_at" => json!(self.completed_at),
            "expires_at" => json!(self.expires_at),
            "score" => self.score.map(|s| json!(s)).unwrap_or(Value::Null),
            "passed" => self.outcome().map(|p| json!(p)).unwrap_or(Value::Null),
            "updated_at" => json!(self.updated_at),
            "days_until_expiry" => self
                .days_until_expiry(now)
                .map(|d| json!(d))
                .unwrap_or(Value::Null),
            "compliance_status" => json!(self.compliance_status(now).as_str()),
            _ => Value::Null,
        }
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        stored_timestamp(&self.updated_at)
    }
}

pub struct TrainingEvents;

impl Domain for TrainingEvents {
    type Record = TrainingEvent;

    const KIND: DomainKind = DomainKind::Training;

    fn schema() -> TableSchema {
        use SemanticType::*;
        TableSchema::new(
            "training_events",
            vec![
                ColumnDef::new("id", Text).primary(),
                ColumnDef::new("employee_id", Text).filterable(),
                ColumnDef::new("department", Text).filterable(),
                ColumnDef::new("course_id", Text).filterable(),
                ColumnDef::new("course_name", Text),
                ColumnDef::new("category", Enum).filterable().required(),
                ColumnDef::new("required", Boolean).required(),
                ColumnDef::new("due_date", Date),
                ColumnDef::new("completed_at", Date),
                ColumnDef::new("expires_at", Date),
                ColumnDef::new("score", Float),
                ColumnDef::new("passed", Boolean),
                ColumnDef::new("updated_at", Timestamp).watermark(),
                ColumnDef::new("days_until_expiry", Integer).derived(),
                ColumnDef::new("compliance_status", Enum).derived().required(),
            ],
        )
    }

    fn transform(raw: &Value) -> Result<TrainingEvent, TransformError> {
        let obj = transform::as_object(raw)?;
        let id = transform::identifier(obj, ID_FIELDS)?;
        let completed_at = transform::date(obj, COMPLETED_FIELDS);
        let mut expires_at = transform::date(obj, EXPIRES_FIELDS);
        if expires_at.is_empty() {
            if let (Some(done), Some(months)) = (
                stored_date(&completed_at),
                transform::number(obj, VALIDITY_FIELDS),
            ) {
                expires_at = add_months(done, months)
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_default();
            }
        }
        let passed = transform::pick(obj, PASSED_FIELDS).and_then(transform::coerce_bool);
        Ok(TrainingEvent {
            id,
            employee_id: transform::text(obj, EMPLOYEE_FIELDS),
            department: transform::text(obj, DEPARTMENT_FIELDS),
            course_id: transform::text(obj, COURSE_ID_FIELDS),
            course_name: transform::text(obj, COURSE_NAME_FIELDS),
            category: normalize_category(&transform::text(obj, CATEGORY_FIELDS)),
            required: transform::boolean(obj, REQUIRED_FIELDS, true),
            due_date: transform::date(obj, DUE_FIELDS),
            completed_at,
            expires_at,
            score: transform::number(obj, SCORE_FIELDS),
            passed,
            updated_at: transform::timestamp(obj, UPDATED_FIELDS),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap()
    }

    fn event(v: Value) -> TrainingEvent {
        TrainingEvents::transform(&v).expect("transform")
    }

    #[test]
    fn status_follows_threshold_table() {
        let cases = [
            ("2025-06-14", ComplianceStatus::Expired),
            ("2025-06-15", ComplianceStatus::ExpiringSoon),
            ("2025-07-15", ComplianceStatus::ExpiringSoon),
            ("2025-07-16", ComplianceStatus::RenewalDue),
            ("2025-09-13", ComplianceStatus::RenewalDue),
            ("2025-09-14", ComplianceStatus::Current),
        ];
        for (expires, expected) in cases {
            let e = event(json!({
                "id": "t", "completed_at": "2024-06-01", "expires_at": expires
            }));
            assert_eq!(e.compliance_status(now()), expected, "expires {expires}");
        }
    }

    #[test]
    fn incomplete_events_are_pending_or_overdue() {
        let pending = event(json!({"id": "p", "due_date": "2025-07-01"}));
        assert_eq!(pending.compliance_status(now()), ComplianceStatus::Pending);
        let overdue = event(json!({"id": "o", "dueDate": "2025-06-01"}));
        assert_eq!(overdue.compliance_status(now()), ComplianceStatus::Overdue);
        let undated = event(json!({"id": "u", "due_date": "soon"}));
        assert_eq!(undated.compliance_status(now()), ComplianceStatus::Pending);
    }

    #[test]
    fn vaccination_expiry_from_validity_period() {
        let e = event(json!({
            "eventId": "v1",
            "type": "Influenza Vaccine",
            "administered_at": "2024-10-01",
            "validity_months": "12",
            "required": "no"
        }));
        assert_eq!(e.category, "vaccination");
        assert_eq!(e.expires_at, "2025-10-01");
        assert!(!e.required);
        assert_eq!(e.compliance_status(now()), ComplianceStatus::Current);
        assert_eq!(e.field("days_until_expiry", now()), json!(108));
    }

    #[test]
    fn outcome_falls_back_to_score() {
        let scored = event(json!({"id": "s", "score": "82"}));
        assert_eq!(scored.outcome(), Some(true));
        let failed = event(json!({"id": "f", "score": 40, "passed": "yes"}));
        assert_eq!(failed.outcome(), Some(true), "explicit outcome wins");
        let unknown = event(json!({"id": "n"}));
        assert_eq!(unknown.outcome(), None);
        assert_eq!(unknown.field("passed", now()), Value::Null);
        assert_eq!(unknown.category, "training");
    }
}
