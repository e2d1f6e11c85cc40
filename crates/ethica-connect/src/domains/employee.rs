//! HR directory records and the insider-risk classification derived from them.

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::TransformError;
use crate::record::{CanonicalRecord, Domain, DomainKind};
use crate::schema::{ColumnDef, SemanticType, TableSchema};
use crate::transform::{self, stored_date, stored_timestamp};

const ID_FIELDS: &[&str] = &["id", "employee_id", "employeeId", "worker_id", "uuid"];
const FIRST_NAME_FIELDS: &[&str] = &["first_name", "firstName", "given_name", "name.first"];
const LAST_NAME_FIELDS: &[&str] = &["last_name", "lastName", "family_name", "surname", "name.last"];
const FULL_NAME_FIELDS: &[&str] = &["full_name", "fullName", "display_name", "name"];
const EMAIL_FIELDS: &[&str] = &["email", "work_email", "workEmail", "contact.email"];
const DEPARTMENT_FIELDS: &[&str] = &["department", "dept", "department_name", "org.department"];
const ROLE_FIELDS: &[&str] = &["role", "job_title", "jobTitle", "title", "position"];
const MANAGER_FIELDS: &[&str] = &["manager_id", "managerId", "supervisor_id", "manager.id"];
const LOCATION_FIELDS: &[&str] = &["location", "office", "site", "work_location"];
const STATUS_FIELDS: &[&str] = &["employment_status", "status", "employmentStatus"];
const IS_MANAGER_FIELDS: &[&str] = &["is_manager", "isManager", "people_manager"];
const ACCESS_FIELDS: &[&str] = &["access_level", "accessLevel", "privilege", "access.level"];
const HIRE_DATE_FIELDS: &[&str] = &["hire_date", "hireDate", "start_date", "startDate"];
const UPDATED_FIELDS: &[&str] = &["updated_at", "updatedAt", "modified", "last_modified"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Employee {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub department: String,
    pub role: String,
    pub manager_id: String,
    pub location: String,
    pub employment_status: String,
    pub is_manager: bool,
    pub access_level: String,
    /// `YYYY-MM-DD` or "".
    pub hire_date: String,
    /// RFC3339 or "".
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    fn from_score(score: u32) -> Self {
        if score >= RISK_HIGH_AT {
            RiskLevel::High
        } else if score >= RISK_MEDIUM_AT {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

const RISK_MEDIUM_AT: u32 = 30;
const RISK_HIGH_AT: u32 = 60;

/// Keyword weights matched case-insensitively against the role title.
const ROLE_WEIGHTS: &[(&str, u32)] = &[
    ("chief", 25),
    ("director", 20),
    ("vp", 20),
    ("procurement", 20),
    ("treasury", 20),
    ("finance", 15),
    ("accountant", 15),
    ("sales", 10),
    ("buyer", 15),
    ("administrator", 15),
];

const DEPARTMENT_WEIGHTS: &[(&str, u32)] = &[
    ("finance", 20),
    ("procurement", 20),
    ("sales", 15),
    ("legal", 10),
    ("it", 10),
    ("executive", 20),
];

const ACCESS_WEIGHTS: &[(&str, u32)] = &[("admin", 25), ("privileged", 20), ("elevated", 10)];

/// Tenure bands in months: (upper bound exclusive, weight). Newcomers and
/// long-tenured staff with accumulated access weigh more.
const TENURE_WEIGHTS: &[(i64, u32)] = &[(6, 15), (24, 5), (120, 0)];
const TENURE_LONG_WEIGHT: u32 = 10;
const TENURE_UNKNOWN_WEIGHT: u32 = 10;
const MANAGER_WEIGHT: u32 = 10;

fn keyword_weight(haystack: &str, table: &[(&str, u32)]) -> u32 {
    let lowered = haystack.to_ascii_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    table
        .iter()
        .filter(|(kw, _)| words.iter().any(|w| w == kw))
        .map(|(_, weight)| *weight)
        .max()
        .unwrap_or(0)
}

impl Employee {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Whole months since hire; `None` when the hire date is unknown or in the future.
    pub fn tenure_months(&self, now: DateTime<Utc>) -> Option<i64> {
        let hired = stored_date(&self.hire_date)?;
        let today = now.date_naive();
        if hired > today {
            return None;
        }
        let mut months = (today.year() - hired.year()) as i64 * 12
            + (today.month() as i64 - hired.month() as i64);
        if today.day() < hired.day() {
            months -= 1;
        }
        Some(months.max(0))
    }

    pub fn is_active(&self) -> bool {
        !matches!(
            self.employment_status.as_str(),
            "terminated" | "inactive" | "former"
        )
    }

    /// Weighted score over role, department, access level and tenure; capped at 100.
    pub fn risk_score(&self, now: DateTime<Utc>) -> u32 {
        let mut score = keyword_weight(&self.role, ROLE_WEIGHTS)
            + keyword_weight(&self.department, DEPARTMENT_WEIGHTS)
            + keyword_weight(&self.access_level, ACCESS_WEIGHTS);
        if self.is_manager {
            score += MANAGER_WEIGHT;
        }
        score += match self.tenure_months(now) {
            None => TENURE_UNKNOWN_WEIGHT,
            Some(months) => TENURE_WEIGHTS
                .iter()
                .find(|(upper, _)| months < *upper)
                .map(|(_, w)| *w)
                .unwrap_or(TENURE_LONG_WEIGHT),
        };
        score.min(100)
    }

    pub fn risk_level(&self, now: DateTime<Utc>) -> RiskLevel {
        RiskLevel::from_score(self.risk_score(now))
    }
}

fn normalize_status(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => "active".to_string(),
        "a" | "active" | "employed" | "current" => "active".to_string(),
        "t" | "terminated" | "term" | "separated" => "terminated".to_string(),
        "l" | "leave" | "on_leave" | "loa" | "on leave" => "leave".to_string(),
        other => other.to_string(),
    }
}

impl CanonicalRecord for Employee {
    fn id(&self) -> &str {
        &self.id
    }

    fn field(&self, column: &str, now: DateTime<Utc>) -> Value {
        match column {
            "id" => json!(self.id),
            "first_name" => json!(self.first_name),
            "last_name" => json!(self.last_name),
            "full_name" => json!(self.full_name()),
            "email" => json!(self.email),
            "department" => json!(self.department),
            "role" => json!(self.role),
            "manager_id" => json!(self.manager_id),
            "location" => json!(self.location),
            "employment_status" => json!(self.employment_status),
            "is_manager" => json!(self.is_manager),
            "access_level" => json!(self.access_level),
            "hire_date" => json!(self.hire_date),
            "updated_at" => json!(self.updated_at),
            "tenure_months" => self
                .tenure_months(now)
                .map(|m| json!(m))
                .unwrap_or(Value::Null),
            "risk_score" => json!(self.risk_score(now)),
            "risk_level" => json!(self.risk_level(now).as_str()),
            _ => Value::Null,
        }
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        stored_timestamp(&self.updated_at)
    }
}

pub struct Employees;

impl Domain for Employees {
    type Record = Employee;

    const KIND: DomainKind = DomainKind::Employees;

    fn schema() -> TableSchema {
        use SemanticType::*;
        TableSchema::new(
            "employees",
            vec![
                ColumnDef::new("id", Text).primary(),
                ColumnDef::new("first_name", Text),
                ColumnDef::new("last_name", Text),
                ColumnDef::new("full_name", Text).derived(),
                ColumnDef::new("email", Text),
                ColumnDef::new("department", Text).filterable(),
                ColumnDef::new("role", Text),
                ColumnDef::new("manager_id", Text).filterable(),
                ColumnDef::new("location", Text).filterable(),
                ColumnDef::new("employment_status", Enum)
                    .filterable()
                    .required(),
                ColumnDef::new("is_manager", Boolean).required(),
                ColumnDef::new("access_level", Enum),
                ColumnDef::new("hire_date", Date),
                ColumnDef::new("updated_at", Timestamp).watermark(),
                ColumnDef::new("tenure_months", Integer).derived(),
                ColumnDef::new("risk_score", Integer).derived().required(),
                ColumnDef::new("risk_level", Enum).derived().required(),
            ],
        )
    }

    fn transform(raw: &Value) -> Result<Employee, TransformError> {
        let obj = transform::as_object(raw)?;
        let id = transform::identifier(obj, ID_FIELDS)?;
        let mut first_name = transform::text(obj, FIRST_NAME_FIELDS);
        let mut last_name = transform::text(obj, LAST_NAME_FIELDS);
        if first_name.is_empty() && last_name.is_empty() {
            let full = transform::text(obj, FULL_NAME_FIELDS);
            let mut parts = full.splitn(2, ' ');
            first_name = parts.next().unwrap_or_default().to_string();
            last_name = parts.next().unwrap_or_default().trim().to_string();
        }
        let access_level = transform::text(obj, ACCESS_FIELDS).to_ascii_lowercase();
        let access_level = if access_level.is_empty() {
            "standard".to_string()
        } else {
            access_level
        };
        Ok(Employee {
            id,
            first_name,
            last_name,
            email: transform::text(obj, EMAIL_FIELDS).to_ascii_lowercase(),
            department: transform::text(obj, DEPARTMENT_FIELDS),
            role: transform::text(obj, ROLE_FIELDS),
            manager_id: transform::text(obj, MANAGER_FIELDS),
            location: transform::text(obj, LOCATION_FIELDS),
            employment_status: normalize_status(&transform::text(obj, STATUS_FIELDS)),
            is_manager: transform::boolean(obj, IS_MANAGER_FIELDS, false),
            access_level,
            hire_date: transform::date(obj, HIRE_DATE_FIELDS),
            updated_at: transform::timestamp(obj, UPDATED_FIELDS),
        })
    }
}
