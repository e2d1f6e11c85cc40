//! Ethics and culture survey responses.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::TransformError;
use crate::record::{CanonicalRecord, Domain, DomainKind};
use crate::schema::{ColumnDef, SemanticType, TableSchema};
use crate::transform::{self, coerce_f64, stored_timestamp};

const ID_FIELDS: &[&str] = &["id", "response_id", "responseId", "submission_id"];
const SURVEY_ID_FIELDS: &[&str] = &["survey_id", "surveyId", "survey.id", "form_id"];
const SURVEY_NAME_FIELDS: &[&str] = &["survey_name", "surveyTitle", "survey.title", "title"];
const RESPONDENT_FIELDS: &[&str] = &["respondent_id", "respondentId", "employee_id", "user_id"];
const DEPARTMENT_FIELDS: &[&str] = &["department", "dept", "respondent.department"];
const SUBMITTED_FIELDS: &[&str] = &["submitted_at", "submittedAt", "completed_at", "created_at"];
const UPDATED_FIELDS: &[&str] = &["updated_at", "updatedAt", "modified"];
const COMPLETED_FIELDS: &[&str] = &["completed", "is_complete", "complete", "finished"];
const ANONYMOUS_FIELDS: &[&str] = &["anonymous", "is_anonymous", "anonymized"];
const ANSWER_FIELDS: &[&str] = &["answers", "responses", "scores", "items"];
const COMMENT_FIELDS: &[&str] = &["comment", "comments", "free_text", "feedback"];

/// Likert scale bounds; answers outside are discarded.
const SCALE_MIN: f64 = 1.0;
const SCALE_MAX: f64 = 5.0;
const POSITIVE_AT: f64 = 4.0;
const NEUTRAL_AT: f64 = 3.0;
const CONCERN_AT_OR_BELOW: f64 = 2.0;

const LIKERT_WORDS: &[(&str, f64)] = &[
    ("strongly disagree", 1.0),
    ("disagree", 2.0),
    ("neutral", 3.0),
    ("neither agree nor disagree", 3.0),
    ("agree", 4.0),
    ("strongly agree", 5.0),
];

const CONCERN_KEYWORDS: &[&str] = &[
    "harass",
    "retaliat",
    "fraud",
    "brib",
    "discriminat",
    "unsafe",
    "kickback",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurveyResponse {
    pub id: String,
    pub survey_id: String,
    pub survey_name: String,
    pub respondent_id: String,
    pub department: String,
    pub submitted_at: String,
    pub updated_at: String,
    pub completed: bool,
    pub anonymous: bool,
    pub answers: BTreeMap<String, f64>,
    pub comment: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
    Unknown,
}

impl Sentiment {
    pub fn as_str(self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
            Sentiment::Unknown => "unknown",
        }
    }
}

impl SurveyResponse {
    pub fn average_score(&self) -> Option<f64> {
        if self.answers.is_empty() {
            return None;
        }
        let sum: f64 = self.answers.values().sum();
        Some(round2(sum / self.answers.len() as f64))
    }

    pub fn sentiment(&self) -> Sentiment {
        match self.average_score() {
            None => Sentiment::Unknown,
            Some(avg) if avg >= POSITIVE_AT => Sentiment::Positive,
            Some(avg) if avg >= NEUTRAL_AT => Sentiment::Neutral,
            Some(_) => Sentiment::Negative,
        }
    }

    /// Any very low answer, or a comment mentioning misconduct.
    pub fn concern_flag(&self) -> bool {
        if self.answers.values().any(|v| *v <= CONCERN_AT_OR_BELOW) {
            return true;
        }
        let comment = self.comment.to_ascii_lowercase();
        CONCERN_KEYWORDS.iter().any(|kw| comment.contains(kw))
    }
}

pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn coerce_answer(value: &Value) -> Option<f64> {
    let score = match value {
        Value::String(s) => {
            let lowered = s.trim().to_ascii_lowercase();
            LIKERT_WORDS
                .iter()
                .find(|(word, _)| *word == lowered)
                .map(|(_, v)| *v)
                .or_else(|| coerce_f64(value))
        }
        Value::Object(obj) => {
            return transform::pick(obj, &["score", "value", "answer", "rating"])
                .filter(|v| !v.is_object())
                .and_then(coerce_answer);
        }
        other => coerce_f64(other),
    }?;
    (SCALE_MIN..=SCALE_MAX).contains(&score).then_some(score)
}

/// Answers arrive either as `{question: score}` or `[{question, score}]`.
fn extract_answers(obj: &Map<String, Value>) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    match transform::pick(obj, ANSWER_FIELDS) {
        Some(Value::Object(map)) => {
            for (question, value) in map {
                if let Some(score) = coerce_answer(value) {
                    out.insert(question.clone(), score);
                }
            }
        }
        Some(Value::Array(items)) => {
            for (idx, item) in items.iter().enumerate() {
                let question = item
                    .as_object()
                    .and_then(|o| {
                        transform::opt_text(o, &["question_id", "questionId", "question", "id"])
                    })
                    .unwrap_or_else(|| format!("q{}", idx + 1));
                if let Some(score) = coerce_answer(item) {
                    out.insert(question, score);
                }
            }
        }
        _ => {}
    }
    out
}

impl CanonicalRecord for SurveyResponse {
    fn id(&self) -> &str {
        &self.id
    }

    fn field(&self, column: &str, _now: DateTime<Utc>) -> Value {
        match column {
            "id" => json!(self.id),
            "survey_id" => json!(self.survey_id),
            "survey_name" => json!(self.survey_name),
            "respondent_id" => json!(self.respondent_id),
            "department" => json!(self.department),
            "submitted_at" => json!(self.submitted_at),
            "updated_at" => json!(self.updated_at),
            "completed" => json!(self.completed),
            "anonymous" => json!(self.anonymous),
            "comment" => json!(self.comment),
            "answer_count" => json!(self.answers.len()),
            "average_score" => self
                .average_score()
                .map(|v| json!(v))
                .unwrap_or(Value::Null),
            "sentiment" => json!(self.sentiment().as_str()),
            "concern_flag" => json!(self.concern_flag()),
            _ => Value::Null,
        }
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        stored_timestamp(&self.updated_at).or_else(|| stored_timestamp(&self.submitted_at))
    }
}

pub struct Surveys;

impl Domain for Surveys {
    type Record = SurveyResponse;

    const KIND: DomainKind = DomainKind::Surveys;

    fn schema() -> TableSchema {
        use SemanticType::*;
        TableSchema::new(
            "survey_responses",
            vec![
                ColumnDef::new("id", Text).primary(),
                ColumnDef::new("survey_id", Text).filterable(),
                ColumnDef::new("survey_name", Text),
                ColumnDef::new("respondent_id", Text),
                ColumnDef::new("department", Text).filterable(),
                ColumnDef::new("submitted_at", Timestamp),
                ColumnDef::new("updated_at", Timestamp).watermark(),
                ColumnDef::new("completed", Boolean).required(),
                ColumnDef::new("anonymous", Boolean).required(),
                ColumnDef::new("comment", Text),
                ColumnDef::new("answer_count", Integer).derived().required(),
                ColumnDef::new("average_score", Float).derived(),
                ColumnDef::new("sentiment", Enum).derived().required(),
                ColumnDef::new("concern_flag", Boolean).derived().required(),
            ],
        )
    }

    fn transform(raw: &Value) -> Result<SurveyResponse, TransformError> {
        let obj = transform::as_object(raw)?;
        let id = transform::identifier(obj, ID_FIELDS)?;
        let submitted_at = transform::timestamp(obj, SUBMITTED_FIELDS);
        let anonymous = transform::boolean(obj, ANONYMOUS_FIELDS, false);
        let respondent_id = if anonymous {
            String::new()
        } else {
            transform::text(obj, RESPONDENT_FIELDS)
        };
        Ok(SurveyResponse {
            id,
            survey_id: transform::text(obj, SURVEY_ID_FIELDS),
            survey_name: transform::text(obj, SURVEY_NAME_FIELDS),
            respondent_id,
            department: transform::text(obj, DEPARTMENT_FIELDS),
            completed: transform::boolean(obj, COMPLETED_FIELDS, !submitted_at.is_empty()),
            submitted_at,
            updated_at: transform::timestamp(obj, UPDATED_FIELDS),
            anonymous,
            answers: extract_answers(obj),
            comment: transform::text(obj, COMMENT_FIELDS),
        })
    }
}
