//! Domain pipelines. Each one is a schema plus a pure transform; the sync,
//! cache and retry machinery is shared through [`crate::connector::Connector`].

pub mod employee;
pub mod survey;
pub mod training;

pub use employee::{Employee, Employees, RiskLevel};
pub use survey::{Sentiment, SurveyResponse, Surveys};
pub use training::{ComplianceStatus, TrainingEvent, TrainingEvents};
