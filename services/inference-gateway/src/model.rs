//! Persisted entities of the gateway: endpoints, model versions, status history,
//! request logs and A/B tests.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

pub type EndpointId = u64;
pub type ModelVersionId = u64;
pub type StatusId = u64;
pub type RequestId = u64;
pub type AbTestId = u64;

/// Named prediction surface grouping the versions of one model family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

/// One immutable deployable revision of a classifier under an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: ModelVersionId,
    pub name: String,
    pub description: String,
    pub code_reference: String,
    pub version: String,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub endpoint_id: EndpointId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewModelVersion {
    pub name: String,
    pub description: String,
    pub code_reference: String,
    pub version: String,
    pub owner: String,
    pub endpoint_id: EndpointId,
}

impl NewModelVersion {
    /// Encodes the uniqueness key (name, description, code, version, owner, endpoint).
    pub fn unique_key(&self) -> String {
        // unit separator keeps fields from bleeding into each other
        let endpoint = self.endpoint_id.to_string();
        [self.name.as_str(), self.description.as_str(), self.code_reference.as_str(), self.version.as_str(), self.owner.as_str(), endpoint.as_str()].join("\u{1f}")
    }

    pub fn matches(&self, mv: &ModelVersion) -> bool {
        mv.name == self.name && mv.description == self.description && mv.code_reference == self.code_reference
            && mv.version == self.version && mv.owner == self.owner && mv.endpoint_id == self.endpoint_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Testing,
    Staging,
    Production,
    AbTesting,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Testing => "testing",
            Status::Staging => "staging",
            Status::Production => "production",
            Status::AbTesting => "ab_testing",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Status {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "testing" => Ok(Status::Testing),
            "staging" => Ok(Status::Staging),
            "production" => Ok(Status::Production),
            "ab_testing" => Ok(Status::AbTesting),
            other => Err(GatewayError::InvalidRequest(format!("unknown status '{other}'"))),
        }
    }
}

/// One entry in the status history of a model version. At most one record per model
/// version is active at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub id: StatusId,
    pub status: Status,
    pub active: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub model_version_id: ModelVersionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewStatus {
    pub status: Status,
    pub created_by: String,
    pub model_version_id: ModelVersionId,
}

impl NewStatus {
    pub fn new(model_version_id: ModelVersionId, status: Status, created_by: impl Into<String>) -> Self {
        Self { status, created_by: created_by.into(), model_version_id }
    }
}

/// A routed prediction. Append-only apart from `feedback`, which is set at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLog {
    pub id: RequestId,
    pub input_data: serde_json::Value,
    pub full_response: serde_json::Value,
    pub response: String,
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
    pub model_version_id: ModelVersionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRequestLog {
    pub input_data: serde_json::Value,
    pub full_response: serde_json::Value,
    pub response: String,
    pub model_version_id: ModelVersionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbTest {
    pub id: AbTestId,
    pub title: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub model_version_id_1: ModelVersionId,
    pub model_version_id_2: ModelVersionId,
}

impl AbTest {
    pub fn is_open(&self) -> bool { self.ended_at.is_none() }

    pub fn covers(&self, a: ModelVersionId, b: ModelVersionId) -> bool {
        (self.model_version_id_1 == a && self.model_version_id_2 == b) || (self.model_version_id_1 == b && self.model_version_id_2 == a)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAbTest {
    pub title: String,
    pub created_by: String,
    pub model_version_id_1: ModelVersionId,
    pub model_version_id_2: ModelVersionId,
}

/// Logged requests of a model version in a time window, and how many of them carry
/// feedback equal to the predicted label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccuracyCounts {
    pub total: u64,
    pub correct: u64,
}

impl AccuracyCounts {
    pub fn observe(&mut self, log: &RequestLog) {
        self.total += 1;
        if log.feedback.as_deref() == Some(log.response.as_str()) { self.correct += 1; }
    }

    /// `None` when no request was logged.
    pub fn accuracy(&self) -> Option<f64> {
        (self.total > 0).then(|| self.correct as f64 / self.total as f64)
    }
}
