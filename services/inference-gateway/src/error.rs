use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::model::{AbTestId, ModelVersionId, RequestId, Status};

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("no model version of endpoint '{endpoint}' has active status '{status}'{}", .version.as_deref().map(|v| format!(" and version '{v}'")).unwrap_or_default())]
    NoAlgorithmAvailable { endpoint: String, status: Status, version: Option<String> },

    #[error("no predictor registered for model version {0}")]
    PredictorUnavailable(ModelVersionId),

    #[error("predictor for model version {model_version_id} timed out after {timeout:?}")]
    PredictorTimeout { model_version_id: ModelVersionId, timeout: Duration },

    #[error("model version {0} has no logged requests in the test window")]
    InsufficientData(ModelVersionId),

    #[error("A/B test {0} already finished")]
    AlreadyFinished(AbTestId),

    #[error("concurrent modification: {0}")]
    ConcurrencyConflict(String),

    #[error("feedback for request {0} already recorded")]
    FeedbackAlreadySet(RequestId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("store error: {0}")]
    Store(String),
}

impl GatewayError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        GatewayError::NotFound { entity, id: id.to_string() }
    }

    pub fn is_retryable(&self) -> bool { matches!(self, GatewayError::ConcurrencyConflict(_)) }

    /// Stable machine-readable name, used as a metric attribute.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::NotFound { .. } => "not_found",
            GatewayError::NoAlgorithmAvailable { .. } => "no_algorithm_available",
            GatewayError::PredictorUnavailable(_) => "predictor_unavailable",
            GatewayError::PredictorTimeout { .. } => "predictor_timeout",
            GatewayError::InsufficientData(_) => "insufficient_data",
            GatewayError::AlreadyFinished(_) => "already_finished",
            GatewayError::ConcurrencyConflict(_) => "concurrency_conflict",
            GatewayError::FeedbackAlreadySet(_) => "feedback_already_set",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Store(_) => "store",
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody { status: "Error", message: self.to_string() }
    }
}

/// The `{status: "Error", message}` shape returned for every core-detected failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub message: String,
}

impl From<sled::Error> for GatewayError {
    fn from(e: sled::Error) -> Self { GatewayError::Store(e.to_string()) }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self { GatewayError::Store(format!("codec: {e}")) }
}
