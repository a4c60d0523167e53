//! Request routing: selects a model version for an endpoint and status, calls its
//! predictor and logs the request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use gateway_resilience::ResilienceError;
use opentelemetry::KeyValue;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::metrics::METRICS;
use crate::model::{ModelVersion, ModelVersionId, NewRequestLog, RequestId, Status};
use crate::predictor::Prediction;
use crate::registry::Registry;
use crate::store::RecordStore;

pub const DEFAULT_PREDICT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Predictor output plus the id of the logged request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteOutcome {
    #[serde(flatten)]
    pub prediction: Prediction,
    pub request_id: RequestId,
    pub model_version_id: ModelVersionId,
}

#[derive(Clone)]
pub struct Router {
    store: Arc<dyn RecordStore>,
    registry: Registry,
    predict_timeout: Duration,
}

impl Router {
    pub fn new(store: Arc<dyn RecordStore>, registry: Registry) -> Self {
        Self { store, registry, predict_timeout: DEFAULT_PREDICT_TIMEOUT }
    }

    pub fn with_timeout(mut self, predict_timeout: Duration) -> Self {
        self.predict_timeout = predict_timeout;
        self
    }

    pub fn registry(&self) -> &Registry { &self.registry }

    pub async fn route(&self, endpoint_name: &str, status: Status, version: Option<&str>, payload: Value) -> Result<RouteOutcome> {
        let res = self.route_inner(endpoint_name, status, version, payload).await;
        match &res {
            Ok(out) => {
                METRICS.route.routed_total.add(1, &[KeyValue::new("endpoint", endpoint_name.to_string()), KeyValue::new("status", status.as_str())]);
                if out.prediction.is_error() { METRICS.route.predictor_errors_total.add(1, &[KeyValue::new("endpoint", endpoint_name.to_string())]); }
            }
            Err(e) => METRICS.route.failed_total.add(1, &[KeyValue::new("endpoint", endpoint_name.to_string()), KeyValue::new("kind", e.kind())]),
        }
        res
    }

    async fn route_inner(&self, endpoint_name: &str, status: Status, version: Option<&str>, payload: Value) -> Result<RouteOutcome> {
        let no_candidates = || GatewayError::NoAlgorithmAvailable { endpoint: endpoint_name.to_string(), status, version: version.map(str::to_string) };
        let endpoint = self.store.endpoint_by_name(endpoint_name).await?.ok_or_else(no_candidates)?;
        let mut candidates = self.store.candidates(endpoint.id, status).await?;
        if let Some(v) = version { candidates.retain(|mv| mv.version == v); }
        if candidates.is_empty() { return Err(no_candidates()); }

        let selected = self.select(endpoint_name, status, candidates).await?;
        let predictor = self.registry.get(selected.id).ok_or(GatewayError::PredictorUnavailable(selected.id))?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.predict_timeout, predictor.predict(&payload)).await;
        METRICS.route.predict_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[KeyValue::new("endpoint", endpoint_name.to_string())]);
        let prediction = match outcome {
            Err(_) => return Err(GatewayError::PredictorTimeout { model_version_id: selected.id, timeout: self.predict_timeout }),
            Ok(Ok(p)) => p,
            Ok(Err(e)) if e.downcast_ref::<ResilienceError>().is_some() => return Err(GatewayError::PredictorUnavailable(selected.id)),
            Ok(Err(e)) => {
                warn!(endpoint = endpoint_name, model_version_id = selected.id, error = %e, "predictor failed");
                Prediction::Error { message: e.to_string() }
            }
        };

        let log = self.store.insert_request(NewRequestLog {
            full_response: serde_json::to_value(&prediction)?,
            response: prediction.label().unwrap_or("error").to_string(),
            input_data: payload,
            model_version_id: selected.id,
        }).await?;
        debug!(endpoint = endpoint_name, model_version_id = selected.id, request_id = log.id, "request routed");
        Ok(RouteOutcome { prediction, request_id: log.id, model_version_id: selected.id })
    }

    /// `candidates` is non-empty and ascending by id.
    async fn select(&self, endpoint_name: &str, status: Status, mut candidates: Vec<ModelVersion>) -> Result<ModelVersion> {
        if status == Status::AbTesting && candidates.len() >= 2 {
            let open = self.store.ab_tests().await?.into_iter()
                .filter(|t| t.is_open())
                .filter(|t| [t.model_version_id_1, t.model_version_id_2].iter().all(|id| candidates.iter().any(|c| c.id == *id)))
                .max_by_key(|t| t.created_at);
            let pair = match open {
                Some(t) => [t.model_version_id_1, t.model_version_id_2],
                None => {
                    warn!(endpoint = endpoint_name, candidates = candidates.len(), "no open A/B test covers the ab_testing candidates; splitting the first two");
                    [candidates[0].id, candidates[1].id]
                }
            };
            let pick = pair[usize::from(rand::thread_rng().gen_bool(0.5))];
            let idx = candidates.iter().position(|c| c.id == pick).unwrap_or(0);
            return Ok(candidates.swap_remove(idx));
        }
        if candidates.len() > 1 {
            warn!(endpoint = endpoint_name, status = %status, candidates = candidates.len(), "several active candidates; taking the lowest id");
        }
        Ok(candidates.swap_remove(0))
    }
}
