//! Prediction capability bound to a model version.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use gateway_resilience::CircuitBreaker;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Predictor output. A predictor reports its own failures as `Error`; the router logs and
/// forwards those like any other prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Prediction {
    #[serde(rename = "OK")]
    Ok { label: String, probability: f64 },
    #[serde(rename = "Error")]
    Error { message: String },
}

impl Prediction {
    pub fn label(&self) -> Option<&str> {
        match self {
            Prediction::Ok { label, .. } => Some(label),
            Prediction::Error { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool { matches!(self, Prediction::Error { .. }) }
}

#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, input: &Value) -> anyhow::Result<Prediction>;
}

/// Posts the input to a model server and expects a [`Prediction`] body back.
pub struct RemotePredictor {
    url: String,
    client: reqwest::Client,
    breaker: CircuitBreaker,
}

impl RemotePredictor {
    pub fn new(url: impl Into<String>, failure_threshold: u32, half_open_after: Duration) -> Self {
        let url = url.into();
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { breaker: CircuitBreaker::new(url.clone(), failure_threshold, half_open_after), url, client }
    }

    pub fn url(&self) -> &str { &self.url }

    async fn call(&self, input: &Value) -> anyhow::Result<Prediction> {
        let resp = self.client.post(&self.url).json(input).send().await
            .with_context(|| format!("posting to {}", self.url))?;
        let status = resp.status();
        if !status.is_success() { bail!("model server {} answered {}", self.url, status); }
        resp.json::<Prediction>().await.context("decoding prediction")
    }
}

#[async_trait]
impl Predictor for RemotePredictor {
    async fn predict(&self, input: &Value) -> anyhow::Result<Prediction> {
        // an open breaker surfaces as ResilienceError so callers can tell it apart
        self.breaker.check()?;
        match self.call(input).await {
            Ok(p) => {
                self.breaker.record_success();
                debug!(url = %self.url, error = p.is_error(), "remote prediction");
                Ok(p)
            }
            Err(e) => {
                self.breaker.record_failure();
                warn!(url = %self.url, error = %e, "remote prediction failed");
                Err(e)
            }
        }
    }
}

/// Always answers with the same label.
#[derive(Debug, Clone)]
pub struct FixedPredictor {
    label: String,
    probability: f64,
}

impl FixedPredictor {
    pub fn new(label: impl Into<String>, probability: f64) -> Self {
        Self { label: label.into(), probability }
    }
}

#[async_trait]
impl Predictor for FixedPredictor {
    async fn predict(&self, _input: &Value) -> anyhow::Result<Prediction> {
        Ok(Prediction::Ok { label: self.label.clone(), probability: self.probability })
    }
}
