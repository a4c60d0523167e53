use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::model::Status;

pub const SERVICE_NAME: &str = "inference-gateway";

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub service_name: String,
    pub log_level: String,
    #[serde(default)]
    pub config_version: Option<String>,
    pub http_port: u16,
    pub health_port: u16,
    /// sled directory; the in-memory store is used when unset.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    pub predict_timeout_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_half_open_ms: u64,
    pub retry_attempts: usize,
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

/// One model version registered at startup. Exactly one of `url` (remote model server) or
/// `fixed_label` (constant answer, for smoke tests) selects the predictor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelConfig {
    pub endpoint: String,
    pub name: String,
    pub version: String,
    pub status: Status,
    pub owner: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub code_reference: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub fixed_label: Option<String>,
}

impl GatewayConfig {
    pub async fn load() -> anyhow::Result<Self> {
        gateway_core::load_config(SERVICE_NAME, |b| {
            b.set_default("http_port", 8000)?
                .set_default("health_port", 8080)?
                .set_default("predict_timeout_ms", 2000)?
                .set_default("breaker_failure_threshold", 5)?
                .set_default("breaker_half_open_ms", 10_000)?
                .set_default("retry_attempts", 3)?
                .set_default("retry_delay_ms", 25)
        }).await
    }

    pub fn predict_timeout(&self) -> Duration { Duration::from_millis(self.predict_timeout_ms) }
    pub fn breaker_half_open(&self) -> Duration { Duration::from_millis(self.breaker_half_open_ms) }
    pub fn retry_delay(&self) -> Duration { Duration::from_millis(self.retry_delay_ms) }
}
