//! Wires the store, registry and core services from configuration.

use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::info;

use crate::ab_test::AbTestController;
use crate::api::AppState;
use crate::config::{GatewayConfig, ModelConfig};
use crate::predictor::{FixedPredictor, Predictor, RemotePredictor};
use crate::registry::{Registration, RegistryBuilder};
use crate::router::Router;
use crate::status::StatusManager;
use crate::store::{MemoryStore, RecordStore, SledStore};

pub fn open_store(cfg: &GatewayConfig) -> Result<Arc<dyn RecordStore>> {
    Ok(match &cfg.store_path {
        Some(path) => Arc::new(SledStore::open(path)?),
        None => {
            info!("no store_path configured, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    })
}

fn predictor_for(cfg: &GatewayConfig, model: &ModelConfig) -> Result<Arc<dyn Predictor>> {
    match (&model.url, &model.fixed_label) {
        (Some(url), None) => Ok(Arc::new(RemotePredictor::new(url.clone(), cfg.breaker_failure_threshold, cfg.breaker_half_open()))),
        (None, Some(label)) => Ok(Arc::new(FixedPredictor::new(label.clone(), 1.0))),
        _ => bail!("model '{}' {} needs exactly one of url or fixed_label", model.name, model.version),
    }
}

pub async fn register_models(cfg: &GatewayConfig, store: Arc<dyn RecordStore>) -> Result<RegistryBuilder> {
    let mut builder = RegistryBuilder::new(store);
    for model in &cfg.models {
        let predictor = predictor_for(cfg, model)?;
        builder.register(Registration {
            endpoint_name: model.endpoint.clone(),
            name: model.name.clone(),
            status: model.status,
            version: model.version.clone(),
            owner: model.owner.clone(),
            description: model.description.clone(),
            code_reference: model.code_reference.clone(),
        }, predictor).await?;
    }
    Ok(builder)
}

pub fn app_state(cfg: &GatewayConfig, store: Arc<dyn RecordStore>, builder: RegistryBuilder) -> AppState {
    let registry = builder.build();
    info!(predictors = registry.len(), "registry frozen");
    AppState {
        router: Router::new(store.clone(), registry).with_timeout(cfg.predict_timeout()),
        status: StatusManager::new(store.clone()),
        ab_tests: AbTestController::new(store.clone()),
        store,
        retry_attempts: cfg.retry_attempts,
        retry_delay: cfg.retry_delay(),
    }
}
