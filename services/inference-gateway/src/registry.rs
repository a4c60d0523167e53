//! Model version registry.
//!
//! [`RegistryBuilder`] runs at bootstrap: it persists endpoints, model versions and their
//! initial status, and collects the predictors. [`Registry`] is the frozen id -> predictor
//! map handed to the router; it is never mutated after `build`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::error::{GatewayError, Result};
use crate::metrics::METRICS;
use crate::model::{ModelVersionId, NewModelVersion, Status};
use crate::predictor::Predictor;
use crate::store::RecordStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub endpoint_name: String,
    pub name: String,
    pub status: Status,
    pub version: String,
    pub owner: String,
    pub description: String,
    pub code_reference: String,
}

pub struct RegistryBuilder {
    store: Arc<dyn RecordStore>,
    predictors: HashMap<ModelVersionId, Arc<dyn Predictor>>,
}

impl RegistryBuilder {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store, predictors: HashMap::new() }
    }

    /// Registers one model version. Repeating the same registration returns the same id,
    /// leaves the status history untouched and replaces the predictor.
    pub async fn register(&mut self, reg: Registration, predictor: Arc<dyn Predictor>) -> Result<ModelVersionId> {
        let (endpoint, _) = self.store.get_or_create_endpoint(&reg.endpoint_name, &reg.owner).await?;
        let new = NewModelVersion {
            name: reg.name,
            description: reg.description,
            code_reference: reg.code_reference,
            version: reg.version,
            owner: reg.owner,
            endpoint_id: endpoint.id,
        };
        let (mv, created) = self.store.get_or_create_model_version(new, reg.status).await?;
        self.predictors.insert(mv.id, predictor);
        if created { METRICS.lifecycle.registrations_total.add(1, &[]); }
        info!(endpoint = %endpoint.name, model_version_id = mv.id, name = %mv.name, version = %mv.version, created, "model version registered");
        Ok(mv.id)
    }

    pub fn build(self) -> Registry {
        Registry { predictors: Arc::new(self.predictors) }
    }
}

#[derive(Clone, Default)]
pub struct Registry {
    predictors: Arc<HashMap<ModelVersionId, Arc<dyn Predictor>>>,
}

impl Registry {
    pub fn get(&self, id: ModelVersionId) -> Option<Arc<dyn Predictor>> {
        self.predictors.get(&id).cloned()
    }

    pub fn lookup(&self, id: ModelVersionId) -> Result<Arc<dyn Predictor>> {
        self.get(id).ok_or_else(|| GatewayError::not_found("predictor", id))
    }

    pub fn len(&self) -> usize { self.predictors.len() }
    pub fn is_empty(&self) -> bool { self.predictors.is_empty() }

    pub fn ids(&self) -> Vec<ModelVersionId> {
        let mut ids: Vec<_> = self.predictors.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::FixedPredictor;
    use crate::store::MemoryStore;

    fn reg(name: &str, status: Status) -> Registration {
        Registration {
            endpoint_name: "income_classifier".into(),
            name: name.into(),
            status,
            version: "0.0.1".into(),
            owner: "Piotr".into(),
            description: format!("{name} with simple pre- and post-processing"),
            code_reference: format!("{name}.rs"),
        }
    }

    #[tokio::test]
    async fn repeated_registration_is_idempotent() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let mut builder = RegistryBuilder::new(store.clone());
        let first = builder.register(reg("random forest", Status::Production), Arc::new(FixedPredictor::new("<=50K", 0.6))).await.unwrap();
        let second = builder.register(reg("random forest", Status::Testing), Arc::new(FixedPredictor::new(">50K", 0.6))).await.unwrap();
        assert_eq!(first, second);
        let registry = builder.build();
        assert_eq!(registry.ids(), vec![first]);
        // initial status survives re-registration with a different status
        assert_eq!(store.active_status(first).await.unwrap().unwrap().status, Status::Production);
        assert_eq!(store.status_history(Some(first)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lookup_miss_is_not_found() {
        let registry = Registry::default();
        assert!(registry.is_empty());
        assert!(matches!(registry.lookup(3), Err(GatewayError::NotFound { .. })));
    }
}
