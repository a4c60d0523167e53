#![allow(dead_code)]

use std::sync::Arc;

use inference_gateway::model::{ModelVersionId, NewRequestLog, Status};
use inference_gateway::{FixedPredictor, Predictor, RecordStore, Registration, Registry, RegistryBuilder};
use serde_json::json;

pub const ENDPOINT: &str = "income_classifier";

pub fn registration(name: &str, status: Status, version: &str) -> Registration {
    Registration {
        endpoint_name: ENDPOINT.into(),
        name: name.into(),
        status,
        version: version.into(),
        owner: "Piotr".into(),
        description: format!("{name} with simple pre- and post-processing"),
        code_reference: format!("predictors/{}.rs", name.replace(' ', "_")),
    }
}

pub struct Seeded {
    pub registry: Registry,
    pub rf: ModelVersionId,
    pub et: ModelVersionId,
}

/// Registers "random forest" as production and "extra trees" as testing. Their
/// predictors answer with the model name so callers can see who served a request.
pub async fn seed(store: Arc<dyn RecordStore>) -> Seeded {
    let mut builder = RegistryBuilder::new(store);
    let rf = builder.register(registration("random forest", Status::Production, "0.0.1"), Arc::new(FixedPredictor::new("rf", 0.6))).await.unwrap();
    let et = builder.register(registration("extra trees", Status::Testing, "0.0.1"), Arc::new(FixedPredictor::new("et", 0.6))).await.unwrap();
    Seeded { registry: builder.build(), rf, et }
}

pub fn fixed(label: &str) -> Arc<dyn Predictor> { Arc::new(FixedPredictor::new(label, 0.5)) }

/// Logs `total` requests for the model version predicting ">50K", the first `correct` of
/// them confirmed by feedback.
pub async fn log_scored(store: &Arc<dyn RecordStore>, mv: ModelVersionId, total: usize, correct: usize) {
    for i in 0..total {
        let log = store.insert_request(NewRequestLog {
            input_data: json!({"age": 30 + i}),
            full_response: json!({"status": "OK", "label": ">50K", "probability": 0.6}),
            response: ">50K".into(),
            model_version_id: mv,
        }).await.unwrap();
        let feedback = if i < correct { ">50K" } else { "<=50K" };
        store.set_feedback(log.id, feedback.into()).await.unwrap();
    }
}

pub async fn active_status(store: &Arc<dyn RecordStore>, mv: ModelVersionId) -> Status {
    store.active_status(mv).await.unwrap().unwrap().status
}

pub async fn assert_single_active(store: &Arc<dyn RecordStore>) {
    for mv in store.model_versions(None).await.unwrap() {
        let active = store.status_history(Some(mv.id)).await.unwrap().into_iter().filter(|s| s.active).count();
        assert!(active <= 1, "model version {} has {active} active records", mv.id);
    }
}

pub fn memory_store() -> Arc<dyn RecordStore> { Arc::new(inference_gateway::MemoryStore::new()) }

pub fn sled_store() -> Arc<dyn RecordStore> { Arc::new(inference_gateway::SledStore::temporary().unwrap()) }
