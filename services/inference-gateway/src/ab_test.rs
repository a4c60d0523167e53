//! A/B test lifecycle: opening puts both versions into `ab_testing`; closing scores them
//! on logged feedback and promotes the more accurate one.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{GatewayError, Result};
use crate::metrics::METRICS;
use crate::model::{AbTest, AbTestId, ModelVersionId, NewAbTest, NewStatus, Status};
use crate::status::StatusManager;
use crate::store::{RecordStore, WriteBatch, WriteOp};

pub const FINISHED: &str = "A/B Test finished.";
pub const ALREADY_FINISHED: &str = "A/B Test already finished.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CloseReport {
    pub message: String,
    pub summary: String,
    /// Promoted version; `None` when the test had already been closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<ModelVersionId>,
}

impl CloseReport {
    fn already_finished(test: &AbTest) -> Self {
        Self { message: ALREADY_FINISHED.into(), summary: test.summary.clone().unwrap_or_default(), winner: None }
    }

    pub fn is_already_finished(&self) -> bool { self.winner.is_none() }
}

#[derive(Clone)]
pub struct AbTestController {
    store: Arc<dyn RecordStore>,
}

impl AbTestController {
    pub fn new(store: Arc<dyn RecordStore>) -> Self { Self { store } }

    pub async fn get(&self, id: AbTestId) -> Result<AbTest> {
        self.store.ab_test(id).await?.ok_or_else(|| GatewayError::not_found("ab test", id))
    }

    pub async fn list(&self) -> Result<Vec<AbTest>> { self.store.ab_tests().await }

    /// Creates the test and moves both versions to `ab_testing` in one batch.
    pub async fn open_test(&self, new: NewAbTest) -> Result<AbTest> {
        if new.model_version_id_1 == new.model_version_id_2 {
            return Err(GatewayError::InvalidRequest("an A/B test needs two different model versions".into()));
        }
        let mut endpoints = Vec::with_capacity(2);
        for id in [new.model_version_id_1, new.model_version_id_2] {
            let mv = self.store.model_version(id).await?.ok_or_else(|| GatewayError::not_found("model version", id))?;
            endpoints.push(mv.endpoint_id);
        }
        if endpoints[0] != endpoints[1] {
            return Err(GatewayError::InvalidRequest(format!(
                "model versions {} and {} serve different endpoints", new.model_version_id_1, new.model_version_id_2
            )));
        }
        let batch = WriteBatch::new()
            .with(WriteOp::OpenAbTest(new.clone()))
            .with(StatusManager::activation(NewStatus::new(new.model_version_id_1, Status::AbTesting, new.created_by.clone()), None))
            .with(StatusManager::activation(NewStatus::new(new.model_version_id_2, Status::AbTesting, new.created_by.clone()), None));
        let test = self.store.commit(batch).await?.into_iter().find_map(|w| w.into_ab_test())
            .ok_or_else(|| GatewayError::Store("open wrote no A/B test".into()))?;
        METRICS.lifecycle.ab_tests_opened_total.add(1, &[]);
        info!(ab_test_id = test.id, title = %test.title, v1 = test.model_version_id_1, v2 = test.model_version_id_2, "A/B test opened");
        Ok(test)
    }

    /// Scores both versions over `[created_at, now)`, promotes the winner to `production`,
    /// demotes the loser to `testing` and closes the test, all in one batch. Closing a
    /// closed test returns its stored summary and changes nothing.
    pub async fn close_test(&self, id: AbTestId) -> Result<CloseReport> {
        let test = self.get(id).await?;
        if !test.is_open() { return Ok(CloseReport::already_finished(&test)); }

        let (v1, v2) = (test.model_version_id_1, test.model_version_id_2);
        let rev1 = self.store.status_revision(v1).await?;
        let rev2 = self.store.status_revision(v2).await?;
        let end = self.store.now();
        let a1 = self.accuracy(v1, &test, end).await?;
        let a2 = self.accuracy(v2, &test, end).await?;

        // strictly higher accuracy wins; ties go to the lower id
        let (winner, loser) = if a1 > a2 || (a1 == a2 && v1 < v2) { (v1, v2) } else { (v2, v1) };
        let summary = format!("Algorithm #1 accuracy: {a1}, Algorithm #2 accuracy: {a2}");
        let (winner_rev, loser_rev) = if winner == v1 { (rev1, rev2) } else { (rev2, rev1) };

        let batch = WriteBatch::new()
            .with(StatusManager::activation(NewStatus::new(winner, Status::Production, test.created_by.clone()), Some(winner_rev)))
            .with(StatusManager::activation(NewStatus::new(loser, Status::Testing, test.created_by.clone()), Some(loser_rev)))
            .with(WriteOp::CloseAbTest { id, summary: summary.clone(), ended_at: end });
        match self.store.commit(batch).await {
            Ok(_) => {}
            Err(GatewayError::AlreadyFinished(_)) => {
                warn!(ab_test_id = id, "A/B test closed concurrently");
                return Ok(CloseReport::already_finished(&self.get(id).await?));
            }
            Err(e) => return Err(e),
        }
        METRICS.lifecycle.ab_tests_closed_total.add(1, &[]);
        info!(ab_test_id = id, winner, loser, %summary, "A/B test closed");
        Ok(CloseReport { message: FINISHED.into(), summary, winner: Some(winner) })
    }

    async fn accuracy(&self, mv: ModelVersionId, test: &AbTest, end: chrono::DateTime<chrono::Utc>) -> Result<f64> {
        let counts = self.store.accuracy_counts(mv, test.created_at, end).await?;
        counts.accuracy().ok_or(GatewayError::InsufficientData(mv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewModelVersion, NewRequestLog};
    use crate::store::MemoryStore;
    use serde_json::json;

    async fn pair(store: &Arc<dyn RecordStore>) -> (ModelVersionId, ModelVersionId) {
        let (ep, _) = store.get_or_create_endpoint("income_classifier", "ops").await.unwrap();
        let mut ids = Vec::new();
        for name in ["random forest", "extra trees"] {
            let new = NewModelVersion { name: name.into(), description: name.into(), code_reference: "-".into(), version: "0.0.1".into(), owner: "ops".into(), endpoint_id: ep.id };
            ids.push(store.get_or_create_model_version(new, Status::Testing).await.unwrap().0.id);
        }
        (ids[0], ids[1])
    }

    async fn log(store: &Arc<dyn RecordStore>, mv: ModelVersionId, n: usize, correct: usize) {
        for i in 0..n {
            let r = store.insert_request(NewRequestLog { input_data: json!({}), full_response: json!({}), response: ">50K".into(), model_version_id: mv }).await.unwrap();
            let feedback = if i < correct { ">50K" } else { "<=50K" };
            store.set_feedback(r.id, feedback.into()).await.unwrap();
        }
    }

    fn new_test(v1: ModelVersionId, v2: ModelVersionId) -> NewAbTest {
        NewAbTest { title: "rf vs et".into(), created_by: "ops".into(), model_version_id_1: v1, model_version_id_2: v2 }
    }

    #[tokio::test]
    async fn tie_goes_to_lower_id() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let (v1, v2) = pair(&store).await;
        let ctl = AbTestController::new(store.clone());
        // version 2 listed first so the tie rule, not the position, decides
        let test = ctl.open_test(new_test(v2, v1)).await.unwrap();
        log(&store, v1, 4, 2).await;
        log(&store, v2, 2, 1).await;
        let report = ctl.close_test(test.id).await.unwrap();
        assert_eq!(report.winner, Some(v1));
        assert_eq!(report.summary, "Algorithm #1 accuracy: 0.5, Algorithm #2 accuracy: 0.5");
    }

    #[tokio::test]
    async fn open_rejects_same_version_twice() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let (v1, _) = pair(&store).await;
        let ctl = AbTestController::new(store);
        assert!(matches!(ctl.open_test(new_test(v1, v1)).await, Err(GatewayError::InvalidRequest(_))));
        assert!(matches!(ctl.open_test(new_test(v1, 404)).await, Err(GatewayError::NotFound { .. })));
        assert!(ctl.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_rejects_versions_of_different_endpoints() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let (v1, _) = pair(&store).await;
        let (other, _) = store.get_or_create_endpoint("churn", "ops").await.unwrap();
        let new = NewModelVersion { name: "logit".into(), description: "-".into(), code_reference: "-".into(), version: "0.0.1".into(), owner: "ops".into(), endpoint_id: other.id };
        let (foreign, _) = store.get_or_create_model_version(new, Status::Testing).await.unwrap();

        let ctl = AbTestController::new(store.clone());
        assert!(matches!(ctl.open_test(new_test(v1, foreign.id)).await, Err(GatewayError::InvalidRequest(_))));
        assert!(ctl.list().await.unwrap().is_empty());
        assert_eq!(store.active_status(v1).await.unwrap().unwrap().status, Status::Testing);
        assert_eq!(store.active_status(foreign.id).await.unwrap().unwrap().status, Status::Testing);
    }

    #[tokio::test]
    async fn close_unknown_test_is_not_found() {
        let ctl = AbTestController::new(Arc::new(MemoryStore::new()));
        assert!(matches!(ctl.close_test(1).await, Err(GatewayError::NotFound { .. })));
    }
}
