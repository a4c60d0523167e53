use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use super::{MonotonicClock, RecordStore, WriteBatch, WriteOp, Written};
use crate::error::{GatewayError, Result};
use crate::model::*;

#[derive(Debug, Default)]
struct Sequences { endpoint: u64, model_version: u64, status: u64, request: u64, ab_test: u64 }

fn next(seq: &mut u64) -> u64 { *seq += 1; *seq }

#[derive(Debug, Default)]
struct Tables {
    seq: Sequences,
    endpoints: BTreeMap<EndpointId, Endpoint>,
    endpoint_names: HashMap<String, EndpointId>,
    model_versions: BTreeMap<ModelVersionId, ModelVersion>,
    model_version_keys: HashMap<String, ModelVersionId>,
    statuses: BTreeMap<StatusId, StatusRecord>,
    revisions: HashMap<ModelVersionId, u64>,
    requests: BTreeMap<RequestId, RequestLog>,
    ab_tests: BTreeMap<AbTestId, AbTest>,
}

impl Tables {
    fn active_status(&self, mv: ModelVersionId) -> Option<&StatusRecord> {
        self.statuses.values().rev().find(|s| s.model_version_id == mv && s.active)
    }

    fn activate(&mut self, new: NewStatus, created_at: DateTime<Utc>) -> StatusRecord {
        let mv = new.model_version_id;
        let mut deactivated = 0usize;
        for old in self.statuses.values_mut().filter(|s| s.model_version_id == mv && s.active && s.created_at < created_at) {
            old.active = false;
            deactivated += 1;
        }
        let record = StatusRecord { id: next(&mut self.seq.status), status: new.status, active: true, created_by: new.created_by, created_at, model_version_id: mv };
        self.statuses.insert(record.id, record.clone());
        *self.revisions.entry(mv).or_default() += 1;
        debug!(model_version_id = mv, status = %record.status, deactivated, "status activated");
        record
    }

    /// Checks every precondition of the batch against the current tables without
    /// mutating them, so that applying afterwards cannot fail halfway.
    fn validate(&self, ops: &[WriteOp]) -> Result<()> {
        let mut revisions: HashMap<ModelVersionId, u64> = HashMap::new();
        let mut closing: HashSet<AbTestId> = HashSet::new();
        for op in ops {
            match op {
                WriteOp::Activate { status, expected_revision } => {
                    let mv = status.model_version_id;
                    if !self.model_versions.contains_key(&mv) { return Err(GatewayError::not_found("model version", mv)); }
                    let current = *revisions.entry(mv).or_insert_with(|| self.revisions.get(&mv).copied().unwrap_or(0));
                    if let Some(expected) = expected_revision {
                        if *expected != current {
                            return Err(GatewayError::ConcurrencyConflict(format!("model version {mv} is at revision {current}, expected {expected}")));
                        }
                    }
                    revisions.insert(mv, current + 1);
                }
                WriteOp::OpenAbTest(new) => {
                    for mv in [new.model_version_id_1, new.model_version_id_2] {
                        if !self.model_versions.contains_key(&mv) { return Err(GatewayError::not_found("model version", mv)); }
                    }
                }
                WriteOp::CloseAbTest { id, .. } => {
                    let test = self.ab_tests.get(id).ok_or_else(|| GatewayError::not_found("ab test", id))?;
                    if !test.is_open() || !closing.insert(*id) { return Err(GatewayError::AlreadyFinished(*id)); }
                }
            }
        }
        Ok(())
    }
}

/// Process-local store. Every operation holds the table lock for a short synchronous
/// section and never across an await point.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    clock: MonotonicClock,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn now(&self) -> DateTime<Utc> { self.clock.now() }

    async fn get_or_create_endpoint(&self, name: &str, owner: &str) -> Result<(Endpoint, bool)> {
        let mut t = self.tables.write();
        if let Some(id) = t.endpoint_names.get(name) {
            let ep = t.endpoints.get(id).cloned().ok_or_else(|| GatewayError::Store(format!("dangling endpoint index for '{name}'")))?;
            return Ok((ep, false));
        }
        let ep = Endpoint { id: next(&mut t.seq.endpoint), name: name.to_string(), owner: owner.to_string(), created_at: self.clock.now() };
        t.endpoint_names.insert(ep.name.clone(), ep.id);
        t.endpoints.insert(ep.id, ep.clone());
        Ok((ep, true))
    }

    async fn endpoint(&self, id: EndpointId) -> Result<Option<Endpoint>> {
        Ok(self.tables.read().endpoints.get(&id).cloned())
    }

    async fn endpoint_by_name(&self, name: &str) -> Result<Option<Endpoint>> {
        let t = self.tables.read();
        Ok(t.endpoint_names.get(name).and_then(|id| t.endpoints.get(id)).cloned())
    }

    async fn endpoints(&self) -> Result<Vec<Endpoint>> {
        Ok(self.tables.read().endpoints.values().cloned().collect())
    }

    async fn get_or_create_model_version(&self, new: NewModelVersion, initial_status: Status) -> Result<(ModelVersion, bool)> {
        let key = new.unique_key();
        let mut t = self.tables.write();
        if !t.endpoints.contains_key(&new.endpoint_id) { return Err(GatewayError::not_found("endpoint", new.endpoint_id)); }
        if let Some(id) = t.model_version_keys.get(&key) {
            let mv = t.model_versions.get(id).cloned().ok_or_else(|| GatewayError::Store(format!("dangling model version index {id}")))?;
            return Ok((mv, false));
        }
        let mv = ModelVersion {
            id: next(&mut t.seq.model_version),
            name: new.name,
            description: new.description,
            code_reference: new.code_reference,
            version: new.version,
            owner: new.owner,
            created_at: self.clock.now(),
            endpoint_id: new.endpoint_id,
        };
        t.model_version_keys.insert(key, mv.id);
        t.model_versions.insert(mv.id, mv.clone());
        t.activate(NewStatus::new(mv.id, initial_status, mv.owner.clone()), self.clock.now());
        Ok((mv, true))
    }

    async fn model_version(&self, id: ModelVersionId) -> Result<Option<ModelVersion>> {
        Ok(self.tables.read().model_versions.get(&id).cloned())
    }

    async fn model_versions(&self, endpoint_id: Option<EndpointId>) -> Result<Vec<ModelVersion>> {
        Ok(self.tables.read().model_versions.values().filter(|mv| endpoint_id.map_or(true, |e| mv.endpoint_id == e)).cloned().collect())
    }

    async fn candidates(&self, endpoint_id: EndpointId, status: Status) -> Result<Vec<ModelVersion>> {
        let t = self.tables.read();
        Ok(t.model_versions.values()
            .filter(|mv| mv.endpoint_id == endpoint_id)
            .filter(|mv| t.active_status(mv.id).map_or(false, |s| s.status == status))
            .cloned()
            .collect())
    }

    async fn status(&self, id: StatusId) -> Result<Option<StatusRecord>> {
        Ok(self.tables.read().statuses.get(&id).cloned())
    }

    async fn active_status(&self, model_version_id: ModelVersionId) -> Result<Option<StatusRecord>> {
        Ok(self.tables.read().active_status(model_version_id).cloned())
    }

    async fn status_revision(&self, model_version_id: ModelVersionId) -> Result<u64> {
        Ok(self.tables.read().revisions.get(&model_version_id).copied().unwrap_or(0))
    }

    async fn status_history(&self, model_version_id: Option<ModelVersionId>) -> Result<Vec<StatusRecord>> {
        Ok(self.tables.read().statuses.values().filter(|s| model_version_id.map_or(true, |mv| s.model_version_id == mv)).cloned().collect())
    }

    async fn insert_request(&self, new: NewRequestLog) -> Result<RequestLog> {
        let mut t = self.tables.write();
        let log = RequestLog {
            id: next(&mut t.seq.request),
            input_data: new.input_data,
            full_response: new.full_response,
            response: new.response,
            feedback: None,
            created_at: self.clock.now(),
            model_version_id: new.model_version_id,
        };
        t.requests.insert(log.id, log.clone());
        Ok(log)
    }

    async fn request(&self, id: RequestId) -> Result<Option<RequestLog>> {
        Ok(self.tables.read().requests.get(&id).cloned())
    }

    async fn requests(&self, model_version_id: Option<ModelVersionId>) -> Result<Vec<RequestLog>> {
        Ok(self.tables.read().requests.values().filter(|r| model_version_id.map_or(true, |mv| r.model_version_id == mv)).cloned().collect())
    }

    async fn set_feedback(&self, id: RequestId, feedback: String) -> Result<RequestLog> {
        let mut t = self.tables.write();
        let log = t.requests.get_mut(&id).ok_or_else(|| GatewayError::not_found("request", id))?;
        if log.feedback.is_some() { return Err(GatewayError::FeedbackAlreadySet(id)); }
        log.feedback = Some(feedback);
        Ok(log.clone())
    }

    async fn accuracy_counts(&self, model_version_id: ModelVersionId, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<AccuracyCounts> {
        let t = self.tables.read();
        let mut counts = AccuracyCounts::default();
        t.requests.values()
            .filter(|r| r.model_version_id == model_version_id && r.created_at >= from && r.created_at < to)
            .for_each(|r| counts.observe(r));
        Ok(counts)
    }

    async fn ab_test(&self, id: AbTestId) -> Result<Option<AbTest>> {
        Ok(self.tables.read().ab_tests.get(&id).cloned())
    }

    async fn ab_tests(&self) -> Result<Vec<AbTest>> {
        Ok(self.tables.read().ab_tests.values().cloned().collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<Vec<Written>> {
        let mut t = self.tables.write();
        t.validate(batch.ops())?;
        let mut written = Vec::with_capacity(batch.len());
        for op in batch.into_ops() {
            match op {
                WriteOp::Activate { status, .. } => {
                    let created_at = self.clock.now();
                    written.push(Written::Status(t.activate(status, created_at)));
                }
                WriteOp::OpenAbTest(new) => {
                    let test = AbTest {
                        id: next(&mut t.seq.ab_test),
                        title: new.title,
                        created_by: new.created_by,
                        created_at: self.clock.now(),
                        ended_at: None,
                        summary: None,
                        model_version_id_1: new.model_version_id_1,
                        model_version_id_2: new.model_version_id_2,
                    };
                    t.ab_tests.insert(test.id, test.clone());
                    written.push(Written::AbTestOpened(test));
                }
                WriteOp::CloseAbTest { id, summary, ended_at } => {
                    // presence checked by validate
                    if let Some(test) = t.ab_tests.get_mut(&id) {
                        test.ended_at = Some(ended_at);
                        test.summary = Some(summary);
                        written.push(Written::AbTestClosed(test.clone()));
                    }
                }
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (MemoryStore, ModelVersion) {
        let store = MemoryStore::new();
        let (ep, _) = store.get_or_create_endpoint("income_classifier", "TR").await.unwrap();
        let (mv, _) = store.get_or_create_model_version(NewModelVersion {
            name: "random forest".into(), description: "rf".into(), code_reference: "rf.py".into(),
            version: "0.0.1".into(), owner: "TR".into(), endpoint_id: ep.id,
        }, Status::Production).await.unwrap();
        (store, mv)
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let (store, mv) = seeded().await;
        let (ep, created) = store.get_or_create_endpoint("income_classifier", "someone-else").await.unwrap();
        assert!(!created);
        assert_eq!(ep.owner, "TR");
        let (again, created) = store.get_or_create_model_version(NewModelVersion {
            name: "random forest".into(), description: "rf".into(), code_reference: "rf.py".into(),
            version: "0.0.1".into(), owner: "TR".into(), endpoint_id: ep.id,
        }, Status::Testing).await.unwrap();
        assert!(!created);
        assert_eq!(again.id, mv.id);
        // the initial status is only written for new rows
        assert_eq!(store.status_history(Some(mv.id)).await.unwrap().len(), 1);
        assert_eq!(store.active_status(mv.id).await.unwrap().unwrap().status, Status::Production);
    }

    #[tokio::test]
    async fn activation_deactivates_older_records() {
        let (store, mv) = seeded().await;
        for status in [Status::Staging, Status::Testing, Status::Production] {
            store.commit(WriteBatch::new().with(WriteOp::Activate { status: NewStatus::new(mv.id, status, "ops"), expected_revision: None })).await.unwrap();
        }
        let history = store.status_history(Some(mv.id)).await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history.iter().filter(|s| s.active).count(), 1);
        assert!(history.last().unwrap().active);
        assert_eq!(store.status_revision(mv.id).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn failed_batch_leaves_no_trace() {
        let (store, mv) = seeded().await;
        let batch = WriteBatch::new()
            .with(WriteOp::Activate { status: NewStatus::new(mv.id, Status::Testing, "ops"), expected_revision: None })
            .with(WriteOp::Activate { status: NewStatus::new(999, Status::Testing, "ops"), expected_revision: None });
        let err = store.commit(batch).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound { .. }));
        assert_eq!(store.active_status(mv.id).await.unwrap().unwrap().status, Status::Production);
        assert_eq!(store.status_revision(mv.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_revision_is_a_conflict() {
        let (store, mv) = seeded().await;
        let op = WriteOp::Activate { status: NewStatus::new(mv.id, Status::Testing, "ops"), expected_revision: Some(0) };
        let err = store.commit(WriteBatch::new().with(op)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn feedback_is_set_once() {
        let (store, mv) = seeded().await;
        let log = store.insert_request(NewRequestLog { input_data: serde_json::json!({"age": 37}), full_response: serde_json::json!({"label": "<=50K"}), response: "<=50K".into(), model_version_id: mv.id }).await.unwrap();
        let updated = store.set_feedback(log.id, "<=50K".into()).await.unwrap();
        assert_eq!(updated.feedback.as_deref(), Some("<=50K"));
        assert!(matches!(store.set_feedback(log.id, ">50K".into()).await, Err(GatewayError::FeedbackAlreadySet(_))));
        assert!(matches!(store.set_feedback(4242, "x".into()).await, Err(GatewayError::NotFound { .. })));
    }
}
