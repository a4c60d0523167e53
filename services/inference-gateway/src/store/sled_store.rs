use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError, TransactionResult};
use sled::{IVec, Transactional, Tree};
use tracing::{debug, info};

use super::{MonotonicClock, RecordStore, WriteBatch, WriteOp, Written};
use crate::error::{GatewayError, Result};
use crate::model::*;

fn key(id: u64) -> IVec { IVec::from(&id.to_be_bytes()[..]) }

fn decode_id(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| GatewayError::Store(format!("corrupt id of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

fn encode<T: Serialize>(value: &T) -> Result<IVec> { Ok(IVec::from(serde_json::to_vec(value)?)) }

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> { Ok(serde_json::from_slice(bytes)?) }

/// Lifts a store result into a sled transaction, aborting it on error.
fn tx<T>(r: Result<T>) -> ConflictableTransactionResult<T, GatewayError> { r.map_err(ConflictableTransactionError::Abort) }

fn abort<T>(e: GatewayError) -> ConflictableTransactionResult<T, GatewayError> { Err(ConflictableTransactionError::Abort(e)) }

fn finish<T>(r: TransactionResult<T, GatewayError>) -> Result<T> {
    r.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => e.into(),
    })
}

/// Persistent store on sled. One tree per entity plus index trees; every multi-tree
/// mutation runs in a single serializable sled transaction.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    endpoints: Tree,
    endpoint_names: Tree,
    model_versions: Tree,
    model_version_keys: Tree,
    statuses: Tree,
    /// model version id -> id of its active status record
    active_status: Tree,
    /// model version id -> activation count
    revisions: Tree,
    requests: Tree,
    ab_tests: Tree,
    clock: std::sync::Arc<MonotonicClock>,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), recovered = db.was_recovered(), "sled store opened");
        Self::with_db(db)
    }

    /// Store backed by a temporary database removed on drop.
    pub fn temporary() -> Result<Self> {
        Self::with_db(sled::Config::new().temporary(true).open()?)
    }

    fn with_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            endpoints: db.open_tree("endpoints")?,
            endpoint_names: db.open_tree("endpoint_names")?,
            model_versions: db.open_tree("model_versions")?,
            model_version_keys: db.open_tree("model_version_keys")?,
            statuses: db.open_tree("statuses")?,
            active_status: db.open_tree("active_status")?,
            revisions: db.open_tree("status_revisions")?,
            requests: db.open_tree("requests")?,
            ab_tests: db.open_tree("ab_tests")?,
            clock: Default::default(),
            db,
        })
    }

    fn next_id(&self) -> Result<u64> { Ok(self.db.generate_id()? + 1) }

    fn get<T: DeserializeOwned>(tree: &Tree, id: u64) -> Result<Option<T>> {
        tree.get(key(id))?.map(|v| decode(&v)).transpose()
    }

    fn scan<T: DeserializeOwned>(tree: &Tree) -> impl Iterator<Item = Result<T>> + '_ {
        tree.iter().values().map(|v| decode(&v?))
    }

    fn collect<T, F>(tree: &Tree, keep: F) -> Result<Vec<T>>
    where T: DeserializeOwned, F: Fn(&T) -> bool {
        let mut out = Vec::new();
        for item in Self::scan::<T>(tree) {
            let item = item?;
            if keep(&item) { out.push(item); }
        }
        Ok(out)
    }

    /// Runs sled work on the blocking pool. Transactions spin on conflict and `flush`
    /// waits on disk, so neither may occupy a runtime worker.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where T: Send + 'static, F: FnOnce(&SledStore) -> Result<T> + Send + 'static {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store)).await
            .map_err(|e| GatewayError::Store(format!("sled task failed: {e}")))?
    }

    fn create_endpoint(&self, name: &str, owner: &str) -> Result<(Endpoint, bool)> {
        let id = self.next_id()?;
        let created_at = self.clock.now();
        let res = (&self.endpoints, &self.endpoint_names).transaction(|(endpoints, names)| {
            if let Some(existing) = names.get(name.as_bytes())? {
                let Some(bytes) = endpoints.get(&existing)? else { return abort(GatewayError::Store(format!("dangling endpoint index for '{name}'"))) };
                return Ok((tx(decode(&bytes))?, false));
            }
            let ep = Endpoint { id, name: name.to_string(), owner: owner.to_string(), created_at };
            endpoints.insert(key(id), tx(encode(&ep))?)?;
            names.insert(name.as_bytes(), key(id))?;
            Ok((ep, true))
        });
        let out = finish(res)?;
        if out.1 { self.db.flush()?; }
        Ok(out)
    }

    fn create_model_version(&self, new: &NewModelVersion, initial_status: Status) -> Result<(ModelVersion, bool)> {
        let unique = new.unique_key();
        let mv_id = self.next_id()?;
        let status_id = self.next_id()?;
        let created_at = self.clock.now();
        let status_at = self.clock.now();
        let res = (&self.endpoints, &self.model_versions, &self.model_version_keys, &self.statuses, &self.active_status, &self.revisions)
            .transaction(|(endpoints, versions, keys, statuses, active, revisions)| {
                if endpoints.get(key(new.endpoint_id))?.is_none() { return abort(GatewayError::not_found("endpoint", new.endpoint_id)); }
                if let Some(existing) = keys.get(unique.as_bytes())? {
                    let Some(bytes) = versions.get(&existing)? else { return abort(GatewayError::Store(format!("dangling model version index for {}", new.name))) };
                    return Ok((tx(decode(&bytes))?, false));
                }
                let mv = ModelVersion {
                    id: mv_id,
                    name: new.name.clone(),
                    description: new.description.clone(),
                    code_reference: new.code_reference.clone(),
                    version: new.version.clone(),
                    owner: new.owner.clone(),
                    created_at,
                    endpoint_id: new.endpoint_id,
                };
                let status = StatusRecord { id: status_id, status: initial_status, active: true, created_by: new.owner.clone(), created_at: status_at, model_version_id: mv_id };
                versions.insert(key(mv_id), tx(encode(&mv))?)?;
                keys.insert(unique.as_bytes(), key(mv_id))?;
                statuses.insert(key(status_id), tx(encode(&status))?)?;
                active.insert(key(mv_id), key(status_id))?;
                revisions.insert(key(mv_id), key(1))?;
                Ok((mv, true))
            });
        let out = finish(res)?;
        if out.1 { self.db.flush()?; }
        Ok(out)
    }

    fn record_feedback(&self, id: RequestId, feedback: &str) -> Result<RequestLog> {
        let res = self.requests.transaction(|requests| {
            let Some(bytes) = requests.get(key(id))? else { return abort(GatewayError::not_found("request", id)) };
            let mut log: RequestLog = tx(decode(&bytes))?;
            if log.feedback.is_some() { return abort(GatewayError::FeedbackAlreadySet(id)); }
            log.feedback = Some(feedback.to_string());
            requests.insert(key(id), tx(encode(&log))?)?;
            Ok(log)
        });
        finish(res)
    }

    fn apply(&self, batch: &WriteBatch) -> Result<Vec<Written>> {
        // ids are fixed outside the body, which sled reruns on conflict; timestamps are taken
        // inside it so the last committed activation is also the newest
        let mut ids = Vec::with_capacity(batch.len());
        for op in batch.ops() {
            ids.push(match op { WriteOp::CloseAbTest { id, .. } => *id, _ => self.next_id()? });
        }
        let res = (&self.model_versions, &self.statuses, &self.active_status, &self.revisions, &self.ab_tests)
            .transaction(|(versions, statuses, active, revisions, ab_tests)| {
                let mut written = Vec::with_capacity(ids.len());
                for (op, id) in batch.ops().iter().zip(ids.iter().copied()) {
                    let now = self.clock.now();
                    match op {
                        WriteOp::Activate { status, expected_revision } => {
                            let mv = status.model_version_id;
                            if versions.get(key(mv))?.is_none() { return abort(GatewayError::not_found("model version", mv)); }
                            let current = match revisions.get(key(mv))? { Some(v) => tx(decode_id(&v))?, None => 0 };
                            if let Some(expected) = expected_revision {
                                if *expected != current {
                                    return abort(GatewayError::ConcurrencyConflict(format!("model version {mv} is at revision {current}, expected {expected}")));
                                }
                            }
                            // the index always points at the most recently committed record
                            if let Some(prev_id) = active.get(key(mv))? {
                                if let Some(bytes) = statuses.get(&prev_id)? {
                                    let mut prev: StatusRecord = tx(decode(&bytes))?;
                                    if prev.active {
                                        prev.active = false;
                                        statuses.insert(prev_id, tx(encode(&prev))?)?;
                                    }
                                }
                            }
                            let record = StatusRecord { id, status: status.status, active: true, created_by: status.created_by.clone(), created_at: now, model_version_id: mv };
                            statuses.insert(key(id), tx(encode(&record))?)?;
                            active.insert(key(mv), key(id))?;
                            revisions.insert(key(mv), key(current + 1))?;
                            written.push(Written::Status(record));
                        }
                        WriteOp::OpenAbTest(new) => {
                            for mv in [new.model_version_id_1, new.model_version_id_2] {
                                if versions.get(key(mv))?.is_none() { return abort(GatewayError::not_found("model version", mv)); }
                            }
                            let test = AbTest {
                                id,
                                title: new.title.clone(),
                                created_by: new.created_by.clone(),
                                created_at: now,
                                ended_at: None,
                                summary: None,
                                model_version_id_1: new.model_version_id_1,
                                model_version_id_2: new.model_version_id_2,
                            };
                            ab_tests.insert(key(id), tx(encode(&test))?)?;
                            written.push(Written::AbTestOpened(test));
                        }
                        WriteOp::CloseAbTest { id, summary, ended_at } => {
                            let Some(bytes) = ab_tests.get(key(*id))? else { return abort(GatewayError::not_found("ab test", id)) };
                            let mut test: AbTest = tx(decode(&bytes))?;
                            if !test.is_open() { return abort(GatewayError::AlreadyFinished(*id)); }
                            test.ended_at = Some(*ended_at);
                            test.summary = Some(summary.clone());
                            ab_tests.insert(key(*id), tx(encode(&test))?)?;
                            written.push(Written::AbTestClosed(test));
                        }
                    }
                }
                Ok(written)
            });
        let written = finish(res)?;
        debug!(ops = written.len(), "batch committed");
        self.db.flush()?;
        Ok(written)
    }
}

#[async_trait]
impl RecordStore for SledStore {
    fn now(&self) -> DateTime<Utc> { self.clock.now() }

    async fn get_or_create_endpoint(&self, name: &str, owner: &str) -> Result<(Endpoint, bool)> {
        let (name, owner) = (name.to_string(), owner.to_string());
        self.blocking(move |s| s.create_endpoint(&name, &owner)).await
    }

    async fn endpoint(&self, id: EndpointId) -> Result<Option<Endpoint>> {
        Self::get(&self.endpoints, id)
    }

    async fn endpoint_by_name(&self, name: &str) -> Result<Option<Endpoint>> {
        match self.endpoint_names.get(name.as_bytes())? {
            Some(id) => Self::get(&self.endpoints, decode_id(&id)?),
            None => Ok(None),
        }
    }

    async fn endpoints(&self) -> Result<Vec<Endpoint>> {
        Self::collect(&self.endpoints, |_: &Endpoint| true)
    }

    async fn get_or_create_model_version(&self, new: NewModelVersion, initial_status: Status) -> Result<(ModelVersion, bool)> {
        self.blocking(move |s| s.create_model_version(&new, initial_status)).await
    }

    async fn model_version(&self, id: ModelVersionId) -> Result<Option<ModelVersion>> {
        Self::get(&self.model_versions, id)
    }

    async fn model_versions(&self, endpoint_id: Option<EndpointId>) -> Result<Vec<ModelVersion>> {
        Self::collect(&self.model_versions, |mv: &ModelVersion| endpoint_id.map_or(true, |e| mv.endpoint_id == e))
    }

    async fn candidates(&self, endpoint_id: EndpointId, status: Status) -> Result<Vec<ModelVersion>> {
        let mut out = Vec::new();
        for mv in self.model_versions(Some(endpoint_id)).await? {
            if self.active_status(mv.id).await?.map_or(false, |s| s.status == status) { out.push(mv); }
        }
        Ok(out)
    }

    async fn status(&self, id: StatusId) -> Result<Option<StatusRecord>> {
        Self::get(&self.statuses, id)
    }

    async fn active_status(&self, model_version_id: ModelVersionId) -> Result<Option<StatusRecord>> {
        match self.active_status.get(key(model_version_id))? {
            Some(id) => Self::get(&self.statuses, decode_id(&id)?),
            None => Ok(None),
        }
    }

    async fn status_revision(&self, model_version_id: ModelVersionId) -> Result<u64> {
        self.revisions.get(key(model_version_id))?.map(|v| decode_id(&v)).transpose().map(|r| r.unwrap_or(0))
    }

    async fn status_history(&self, model_version_id: Option<ModelVersionId>) -> Result<Vec<StatusRecord>> {
        Self::collect(&self.statuses, |s: &StatusRecord| model_version_id.map_or(true, |mv| s.model_version_id == mv))
    }

    async fn insert_request(&self, new: NewRequestLog) -> Result<RequestLog> {
        let log = RequestLog {
            id: self.next_id()?,
            input_data: new.input_data,
            full_response: new.full_response,
            response: new.response,
            feedback: None,
            created_at: self.clock.now(),
            model_version_id: new.model_version_id,
        };
        self.requests.insert(key(log.id), encode(&log)?)?;
        Ok(log)
    }

    async fn request(&self, id: RequestId) -> Result<Option<RequestLog>> {
        Self::get(&self.requests, id)
    }

    async fn requests(&self, model_version_id: Option<ModelVersionId>) -> Result<Vec<RequestLog>> {
        Self::collect(&self.requests, |r: &RequestLog| model_version_id.map_or(true, |mv| r.model_version_id == mv))
    }

    async fn set_feedback(&self, id: RequestId, feedback: String) -> Result<RequestLog> {
        self.blocking(move |s| s.record_feedback(id, &feedback)).await
    }

    async fn accuracy_counts(&self, model_version_id: ModelVersionId, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<AccuracyCounts> {
        let mut counts = AccuracyCounts::default();
        for log in Self::scan::<RequestLog>(&self.requests) {
            let log = log?;
            if log.model_version_id == model_version_id && log.created_at >= from && log.created_at < to { counts.observe(&log); }
        }
        Ok(counts)
    }

    async fn ab_test(&self, id: AbTestId) -> Result<Option<AbTest>> {
        Self::get(&self.ab_tests, id)
    }

    async fn ab_tests(&self) -> Result<Vec<AbTest>> {
        Self::collect(&self.ab_tests, |_: &AbTest| true)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<Vec<Written>> {
        self.blocking(move |s| s.apply(&batch)).await
    }
}
