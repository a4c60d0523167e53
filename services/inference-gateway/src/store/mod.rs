//! Transactional record store for the gateway entities.
//!
//! All multi-entity mutations go through [`RecordStore::commit`], which applies a
//! [`WriteBatch`] all-or-nothing. Implementations serialize activations per model
//! version, so at most one status record of a model version is ever active.

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::*;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Store clock. Strictly increasing across calls; every `created_at` comes from it.
    fn now(&self) -> DateTime<Utc>;

    async fn get_or_create_endpoint(&self, name: &str, owner: &str) -> Result<(Endpoint, bool)>;
    async fn endpoint(&self, id: EndpointId) -> Result<Option<Endpoint>>;
    async fn endpoint_by_name(&self, name: &str) -> Result<Option<Endpoint>>;
    async fn endpoints(&self) -> Result<Vec<Endpoint>>;

    /// Creates the model version together with its initial active status, or returns the
    /// existing row with the same uniqueness key untouched.
    async fn get_or_create_model_version(&self, new: NewModelVersion, initial_status: Status) -> Result<(ModelVersion, bool)>;
    async fn model_version(&self, id: ModelVersionId) -> Result<Option<ModelVersion>>;
    async fn model_versions(&self, endpoint_id: Option<EndpointId>) -> Result<Vec<ModelVersion>>;
    /// Versions of the endpoint whose active status equals `status`, ascending by id.
    async fn candidates(&self, endpoint_id: EndpointId, status: Status) -> Result<Vec<ModelVersion>>;

    async fn status(&self, id: StatusId) -> Result<Option<StatusRecord>>;
    async fn active_status(&self, model_version_id: ModelVersionId) -> Result<Option<StatusRecord>>;
    /// Number of activations committed for the model version.
    async fn status_revision(&self, model_version_id: ModelVersionId) -> Result<u64>;
    async fn status_history(&self, model_version_id: Option<ModelVersionId>) -> Result<Vec<StatusRecord>>;

    async fn insert_request(&self, new: NewRequestLog) -> Result<RequestLog>;
    async fn request(&self, id: RequestId) -> Result<Option<RequestLog>>;
    async fn requests(&self, model_version_id: Option<ModelVersionId>) -> Result<Vec<RequestLog>>;
    /// Sets feedback once; a second call fails with `FeedbackAlreadySet`.
    async fn set_feedback(&self, id: RequestId, feedback: String) -> Result<RequestLog>;
    /// Counts over requests with `from <= created_at < to`.
    async fn accuracy_counts(&self, model_version_id: ModelVersionId, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<AccuracyCounts>;

    async fn ab_test(&self, id: AbTestId) -> Result<Option<AbTest>>;
    async fn ab_tests(&self) -> Result<Vec<AbTest>>;

    async fn commit(&self, batch: WriteBatch) -> Result<Vec<Written>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Persist a new active status and deactivate every older active record of the same
    /// model version. Fails the batch with `ConcurrencyConflict` when `expected_revision`
    /// is set and differs from the committed revision.
    Activate { status: NewStatus, expected_revision: Option<u64> },
    OpenAbTest(NewAbTest),
    /// Fails the batch with `AlreadyFinished` if the test is already closed.
    CloseAbTest { id: AbTestId, summary: String, ended_at: DateTime<Utc> },
}

/// Result of one [`WriteOp`], in batch order.
#[derive(Debug, Clone, PartialEq)]
pub enum Written {
    Status(StatusRecord),
    AbTestOpened(AbTest),
    AbTestClosed(AbTest),
}

impl Written {
    pub fn into_status(self) -> Option<StatusRecord> {
        match self { Written::Status(s) => Some(s), _ => None }
    }

    pub fn into_ab_test(self) -> Option<AbTest> {
        match self { Written::AbTestOpened(t) | Written::AbTestClosed(t) => Some(t), _ => None }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn with(mut self, op: WriteOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn len(&self) -> usize { self.ops.len() }
    pub fn is_empty(&self) -> bool { self.ops.is_empty() }
    pub fn ops(&self) -> &[WriteOp] { &self.ops }
    pub fn into_ops(self) -> Vec<WriteOp> { self.ops }
}

/// Wall clock in microseconds, bumped forward when two reads land on the same tick.
#[derive(Debug, Default)]
pub(crate) struct MonotonicClock {
    last_micros: AtomicI64,
}

impl MonotonicClock {
    pub(crate) fn now(&self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_micros();
        let mut prev = self.last_micros.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev + 1);
            match self.last_micros.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now),
                Err(actual) => prev = actual,
            }
        }
    }
}
