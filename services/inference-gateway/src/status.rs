//! Status transitions. Every activation goes through [`RecordStore::commit`], which
//! deactivates older records of the model version in the same transaction.

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::info;

use crate::error::{GatewayError, Result};
use crate::metrics::METRICS;
use crate::model::{ModelVersionId, NewStatus, StatusRecord};
use crate::store::{RecordStore, WriteBatch, WriteOp};

#[derive(Clone)]
pub struct StatusManager {
    store: Arc<dyn RecordStore>,
}

impl StatusManager {
    pub fn new(store: Arc<dyn RecordStore>) -> Self { Self { store } }

    /// Activation step for callers composing their own batch.
    pub fn activation(new: NewStatus, expected_revision: Option<u64>) -> WriteOp {
        WriteOp::Activate { status: new, expected_revision }
    }

    pub async fn set_active(&self, new: NewStatus) -> Result<StatusRecord> {
        self.apply(new, None).await
    }

    /// Fails with `ConcurrencyConflict` unless the model version is still at `expected_revision`.
    pub async fn set_active_if(&self, new: NewStatus, expected_revision: u64) -> Result<StatusRecord> {
        self.apply(new, Some(expected_revision)).await
    }

    async fn apply(&self, new: NewStatus, expected_revision: Option<u64>) -> Result<StatusRecord> {
        let written = self.store.commit(WriteBatch::new().with(Self::activation(new, expected_revision))).await?;
        let record = written.into_iter().next().and_then(|w| w.into_status())
            .ok_or_else(|| GatewayError::Store("activation wrote no status record".into()))?;
        METRICS.lifecycle.status_transitions_total.add(1, &[KeyValue::new("status", record.status.as_str())]);
        info!(model_version_id = record.model_version_id, status = %record.status, created_by = %record.created_by, "status activated");
        Ok(record)
    }

    pub async fn current(&self, model_version_id: ModelVersionId) -> Result<Option<StatusRecord>> {
        self.store.active_status(model_version_id).await
    }

    pub async fn revision(&self, model_version_id: ModelVersionId) -> Result<u64> {
        self.store.status_revision(model_version_id).await
    }

    pub async fn history(&self, model_version_id: ModelVersionId) -> Result<Vec<StatusRecord>> {
        self.store.status_history(Some(model_version_id)).await
    }
}
