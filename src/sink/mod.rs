use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path as StorePath;
use object_store::ObjectStore;
use uuid::Uuid;

use crate::database::custom_types::JobId;

/// The pipeline's view of the columnar writer. Processing jobs stage their
/// extracted batches under their job id; the orchestrator commits a job's
/// staged output exactly when it observes that child as completed, which is
/// what keeps re-leased children from leaking half-written output.
#[async_trait]
pub trait DataSink: Send + Sync {
    /// Stages one batch of records for the job, returning the staged size in
    /// bytes.
    async fn stage(
        &self,
        job_id: JobId,
        resource_type: &str,
        records: &[serde_json::Value],
    ) -> Result<u64, SinkError>;

    /// Publishes everything staged for the job. Committing a job with
    /// nothing staged (or one already committed) is a no-op, so replays are
    /// harmless.
    async fn commit(&self, job_id: JobId) -> Result<(), SinkError>;
}

/// Object-store backed sink landing newline-delimited JSON blobs. Staged
/// blobs live under `staging/{job}` and move under `results/` on commit.
pub struct LakeSink {
    store: Arc<dyn ObjectStore>,
}

impl LakeSink {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn staging_prefix(job_id: JobId) -> StorePath {
        StorePath::from(format!("staging/{job_id}"))
    }
}

#[async_trait]
impl DataSink for LakeSink {
    async fn stage(
        &self,
        job_id: JobId,
        resource_type: &str,
        records: &[serde_json::Value],
    ) -> Result<u64, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut encoded = Vec::new();
        for record in records.iter() {
            let line = serde_json::to_vec(record).map_err(SinkError::Serialization)?;
            encoded.extend_from_slice(&line);
            encoded.push(b'\n');
        }

        let size = encoded.len() as u64;
        let location = StorePath::from(format!(
            "staging/{job_id}/{resource_type}/{}.ndjson",
            Uuid::new_v4()
        ));

        self.store
            .put(&location, Bytes::from(encoded))
            .await
            .map_err(SinkError::Store)?;

        tracing::debug!(%job_id, resource_type, size, "staged extraction batch");

        Ok(size)
    }

    async fn commit(&self, job_id: JobId) -> Result<(), SinkError> {
        let prefix = Self::staging_prefix(job_id);

        let staged: Vec<_> = self
            .store
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(SinkError::Store)?;

        for object in staged.iter() {
            let relative = object
                .location
                .as_ref()
                .strip_prefix("staging/")
                .unwrap_or(object.location.as_ref());
            let destination = StorePath::from(format!("results/{relative}"));

            self.store
                .copy(&object.location, &destination)
                .await
                .map_err(SinkError::Store)?;
            self.store
                .delete(&object.location)
                .await
                .map_err(SinkError::Store)?;
        }

        if !staged.is_empty() {
            tracing::info!(%job_id, blobs = staged.len(), "committed staged output");
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("unable to serialize records for staging: {0}")]
    Serialization(serde_json::Error),

    #[error("object store operation failed: {0}")]
    Store(object_store::Error),
}
