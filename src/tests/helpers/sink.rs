use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::database::custom_types::JobId;
use crate::sink::{DataSink, SinkError};

/// Records staging and commit activity instead of writing anywhere, so tests
/// can assert the staged-then-committed contract.
#[derive(Default)]
pub(crate) struct MemorySink {
    staged: Mutex<BTreeMap<i64, u64>>,
    committed: Mutex<BTreeMap<i64, u64>>,
}

impl MemorySink {
    pub(crate) fn committed_jobs(&self) -> Vec<i64> {
        self.committed
            .lock()
            .expect("sink state")
            .keys()
            .copied()
            .collect()
    }

    pub(crate) fn committed_records(&self) -> u64 {
        self.committed.lock().expect("sink state").values().sum()
    }

    pub(crate) fn pending_jobs(&self) -> Vec<i64> {
        self.staged
            .lock()
            .expect("sink state")
            .keys()
            .copied()
            .collect()
    }
}

#[async_trait]
impl DataSink for MemorySink {
    async fn stage(
        &self,
        job_id: JobId,
        _resource_type: &str,
        records: &[serde_json::Value],
    ) -> Result<u64, SinkError> {
        let mut bytes = 0u64;
        for record in records.iter() {
            bytes += serde_json::to_vec(record)
                .map_err(SinkError::Serialization)?
                .len() as u64
                + 1;
        }

        *self
            .staged
            .lock()
            .expect("sink state")
            .entry(job_id.as_i64())
            .or_default() += records.len() as u64;

        Ok(bytes)
    }

    async fn commit(&self, job_id: JobId) -> Result<(), SinkError> {
        let mut staged = self.staged.lock().expect("sink state");

        if let Some(records) = staged.remove(&job_id.as_i64()) {
            *self
                .committed
                .lock()
                .expect("sink state")
                .entry(job_id.as_i64())
                .or_default() += records;
        }

        Ok(())
    }
}
