use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::database::custom_types::JobId;
use crate::orchestrator::processing::ProcessingJobResult;

/// The orchestrator's aggregate result, doubling as its persisted progress
/// snapshot. Everything needed to resume after a crash lives here: the
/// in-flight child set, the enqueue cursors, and the counts merged so far.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorJobResult {
    /// Monotone count of distinct children created; each child's
    /// `processing_job_sequence_id` is the value this held when it was built.
    pub created_job_count: u64,

    pub running_job_ids: BTreeSet<JobId>,

    /// Group scope resume cursor: patients before this index are already
    /// covered by enqueued children.
    pub next_patient_index: usize,

    pub total_resource_counts: BTreeMap<String, u64>,
    pub processed_resource_counts: BTreeMap<String, u64>,
    pub skipped_resource_counts: BTreeMap<String, u64>,

    pub processed_count_in_total: u64,
    pub processed_data_size_in_total: u64,

    /// System scope resume cursors: per resource type, the exclusive upper
    /// bound already handed to children.
    pub submitted_resource_timestamps: BTreeMap<String, OffsetDateTime>,

    /// Change-feed resume cursors. The end offset is captured once at the
    /// start of the run so a resumed orchestrator re-plans the same chunks.
    pub change_feed_end_offset: Option<i64>,
    pub submitted_change_feed_offset: Option<i64>,

    #[serde(with = "time::serde::rfc3339::option")]
    pub complete_time: Option<OffsetDateTime>,
}

impl OrchestratorJobResult {
    /// Folds a completed child's counts into the aggregate. Children are
    /// merged exactly once because merging and removal from
    /// `running_job_ids` are persisted as one snapshot.
    pub fn merge_child(&mut self, child: &ProcessingJobResult) {
        for (resource_type, count) in child.total_resource_counts.iter() {
            *self
                .total_resource_counts
                .entry(resource_type.clone())
                .or_default() += count;
        }

        for (resource_type, count) in child.processed_resource_counts.iter() {
            *self
                .processed_resource_counts
                .entry(resource_type.clone())
                .or_default() += count;
        }

        for (resource_type, count) in child.skipped_resource_counts.iter() {
            *self
                .skipped_resource_counts
                .entry(resource_type.clone())
                .or_default() += count;
        }

        self.processed_count_in_total += child.processed_count_in_total;
        self.processed_data_size_in_total += child.processed_data_size_in_total;
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
