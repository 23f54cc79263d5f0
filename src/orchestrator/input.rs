use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Bumped whenever the shape of a job definition changes in a way that would
/// make an older agent misread it.
pub const CURRENT_JOB_VERSION: u32 = 1;

/// Discriminator carried inside every job definition so the handler factory
/// knows what it's building without guessing from the payload shape.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Orchestrator,
    Processing,
}

/// Definition of one orchestration run: extract everything whose
/// `lastUpdated` falls in `[data_start_time, data_end_time)`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorJobInputData {
    pub job_type: JobType,
    pub trigger_sequence_id: i64,
    pub job_version: u32,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub data_start_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub data_end_time: OffsetDateTime,

    /// Optional floor applied on top of the window, used when a pipeline is
    /// configured to ignore history before a fixed instant.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub since: Option<OffsetDateTime>,
}
