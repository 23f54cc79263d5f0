use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::database::custom_types::{GroupId, JobId, JobStatus, JobVersion, QueueType};

/// The canonical record of a job. The table row holding this record is the
/// only authoritative state; queue messages merely point at it.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: JobId,
    pub queue_type: QueueType,
    pub group_id: GroupId,

    pub status: JobStatus,

    /// Opaque job input, serialized by the caller. Enqueue deduplicates on a
    /// hash of this value.
    pub definition: String,

    /// Opaque job output, also used as the in-flight progress snapshot so a
    /// re-leased job can resume where the previous worker left off.
    pub result: Option<String>,

    pub cancel_requested: bool,

    #[serde(with = "time::serde::rfc3339")]
    pub create_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub heartbeat_date_time: OffsetDateTime,
    pub heartbeat_timeout_secs: u64,

    pub version: JobVersion,
}

impl JobInfo {
    pub(crate) fn fresh(
        id: JobId,
        queue_type: QueueType,
        group_id: GroupId,
        definition: String,
    ) -> Self {
        let now = OffsetDateTime::now_utc();

        Self {
            id,
            queue_type,
            group_id,
            status: JobStatus::Created,
            definition,
            result: None,
            cancel_requested: false,
            create_date: now,
            heartbeat_date_time: now,
            heartbeat_timeout_secs: 0,
            version: JobVersion::initial(),
        }
    }
}
