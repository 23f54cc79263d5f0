use serde::{Deserialize, Serialize};
use sha2::Digest;

use crate::database::custom_types::{GroupId, JobId, MessageId, PopReceipt, QueueType};

/// Partition holding both the JobInfo and JobLock rows of one (queue type,
/// group) pair.
pub(crate) fn job_partition_key(queue_type: QueueType, group_id: GroupId) -> String {
    format!("{queue_type}:{}", group_id.padded())
}

/// Fixed-width row key so jobs within a partition sort by id.
pub(crate) fn job_info_row_key(group_id: GroupId, id: JobId) -> String {
    format!("{}:{}", group_id.padded(), id.padded())
}

/// Lock rows are addressed by the definition hash, which is what makes
/// duplicate enqueue observable as a row collision.
pub(crate) fn job_lock_row_key(definition: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(definition.as_bytes());
    let digest = hasher.finalize();

    format!("lock:{}", hex::encode(digest))
}

pub(crate) fn reverse_index_partition_key(queue_type: QueueType) -> String {
    format!("{queue_type}:idx")
}

pub(crate) fn counter_partition_key(queue_type: QueueType) -> String {
    format!("{queue_type}:counter")
}

pub(crate) const COUNTER_ROW_KEY: &str = "next-job-id";

pub(crate) fn message_queue_name(queue_type: QueueType) -> String {
    format!("jobs-{queue_type}")
}

/// Sibling of a JobInfo row sharing its partition. At most one lock exists per
/// (queue type, group, definition hash); the lock also remembers which queue
/// message currently represents the job.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JobLockRecord {
    pub job_info_row_key: String,
    pub message_id: Option<MessageId>,
    pub pop_receipt: Option<PopReceipt>,
}

/// Points from a bare job id back to the JobInfo row for O(1) lookup by id.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReverseIndexRecord {
    pub job_info_partition_key: String,
    pub job_info_row_key: String,
}

/// Singleton per queue type, advanced under optimistic concurrency to
/// allocate ids.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JobIdCounterRecord {
    pub next_job_id: i64,
}

/// Queue message body. A pointer to the table entities, nothing more.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct JobMessage {
    #[serde(rename = "pk")]
    pub partition_key: String,
    #[serde(rename = "rk")]
    pub row_key: String,
    #[serde(rename = "lockrk")]
    pub lock_row_key: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_row_keys_sort_by_id() {
        let group = GroupId::from(7);

        let early = job_info_row_key(group, JobId::from(9));
        let late = job_info_row_key(group, JobId::from(10));

        assert!(early < late);
    }

    #[test]
    fn test_lock_row_key_is_stable() {
        let a = job_lock_row_key("{\"resourceType\":\"Patient\"}");
        let b = job_lock_row_key("{\"resourceType\":\"Patient\"}");
        let c = job_lock_row_key("{\"resourceType\":\"Observation\"}");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("lock:"));
    }

    #[test]
    fn test_message_body_wire_names() {
        let message = JobMessage {
            partition_key: "000:p".to_string(),
            row_key: "r".to_string(),
            lock_row_key: "l".to_string(),
        };

        let encoded = serde_json::to_string(&message).expect("encode");
        assert_eq!(encoded, "{\"pk\":\"000:p\",\"rk\":\"r\",\"lockrk\":\"l\"}");
    }
}
