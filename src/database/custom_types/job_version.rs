use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Lease fencing token for a job. A fresh version is stamped on every dequeue;
/// a worker whose copy no longer matches the stored version has lost its lease
/// and must not mutate the job.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct JobVersion(i64);

impl JobVersion {
    /// Microsecond ticks since the unix epoch. Strictly increasing across
    /// dequeues of the same job as long as successive dequeues are more than a
    /// microsecond apart, which the visibility timeout guarantees in practice.
    pub fn now() -> Self {
        let ticks = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000;
        Self(ticks as i64)
    }

    pub fn initial() -> Self {
        Self(0)
    }
}

impl Display for JobVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobVersion {
    fn from(val: i64) -> Self {
        Self(val)
    }
}
