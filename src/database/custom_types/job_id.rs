use std::fmt::{self, Debug, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Monotone 64-bit job identifier, globally unique within a queue type. Ids
/// are allocated by the queue's counter entity and are never reused.
#[derive(
    Clone, Copy, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Fixed-width form used in row keys so lexicographic order matches
    /// numeric order.
    pub fn padded(&self) -> String {
        format!("{:020}", self.0)
    }
}

impl Debug for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JobId").field(&self.0).finish()
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(val: i64) -> Self {
        Self(val)
    }
}

impl From<JobId> for i64 {
    fn from(val: JobId) -> Self {
        val.0
    }
}
