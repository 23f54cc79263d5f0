use std::fmt::{self, Debug, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Groups related jobs for bulk cancellation, typically all children of one
/// orchestrator run.
#[derive(
    Clone, Copy, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct GroupId(i64);

impl GroupId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }

    pub fn padded(&self) -> String {
        format!("{:020}", self.0)
    }
}

impl Debug for GroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GroupId").field(&self.0).finish()
    }
}

impl Display for GroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for GroupId {
    fn from(val: i64) -> Self {
        Self(val)
    }
}
