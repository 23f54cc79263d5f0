use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Proof of the most recent receive of a queue message. Rotated on every
/// receive and renewal; queue mutations presenting a stale receipt are
/// rejected, which is how a superseded worker discovers it lost its lease.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PopReceipt(Uuid);

impl PopReceipt {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for PopReceipt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
