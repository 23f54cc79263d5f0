use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A byte namespace separating unrelated pipelines that share one table and
/// message queue.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct QueueType(u8);

impl QueueType {
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

impl Display for QueueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

impl From<u8> for QueueType {
    fn from(val: u8) -> Self {
        Self(val)
    }
}

impl FromStr for QueueType {
    type Err = QueueTypeError;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        val.parse::<u8>().map(Self).map_err(QueueTypeError::NotAByte)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueTypeError {
    #[error("queue types are a single byte: {0}")]
    NotAByte(std::num::ParseIntError),
}
