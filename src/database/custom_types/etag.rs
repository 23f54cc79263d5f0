use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Optimistic concurrency token carried by every table entity. A fresh value
/// is generated on each write; updates conditioned on a stale etag are
/// rejected by the store.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Etag(Uuid);

impl Etag {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for Etag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for Etag {
    type Error = EtagError;

    fn try_from(val: &str) -> Result<Self, Self::Error> {
        Uuid::parse_str(val).map(Self).map_err(EtagError::InvalidFormat)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EtagError {
    #[error("etags are uuid formatted: {0}")]
    InvalidFormat(uuid::Error),
}
