use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a queue message, assigned at send time and unchanged
/// across redeliveries.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for MessageId {
    type Error = MessageIdError;

    fn try_from(val: &str) -> Result<Self, Self::Error> {
        Uuid::parse_str(val)
            .map(Self)
            .map_err(MessageIdError::InvalidFormat)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageIdError {
    #[error("message ids are uuid formatted: {0}")]
    InvalidFormat(uuid::Error),
}
