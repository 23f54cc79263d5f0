mod queue;
mod store;

pub use queue::{MessageQueue, MessageQueueError, QueueMessage};
pub use store::TableStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use time::OffsetDateTime;

use crate::database::custom_types::Etag;

/// Hard cap on the serialized size of a single entity.
pub const ENTITY_SIZE_LIMIT: usize = 1024 * 1024;

/// Hard cap on the serialized size of any single top-level property.
pub const PROPERTY_SIZE_LIMIT: usize = 64 * 1024;

/// One row of the generic key-value table. The row shape (which typed record
/// the properties decode into) is always known from the lookup path, never
/// inferred from the contents.
#[derive(Clone, Debug)]
pub struct TableEntity {
    pub partition_key: String,
    pub row_key: String,
    pub etag: Etag,
    pub updated_at: OffsetDateTime,

    properties: serde_json::Value,
}

impl TableEntity {
    pub(crate) fn new(
        partition_key: String,
        row_key: String,
        etag: Etag,
        updated_at: OffsetDateTime,
        properties: serde_json::Value,
    ) -> Self {
        Self {
            partition_key,
            row_key,
            etag,
            updated_at,
            properties,
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, TableError> {
        serde_json::from_value(self.properties.clone()).map_err(TableError::MalformedProperties)
    }

    pub fn properties(&self) -> &serde_json::Value {
        &self.properties
    }
}

/// A mutation participating in a transactional batch. All operations in one
/// batch commit or none do.
#[derive(Clone, Debug)]
pub enum BatchOperation {
    Insert {
        partition_key: String,
        row_key: String,
        properties: serde_json::Value,
    },
    Update {
        partition_key: String,
        row_key: String,
        etag: Etag,
        properties: serde_json::Value,
    },
}

impl BatchOperation {
    pub fn insert(
        partition_key: impl ToString,
        row_key: impl ToString,
        record: &impl Serialize,
    ) -> Result<Self, TableError> {
        Ok(Self::Insert {
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
            properties: encode_properties(record)?,
        })
    }

    pub fn update(
        partition_key: impl ToString,
        row_key: impl ToString,
        etag: Etag,
        record: &impl Serialize,
    ) -> Result<Self, TableError> {
        Ok(Self::Update {
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
            etag,
            properties: encode_properties(record)?,
        })
    }
}

/// Serializes a record into an entity property document, enforcing the entity
/// and per-property size limits.
pub(crate) fn encode_properties(record: &impl Serialize) -> Result<serde_json::Value, TableError> {
    let properties = serde_json::to_value(record).map_err(TableError::MalformedProperties)?;

    let total = serde_json::to_string(&properties)
        .map_err(TableError::MalformedProperties)?
        .len();
    if total > ENTITY_SIZE_LIMIT {
        return Err(TableError::EntityTooLarge(total));
    }

    if let Some(fields) = properties.as_object() {
        for (name, value) in fields.iter() {
            let size = serde_json::to_string(value)
                .map_err(TableError::MalformedProperties)?
                .len();

            if size > PROPERTY_SIZE_LIMIT {
                return Err(TableError::PropertyTooLarge(name.clone(), size));
            }
        }
    }

    Ok(properties)
}

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("an entity already exists at ({0}, {1})")]
    EntityAlreadyExists(String, String),

    #[error("serialized entity is {0} bytes, over the storage limit")]
    EntityTooLarge(usize),

    #[error("no entity found at ({0}, {1})")]
    EntityNotFound(String, String),

    #[error("entity properties couldn't be encoded or decoded: {0}")]
    MalformedProperties(serde_json::Error),

    #[error("etag precondition failed for entity at ({0}, {1})")]
    PreconditionFailed(String, String),

    #[error("serialized property '{0}' is {1} bytes, over the storage limit")]
    PropertyTooLarge(String, usize),

    #[error("table backend query failed: {0}")]
    QueryFailed(sqlx::Error),

    #[error("an error occurred with a transaction operation: {0}")]
    Transaction(sqlx::Error),
}

impl TableError {
    /// Backend and transaction failures are worth retrying; everything else
    /// reflects a logical conflict or caller mistake.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TableError::QueryFailed(_) | TableError::Transaction(_))
    }
}
