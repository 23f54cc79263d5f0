use serde::Serialize;
use sqlx::Row;
use time::OffsetDateTime;

use crate::database::custom_types::Etag;
use crate::database::Database;
use crate::tables::{encode_properties, BatchOperation, TableEntity, TableError};

/// Generic key-value entity table. Rows are addressed by (partition, row),
/// carry an opaque JSON property document, and are guarded by etag optimistic
/// concurrency. Multi-row consistency comes exclusively from
/// [`TableStore::submit_batch`]; there are no in-process locks.
#[derive(Clone)]
pub struct TableStore {
    database: Database,
    table_name: String,
}

impl TableStore {
    pub fn new(database: Database, table_name: impl ToString) -> Self {
        Self {
            database,
            table_name: table_name.to_string(),
        }
    }

    pub async fn get(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<Option<TableEntity>, TableError> {
        let row = sqlx::query(
            "SELECT partition_key, row_key, etag, updated_at, properties
                 FROM table_entities
                 WHERE table_name = $1 AND partition_key = $2 AND row_key = $3;",
        )
        .bind(&self.table_name)
        .bind(partition_key)
        .bind(row_key)
        .fetch_optional(&**self.database())
        .await
        .map_err(TableError::QueryFailed)?;

        row.map(decode_row).transpose()
    }

    /// Fetches the entity at (partition, row), treating absence as an error.
    pub async fn require(
        &self,
        partition_key: &str,
        row_key: &str,
    ) -> Result<TableEntity, TableError> {
        self.get(partition_key, row_key).await?.ok_or_else(|| {
            TableError::EntityNotFound(partition_key.to_string(), row_key.to_string())
        })
    }

    pub async fn insert(
        &self,
        partition_key: &str,
        row_key: &str,
        record: &impl Serialize,
    ) -> Result<TableEntity, TableError> {
        let properties = encode_properties(record)?;
        let etag = Etag::generate();
        let updated_at = OffsetDateTime::now_utc();

        let encoded = serde_json::to_string(&properties).map_err(TableError::MalformedProperties)?;

        let outcome = sqlx::query(
            "INSERT INTO table_entities (table_name, partition_key, row_key, etag, properties, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6);",
        )
        .bind(&self.table_name)
        .bind(partition_key)
        .bind(row_key)
        .bind(etag.to_string())
        .bind(&encoded)
        .bind(updated_at)
        .execute(&**self.database())
        .await;

        match outcome {
            Ok(_) => Ok(TableEntity::new(
                partition_key.to_string(),
                row_key.to_string(),
                etag,
                updated_at,
                properties,
            )),
            Err(err) if is_unique_violation(&err) => Err(TableError::EntityAlreadyExists(
                partition_key.to_string(),
                row_key.to_string(),
            )),
            Err(err) => Err(TableError::QueryFailed(err)),
        }
    }

    /// Conditional replacement of an entity's properties. Fails with
    /// `PreconditionFailed` when another writer got there first.
    pub async fn update(
        &self,
        partition_key: &str,
        row_key: &str,
        expected_etag: Etag,
        record: &impl Serialize,
    ) -> Result<Etag, TableError> {
        let properties = encode_properties(record)?;
        let encoded = serde_json::to_string(&properties).map_err(TableError::MalformedProperties)?;
        let new_etag = Etag::generate();

        let outcome = sqlx::query(
            "UPDATE table_entities SET etag = $1, properties = $2, updated_at = $3
                 WHERE table_name = $4 AND partition_key = $5 AND row_key = $6 AND etag = $7;",
        )
        .bind(new_etag.to_string())
        .bind(&encoded)
        .bind(OffsetDateTime::now_utc())
        .bind(&self.table_name)
        .bind(partition_key)
        .bind(row_key)
        .bind(expected_etag.to_string())
        .execute(&**self.database())
        .await
        .map_err(TableError::QueryFailed)?;

        if outcome.rows_affected() == 0 {
            return Err(self.missed_write(partition_key, row_key).await);
        }

        Ok(new_etag)
    }

    /// Unconditional write, creating the entity when absent.
    pub async fn upsert(
        &self,
        partition_key: &str,
        row_key: &str,
        record: &impl Serialize,
    ) -> Result<Etag, TableError> {
        let properties = encode_properties(record)?;
        let encoded = serde_json::to_string(&properties).map_err(TableError::MalformedProperties)?;
        let new_etag = Etag::generate();

        sqlx::query(
            "INSERT INTO table_entities (table_name, partition_key, row_key, etag, properties, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (table_name, partition_key, row_key)
                 DO UPDATE SET etag = excluded.etag, properties = excluded.properties,
                               updated_at = excluded.updated_at;",
        )
        .bind(&self.table_name)
        .bind(partition_key)
        .bind(row_key)
        .bind(new_etag.to_string())
        .bind(&encoded)
        .bind(OffsetDateTime::now_utc())
        .execute(&**self.database())
        .await
        .map_err(TableError::QueryFailed)?;

        Ok(new_etag)
    }

    /// Applies every operation in a single database transaction. The first
    /// failure aborts the whole batch and nothing is written.
    pub async fn submit_batch(&self, operations: Vec<BatchOperation>) -> Result<(), TableError> {
        let mut transaction = self
            .database
            .begin()
            .await
            .map_err(TableError::Transaction)?;

        for operation in operations.into_iter() {
            match operation {
                BatchOperation::Insert {
                    partition_key,
                    row_key,
                    properties,
                } => {
                    let encoded = serde_json::to_string(&properties)
                        .map_err(TableError::MalformedProperties)?;

                    let outcome = sqlx::query(
                        "INSERT INTO table_entities (table_name, partition_key, row_key, etag, properties, updated_at)
                             VALUES ($1, $2, $3, $4, $5, $6);",
                    )
                    .bind(&self.table_name)
                    .bind(&partition_key)
                    .bind(&row_key)
                    .bind(Etag::generate().to_string())
                    .bind(&encoded)
                    .bind(OffsetDateTime::now_utc())
                    .execute(&mut *transaction)
                    .await;

                    match outcome {
                        Ok(_) => (),
                        Err(err) if is_unique_violation(&err) => {
                            return Err(TableError::EntityAlreadyExists(partition_key, row_key));
                        }
                        Err(err) => return Err(TableError::QueryFailed(err)),
                    }
                }
                BatchOperation::Update {
                    partition_key,
                    row_key,
                    etag,
                    properties,
                } => {
                    let encoded = serde_json::to_string(&properties)
                        .map_err(TableError::MalformedProperties)?;

                    let outcome = sqlx::query(
                        "UPDATE table_entities SET etag = $1, properties = $2, updated_at = $3
                             WHERE table_name = $4 AND partition_key = $5 AND row_key = $6 AND etag = $7;",
                    )
                    .bind(Etag::generate().to_string())
                    .bind(&encoded)
                    .bind(OffsetDateTime::now_utc())
                    .bind(&self.table_name)
                    .bind(&partition_key)
                    .bind(&row_key)
                    .bind(etag.to_string())
                    .execute(&mut *transaction)
                    .await
                    .map_err(TableError::QueryFailed)?;

                    if outcome.rows_affected() == 0 {
                        return Err(TableError::PreconditionFailed(partition_key, row_key));
                    }
                }
            }
        }

        transaction.commit().await.map_err(TableError::Transaction)
    }

    /// All entities in a partition, optionally narrowed to a row key prefix,
    /// in row key order.
    pub async fn list_partition(
        &self,
        partition_key: &str,
        row_key_prefix: Option<&str>,
    ) -> Result<Vec<TableEntity>, TableError> {
        let prefix = row_key_prefix.unwrap_or("");
        let upper_bound = format!("{prefix}\u{10ffff}");

        let rows = sqlx::query(
            "SELECT partition_key, row_key, etag, updated_at, properties
                 FROM table_entities
                 WHERE table_name = $1 AND partition_key = $2
                   AND row_key >= $3 AND row_key < $4
                 ORDER BY row_key ASC;",
        )
        .bind(&self.table_name)
        .bind(partition_key)
        .bind(prefix)
        .bind(&upper_bound)
        .fetch_all(&**self.database())
        .await
        .map_err(TableError::QueryFailed)?;

        rows.into_iter().map(decode_row).collect()
    }

    fn database(&self) -> &Database {
        &self.database
    }

    /// An etag-conditioned update that touched no rows either raced another
    /// writer or referenced a missing entity; look again to tell the two
    /// apart.
    async fn missed_write(&self, partition_key: &str, row_key: &str) -> TableError {
        match self.get(partition_key, row_key).await {
            Ok(Some(_)) => TableError::PreconditionFailed(
                partition_key.to_string(),
                row_key.to_string(),
            ),
            Ok(None) => {
                TableError::EntityNotFound(partition_key.to_string(), row_key.to_string())
            }
            Err(err) => err,
        }
    }
}

fn decode_row(row: sqlx::sqlite::SqliteRow) -> Result<TableEntity, TableError> {
    let partition_key: String = row.try_get("partition_key").map_err(TableError::QueryFailed)?;
    let row_key: String = row.try_get("row_key").map_err(TableError::QueryFailed)?;

    let raw_etag: String = row.try_get("etag").map_err(TableError::QueryFailed)?;
    let etag = Etag::try_from(raw_etag.as_str())
        .map_err(|_| TableError::PreconditionFailed(partition_key.clone(), row_key.clone()))?;

    let updated_at: OffsetDateTime = row.try_get("updated_at").map_err(TableError::QueryFailed)?;

    let raw_properties: String = row.try_get("properties").map_err(TableError::QueryFailed)?;
    let properties =
        serde_json::from_str(&raw_properties).map_err(TableError::MalformedProperties)?;

    Ok(TableEntity::new(
        partition_key,
        row_key,
        etag,
        updated_at,
        properties,
    ))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db_err| db_err.is_unique_violation())
        .unwrap_or(false)
}
