use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::database::custom_types::{Etag, JobId};
use crate::database::Database;
use crate::tables::{TableError, TableStore};

const METADATA_TABLE_NAME: &str = "metadata";

const TRIGGER_PARTITION: &str = "trigger";
const LEASE_ROW_KEY: &str = "lease";
const CURRENT_TRIGGER_ROW_KEY: &str = "current";

const COMPARTMENT_PARTITION: &str = "compartment";

const CHANGE_FEED_PARTITION: &str = "changefeed";
const CHANGE_FEED_CURSOR_ROW_KEY: &str = "cursor";

/// Store for pipeline metadata that isn't job state: the scheduler's
/// leadership lease and sliding-window cursor, per-patient versions used by
/// group-scope incremental extraction, and the change-feed cursor. Everything
/// lives in the same key-value table the queue uses, under partitions the
/// queue never touches.
#[derive(Clone)]
pub struct MetadataStore {
    table: TableStore,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct TriggerLeaseRecord {
    holder: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    expires_at: OffsetDateTime,
}

/// The scheduler's sliding-window clock. `window_end` of a finished trigger
/// is the cursor the next window starts from.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentTrigger {
    pub sequence_id: i64,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub window_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub window_end: OffsetDateTime,

    pub status: TriggerStatus,
    pub orchestrator_job_id: Option<JobId>,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompartmentRecord {
    version_id: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChangeFeedCursorRecord {
    next_offset: i64,
}

impl MetadataStore {
    pub fn new(database: Database) -> Self {
        Self {
            table: TableStore::new(database, METADATA_TABLE_NAME),
        }
    }

    /// Attempts to take or extend the scheduler leadership lease. Returns
    /// whether the caller is now the leader. An expired lease can be taken
    /// over by any instance; a live one only extended by its holder.
    pub async fn try_acquire_trigger_lease(
        &self,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, MetadataError> {
        let fresh = TriggerLeaseRecord {
            holder,
            expires_at: OffsetDateTime::now_utc() + ttl,
        };

        match self.table.get(TRIGGER_PARTITION, LEASE_ROW_KEY).await? {
            None => match self.table.insert(TRIGGER_PARTITION, LEASE_ROW_KEY, &fresh).await {
                Ok(_) => {
                    tracing::info!(%holder, "acquired scheduler lease");
                    Ok(true)
                }
                Err(TableError::EntityAlreadyExists(_, _)) => Ok(false),
                Err(err) => Err(err.into()),
            },
            Some(entity) => {
                let stored: TriggerLeaseRecord = entity.decode()?;

                let expired = stored.expires_at <= OffsetDateTime::now_utc();
                if stored.holder != holder && !expired {
                    return Ok(false);
                }

                match self
                    .table
                    .update(TRIGGER_PARTITION, LEASE_ROW_KEY, entity.etag, &fresh)
                    .await
                {
                    Ok(_) => {
                        if stored.holder != holder {
                            tracing::info!(%holder, previous = %stored.holder, "took over expired scheduler lease");
                        }
                        Ok(true)
                    }
                    Err(TableError::PreconditionFailed(_, _)) => Ok(false),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    pub async fn current_trigger(
        &self,
    ) -> Result<Option<(CurrentTrigger, Etag)>, MetadataError> {
        let entity = match self.table.get(TRIGGER_PARTITION, CURRENT_TRIGGER_ROW_KEY).await? {
            Some(entity) => entity,
            None => return Ok(None),
        };

        let trigger = entity.decode()?;
        Ok(Some((trigger, entity.etag)))
    }

    pub async fn insert_trigger(&self, trigger: &CurrentTrigger) -> Result<(), MetadataError> {
        match self
            .table
            .insert(TRIGGER_PARTITION, CURRENT_TRIGGER_ROW_KEY, trigger)
            .await
        {
            Ok(_) => Ok(()),
            // a competing leader planned the same trigger first; theirs wins
            Err(TableError::EntityAlreadyExists(_, _)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn update_trigger(
        &self,
        trigger: &CurrentTrigger,
        etag: Etag,
    ) -> Result<(), MetadataError> {
        self.table
            .update(TRIGGER_PARTITION, CURRENT_TRIGGER_ROW_KEY, etag, trigger)
            .await?;

        Ok(())
    }

    /// Stored versions for the requested patients. Patients never seen before
    /// are simply absent from the result.
    pub async fn patient_versions(
        &self,
        patient_ids: &[String],
    ) -> Result<BTreeMap<String, i64>, MetadataError> {
        let mut versions = BTreeMap::new();

        for patient_id in patient_ids.iter() {
            if let Some(entity) = self.table.get(COMPARTMENT_PARTITION, patient_id).await? {
                let record: CompartmentRecord = entity.decode()?;
                versions.insert(patient_id.clone(), record.version_id);
            }
        }

        Ok(versions)
    }

    pub async fn upsert_patient_versions(
        &self,
        versions: &BTreeMap<String, i64>,
    ) -> Result<(), MetadataError> {
        for (patient_id, version_id) in versions.iter() {
            let record = CompartmentRecord {
                version_id: *version_id,
            };

            self.table
                .upsert(COMPARTMENT_PARTITION, patient_id, &record)
                .await?;
        }

        Ok(())
    }

    /// Next change-feed offset to extract, advanced after each completed
    /// DICOM orchestration.
    pub async fn change_feed_cursor(&self) -> Result<i64, MetadataError> {
        match self
            .table
            .get(CHANGE_FEED_PARTITION, CHANGE_FEED_CURSOR_ROW_KEY)
            .await?
        {
            Some(entity) => {
                let record: ChangeFeedCursorRecord = entity.decode()?;
                Ok(record.next_offset)
            }
            None => Ok(0),
        }
    }

    pub async fn advance_change_feed_cursor(&self, next_offset: i64) -> Result<(), MetadataError> {
        self.table
            .upsert(
                CHANGE_FEED_PARTITION,
                CHANGE_FEED_CURSOR_ROW_KEY,
                &ChangeFeedCursorRecord { next_offset },
            )
            .await?;

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata table operation failed: {0}")]
    Table(#[from] TableError),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tests::helpers::test_database;

    #[tokio::test]
    async fn test_lease_is_exclusive_until_expiry() {
        let store = MetadataStore::new(test_database().await);

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(store
            .try_acquire_trigger_lease(first, Duration::from_secs(60))
            .await
            .expect("acquire"));

        // holder can extend, a competitor can't take over
        assert!(store
            .try_acquire_trigger_lease(first, Duration::from_secs(60))
            .await
            .expect("renew"));
        assert!(!store
            .try_acquire_trigger_lease(second, Duration::from_secs(60))
            .await
            .expect("compete"));
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = MetadataStore::new(test_database().await);

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(store
            .try_acquire_trigger_lease(first, Duration::from_millis(1))
            .await
            .expect("acquire"));

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(store
            .try_acquire_trigger_lease(second, Duration::from_secs(60))
            .await
            .expect("takeover"));
        assert!(!store
            .try_acquire_trigger_lease(first, Duration::from_secs(60))
            .await
            .expect("old holder lost"));
    }

    #[tokio::test]
    async fn test_patient_versions_roundtrip() {
        let store = MetadataStore::new(test_database().await);

        let mut versions = BTreeMap::new();
        versions.insert("patient-a".to_string(), 3i64);
        versions.insert("patient-b".to_string(), 1i64);

        store.upsert_patient_versions(&versions).await.expect("upsert");

        let lookup = vec![
            "patient-a".to_string(),
            "patient-b".to_string(),
            "patient-c".to_string(),
        ];
        let found = store.patient_versions(&lookup).await.expect("lookup");

        assert_eq!(found, versions);
    }
}
