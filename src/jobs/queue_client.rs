use std::collections::HashSet;
use std::time::Duration;

use time::OffsetDateTime;

use crate::database::custom_types::{GroupId, JobId, JobStatus, JobVersion, QueueType};
use crate::database::Database;
use crate::jobs::entities::{
    counter_partition_key, job_info_row_key, job_lock_row_key, job_partition_key,
    message_queue_name, reverse_index_partition_key, JobIdCounterRecord, JobLockRecord,
    JobMessage, ReverseIndexRecord, COUNTER_ROW_KEY,
};
use crate::jobs::JobInfo;
use crate::tables::{
    BatchOperation, MessageQueue, MessageQueueError, TableEntity, TableError, TableStore,
};

const JOB_TABLE_NAME: &str = "jobs";

/// Upper bound on definitions accepted by a single enqueue call.
pub const MAX_ENQUEUE_BATCH: usize = 50;

/// Optimistic concurrency retries against the id counter before giving up.
const COUNTER_ALLOCATION_ATTEMPTS: usize = 8;

/// Retries when a cancellation races another writer on the same row.
const CANCEL_UPDATE_ATTEMPTS: usize = 5;

/// The durable job queue. All authoritative state lives in the entity table;
/// the message queue only schedules delivery. Every operation is safe to call
/// concurrently from multiple agents and to repeat after a crash at any point.
#[derive(Clone)]
pub struct JobQueueClient {
    database: Database,
    table: TableStore,
}

impl JobQueueClient {
    pub fn new(database: Database) -> Self {
        let table = TableStore::new(database.clone(), JOB_TABLE_NAME);

        Self { database, table }
    }

    /// Creates one job per definition, returning the canonical records.
    /// Re-enqueueing a definition already present under the same (queue type,
    /// group) is a no-op that returns the existing job, which is what lets a
    /// crashed orchestrator replay its enqueue sequence safely.
    pub async fn enqueue(
        &self,
        queue_type: QueueType,
        definitions: &[String],
        group_id: GroupId,
    ) -> Result<Vec<JobInfo>, JobQueueError> {
        if definitions.is_empty() {
            return Ok(Vec::new());
        }

        if definitions.len() > MAX_ENQUEUE_BATCH {
            return Err(JobQueueError::TooManyDefinitions(
                definitions.len(),
                MAX_ENQUEUE_BATCH,
            ));
        }

        let mut seen_hashes = HashSet::new();
        for definition in definitions.iter() {
            if !seen_hashes.insert(job_lock_row_key(definition)) {
                return Err(JobQueueError::DuplicateDefinition);
            }
        }

        let partition_key = job_partition_key(queue_type, group_id);
        let ids = self.allocate_job_ids(queue_type, definitions.len()).await?;

        // step 2: job info + lock rows in one all-or-nothing batch. A
        // collision means some of these definitions were enqueued before; the
        // per-definition fallback below resumes whatever subset is missing.
        let candidates: Vec<JobInfo> = ids
            .into_iter()
            .zip(definitions.iter())
            .map(|(id, definition)| {
                JobInfo::fresh(id, queue_type, group_id, definition.clone())
            })
            .collect();

        let mut batch = Vec::with_capacity(candidates.len() * 2);
        for job in candidates.iter() {
            batch.push(self.job_insert_op(&partition_key, job)?);
            batch.push(self.lock_insert_op(&partition_key, job)?);
        }

        match self.table.submit_batch(batch).await {
            Ok(()) => (),
            Err(TableError::EntityAlreadyExists(_, _)) => {
                for job in candidates.iter() {
                    let single = vec![
                        self.job_insert_op(&partition_key, job)?,
                        self.lock_insert_op(&partition_key, job)?,
                    ];

                    match self.table.submit_batch(single).await {
                        Ok(()) => (),
                        Err(TableError::EntityAlreadyExists(_, _)) => (),
                        Err(err) => return Err(err.into()),
                    }
                }
            }
            Err(err) => return Err(err.into()),
        }

        // whatever rows are now in the table are the truth, whether this call
        // or an earlier one created them
        let mut jobs = Vec::with_capacity(definitions.len());
        let mut locks = Vec::with_capacity(definitions.len());
        for definition in definitions.iter() {
            let lock_entity = self
                .table
                .require(&partition_key, &job_lock_row_key(definition))
                .await?;
            let lock: JobLockRecord = lock_entity.decode()?;

            let info_entity = self
                .table
                .require(&partition_key, &lock.job_info_row_key)
                .await?;
            jobs.push(info_entity.decode::<JobInfo>()?);
            locks.push((lock_entity, lock));
        }

        // step 3: reverse indices, also resumable
        let mut index_batch = Vec::with_capacity(jobs.len());
        for job in jobs.iter() {
            index_batch.push(self.reverse_index_op(&partition_key, job)?);
        }

        match self.table.submit_batch(index_batch).await {
            Ok(()) => (),
            Err(TableError::EntityAlreadyExists(_, _)) => {
                for job in jobs.iter() {
                    let single = vec![self.reverse_index_op(&partition_key, job)?];

                    match self.table.submit_batch(single).await {
                        Ok(()) | Err(TableError::EntityAlreadyExists(_, _)) => (),
                        Err(err) => return Err(err.into()),
                    }
                }
            }
            Err(err) => return Err(err.into()),
        }

        // step 4: dispatch a message for every lock that doesn't have one yet
        let queue = self.message_queue(queue_type);
        for (job, (lock_entity, lock)) in jobs.iter().zip(locks.into_iter()) {
            if lock.message_id.is_some() {
                continue;
            }

            let body = serde_json::to_string(&JobMessage {
                partition_key: partition_key.clone(),
                row_key: lock.job_info_row_key.clone(),
                lock_row_key: lock_entity.row_key.clone(),
            })
            .map_err(JobQueueError::MalformedPayload)?;

            let (message_id, pop_receipt) = queue.send(&body).await?;

            let claimed = JobLockRecord {
                job_info_row_key: lock.job_info_row_key,
                message_id: Some(message_id),
                pop_receipt: Some(pop_receipt),
            };

            match self
                .table
                .update(&partition_key, &lock_entity.row_key, lock_entity.etag, &claimed)
                .await
            {
                Ok(_) => (),
                // another agent dispatched first; ours becomes a stale
                // message that dequeue will discard on sight
                Err(TableError::PreconditionFailed(_, _)) => (),
                Err(err) => return Err(err.into()),
            }

            tracing::debug!(id = %job.id, group = %group_id, "job message dispatched");
        }

        Ok(jobs)
    }

    /// Takes a lease on the next runnable job of this queue type. `None`
    /// means the queue had nothing deliverable right now; errors describe
    /// messages that were discarded or skipped and are safe to retry around.
    pub async fn dequeue(
        &self,
        queue_type: QueueType,
        worker: &str,
        heartbeat_timeout: Duration,
    ) -> Result<Option<JobInfo>, JobQueueError> {
        let queue = self.message_queue(queue_type);

        let message = match queue.receive(heartbeat_timeout).await? {
            Some(message) => message,
            None => return Ok(None),
        };

        let pointer: JobMessage = match serde_json::from_str(&message.body) {
            Ok(pointer) => pointer,
            Err(_) => {
                let _ = queue.delete(message.message_id, message.pop_receipt).await;
                return Err(JobQueueError::GarbageMessage(
                    "message body was not a job pointer".to_string(),
                ));
            }
        };

        let info_entity = self.table.get(&pointer.partition_key, &pointer.row_key).await?;
        let lock_entity = self
            .table
            .get(&pointer.partition_key, &pointer.lock_row_key)
            .await?;

        let (info_entity, lock_entity) = match (info_entity, lock_entity) {
            (Some(info), Some(lock)) => (info, lock),
            _ => {
                let _ = queue.delete(message.message_id, message.pop_receipt).await;
                return Err(JobQueueError::GarbageMessage(
                    "message referenced entities that don't exist".to_string(),
                ));
            }
        };

        let mut job: JobInfo = info_entity.decode()?;
        let lock: JobLockRecord = lock_entity.decode()?;

        if job.status.is_terminal() {
            let _ = queue.delete(message.message_id, message.pop_receipt).await;
            return Err(JobQueueError::AlreadyFinished(job.id));
        }

        // enqueue hasn't persisted its message yet; leave the message alone
        // and let a later dequeue pick the job up
        let lock_message_id = match lock.message_id {
            Some(lock_message_id) => lock_message_id,
            None => return Ok(None),
        };

        if lock_message_id != message.message_id {
            let _ = queue.delete(message.message_id, message.pop_receipt).await;
            return Err(JobQueueError::StaleMessage(job.id));
        }

        if job.status == JobStatus::Running {
            let lease_deadline =
                job.heartbeat_date_time + Duration::from_secs(job.heartbeat_timeout_secs);

            if OffsetDateTime::now_utc() < lease_deadline {
                return Err(JobQueueError::LeaseStillHeld(job.id));
            }
        }

        job.status = JobStatus::Running;
        job.version = JobVersion::now();
        job.heartbeat_date_time = OffsetDateTime::now_utc();
        job.heartbeat_timeout_secs = heartbeat_timeout.as_secs();

        let claimed_lock = JobLockRecord {
            job_info_row_key: lock.job_info_row_key,
            message_id: Some(lock_message_id),
            pop_receipt: Some(message.pop_receipt),
        };

        self.table
            .submit_batch(vec![
                BatchOperation::update(
                    &pointer.partition_key,
                    &pointer.row_key,
                    info_entity.etag,
                    &job,
                )?,
                BatchOperation::update(
                    &pointer.partition_key,
                    &pointer.lock_row_key,
                    lock_entity.etag,
                    &claimed_lock,
                )?,
            ])
            .await?;

        tracing::info!(id = %job.id, group = %job.group_id, worker, "job leased");

        Ok(Some(job))
    }

    /// Renews the caller's lease, persisting its progress snapshot along the
    /// way. Returns whether cancellation has been requested. A version or
    /// receipt mismatch means the lease is gone and surfaces as
    /// [`JobQueueError::JobNotExist`].
    pub async fn keep_alive(&self, job: &JobInfo) -> Result<bool, JobQueueError> {
        let partition_key = job_partition_key(job.queue_type, job.group_id);
        let info_row_key = job_info_row_key(job.group_id, job.id);

        let info_entity = self
            .table
            .get(&partition_key, &info_row_key)
            .await?
            .ok_or(JobQueueError::JobNotExist)?;
        let stored: JobInfo = info_entity.decode()?;

        if stored.version != job.version {
            return Err(JobQueueError::JobNotExist);
        }

        let lock_row_key = job_lock_row_key(&job.definition);
        let lock_entity = self
            .table
            .get(&partition_key, &lock_row_key)
            .await?
            .ok_or(JobQueueError::JobNotExist)?;
        let lock: JobLockRecord = lock_entity.decode()?;

        let (message_id, pop_receipt) = match (lock.message_id, lock.pop_receipt) {
            (Some(message_id), Some(pop_receipt)) => (message_id, pop_receipt),
            _ => return Err(JobQueueError::JobNotExist),
        };

        let queue = self.message_queue(job.queue_type);
        let visibility = Duration::from_secs(stored.heartbeat_timeout_secs);

        let fresh_receipt = match queue.renew(message_id, pop_receipt, visibility).await {
            Ok(fresh_receipt) => fresh_receipt,
            Err(err) if err.is_lease_lost() => return Err(JobQueueError::JobNotExist),
            Err(err) => return Err(err.into()),
        };

        let mut refreshed = stored.clone();
        refreshed.heartbeat_date_time = OffsetDateTime::now_utc();
        refreshed.result = job.result.clone();

        let renewed_lock = JobLockRecord {
            job_info_row_key: lock.job_info_row_key,
            message_id: Some(message_id),
            pop_receipt: Some(fresh_receipt),
        };

        self.table
            .submit_batch(vec![
                BatchOperation::update(&partition_key, &info_row_key, info_entity.etag, &refreshed)?,
                BatchOperation::update(&partition_key, &lock_row_key, lock_entity.etag, &renewed_lock)?,
            ])
            .await?;

        Ok(stored.cancel_requested)
    }

    /// Finishes the caller's job. The terminal status resolves to Failed when
    /// the caller marked the job failed, Cancelled when cancellation was
    /// requested, and Completed otherwise.
    pub async fn complete(
        &self,
        job: &JobInfo,
        request_cancellation_on_failure: bool,
    ) -> Result<(), JobQueueError> {
        let partition_key = job_partition_key(job.queue_type, job.group_id);
        let info_row_key = job_info_row_key(job.group_id, job.id);

        let info_entity = self
            .table
            .get(&partition_key, &info_row_key)
            .await?
            .ok_or(JobQueueError::JobNotExist)?;
        let stored: JobInfo = info_entity.decode()?;

        if stored.version != job.version {
            return Err(JobQueueError::JobNotExist);
        }

        let final_status = if job.status == JobStatus::Failed {
            JobStatus::Failed
        } else if stored.cancel_requested {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        };

        let mut finished = stored.clone();
        finished.status = final_status;
        finished.result = job.result.clone();

        self.table
            .update(&partition_key, &info_row_key, info_entity.etag, &finished)
            .await?;

        // the message is now garbage; a delete that finds it already gone is
        // success, since any future dequeue discards terminal jobs anyway
        let lock_row_key = job_lock_row_key(&job.definition);
        if let Some(lock_entity) = self.table.get(&partition_key, &lock_row_key).await? {
            let lock: JobLockRecord = lock_entity.decode()?;

            if let (Some(message_id), Some(pop_receipt)) = (lock.message_id, lock.pop_receipt) {
                let queue = self.message_queue(job.queue_type);

                match queue.delete(message_id, pop_receipt).await {
                    Ok(()) => (),
                    Err(err) if err.is_lease_lost() => (),
                    Err(err) => return Err(err.into()),
                }
            }
        }

        tracing::info!(id = %job.id, group = %job.group_id, status = %final_status, "job finished");

        if request_cancellation_on_failure && final_status == JobStatus::Failed {
            self.cancel_by_group_id(job.queue_type, job.group_id).await?;
        }

        Ok(())
    }

    /// Flags every job in the group for cancellation. Jobs still in Created
    /// move straight to Cancelled; running workers observe the flag on their
    /// next heartbeat and finish with Cancelled status themselves.
    pub async fn cancel_by_group_id(
        &self,
        queue_type: QueueType,
        group_id: GroupId,
    ) -> Result<(), JobQueueError> {
        let partition_key = job_partition_key(queue_type, group_id);
        let job_row_prefix = format!("{}:", group_id.padded());

        let entities = self
            .table
            .list_partition(&partition_key, Some(&job_row_prefix))
            .await?;

        for entity in entities.into_iter() {
            self.request_cancellation(entity).await?;
        }

        Ok(())
    }

    pub async fn cancel_by_id(
        &self,
        queue_type: QueueType,
        id: JobId,
    ) -> Result<(), JobQueueError> {
        let entity = self
            .job_entity_by_id(queue_type, id)
            .await?
            .ok_or(JobQueueError::JobNotExist)?;

        self.request_cancellation(entity).await
    }

    /// Point lookup through the reverse index, used by orchestrators polling
    /// their children.
    pub async fn job_by_id(
        &self,
        queue_type: QueueType,
        id: JobId,
    ) -> Result<Option<JobInfo>, JobQueueError> {
        let entity = self.job_entity_by_id(queue_type, id).await?;

        entity.map(|entity| entity.decode().map_err(Into::into)).transpose()
    }

    async fn job_entity_by_id(
        &self,
        queue_type: QueueType,
        id: JobId,
    ) -> Result<Option<TableEntity>, JobQueueError> {
        let index_entity = self
            .table
            .get(&reverse_index_partition_key(queue_type), &id.padded())
            .await?;

        let index: ReverseIndexRecord = match index_entity {
            Some(entity) => entity.decode()?,
            None => return Ok(None),
        };

        self.table
            .get(&index.job_info_partition_key, &index.job_info_row_key)
            .await
            .map_err(Into::into)
    }

    async fn request_cancellation(&self, mut entity: TableEntity) -> Result<(), JobQueueError> {
        for _ in 0..CANCEL_UPDATE_ATTEMPTS {
            let mut job: JobInfo = entity.decode()?;

            if job.status.is_terminal() {
                return Ok(());
            }

            job.cancel_requested = true;
            if job.status == JobStatus::Created {
                job.status = JobStatus::Cancelled;
            }

            let partition_key = entity.partition_key.clone();
            let row_key = entity.row_key.clone();

            match self.table.update(&partition_key, &row_key, entity.etag, &job).await {
                Ok(_) => {
                    tracing::info!(id = %job.id, "cancellation requested");
                    return Ok(());
                }
                Err(TableError::PreconditionFailed(_, _)) => {
                    entity = self.table.require(&partition_key, &row_key).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(JobQueueError::CancellationContention)
    }

    async fn allocate_job_ids(
        &self,
        queue_type: QueueType,
        count: usize,
    ) -> Result<Vec<JobId>, JobQueueError> {
        let partition_key = counter_partition_key(queue_type);

        for _ in 0..COUNTER_ALLOCATION_ATTEMPTS {
            match self.table.get(&partition_key, COUNTER_ROW_KEY).await? {
                Some(entity) => {
                    let counter: JobIdCounterRecord = entity.decode()?;
                    let first = counter.next_job_id;

                    let advanced = JobIdCounterRecord {
                        next_job_id: first + count as i64,
                    };

                    match self
                        .table
                        .update(&partition_key, COUNTER_ROW_KEY, entity.etag, &advanced)
                        .await
                    {
                        Ok(_) => {
                            return Ok((first..first + count as i64).map(JobId::from).collect())
                        }
                        Err(TableError::PreconditionFailed(_, _)) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                None => {
                    let first = 1i64;
                    let fresh = JobIdCounterRecord {
                        next_job_id: first + count as i64,
                    };

                    match self.table.insert(&partition_key, COUNTER_ROW_KEY, &fresh).await {
                        Ok(_) => {
                            return Ok((first..first + count as i64).map(JobId::from).collect())
                        }
                        Err(TableError::EntityAlreadyExists(_, _)) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }

        Err(JobQueueError::CounterContention)
    }

    fn job_insert_op(
        &self,
        partition_key: &str,
        job: &JobInfo,
    ) -> Result<BatchOperation, JobQueueError> {
        BatchOperation::insert(
            partition_key,
            job_info_row_key(job.group_id, job.id),
            job,
        )
        .map_err(Into::into)
    }

    fn lock_insert_op(
        &self,
        partition_key: &str,
        job: &JobInfo,
    ) -> Result<BatchOperation, JobQueueError> {
        let lock = JobLockRecord {
            job_info_row_key: job_info_row_key(job.group_id, job.id),
            message_id: None,
            pop_receipt: None,
        };

        BatchOperation::insert(partition_key, job_lock_row_key(&job.definition), &lock)
            .map_err(Into::into)
    }

    fn reverse_index_op(
        &self,
        partition_key: &str,
        job: &JobInfo,
    ) -> Result<BatchOperation, JobQueueError> {
        let index = ReverseIndexRecord {
            job_info_partition_key: partition_key.to_string(),
            job_info_row_key: job_info_row_key(job.group_id, job.id),
        };

        BatchOperation::insert(
            reverse_index_partition_key(job.queue_type),
            job.id.padded(),
            &index,
        )
        .map_err(Into::into)
    }

    fn message_queue(&self, queue_type: QueueType) -> MessageQueue {
        MessageQueue::new(self.database.clone(), message_queue_name(queue_type))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobQueueError {
    #[error("a previous dequeue attempt already finished job {0}")]
    AlreadyFinished(JobId),

    #[error("cancellation kept losing update races and gave up")]
    CancellationContention,

    #[error("job id counter contention exceeded the retry budget")]
    CounterContention,

    #[error("enqueue request contained duplicate definitions")]
    DuplicateDefinition,

    #[error("a dequeued message was garbage and has been discarded: {0}")]
    GarbageMessage(String),

    #[error("job no longer exists or this worker's lease is stale")]
    JobNotExist,

    #[error("another worker holds a live lease on job {0}")]
    LeaseStillHeld(JobId),

    #[error("job payload couldn't be serialized: {0}")]
    MalformedPayload(serde_json::Error),

    #[error("queue operation failed: {0}")]
    Queue(#[from] MessageQueueError),

    #[error("a stale message for job {0} was discarded")]
    StaleMessage(JobId),

    #[error("table operation failed: {0}")]
    Table(#[from] TableError),

    #[error("enqueue was handed {0} definitions, limit is {1}")]
    TooManyDefinitions(usize, usize),
}

impl JobQueueError {
    /// Whether the caller should expect a repeat attempt to succeed. Lease
    /// losses, payload-size violations, and malformed input are not worth
    /// retrying; contention and backend trouble are.
    pub fn is_retriable(&self) -> bool {
        match self {
            JobQueueError::AlreadyFinished(_)
            | JobQueueError::GarbageMessage(_)
            | JobQueueError::LeaseStillHeld(_)
            | JobQueueError::StaleMessage(_)
            | JobQueueError::CancellationContention
            | JobQueueError::CounterContention => true,

            JobQueueError::DuplicateDefinition
            | JobQueueError::JobNotExist
            | JobQueueError::MalformedPayload(_)
            | JobQueueError::TooManyDefinitions(_, _) => false,

            JobQueueError::Table(err) => {
                err.is_retriable() || matches!(err, TableError::PreconditionFailed(_, _))
            }
            JobQueueError::Queue(err) => !err.is_lease_lost(),
        }
    }
}
