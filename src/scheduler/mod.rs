use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::timeout;
use uuid::Uuid;

use crate::database::custom_types::{Etag, GroupId, JobStatus, QueueType};
use crate::jobs::{JobQueueClient, JobQueueError};
use crate::metadata::{CurrentTrigger, MetadataError, MetadataStore, TriggerStatus};
use crate::orchestrator::{JobType, OrchestratorJobInputData, CURRENT_JOB_VERSION};

/// How long scheduler leadership lasts without renewal. The polling cadence
/// below keeps a healthy leader renewing several times per term.
const TRIGGER_LEASE_TTL: Duration = Duration::from_secs(60);

const SCHEDULE_CHECK_DELAY: Duration = Duration::from_secs(10);

/// Tuning for the sliding extraction window.
#[derive(Clone, Debug)]
pub struct SchedulerOptions {
    pub queue_type: QueueType,

    /// Cadence before the first window completes, and between windows after.
    pub initial_interval: Duration,
    pub incremental_interval: Duration,

    /// Never schedule data newer than `now - window_lag`; late-arriving
    /// writes inside the lag horizon would otherwise be missed forever.
    pub window_lag: Duration,

    /// Cap on how much one orchestration may bite off.
    pub max_window: Duration,

    pub since: Option<OffsetDateTime>,
}

/// Single-writer scheduler. Every instance runs one of these; only the holder
/// of the trigger lease advances the sliding window and creates orchestrator
/// jobs, so agents can be added and removed freely.
pub struct SchedulerService {
    metadata: MetadataStore,
    queue: JobQueueClient,
    options: SchedulerOptions,

    instance_id: Uuid,
}

impl SchedulerService {
    pub fn new(metadata: MetadataStore, queue: JobQueueClient, options: SchedulerOptions) -> Self {
        Self {
            metadata,
            queue,
            options,
            instance_id: Uuid::new_v4(),
        }
    }

    pub async fn run(&mut self, mut shutdown_signal: watch::Receiver<()>) {
        tracing::info!(instance = %self.instance_id, "scheduler starting");

        loop {
            if shutdown_signal.has_changed().unwrap_or(true) {
                tracing::info!(instance = %self.instance_id, "scheduler shutting down");
                return;
            }

            // acquiring doubles as renewal while we hold the lease
            match self
                .metadata
                .try_acquire_trigger_lease(self.instance_id, TRIGGER_LEASE_TTL)
                .await
            {
                Ok(true) => {
                    if let Err(err) = self.tick().await {
                        tracing::warn!("scheduler tick failed: {err}");
                    }
                }
                Ok(false) => {
                    tracing::debug!(instance = %self.instance_id, "another scheduler holds the lease");
                }
                Err(err) => {
                    tracing::warn!("trigger lease check failed: {err}");
                }
            }

            if timeout(SCHEDULE_CHECK_DELAY, shutdown_signal.changed())
                .await
                .is_ok()
            {
                tracing::info!(instance = %self.instance_id, "scheduler shutting down");
                return;
            }
        }
    }

    async fn tick(&mut self) -> Result<(), SchedulerError> {
        match self.metadata.current_trigger().await? {
            None => self.plan_next_trigger(0, None, None).await,
            Some((trigger, etag)) => match trigger.status {
                TriggerStatus::Running => self.close_finished_trigger(trigger, etag).await,
                TriggerStatus::Completed
                | TriggerStatus::Failed
                | TriggerStatus::Cancelled => {
                    // the cursor advances to the closed window's end either
                    // way; a bad window is not retried forever
                    self.plan_next_trigger(
                        trigger.sequence_id + 1,
                        Some(trigger.window_end),
                        Some(etag),
                    )
                    .await
                }
            },
        }
    }

    /// Checks whether the running trigger's orchestrator reached a terminal
    /// status and records the outcome on the trigger.
    async fn close_finished_trigger(
        &mut self,
        mut trigger: CurrentTrigger,
        etag: Etag,
    ) -> Result<(), SchedulerError> {
        let job_id = match trigger.orchestrator_job_id {
            Some(job_id) => job_id,
            None => {
                tracing::error!(
                    sequence = trigger.sequence_id,
                    "running trigger lost its orchestrator job id"
                );
                trigger.status = TriggerStatus::Failed;
                return Ok(self.metadata.update_trigger(&trigger, etag).await?);
            }
        };

        let job = self.queue.job_by_id(self.options.queue_type, job_id).await?;

        let status = match job {
            Some(job) => job.status,
            None => {
                tracing::error!(%job_id, "orchestrator job vanished from the queue");
                trigger.status = TriggerStatus::Failed;
                return Ok(self.metadata.update_trigger(&trigger, etag).await?);
            }
        };

        let closed = match status {
            JobStatus::Completed => TriggerStatus::Completed,
            JobStatus::Failed => TriggerStatus::Failed,
            JobStatus::Cancelled => TriggerStatus::Cancelled,
            JobStatus::Created | JobStatus::Running => return Ok(()),
        };

        trigger.status = closed;
        self.metadata.update_trigger(&trigger, etag).await?;

        tracing::info!(
            sequence = trigger.sequence_id,
            status = ?closed,
            "trigger closed"
        );

        Ok(())
    }

    /// Plans and enqueues the next window when its cadence has elapsed. The
    /// orchestrator job and the trigger record are reconciled through the
    /// queue's definition deduplication: replanning the same window after a
    /// crash lands on the same job.
    async fn plan_next_trigger(
        &mut self,
        sequence_id: i64,
        cursor: Option<OffsetDateTime>,
        prior_etag: Option<Etag>,
    ) -> Result<(), SchedulerError> {
        let now = OffsetDateTime::now_utc();
        let horizon = now - self.options.window_lag;

        let cadence = match cursor {
            None => self.options.initial_interval,
            Some(_) => self.options.incremental_interval,
        };

        if let Some(cursor) = cursor {
            if horizon < cursor + cadence {
                return Ok(());
            }
        }

        let window_end = match cursor {
            Some(cursor) => horizon.min(cursor + self.options.max_window),
            None => horizon,
        };

        if let Some(cursor) = cursor {
            if window_end <= cursor {
                return Ok(());
            }
        }

        let input = OrchestratorJobInputData {
            job_type: JobType::Orchestrator,
            trigger_sequence_id: sequence_id,
            job_version: CURRENT_JOB_VERSION,
            data_start_time: cursor,
            data_end_time: window_end,
            since: self.options.since,
        };
        let definition =
            serde_json::to_string(&input).map_err(SchedulerError::MalformedDefinition)?;

        let jobs = self
            .queue
            .enqueue(
                self.options.queue_type,
                &[definition],
                GroupId::from(sequence_id),
            )
            .await?;

        let job = jobs
            .first()
            .ok_or(SchedulerError::OrchestratorNotCreated)?;

        let trigger = CurrentTrigger {
            sequence_id,
            window_start: cursor,
            window_end,
            status: TriggerStatus::Running,
            orchestrator_job_id: Some(job.id),
        };

        match prior_etag {
            Some(etag) => self.metadata.update_trigger(&trigger, etag).await?,
            None => self.metadata.insert_trigger(&trigger).await?,
        }

        tracing::info!(
            sequence = sequence_id,
            orchestrator = %job.id,
            window_end = %window_end,
            "orchestration window scheduled"
        );

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("couldn't serialize the orchestrator definition: {0}")]
    MalformedDefinition(serde_json::Error),

    #[error("metadata store operation failed: {0}")]
    Metadata(#[from] MetadataError),

    #[error("enqueue reported success without creating the orchestrator job")]
    OrchestratorNotCreated,

    #[error("job queue operation failed: {0}")]
    Queue(#[from] JobQueueError),
}
