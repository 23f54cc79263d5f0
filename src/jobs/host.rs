use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::database::custom_types::{JobStatus, QueueType};
use crate::jobs::{JobInfo, JobQueueClient, JobQueueError};

const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome classification a handler reports back to its worker. Retriable
/// failures leave the job leased-but-running so a later dequeue picks it up;
/// fatal ones finish the job as Failed.
#[derive(Debug, thiserror::Error)]
pub enum JobExecError {
    #[error("job observed a cancellation request and stopped")]
    Cancelled,

    #[error("job failed permanently: {0}")]
    Fatal(String),

    #[error("job hit a retriable problem: {0}")]
    Retriable(String),
}

impl JobExecError {
    pub fn fatal(msg: impl ToString) -> Self {
        Self::Fatal(msg.to_string())
    }

    pub fn retriable(msg: impl ToString) -> Self {
        Self::Retriable(msg.to_string())
    }
}

/// Channel a handler uses to publish its latest progress snapshot. The worker
/// persists the most recent snapshot on every heartbeat, which is what makes
/// crash-resume possible for long jobs.
#[derive(Clone)]
pub struct ProgressReporter {
    latest: Arc<watch::Sender<Option<String>>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);

        Self {
            latest: Arc::new(latest),
        }
    }

    pub fn report(&self, snapshot: impl ToString) {
        self.latest.send_replace(Some(snapshot.to_string()));
    }

    pub fn latest(&self) -> Option<String> {
        self.latest.borrow().clone()
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait JobHandler: Send {
    /// Runs the job to completion, returning the serialized result. The
    /// cancellation flag flips when a cancel request is observed upstream;
    /// handlers are expected to notice it at their next suspension point.
    async fn run(
        &mut self,
        job: &JobInfo,
        progress: ProgressReporter,
        cancelled: watch::Receiver<bool>,
    ) -> Result<String, JobExecError>;
}

/// Builds a handler for a freshly leased job, dispatching on whatever the
/// job's definition says it is.
pub trait JobHandlerFactory: Send + Sync {
    fn create(&self, job: &JobInfo) -> Result<Box<dyn JobHandler>, JobExecError>;
}

/// Generic worker loop over the durable queue: a fixed number of worker slots
/// each dequeue, run the handler alongside a heartbeat timer, and finish the
/// job according to how the handler returned.
pub struct JobHost {
    queue: JobQueueClient,
    queue_type: QueueType,
    factory: Arc<dyn JobHandlerFactory>,

    worker_count: usize,
    heartbeat_timeout: Duration,
    idle_check_delay: Duration,
}

impl JobHost {
    pub fn new(
        queue: JobQueueClient,
        queue_type: QueueType,
        factory: Arc<dyn JobHandlerFactory>,
        worker_count: usize,
        heartbeat_timeout: Duration,
        idle_check_delay: Duration,
    ) -> Self {
        Self {
            queue,
            queue_type,
            factory,
            worker_count,
            heartbeat_timeout,
            idle_check_delay,
        }
    }

    pub async fn start(self, shutdown_signal: watch::Receiver<()>) -> JoinHandle<()> {
        let mut worker_handles = Vec::new();

        for idx in 0..self.worker_count {
            let worker = Worker {
                name: format!("worker-{}-{idx}", self.queue_type),
                queue: self.queue.clone(),
                queue_type: self.queue_type,
                factory: self.factory.clone(),
                heartbeat_timeout: self.heartbeat_timeout,
                idle_check_delay: self.idle_check_delay,
                shutdown_signal: shutdown_signal.clone(),
            };

            worker_handles.push(tokio::spawn(async move { worker.run_jobs().await }));
        }

        let mut guard_signal = shutdown_signal;
        tokio::spawn(async move {
            // wait out the workers' shutdown signal, then give them a bounded
            // window to drain before abandoning them
            let _ = guard_signal.changed().await;

            match timeout(WORKER_SHUTDOWN_TIMEOUT, join_all(worker_handles)).await {
                Ok(_) => tracing::info!("job host shutdown gracefully"),
                Err(_) => {
                    tracing::warn!("timed out waiting for workers to finish, abandoning them")
                }
            }
        })
    }
}

struct Worker {
    name: String,
    queue: JobQueueClient,
    queue_type: QueueType,
    factory: Arc<dyn JobHandlerFactory>,

    heartbeat_timeout: Duration,
    idle_check_delay: Duration,

    shutdown_signal: watch::Receiver<()>,
}

impl Worker {
    async fn run_jobs(mut self) {
        loop {
            if self.shutdown_signal.has_changed().unwrap_or(true) {
                tracing::info!(worker = %self.name, "worker shutting down");
                return;
            }

            match self
                .queue
                .dequeue(self.queue_type, &self.name, self.heartbeat_timeout)
                .await
            {
                Ok(Some(job)) => {
                    self.execute(job).await;
                    continue;
                }
                Ok(None) => (),
                Err(err) if err.is_retriable() => {
                    tracing::debug!(worker = %self.name, "dequeue skipped a message: {err}");
                    continue;
                }
                Err(err) => {
                    tracing::error!(worker = %self.name, "dequeue failed: {err}");
                }
            }

            // idle; wake early if shutdown arrives in the meantime
            if timeout(self.idle_check_delay, self.shutdown_signal.changed())
                .await
                .is_ok()
            {
                tracing::info!(worker = %self.name, "received shutdown signal while idle");
                return;
            }
        }
    }

    async fn execute(&self, mut job: JobInfo) {
        let mut handler = match self.factory.create(&job) {
            Ok(handler) => handler,
            Err(err) => {
                tracing::error!(id = %job.id, "no handler could be built: {err}");
                job.status = JobStatus::Failed;
                self.finish(&job, true).await;
                return;
            }
        };

        let progress = ProgressReporter::new();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut heartbeat = tokio::time::interval(self.heartbeat_timeout / 3);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the interval fires immediately; the lease was just taken, skip it
        heartbeat.tick().await;

        let outcome = {
            let run = handler.run(&job, progress.clone(), cancel_rx);
            tokio::pin!(run);

            loop {
                tokio::select! {
                    outcome = &mut run => break outcome,
                    _ = heartbeat.tick() => {
                        let mut snapshot = job.clone();
                        snapshot.result = progress.latest().or(snapshot.result);

                        match self.queue.keep_alive(&snapshot).await {
                            Ok(false) => (),
                            Ok(true) => {
                                let _ = cancel_tx.send(true);
                            }
                            Err(JobQueueError::JobNotExist) => {
                                // another worker took over; stop silently and
                                // let the handler future drop
                                tracing::warn!(id = %job.id, worker = %self.name, "lease lost mid-run, abandoning job");
                                return;
                            }
                            Err(err) => {
                                tracing::warn!(id = %job.id, "heartbeat failed: {err}");
                            }
                        }
                    }
                }
            }
        };

        match outcome {
            Ok(result) => {
                job.result = Some(result);
                self.finish(&job, false).await;
            }
            Err(JobExecError::Cancelled) => {
                // completion resolves to Cancelled through the stored flag
                job.result = progress.latest().or(job.result.clone());
                self.finish(&job, false).await;
            }
            Err(JobExecError::Retriable(cause)) => {
                // leave the job Running; its lease lapses and a later dequeue
                // resumes from the last persisted progress snapshot
                tracing::warn!(id = %job.id, "job will be re-leased after: {cause}");
            }
            Err(JobExecError::Fatal(cause)) => {
                tracing::error!(id = %job.id, "job failed: {cause}");
                job.status = JobStatus::Failed;
                job.result = progress.latest().or(job.result.clone());
                self.finish(&job, true).await;
            }
        }
    }

    async fn finish(&self, job: &JobInfo, request_cancellation_on_failure: bool) {
        match self.queue.complete(job, request_cancellation_on_failure).await {
            Ok(()) => (),
            // the lease moved on while we were finishing; the new holder owns
            // the outcome now
            Err(JobQueueError::JobNotExist) => {
                tracing::warn!(id = %job.id, worker = %self.name, "lease lost before completion");
            }
            Err(err) => {
                tracing::error!(id = %job.id, "failed to record job completion: {err}");
            }
        }
    }
}
