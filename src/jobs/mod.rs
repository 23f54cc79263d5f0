mod entities;
mod host;
mod job_info;
mod queue_client;

pub use host::{JobExecError, JobHandler, JobHandlerFactory, JobHost, ProgressReporter};
pub use job_info::JobInfo;
pub use queue_client::{JobQueueClient, JobQueueError, MAX_ENQUEUE_BATCH};
