use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub mod app;
pub mod database;
pub mod fhir;
pub mod jobs;
pub mod metadata;
pub mod orchestrator;
pub mod scheduler;
pub mod sink;
pub mod split;
pub mod tables;

use jobs::JobHost;
use orchestrator::PipelineJobFactory;
use scheduler::SchedulerService;

/// How long an idle worker sleeps between queue polls.
const WORKER_IDLE_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// Starts the worker slots that execute orchestrator and processing jobs for
/// this agent's queue type.
pub async fn job_host(
    state: &app::State,
    config: &app::Config,
    shutdown_rx: watch::Receiver<()>,
) -> JoinHandle<()> {
    let context = state.context().clone();
    let factory = Arc::new(PipelineJobFactory::new(context.clone()));

    JobHost::new(
        context.queue,
        config.queue_type(),
        factory,
        config.worker_count(),
        config.heartbeat_timeout(),
        WORKER_IDLE_DELAY,
    )
    .start(shutdown_rx)
    .await
}

/// Starts the sliding-window scheduler. Every instance runs one; leadership
/// is decided by the trigger lease, so extra instances just stand by.
pub fn scheduler_service(
    state: &app::State,
    config: &app::Config,
    shutdown_rx: watch::Receiver<()>,
) -> JoinHandle<()> {
    let mut service = SchedulerService::new(
        state.metadata().clone(),
        state.queue().clone(),
        state.scheduler_options(config),
    );

    tokio::spawn(async move { service.run(shutdown_rx).await })
}

/// Translates SIGINT/SIGTERM into a watch signal every long-lived service
/// observes. SIGTERM is what the deployment harness sends ahead of a kill,
/// so services get one chance to finish the job slices they're holding
/// leases on; SIGINT comes from people running the agent locally and behaves
/// the same way.
pub fn graceful_shutdown_blocker() -> (JoinHandle<()>, watch::Receiver<()>) {
    let mut sigint = signal(SignalKind::interrupt()).expect("signal handler to register");
    let mut sigterm = signal(SignalKind::terminate()).expect("signal handler to register");

    let (tx, rx) = watch::channel(());

    let handle = tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => tracing::debug!("shutting down immediately on SIGINT"),
            _ = sigterm.recv() => tracing::debug!("initiating graceful shutdown on SIGTERM"),
        }

        let _ = tx.send(());
    });

    (handle, rx)
}

/// Sets up system panics to use the tracing infrastructure to log reported
/// issues. The panic still takes the task down; this only makes sure it lands
/// in the log stream with its location attached.
pub fn register_panic_logger() {
    std::panic::set_hook(Box::new(|panic| match panic.location() {
        Some(loc) => {
            tracing::error!(
                message = %panic,
                panic.file = loc.file(),
                panic.line = loc.line(),
                panic.column = loc.column(),
            );
        }
        None => tracing::error!(message = %panic),
    }));
}

pub fn report_version() {
    let version = app::Version::new();
    tracing::info!(
        build_profile = ?version.build_profile,
        version = ?version.version,
        "service starting up"
    );
}

#[cfg(test)]
mod tests;
