use std::time::Duration;

use futures::future::join_all;
use tokio::time::timeout;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use fhir_lake_agent::app::{Config, State};

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let config = match Config::from_env_and_args() {
        Ok(config) => config,
        Err(err) => {
            println!("failed to load config: {err}");
            std::process::exit(2);
        }
    };

    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(std::io::stdout());
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.log_level().into())
        .from_env_lossy();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(stderr_layer).init();

    fhir_lake_agent::register_panic_logger();
    fhir_lake_agent::report_version();

    let state = match State::from_config(&config).await {
        Ok(state) => state,
        Err(err) => {
            tracing::error!("failed to wire up the agent: {err}");
            std::process::exit(2);
        }
    };

    let (graceful_waiter, shutdown_rx) = fhir_lake_agent::graceful_shutdown_blocker();

    let host_handle = fhir_lake_agent::job_host(&state, &config, shutdown_rx.clone()).await;
    let scheduler_handle =
        fhir_lake_agent::scheduler_service(&state, &config, shutdown_rx.clone());

    let _ = graceful_waiter.await;

    if timeout(
        FINAL_SHUTDOWN_TIMEOUT,
        join_all(vec![host_handle, scheduler_handle]),
    )
    .await
    .is_err()
    {
        tracing::error!("hit final shutdown timeout. exiting with remaining work in progress");
        std::process::exit(3);
    }
}
