use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use pico_args::Arguments;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::filter::LevelFilter;
use url::Url;

use crate::app::Error;
use crate::database::custom_types::QueueType;
use crate::orchestrator::{DataSourceKind, FilterScope};

const DEFAULT_DB_URL: &str = "sqlite://./data/fhir-lake-agent.db";

const DEFAULT_RESOURCE_TYPES: &str = "Patient,Observation,Encounter";

#[derive(Debug)]
pub struct Config {
    db_url: Url,
    lake_path: PathBuf,

    upstream_url: Url,
    access_token: Option<String>,

    data_source: DataSourceKind,
    filter_scope: FilterScope,
    resource_types: Vec<String>,
    group_id: Option<String>,

    queue_type: QueueType,
    worker_count: usize,
    max_in_flight: usize,
    check_frequency: Duration,
    heartbeat_timeout: Duration,

    low_bound: u64,
    high_bound: u64,
    patients_per_job: usize,
    change_feed_entries_per_job: i64,

    initial_interval: Duration,
    incremental_interval: Duration,
    window_lag: Duration,
    max_window: Duration,
    since: Option<OffsetDateTime>,

    log_level: LevelFilter,
}

impl Config {
    pub fn from_env_and_args() -> Result<Self, Error> {
        // environment files are a convenience for local runs, their absence
        // isn't an error
        let _ = dotenvy::dotenv();

        let mut args = Arguments::from_env();

        let db_url = setting(&mut args, "--db-url", "DB_URL")?
            .unwrap_or_else(|| Url::parse(DEFAULT_DB_URL).expect("default url to be valid"));

        let lake_path: PathBuf = setting::<String>(&mut args, "--lake-path", "LAKE_PATH")?
            .unwrap_or_else(|| "./data/lake".to_string())
            .into();

        let upstream_url: Url = setting(&mut args, "--upstream-url", "UPSTREAM_URL")?
            .ok_or(Error::IncompleteConfig("an upstream url is required"))?;
        let access_token = setting::<String>(&mut args, "--access-token", "UPSTREAM_ACCESS_TOKEN")?;

        let data_source =
            setting(&mut args, "--data-source", "DATA_SOURCE")?.unwrap_or(DataSourceKind::Fhir);
        let filter_scope =
            setting(&mut args, "--filter-scope", "FILTER_SCOPE")?.unwrap_or(FilterScope::System);

        let resource_types: Vec<String> =
            setting::<String>(&mut args, "--resource-types", "RESOURCE_TYPES")?
                .unwrap_or_else(|| DEFAULT_RESOURCE_TYPES.to_string())
                .split(',')
                .map(|resource_type| resource_type.trim().to_string())
                .filter(|resource_type| !resource_type.is_empty())
                .collect();

        let group_id = setting::<String>(&mut args, "--group-id", "GROUP_ID")?;
        if filter_scope == FilterScope::Group && group_id.is_none() {
            return Err(Error::IncompleteConfig("group scope requires a group id"));
        }

        let queue_type =
            setting(&mut args, "--queue-type", "QUEUE_TYPE")?.unwrap_or(QueueType::from(0));
        let worker_count = setting(&mut args, "--worker-count", "WORKER_COUNT")?.unwrap_or(2);
        let max_in_flight = setting(&mut args, "--max-in-flight", "MAX_IN_FLIGHT")?.unwrap_or(5);

        let check_frequency = Duration::from_secs(
            setting(&mut args, "--check-frequency-secs", "CHECK_FREQUENCY_SECS")?.unwrap_or(10),
        );
        let heartbeat_timeout = Duration::from_secs(
            setting(&mut args, "--heartbeat-timeout-secs", "HEARTBEAT_TIMEOUT_SECS")?.unwrap_or(30),
        );

        let low_bound = setting(&mut args, "--low-bound", "LOW_BOUND")?.unwrap_or(20_000);
        let high_bound = setting(&mut args, "--high-bound", "HIGH_BOUND")?.unwrap_or(40_000);
        if low_bound == 0 || high_bound <= low_bound {
            return Err(Error::IncompleteConfig(
                "split bounds must satisfy 0 < low < high",
            ));
        }

        let patients_per_job =
            setting(&mut args, "--patients-per-job", "PATIENTS_PER_JOB")?.unwrap_or(100);
        let change_feed_entries_per_job = setting(
            &mut args,
            "--change-feed-entries-per-job",
            "CHANGE_FEED_ENTRIES_PER_JOB",
        )?
        .unwrap_or(10_000);

        let initial_interval = Duration::from_secs(
            setting(
                &mut args,
                "--initial-interval-secs",
                "INITIAL_ORCHESTRATION_INTERVAL_SECS",
            )?
            .unwrap_or(60),
        );
        let incremental_interval = Duration::from_secs(
            setting(
                &mut args,
                "--incremental-interval-secs",
                "INCREMENTAL_ORCHESTRATION_INTERVAL_SECS",
            )?
            .unwrap_or(300),
        );
        let window_lag = Duration::from_secs(
            setting(&mut args, "--window-lag-secs", "WINDOW_LAG_SECS")?.unwrap_or(120),
        );
        let max_window = Duration::from_secs(
            setting(&mut args, "--max-window-secs", "MAX_WINDOW_SECS")?.unwrap_or(86_400),
        );

        let since = match setting::<String>(&mut args, "--since", "SINCE")? {
            Some(raw) => Some(
                OffsetDateTime::parse(&raw, &Rfc3339)
                    .map_err(|err| Error::InvalidSetting("SINCE", err.to_string()))?,
            ),
            None => None,
        };

        let log_level = setting(&mut args, "--log-level", "LOG_LEVEL")?
            .unwrap_or(LevelFilter::INFO);

        Ok(Config {
            db_url,
            lake_path,
            upstream_url,
            access_token,
            data_source,
            filter_scope,
            resource_types,
            group_id,
            queue_type,
            worker_count,
            max_in_flight,
            check_frequency,
            heartbeat_timeout,
            low_bound,
            high_bound,
            patients_per_job,
            change_feed_entries_per_job,
            initial_interval,
            incremental_interval,
            window_lag,
            max_window,
            since,
            log_level,
        })
    }

    pub fn db_url(&self) -> &Url {
        &self.db_url
    }

    pub fn lake_path(&self) -> &PathBuf {
        &self.lake_path
    }

    pub fn upstream_url(&self) -> &Url {
        &self.upstream_url
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn data_source(&self) -> DataSourceKind {
        self.data_source
    }

    pub fn filter_scope(&self) -> FilterScope {
        self.filter_scope
    }

    pub fn resource_types(&self) -> &[String] {
        &self.resource_types
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn check_frequency(&self) -> Duration {
        self.check_frequency
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub fn low_bound(&self) -> u64 {
        self.low_bound
    }

    pub fn high_bound(&self) -> u64 {
        self.high_bound
    }

    pub fn patients_per_job(&self) -> usize {
        self.patients_per_job
    }

    pub fn change_feed_entries_per_job(&self) -> i64 {
        self.change_feed_entries_per_job
    }

    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    pub fn incremental_interval(&self) -> Duration {
        self.incremental_interval
    }

    pub fn window_lag(&self) -> Duration {
        self.window_lag
    }

    pub fn max_window(&self) -> Duration {
        self.max_window
    }

    pub fn since(&self) -> Option<OffsetDateTime> {
        self.since
    }

    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }
}

/// A setting is taken from the command line when present, the environment
/// otherwise.
fn setting<T>(args: &mut Arguments, flag: &'static str, env_key: &'static str) -> Result<Option<T>, Error>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(value) = args
        .opt_value_from_str(flag)
        .map_err(Error::ArgumentError)?
    {
        return Ok(Some(value));
    }

    match std::env::var(env_key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|err: T::Err| Error::InvalidSetting(env_key, err.to_string())),
        Err(_) => Ok(None),
    }
}
