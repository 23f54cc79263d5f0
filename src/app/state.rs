use std::sync::Arc;

use object_store::local::LocalFileSystem;

use crate::app::{Config, Error};
use crate::database::Database;
use crate::fhir::{
    AnonymousAccess, ChangeFeedClient, DicomWebClient, FhirApiClient, StaticToken, TokenProvider,
};
use crate::jobs::JobQueueClient;
use crate::metadata::MetadataStore;
use crate::orchestrator::{DataSourceKind, OrchestratorOptions, PipelineContext};
use crate::scheduler::SchedulerOptions;
use crate::sink::LakeSink;

/// Wired-up capabilities of one agent instance. Everything downstream
/// receives these through injection; nothing reaches for globals.
#[derive(Clone)]
pub struct State {
    database: Database,
    context: PipelineContext,
}

impl State {
    // not implemented as a From trait so it can be async
    pub async fn from_config(config: &Config) -> Result<Self, Error> {
        let database = Database::connect(config.db_url()).await?;

        let queue = JobQueueClient::new(database.clone());
        let metadata = MetadataStore::new(database.clone());

        let credentials: Arc<dyn TokenProvider> = match config.access_token() {
            Some(token) => Arc::new(StaticToken::new(token)),
            None => Arc::new(AnonymousAccess),
        };

        let fhir = Arc::new(FhirApiClient::new(
            config.upstream_url().clone(),
            credentials.clone(),
        ));

        let change_feed: Option<Arc<dyn ChangeFeedClient>> = match config.data_source() {
            DataSourceKind::Dicom => Some(Arc::new(DicomWebClient::new(
                config.upstream_url().clone(),
                credentials,
            ))),
            DataSourceKind::Fhir => None,
        };

        std::fs::create_dir_all(config.lake_path()).map_err(Error::LakeSetup)?;
        let store = LocalFileSystem::new_with_prefix(config.lake_path())
            .map_err(Error::LakeStore)?;
        let sink = Arc::new(LakeSink::new(Arc::new(store)));

        let options = OrchestratorOptions {
            queue_type: config.queue_type(),
            source: config.data_source(),
            scope: config.filter_scope(),
            resource_types: config.resource_types().to_vec(),
            group_id: config.group_id().map(|group_id| group_id.to_string()),
            max_in_flight: config.max_in_flight(),
            check_frequency: config.check_frequency(),
            low_bound: config.low_bound(),
            high_bound: config.high_bound(),
            patients_per_job: config.patients_per_job(),
            change_feed_entries_per_job: config.change_feed_entries_per_job(),
        };

        let context = PipelineContext {
            queue,
            metadata,
            fhir,
            change_feed,
            sink,
            options,
        };

        Ok(Self { database, context })
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.context.metadata
    }

    pub fn queue(&self) -> &JobQueueClient {
        &self.context.queue
    }

    pub fn scheduler_options(&self, config: &Config) -> SchedulerOptions {
        SchedulerOptions {
            queue_type: config.queue_type(),
            initial_interval: config.initial_interval(),
            incremental_interval: config.incremental_interval(),
            window_lag: config.window_lag(),
            max_window: config.max_window(),
            since: config.since(),
        }
    }
}
