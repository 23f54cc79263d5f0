mod input;
mod processing;
mod result;

pub use input::{JobType, OrchestratorJobInputData, CURRENT_JOB_VERSION};
pub use processing::{
    PatientSlice, ProcessingJobHandler, ProcessingJobInputData, ProcessingJobResult,
};
pub use result::OrchestratorJobResult;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::database::custom_types::{JobStatus, QueueType};
use crate::fhir::{ChangeFeedClient, FhirSearchClient, OffsetRange, TimeWindow};
use crate::jobs::{
    JobExecError, JobHandler, JobHandlerFactory, JobInfo, JobQueueClient, JobQueueError,
    ProgressReporter,
};
use crate::metadata::MetadataStore;
use crate::sink::DataSink;
use crate::split::{ProcessingJobSplitter, SplitError};

/// Whether an extraction covers the whole system's resources by time window
/// or one patient group's compartments.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilterScope {
    System,
    Group,
}

impl FromStr for FilterScope {
    type Err = ScopeParseError;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        match val.to_ascii_lowercase().as_str() {
            "system" => Ok(FilterScope::System),
            "group" => Ok(FilterScope::Group),
            other => Err(ScopeParseError::UnknownScope(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataSourceKind {
    Fhir,
    Dicom,
}

impl FromStr for DataSourceKind {
    type Err = ScopeParseError;

    fn from_str(val: &str) -> Result<Self, Self::Err> {
        match val.to_ascii_lowercase().as_str() {
            "fhir" => Ok(DataSourceKind::Fhir),
            "dicom" => Ok(DataSourceKind::Dicom),
            other => Err(ScopeParseError::UnknownDataSource(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScopeParseError {
    #[error("'{0}' is not a recognized data source")]
    UnknownDataSource(String),

    #[error("'{0}' is not a recognized filter scope")]
    UnknownScope(String),
}

/// Tuning and shape of one configured pipeline, shared by the orchestrator
/// and processing handlers.
#[derive(Clone, Debug)]
pub struct OrchestratorOptions {
    pub queue_type: QueueType,
    pub source: DataSourceKind,
    pub scope: FilterScope,

    pub resource_types: Vec<String>,
    pub group_id: Option<String>,

    pub max_in_flight: usize,
    pub check_frequency: Duration,

    pub low_bound: u64,
    pub high_bound: u64,

    pub patients_per_job: usize,
    pub change_feed_entries_per_job: i64,
}

impl OrchestratorOptions {
    /// In-flight level above which completions are polled opportunistically
    /// while still enqueueing.
    fn poll_watermark(&self) -> usize {
        (self.max_in_flight + 1) / 2
    }
}

/// Everything a pipeline job needs to run, injected rather than ambient.
#[derive(Clone)]
pub struct PipelineContext {
    pub queue: JobQueueClient,
    pub metadata: MetadataStore,
    pub fhir: Arc<dyn FhirSearchClient>,
    pub change_feed: Option<Arc<dyn ChangeFeedClient>>,
    pub sink: Arc<dyn DataSink>,
    pub options: OrchestratorOptions,
}

/// Builds handlers for dequeued pipeline jobs by the type tag carried in
/// every definition.
pub struct PipelineJobFactory {
    context: PipelineContext,
}

impl PipelineJobFactory {
    pub fn new(context: PipelineContext) -> Self {
        Self { context }
    }
}

impl JobHandlerFactory for PipelineJobFactory {
    fn create(&self, job: &JobInfo) -> Result<Box<dyn JobHandler>, JobExecError> {
        let definition: serde_json::Value = serde_json::from_str(&job.definition)
            .map_err(|err| JobExecError::fatal(format!("unreadable definition: {err}")))?;

        match definition.get("jobType").and_then(|tag| tag.as_str()) {
            Some("orchestrator") => Ok(Box::new(OrchestratorJobHandler::new(self.context.clone()))),
            Some("processing") => Ok(Box::new(ProcessingJobHandler::new(
                self.context.fhir.clone(),
                self.context.change_feed.clone(),
                self.context.sink.clone(),
                self.context.options.resource_types.clone(),
            ))),
            other => Err(JobExecError::fatal(format!(
                "definition carried unusable job type {other:?}"
            ))),
        }
    }
}

/// Drives one orchestration run: sources the sub-job stream for its window,
/// keeps a bounded pool of processing children in flight, and folds completed
/// children into the aggregate result. Every state change is reported as a
/// progress snapshot so a re-leased run resumes instead of restarting.
pub struct OrchestratorJobHandler {
    context: PipelineContext,
}

impl OrchestratorJobHandler {
    pub fn new(context: PipelineContext) -> Self {
        Self { context }
    }

    async fn run_system_scope(
        &self,
        job: &JobInfo,
        input: &OrchestratorJobInputData,
        result: &mut OrchestratorJobResult,
        progress: &ProgressReporter,
        cancelled: &watch::Receiver<bool>,
    ) -> Result<(), JobExecError> {
        let options = &self.context.options;
        let splitter = ProcessingJobSplitter::new(
            self.context.fhir.clone(),
            options.low_bound,
            options.high_bound,
        );

        for resource_type in options.resource_types.clone() {
            let submitted = result
                .submitted_resource_timestamps
                .get(&resource_type)
                .copied();

            if submitted == Some(input.data_end_time) {
                continue;
            }

            // resume from wherever enqueueing previously got to
            let window = TimeWindow::new(
                submitted.or(input.data_start_time),
                input.data_end_time,
            );

            let mut stream = splitter
                .split(&resource_type, window)
                .await
                .map_err(split_error)?;

            while let Some(sub_job) = stream.next().await.map_err(split_error)? {
                self.throttle(result, progress, cancelled).await?;

                let definition = ProcessingJobInputData {
                    job_type: JobType::Processing,
                    trigger_sequence_id: input.trigger_sequence_id,
                    processing_job_sequence_id: result.created_job_count,
                    job_version: input.job_version,
                    resource_type: Some(resource_type.clone()),
                    time_range: Some(sub_job.window),
                    since: input.since,
                    patients: Vec::new(),
                    change_feed_range: None,
                };

                self.submit_child(job, definition, result).await?;
                result
                    .submitted_resource_timestamps
                    .insert(resource_type.clone(), sub_job.window.end);
                report(progress, result)?;
            }
        }

        Ok(())
    }

    async fn run_group_scope(
        &self,
        job: &JobInfo,
        input: &OrchestratorJobInputData,
        result: &mut OrchestratorJobResult,
        progress: &ProgressReporter,
        cancelled: &watch::Receiver<bool>,
    ) -> Result<(), JobExecError> {
        let options = &self.context.options;

        let group_id = options
            .group_id
            .as_deref()
            .ok_or_else(|| JobExecError::fatal("group scope requires a configured group id"))?;

        // the client returns members sorted, which keeps chunk boundaries
        // stable across resumed runs
        let patient_ids = self
            .context
            .fhir
            .group_patient_ids(group_id)
            .await
            .map_err(|err| JobExecError::retriable(err.to_string()))?;

        let chunk_size = options.patients_per_job.max(1);

        for (chunk_index, chunk) in patient_ids.chunks(chunk_size).enumerate() {
            let first_patient_index = chunk_index * chunk_size;
            if first_patient_index < result.next_patient_index {
                continue;
            }

            self.throttle(result, progress, cancelled).await?;

            let stored_versions = self
                .context
                .metadata
                .patient_versions(chunk)
                .await
                .map_err(|err| JobExecError::retriable(err.to_string()))?;

            let patients = chunk
                .iter()
                .map(|patient_id| PatientSlice {
                    patient_id: patient_id.clone(),
                    version_id: stored_versions.get(patient_id).copied().unwrap_or(0),
                })
                .collect();

            let definition = ProcessingJobInputData {
                job_type: JobType::Processing,
                trigger_sequence_id: input.trigger_sequence_id,
                processing_job_sequence_id: result.created_job_count,
                job_version: input.job_version,
                resource_type: None,
                time_range: Some(TimeWindow::new(input.data_start_time, input.data_end_time)),
                since: input.since,
                patients,
                change_feed_range: None,
            };

            self.submit_child(job, definition, result).await?;
            result.next_patient_index = first_patient_index + chunk.len();
            report(progress, result)?;
        }

        Ok(())
    }

    async fn run_change_feed(
        &self,
        job: &JobInfo,
        input: &OrchestratorJobInputData,
        result: &mut OrchestratorJobResult,
        progress: &ProgressReporter,
        cancelled: &watch::Receiver<bool>,
    ) -> Result<(), JobExecError> {
        let options = &self.context.options;

        let client = self
            .context
            .change_feed
            .as_ref()
            .ok_or_else(|| JobExecError::fatal("no change feed source is configured"))?;

        // capture the feed end once so a resumed run re-plans identical
        // chunks
        let end_offset = match result.change_feed_end_offset {
            Some(end_offset) => end_offset,
            None => {
                let latest = client
                    .latest_sequence()
                    .await
                    .map_err(|err| JobExecError::retriable(err.to_string()))?;

                result.change_feed_end_offset = Some(latest);
                report(progress, result)?;
                latest
            }
        };

        let start_offset = match result.submitted_change_feed_offset {
            Some(submitted) => submitted,
            None => self
                .context
                .metadata
                .change_feed_cursor()
                .await
                .map_err(|err| JobExecError::retriable(err.to_string()))?,
        };

        let full_range = OffsetRange {
            start: start_offset,
            end: end_offset,
        };

        for range in crate::split::split_offsets(full_range, options.change_feed_entries_per_job) {
            self.throttle(result, progress, cancelled).await?;

            let definition = ProcessingJobInputData {
                job_type: JobType::Processing,
                trigger_sequence_id: input.trigger_sequence_id,
                processing_job_sequence_id: result.created_job_count,
                job_version: input.job_version,
                resource_type: None,
                time_range: None,
                since: None,
                patients: Vec::new(),
                change_feed_range: Some(range),
            };

            self.submit_child(job, definition, result).await?;
            result.submitted_change_feed_offset = Some(range.end);
            report(progress, result)?;
        }

        Ok(())
    }

    /// Enqueues one child, relying on the queue's definition deduplication to
    /// make replays return the existing job. Only genuinely new children
    /// advance `created_job_count`.
    async fn submit_child(
        &self,
        parent: &JobInfo,
        definition: ProcessingJobInputData,
        result: &mut OrchestratorJobResult,
    ) -> Result<(), JobExecError> {
        let encoded = serde_json::to_string(&definition)
            .map_err(|err| JobExecError::fatal(format!("unserializable definition: {err}")))?;

        let children = self
            .context
            .queue
            .enqueue(self.context.options.queue_type, &[encoded], parent.group_id)
            .await
            .map_err(queue_error)?;

        let child = children
            .first()
            .ok_or_else(|| JobExecError::retriable("enqueue returned no job"))?;

        if result.running_job_ids.insert(child.id) {
            result.created_job_count += 1;
            tracing::info!(
                child = %child.id,
                sequence = definition.processing_job_sequence_id,
                "processing job enqueued"
            );
        }

        Ok(())
    }

    /// Blocks until the running pool is below the in-flight bound, polling
    /// completions while it waits. Above the watermark, completions are also
    /// polled opportunistically without blocking.
    async fn throttle(
        &self,
        result: &mut OrchestratorJobResult,
        progress: &ProgressReporter,
        cancelled: &watch::Receiver<bool>,
    ) -> Result<(), JobExecError> {
        let options = &self.context.options;

        if result.running_job_ids.len() >= options.poll_watermark() {
            self.poll_children(result, progress).await?;
        }

        while result.running_job_ids.len() >= options.max_in_flight.max(1) {
            ensure_live(cancelled)?;
            tokio::time::sleep(options.check_frequency).await;
            self.poll_children(result, progress).await?;
        }

        Ok(())
    }

    /// Looks at every running child once. Completed children are merged,
    /// their staged output committed, and (group scope) their patient
    /// versions recorded. A failed child aborts with a retriable error so
    /// the host re-leases this orchestrator and it resumes from the last
    /// snapshot.
    async fn poll_children(
        &self,
        result: &mut OrchestratorJobResult,
        progress: &ProgressReporter,
    ) -> Result<(), JobExecError> {
        let running: Vec<_> = result.running_job_ids.iter().copied().collect();

        for child_id in running {
            let child = self
                .context
                .queue
                .job_by_id(self.context.options.queue_type, child_id)
                .await
                .map_err(queue_error)?
                .ok_or_else(|| {
                    JobExecError::retriable(format!("processing job {child_id} disappeared"))
                })?;

            match child.status {
                JobStatus::Completed => {
                    let raw = child.result.as_deref().unwrap_or("{}");
                    let child_result: ProcessingJobResult = serde_json::from_str(raw)
                        .map_err(|err| {
                            JobExecError::retriable(format!(
                                "processing job {child_id} returned an unreadable result: {err}"
                            ))
                        })?;

                    self.context
                        .sink
                        .commit(child_id)
                        .await
                        .map_err(|err| JobExecError::retriable(err.to_string()))?;

                    if !child_result.processed_patient_versions.is_empty() {
                        self.context
                            .metadata
                            .upsert_patient_versions(&child_result.processed_patient_versions)
                            .await
                            .map_err(|err| JobExecError::retriable(err.to_string()))?;
                    }

                    result.merge_child(&child_result);
                    result.running_job_ids.remove(&child_id);
                    report(progress, result)?;

                    tracing::info!(child = %child_id, "processing job completed");
                }
                JobStatus::Failed => {
                    return Err(JobExecError::retriable(format!(
                        "processing job {child_id} failed"
                    )));
                }
                JobStatus::Cancelled => return Err(JobExecError::Cancelled),
                JobStatus::Created | JobStatus::Running => (),
            }
        }

        Ok(())
    }
}

#[async_trait]
impl JobHandler for OrchestratorJobHandler {
    async fn run(
        &mut self,
        job: &JobInfo,
        progress: ProgressReporter,
        cancelled: watch::Receiver<bool>,
    ) -> Result<String, JobExecError> {
        let input: OrchestratorJobInputData = serde_json::from_str(&job.definition)
            .map_err(|err| JobExecError::fatal(format!("unreadable definition: {err}")))?;

        let mut result = match job.result.as_deref() {
            Some(raw) if !raw.is_empty() => OrchestratorJobResult::decode(raw)
                .map_err(|err| JobExecError::fatal(format!("unreadable progress: {err}")))?,
            _ => OrchestratorJobResult::default(),
        };

        tracing::info!(
            id = %job.id,
            trigger = input.trigger_sequence_id,
            resumed_children = result.running_job_ids.len(),
            "orchestration starting"
        );

        match (self.context.options.source, self.context.options.scope) {
            (DataSourceKind::Fhir, FilterScope::System) => {
                self.run_system_scope(job, &input, &mut result, &progress, &cancelled)
                    .await?
            }
            (DataSourceKind::Fhir, FilterScope::Group) => {
                self.run_group_scope(job, &input, &mut result, &progress, &cancelled)
                    .await?
            }
            (DataSourceKind::Dicom, _) => {
                self.run_change_feed(job, &input, &mut result, &progress, &cancelled)
                    .await?
            }
        }

        // the stream is exhausted; wait out the stragglers
        while !result.running_job_ids.is_empty() {
            ensure_live(&cancelled)?;
            self.poll_children(&mut result, &progress).await?;

            if !result.running_job_ids.is_empty() {
                tokio::time::sleep(self.context.options.check_frequency).await;
            }
        }

        if self.context.options.source == DataSourceKind::Dicom {
            if let Some(end_offset) = result.change_feed_end_offset {
                self.context
                    .metadata
                    .advance_change_feed_cursor(end_offset)
                    .await
                    .map_err(|err| JobExecError::retriable(err.to_string()))?;
            }
        }

        result.complete_time = Some(time::OffsetDateTime::now_utc());

        let encoded = result
            .encode()
            .map_err(|err| JobExecError::fatal(format!("unserializable result: {err}")))?;
        progress.report(&encoded);

        tracing::info!(
            id = %job.id,
            children = result.created_job_count,
            processed = result.processed_count_in_total,
            "orchestration finished"
        );

        Ok(encoded)
    }
}

fn ensure_live(cancelled: &watch::Receiver<bool>) -> Result<(), JobExecError> {
    if *cancelled.borrow() {
        return Err(JobExecError::Cancelled);
    }

    Ok(())
}

fn report(
    progress: &ProgressReporter,
    result: &OrchestratorJobResult,
) -> Result<(), JobExecError> {
    let snapshot = result
        .encode()
        .map_err(|err| JobExecError::fatal(format!("unserializable progress: {err}")))?;
    progress.report(snapshot);

    Ok(())
}

fn queue_error(err: JobQueueError) -> JobExecError {
    if err.is_retriable() {
        JobExecError::retriable(err.to_string())
    } else {
        JobExecError::fatal(err.to_string())
    }
}

fn split_error(err: SplitError) -> JobExecError {
    if err.is_retriable() {
        JobExecError::retriable(err.to_string())
    } else {
        JobExecError::fatal(err.to_string())
    }
}
