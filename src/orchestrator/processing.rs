use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::fhir::{
    ChangeFeedClient, FhirApiError, FhirSearchClient, OffsetRange, TimeWindow,
};
use crate::jobs::{JobExecError, JobHandler, JobInfo, ProgressReporter};
use crate::orchestrator::input::JobType;
use crate::sink::DataSink;

/// Resource-type label used for staged DICOM change-feed entries, which have
/// no FHIR resource type of their own.
const CHANGE_FEED_RESOURCE_LABEL: &str = "Dicom";

/// Definition of one processing job. Exactly one of the three extraction
/// shapes is populated: a (resource type, time range) slice for system scope,
/// a patient chunk for group scope, or a change-feed offset range for DICOM.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingJobInputData {
    pub job_type: JobType,
    pub trigger_sequence_id: i64,
    pub processing_job_sequence_id: u64,
    pub job_version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeWindow>,

    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub since: Option<OffsetDateTime>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patients: Vec<PatientSlice>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_feed_range: Option<OffsetRange>,
}

/// One patient of a group-scope chunk together with the version the pipeline
/// last extracted. Version zero means the patient was never extracted.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientSlice {
    pub patient_id: String,
    pub version_id: i64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessingJobResult {
    pub total_resource_counts: BTreeMap<String, u64>,
    pub processed_resource_counts: BTreeMap<String, u64>,
    pub skipped_resource_counts: BTreeMap<String, u64>,

    pub processed_count_in_total: u64,
    pub processed_data_size_in_total: u64,

    /// Patient versions observed during extraction, upserted into the
    /// metadata store by the orchestrator when this child completes.
    pub processed_patient_versions: BTreeMap<String, i64>,
}

/// Executes one processing job: pull the slice described by the definition
/// from the upstream and stage it with the sink. Staged output is only
/// published when the orchestrator observes this job as completed.
pub struct ProcessingJobHandler {
    fhir: Arc<dyn FhirSearchClient>,
    change_feed: Option<Arc<dyn ChangeFeedClient>>,
    sink: Arc<dyn DataSink>,
    resource_types: Vec<String>,
}

impl ProcessingJobHandler {
    pub fn new(
        fhir: Arc<dyn FhirSearchClient>,
        change_feed: Option<Arc<dyn ChangeFeedClient>>,
        sink: Arc<dyn DataSink>,
        resource_types: Vec<String>,
    ) -> Self {
        Self {
            fhir,
            change_feed,
            sink,
            resource_types,
        }
    }

    async fn extract_window(
        &self,
        job: &JobInfo,
        resource_type: &str,
        window: TimeWindow,
        result: &mut ProcessingJobResult,
        progress: &ProgressReporter,
        cancelled: &watch::Receiver<bool>,
    ) -> Result<(), JobExecError> {
        let mut continuation = None;

        loop {
            ensure_live(cancelled)?;

            let page = self
                .fhir
                .page(resource_type, window, continuation)
                .await
                .map_err(api_error)?;

            if !page.resources.is_empty() {
                let staged = self
                    .sink
                    .stage(job.id, resource_type, &page.resources)
                    .await
                    .map_err(|err| JobExecError::retriable(err.to_string()))?;

                let count = page.resources.len() as u64;
                *result
                    .total_resource_counts
                    .entry(resource_type.to_string())
                    .or_default() += count;
                *result
                    .processed_resource_counts
                    .entry(resource_type.to_string())
                    .or_default() += count;
                result.processed_count_in_total += count;
                result.processed_data_size_in_total += staged;

                report(progress, result)?;
            }

            continuation = page.continuation;
            if continuation.is_none() {
                return Ok(());
            }
        }
    }

    async fn extract_patients(
        &self,
        job: &JobInfo,
        input: &ProcessingJobInputData,
        result: &mut ProcessingJobResult,
        progress: &ProgressReporter,
        cancelled: &watch::Receiver<bool>,
    ) -> Result<(), JobExecError> {
        let window = effective_window(input)?;

        for slice in input.patients.iter() {
            ensure_live(cancelled)?;

            let patient = match self.fhir.patient(&slice.patient_id).await.map_err(api_error)? {
                Some(patient) => patient,
                None => {
                    // dropped from the upstream since the group was resolved
                    *result
                        .skipped_resource_counts
                        .entry("Patient".to_string())
                        .or_default() += 1;
                    continue;
                }
            };

            let current_version = patient_version(&patient);

            if slice.version_id != 0 && current_version == slice.version_id {
                // unchanged since the last extraction; the whole compartment
                // is skipped
                *result
                    .skipped_resource_counts
                    .entry("Patient".to_string())
                    .or_default() += 1;
                result
                    .processed_patient_versions
                    .insert(slice.patient_id.clone(), current_version);
                continue;
            }

            let staged = self
                .sink
                .stage(job.id, "Patient", std::slice::from_ref(&patient))
                .await
                .map_err(|err| JobExecError::retriable(err.to_string()))?;

            *result
                .total_resource_counts
                .entry("Patient".to_string())
                .or_default() += 1;
            *result
                .processed_resource_counts
                .entry("Patient".to_string())
                .or_default() += 1;
            result.processed_count_in_total += 1;
            result.processed_data_size_in_total += staged;

            for resource_type in self.resource_types.iter() {
                if resource_type == "Patient" {
                    continue;
                }

                self.extract_compartment(
                    job,
                    &slice.patient_id,
                    resource_type,
                    window,
                    result,
                    progress,
                    cancelled,
                )
                .await?;
            }

            result
                .processed_patient_versions
                .insert(slice.patient_id.clone(), current_version);
            report(progress, result)?;
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn extract_compartment(
        &self,
        job: &JobInfo,
        patient_id: &str,
        resource_type: &str,
        window: TimeWindow,
        result: &mut ProcessingJobResult,
        progress: &ProgressReporter,
        cancelled: &watch::Receiver<bool>,
    ) -> Result<(), JobExecError> {
        let mut continuation = None;

        loop {
            ensure_live(cancelled)?;

            let page = self
                .fhir
                .patient_resources(patient_id, resource_type, window, continuation)
                .await
                .map_err(api_error)?;

            if !page.resources.is_empty() {
                let staged = self
                    .sink
                    .stage(job.id, resource_type, &page.resources)
                    .await
                    .map_err(|err| JobExecError::retriable(err.to_string()))?;

                let count = page.resources.len() as u64;
                *result
                    .total_resource_counts
                    .entry(resource_type.to_string())
                    .or_default() += count;
                *result
                    .processed_resource_counts
                    .entry(resource_type.to_string())
                    .or_default() += count;
                result.processed_count_in_total += count;
                result.processed_data_size_in_total += staged;

                report(progress, result)?;
            }

            continuation = page.continuation;
            if continuation.is_none() {
                return Ok(());
            }
        }
    }

    async fn extract_change_feed(
        &self,
        job: &JobInfo,
        range: OffsetRange,
        result: &mut ProcessingJobResult,
        progress: &ProgressReporter,
        cancelled: &watch::Receiver<bool>,
    ) -> Result<(), JobExecError> {
        ensure_live(cancelled)?;

        let client = self
            .change_feed
            .as_ref()
            .ok_or_else(|| JobExecError::fatal("no change feed source is configured"))?;

        let entries = client.entries(range).await.map_err(api_error)?;

        if !entries.is_empty() {
            let staged = self
                .sink
                .stage(job.id, CHANGE_FEED_RESOURCE_LABEL, &entries)
                .await
                .map_err(|err| JobExecError::retriable(err.to_string()))?;

            let count = entries.len() as u64;
            *result
                .total_resource_counts
                .entry(CHANGE_FEED_RESOURCE_LABEL.to_string())
                .or_default() += count;
            *result
                .processed_resource_counts
                .entry(CHANGE_FEED_RESOURCE_LABEL.to_string())
                .or_default() += count;
            result.processed_count_in_total += count;
            result.processed_data_size_in_total += staged;

            report(progress, result)?;
        }

        Ok(())
    }
}

#[async_trait]
impl JobHandler for ProcessingJobHandler {
    async fn run(
        &mut self,
        job: &JobInfo,
        progress: ProgressReporter,
        cancelled: watch::Receiver<bool>,
    ) -> Result<String, JobExecError> {
        let input: ProcessingJobInputData = serde_json::from_str(&job.definition)
            .map_err(|err| JobExecError::fatal(format!("unreadable definition: {err}")))?;

        // a re-leased processing job restarts its slice from scratch; the
        // at-least-once staging it produces is resolved by the idempotent
        // per-job commit downstream
        let mut result = ProcessingJobResult::default();

        if let Some(resource_type) = &input.resource_type {
            let window = effective_window(&input)?;
            self.extract_window(job, resource_type, window, &mut result, &progress, &cancelled)
                .await?;
        } else if !input.patients.is_empty() {
            self.extract_patients(job, &input, &mut result, &progress, &cancelled)
                .await?;
        } else if let Some(range) = input.change_feed_range {
            self.extract_change_feed(job, range, &mut result, &progress, &cancelled)
                .await?;
        } else {
            return Err(JobExecError::fatal("definition described nothing to extract"));
        }

        serde_json::to_string(&result)
            .map_err(|err| JobExecError::fatal(format!("unserializable result: {err}")))
    }
}

fn effective_window(input: &ProcessingJobInputData) -> Result<TimeWindow, JobExecError> {
    let window = input
        .time_range
        .ok_or_else(|| JobExecError::fatal("definition carried no time range"))?;

    let start = match (window.start, input.since) {
        (Some(start), Some(since)) => Some(start.max(since)),
        (None, since) => since,
        (start, None) => start,
    };

    Ok(TimeWindow::new(start, window.end))
}

fn patient_version(patient: &serde_json::Value) -> i64 {
    patient
        .get("meta")
        .and_then(|meta| meta.get("versionId"))
        .and_then(|version| version.as_str())
        .and_then(|version| version.parse().ok())
        .unwrap_or(1)
}

fn api_error(err: FhirApiError) -> JobExecError {
    if err.is_retriable() {
        JobExecError::retriable(err.to_string())
    } else {
        JobExecError::fatal(err.to_string())
    }
}

fn ensure_live(cancelled: &watch::Receiver<bool>) -> Result<(), JobExecError> {
    if *cancelled.borrow() {
        return Err(JobExecError::Cancelled);
    }

    Ok(())
}

fn report(progress: &ProgressReporter, result: &ProcessingJobResult) -> Result<(), JobExecError> {
    let snapshot = serde_json::to_string(result)
        .map_err(|err| JobExecError::fatal(format!("unserializable progress: {err}")))?;
    progress.report(snapshot);

    Ok(())
}
