use std::sync::Arc;
use std::time::Duration;

use time::macros::datetime;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::database::custom_types::{GroupId, JobStatus, QueueType};
use crate::fhir::TimeWindow;
use crate::jobs::{JobHost, JobInfo, JobQueueClient, ProgressReporter};
use crate::metadata::{MetadataStore, TriggerStatus};
use crate::orchestrator::{
    DataSourceKind, FilterScope, JobType, OrchestratorJobHandler, OrchestratorJobInputData,
    OrchestratorJobResult, OrchestratorOptions, PipelineContext, PipelineJobFactory,
    ProcessingJobInputData, CURRENT_JOB_VERSION,
};
use crate::scheduler::{SchedulerOptions, SchedulerService};
use crate::split::ProcessingJobSplitter;
use crate::tests::helpers::{test_database, MemorySink, MockFhirServer};

const QUEUE_TYPE: u8 = 1;

struct TestPipeline {
    context: PipelineContext,
    upstream: Arc<MockFhirServer>,
    sink: Arc<MemorySink>,
}

async fn test_pipeline(
    source: DataSourceKind,
    scope: FilterScope,
    low_bound: u64,
    high_bound: u64,
) -> TestPipeline {
    let database = test_database().await;
    let upstream = Arc::new(MockFhirServer::default());
    let sink = Arc::new(MemorySink::default());

    let context = PipelineContext {
        queue: JobQueueClient::new(database.clone()),
        metadata: MetadataStore::new(database.clone()),
        fhir: upstream.clone(),
        change_feed: Some(upstream.clone()),
        sink: sink.clone(),
        options: OrchestratorOptions {
            queue_type: QueueType::from(QUEUE_TYPE),
            source,
            scope,
            resource_types: vec!["Patient".to_string()],
            group_id: Some("study-group".to_string()),
            max_in_flight: 4,
            check_frequency: Duration::from_millis(50),
            low_bound,
            high_bound,
            patients_per_job: 2,
            change_feed_entries_per_job: 100,
        },
    };

    TestPipeline {
        context,
        upstream,
        sink,
    }
}

fn extraction_window() -> TimeWindow {
    TimeWindow::new(
        Some(datetime!(2024-01-01 00:00:00 UTC)),
        datetime!(2024-01-08 00:00:00 UTC),
    )
}

fn orchestrator_input(sequence_id: i64, window: TimeWindow) -> OrchestratorJobInputData {
    OrchestratorJobInputData {
        job_type: JobType::Orchestrator,
        trigger_sequence_id: sequence_id,
        job_version: CURRENT_JOB_VERSION,
        data_start_time: window.start,
        data_end_time: window.end,
        since: None,
    }
}

async fn start_host(context: &PipelineContext) -> (watch::Sender<()>, JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let factory = Arc::new(PipelineJobFactory::new(context.clone()));

    let handle = JobHost::new(
        context.queue.clone(),
        context.options.queue_type,
        factory,
        2,
        Duration::from_secs(30),
        Duration::from_millis(25),
    )
    .start(shutdown_rx)
    .await;

    (shutdown_tx, handle)
}

async fn wait_for_terminal(queue: &JobQueueClient, job: &JobInfo) -> JobInfo {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);

    loop {
        let current = queue
            .job_by_id(job.queue_type, job.id)
            .await
            .expect("lookup")
            .expect("job present");

        if current.status.is_terminal() {
            return current;
        }

        if tokio::time::Instant::now() > deadline {
            panic!("job {} never reached a terminal status", job.id);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn decode_result(job: &JobInfo) -> OrchestratorJobResult {
    OrchestratorJobResult::decode(job.result.as_deref().expect("a result"))
        .expect("result decodes")
}

#[tokio::test]
async fn test_small_window_runs_one_processing_job() {
    let pipeline = test_pipeline(DataSourceKind::Fhir, FilterScope::System, 20_000, 40_000).await;
    pipeline
        .upstream
        .seed_uniform("Patient", extraction_window(), 500);

    let definition =
        serde_json::to_string(&orchestrator_input(1, extraction_window())).expect("definition");
    let jobs = pipeline
        .context
        .queue
        .enqueue(pipeline.context.options.queue_type, &[definition], GroupId::from(1))
        .await
        .expect("enqueue");

    let (shutdown_tx, host_handle) = start_host(&pipeline.context).await;

    let finished = wait_for_terminal(&pipeline.context.queue, &jobs[0]).await;
    assert_eq!(finished.status, JobStatus::Completed);

    let result = decode_result(&finished);
    assert_eq!(result.created_job_count, 1);
    assert!(result.running_job_ids.is_empty());
    assert_eq!(result.total_resource_counts["Patient"], 500);
    assert_eq!(result.processed_resource_counts["Patient"], 500);
    assert_eq!(result.processed_count_in_total, 500);
    assert!(result.complete_time.is_some());
    assert_eq!(
        result.submitted_resource_timestamps["Patient"],
        extraction_window().end
    );

    // exactly one child, staged then committed
    assert_eq!(pipeline.sink.committed_jobs().len(), 1);
    assert_eq!(pipeline.sink.committed_records(), 500);
    assert!(pipeline.sink.pending_jobs().is_empty());

    let _ = shutdown_tx.send(());
    let _ = host_handle.await;
}

#[tokio::test]
async fn test_oversized_window_fans_out_and_aggregates() {
    let pipeline = test_pipeline(DataSourceKind::Fhir, FilterScope::System, 200, 400).await;
    pipeline
        .upstream
        .seed_uniform("Patient", extraction_window(), 1000);

    let definition =
        serde_json::to_string(&orchestrator_input(2, extraction_window())).expect("definition");
    let jobs = pipeline
        .context
        .queue
        .enqueue(pipeline.context.options.queue_type, &[definition], GroupId::from(2))
        .await
        .expect("enqueue");

    let (shutdown_tx, host_handle) = start_host(&pipeline.context).await;

    let finished = wait_for_terminal(&pipeline.context.queue, &jobs[0]).await;
    assert_eq!(finished.status, JobStatus::Completed);

    let result = decode_result(&finished);
    assert!(result.created_job_count >= 3);
    assert_eq!(result.processed_count_in_total, 1000);
    assert_eq!(result.total_resource_counts["Patient"], 1000);
    assert_eq!(
        pipeline.sink.committed_jobs().len(),
        result.created_job_count as usize
    );
    assert_eq!(pipeline.sink.committed_records(), 1000);

    let _ = shutdown_tx.send(());
    let _ = host_handle.await;
}

#[tokio::test]
async fn test_orchestrator_resume_converges_to_the_same_result() {
    // reference run on its own environment
    let reference = test_pipeline(DataSourceKind::Fhir, FilterScope::System, 200, 400).await;
    reference
        .upstream
        .seed_uniform("Patient", extraction_window(), 1000);

    let definition =
        serde_json::to_string(&orchestrator_input(3, extraction_window())).expect("definition");
    let jobs = reference
        .context
        .queue
        .enqueue(reference.context.options.queue_type, &[definition.clone()], GroupId::from(3))
        .await
        .expect("enqueue");

    let (reference_shutdown, reference_handle) = start_host(&reference.context).await;
    let reference_job = wait_for_terminal(&reference.context.queue, &jobs[0]).await;
    let reference_result = decode_result(&reference_job);
    let _ = reference_shutdown.send(());
    let _ = reference_handle.await;

    // identical environment, but the orchestrator "crashed" after its first
    // child: resume from a snapshot holding one enqueued child and an
    // advanced cursor
    let resumed = test_pipeline(DataSourceKind::Fhir, FilterScope::System, 200, 400).await;
    resumed
        .upstream
        .seed_uniform("Patient", extraction_window(), 1000);

    // take the orchestrator's lease the way a recovering worker would; the
    // orchestrator message must be the only one in the queue at this point
    resumed
        .context
        .queue
        .enqueue(resumed.context.options.queue_type, &[definition], GroupId::from(3))
        .await
        .expect("enqueue");
    let mut orchestrator_job = resumed
        .context
        .queue
        .dequeue(resumed.context.options.queue_type, "resume-test", Duration::from_secs(60))
        .await
        .expect("dequeue")
        .expect("the orchestrator job");

    let splitter = ProcessingJobSplitter::new(resumed.upstream.clone(), 200, 400);
    let first_sub_job = splitter
        .split("Patient", extraction_window())
        .await
        .expect("split")
        .next()
        .await
        .expect("first pull")
        .expect("a sub-job");

    let first_child_definition = ProcessingJobInputData {
        job_type: JobType::Processing,
        trigger_sequence_id: 3,
        processing_job_sequence_id: 0,
        job_version: CURRENT_JOB_VERSION,
        resource_type: Some("Patient".to_string()),
        time_range: Some(first_sub_job.window),
        since: None,
        patients: Vec::new(),
        change_feed_range: None,
    };
    let first_children = resumed
        .context
        .queue
        .enqueue(
            resumed.context.options.queue_type,
            &[serde_json::to_string(&first_child_definition).expect("definition")],
            GroupId::from(3),
        )
        .await
        .expect("child enqueue");

    let mut snapshot = OrchestratorJobResult::default();
    snapshot.created_job_count = 1;
    snapshot.running_job_ids.insert(first_children[0].id);
    snapshot
        .submitted_resource_timestamps
        .insert("Patient".to_string(), first_sub_job.window.end);

    orchestrator_job.result = Some(snapshot.encode().expect("snapshot"));
    resumed
        .context
        .queue
        .keep_alive(&orchestrator_job)
        .await
        .expect("persist snapshot");

    let (resumed_shutdown, resumed_handle) = start_host(&resumed.context).await;

    let mut handler = OrchestratorJobHandler::new(resumed.context.clone());
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let encoded = crate::jobs::JobHandler::run(
        &mut handler,
        &orchestrator_job,
        ProgressReporter::new(),
        cancel_rx,
    )
    .await
    .expect("resumed orchestration");

    let resumed_result = OrchestratorJobResult::decode(&encoded).expect("result decodes");

    // the resumed run must converge on the reference aggregate
    assert_eq!(
        resumed_result.created_job_count,
        reference_result.created_job_count
    );
    assert_eq!(
        resumed_result.processed_count_in_total,
        reference_result.processed_count_in_total
    );
    assert_eq!(
        resumed_result.total_resource_counts,
        reference_result.total_resource_counts
    );
    assert_eq!(resumed.sink.committed_records(), 1000);

    let _ = resumed_shutdown.send(());
    let _ = resumed_handle.await;
}

#[tokio::test]
async fn test_group_scope_extracts_changed_compartments() {
    let mut pipeline = test_pipeline(DataSourceKind::Fhir, FilterScope::Group, 200, 400).await;
    pipeline.context.options.resource_types =
        vec!["Patient".to_string(), "Observation".to_string()];

    pipeline
        .upstream
        .seed_group(&[("alice", 2), ("bob", 1), ("carol", 5)]);
    pipeline.upstream.seed_compartment("bob", "Observation", 3);
    pipeline.upstream.seed_compartment("carol", "Observation", 2);

    // alice was extracted before at her current version and is skipped
    let mut known = std::collections::BTreeMap::new();
    known.insert("alice".to_string(), 2i64);
    pipeline
        .context
        .metadata
        .upsert_patient_versions(&known)
        .await
        .expect("seed versions");

    let definition =
        serde_json::to_string(&orchestrator_input(4, extraction_window())).expect("definition");
    let jobs = pipeline
        .context
        .queue
        .enqueue(pipeline.context.options.queue_type, &[definition], GroupId::from(4))
        .await
        .expect("enqueue");

    let (shutdown_tx, host_handle) = start_host(&pipeline.context).await;

    let finished = wait_for_terminal(&pipeline.context.queue, &jobs[0]).await;
    assert_eq!(finished.status, JobStatus::Completed);

    let result = decode_result(&finished);
    // three patients at two per job
    assert_eq!(result.created_job_count, 2);
    assert_eq!(result.next_patient_index, 3);
    assert_eq!(result.skipped_resource_counts["Patient"], 1);
    assert_eq!(result.processed_resource_counts["Patient"], 2);
    assert_eq!(result.processed_resource_counts["Observation"], 5);

    // every member's version is recorded for the next incremental pass
    let lookup = vec![
        "alice".to_string(),
        "bob".to_string(),
        "carol".to_string(),
    ];
    let versions = pipeline
        .context
        .metadata
        .patient_versions(&lookup)
        .await
        .expect("versions");
    assert_eq!(versions["alice"], 2);
    assert_eq!(versions["bob"], 1);
    assert_eq!(versions["carol"], 5);

    let _ = shutdown_tx.send(());
    let _ = host_handle.await;
}

#[tokio::test]
async fn test_change_feed_scope_chunks_by_offset() {
    let pipeline = test_pipeline(DataSourceKind::Dicom, FilterScope::System, 200, 400).await;
    pipeline.upstream.seed_change_feed(250);

    let definition =
        serde_json::to_string(&orchestrator_input(5, extraction_window())).expect("definition");
    let jobs = pipeline
        .context
        .queue
        .enqueue(pipeline.context.options.queue_type, &[definition], GroupId::from(5))
        .await
        .expect("enqueue");

    let (shutdown_tx, host_handle) = start_host(&pipeline.context).await;

    let finished = wait_for_terminal(&pipeline.context.queue, &jobs[0]).await;
    assert_eq!(finished.status, JobStatus::Completed);

    let result = decode_result(&finished);
    assert_eq!(result.created_job_count, 3);
    assert_eq!(result.processed_resource_counts["Dicom"], 250);
    assert_eq!(result.change_feed_end_offset, Some(250));

    // the pipeline cursor advanced so the next trigger starts where this one
    // stopped
    let cursor = pipeline
        .context
        .metadata
        .change_feed_cursor()
        .await
        .expect("cursor");
    assert_eq!(cursor, 250);

    let _ = shutdown_tx.send(());
    let _ = host_handle.await;
}

#[tokio::test]
async fn test_scheduler_advances_the_sliding_window() {
    let database = test_database().await;
    let queue = JobQueueClient::new(database.clone());
    let metadata = MetadataStore::new(database.clone());

    let options = SchedulerOptions {
        queue_type: QueueType::from(QUEUE_TYPE),
        initial_interval: Duration::ZERO,
        incremental_interval: Duration::ZERO,
        window_lag: Duration::ZERO,
        max_window: Duration::from_secs(86_400),
        since: None,
    };

    let mut service = SchedulerService::new(metadata.clone(), queue.clone(), options);

    // first leadership term plans the initial window
    service = run_scheduler_once(service).await;

    let (trigger, _) = metadata
        .current_trigger()
        .await
        .expect("trigger lookup")
        .expect("a trigger");
    assert_eq!(trigger.sequence_id, 0);
    assert_eq!(trigger.status, TriggerStatus::Running);
    assert!(trigger.window_start.is_none());

    let orchestrator_id = trigger.orchestrator_job_id.expect("an orchestrator job");
    let first_window_end = trigger.window_end;

    // the orchestrator finishes; a later term closes the trigger
    let orchestrator_job = queue
        .dequeue(QueueType::from(QUEUE_TYPE), "test-worker", Duration::from_secs(30))
        .await
        .expect("dequeue")
        .expect("the orchestrator job");
    assert_eq!(orchestrator_job.id, orchestrator_id);
    queue.complete(&orchestrator_job, false).await.expect("complete");

    service = run_scheduler_once(service).await;

    let (closed, _) = metadata
        .current_trigger()
        .await
        .expect("trigger lookup")
        .expect("a trigger");
    assert_eq!(closed.sequence_id, 0);
    assert_eq!(closed.status, TriggerStatus::Completed);

    // enough wall clock passes for the next window to open
    tokio::time::sleep(Duration::from_millis(50)).await;
    service = run_scheduler_once(service).await;

    let (advanced, _) = metadata
        .current_trigger()
        .await
        .expect("trigger lookup")
        .expect("a trigger");
    assert_eq!(advanced.sequence_id, 1);
    assert_eq!(advanced.status, TriggerStatus::Running);
    assert_eq!(advanced.window_start, Some(first_window_end));
    assert_ne!(advanced.orchestrator_job_id, Some(orchestrator_id));

    drop(service);
}

/// Runs the scheduler long enough for one tick, then shuts it down and hands
/// the service back so the next phase reuses the same lease holder.
async fn run_scheduler_once(mut service: SchedulerService) -> SchedulerService {
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    let runner = tokio::spawn(async move {
        service.run(shutdown_rx).await;
        service
    });

    tokio::time::sleep(Duration::from_millis(250)).await;
    let _ = shutdown_tx.send(());

    runner.await.expect("scheduler task")
}

// the timestamps the orchestrator persists for resume must line up with what
// the splitter reports, or a resumed run would re-cover ground
#[tokio::test]
async fn test_resume_cursor_matches_splitter_boundaries() {
    let pipeline = test_pipeline(DataSourceKind::Fhir, FilterScope::System, 200, 400).await;
    pipeline
        .upstream
        .seed_uniform("Patient", extraction_window(), 1000);

    let splitter = ProcessingJobSplitter::new(pipeline.upstream.clone(), 200, 400);
    let mut stream = splitter
        .split("Patient", extraction_window())
        .await
        .expect("split");

    let mut boundaries: Vec<OffsetDateTime> = Vec::new();
    while let Some(sub_job) = stream.next().await.expect("next") {
        boundaries.push(sub_job.window.end);
    }

    assert_eq!(boundaries.last().copied(), Some(extraction_window().end));

    let strictly_increasing = boundaries.windows(2).all(|pair| pair[0] < pair[1]);
    assert!(strictly_increasing);
}
