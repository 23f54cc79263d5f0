use std::time::Duration;

use crate::database::custom_types::{GroupId, JobStatus, QueueType};
use crate::jobs::{JobQueueClient, JobQueueError};
use crate::tests::helpers::test_database;

const HEARTBEAT: Duration = Duration::from_secs(30);

fn queue_type() -> QueueType {
    QueueType::from(3)
}

fn definitions(count: usize) -> Vec<String> {
    (0..count)
        .map(|idx| format!("{{\"slice\":{idx}}}"))
        .collect()
}

#[tokio::test]
async fn test_concurrent_enqueue_of_identical_definitions_is_idempotent() {
    let database = test_database().await;
    let group = GroupId::from(7);

    let agent_a = JobQueueClient::new(database.clone());
    let agent_b = JobQueueClient::new(database.clone());

    let defs = definitions(5);
    let (first, second) = tokio::join!(
        agent_a.enqueue(queue_type(), &defs, group),
        agent_b.enqueue(queue_type(), &defs, group),
    );

    let first = first.expect("first enqueue");
    let second = second.expect("second enqueue");

    let mut first_ids: Vec<_> = first.iter().map(|job| job.id).collect();
    let mut second_ids: Vec<_> = second.iter().map(|job| job.id).collect();
    first_ids.sort();
    second_ids.sort();

    assert_eq!(first_ids.len(), 5);
    assert_eq!(first_ids, second_ids);

    // a later replay still resolves to the same five jobs
    let replay = agent_a
        .enqueue(queue_type(), &defs, group)
        .await
        .expect("replay enqueue");
    let mut replay_ids: Vec<_> = replay.iter().map(|job| job.id).collect();
    replay_ids.sort();
    assert_eq!(replay_ids, first_ids);
}

#[tokio::test]
async fn test_enqueue_input_validation() {
    let database = test_database().await;
    let queue = JobQueueClient::new(database);

    let oversized = definitions(51);
    let err = queue
        .enqueue(queue_type(), &oversized, GroupId::from(1))
        .await
        .unwrap_err();
    assert!(matches!(err, JobQueueError::TooManyDefinitions(51, 50)));

    let duplicated = vec!["{\"same\":1}".to_string(), "{\"same\":1}".to_string()];
    let err = queue
        .enqueue(queue_type(), &duplicated, GroupId::from(1))
        .await
        .unwrap_err();
    assert!(matches!(err, JobQueueError::DuplicateDefinition));
}

#[tokio::test]
async fn test_each_job_is_delivered_once() {
    let database = test_database().await;
    let queue = JobQueueClient::new(database);

    queue
        .enqueue(queue_type(), &definitions(3), GroupId::from(2))
        .await
        .expect("enqueue");

    let mut delivered = Vec::new();
    for _ in 0..3 {
        let job = queue
            .dequeue(queue_type(), "worker-a", HEARTBEAT)
            .await
            .expect("dequeue")
            .expect("a job");
        assert_eq!(job.status, JobStatus::Running);
        delivered.push(job.id);
    }

    delivered.sort();
    delivered.dedup();
    assert_eq!(delivered.len(), 3);

    // everything is leased; nothing further to deliver
    let empty = queue
        .dequeue(queue_type(), "worker-a", HEARTBEAT)
        .await
        .expect("dequeue");
    assert!(empty.is_none());
}

#[tokio::test]
async fn test_completed_job_is_never_redelivered() {
    let database = test_database().await;
    let queue = JobQueueClient::new(database);

    queue
        .enqueue(queue_type(), &definitions(1), GroupId::from(4))
        .await
        .expect("enqueue");

    let mut job = queue
        .dequeue(queue_type(), "worker-a", HEARTBEAT)
        .await
        .expect("dequeue")
        .expect("a job");

    job.result = Some("{\"done\":true}".to_string());
    queue.complete(&job, false).await.expect("complete");

    let stored = queue
        .job_by_id(queue_type(), job.id)
        .await
        .expect("lookup")
        .expect("present");
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.result.as_deref(), Some("{\"done\":true}"));

    let followup = queue
        .dequeue(queue_type(), "worker-a", HEARTBEAT)
        .await
        .expect("dequeue");
    assert!(followup.is_none());
}

#[tokio::test]
async fn test_keep_alive_persists_progress_snapshots() {
    let database = test_database().await;
    let queue = JobQueueClient::new(database);

    queue
        .enqueue(queue_type(), &definitions(1), GroupId::from(5))
        .await
        .expect("enqueue");

    let mut job = queue
        .dequeue(queue_type(), "worker-a", HEARTBEAT)
        .await
        .expect("dequeue")
        .expect("a job");

    job.result = Some("{\"checkpoint\":1}".to_string());
    let should_cancel = queue.keep_alive(&job).await.expect("keep alive");
    assert!(!should_cancel);

    let stored = queue
        .job_by_id(queue_type(), job.id)
        .await
        .expect("lookup")
        .expect("present");
    assert_eq!(stored.result.as_deref(), Some("{\"checkpoint\":1}"));
    assert_eq!(stored.status, JobStatus::Running);
}

#[tokio::test]
async fn test_lapsed_lease_can_be_taken_over() {
    let database = test_database().await;
    let queue = JobQueueClient::new(database);

    queue
        .enqueue(queue_type(), &definitions(1), GroupId::from(6))
        .await
        .expect("enqueue");

    let crashed_worker_job = queue
        .dequeue(queue_type(), "worker-a", Duration::from_secs(1))
        .await
        .expect("dequeue")
        .expect("a job");

    // within the heartbeat window the lease holds and the message is hidden
    let contested = queue
        .dequeue(queue_type(), "worker-b", Duration::from_secs(1))
        .await
        .expect("dequeue");
    assert!(contested.is_none());

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let recovered = queue
        .dequeue(queue_type(), "worker-b", HEARTBEAT)
        .await
        .expect("dequeue")
        .expect("the reappeared job");
    assert_eq!(recovered.id, crashed_worker_job.id);
    assert!(recovered.version > crashed_worker_job.version);

    // the crashed worker's lease is dead on both paths
    let stale_heartbeat = queue.keep_alive(&crashed_worker_job).await.unwrap_err();
    assert!(matches!(stale_heartbeat, JobQueueError::JobNotExist));

    let stale_complete = queue.complete(&crashed_worker_job, false).await.unwrap_err();
    assert!(matches!(stale_complete, JobQueueError::JobNotExist));

    // the new holder is unaffected
    queue.keep_alive(&recovered).await.expect("fresh lease");
}

#[tokio::test]
async fn test_group_cancellation_reaches_every_member() {
    let database = test_database().await;
    let queue = JobQueueClient::new(database);
    let group = GroupId::from(42);

    let jobs = queue
        .enqueue(queue_type(), &definitions(10), group)
        .await
        .expect("enqueue");

    // one member is already running when the cancellation lands
    let running = queue
        .dequeue(queue_type(), "worker-a", HEARTBEAT)
        .await
        .expect("dequeue")
        .expect("a job");

    queue
        .cancel_by_group_id(queue_type(), group)
        .await
        .expect("cancel group");

    for job in jobs.iter() {
        let stored = queue
            .job_by_id(queue_type(), job.id)
            .await
            .expect("lookup")
            .expect("present");

        assert!(stored.cancel_requested);
        if stored.id == running.id {
            assert_eq!(stored.status, JobStatus::Running);
        } else {
            // never dispatched, so cancellation is immediate
            assert_eq!(stored.status, JobStatus::Cancelled);
        }
    }

    // the running worker observes the flag on its next heartbeat and
    // completes as cancelled
    let should_cancel = queue.keep_alive(&running).await.expect("keep alive");
    assert!(should_cancel);

    queue.complete(&running, false).await.expect("complete");
    let finished = queue
        .job_by_id(queue_type(), running.id)
        .await
        .expect("lookup")
        .expect("present");
    assert_eq!(finished.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_failed_completion_cancels_siblings_on_request() {
    let database = test_database().await;
    let queue = JobQueueClient::new(database);
    let group = GroupId::from(9);

    let jobs = queue
        .enqueue(queue_type(), &definitions(2), group)
        .await
        .expect("enqueue");

    let mut failing = queue
        .dequeue(queue_type(), "worker-a", HEARTBEAT)
        .await
        .expect("dequeue")
        .expect("a job");

    failing.status = JobStatus::Failed;
    queue.complete(&failing, true).await.expect("complete");

    for job in jobs.iter() {
        let stored = queue
            .job_by_id(queue_type(), job.id)
            .await
            .expect("lookup")
            .expect("present");

        if stored.id == failing.id {
            assert_eq!(stored.status, JobStatus::Failed);
        } else {
            assert_eq!(stored.status, JobStatus::Cancelled);
        }
    }
}

#[tokio::test]
async fn test_cancelled_created_job_is_discarded_at_dequeue() {
    let database = test_database().await;
    let queue = JobQueueClient::new(database);

    let jobs = queue
        .enqueue(queue_type(), &definitions(1), GroupId::from(11))
        .await
        .expect("enqueue");

    queue
        .cancel_by_id(queue_type(), jobs[0].id)
        .await
        .expect("cancel");

    // the message still exists but points at a terminal job; dequeue
    // discards it and reports what happened
    let outcome = queue.dequeue(queue_type(), "worker-a", HEARTBEAT).await;
    assert!(matches!(outcome, Err(JobQueueError::AlreadyFinished(id)) if id == jobs[0].id));

    let afterwards = queue
        .dequeue(queue_type(), "worker-a", HEARTBEAT)
        .await
        .expect("dequeue");
    assert!(afterwards.is_none());
}
