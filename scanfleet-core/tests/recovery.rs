use std::sync::Arc;

use chrono::{Duration, Utc};
use scanfleet_core::dispatch::{ChunkState, ChunkStatus, ClaimRequest, ProgressStore, UnitClaim, UnitQueue};
use scanfleet_core::job::{JobRecord, JobRepository, JobStatus};
use scanfleet_core::store::MemoryStore;
use scanfleet_core::worker::WorkerStatus;
use scanfleet_core::{Coordinator, CoordinatorConfig, JobId, Result};
use serde_json::json;

fn coordinator(max_retries: u32) -> Coordinator<MemoryStore> {
    let mut config = CoordinatorConfig::default();
    config.recovery.max_retries = max_retries;
    Coordinator::new(Arc::new(MemoryStore::new()), config).expect("valid config")
}

async fn single_unit_job(coordinator: &Coordinator<MemoryStore>) -> JobId {
    let job = coordinator
        .jobs()
        .create_job(JobRecord::new("ws", "recover-me", "a.example.com", json!({})))
        .await
        .expect("create");
    coordinator.jobs().start_job(job.id).await.expect("start");
    job.id
}

async fn claim(coordinator: &Coordinator<MemoryStore>, worker: &str) -> UnitClaim {
    coordinator
        .jobs()
        .claim_next(&ClaimRequest::new(worker))
        .await
        .expect("claim")
        .expect("unit available")
}

#[tokio::test]
async fn units_of_silent_workers_are_requeued() {
    let coordinator = coordinator(3);
    let id = single_unit_job(&coordinator).await;
    coordinator
        .workers()
        .report_heartbeat(WorkerStatus::new("w1").with_concurrency(4))
        .await
        .expect("heartbeat");
    let lost = claim(&coordinator, "w1").await;

    let sweeper = coordinator.recovery();
    let quiet = sweeper.sweep_at(Utc::now()).await.expect("sweep");
    assert_eq!(quiet.inspected, 1);
    assert!(quiet.is_idle());

    let report = sweeper
        .sweep_at(Utc::now() + Duration::seconds(46))
        .await
        .expect("sweep");
    assert_eq!(report.requeued, 1);

    let progress = coordinator.jobs().progress(id).await.expect("progress");
    assert_eq!(progress.units[0].status, ChunkState::Queued);
    assert_eq!(progress.units[0].attempt, 1);
    assert!(
        progress.units[0]
            .error_msg
            .as_deref()
            .is_some_and(|msg| msg.contains("w1 stopped reporting"))
    );

    let retried = claim(&coordinator, "w2").await;
    assert_eq!(retried.unit.unit_id, lost.unit.unit_id);
    assert_eq!(retried.unit.attempt, 1);
}

#[tokio::test]
async fn idle_claims_are_recovered_after_the_inactivity_window() {
    let coordinator = coordinator(3);
    single_unit_job(&coordinator).await;
    let held = claim(&coordinator, "unregistered").await;

    let sweeper = coordinator.recovery();
    let within = sweeper
        .sweep_at(Utc::now() + Duration::seconds(300))
        .await
        .expect("sweep");
    assert!(within.is_idle());

    assert!(coordinator.jobs().touch(held.unit_id()).await.expect("touch"));
    let report = sweeper
        .sweep_at(Utc::now() + Duration::seconds(601))
        .await
        .expect("sweep");
    assert_eq!(report.requeued, 1);
    assert!(!coordinator.jobs().touch(held.unit_id()).await.expect("touch"));
}

#[tokio::test]
async fn exhausted_retries_fail_the_unit_and_the_job() {
    let coordinator = coordinator(1);
    let id = single_unit_job(&coordinator).await;
    let sweeper = coordinator.recovery();

    claim(&coordinator, "ghost").await;
    let first = sweeper
        .sweep_at(Utc::now() + Duration::seconds(601))
        .await
        .expect("sweep");
    assert_eq!(first.requeued, 1);

    claim(&coordinator, "ghost").await;
    let second = sweeper
        .sweep_at(Utc::now() + Duration::seconds(601))
        .await
        .expect("sweep");
    assert_eq!(second.failed, 1);
    assert_eq!(second.requeued, 0);

    let job = coordinator.jobs().job(id).await.expect("job");
    assert_eq!(job.status, JobStatus::Failure);
    assert!(
        job.last_error
            .as_deref()
            .is_some_and(|msg| msg.starts_with("retry budget exhausted"))
    );
    let snapshot = coordinator.dispatcher().snapshot().await.expect("snapshot");
    assert_eq!(snapshot.claimed, 0);
    assert_eq!(snapshot.queued, 0);
}

#[tokio::test]
async fn claims_of_paused_jobs_are_released_not_retried() {
    let coordinator = coordinator(3);
    let id = single_unit_job(&coordinator).await;
    claim(&coordinator, "w1").await;
    coordinator.jobs().pause_job(id).await.expect("pause");

    let report = coordinator
        .recovery()
        .sweep_at(Utc::now())
        .await
        .expect("sweep");
    assert_eq!(report.released, 1);
    assert_eq!(report.requeued, 0);
    assert_eq!(coordinator.dispatcher().snapshot().await.expect("snapshot").queued, 0);
}

#[tokio::test]
async fn claims_on_settled_units_are_released() {
    let coordinator = coordinator(3);
    let id = single_unit_job(&coordinator).await;
    let held = claim(&coordinator, "w1").await;
    coordinator
        .store()
        .update_progress(id, held.unit_id(), &|entry: &mut ChunkStatus| -> Result<bool> {
            entry.status = ChunkState::Completed;
            Ok(true)
        })
        .await
        .expect("settle unit");

    let report = coordinator
        .recovery()
        .sweep_at(Utc::now())
        .await
        .expect("sweep");
    assert_eq!(report.released, 1);
    assert_eq!(report.requeued, 0);
    assert!(coordinator.store().list_claims().await.expect("claims").is_empty());
    assert_eq!(coordinator.dispatcher().snapshot().await.expect("snapshot").queued, 0);
}

#[tokio::test]
async fn interrupted_start_is_reconciled_after_the_grace_period() {
    let coordinator = coordinator(3);
    let id = single_unit_job(&coordinator).await;
    coordinator.dispatcher().purge_job(id).await.expect("drop queued unit");
    coordinator
        .store()
        .update_job(id, &|job: &mut JobRecord| -> Result<bool> {
            job.cleanup_pending = true;
            Ok(true)
        })
        .await
        .expect("flag job");

    let sweeper = coordinator.recovery();
    let early = sweeper.sweep_at(Utc::now()).await.expect("sweep");
    assert_eq!(early.reconciled, 0);
    assert_eq!(coordinator.dispatcher().snapshot().await.expect("snapshot").queued, 0);

    let report = sweeper
        .sweep_at(Utc::now() + Duration::seconds(61))
        .await
        .expect("sweep");
    assert_eq!(report.reconciled, 1);
    assert!(!report.is_idle());
    assert_eq!(coordinator.dispatcher().snapshot().await.expect("snapshot").queued, 1);

    let job = coordinator.jobs().job(id).await.expect("job");
    assert_eq!(job.status, JobStatus::Pending);
    assert!(!job.cleanup_pending);
    assert_eq!(claim(&coordinator, "w1").await.unit.job_id, id);
}
