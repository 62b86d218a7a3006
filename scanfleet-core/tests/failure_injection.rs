//! Lifecycle transitions against a backend whose writes can be made to fail.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scanfleet_core::cron::{CronDefinition, CronStore};
use scanfleet_core::dispatch::{
    ChunkState, ChunkStatus, ClaimRequest, ProgressStore, QueueDepth, UnitClaim, UnitQueue,
};
use scanfleet_core::events::{MessageBroker, Subscription};
use scanfleet_core::job::{JobRecord, JobRepository, JobStatus, JobUnit, UnitCounters, UnitReport};
use scanfleet_core::store::{MemoryStore, Mutation, Updated};
use scanfleet_core::worker::{ControlFlag, ControlFlagStore, WorkerMove, WorkerStatus, WorkerStatusStore};
use scanfleet_core::{CoordinationError, Coordinator, CoordinatorConfig, CronId, JobId, Result, UnitId};
use serde_json::json;

/// In-memory backend with switches that make selected writes fail.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryStore,
    fail_push: AtomicBool,
    fail_purge: AtomicBool,
    fail_progress_update: AtomicBool,
    job_updates_to_skip: AtomicUsize,
    job_updates_to_fail: AtomicUsize,
}

impl FaultyStore {
    fn fault(switch: &AtomicBool, operation: &str) -> Result<()> {
        if switch.load(Ordering::SeqCst) {
            return Err(CoordinationError::Broker(format!("injected {operation} failure")));
        }
        Ok(())
    }

    /// Lets `skip` job updates through, then fails the next `fail`.
    fn fail_job_updates(&self, skip: usize, fail: usize) {
        self.job_updates_to_skip.store(skip, Ordering::SeqCst);
        self.job_updates_to_fail.store(fail, Ordering::SeqCst);
    }

    fn heal(&self) {
        self.fail_push.store(false, Ordering::SeqCst);
        self.fail_purge.store(false, Ordering::SeqCst);
        self.fail_progress_update.store(false, Ordering::SeqCst);
        self.fail_job_updates(0, 0);
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl UnitQueue for FaultyStore {
    async fn push_units(&self, units: &[JobUnit]) -> Result<()> {
        Self::fault(&self.fail_push, "push")?;
        self.inner.push_units(units).await
    }

    async fn claim_unit(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<UnitClaim>> {
        self.inner.claim_unit(request, now).await
    }

    async fn touch_claim(&self, unit_id: &UnitId, now: DateTime<Utc>) -> Result<bool> {
        self.inner.touch_claim(unit_id, now).await
    }

    async fn release_claim(&self, unit_id: &UnitId) -> Result<Option<UnitClaim>> {
        self.inner.release_claim(unit_id).await
    }

    async fn release_claim_held_by(&self, unit_id: &UnitId, worker_name: &str) -> Result<bool> {
        self.inner.release_claim_held_by(unit_id, worker_name).await
    }

    async fn reassign_claims(&self, from: &str, to: &str) -> Result<usize> {
        self.inner.reassign_claims(from, to).await
    }

    async fn requeue_claim(&self, unit_id: &UnitId, unit: &JobUnit) -> Result<bool> {
        self.inner.requeue_claim(unit_id, unit).await
    }

    async fn list_claims(&self) -> Result<Vec<UnitClaim>> {
        self.inner.list_claims().await
    }

    async fn purge_job_units(&self, job_id: JobId) -> Result<usize> {
        Self::fault(&self.fail_purge, "purge")?;
        self.inner.purge_job_units(job_id).await
    }

    async fn queue_depth(&self) -> Result<QueueDepth> {
        self.inner.queue_depth().await
    }

    async fn queued_per_job(&self) -> Result<HashMap<JobId, usize>> {
        self.inner.queued_per_job().await
    }
}

#[async_trait]
impl ProgressStore for FaultyStore {
    async fn put_progress(&self, job_id: JobId, entries: &[ChunkStatus]) -> Result<()> {
        self.inner.put_progress(job_id, entries).await
    }

    async fn update_progress(
        &self,
        job_id: JobId,
        unit_id: &UnitId,
        mutate: Mutation<'_, ChunkStatus>,
    ) -> Result<Updated<ChunkStatus>> {
        Self::fault(&self.fail_progress_update, "progress update")?;
        self.inner.update_progress(job_id, unit_id, mutate).await
    }

    async fn list_progress(&self, job_id: JobId) -> Result<Vec<ChunkStatus>> {
        self.inner.list_progress(job_id).await
    }

    async fn remove_progress(&self, job_id: JobId) -> Result<()> {
        self.inner.remove_progress(job_id).await
    }
}

#[async_trait]
impl JobRepository for FaultyStore {
    async fn insert_job(&self, record: &JobRecord) -> Result<()> {
        self.inner.insert_job(record).await
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.inner.get_job(id).await
    }

    async fn update_job(
        &self,
        id: JobId,
        mutate: Mutation<'_, JobRecord>,
    ) -> Result<Updated<JobRecord>> {
        if !take_one(&self.job_updates_to_skip) && take_one(&self.job_updates_to_fail) {
            return Err(CoordinationError::Broker("injected job update failure".into()));
        }
        self.inner.update_job(id, mutate).await
    }

    async fn delete_job(&self, id: JobId) -> Result<bool> {
        self.inner.delete_job(id).await
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        self.inner.list_jobs().await
    }
}

#[async_trait]
impl WorkerStatusStore for FaultyStore {
    async fn put_worker_status(&self, status: &WorkerStatus) -> Result<()> {
        self.inner.put_worker_status(status).await
    }

    async fn get_worker_status(&self, name: &str) -> Result<Option<WorkerStatus>> {
        self.inner.get_worker_status(name).await
    }

    async fn list_worker_statuses(&self) -> Result<Vec<WorkerStatus>> {
        self.inner.list_worker_statuses().await
    }

    async fn remove_worker_status(&self, name: &str) -> Result<bool> {
        self.inner.remove_worker_status(name).await
    }

    async fn move_worker_status(&self, from: &str, to: &str) -> Result<WorkerMove> {
        self.inner.move_worker_status(from, to).await
    }
}

#[async_trait]
impl ControlFlagStore for FaultyStore {
    async fn set_control_flag(&self, job_id: JobId, flag: ControlFlag) -> Result<()> {
        self.inner.set_control_flag(job_id, flag).await
    }

    async fn clear_control_flag(&self, job_id: JobId) -> Result<()> {
        self.inner.clear_control_flag(job_id).await
    }

    async fn control_flag(&self, job_id: JobId) -> Result<Option<ControlFlag>> {
        self.inner.control_flag(job_id).await
    }
}

#[async_trait]
impl CronStore for FaultyStore {
    async fn put_cron(&self, definition: &CronDefinition) -> Result<()> {
        self.inner.put_cron(definition).await
    }

    async fn get_cron(&self, id: CronId) -> Result<Option<CronDefinition>> {
        self.inner.get_cron(id).await
    }

    async fn update_cron(
        &self,
        id: CronId,
        mutate: Mutation<'_, CronDefinition>,
    ) -> Result<Updated<CronDefinition>> {
        self.inner.update_cron(id, mutate).await
    }

    async fn delete_cron(&self, id: CronId) -> Result<bool> {
        self.inner.delete_cron(id).await
    }

    async fn list_crons(&self) -> Result<Vec<CronDefinition>> {
        self.inner.list_crons().await
    }
}

#[async_trait]
impl MessageBroker for FaultyStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription> {
        self.inner.subscribe(channels).await
    }
}

fn coordinator() -> (Arc<FaultyStore>, Coordinator<FaultyStore>) {
    let store = Arc::new(FaultyStore::default());
    let coordinator =
        Coordinator::new(Arc::clone(&store), CoordinatorConfig::default()).expect("valid config");
    (store, coordinator)
}

fn hosts(count: usize) -> String {
    (1..=count)
        .map(|n| format!("10.1.0.{n}"))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn created(coordinator: &Coordinator<FaultyStore>, targets: usize) -> JobId {
    coordinator
        .jobs()
        .create_job(JobRecord::new("ws", "faulty", hosts(targets), json!({})))
        .await
        .expect("create")
        .id
}

async fn started(coordinator: &Coordinator<FaultyStore>, targets: usize) -> JobRecord {
    let id = created(coordinator, targets).await;
    coordinator.jobs().start_job(id).await.expect("start")
}

async fn claim(coordinator: &Coordinator<FaultyStore>, worker: &str) -> UnitClaim {
    coordinator
        .jobs()
        .claim_next(&ClaimRequest::new(worker))
        .await
        .expect("claim")
        .expect("a unit is queued")
}

fn after_grace() -> DateTime<Utc> {
    Utc::now() + Duration::seconds(61)
}

#[tokio::test]
async fn failed_enqueue_leaves_a_clean_created_job() {
    let (store, coordinator) = coordinator();
    let id = created(&coordinator, 90).await;

    store.fail_push.store(true, Ordering::SeqCst);
    let err = coordinator.jobs().start_job(id).await.expect_err("push fails");
    assert!(matches!(err, CoordinationError::Dispatch(_)));

    let job = coordinator.jobs().job(id).await.expect("job");
    assert_eq!(job.status, JobStatus::Created);
    assert!(!job.cleanup_pending);
    assert!(store.list_progress(id).await.expect("progress").is_empty());

    store.heal();
    let job = coordinator.jobs().start_job(id).await.expect("retry start");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(
        coordinator.dispatcher().snapshot().await.expect("snapshot").queued,
        job.unit_count as usize
    );
}

#[tokio::test]
async fn start_that_cannot_roll_back_is_finished_by_the_sweep() {
    let (store, coordinator) = coordinator();
    let id = created(&coordinator, 90).await;

    store.fail_push.store(true, Ordering::SeqCst);
    store.fail_job_updates(1, 3);
    coordinator.jobs().start_job(id).await.expect_err("push fails");

    let job = coordinator.jobs().job(id).await.expect("job");
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.cleanup_pending);
    assert_eq!(coordinator.dispatcher().snapshot().await.expect("snapshot").queued, 0);

    store.heal();
    let report = coordinator.recovery().sweep_at(after_grace()).await.expect("sweep");
    assert_eq!(report.reconciled, 1);

    let job = coordinator.jobs().job(id).await.expect("job");
    assert!(!job.cleanup_pending);
    assert_eq!(
        coordinator.dispatcher().snapshot().await.expect("snapshot").queued,
        job.unit_count as usize
    );
}

#[tokio::test]
async fn pause_commits_when_the_purge_fails() {
    let (store, coordinator) = coordinator();
    let job = started(&coordinator, 90).await;
    claim(&coordinator, "w1").await;

    store.fail_purge.store(true, Ordering::SeqCst);
    let paused = coordinator.jobs().pause_job(job.id).await.expect("pause");
    assert_eq!(paused.status, JobStatus::Paused);
    assert!(paused.cleanup_pending);
    assert_eq!(
        coordinator.workers().job_control(job.id).await.expect("flag"),
        Some(ControlFlag::Pause)
    );

    store.heal();
    let report = coordinator.recovery().sweep_at(after_grace()).await.expect("sweep");
    assert_eq!(report.reconciled, 1);
    assert_eq!(report.released, 1);
    assert_eq!(coordinator.dispatcher().snapshot().await.expect("snapshot").queued, 0);
    assert!(!coordinator.jobs().job(job.id).await.expect("job").cleanup_pending);
}

#[tokio::test]
async fn stop_commits_when_units_cannot_be_failed() {
    let (store, coordinator) = coordinator();
    let job = started(&coordinator, 90).await;
    claim(&coordinator, "w1").await;

    store.fail_progress_update.store(true, Ordering::SeqCst);
    let stopped = coordinator.jobs().stop_job(job.id).await.expect("stop");
    assert_eq!(stopped.status, JobStatus::Stopped);
    assert!(stopped.cleanup_pending);
    assert_eq!(coordinator.dispatcher().snapshot().await.expect("snapshot").queued, 0);

    store.heal();
    let report = coordinator.recovery().sweep_at(after_grace()).await.expect("sweep");
    assert_eq!(report.reconciled, 1);

    let progress = coordinator.jobs().progress(job.id).await.expect("progress");
    assert!(progress.units.iter().all(|unit| unit.status == ChunkState::Failed));
    assert!(!coordinator.jobs().job(job.id).await.expect("job").cleanup_pending);
}

#[tokio::test]
async fn failed_resume_returns_the_job_to_paused() {
    let (store, coordinator) = coordinator();
    let job = started(&coordinator, 90).await;
    claim(&coordinator, "w1").await;
    coordinator.jobs().pause_job(job.id).await.expect("pause");

    store.fail_push.store(true, Ordering::SeqCst);
    coordinator.jobs().resume_job(job.id).await.expect_err("push fails");
    let paused = coordinator.jobs().job(job.id).await.expect("job");
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(
        coordinator.workers().job_control(job.id).await.expect("flag"),
        Some(ControlFlag::Pause)
    );

    store.heal();
    let resumed = coordinator.jobs().resume_job(job.id).await.expect("resume");
    assert_eq!(resumed.status, JobStatus::Pending);
    assert!(!resumed.cleanup_pending);
    assert_eq!(
        coordinator.dispatcher().snapshot().await.expect("snapshot").queued,
        resumed.unit_count as usize
    );
}

#[tokio::test]
async fn report_keeps_the_claim_when_progress_cannot_be_written() {
    let (store, coordinator) = coordinator();
    started(&coordinator, 1).await;
    let held = claim(&coordinator, "w1").await;

    store.fail_progress_update.store(true, Ordering::SeqCst);
    let report = UnitReport::completed(&held.unit, "w1", UnitCounters::default());
    coordinator.jobs().report_result(&report).await.expect_err("write fails");
    let claims = store.list_claims().await.expect("claims");
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].unit_id(), held.unit_id());

    store.heal();
    let job = coordinator.jobs().report_result(&report).await.expect("report");
    assert_eq!(job.status, JobStatus::Success);
    assert!(store.list_claims().await.expect("claims").is_empty());
}
