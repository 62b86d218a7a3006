use std::any::type_name;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::cron::{JobLauncher, JobTemplate};
use crate::dispatch::{
    ChunkState, ChunkStatus, ClaimRequest, Dispatcher, ProgressSummary, UnitClaim,
};
use crate::error::{CoordinationError, Result};
use crate::events::{JobEvent, JobEventKind, JobEventPublisher};
use crate::partition::{self, ChunkConfig, PartitionPreview};
use crate::store::CoordinationStore;
use crate::types::{JobId, UnitId};
use crate::worker::ControlFlag;

use super::model::{JobRecord, JobStatus, JobUnit, STOPPED_MANUALLY, UnitReport};
use super::units::build_units;

/// Attempts at returning a job to `CREATED` after its units could not be enqueued.
const ROLLBACK_ATTEMPTS: usize = 3;

/// Progress of one job as shown to operators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub job_id: JobId,
    pub status: JobStatus,
    pub summary: ProgressSummary,
    pub units: Vec<ChunkStatus>,
    pub last_error: Option<String>,
}

/// Drives jobs through their lifecycle and keeps the job record, the queue, the progress
/// entries and the control flags consistent with each other.
///
/// The job record is the source of truth: every transition is a compare-and-set against the
/// stored status, so two operators racing on the same job see exactly one success.
pub struct JobController<S> {
    store: Arc<S>,
    dispatcher: Dispatcher<S>,
    chunking: ChunkConfig,
    events: Arc<dyn JobEventPublisher>,
}

impl<S> Clone for JobController<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            dispatcher: self.dispatcher.clone(),
            chunking: self.chunking,
            events: Arc::clone(&self.events),
        }
    }
}

impl<S> fmt::Debug for JobController<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobController")
            .field("store", &type_name::<S>())
            .field("chunking", &self.chunking)
            .finish_non_exhaustive()
    }
}

impl<S: CoordinationStore> JobController<S> {
    pub fn new(
        store: Arc<S>,
        dispatcher: Dispatcher<S>,
        chunking: ChunkConfig,
        events: Arc<dyn JobEventPublisher>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            chunking,
            events,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher<S> {
        &self.dispatcher
    }

    pub fn chunking(&self) -> &ChunkConfig {
        &self.chunking
    }

    /// Persists a new job in `CREATED`.
    pub async fn create_job(&self, record: JobRecord) -> Result<JobRecord> {
        if record.status != JobStatus::Created {
            return Err(CoordinationError::validation(format!(
                "new job {} must start in {}, got {}",
                record.id,
                JobStatus::Created,
                record.status
            )));
        }
        self.store.insert_job(&record).await?;
        info!(job_id = %record.id, name = %record.name, "job created");
        self.emit(record.id, JobEventKind::Created).await;
        Ok(record)
    }

    pub async fn job(&self, id: JobId) -> Result<JobRecord> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| CoordinationError::not_found(format!("job {id}")))
    }

    /// Partitions the job, enqueues its units and moves it to `PENDING`.
    ///
    /// When enqueueing fails the job is returned to `CREATED` so the call can be retried.
    pub async fn start_job(&self, id: JobId) -> Result<JobRecord> {
        let job = self.job(id).await?;
        if job.status != JobStatus::Created {
            return Err(job.conflict(JobStatus::Pending));
        }

        let plan = partition::plan(&job.target, &self.chunking, &job.config)?;
        if plan.is_empty() {
            return Err(CoordinationError::validation(format!(
                "job {id} has no targets"
            )));
        }
        let units = build_units(&job, &plan, None)?;
        let unit_count = u32::try_from(units.len())
            .map_err(|_| CoordinationError::validation(format!("job {id} has too many units")))?;
        let chunking = self.chunking;

        let updated = self
            .store
            .update_job(id, &|record: &mut JobRecord| -> Result<bool> {
                record.transition(JobStatus::Pending)?;
                record.unit_count = unit_count;
                record.units_completed = 0;
                record.units_failed = 0;
                record.last_error = None;
                record.chunking = Some(chunking);
                record.cleanup_pending = true;
                Ok(true)
            })
            .await?;

        if let Err(err) = self.dispatcher.enqueue_all(&units).await {
            warn!(job_id = %id, error = %err, "enqueue failed, returning job to CREATED");
            self.rollback_start(id).await;
            return Err(err);
        }

        info!(
            job_id = %id,
            units = unit_count,
            chunk_size = plan.chunk_size,
            targets = plan.total_targets(),
            "job started"
        );
        self.emit(id, JobEventKind::Started { unit_count }).await;
        Ok(self
            .clear_cleanup(id, &[JobStatus::Pending, JobStatus::Started])
            .await
            .unwrap_or(updated.value))
    }

    /// Drops whatever the failed start managed to enqueue, then reverts the job to `CREATED`.
    /// Anything that cannot be undone here stays flagged for the recovery sweep.
    async fn rollback_start(&self, id: JobId) {
        let drained = self.drop_job_work(id).await.is_ok();
        for attempt in 1..=ROLLBACK_ATTEMPTS {
            let reverted = self
                .store
                .update_job(id, &|record: &mut JobRecord| -> Result<bool> {
                    if record.status != JobStatus::Pending {
                        return Ok(false);
                    }
                    record.status = JobStatus::Created;
                    record.unit_count = 0;
                    record.chunking = None;
                    record.cleanup_pending = !drained;
                    record.updated_at = Utc::now();
                    Ok(true)
                })
                .await;
            match reverted {
                Ok(_) => return,
                Err(err) => {
                    warn!(job_id = %id, attempt, error = %err, "failed to revert job after enqueue failure");
                }
            }
        }
        error!(
            job_id = %id,
            "job left PENDING after a failed start; the recovery sweep will enqueue its units"
        );
    }

    /// Removes the job's queued units, claims and progress entries.
    async fn drop_job_work(&self, id: JobId) -> Result<()> {
        let mut outcome = Ok(());
        if let Err(err) = self.dispatcher.purge_job(id).await {
            warn!(job_id = %id, error = %err, "failed to purge queued units");
            outcome = Err(err);
        }
        if let Err(err) = self.release_job_claims(id).await {
            warn!(job_id = %id, error = %err, "failed to release claims");
            outcome = Err(err);
        }
        if let Err(err) = self.store.remove_progress(id).await {
            warn!(job_id = %id, error = %err, "failed to drop progress entries");
            outcome = Err(err);
        }
        outcome
    }

    async fn release_job_claims(&self, id: JobId) -> Result<usize> {
        let mut released = 0;
        for claim in self.store.list_claims().await? {
            if claim.unit.job_id == id && self.store.release_claim(claim.unit_id()).await?.is_some()
            {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Clears `cleanup_pending` while the job is still in one of `statuses`.
    ///
    /// Returns the stored record, or `None` when the write failed; the flag then stays set and
    /// the recovery sweep finishes the work.
    async fn clear_cleanup(&self, id: JobId, statuses: &[JobStatus]) -> Option<JobRecord> {
        let cleared = self
            .store
            .update_job(id, &|record: &mut JobRecord| -> Result<bool> {
                if !record.cleanup_pending || !statuses.contains(&record.status) {
                    return Ok(false);
                }
                record.cleanup_pending = false;
                Ok(true)
            })
            .await;
        match cleared {
            Ok(updated) => Some(updated.value),
            Err(err) => {
                warn!(job_id = %id, error = %err, "failed to clear cleanup marker");
                None
            }
        }
    }

    /// Signals running units to save state and leave, and drops the job's queued units.
    ///
    /// Once the job is `PAUSED` the call succeeds; a failed purge is retried by the recovery
    /// sweep.
    pub async fn pause_job(&self, id: JobId) -> Result<JobRecord> {
        let job = self.job(id).await?;
        if !job.status.can_transition_to(JobStatus::Paused) {
            return Err(job.conflict(JobStatus::Paused));
        }

        let previous = self.store.control_flag(id).await?;
        self.store.set_control_flag(id, ControlFlag::Pause).await?;
        let job = match self
            .store
            .update_job(id, &|record: &mut JobRecord| -> Result<bool> {
                record.transition(JobStatus::Paused)?;
                record.cleanup_pending = true;
                Ok(true)
            })
            .await
        {
            Ok(updated) => updated.value,
            Err(err) => {
                self.restore_flag(id, previous).await;
                return Err(err);
            }
        };

        let job = match self.dispatcher.purge_job(id).await {
            Ok(purged) => {
                info!(job_id = %id, purged, "job paused");
                self.clear_cleanup(id, &[JobStatus::Paused])
                    .await
                    .unwrap_or(job)
            }
            Err(err) => {
                warn!(job_id = %id, error = %err, "job paused but its queued units were not purged");
                job
            }
        };
        self.emit(id, JobEventKind::Paused).await;
        Ok(job)
    }

    /// Stores the blob a worker wants replayed as `resumeState` when the job resumes.
    pub async fn save_resume_state(&self, id: JobId, state: Value) -> Result<JobRecord> {
        let updated = self
            .store
            .update_job(id, &|record: &mut JobRecord| -> Result<bool> {
                if record.status.is_terminal() {
                    return Err(CoordinationError::validation(format!(
                        "job {} is {}; its resume state can no longer change",
                        record.id, record.status
                    )));
                }
                record.saved_state = Some(state.clone());
                record.updated_at = Utc::now();
                Ok(true)
            })
            .await?;
        debug!(job_id = %id, "resume state saved");
        Ok(updated.value)
    }

    /// Clears the pause flag and re-enqueues every unit that has not reached a terminal state.
    ///
    /// Units still waiting in the queue are replaced rather than duplicated, and claims left
    /// behind by paused workers are dropped.
    pub async fn resume_job(&self, id: JobId) -> Result<JobRecord> {
        let job = self.job(id).await?;
        if job.status != JobStatus::Paused {
            return Err(job.conflict(JobStatus::Pending));
        }

        let previous = self.store.control_flag(id).await?;
        self.store.clear_control_flag(id).await?;
        let job = match self
            .store
            .update_job(id, &|record: &mut JobRecord| -> Result<bool> {
                record.transition(JobStatus::Pending)?;
                record.cleanup_pending = true;
                Ok(true)
            })
            .await
        {
            Ok(updated) => updated.value,
            Err(err) => {
                self.restore_flag(id, previous).await;
                return Err(err);
            }
        };

        let requeue = match self.prepare_resume(&job).await {
            Ok(units) => units,
            Err(err) => {
                self.rollback_resume(id).await;
                return Err(err);
            }
        };

        if requeue.is_empty() {
            let updated = self
                .store
                .update_job(id, &|record: &mut JobRecord| -> Result<bool> {
                    record.cleanup_pending = false;
                    record.finish_if_settled()?;
                    Ok(true)
                })
                .await?;
            info!(job_id = %id, status = %updated.value.status, "job resumed with nothing left to run");
            self.emit(id, JobEventKind::Resumed { requeued: 0 }).await;
            if updated.value.status.is_terminal() {
                self.emit(
                    id,
                    JobEventKind::Finished {
                        status: updated.value.status,
                    },
                )
                .await;
            }
            return Ok(updated.value);
        }

        if let Err(err) = self.dispatcher.enqueue_all(&requeue).await {
            warn!(job_id = %id, error = %err, "enqueue failed, returning job to PAUSED");
            self.rollback_resume(id).await;
            return Err(err);
        }

        info!(job_id = %id, requeued = requeue.len(), "job resumed");
        self.emit(
            id,
            JobEventKind::Resumed {
                requeued: requeue.len(),
            },
        )
        .await;
        Ok(self
            .clear_cleanup(id, &[JobStatus::Pending, JobStatus::Started])
            .await
            .unwrap_or(job))
    }

    /// Drops leftover claims and queued copies of the job's units and returns the units to
    /// enqueue again.
    async fn prepare_resume(&self, job: &JobRecord) -> Result<Vec<JobUnit>> {
        self.release_job_claims(job.id).await?;
        self.dispatcher.purge_job(job.id).await?;
        self.unsettled_units(job).await
    }

    /// Rebuilds the job's units with the bounds it was started with and keeps the ones whose
    /// progress is not terminal, carrying their attempt counters over.
    async fn unsettled_units(&self, job: &JobRecord) -> Result<Vec<JobUnit>> {
        let chunking = job.chunking.unwrap_or(self.chunking);
        let plan = partition::plan(&job.target, &chunking, &job.config)?;
        let units = build_units(job, &plan, job.saved_state.as_ref())?;

        let progress: HashMap<UnitId, ChunkStatus> = self
            .store
            .list_progress(job.id)
            .await?
            .into_iter()
            .map(|entry| (entry.unit_id.clone(), entry))
            .collect();

        Ok(units
            .into_iter()
            .filter_map(|mut unit| match progress.get(&unit.unit_id) {
                Some(entry) if entry.is_terminal() => None,
                Some(entry) => {
                    unit.attempt = entry.attempt;
                    Some(unit)
                }
                None => Some(unit),
            })
            .collect())
    }

    async fn rollback_resume(&self, id: JobId) {
        let reverted = self
            .store
            .update_job(id, &|record: &mut JobRecord| -> Result<bool> {
                if record.status != JobStatus::Pending {
                    return Ok(false);
                }
                record.status = JobStatus::Paused;
                record.cleanup_pending = true;
                record.updated_at = Utc::now();
                Ok(true)
            })
            .await;
        if let Err(err) = reverted {
            warn!(job_id = %id, error = %err, "failed to revert job after resume failure");
        }
        self.restore_flag(id, Some(ControlFlag::Pause)).await;
    }

    /// Terminates the job: running units are told to abandon work, queued units are dropped and
    /// every unsettled unit is marked failed.
    ///
    /// Once the job is `STOPPED` the call succeeds; cleanup that fails here is retried by the
    /// recovery sweep.
    pub async fn stop_job(&self, id: JobId) -> Result<JobRecord> {
        let job = self.job(id).await?;
        if !job.status.can_transition_to(JobStatus::Stopped) {
            return Err(job.conflict(JobStatus::Stopped));
        }

        let previous = self.store.control_flag(id).await?;
        self.store.set_control_flag(id, ControlFlag::Stop).await?;
        let job = match self
            .store
            .update_job(id, &|record: &mut JobRecord| -> Result<bool> {
                record.transition(JobStatus::Stopped)?;
                record.result = Some(STOPPED_MANUALLY.to_string());
                record.cleanup_pending = true;
                Ok(true)
            })
            .await
        {
            Ok(updated) => updated.value,
            Err(err) => {
                self.restore_flag(id, previous).await;
                return Err(err);
            }
        };

        let job = match self.abandon_units(id).await {
            Ok((purged, abandoned)) => {
                info!(job_id = %id, purged, abandoned, "job stopped");
                self.clear_cleanup(id, &[JobStatus::Stopped])
                    .await
                    .unwrap_or(job)
            }
            Err(err) => {
                warn!(job_id = %id, error = %err, "job stopped but its units were not all settled");
                job
            }
        };
        self.emit(id, JobEventKind::Stopped).await;
        Ok(job)
    }

    async fn abandon_units(&self, id: JobId) -> Result<(usize, usize)> {
        let purged = self.dispatcher.purge_job(id).await?;
        let abandoned = self.fail_unsettled(id, STOPPED_MANUALLY).await?;
        Ok((purged, abandoned))
    }

    /// Marks every non-terminal unit failed. Entries that could not be written are retried on
    /// the next call; the last such error is returned after all entries were tried.
    async fn fail_unsettled(&self, id: JobId, reason: &str) -> Result<usize> {
        let now = Utc::now();
        let mut failed = 0;
        let mut last_error = None;
        for entry in self.store.list_progress(id).await? {
            if entry.is_terminal() {
                continue;
            }
            let marked = self
                .store
                .update_progress(id, &entry.unit_id, &|unit: &mut ChunkStatus| -> Result<bool> {
                    if unit.is_terminal() {
                        return Ok(false);
                    }
                    unit.status = ChunkState::Failed;
                    unit.end_time = Some(now);
                    unit.error_msg = Some(reason.to_string());
                    Ok(true)
                })
                .await;
            match marked {
                Ok(updated) if updated.changed => failed += 1,
                Ok(_) => {}
                Err(err) => {
                    warn!(job_id = %id, unit_id = %entry.unit_id, error = %err, "failed to mark unit failed");
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(failed),
        }
    }

    /// Finishes the side effects of a transition that did not complete, judged by the job's
    /// current status, and clears its `cleanup_pending` marker. Returns the number of units
    /// enqueued, purged or failed along the way.
    pub async fn reconcile(&self, job: &JobRecord) -> Result<usize> {
        let id = job.id;
        let touched = match job.status {
            JobStatus::Created => {
                let purged = self.dispatcher.purge_job(id).await?;
                let released = self.release_job_claims(id).await?;
                self.store.remove_progress(id).await?;
                purged + released
            }
            JobStatus::Pending | JobStatus::Started => {
                let claimed: HashSet<UnitId> = self
                    .store
                    .list_claims()
                    .await?
                    .into_iter()
                    .filter(|claim| claim.unit.job_id == id)
                    .map(|claim| claim.unit.unit_id)
                    .collect();
                let units: Vec<JobUnit> = self
                    .unsettled_units(job)
                    .await?
                    .into_iter()
                    .filter(|unit| !claimed.contains(&unit.unit_id))
                    .collect();
                self.dispatcher.enqueue_all(&units).await?;
                units.len()
            }
            JobStatus::Paused | JobStatus::Success | JobStatus::Failure => {
                self.dispatcher.purge_job(id).await?
            }
            JobStatus::Stopped => {
                let (purged, abandoned) = self.abandon_units(id).await?;
                purged + abandoned
            }
        };

        let status = job.status;
        self.store
            .update_job(id, &|record: &mut JobRecord| -> Result<bool> {
                if record.status != status || !record.cleanup_pending {
                    return Ok(false);
                }
                record.cleanup_pending = false;
                Ok(true)
            })
            .await?;
        info!(job_id = %id, status = %status, units = touched, "job cleanup reconciled");
        Ok(touched)
    }

    async fn restore_flag(&self, id: JobId, previous: Option<ControlFlag>) {
        let restored = match previous {
            Some(flag) => self.store.set_control_flag(id, flag).await,
            None => self.store.clear_control_flag(id).await,
        };
        if let Err(err) = restored {
            warn!(job_id = %id, error = %err, "failed to restore control flag");
        }
    }

    /// Claims the next unit for a worker and marks its job `STARTED` on the first claim.
    pub async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<UnitClaim>> {
        let Some(claim) = self.dispatcher.claim_next(request).await? else {
            return Ok(None);
        };

        let job_id = claim.unit.job_id;
        let started = self
            .store
            .update_job(job_id, &|record: &mut JobRecord| -> Result<bool> {
                if record.status != JobStatus::Pending {
                    return Ok(false);
                }
                record.transition(JobStatus::Started)?;
                Ok(true)
            })
            .await;
        match started {
            Ok(updated) if updated.changed => {
                info!(job_id = %job_id, worker = %claim.worker_name, "job running");
            }
            Ok(_) => {}
            Err(err) => warn!(job_id = %job_id, error = %err, "failed to mark job started"),
        }

        self.emit(
            job_id,
            JobEventKind::UnitClaimed {
                unit_id: claim.unit_id().clone(),
                worker_name: claim.worker_name.clone(),
            },
        )
        .await;
        Ok(Some(claim))
    }

    pub async fn touch(&self, unit_id: &UnitId) -> Result<bool> {
        self.dispatcher.touch(unit_id).await
    }

    /// Settles a unit and folds its outcome into the job.
    ///
    /// Repeated reports for a unit that already settled leave the job untouched.
    pub async fn report_result(&self, report: &UnitReport) -> Result<JobRecord> {
        let settlement = self.dispatcher.report_result(report).await?;
        if !settlement.first_report {
            return self.job(report.job_id).await;
        }

        let error = settlement.error.as_deref();
        let updated = self
            .store
            .update_job(report.job_id, &|record: &mut JobRecord| -> Result<bool> {
                record.record_unit_outcome(error)?;
                Ok(true)
            })
            .await?;
        let job = updated.value;

        debug!(
            job_id = %job.id,
            unit_id = %report.unit_id,
            completed = job.units_completed,
            total = job.unit_count,
            "unit settled"
        );
        self.emit(
            job.id,
            JobEventKind::UnitFinished {
                unit_id: report.unit_id.clone(),
                failed: report.outcome.is_failure(),
            },
        )
        .await;

        let finished_now = matches!(job.status, JobStatus::Success | JobStatus::Failure)
            && job.units_completed == job.unit_count;
        if finished_now {
            info!(
                job_id = %job.id,
                status = %job.status,
                failed_units = job.units_failed,
                "job finished"
            );
            self.emit(job.id, JobEventKind::Finished { status: job.status })
                .await;
        }
        Ok(job)
    }

    pub async fn progress(&self, id: JobId) -> Result<JobProgress> {
        let job = self.job(id).await?;
        let units = self.store.list_progress(id).await?;
        Ok(JobProgress {
            job_id: id,
            status: job.status,
            summary: ProgressSummary::from_entries(&units),
            units,
            last_error: job.last_error,
        })
    }

    /// Removes a job with everything the coordinator tracks for it.
    pub async fn delete_job(&self, id: JobId) -> Result<()> {
        self.dispatcher.purge_job(id).await?;
        self.release_job_claims(id).await?;
        self.store.remove_progress(id).await?;
        self.store.clear_control_flag(id).await?;
        if !self.store.delete_job(id).await? {
            return Err(CoordinationError::not_found(format!("job {id}")));
        }
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Dry-run partition of a target list with the configured bounds.
    pub fn preview(&self, target: &str, scan_config: &Value) -> Result<PartitionPreview> {
        partition::preview(target, &self.chunking, scan_config)
    }

    async fn emit(&self, job_id: JobId, kind: JobEventKind) {
        if let Err(err) = self.events.publish_event(JobEvent::new(job_id, kind)).await {
            warn!(job_id = %job_id, error = %err, "failed to publish job event");
        }
    }
}

#[async_trait]
impl<S: CoordinationStore> JobLauncher for JobController<S> {
    async fn launch(&self, template: &JobTemplate, name: String) -> Result<JobRecord> {
        let created = self.create_job(template.instantiate(name)).await?;
        self.start_job(created.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InProcJobEventBus;
    use crate::job::UnitCounters;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn controller() -> JobController<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        JobController::new(
            Arc::clone(&store),
            Dispatcher::new(store),
            ChunkConfig::default(),
            Arc::new(InProcJobEventBus::new(16)),
        )
    }

    fn hosts(count: usize) -> String {
        (0..count)
            .map(|i| format!("10.0.0.{i}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[tokio::test]
    async fn start_twice_is_a_conflict() {
        let jobs = controller();
        let job = jobs
            .create_job(JobRecord::new("ws", "scan", hosts(3), json!({})))
            .await
            .expect("create");
        let started = jobs.start_job(job.id).await.expect("start");
        assert_eq!(started.status, JobStatus::Pending);
        assert_eq!(started.unit_count, 1);

        let err = jobs.start_job(job.id).await.expect_err("second start");
        assert!(err.is_state_conflict());
    }

    #[tokio::test]
    async fn blank_target_is_rejected_and_job_stays_created() {
        let jobs = controller();
        let job = jobs
            .create_job(JobRecord::new("ws", "scan", "\n  \n", json!({})))
            .await
            .expect("create");
        assert!(matches!(
            jobs.start_job(job.id).await,
            Err(CoordinationError::Validation(_))
        ));
        assert_eq!(jobs.job(job.id).await.expect("job").status, JobStatus::Created);
    }

    #[tokio::test]
    async fn duplicate_reports_count_once() {
        let jobs = controller();
        let job = jobs
            .create_job(JobRecord::new("ws", "scan", hosts(2), json!({})))
            .await
            .expect("create");
        jobs.start_job(job.id).await.expect("start");

        let claim = jobs
            .claim_next(&ClaimRequest::new("w1"))
            .await
            .expect("claim")
            .expect("a unit");
        let report = UnitReport::completed(&claim.unit, "w1", UnitCounters::default());
        let first = jobs.report_result(&report).await.expect("report");
        let second = jobs.report_result(&report).await.expect("report again");

        assert_eq!(first.status, JobStatus::Success);
        assert_eq!(second.units_completed, 1);
    }

    #[tokio::test]
    async fn pause_requires_a_running_job() {
        let jobs = controller();
        let job = jobs
            .create_job(JobRecord::new("ws", "scan", hosts(2), json!({})))
            .await
            .expect("create");
        let err = jobs.pause_job(job.id).await.expect_err("pause created job");
        assert!(err.is_state_conflict());
    }
}
