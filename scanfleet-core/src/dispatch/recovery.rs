use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{LivenessConfig, RecoveryConfig};
use crate::error::Result;
use crate::job::{JobController, JobStatus, UnitReport};
use crate::store::CoordinationStore;
use crate::worker::is_stale;

use super::queue::UnitClaim;

/// Periodic scan that returns abandoned claims to the queue.
#[async_trait]
pub trait StaleClaimScanner: Send + Sync {
    async fn scan_stale_claims(&self) -> Result<RecoveryReport>;
}

/// Outcome of one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub inspected: usize,
    /// Claims put back on the queue with a bumped attempt.
    pub requeued: usize,
    /// Units failed terminally after exhausting their retries.
    pub failed: usize,
    /// Claims dropped because their job no longer accepts work or their unit already settled.
    pub released: usize,
    /// Jobs whose unfinished transition cleanup was completed.
    pub reconciled: usize,
}

impl RecoveryReport {
    pub fn is_idle(&self) -> bool {
        self.requeued == 0 && self.failed == 0 && self.released == 0 && self.reconciled == 0
    }
}

enum Verdict {
    Keep,
    Release,
    Recover(String),
}

/// Finds claims whose worker went silent or that saw no activity for too long, and finishes
/// job transitions whose queue or progress side effects were interrupted.
pub struct RecoverySweeper<S> {
    store: Arc<S>,
    jobs: JobController<S>,
    recovery: RecoveryConfig,
    liveness: LivenessConfig,
}

impl<S> Clone for RecoverySweeper<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            jobs: self.jobs.clone(),
            recovery: self.recovery,
            liveness: self.liveness,
        }
    }
}

impl<S> fmt::Debug for RecoverySweeper<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoverySweeper")
            .field("store", &type_name::<S>())
            .field("recovery", &self.recovery)
            .field("liveness", &self.liveness)
            .finish()
    }
}

impl<S: CoordinationStore> RecoverySweeper<S> {
    pub fn new(
        store: Arc<S>,
        jobs: JobController<S>,
        recovery: RecoveryConfig,
        liveness: LivenessConfig,
    ) -> Self {
        Self {
            store,
            jobs,
            recovery,
            liveness,
        }
    }

    /// Runs one sweep against `now`. Failures on individual claims or jobs are logged and
    /// skipped.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let claims = self.store.list_claims().await?;
        let mut report = RecoveryReport {
            inspected: claims.len(),
            ..RecoveryReport::default()
        };

        for claim in claims {
            let unit_id = claim.unit_id().clone();
            if let Err(err) = self.inspect(&claim, now, &mut report).await {
                warn!(unit_id = %unit_id, error = %err, "recovery failed for claim");
            }
        }
        self.reconcile_jobs(now, &mut report).await?;

        if !report.is_idle() {
            info!(
                inspected = report.inspected,
                requeued = report.requeued,
                failed = report.failed,
                released = report.released,
                reconciled = report.reconciled,
                "recovery sweep finished"
            );
        }
        Ok(report)
    }

    async fn inspect(
        &self,
        claim: &UnitClaim,
        now: DateTime<Utc>,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        match self.verdict(claim, now).await? {
            Verdict::Keep => Ok(()),
            Verdict::Release => {
                if self.store.release_claim(claim.unit_id()).await?.is_some() {
                    debug!(unit_id = %claim.unit_id(), "released claim of inactive job or settled unit");
                    report.released += 1;
                }
                Ok(())
            }
            Verdict::Recover(reason) if claim.unit.attempt < self.recovery.max_retries => {
                if self.jobs.dispatcher().requeue(claim, &reason).await? {
                    info!(
                        unit_id = %claim.unit_id(),
                        worker = %claim.worker_name,
                        attempt = claim.unit.attempt + 1,
                        %reason,
                        "requeued stale unit"
                    );
                    report.requeued += 1;
                }
                Ok(())
            }
            Verdict::Recover(reason) => {
                let failure = UnitReport::failed(
                    &claim.unit,
                    claim.worker_name.clone(),
                    format!("retry budget exhausted: {reason}"),
                );
                self.jobs.report_result(&failure).await?;
                warn!(
                    unit_id = %claim.unit_id(),
                    attempts = claim.unit.attempt,
                    %reason,
                    "unit failed after exhausting retries"
                );
                report.failed += 1;
                Ok(())
            }
        }
    }

    /// Repairs jobs flagged `cleanup_pending` that have been quiet for the grace period.
    async fn reconcile_jobs(&self, now: DateTime<Utc>, report: &mut RecoveryReport) -> Result<()> {
        let grace = self.recovery.reconcile_grace();
        for job in self.store.list_jobs().await? {
            if !job.cleanup_pending || now - job.updated_at <= grace {
                continue;
            }
            match self.jobs.reconcile(&job).await {
                Ok(_) => report.reconciled += 1,
                Err(err) => {
                    warn!(job_id = %job.id, status = %job.status, error = %err, "job reconciliation failed");
                }
            }
        }
        Ok(())
    }

    async fn verdict(&self, claim: &UnitClaim, now: DateTime<Utc>) -> Result<Verdict> {
        let job = self.store.get_job(claim.unit.job_id).await?;
        match job.map(|job| job.status) {
            None => return Ok(Verdict::Release),
            Some(status) if status.is_terminal() || status == JobStatus::Paused => {
                return Ok(Verdict::Release);
            }
            Some(_) => {}
        }

        let settled = self
            .store
            .list_progress(claim.unit.job_id)
            .await?
            .iter()
            .any(|entry| &entry.unit_id == claim.unit_id() && entry.is_terminal());
        if settled {
            return Ok(Verdict::Release);
        }

        if let Some(status) = self.store.get_worker_status(&claim.worker_name).await?
            && is_stale(now, status.last_report_time, self.liveness.stale_after())
        {
            return Ok(Verdict::Recover(format!(
                "worker {} stopped reporting",
                claim.worker_name
            )));
        }

        let idle = claim.idle_for(now);
        if idle > self.recovery.inactivity_timeout() {
            return Ok(Verdict::Recover(format!(
                "no activity for {}s",
                idle.num_seconds()
            )));
        }
        Ok(Verdict::Keep)
    }

    /// Sweeps every `interval` until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let interval = self.recovery.interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("recovery sweeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = self.scan_stale_claims().await {
                            warn!("recovery sweep error: {err}");
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl<S: CoordinationStore> StaleClaimScanner for RecoverySweeper<S> {
    async fn scan_stale_claims(&self) -> Result<RecoveryReport> {
        self.sweep_at(Utc::now()).await
    }
}
