use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LivenessConfig;
use crate::error::{CoordinationError, Result};
use crate::job::{JobUnit, UnitReport};
use crate::store::CoordinationStore;
use crate::types::{JobId, UnitId};
use crate::worker::is_stale;

use super::progress::{ChunkState, ChunkStatus};
use super::queue::{ClaimRequest, UnitClaim};

#[derive(Debug, Default)]
struct DispatchMetrics {
    enqueued: AtomicU64,
    claims: AtomicU64,
    empty_polls: AtomicU64,
    reports: AtomicU64,
    claim_latency_micros: AtomicU64,
}

/// Queue counters plus instantaneous depth.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub queued: usize,
    pub claimed: usize,
    pub enqueued_total: u64,
    pub claims_total: u64,
    pub empty_polls_total: u64,
    pub reports_total: u64,
    pub mean_claim_latency_ms: f64,
}

/// What a worker report did to the unit's progress record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settlement {
    pub job_id: JobId,
    pub unit_id: UnitId,
    pub error: Option<String>,
    /// False when the unit had already reached a terminal state.
    pub first_report: bool,
}

/// Hands units to workers and records what they report back.
pub struct Dispatcher<S> {
    store: Arc<S>,
    liveness: LivenessConfig,
    metrics: Arc<DispatchMetrics>,
}

impl<S> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            liveness: self.liveness,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<S> fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("store", &type_name::<S>())
            .field("liveness", &self.liveness)
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl<S: CoordinationStore> Dispatcher<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            liveness: LivenessConfig::default(),
            metrics: Arc::new(DispatchMetrics::default()),
        }
    }

    /// Window after which a registered worker counts as offline and is refused work.
    #[must_use]
    pub fn with_liveness(mut self, liveness: LivenessConfig) -> Self {
        self.liveness = liveness;
        self
    }

    pub async fn enqueue(&self, unit: JobUnit) -> Result<()> {
        self.enqueue_all(std::slice::from_ref(&unit)).await
    }

    /// Records a queued progress entry per unit and pushes the batch.
    pub async fn enqueue_all(&self, units: &[JobUnit]) -> Result<()> {
        if units.is_empty() {
            return Ok(());
        }

        let mut by_job: HashMap<JobId, Vec<ChunkStatus>> = HashMap::new();
        for unit in units {
            by_job
                .entry(unit.job_id)
                .or_default()
                .push(ChunkStatus::queued(unit));
        }
        for (job_id, entries) in &by_job {
            self.store
                .put_progress(*job_id, entries)
                .await
                .map_err(CoordinationError::into_dispatch)?;
        }

        self.store
            .push_units(units)
            .await
            .map_err(CoordinationError::into_dispatch)?;

        self.metrics
            .enqueued
            .fetch_add(units.len() as u64, Ordering::Relaxed);
        debug!(units = units.len(), jobs = by_job.len(), "enqueued units");
        Ok(())
    }

    /// Atomically claims the next unit the worker may run, or `None` when there is nothing
    /// for it. Registered workers that are at their concurrency limit, or whose last heartbeat
    /// is older than the liveness window, get nothing until they report again.
    pub async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<UnitClaim>> {
        if request.worker_name.trim().is_empty() {
            return Err(CoordinationError::validation("worker name must not be empty"));
        }

        let now = Utc::now();
        if let Some(status) = self.store.get_worker_status(&request.worker_name).await? {
            if is_stale(now, status.last_report_time, self.liveness.stale_after()) {
                debug!(
                    worker = %request.worker_name,
                    last_report = %status.last_report_time,
                    "worker heartbeat is stale, no claim"
                );
                self.metrics.empty_polls.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            if status.is_saturated() {
                debug!(
                    worker = %request.worker_name,
                    running = status.running_count(),
                    concurrency = status.concurrency,
                    "worker saturated, no claim"
                );
                self.metrics.empty_polls.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        }

        let started = Instant::now();
        let claim = self.store.claim_unit(request, now).await?;
        self.metrics
            .claim_latency_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);

        let Some(claim) = claim else {
            self.metrics.empty_polls.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };
        self.metrics.claims.fetch_add(1, Ordering::Relaxed);

        let worker = request.worker_name.as_str();
        let attempt = claim.unit.attempt;
        let marked = self
            .store
            .update_progress(
                claim.unit.job_id,
                claim.unit_id(),
                &|entry: &mut ChunkStatus| -> Result<bool> {
                    if entry.is_terminal() {
                        return Ok(false);
                    }
                    entry.status = ChunkState::Running;
                    entry.start_time = Some(now);
                    entry.end_time = None;
                    entry.worker_name = Some(worker.to_string());
                    entry.error_msg = None;
                    entry.attempt = attempt;
                    Ok(true)
                },
            )
            .await;
        if let Err(err) = marked {
            warn!(unit_id = %claim.unit_id(), error = %err, "failed to mark unit running");
        }

        debug!(
            unit_id = %claim.unit_id(),
            job_id = %claim.unit.job_id,
            worker = %claim.worker_name,
            "unit claimed"
        );
        Ok(Some(claim))
    }

    /// Keeps a claim alive inside the recovery inactivity window.
    pub async fn touch(&self, unit_id: &UnitId) -> Result<bool> {
        self.store.touch_claim(unit_id, Utc::now()).await
    }

    /// Moves the progress entry to its terminal state, then drops the reporter's claim.
    ///
    /// A claim held by another worker (the unit was recovered and handed out again) is left in
    /// place; that worker's own report releases it later.
    pub async fn report_result(&self, report: &UnitReport) -> Result<Settlement> {
        let now = Utc::now();
        let failed = report.outcome.is_failure();
        let updated = self
            .store
            .update_progress(
                report.job_id,
                &report.unit_id,
                &|entry: &mut ChunkStatus| -> Result<bool> {
                    if entry.is_terminal() {
                        return Ok(false);
                    }
                    entry.status = if failed {
                        ChunkState::Failed
                    } else {
                        ChunkState::Completed
                    };
                    entry.start_time.get_or_insert(now);
                    entry.end_time = Some(now);
                    entry.asset_count = report.counters.assets;
                    entry.finding_count = report.counters.findings;
                    entry.error_msg = report.outcome.error().map(str::to_string);
                    entry.worker_name = Some(report.worker_name.clone());
                    Ok(true)
                },
            )
            .await?;

        if !self
            .store
            .release_claim_held_by(&report.unit_id, &report.worker_name)
            .await?
        {
            debug!(
                unit_id = %report.unit_id,
                worker = %report.worker_name,
                "reporting worker holds no claim on the unit"
            );
        }

        self.metrics.reports.fetch_add(1, Ordering::Relaxed);
        if !updated.changed {
            debug!(unit_id = %report.unit_id, "unit already settled, report ignored");
        }

        Ok(Settlement {
            job_id: report.job_id,
            unit_id: report.unit_id.clone(),
            error: report.outcome.error().map(str::to_string),
            first_report: updated.changed,
        })
    }

    /// Returns a claimed unit to the queue with its attempt counter bumped.
    ///
    /// Returns false when the claim vanished in the meantime (the worker reported).
    pub async fn requeue(&self, claim: &UnitClaim, reason: &str) -> Result<bool> {
        let unit = claim.unit.next_attempt();
        if !self
            .store
            .requeue_claim(claim.unit_id(), &unit)
            .await
            .map_err(CoordinationError::into_dispatch)?
        {
            return Ok(false);
        }

        let reset = self
            .store
            .update_progress(
                unit.job_id,
                &unit.unit_id,
                &|entry: &mut ChunkStatus| -> Result<bool> {
                    if entry.is_terminal() {
                        return Ok(false);
                    }
                    entry.status = ChunkState::Queued;
                    entry.start_time = None;
                    entry.worker_name = None;
                    entry.error_msg = Some(reason.to_string());
                    entry.attempt = unit.attempt;
                    Ok(true)
                },
            )
            .await;
        if let Err(err) = reset {
            warn!(unit_id = %unit.unit_id, error = %err, "failed to reset progress for requeued unit");
        }
        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Drops a job's units that no worker holds yet.
    pub async fn purge_job(&self, job_id: JobId) -> Result<usize> {
        self.store.purge_job_units(job_id).await
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot> {
        let depth = self.store.queue_depth().await?;
        let claims = self.metrics.claims.load(Ordering::Relaxed);
        let polls = claims + self.metrics.empty_polls.load(Ordering::Relaxed);
        let latency = self.metrics.claim_latency_micros.load(Ordering::Relaxed);

        Ok(QueueSnapshot {
            sampled_at: Utc::now(),
            queued: depth.queued,
            claimed: depth.claimed,
            enqueued_total: self.metrics.enqueued.load(Ordering::Relaxed),
            claims_total: claims,
            empty_polls_total: self.metrics.empty_polls.load(Ordering::Relaxed),
            reports_total: self.metrics.reports.load(Ordering::Relaxed),
            mean_claim_latency_ms: if polls == 0 {
                0.0
            } else {
                latency as f64 / polls as f64 / 1_000.0
            },
        })
    }
}
