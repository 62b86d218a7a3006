use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::JobUnit;
use crate::types::{JobId, UnitId};

/// Durable, priority-ordered unit queue with claim tracking.
///
/// Units are served by descending priority over the whole `i32` range, then by enqueue order.
/// Claiming removes a unit from the queue and records who holds it in one atomic step, so
/// concurrent callers never share a unit.
#[async_trait]
pub trait UnitQueue: Send + Sync {
    /// Appends units in order. The batch becomes visible atomically.
    ///
    /// A unit id is queued at most once: pushing an id that is already waiting replaces the
    /// waiting entry and moves it to the back of its priority.
    async fn push_units(&self, units: &[JobUnit]) -> Result<()>;

    /// Pops the first unit `request` may claim and records the claim.
    async fn claim_unit(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<UnitClaim>>;

    /// Refreshes the claim's activity timestamp. Returns false when no claim exists.
    async fn touch_claim(&self, unit_id: &UnitId, now: DateTime<Utc>) -> Result<bool>;

    /// Drops a claim, returning it when it existed.
    async fn release_claim(&self, unit_id: &UnitId) -> Result<Option<UnitClaim>>;

    /// Drops the claim only while `worker_name` holds it. Returns true when it was dropped.
    async fn release_claim_held_by(&self, unit_id: &UnitId, worker_name: &str) -> Result<bool>;

    /// Moves every claim held by `from` over to `to`. Returns how many moved.
    async fn reassign_claims(&self, from: &str, to: &str) -> Result<usize>;

    /// Atomically drops the claim and enqueues `unit` again.
    /// Returns false when the claim had already been released.
    async fn requeue_claim(&self, unit_id: &UnitId, unit: &JobUnit) -> Result<bool>;

    async fn list_claims(&self) -> Result<Vec<UnitClaim>>;

    /// Removes every still-queued unit of a job; claims are left alone.
    async fn purge_job_units(&self, job_id: JobId) -> Result<usize>;

    async fn queue_depth(&self) -> Result<QueueDepth>;

    /// Number of still-queued units per job.
    async fn queued_per_job(&self) -> Result<HashMap<JobId, usize>>;
}

/// A worker asking for work.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub worker_name: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl ClaimRequest {
    pub fn new(worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: worker_name.into(),
            capabilities: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn admits(&self, unit: &JobUnit) -> bool {
        unit.is_claimable_by(&self.worker_name, &self.capabilities)
    }
}

/// Record of a unit held by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitClaim {
    pub unit: JobUnit,
    pub worker_name: String,
    pub claimed_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl UnitClaim {
    pub fn new(unit: JobUnit, worker_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            unit,
            worker_name: worker_name.into(),
            claimed_at: now,
            last_update: now,
        }
    }

    pub fn unit_id(&self) -> &UnitId {
        &self.unit.unit_id
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_update
    }
}

/// Instantaneous queue occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub queued: usize,
    pub claimed: usize,
}
