use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoordinationError, Result};
use crate::partition::ChunkConfig;
use crate::types::{JobId, UnitId};

/// Result string recorded when an operator stops a job.
pub const STOPPED_MANUALLY: &str = "stopped manually";

/// Authoritative lifecycle status of a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Pending,
    Started,
    Paused,
    Stopped,
    Success,
    Failure,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::Pending => "PENDING",
            JobStatus::Started => "STARTED",
            JobStatus::Paused => "PAUSED",
            JobStatus::Stopped => "STOPPED",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure | JobStatus::Stopped)
    }

    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Created, Pending)
                | (Pending, Started)
                | (Started, Paused)
                | (Paused, Pending)
                | (Started | Paused | Pending, Stopped)
                | (Started, Success)
                | (Started, Failure)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as persisted by the platform, reduced to what coordination needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub workspace_id: String,
    pub name: String,
    /// Newline separated target spec.
    pub target: String,
    /// Opaque scan parameters; copied into every unit with the target rewritten.
    pub config: Value,
    pub priority: i32,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    pub status: JobStatus,
    pub unit_count: u32,
    /// Units that reached a terminal outcome, failed ones included.
    pub units_completed: u32,
    pub units_failed: u32,
    /// Blob a worker persisted before pausing; replayed as `config.resumeState`.
    #[serde(default)]
    pub saved_state: Option<Value>,
    /// Bounds used when the job was partitioned, kept so resume rebuilds identical units.
    #[serde(default)]
    pub chunking: Option<ChunkConfig>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    /// Set by a transition whose queue and progress side effects have not all landed yet.
    #[serde(default)]
    pub cleanup_pending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(
        workspace_id: impl Into<String>,
        name: impl Into<String>,
        target: impl Into<String>,
        config: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            workspace_id: workspace_id.into(),
            name: name.into(),
            target: target.into(),
            config,
            priority: 0,
            required_capabilities: Vec::new(),
            status: JobStatus::Created,
            unit_count: 0,
            units_completed: 0,
            units_failed: 0,
            saved_state: None,
            chunking: None,
            last_error: None,
            result: None,
            cleanup_pending: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_required_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Moves to `next`, rejecting any edge the state machine does not define.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(self.conflict(next));
        }
        let now = Utc::now();
        if next == JobStatus::Started && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn conflict(&self, requested: JobStatus) -> CoordinationError {
        CoordinationError::StateConflict {
            job_id: self.id,
            current: self.status,
            requested,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.unit_count > 0 && self.units_completed >= self.unit_count
    }

    /// Counts one terminal unit outcome and finishes the job once every unit has reported.
    ///
    /// Returns the terminal status when this outcome completed the job.
    pub fn record_unit_outcome(&mut self, error: Option<&str>) -> Result<Option<JobStatus>> {
        if self.units_completed >= self.unit_count {
            return self.finish_if_settled();
        }
        self.units_completed += 1;
        if let Some(error) = error {
            self.units_failed += 1;
            self.last_error = Some(error.to_string());
        }
        self.updated_at = Utc::now();
        self.finish_if_settled()
    }

    /// Applies the aggregate rule: SUCCESS iff no unit failed, otherwise FAILURE.
    pub fn finish_if_settled(&mut self) -> Result<Option<JobStatus>> {
        if !self.is_settled() {
            return Ok(None);
        }
        if self.status == JobStatus::Pending {
            self.transition(JobStatus::Started)?;
        }
        if self.status != JobStatus::Started {
            return Ok(None);
        }
        let outcome = if self.units_failed == 0 {
            JobStatus::Success
        } else {
            JobStatus::Failure
        };
        self.transition(outcome)?;
        Ok(Some(outcome))
    }

    /// Scan config with `workers` interpreted as the unit allow-list.
    pub fn eligible_workers(&self) -> Vec<String> {
        self.config
            .get("workers")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The schedulable unit pushed to the queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUnit {
    pub unit_id: UnitId,
    pub job_id: JobId,
    pub workspace_id: String,
    pub name: String,
    pub index: usize,
    pub config: Value,
    pub priority: i32,
    #[serde(default)]
    pub eligible_workers: Vec<String>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Number of times the unit has been re-enqueued by recovery.
    #[serde(default)]
    pub attempt: u32,
}

impl JobUnit {
    /// Whether a worker with this name and capability set may claim the unit.
    pub fn is_claimable_by<'a, I>(&self, worker_name: &str, capabilities: I) -> bool
    where
        I: IntoIterator<Item = &'a String> + Clone,
    {
        let listed = self.eligible_workers.is_empty()
            || self.eligible_workers.iter().any(|name| name == worker_name);
        listed
            && self
                .required_capabilities
                .iter()
                .all(|needed| capabilities.clone().into_iter().any(|cap| cap == needed))
    }

    pub fn targets(&self) -> &str {
        self.config.get("target").and_then(Value::as_str).unwrap_or("")
    }

    #[must_use]
    pub fn next_attempt(&self) -> Self {
        let mut unit = self.clone();
        unit.attempt += 1;
        unit
    }
}

/// Terminal outcome a worker reports for a unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum UnitOutcome {
    Completed,
    Failed { error: String },
}

impl UnitOutcome {
    pub fn error(&self) -> Option<&str> {
        match self {
            UnitOutcome::Completed => None,
            UnitOutcome::Failed { error } => Some(error),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, UnitOutcome::Failed { .. })
    }
}

/// Result counters a worker reports alongside the outcome.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitCounters {
    pub assets: u64,
    pub findings: u64,
}

/// Worker report for one claimed unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitReport {
    pub job_id: JobId,
    pub unit_id: UnitId,
    pub worker_name: String,
    pub outcome: UnitOutcome,
    #[serde(default)]
    pub counters: UnitCounters,
}

impl UnitReport {
    pub fn completed(unit: &JobUnit, worker_name: impl Into<String>, counters: UnitCounters) -> Self {
        Self {
            job_id: unit.job_id,
            unit_id: unit.unit_id.clone(),
            worker_name: worker_name.into(),
            outcome: UnitOutcome::Completed,
            counters,
        }
    }

    pub fn failed(unit: &JobUnit, worker_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            job_id: unit.job_id,
            unit_id: unit.unit_id.clone(),
            worker_name: worker_name.into(),
            outcome: UnitOutcome::Failed {
                error: error.into(),
            },
            counters: UnitCounters::default(),
        }
    }
}
