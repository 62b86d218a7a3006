use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::JobUnit;
use crate::partition::tokenize;
use crate::store::{Mutation, Updated};
use crate::types::{JobId, UnitId};

/// Per-unit tracking records, grouped by job.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Inserts or replaces the given entries.
    async fn put_progress(&self, job_id: JobId, entries: &[ChunkStatus]) -> Result<()>;

    /// Applies `mutate` to one entry atomically. Fails with `NotFound` for unknown units.
    async fn update_progress(
        &self,
        job_id: JobId,
        unit_id: &UnitId,
        mutate: Mutation<'_, ChunkStatus>,
    ) -> Result<Updated<ChunkStatus>>;

    /// Entries ordered by unit index.
    async fn list_progress(&self, job_id: JobId) -> Result<Vec<ChunkStatus>>;

    async fn remove_progress(&self, job_id: JobId) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl ChunkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkState::Completed | ChunkState::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkStatus {
    pub unit_id: UnitId,
    pub index: usize,
    pub status: ChunkState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub target_count: usize,
    pub asset_count: u64,
    pub finding_count: u64,
    pub error_msg: Option<String>,
    pub worker_name: Option<String>,
    #[serde(default)]
    pub attempt: u32,
}

impl ChunkStatus {
    pub fn queued(unit: &JobUnit) -> Self {
        Self {
            unit_id: unit.unit_id.clone(),
            index: unit.index,
            status: ChunkState::Queued,
            start_time: None,
            end_time: None,
            target_count: tokenize(unit.targets()).len(),
            asset_count: 0,
            finding_count: 0,
            error_msg: None,
            worker_name: None,
            attempt: unit.attempt,
        }
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Aggregate view of a job's units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub total_units: usize,
    /// Units with a terminal outcome, failures included.
    pub completed_units: usize,
    pub succeeded_units: usize,
    pub failed_units: usize,
    pub running_units: usize,
    pub queued_units: usize,
    pub completion_rate: f64,
}

impl ProgressSummary {
    pub fn from_entries(entries: &[ChunkStatus]) -> Self {
        let mut summary = Self {
            total_units: entries.len(),
            ..Self::default()
        };
        for entry in entries {
            match entry.status {
                ChunkState::Queued => summary.queued_units += 1,
                ChunkState::Running => summary.running_units += 1,
                ChunkState::Completed => summary.succeeded_units += 1,
                ChunkState::Failed => summary.failed_units += 1,
            }
        }
        summary.completed_units = summary.succeeded_units + summary.failed_units;
        if summary.total_units > 0 {
            summary.completion_rate = summary.completed_units as f64 / summary.total_units as f64;
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: usize, status: ChunkState) -> ChunkStatus {
        ChunkStatus {
            unit_id: UnitId(format!("job-{index}")),
            index,
            status,
            start_time: None,
            end_time: None,
            target_count: 1,
            asset_count: 0,
            finding_count: 0,
            error_msg: None,
            worker_name: None,
            attempt: 0,
        }
    }

    #[test]
    fn failed_units_count_towards_completion() {
        let entries = vec![
            entry(0, ChunkState::Completed),
            entry(1, ChunkState::Completed),
            entry(2, ChunkState::Failed),
        ];
        let summary = ProgressSummary::from_entries(&entries);
        assert_eq!(summary.completed_units, 3);
        assert_eq!(summary.failed_units, 1);
        assert!((summary.completion_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_job_has_zero_rate() {
        let summary = ProgressSummary::from_entries(&[]);
        assert_eq!(summary.completion_rate, 0.0);
    }

    #[test]
    fn partial_progress() {
        let entries = vec![
            entry(0, ChunkState::Completed),
            entry(1, ChunkState::Running),
            entry(2, ChunkState::Queued),
            entry(3, ChunkState::Queued),
        ];
        let summary = ProgressSummary::from_entries(&entries);
        assert_eq!(summary.running_units, 1);
        assert_eq!(summary.queued_units, 2);
        assert!((summary.completion_rate - 0.25).abs() < f64::EPSILON);
    }
}
