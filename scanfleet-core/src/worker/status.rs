use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Workers silent for longer than this many seconds are reported offline.
pub const DEFAULT_STALE_AFTER_SECS: i64 = 45;

/// CPU and memory usage (percent) above which a worker is not offered new work.
const RESOURCE_CEILING: f64 = 90.0;

/// Storage for self-reported worker status records (`worker:{name}`).
#[async_trait]
pub trait WorkerStatusStore: Send + Sync {
    async fn put_worker_status(&self, status: &WorkerStatus) -> Result<()>;

    async fn get_worker_status(&self, name: &str) -> Result<Option<WorkerStatus>>;

    async fn list_worker_statuses(&self) -> Result<Vec<WorkerStatus>>;

    async fn remove_worker_status(&self, name: &str) -> Result<bool>;

    /// Atomically moves the record stored under `from` to `to`, rewriting its name.
    async fn move_worker_status(&self, from: &str, to: &str) -> Result<WorkerMove>;
}

/// Outcome of [`WorkerStatusStore::move_worker_status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerMove {
    Moved,
    SourceMissing,
    TargetTaken,
}

/// Status blob a worker writes on every heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub name: String,
    #[serde(default)]
    pub ip: String,
    /// CPU usage in percent.
    #[serde(default)]
    pub cpu_load: f64,
    /// Memory usage in percent.
    #[serde(default)]
    pub mem_used: f64,
    /// Maximum units the worker runs in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default)]
    pub tasks_claimed: u64,
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default)]
    pub tools: BTreeMap<String, bool>,
    pub last_report_time: DateTime<Utc>,
}

fn default_concurrency() -> u32 {
    1
}

impl WorkerStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip: String::new(),
            cpu_load: 0.0,
            mem_used: 0.0,
            concurrency: default_concurrency(),
            tasks_claimed: 0,
            tasks_completed: 0,
            tools: BTreeMap::new(),
            last_report_time: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_tool(mut self, tool: impl Into<String>, available: bool) -> Self {
        self.tools.insert(tool.into(), available);
        self
    }

    pub fn running_count(&self) -> u64 {
        self.tasks_claimed.saturating_sub(self.tasks_completed)
    }

    pub fn is_saturated(&self) -> bool {
        self.concurrency > 0 && self.running_count() >= u64::from(self.concurrency)
    }

    /// Lower is better: weighs running units over CPU over memory.
    pub fn load_score(&self) -> f64 {
        self.running_count() as f64 * 0.5 + self.cpu_load * 0.3 + self.mem_used * 0.2
    }

    /// Tools the worker reports as usable.
    pub fn capabilities(&self) -> BTreeSet<String> {
        self.tools
            .iter()
            .filter(|(_, available)| **available)
            .map(|(tool, _)| tool.clone())
            .collect()
    }
}

/// Liveness is derived at read time: a worker is offline once `now - last_seen` exceeds `window`.
pub fn is_stale(now: DateTime<Utc>, last_seen: DateTime<Utc>, window: chrono::Duration) -> bool {
    now - last_seen > window
}

/// A worker as presented to operators, with liveness and load derived at read time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerView {
    pub status: WorkerStatus,
    pub online: bool,
    pub running_count: u64,
    pub load_score: f64,
    pub available: bool,
}

impl WorkerView {
    pub fn derive(status: WorkerStatus, now: DateTime<Utc>, window: chrono::Duration) -> Self {
        let online = !is_stale(now, status.last_report_time, window);
        let available = online
            && !status.is_saturated()
            && status.cpu_load <= RESOURCE_CEILING
            && status.mem_used <= RESOURCE_CEILING;
        Self {
            online,
            running_count: status.running_count(),
            load_score: status.load_score(),
            available,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn window() -> Duration {
        Duration::seconds(DEFAULT_STALE_AFTER_SECS)
    }

    #[test]
    fn stale_after_45_seconds() {
        let now = Utc::now();
        assert!(is_stale(now, now - Duration::seconds(46), window()));
        assert!(!is_stale(now, now - Duration::seconds(44), window()));
        assert!(!is_stale(now, now - Duration::seconds(45), window()));
    }

    #[test]
    fn running_count_saturates() {
        let mut status = WorkerStatus::new("w1").with_concurrency(2);
        status.tasks_claimed = 3;
        status.tasks_completed = 5;
        assert_eq!(status.running_count(), 0);
        status.tasks_completed = 1;
        assert!(status.is_saturated());
    }

    #[test]
    fn busy_or_hot_workers_are_unavailable() {
        let now = Utc::now();
        let mut status = WorkerStatus::new("w1").with_concurrency(4);
        status.cpu_load = 95.0;
        assert!(!WorkerView::derive(status.clone(), now, window()).available);
        status.cpu_load = 20.0;
        let view = WorkerView::derive(status, now, window());
        assert!(view.online && view.available);
        assert!((view.load_score - 6.0).abs() < 1e-9);
    }

    #[test]
    fn capabilities_only_include_available_tools() {
        let status = WorkerStatus::new("w1")
            .with_tool("nuclei", true)
            .with_tool("masscan", false);
        assert_eq!(
            status.capabilities().into_iter().collect::<Vec<_>>(),
            vec!["nuclei".to_string()]
        );
    }

    #[test]
    fn wire_format_is_camel_case() {
        let json = serde_json::to_value(WorkerStatus::new("w1")).expect("serialize");
        assert!(json.get("lastReportTime").is_some());
        assert!(json.get("tasksClaimed").is_some());
    }
}
