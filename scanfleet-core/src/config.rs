use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};
pub use crate::partition::ChunkConfig;

/// Global knobs that tune coordinator behaviour.
///
/// All fields carry defaults so a deployment only needs to spell out what it changes.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Partition bounds applied when a job starts.
    pub partition: ChunkConfig,
    /// Queue naming and claim scanning.
    pub queue: QueueConfig,
    /// Stale-claim recovery cadence and retry budget.
    pub recovery: RecoveryConfig,
    /// Heartbeat expectations for workers.
    pub liveness: LivenessConfig,
    /// Cron evaluation cadence.
    pub cron: CronConfig,
    /// Worker-side control flag polling.
    pub control: ControlConfig,
    /// In-process event fan-out.
    pub events: EventConfig,
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        crate::partition::validate_chunk_config(&self.partition)?;
        if self.queue.environment.trim().is_empty() {
            return Err(CoordinationError::validation("queue.environment must not be empty"));
        }
        if self.queue.claim_scan_batch == 0 {
            return Err(CoordinationError::validation("queue.claim_scan_batch must be positive"));
        }
        if self.liveness.stale_after_secs <= 0 {
            return Err(CoordinationError::validation("liveness.stale_after_secs must be positive"));
        }
        if self.recovery.reconcile_grace_secs < 0 {
            return Err(CoordinationError::validation(
                "recovery.reconcile_grace_secs must not be negative",
            ));
        }
        if self.recovery.inactivity_timeout_secs <= 0 {
            return Err(CoordinationError::validation(
                "recovery.inactivity_timeout_secs must be positive",
            ));
        }
        if self.recovery.interval_ms == 0 || self.cron.tick_interval_ms == 0 {
            return Err(CoordinationError::validation("loop intervals must be positive"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Environment label; one durable queue exists per environment.
    pub environment: String,
    /// Number of queued units inspected per step while looking for one a worker may claim.
    pub claim_scan_batch: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            environment: "default".to_string(),
            claim_scan_batch: 64,
        }
    }
}

/// Recovery sweep tuning for claimed-but-silent units.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Sweep cadence (ms)
    pub interval_ms: u64,
    /// A claim with no update for this long is recovered even if its worker still heartbeats (seconds)
    pub inactivity_timeout_secs: i64,
    /// Re-enqueues allowed per unit before it is failed terminally
    pub max_retries: u32,
    /// Quiet period before a job with unfinished transition cleanup is repaired (seconds)
    pub reconcile_grace_secs: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            inactivity_timeout_secs: 600,
            max_retries: 3,
            reconcile_grace_secs: 60,
        }
    }
}

impl RecoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn inactivity_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.inactivity_timeout_secs)
    }

    pub fn reconcile_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reconcile_grace_secs)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Workers silent for longer than this are offline (seconds)
    pub stale_after_secs: i64,
    /// Interval workers are expected to report at (seconds)
    pub heartbeat_interval_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 45,
            heartbeat_interval_secs: 30,
        }
    }
}

impl LivenessConfig {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// How often due definitions are evaluated (ms)
    pub tick_interval_ms: u64,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
        }
    }
}

impl CronConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// How often a running unit re-reads its job control flag (ms)
    pub flag_poll_interval_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            flag_poll_interval_ms: 1_000,
        }
    }
}

impl ControlConfig {
    pub fn flag_poll_interval(&self) -> Duration {
        Duration::from_millis(self.flag_poll_interval_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Broadcast capacity of the in-process job event bus
    pub capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        CoordinatorConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"recovery": {"max_retries": 5}}"#).expect("parse");
        assert_eq!(config.recovery.max_retries, 5);
        assert_eq!(config.recovery.interval_ms, 30_000);
        assert_eq!(config.liveness.stale_after_secs, 45);
        assert_eq!(config.queue.environment, "default");
    }

    #[test]
    fn rejects_empty_environment() {
        let mut config = CoordinatorConfig::default();
        config.queue.environment = "  ".into();
        assert!(config.validate().is_err());
    }
}
