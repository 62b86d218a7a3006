use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CoordinationError, Result};
use crate::events::{BrokerMessage, Subscription};
use crate::types::JobId;

/// Level-triggered per-job signal stored under `task:ctrl:{jobId}`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlFlag {
    /// Persist resumable state and leave the unit.
    Pause,
    /// Abandon the unit; nothing will resume it.
    Stop,
}

impl ControlFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlFlag::Pause => "PAUSE",
            ControlFlag::Stop => "STOP",
        }
    }
}

impl fmt::Display for ControlFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlFlag {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "PAUSE" => Ok(ControlFlag::Pause),
            "STOP" => Ok(ControlFlag::Stop),
            other => Err(CoordinationError::validation(format!(
                "unknown control flag '{other}'"
            ))),
        }
    }
}

/// Storage for per-job control flags. Absence means "running normally".
#[async_trait]
pub trait ControlFlagStore: Send + Sync {
    async fn set_control_flag(&self, job_id: JobId, flag: ControlFlag) -> Result<()>;

    async fn clear_control_flag(&self, job_id: JobId) -> Result<()>;

    async fn control_flag(&self, job_id: JobId) -> Result<Option<ControlFlag>>;
}

/// Administrative action carried on the worker control channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum WorkerAction {
    Stop,
    Restart,
    Rename {
        #[serde(rename = "newName")]
        new_name: String,
    },
    SetConcurrency {
        concurrency: u32,
    },
}

/// Broadcast envelope: `{"action": ..., "workerName": ..., ...params}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    #[serde(rename = "workerName")]
    pub worker_name: String,
    #[serde(flatten)]
    pub action: WorkerAction,
}

impl WorkerCommand {
    pub fn new(worker_name: impl Into<String>, action: WorkerAction) -> Self {
        Self {
            worker_name: worker_name.into(),
            action,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_name.trim().is_empty() {
            return Err(CoordinationError::validation("worker name must not be empty"));
        }
        match &self.action {
            WorkerAction::Rename { new_name } if new_name.trim().is_empty() => Err(
                CoordinationError::validation("rename requires a non-empty new name"),
            ),
            WorkerAction::SetConcurrency { concurrency: 0 } => Err(
                CoordinationError::validation("concurrency must be positive"),
            ),
            _ => Ok(()),
        }
    }
}

/// Worker-side view of the control channel that only yields commands addressed to this worker.
///
/// A `rename` addressed to the worker also retargets the listener to the new name.
#[derive(Debug)]
pub struct CommandListener {
    worker_name: String,
    subscription: Subscription,
}

impl CommandListener {
    pub fn new(worker_name: impl Into<String>, subscription: Subscription) -> Self {
        Self {
            worker_name: worker_name.into(),
            subscription,
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    /// Waits for the next command for this worker; `None` once the channel closed.
    pub async fn next_command(&mut self) -> Option<WorkerAction> {
        while let Some(BrokerMessage { payload, .. }) = self.subscription.next_message().await {
            let command: WorkerCommand = match serde_json::from_str(&payload) {
                Ok(command) => command,
                Err(err) => {
                    warn!(error = %err, "discarding malformed control envelope");
                    continue;
                }
            };
            if command.worker_name != self.worker_name {
                continue;
            }
            if let WorkerAction::Rename { new_name } = &command.action {
                debug!(from = %self.worker_name, to = %new_name, "control listener renamed");
                self.worker_name = new_name.clone();
            }
            return Some(command.action);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelopes_match_the_wire_contract() {
        let rename = WorkerCommand::new(
            "w1",
            WorkerAction::Rename {
                new_name: "w2".into(),
            },
        );
        assert_eq!(
            serde_json::to_value(&rename).expect("serialize"),
            json!({"action": "rename", "workerName": "w1", "newName": "w2"})
        );

        let parsed: WorkerCommand = serde_json::from_value(
            json!({"action": "setConcurrency", "workerName": "w1", "concurrency": 8}),
        )
        .expect("parse");
        assert_eq!(parsed.action, WorkerAction::SetConcurrency { concurrency: 8 });

        let stop: WorkerCommand =
            serde_json::from_str(r#"{"action":"stop","workerName":"w9"}"#).expect("parse");
        assert_eq!(stop.action, WorkerAction::Stop);
    }

    #[test]
    fn flags_use_literal_values() {
        assert_eq!(ControlFlag::Pause.to_string(), "PAUSE");
        assert_eq!("STOP".parse::<ControlFlag>().expect("parse"), ControlFlag::Stop);
        assert!("RESUME".parse::<ControlFlag>().is_err());
    }

    #[test]
    fn validation_rejects_empty_rename() {
        let command = WorkerCommand::new(
            "w1",
            WorkerAction::Rename {
                new_name: " ".into(),
            },
        );
        assert!(command.validate().is_err());
        assert!(
            WorkerCommand::new("w1", WorkerAction::SetConcurrency { concurrency: 0 })
                .validate()
                .is_err()
        );
    }
}
