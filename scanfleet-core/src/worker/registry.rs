use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::LivenessConfig;
use crate::error::{CoordinationError, Result};
use crate::events::WORKER_CONTROL_CHANNEL;
use crate::store::CoordinationStore;
use crate::types::JobId;

use super::control::{CommandListener, ControlFlag, WorkerAction, WorkerCommand};
use super::status::{WorkerMove, WorkerStatus, WorkerView};

/// Tracks worker liveness from self-reported heartbeats and delivers administrative commands.
///
/// The registry never polls workers and never marks them offline; liveness is computed from
/// `last_report_time` whenever workers are read.
pub struct WorkerRegistry<S> {
    store: Arc<S>,
    liveness: LivenessConfig,
}

impl<S> Clone for WorkerRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            liveness: self.liveness,
        }
    }
}

impl<S> fmt::Debug for WorkerRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("store", &type_name::<S>())
            .field("liveness", &self.liveness)
            .finish()
    }
}

impl<S: CoordinationStore> WorkerRegistry<S> {
    pub fn new(store: Arc<S>, liveness: LivenessConfig) -> Self {
        Self { store, liveness }
    }

    /// Stores a heartbeat, stamping it with the coordinator's clock.
    pub async fn report_heartbeat(&self, mut status: WorkerStatus) -> Result<()> {
        if status.name.trim().is_empty() {
            return Err(CoordinationError::validation("worker name must not be empty"));
        }
        status.last_report_time = Utc::now();
        self.store.put_worker_status(&status).await?;
        debug!(
            worker = %status.name,
            running = status.running_count(),
            cpu = status.cpu_load,
            mem = status.mem_used,
            "heartbeat recorded"
        );
        Ok(())
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerView>> {
        self.list_workers_at(Utc::now()).await
    }

    /// Workers sorted by name with liveness derived against `now`.
    pub async fn list_workers_at(&self, now: DateTime<Utc>) -> Result<Vec<WorkerView>> {
        let window = self.liveness.stale_after();
        let mut views: Vec<WorkerView> = self
            .store
            .list_worker_statuses()
            .await?
            .into_iter()
            .map(|status| WorkerView::derive(status, now, window))
            .collect();
        views.sort_by(|a, b| a.status.name.cmp(&b.status.name));
        Ok(views)
    }

    pub async fn worker(&self, name: &str) -> Result<Option<WorkerView>> {
        let window = self.liveness.stale_after();
        Ok(self
            .store
            .get_worker_status(name)
            .await?
            .map(|status| WorkerView::derive(status, Utc::now(), window)))
    }

    /// Online workers with spare capacity, least loaded first.
    pub async fn available_workers(&self) -> Result<Vec<WorkerView>> {
        let mut views: Vec<WorkerView> = self
            .list_workers()
            .await?
            .into_iter()
            .filter(|view| view.available)
            .collect();
        views.sort_by(|a, b| a.load_score.total_cmp(&b.load_score));
        Ok(views)
    }

    /// Administrative removal of a worker record.
    pub async fn remove_worker(&self, name: &str) -> Result<bool> {
        let removed = self.store.remove_worker_status(name).await?;
        if removed {
            info!(worker = %name, "worker record removed");
        }
        Ok(removed)
    }

    /// Delivers `action` to `worker_name`.
    ///
    /// `rename` and `restart` also update the registry; the other actions are only broadcast.
    pub async fn send_control(&self, worker_name: &str, action: WorkerAction) -> Result<()> {
        match action {
            WorkerAction::Rename { new_name } => self.rename_worker(worker_name, &new_name).await,
            WorkerAction::Restart => self.restart_worker(worker_name).await,
            action => self.broadcast(WorkerCommand::new(worker_name, action)).await,
        }
    }

    /// Moves the worker's record and claims to `new_name`, then tells the worker.
    ///
    /// Fails with `NotFound` for an unknown worker and with a validation error when
    /// `new_name` is already registered. Both moves are undone if the command cannot be
    /// published.
    pub async fn rename_worker(&self, worker_name: &str, new_name: &str) -> Result<()> {
        let command = WorkerCommand::new(
            worker_name,
            WorkerAction::Rename {
                new_name: new_name.to_string(),
            },
        );
        command.validate()?;
        if worker_name == new_name {
            return Err(CoordinationError::validation(format!(
                "worker {worker_name} already has that name"
            )));
        }

        match self.store.move_worker_status(worker_name, new_name).await? {
            WorkerMove::Moved => {}
            WorkerMove::SourceMissing => {
                return Err(CoordinationError::not_found(format!("worker {worker_name}")));
            }
            WorkerMove::TargetTaken => {
                return Err(CoordinationError::validation(format!(
                    "worker name {new_name} is already in use"
                )));
            }
        }

        let published = match self.store.reassign_claims(worker_name, new_name).await {
            Ok(claims) => self.broadcast(command).await.map(|()| claims),
            Err(err) => Err(err),
        };
        match published {
            Ok(claims) => {
                info!(from = %worker_name, to = %new_name, claims, "worker renamed");
                Ok(())
            }
            Err(err) => {
                self.undo_rename(worker_name, new_name).await;
                Err(err)
            }
        }
    }

    async fn undo_rename(&self, worker_name: &str, new_name: &str) {
        if let Err(err) = self.store.reassign_claims(new_name, worker_name).await {
            warn!(worker = %worker_name, error = %err, "failed to hand claims back after rename failure");
        }
        if let Err(err) = self.store.move_worker_status(new_name, worker_name).await {
            warn!(worker = %worker_name, error = %err, "failed to restore worker name");
        }
    }

    /// Tells the worker to restart and drops its record; it reappears with its next heartbeat.
    pub async fn restart_worker(&self, worker_name: &str) -> Result<()> {
        self.broadcast(WorkerCommand::new(worker_name, WorkerAction::Restart))
            .await?;
        if self.store.remove_worker_status(worker_name).await? {
            debug!(worker = %worker_name, "worker record dropped for restart");
        }
        Ok(())
    }

    async fn broadcast(&self, command: WorkerCommand) -> Result<()> {
        command.validate()?;
        let payload = serde_json::to_string(&command)?;
        self.store.publish(WORKER_CONTROL_CHANNEL, &payload).await?;
        info!(worker = %command.worker_name, action = ?command.action, "control command sent");
        Ok(())
    }

    /// Worker-side subscription yielding only commands addressed to `worker_name`.
    pub async fn listen(&self, worker_name: &str) -> Result<CommandListener> {
        let subscription = self.store.subscribe(&[WORKER_CONTROL_CHANNEL]).await?;
        Ok(CommandListener::new(worker_name, subscription))
    }

    /// One-shot read of a job's control flag, for workers checking at a safe point.
    pub async fn job_control(&self, job_id: JobId) -> Result<Option<ControlFlag>> {
        self.store.control_flag(job_id).await
    }
}
