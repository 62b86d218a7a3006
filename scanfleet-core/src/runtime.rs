//! Wiring of the coordination services and their background loops.

use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CoordinatorConfig;
use crate::cron::{CronScheduler, CronService};
use crate::dispatch::{Dispatcher, RecoverySweeper};
use crate::error::{CoordinationError, Result};
use crate::events::{InProcJobEventBus, JobEventPublisher};
use crate::job::JobController;
use crate::store::CoordinationStore;
use crate::types::JobId;
use crate::worker::{ControlWatch, WorkerRegistry};

/// One coordinator instance over a shared store.
///
/// The services are cheap handles and may be cloned out freely. [`Coordinator::start`] spawns
/// the stale-claim sweeper and the cron loop; [`Coordinator::shutdown`] stops both.
pub struct Coordinator<S> {
    store: Arc<S>,
    config: CoordinatorConfig,
    events: Arc<InProcJobEventBus>,
    jobs: JobController<S>,
    workers: WorkerRegistry<S>,
    crons: CronService<S>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S> fmt::Debug for Coordinator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("store", &type_name::<S>())
            .field("config", &self.config)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl<S: CoordinationStore> Coordinator<S> {
    pub fn new(store: Arc<S>, config: CoordinatorConfig) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(InProcJobEventBus::new(config.events.capacity));
        let publisher: Arc<dyn JobEventPublisher> = events.clone();
        let dispatcher = Dispatcher::new(Arc::clone(&store)).with_liveness(config.liveness);
        let jobs = JobController::new(
            Arc::clone(&store),
            dispatcher,
            config.partition,
            publisher,
        );
        let workers = WorkerRegistry::new(Arc::clone(&store), config.liveness);
        let crons = CronService::new(Arc::clone(&store));

        Ok(Self {
            store,
            config,
            events,
            jobs,
            workers,
            crons,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn jobs(&self) -> &JobController<S> {
        &self.jobs
    }

    pub fn dispatcher(&self) -> &Dispatcher<S> {
        self.jobs.dispatcher()
    }

    pub fn workers(&self) -> &WorkerRegistry<S> {
        &self.workers
    }

    pub fn crons(&self) -> &CronService<S> {
        &self.crons
    }

    pub fn events(&self) -> &Arc<InProcJobEventBus> {
        &self.events
    }

    /// Sweeper bound to this coordinator's jobs and tuning.
    pub fn recovery(&self) -> RecoverySweeper<S> {
        RecoverySweeper::new(
            Arc::clone(&self.store),
            self.jobs.clone(),
            self.config.recovery,
            self.config.liveness,
        )
    }

    /// Cron loop that launches fired definitions through this coordinator's jobs.
    pub fn cron_scheduler(&self) -> CronScheduler<S, JobController<S>> {
        CronScheduler::new(
            Arc::clone(&self.store),
            Arc::new(self.jobs.clone()),
            self.config.cron.tick_interval(),
        )
    }

    /// Starts watching a job's control flag on behalf of a running unit.
    pub fn watch_job(&self, job_id: JobId) -> ControlWatch {
        ControlWatch::spawn(
            Arc::clone(&self.store),
            job_id,
            self.config.control.flag_poll_interval(),
        )
    }

    /// Spawns the background loops. Fails if they are already running.
    pub async fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return Err(CoordinationError::Internal(
                "coordinator already started".to_string(),
            ));
        }
        if self.shutdown.is_cancelled() {
            return Err(CoordinationError::Internal(
                "coordinator was shut down".to_string(),
            ));
        }

        handles.push(self.recovery().spawn(self.shutdown.child_token()));
        handles.push(self.cron_scheduler().spawn(self.shutdown.child_token()));
        info!(
            environment = %self.config.queue.environment,
            recovery_interval_ms = self.config.recovery.interval_ms,
            cron_tick_ms = self.config.cron.tick_interval_ms,
            "coordinator started"
        );
        Ok(())
    }

    /// Stops the background loops and waits for them to exit.
    pub async fn shutdown(&self) {
        info!("initiating coordinator shutdown");
        self.shutdown.cancel();

        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        info!("coordinator shutdown complete");
    }
}
