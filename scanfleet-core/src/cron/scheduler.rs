use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CoordinationError, Result};
use crate::events::{
    BrokerMessage, CRON_RELOAD_CHANNEL, CRON_REMOVE_CHANNEL, CRON_RUNNOW_CHANNEL, Subscription,
};
use crate::job::JobRecord;
use crate::store::CoordinationStore;
use crate::types::{CronId, JobId};

use super::definition::{CronDefinition, JobTemplate};

/// Ticks between full reloads of the definition cache from the store.
const RESYNC_EVERY_TICKS: u64 = 60;

/// The start path a fired definition goes through: create the job, then start it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobLauncher: Send + Sync {
    async fn launch(&self, template: &JobTemplate, name: String) -> Result<JobRecord>;
}

/// Background loop that fires due definitions.
///
/// Enabled definitions are cached in memory and refreshed from `cron:reload`, `cron:remove`
/// and `cron:runnow` signals plus a periodic resync.
pub struct CronScheduler<S, L> {
    store: Arc<S>,
    launcher: Arc<L>,
    tick_interval: Duration,
    cache: Mutex<HashMap<CronId, CronDefinition>>,
}

impl<S, L> fmt::Debug for CronScheduler<S, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronScheduler")
            .field("store", &type_name::<S>())
            .field("launcher", &type_name::<L>())
            .field("tick_interval", &self.tick_interval)
            .finish_non_exhaustive()
    }
}

impl<S, L> CronScheduler<S, L>
where
    S: CoordinationStore,
    L: JobLauncher + 'static,
{
    pub fn new(store: Arc<S>, launcher: Arc<L>, tick_interval: Duration) -> Self {
        Self {
            store,
            launcher,
            tick_interval,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the cache with every enabled definition in the store.
    pub async fn reload_all(&self) -> Result<usize> {
        let now = Utc::now();
        let mut fresh = HashMap::new();
        for definition in self.store.list_crons().await? {
            if !definition.is_enabled() {
                continue;
            }
            let definition = if definition.next_run_time.is_none() {
                let scheduled = self
                    .store
                    .update_cron(definition.id, &|current: &mut CronDefinition| -> Result<bool> {
                        if current.next_run_time.is_some() || !current.is_enabled() {
                            return Ok(false);
                        }
                        current.refresh_next_run(now)?;
                        Ok(true)
                    })
                    .await;
                match scheduled {
                    Ok(updated) if updated.value.is_enabled() => updated.value,
                    Ok(_) => continue,
                    Err(err) if err.is_not_found() => continue,
                    Err(err) => return Err(err),
                }
            } else {
                definition
            };
            fresh.insert(definition.id, definition);
        }
        let loaded = fresh.len();
        *self.cache.lock().await = fresh;
        debug!(loaded, "cron definitions loaded");
        Ok(loaded)
    }

    pub async fn reload_one(&self, id: CronId) -> Result<()> {
        let definition = self.store.get_cron(id).await?;
        self.cache_definition(id, definition).await;
        Ok(())
    }

    async fn cache_definition(&self, id: CronId, definition: Option<CronDefinition>) {
        let mut cache = self.cache.lock().await;
        match definition {
            Some(definition) if definition.is_enabled() => {
                cache.insert(id, definition);
            }
            _ => {
                cache.remove(&id);
            }
        }
    }

    /// Number of enabled definitions currently tracked.
    pub async fn tracked(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Fires every cached definition that is due at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let due: Vec<CronId> = self
            .cache
            .lock()
            .await
            .values()
            .filter(|definition| definition.is_due(now))
            .map(|definition| definition.id)
            .collect();

        let mut launched = Vec::new();
        for id in due {
            match self.fire(id, now).await {
                Ok(Some(job_id)) => launched.push(job_id),
                Ok(None) => {}
                Err(err) => warn!(cron_id = %id, error = %err, "cron fire failed"),
            }
        }
        Ok(launched)
    }

    async fn fire(&self, id: CronId, now: DateTime<Utc>) -> Result<Option<JobId>> {
        let Some(definition) = self.store.get_cron(id).await? else {
            self.cache_definition(id, None).await;
            return Ok(None);
        };
        if !definition.is_due(now) {
            self.cache_definition(id, Some(definition)).await;
            return Ok(None);
        }

        let launched = match self
            .launcher
            .launch(&definition.template, definition.job_name(now))
            .await
        {
            Ok(job) => {
                info!(cron_id = %id, job_id = %job.id, name = %definition.name, "cron fired");
                Some(job.id)
            }
            Err(err) => {
                warn!(cron_id = %id, error = %err, "cron launch failed");
                None
            }
        };

        // An edit made while the job launched keeps its new schedule.
        let fired_slot = definition.next_run_time;
        let recorded = self
            .store
            .update_cron(id, &|current: &mut CronDefinition| -> Result<bool> {
                if current.next_run_time == fired_slot {
                    current.record_fire(now)?;
                } else {
                    current.record_manual_run(now);
                }
                Ok(true)
            })
            .await;
        match recorded {
            Ok(updated) => self.cache_definition(id, Some(updated.value)).await,
            Err(err) if err.is_not_found() => self.cache_definition(id, None).await,
            Err(err) => return Err(err),
        }
        Ok(launched)
    }

    /// Launches a definition immediately without touching its schedule.
    pub async fn run_now(&self, id: CronId) -> Result<JobId> {
        let definition = self
            .store
            .get_cron(id)
            .await?
            .ok_or_else(|| CoordinationError::not_found(format!("cron definition {id}")))?;
        let now = Utc::now();
        let job = self
            .launcher
            .launch(&definition.template, definition.job_name(now))
            .await?;

        let recorded = self
            .store
            .update_cron(id, &|current: &mut CronDefinition| -> Result<bool> {
                current.record_manual_run(now);
                Ok(true)
            })
            .await;
        match recorded {
            Ok(updated) => self.cache_definition(id, Some(updated.value)).await,
            Err(err) if err.is_not_found() => self.cache_definition(id, None).await,
            Err(err) => return Err(err),
        }
        info!(cron_id = %id, job_id = %job.id, "cron run on demand");
        Ok(job.id)
    }

    /// Applies one edit notification.
    pub async fn handle_signal(&self, message: &BrokerMessage) -> Result<()> {
        let id: CronId = message.payload.parse()?;
        match message.channel.as_str() {
            CRON_RELOAD_CHANNEL => self.reload_one(id).await,
            CRON_REMOVE_CHANNEL => {
                self.cache_definition(id, None).await;
                Ok(())
            }
            CRON_RUNNOW_CHANNEL => self.run_now(id).await.map(|_| ()),
            other => {
                debug!(channel = other, "ignoring message on unexpected channel");
                Ok(())
            }
        }
    }

    /// Evaluates definitions every tick and applies signals until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        if let Err(err) = self.reload_all().await {
            warn!(error = %err, "initial cron load failed");
        }
        let mut signals = match self
            .store
            .subscribe(&[CRON_RELOAD_CHANNEL, CRON_REMOVE_CHANNEL, CRON_RUNNOW_CHANNEL])
            .await
        {
            Ok(subscription) => Some(subscription),
            Err(err) => {
                warn!(error = %err, "cron signals unavailable, relying on resync");
                None
            }
        };

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("cron scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    ticks += 1;
                    if ticks % RESYNC_EVERY_TICKS == 0
                        && let Err(err) = self.reload_all().await
                    {
                        warn!(error = %err, "cron resync failed");
                    }
                    if let Err(err) = self.tick(Utc::now()).await {
                        warn!(error = %err, "cron tick failed");
                    }
                }
                message = next_signal(&mut signals) => match message {
                    Some(message) => {
                        if let Err(err) = self.handle_signal(&message).await {
                            warn!(channel = %message.channel, error = %err, "cron signal failed");
                        }
                    }
                    None => {
                        warn!("cron signal subscription closed, relying on resync");
                        signals = None;
                    }
                },
            }
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

async fn next_signal(signals: &mut Option<Subscription>) -> Option<BrokerMessage> {
    match signals {
        Some(subscription) => subscription.next_message().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::{CronStatus, CronStore};
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn template() -> JobTemplate {
        JobTemplate::new("ws", "10.0.0.1", json!({}))
    }

    async fn seed(store: &MemoryStore, mut definition: CronDefinition, next: DateTime<Utc>) -> CronId {
        definition.next_run_time = Some(next);
        store.put_cron(&definition).await.expect("put");
        definition.id
    }

    fn scheduler(
        store: Arc<MemoryStore>,
        launcher: MockJobLauncher,
    ) -> CronScheduler<MemoryStore, MockJobLauncher> {
        CronScheduler::new(store, Arc::new(launcher), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn due_cron_fires_once_and_advances() {
        let store = Arc::new(MemoryStore::default());
        let now = Utc::now();
        let id = seed(
            &store,
            CronDefinition::cron("nightly", "0 0 0 * * *", template()),
            now - ChronoDuration::seconds(1),
        )
        .await;

        let mut launcher = MockJobLauncher::new();
        launcher
            .expect_launch()
            .times(1)
            .withf(|_, name| name.starts_with("nightly @ "))
            .returning(|template, name| Ok(template.instantiate(name)));

        let crons = scheduler(Arc::clone(&store), launcher);
        crons.reload_all().await.expect("reload");
        assert_eq!(crons.tick(now).await.expect("tick").len(), 1);
        assert!(crons.tick(now).await.expect("second tick").is_empty());

        let stored = store.get_cron(id).await.expect("get").expect("definition");
        assert_eq!(stored.run_count, 1);
        assert!(stored.next_run_time.is_some_and(|next| next > now));
    }

    #[tokio::test]
    async fn once_definition_disables_after_firing() {
        let store = Arc::new(MemoryStore::default());
        let now = Utc::now();
        let id = seed(
            &store,
            CronDefinition::once("one-off", now, template()),
            now,
        )
        .await;

        let mut launcher = MockJobLauncher::new();
        launcher
            .expect_launch()
            .times(1)
            .returning(|template, name| Ok(template.instantiate(name)));

        let crons = scheduler(Arc::clone(&store), launcher);
        crons.reload_all().await.expect("reload");
        crons.tick(now).await.expect("tick");

        let stored = store.get_cron(id).await.expect("get").expect("definition");
        assert_eq!(stored.status, CronStatus::Disable);
        assert_eq!(stored.next_run_time, None);
        assert_eq!(crons.tracked().await, 0);
    }

    #[tokio::test]
    async fn failed_launch_still_advances_schedule() {
        let store = Arc::new(MemoryStore::default());
        let now = Utc::now();
        let id = seed(
            &store,
            CronDefinition::cron("flaky", "*/5 * * * * *", template()),
            now,
        )
        .await;

        let mut launcher = MockJobLauncher::new();
        launcher
            .expect_launch()
            .times(1)
            .returning(|_, _| Err(CoordinationError::Dispatch("queue down".into())));

        let crons = scheduler(Arc::clone(&store), launcher);
        crons.reload_all().await.expect("reload");
        assert!(crons.tick(now).await.expect("tick").is_empty());

        let stored = store.get_cron(id).await.expect("get").expect("definition");
        assert!(stored.next_run_time.is_some_and(|next| next > now));
    }

    /// Launcher that edits the definition's schedule while the fire is in flight.
    struct EditingLauncher {
        store: Arc<MemoryStore>,
        id: CronId,
        edited_next: DateTime<Utc>,
    }

    #[async_trait]
    impl JobLauncher for EditingLauncher {
        async fn launch(&self, template: &JobTemplate, name: String) -> Result<JobRecord> {
            let edited_next = self.edited_next;
            self.store
                .update_cron(self.id, &|current: &mut CronDefinition| -> Result<bool> {
                    current.cron_spec = Some("0 30 * * * *".into());
                    current.next_run_time = Some(edited_next);
                    Ok(true)
                })
                .await?;
            Ok(template.instantiate(name))
        }
    }

    #[tokio::test]
    async fn edit_during_fire_keeps_the_new_schedule() {
        let store = Arc::new(MemoryStore::default());
        let now = Utc::now();
        let id = seed(
            &store,
            CronDefinition::cron("edited", "0 0 * * * *", template()),
            now,
        )
        .await;
        let edited_next = now + ChronoDuration::hours(3);
        let launcher = EditingLauncher {
            store: Arc::clone(&store),
            id,
            edited_next,
        };

        let crons = CronScheduler::new(
            Arc::clone(&store),
            Arc::new(launcher),
            Duration::from_millis(10),
        );
        crons.reload_all().await.expect("reload");
        assert_eq!(crons.tick(now).await.expect("tick").len(), 1);

        let stored = store.get_cron(id).await.expect("get").expect("definition");
        assert_eq!(stored.cron_spec.as_deref(), Some("0 30 * * * *"));
        assert_eq!(stored.next_run_time, Some(edited_next));
        assert_eq!(stored.run_count, 1);
        assert_eq!(stored.last_run_time, Some(now));
    }

    #[tokio::test]
    async fn run_now_keeps_the_schedule() {
        let store = Arc::new(MemoryStore::default());
        let next = Utc::now() + ChronoDuration::hours(1);
        let id = seed(
            &store,
            CronDefinition::cron("hourly", "0 0 * * * *", template()),
            next,
        )
        .await;

        let mut launcher = MockJobLauncher::new();
        launcher
            .expect_launch()
            .times(1)
            .returning(|template, name| Ok(template.instantiate(name)));

        let crons = scheduler(Arc::clone(&store), launcher);
        crons.run_now(id).await.expect("run now");

        let stored = store.get_cron(id).await.expect("get").expect("definition");
        assert_eq!(stored.run_count, 1);
        assert_eq!(stored.next_run_time, Some(next));
    }

    #[tokio::test]
    async fn remove_signal_drops_the_definition() {
        let store = Arc::new(MemoryStore::default());
        let id = seed(
            &store,
            CronDefinition::cron("hourly", "0 0 * * * *", template()),
            Utc::now() + ChronoDuration::hours(1),
        )
        .await;

        let crons = scheduler(Arc::clone(&store), MockJobLauncher::new());
        crons.reload_all().await.expect("reload");
        assert_eq!(crons.tracked().await, 1);

        crons
            .handle_signal(&BrokerMessage {
                channel: CRON_REMOVE_CHANNEL.into(),
                payload: id.to_string(),
            })
            .await
            .expect("signal");
        assert_eq!(crons.tracked().await, 0);
    }
}
