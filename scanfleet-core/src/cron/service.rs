use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{CoordinationError, Result};
use crate::events::{CRON_RELOAD_CHANNEL, CRON_REMOVE_CHANNEL, CRON_RUNNOW_CHANNEL};
use crate::store::CoordinationStore;
use crate::types::CronId;

use super::definition::{CronDefinition, CronStatus};

/// Operator-facing management of cron definitions.
///
/// Every save recomputes `next_run_time` and notifies the scheduler with the definition id, so
/// edits apply without restarting the loop.
pub struct CronService<S> {
    store: Arc<S>,
}

impl<S> Clone for CronService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S> fmt::Debug for CronService<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronService")
            .field("store", &type_name::<S>())
            .finish()
    }
}

impl<S: CoordinationStore> CronService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn create(&self, mut definition: CronDefinition) -> Result<CronDefinition> {
        let now = Utc::now();
        definition.validate(now)?;
        definition.refresh_next_run(now)?;
        definition.created_at = now;
        definition.updated_at = now;
        self.store.put_cron(&definition).await?;
        info!(cron_id = %definition.id, name = %definition.name, next = ?definition.next_run_time, "cron definition created");
        self.notify(CRON_RELOAD_CHANNEL, definition.id).await;
        Ok(definition)
    }

    /// Replaces the schedule, template and status of an existing definition. Run history and
    /// the creation time are kept from the stored copy.
    ///
    /// The write is a compare-and-set, so a run recorded concurrently by the scheduler is not
    /// lost.
    pub async fn update(&self, definition: CronDefinition) -> Result<CronDefinition> {
        let now = Utc::now();
        definition.validate(now)?;
        let updated = self
            .store
            .update_cron(definition.id, &|current: &mut CronDefinition| -> Result<bool> {
                current.name = definition.name.clone();
                current.schedule_type = definition.schedule_type;
                current.cron_spec = definition.cron_spec.clone();
                current.schedule_time = definition.schedule_time;
                current.template = definition.template.clone();
                current.status = definition.status;
                current.updated_at = now;
                current.refresh_next_run(now)?;
                Ok(true)
            })
            .await?
            .value;
        info!(cron_id = %updated.id, next = ?updated.next_run_time, "cron definition updated");
        self.notify(CRON_RELOAD_CHANNEL, updated.id).await;
        Ok(updated)
    }

    pub async fn delete(&self, id: CronId) -> Result<()> {
        if !self.store.delete_cron(id).await? {
            return Err(CoordinationError::not_found(format!("cron definition {id}")));
        }
        info!(cron_id = %id, "cron definition deleted");
        self.notify(CRON_REMOVE_CHANNEL, id).await;
        Ok(())
    }

    pub async fn get(&self, id: CronId) -> Result<CronDefinition> {
        self.store
            .get_cron(id)
            .await?
            .ok_or_else(|| CoordinationError::not_found(format!("cron definition {id}")))
    }

    /// All definitions, oldest first.
    pub async fn list(&self) -> Result<Vec<CronDefinition>> {
        let mut definitions = self.store.list_crons().await?;
        definitions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(definitions)
    }

    pub async fn enable(&self, id: CronId) -> Result<CronDefinition> {
        self.set_status(id, CronStatus::Enable).await
    }

    pub async fn disable(&self, id: CronId) -> Result<CronDefinition> {
        self.set_status(id, CronStatus::Disable).await
    }

    async fn set_status(&self, id: CronId, status: CronStatus) -> Result<CronDefinition> {
        let now = Utc::now();
        let definition = self
            .store
            .update_cron(id, &|current: &mut CronDefinition| -> Result<bool> {
                current.status = status;
                current.validate(now)?;
                current.refresh_next_run(now)?;
                current.updated_at = now;
                Ok(true)
            })
            .await?
            .value;
        info!(cron_id = %id, status = ?status, next = ?definition.next_run_time, "cron status changed");
        self.notify(CRON_RELOAD_CHANNEL, id).await;
        Ok(definition)
    }

    /// Asks the scheduler to fire the definition once, outside its schedule.
    pub async fn run_now(&self, id: CronId) -> Result<()> {
        self.get(id).await?;
        self.store
            .publish(CRON_RUNNOW_CHANNEL, &id.to_string())
            .await?;
        info!(cron_id = %id, "cron run requested");
        Ok(())
    }

    async fn notify(&self, channel: &str, id: CronId) {
        if let Err(err) = self.store.publish(channel, &id.to_string()).await {
            warn!(cron_id = %id, channel, error = %err, "cron notification failed; scheduler picks it up on resync");
        }
    }
}
