use async_trait::async_trait;

use crate::error::Result;
use crate::store::{Mutation, Updated};
use crate::types::CronId;

use super::definition::CronDefinition;

/// Persistence for cron definitions.
#[async_trait]
pub trait CronStore: Send + Sync {
    /// Inserts or replaces a definition.
    async fn put_cron(&self, definition: &CronDefinition) -> Result<()>;

    async fn get_cron(&self, id: CronId) -> Result<Option<CronDefinition>>;

    /// Applies `mutate` atomically. Fails with `NotFound` when the definition does not exist.
    async fn update_cron(
        &self,
        id: CronId,
        mutate: Mutation<'_, CronDefinition>,
    ) -> Result<Updated<CronDefinition>>;

    async fn delete_cron(&self, id: CronId) -> Result<bool>;

    async fn list_crons(&self) -> Result<Vec<CronDefinition>>;
}
