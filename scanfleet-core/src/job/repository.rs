use async_trait::async_trait;

use crate::error::Result;
use crate::store::{Mutation, Updated};
use crate::types::JobId;

use super::model::JobRecord;

/// Persistence for job records.
///
/// Records belong to the wider platform; the coordinator only needs atomic updates so
/// concurrent transitions and unit reports never lose writes.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert_job(&self, record: &JobRecord) -> Result<()>;

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>>;

    /// Applies `mutate` atomically. Fails with `NotFound` when the job does not exist.
    async fn update_job(&self, id: JobId, mutate: Mutation<'_, JobRecord>)
    -> Result<Updated<JobRecord>>;

    async fn delete_job(&self, id: JobId) -> Result<bool>;

    async fn list_jobs(&self) -> Result<Vec<JobRecord>>;
}
