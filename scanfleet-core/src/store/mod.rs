//! Backends for the coordination state.
//!
//! Every piece of shared state is reached through a narrow trait owned by the module that uses
//! it ([`UnitQueue`], [`ProgressStore`], [`JobRepository`], [`WorkerStatusStore`],
//! [`ControlFlagStore`], [`CronStore`], [`MessageBroker`]). [`CoordinationStore`] bundles them so
//! services can be generic over a single backend type.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

use crate::cron::CronStore;
use crate::dispatch::{ProgressStore, UnitQueue};
use crate::error::Result;
use crate::events::MessageBroker;
use crate::job::JobRepository;
use crate::worker::{ControlFlagStore, WorkerStatusStore};

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::{RedisKeys, RedisStore};

/// Read-modify-write step applied under the backend's atomicity guarantee.
///
/// Returns `Ok(true)` when the value changed and must be written back, `Ok(false)` to leave the
/// stored value untouched. An error aborts the write and is returned to the caller.
pub type Mutation<'a, T> = &'a (dyn Fn(&mut T) -> Result<bool> + Send + Sync);

/// Value observed after a [`Mutation`] ran.
#[derive(Clone, Debug, PartialEq)]
pub struct Updated<T> {
    pub value: T,
    pub changed: bool,
}

/// Everything the coordinator needs from a backend.
pub trait CoordinationStore:
    UnitQueue
    + ProgressStore
    + JobRepository
    + WorkerStatusStore
    + ControlFlagStore
    + CronStore
    + MessageBroker
    + 'static
{
}

impl<T> CoordinationStore for T where
    T: UnitQueue
        + ProgressStore
        + JobRepository
        + WorkerStatusStore
        + ControlFlagStore
        + CronStore
        + MessageBroker
        + 'static
{
}
