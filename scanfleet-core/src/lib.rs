//! Coordination layer for a distributed scan fleet.
//!
//! The crate splits target lists into schedulable units ([`partition`]), hands them to workers
//! through a priority queue ([`dispatch`]), drives each job through its lifecycle ([`job`]),
//! tracks worker liveness and delivers control signals ([`worker`]), and fires recurring jobs
//! ([`cron`]). All shared state lives behind the store traits implemented in [`store`], so the
//! same logic runs against Redis in production and an in-memory broker in tests.

pub mod config;
pub mod cron;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod job;
pub mod partition;
pub mod runtime;
pub mod store;
pub mod types;
pub mod worker;

pub use config::CoordinatorConfig;
pub use error::{CoordinationError, Result};
pub use runtime::Coordinator;
pub use types::{CronId, JobId, UnitId};
