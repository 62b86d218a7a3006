//! Recurring and one-shot job definitions and the loop that fires them.

mod definition;
mod repository;
mod scheduler;
mod service;

pub use definition::{
    CronDefinition, CronStatus, JobTemplate, ScheduleType, parse_cron_spec, parse_schedule_time,
};
pub use repository::CronStore;
pub use scheduler::{CronScheduler, JobLauncher};
pub use service::CronService;

#[cfg(test)]
pub use scheduler::MockJobLauncher;
