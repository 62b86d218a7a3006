//! Job lifecycle: the record model, unit construction and the state machine driver.

mod controller;
mod model;
mod repository;
mod units;

pub use controller::{JobController, JobProgress};
pub use model::{
    JobRecord, JobStatus, JobUnit, STOPPED_MANUALLY, UnitCounters, UnitOutcome, UnitReport,
};
pub use repository::JobRepository;
pub use units::build_units;
