//! Worker registry, liveness derivation and the control plane.

mod control;
mod registry;
mod status;
mod watch;

pub use control::{CommandListener, ControlFlag, ControlFlagStore, WorkerAction, WorkerCommand};
pub use registry::WorkerRegistry;
pub use status::{
    DEFAULT_STALE_AFTER_SECS, WorkerMove, WorkerStatus, WorkerStatusStore, WorkerView, is_stale,
};
pub use watch::ControlWatch;
