//! Unit queue, progress tracking and stale-claim recovery.

mod dispatcher;
mod progress;
mod queue;
mod recovery;

pub use dispatcher::{Dispatcher, QueueSnapshot, Settlement};
pub use progress::{ChunkState, ChunkStatus, ProgressStore, ProgressSummary};
pub use queue::{ClaimRequest, QueueDepth, UnitClaim, UnitQueue};
pub use recovery::{RecoveryReport, RecoverySweeper, StaleClaimScanner};
