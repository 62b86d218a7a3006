use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::JobId;

use super::control::{ControlFlag, ControlFlagStore};

/// Cancellation handle for one running unit, driven by the job's control flag.
///
/// The watch polls `task:ctrl:{jobId}` in the background, starting immediately, so a unit that
/// begins after the flag was set still observes it. Once a flag appears the token is cancelled
/// and the flag is kept for [`ControlWatch::checkpoint`]. Dropping the watch stops polling.
#[derive(Debug)]
pub struct ControlWatch {
    job_id: JobId,
    token: CancellationToken,
    observed: Arc<OnceLock<ControlFlag>>,
    poller: CancellationToken,
}

impl ControlWatch {
    pub fn spawn<F>(flags: Arc<F>, job_id: JobId, poll_interval: Duration) -> Self
    where
        F: ControlFlagStore + ?Sized + 'static,
    {
        let token = CancellationToken::new();
        let observed = Arc::new(OnceLock::new());
        let poller = CancellationToken::new();

        let watch = Self {
            job_id,
            token: token.clone(),
            observed: Arc::clone(&observed),
            poller: poller.clone(),
        };

        tokio::spawn(async move {
            loop {
                match flags.control_flag(job_id).await {
                    Ok(Some(flag)) => {
                        debug!(job_id = %job_id, flag = %flag, "control flag observed");
                        let _ = observed.set(flag);
                        token.cancel();
                        break;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(job_id = %job_id, error = %err, "control flag poll failed");
                    }
                }

                tokio::select! {
                    _ = poller.cancelled() => break,
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        });

        watch
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Token to hand to the unit's execution loop.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Non-blocking safe-point check.
    pub fn checkpoint(&self) -> Option<ControlFlag> {
        self.observed.get().copied()
    }

    /// Resolves once a control flag was observed.
    pub async fn cancelled(&self) -> Option<ControlFlag> {
        self.token.cancelled().await;
        self.checkpoint()
    }
}

impl Drop for ControlWatch {
    fn drop(&mut self) {
        self.poller.cancel();
    }
}
