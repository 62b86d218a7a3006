use std::fmt;

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};

use crate::error::Result;

/// Administrative envelopes for workers (`{"action", "workerName", ...}`).
pub const WORKER_CONTROL_CHANNEL: &str = "worker:control";
/// Cron edit notifications; the payload is the bare definition id.
pub const CRON_RELOAD_CHANNEL: &str = "cron:reload";
pub const CRON_REMOVE_CHANNEL: &str = "cron:remove";
pub const CRON_RUNNOW_CHANNEL: &str = "cron:runnow";

/// Publish/subscribe transport shared by the coordinator and the workers.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

/// Live subscription to one or more channels. Dropping it unsubscribes.
pub struct Subscription {
    stream: BoxStream<'static, BrokerMessage>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn new(stream: impl Stream<Item = BrokerMessage> + Send + 'static) -> Self {
        Self {
            stream: stream.boxed(),
        }
    }

    /// Next message, or `None` once the underlying transport closed.
    pub async fn next_message(&mut self) -> Option<BrokerMessage> {
        self.stream.next().await
    }
}
