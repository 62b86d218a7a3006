use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::job::JobStatus;
use crate::types::{JobId, UnitId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    Created,
    Started { unit_count: u32 },
    UnitClaimed { unit_id: UnitId, worker_name: String },
    UnitFinished { unit_id: UnitId, failed: bool },
    Paused,
    Resumed { requeued: usize },
    Stopped,
    Finished { status: JobStatus },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: JobEventKind,
    pub occurred_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: JobId, kind: JobEventKind) -> Self {
        Self {
            job_id,
            kind,
            occurred_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait JobEventPublisher: Send + Sync {
    async fn publish_event(&self, event: JobEvent) -> Result<()>;
}

pub trait JobEventStream {
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent>;
}

/// Lightweight in-process bus that fans job lifecycle events out to observers.
/// Events published while nobody listens are dropped.
pub struct InProcJobEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl fmt::Debug for InProcJobEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcJobEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcJobEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }
}

#[async_trait]
impl JobEventPublisher for InProcJobEventBus {
    async fn publish_event(&self, event: JobEvent) -> Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }
}

impl JobEventStream for InProcJobEventBus {
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = InProcJobEventBus::new(8);
        let mut rx = bus.subscribe_jobs();
        let job_id = JobId::new();
        bus.publish_event(JobEvent::new(job_id, JobEventKind::Paused))
            .await
            .expect("publish");
        let event = rx.recv().await.expect("event");
        assert_eq!(event.job_id, job_id);
        assert_eq!(event.kind, JobEventKind::Paused);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_not_an_error() {
        let bus = InProcJobEventBus::new(1);
        bus.publish_event(JobEvent::new(JobId::new(), JobEventKind::Created))
            .await
            .expect("publish");
    }
}
