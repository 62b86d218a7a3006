//! Process-local backend with the same atomicity guarantees as the Redis one.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;

use crate::cron::{CronDefinition, CronStore};
use crate::dispatch::{ChunkStatus, ClaimRequest, ProgressStore, QueueDepth, UnitClaim, UnitQueue};
use crate::error::{CoordinationError, Result};
use crate::events::{BrokerMessage, MessageBroker, Subscription};
use crate::job::{JobRecord, JobRepository, JobUnit};
use crate::types::{CronId, JobId, UnitId};
use crate::worker::{ControlFlag, ControlFlagStore, WorkerMove, WorkerStatus, WorkerStatusStore};

use super::{Mutation, Updated};

const CHANNEL_CAPACITY: usize = 256;

type QueueKey = (Reverse<i32>, u64);

#[derive(Debug, Default)]
struct QueueState {
    seq: u64,
    queued: BTreeMap<QueueKey, JobUnit>,
    positions: HashMap<UnitId, QueueKey>,
    claims: HashMap<UnitId, UnitClaim>,
}

impl QueueState {
    fn push(&mut self, unit: JobUnit) {
        self.seq += 1;
        let key = (Reverse(unit.priority), self.seq);
        if let Some(previous) = self.positions.insert(unit.unit_id.clone(), key) {
            self.queued.remove(&previous);
        }
        self.queued.insert(key, unit);
    }

    fn take(&mut self, key: &QueueKey) -> Option<JobUnit> {
        let unit = self.queued.remove(key)?;
        self.positions.remove(&unit.unit_id);
        Some(unit)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    queue: Mutex<QueueState>,
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    progress: Mutex<HashMap<JobId, HashMap<UnitId, ChunkStatus>>>,
    workers: DashMap<String, WorkerStatus>,
    flags: DashMap<JobId, ControlFlag>,
    crons: DashMap<CronId, CronDefinition>,
    channels: DashMap<String, broadcast::Sender<BrokerMessage>>,
}

/// In-memory store for tests and single-process deployments.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Runs `mutate` on a copy so a failing mutation leaves the stored value untouched.
fn apply<T: Clone>(slot: &mut T, mutate: Mutation<'_, T>) -> Result<Updated<T>> {
    let mut candidate = slot.clone();
    let changed = mutate(&mut candidate)?;
    if changed {
        *slot = candidate.clone();
    }
    Ok(Updated {
        value: candidate,
        changed,
    })
}

#[async_trait]
impl UnitQueue for MemoryStore {
    async fn push_units(&self, units: &[JobUnit]) -> Result<()> {
        let mut queue = self.inner.queue.lock().await;
        for unit in units {
            queue.push(unit.clone());
        }
        Ok(())
    }

    async fn claim_unit(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<UnitClaim>> {
        let mut queue = self.inner.queue.lock().await;
        let Some(key) = queue
            .queued
            .iter()
            .find(|(_, unit)| request.admits(unit))
            .map(|(key, _)| *key)
        else {
            return Ok(None);
        };
        let Some(unit) = queue.take(&key) else {
            return Ok(None);
        };
        let claim = UnitClaim::new(unit, request.worker_name.clone(), now);
        queue.claims.insert(claim.unit_id().clone(), claim.clone());
        Ok(Some(claim))
    }

    async fn touch_claim(&self, unit_id: &UnitId, now: DateTime<Utc>) -> Result<bool> {
        let mut queue = self.inner.queue.lock().await;
        Ok(match queue.claims.get_mut(unit_id) {
            Some(claim) => {
                claim.last_update = now;
                true
            }
            None => false,
        })
    }

    async fn release_claim(&self, unit_id: &UnitId) -> Result<Option<UnitClaim>> {
        Ok(self.inner.queue.lock().await.claims.remove(unit_id))
    }

    async fn release_claim_held_by(&self, unit_id: &UnitId, worker_name: &str) -> Result<bool> {
        let mut queue = self.inner.queue.lock().await;
        let held = queue
            .claims
            .get(unit_id)
            .is_some_and(|claim| claim.worker_name == worker_name);
        if held {
            queue.claims.remove(unit_id);
        }
        Ok(held)
    }

    async fn reassign_claims(&self, from: &str, to: &str) -> Result<usize> {
        let mut queue = self.inner.queue.lock().await;
        let mut moved = 0;
        for claim in queue.claims.values_mut() {
            if claim.worker_name == from {
                claim.worker_name = to.to_string();
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn requeue_claim(&self, unit_id: &UnitId, unit: &JobUnit) -> Result<bool> {
        let mut queue = self.inner.queue.lock().await;
        if queue.claims.remove(unit_id).is_none() {
            return Ok(false);
        }
        queue.push(unit.clone());
        Ok(true)
    }

    async fn list_claims(&self) -> Result<Vec<UnitClaim>> {
        let queue = self.inner.queue.lock().await;
        let mut claims: Vec<UnitClaim> = queue.claims.values().cloned().collect();
        claims.sort_by(|a, b| a.claimed_at.cmp(&b.claimed_at));
        Ok(claims)
    }

    async fn purge_job_units(&self, job_id: JobId) -> Result<usize> {
        let mut queue = self.inner.queue.lock().await;
        let keys: Vec<QueueKey> = queue
            .queued
            .iter()
            .filter(|(_, unit)| unit.job_id == job_id)
            .map(|(key, _)| *key)
            .collect();
        for key in &keys {
            queue.take(key);
        }
        Ok(keys.len())
    }

    async fn queue_depth(&self) -> Result<QueueDepth> {
        let queue = self.inner.queue.lock().await;
        Ok(QueueDepth {
            queued: queue.queued.len(),
            claimed: queue.claims.len(),
        })
    }

    async fn queued_per_job(&self) -> Result<HashMap<JobId, usize>> {
        let queue = self.inner.queue.lock().await;
        let mut counts = HashMap::new();
        for unit in queue.queued.values() {
            *counts.entry(unit.job_id).or_default() += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
impl ProgressStore for MemoryStore {
    async fn put_progress(&self, job_id: JobId, entries: &[ChunkStatus]) -> Result<()> {
        let mut progress = self.inner.progress.lock().await;
        let units = progress.entry(job_id).or_default();
        for entry in entries {
            units.insert(entry.unit_id.clone(), entry.clone());
        }
        Ok(())
    }

    async fn update_progress(
        &self,
        job_id: JobId,
        unit_id: &UnitId,
        mutate: Mutation<'_, ChunkStatus>,
    ) -> Result<Updated<ChunkStatus>> {
        let mut progress = self.inner.progress.lock().await;
        let entry = progress
            .get_mut(&job_id)
            .and_then(|units| units.get_mut(unit_id))
            .ok_or_else(|| CoordinationError::not_found(format!("progress for unit {unit_id}")))?;
        apply(entry, mutate)
    }

    async fn list_progress(&self, job_id: JobId) -> Result<Vec<ChunkStatus>> {
        let progress = self.inner.progress.lock().await;
        let mut entries: Vec<ChunkStatus> = progress
            .get(&job_id)
            .map(|units| units.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by_key(|entry| entry.index);
        Ok(entries)
    }

    async fn remove_progress(&self, job_id: JobId) -> Result<()> {
        self.inner.progress.lock().await.remove(&job_id);
        Ok(())
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn insert_job(&self, record: &JobRecord) -> Result<()> {
        let mut jobs = self.inner.jobs.lock().await;
        if jobs.contains_key(&record.id) {
            return Err(CoordinationError::validation(format!(
                "job {} already exists",
                record.id
            )));
        }
        jobs.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.inner.jobs.lock().await.get(&id).cloned())
    }

    async fn update_job(
        &self,
        id: JobId,
        mutate: Mutation<'_, JobRecord>,
    ) -> Result<Updated<JobRecord>> {
        let mut jobs = self.inner.jobs.lock().await;
        let record = jobs
            .get_mut(&id)
            .ok_or_else(|| CoordinationError::not_found(format!("job {id}")))?;
        apply(record, mutate)
    }

    async fn delete_job(&self, id: JobId) -> Result<bool> {
        Ok(self.inner.jobs.lock().await.remove(&id).is_some())
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        Ok(self.inner.jobs.lock().await.values().cloned().collect())
    }
}

#[async_trait]
impl WorkerStatusStore for MemoryStore {
    async fn put_worker_status(&self, status: &WorkerStatus) -> Result<()> {
        self.inner
            .workers
            .insert(status.name.clone(), status.clone());
        Ok(())
    }

    async fn get_worker_status(&self, name: &str) -> Result<Option<WorkerStatus>> {
        Ok(self.inner.workers.get(name).map(|entry| entry.value().clone()))
    }

    async fn list_worker_statuses(&self) -> Result<Vec<WorkerStatus>> {
        Ok(self
            .inner
            .workers
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn remove_worker_status(&self, name: &str) -> Result<bool> {
        Ok(self.inner.workers.remove(name).is_some())
    }

    async fn move_worker_status(&self, from: &str, to: &str) -> Result<WorkerMove> {
        if self.inner.workers.contains_key(to) {
            return Ok(WorkerMove::TargetTaken);
        }
        let Some((_, mut status)) = self.inner.workers.remove(from) else {
            return Ok(WorkerMove::SourceMissing);
        };
        if let Entry::Vacant(slot) = self.inner.workers.entry(to.to_string()) {
            status.name = to.to_string();
            slot.insert(status);
            return Ok(WorkerMove::Moved);
        }
        self.inner.workers.insert(from.to_string(), status);
        Ok(WorkerMove::TargetTaken)
    }
}

#[async_trait]
impl ControlFlagStore for MemoryStore {
    async fn set_control_flag(&self, job_id: JobId, flag: ControlFlag) -> Result<()> {
        self.inner.flags.insert(job_id, flag);
        Ok(())
    }

    async fn clear_control_flag(&self, job_id: JobId) -> Result<()> {
        self.inner.flags.remove(&job_id);
        Ok(())
    }

    async fn control_flag(&self, job_id: JobId) -> Result<Option<ControlFlag>> {
        Ok(self.inner.flags.get(&job_id).map(|entry| *entry.value()))
    }
}

#[async_trait]
impl CronStore for MemoryStore {
    async fn put_cron(&self, definition: &CronDefinition) -> Result<()> {
        self.inner.crons.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn get_cron(&self, id: CronId) -> Result<Option<CronDefinition>> {
        Ok(self.inner.crons.get(&id).map(|entry| entry.value().clone()))
    }

    async fn update_cron(
        &self,
        id: CronId,
        mutate: Mutation<'_, CronDefinition>,
    ) -> Result<Updated<CronDefinition>> {
        let mut entry = self
            .inner
            .crons
            .get_mut(&id)
            .ok_or_else(|| CoordinationError::not_found(format!("cron definition {id}")))?;
        apply(entry.value_mut(), mutate)
    }

    async fn delete_cron(&self, id: CronId) -> Result<bool> {
        Ok(self.inner.crons.remove(&id).is_some())
    }

    async fn list_crons(&self) -> Result<Vec<CronDefinition>> {
        Ok(self
            .inner
            .crons
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[async_trait]
impl MessageBroker for MemoryStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        if let Some(sender) = self.inner.channels.get(channel) {
            // Fails only when nobody is subscribed.
            let _ = sender.send(BrokerMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription> {
        let streams: Vec<BoxStream<'static, BrokerMessage>> = channels
            .iter()
            .map(|channel| {
                let receiver = self
                    .inner
                    .channels
                    .entry((*channel).to_string())
                    .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                    .subscribe();
                BroadcastStream::new(receiver)
                    .filter_map(|message| async move { message.ok() })
                    .boxed()
            })
            .collect();
        Ok(Subscription::new(stream::select_all(streams)))
    }
}
