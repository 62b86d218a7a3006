//! Redis backend shared by every coordinator instance and worker.
//!
//! Multi-step operations (claim, requeue, purge) run as Lua scripts so they are atomic on the
//! server. Read-modify-write updates of JSON records use optimistic compare-and-swap: the value
//! read is sent back as the expected value, and the update is retried when another writer won.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cron::{CronDefinition, CronStore};
use crate::dispatch::{ChunkStatus, ClaimRequest, ProgressStore, QueueDepth, UnitClaim, UnitQueue};
use crate::error::{CoordinationError, Result};
use crate::events::{BrokerMessage, MessageBroker, Subscription};
use crate::job::{JobRecord, JobRepository, JobUnit};
use crate::types::{CronId, JobId, UnitId};
use crate::worker::{ControlFlag, ControlFlagStore, WorkerMove, WorkerStatus, WorkerStatusStore};

use super::{Mutation, Updated};

/// Compare-and-swap retries before an update is reported as contended.
const CAS_ATTEMPTS: usize = 16;

/// Keys requested per SCAN round trip.
const SCAN_COUNT: usize = 200;

/// Length of the `{seq:020}|` prefix on queue members.
const MEMBER_PREFIX_LEN: usize = 21;

/// Just enough of a queued unit to attribute it to its job.
#[derive(Deserialize)]
struct QueuedUnitRef {
    #[serde(rename = "jobId")]
    job_id: JobId,
}

mod scripts {
    use redis::Script;

    /// Shared queue helpers. A queue member is `{seq:020}|{unit json}` scored by `-priority`, so
    /// the sorted set orders by priority and then, within one score, by enqueue sequence. The
    /// index hash maps each waiting unit id to its member.
    const QUEUE_HELPERS: &str = r#"
        local function unit_json(member)
            return string.sub(member, 22)
        end

        local function enqueue(queue, seq, index, priority, unit_id, raw)
            local previous = redis.call('HGET', index, unit_id)
            if previous then
                redis.call('ZREM', queue, previous)
            end
            local member = string.format('%020d', redis.call('INCR', seq)) .. '|' .. raw
            redis.call('ZADD', queue, -tonumber(priority), member)
            redis.call('HSET', index, unit_id, member)
        end
    "#;

    fn queue_script(body: &str) -> Script {
        Script::new(&format!("{QUEUE_HELPERS}\n{body}"))
    }

    /// Appends units (ARGV: priority, unit id, json triples).
    pub fn push() -> Script {
        queue_script(
            r#"
            local pushed = 0
            for i = 1, #ARGV, 3 do
                enqueue(KEYS[1], KEYS[2], KEYS[3], ARGV[i], ARGV[i + 1], ARGV[i + 2])
                pushed = pushed + 1
            end
            return pushed
            "#,
        )
    }

    /// Pops the first unit the worker may run and records the claim.
    pub fn claim() -> Script {
        queue_script(
            r#"
            local worker = ARGV[1]
            local caps = {}
            for _, cap in ipairs(cjson.decode(ARGV[2])) do
                caps[cap] = true
            end
            local now = ARGV[3]
            local batch = tonumber(ARGV[4])
            local offset = 0

            while true do
                local members = redis.call('ZRANGE', KEYS[1], offset, offset + batch - 1)
                if #members == 0 then
                    return false
                end
                for _, member in ipairs(members) do
                    local raw = unit_json(member)
                    local unit = cjson.decode(raw)
                    local allowed = true
                    local eligible = unit['eligibleWorkers']
                    if type(eligible) == 'table' and #eligible > 0 then
                        allowed = false
                        for _, name in ipairs(eligible) do
                            if name == worker then
                                allowed = true
                                break
                            end
                        end
                    end
                    local required = unit['requiredCapabilities']
                    if allowed and type(required) == 'table' then
                        for _, cap in ipairs(required) do
                            if not caps[cap] then
                                allowed = false
                                break
                            end
                        end
                    end
                    if allowed then
                        redis.call('ZREM', KEYS[1], member)
                        redis.call('HDEL', KEYS[3], unit['unitId'])
                        local claim = '{"unit":' .. raw
                            .. ',"workerName":' .. cjson.encode(worker)
                            .. ',"claimedAt":' .. cjson.encode(now)
                            .. ',"lastUpdate":' .. cjson.encode(now) .. '}'
                        redis.call('HSET', KEYS[2], unit['unitId'], claim)
                        return claim
                    end
                end
                offset = offset + batch
            end
            "#,
        )
    }

    /// Removes a claim and returns it.
    pub fn release() -> Script {
        Script::new(
            r#"
            local raw = redis.call('HGET', KEYS[1], ARGV[1])
            if raw then
                redis.call('HDEL', KEYS[1], ARGV[1])
            end
            return raw
            "#,
        )
    }

    /// Removes a claim only while the named worker holds it.
    pub fn release_held_by() -> Script {
        Script::new(
            r#"
            local raw = redis.call('HGET', KEYS[1], ARGV[1])
            if not raw or cjson.decode(raw)['workerName'] ~= ARGV[2] then
                return 0
            end
            redis.call('HDEL', KEYS[1], ARGV[1])
            return 1
            "#,
        )
    }

    /// Drops a claim and pushes the unit again, only if the claim still exists.
    pub fn requeue() -> Script {
        queue_script(
            r#"
            if redis.call('HDEL', KEYS[1], ARGV[1]) == 0 then
                return 0
            end
            enqueue(KEYS[2], KEYS[3], KEYS[4], ARGV[2], ARGV[1], ARGV[3])
            return 1
            "#,
        )
    }

    /// Removes every queued unit of one job.
    pub fn purge() -> Script {
        queue_script(
            r#"
            local removed = 0
            for _, member in ipairs(redis.call('ZRANGE', KEYS[1], 0, -1)) do
                local unit = cjson.decode(unit_json(member))
                if unit['jobId'] == ARGV[1] then
                    redis.call('ZREM', KEYS[1], member)
                    redis.call('HDEL', KEYS[2], unit['unitId'])
                    removed = removed + 1
                end
            end
            return removed
            "#,
        )
    }

    /// Renames a worker record if it is unchanged and the new name is free.
    pub fn move_worker() -> Script {
        Script::new(
            r#"
            if redis.call('EXISTS', KEYS[2]) == 1 then
                return -1
            end
            if redis.call('GET', KEYS[1]) ~= ARGV[1] then
                return 0
            end
            redis.call('SET', KEYS[2], ARGV[2])
            redis.call('DEL', KEYS[1])
            redis.call('SREM', KEYS[3], ARGV[3])
            redis.call('SADD', KEYS[3], ARGV[4])
            return 1
            "#,
        )
    }

    pub fn swap_key() -> Script {
        Script::new(
            r#"
            if redis.call('GET', KEYS[1]) == ARGV[1] then
                redis.call('SET', KEYS[1], ARGV[2])
                return 1
            end
            return 0
            "#,
        )
    }

    pub fn swap_field() -> Script {
        Script::new(
            r#"
            if redis.call('HGET', KEYS[1], ARGV[1]) == ARGV[2] then
                redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
                return 1
            end
            return 0
            "#,
        )
    }
}

/// Key layout. Only the unit queue is scoped by environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedisKeys {
    environment: String,
}

impl RedisKeys {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
        }
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn queue(&self) -> String {
        format!("queue:{}", self.environment)
    }

    pub fn sequence(&self) -> String {
        format!("queue:{}:seq", self.environment)
    }

    pub fn claims(&self) -> String {
        format!("queue:{}:claims", self.environment)
    }

    pub fn index(&self) -> String {
        format!("queue:{}:index", self.environment)
    }

    pub fn job(id: JobId) -> String {
        format!("job:{id}")
    }

    pub fn progress(id: JobId) -> String {
        format!("job:progress:{id}")
    }

    pub fn worker(name: &str) -> String {
        format!("worker:{name}")
    }

    pub fn worker_index() -> &'static str {
        "workers"
    }

    pub fn control(id: JobId) -> String {
        format!("task:ctrl:{id}")
    }

    pub fn crons() -> &'static str {
        "cron:definitions"
    }
}

/// A JSON value stored either under its own key or as a hash field.
enum Slot<'a> {
    Key(&'a str),
    Field { hash: &'a str, field: &'a str },
}

impl fmt::Display for Slot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Key(key) => f.write_str(key),
            Slot::Field { hash, field } => write!(f, "{hash}[{field}]"),
        }
    }
}

fn redis_err(op: &str, err: RedisError) -> CoordinationError {
    CoordinationError::Broker(format!("Redis {op} failed: {err}"))
}

#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    keys: RedisKeys,
    claim_scan_batch: usize,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection", &"ConnectionManager")
            .field("keys", &self.keys)
            .field("claim_scan_batch", &self.claim_scan_batch)
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(redis_url: &str, keys: RedisKeys, claim_scan_batch: usize) -> Result<Self> {
        info!(environment = %keys.environment(), "connecting to Redis");

        let client = Client::open(redis_url)
            .map_err(|e| CoordinationError::Broker(format!("Failed to create Redis client: {e}")))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| CoordinationError::Broker(format!("Failed to connect to Redis: {e}")))?;

        info!("connected to Redis");
        Ok(Self {
            client,
            conn,
            keys,
            claim_scan_batch: claim_scan_batch.max(1),
        })
    }

    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| redis_err("PING", e))?;
        Ok(())
    }

    async fn read_slot(&self, slot: &Slot<'_>) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = match slot {
            Slot::Key(key) => conn.get(*key).await.map_err(|e| redis_err("GET", e))?,
            Slot::Field { hash, field } => conn
                .hget(*hash, *field)
                .await
                .map_err(|e| redis_err("HGET", e))?,
        };
        Ok(raw)
    }

    async fn swap_slot(&self, slot: &Slot<'_>, expected: &str, next: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let swapped: i64 = match slot {
            Slot::Key(key) => scripts::swap_key()
                .key(*key)
                .arg(expected)
                .arg(next)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| redis_err("compare-and-swap", e))?,
            Slot::Field { hash, field } => scripts::swap_field()
                .key(*hash)
                .arg(*field)
                .arg(expected)
                .arg(next)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| redis_err("compare-and-swap", e))?,
        };
        Ok(swapped == 1)
    }

    async fn update_slot<T>(
        &self,
        slot: Slot<'_>,
        mutate: Mutation<'_, T>,
        missing: impl Fn() -> CoordinationError + Send,
    ) -> Result<Updated<T>>
    where
        T: Serialize + DeserializeOwned + Send,
    {
        for attempt in 1..=CAS_ATTEMPTS {
            let Some(raw) = self.read_slot(&slot).await? else {
                return Err(missing());
            };
            let mut value: T = serde_json::from_str(&raw)?;
            if !mutate(&mut value)? {
                return Ok(Updated {
                    value,
                    changed: false,
                });
            }
            let next = serde_json::to_string(&value)?;
            if self.swap_slot(&slot, &raw, &next).await? {
                return Ok(Updated {
                    value,
                    changed: true,
                });
            }
            debug!(slot = %slot, attempt, "concurrent write detected, retrying update");
        }
        Err(CoordinationError::Internal(format!(
            "gave up updating {slot} after {CAS_ATTEMPTS} contended attempts"
        )))
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw = self.read_slot(&Slot::Key(key)).await?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Into::into)
    }

    /// Every key matching `pattern`, gathered with cursor-based SCAN.
    async fn scan_keys(&self, pattern: &str) -> Result<BTreeSet<String>> {
        let mut conn = self.conn.clone();
        let mut keys = BTreeSet::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|e| redis_err("SCAN", e))?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

/// Parses stored records, skipping any that no longer deserialize.
fn parse_all<T: DeserializeOwned>(raws: Vec<String>, what: &str) -> Vec<T> {
    raws.into_iter()
        .filter_map(|raw| match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(error = %err, "skipping malformed {what} record");
                None
            }
        })
        .collect()
}

#[async_trait]
impl UnitQueue for RedisStore {
    async fn push_units(&self, units: &[JobUnit]) -> Result<()> {
        if units.is_empty() {
            return Ok(());
        }
        let script = scripts::push();
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.keys.queue())
            .key(self.keys.sequence())
            .key(self.keys.index());
        for unit in units {
            invocation
                .arg(unit.priority)
                .arg(unit.unit_id.as_str())
                .arg(serde_json::to_string(unit)?);
        }
        let mut conn = self.conn.clone();
        let pushed: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_err("push", e))?;
        debug!(pushed, "units pushed");
        Ok(())
    }

    async fn claim_unit(
        &self,
        request: &ClaimRequest,
        now: DateTime<Utc>,
    ) -> Result<Option<UnitClaim>> {
        let capabilities = serde_json::to_string(&request.capabilities)?;
        let mut conn = self.conn.clone();
        let raw: Option<String> = scripts::claim()
            .key(self.keys.queue())
            .key(self.keys.claims())
            .key(self.keys.index())
            .arg(&request.worker_name)
            .arg(capabilities)
            .arg(now.to_rfc3339())
            .arg(self.claim_scan_batch)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_err("claim", e))?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Into::into)
    }

    async fn touch_claim(&self, unit_id: &UnitId, now: DateTime<Utc>) -> Result<bool> {
        let claims = self.keys.claims();
        let touched = self
            .update_slot(
                Slot::Field {
                    hash: &claims,
                    field: unit_id.as_str(),
                },
                &|claim: &mut UnitClaim| -> Result<bool> {
                    claim.last_update = now;
                    Ok(true)
                },
                || CoordinationError::not_found(format!("claim {unit_id}")),
            )
            .await;
        match touched {
            Ok(_) => Ok(true),
            Err(CoordinationError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn release_claim(&self, unit_id: &UnitId) -> Result<Option<UnitClaim>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = scripts::release()
            .key(self.keys.claims())
            .arg(unit_id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_err("release", e))?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Into::into)
    }

    async fn release_claim_held_by(&self, unit_id: &UnitId, worker_name: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let released: i64 = scripts::release_held_by()
            .key(self.keys.claims())
            .arg(unit_id.as_str())
            .arg(worker_name)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_err("release", e))?;
        Ok(released == 1)
    }

    async fn reassign_claims(&self, from: &str, to: &str) -> Result<usize> {
        let claims = self.keys.claims();
        let mut moved = 0;
        for claim in self.list_claims().await? {
            if claim.worker_name != from {
                continue;
            }
            let updated = self
                .update_slot(
                    Slot::Field {
                        hash: &claims,
                        field: claim.unit_id().as_str(),
                    },
                    &|held: &mut UnitClaim| -> Result<bool> {
                        if held.worker_name != from {
                            return Ok(false);
                        }
                        held.worker_name = to.to_string();
                        Ok(true)
                    },
                    || CoordinationError::not_found(format!("claim {}", claim.unit_id())),
                )
                .await;
            match updated {
                Ok(updated) if updated.changed => moved += 1,
                Ok(_) | Err(CoordinationError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(moved)
    }

    async fn requeue_claim(&self, unit_id: &UnitId, unit: &JobUnit) -> Result<bool> {
        let mut conn = self.conn.clone();
        let requeued: i64 = scripts::requeue()
            .key(self.keys.claims())
            .key(self.keys.queue())
            .key(self.keys.sequence())
            .key(self.keys.index())
            .arg(unit_id.as_str())
            .arg(unit.priority)
            .arg(serde_json::to_string(unit)?)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_err("requeue", e))?;
        Ok(requeued == 1)
    }

    async fn list_claims(&self) -> Result<Vec<UnitClaim>> {
        let mut conn = self.conn.clone();
        let raws: Vec<String> = conn
            .hvals(self.keys.claims())
            .await
            .map_err(|e| redis_err("HVALS", e))?;
        let mut claims: Vec<UnitClaim> = parse_all(raws, "claim");
        claims.sort_by(|a, b| a.claimed_at.cmp(&b.claimed_at));
        Ok(claims)
    }

    async fn purge_job_units(&self, job_id: JobId) -> Result<usize> {
        let mut conn = self.conn.clone();
        let removed: i64 = scripts::purge()
            .key(self.keys.queue())
            .key(self.keys.index())
            .arg(job_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_err("purge", e))?;
        Ok(usize::try_from(removed).unwrap_or_default())
    }

    async fn queue_depth(&self) -> Result<QueueDepth> {
        let mut conn = self.conn.clone();
        let queued: usize = conn
            .zcard(self.keys.queue())
            .await
            .map_err(|e| redis_err("ZCARD", e))?;
        let claimed: usize = conn
            .hlen(self.keys.claims())
            .await
            .map_err(|e| redis_err("HLEN", e))?;
        Ok(QueueDepth { queued, claimed })
    }

    async fn queued_per_job(&self) -> Result<HashMap<JobId, usize>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrange(self.keys.queue(), 0, -1)
            .await
            .map_err(|e| redis_err("ZRANGE", e))?;
        let mut counts = HashMap::new();
        for member in members {
            let Some(raw) = member.get(MEMBER_PREFIX_LEN..) else {
                warn!("skipping malformed queue member");
                continue;
            };
            match serde_json::from_str::<QueuedUnitRef>(raw) {
                Ok(unit) => *counts.entry(unit.job_id).or_default() += 1,
                Err(err) => warn!(error = %err, "skipping malformed queued unit"),
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl ProgressStore for RedisStore {
    async fn put_progress(&self, job_id: JobId, entries: &[ChunkStatus]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let fields = entries
            .iter()
            .map(|entry| Ok((entry.unit_id.to_string(), serde_json::to_string(entry)?)))
            .collect::<Result<Vec<(String, String)>>>()?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(RedisKeys::progress(job_id), &fields)
            .await
            .map_err(|e| redis_err("HSET", e))?;
        Ok(())
    }

    async fn update_progress(
        &self,
        job_id: JobId,
        unit_id: &UnitId,
        mutate: Mutation<'_, ChunkStatus>,
    ) -> Result<Updated<ChunkStatus>> {
        let hash = RedisKeys::progress(job_id);
        self.update_slot(
            Slot::Field {
                hash: &hash,
                field: unit_id.as_str(),
            },
            mutate,
            || CoordinationError::not_found(format!("progress for unit {unit_id}")),
        )
        .await
    }

    async fn list_progress(&self, job_id: JobId) -> Result<Vec<ChunkStatus>> {
        let mut conn = self.conn.clone();
        let raws: Vec<String> = conn
            .hvals(RedisKeys::progress(job_id))
            .await
            .map_err(|e| redis_err("HVALS", e))?;
        let mut entries: Vec<ChunkStatus> = parse_all(raws, "progress");
        entries.sort_by_key(|entry| entry.index);
        Ok(entries)
    }

    async fn remove_progress(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .del(RedisKeys::progress(job_id))
            .await
            .map_err(|e| redis_err("DEL", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobRepository for RedisStore {
    async fn insert_job(&self, record: &JobRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let inserted: bool = conn
            .set_nx(RedisKeys::job(record.id), serde_json::to_string(record)?)
            .await
            .map_err(|e| redis_err("SETNX", e))?;
        if !inserted {
            return Err(CoordinationError::validation(format!(
                "job {} already exists",
                record.id
            )));
        }
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.get_json(&RedisKeys::job(id)).await
    }

    async fn update_job(
        &self,
        id: JobId,
        mutate: Mutation<'_, JobRecord>,
    ) -> Result<Updated<JobRecord>> {
        let key = RedisKeys::job(id);
        self.update_slot(Slot::Key(&key), mutate, || {
            CoordinationError::not_found(format!("job {id}"))
        })
        .await
    }

    async fn delete_job(&self, id: JobId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .del(RedisKeys::job(id))
            .await
            .map_err(|e| redis_err("DEL", e))?;
        Ok(removed > 0)
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        let mut jobs = Vec::new();
        for key in self.scan_keys("job:*").await? {
            let is_record = key
                .strip_prefix("job:")
                .is_some_and(|id| id.parse::<JobId>().is_ok());
            if !is_record {
                continue;
            }
            match self.get_json::<JobRecord>(&key).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(CoordinationError::Serialization(err)) => {
                    warn!(key = %key, error = %err, "skipping malformed job record");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl WorkerStatusStore for RedisStore {
    async fn put_worker_status(&self, status: &WorkerStatus) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(RedisKeys::worker(&status.name), serde_json::to_string(status)?)
            .await
            .map_err(|e| redis_err("SET", e))?;
        let _: i64 = conn
            .sadd(RedisKeys::worker_index(), &status.name)
            .await
            .map_err(|e| redis_err("SADD", e))?;
        Ok(())
    }

    async fn get_worker_status(&self, name: &str) -> Result<Option<WorkerStatus>> {
        self.get_json(&RedisKeys::worker(name)).await
    }

    /// Workers that wrote `worker:{name}` themselves are found by SCAN; index entries whose
    /// record is gone are pruned.
    async fn list_worker_statuses(&self) -> Result<Vec<WorkerStatus>> {
        let mut conn = self.conn.clone();
        let indexed: BTreeSet<String> = conn
            .smembers(RedisKeys::worker_index())
            .await
            .map_err(|e| redis_err("SMEMBERS", e))?;
        let mut names: BTreeSet<String> = self
            .scan_keys("worker:*")
            .await?
            .into_iter()
            .filter_map(|key| key.strip_prefix("worker:").map(str::to_string))
            .collect();
        names.extend(indexed.iter().cloned());

        let mut statuses = Vec::with_capacity(names.len());
        for name in names {
            match self.get_json::<WorkerStatus>(&RedisKeys::worker(&name)).await {
                Ok(Some(status)) => statuses.push(status),
                Ok(None) if indexed.contains(&name) => {
                    let _: i64 = conn
                        .srem(RedisKeys::worker_index(), &name)
                        .await
                        .map_err(|e| redis_err("SREM", e))?;
                    debug!(worker = %name, "pruned worker index entry without a record");
                }
                Ok(None) => {}
                Err(CoordinationError::Serialization(err)) => {
                    warn!(worker = %name, error = %err, "skipping malformed worker record");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(statuses)
    }

    async fn remove_worker_status(&self, name: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .del(RedisKeys::worker(name))
            .await
            .map_err(|e| redis_err("DEL", e))?;
        let _: i64 = conn
            .srem(RedisKeys::worker_index(), name)
            .await
            .map_err(|e| redis_err("SREM", e))?;
        Ok(removed > 0)
    }

    async fn move_worker_status(&self, from: &str, to: &str) -> Result<WorkerMove> {
        let (source, target) = (RedisKeys::worker(from), RedisKeys::worker(to));
        for attempt in 1..=CAS_ATTEMPTS {
            let Some(raw) = self.read_slot(&Slot::Key(&source)).await? else {
                return Ok(WorkerMove::SourceMissing);
            };
            let mut status: WorkerStatus = serde_json::from_str(&raw)?;
            status.name = to.to_string();
            let renamed = serde_json::to_string(&status)?;

            let mut conn = self.conn.clone();
            let outcome: i64 = scripts::move_worker()
                .key(&source)
                .key(&target)
                .key(RedisKeys::worker_index())
                .arg(&raw)
                .arg(&renamed)
                .arg(from)
                .arg(to)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| redis_err("worker move", e))?;
            match outcome {
                1 => return Ok(WorkerMove::Moved),
                -1 => return Ok(WorkerMove::TargetTaken),
                _ => debug!(worker = %from, attempt, "worker record changed, retrying move"),
            }
        }
        Err(CoordinationError::Internal(format!(
            "gave up moving worker {from} after {CAS_ATTEMPTS} contended attempts"
        )))
    }
}

#[async_trait]
impl ControlFlagStore for RedisStore {
    async fn set_control_flag(&self, job_id: JobId, flag: ControlFlag) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(RedisKeys::control(job_id), flag.as_str())
            .await
            .map_err(|e| redis_err("SET", e))?;
        Ok(())
    }

    async fn clear_control_flag(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .del(RedisKeys::control(job_id))
            .await
            .map_err(|e| redis_err("DEL", e))?;
        Ok(())
    }

    async fn control_flag(&self, job_id: JobId) -> Result<Option<ControlFlag>> {
        let raw = self.read_slot(&Slot::Key(&RedisKeys::control(job_id))).await?;
        raw.map(|raw| raw.parse()).transpose()
    }
}

#[async_trait]
impl CronStore for RedisStore {
    async fn put_cron(&self, definition: &CronDefinition) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .hset(
                RedisKeys::crons(),
                definition.id.to_string(),
                serde_json::to_string(definition)?,
            )
            .await
            .map_err(|e| redis_err("HSET", e))?;
        Ok(())
    }

    async fn get_cron(&self, id: CronId) -> Result<Option<CronDefinition>> {
        let field = id.to_string();
        let raw = self
            .read_slot(&Slot::Field {
                hash: RedisKeys::crons(),
                field: &field,
            })
            .await?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(Into::into)
    }

    async fn update_cron(
        &self,
        id: CronId,
        mutate: Mutation<'_, CronDefinition>,
    ) -> Result<Updated<CronDefinition>> {
        let field = id.to_string();
        self.update_slot(
            Slot::Field {
                hash: RedisKeys::crons(),
                field: &field,
            },
            mutate,
            || CoordinationError::not_found(format!("cron definition {id}")),
        )
        .await
    }

    async fn delete_cron(&self, id: CronId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .hdel(RedisKeys::crons(), id.to_string())
            .await
            .map_err(|e| redis_err("HDEL", e))?;
        Ok(removed > 0)
    }

    async fn list_crons(&self) -> Result<Vec<CronDefinition>> {
        let mut conn = self.conn.clone();
        let raws: Vec<String> = conn
            .hvals(RedisKeys::crons())
            .await
            .map_err(|e| redis_err("HVALS", e))?;
        Ok(parse_all(raws, "cron"))
    }
}

#[async_trait]
impl MessageBroker for RedisStore {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| redis_err("PUBLISH", e))?;
        debug!(channel, receivers, "message published");
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| redis_err("pub/sub connect", e))?;
        for channel in channels {
            pubsub
                .subscribe(*channel)
                .await
                .map_err(|e| redis_err("SUBSCRIBE", e))?;
        }
        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(BrokerMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                }),
                Err(err) => {
                    warn!(error = %err, "dropping undecodable pub/sub payload");
                    None
                }
            }
        });
        Ok(Subscription::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_keys_are_scoped_by_environment() {
        let keys = RedisKeys::new("staging");
        assert_eq!(keys.queue(), "queue:staging");
        assert_eq!(keys.sequence(), "queue:staging:seq");
        assert_eq!(keys.claims(), "queue:staging:claims");
        assert_eq!(keys.index(), "queue:staging:index");
    }

    #[test]
    fn record_keys_follow_the_shared_layout() {
        let id: JobId = "0192f1c4-7a3e-7000-8000-000000000001".parse().expect("job id");
        assert_eq!(
            RedisKeys::control(id),
            "task:ctrl:0192f1c4-7a3e-7000-8000-000000000001"
        );
        assert_eq!(
            RedisKeys::progress(id),
            "job:progress:0192f1c4-7a3e-7000-8000-000000000001"
        );
        assert_eq!(RedisKeys::worker("w1"), "worker:w1");
    }

    #[test]
    fn slots_render_for_logs() {
        assert_eq!(Slot::Key("job:1").to_string(), "job:1");
        assert_eq!(
            Slot::Field {
                hash: "cron:definitions",
                field: "abc"
            }
            .to_string(),
            "cron:definitions[abc]"
        );
    }
}
