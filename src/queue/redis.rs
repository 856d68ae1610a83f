//! Redis-backed priority queue.
//!
//! Layout under `{prefix}:{queue}`:
//!
//! - `:job:{id}` hash with `payload`, `priority`, `seq`, `attempts`, `lease`, `roc`, `rof`
//! - `:parked:{id}` submission received while `{id}` was active
//! - `:wait` sorted set scored `priority * 2^32 + seq`
//! - `:delayed` sorted set scored by ready time (epoch millis)
//! - `:active` sorted set of reserved ids scored by lease expiry (epoch millis)
//! - `:failed` sorted set scored by failure time, records in `:failed:{id}`
//! - `:completed:{id}` retained completions, `:seq` arrival counter, `:lease`
//!   reservation counter
//!
//! A reservation whose lease runs out without `complete` or `fail` is reclaimed
//! by the next `reserve`, as a failed attempt with no backoff.
//!
//! Every operation is a single Lua script so it is atomic with respect to other
//! producers and workers.

use std::{collections::HashMap, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{Script, aio::MultiplexedConnection};
use tracing::debug;

use crate::{
    models::{
        event::NotificationEvent,
        job::{
            DEFAULT_LEASE_MS, EnqueueOptions, EnqueueOutcome, FailOutcome, FailedJob, Job,
            JobRetryPolicy, QueueCounts, QueueKind,
        },
    },
    queue::JobQueue,
    utils::epoch_millis,
};

const WAIT_SCORE: &str = r#"
local function wait_score(priority, seq)
  return string.format('%.0f', priority * 4294967296 + seq)
end

local function promote_parked(base, id)
  local parked_key = base .. ':parked:' .. id
  if redis.call('EXISTS', parked_key) == 0 then
    return false
  end
  local job_key = base .. ':job:' .. id
  local seq = redis.call('INCR', base .. ':seq')
  redis.call('RENAME', parked_key, job_key)
  redis.call('HSET', job_key, 'seq', seq, 'attempts', 0)
  local priority = tonumber(redis.call('HGET', job_key, 'priority'))
  redis.call('ZADD', base .. ':wait', wait_score(priority, seq), id)
  return true
end

local function settle_failure(base, id, now, max_attempts, backoff, err)
  local job_key = base .. ':job:' .. id
  if redis.call('EXISTS', base .. ':parked:' .. id) == 1 then
    redis.call('DEL', job_key)
    promote_parked(base, id)
    return {'superseded', 0}
  end

  local attempts = tonumber(redis.call('HGET', job_key, 'attempts')) or max_attempts
  if attempts < max_attempts then
    local exponent = math.min(attempts - 1, 20)
    local delay = backoff * (2 ^ exponent)
    redis.call('HSET', job_key, 'last_error', err)
    redis.call('ZADD', base .. ':delayed', string.format('%.0f', now + delay), id)
    return {'retrying', delay}
  end

  if redis.call('HGET', job_key, 'rof') == '1' then
    redis.call('DEL', job_key)
  else
    local failed_key = base .. ':failed:' .. id
    redis.call('RENAME', job_key, failed_key)
    redis.call('HSET', failed_key, 'error', err, 'failed_at', now)
    redis.call('ZADD', base .. ':failed', now, id)
  end
  return {'failed', 0}
end

local function release_lease(base, id, lease)
  if redis.call('HGET', base .. ':job:' .. id, 'lease') ~= lease then
    return false
  end
  return redis.call('ZREM', base .. ':active', id) == 1
end
"#;

const ENQUEUE: &str = r#"
local base = KEYS[1]
local id = ARGV[1]
local job_key = base .. ':job:' .. id
local priority = tonumber(ARGV[3])

if redis.call('ZSCORE', base .. ':active', id) then
  redis.call('HSET', base .. ':parked:' .. id,
    'payload', ARGV[2], 'priority', ARGV[3], 'roc', ARGV[4], 'rof', ARGV[5])
  return 'deferred'
end

if redis.call('EXISTS', job_key) == 1 then
  local seq = tonumber(redis.call('HGET', job_key, 'seq'))
  redis.call('HSET', job_key,
    'payload', ARGV[2], 'priority', ARGV[3], 'roc', ARGV[4], 'rof', ARGV[5], 'attempts', 0)
  redis.call('ZREM', base .. ':delayed', id)
  redis.call('ZADD', base .. ':wait', wait_score(priority, seq), id)
  return 'replaced'
end

local seq = redis.call('INCR', base .. ':seq')
redis.call('HSET', job_key,
  'payload', ARGV[2], 'priority', ARGV[3], 'roc', ARGV[4], 'rof', ARGV[5],
  'attempts', 0, 'seq', seq)
redis.call('ZADD', base .. ':wait', wait_score(priority, seq), id)
return 'added'
"#;

const RESERVE: &str = r#"
local base = KEYS[1]
local now = tonumber(ARGV[1])
local lease_ms = tonumber(ARGV[2])
local max_attempts = tonumber(ARGV[3])

local expired = redis.call('ZRANGEBYSCORE', base .. ':active', '-inf', now)
for _, id in ipairs(expired) do
  redis.call('ZREM', base .. ':active', id)
  settle_failure(base, id, now, max_attempts, 0, 'lease expired')
end

local due = redis.call('ZRANGEBYSCORE', base .. ':delayed', '-inf', now)
for _, id in ipairs(due) do
  redis.call('ZREM', base .. ':delayed', id)
  local job_key = base .. ':job:' .. id
  if redis.call('EXISTS', job_key) == 1 then
    local seq = redis.call('INCR', base .. ':seq')
    local priority = tonumber(redis.call('HGET', job_key, 'priority'))
    redis.call('HSET', job_key, 'seq', seq)
    redis.call('ZADD', base .. ':wait', wait_score(priority, seq), id)
  end
end

local popped = redis.call('ZPOPMIN', base .. ':wait')
if #popped == 0 then
  return false
end

local id = popped[1]
local job_key = base .. ':job:' .. id
local lease = redis.call('INCR', base .. ':lease')
redis.call('ZADD', base .. ':active', string.format('%.0f', now + lease_ms), id)
redis.call('HSET', job_key, 'lease', lease)
local attempts = redis.call('HINCRBY', job_key, 'attempts', 1)
local fields = redis.call('HMGET', job_key, 'payload', 'priority')
return {id, fields[1], tonumber(fields[2]), attempts, lease}
"#;

const COMPLETE: &str = r#"
local base = KEYS[1]
local id = ARGV[1]
if not release_lease(base, id, ARGV[2]) then
  return redis.error_reply('lease ' .. ARGV[2] .. ' on job ' .. id .. ' was lost')
end

local job_key = base .. ':job:' .. id
if redis.call('HGET', job_key, 'roc') == '1' then
  redis.call('DEL', job_key)
else
  redis.call('RENAME', job_key, base .. ':completed:' .. id)
end

if promote_parked(base, id) then
  return 1
end
return 0
"#;

const FAIL: &str = r#"
local base = KEYS[1]
local id = ARGV[1]
if not release_lease(base, id, ARGV[2]) then
  return redis.error_reply('lease ' .. ARGV[2] .. ' on job ' .. id .. ' was lost')
end

return settle_failure(base, id, tonumber(ARGV[3]), tonumber(ARGV[4]), tonumber(ARGV[5]), ARGV[6])
"#;

pub struct RedisJobQueue {
    kind: QueueKind,
    base: String,
    policy: JobRetryPolicy,
    lease: Duration,
    connection: MultiplexedConnection,
    enqueue_script: Script,
    reserve_script: Script,
    complete_script: Script,
    fail_script: Script,
}

impl RedisJobQueue {
    pub fn new(
        kind: QueueKind,
        prefix: &str,
        policy: JobRetryPolicy,
        connection: MultiplexedConnection,
    ) -> Self {
        let script = |body: &str| Script::new(&format!("{}{}", WAIT_SCORE, body));

        Self {
            kind,
            base: format!("{}:{}", prefix, kind.queue_name()),
            policy,
            lease: Duration::from_millis(DEFAULT_LEASE_MS),
            connection,
            enqueue_script: script(ENQUEUE),
            reserve_script: script(RESERVE),
            complete_script: script(COMPLETE),
            fail_script: script(FAIL),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn flag(value: bool) -> &'static str {
        if value { "1" } else { "0" }
    }

    async fn fail_lease(&self, id: &str, lease: u64, error: &str) -> Result<FailOutcome> {
        let mut conn = self.connection.clone();

        let (outcome, delay_ms): (String, u64) = self
            .fail_script
            .key(&self.base)
            .arg(id)
            .arg(lease)
            .arg(epoch_millis())
            .arg(self.policy.attempts)
            .arg(self.policy.backoff_ms)
            .arg(error)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to record failure of job {}: {}", id, e))?;

        match outcome.as_str() {
            "retrying" => Ok(FailOutcome::Retrying { delay_ms }),
            "superseded" => Ok(FailOutcome::Superseded),
            "failed" => Ok(FailOutcome::Failed),
            other => Err(anyhow!("Unexpected fail reply '{}'", other)),
        }
    }

    fn failed_job_from_fields(id: String, fields: HashMap<String, String>) -> Result<FailedJob> {
        let payload = fields
            .get("payload")
            .ok_or_else(|| anyhow!("Failed job {} has no payload", id))?;
        let payload: NotificationEvent = serde_json::from_str(payload)?;

        let attempts = fields
            .get("attempts")
            .and_then(|value| value.parse().ok())
            .unwrap_or_default();

        let failed_at = fields
            .get("failed_at")
            .and_then(|value| value.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        Ok(FailedJob {
            id,
            payload,
            attempts,
            error: fields.get("error").cloned().unwrap_or_default(),
            failed_at,
        })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    async fn enqueue(
        &self,
        payload: NotificationEvent,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome> {
        let body = serde_json::to_string(&payload)?;
        let mut conn = self.connection.clone();

        let outcome: String = self
            .enqueue_script
            .key(&self.base)
            .arg(&options.id)
            .arg(body)
            .arg(options.priority)
            .arg(Self::flag(options.remove_on_complete))
            .arg(Self::flag(options.remove_on_fail))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to enqueue job {}: {}", options.id, e))?;

        debug!(queue = %self.kind, job_id = %options.id, outcome = %outcome, "Job enqueued");

        match outcome.as_str() {
            "added" => Ok(EnqueueOutcome::Added),
            "replaced" => Ok(EnqueueOutcome::Replaced),
            "deferred" => Ok(EnqueueOutcome::Deferred),
            other => Err(anyhow!("Unexpected enqueue reply '{}'", other)),
        }
    }

    async fn reserve(&self) -> Result<Option<Job>> {
        let mut conn = self.connection.clone();

        let reserved: Option<(String, String, u32, u32, u64)> = self
            .reserve_script
            .key(&self.base)
            .arg(epoch_millis())
            .arg(self.lease.as_millis() as u64)
            .arg(self.policy.attempts)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to reserve job from {}: {}", self.kind, e))?;

        let Some((id, payload, priority, attempt, lease)) = reserved else {
            return Ok(None);
        };

        match serde_json::from_str::<NotificationEvent>(&payload) {
            Ok(payload) => Ok(Some(Job {
                id,
                queue: self.kind,
                priority,
                payload,
                attempt,
                lease,
            })),
            Err(e) => {
                // The job is active now; fail it so it does not sit in `:active`.
                self.fail_lease(&id, lease, &format!("undecodable payload: {}", e))
                    .await?;
                Err(Error::from(e).context(format!("Job {} has an undecodable payload", id)))
            }
        }
    }

    async fn complete(&self, job: &Job) -> Result<()> {
        let mut conn = self.connection.clone();

        let _: i64 = self
            .complete_script
            .key(&self.base)
            .arg(&job.id)
            .arg(job.lease)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to complete job {}: {}", job.id, e))?;

        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<FailOutcome> {
        self.fail_lease(&job.id, job.lease, error).await
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let mut conn = self.connection.clone();

        let (waiting, delayed, active, failed): (u64, u64, u64, u64) = redis::pipe()
            .zcard(format!("{}:wait", self.base))
            .zcard(format!("{}:delayed", self.base))
            .zcard(format!("{}:active", self.base))
            .zcard(format!("{}:failed", self.base))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow!("Failed to read counts of {}: {}", self.kind, e))?;

        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            failed,
        })
    }

    async fn failed_jobs(&self) -> Result<Vec<FailedJob>> {
        let mut conn = self.connection.clone();

        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(format!("{}:failed", self.base))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        let mut failed = Vec::with_capacity(ids.len());
        for id in ids {
            let fields: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(format!("{}:failed:{}", self.base, id))
                .query_async(&mut conn)
                .await?;
            if fields.is_empty() {
                continue;
            }
            failed.push(Self::failed_job_from_fields(id, fields)?);
        }

        Ok(failed)
    }
}
