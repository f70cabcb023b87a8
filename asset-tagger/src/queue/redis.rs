//! Redis queue backend (feature `redis-backend`).
//!
//! Same layout as the memory backend, one key per structure under
//! [`KEY_PREFIX`]. Every state transition is a Lua script so it runs
//! atomically on the server; the reaper script is bounded per call.

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{
    EnqueueOutcome, JobQueue, LeaseControl, LeasedTask, QueueMetrics, TaskLease, file_in_progress,
    lease_token,
};
use crate::database::repositories::FileRepository;
use crate::database::time::{duration_ms, ms_after, ms_before, now_ms};
use crate::{Error, Result};

pub const KEY_PREFIX: &str = "tagger:ai";
const REAP_INTERVAL: Duration = Duration::from_secs(1);
const REAP_BATCH: i64 = 100;
const CLEANUP_BATCH: i64 = 500;

const ENQUEUE_LUA: &str = r#"
local fid = ARGV[1]
local prio = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local function push()
  if prio > 0 then
    redis.call('RPUSH', KEYS[1], fid)
  else
    redis.call('LPUSH', KEYS[1], fid)
  end
  redis.call('SADD', KEYS[6], fid)
end

local status = redis.call('HGET', KEYS[8], 'status')
if not status then
  redis.call('HSET', KEYS[8], 'job_id', ARGV[4], 'status', 'queued', 'tries', 0, 'updated_at', now)
  push()
  return 'inserted'
end
if status == 'done' or status == 'ignored' or status == 'skipped' then
  return 'already_settled'
end
if status == 'processing' then
  local lease = tonumber(redis.call('ZSCORE', KEYS[3], fid))
  if lease and lease > now then
    return 'lease_active'
  end
end
if status == 'queued' then
  if prio > 0 and not redis.call('ZSCORE', KEYS[4], fid) then
    redis.call('LREM', KEYS[1], 0, fid)
    push()
  end
  return 'already_queued'
end

redis.call('ZREM', KEYS[3], fid)
redis.call('LREM', KEYS[2], 0, fid)
redis.call('ZREM', KEYS[4], fid)
redis.call('LREM', KEYS[5], 0, fid)
redis.call('ZREM', KEYS[7], fid)
redis.call('LREM', KEYS[1], 0, fid)
redis.call('HSET', KEYS[8], 'status', 'queued', 'updated_at', now)
redis.call('HDEL', KEYS[8], 'lease_by')
push()
return 'requeued'
"#;

const FETCH_LUA: &str = r#"
local fid = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if not fid then
  return false
end
redis.call('ZADD', KEYS[3], ARGV[2], fid)
local jk = ARGV[4] .. fid
redis.call('HSET', jk, 'status', 'processing', 'lease_by', ARGV[1], 'updated_at', ARGV[3])
local job_id = redis.call('HGET', jk, 'job_id') or ''
return {fid, job_id}
"#;

const ACK_LUA: &str = r#"
local fid = ARGV[1]
local job = redis.call('HMGET', KEYS[5], 'status', 'lease_by', 'job_id')
if job[1] ~= 'processing' or job[2] ~= ARGV[2] or job[3] ~= ARGV[3] then
  return 0
end
redis.call('LREM', KEYS[1], 0, fid)
redis.call('ZREM', KEYS[2], fid)
redis.call('SREM', KEYS[3], fid)
redis.call('HSET', KEYS[5], 'status', 'done', 'updated_at', ARGV[4])
redis.call('HDEL', KEYS[5], 'lease_by', 'last_error')
redis.call('ZADD', KEYS[4], ARGV[4], fid)
return 1
"#;

const NACK_LUA: &str = r#"
local fid = ARGV[1]
local job = redis.call('HMGET', KEYS[8], 'status', 'lease_by', 'job_id')
if job[1] ~= 'processing' or job[2] ~= ARGV[2] or job[3] ~= ARGV[3] then
  return 0
end
local now = tonumber(ARGV[4])
local ready_at = tonumber(ARGV[5])
redis.call('LREM', KEYS[2], 0, fid)
redis.call('ZREM', KEYS[3], fid)
redis.call('HINCRBY', KEYS[8], 'tries', 1)
redis.call('HSET', KEYS[8], 'last_error', ARGV[7], 'updated_at', now)
redis.call('HDEL', KEYS[8], 'lease_by')
if ARGV[6] == '1' then
  redis.call('SREM', KEYS[6], fid)
  redis.call('LPUSH', KEYS[5], fid)
  redis.call('ZADD', KEYS[7], now, fid)
  redis.call('HSET', KEYS[8], 'status', 'failed')
elseif ready_at <= now then
  redis.call('LPUSH', KEYS[1], fid)
  redis.call('HSET', KEYS[8], 'status', 'queued')
else
  redis.call('ZADD', KEYS[4], ready_at, fid)
  redis.call('HSET', KEYS[8], 'status', 'queued')
end
return 1
"#;

const RENEW_LUA: &str = r#"
local job = redis.call('HMGET', KEYS[2], 'status', 'lease_by', 'job_id')
if job[1] ~= 'processing' or job[2] ~= ARGV[2] or job[3] ~= ARGV[3] then
  return 0
end
redis.call('ZADD', KEYS[1], ARGV[4], ARGV[1])
redis.call('HSET', KEYS[2], 'updated_at', ARGV[5])
return 1
"#;

const REAP_LUA: &str = r#"
local now = ARGV[1]
local moved = 0
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', '(' .. now, 'LIMIT', 0, ARGV[2])
for _, fid in ipairs(expired) do
  redis.call('ZREM', KEYS[3], fid)
  redis.call('LREM', KEYS[2], 0, fid)
  local jk = ARGV[3] .. fid
  redis.call('HSET', jk, 'status', 'queued', 'updated_at', now)
  redis.call('HDEL', jk, 'lease_by')
  redis.call('LPUSH', KEYS[1], fid)
  moved = moved + 1
end
local ready = redis.call('ZRANGEBYSCORE', KEYS[4], '-inf', now, 'LIMIT', 0, ARGV[2])
for _, fid in ipairs(ready) do
  redis.call('ZREM', KEYS[4], fid)
  redis.call('LPUSH', KEYS[1], fid)
  moved = moved + 1
end
return moved
"#;

const PURGE_LUA: &str = r#"
local removed = 0
for i = 2, #ARGV do
  local fid = ARGV[i]
  local jk = ARGV[1] .. fid
  local s = redis.call('HGET', jk, 'status')
  if s == 'done' or s == 'failed' or s == 'ignored' or s == 'skipped' then
    redis.call('DEL', jk)
    redis.call('LREM', KEYS[1], 0, fid)
    redis.call('ZREM', KEYS[2], fid)
    removed = removed + 1
  end
end
return removed
"#;

const CLEANUP_LUA: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', '(' .. ARGV[1], 'LIMIT', 0, ARGV[3])
for _, fid in ipairs(ids) do
  redis.call('DEL', ARGV[2] .. fid)
  redis.call('LREM', KEYS[1], 0, fid)
  redis.call('ZREM', KEYS[2], fid)
end
return #ids
"#;

/// Key names for one queue namespace.
#[derive(Debug, Clone)]
struct QueueKeys {
    main: String,
    processing: String,
    processing_z: String,
    delayed_z: String,
    dlq: String,
    dedup: String,
    terminal_z: String,
    job_prefix: String,
}

impl QueueKeys {
    fn new(prefix: &str) -> Self {
        Self {
            main: format!("{prefix}:main"),
            processing: format!("{prefix}:processing"),
            processing_z: format!("{prefix}:processing_z"),
            delayed_z: format!("{prefix}:delayed_z"),
            dlq: format!("{prefix}:dlq"),
            dedup: format!("{prefix}:dedup"),
            terminal_z: format!("{prefix}:terminal_z"),
            job_prefix: format!("{prefix}:job:"),
        }
    }

    fn job(&self, file_id: &str) -> String {
        format!("{}{}", self.job_prefix, file_id)
    }
}

struct Scripts {
    enqueue: Script,
    fetch: Script,
    ack: Script,
    nack: Script,
    renew: Script,
    reap: Script,
    purge: Script,
    cleanup: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE_LUA),
            fetch: Script::new(FETCH_LUA),
            ack: Script::new(ACK_LUA),
            nack: Script::new(NACK_LUA),
            renew: Script::new(RENEW_LUA),
            reap: Script::new(REAP_LUA),
            purge: Script::new(PURGE_LUA),
            cleanup: Script::new(CLEANUP_LUA),
        }
    }
}

struct RedisShared {
    conn: ConnectionManager,
    keys: QueueKeys,
    scripts: Scripts,
}

impl RedisShared {
    async fn reap(&self, now: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .scripts
            .reap
            .key(&self.keys.main)
            .key(&self.keys.processing)
            .key(&self.keys.processing_z)
            .key(&self.keys.delayed_z)
            .arg(now)
            .arg(REAP_BATCH)
            .arg(&self.keys.job_prefix)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }
}

/// Queue stored in Redis, shareable between processes.
pub struct RedisJobQueue {
    shared: Arc<RedisShared>,
    files: Arc<dyn FileRepository>,
    worker_id: String,
    cancel: CancellationToken,
}

impl RedisJobQueue {
    /// Connect and spawn the reaper.
    pub async fn connect(
        redis_url: &str,
        files: Arc<dyn FileRepository>,
        worker_id: impl Into<String>,
    ) -> Result<Arc<Self>> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::config(format!("invalid REDIS_URL: {e}")))?;
        let conn = ConnectionManager::new(client).await?;

        let shared = Arc::new(RedisShared {
            conn,
            keys: QueueKeys::new(KEY_PREFIX),
            scripts: Scripts::load(),
        });
        let cancel = CancellationToken::new();

        let reaper = shared.clone();
        let reaper_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = reaper_cancel.cancelled() => break,
                    _ = ticker.tick() => match reaper.reap(now_ms()).await {
                        Ok(0) => {}
                        Ok(moved) => tracing::debug!(moved, "Reaper returned jobs to the main queue"),
                        Err(e) => tracing::warn!(error = %e, "Redis reaper pass failed"),
                    }
                }
            }
            tracing::debug!("Redis queue reaper stopped");
        });

        tracing::info!(prefix = KEY_PREFIX, "Connected Redis job queue");
        Ok(Arc::new(Self {
            shared,
            files,
            worker_id: worker_id.into(),
            cancel,
        }))
    }

    fn control(&self) -> Arc<dyn LeaseControl> {
        Arc::new(RedisLeaseControl {
            shared: self.shared.clone(),
        })
    }
}

fn parse_outcome(raw: &str) -> Result<EnqueueOutcome> {
    match raw {
        "inserted" => Ok(EnqueueOutcome::Inserted),
        "requeued" => Ok(EnqueueOutcome::Requeued),
        "already_settled" => Ok(EnqueueOutcome::AlreadySettled),
        "lease_active" => Ok(EnqueueOutcome::LeaseActive),
        "already_queued" => Ok(EnqueueOutcome::AlreadyQueued),
        other => Err(Error::Database(format!(
            "unexpected enqueue script reply: {other}"
        ))),
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue_unique(&self, file_id: &str, priority: i64) -> Result<EnqueueOutcome> {
        if file_in_progress(self.files.as_ref(), file_id).await? {
            return Ok(EnqueueOutcome::FileInProgress);
        }

        let keys = &self.shared.keys;
        let mut conn = self.shared.conn.clone();
        let raw: String = self
            .shared
            .scripts
            .enqueue
            .key(&keys.main)
            .key(&keys.processing)
            .key(&keys.processing_z)
            .key(&keys.delayed_z)
            .key(&keys.dlq)
            .key(&keys.dedup)
            .key(&keys.terminal_z)
            .key(keys.job(file_id))
            .arg(file_id)
            .arg(priority)
            .arg(now_ms())
            .arg(uuid::Uuid::new_v4().to_string())
            .invoke_async(&mut conn)
            .await?;
        let outcome = parse_outcome(&raw)?;

        if outcome.is_enqueued() || outcome == EnqueueOutcome::AlreadyQueued {
            self.files.mark_pending(file_id).await?;
        }
        tracing::debug!(file_id, ?outcome, "Enqueue");
        Ok(outcome)
    }

    async fn fetch(&self, lease: Duration) -> Result<Option<LeasedTask>> {
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        let keys = &self.shared.keys;
        let token = lease_token(&self.worker_id);
        let mut conn = self.shared.conn.clone();
        let claimed: Option<(String, String)> = self
            .shared
            .scripts
            .fetch
            .key(&keys.main)
            .key(&keys.processing)
            .key(&keys.processing_z)
            .arg(&token)
            .arg(ms_after(lease))
            .arg(now_ms())
            .arg(&keys.job_prefix)
            .invoke_async(&mut conn)
            .await?;

        Ok(claimed.map(|(file_id, job_id)| {
            LeasedTask::new(
                TaskLease {
                    job_id,
                    file_id,
                    token,
                },
                self.control(),
            )
        }))
    }

    async fn metrics(&self) -> Result<QueueMetrics> {
        let keys = &self.shared.keys;
        let mut conn = self.shared.conn.clone();
        let (queued, in_flight, delayed, dlq): (i64, i64, i64, i64) = redis::pipe()
            .cmd("LLEN")
            .arg(&keys.main)
            .cmd("LLEN")
            .arg(&keys.processing)
            .cmd("ZCARD")
            .arg(&keys.delayed_z)
            .cmd("LLEN")
            .arg(&keys.dlq)
            .query_async(&mut conn)
            .await?;
        Ok(QueueMetrics {
            queued,
            in_flight,
            delayed,
            dlq,
        })
    }

    async fn purge_terminal(&self, file_ids: &[String]) -> Result<u64> {
        if file_ids.is_empty() {
            return Ok(0);
        }
        let keys = &self.shared.keys;
        let mut conn = self.shared.conn.clone();
        let mut invocation = self.shared.scripts.purge.prepare_invoke();
        invocation
            .key(&keys.dlq)
            .key(&keys.terminal_z)
            .arg(&keys.job_prefix);
        for id in file_ids {
            invocation.arg(id);
        }
        let removed: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(removed.max(0) as u64)
    }

    async fn cleanup_terminal(&self, older_than: Duration) -> Result<u64> {
        let keys = &self.shared.keys;
        let cutoff = ms_before(older_than);
        let mut total = 0u64;
        loop {
            let mut conn = self.shared.conn.clone();
            let removed: i64 = self
                .shared
                .scripts
                .cleanup
                .key(&keys.dlq)
                .key(&keys.terminal_z)
                .arg(cutoff)
                .arg(&keys.job_prefix)
                .arg(CLEANUP_BATCH)
                .invoke_async(&mut conn)
                .await?;
            total += removed.max(0) as u64;
            if removed < CLEANUP_BATCH {
                break;
            }
        }
        Ok(total)
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RedisJobQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct RedisLeaseControl {
    shared: Arc<RedisShared>,
}

#[async_trait]
impl LeaseControl for RedisLeaseControl {
    async fn ack(&self, lease: &TaskLease) -> Result<()> {
        let keys = &self.shared.keys;
        let mut conn = self.shared.conn.clone();
        let settled: i64 = self
            .shared
            .scripts
            .ack
            .key(&keys.processing)
            .key(&keys.processing_z)
            .key(&keys.dedup)
            .key(&keys.terminal_z)
            .key(keys.job(&lease.file_id))
            .arg(&lease.file_id)
            .arg(&lease.token)
            .arg(&lease.job_id)
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;
        if settled == 0 {
            tracing::debug!(file_id = %lease.file_id, "Ack ignored: lease no longer held");
        }
        Ok(())
    }

    async fn nack(
        &self,
        lease: &TaskLease,
        delay: Duration,
        to_dlq: bool,
        reason: &str,
    ) -> Result<()> {
        let keys = &self.shared.keys;
        let now = now_ms();
        let mut conn = self.shared.conn.clone();
        let settled: i64 = self
            .shared
            .scripts
            .nack
            .key(&keys.main)
            .key(&keys.processing)
            .key(&keys.processing_z)
            .key(&keys.delayed_z)
            .key(&keys.dlq)
            .key(&keys.dedup)
            .key(&keys.terminal_z)
            .key(keys.job(&lease.file_id))
            .arg(&lease.file_id)
            .arg(&lease.token)
            .arg(&lease.job_id)
            .arg(now)
            .arg(now.saturating_add(duration_ms(delay)))
            .arg(if to_dlq { "1" } else { "0" })
            .arg(reason)
            .invoke_async(&mut conn)
            .await?;
        if settled == 0 {
            tracing::debug!(file_id = %lease.file_id, "Nack ignored: lease no longer held");
        }
        Ok(())
    }

    async fn renew(&self, lease: &TaskLease, extend: Duration) -> Result<bool> {
        let keys = &self.shared.keys;
        let mut conn = self.shared.conn.clone();
        let renewed: i64 = self
            .shared
            .scripts
            .renew
            .key(&keys.processing_z)
            .key(keys.job(&lease.file_id))
            .arg(&lease.file_id)
            .arg(&lease.token)
            .arg(&lease.job_id)
            .arg(ms_after(extend))
            .arg(now_ms())
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new(KEY_PREFIX);
        assert_eq!(keys.main, "tagger:ai:main");
        assert_eq!(keys.processing_z, "tagger:ai:processing_z");
        assert_eq!(keys.job("f1"), "tagger:ai:job:f1");
    }

    #[test]
    fn test_script_replies_map_to_outcomes() {
        assert_eq!(parse_outcome("inserted").unwrap(), EnqueueOutcome::Inserted);
        assert_eq!(
            parse_outcome("lease_active").unwrap(),
            EnqueueOutcome::LeaseActive
        );
        assert!(parse_outcome("bogus").is_err());
    }
}
