//! Redis implementation of the counter store.
//!
//! Attempts run as one Lua script so the block check, the increment and the
//! first-write expiry cannot interleave with another process. Status reads
//! use a MULTI/EXEC pipeline.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult, Script};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ttl_millis, AttemptLimits, CounterStore, PairSnapshot};
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::keys::StoreKeys;

/// KEYS[1] counter, KEYS[2] block.
/// ARGV[1] max_attempts, ARGV[2] window ms, ARGV[3] block ms, ARGV[4] blocked_until.
/// Returns {count, counter pttl, blocked_until or 0}.
const RECORD_ATTEMPT_SCRIPT: &str = r#"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
local blocked_until = redis.call('GET', KEYS[2])
if blocked_until then
  return {count, redis.call('PTTL', KEYS[1]), tonumber(blocked_until) or -1}
end

if count >= tonumber(ARGV[1]) then
  local block_ms = tonumber(ARGV[3])
  if block_ms > 0 then
    redis.call('SET', KEYS[2], ARGV[4], 'PX', block_ms)
    redis.call('PEXPIRE', KEYS[1], block_ms)
    return {count, block_ms, tonumber(ARGV[4])}
  end
  redis.call('DEL', KEYS[1])
  return {count, 0, tonumber(ARGV[4])}
end

count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return {count, redis.call('PTTL', KEYS[1]), 0}
"#;

/// Keys fetched per SCAN round trip.
const SCAN_BATCH: usize = 500;

/// Counter store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    record_script: Script,
    command_timeout: Duration,
}

impl RedisStore {
    /// Wrap an established connection.
    pub fn new(conn: MultiplexedConnection, command_timeout: Duration) -> Self {
        Self {
            conn,
            record_script: Script::new(RECORD_ATTEMPT_SCRIPT),
            command_timeout,
        }
    }

    /// Open a multiplexed connection to `url`.
    ///
    /// A malformed URL is a configuration error; an unreachable server is a
    /// storage error.
    pub async fn connect(url: &str, command_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GatekeeperError::Config(format!("invalid redis_url: {}", e)))?;

        let conn = tokio::time::timeout(command_timeout, client.get_multiplexed_tokio_connection())
            .await
            .map_err(|_| GatekeeperError::Timeout(command_timeout))??;

        info!(timeout = ?command_timeout, "Connected to Redis");
        Ok(Self::new(conn, command_timeout))
    }

    /// Run a store command under the command deadline.
    async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(op = op, error = %e, "Redis command failed");
                Err(e.into())
            }
            Err(_) => {
                warn!(op = op, timeout = ?self.command_timeout, "Redis command timed out");
                Err(GatekeeperError::Timeout(self.command_timeout))
            }
        }
    }
}

/// Turn the `{count, pttl, blocked_until}` triple into a snapshot.
fn decode_triple(raw: &[i64]) -> Result<PairSnapshot> {
    let [count, ttl, blocked_until] = raw else {
        return Err(GatekeeperError::MalformedResponse(format!(
            "expected 3 values from attempt script, got {}",
            raw.len()
        )));
    };
    if *count < 0 || *blocked_until < 0 {
        return Err(GatekeeperError::MalformedResponse(format!(
            "attempt script returned invalid values {:?}",
            raw
        )));
    }

    Ok(PairSnapshot {
        count: *count as u64,
        counter_ttl_ms: *ttl,
        blocked_until: (*blocked_until > 0).then_some(*blocked_until),
    })
}

/// Parse the decimal Unix timestamp held by a block key.
fn parse_block_payload(payload: Option<String>) -> Result<Option<i64>> {
    payload
        .map(|raw| {
            raw.trim().parse::<i64>().map_err(|_| {
                GatekeeperError::MalformedResponse(format!("block key holds '{}'", raw))
            })
        })
        .transpose()
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn record_attempt(
        &self,
        keys: &StoreKeys,
        limits: &AttemptLimits,
    ) -> Result<PairSnapshot> {
        let mut conn = self.conn.clone();
        let block_ms = if limits.block.is_zero() {
            0
        } else {
            ttl_millis(limits.block)
        };

        let mut invocation = self.record_script.prepare_invoke();
        invocation
            .key(&keys.counter)
            .key(&keys.block)
            .arg(limits.max_attempts)
            .arg(ttl_millis(limits.window))
            .arg(block_ms)
            .arg(limits.blocked_until);

        let raw: Vec<i64> = self
            .run("record_attempt", invocation.invoke_async(&mut conn))
            .await?;
        decode_triple(&raw)
    }

    async fn snapshot(&self, keys: &StoreKeys) -> Result<PairSnapshot> {
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .get(&keys.counter)
            .pttl(&keys.counter)
            .get(&keys.block);

        let (count, ttl, block): (Option<i64>, i64, Option<String>) =
            self.run("snapshot", pipe.query_async(&mut conn)).await?;

        let count = count.unwrap_or(0);
        if count < 0 {
            return Err(GatekeeperError::MalformedResponse(format!(
                "counter key {} holds {}",
                keys.counter, count
            )));
        }

        Ok(PairSnapshot {
            count: count as u64,
            counter_ttl_ms: ttl,
            blocked_until: parse_block_payload(block)?,
        })
    }

    async fn set_block(&self, keys: &StoreKeys, blocked_until: i64, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(&keys.block)
            .arg(blocked_until)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .ignore()
            .del(&keys.counter)
            .ignore();

        self.run("set_block", pipe.query_async::<_, ()>(&mut conn))
            .await
    }

    async fn clear(&self, keys: &StoreKeys) -> Result<()> {
        let mut conn = self.conn.clone();
        let doomed = [keys.counter.as_str(), keys.block.as_str()];

        self.run("clear", conn.del::<_, ()>(&doomed[..])).await
    }

    async fn count_keys(&self, pattern: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut total = 0;

        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);

            let (next, batch): (u64, Vec<String>) =
                self.run("scan", cmd.query_async(&mut conn)).await?;
            total += batch.len();

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %pattern, count = total, "Counted store keys");
        Ok(total)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}
