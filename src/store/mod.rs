//! Shared key-value store backing the distributed limiter.
//!
//! Each (identifier, action) pair lives in two keys: a counter that expires
//! at window end and a block marker that expires with the block. The
//! [`CounterStore`] trait is the seam between the limiter logic and the
//! store; every method must execute atomically on the store side.

mod redis_store;
#[cfg(test)]
pub(crate) mod memory;

pub use redis_store::RedisStore;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::ratelimit::keys::StoreKeys;
use crate::ratelimit::rules::Rule;

/// Raw state of one pair as held by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairSnapshot {
    /// Counter value, 0 when the key is missing
    pub count: u64,
    /// Counter time-to-live in milliseconds; zero or negative when the key
    /// is missing or has no expiry
    pub counter_ttl_ms: i64,
    /// Unix seconds stored in the block key, when present
    pub blocked_until: Option<i64>,
}

/// Rule parameters the store needs to apply an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptLimits {
    pub max_attempts: u32,
    pub window: Duration,
    pub block: Duration,
    /// Unix seconds written to the block key if this attempt blocks
    pub blocked_until: i64,
}

impl AttemptLimits {
    /// Limits for `rule`, blocking until `blocked_until` if triggered.
    pub fn new(rule: &Rule, blocked_until: i64) -> Self {
        Self {
            max_attempts: rule.max_attempts,
            window: rule.window_size,
            block: rule.block_duration,
            blocked_until,
        }
    }
}

/// Atomic operations the distributed limiter needs from a store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Apply one attempt and return the resulting state.
    ///
    /// If the block key exists nothing changes. If the counter has reached
    /// `max_attempts` the block key is written and the counter is set to
    /// expire with it. Otherwise the counter is incremented, and given the
    /// window as expiry only when the increment created it.
    async fn record_attempt(&self, keys: &StoreKeys, limits: &AttemptLimits)
        -> Result<PairSnapshot>;

    /// Read counter, counter TTL and block marker in one atomic step.
    async fn snapshot(&self, keys: &StoreKeys) -> Result<PairSnapshot>;

    /// Write the block key with an explicit time-to-live and drop the
    /// counter, so the pair starts a new window once the block lapses.
    async fn set_block(&self, keys: &StoreKeys, blocked_until: i64, ttl: Duration) -> Result<()>;

    /// Delete the counter and block keys together.
    async fn clear(&self, keys: &StoreKeys) -> Result<()>;

    /// Count live keys matching a glob pattern.
    async fn count_keys(&self, pattern: &str) -> Result<usize>;
}

/// Milliseconds for a store TTL argument, never zero.
pub(crate) fn ttl_millis(duration: Duration) -> u64 {
    (duration.as_millis().min(u64::MAX as u128) as u64).max(1)
}
