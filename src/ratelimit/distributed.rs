//! Distributed limiter backed by a shared key-value store.
//!
//! This module provides a limiter whose state lives in an external store so
//! every process enforcing the same rules sees the same counters. It holds
//! no local lock: atomicity comes from the store executing each operation
//! as a single unit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::backend::{effective_block_duration, Limiter, LimiterStats};
use super::keys::{block_pattern, counter_pattern, StoreKeys};
use super::record::deadline;
use super::rules::{Rule, RuleRegistry};
use super::status::{remaining_tries, Status};
use crate::error::{GatekeeperError, Result};
use crate::store::{AttemptLimits, CounterStore, PairSnapshot, RedisStore};

/// Default namespace for store keys.
pub const DEFAULT_KEY_PREFIX: &str = "rl";

/// A limiter whose attempt state lives in a [`CounterStore`].
pub struct DistributedLimiter<S: CounterStore = RedisStore> {
    /// The shared store
    store: S,
    /// Rules shared with administrative callers
    registry: Arc<RuleRegistry>,
    /// Namespace for every key this limiter writes
    key_prefix: String,
}

impl<S: CounterStore> DistributedLimiter<S> {
    /// Create a new distributed limiter.
    pub fn new(store: S, registry: Arc<RuleRegistry>, key_prefix: impl Into<String>) -> Self {
        Self {
            store,
            registry,
            key_prefix: key_prefix.into(),
        }
    }

    /// Get the store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Store keys for a pair.
    pub fn keys(&self, identifier: &str, action: &str) -> StoreKeys {
        StoreKeys::new(&self.key_prefix, identifier, action)
    }

    /// Build a status from the store's view of a pair.
    fn to_status(
        &self,
        identifier: &str,
        action: &str,
        rule: Option<&Rule>,
        snapshot: PairSnapshot,
        now: DateTime<Utc>,
    ) -> Result<Status> {
        let max_attempts = rule.map_or(0, |r| r.max_attempts);

        // The store reports a non-positive TTL for missing keys and for keys
        // without expiry; approximate the window end in that case.
        let window_end = match (snapshot.counter_ttl_ms, rule) {
            (ttl, _) if ttl > 0 => deadline(now, Duration::from_millis(ttl as u64)),
            (_, Some(rule)) => deadline(now, rule.window_size),
            (_, None) => now,
        };

        if let Some(until) = snapshot.blocked_until {
            let blocked_until = DateTime::<Utc>::from_timestamp(until, 0).ok_or_else(|| {
                GatekeeperError::MalformedResponse(format!("block timestamp {} out of range", until))
            })?;

            return Ok(Status {
                identifier: identifier.to_string(),
                action: action.to_string(),
                count: snapshot.count,
                max_attempts,
                remaining_tries: 0,
                window_end,
                blocked: true,
                blocked_until: Some(blocked_until),
            });
        }

        let Some(rule) = rule else {
            return Ok(Status::unlimited(identifier, action, now));
        };

        if snapshot.count == 0 {
            return Ok(Status::fresh(identifier, action, rule, now));
        }

        Ok(Status {
            identifier: identifier.to_string(),
            action: action.to_string(),
            count: snapshot.count,
            max_attempts,
            remaining_tries: remaining_tries(max_attempts, snapshot.count, false),
            window_end,
            blocked: false,
            blocked_until: None,
        })
    }
}

/// Unix seconds for a block deadline, rounded up so the stored value never
/// precedes the real deadline.
fn block_timestamp(until: DateTime<Utc>) -> i64 {
    until.timestamp() + i64::from(until.timestamp_subsec_nanos() > 0)
}

#[async_trait]
impl<S: CounterStore> Limiter for DistributedLimiter<S> {
    async fn record_attempt(&self, identifier: &str, action: &str) -> Result<Status> {
        let keys = self.keys(identifier, action);
        let now = Utc::now();

        trace!(
            identifier = %identifier,
            action = %action,
            counter_key = %keys.counter,
            "Recording distributed attempt"
        );

        let Some(rule) = self.registry.get_active(action) else {
            // Nothing to count, but a manual block still applies.
            let snapshot = self.store.snapshot(&keys).await?;
            return self.to_status(identifier, action, None, snapshot, now);
        };

        let blocked_until = block_timestamp(deadline(now, rule.block_duration));
        let limits = AttemptLimits::new(&rule, blocked_until);
        let snapshot = self.store.record_attempt(&keys, &limits).await?;

        let status = self.to_status(identifier, action, Some(&rule), snapshot, now)?;
        if status.blocked {
            debug!(
                identifier = %identifier,
                action = %action,
                count = status.count,
                blocked_until = ?status.blocked_until,
                "Distributed pair blocked"
            );
        }
        Ok(status)
    }

    async fn get_status(&self, identifier: &str, action: &str) -> Result<Status> {
        let keys = self.keys(identifier, action);
        let rule = self.registry.get_active(action);
        let snapshot = self.store.snapshot(&keys).await?;
        self.to_status(identifier, action, rule.as_ref(), snapshot, Utc::now())
    }

    async fn reset(&self, identifier: &str, action: &str) -> Result<()> {
        self.store.clear(&self.keys(identifier, action)).await?;
        info!(identifier = %identifier, action = %action, "Reset distributed attempt state");
        Ok(())
    }

    async fn block(&self, identifier: &str, action: &str, duration: Duration) -> Result<()> {
        let duration = effective_block_duration(duration);
        let until = block_timestamp(deadline(Utc::now(), duration));

        self.store
            .set_block(&self.keys(identifier, action), until, duration)
            .await?;

        info!(
            identifier = %identifier,
            action = %action,
            blocked_until = until,
            "Pair blocked manually"
        );
        Ok(())
    }

    async fn unblock(&self, identifier: &str, action: &str) -> Result<()> {
        self.store.clear(&self.keys(identifier, action)).await?;
        info!(identifier = %identifier, action = %action, "Pair unblocked");
        Ok(())
    }

    async fn stats(&self) -> Result<LimiterStats> {
        let active_counters = self
            .store
            .count_keys(&counter_pattern(&self.key_prefix))
            .await?;
        let active_blocks = self
            .store
            .count_keys(&block_pattern(&self.key_prefix))
            .await?;

        Ok(LimiterStats {
            configured_rules: self.registry.len(),
            active_counters,
            active_blocks,
        })
    }

    fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }
}
