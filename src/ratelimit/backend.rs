//! The limiter contract shared by the local and distributed backends.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::record::INDEFINITE_BLOCK;
use super::rules::{Rule, RuleRegistry};
use super::status::Status;
use crate::error::Result;

/// Aggregate counts for administrative dashboards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub configured_rules: usize,
    pub active_counters: usize,
    pub active_blocks: usize,
}

/// Trait for limiter implementations.
///
/// This trait abstracts over both the in-process `LocalLimiter` and the
/// store-backed `DistributedLimiter`. A backend is chosen once at
/// construction; callers hold an `Arc<dyn Limiter>` and never need to know
/// which one they got.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Whether an attempt would be allowed right now. Never mutates state.
    async fn check(&self, identifier: &str, action: &str) -> Result<bool> {
        Ok(self.get_status(identifier, action).await?.is_allowed())
    }

    /// Count one attempt and return the resulting status.
    async fn record_attempt(&self, identifier: &str, action: &str) -> Result<Status>;

    /// Current status without counting an attempt.
    async fn get_status(&self, identifier: &str, action: &str) -> Result<Status>;

    /// Clear counter and block state for the pair.
    async fn reset(&self, identifier: &str, action: &str) -> Result<()>;

    /// Block the pair for `duration`; zero blocks until [`Limiter::unblock`].
    async fn block(&self, identifier: &str, action: &str, duration: Duration) -> Result<()>;

    /// Lift a block and clear the counter.
    async fn unblock(&self, identifier: &str, action: &str) -> Result<()>;

    /// Aggregate counts of rules, counters and blocks.
    async fn stats(&self) -> Result<LimiterStats>;

    /// The registry this backend reads rules from.
    fn registry(&self) -> &Arc<RuleRegistry>;

    /// All configured rules.
    fn rules(&self) -> Vec<Rule> {
        self.registry().list()
    }

    /// Stop background work owned by the backend.
    async fn shutdown(&self) {}
}

/// Map the "indefinite" request onto a bounded duration.
pub fn effective_block_duration(duration: Duration) -> Duration {
    if duration.is_zero() {
        INDEFINITE_BLOCK
    } else {
        duration
    }
}
