//! Attempt limiting logic and state management.

mod backend;
mod distributed;
pub mod keys;
mod limiter;
pub mod record;
pub mod rules;
mod status;
mod sweeper;

pub use backend::{effective_block_duration, Limiter, LimiterStats};
pub use distributed::{DistributedLimiter, DEFAULT_KEY_PREFIX};
pub use limiter::LocalLimiter;
pub use record::{StateRecord, INDEFINITE_BLOCK};
pub use rules::{default_rules, merge, Rule, RuleDefinition, RuleRegistry};
pub use status::{CheckResult, Status, UNLIMITED};
pub use sweeper::{Sweeper, DEFAULT_SWEEP_INTERVAL};
