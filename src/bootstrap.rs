//! Wires a validated configuration into a ready limiter.

use std::sync::Arc;
use tracing::info;

use crate::config::{BackendKind, GatekeeperConfig};
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{DistributedLimiter, Limiter, LocalLimiter, RuleRegistry};
use crate::store::RedisStore;

/// Build the limiter selected by `config`.
///
/// Must be called from within a Tokio runtime: the local backend spawns its
/// sweeper and the distributed backend connects before returning.
pub async fn build_limiter(config: &GatekeeperConfig) -> Result<Arc<dyn Limiter>> {
    config.validate()?;
    let registry = Arc::new(RuleRegistry::with_rules(config.rule_set()?)?);

    match config.backend {
        BackendKind::Local => {
            info!(
                rules = registry.len(),
                sweep_interval_secs = config.local.sweep_interval_secs,
                "Using local backend"
            );
            Ok(Arc::new(LocalLimiter::with_sweep_interval(
                registry,
                config.local.sweep_interval(),
            )))
        }
        BackendKind::Distributed => {
            let url = config.distributed.redis_url.as_deref().ok_or_else(|| {
                GatekeeperError::Config("distributed.redis_url is not set".to_string())
            })?;
            let store = RedisStore::connect(url, config.distributed.command_timeout()).await?;
            info!(
                rules = registry.len(),
                key_prefix = %config.distributed.key_prefix,
                "Using distributed backend"
            );
            Ok(Arc::new(DistributedLimiter::new(
                store,
                registry,
                config.distributed.key_prefix.clone(),
            )))
        }
    }
}
