//! In-process limiter backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::backend::{effective_block_duration, Limiter, LimiterStats};
use super::keys::PairKey;
use super::record::{AttemptOutcome, StateRecord};
use super::rules::RuleRegistry;
use super::status::Status;
use super::sweeper::{Sweeper, DEFAULT_SWEEP_INTERVAL};
use crate::error::Result;

type Records = RwLock<HashMap<PairKey, StateRecord>>;

/// Limiter that keeps all attempt state in this process.
///
/// One readers-writer lock covers the whole read-modify-write of every
/// mutating call, so concurrent attempts on a pair never lose an increment.
/// The critical sections do no I/O.
pub struct LocalLimiter {
    /// Rules shared with administrative callers
    registry: Arc<RuleRegistry>,
    /// Attempt state indexed by pair
    records: Arc<Records>,
    /// Idle-record sweep task, absent when built without one
    sweeper: Option<Sweeper>,
}

impl LocalLimiter {
    /// Create a limiter sweeping idle state every five minutes.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(registry: Arc<RuleRegistry>) -> Self {
        Self::with_sweep_interval(registry, DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a limiter with a custom sweep interval.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_sweep_interval(registry: Arc<RuleRegistry>, interval: Duration) -> Self {
        let records: Arc<Records> = Arc::new(RwLock::new(HashMap::new()));
        let swept = records.clone();
        let sweeper = Sweeper::spawn(interval, move || sweep(&swept, Utc::now()));

        Self {
            registry,
            records,
            sweeper: Some(sweeper),
        }
    }

    /// Create a limiter with no background task; call [`LocalLimiter::sweep_now`] to prune.
    pub fn without_sweeper(registry: Arc<RuleRegistry>) -> Self {
        Self {
            registry,
            records: Arc::new(RwLock::new(HashMap::new())),
            sweeper: None,
        }
    }

    /// Run one sweep pass, returning the number of records removed.
    pub fn sweep_now(&self) -> usize {
        sweep(&self.records, Utc::now())
    }

    /// Number of records currently held, including idle ones.
    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the background sweep task is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.as_ref().is_some_and(Sweeper::is_running)
    }

    /// Clear all records.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.records.write().clear();
    }

    fn remove(&self, identifier: &str, action: &str) -> bool {
        let key = PairKey::new(identifier, action);
        self.records.write().remove(&key).is_some()
    }
}

/// Drop every record whose window has closed and which is not blocked.
fn sweep(records: &Records, now: DateTime<Utc>) -> usize {
    let mut records = records.write();
    let before = records.len();
    records.retain(|_, record| !record.is_idle_at(now));
    before - records.len()
}

#[async_trait]
impl Limiter for LocalLimiter {
    async fn record_attempt(&self, identifier: &str, action: &str) -> Result<Status> {
        let key = PairKey::new(identifier, action);
        let rule = self.registry.get_active(action);
        let now = Utc::now();

        trace!(key = %key, "Recording attempt");

        let mut records = self.records.write();

        // Blocks are honoured even without a rule so manual blocks on
        // unconfigured actions hold.
        if let Some(record) = records.get(&key) {
            if record.is_blocked_at(now) {
                let max = rule.as_ref().map_or(0, |r| r.max_attempts);
                return Ok(record.to_status(identifier, action, max, now));
            }
        }

        let Some(rule) = rule else {
            return Ok(Status::unlimited(identifier, action, now));
        };

        let (outcome, status) = match records.entry(key) {
            Entry::Occupied(mut entry) => {
                let outcome = entry.get_mut().attempt(&rule, now);
                let status = entry
                    .get()
                    .to_status(identifier, action, rule.max_attempts, now);
                (outcome, status)
            }
            Entry::Vacant(entry) => {
                let record = entry.insert(StateRecord::new_window(rule.window_size, now));
                let status = record.to_status(identifier, action, rule.max_attempts, now);
                (AttemptOutcome::NewWindow, status)
            }
        };
        drop(records);

        match outcome {
            AttemptOutcome::NewWindow => debug!(
                identifier = %identifier,
                action = %action,
                window_end = %status.window_end,
                "Started new attempt window"
            ),
            AttemptOutcome::Blocked => debug!(
                identifier = %identifier,
                action = %action,
                count = status.count,
                blocked_until = ?status.blocked_until,
                "Attempt limit reached, pair blocked"
            ),
            AttemptOutcome::Counted | AttemptOutcome::StillBlocked => {}
        }

        Ok(status)
    }

    async fn get_status(&self, identifier: &str, action: &str) -> Result<Status> {
        let key = PairKey::new(identifier, action);
        let rule = self.registry.get_active(action);
        let now = Utc::now();

        let records = self.records.read();
        let record = records.get(&key);

        let status = match (record, rule) {
            (Some(record), rule) if record.is_blocked_at(now) => {
                let max = rule.map_or(0, |r| r.max_attempts);
                record.to_status(identifier, action, max, now)
            }
            (_, None) => Status::unlimited(identifier, action, now),
            (Some(record), Some(rule)) if record.is_live_at(now) => {
                record.to_status(identifier, action, rule.max_attempts, now)
            }
            (_, Some(rule)) => Status::fresh(identifier, action, &rule, now),
        };

        Ok(status)
    }

    async fn reset(&self, identifier: &str, action: &str) -> Result<()> {
        let removed = self.remove(identifier, action);
        info!(identifier = %identifier, action = %action, removed = removed, "Reset attempt state");
        Ok(())
    }

    async fn block(&self, identifier: &str, action: &str, duration: Duration) -> Result<()> {
        let duration = effective_block_duration(duration);
        let record = StateRecord::manual_block(duration, Utc::now());
        let blocked_until = record.blocked_until;

        self.records
            .write()
            .insert(PairKey::new(identifier, action), record);

        info!(
            identifier = %identifier,
            action = %action,
            blocked_until = ?blocked_until,
            "Pair blocked manually"
        );
        Ok(())
    }

    async fn unblock(&self, identifier: &str, action: &str) -> Result<()> {
        let removed = self.remove(identifier, action);
        info!(identifier = %identifier, action = %action, removed = removed, "Pair unblocked");
        Ok(())
    }

    async fn stats(&self) -> Result<LimiterStats> {
        let now = Utc::now();
        let records = self.records.read();

        let mut stats = LimiterStats {
            configured_rules: self.registry.len(),
            ..LimiterStats::default()
        };
        for record in records.values() {
            if record.is_blocked_at(now) {
                stats.active_blocks += 1;
            } else if record.is_live_at(now) {
                stats.active_counters += 1;
            }
        }
        Ok(stats)
    }

    fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    async fn shutdown(&self) {
        if let Some(sweeper) = &self.sweeper {
            sweeper.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::record::MANUAL_BLOCK_COUNT;
    use crate::ratelimit::rules::Rule;
    use chrono::Duration as ChronoDuration;
    use tokio_test::assert_ok;

    fn login_rule() -> Rule {
        Rule::new(
            "login",
            5,
            Duration::from_secs(5 * 60),
            Duration::from_secs(30 * 60),
        )
    }

    fn limiter_with(rules: Vec<Rule>) -> LocalLimiter {
        let registry = Arc::new(RuleRegistry::with_rules(rules).unwrap());
        LocalLimiter::without_sweeper(registry)
    }

    #[tokio::test]
    async fn test_login_scenario() {
        let limiter = limiter_with(vec![login_rule()]);
        let id = "203.0.113.7";

        let expected = [(1, 4), (2, 3), (3, 2), (4, 1), (5, 0)];
        for (count, remaining) in expected {
            let status = assert_ok!(limiter.record_attempt(id, "login").await);
            assert_eq!(status.count, count);
            assert_eq!(status.remaining_tries, remaining);
            assert!(!status.blocked);
        }

        let before = Utc::now();
        let status = assert_ok!(limiter.record_attempt(id, "login").await);
        assert_eq!(status.count, 5);
        assert_eq!(status.remaining_tries, 0);
        assert!(status.blocked);

        let until = status.blocked_until.unwrap();
        assert!(until >= before + ChronoDuration::minutes(30));
        assert!(until <= Utc::now() + ChronoDuration::minutes(30));
    }

    #[tokio::test]
    async fn test_blocked_attempts_do_not_increment() {
        let limiter = limiter_with(vec![login_rule()]);

        for _ in 0..10 {
            limiter.record_attempt("u1", "login").await.unwrap();
        }
        let status = limiter.get_status("u1", "login").await.unwrap();
        assert_eq!(status.count, 5);
        assert!(status.blocked);
        assert!(!limiter.check("u1", "login").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_status_has_no_side_effects() {
        let limiter = limiter_with(vec![login_rule()]);

        limiter.record_attempt("u1", "login").await.unwrap();
        for _ in 0..5 {
            let status = limiter.get_status("u1", "login").await.unwrap();
            assert_eq!(status.count, 1);
        }
        let status = limiter.record_attempt("u1", "login").await.unwrap();
        assert_eq!(status.count, 2);
    }

    #[tokio::test]
    async fn test_status_of_unseen_pair() {
        let limiter = limiter_with(vec![login_rule()]);

        let status = limiter.get_status("198.51.100.1", "login").await.unwrap();
        assert_eq!(status.count, 0);
        assert_eq!(status.remaining_tries, 5);
        assert!(!status.blocked);
        assert_eq!(limiter.record_count(), 0);
        assert!(limiter.check("198.51.100.1", "login").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_action_is_unlimited() {
        let limiter = limiter_with(vec![login_rule()]);

        for _ in 0..20 {
            let status = limiter.record_attempt("u1", "download").await.unwrap();
            assert_eq!(status.remaining_tries, -1);
            assert!(!status.blocked);
        }
        assert_eq!(limiter.record_count(), 0);
        assert!(limiter.check("u1", "download").await.unwrap());
    }

    #[tokio::test]
    async fn test_inactive_rule_is_unlimited() {
        let limiter = limiter_with(vec![login_rule().inactive()]);

        let status = limiter.record_attempt("u1", "login").await.unwrap();
        assert!(status.is_unlimited());
        assert_eq!(limiter.record_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_identifier_is_an_ordinary_key() {
        let limiter = limiter_with(vec![login_rule()]);

        let status = limiter.record_attempt("", "login").await.unwrap();
        assert_eq!(status.count, 1);
        let status = limiter.record_attempt("", "").await.unwrap();
        assert!(status.is_unlimited());
    }

    #[tokio::test]
    async fn test_reset_behaves_like_first_call() {
        let limiter = limiter_with(vec![login_rule()]);

        for _ in 0..6 {
            limiter.record_attempt("u1", "login").await.unwrap();
        }
        assert!(!limiter.check("u1", "login").await.unwrap());

        limiter.reset("u1", "login").await.unwrap();
        let status = limiter.record_attempt("u1", "login").await.unwrap();
        assert_eq!(status.count, 1);
        assert_eq!(status.remaining_tries, 4);
        assert!(!status.blocked);
    }

    #[tokio::test]
    async fn test_indefinite_manual_block() {
        let limiter = limiter_with(vec![login_rule()]);

        limiter.block("u1", "login", Duration::ZERO).await.unwrap();
        assert!(!limiter.check("u1", "login").await.unwrap());

        let status = limiter.get_status("u1", "login").await.unwrap();
        assert!(status.blocked);
        assert_eq!(status.count, MANUAL_BLOCK_COUNT);
        let horizon = Utc::now() + ChronoDuration::days(300);
        assert!(!status.is_allowed_at(horizon));

        // Attempts while blocked do not change anything
        let status = limiter.record_attempt("u1", "login").await.unwrap();
        assert!(status.blocked);
        assert_eq!(status.count, MANUAL_BLOCK_COUNT);

        limiter.unblock("u1", "login").await.unwrap();
        assert!(limiter.check("u1", "login").await.unwrap());
        let status = limiter.record_attempt("u1", "login").await.unwrap();
        assert_eq!(status.count, 1);
    }

    #[tokio::test]
    async fn test_manual_block_without_rule() {
        let limiter = limiter_with(vec![]);

        limiter
            .block("u1", "export", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(!limiter.check("u1", "export").await.unwrap());
        let status = limiter.record_attempt("u1", "export").await.unwrap();
        assert!(status.blocked);
        assert_eq!(status.max_attempts, 0);
    }

    #[tokio::test]
    async fn test_manual_block_lapse_starts_new_window() {
        let rule = Rule::new(
            "login",
            2,
            Duration::from_secs(60),
            Duration::from_secs(30 * 60),
        );
        let limiter = limiter_with(vec![rule]);

        for _ in 0..2 {
            limiter.record_attempt("u1", "login").await.unwrap();
        }
        limiter
            .block("u1", "login", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!limiter.check("u1", "login").await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;

        let status = limiter.record_attempt("u1", "login").await.unwrap();
        assert_eq!((status.count, status.blocked), (1, false));
        assert_eq!(status.remaining_tries, 1);
    }

    #[tokio::test]
    async fn test_zero_length_rule_block() {
        let rule = Rule::new("email_verify", 2, Duration::from_secs(60), Duration::ZERO);
        let limiter = limiter_with(vec![rule]);

        for expected in 1..=2 {
            let status = limiter.record_attempt("u1", "email_verify").await.unwrap();
            assert_eq!(status.count, expected);
            assert!(!status.blocked);
        }

        let status = limiter.record_attempt("u1", "email_verify").await.unwrap();
        assert!(status.blocked);
        assert_eq!(status.count, 2);
        assert_eq!(status.remaining_tries, 0);
        assert!(status.blocked_until.is_some());

        let status = limiter.record_attempt("u1", "email_verify").await.unwrap();
        assert_eq!((status.count, status.blocked), (1, false));
    }

    #[tokio::test]
    async fn test_new_window_after_block_expires() {
        let rule = Rule::new(
            "otp_request",
            2,
            Duration::from_secs(60),
            Duration::from_millis(50),
        );
        let limiter = limiter_with(vec![rule]);

        for _ in 0..3 {
            limiter.record_attempt("u1", "otp_request").await.unwrap();
        }
        assert!(!limiter.check("u1", "otp_request").await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;

        let status = limiter.record_attempt("u1", "otp_request").await.unwrap();
        assert_eq!(status.count, 1);
        assert!(!status.blocked);
    }

    #[tokio::test]
    async fn test_new_window_after_window_expires() {
        let rule = Rule::new(
            "resend_email",
            3,
            Duration::from_millis(50),
            Duration::from_secs(60),
        );
        let limiter = limiter_with(vec![rule]);

        limiter.record_attempt("u1", "resend_email").await.unwrap();
        limiter.record_attempt("u1", "resend_email").await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        let status = limiter.get_status("u1", "resend_email").await.unwrap();
        assert_eq!(status.count, 0);
        assert_eq!(status.remaining_tries, 3);

        let status = limiter.record_attempt("u1", "resend_email").await.unwrap();
        assert_eq!(status.count, 1);
    }

    #[tokio::test]
    async fn test_rules_added_at_runtime_take_effect() {
        let limiter = limiter_with(vec![]);

        let status = limiter.record_attempt("u1", "login").await.unwrap();
        assert!(status.is_unlimited());

        limiter.registry().add(login_rule()).unwrap();
        let status = limiter.record_attempt("u1", "login").await.unwrap();
        assert_eq!(status.count, 1);
        assert_eq!(limiter.rules().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_now_removes_idle_records_only() {
        let short = Rule::new("api_call", 10, Duration::from_millis(20), Duration::ZERO);
        let limiter = limiter_with(vec![short, login_rule()]);

        limiter.record_attempt("u1", "api_call").await.unwrap();
        limiter.record_attempt("u1", "login").await.unwrap();
        limiter
            .block("u2", "api_call", Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(limiter.sweep_now(), 1);
        assert_eq!(limiter.record_count(), 2);
    }

    #[tokio::test]
    async fn test_background_sweeper_prunes_and_stops() {
        let registry = Arc::new(
            RuleRegistry::with_rules(vec![Rule::new(
                "api_call",
                10,
                Duration::from_millis(10),
                Duration::ZERO,
            )])
            .unwrap(),
        );
        let limiter = LocalLimiter::with_sweep_interval(registry, Duration::from_millis(20));
        assert!(limiter.is_sweeping());

        limiter.record_attempt("u1", "api_call").await.unwrap();
        assert_eq!(limiter.record_count(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(limiter.record_count(), 0);

        limiter.shutdown().await;
        assert!(!limiter.is_sweeping());
    }

    #[tokio::test]
    async fn test_stats() {
        let limiter = limiter_with(vec![login_rule()]);

        limiter.record_attempt("u1", "login").await.unwrap();
        limiter.record_attempt("u2", "login").await.unwrap();
        limiter.block("u3", "login", Duration::ZERO).await.unwrap();

        let stats = limiter.stats().await.unwrap();
        assert_eq!(stats.configured_rules, 1);
        assert_eq!(stats.active_counters, 2);
        assert_eq!(stats.active_blocks, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_attempts_lose_no_updates() {
        let limiter = Arc::new(limiter_with(vec![login_rule()]));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.record_attempt("u1", "login").await })
            })
            .collect();

        let statuses: Vec<Status> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        let allowed = statuses.iter().filter(|s| !s.blocked).count();
        let blocked = statuses.iter().filter(|s| s.blocked).count();
        assert_eq!(allowed, 5);
        assert_eq!(blocked, 45);

        let mut counts: Vec<u64> = statuses
            .iter()
            .filter(|s| !s.blocked)
            .map(|s| s.count)
            .collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![1, 2, 3, 4, 5]);

        let status = limiter.get_status("u1", "login").await.unwrap();
        assert_eq!(status.count, 5);
    }
}
