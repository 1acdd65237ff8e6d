//! In-memory stand-in for the Redis store, used by unit tests.
//!
//! Mirrors the attempt script step for step under a single mutex and
//! emulates key expiry with `Instant` deadlines.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::{AttemptLimits, CounterStore, PairSnapshot};
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::keys::StoreKeys;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live_at(&self, now: Instant) -> bool {
        !self.expires_at.is_some_and(|at| at <= now)
    }

    fn pttl(&self, now: Instant) -> i64 {
        match self.expires_at {
            Some(at) => at.saturating_duration_since(now).as_millis() as i64,
            None => -1,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as if the server were down.
    pub(crate) fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Write a key directly, optionally without expiry.
    pub(crate) fn insert_raw(&self, key: &str, value: i64, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
    }

    /// Whether a live key exists.
    pub(crate) fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .is_some_and(|entry| entry.live_at(now))
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatekeeperError::Storage(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))));
        }
        Ok(())
    }
}

fn purge(entries: &mut HashMap<String, Entry>, keys: &StoreKeys, now: Instant) {
    for key in [&keys.counter, &keys.block] {
        if entries.get(key).is_some_and(|entry| !entry.live_at(now)) {
            entries.remove(key);
        }
    }
}

fn read(entries: &HashMap<String, Entry>, keys: &StoreKeys, now: Instant) -> PairSnapshot {
    let counter = entries.get(&keys.counter);
    PairSnapshot {
        count: counter.map_or(0, |entry| entry.value as u64),
        counter_ttl_ms: counter.map_or(-2, |entry| entry.pttl(now)),
        blocked_until: entries.get(&keys.block).map(|entry| entry.value),
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn record_attempt(
        &self,
        keys: &StoreKeys,
        limits: &AttemptLimits,
    ) -> Result<PairSnapshot> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        purge(&mut entries, keys, now);

        if entries.contains_key(&keys.block) {
            return Ok(read(&entries, keys, now));
        }

        let count = entries.get(&keys.counter).map_or(0, |entry| entry.value);
        if count >= limits.max_attempts as i64 {
            if limits.block.is_zero() {
                entries.remove(&keys.counter);
                return Ok(PairSnapshot {
                    count: count as u64,
                    counter_ttl_ms: 0,
                    blocked_until: Some(limits.blocked_until),
                });
            }
            let until = now + limits.block;
            entries.insert(
                keys.block.clone(),
                Entry {
                    value: limits.blocked_until,
                    expires_at: Some(until),
                },
            );
            if let Some(counter) = entries.get_mut(&keys.counter) {
                counter.expires_at = Some(until);
            }
            return Ok(read(&entries, keys, now));
        }

        let counter = entries.entry(keys.counter.clone()).or_insert(Entry {
            value: 0,
            expires_at: None,
        });
        counter.value += 1;
        if counter.value == 1 {
            counter.expires_at = Some(now + limits.window);
        }
        Ok(read(&entries, keys, now))
    }

    async fn snapshot(&self, keys: &StoreKeys) -> Result<PairSnapshot> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        purge(&mut entries, keys, now);
        Ok(read(&entries, keys, now))
    }

    async fn set_block(&self, keys: &StoreKeys, blocked_until: i64, ttl: Duration) -> Result<()> {
        self.ensure_available()?;
        let mut entries = self.entries.lock();
        entries.remove(&keys.counter);
        entries.insert(
            keys.block.clone(),
            Entry {
                value: blocked_until,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn clear(&self, keys: &StoreKeys) -> Result<()> {
        self.ensure_available()?;
        let mut entries = self.entries.lock();
        entries.remove(&keys.counter);
        entries.remove(&keys.block);
        Ok(())
    }

    async fn count_keys(&self, pattern: &str) -> Result<usize> {
        self.ensure_available()?;
        let prefix = pattern.trim_end_matches('*');
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.live_at(now))
            .count())
    }
}
