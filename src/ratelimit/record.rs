//! Per-pair attempt state and its window/block transitions.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

use super::rules::Rule;
use super::status::{remaining_tries, Status};

/// Count reported for pairs blocked by an administrator.
///
/// Only visible through status views; it never feeds the limit check.
pub const MANUAL_BLOCK_COUNT: u64 = 999_999;

/// Stand-in for "blocked until unblocked": long, but still expirable.
pub const INDEFINITE_BLOCK: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Add a std duration to a timestamp without overflowing.
pub(crate) fn deadline(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or_else(|| now + ChronoDuration::days(365 * 100))
}

/// What an attempt did to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The pair was blocked; nothing changed
    StillBlocked,
    /// The previous window (or block) had elapsed and a new one started
    NewWindow,
    /// The attempt was counted in the live window
    Counted,
    /// The limit had been reached and the pair is now blocked
    Blocked,
}

/// Attempt state for one (identifier, action) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    /// Attempts counted in this window
    pub count: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub blocked: bool,
    pub blocked_until: Option<DateTime<Utc>>,
}

impl StateRecord {
    /// Start a window holding its first attempt.
    pub fn new_window(window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            window_start: now,
            window_end: deadline(now, window),
            blocked: false,
            blocked_until: None,
        }
    }

    /// Record for an administrative block, independent of any rule.
    pub fn manual_block(duration: Duration, now: DateTime<Utc>) -> Self {
        let until = deadline(now, duration);
        Self {
            count: MANUAL_BLOCK_COUNT,
            window_start: now,
            window_end: until,
            blocked: true,
            blocked_until: Some(until),
        }
    }

    /// Whether a block is in force at `now`.
    pub fn is_blocked_at(&self, now: DateTime<Utc>) -> bool {
        self.blocked && self.blocked_until.is_some_and(|until| until > now)
    }

    /// Whether the counting window has closed at `now`.
    pub fn window_elapsed_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_end
    }

    /// Whether the record still describes the pair at `now`.
    ///
    /// False once the window has closed or a block has lapsed; the next
    /// attempt will then start over.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.is_blocked_at(now) || (!self.blocked && !self.window_elapsed_at(now))
    }

    /// Whether the sweeper may drop this record.
    pub fn is_idle_at(&self, now: DateTime<Utc>) -> bool {
        self.window_elapsed_at(now) && !self.is_blocked_at(now)
    }

    /// Apply one attempt under `rule`.
    ///
    /// A blocked record is left untouched so the count cannot drift while
    /// blocked. Once the limit is reached the next attempt blocks the pair
    /// instead of counting.
    pub fn attempt(&mut self, rule: &Rule, now: DateTime<Utc>) -> AttemptOutcome {
        if self.is_blocked_at(now) {
            return AttemptOutcome::StillBlocked;
        }

        if self.blocked || self.window_elapsed_at(now) {
            *self = Self::new_window(rule.window_size, now);
            return AttemptOutcome::NewWindow;
        }

        if self.count >= rule.max_attempts as u64 {
            self.blocked = true;
            self.blocked_until = Some(deadline(now, rule.block_duration));
            return AttemptOutcome::Blocked;
        }

        self.count += 1;
        AttemptOutcome::Counted
    }

    /// Project into a caller-facing status.
    pub fn to_status(
        &self,
        identifier: &str,
        action: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Status {
        // Inclusive so a zero-length block is still reported by the attempt
        // that triggered it.
        let blocked = self.blocked && self.blocked_until.is_some_and(|until| until >= now);
        let (count, window_end) = if !blocked && (self.blocked || self.window_elapsed_at(now)) {
            (0, now)
        } else {
            (self.count, self.window_end)
        };

        Status {
            identifier: identifier.to_string(),
            action: action.to_string(),
            count,
            max_attempts,
            remaining_tries: remaining_tries(max_attempts, count, blocked),
            window_end,
            blocked,
            blocked_until: if blocked { self.blocked_until } else { None },
        }
    }
}
