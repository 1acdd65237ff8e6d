//! Read-only views handed to callers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use super::record::deadline;
use super::rules::Rule;

/// `remaining_tries` value for pairs whose action has no active rule.
pub const UNLIMITED: i64 = -1;

/// Point-in-time view of one (identifier, action) pair.
///
/// A status is a copy; holding one never pins backend state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub identifier: String,
    pub action: String,
    /// Attempts counted in the current window
    pub count: u64,
    /// Limit from the governing rule, 0 when there is none
    pub max_attempts: u32,
    /// Attempts left before blocking, or [`UNLIMITED`]
    pub remaining_tries: i64,
    /// When the current window closes
    pub window_end: DateTime<Utc>,
    pub blocked: bool,
    /// Set whenever `blocked` is true
    pub blocked_until: Option<DateTime<Utc>>,
}

impl Status {
    /// Status for an action that is not rate limited.
    pub fn unlimited(identifier: &str, action: &str, now: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.to_string(),
            action: action.to_string(),
            count: 0,
            max_attempts: 0,
            remaining_tries: UNLIMITED,
            window_end: now,
            blocked: false,
            blocked_until: None,
        }
    }

    /// Status for a pair with no live state under `rule`.
    pub fn fresh(identifier: &str, action: &str, rule: &Rule, now: DateTime<Utc>) -> Self {
        Self {
            identifier: identifier.to_string(),
            action: action.to_string(),
            count: 0,
            max_attempts: rule.max_attempts,
            remaining_tries: rule.max_attempts as i64,
            window_end: deadline(now, rule.window_size),
            blocked: false,
            blocked_until: None,
        }
    }

    /// Whether no active rule governs this pair.
    pub fn is_unlimited(&self) -> bool {
        self.remaining_tries == UNLIMITED
    }

    /// Whether another attempt would currently be allowed.
    pub fn is_allowed(&self) -> bool {
        self.is_allowed_at(Utc::now())
    }

    /// Same as [`Status::is_allowed`] evaluated at `now`.
    pub fn is_allowed_at(&self, now: DateTime<Utc>) -> bool {
        if self.blocked {
            if let Some(until) = self.blocked_until {
                return now > until;
            }
        }
        self.remaining_tries != 0
    }

    /// Time until the block lifts, or until the window closes when not blocked.
    pub fn time_until_reset(&self) -> Duration {
        self.time_until_reset_at(Utc::now())
    }

    /// Same as [`Status::time_until_reset`] evaluated at `now`.
    pub fn time_until_reset_at(&self, now: DateTime<Utc>) -> Duration {
        let deadline = match (self.blocked, self.blocked_until) {
            (true, Some(until)) => until,
            _ => self.window_end,
        };
        (deadline - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Project into the header-oriented [`CheckResult`].
    pub fn check_result(&self) -> CheckResult {
        self.check_result_at(Utc::now())
    }

    /// Same as [`Status::check_result`] evaluated at `now`.
    pub fn check_result_at(&self, now: DateTime<Utc>) -> CheckResult {
        let allowed = self.is_allowed_at(now);
        let reset_at = match self.blocked_until {
            Some(until) if self.blocked && until > self.window_end => until,
            _ => self.window_end,
        };

        CheckResult {
            allowed,
            limit: (!self.is_unlimited()).then_some(self.max_attempts),
            remaining: self.remaining_tries,
            retry_after: (!allowed).then(|| self.time_until_reset_at(now)),
            reset_at,
        }
    }
}

impl From<&Status> for CheckResult {
    fn from(status: &Status) -> Self {
        status.check_result()
    }
}

/// What a protocol layer needs to answer a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub allowed: bool,
    /// None when the action is not rate limited
    pub limit: Option<u32>,
    pub remaining: i64,
    /// None when allowed
    pub retry_after: Option<Duration>,
    /// Later of the window end and the block deadline
    pub reset_at: DateTime<Utc>,
}

/// Attempts left given a count, honouring the blocked override.
pub fn remaining_tries(max_attempts: u32, count: u64, blocked: bool) -> i64 {
    if blocked {
        0
    } else {
        (max_attempts as i64 - count as i64).max(0)
    }
}
