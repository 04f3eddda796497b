//! Failure classification and exponential backoff.
//!
//! The one rule that must never bend: configuration errors (cyclic or unmet
//! dependencies, invalid settings) are not retried. Retrying cannot fix them.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bucket a task-attempt failure falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The assistant could not be reached or the channel broke.
    Transport,
    /// No verdict arrived within the task timeout.
    Timeout,
    /// The assistant answered, but the answer was a failure or unintelligible.
    Protocol,
    /// Dependency or configuration problem.
    Configuration,
    Unknown,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::Protocol => "protocol",
            Self::Configuration => "configuration",
            Self::Unknown => "unknown",
        }
    }

    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::Configuration)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best-effort bucketing of an untyped error message.
///
/// Adapters that know the kind should report it directly; this exists for
/// errors that arrive as plain text.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

    if has(&["dependency", "depends on", "cycle", "config", "invalid setting"]) {
        ErrorKind::Configuration
    } else if has(&["timed out", "timeout", "deadline"]) {
        ErrorKind::Timeout
    } else if has(&[
        "connection",
        "network",
        "broken pipe",
        "unreachable",
        "refused",
        "reset by peer",
        "spawn",
    ]) {
        ErrorKind::Transport
    } else if has(&["malformed", "unexpected response", "parse", "protocol"]) {
        ErrorKind::Protocol
    } else {
        ErrorKind::Unknown
    }
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Per-task attempt counter and error history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    /// Attempts dispatched so far.
    pub attempts: u32,
    pub errors: Vec<ErrorRecord>,
}

impl RetryRecord {
    pub fn record_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.errors.push(ErrorRecord {
            kind,
            message: message.into(),
            at: Utc::now(),
        });
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.errors.last()
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then dispatch attempt number `next_attempt` (1-based).
    Retry { delay: Duration, next_attempt: u32 },
    /// Terminal: the task fails.
    GiveUp { reason: GiveUpReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    NotRetryable,
    AttemptsExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Total attempts allowed for one task: the initial one plus retries.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// `min(base * 2^attempt, max)`, where `attempt` is the zero-based index of
    /// the attempt that just failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide after `attempts_made` attempts, the last of which failed with `kind`.
    pub fn decide(&self, kind: ErrorKind, attempts_made: u32) -> RetryDecision {
        if !kind.is_retryable() {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::NotRetryable,
            };
        }
        if is_exhausted(attempts_made, self.max_attempts()) {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::AttemptsExhausted,
            };
        }
        RetryDecision::Retry {
            delay: self.delay_for(attempts_made.saturating_sub(1)),
            next_attempt: attempts_made + 1,
        }
    }
}

/// True once the attempt budget is spent.
pub fn is_exhausted(attempts: u32, max_attempts: u32) -> bool {
    attempts >= max_attempts
}
