//! Retry policy and the per-table state machine
//!
//! Retries are not a loop around a fallible call; they are transitions of an
//! explicit [`TableState`] driven by a [`RetryPolicy`]:
//!
//! ```text
//!            Start                 Succeed
//! Pending ─────────▶ Running(n) ───────────▶ Succeeded
//!    │                 │    ▲
//!    │ Skip            │    │ Start (after backoff)
//!    ▼                 │    │
//! Skipped              │  FailedRetryable(n) ──Cancel──┐
//!                      │    ▲                          │
//!                      │    │ Fail (retryable, n < max) │
//!                      ├────┘                          ▼
//!                      └──Fail (terminal or n = max)─▶ FailedTerminal
//! ```
//!
//! A `Pending` table can also end without an attempt: `Cancel` yields
//! `Cancelled` (never started) and `Reject` yields `FailedTerminal` with zero
//! attempts (its spec could not be resolved).
//!
//! # Backoff
//!
//! The delay after failed attempt `n` (1-based) is
//!
//! ```text
//! delay = min(initial_interval × backoff_factor^(n-1), max_interval)
//! if jitter: delay *= random(0.5..=1.5)
//! ```
//!
//! With defaults (0.5s, ×2, cap 30s) the un-jittered delays are 0.5s, 1s, 2s, ...
//! Jitter spreads retries of tables that failed together (a store restart, a
//! rate-limit burst) so they do not hit the store again in lockstep.
//!
//! # Example
//!
//! ```rust
//! use lakeslice_core::retry::RetryPolicy;
//!
//! let policy = RetryPolicy::new(5)
//!     .with_initial_interval(1.0)
//!     .with_backoff_factor(3.0)
//!     .with_max_interval(60.0)
//!     .with_jitter(false);
//!
//! assert_eq!(policy.calculate_delay(2).as_secs_f64(), 9.0);
//! assert!(policy.should_retry(4));
//! assert!(!policy.should_retry(5));
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retrying tables that fail with a retryable error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Initial interval between retries in seconds
    pub initial_interval: f64,

    /// Multiplier for the interval after each retry
    pub backoff_factor: f64,

    /// Maximum interval between retries in seconds
    pub max_interval: f64,

    /// Whether to add random jitter to intervals
    pub jitter: bool,
}

impl RetryPolicy {
    /// Create a new retry policy with the given max attempts
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 30.0,
            jitter: true,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    /// Set the initial interval between retries
    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    /// Set the backoff factor
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Set the maximum interval between retries
    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Reject values that would make backoff meaningless.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if !(self.backoff_factor >= 1.0) {
            return Err("retry.backoff_factor must be >= 1.0".to_string());
        }
        if !(self.initial_interval >= 0.0) || !(self.max_interval >= 0.0) {
            return Err("retry intervals must be non-negative".to_string());
        }
        Ok(())
    }

    /// Delay before the retry that follows failed attempt `attempt + 1`
    /// (0-indexed), using the thread-local RNG for jitter.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        self.calculate_delay_with(attempt, &mut rand::thread_rng())
    }

    /// Same as [`calculate_delay`](Self::calculate_delay) with a caller-supplied RNG.
    pub fn calculate_delay_with<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        if attempt >= self.max_attempts {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.initial_interval * self.backoff_factor.powi(exponent);
        let capped_delay = base_delay.min(self.max_interval);

        let final_delay = if self.jitter {
            capped_delay * rng.gen_range(0.5..=1.5)
        } else {
            capped_delay
        };

        Duration::try_from_secs_f64(final_delay).unwrap_or(Duration::ZERO)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Lifecycle of one table inside a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableState {
    Pending,
    Running { attempt: u32 },
    FailedRetryable { attempt: u32, error: String },
    Succeeded { attempts: u32 },
    FailedTerminal { attempts: u32, error: String },
    /// Not attempted because a dependency did not succeed
    Skipped { reason: String },
    /// Never started because the run was cancelled
    Cancelled,
}

/// Inputs to [`TableState::on`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableEvent {
    Start,
    Succeed,
    Fail { error: String, retryable: bool },
    Skip { reason: String },
    /// The table cannot be attempted at all
    Reject { error: String },
    Cancel,
}

impl TableState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TableState::Succeeded { .. }
                | TableState::FailedTerminal { .. }
                | TableState::Skipped { .. }
                | TableState::Cancelled
        )
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        match self {
            TableState::Pending | TableState::Skipped { .. } | TableState::Cancelled => 0,
            TableState::Running { attempt } | TableState::FailedRetryable { attempt, .. } => {
                *attempt
            }
            TableState::Succeeded { attempts } | TableState::FailedTerminal { attempts, .. } => {
                *attempts
            }
        }
    }

    /// Apply `event`. Events that do not apply to the current state leave it
    /// unchanged; terminal states absorb everything.
    pub fn on(self, event: TableEvent, policy: &RetryPolicy) -> TableState {
        match (self, event) {
            (TableState::Pending, TableEvent::Start) => TableState::Running { attempt: 1 },
            (TableState::Pending, TableEvent::Skip { reason }) => TableState::Skipped { reason },
            (TableState::Pending, TableEvent::Cancel) => TableState::Cancelled,
            (TableState::Pending, TableEvent::Reject { error }) => {
                TableState::FailedTerminal { attempts: 0, error }
            }

            (TableState::Running { attempt }, TableEvent::Succeed) => {
                TableState::Succeeded { attempts: attempt }
            }
            (TableState::Running { attempt }, TableEvent::Fail { error, retryable }) => {
                if retryable && policy.should_retry(attempt) {
                    TableState::FailedRetryable { attempt, error }
                } else {
                    TableState::FailedTerminal {
                        attempts: attempt,
                        error,
                    }
                }
            }

            (TableState::FailedRetryable { attempt, .. }, TableEvent::Start) => {
                TableState::Running {
                    attempt: attempt + 1,
                }
            }
            (TableState::FailedRetryable { attempt, error }, TableEvent::Cancel) => {
                TableState::FailedTerminal {
                    attempts: attempt,
                    error: format!("cancelled before retry (last error: {error})"),
                }
            }

            (state, _) => state,
        }
    }
}
