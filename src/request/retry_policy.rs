//! Retry policy for failed requests.
//!
//! Implements exponential backoff with jitter and configurable parameters.

use std::time::Duration;

use rand::Rng;

use crate::config::RetrySettings;
use crate::error::ExecError;

/// Statuses retried by default: request timeout, rate limit and transient server errors.
pub const DEFAULT_RETRYABLE_STATUSES: &[u16] = &[408, 429, 500, 502, 503, 504];

/// API error codes the server uses to flag a transient condition.
pub const DEFAULT_RETRYABLE_ERROR_CODES: &[&str] = &["BATCH_DATA_VALIDATION_IN_PROGRESS"];

/// Retry policy implementing exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry (before jitter).
    pub initial_delay: Duration,
    /// Cap for the computed delay.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_factor: f64,
    /// Ceiling for a server-requested `Retry-After` wait.
    pub max_retry_after: Duration,
    /// HTTP statuses that trigger a retry.
    pub retryable_statuses: Vec<u16>,
    /// API error codes that trigger a retry regardless of status.
    pub retryable_error_codes: Vec<String>,
}

impl RetryPolicy {
    /// Create a new RetryPolicy from configuration settings.
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_factor: settings.backoff_factor,
            max_retry_after: Duration::from_secs(settings.max_retry_after_secs),
            ..Default::default()
        }
    }

    /// Returns a copy of this policy that also retries `status`.
    pub fn with_retryable_status(mut self, status: u16) -> Self {
        if !self.retryable_statuses.contains(&status) {
            self.retryable_statuses.push(status);
        }
        self
    }

    /// Returns a copy of this policy with a different attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Check whether the error class is retryable under this policy.
    pub fn is_retryable(&self, error: &ExecError) -> bool {
        match error {
            ExecError::Timeout | ExecError::Transport(_) => true,
            ExecError::Api {
                status, entries, ..
            } => {
                self.retryable_statuses.contains(status)
                    || entries
                        .iter()
                        .any(|e| self.retryable_error_codes.iter().any(|c| c == &e.code))
            }
            _ => false,
        }
    }

    /// Check if an error should be retried given the number of attempts already made.
    ///
    /// Returns true if:
    /// - The error class is retryable
    /// - Another attempt still fits the attempt budget
    pub fn should_retry(&self, error: &ExecError, attempts_made: u32) -> bool {
        self.is_retryable(error) && attempts_made < self.max_attempts.max(1)
    }

    /// Backoff before jitter for a 0-indexed retry: `initial * factor^attempt`,
    /// capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_with_jitter(attempt, 1.0)
    }

    /// Backoff for a 0-indexed retry with an explicit jitter factor.
    pub fn backoff_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.initial_delay.as_millis() as f64
            * self.backoff_factor.powi(exponent)
            * jitter;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            Duration::ZERO
        }
    }

    /// Delay to wait after `error` before retry number `attempt` (0-indexed).
    ///
    /// Rate-limited responses carrying an explicit wait use it instead of the
    /// computed backoff. The wait may exceed `max_delay` but never
    /// `max_retry_after`.
    pub fn delay_for(&self, error: &ExecError, attempt: u32) -> Duration {
        if let ExecError::Api {
            status: 429,
            retry_after: Some(wait),
            ..
        } = error
        {
            return (*wait).min(self.max_retry_after);
        }
        self.backoff_with_jitter(attempt, random_jitter())
    }
}

/// Jitter factor drawn uniformly from [0.5, 1.0].
fn random_jitter() -> f64 {
    rand::rng().random_range(0.5..=1.0)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_retry_after: Duration::from_secs(300),
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
            retryable_error_codes: DEFAULT_RETRYABLE_ERROR_CODES
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}
