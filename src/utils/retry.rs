//! Retry utilities: linear backoff and retryable status classification.

use std::time::Duration;

use tonic::{Code, Status};

/// Linear backoff: the Nth retry waits `N * step`.
///
/// Yields exactly `retries` delays.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    step: Duration,
    retries: usize,
    issued: usize,
}

impl LinearBackoff {
    pub fn new(step: Duration, retries: usize) -> Self {
        Self {
            step,
            retries,
            issued: 0,
        }
    }

    /// Backoff allowing `attempts` total tries (first try plus retries).
    pub fn for_attempts(step: Duration, attempts: usize) -> Self {
        Self::new(step, attempts.saturating_sub(1))
    }
}

impl Iterator for LinearBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.issued >= self.retries {
            return None;
        }
        self.issued += 1;
        Some(self.step.saturating_mul(self.issued as u32))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.retries - self.issued;
        (left, Some(left))
    }
}

/// Whether a downstream RPC failure is worth retrying.
///
/// Retryable codes:
/// - `Unavailable`: service unreachable or restarting
/// - `DeadlineExceeded`: call timed out
/// - `ResourceExhausted`: rate limited
/// - `Aborted`: conflicting concurrent write
pub fn is_retryable_status(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted | Code::Aborted
    )
}
