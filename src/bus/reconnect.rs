//! Retry loops shared by broker implementations.
//!
//! Reconnection uses exponential backoff from a floor to a ceiling, bounded
//! by an attempt budget. Publishing uses a short linear backoff. Both are
//! cancellable through the caller's context.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::{error, warn};

use super::{BrokerError, PublishRetryConfig, Result};
use crate::context::Context;
use crate::utils::retry::LinearBackoff;

/// Backoff bounds for re-establishing a broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// First delay.
    pub floor: Duration,
    /// Delay cap.
    pub ceiling: Duration,
    /// Retries after the first failure before giving up.
    pub max_attempts: usize,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(1),
            ceiling: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.floor)
            .with_max_delay(self.ceiling)
            .with_max_times(self.max_attempts)
            .build()
    }
}

/// Run `op` until it succeeds, fails permanently, exhausts the policy or the
/// context ends.
///
/// Permanent errors are returned on first sight. Context cancellation yields
/// `BrokerError::Cancelled`.
pub async fn retry_transient<T, F, Fut>(
    ctx: &Context,
    policy: &ReconnectPolicy,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delays = policy.backoff();
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        let outcome = ctx.run(op()).await.map_err(|_| BrokerError::Cancelled)?;

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => err,
        };

        let Some(delay) = delays.next() else {
            error!(
                what,
                attempts = attempt,
                error = %err,
                "Reconnection attempts exhausted"
            );
            return Err(BrokerError::ReconnectExhausted {
                attempts: attempt,
                last: err.to_string(),
            });
        };

        warn!(
            what,
            attempt,
            max_attempts = policy.max_attempts,
            backoff_ms = %delay.as_millis(),
            error = %err,
            "Broker unavailable, retrying after backoff"
        );

        ctx.run(tokio::time::sleep(delay))
            .await
            .map_err(|_| BrokerError::Cancelled)?;
    }
}

/// Run a publish attempt with linear backoff between tries.
///
/// Only transient errors are retried. The last error is returned once the
/// budget is spent.
pub async fn retry_publish<F, Fut>(
    ctx: &Context,
    config: &PublishRetryConfig,
    mut attempt_publish: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let backoff = LinearBackoff::for_attempts(Duration::from_millis(config.backoff_ms), config.attempts);
    let mut last_error = None;

    for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
        if attempt > 0 {
            ctx.run(tokio::time::sleep(delay))
                .await
                .map_err(|_| BrokerError::Cancelled)?;
        }

        match ctx.run(attempt_publish()).await.map_err(|_| BrokerError::Cancelled)? {
            Ok(()) => return Ok(()),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                warn!(
                    attempt = attempt + 1,
                    max_attempts = config.attempts,
                    error = %err,
                    "Publish failed, retrying..."
                );
                last_error = Some(err);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| BrokerError::Publish("no publish attempts configured".to_string())))
}
