//! Request and task context: cancellation plus an optional deadline.
//!
//! Every RPC entry point, consumer handler and background loop receives a
//! `Context`. Remote calls are wrapped in [`Context::run`] so a cancelled or
//! expired context short-circuits before (and during) network I/O.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context stopped admitting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl From<ContextError> for tonic::Status {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => tonic::Status::cancelled(err.to_string()),
            ContextError::DeadlineExceeded => tonic::Status::deadline_exceeded(err.to_string()),
        }
    }
}

/// Cancellation token plus optional deadline.
///
/// Derived contexts share cancellation with their parent: cancelling a parent
/// cancels every child, never the other way round.
#[derive(Debug, Clone)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// Root context with no deadline.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Child context that additionally expires after `timeout`.
    ///
    /// The earlier of the parent's deadline and the new one wins.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Child context that can be cancelled independently of its parent.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fails if the context is cancelled or past its deadline.
    pub fn check(&self) -> Result<(), ContextError> {
        if self.cancel.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(ContextError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => ContextError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Drive `fut` unless the context ends first.
    ///
    /// Checks the context before polling, so an already-cancelled context never
    /// starts the operation.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        self.check()?;
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            output = fut => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_completes_before_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        let value = ctx.run(async { 42 }).await;
        assert_eq!(value, Ok(42));
    }

    #[tokio::test]
    async fn test_cancelled_context_never_starts_work() {
        let ctx = Context::background();
        ctx.cancel();

        let started = std::sync::atomic::AtomicBool::new(false);
        let result = ctx
            .run(async {
                started.store(true, std::sync::atomic::Ordering::SeqCst);
            })
            .await;

        assert_eq!(result, Err(ContextError::Cancelled));
        assert!(!started.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_slow_work() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let result = ctx.run(tokio::time::sleep(Duration::from_secs(10))).await;
        assert_eq!(result, Err(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_children() {
        let parent = Context::background();
        let child = parent.with_timeout(Duration::from_secs(60));
        parent.cancel();
        assert_eq!(child.check(), Err(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn test_child_cancellation_leaves_parent_alive() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(parent.check().is_ok());
    }

    #[test]
    fn test_status_mapping() {
        let status: tonic::Status = ContextError::DeadlineExceeded.into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);
    }
}
