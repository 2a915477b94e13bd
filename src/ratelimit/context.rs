//! Cancellation and deadlines for blocking waits.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{RatekeeperError, Result};

/// The caller's side of a blocking wait: a cancellation signal and an
/// optional deadline.
///
/// Contexts are cheap to clone. Deriving a context with a timeout keeps the
/// parent's cancellation signal and takes the earlier of the two deadlines.
#[derive(Debug, Clone)]
pub struct WaitContext {
    cancel: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

/// Cancels every context derived from the [`WaitContext`] it was created with.
///
/// Dropping the handle does not cancel anything.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Signal cancellation to all waiters.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl WaitContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self {
            cancel: rx,
            deadline: None,
        }
    }

    /// A fresh context together with the handle that cancels it.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            cancel: rx,
            deadline: None,
        };
        (ctx, CancelHandle { tx: Arc::new(tx) })
    }

    /// Derive a context that additionally expires after `timeout`.
    ///
    /// A timeout too large to represent adds no deadline.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.clone(),
        }
    }

    /// Derive a context that additionally expires at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
        }
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// The error a waiter should return right now, if the context is done.
    pub fn err(&self) -> Option<RatekeeperError> {
        if self.is_cancelled() {
            return Some(RatekeeperError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(RatekeeperError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolve once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> RatekeeperError {
        let mut rx = self.cancel.clone();
        let cancelled = async move {
            // A closed channel can never be cancelled.
            let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
            if closed {
                futures::future::pending::<()>().await;
            }
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = cancelled => RatekeeperError::Canceled,
                _ = tokio::time::sleep_until(deadline) => RatekeeperError::DeadlineExceeded,
            },
            None => {
                cancelled.await;
                RatekeeperError::Canceled
            }
        }
    }

    /// Fail early when a wait of `delay` would end after the deadline.
    pub(crate) fn ensure_reachable(&self, delay: Duration) -> Result<()> {
        let Some(deadline) = self.deadline else {
            return Ok(());
        };
        match Instant::now().checked_add(delay) {
            Some(ready_at) if ready_at <= deadline => Ok(()),
            _ => Err(RatekeeperError::DeadlineExceeded),
        }
    }

    /// Sleep for `delay` unless the context finishes first.
    pub(crate) async fn sleep(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            err = self.done() => Err(err),
        }
    }
}

impl Default for WaitContext {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_context_is_never_done() {
        let ctx = WaitContext::background();
        assert!(!ctx.is_cancelled());
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
    }

    #[tokio::test]
    async fn test_cancel_handle_cancels_clones() {
        let (ctx, handle) = WaitContext::with_cancel();
        let derived = ctx.with_timeout(Duration::from_secs(60));

        handle.cancel();

        assert!(matches!(ctx.err(), Some(RatekeeperError::Canceled)));
        assert!(matches!(derived.err(), Some(RatekeeperError::Canceled)));
        assert!(matches!(derived.done().await, RatekeeperError::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires() {
        let ctx = WaitContext::background().with_timeout(Duration::from_millis(250));

        let err = ctx.done().await;
        assert!(matches!(err, RatekeeperError::DeadlineExceeded));
        assert!(matches!(ctx.err(), Some(RatekeeperError::DeadlineExceeded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_derived_deadline_keeps_earliest() {
        let parent = WaitContext::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(10));

        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_timeout_adds_no_deadline() {
        let ctx = WaitContext::background().with_timeout(Duration::MAX);
        assert!(ctx.deadline().is_none());

        let parent = WaitContext::background().with_timeout(Duration::from_secs(1));
        assert_eq!(parent.with_timeout(Duration::MAX).deadline(), parent.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_cancel() {
        let (ctx, handle) = WaitContext::with_cancel();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        });

        let started = Instant::now();
        let result = ctx.sleep(Duration::from_secs(3600)).await;
        assert!(matches!(result, Err(RatekeeperError::Canceled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_reachable() {
        let ctx = WaitContext::background().with_timeout(Duration::from_secs(1));

        assert!(ctx.ensure_reachable(Duration::from_millis(500)).is_ok());
        assert!(matches!(
            ctx.ensure_reachable(Duration::from_secs(2)),
            Err(RatekeeperError::DeadlineExceeded)
        ));
        assert!(matches!(
            ctx.ensure_reachable(Duration::MAX),
            Err(RatekeeperError::DeadlineExceeded)
        ));
        assert!(WaitContext::background()
            .ensure_reachable(Duration::MAX)
            .is_ok());
    }
}
