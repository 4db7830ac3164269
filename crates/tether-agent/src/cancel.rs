//! Cancellation scope carrying a typed cause.
//!
//! Sessions are torn down from several directions (heartbeat pong timeout,
//! writer failure, operator stop). The supervisor needs to know which one
//! fired, so cancellation carries the first cause recorded; later causes
//! are ignored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use tether_core::Error;

/// Cloneable cancellation token with an optional cause.
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    cause: Mutex<Option<Error>>,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                cause: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Cancel without a cause (operator stop, clean shutdown).
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Cancel with a cause. The first cause recorded wins.
    pub fn cancel_with(&self, cause: Error) {
        {
            let mut slot = self.inner.cause.lock().expect("cancel lock poisoned");
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        self.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Remove and return the recorded cause, if any.
    pub fn take_cause(&self) -> Option<Error> {
        self.inner.cause.lock().expect("cancel lock poisoned").take()
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                break;
            }
            notified.await;
        }
    }

    /// Owned variant of [`cancelled`](Self::cancelled) for stream adapters
    /// that need a `'static` future.
    pub async fn cancelled_owned(self) {
        self.cancelled().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn first_cause_wins() {
        let token = CancelToken::new();
        token.cancel_with(Error::Liveness {
            message: "Pong 超时 (11s)".into(),
        });
        token.cancel_with(Error::transport("后来者"));

        let cause = token.take_cause().unwrap();
        assert!(matches!(cause, Error::Liveness { .. }));
        assert!(token.take_cause().is_none());
    }

    #[test]
    fn cancel_without_cause_leaves_slot_empty() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(token.take_cause().is_none());
    }
}
