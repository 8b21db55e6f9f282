//! One-shot suspend/resume handles.
//!
//! A blocked caller holds a [`ContinueFuture`]; the component that will
//! unblock it holds the matching [`ContinuePromise`]. The promise resolves
//! the future when `set_value` is called or when it is dropped, so every
//! token created is resolved exactly once, including on close and cancel
//! paths.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

/// Resolving half of a continuation.
#[derive(Debug)]
pub struct ContinuePromise {
    tx: Option<oneshot::Sender<()>>,
}

impl ContinuePromise {
    /// Create a connected promise/future pair.
    pub fn new() -> (Self, ContinueFuture) {
        let (tx, rx) = oneshot::channel();
        (
            Self { tx: Some(tx) },
            ContinueFuture {
                rx: Some(rx),
                ready: false,
            },
        )
    }

    /// Wake the waiter.
    pub fn set_value(mut self) {
        self.resolve();
    }

    fn resolve(&mut self) {
        if let Some(tx) = self.tx.take() {
            // The waiter may have given up; nothing to do then.
            let _ = tx.send(());
        }
    }
}

impl Drop for ContinuePromise {
    fn drop(&mut self) {
        self.resolve();
    }
}

/// Waiting half of a continuation.
///
/// An *empty* future (see [`ContinueFuture::empty`]) is not backed by any
/// promise. It is what callers get when there is nothing to wait for, e.g.
/// after the exchange was closed, and reports `is_valid() == false`.
#[derive(Debug)]
pub struct ContinueFuture {
    rx: Option<oneshot::Receiver<()>>,
    ready: bool,
}

impl ContinueFuture {
    pub fn empty() -> Self {
        Self {
            rx: None,
            ready: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.rx.is_some()
    }

    /// Whether the promise has been resolved. Never blocks.
    pub fn is_ready(&mut self) -> bool {
        if self.ready {
            return true;
        }
        let Some(rx) = self.rx.as_mut() else {
            return false;
        };
        match rx.try_recv() {
            Ok(()) | Err(oneshot::error::TryRecvError::Closed) => {
                self.ready = true;
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
        }
    }

    /// Wait up to `timeout` for resolution. Returns whether it resolved.
    /// An empty future returns `true` immediately.
    pub async fn wait_for(self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self).await.is_ok()
    }
}

impl Default for ContinueFuture {
    fn default() -> Self {
        Self::empty()
    }
}

impl Future for ContinueFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.ready {
            return Poll::Ready(());
        }
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(());
        };
        match Pin::new(rx).poll(cx) {
            // Sent or dropped: either way the waiter is released.
            Poll::Ready(_) => {
                self.ready = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_value_resolves() {
        let (promise, mut future) = ContinuePromise::new();
        assert!(future.is_valid());
        assert!(!future.is_ready());

        promise.set_value();
        assert!(future.is_ready());
        future.await;
    }

    #[tokio::test]
    async fn test_drop_resolves() {
        let (promise, future) = ContinuePromise::new();
        drop(promise);
        assert!(future.wait_for(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_unresolved_times_out() {
        let (_promise, future) = ContinuePromise::new();
        assert!(!future.wait_for(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_empty_future() {
        let mut future = ContinueFuture::empty();
        assert!(!future.is_valid());
        assert!(!future.is_ready());
        future.await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resolved_from_other_thread() {
        let (promise, future) = ContinuePromise::new();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            promise.set_value();
        });
        assert!(future.wait_for(Duration::from_secs(5)).await);
        handle.await.unwrap();
    }
}
