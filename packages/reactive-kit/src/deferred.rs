//! Deferred results shared by event handlers and field setters.
//!
//! Both halves of the crate call user code that may answer immediately or
//! later. [`MaybeDeferred`] carries either answer so the caller can take the
//! synchronous fast path without allocating a future, and only suspend when
//! user code actually handed back work that is still running.
//!
//! # Driving
//!
//! Cascades are driven with [`poll_now`]: the future is polled once inline
//! with a no-op waker. A future that is still pending afterwards is moved
//! onto the ambient tokio runtime with [`spawn_detached`], where the next
//! poll registers a real waker.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;

/// A value that is either available now, failed now, or still being computed.
pub enum MaybeDeferred<T> {
    /// The value is available immediately.
    Ready(T),
    /// The user code failed synchronously.
    Failed(anyhow::Error),
    /// The value will be produced by a future.
    Deferred(BoxFuture<'static, anyhow::Result<T>>),
}

impl<T: Send + 'static> MaybeDeferred<T> {
    /// Wrap an immediately available value.
    pub fn ready(value: T) -> Self {
        Self::Ready(value)
    }

    /// Wrap a synchronous failure.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(err.into())
    }

    /// Wrap a future that will produce the value later.
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::Deferred(future.boxed())
    }

    /// Wrap the outcome of fallible synchronous code.
    pub fn from_result(result: anyhow::Result<T>) -> Self {
        match result {
            Ok(value) => Self::Ready(value),
            Err(err) => Self::Failed(err),
        }
    }

    /// Returns true if the value is still being computed.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }

    /// Wait for the value.
    pub async fn resolve(self) -> anyhow::Result<T> {
        match self {
            Self::Ready(value) => Ok(value),
            Self::Failed(err) => Err(err),
            Self::Deferred(future) => future.await,
        }
    }
}

impl<T> From<T> for MaybeDeferred<T> {
    fn from(value: T) -> Self {
        Self::Ready(value)
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for MaybeDeferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Self::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Poll a future once without a task context.
///
/// Anything the future registers against the no-op waker is lost, so a
/// pending future must be polled again from a real task before it can make
/// progress.
pub(crate) fn poll_now<F: Future + ?Sized>(future: Pin<&mut F>) -> Poll<F::Output> {
    let mut cx = Context::from_waker(futures::task::noop_waker_ref());
    future.poll(&mut cx)
}

/// Spawn a future on the ambient tokio runtime, if there is one.
///
/// Returns false (and drops the future) when called outside a runtime.
pub(crate) fn spawn_detached(future: BoxFuture<'static, ()>) -> bool {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
            true
        }
        Err(_) => false,
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ready_resolves_immediately() {
        let value: MaybeDeferred<i32> = 7.into();
        assert!(!value.is_deferred());
        assert_eq!(value.resolve().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_failed_resolves_to_error() {
        let value: MaybeDeferred<i32> = MaybeDeferred::failed(anyhow::anyhow!("boom"));
        let err = value.resolve().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_deferred_resolves_after_await() {
        let value = MaybeDeferred::deferred(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok("later")
        });
        assert!(value.is_deferred());
        assert_eq!(value.resolve().await.unwrap(), "later");
    }

    #[test]
    fn test_from_result() {
        assert!(matches!(
            MaybeDeferred::from_result(Ok::<_, anyhow::Error>(1)),
            MaybeDeferred::Ready(1)
        ));
        assert!(matches!(
            MaybeDeferred::<i32>::from_result(Err(anyhow::anyhow!("nope"))),
            MaybeDeferred::Failed(_)
        ));
    }

    #[test]
    fn test_poll_now_completes_sync_future() {
        let mut future = Box::pin(async { 40 + 2 });
        assert_eq!(poll_now(future.as_mut()), Poll::Ready(42));
    }

    #[tokio::test]
    async fn test_poll_now_then_spawn_finishes_pending_future() {
        let (tx, rx) = tokio::sync::oneshot::channel::<u8>();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<u8>();

        let mut future = async move {
            let value = rx.await.unwrap_or(0);
            let _ = done_tx.send(value);
        }
        .boxed();
        assert!(poll_now(future.as_mut()).is_pending());
        assert!(spawn_detached(future));

        tx.send(9).unwrap();
        assert_eq!(done_rx.await.unwrap(), 9);
    }

    #[test]
    fn test_panic_message_reads_payload() {
        let caught = std::panic::catch_unwind(|| panic!("setter {} broke", 3)).unwrap_err();
        assert_eq!(panic_message(&*caught), "setter 3 broke");
        let caught = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(&*caught), "static");
    }

    #[test]
    fn test_spawn_detached_without_runtime() {
        assert!(!spawn_detached(async {}.boxed()));
    }
}
