//! Observers and subscription handles

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::EmittedEvent;
use crate::error::{Error, Result};

type NextFn = dyn Fn(EmittedEvent) + Send + Sync;
type CompleteFn = dyn Fn() + Send + Sync;
type ErrorFn = dyn Fn(Error) + Send + Sync;

struct ObserverInner {
    next: Box<NextFn>,
    complete: Box<CompleteFn>,
    error: Box<ErrorFn>,
    finalized: AtomicBool,
}

/// A value holding the three subscription callbacks.
///
/// Delivery is gated by a finalized flag: after `complete` or `error` has
/// fired once, every further callback invocation is dropped.
#[derive(Clone)]
pub struct Observer {
    inner: Arc<ObserverInner>,
}

impl Observer {
    /// Observer with only a `next` callback
    pub fn new(next: impl Fn(EmittedEvent) + Send + Sync + 'static) -> Self {
        Self::with_callbacks(next, || {}, |_| {})
    }

    /// Observer with all three callbacks
    pub fn with_callbacks(
        next: impl Fn(EmittedEvent) + Send + Sync + 'static,
        complete: impl Fn() + Send + Sync + 'static,
        error: impl Fn(Error) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                next: Box::new(next),
                complete: Box::new(complete),
                error: Box::new(error),
                finalized: AtomicBool::new(false),
            }),
        }
    }

    /// Delivers the next event unless the observer has been finalized
    pub fn next(&self, event: EmittedEvent) {
        if !self.inner.finalized.load(Ordering::Acquire) {
            (self.inner.next)(event);
        }
    }

    /// Delivers the terminal `complete` callback exactly once
    pub fn complete(&self) {
        if !self.inner.finalized.swap(true, Ordering::AcqRel) {
            (self.inner.complete)();
        }
    }

    /// Delivers the terminal `error` callback exactly once
    pub fn error(&self, err: Error) {
        if !self.inner.finalized.swap(true, Ordering::AcqRel) {
            (self.inner.error)(err);
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.finalized.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

/// Handle over an active subscription.
///
/// `dispose` is idempotent; it cancels the producing task, which releases
/// any transport resource (socket, broker connection) attached to it.
#[derive(Debug, Clone)]
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// The cancellation token observed by the producing task
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancels the subscription. Safe to call any number of times.
    pub fn dispose(&self) {
        self.token.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the producing future of a subscription and guarantees a single
/// terminal observer callback: `complete` on normal exit, `error` on
/// failure.
pub async fn finalize<F>(observer: Observer, fut: F)
where
    F: Future<Output = Result<()>>,
{
    match fut.await {
        Ok(()) => observer.complete(),
        Err(err) => observer.error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_observer() -> (Observer, Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let nexts = Arc::new(AtomicUsize::new(0));
        let completes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let (n, c, e) = (nexts.clone(), completes.clone(), errors.clone());
        let observer = Observer::with_callbacks(
            move |_| {
                n.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            },
        );

        (observer, nexts, completes, errors)
    }

    fn dummy_event() -> EmittedEvent {
        EmittedEvent::new(crate::events::EventKind::Custom {
            name: "tick".into(),
            payload: None,
        })
    }

    #[test]
    fn test_single_terminal_callback() {
        let (observer, _, completes, errors) = counting_observer();

        observer.complete();
        observer.complete();
        observer.error(Error::Handler("late".into()));

        assert_eq!(completes.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_next_dropped_after_finalization() {
        let (observer, nexts, _, _) = counting_observer();

        observer.next(dummy_event());
        observer.complete();
        observer.next(dummy_event());

        assert_eq!(nexts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_finalize_completes_on_ok() {
        let (observer, _, completes, errors) = counting_observer();
        finalize(observer, async { Ok(()) }).await;
        assert_eq!(completes.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_finalize_errors_on_failure() {
        let (observer, _, completes, errors) = counting_observer();
        finalize(observer, async { Err(Error::Protocol("gone".into())) }).await;
        assert_eq!(completes.load(Ordering::SeqCst), 0);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let sub = Subscription::new();
        assert!(!sub.is_disposed());
        sub.dispose();
        sub.dispose();
        assert!(sub.is_disposed());
    }
}
