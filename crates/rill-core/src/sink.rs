//! The two-channel consumer interface.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::cause::Cause;
use crate::context::Context;
use crate::scope::Scope;

/// Bound shared by every value and error type flowing through a stream.
///
/// Multicast delivers the same value to several subscribers, so values must
/// be cloneable and shareable across tasks.
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}

/// Consumer of a stream.
///
/// `cx` is the ambient context of the subscription being delivered to.
#[async_trait]
pub trait Sink<A: Payload, E: Payload>: Send + Sync {
    /// Receive the next value.
    async fn on_success(&self, value: A, cx: &Context);

    /// Receive the terminal failure. No value follows it.
    async fn on_failure(&self, cause: Cause<E>, cx: &Context);
}

/// Shared, type-erased sink.
pub type SinkRef<A, E> = Arc<dyn Sink<A, E>>;

/// Sink built from two synchronous callbacks.
pub struct FnSink<A, E, S, F> {
    on_success: S,
    on_failure: F,
    _marker: PhantomData<fn(A, E)>,
}

/// Build a sink from plain callbacks.
pub fn from_fn<A, E, S, F>(on_success: S, on_failure: F) -> SinkRef<A, E>
where
    A: Payload,
    E: Payload,
    S: Fn(A) + Send + Sync + 'static,
    F: Fn(Cause<E>) + Send + Sync + 'static,
{
    Arc::new(FnSink {
        on_success,
        on_failure,
        _marker: PhantomData,
    })
}

#[async_trait]
impl<A, E, S, F> Sink<A, E> for FnSink<A, E, S, F>
where
    A: Payload,
    E: Payload,
    S: Fn(A) + Send + Sync + 'static,
    F: Fn(Cause<E>) + Send + Sync + 'static,
{
    async fn on_success(&self, value: A, _cx: &Context) {
        (self.on_success)(value);
    }

    async fn on_failure(&self, cause: Cause<E>, _cx: &Context) {
        (self.on_failure)(cause);
    }
}

/// Enforces the terminal-signal contract in front of a downstream sink.
///
/// After the first failure no further values or failures are forwarded, and
/// `scope` is closed so that whatever produces into this sink stops.
pub struct GuardedSink<A: Payload, E: Payload> {
    downstream: SinkRef<A, E>,
    scope: Scope,
    terminated: AtomicBool,
}

impl<A: Payload, E: Payload> GuardedSink<A, E> {
    /// Guard `downstream`, closing `scope` on the first failure.
    pub fn new(downstream: SinkRef<A, E>, scope: Scope) -> Arc<Self> {
        Arc::new(Self {
            downstream,
            scope,
            terminated: AtomicBool::new(false),
        })
    }

    /// Whether a failure has been forwarded.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Scope closed on failure.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

#[async_trait]
impl<A: Payload, E: Payload> Sink<A, E> for GuardedSink<A, E> {
    async fn on_success(&self, value: A, cx: &Context) {
        if self.is_terminated() {
            return;
        }
        self.downstream.on_success(value, cx).await;
    }

    async fn on_failure(&self, cause: Cause<E>, cx: &Context) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.downstream.on_failure(cause, cx).await;
        self.scope.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_guarded_sink_forwards_one_failure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let values = seen.clone();
        let failures = seen.clone();
        let downstream = from_fn(
            move |v: u32| values.lock().push(format!("ok {v}")),
            move |c: Cause<String>| failures.lock().push(format!("err {c}")),
        );
        let scope = Scope::new();
        let guarded = GuardedSink::new(downstream, scope.clone());
        let cx = Context::new();

        guarded.on_success(1, &cx).await;
        guarded.on_failure(Cause::fail("a".to_string()), &cx).await;
        guarded.on_failure(Cause::fail("b".to_string()), &cx).await;
        guarded.on_success(2, &cx).await;

        assert_eq!(*seen.lock(), vec!["ok 1", "err failure: a"]);
        assert!(scope.is_closed());
        assert!(guarded.is_terminated());
    }
}
