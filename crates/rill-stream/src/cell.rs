//! Updatable reference observable as a stream.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use rill_core::{Fx, Payload, Scope, SinkRef};

use crate::subject::Subject;

struct Inner<A: Payload, E: Payload> {
    value: Mutex<A>,
    version: AtomicU64,
    completed: AtomicBool,
    subject: Subject<A, E>,
    // Keeps the stored value and the pushed value in the same order.
    writes: tokio::sync::Mutex<()>,
}

/// A current value plus a stream of its changes.
///
/// Subscribers receive the current value on attach, then every later `set`.
/// The version starts at zero and increases by one per write.
pub struct ValueRef<A: Payload, E: Payload> {
    inner: Arc<Inner<A, E>>,
}

impl<A: Payload, E: Payload> Clone for ValueRef<A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Payload, E: Payload> ValueRef<A, E> {
    /// A reference holding `initial` at version zero.
    pub fn new(initial: A) -> Self {
        Self {
            inner: Arc::new(Inner {
                value: Mutex::new(initial.clone()),
                version: AtomicU64::new(0),
                completed: AtomicBool::new(false),
                subject: Subject::hold_with(initial),
                writes: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Current value.
    pub fn get(&self) -> A {
        self.inner.value.lock().clone()
    }

    /// Number of writes so far.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Replace the value and notify subscribers.
    pub async fn set(&self, value: A) {
        let _write = self.inner.writes.lock().await;
        *self.inner.value.lock() = value.clone();
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        self.inner.subject.push(value).await;
    }

    /// Replace the value with `f(current)`, returning the new value.
    pub async fn update<F>(&self, f: F) -> A
    where
        F: FnOnce(&A) -> A,
    {
        let _write = self.inner.writes.lock().await;
        let next = {
            let mut value = self.inner.value.lock();
            let next = f(&*value);
            *value = next.clone();
            next
        };
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        self.inner.subject.push(next.clone()).await;
        next
    }

    /// End every subscription. Later subscribers complete immediately.
    pub fn complete(&self) {
        self.inner.completed.store(true, Ordering::Release);
        self.inner.subject.interrupt();
    }

    /// Whether `complete` has been called.
    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subject.subscriber_count()
    }
}

#[async_trait]
impl<A: Payload, E: Payload> Fx<A, E> for ValueRef<A, E> {
    async fn run(&self, sink: SinkRef<A, E>, scope: Scope) {
        if self.is_completed() {
            return;
        }
        let subscription = self.inner.subject.subscribe(sink, &scope);
        // `complete` sets the flag before interrupting, so either it saw this
        // subscriber or this check sees the flag.
        if self.is_completed() {
            return;
        }
        subscription.run().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_testkit::{settle, RecordingSink};

    #[tokio::test(start_paused = true)]
    async fn test_subscriber_sees_current_then_updates() {
        let cell = ValueRef::<u8, String>::new(1);
        let sink = RecordingSink::new();
        let runner = cell.clone();
        let run_sink = sink.as_sink();
        let handle = tokio::spawn(async move { runner.run(run_sink, Scope::new()).await });
        settle().await;

        cell.set(2).await;
        assert_eq!(cell.update(|v| v * 10).await, 20);
        assert_eq!(sink.values(), vec![1, 2, 20]);
        assert_eq!(cell.version(), 2);

        cell.complete();
        handle.await.unwrap();
        assert_eq!(cell.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_completed_ref_ends_new_subscribers() {
        let cell = ValueRef::<u8, String>::new(1);
        cell.complete();
        let sink = RecordingSink::new();
        cell.run(sink.as_sink(), Scope::new()).await;
        assert!(sink.is_empty());
    }
}
