//! Ref-counted sharing of one source run among many subscribers.
//!
//! The first subscriber starts the source in a detached scope, pushing into a
//! [`Subject`]. Later subscribers join the subject. When the last subscriber
//! leaves the source is cancelled; when the source ends on its own the
//! subject is interrupted so every subscriber completes.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;

use rill_core::{Cause, Defect, Fx, FxRef, Payload, Result, Scope, SinkRef};

use crate::subject::{Subject, Subscription};

struct RunningSource {
    generation: u64,
    scope: Scope,
}

#[derive(Default)]
struct ShareState {
    ref_count: usize,
    generation: u64,
    running: Option<RunningSource>,
}

struct ShareInner<A: Payload, E: Payload> {
    source: FxRef<A, E>,
    subject: Subject<A, E>,
    state: Mutex<ShareState>,
}

impl<A: Payload, E: Payload> ShareInner<A, E> {
    /// Attach `sink` and take a reference, starting the source if it is not
    /// running. Both happen under the share lock so the source cannot emit
    /// before the subscriber is registered, and a concurrent final release
    /// cannot interrupt the new subscription.
    fn acquire(
        self: &Arc<Self>,
        sink: SinkRef<A, E>,
        scope: &Scope,
    ) -> (Subscription<A, E>, Lease<A, E>) {
        let mut state = self.state.lock();
        let subscription = self.subject.subscribe(sink, scope);
        state.ref_count += 1;
        if state.running.is_none() {
            state.generation += 1;
            let generation = state.generation;
            let source_scope = Scope::with_context(scope.context().clone());
            let task_scope = source_scope.clone();
            let this = self.clone();
            source_scope.spawn(async move {
                let sink: SinkRef<A, E> = Arc::new(this.subject.clone());
                let run = AssertUnwindSafe(this.source.run(sink, task_scope)).catch_unwind();
                if let Err(payload) = run.await {
                    let defect = Defect::from_panic(payload);
                    tracing::warn!(generation, error = %defect, "shared source panicked");
                    this.subject.push_failure(Cause::Die(defect)).await;
                }
                this.source_done(generation);
            });
            state.running = Some(RunningSource {
                generation,
                scope: source_scope,
            });
            tracing::debug!(generation, "shared source started");
        }
        (subscription, Lease { inner: self.clone() })
    }

    fn source_done(&self, generation: u64) {
        let mut state = self.state.lock();
        let finished = match &state.running {
            Some(running) if running.generation == generation => state.running.take(),
            _ => None,
        };
        if let Some(running) = finished {
            self.subject.interrupt();
            running.scope.close();
            tracing::debug!(generation, "shared source completed");
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count > 0 {
            return;
        }
        if let Some(running) = state.running.take() {
            running.scope.close();
            self.subject.interrupt();
            tracing::debug!(generation = running.generation, "shared source stopped");
        }
    }
}

/// One subscriber's hold on the shared source.
struct Lease<A: Payload, E: Payload> {
    inner: Arc<ShareInner<A, E>>,
}

impl<A: Payload, E: Payload> Drop for Lease<A, E> {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// A source shared by every subscriber through a [`Subject`].
pub struct Share<A: Payload, E: Payload> {
    inner: Arc<ShareInner<A, E>>,
}

impl<A: Payload, E: Payload> Clone for Share<A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Payload, E: Payload> Share<A, E> {
    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().ref_count
    }

    /// Whether the upstream source is currently running.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running.is_some()
    }

    /// The subject subscribers are attached to.
    pub fn subject(&self) -> &Subject<A, E> {
        &self.inner.subject
    }
}

#[async_trait]
impl<A: Payload, E: Payload> Fx<A, E> for Share<A, E> {
    async fn run(&self, sink: SinkRef<A, E>, scope: Scope) {
        let (subscription, _lease) = self.inner.acquire(sink, &scope);
        subscription.run().await;
    }
}

/// Share `source` through `subject`.
pub fn share<A: Payload, E: Payload>(source: FxRef<A, E>, subject: Subject<A, E>) -> Share<A, E> {
    Share {
        inner: Arc::new(ShareInner {
            source,
            subject,
            state: Mutex::new(ShareState::default()),
        }),
    }
}

/// Share `source`; late subscribers only see later values.
pub fn multicast<A: Payload, E: Payload>(source: FxRef<A, E>) -> Share<A, E> {
    share(source, Subject::new())
}

/// Share `source`; late subscribers first receive the latest value.
pub fn hold<A: Payload, E: Payload>(source: FxRef<A, E>) -> Share<A, E> {
    share(source, Subject::hold())
}

/// Share `source`; late subscribers first receive up to `capacity` recent values.
pub fn replay<A: Payload, E: Payload>(
    source: FxRef<A, E>,
    capacity: usize,
) -> Result<Share<A, E>> {
    Ok(share(source, Subject::replay(capacity)?))
}

/// Sharing operators for any source.
pub trait MulticastExt<A: Payload, E: Payload>: Fx<A, E> + Sized {
    /// See [`multicast`].
    fn multicast(self) -> Share<A, E> {
        multicast(Arc::new(self))
    }

    /// See [`hold`].
    fn hold(self) -> Share<A, E> {
        hold(Arc::new(self))
    }

    /// See [`replay`].
    fn replay(self, capacity: usize) -> Result<Share<A, E>> {
        replay(Arc::new(self), capacity)
    }
}

impl<A: Payload, E: Payload, T: Fx<A, E>> MulticastExt<A, E> for T {}
