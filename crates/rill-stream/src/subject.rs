//! Multicast hub.
//!
//! A [`Subject`] is both a sink (values pushed into it) and a source (values
//! fanned out to every attached subscriber). Each subscriber keeps the
//! [`Context`] and [`Scope`] it attached with; delivery uses that context,
//! and closing that scope detaches the subscriber.
//!
//! Buffering policies:
//! - [`BufferPolicy::None`]: subscribers only see values pushed after they attach
//! - [`BufferPolicy::Hold`]: the latest outcome is replayed to new subscribers
//! - [`BufferPolicy::Replay`]: the last `n` outcomes are replayed in order

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use rill_core::{
    Cause, Context, Defect, Exit, Fx, Payload, Result, RillError, Scope, ScopeGuard, Sink,
    SinkRef,
};

/// What a subject remembers for subscribers that attach later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPolicy {
    /// Nothing is buffered.
    None,
    /// The most recent outcome.
    Hold,
    /// The most recent `n` outcomes.
    Replay(usize),
}

struct Subscriber<A: Payload, E: Payload> {
    id: u64,
    sink: SinkRef<A, E>,
    context: Context,
    scope: Scope,
    // Serializes deliveries to this subscriber, including the replay phase.
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl<A: Payload, E: Payload> Subscriber<A, E> {
    async fn deliver(&self, outcome: Exit<A, E>) {
        if self.scope.is_closed() {
            return;
        }
        let _permit = self.gate.lock().await;
        self.deliver_gated(outcome).await;
    }

    /// Deliver while the caller already holds the gate.
    async fn deliver_gated(&self, outcome: Exit<A, E>) {
        if self.scope.is_closed() {
            return;
        }
        let terminal = outcome.is_err();
        let delivery = match outcome {
            Ok(value) => self.sink.on_success(value, &self.context),
            Err(cause) => self.sink.on_failure(cause, &self.context),
        };
        if let Err(payload) = AssertUnwindSafe(delivery).catch_unwind().await {
            let defect = Defect::from_panic(payload);
            tracing::warn!(
                subscriber = self.id,
                scope = %self.scope.id(),
                error = %defect,
                "subscriber sink panicked; detaching it"
            );
            self.scope.close();
            return;
        }
        if terminal {
            self.scope.close();
        }
    }
}

enum Targets<A: Payload, E: Payload> {
    None,
    One(Arc<Subscriber<A, E>>),
    Many(Vec<Arc<Subscriber<A, E>>>),
}

struct SubjectState<A: Payload, E: Payload> {
    subscribers: Vec<Arc<Subscriber<A, E>>>,
    buffer: VecDeque<Exit<A, E>>,
}

struct SubjectInner<A: Payload, E: Payload> {
    policy: BufferPolicy,
    next_id: AtomicU64,
    state: Mutex<SubjectState<A, E>>,
}

impl<A: Payload, E: Payload> SubjectInner<A, E> {
    fn remove(&self, id: u64) {
        self.state.lock().subscribers.retain(|s| s.id != id);
    }
}

/// Multicast hub with an optional replay buffer. Clones share the hub.
pub struct Subject<A: Payload, E: Payload> {
    inner: Arc<SubjectInner<A, E>>,
}

impl<A: Payload, E: Payload> Clone for Subject<A, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Payload, E: Payload> Default for Subject<A, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Payload, E: Payload> Subject<A, E> {
    /// Plain subject, no buffering.
    pub fn new() -> Self {
        Self::with_policy(BufferPolicy::None, VecDeque::new())
    }

    /// Subject that replays its most recent outcome to new subscribers.
    pub fn hold() -> Self {
        Self::with_policy(BufferPolicy::Hold, VecDeque::new())
    }

    /// Hold subject seeded with `initial`.
    pub fn hold_with(initial: A) -> Self {
        Self::with_policy(BufferPolicy::Hold, VecDeque::from([Ok(initial)]))
    }

    /// Subject that replays its last `capacity` outcomes to new subscribers.
    pub fn replay(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(RillError::invalid("replay capacity must be at least 1"));
        }
        Ok(Self::with_policy(
            BufferPolicy::Replay(capacity),
            VecDeque::with_capacity(capacity),
        ))
    }

    fn with_policy(policy: BufferPolicy, buffer: VecDeque<Exit<A, E>>) -> Self {
        Self {
            inner: Arc::new(SubjectInner {
                policy,
                next_id: AtomicU64::new(1),
                state: Mutex::new(SubjectState {
                    subscribers: Vec::new(),
                    buffer,
                }),
            }),
        }
    }

    /// Buffering policy.
    pub fn policy(&self) -> BufferPolicy {
        self.inner.policy
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    /// Snapshot of the replay buffer.
    pub fn buffered(&self) -> Vec<Exit<A, E>> {
        self.inner.state.lock().buffer.iter().cloned().collect()
    }

    /// Push a value to every subscriber.
    pub async fn push(&self, value: A) {
        self.dispatch(Ok(value)).await;
    }

    /// Push a failure to every subscriber. Each subscriber is detached after
    /// it has received the failure.
    pub async fn push_failure(&self, cause: Cause<E>) {
        self.dispatch(Err(cause)).await;
    }

    async fn dispatch(&self, outcome: Exit<A, E>) {
        let targets = {
            let mut state = self.inner.state.lock();
            match self.inner.policy {
                BufferPolicy::None => {}
                BufferPolicy::Hold => {
                    state.buffer.clear();
                    state.buffer.push_back(outcome.clone());
                }
                BufferPolicy::Replay(capacity) => {
                    if state.buffer.len() == capacity {
                        state.buffer.pop_front();
                    }
                    state.buffer.push_back(outcome.clone());
                }
            }
            match state.subscribers.as_slice() {
                [] => Targets::None,
                [only] => Targets::One(only.clone()),
                many => Targets::Many(many.to_vec()),
            }
        };

        match targets {
            Targets::None => {}
            Targets::One(subscriber) => subscriber.deliver(outcome).await,
            Targets::Many(subscribers) => {
                join_all(
                    subscribers
                        .iter()
                        .map(|subscriber| subscriber.deliver(outcome.clone())),
                )
                .await;
            }
        }
    }

    /// Register `sink` as a subscriber under a child of `scope`.
    ///
    /// Registration happens before this returns, so values pushed afterwards
    /// are not missed. They are held back until [`Subscription::run`] has
    /// replayed the buffer; run it promptly.
    pub fn subscribe(&self, sink: SinkRef<A, E>, scope: &Scope) -> Subscription<A, E> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription_scope = scope.fork();
        let gate = Arc::new(tokio::sync::Mutex::new(()));
        let permit = gate.clone().try_lock_owned().ok();
        let subscriber = Arc::new(Subscriber {
            id,
            sink,
            context: scope.context().clone(),
            scope: subscription_scope.clone(),
            gate,
        });

        let (replay, count) = {
            let mut state = self.inner.state.lock();
            state.subscribers.push(subscriber.clone());
            (
                state.buffer.iter().cloned().collect::<Vec<_>>(),
                state.subscribers.len(),
            )
        };

        let inner: Weak<SubjectInner<A, E>> = Arc::downgrade(&self.inner);
        subscription_scope.add_finalizer(move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove(id);
            }
        });

        let warn_at = scope.context().config().subject_warn_subscribers;
        if count > warn_at {
            tracing::warn!(
                subscribers = count,
                threshold = warn_at,
                "subject subscriber count above threshold"
            );
        }
        tracing::trace!(subscriber = id, scope = %subscription_scope.id(), "subject attach");

        Subscription {
            guard: subscription_scope.guard(),
            subscriber,
            replay,
            permit,
        }
    }

    /// Attach `sink` and run until the subscription ends.
    pub async fn attach(&self, sink: SinkRef<A, E>, scope: Scope) {
        self.subscribe(sink, &scope).run().await;
    }

    /// Detach every subscriber and clear the replay buffer.
    pub fn interrupt(&self) {
        let subscribers = {
            let mut state = self.inner.state.lock();
            state.buffer.clear();
            std::mem::take(&mut state.subscribers)
        };
        tracing::debug!(subscribers = subscribers.len(), "subject interrupted");
        for subscriber in subscribers {
            subscriber.scope.close();
        }
    }
}

/// A registered subscriber that has not started receiving yet.
///
/// Dropping it (or the future returned by [`Subscription::run`]) detaches the
/// subscriber.
pub struct Subscription<A: Payload, E: Payload> {
    guard: ScopeGuard,
    subscriber: Arc<Subscriber<A, E>>,
    replay: Vec<Exit<A, E>>,
    permit: Option<OwnedMutexGuard<()>>,
}

impl<A: Payload, E: Payload> Subscription<A, E> {
    /// Scope of this subscription.
    pub fn scope(&self) -> &Scope {
        self.guard.scope()
    }

    /// Replay buffered outcomes, then receive live values until the
    /// subscription scope closes.
    pub async fn run(mut self) {
        for outcome in std::mem::take(&mut self.replay) {
            if self.subscriber.scope.is_closed() {
                break;
            }
            self.subscriber.deliver_gated(outcome).await;
        }
        self.permit.take();
        self.guard.scope().closed().await;
    }
}

#[async_trait]
impl<A: Payload, E: Payload> Sink<A, E> for Subject<A, E> {
    async fn on_success(&self, value: A, _cx: &Context) {
        self.push(value).await;
    }

    async fn on_failure(&self, cause: Cause<E>, _cx: &Context) {
        self.push_failure(cause).await;
    }
}

#[async_trait]
impl<A: Payload, E: Payload> Fx<A, E> for Subject<A, E> {
    async fn run(&self, sink: SinkRef<A, E>, scope: Scope) {
        self.attach(sink, scope).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::from_fn;
    use std::time::Duration;

    fn recorder<A: Payload + std::fmt::Debug>() -> (SinkRef<A, String>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let values = log.clone();
        let failures = log.clone();
        let sink = from_fn(
            move |v: A| values.lock().push(format!("{v:?}")),
            move |c: Cause<String>| failures.lock().push(format!("{c}")),
        );
        (sink, log)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_without_subscribers_is_noop() {
        let subject = Subject::<u8, String>::new();
        subject.push(1).await;
        assert_eq!(subject.subscriber_count(), 0);
        assert!(subject.buffered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_to_many() {
        let subject = Subject::<u8, String>::new();
        let scope = Scope::new();
        let mut logs = Vec::new();
        for _ in 0..3 {
            let (sink, log) = recorder();
            logs.push(log);
            tokio::spawn(subject.clone().attach_owned(sink, scope.clone()));
        }
        settle().await;
        assert_eq!(subject.subscriber_count(), 3);

        subject.push(7).await;
        for log in &logs {
            assert_eq!(*log.lock(), vec!["7"]);
        }
        scope.close();
        settle().await;
        assert_eq!(subject.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_replays_latest_then_live() {
        let subject = Subject::<u8, String>::hold();
        subject.push(1).await;
        subject.push(2).await;

        let (sink, log) = recorder();
        let scope = Scope::new();
        tokio::spawn(subject.clone().attach_owned(sink, scope.clone()));
        settle().await;
        subject.push(3).await;

        assert_eq!(*log.lock(), vec!["2", "3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_keeps_last_n_in_order() {
        let subject = Subject::<u8, String>::replay(2).unwrap();
        for v in 1..=4 {
            subject.push(v).await;
        }
        let (sink, log) = recorder();
        tokio::spawn(subject.clone().attach_owned(sink, Scope::new()));
        settle().await;
        assert_eq!(*log.lock(), vec!["3", "4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_buffers_failure_for_late_subscriber() {
        let subject = Subject::<u8, String>::hold();
        subject.push(1).await;
        subject.push_failure(Cause::fail("gone".to_string())).await;
        assert_eq!(
            subject.buffered(),
            vec![Err(Cause::Fail("gone".to_string()))]
        );

        let (sink, log) = recorder();
        let handle = tokio::spawn(subject.clone().attach_owned(sink, Scope::new()));
        handle.await.unwrap();
        assert_eq!(*log.lock(), vec!["failure: gone"]);
        assert_eq!(subject.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_buffers_values_and_failure_in_order() {
        let subject = Subject::<u8, String>::replay(3).unwrap();
        subject.push(1).await;
        subject.push(2).await;
        subject.push_failure(Cause::die("source crashed")).await;

        let (sink, log) = recorder();
        let handle = tokio::spawn(subject.clone().attach_owned(sink, Scope::new()));
        handle.await.unwrap();
        assert_eq!(*log.lock(), vec!["1", "2", "defect: source crashed"]);
        assert_eq!(subject.subscriber_count(), 0);
    }

    #[test]
    fn test_replay_zero_is_rejected() {
        assert!(Subject::<u8, String>::replay(0).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_clears_buffer_and_detaches() {
        let subject = Subject::<u8, String>::hold_with(9);
        let (sink, log) = recorder();
        let handle = tokio::spawn(subject.clone().attach_owned(sink, Scope::new()));
        settle().await;
        assert_eq!(*log.lock(), vec!["9"]);

        subject.interrupt();
        handle.await.unwrap();
        assert_eq!(subject.subscriber_count(), 0);
        assert!(subject.buffered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_detaches_subscriber() {
        let subject = Subject::<u8, String>::new();
        let (sink, log) = recorder();
        let handle = tokio::spawn(subject.clone().attach_owned(sink, Scope::new()));
        settle().await;

        subject.push_failure(Cause::fail("boom".to_string())).await;
        handle.await.unwrap();
        subject.push(1).await;
        assert_eq!(*log.lock(), vec!["failure: boom"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_sink_only_detaches_itself() {
        let subject = Subject::<u8, String>::new();
        let scope = Scope::new();
        let bad = from_fn(|_: u8| panic!("sink exploded"), |_: Cause<String>| {});
        let (good, log) = recorder();
        tokio::spawn(subject.clone().attach_owned(bad, scope.clone()));
        tokio::spawn(subject.clone().attach_owned(good, scope.clone()));
        settle().await;

        subject.push(1).await;
        settle().await;
        assert_eq!(subject.subscriber_count(), 1);
        subject.push(2).await;
        assert_eq!(*log.lock(), vec!["1", "2"]);
        assert!(!scope.is_closed());
    }

    impl<A: Payload, E: Payload> Subject<A, E> {
        async fn attach_owned(self, sink: SinkRef<A, E>, scope: Scope) {
            self.attach(sink, scope).await;
        }
    }
}
