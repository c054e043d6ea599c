//! Keyed reconciliation of ordered sequences.
//!
//! [`keyed`] turns a stream of `Vec<A>` into a stream of `Vec<B>` by giving
//! every distinct key its own sub-stream:
//!
//! - a key that appears gets a child scope, a [`ValueRef`] seeded with its
//!   value, and the source returned by `on_value`, run in that scope
//! - a key that stays (same or different position) has its new value `set`
//!   into the existing `ValueRef`; its sub-stream keeps running
//! - a key that disappears has its child scope closed at once
//!
//! Output is the per-key outputs in input order, emitted for the longest
//! prefix in which every position has produced, after a debounce window that
//! restarts on every membership or order change and every per-key output.

mod diff;
mod state;

pub use diff::{diff, Change, Diff};
pub use state::Key;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use rill_core::{Cause, Context, Fx, FxRef, GuardedSink, Payload, Scope, Sink, SinkRef};

use crate::cell::ValueRef;
use state::Reconciler;

type KeyFn<A, K> = Arc<dyn Fn(&A) -> K + Send + Sync>;
type ValueFn<A, K, B, E> = Arc<dyn Fn(ValueRef<A, E>, K) -> FxRef<B, E> + Send + Sync>;

/// How [`keyed`] identifies items and builds their sub-streams.
pub struct KeyedOptions<A: Payload, K, B: Payload, E: Payload> {
    get_key: KeyFn<A, K>,
    on_value: ValueFn<A, K, B, E>,
    debounce: Option<Duration>,
}

impl<A: Payload, K, B: Payload, E: Payload> Clone for KeyedOptions<A, K, B, E> {
    fn clone(&self) -> Self {
        Self {
            get_key: self.get_key.clone(),
            on_value: self.on_value.clone(),
            debounce: self.debounce,
        }
    }
}

impl<A: Payload, K: Key, B: Payload, E: Payload> KeyedOptions<A, K, B, E> {
    /// Identify items with `get_key` and build each key's stream with
    /// `on_value`.
    pub fn new<G, V>(get_key: G, on_value: V) -> Self
    where
        G: Fn(&A) -> K + Send + Sync + 'static,
        V: Fn(ValueRef<A, E>, K) -> FxRef<B, E> + Send + Sync + 'static,
    {
        Self {
            get_key: Arc::new(get_key),
            on_value: Arc::new(on_value),
            debounce: None,
        }
    }

    /// Override the debounce window. Without this the window comes from
    /// the subscriber's `RillConfig`.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }
}

struct Keyed<A: Payload, K, B: Payload, E: Payload> {
    input: FxRef<Vec<A>, E>,
    options: KeyedOptions<A, K, B, E>,
}

struct InputSink<A: Payload, K, B: Payload, E: Payload> {
    reconciler: Arc<Reconciler<A, K, B, E>>,
}

#[async_trait]
impl<A: Payload, K: Key, B: Payload, E: Payload> Sink<Vec<A>, E> for InputSink<A, K, B, E> {
    async fn on_success(&self, values: Vec<A>, _cx: &Context) {
        self.reconciler.apply(values).await;
    }

    async fn on_failure(&self, cause: Cause<E>, cx: &Context) {
        self.reconciler.downstream.on_failure(cause, cx).await;
    }
}

#[async_trait]
impl<A: Payload, K: Key, B: Payload, E: Payload> Fx<Vec<B>, E> for Keyed<A, K, B, E> {
    async fn run(&self, sink: SinkRef<Vec<B>, E>, scope: Scope) {
        let keyed_scope = scope.fork();
        let _guard = keyed_scope.guard();
        let reconciler = Reconciler::new(
            self.options.clone(),
            GuardedSink::new(sink, keyed_scope.clone()),
            keyed_scope.clone(),
            scope.context().clone(),
        );
        let input = Arc::new(InputSink {
            reconciler: reconciler.clone(),
        });

        let completed = keyed_scope
            .until_closed(self.input.run(input, keyed_scope.clone()))
            .await
            .is_some();
        if completed && !reconciler.downstream.is_terminated() {
            keyed_scope.until_closed(reconciler.finish()).await;
        }
    }
}

/// Reconcile `input` by key. See the module docs.
pub fn keyed<A, K, B, E>(
    input: FxRef<Vec<A>, E>,
    options: KeyedOptions<A, K, B, E>,
) -> FxRef<Vec<B>, E>
where
    A: Payload,
    K: Key,
    B: Payload,
    E: Payload,
{
    Arc::new(Keyed { input, options })
}
