//! Per-key bookkeeping and the debounced emitter.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use rill_core::{Cause, Clock, Context, Defect, GuardedSink, Payload, Scope, ScopeId, Sink};

use super::diff::{diff, Change};
use super::KeyedOptions;
use crate::cell::ValueRef;

/// Bound for keys: cloned into every map and logged on lifecycle events.
pub trait Key: Payload + Eq + Hash + Debug {}

impl<T: Payload + Eq + Hash + Debug> Key for T {}

pub(super) struct KeyedEntry<A: Payload, B, E: Payload> {
    value: A,
    index: usize,
    output: Option<B>,
    cell: ValueRef<A, E>,
    scope: Scope,
}

pub(super) struct KeyedState<A: Payload, K, B, E: Payload> {
    entries: HashMap<K, KeyedEntry<A, B, E>>,
    indices: HashMap<usize, K>,
    previous: Vec<K>,
    tasks: Vec<JoinHandle<Option<()>>>,
    pending: Option<JoinHandle<Option<()>>>,
    emit_generation: u64,
    seen_input: bool,
}

impl<A: Payload, K: Key, B: Payload, E: Payload> KeyedState<A, K, B, E> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            indices: HashMap::new(),
            previous: Vec::new(),
            tasks: Vec::new(),
            pending: None,
            emit_generation: 0,
            seen_input: false,
        }
    }

    /// Outputs for positions `0..n`, stopping at the first position that has
    /// not produced yet.
    fn ready_outputs(&self) -> Vec<B> {
        let mut outputs = Vec::with_capacity(self.previous.len());
        for index in 0..self.previous.len() {
            let output = self
                .indices
                .get(&index)
                .and_then(|key| self.entries.get(key))
                .and_then(|entry| {
                    debug_assert_eq!(entry.index, index);
                    entry.output.clone()
                });
            match output {
                Some(output) => outputs.push(output),
                None => break,
            }
        }
        outputs
    }
}

/// Work for the per-key writer, applied strictly in send order.
enum Write<A: Payload, E: Payload> {
    Set(ValueRef<A, E>, A),
    Flush(oneshot::Sender<()>),
}

/// Applies `ValueRef` updates in send order on a task of the keyed scope.
fn spawn_writer<A: Payload, E: Payload>(scope: &Scope) -> mpsc::UnboundedSender<Write<A, E>> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _writer = scope.spawn(async move {
        while let Some(write) = rx.recv().await {
            match write {
                Write::Set(cell, value) => cell.set(value).await,
                Write::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    });
    tx
}

struct Plan<A: Payload, K, E: Payload> {
    spawns: Vec<(K, ValueRef<A, E>, Scope)>,
    writes: Vec<(ValueRef<A, E>, A)>,
    structural: bool,
}

/// Drives one keyed subscription.
pub(super) struct Reconciler<A: Payload, K, B: Payload, E: Payload> {
    state: Mutex<KeyedState<A, K, B, E>>,
    options: KeyedOptions<A, K, B, E>,
    pub(super) downstream: Arc<GuardedSink<Vec<B>, E>>,
    scope: Scope,
    context: Context,
    clock: Arc<dyn Clock>,
    debounce: Duration,
    emit_gate: tokio::sync::Mutex<()>,
    writes: mpsc::UnboundedSender<Write<A, E>>,
}

impl<A: Payload, K: Key, B: Payload, E: Payload> Reconciler<A, K, B, E> {
    pub(super) fn new(
        options: KeyedOptions<A, K, B, E>,
        downstream: Arc<GuardedSink<Vec<B>, E>>,
        scope: Scope,
        context: Context,
    ) -> Arc<Self> {
        let debounce = options
            .debounce
            .unwrap_or_else(|| context.config().keyed_debounce());
        let writes = spawn_writer(&scope);
        Arc::new(Self {
            state: Mutex::new(KeyedState::new()),
            options,
            downstream,
            scope,
            clock: context.clock(),
            context,
            debounce,
            emit_gate: tokio::sync::Mutex::new(()),
            writes,
        })
    }

    /// Reconcile one input sequence.
    pub(super) async fn apply(self: &Arc<Self>, values: Vec<A>) {
        let plan = self.plan(values);

        for (key, cell, scope) in plan.spawns {
            let fx = (self.options.on_value)(cell, key.clone());
            let sink = Arc::new(EntrySink {
                reconciler: self.clone(),
                key,
                scope_id: scope.id(),
            });
            let run_scope = scope.clone();
            let handle = scope.spawn(async move {
                let cx = run_scope.context().clone();
                let run = AssertUnwindSafe(fx.run(sink.clone(), run_scope)).catch_unwind();
                if let Err(payload) = run.await {
                    let defect = Defect::from_panic(payload);
                    tracing::warn!(key = ?sink.key, error = %defect, "keyed entry panicked");
                    sink.on_failure(Cause::Die(defect), &cx).await;
                }
            });
            let mut state = self.state.lock();
            state.tasks.retain(|task| !task.is_finished());
            state.tasks.push(handle);
        }

        for (cell, value) in plan.writes {
            // The writer only stops once the keyed scope has closed.
            let _ = self.writes.send(Write::Set(cell, value));
        }

        if plan.structural {
            self.schedule_emit();
        } else {
            self.clock.tick().await;
        }
    }

    /// Apply the structural part of a reconciliation under the state lock.
    fn plan(&self, values: Vec<A>) -> Plan<A, K, E> {
        let mut seen = HashSet::with_capacity(values.len());
        let mut keys = Vec::with_capacity(values.len());
        let mut kept = Vec::with_capacity(values.len());
        for value in values {
            let key = (self.options.get_key)(&value);
            if !seen.insert(key.clone()) {
                tracing::warn!(
                    key = ?key,
                    "duplicate key in keyed input; keeping first occurrence"
                );
                continue;
            }
            keys.push(key);
            kept.push(value);
        }

        let mut state = self.state.lock();
        let changes = diff(&state.previous, &keys);
        let mut plan = Plan {
            spawns: Vec::new(),
            writes: Vec::new(),
            structural: changes.is_structural(),
        };

        for change in changes.changes {
            match change {
                Change::Removed { key, .. } => {
                    if let Some(entry) = state.entries.get(&key) {
                        entry.scope.close();
                    }
                    state.entries.remove(&key);
                    tracing::debug!(key = ?key, "keyed entry removed");
                }
                Change::Added { key, index } => {
                    let value = kept[index].clone();
                    let scope = self.scope.fork();
                    let cell = ValueRef::new(value.clone());
                    state.entries.insert(
                        key.clone(),
                        KeyedEntry {
                            value,
                            index,
                            output: None,
                            cell: cell.clone(),
                            scope: scope.clone(),
                        },
                    );
                    tracing::debug!(key = ?key, index, "keyed entry added");
                    plan.spawns.push((key, cell, scope));
                }
                Change::Updated { key, index } | Change::Moved { key, to: index, .. } => {
                    if let Some(entry) = state.entries.get_mut(&key) {
                        entry.value = kept[index].clone();
                        entry.index = index;
                        plan.writes.push((entry.cell.clone(), entry.value.clone()));
                    }
                }
            }
        }

        state.indices = keys.iter().cloned().enumerate().collect();
        if keys.is_empty() && (!state.seen_input || !state.previous.is_empty()) {
            plan.structural = true;
        }
        state.seen_input = true;
        state.previous = keys;
        plan
    }

    /// Restart the debounce window for the next emission.
    fn schedule_emit(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if self.scope.is_closed() {
            return;
        }
        state.emit_generation += 1;
        let generation = state.emit_generation;
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        let this = self.clone();
        state.pending = Some(self.scope.spawn(async move {
            this.clock.sleep(this.debounce).await;
            this.fire(generation).await;
        }));
    }

    async fn fire(&self, generation: u64) {
        let _gate = self.emit_gate.lock().await;
        let outputs = {
            let mut state = self.state.lock();
            if state.emit_generation != generation {
                return;
            }
            // Past this point the emission is no longer cancelled by a
            // reschedule.
            state.pending = None;
            let outputs = state.ready_outputs();
            if outputs.is_empty() && !state.previous.is_empty() {
                return;
            }
            outputs
        };
        tracing::trace!(len = outputs.len(), generation, "keyed emission");
        self.downstream.on_success(outputs, &self.context).await;
    }

    /// Input ended: complete every per-key value, wait for the per-key
    /// streams, then flush the pending emission.
    pub(super) async fn finish(&self) {
        let (flushed, done) = oneshot::channel();
        if self.writes.send(Write::Flush(flushed)).is_ok() {
            let _ = done.await;
        }

        let (cells, tasks) = {
            let mut state = self.state.lock();
            let cells: Vec<_> = state.entries.values().map(|e| e.cell.clone()).collect();
            (cells, std::mem::take(&mut state.tasks))
        };
        for cell in cells {
            cell.complete();
        }
        join_all(tasks).await;

        loop {
            let pending = self.state.lock().pending.take();
            match pending {
                Some(pending) => {
                    let _ = pending.await;
                }
                None => break,
            }
        }
        tracing::debug!(scope = %self.scope.id(), "keyed input finished");
    }

    #[cfg(test)]
    fn snapshot(&self) -> (Vec<K>, Vec<Option<B>>) {
        let state = self.state.lock();
        let outputs = state
            .previous
            .iter()
            .map(|key| state.entries.get(key).and_then(|e| e.output.clone()))
            .collect();
        (state.previous.clone(), outputs)
    }
}

/// Receives one key's outputs.
struct EntrySink<A: Payload, K, B: Payload, E: Payload> {
    reconciler: Arc<Reconciler<A, K, B, E>>,
    key: K,
    scope_id: ScopeId,
}

#[async_trait]
impl<A: Payload, K: Key, B: Payload, E: Payload> Sink<B, E> for EntrySink<A, K, B, E> {
    async fn on_success(&self, value: B, _cx: &Context) {
        let accepted = {
            let mut state = self.reconciler.state.lock();
            match state.entries.get_mut(&self.key) {
                // A key removed and re-added gets a new entry; ignore the
                // stale one.
                Some(entry) if entry.scope.id() == self.scope_id => {
                    entry.output = Some(value);
                    true
                }
                _ => false,
            }
        };
        if accepted {
            self.reconciler.schedule_emit();
        }
    }

    async fn on_failure(&self, cause: Cause<E>, _cx: &Context) {
        if cause.is_interrupt() {
            return;
        }
        tracing::debug!(key = ?self.key, "keyed entry failed");
        self.reconciler
            .downstream
            .on_failure(cause, &self.reconciler.context)
            .await;
    }
}
