//! Recording sinks.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use rill_core::{Cause, Context, Payload, Sink, SinkRef};

/// One delivery observed by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<A, E> {
    Value(A),
    Failure(Cause<E>),
}

/// Sink that records every delivery in arrival order.
pub struct RecordingSink<A, E> {
    events: Mutex<Vec<Event<A, E>>>,
    changed: Notify,
}

impl<A: Payload, E: Payload> RecordingSink<A, E> {
    /// An empty recorder.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            changed: Notify::new(),
        })
    }

    /// This sink as a type-erased [`SinkRef`].
    pub fn as_sink(self: &Arc<Self>) -> SinkRef<A, E> {
        self.clone()
    }

    /// Everything received, in order.
    pub fn events(&self) -> Vec<Event<A, E>> {
        self.events.lock().clone()
    }

    /// Received values, in order.
    pub fn values(&self) -> Vec<A> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Value(value) => Some(value.clone()),
                Event::Failure(_) => None,
            })
            .collect()
    }

    /// Received failures, in order.
    pub fn failures(&self) -> Vec<Cause<E>> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Failure(cause) => Some(cause.clone()),
                Event::Value(_) => None,
            })
            .collect()
    }

    /// Most recent value.
    pub fn last_value(&self) -> Option<A> {
        self.values().pop()
    }

    /// Number of events received.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing has been received.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Wait until at least `count` events have been recorded.
    pub async fn wait_for_len(&self, count: usize) {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if self.len() >= count {
                return;
            }
            changed.await;
        }
    }

    fn record(&self, event: Event<A, E>) {
        self.events.lock().push(event);
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl<A: Payload, E: Payload> Sink<A, E> for RecordingSink<A, E> {
    async fn on_success(&self, value: A, _cx: &Context) {
        self.record(Event::Value(value));
    }

    async fn on_failure(&self, cause: Cause<E>, _cx: &Context) {
        self.record(Event::Failure(cause));
    }
}
