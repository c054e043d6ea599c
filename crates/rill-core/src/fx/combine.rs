//! Latest-value combination of several sources.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;

use super::{Fx, FxRef};
use crate::cause::Cause;
use crate::context::Context;
use crate::scope::Scope;
use crate::sink::{GuardedSink, Payload, Sink, SinkRef};

struct CombineLatest<A: Payload, E: Payload> {
    sources: Vec<FxRef<A, E>>,
}

struct SlotSink<A: Payload, E: Payload> {
    index: usize,
    slots: Arc<Mutex<Vec<Option<A>>>>,
    downstream: Arc<GuardedSink<Vec<A>, E>>,
}

#[async_trait]
impl<A: Payload, E: Payload> Sink<A, E> for SlotSink<A, E> {
    async fn on_success(&self, value: A, cx: &Context) {
        // Held across delivery so combined emissions reach downstream in the
        // order their slots were written.
        let mut slots = self.slots.lock().await;
        slots[self.index] = Some(value);
        let ready: Option<Vec<A>> = slots.iter().cloned().collect();
        if let Some(values) = ready {
            self.downstream.on_success(values, cx).await;
        }
    }

    async fn on_failure(&self, cause: Cause<E>, cx: &Context) {
        self.downstream.on_failure(cause, cx).await;
    }
}

#[async_trait]
impl<A: Payload, E: Payload> Fx<Vec<A>, E> for CombineLatest<A, E> {
    async fn run(&self, sink: SinkRef<Vec<A>, E>, scope: Scope) {
        if self.sources.is_empty() {
            if !scope.is_closed() {
                sink.on_success(Vec::new(), scope.context()).await;
            }
            return;
        }

        let inner = scope.fork();
        let _guard = inner.guard();
        let downstream = GuardedSink::new(sink, inner.clone());
        let slots = Arc::new(Mutex::new(vec![None; self.sources.len()]));

        let runs = self.sources.iter().enumerate().map(|(index, source)| {
            let slot_sink = Arc::new(SlotSink {
                index,
                slots: slots.clone(),
                downstream: downstream.clone(),
            });
            source.run(slot_sink, inner.clone())
        });
        inner.until_closed(join_all(runs)).await;
    }
}

/// Emit a vector of the latest value from every source once all of them have
/// produced, and again whenever any of them produces.
///
/// Completes when every source has completed. The first failure from any
/// source terminates the combination. No sources emits one empty vector.
pub fn combine_latest<A: Payload, E: Payload>(sources: Vec<FxRef<A, E>>) -> FxRef<Vec<A>, E> {
    Arc::new(CombineLatest { sources })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fx::{fail, from_iter, never, succeed};
    use crate::observe::collect;

    #[tokio::test]
    async fn test_waits_for_every_source() {
        let fx = combine_latest(vec![
            from_iter::<_, String, _>(vec![1, 2]),
            succeed(10),
        ]);
        let out = collect(&fx).await.unwrap();
        assert_eq!(out.last(), Some(&vec![2, 10]));
        assert!(out.iter().all(|v| v.len() == 2));
    }

    #[tokio::test]
    async fn test_empty_input_emits_empty_vec() {
        let fx = combine_latest::<u8, String>(Vec::new());
        assert_eq!(collect(&fx).await.unwrap(), vec![Vec::<u8>::new()]);
    }

    #[tokio::test]
    async fn test_failure_stops_remaining_sources() {
        let fx = combine_latest(vec![never(), fail::<u8, _>("x".to_string())]);
        assert_eq!(collect(&fx).await, Err(Cause::Fail("x".to_string())));
    }
}
