//! Per-value operators.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Fx, FxRef};
use crate::cause::Cause;
use crate::context::Context;
use crate::scope::Scope;
use crate::sink::{GuardedSink, Payload, Sink, SinkRef};

struct Map<A: Payload, E: Payload, F> {
    source: FxRef<A, E>,
    f: Arc<F>,
}

struct MapSink<B: Payload, E: Payload, F> {
    downstream: SinkRef<B, E>,
    f: Arc<F>,
}

#[async_trait]
impl<A, B, E, F> Sink<A, E> for MapSink<B, E, F>
where
    A: Payload,
    B: Payload,
    E: Payload,
    F: Fn(A) -> B + Send + Sync + 'static,
{
    async fn on_success(&self, value: A, cx: &Context) {
        self.downstream.on_success((self.f)(value), cx).await;
    }

    async fn on_failure(&self, cause: Cause<E>, cx: &Context) {
        self.downstream.on_failure(cause, cx).await;
    }
}

#[async_trait]
impl<A, B, E, F> Fx<B, E> for Map<A, E, F>
where
    A: Payload,
    B: Payload,
    E: Payload,
    F: Fn(A) -> B + Send + Sync + 'static,
{
    async fn run(&self, sink: SinkRef<B, E>, scope: Scope) {
        let sink = Arc::new(MapSink {
            downstream: sink,
            f: self.f.clone(),
        });
        self.source.run(sink, scope).await;
    }
}

/// Transform every value of `source`.
pub fn map<A, B, E, F>(source: FxRef<A, E>, f: F) -> FxRef<B, E>
where
    A: Payload,
    B: Payload,
    E: Payload,
    F: Fn(A) -> B + Send + Sync + 'static,
{
    Arc::new(Map {
        source,
        f: Arc::new(f),
    })
}

struct Filter<A: Payload, E: Payload, F> {
    source: FxRef<A, E>,
    predicate: Arc<F>,
}

struct FilterSink<A: Payload, E: Payload, F> {
    downstream: SinkRef<A, E>,
    predicate: Arc<F>,
}

#[async_trait]
impl<A, E, F> Sink<A, E> for FilterSink<A, E, F>
where
    A: Payload,
    E: Payload,
    F: Fn(&A) -> bool + Send + Sync + 'static,
{
    async fn on_success(&self, value: A, cx: &Context) {
        if (self.predicate)(&value) {
            self.downstream.on_success(value, cx).await;
        }
    }

    async fn on_failure(&self, cause: Cause<E>, cx: &Context) {
        self.downstream.on_failure(cause, cx).await;
    }
}

#[async_trait]
impl<A, E, F> Fx<A, E> for Filter<A, E, F>
where
    A: Payload,
    E: Payload,
    F: Fn(&A) -> bool + Send + Sync + 'static,
{
    async fn run(&self, sink: SinkRef<A, E>, scope: Scope) {
        let sink = Arc::new(FilterSink {
            downstream: sink,
            predicate: self.predicate.clone(),
        });
        self.source.run(sink, scope).await;
    }
}

/// Keep only values of `source` matching `predicate`.
pub fn filter<A, E, F>(source: FxRef<A, E>, predicate: F) -> FxRef<A, E>
where
    A: Payload,
    E: Payload,
    F: Fn(&A) -> bool + Send + Sync + 'static,
{
    Arc::new(Filter {
        source,
        predicate: Arc::new(predicate),
    })
}

struct MapAsync<A: Payload, E: Payload, F> {
    source: FxRef<A, E>,
    f: Arc<F>,
}

struct MapAsyncSink<B: Payload, E: Payload, F> {
    downstream: Arc<GuardedSink<B, E>>,
    f: Arc<F>,
}

#[async_trait]
impl<A, B, E, F, Fut> Sink<A, E> for MapAsyncSink<B, E, F>
where
    A: Payload,
    B: Payload,
    E: Payload,
    F: Fn(A, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<B, Cause<E>>> + Send + 'static,
{
    async fn on_success(&self, value: A, cx: &Context) {
        if self.downstream.is_terminated() {
            return;
        }
        match (self.f)(value, cx.clone()).await {
            Ok(mapped) => self.downstream.on_success(mapped, cx).await,
            Err(cause) => self.downstream.on_failure(cause, cx).await,
        }
    }

    async fn on_failure(&self, cause: Cause<E>, cx: &Context) {
        self.downstream.on_failure(cause, cx).await;
    }
}

#[async_trait]
impl<A, B, E, F, Fut> Fx<B, E> for MapAsync<A, E, F>
where
    A: Payload,
    B: Payload,
    E: Payload,
    F: Fn(A, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<B, Cause<E>>> + Send + 'static,
{
    async fn run(&self, sink: SinkRef<B, E>, scope: Scope) {
        // Own scope so a mapping failure stops the upstream without closing
        // the caller's scope.
        let inner = scope.fork();
        let _guard = inner.guard();
        let sink = Arc::new(MapAsyncSink {
            downstream: GuardedSink::new(sink, inner.clone()),
            f: self.f.clone(),
        });
        inner
            .until_closed(self.source.run(sink, inner.clone()))
            .await;
    }
}

/// Transform every value of `source` with an async, fallible function.
///
/// Values are mapped one at a time, in arrival order. The first `Err`
/// becomes the stream's terminal failure and stops `source`.
pub fn map_async<A, B, E, F, Fut>(source: FxRef<A, E>, f: F) -> FxRef<B, E>
where
    A: Payload,
    B: Payload,
    E: Payload,
    F: Fn(A, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<B, Cause<E>>> + Send + 'static,
{
    Arc::new(MapAsync {
        source,
        f: Arc::new(f),
    })
}

struct Provide<A: Payload, E: Payload> {
    source: FxRef<A, E>,
    context: Context,
}

/// Hands values from a provided region back under the caller's context.
struct RestoreContext<A: Payload, E: Payload> {
    downstream: SinkRef<A, E>,
    outer: Context,
    _marker: PhantomData<fn(A)>,
}

#[async_trait]
impl<A: Payload, E: Payload> Sink<A, E> for RestoreContext<A, E> {
    async fn on_success(&self, value: A, _cx: &Context) {
        self.downstream.on_success(value, &self.outer).await;
    }

    async fn on_failure(&self, cause: Cause<E>, _cx: &Context) {
        self.downstream.on_failure(cause, &self.outer).await;
    }
}

#[async_trait]
impl<A: Payload, E: Payload> Fx<A, E> for Provide<A, E> {
    async fn run(&self, sink: SinkRef<A, E>, scope: Scope) {
        let outer = scope.context().clone();
        let inner = scope.fork_with(outer.merge(&self.context));
        let _guard = inner.guard();
        let sink = Arc::new(RestoreContext {
            downstream: sink,
            outer,
            _marker: PhantomData,
        });
        inner.until_closed(self.source.run(sink, inner.clone())).await;
    }
}

/// Run `source` with `context` layered over the subscriber's context.
///
/// Only `source` sees the extra entries; downstream sinks keep receiving
/// the subscriber's own context.
pub fn provide<A: Payload, E: Payload>(source: FxRef<A, E>, context: Context) -> FxRef<A, E> {
    Arc::new(Provide { source, context })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fx::{from_iter, FxExt};
    use crate::observe::{collect, collect_in};

    #[tokio::test]
    async fn test_map_and_filter_compose() {
        let fx = from_iter::<_, String, _>(1..=6)
            .filter(|n| n % 2 == 0)
            .map(|n| n * 10);
        assert_eq!(collect(&fx).await.unwrap(), vec![20, 40, 60]);
    }

    #[tokio::test]
    async fn test_map_async_first_error_terminates() {
        let fx = from_iter::<_, String, _>(vec![1, 2, 3, 4]).map_async(|n, _cx| async move {
            if n == 3 {
                Err(Cause::fail(format!("bad {n}")))
            } else {
                Ok(n + 100)
            }
        });
        let scope = Scope::new();
        let out = collect_in(&fx, &scope).await;
        assert_eq!(out, Err(Cause::Fail("bad 3".to_string())));
        assert!(!scope.is_closed());
    }

    #[derive(Debug, PartialEq)]
    struct Tenant(&'static str);

    #[tokio::test]
    async fn test_provide_is_visible_upstream_only() {
        let fx = from_iter::<_, String, _>(vec![(), ()])
            .map_async(|_, cx: Context| async move {
                Ok(cx.get::<Tenant>().map(|t| t.0).unwrap_or("none"))
            })
            .provide(Context::new().with(Tenant("acme")));
        assert_eq!(collect(&fx).await.unwrap(), vec!["acme", "acme"]);
    }

    #[tokio::test]
    async fn test_provide_overrides_outer_entries() {
        let fx = from_iter::<_, String, _>(vec![()])
            .map_async(|_, cx: Context| async move { Ok(cx.get::<Tenant>().map(|t| t.0)) })
            .provide(Context::new().with(Tenant("inner")));
        let scope = Scope::with_context(Context::new().with(Tenant("outer")));
        assert_eq!(collect_in(&fx, &scope).await.unwrap(), vec![Some("inner")]);
    }
}
