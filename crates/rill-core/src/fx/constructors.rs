//! Basic sources.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use super::{Fx, FxRef};
use crate::cause::{Cause, Defect};
use crate::scope::Scope;
use crate::sink::{Payload, SinkRef};

struct Succeed<A>(A);

#[async_trait]
impl<A: Payload, E: Payload> Fx<A, E> for Succeed<A> {
    async fn run(&self, sink: SinkRef<A, E>, scope: Scope) {
        if !scope.is_closed() {
            sink.on_success(self.0.clone(), scope.context()).await;
        }
    }
}

/// Emit one value, then complete.
pub fn succeed<A: Payload, E: Payload>(value: A) -> FxRef<A, E> {
    Arc::new(Succeed(value))
}

struct Failed<E>(Cause<E>);

#[async_trait]
impl<A: Payload, E: Payload> Fx<A, E> for Failed<E> {
    async fn run(&self, sink: SinkRef<A, E>, scope: Scope) {
        if !scope.is_closed() {
            sink.on_failure(self.0.clone(), scope.context()).await;
        }
    }
}

/// Fail immediately with a typed error.
pub fn fail<A: Payload, E: Payload>(error: E) -> FxRef<A, E> {
    Arc::new(Failed(Cause::Fail(error)))
}

/// Fail immediately with a defect.
pub fn die<A: Payload, E: Payload>(message: impl Into<String>) -> FxRef<A, E> {
    Arc::new(Failed(Cause::Die(Defect::new(message))))
}

struct Empty;

#[async_trait]
impl<A: Payload, E: Payload> Fx<A, E> for Empty {
    async fn run(&self, _sink: SinkRef<A, E>, _scope: Scope) {}
}

/// Complete without emitting.
pub fn empty<A: Payload, E: Payload>() -> FxRef<A, E> {
    Arc::new(Empty)
}

struct Never;

#[async_trait]
impl<A: Payload, E: Payload> Fx<A, E> for Never {
    async fn run(&self, _sink: SinkRef<A, E>, scope: Scope) {
        scope.closed().await;
    }
}

/// Never emit; run until the scope closes.
pub fn never<A: Payload, E: Payload>() -> FxRef<A, E> {
    Arc::new(Never)
}

struct FromIter<A>(Vec<A>);

#[async_trait]
impl<A: Payload, E: Payload> Fx<A, E> for FromIter<A> {
    async fn run(&self, sink: SinkRef<A, E>, scope: Scope) {
        for value in &self.0 {
            if scope.is_closed() {
                return;
            }
            sink.on_success(value.clone(), scope.context()).await;
        }
    }
}

/// Emit every item in order, then complete.
pub fn from_iter<A, E, I>(items: I) -> FxRef<A, E>
where
    A: Payload,
    E: Payload,
    I: IntoIterator<Item = A>,
{
    Arc::new(FromIter(items.into_iter().collect()))
}

struct FromStream<F, E> {
    make: F,
    _marker: PhantomData<fn() -> E>,
}

#[async_trait]
impl<A, E, F, S> Fx<A, E> for FromStream<F, E>
where
    A: Payload,
    E: Payload,
    F: Fn() -> S + Send + Sync + 'static,
    S: Stream<Item = Result<A, E>> + Send + 'static,
{
    async fn run(&self, sink: SinkRef<A, E>, scope: Scope) {
        let mut stream = Box::pin((self.make)());
        let cx = scope.context().clone();
        scope
            .until_closed(async {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(value) => sink.on_success(value, &cx).await,
                        Err(error) => {
                            sink.on_failure(Cause::Fail(error), &cx).await;
                            return;
                        }
                    }
                }
            })
            .await;
    }
}

/// Adapt a `futures::Stream` of results. `make` is called once per run so
/// every subscriber gets its own stream.
pub fn from_stream<A, E, F, S>(make: F) -> FxRef<A, E>
where
    A: Payload,
    E: Payload,
    F: Fn() -> S + Send + Sync + 'static,
    S: Stream<Item = Result<A, E>> + Send + 'static,
{
    Arc::new(FromStream {
        make,
        _marker: PhantomData,
    })
}

struct FromAsync<F> {
    make: F,
}

#[async_trait]
impl<A, E, F, Fut> Fx<A, E> for FromAsync<F>
where
    A: Payload,
    E: Payload,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<A, E>> + Send + 'static,
{
    async fn run(&self, sink: SinkRef<A, E>, scope: Scope) {
        let cx = scope.context().clone();
        match scope.until_closed((self.make)()).await {
            Some(Ok(value)) => sink.on_success(value, &cx).await,
            Some(Err(error)) => sink.on_failure(Cause::Fail(error), &cx).await,
            None => {}
        }
    }
}

/// Emit the result of one future per run.
pub fn from_async<A, E, F, Fut>(make: F) -> FxRef<A, E>
where
    A: Payload,
    E: Payload,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<A, E>> + Send + 'static,
{
    Arc::new(FromAsync { make })
}
