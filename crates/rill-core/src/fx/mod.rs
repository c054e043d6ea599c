//! Push-based event sources.
//!
//! An [`Fx`] pushes values into a [`Sink`](crate::Sink) while running inside a
//! caller-supplied [`Scope`]. The future returned by `run` completes when the
//! source is exhausted, after it has reported a failure, or when the scope
//! closes. Dropping that future cancels the source.
//!
//! Contract for implementors:
//! - at most one `on_failure` per run, and no `on_success` after it
//! - observe scope closure promptly (`Scope::until_closed`, `Scope::spawn`)
//! - release everything acquired during `run` by the time it returns, or
//!   register it with the scope

mod combine;
mod constructors;
mod operators;

pub use combine::combine_latest;
pub use constructors::{die, empty, fail, from_async, from_iter, from_stream, never, succeed};
pub use operators::{filter, map, map_async, provide};

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cause::Cause;
use crate::context::Context;
use crate::scope::Scope;
use crate::sink::{Payload, SinkRef};

/// A push-based source of `A` values that may fail with `E`.
#[async_trait]
pub trait Fx<A: Payload, E: Payload>: Send + Sync + 'static {
    /// Push values into `sink` until exhausted, failed, or `scope` closes.
    async fn run(&self, sink: SinkRef<A, E>, scope: Scope);
}

/// Shared, type-erased source.
pub type FxRef<A, E> = Arc<dyn Fx<A, E>>;

#[async_trait]
impl<A, E, F> Fx<A, E> for Arc<F>
where
    A: Payload,
    E: Payload,
    F: Fx<A, E> + ?Sized,
{
    async fn run(&self, sink: SinkRef<A, E>, scope: Scope) {
        (**self).run(sink, scope).await;
    }
}

/// Operator methods available on every source.
pub trait FxExt<A: Payload, E: Payload>: Fx<A, E> + Sized {
    /// Erase the concrete source type.
    fn boxed(self) -> FxRef<A, E> {
        Arc::new(self)
    }

    /// Transform every value.
    fn map<B, F>(self, f: F) -> FxRef<B, E>
    where
        B: Payload,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        map(self.boxed(), f)
    }

    /// Keep values matching `predicate`.
    fn filter<F>(self, predicate: F) -> FxRef<A, E>
    where
        F: Fn(&A) -> bool + Send + Sync + 'static,
    {
        filter(self.boxed(), predicate)
    }

    /// Transform every value with an async, fallible function. The first
    /// failure terminates the stream.
    fn map_async<B, F, Fut>(self, f: F) -> FxRef<B, E>
    where
        B: Payload,
        F: Fn(A, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<B, Cause<E>>> + Send + 'static,
    {
        map_async(self.boxed(), f)
    }

    /// Run this source with `context` layered over the subscriber's context.
    fn provide(self, context: Context) -> FxRef<A, E> {
        provide(self.boxed(), context)
    }
}

impl<A: Payload, E: Payload, T: Fx<A, E>> FxExt<A, E> for T {}
