//! Values readable both as a change stream and on demand.
//!
//! A [`Versioned`] exposes three views of one value:
//! - `version()`: a counter that changes whenever the value may have changed
//! - `changes()`: a source of updates
//! - `current()`: the value now, computed on demand
//!
//! Derived values built with [`Versioned::transform`] memoize `current()` on
//! the parent's version, so pulling an unchanged value repeatedly does not
//! recompute it.

mod combine;

pub use combine::{struct_of, tuple};

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use rill_core::fx;
use rill_core::{Context, Exit, Fx, FxRef, Payload, Scope, SinkRef};

use crate::cell::ValueRef;

/// Backing implementation of a [`Versioned`] value.
#[async_trait]
pub trait VersionedSource<A: Payload, B: Payload, E: Payload>: Send + Sync + 'static {
    /// Current version.
    async fn version(&self, cx: &Context) -> u64;

    /// Stream of changes.
    fn changes(&self) -> FxRef<A, E>;

    /// Pull the current value.
    async fn current(&self, cx: &Context) -> Exit<B, E>;
}

/// A value with a version, a change stream, and an on-demand pull.
pub struct Versioned<A: Payload, B: Payload, E: Payload> {
    source: Arc<dyn VersionedSource<A, B, E>>,
}

impl<A: Payload, B: Payload, E: Payload> Clone for Versioned<A, B, E> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
        }
    }
}

impl<A: Payload, B: Payload, E: Payload> Versioned<A, B, E> {
    /// Wrap a custom source.
    pub fn new<S: VersionedSource<A, B, E>>(source: S) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// Build from a version accessor, a change stream, and a pull function.
    pub fn make<V, C, Fut>(version: V, changes: FxRef<A, E>, current: C) -> Self
    where
        V: Fn(&Context) -> u64 + Send + Sync + 'static,
        C: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Exit<B, E>> + Send + 'static,
    {
        Self::new(Made {
            version,
            changes,
            current,
        })
    }

    /// Current version.
    pub async fn version(&self, cx: &Context) -> u64 {
        self.source.version(cx).await
    }

    /// Stream of changes.
    pub fn changes(&self) -> FxRef<A, E> {
        self.source.changes()
    }

    /// Pull the current value.
    pub async fn current(&self, cx: &Context) -> Exit<B, E> {
        self.source.current(cx).await
    }

    /// Derive a value: `on_fx` rewrites the change stream once, `on_pull`
    /// computes the pulled value from the parent's outcome.
    ///
    /// `on_pull` runs at most once per parent version; its result, success
    /// or failure, is returned for every pull until the version changes.
    pub fn transform<C, D, OnFx, OnPull, Fut>(
        &self,
        on_fx: OnFx,
        on_pull: OnPull,
    ) -> Versioned<C, D, E>
    where
        C: Payload,
        D: Payload,
        OnFx: FnOnce(FxRef<A, E>) -> FxRef<C, E>,
        OnPull: Fn(Exit<B, E>, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Exit<D, E>> + Send + 'static,
    {
        Versioned::new(Transformed {
            changes: on_fx(self.changes()),
            parent: self.clone(),
            on_pull,
            cache: tokio::sync::Mutex::new(Cache {
                version: None,
                outcome: None,
            }),
        })
    }

    /// Read every view of this value with `context` layered over the
    /// caller's context.
    pub fn provide(&self, context: Context) -> Self {
        Self::new(Provided {
            changes: fx::provide(self.changes(), context.clone()),
            parent: self.clone(),
            context,
        })
    }
}

impl<A: Payload, E: Payload> Versioned<A, A, E> {
    /// View a [`ValueRef`] as a versioned value. The version is the ref's
    /// write count.
    pub fn from_value_ref(cell: ValueRef<A, E>) -> Self {
        Self::new(RefSource { cell })
    }

    /// Transform both the changes and the pulled value.
    pub fn map<B, F>(&self, f: F) -> Versioned<B, B, E>
    where
        B: Payload,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let on_change = f.clone();
        self.transform(
            move |changes| fx::map(changes, move |value| on_change(value)),
            move |outcome, _cx| {
                let f = f.clone();
                async move { outcome.map(|value| f(value)) }
            },
        )
    }

    /// Transform both the changes and the pulled value with an async,
    /// fallible function.
    pub fn map_async<B, F, Fut>(&self, f: F) -> Versioned<B, B, E>
    where
        B: Payload,
        F: Fn(A, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Exit<B, E>> + Send + 'static,
    {
        let f = Arc::new(f);
        let on_change = f.clone();
        self.transform(
            move |changes| fx::map_async(changes, move |value, cx| on_change(value, cx)),
            move |outcome, cx| {
                let f = f.clone();
                async move {
                    match outcome {
                        Ok(value) => f(value, cx).await,
                        Err(cause) => Err(cause),
                    }
                }
            },
        )
    }
}

#[async_trait]
impl<A: Payload, B: Payload, E: Payload> Fx<A, E> for Versioned<A, B, E> {
    async fn run(&self, sink: SinkRef<A, E>, scope: Scope) {
        self.changes().run(sink, scope).await;
    }
}

struct Made<V, C, A: Payload, E: Payload> {
    version: V,
    changes: FxRef<A, E>,
    current: C,
}

#[async_trait]
impl<A, B, E, V, C, Fut> VersionedSource<A, B, E> for Made<V, C, A, E>
where
    A: Payload,
    B: Payload,
    E: Payload,
    V: Fn(&Context) -> u64 + Send + Sync + 'static,
    C: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Exit<B, E>> + Send + 'static,
{
    async fn version(&self, cx: &Context) -> u64 {
        (self.version)(cx)
    }

    fn changes(&self) -> FxRef<A, E> {
        self.changes.clone()
    }

    async fn current(&self, cx: &Context) -> Exit<B, E> {
        (self.current)(cx.clone()).await
    }
}

struct Cache<D, E> {
    version: Option<u64>,
    outcome: Option<Exit<D, E>>,
}

struct Transformed<A: Payload, B: Payload, C: Payload, D, E: Payload, P> {
    parent: Versioned<A, B, E>,
    changes: FxRef<C, E>,
    on_pull: P,
    cache: tokio::sync::Mutex<Cache<D, E>>,
}

#[async_trait]
impl<A, B, C, D, E, P, Fut> VersionedSource<C, D, E> for Transformed<A, B, C, D, E, P>
where
    A: Payload,
    B: Payload,
    C: Payload,
    D: Payload,
    E: Payload,
    P: Fn(Exit<B, E>, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Exit<D, E>> + Send + 'static,
{
    async fn version(&self, cx: &Context) -> u64 {
        self.parent.version(cx).await
    }

    fn changes(&self) -> FxRef<C, E> {
        self.changes.clone()
    }

    async fn current(&self, cx: &Context) -> Exit<D, E> {
        // Read the version before computing: a change that lands mid-compute
        // leaves the cache keyed to the older version, forcing a recompute.
        let version = self.parent.version(cx).await;
        let mut cache = self.cache.lock().await;
        if cache.version == Some(version) {
            if let Some(outcome) = &cache.outcome {
                return outcome.clone();
            }
        }

        let parent = self.parent.current(cx).await;
        let outcome = (self.on_pull)(parent, cx.clone()).await;
        tracing::trace!(version, ok = outcome.is_ok(), "versioned value recomputed");
        cache.version = Some(version);
        cache.outcome = Some(outcome.clone());
        outcome
    }
}

struct Provided<A: Payload, B: Payload, E: Payload> {
    parent: Versioned<A, B, E>,
    changes: FxRef<A, E>,
    context: Context,
}

#[async_trait]
impl<A: Payload, B: Payload, E: Payload> VersionedSource<A, B, E> for Provided<A, B, E> {
    async fn version(&self, cx: &Context) -> u64 {
        self.parent.version(&cx.merge(&self.context)).await
    }

    fn changes(&self) -> FxRef<A, E> {
        self.changes.clone()
    }

    async fn current(&self, cx: &Context) -> Exit<B, E> {
        self.parent.current(&cx.merge(&self.context)).await
    }
}

struct RefSource<A: Payload, E: Payload> {
    cell: ValueRef<A, E>,
}

#[async_trait]
impl<A: Payload, E: Payload> VersionedSource<A, A, E> for RefSource<A, E> {
    async fn version(&self, _cx: &Context) -> u64 {
        self.cell.version()
    }

    fn changes(&self) -> FxRef<A, E> {
        Arc::new(self.cell.clone())
    }

    async fn current(&self, _cx: &Context) -> Exit<A, E> {
        Ok(self.cell.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::Cause;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    struct Counter {
        version: Arc<AtomicU64>,
        pulls: Arc<AtomicUsize>,
    }

    fn counted(fail: bool) -> (Versioned<u64, u64, String>, Counter) {
        let version = Arc::new(AtomicU64::new(1));
        let pulls = Arc::new(AtomicUsize::new(0));
        let read_version = version.clone();
        let pull_version = version.clone();
        let count = pulls.clone();
        let base = Versioned::make(
            move |_cx: &Context| read_version.load(Ordering::SeqCst),
            fx::empty(),
            move |_cx| {
                count.fetch_add(1, Ordering::SeqCst);
                let v = pull_version.load(Ordering::SeqCst);
                async move {
                    if fail {
                        Err(Cause::fail(format!("v{v}")))
                    } else {
                        Ok(v)
                    }
                }
            },
        );
        (base, Counter { version, pulls })
    }

    #[tokio::test]
    async fn test_transform_memoizes_on_version() {
        let (base, counter) = counted(false);
        let doubled = base.map(|v| v * 2);
        let cx = Context::new();

        assert_eq!(doubled.current(&cx).await, Ok(2));
        assert_eq!(doubled.current(&cx).await, Ok(2));
        assert_eq!(counter.pulls.load(Ordering::SeqCst), 1);

        counter.version.store(5, Ordering::SeqCst);
        assert_eq!(doubled.current(&cx).await, Ok(10));
        assert_eq!(counter.pulls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_are_cached_too() {
        let (base, counter) = counted(true);
        let derived = base.map(|v| v + 1);
        let cx = Context::new();

        assert_eq!(derived.current(&cx).await, Err(Cause::Fail("v1".to_string())));
        assert_eq!(derived.current(&cx).await, Err(Cause::Fail("v1".to_string())));
        assert_eq!(counter.pulls.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug)]
    struct Scale(u64);

    #[tokio::test]
    async fn test_provide_reaches_pull() {
        let base = Versioned::<u64, u64, String>::make(
            |_cx: &Context| 0,
            fx::empty(),
            |cx: Context| async move { Ok(cx.get::<Scale>().map_or(1, |s| s.0)) },
        );
        let provided = base.provide(Context::new().with(Scale(3)));
        assert_eq!(provided.current(&Context::new()).await, Ok(3));
        assert_eq!(base.current(&Context::new()).await, Ok(1));
    }

    #[tokio::test]
    async fn test_value_ref_versioning() {
        let cell = ValueRef::<&'static str, String>::new("a");
        let versioned = Versioned::from_value_ref(cell.clone());
        let cx = Context::new();
        assert_eq!(versioned.version(&cx).await, 0);

        cell.set("b").await;
        assert_eq!(versioned.version(&cx).await, 1);
        assert_eq!(versioned.current(&cx).await, Ok("b"));
    }
}
