//! Structured-concurrency regions.
//!
//! A [`Scope`] bounds the lifetime of the tasks and resources forked into it:
//!
//! - `fork()` creates a child scope whose lifetime ends no later than its parent's
//! - `spawn()` runs a future on Tokio until it finishes or the scope closes
//! - `add_finalizer()` registers cleanup that runs when the scope closes
//! - `close()` stops spawned tasks, closes children transitively, runs
//!   finalizers in reverse registration order, and is idempotent
//!
//! Closing is synchronous with respect to bookkeeping (after `close()` returns
//! every finalizer has run and every task has been asked to abort) but
//! cooperative with respect to futures: a future awaiting [`Scope::closed`]
//! or wrapped in [`Scope::until_closed`] observes the close at its next poll.
//!
//! Dropping the last handle to an unclosed scope closes it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

use crate::context::Context;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique scope identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    fn next() -> Self {
        Self(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope-{}", self.0)
    }
}

type Finalizer = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ScopeState {
    closed: bool,
    children: HashMap<ScopeId, Weak<ScopeInner>>,
    tasks: Vec<AbortHandle>,
    finalizers: Vec<Finalizer>,
}

struct ScopeInner {
    id: ScopeId,
    context: Context,
    parent: Option<Weak<ScopeInner>>,
    closed_tx: watch::Sender<bool>,
    state: Mutex<ScopeState>,
}

impl ScopeInner {
    fn new(context: Context, parent: Option<Weak<ScopeInner>>) -> Self {
        let (closed_tx, _closed_rx) = watch::channel(false);
        Self {
            id: ScopeId::next(),
            context,
            parent,
            closed_tx,
            state: Mutex::new(ScopeState::default()),
        }
    }

    fn shutdown(&self) -> bool {
        let (children, tasks, finalizers) = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.children),
                std::mem::take(&mut state.tasks),
                std::mem::take(&mut state.finalizers),
            )
        };

        self.closed_tx.send_replace(true);

        for child in children.into_values().filter_map(|child| child.upgrade()) {
            child.shutdown();
        }
        for task in &tasks {
            task.abort();
        }
        for finalizer in finalizers.into_iter().rev() {
            finalizer();
        }

        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.state.lock().children.remove(&self.id);
        }

        tracing::trace!(scope = %self.id, tasks = tasks.len(), "scope closed");
        true
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to a structured-concurrency region. Clones share the region.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// A new root scope with an empty context.
    pub fn new() -> Self {
        Self::with_context(Context::new())
    }

    /// A new root scope carrying `context`.
    pub fn with_context(context: Context) -> Self {
        Self {
            inner: Arc::new(ScopeInner::new(context, None)),
        }
    }

    /// Identifier of this scope.
    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    /// Ambient context of this scope.
    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Whether `close` has run, directly or through a parent.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Fork a child scope inheriting this scope's context.
    ///
    /// Forking a closed scope yields a child that is already closed.
    pub fn fork(&self) -> Scope {
        self.fork_with(self.inner.context.clone())
    }

    /// Fork a child scope with a different context.
    pub fn fork_with(&self, context: Context) -> Scope {
        let child = Scope {
            inner: Arc::new(ScopeInner::new(context, Some(Arc::downgrade(&self.inner)))),
        };
        let parent_closed = {
            let mut state = self.inner.state.lock();
            if !state.closed {
                state
                    .children
                    .insert(child.inner.id, Arc::downgrade(&child.inner));
            }
            state.closed
        };
        if parent_closed {
            child.close();
        }
        child
    }

    /// Close the scope. Returns `true` if this call performed the close.
    pub fn close(&self) -> bool {
        self.inner.shutdown()
    }

    /// Register cleanup to run when the scope closes. Runs immediately if the
    /// scope is already closed.
    pub fn add_finalizer<F>(&self, finalizer: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if !state.closed {
                state.finalizers.push(Box::new(finalizer));
                return;
            }
        }
        finalizer();
    }

    /// Resolve once the scope has been closed.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut closed_rx = self.inner.closed_tx.subscribe();
        async move {
            let _ = closed_rx.wait_for(|closed| *closed).await;
        }
    }

    /// Drive `fut` until it completes or the scope closes, whichever is first.
    pub async fn until_closed<F: Future>(&self, fut: F) -> Option<F::Output> {
        let closed = self.closed();
        tokio::select! {
            biased;
            () = closed => None,
            out = fut => Some(out),
        }
    }

    /// Spawn `fut` on the Tokio runtime, bound to this scope.
    ///
    /// The join handle yields `None` when the scope closed before the future
    /// finished. Spawning into a closed scope never polls the future.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let closed = self.closed();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = closed => None,
                out = fut => Some(out),
            }
        });

        let mut state = self.inner.state.lock();
        if state.closed {
            handle.abort();
        } else {
            state.tasks.retain(|task| !task.is_finished());
            state.tasks.push(handle.abort_handle());
        }
        handle
    }

    /// Guard that closes this scope when dropped.
    pub fn guard(&self) -> ScopeGuard {
        ScopeGuard {
            scope: self.clone(),
        }
    }

    /// Number of live child scopes.
    pub fn child_count(&self) -> usize {
        self.inner.state.lock().children.len()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Closes its scope when dropped.
///
/// Used where a future owns a scope and may itself be dropped mid-flight.
#[must_use = "the scope is closed as soon as the guard is dropped"]
pub struct ScopeGuard {
    scope: Scope,
}

impl ScopeGuard {
    /// The guarded scope.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.scope.close();
    }
}
