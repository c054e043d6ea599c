//! Hand-driven sources.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;

use rill_core::{Cause, Context, Fx, Payload, Scope, SinkRef};

struct ActiveRun<A: Payload, E: Payload> {
    id: usize,
    sink: SinkRef<A, E>,
    context: Context,
    scope: Scope,
}

impl<A: Payload, E: Payload> Clone for ActiveRun<A, E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            sink: self.sink.clone(),
            context: self.context.clone(),
            scope: self.scope.clone(),
        }
    }
}

/// Source driven by the test, counting how often it is started and stopped.
///
/// Every `run` registers itself until it ends, whether by [`complete`],
/// [`fail`], or cancellation. [`emit`] pushes to every active run.
///
/// [`complete`]: ProbeSource::complete
/// [`fail`]: ProbeSource::fail
/// [`emit`]: ProbeSource::emit
pub struct ProbeSource<A: Payload, E: Payload> {
    starts: AtomicUsize,
    stops: AtomicUsize,
    next_id: AtomicUsize,
    runs: Mutex<Vec<ActiveRun<A, E>>>,
}

impl<A: Payload, E: Payload> ProbeSource<A, E> {
    /// A probe with no runs yet.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            runs: Mutex::new(Vec::new()),
        })
    }

    /// How many times `run` has been entered.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// How many runs have ended, for any reason.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Runs currently in progress.
    pub fn active(&self) -> usize {
        self.runs.lock().len()
    }

    /// Push `value` to every active run.
    pub async fn emit(&self, value: A) {
        let runs = self.runs.lock().clone();
        join_all(
            runs.iter()
                .map(|run| run.sink.on_success(value.clone(), &run.context)),
        )
        .await;
    }

    /// Fail every active run with `cause` and end it.
    pub async fn fail(&self, cause: Cause<E>) {
        let runs = self.runs.lock().clone();
        join_all(
            runs.iter()
                .map(|run| run.sink.on_failure(cause.clone(), &run.context)),
        )
        .await;
        for run in runs {
            run.scope.close();
        }
    }

    /// End every active run successfully.
    pub fn complete(&self) {
        let runs = self.runs.lock().clone();
        for run in runs {
            run.scope.close();
        }
    }
}

/// Unregisters a run and counts the stop however the run ends.
struct RunGuard<'a, A: Payload, E: Payload> {
    probe: &'a ProbeSource<A, E>,
    id: usize,
}

impl<A: Payload, E: Payload> Drop for RunGuard<'_, A, E> {
    fn drop(&mut self) {
        self.probe.runs.lock().retain(|run| run.id != self.id);
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl<A: Payload, E: Payload> Fx<A, E> for ProbeSource<A, E> {
    async fn run(&self, sink: SinkRef<A, E>, scope: Scope) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let run_scope = scope.fork();
        self.runs.lock().push(ActiveRun {
            id,
            sink,
            context: scope.context().clone(),
            scope: run_scope.clone(),
        });
        self.starts.fetch_add(1, Ordering::SeqCst);
        let _guard = RunGuard { probe: self, id };
        run_scope.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{settle, RecordingSink};

    #[tokio::test(start_paused = true)]
    async fn test_counts_start_and_cancel() {
        let probe = ProbeSource::<u8, String>::new();
        let sink = RecordingSink::new();
        let scope = Scope::new();
        let runner = probe.clone();
        let run_sink = sink.as_sink();
        let run_scope = scope.clone();
        let handle = tokio::spawn(async move { runner.run(run_sink, run_scope).await });
        settle().await;
        assert_eq!((probe.starts(), probe.stops(), probe.active()), (1, 0, 1));

        probe.emit(4).await;
        assert_eq!(sink.values(), vec![4]);

        scope.close();
        handle.await.unwrap();
        assert_eq!((probe.starts(), probe.stops(), probe.active()), (1, 1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_ends_run() {
        let probe = ProbeSource::<u8, String>::new();
        let runner = probe.clone();
        let sink = RecordingSink::new().as_sink();
        let handle = tokio::spawn(async move { runner.run(sink, Scope::new()).await });
        settle().await;

        probe.complete();
        handle.await.unwrap();
        assert_eq!(probe.stops(), 1);
    }
}
