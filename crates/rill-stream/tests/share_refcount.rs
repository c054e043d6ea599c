//! Ref-counting and buffering behaviour of shared sources
//!
//! - the source starts once per 0→1 transition and stops on →0
//! - completion and failure of the source end every subscriber exactly once
//! - hold and replay buffers reach late subscribers

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use proptest::prelude::*;
use rill_core::{Cause, Fx, FxRef, Payload, Scope, SinkRef};
use rill_stream::{hold, multicast, replay, Share};
use rill_testkit::{init_test_tracing, settle, ProbeSource, RecordingSink};
use tokio::task::JoinHandle;

struct Subscriber<A: Payload, E: Payload> {
    sink: Arc<RecordingSink<A, E>>,
    scope: Scope,
    handle: JoinHandle<()>,
}

fn subscribe<A: Payload, E: Payload>(shared: &Share<A, E>) -> Subscriber<A, E> {
    let sink = RecordingSink::new();
    let scope = Scope::new();
    let runner = shared.clone();
    let run_sink = sink.as_sink();
    let run_scope = scope.clone();
    let handle = tokio::spawn(async move { runner.run(run_sink, run_scope).await });
    Subscriber {
        sink,
        scope,
        handle,
    }
}

fn probe() -> (Arc<ProbeSource<u32, String>>, FxRef<u32, String>) {
    let probe = ProbeSource::new();
    let source: FxRef<u32, String> = probe.clone();
    (probe, source)
}

#[tokio::test(start_paused = true)]
async fn source_starts_once_and_stops_with_last_subscriber() {
    init_test_tracing();
    let (probe, source) = probe();
    let shared = multicast(source);

    let first = subscribe(&shared);
    let second = subscribe(&shared);
    settle().await;
    assert_eq!(probe.starts(), 1);
    assert_eq!(shared.subscriber_count(), 2);

    probe.emit(1).await;
    assert_eq!(first.sink.values(), vec![1]);
    assert_eq!(second.sink.values(), vec![1]);

    first.scope.close();
    first.handle.await.unwrap();
    settle().await;
    assert_eq!(probe.stops(), 0);
    assert!(shared.is_running());

    second.scope.close();
    second.handle.await.unwrap();
    settle().await;
    assert_eq!(probe.stops(), 1);
    assert!(!shared.is_running());
    assert_eq!(shared.subscriber_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn resubscribing_after_zero_restarts_the_source() {
    let (probe, source) = probe();
    let shared = multicast(source);

    let first = subscribe(&shared);
    settle().await;
    first.scope.close();
    first.handle.await.unwrap();
    settle().await;

    let again = subscribe(&shared);
    settle().await;
    assert_eq!(probe.starts(), 2);
    assert_eq!(probe.stops(), 1);

    probe.emit(3).await;
    assert_eq!(again.sink.values(), vec![3]);
}

#[tokio::test(start_paused = true)]
async fn source_completion_ends_every_subscriber() {
    let (probe, source) = probe();
    let shared = multicast(source);
    let a = subscribe(&shared);
    let b = subscribe(&shared);
    settle().await;

    probe.complete();
    a.handle.await.unwrap();
    b.handle.await.unwrap();
    settle().await;

    assert!(!shared.is_running());
    assert_eq!(shared.subscriber_count(), 0);
    assert_eq!(probe.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn source_failure_reaches_each_subscriber_once() {
    let (probe, source) = probe();
    let shared = multicast(source);
    let mut a = subscribe(&shared);
    let mut b = subscribe(&shared);
    settle().await;

    probe.fail(Cause::fail("broken".to_string())).await;
    (&mut a.handle).await.unwrap();
    (&mut b.handle).await.unwrap();
    settle().await;

    for subscriber in [&a, &b] {
        assert_eq!(
            subscriber.sink.failures(),
            vec![Cause::Fail("broken".to_string())]
        );
    }
    assert_eq!(probe.stops(), 1);
    assert!(!shared.is_running());
}

#[tokio::test(start_paused = true)]
async fn hold_replays_latest_to_late_subscriber() {
    let (probe, source) = probe();
    let shared = hold(source);
    let early = subscribe(&shared);
    settle().await;
    probe.emit(1).await;
    probe.emit(2).await;

    let late = subscribe(&shared);
    settle().await;
    probe.emit(3).await;

    assert_eq!(early.sink.values(), vec![1, 2, 3]);
    assert_eq!(late.sink.values(), vec![2, 3]);
    assert_eq!(probe.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn replay_delivers_last_n_in_order() {
    let (probe, source) = probe();
    let shared = replay(source, 2).unwrap();
    let _early = subscribe(&shared);
    settle().await;
    for v in [1, 2, 3] {
        probe.emit(v).await;
    }

    let late = subscribe(&shared);
    settle().await;
    probe.emit(4).await;
    assert_eq!(late.sink.values(), vec![2, 3, 4]);
}

/// Emits once, then panics.
struct Panicky;

#[async_trait]
impl Fx<u32, String> for Panicky {
    async fn run(&self, sink: SinkRef<u32, String>, scope: Scope) {
        sink.on_success(1, scope.context()).await;
        panic!("source blew up");
    }
}

#[tokio::test(start_paused = true)]
async fn source_panic_reaches_subscribers_once_and_cleans_up() {
    let source: FxRef<u32, String> = Arc::new(Panicky);
    let shared = multicast(source);
    let a = subscribe(&shared);
    let b = subscribe(&shared);

    for subscriber in [a, b] {
        tokio::time::timeout(Duration::from_secs(5), subscriber.handle)
            .await
            .expect("subscriber should end after the source panics")
            .unwrap();
        let failures = subscriber.sink.failures();
        assert_eq!(failures.len(), 1);
        assert_matches!(
            &failures[0],
            Cause::Die(defect) if defect.message() == "source blew up"
        );
    }
    settle().await;
    assert!(!shared.is_running());
    assert_eq!(shared.subscriber_count(), 0);
}

#[test]
fn replay_rejects_zero_capacity() {
    let (_probe, source) = probe();
    assert!(replay(source, 0).is_err());
}

#[derive(Debug, Clone)]
enum Op {
    Attach,
    Detach(usize),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(
        prop_oneof![Just(Op::Attach), (0usize..8).prop_map(Op::Detach)],
        1..24,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn ref_count_tracks_live_subscribers(ops in ops()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        runtime.block_on(async {
            let (probe, source) = probe();
            let shared = multicast(source);
            let mut live: Vec<Subscriber<u32, String>> = Vec::new();
            let mut transitions = 0;

            for op in ops {
                match op {
                    Op::Attach => {
                        if live.is_empty() {
                            transitions += 1;
                        }
                        live.push(subscribe(&shared));
                    }
                    Op::Detach(i) if !live.is_empty() => {
                        let subscriber = live.remove(i % live.len());
                        subscriber.scope.close();
                        subscriber.handle.await.unwrap();
                    }
                    Op::Detach(_) => {}
                }
                settle().await;

                assert_eq!(shared.subscriber_count(), live.len());
                assert_eq!(shared.is_running(), !live.is_empty());
                assert_eq!(probe.active(), usize::from(!live.is_empty()));
                assert_eq!(probe.starts(), transitions);
            }
        });
    }
}
