//! Aggregating several versioned values into one.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use indexmap::IndexMap;
use parking_lot::Mutex;

use rill_core::fx::{self, combine_latest};
use rill_core::{Context, Exit, FxRef, Payload};

use super::{Versioned, VersionedSource};

/// Monotonic version for an aggregate.
///
/// Bumps whenever the vector of component versions differs from the last
/// one observed. Summing component versions would let two different states
/// share a version (one component up, another down after a reset).
#[derive(Default)]
struct AggregateVersion {
    state: Mutex<(Vec<u64>, u64)>,
}

impl AggregateVersion {
    fn observe(&self, components: Vec<u64>) -> u64 {
        let mut state = self.state.lock();
        if state.1 == 0 || state.0 != components {
            state.0 = components;
            state.1 += 1;
        }
        state.1
    }
}

struct Tuple<A: Payload, B: Payload, E: Payload> {
    members: Vec<Versioned<A, B, E>>,
    changes: FxRef<Vec<A>, E>,
    version: AggregateVersion,
}

#[async_trait]
impl<A: Payload, B: Payload, E: Payload> VersionedSource<Vec<A>, Vec<B>, E> for Tuple<A, B, E> {
    async fn version(&self, cx: &Context) -> u64 {
        let components = join_all(self.members.iter().map(|member| member.version(cx))).await;
        self.version.observe(components)
    }

    fn changes(&self) -> FxRef<Vec<A>, E> {
        self.changes.clone()
    }

    async fn current(&self, cx: &Context) -> Exit<Vec<B>, E> {
        try_join_all(self.members.iter().map(|member| member.current(cx))).await
    }
}

/// Combine values positionally. Changes emit once every member has emitted,
/// then on every member change; pulls read every member.
pub fn tuple<A, B, E>(members: Vec<Versioned<A, B, E>>) -> Versioned<Vec<A>, Vec<B>, E>
where
    A: Payload,
    B: Payload,
    E: Payload,
{
    let changes = combine_latest(members.iter().map(Versioned::changes).collect());
    Versioned::new(Tuple {
        members,
        changes,
        version: AggregateVersion::default(),
    })
}

fn zip_keys<T>(keys: &[String], values: Vec<T>) -> IndexMap<String, T> {
    keys.iter().cloned().zip(values).collect()
}

/// Combine values by name, preserving the map's order.
pub fn struct_of<A, B, E>(
    members: IndexMap<String, Versioned<A, B, E>>,
) -> Versioned<IndexMap<String, A>, IndexMap<String, B>, E>
where
    A: Payload,
    B: Payload,
    E: Payload,
{
    let keys: Arc<Vec<String>> = Arc::new(members.keys().cloned().collect());
    let change_keys = keys.clone();
    tuple(members.into_values().collect()).transform(
        move |changes| fx::map(changes, move |values| zip_keys(&change_keys, values)),
        move |outcome, _cx| {
            let keys = keys.clone();
            async move { outcome.map(|values| zip_keys(&keys, values)) }
        },
    )
}
