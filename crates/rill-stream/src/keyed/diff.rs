//! Key-sequence diffing.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// How one key changed between two sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change<K> {
    /// Present only in the next sequence.
    Added { key: K, index: usize },
    /// Present only in the previous sequence.
    Removed { key: K, index: usize },
    /// Present in both, at the same position.
    Updated { key: K, index: usize },
    /// Present in both, at a different position.
    Moved { key: K, from: usize, to: usize },
}

impl<K> Change<K> {
    /// Key this change applies to.
    pub fn key(&self) -> &K {
        match self {
            Self::Added { key, .. }
            | Self::Removed { key, .. }
            | Self::Updated { key, .. }
            | Self::Moved { key, .. } => key,
        }
    }

    /// Whether the change alters membership or order.
    /// Whether any key was added, removed or moved.
    pub fn is_structural(&self) -> bool {
        !matches!(self, Self::Updated { .. })
    }
}

/// Every change between two key sequences.
///
/// Removals come first, in previous-sequence order, followed by one change
/// per key of the next sequence, in next-sequence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff<K> {
    pub changes: Vec<Change<K>>,
}

impl<K> Diff<K> {
    pub fn is_structural(&self) -> bool {
        self.changes.iter().any(Change::is_structural)
    }

    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Diff two key sequences. Keys are expected to be unique within each.
pub fn diff<K: Eq + Hash + Clone>(previous: &[K], next: &[K]) -> Diff<K> {
    let previous_index: HashMap<&K, usize> = previous
        .iter()
        .enumerate()
        .map(|(index, key)| (key, index))
        .collect();
    let next_keys: HashSet<&K> = next.iter().collect();

    let mut changes = Vec::with_capacity(previous.len().max(next.len()));
    for (index, key) in previous.iter().enumerate() {
        if !next_keys.contains(key) {
            changes.push(Change::Removed {
                key: key.clone(),
                index,
            });
        }
    }
    for (index, key) in next.iter().enumerate() {
        let change = match previous_index.get(key) {
            None => Change::Added {
                key: key.clone(),
                index,
            },
            Some(&from) if from == index => Change::Updated {
                key: key.clone(),
                index,
            },
            Some(&from) => Change::Moved {
                key: key.clone(),
                from,
                to: index,
            },
        };
        changes.push(change);
    }
    Diff { changes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_classifies_each_kind() {
        let d = diff(&[1, 2, 3], &[3, 2, 4]);
        assert_eq!(
            d.changes,
            vec![
                Change::Removed { key: 1, index: 0 },
                Change::Moved {
                    key: 3,
                    from: 2,
                    to: 0
                },
                Change::Updated { key: 2, index: 1 },
                Change::Added { key: 4, index: 2 },
            ]
        );
        assert!(d.is_structural());
    }

    #[test]
    fn test_same_sequence_is_updates_only() {
        let d = diff(&["a", "b"], &["a", "b"]);
        assert!(!d.is_structural());
        assert_eq!(d.changes.len(), 2);
    }

    #[test]
    fn test_empty_sequences() {
        assert!(diff::<u8>(&[], &[]).is_empty());
        assert_eq!(
            diff(&[7], &[]).changes,
            vec![Change::Removed { key: 7, index: 0 }]
        );
    }

    fn unique_keys() -> impl Strategy<Value = Vec<u8>> {
        proptest::collection::hash_set(0u8..32, 0..12).prop_map(|set| set.into_iter().collect())
    }

    proptest! {
        #[test]
        fn prop_every_key_is_accounted_for(previous in unique_keys(), next in unique_keys()) {
            let d = diff(&previous, &next);
            let removed: HashSet<u8> = d.changes.iter()
                .filter(|c| matches!(c, Change::Removed { .. }))
                .map(|c| *c.key())
                .collect();
            let kept: Vec<u8> = d.changes.iter()
                .filter(|c| !matches!(c, Change::Removed { .. }))
                .map(|c| *c.key())
                .collect();

            prop_assert_eq!(&kept, &next);
            for key in &previous {
                prop_assert_eq!(removed.contains(key), !next.contains(key));
            }
            for change in &d.changes {
                if let Change::Moved { from, to, .. } = change {
                    prop_assert_ne!(from, to);
                }
            }
        }
    }
}
