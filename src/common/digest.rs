//! Compact summaries of stored keys, exchanged instead of full payloads.

use std::collections::{btree_map, BTreeMap, BTreeSet};

use crate::common::{CompositeKey, Id};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
/// Every live key of a selection mapped to the versions it is based on.
///
/// Remote peers compare digests to find the versions they are missing.
pub struct Digest {
    keys: BTreeMap<CompositeKey, BTreeSet<Id>>,
}

impl Digest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: CompositeKey, based_on: BTreeSet<Id>) {
        self.keys.insert(key, based_on);
    }

    /// Add all keys of `other`.
    pub fn merge(&mut self, other: &Digest) {
        for (key, based_on) in &other.keys {
            self.keys.insert(*key, based_on.clone());
        }
    }

    // === Getters ===

    pub fn size(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &CompositeKey) -> bool {
        self.keys.contains_key(key)
    }

    pub fn based_on(&self, key: &CompositeKey) -> Option<&BTreeSet<Id>> {
        self.keys.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &CompositeKey> {
        self.keys.keys()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, CompositeKey, BTreeSet<Id>> {
        self.keys.iter()
    }

    /// XOR of all version ids, cheap to compare between two peers.
    pub fn key_digest(&self) -> Id {
        self.keys
            .keys()
            .fold(Id::ZERO, |acc, key| acc.xor(&key.version))
    }
}

impl FromIterator<(CompositeKey, BTreeSet<Id>)> for Digest {
    fn from_iter<T: IntoIterator<Item = (CompositeKey, BTreeSet<Id>)>>(iter: T) -> Self {
        Self {
            keys: iter.into_iter().collect(),
        }
    }
}
