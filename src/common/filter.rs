//! Membership filters used to select content and version keys.

use std::{collections::BTreeSet, fmt::Debug};

use crate::common::Id;

/// A set membership test over ids, usually a bloom filter built by the caller.
///
/// False positives are allowed, false negatives are not.
pub trait KeyFilter: Send + Sync + Debug {
    fn contains(&self, id: &Id) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Exact [KeyFilter] backed by a set.
pub struct KeySet(BTreeSet<Id>);

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: Id) {
        self.0.insert(id);
    }
}

impl FromIterator<Id> for KeySet {
    fn from_iter<T: IntoIterator<Item = Id>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl KeyFilter for KeySet {
    fn contains(&self, id: &Id) -> bool {
        self.0.contains(id)
    }
}
