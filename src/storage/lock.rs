//! Key-striped scoped locks.
//!
//! A lock is taken on a key and released when the returned guard is dropped.
//! Keys that [Conflicts::conflicts] with a key held by another thread wait
//! until it is released, other keys proceed concurrently. The holding thread
//! itself may lock conflicting keys again, so callbacks running under a lock
//! can call back into the store.

use std::{
    fmt::Debug,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
};

use tracing::trace;

use crate::common::{CompositeKey, Id, LocationDomain, LocationDomainContent};

/// Decides which held keys a new lock has to wait for.
pub trait Conflicts {
    fn conflicts(&self, other: &Self) -> bool;
}

impl Conflicts for Id {
    fn conflicts(&self, other: &Self) -> bool {
        self == other
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// A lock stripe of the versioned store, from the whole store down to a single key.
pub enum LockKey {
    Store,
    Location(Id),
    LocationDomain(LocationDomain),
    LocationDomainContent(LocationDomainContent),
    Key(CompositeKey),
}

impl LockKey {
    /// The coarsest stripe that still isolates every key in `from..=to`.
    ///
    /// Identical bounds lock a single key, bounds differing only in version lock
    /// the `(location, domain, content)` stripe, bounds differing in content lock
    /// `(location, domain)`, and bounds differing in domain lock the location.
    /// Ranges spanning locations lock the whole store.
    pub fn covering(from: &CompositeKey, to: &CompositeKey) -> LockKey {
        if from.location != to.location {
            LockKey::Store
        } else if from.domain != to.domain {
            LockKey::Location(from.location)
        } else if from.content != to.content {
            LockKey::LocationDomain(from.location_domain())
        } else if from.version != to.version {
            LockKey::LocationDomainContent(from.location_domain_content())
        } else {
            LockKey::Key(*from)
        }
    }

    fn components(&self) -> [Option<&Id>; 4] {
        match self {
            LockKey::Store => [None, None, None, None],
            LockKey::Location(location) => [Some(location), None, None, None],
            LockKey::LocationDomain(key) => [Some(&key.location), Some(&key.domain), None, None],
            LockKey::LocationDomainContent(key) => [
                Some(&key.location),
                Some(&key.domain),
                Some(&key.content),
                None,
            ],
            LockKey::Key(key) => [
                Some(&key.location),
                Some(&key.domain),
                Some(&key.content),
                Some(&key.version),
            ],
        }
    }
}

impl Conflicts for LockKey {
    /// Two stripes conflict if one contains the other.
    fn conflicts(&self, other: &Self) -> bool {
        self.components()
            .iter()
            .zip(other.components().iter())
            .all(|pair| match pair {
                (Some(a), Some(b)) => a == b,
                _ => true,
            })
    }
}

#[derive(Debug)]
/// A set of currently held keys, and the threads holding them.
pub struct KeyLocks<K> {
    held: Mutex<Vec<(K, ThreadId)>>,
    released: Condvar,
}

impl<K> Default for KeyLocks<K> {
    fn default() -> Self {
        Self {
            held: Mutex::new(Vec::new()),
            released: Condvar::new(),
        }
    }
}

impl<K: Conflicts + PartialEq + Clone + Debug> KeyLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no other thread holds a conflicting key, then hold `key`
    /// until the guard drops.
    ///
    /// Reentrant: keys held by the calling thread never block it.
    pub fn lock(&self, key: K) -> KeyGuard<'_, K> {
        let owner = thread::current().id();
        let mut held = self.held();

        while held
            .iter()
            .any(|(h, holder)| *holder != owner && h.conflicts(&key))
        {
            trace!(?key, "Waiting for lock");
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }

        held.push((key.clone(), owner));

        KeyGuard {
            locks: self,
            key,
            owner,
        }
    }

    /// Number of held keys.
    pub fn held_count(&self) -> usize {
        self.held().len()
    }

    fn held(&self) -> MutexGuard<'_, Vec<(K, ThreadId)>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, key: &K, owner: ThreadId) {
        let mut held = self.held();

        if let Some(index) = held
            .iter()
            .position(|(h, holder)| h == key && *holder == owner)
        {
            held.swap_remove(index);
        }

        drop(held);
        self.released.notify_all();
    }
}

#[derive(Debug)]
/// Releases its key when dropped.
pub struct KeyGuard<'a, K: Conflicts + PartialEq + Clone + Debug> {
    locks: &'a KeyLocks<K>,
    key: K,
    owner: ThreadId,
}

impl<K: Conflicts + PartialEq + Clone + Debug> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        self.locks.release(&self.key, self.owner);
    }
}
