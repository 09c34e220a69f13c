//! In-memory storage backend.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use ed25519_dalek::VerifyingKey;

use crate::common::{CompositeKey, Entry, Id, LocationDomain, LocationDomainContent};

use super::Storage;

#[derive(Debug, Default)]
struct Timeouts {
    by_expiration: BTreeMap<u64, BTreeSet<CompositeKey>>,
    by_key: HashMap<CompositeKey, u64>,
}

#[derive(Debug, Default)]
struct Protection {
    domains: HashMap<LocationDomain, VerifyingKey>,
    removed_domains: HashSet<Id>,
    entries: HashMap<LocationDomainContent, VerifyingKey>,
}

#[derive(Debug, Default)]
/// Both directions live behind one lock, so a peer never outlives its last location.
struct Responsibilities {
    by_location: HashMap<Id, BTreeSet<Id>>,
    by_peer: HashMap<Id, BTreeSet<Id>>,
}

#[derive(Debug, Default)]
/// [Storage] keeping everything in maps, each behind its own lock.
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<CompositeKey, Entry>>,
    timeouts: RwLock<Timeouts>,
    protection: RwLock<Protection>,
    responsibilities: RwLock<Responsibilities>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of all stored entries.
    pub fn snapshot(&self) -> BTreeMap<CompositeKey, Entry> {
        read(&self.entries).clone()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Storage for MemoryStorage {
    fn put(&self, key: CompositeKey, entry: Entry) -> bool {
        write(&self.entries).insert(key, entry);
        true
    }

    fn get(&self, key: &CompositeKey) -> Option<Entry> {
        read(&self.entries).get(key).cloned()
    }

    fn contains(&self, key: &CompositeKey) -> bool {
        read(&self.entries).contains_key(key)
    }

    fn remove(&self, key: &CompositeKey, return_data: bool) -> Option<Entry> {
        let removed = write(&self.entries).remove(key);

        if return_data {
            removed
        } else {
            None
        }
    }

    fn sub_map(
        &self,
        from: &CompositeKey,
        to: &CompositeKey,
        limit: Option<usize>,
        ascending: bool,
    ) -> BTreeMap<CompositeKey, Entry> {
        if from > to {
            return BTreeMap::new();
        }

        let entries = read(&self.entries);
        let range = entries.range(from..=to);
        let limit = limit.unwrap_or(usize::MAX);

        if ascending {
            range
                .take(limit)
                .map(|(key, entry)| (*key, entry.clone()))
                .collect()
        } else {
            range
                .rev()
                .take(limit)
                .map(|(key, entry)| (*key, entry.clone()))
                .collect()
        }
    }

    fn remove_range(&self, from: &CompositeKey, to: &CompositeKey) -> BTreeMap<CompositeKey, Entry> {
        if from > to {
            return BTreeMap::new();
        }

        let mut entries = write(&self.entries);

        let keys: Vec<CompositeKey> = entries.range(from..=to).map(|(key, _)| *key).collect();

        keys.into_iter()
            .filter_map(|key| entries.remove(&key).map(|entry| (key, entry)))
            .collect()
    }

    fn is_location_empty(&self, location: &Id) -> bool {
        read(&self.entries)
            .range(CompositeKey::first_of_location(*location)..=CompositeKey::last_of_location(*location))
            .next()
            .is_none()
    }

    fn len(&self) -> usize {
        read(&self.entries).len()
    }

    // === Timeouts ===

    fn add_timeout(&self, key: CompositeKey, expiration_millis: u64) {
        let mut timeouts = write(&self.timeouts);

        if let Some(previous) = timeouts.by_key.insert(key, expiration_millis) {
            remove_expiration(&mut timeouts.by_expiration, previous, &key);
        }

        timeouts
            .by_expiration
            .entry(expiration_millis)
            .or_default()
            .insert(key);
    }

    fn remove_timeout(&self, key: &CompositeKey) {
        let mut timeouts = write(&self.timeouts);

        if let Some(expiration) = timeouts.by_key.remove(key) {
            remove_expiration(&mut timeouts.by_expiration, expiration, key);
        }
    }

    fn expired(&self, now_millis: u64) -> Vec<CompositeKey> {
        read(&self.timeouts)
            .by_expiration
            .range(..=now_millis)
            .flat_map(|(_, keys)| keys.iter().copied())
            .collect()
    }

    // === Protection ===

    fn protect_domain(&self, key: LocationDomain, owner: VerifyingKey) -> bool {
        let mut protection = write(&self.protection);

        if protection.removed_domains.contains(&key.domain) {
            return false;
        }

        protection.domains.insert(key, owner);
        true
    }

    fn domain_owner(&self, key: &LocationDomain) -> Option<VerifyingKey> {
        read(&self.protection).domains.get(key).copied()
    }

    fn unprotect_domain(&self, domain: Id) {
        let mut protection = write(&self.protection);

        protection.domains.retain(|key, _| key.domain != domain);
        protection.removed_domains.insert(domain);
    }

    fn is_domain_removed(&self, domain: &Id) -> bool {
        read(&self.protection).removed_domains.contains(domain)
    }

    fn protect_entry(&self, key: LocationDomainContent, owner: VerifyingKey) -> bool {
        write(&self.protection).entries.insert(key, owner);
        true
    }

    fn entry_owner(&self, key: &LocationDomainContent) -> Option<VerifyingKey> {
        read(&self.protection).entries.get(key).copied()
    }

    // === Responsibility ===

    fn update_responsibility(&self, location: Id, peer: Id) -> bool {
        let mut responsibilities = write(&self.responsibilities);

        let is_new = responsibilities
            .by_location
            .entry(location)
            .or_default()
            .insert(peer);
        responsibilities
            .by_peer
            .entry(peer)
            .or_default()
            .insert(location);

        is_new
    }

    fn responsible_peers(&self, location: &Id) -> BTreeSet<Id> {
        read(&self.responsibilities)
            .by_location
            .get(location)
            .cloned()
            .unwrap_or_default()
    }

    fn locations_for_peer(&self, peer: &Id) -> BTreeSet<Id> {
        read(&self.responsibilities)
            .by_peer
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    fn remove_responsibility(&self, location: &Id) -> BTreeSet<Id> {
        let mut responsibilities = write(&self.responsibilities);

        let peers = responsibilities
            .by_location
            .remove(location)
            .unwrap_or_default();

        for peer in &peers {
            remove_from_index(&mut responsibilities.by_peer, peer, location);
        }

        peers
    }

    fn remove_responsibility_of(&self, location: &Id, peer: &Id) -> bool {
        let mut responsibilities = write(&self.responsibilities);

        let removed = remove_from_index(&mut responsibilities.by_location, location, peer);
        remove_from_index(&mut responsibilities.by_peer, peer, location);

        removed
    }
}

fn remove_expiration(
    by_expiration: &mut BTreeMap<u64, BTreeSet<CompositeKey>>,
    expiration: u64,
    key: &CompositeKey,
) {
    if let Some(keys) = by_expiration.get_mut(&expiration) {
        keys.remove(key);

        if keys.is_empty() {
            by_expiration.remove(&expiration);
        }
    }
}

/// Remove `value` from the set at `key`, dropping the set once empty.
fn remove_from_index(index: &mut HashMap<Id, BTreeSet<Id>>, key: &Id, value: &Id) -> bool {
    let Some(values) = index.get_mut(key) else {
        return false;
    };

    let removed = values.remove(value);

    if values.is_empty() {
        index.remove(key);
    }

    removed
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(location: u64, version: u64) -> CompositeKey {
        CompositeKey::new(Id::from(location), Id::ZERO, Id::ZERO, Id::from(version))
    }

    #[test]
    fn sub_map_limit_and_direction() {
        let storage = MemoryStorage::new();

        for version in 1..=5 {
            storage.put(key(1, version), Entry::new(vec![version as u8]));
        }

        let ascending = storage.sub_map(&key(1, 0), &key(1, 10), Some(2), true);
        assert_eq!(ascending.keys().copied().collect::<Vec<_>>(), vec![key(1, 1), key(1, 2)]);

        let descending = storage.sub_map(&key(1, 0), &key(1, 10), Some(2), false);
        assert_eq!(descending.keys().copied().collect::<Vec<_>>(), vec![key(1, 4), key(1, 5)]);

        assert!(storage.sub_map(&key(1, 10), &key(1, 0), None, true).is_empty());
    }

    #[test]
    fn timeouts() {
        let storage = MemoryStorage::new();

        storage.add_timeout(key(1, 1), 100);
        storage.add_timeout(key(1, 2), 200);
        storage.add_timeout(key(1, 1), 300);

        assert_eq!(storage.expired(250), vec![key(1, 2)]);

        storage.remove_timeout(&key(1, 2));
        assert!(storage.expired(250).is_empty());
        assert_eq!(storage.expired(300), vec![key(1, 1)]);
    }

    #[test]
    fn responsibility_index_is_bidirectional() {
        let storage = MemoryStorage::new();
        let (a, b) = (Id::from(1), Id::from(2));
        let peer = Id::from(9);

        assert!(storage.update_responsibility(a, peer));
        assert!(!storage.update_responsibility(a, peer));
        storage.update_responsibility(b, peer);

        assert_eq!(storage.locations_for_peer(&peer), BTreeSet::from([a, b]));

        storage.remove_responsibility(&a);
        assert_eq!(storage.locations_for_peer(&peer), BTreeSet::from([b]));

        storage.remove_responsibility(&b);
        assert!(storage.locations_for_peer(&peer).is_empty());
        assert!(read(&storage.responsibilities).by_peer.is_empty());
    }

    #[test]
    fn removed_domain_can_not_be_protected() {
        let storage = MemoryStorage::new();
        let owner = ed25519_dalek::SigningKey::from_bytes(&[3; 32]).verifying_key();
        let key = LocationDomain {
            location: Id::random(),
            domain: Id::random(),
        };

        assert!(storage.protect_domain(key, owner));
        storage.unprotect_domain(key.domain);

        assert_eq!(storage.domain_owner(&key), None);
        assert!(!storage.protect_domain(key, owner));
    }
}
