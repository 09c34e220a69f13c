//! The backend contract of the versioned store.
//!
//! A backend only stores; locking, protection policy, and version chains are
//! handled by [super::StorageLayer]. The in-memory [super::MemoryStorage] is the
//! reference implementation, a durable backend is a drop-in replacement.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
};

use ed25519_dalek::VerifyingKey;

use crate::common::{CompositeKey, Entry, Id, LocationDomain, LocationDomainContent};

pub trait Storage: Send + Sync + Debug {
    // === Entries ===

    /// Insert or replace an entry, returns `false` if the backend refused it.
    fn put(&self, key: CompositeKey, entry: Entry) -> bool;

    fn get(&self, key: &CompositeKey) -> Option<Entry>;

    fn contains(&self, key: &CompositeKey) -> bool;

    fn remove(&self, key: &CompositeKey, return_data: bool) -> Option<Entry>;

    /// Entries in `from..=to`, at most `limit` of them, starting from the
    /// lowest key if `ascending`, from the highest otherwise.
    ///
    /// The result is always sorted by key.
    fn sub_map(
        &self,
        from: &CompositeKey,
        to: &CompositeKey,
        limit: Option<usize>,
        ascending: bool,
    ) -> BTreeMap<CompositeKey, Entry>;

    /// Remove every entry in `from..=to` and return them.
    fn remove_range(&self, from: &CompositeKey, to: &CompositeKey) -> BTreeMap<CompositeKey, Entry>;

    /// Returns `true` if nothing is stored under `location`.
    fn is_location_empty(&self, location: &Id) -> bool;

    /// Number of stored entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // === Timeouts ===

    fn add_timeout(&self, key: CompositeKey, expiration_millis: u64);

    fn remove_timeout(&self, key: &CompositeKey);

    /// Keys whose expiration is at or before `now_millis`.
    fn expired(&self, now_millis: u64) -> Vec<CompositeKey>;

    // === Protection ===

    /// Make `owner` the protector of a domain, returns `false` if refused.
    fn protect_domain(&self, key: LocationDomain, owner: VerifyingKey) -> bool;

    fn domain_owner(&self, key: &LocationDomain) -> Option<VerifyingKey>;

    /// Mark a domain as explicitly unprotected. It can never be claimed again.
    fn unprotect_domain(&self, domain: Id);

    fn is_domain_removed(&self, domain: &Id) -> bool;

    fn protect_entry(&self, key: LocationDomainContent, owner: VerifyingKey) -> bool;

    fn entry_owner(&self, key: &LocationDomainContent) -> Option<VerifyingKey>;

    /// Protected by a stored owner key that is not `public_key`.
    fn is_domain_protected_by_others(
        &self,
        key: &LocationDomain,
        public_key: Option<&VerifyingKey>,
    ) -> bool {
        match self.domain_owner(key) {
            Some(owner) => Some(&owner) != public_key,
            None => false,
        }
    }

    /// Protected by a stored owner key that is not `public_key`.
    fn is_entry_protected_by_others(
        &self,
        key: &LocationDomainContent,
        public_key: Option<&VerifyingKey>,
    ) -> bool {
        match self.entry_owner(key) {
            Some(owner) => Some(&owner) != public_key,
            None => false,
        }
    }

    // === Responsibility ===

    /// Record `peer` as responsible for `location`, returns `true` if it wasn't already.
    fn update_responsibility(&self, location: Id, peer: Id) -> bool;

    fn responsible_peers(&self, location: &Id) -> BTreeSet<Id>;

    fn locations_for_peer(&self, peer: &Id) -> BTreeSet<Id>;

    /// Drop the responsibility record of `location`, returns the peers it had.
    fn remove_responsibility(&self, location: &Id) -> BTreeSet<Id>;

    /// Drop `peer` from the responsibility record of `location`.
    fn remove_responsibility_of(&self, location: &Id, peer: &Id) -> bool;
}
