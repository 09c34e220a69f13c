//! Versioned store: protection checks, version chains and lock striping over a [Storage] backend.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
};

use ed25519_dalek::VerifyingKey;
use tracing::{debug, trace};

use crate::common::{
    now_millis, CompositeKey, Digest, Entry, Id, KeyFilter, LocationDomain, LocationDomainContent,
    MetaUpdate, PutOutcome,
};

use super::{
    lock::{KeyLocks, LockKey},
    protection::{can_override, can_protect, ProtectionConfig},
    MemoryStorage, Storage,
};

/// Observes changes of the responsibility index.
///
/// Listeners are handed to [StorageLayer::with_listener] by whoever owns the
/// store, replication for example.
pub trait ResponsibilityListener: Send + Sync + Debug {
    /// `peer` became responsible for `location`.
    fn gained(&self, location: &Id, peer: &Id);

    /// `peers` are no longer responsible for `location`.
    fn lost(&self, location: &Id, peers: &BTreeSet<Id>);
}

#[derive(Debug)]
/// A thread safe versioned key/value store.
pub struct StorageLayer {
    backend: Box<dyn Storage>,
    protection: ProtectionConfig,
    /// Data stripes, see [LockKey].
    data_locks: KeyLocks<LockKey>,
    /// Responsibility stripes, always taken peer first, then location.
    peer_locks: KeyLocks<Id>,
    location_locks: KeyLocks<Id>,
    listeners: Vec<Box<dyn ResponsibilityListener>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Claim {
    Denied,
    Allowed { protect: bool },
}

impl Default for StorageLayer {
    fn default() -> Self {
        Self::new(Box::new(MemoryStorage::new()), ProtectionConfig::default())
    }
}

impl StorageLayer {
    pub fn new(backend: Box<dyn Storage>, protection: ProtectionConfig) -> Self {
        Self {
            backend,
            protection,
            data_locks: KeyLocks::new(),
            peer_locks: KeyLocks::new(),
            location_locks: KeyLocks::new(),
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Box<dyn ResponsibilityListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    // === Getters ===

    pub fn backend(&self) -> &dyn Storage {
        self.backend.as_ref()
    }

    pub fn protection(&self) -> &ProtectionConfig {
        &self.protection
    }

    // === Writes ===

    /// Store `entry` at `key` on behalf of `public_key`.
    ///
    /// Returns [PutOutcome::VersionFork] if the entry was stored but its
    /// `(location, domain, content)` now has more than one latest version.
    pub fn put(
        &self,
        key: CompositeKey,
        entry: Entry,
        public_key: Option<&VerifyingKey>,
        put_if_absent: bool,
        claim_domain_protection: bool,
    ) -> PutOutcome {
        let _guard = self
            .data_locks
            .lock(LockKey::LocationDomainContent(key.location_domain_content()));

        let domain_claim =
            self.check_domain(&key.location_domain(), public_key, claim_domain_protection);
        if domain_claim == Claim::Denied {
            debug!(?key, "Put rejected, domain is protected");
            return PutOutcome::FailedSecurity;
        }

        let entry_owner = entry.owner().or(public_key).copied();
        let entry_claim = self.check_entry(
            &key.location_domain_content(),
            public_key,
            entry_owner.as_ref(),
            entry.is_protected_entry(),
        );
        if entry_claim == Claim::Denied {
            debug!(?key, "Put rejected, entry is protected");
            return PutOutcome::FailedSecurity;
        }

        if let Some(existing) = self.backend.get(&key) {
            if put_if_absent {
                return PutOutcome::FailedNotAbsent;
            }
            if existing.is_deleted() {
                return PutOutcome::Deleted;
            }
        }

        let expiration = entry.expiration_millis();
        let prepared = entry.is_prepared();

        if !self.backend.put(key, entry) {
            return PutOutcome::Failed;
        }

        match expiration {
            Some(expiration) => self.backend.add_timeout(key, expiration),
            None => self.backend.remove_timeout(&key),
        }

        // Claims were checked under the lock, so granting them can't race.
        if let (Claim::Allowed { protect: true }, Some(owner)) = (domain_claim, public_key) {
            self.backend.protect_domain(key.location_domain(), *owner);
        }
        if let (Claim::Allowed { protect: true }, Some(owner)) = (entry_claim, entry_owner) {
            self.backend
                .protect_entry(key.location_domain_content(), owner);
        }

        let versions = self
            .backend
            .sub_map(&key.min_version(), &key.max_version(), None, true);
        let latest = latest_versions(versions.iter());

        if latest.len() > 1 {
            debug!(?key, latest = latest.len(), "Put created a version fork");
            return PutOutcome::VersionFork;
        }

        trace!(?key, prepared, "Stored entry");

        if prepared {
            PutOutcome::OkPrepared
        } else {
            PutOutcome::Ok
        }
    }

    /// Update the metadata of a stored entry in place.
    pub fn update_meta(
        &self,
        public_key: Option<&VerifyingKey>,
        key: CompositeKey,
        meta: &MetaUpdate,
    ) -> PutOutcome {
        let _guard = self.data_locks.lock(LockKey::Key(key));

        if !self.can_claim_entry(&key.location_domain_content(), public_key) {
            return PutOutcome::FailedSecurity;
        }

        let Some(mut entry) = self.backend.get(&key) else {
            return PutOutcome::NotFound;
        };

        entry.apply_meta(meta);
        self.store_updated(key, entry);

        // An owned entry changes hands.
        if let Some(owner) = meta.owner {
            if meta.claims_protection()
                && self
                    .backend
                    .entry_owner(&key.location_domain_content())
                    .is_some()
            {
                self.backend
                    .protect_entry(key.location_domain_content(), owner);
            }
        }

        PutOutcome::Ok
    }

    /// Confirm a prepared entry, making it visible to readers.
    pub fn put_confirm(
        &self,
        public_key: Option<&VerifyingKey>,
        key: CompositeKey,
        meta: &MetaUpdate,
    ) -> PutOutcome {
        let _guard = self.data_locks.lock(LockKey::Key(key));

        if !self.can_claim_entry(&key.location_domain_content(), public_key) {
            return PutOutcome::FailedSecurity;
        }

        let Some(mut entry) = self.backend.get(&key) else {
            return PutOutcome::NotFound;
        };

        entry.apply_meta(meta);
        entry.confirm();
        self.store_updated(key, entry);

        PutOutcome::Ok
    }

    /// Remove a single entry.
    pub fn remove(
        &self,
        key: &CompositeKey,
        public_key: Option<&VerifyingKey>,
        return_data: bool,
    ) -> (Option<Entry>, PutOutcome) {
        let _guard = self.data_locks.lock(LockKey::Key(*key));

        if !self.can_claim_domain(&key.location_domain(), public_key)
            || !self.can_claim_entry(&key.location_domain_content(), public_key)
        {
            debug!(?key, "Remove rejected, protected by others");
            return (None, PutOutcome::FailedSecurity);
        }

        if !self.backend.contains(key) {
            return (None, PutOutcome::NotFound);
        }

        self.backend.remove_timeout(key);
        let removed = self.backend.remove(key, return_data);

        (removed, PutOutcome::Ok)
    }

    /// Remove every entry in `from..=to`, or nothing at all if any of them
    /// can't be removed by `public_key`.
    pub fn remove_range(
        &self,
        from: &CompositeKey,
        to: &CompositeKey,
        public_key: Option<&VerifyingKey>,
    ) -> Option<BTreeMap<CompositeKey, Entry>> {
        let _guard = self.data_locks.lock(LockKey::covering(from, to));

        let keys = self.backend.sub_map(from, to, None, true);

        if let Some(key) = keys.keys().find(|key| {
            !self.can_claim_domain(&key.location_domain(), public_key)
                || !self.can_claim_entry(&key.location_domain_content(), public_key)
        }) {
            debug!(?key, ?from, ?to, "Range remove aborted, key protected by others");
            return None;
        }

        let removed = self.backend.remove_range(from, to);

        for key in removed.keys() {
            self.backend.remove_timeout(key);
        }

        Some(removed)
    }

    /// Mark a domain as explicitly unprotected, it can not be claimed again.
    pub fn unprotect_domain(&self, domain: Id) {
        self.backend.unprotect_domain(domain);
    }

    // === Reads ===

    /// Returns the entry at `key`, unless it is still prepared.
    pub fn get(&self, key: &CompositeKey) -> Option<Entry> {
        let _guard = self.data_locks.lock(LockKey::Key(*key));

        self.backend.get(key).filter(|entry| !entry.is_prepared())
    }

    pub fn get_keys(&self, keys: &BTreeSet<CompositeKey>) -> BTreeMap<CompositeKey, Entry> {
        keys.iter()
            .filter_map(|key| self.get(key).map(|entry| (*key, entry)))
            .collect()
    }

    /// Visible entries in `from..=to`.
    pub fn get_range(
        &self,
        from: &CompositeKey,
        to: &CompositeKey,
        limit: Option<usize>,
        ascending: bool,
    ) -> BTreeMap<CompositeKey, Entry> {
        let _guard = self.data_locks.lock(LockKey::covering(from, to));

        let visible = self
            .backend
            .sub_map(from, to, None, true)
            .into_iter()
            .filter(|(_, entry)| !entry.is_prepared());

        limit_map(visible, limit, ascending)
    }

    /// Visible entries of a `(location, domain)` selected by content and version filters.
    ///
    /// With `filter_and`, a key is kept if every given filter contains it,
    /// otherwise it is kept if none of them does.
    #[allow(clippy::too_many_arguments)]
    pub fn get_filtered(
        &self,
        location: Id,
        domain: Id,
        content_filter: Option<&dyn KeyFilter>,
        version_filter: Option<&dyn KeyFilter>,
        limit: Option<usize>,
        ascending: bool,
        filter_and: bool,
    ) -> BTreeMap<CompositeKey, Entry> {
        let key = LocationDomain { location, domain };
        let _guard = self.data_locks.lock(LockKey::LocationDomain(key));

        let visible = self
            .backend
            .sub_map(
                &CompositeKey::first_of_domain(location, domain),
                &CompositeKey::last_of_domain(location, domain),
                None,
                true,
            )
            .into_iter()
            .filter(|(_, entry)| !entry.is_prepared())
            .filter(|(key, _)| matches_filters(key, content_filter, version_filter, filter_and));

        limit_map(visible, limit, ascending)
    }

    /// All latest versions of `key`'s `(location, domain, content)`.
    ///
    /// More than one version means the chain is forked.
    pub fn get_latest_version(&self, key: &CompositeKey) -> BTreeMap<CompositeKey, Entry> {
        let _guard = self
            .data_locks
            .lock(LockKey::LocationDomainContent(key.location_domain_content()));

        let versions = self
            .backend
            .sub_map(&key.min_version(), &key.max_version(), None, true);

        latest_versions(versions.iter().filter(|(_, entry)| !entry.is_prepared()))
            .into_iter()
            .filter(|(_, entry)| !entry.is_deleted())
            .collect()
    }

    // === Digests ===

    pub fn digest_range(
        &self,
        from: &CompositeKey,
        to: &CompositeKey,
        limit: Option<usize>,
        ascending: bool,
    ) -> Digest {
        let _guard = self.data_locks.lock(LockKey::covering(from, to));

        let live = self
            .backend
            .sub_map(from, to, None, true)
            .into_iter()
            .filter(|(_, entry)| is_live(entry));

        to_digest(limit_map(live, limit, ascending))
    }

    pub fn digest_keys(&self, keys: &BTreeSet<CompositeKey>) -> Digest {
        keys.iter()
            .filter_map(|key| {
                let _guard = self.data_locks.lock(LockKey::Key(*key));

                self.backend
                    .get(key)
                    .filter(is_live)
                    .map(|entry| (*key, entry.based_on().clone()))
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn digest_filtered(
        &self,
        location: Id,
        domain: Id,
        content_filter: Option<&dyn KeyFilter>,
        version_filter: Option<&dyn KeyFilter>,
        limit: Option<usize>,
        ascending: bool,
        filter_and: bool,
    ) -> Digest {
        let entries = self.get_filtered(
            location,
            domain,
            content_filter,
            version_filter,
            limit,
            ascending,
            filter_and,
        );

        to_digest(entries.into_iter().filter(|(_, entry)| !entry.is_deleted()))
    }

    // === Expiry ===

    /// Remove expired entries, see [Self::check_timeout_at].
    pub fn check_timeout(&self) -> Vec<CompositeKey> {
        self.check_timeout_at(now_millis())
    }

    /// Remove every entry that expired at or before `now_millis`, and drop the
    /// responsibility record of locations left empty.
    ///
    /// Returns the removed keys.
    pub fn check_timeout_at(&self, now_millis: u64) -> Vec<CompositeKey> {
        let mut removed = Vec::new();

        for key in self.backend.expired(now_millis) {
            {
                let _guard = self.data_locks.lock(LockKey::Key(key));

                match self.backend.get(&key) {
                    Some(entry)
                        if entry
                            .expiration_millis()
                            .map(|expiration| expiration <= now_millis)
                            .unwrap_or(false) =>
                    {
                        self.backend.remove(&key, false);
                        self.backend.remove_timeout(&key);
                        removed.push(key);
                    }
                    // Refreshed since it was listed.
                    Some(_) => continue,
                    None => {
                        self.backend.remove_timeout(&key);
                        continue;
                    }
                }
            }

            // Only the responsibility index may hold two stripes at once.
            let is_empty = {
                let _guard = self.data_locks.lock(LockKey::Location(key.location));
                self.backend.is_location_empty(&key.location)
            };

            if is_empty {
                self.remove_responsibility(&key.location);
            }
        }

        if !removed.is_empty() {
            debug!(count = removed.len(), "Removed expired entries");
        }

        removed
    }

    // === Responsibility ===

    /// Record `peer` as responsible for replicating `location`.
    ///
    /// Returns `true` if it wasn't already.
    pub fn update_responsibility(&self, location: Id, peer: Id) -> bool {
        let _peer = self.peer_locks.lock(peer);
        let _location = self.location_locks.lock(location);

        let is_new = self.backend.update_responsibility(location, peer);

        if is_new {
            for listener in &self.listeners {
                listener.gained(&location, &peer);
            }
        }

        is_new
    }

    pub fn responsible_peers(&self, location: &Id) -> BTreeSet<Id> {
        let _location = self.location_locks.lock(*location);

        self.backend.responsible_peers(location)
    }

    pub fn locations_for_peer(&self, peer: &Id) -> BTreeSet<Id> {
        let _peer = self.peer_locks.lock(*peer);

        self.backend.locations_for_peer(peer)
    }

    /// Drop the responsibility record of `location`.
    pub fn remove_responsibility(&self, location: &Id) -> BTreeSet<Id> {
        let _location = self.location_locks.lock(*location);

        let peers = self.backend.remove_responsibility(location);

        if !peers.is_empty() {
            trace!(?location, "Dropped responsibility");

            for listener in &self.listeners {
                listener.lost(location, &peers);
            }
        }

        peers
    }

    /// Drop a single peer from the responsibility record of `location`.
    pub fn remove_responsibility_of(&self, location: &Id, peer: &Id) -> bool {
        let _peer = self.peer_locks.lock(*peer);
        let _location = self.location_locks.lock(*location);

        let removed = self.backend.remove_responsibility_of(location, peer);

        if removed {
            for listener in &self.listeners {
                listener.lost(location, &BTreeSet::from([*peer]));
            }
        }

        removed
    }

    // === Private Methods ===

    fn store_updated(&self, key: CompositeKey, entry: Entry) {
        match entry.expiration_millis() {
            Some(expiration) => self.backend.add_timeout(key, expiration),
            None => self.backend.remove_timeout(&key),
        }

        self.backend.put(key, entry);
    }

    fn check_domain(
        &self,
        key: &LocationDomain,
        public_key: Option<&VerifyingKey>,
        claim: bool,
    ) -> Claim {
        if !claim {
            return if self.backend.is_domain_protected_by_others(key, public_key) {
                Claim::Denied
            } else {
                Claim::Allowed { protect: false }
            };
        }

        if self.can_claim_domain(key, public_key) && self.can_protect_domain(&key.domain, public_key)
        {
            Claim::Allowed { protect: true }
        } else {
            Claim::Denied
        }
    }

    fn check_entry(
        &self,
        key: &LocationDomainContent,
        public_key: Option<&VerifyingKey>,
        new_owner: Option<&VerifyingKey>,
        claim: bool,
    ) -> Claim {
        if !self.can_claim_entry(key, public_key) {
            return Claim::Denied;
        }

        if !claim {
            return Claim::Allowed { protect: false };
        }

        if can_protect(
            self.protection.entry_enable,
            self.protection.entry_mode,
            &key.content,
            new_owner,
        ) {
            Claim::Allowed { protect: true }
        } else {
            Claim::Denied
        }
    }

    fn can_claim_domain(&self, key: &LocationDomain, public_key: Option<&VerifyingKey>) -> bool {
        !self.backend.is_domain_protected_by_others(key, public_key)
            || can_override(self.protection.domain_mode, &key.domain, public_key)
    }

    fn can_protect_domain(&self, domain: &Id, public_key: Option<&VerifyingKey>) -> bool {
        !self.backend.is_domain_removed(domain)
            && can_protect(
                self.protection.domain_enable,
                self.protection.domain_mode,
                domain,
                public_key,
            )
    }

    fn can_claim_entry(
        &self,
        key: &LocationDomainContent,
        public_key: Option<&VerifyingKey>,
    ) -> bool {
        !self.backend.is_entry_protected_by_others(key, public_key)
            || can_override(self.protection.entry_mode, &key.content, public_key)
    }
}

/// Versions of a single `(location, domain, content)` that no other given
/// version is based on, directly or transitively.
///
/// Walks from the newest version down, removing everything reachable through
/// `based_on` from a working copy; whatever remains when reached is a latest
/// version.
pub fn latest_versions<'a>(
    versions: impl Iterator<Item = (&'a CompositeKey, &'a Entry)>,
) -> BTreeMap<CompositeKey, Entry> {
    let mut remaining: BTreeMap<CompositeKey, &Entry> = versions.map(|(k, e)| (*k, e)).collect();
    let mut latest = BTreeMap::new();

    while let Some((key, entry)) = remaining.pop_last() {
        let mut predecessors: Vec<Id> = entry.based_on().iter().copied().collect();

        while let Some(version) = predecessors.pop() {
            if let Some(predecessor) = remaining.remove(&key.with_version(version)) {
                predecessors.extend(predecessor.based_on().iter().copied());
            }
        }

        latest.insert(key, entry.clone());
    }

    latest
}

fn is_live(entry: &Entry) -> bool {
    !entry.is_prepared() && !entry.is_deleted()
}

fn matches_filters(
    key: &CompositeKey,
    content_filter: Option<&dyn KeyFilter>,
    version_filter: Option<&dyn KeyFilter>,
    filter_and: bool,
) -> bool {
    let content = content_filter.map(|filter| filter.contains(&key.content));
    let version = version_filter.map(|filter| filter.contains(&key.version));

    if filter_and {
        content.unwrap_or(true) && version.unwrap_or(true)
    } else {
        !content.unwrap_or(false) && !version.unwrap_or(false)
    }
}

/// Keep the first (or last) `limit` entries of a sorted iterator.
fn limit_map(
    entries: impl DoubleEndedIterator<Item = (CompositeKey, Entry)>,
    limit: Option<usize>,
    ascending: bool,
) -> BTreeMap<CompositeKey, Entry> {
    let limit = limit.unwrap_or(usize::MAX);

    if ascending {
        entries.take(limit).collect()
    } else {
        entries.rev().take(limit).collect()
    }
}

fn to_digest(entries: impl IntoIterator<Item = (CompositeKey, Entry)>) -> Digest {
    entries
        .into_iter()
        .map(|(key, entry)| (key, entry.based_on().clone()))
        .collect()
}
