//! Answers storage requests from other peers with the local versioned store.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use ed25519_dalek::VerifyingKey;
use tracing::{debug, trace};

use crate::{
    common::{
        messages::{
            DigestRequestArguments, FilteredSelection, GetRequestArguments,
            PutMetaRequestArguments, PutRequestArguments, RemoveRequestArguments, Selection,
        },
        CompositeKey, Digest, Entry, Id, Peer, PutOutcome, RemoveResponseArguments,
        RequestSpecific, ResponseSpecific,
    },
    storage::StorageLayer,
};

/// Default interval between two sweeps of expired entries.
pub const DEFAULT_STORAGE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Decides whether a request from a peer is handled at all.
pub trait RequestFilter: Send + Sync + Debug {
    /// Returns true if the request from this peer is allowed.
    fn allow_request(&self, request: &RequestSpecific, from: &Peer) -> bool;
}

#[derive(Debug, Clone)]
struct DefaultFilter;

impl RequestFilter for DefaultFilter {
    fn allow_request(&self, _request: &RequestSpecific, _from: &Peer) -> bool {
        true
    }
}

#[derive(Debug)]
/// Settings of a [StorageServer].
pub struct StorageServerSettings {
    /// How often [StorageServer::maintain] sweeps expired entries.
    ///
    /// Defaults to [DEFAULT_STORAGE_CHECK_INTERVAL]
    pub storage_check_interval: Duration,
    /// Filter requests before handling them.
    ///
    /// Defaults to a filter that allows everything.
    pub filter: Box<dyn RequestFilter>,
}

impl Default for StorageServerSettings {
    fn default() -> Self {
        Self {
            storage_check_interval: DEFAULT_STORAGE_CHECK_INTERVAL,
            filter: Box::new(DefaultFilter),
        }
    }
}

#[derive(Debug)]
/// The storage side of a peer.
///
/// Stores what it is asked to, and records itself as responsible for every
/// location it holds data for.
pub struct StorageServer {
    id: Id,
    storage: StorageLayer,
    filter: Box<dyn RequestFilter>,
    storage_check_interval: Duration,
    last_storage_check: Mutex<Instant>,
}

impl StorageServer {
    pub fn new(id: Id, storage: StorageLayer, settings: StorageServerSettings) -> Self {
        Self {
            id,
            storage,
            filter: settings.filter,
            storage_check_interval: settings.storage_check_interval,
            last_storage_check: Mutex::new(Instant::now()),
        }
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn storage(&self) -> &StorageLayer {
        &self.storage
    }

    // === Public Methods ===

    /// Returns the response to a request, or `None` if the filter refused it.
    pub fn handle_request(&self, from: &Peer, request: &RequestSpecific) -> Option<ResponseSpecific> {
        if !self.filter.allow_request(request, from) {
            debug!(?from, kind = ?request.kind(), "Request filtered");
            return None;
        }

        Some(match request {
            RequestSpecific::Put(arguments) => ResponseSpecific::Outcomes(self.handle_put(arguments)),
            RequestSpecific::PutMeta(arguments) => {
                ResponseSpecific::Outcomes(self.handle_put_meta(arguments, false))
            }
            RequestSpecific::PutConfirm(arguments) => {
                ResponseSpecific::Outcomes(self.handle_put_meta(arguments, true))
            }
            RequestSpecific::Get(arguments) => ResponseSpecific::Data(self.handle_get(arguments)),
            RequestSpecific::Remove(arguments) => {
                ResponseSpecific::Removed(self.handle_remove(arguments))
            }
            RequestSpecific::Digest(arguments) => {
                ResponseSpecific::Digest(self.handle_digest(arguments))
            }
        })
    }

    /// Sweep expired entries if the check interval elapsed.
    ///
    /// Returns the removed keys.
    pub fn maintain(&self) -> Vec<CompositeKey> {
        self.maintain_at(Instant::now())
    }

    fn maintain_at(&self, now: Instant) -> Vec<CompositeKey> {
        {
            let mut last_storage_check = self
                .last_storage_check
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if now.duration_since(*last_storage_check) < self.storage_check_interval {
                return Vec::new();
            }

            *last_storage_check = now;
        }

        self.storage.check_timeout()
    }

    // === Private Methods ===

    fn handle_put(&self, arguments: &PutRequestArguments) -> BTreeMap<CompositeKey, PutOutcome> {
        let PutRequestArguments {
            entries,
            owner,
            put_if_absent,
            claim_domain_protection,
        } = arguments;

        if *claim_domain_protection && owner.is_none() {
            debug!("Domain protection claimed without a public key");

            return entries
                .keys()
                .map(|key| (*key, PutOutcome::FailedSecurity))
                .collect();
        }

        entries
            .iter()
            .map(|(key, entry)| {
                let outcome = self.put_entry(
                    key,
                    entry,
                    owner.as_ref(),
                    *put_if_absent,
                    *claim_domain_protection,
                );

                (*key, outcome)
            })
            .collect()
    }

    fn put_entry(
        &self,
        key: &CompositeKey,
        entry: &Entry,
        owner: Option<&VerifyingKey>,
        put_if_absent: bool,
        claim_domain_protection: bool,
    ) -> PutOutcome {
        if entry.is_signed() && !entry.verify() {
            debug!(?key, "Invalid entry signature");
            return PutOutcome::FailedSecurity;
        }

        let outcome = self.storage.put(
            *key,
            entry.clone(),
            owner,
            put_if_absent,
            claim_domain_protection,
        );

        if outcome.is_stored() {
            self.storage.update_responsibility(key.location, self.id);
        }

        trace!(?key, ?outcome, "Handled put");

        outcome
    }

    fn handle_put_meta(
        &self,
        arguments: &PutMetaRequestArguments,
        confirm: bool,
    ) -> BTreeMap<CompositeKey, PutOutcome> {
        let owner = arguments.owner.as_ref();

        arguments
            .updates
            .iter()
            .map(|(key, meta)| {
                let outcome = if confirm {
                    self.storage.put_confirm(owner, *key, meta)
                } else {
                    self.storage.update_meta(owner, *key, meta)
                };

                (*key, outcome)
            })
            .collect()
    }

    fn handle_get(&self, arguments: &GetRequestArguments) -> BTreeMap<CompositeKey, Entry> {
        let data = match &arguments.selection {
            Selection::Keys(keys) => {
                if arguments.latest_only {
                    return self.latest_of(keys.iter());
                }
                self.storage.get_keys(keys)
            }
            Selection::Range {
                from,
                to,
                limit,
                ascending,
            } => self.storage.get_range(from, to, *limit, *ascending),
            Selection::Filtered(filtered) => self.get_filtered(filtered),
        };

        if arguments.latest_only {
            self.latest_of(data.keys())
        } else {
            data
        }
    }

    fn get_filtered(&self, filtered: &FilteredSelection) -> BTreeMap<CompositeKey, Entry> {
        self.storage.get_filtered(
            filtered.location,
            filtered.domain,
            filtered.content_filter.as_deref(),
            filtered.version_filter.as_deref(),
            filtered.limit,
            filtered.ascending,
            filtered.filter_and,
        )
    }

    /// Latest versions of every `(location, domain, content)` among `keys`.
    fn latest_of<'a>(
        &self,
        keys: impl Iterator<Item = &'a CompositeKey>,
    ) -> BTreeMap<CompositeKey, Entry> {
        let contents: BTreeSet<_> = keys.map(|key| key.min_version()).collect();

        contents
            .iter()
            .flat_map(|key| self.storage.get_latest_version(key))
            .collect()
    }

    fn handle_remove(&self, arguments: &RemoveRequestArguments) -> RemoveResponseArguments {
        let RemoveRequestArguments {
            selection,
            owner,
            return_data,
        } = arguments;
        let owner = owner.as_ref();

        match selection {
            Selection::Keys(keys) => self.remove_keys(keys.iter().copied(), owner, *return_data),
            Selection::Range { from, to, .. } => {
                match self.storage.remove_range(from, to, owner) {
                    Some(removed) => RemoveResponseArguments {
                        outcomes: removed.keys().map(|key| (*key, PutOutcome::Ok)).collect(),
                        data: if *return_data {
                            removed
                        } else {
                            BTreeMap::new()
                        },
                    },
                    None => RemoveResponseArguments {
                        outcomes: self
                            .storage
                            .backend()
                            .sub_map(from, to, None, true)
                            .into_keys()
                            .map(|key| (key, PutOutcome::FailedSecurity))
                            .collect(),
                        data: BTreeMap::new(),
                    },
                }
            }
            Selection::Filtered(filtered) => {
                let keys = self.get_filtered(filtered).into_keys();
                self.remove_keys(keys, owner, *return_data)
            }
        }
    }

    fn remove_keys(
        &self,
        keys: impl Iterator<Item = CompositeKey>,
        owner: Option<&VerifyingKey>,
        return_data: bool,
    ) -> RemoveResponseArguments {
        let mut response = RemoveResponseArguments::default();

        for key in keys {
            let (entry, outcome) = self.storage.remove(&key, owner, return_data);

            response.outcomes.insert(key, outcome);
            if let Some(entry) = entry {
                response.data.insert(key, entry);
            }
        }

        response
    }

    fn handle_digest(&self, arguments: &DigestRequestArguments) -> Digest {
        match &arguments.selection {
            Selection::Keys(keys) => self.storage.digest_keys(keys),
            Selection::Range {
                from,
                to,
                limit,
                ascending,
            } => self.storage.digest_range(from, to, *limit, *ascending),
            Selection::Filtered(filtered) => self.storage.digest_filtered(
                filtered.location,
                filtered.domain,
                filtered.content_filter.as_deref(),
                filtered.version_filter.as_deref(),
                filtered.limit,
                filtered.ascending,
                filtered.filter_and,
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use ed25519_dalek::SigningKey;

    use crate::common::messages::RequestKind;

    use super::*;

    fn server() -> StorageServer {
        StorageServer::new(
            Id::random(),
            StorageLayer::default(),
            StorageServerSettings::default(),
        )
    }

    fn key(content: u64, version: u64) -> CompositeKey {
        CompositeKey::new(
            Id::from(1),
            Id::from(2),
            Id::from(content),
            Id::from(version),
        )
    }

    fn put(entries: Vec<(CompositeKey, Entry)>, owner: Option<VerifyingKey>, claim: bool) -> RequestSpecific {
        RequestSpecific::Put(PutRequestArguments {
            entries: entries.into_iter().collect(),
            owner,
            put_if_absent: false,
            claim_domain_protection: claim,
        })
    }

    fn outcomes(response: Option<ResponseSpecific>) -> BTreeMap<CompositeKey, PutOutcome> {
        match response {
            Some(ResponseSpecific::Outcomes(outcomes)) => outcomes,
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn put_records_responsibility() {
        let server = server();
        let from = Peer::random();

        let response = server.handle_request(&from, &put(vec![(key(1, 1), Entry::new(&b"a"[..]))], None, false));

        assert_eq!(outcomes(response), BTreeMap::from([(key(1, 1), PutOutcome::Ok)]));
        assert_eq!(
            server.storage().responsible_peers(&Id::from(1)),
            BTreeSet::from([*server.id()])
        );
    }

    #[test]
    fn claim_without_key_fails_every_entry() {
        let server = server();

        let response = server.handle_request(
            &Peer::random(),
            &put(
                vec![
                    (key(1, 1), Entry::new(&b"a"[..])),
                    (key(2, 1), Entry::new(&b"b"[..])),
                ],
                None,
                true,
            ),
        );

        assert!(outcomes(response)
            .values()
            .all(|outcome| *outcome == PutOutcome::FailedSecurity));
        assert!(server.storage().backend().is_empty());
    }

    #[test]
    fn forged_signature_is_rejected() {
        let server = server();
        let signer = SigningKey::from_bytes(&[9; 32]);
        let other = SigningKey::from_bytes(&[8; 32]).verifying_key();

        let forged = Entry::new(&b"a"[..]).sign(&signer).with_owner(other);

        let response = server.handle_request(&Peer::random(), &put(vec![(key(1, 1), forged)], None, false));

        assert_eq!(
            outcomes(response),
            BTreeMap::from([(key(1, 1), PutOutcome::FailedSecurity)])
        );
    }

    #[test]
    fn get_latest_only() {
        let server = server();
        let from = Peer::random();

        server.handle_request(
            &from,
            &put(
                vec![
                    (key(1, 1), Entry::new(&b"1"[..])),
                    (key(1, 2), Entry::new(&b"2"[..]).with_based_on(Id::from(1))),
                ],
                None,
                false,
            ),
        );

        let response = server.handle_request(
            &from,
            &RequestSpecific::Get(GetRequestArguments {
                selection: Selection::Keys(BTreeSet::from([key(1, 0)])),
                latest_only: true,
            }),
        );

        match response {
            Some(ResponseSpecific::Data(data)) => {
                assert_eq!(data.keys().copied().collect::<Vec<_>>(), vec![key(1, 2)])
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn aborted_range_remove_reports_every_key() {
        let server = server();
        let alice = SigningKey::from_bytes(&[1; 32]).verifying_key();
        let bob = SigningKey::from_bytes(&[2; 32]).verifying_key();

        server.handle_request(
            &Peer::random(),
            &put(vec![(key(1, 1), Entry::new(&b"a"[..]))], Some(bob), false),
        );
        server.handle_request(
            &Peer::random(),
            &put(
                vec![(key(2, 1), Entry::new(&b"b"[..]).with_protected_entry(true))],
                Some(alice),
                false,
            ),
        );

        let response = server.handle_request(
            &Peer::random(),
            &RequestSpecific::Remove(RemoveRequestArguments {
                selection: Selection::Range {
                    from: key(0, 0),
                    to: key(9, 9),
                    limit: None,
                    ascending: true,
                },
                owner: Some(bob),
                return_data: true,
            }),
        );

        match response {
            Some(ResponseSpecific::Removed(removed)) => {
                assert_eq!(removed.outcomes.len(), 2);
                assert!(removed
                    .outcomes
                    .values()
                    .all(|outcome| *outcome == PutOutcome::FailedSecurity));
                assert!(removed.data.is_empty());
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(server.storage().backend().len(), 2);
    }

    #[test]
    fn filter_refuses_requests() {
        #[derive(Debug)]
        struct NoRemoves;

        impl RequestFilter for NoRemoves {
            fn allow_request(&self, request: &RequestSpecific, _from: &Peer) -> bool {
                request.kind() != RequestKind::Remove
            }
        }

        let server = StorageServer::new(
            Id::random(),
            StorageLayer::default(),
            StorageServerSettings {
                filter: Box::new(NoRemoves),
                ..Default::default()
            },
        );

        let remove = RequestSpecific::Remove(RemoveRequestArguments {
            selection: Selection::Keys(BTreeSet::from([key(1, 1)])),
            owner: None,
            return_data: false,
        });

        assert_eq!(server.handle_request(&Peer::random(), &remove), None);
    }

    #[test]
    fn maintain_respects_interval() {
        let server = StorageServer::new(
            Id::random(),
            StorageLayer::default(),
            StorageServerSettings {
                storage_check_interval: Duration::from_secs(60),
                ..Default::default()
            },
        );

        let expired = Entry::new(&b"a"[..])
            .with_valid_from_millis(0)
            .with_ttl_seconds(0);
        server.handle_request(&Peer::random(), &put(vec![(key(1, 1), expired)], None, false));

        let start = *server.last_storage_check.lock().unwrap();

        assert!(server.maintain_at(start + Duration::from_secs(1)).is_empty());
        assert_eq!(
            server.maintain_at(start + Duration::from_secs(61)),
            vec![key(1, 1)]
        );
        assert!(server.storage().responsible_peers(&Id::from(1)).is_empty());
    }
}
