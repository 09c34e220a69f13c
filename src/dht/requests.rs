//! Parameters of the operations of a [crate::Dht].
//!
//! Every builder method takes the request by value and returns the updated
//! request, so a built request is never mutated behind a caller's back.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use bytes::Bytes;
use ed25519_dalek::VerifyingKey;

use crate::{
    common::{
        messages::{FilteredSelection, Selection},
        CompositeKey, Entry, Id, KeyFilter, MetaUpdate,
    },
    rpc::{EvaluationScheme, RequestPolicy},
    Error, Result,
};

/// Request options every operation shares.
#[derive(Debug, Clone, Default)]
struct Options {
    policy: Option<RequestPolicy>,
    evaluation: Option<Arc<dyn EvaluationScheme>>,
}

macro_rules! options {
    () => {
        /// Override the [crate::Config] policy of this operation.
        pub fn policy(mut self, policy: RequestPolicy) -> Self {
            self.options.policy = Some(policy);
            self
        }

        /// Override the default [crate::rpc::VotingScheme].
        pub fn evaluation(mut self, evaluation: Arc<dyn EvaluationScheme>) -> Self {
            self.options.evaluation = Some(evaluation);
            self
        }

        pub(crate) fn policy_or(&self, default: RequestPolicy) -> RequestPolicy {
            self.options.policy.unwrap_or(default)
        }

        pub(crate) fn evaluation_scheme(&self) -> Option<Arc<dyn EvaluationScheme>> {
            self.options.evaluation.clone()
        }
    };
}

// === Put ===

#[derive(Debug, Clone)]
/// Store entries under one `(location, domain)`.
pub struct PutRequest {
    location: Id,
    domain: Id,
    version: Id,
    data: BTreeMap<(Id, Option<Id>), Entry>,
    owner: Option<VerifyingKey>,
    put_if_absent: bool,
    protect_domain: bool,
    protect_entries: bool,
    options: Options,
}

impl PutRequest {
    pub fn new(location: Id) -> Self {
        Self {
            location,
            domain: Id::ZERO,
            version: Id::ZERO,
            data: BTreeMap::new(),
            owner: None,
            put_if_absent: false,
            protect_domain: false,
            protect_entries: false,
            options: Options::default(),
        }
    }

    /// Defaults to [Id::ZERO].
    pub fn domain(mut self, domain: Id) -> Self {
        self.domain = domain;
        self
    }

    /// Version of every entry added with [PutRequest::data].
    ///
    /// Defaults to [Id::ZERO].
    pub fn version(mut self, version: Id) -> Self {
        self.version = version;
        self
    }

    /// Store `entry` under `content`, at the request's version.
    pub fn data(mut self, content: Id, entry: Entry) -> Self {
        self.data.insert((content, None), entry);
        self
    }

    /// Store `entry` under `content` at an explicit `version`.
    pub fn versioned(mut self, content: Id, version: Id, entry: Entry) -> Self {
        self.data.insert((content, Some(version)), entry);
        self
    }

    /// Public key of the requester, checked against domain and entry owners.
    pub fn owner(mut self, owner: VerifyingKey) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Fail keys that already exist instead of overwriting them.
    pub fn put_if_absent(mut self, put_if_absent: bool) -> Self {
        self.put_if_absent = put_if_absent;
        self
    }

    /// Claim the domain for [PutRequest::owner].
    pub fn protect_domain(mut self, protect_domain: bool) -> Self {
        self.protect_domain = protect_domain;
        self
    }

    /// Claim every stored entry for its owner.
    pub fn protect_entries(mut self, protect_entries: bool) -> Self {
        self.protect_entries = protect_entries;
        self
    }

    options!();

    // === Getters ===

    pub fn location(&self) -> Id {
        self.location
    }

    pub fn owner_key(&self) -> Option<&VerifyingKey> {
        self.owner.as_ref()
    }

    pub fn is_put_if_absent(&self) -> bool {
        self.put_if_absent
    }

    pub fn claims_domain_protection(&self) -> bool {
        self.protect_domain
    }

    /// Every entry of this request under its full key.
    pub fn entries(&self) -> Result<BTreeMap<CompositeKey, Entry>> {
        if self.data.is_empty() {
            return Err(Error::BuilderMissingFieldError("data"));
        }
        if self.protect_domain && self.owner.is_none() {
            return Err(Error::BuilderInvalidComboError(
                "Domain protection requires an owner key",
            ));
        }
        if self.protect_entries && self.owner.is_none() {
            return Err(Error::BuilderInvalidComboError(
                "Entry protection requires an owner key",
            ));
        }

        Ok(self
            .data
            .iter()
            .map(|((content, version), entry)| {
                let key = CompositeKey::new(
                    self.location,
                    self.domain,
                    *content,
                    version.unwrap_or(self.version),
                );
                let entry = if self.protect_entries {
                    entry.clone().with_protected_entry(true)
                } else {
                    entry.clone()
                };

                (key, entry)
            })
            .collect())
    }
}

// === Add ===

#[derive(Debug, Clone)]
/// Store values under content keys derived from their Sha1 hash.
pub struct AddRequest {
    put: PutRequest,
}

impl AddRequest {
    pub fn new(location: Id) -> Self {
        Self {
            put: PutRequest::new(location),
        }
    }

    /// Defaults to [Id::ZERO].
    pub fn domain(mut self, domain: Id) -> Self {
        self.put = self.put.domain(domain);
        self
    }

    /// Defaults to [Id::ZERO].
    pub fn version(mut self, version: Id) -> Self {
        self.put = self.put.version(version);
        self
    }

    /// Add a value with default metadata.
    pub fn value(self, value: impl Into<Bytes>) -> Self {
        self.entry(Entry::new(value))
    }

    /// Add an entry, keyed by the hash of its value.
    pub fn entry(mut self, entry: Entry) -> Self {
        self.put = self.put.data(entry.hash(), entry);
        self
    }

    pub fn owner(mut self, owner: VerifyingKey) -> Self {
        self.put = self.put.owner(owner);
        self
    }

    pub fn protect_domain(mut self, protect_domain: bool) -> Self {
        self.put = self.put.protect_domain(protect_domain);
        self
    }

    pub fn policy(mut self, policy: RequestPolicy) -> Self {
        self.put = self.put.policy(policy);
        self
    }

    pub fn evaluation(mut self, evaluation: Arc<dyn EvaluationScheme>) -> Self {
        self.put = self.put.evaluation(evaluation);
        self
    }
}

impl From<AddRequest> for PutRequest {
    fn from(request: AddRequest) -> Self {
        request.put
    }
}

// === Put meta ===

#[derive(Debug, Clone)]
/// Update metadata of stored entries, or confirm prepared ones.
pub struct PutMetaRequest {
    location: Id,
    domain: Id,
    version: Id,
    updates: BTreeMap<Id, MetaUpdate>,
    owner: Option<VerifyingKey>,
    options: Options,
}

impl PutMetaRequest {
    pub fn new(location: Id) -> Self {
        Self {
            location,
            domain: Id::ZERO,
            version: Id::ZERO,
            updates: BTreeMap::new(),
            owner: None,
            options: Options::default(),
        }
    }

    pub fn domain(mut self, domain: Id) -> Self {
        self.domain = domain;
        self
    }

    pub fn version(mut self, version: Id) -> Self {
        self.version = version;
        self
    }

    pub fn update(mut self, content: Id, meta: MetaUpdate) -> Self {
        self.updates.insert(content, meta);
        self
    }

    pub fn owner(mut self, owner: VerifyingKey) -> Self {
        self.owner = Some(owner);
        self
    }

    options!();

    // === Getters ===

    pub fn location(&self) -> Id {
        self.location
    }

    pub fn owner_key(&self) -> Option<&VerifyingKey> {
        self.owner.as_ref()
    }

    pub fn updates(&self) -> Result<BTreeMap<CompositeKey, MetaUpdate>> {
        if self.updates.is_empty() {
            return Err(Error::BuilderMissingFieldError("update"));
        }

        Ok(self
            .updates
            .iter()
            .map(|(content, meta)| {
                (
                    CompositeKey::new(self.location, self.domain, *content, self.version),
                    meta.clone(),
                )
            })
            .collect())
    }
}

// === Selections ===

#[derive(Debug, Clone)]
/// Which keys of a `(location, domain)` a get, remove or digest applies to.
struct Scope {
    location: Id,
    domain: Id,
    version: Id,
    contents: BTreeSet<Id>,
    range: Option<(CompositeKey, CompositeKey)>,
    content_filter: Option<Arc<dyn KeyFilter>>,
    version_filter: Option<Arc<dyn KeyFilter>>,
    exclude: bool,
    limit: Option<usize>,
    descending: bool,
}

impl Scope {
    fn new(location: Id) -> Self {
        Self {
            location,
            domain: Id::ZERO,
            version: Id::ZERO,
            contents: BTreeSet::new(),
            range: None,
            content_filter: None,
            version_filter: None,
            exclude: false,
            limit: None,
            descending: false,
        }
    }

    /// Explicit contents select keys, filters select a filtered domain, a
    /// range selects itself, and nothing selects the whole domain.
    fn selection(&self) -> Result<Selection> {
        let filtered = self.content_filter.is_some() || self.version_filter.is_some();

        match (&self.range, self.contents.is_empty(), filtered) {
            (Some(_), false, _) => Err(Error::BuilderInvalidComboError(
                "Can't select both content keys and a range",
            )),
            (Some(_), _, true) => Err(Error::BuilderInvalidComboError(
                "Can't filter an explicit range",
            )),
            (None, false, true) => Err(Error::BuilderInvalidComboError(
                "Can't filter explicit content keys",
            )),
            (Some((from, to)), true, false) => {
                if from.location != to.location {
                    return Err(Error::BuilderInvalidComboError(
                        "A range must stay within one location",
                    ));
                }

                Ok(Selection::Range {
                    from: *from,
                    to: *to,
                    limit: self.limit,
                    ascending: !self.descending,
                })
            }
            (None, false, false) => Ok(Selection::Keys(
                self.contents
                    .iter()
                    .map(|content| {
                        CompositeKey::new(self.location, self.domain, *content, self.version)
                    })
                    .collect(),
            )),
            (None, true, true) => Ok(Selection::Filtered(FilteredSelection {
                location: self.location,
                domain: self.domain,
                content_filter: self.content_filter.clone(),
                version_filter: self.version_filter.clone(),
                filter_and: !self.exclude,
                limit: self.limit,
                ascending: !self.descending,
            })),
            (None, true, false) => Ok(Selection::Range {
                from: CompositeKey::first_of_domain(self.location, self.domain),
                to: CompositeKey::last_of_domain(self.location, self.domain),
                limit: self.limit,
                ascending: !self.descending,
            }),
        }
    }
}

macro_rules! scope {
    () => {
        /// Defaults to [Id::ZERO].
        pub fn domain(mut self, domain: Id) -> Self {
            self.scope.domain = domain;
            self
        }

        /// Version of the keys selected by content.
        ///
        /// Defaults to [Id::ZERO].
        pub fn version(mut self, version: Id) -> Self {
            self.scope.version = version;
            self
        }

        /// Select a single content key.
        pub fn content(mut self, content: Id) -> Self {
            self.scope.contents.insert(content);
            self
        }

        pub fn contents(mut self, contents: impl IntoIterator<Item = Id>) -> Self {
            self.scope.contents.extend(contents);
            self
        }

        /// Select every key in `from..=to`.
        pub fn range(mut self, from: CompositeKey, to: CompositeKey) -> Self {
            self.scope.range = Some((from, to));
            self
        }

        /// Select keys of the domain whose content key the filter contains.
        pub fn content_filter(mut self, filter: Arc<dyn KeyFilter>) -> Self {
            self.scope.content_filter = Some(filter);
            self
        }

        /// Select keys of the domain whose version key the filter contains.
        pub fn version_filter(mut self, filter: Arc<dyn KeyFilter>) -> Self {
            self.scope.version_filter = Some(filter);
            self
        }

        /// Select keys the filters do _not_ contain instead.
        pub fn exclude(mut self, exclude: bool) -> Self {
            self.scope.exclude = exclude;
            self
        }

        /// Select at most `limit` keys of a range or filtered domain.
        pub fn limit(mut self, limit: usize) -> Self {
            self.scope.limit = Some(limit);
            self
        }

        /// Count the limit from the highest key down.
        pub fn descending(mut self, descending: bool) -> Self {
            self.scope.descending = descending;
            self
        }

        pub fn location(&self) -> Id {
            self.scope.location
        }

        pub fn selection(&self) -> Result<Selection> {
            self.scope.selection()
        }
    };
}

// === Get ===

#[derive(Debug, Clone)]
pub struct GetRequest {
    scope: Scope,
    latest_only: bool,
    options: Options,
}

impl GetRequest {
    pub fn new(location: Id) -> Self {
        Self {
            scope: Scope::new(location),
            latest_only: false,
            options: Options::default(),
        }
    }

    scope!();
    options!();

    /// Only return the latest versions of each selected content.
    pub fn latest_only(mut self, latest_only: bool) -> Self {
        self.latest_only = latest_only;
        self
    }

    pub fn is_latest_only(&self) -> bool {
        self.latest_only
    }
}

// === Remove ===

#[derive(Debug, Clone)]
pub struct RemoveRequest {
    scope: Scope,
    owner: Option<VerifyingKey>,
    return_data: bool,
    options: Options,
}

impl RemoveRequest {
    pub fn new(location: Id) -> Self {
        Self {
            scope: Scope::new(location),
            owner: None,
            return_data: false,
            options: Options::default(),
        }
    }

    scope!();
    options!();

    pub fn owner(mut self, owner: VerifyingKey) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Return the removed entries.
    pub fn return_data(mut self, return_data: bool) -> Self {
        self.return_data = return_data;
        self
    }

    pub fn owner_key(&self) -> Option<&VerifyingKey> {
        self.owner.as_ref()
    }

    pub fn is_return_data(&self) -> bool {
        self.return_data
    }
}

// === Digest ===

#[derive(Debug, Clone)]
pub struct DigestRequest {
    scope: Scope,
    options: Options,
}

impl DigestRequest {
    pub fn new(location: Id) -> Self {
        Self {
            scope: Scope::new(location),
            options: Options::default(),
        }
    }

    scope!();
    options!();
}

#[cfg(test)]
mod test {
    use ed25519_dalek::SigningKey;

    use crate::common::KeySet;

    use super::*;

    #[test]
    fn put_entries() {
        let owner = SigningKey::from_bytes(&[1; 32]).verifying_key();

        let entries = PutRequest::new(Id::from(1))
            .domain(Id::from(2))
            .version(Id::from(3))
            .data(Id::from(4), Entry::new(&b"a"[..]))
            .versioned(Id::from(4), Id::from(5), Entry::new(&b"b"[..]))
            .owner(owner)
            .protect_entries(true)
            .entries()
            .unwrap();

        let keys: Vec<_> = entries.keys().copied().collect();
        assert_eq!(
            keys,
            vec![
                CompositeKey::new(Id::from(1), Id::from(2), Id::from(4), Id::from(3)),
                CompositeKey::new(Id::from(1), Id::from(2), Id::from(4), Id::from(5)),
            ]
        );
        assert!(entries.values().all(|entry| entry.is_protected_entry()));
    }

    #[test]
    fn put_validation() {
        assert!(matches!(
            PutRequest::new(Id::from(1)).entries(),
            Err(Error::BuilderMissingFieldError("data"))
        ));
        assert!(matches!(
            PutRequest::new(Id::from(1))
                .data(Id::from(1), Entry::new(&b"a"[..]))
                .protect_domain(true)
                .entries(),
            Err(Error::BuilderInvalidComboError(_))
        ));
    }

    #[test]
    fn add_keys_by_hash() {
        let request: PutRequest = AddRequest::new(Id::from(1)).value(&b"hello"[..]).into();

        let entries = request.entries().unwrap();
        let key = entries.keys().next().unwrap();

        assert_eq!(key.content, Id::hash_of(b"hello"));
        assert_eq!(key.version, Id::ZERO);
    }

    #[test]
    fn selections() {
        let location = Id::from(1);

        assert!(matches!(
            GetRequest::new(location).selection(),
            Ok(Selection::Range { from, to, .. })
                if from == CompositeKey::first_of_domain(location, Id::ZERO)
                    && to == CompositeKey::last_of_domain(location, Id::ZERO)
        ));

        match GetRequest::new(location).content(Id::from(7)).selection() {
            Ok(Selection::Keys(keys)) => assert_eq!(
                keys,
                BTreeSet::from([CompositeKey::new(location, Id::ZERO, Id::from(7), Id::ZERO)])
            ),
            other => panic!("unexpected selection {:?}", other),
        }

        let filter: Arc<dyn KeyFilter> = Arc::new(KeySet::from_iter([Id::from(7)]));
        match DigestRequest::new(location)
            .content_filter(filter)
            .exclude(true)
            .limit(2)
            .selection()
        {
            Ok(Selection::Filtered(filtered)) => {
                assert!(!filtered.filter_and);
                assert_eq!(filtered.limit, Some(2));
            }
            other => panic!("unexpected selection {:?}", other),
        }
    }

    #[test]
    fn invalid_selections() {
        let location = Id::from(1);
        let filter: Arc<dyn KeyFilter> = Arc::new(KeySet::new());

        assert!(RemoveRequest::new(location)
            .content(Id::from(1))
            .range(CompositeKey::MIN, CompositeKey::MAX)
            .selection()
            .is_err());
        assert!(RemoveRequest::new(location)
            .content(Id::from(1))
            .content_filter(filter)
            .selection()
            .is_err());
        assert!(GetRequest::new(location)
            .range(
                CompositeKey::first_of_location(Id::from(1)),
                CompositeKey::last_of_location(Id::from(2)),
            )
            .selection()
            .is_err());
    }
}
