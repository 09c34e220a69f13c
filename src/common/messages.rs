//! Requests sent to a peer's storage and the responses it answers with.
//!
//! These are in-memory values; encoding them on the wire is up to the
//! [crate::rpc::Transport] implementation.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use ed25519_dalek::VerifyingKey;

use crate::common::{CompositeKey, Digest, Entry, Id, KeyFilter, MetaUpdate, PutOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The kind of a request, as seen by the routing layer.
pub enum RequestKind {
    Put,
    Get,
    Remove,
    Digest,
}

#[derive(Debug, Clone)]
pub enum RequestSpecific {
    Put(PutRequestArguments),
    PutMeta(PutMetaRequestArguments),
    PutConfirm(PutMetaRequestArguments),
    Get(GetRequestArguments),
    Remove(RemoveRequestArguments),
    Digest(DigestRequestArguments),
}

impl RequestSpecific {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestSpecific::Put(_)
            | RequestSpecific::PutMeta(_)
            | RequestSpecific::PutConfirm(_) => RequestKind::Put,
            RequestSpecific::Get(_) => RequestKind::Get,
            RequestSpecific::Remove(_) => RequestKind::Remove,
            RequestSpecific::Digest(_) => RequestKind::Digest,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PutRequestArguments {
    pub entries: BTreeMap<CompositeKey, Entry>,
    /// Public key of the requester.
    pub owner: Option<VerifyingKey>,
    pub put_if_absent: bool,
    pub claim_domain_protection: bool,
}

#[derive(Debug, Clone)]
pub struct PutMetaRequestArguments {
    pub updates: BTreeMap<CompositeKey, MetaUpdate>,
    pub owner: Option<VerifyingKey>,
}

#[derive(Debug, Clone)]
pub struct GetRequestArguments {
    pub selection: Selection,
    /// Only return the latest versions of each selected `(location, domain, content)`.
    pub latest_only: bool,
}

#[derive(Debug, Clone)]
pub struct RemoveRequestArguments {
    pub selection: Selection,
    pub owner: Option<VerifyingKey>,
    pub return_data: bool,
}

#[derive(Debug, Clone)]
pub struct DigestRequestArguments {
    pub selection: Selection,
}

#[derive(Debug, Clone)]
/// Which keys a read, remove, or digest applies to.
pub enum Selection {
    /// Explicit keys.
    Keys(BTreeSet<CompositeKey>),
    /// An inclusive key range.
    Range {
        from: CompositeKey,
        to: CompositeKey,
        limit: Option<usize>,
        ascending: bool,
    },
    /// All keys of a `(location, domain)` matching content and version filters.
    Filtered(FilteredSelection),
}

#[derive(Debug, Clone)]
pub struct FilteredSelection {
    pub location: Id,
    pub domain: Id,
    pub content_filter: Option<Arc<dyn KeyFilter>>,
    pub version_filter: Option<Arc<dyn KeyFilter>>,
    /// `true` keeps keys matched by the filters, `false` keeps keys _not_
    /// matched by any of them.
    pub filter_and: bool,
    pub limit: Option<usize>,
    pub ascending: bool,
}

impl Selection {
    /// The location this selection targets, used for routing.
    ///
    /// Returns `None` for an empty key set.
    pub fn location(&self) -> Option<Id> {
        match self {
            Selection::Keys(keys) => keys.iter().next().map(|key| key.location),
            Selection::Range { from, .. } => Some(from.location),
            Selection::Filtered(filtered) => Some(filtered.location),
        }
    }

    pub fn is_range(&self) -> bool {
        !matches!(self, Selection::Keys(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseSpecific {
    /// Outcome for every key of a put, put_meta or put_confirm request.
    Outcomes(BTreeMap<CompositeKey, PutOutcome>),
    Data(BTreeMap<CompositeKey, Entry>),
    Removed(RemoveResponseArguments),
    Digest(Digest),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoveResponseArguments {
    pub outcomes: BTreeMap<CompositeKey, PutOutcome>,
    /// Removed entries, if requested.
    pub data: BTreeMap<CompositeKey, Entry>,
}
