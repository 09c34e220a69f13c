//! Versioned entries and their metadata.

use std::collections::BTreeSet;

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::common::{now_millis, Id};

#[derive(Clone, Debug, PartialEq, Eq)]
/// A payload stored under a [super::CompositeKey], with its metadata.
pub struct Entry {
    value: Bytes,
    /// Public key of the owner, if the entry is owned.
    owner: Option<VerifyingKey>,
    /// ed25519 signature over the value by the owner.
    signature: Option<Signature>,
    /// `None` never expires.
    ttl_seconds: Option<u32>,
    valid_from_millis: u64,
    /// Versions this one succeeds; empty for a root version.
    based_on: BTreeSet<Id>,
    /// Two phase commit marker, hides the entry from readers until confirmed.
    prepared: bool,
    /// Tombstone.
    deleted: bool,
    /// Claim entry protection for `owner` when stored.
    protected_entry: bool,
}

impl Entry {
    /// A new root entry, valid from now, that never expires.
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            owner: None,
            signature: None,
            ttl_seconds: None,
            valid_from_millis: now_millis(),
            based_on: BTreeSet::new(),
            prepared: false,
            deleted: false,
            protected_entry: false,
        }
    }

    /// An empty entry marking a key as deleted.
    pub fn tombstone() -> Self {
        Self {
            deleted: true,
            ..Self::new(Bytes::new())
        }
    }

    // === Options ===

    pub fn with_ttl_seconds(mut self, ttl_seconds: u32) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_valid_from_millis(mut self, valid_from_millis: u64) -> Self {
        self.valid_from_millis = valid_from_millis;
        self
    }

    pub fn with_based_on(mut self, version: Id) -> Self {
        self.based_on.insert(version);
        self
    }

    pub fn with_owner(mut self, owner: VerifyingKey) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_prepared(mut self, prepared: bool) -> Self {
        self.prepared = prepared;
        self
    }

    pub fn with_protected_entry(mut self, protected_entry: bool) -> Self {
        self.protected_entry = protected_entry;
        self
    }

    /// Sign the value, making `signer` the owner of this entry.
    pub fn sign(mut self, signer: &SigningKey) -> Self {
        self.signature = Some(signer.sign(&self.value));
        self.owner = Some(signer.verifying_key());
        self
    }

    // === Getters ===

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn owner(&self) -> Option<&VerifyingKey> {
        self.owner.as_ref()
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn ttl_seconds(&self) -> Option<u32> {
        self.ttl_seconds
    }

    pub fn valid_from_millis(&self) -> u64 {
        self.valid_from_millis
    }

    pub fn based_on(&self) -> &BTreeSet<Id> {
        &self.based_on
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_protected_entry(&self) -> bool {
        self.protected_entry
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Millis since epoch after which this entry expires, `None` if never.
    pub fn expiration_millis(&self) -> Option<u64> {
        self.ttl_seconds
            .map(|ttl| self.valid_from_millis.saturating_add(ttl as u64 * 1000))
    }

    /// Sha1 of the value, used as content key by `add`.
    pub fn hash(&self) -> Id {
        Id::hash_of(&self.value)
    }

    /// Returns `true` if the entry is unsigned, or signed by its owner.
    pub fn verify(&self) -> bool {
        match (&self.signature, &self.owner) {
            (None, _) => true,
            (Some(signature), Some(owner)) => owner.verify(&self.value, signature).is_ok(),
            (Some(_), None) => false,
        }
    }

    // === Metadata mutation ===

    pub(crate) fn apply_meta(&mut self, meta: &MetaUpdate) {
        if let Some(owner) = meta.owner {
            self.owner = Some(owner);
        }
        if let Some(signature) = meta.signature {
            self.signature = Some(signature);
        }
        self.valid_from_millis = meta.valid_from_millis;
        self.ttl_seconds = meta.ttl_seconds;
    }

    pub(crate) fn confirm(&mut self) {
        self.prepared = false;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Metadata-only update applied in place by `put_meta` and `put_confirm`.
pub struct MetaUpdate {
    pub owner: Option<VerifyingKey>,
    pub signature: Option<Signature>,
    pub ttl_seconds: Option<u32>,
    pub valid_from_millis: u64,
}

impl MetaUpdate {
    /// Refresh validity, starting now, keeping ownership untouched.
    pub fn new(ttl_seconds: Option<u32>) -> Self {
        Self {
            owner: None,
            signature: None,
            ttl_seconds,
            valid_from_millis: now_millis(),
        }
    }

    pub fn with_owner(mut self, owner: VerifyingKey) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn with_valid_from_millis(mut self, valid_from_millis: u64) -> Self {
        self.valid_from_millis = valid_from_millis;
        self
    }

    /// Whether this update would make its target protected.
    pub(crate) fn claims_protection(&self) -> bool {
        self.owner.is_some()
    }
}

impl From<&Entry> for MetaUpdate {
    fn from(entry: &Entry) -> Self {
        Self {
            owner: entry.owner,
            signature: entry.signature,
            ttl_seconds: entry.ttl_seconds,
            valid_from_millis: entry.valid_from_millis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiration() {
        let entry = Entry::new(&b"v"[..])
            .with_valid_from_millis(10_000)
            .with_ttl_seconds(3);
        assert_eq!(entry.expiration_millis(), Some(13_000));

        let entry = Entry::new(&b"v"[..]).with_valid_from_millis(10_000);
        assert_eq!(entry.expiration_millis(), None);

        let entry = entry.with_ttl_seconds(0);
        assert_eq!(entry.expiration_millis(), Some(10_000));
    }

    #[test]
    fn signed_entry_verifies() {
        let signer = SigningKey::from_bytes(&[7; 32]);
        let entry = Entry::new(&b"Hello world!"[..]).sign(&signer);

        assert!(entry.verify());
        assert_eq!(entry.owner(), Some(&signer.verifying_key()));

        let other = SigningKey::from_bytes(&[8; 32]);
        let forged = entry.with_owner(other.verifying_key());

        assert!(!forged.verify());
    }

    #[test]
    fn meta_update_keeps_value() {
        let mut entry = Entry::new(&b"v"[..]).with_prepared(true);
        entry.apply_meta(&MetaUpdate::new(Some(5)).with_valid_from_millis(1_000));
        entry.confirm();

        assert_eq!(entry.value(), &Bytes::from_static(b"v"));
        assert_eq!(entry.expiration_millis(), Some(6_000));
        assert!(!entry.is_prepared());
    }
}
