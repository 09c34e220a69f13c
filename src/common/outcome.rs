//! Per-key outcome of a storage operation.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// What happened to a single key on a single peer.
///
/// Outcomes are reported as data, so a multi-key request can partially
/// succeed. Each variant has a stable single byte code, see [PutOutcome::as_byte].
pub enum PutOutcome {
    /// Stored.
    Ok,
    /// Stored as tentative, hidden from readers until confirmed.
    OkPrepared,
    /// `put_if_absent` was requested, but the key exists.
    FailedNotAbsent,
    /// The domain or entry is protected by someone else.
    FailedSecurity,
    /// Generic failure.
    Failed,
    /// Stored, but the version chain now has more than one latest version.
    VersionFork,
    /// Nothing stored under this key.
    NotFound,
    /// The key holds a tombstone.
    Deleted,
}

const CODES: [(PutOutcome, u8); 8] = [
    (PutOutcome::Ok, 0),
    (PutOutcome::OkPrepared, 1),
    (PutOutcome::FailedNotAbsent, 2),
    (PutOutcome::FailedSecurity, 3),
    (PutOutcome::Failed, 4),
    (PutOutcome::VersionFork, 5),
    (PutOutcome::NotFound, 6),
    (PutOutcome::Deleted, 7),
];

impl PutOutcome {
    pub fn as_byte(&self) -> u8 {
        CODES
            .iter()
            .find(|(outcome, _)| outcome == self)
            .map(|(_, code)| *code)
            .unwrap_or(u8::MAX)
    }

    pub fn from_byte(code: u8) -> Option<PutOutcome> {
        CODES
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(outcome, _)| *outcome)
    }

    /// Whether the peer holds the entry after this outcome.
    ///
    /// A tombstoned key counts as stored: the newer state wins.
    pub fn is_stored(&self) -> bool {
        matches!(
            self,
            PutOutcome::Ok | PutOutcome::OkPrepared | PutOutcome::VersionFork | PutOutcome::Deleted
        )
    }
}
