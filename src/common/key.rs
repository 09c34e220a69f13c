//! Composite keys addressing a stored entry, and their prefixes.
use std::fmt::{self, Debug, Formatter};

use serde::{Deserialize, Serialize};

use crate::common::Id;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// `(location, domain)` prefix of a [CompositeKey], the unit of domain protection.
pub struct LocationDomain {
    pub location: Id,
    pub domain: Id,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// `(location, domain, content)` prefix of a [CompositeKey], the unit of entry
/// protection and of version chains.
pub struct LocationDomainContent {
    pub location: Id,
    pub domain: Id,
    pub content: Id,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// The 4-tuple identifying a stored entry.
///
/// Ordering is lexicographic by location, domain, content, then version.
pub struct CompositeKey {
    pub location: Id,
    pub domain: Id,
    pub content: Id,
    pub version: Id,
}

impl CompositeKey {
    pub const MIN: CompositeKey = CompositeKey {
        location: Id::ZERO,
        domain: Id::ZERO,
        content: Id::ZERO,
        version: Id::ZERO,
    };

    pub const MAX: CompositeKey = CompositeKey {
        location: Id::MAX,
        domain: Id::MAX,
        content: Id::MAX,
        version: Id::MAX,
    };

    pub fn new(location: Id, domain: Id, content: Id, version: Id) -> Self {
        Self {
            location,
            domain,
            content,
            version,
        }
    }

    /// First possible key stored under `location`.
    pub fn first_of_location(location: Id) -> Self {
        Self::new(location, Id::ZERO, Id::ZERO, Id::ZERO)
    }

    /// Last possible key stored under `location`.
    pub fn last_of_location(location: Id) -> Self {
        Self::new(location, Id::MAX, Id::MAX, Id::MAX)
    }

    /// First possible key stored under `(location, domain)`.
    pub fn first_of_domain(location: Id, domain: Id) -> Self {
        Self::new(location, domain, Id::ZERO, Id::ZERO)
    }

    /// Last possible key stored under `(location, domain)`.
    pub fn last_of_domain(location: Id, domain: Id) -> Self {
        Self::new(location, domain, Id::MAX, Id::MAX)
    }

    // === Getters ===

    pub fn location_domain(&self) -> LocationDomain {
        LocationDomain {
            location: self.location,
            domain: self.domain,
        }
    }

    pub fn location_domain_content(&self) -> LocationDomainContent {
        LocationDomainContent {
            location: self.location,
            domain: self.domain,
            content: self.content,
        }
    }

    /// This key with the smallest version, the lower bound of its version chain.
    pub fn min_version(&self) -> Self {
        Self {
            version: Id::ZERO,
            ..*self
        }
    }

    /// This key with the largest version, the upper bound of its version chain.
    pub fn max_version(&self) -> Self {
        Self {
            version: Id::MAX,
            ..*self
        }
    }

    /// The same `(location, domain, content)` at another version.
    pub fn with_version(&self, version: Id) -> Self {
        Self { version, ..*self }
    }
}

impl LocationDomainContent {
    pub fn with_version(&self, version: Id) -> CompositeKey {
        CompositeKey::new(self.location, self.domain, self.content, version)
    }
}

impl Debug for CompositeKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CompositeKey({}/{}/{}/{})",
            self.location, self.domain, self.content, self.version
        )
    }
}

impl Debug for LocationDomain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "LocationDomain({}/{})", self.location, self.domain)
    }
}

impl Debug for LocationDomainContent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LocationDomainContent({}/{}/{})",
            self.location, self.domain, self.content
        )
    }
}
