//! 160-bit identifiers used for peers and for every component of a [super::CompositeKey].
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1_smol::Sha1;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of ids in bytes.
pub const ID_SIZE: usize = 20;
pub const MAX_DISTANCE: u8 = ID_SIZE as u8 * 8;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// Unsigned 160-bit identifier, ordered numerically (big-endian).
pub struct Id(#[serde(with = "serde_bytes")] pub [u8; ID_SIZE]);

impl Id {
    /// The smallest id, also the version of a root entry created without a clock.
    pub const ZERO: Id = Id([0; ID_SIZE]);
    /// The largest id.
    pub const MAX: Id = Id([u8::MAX; ID_SIZE]);

    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    /// Sha1 hash of arbitrary bytes.
    ///
    /// Used for content addressed keys and to check if a public key is the
    /// "master key" of a domain or entry.
    pub fn hash_of(bytes: &[u8]) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(bytes);

        Id(hasher.digest().bytes())
    }

    /// A version id derived from a wall clock in milliseconds.
    ///
    /// Timestamps sit in the most significant bytes, so versions created later
    /// compare greater, and the remaining bytes are taken from `discriminator`
    /// to keep concurrent writers apart.
    pub fn from_timestamp_millis(millis: u64, discriminator: &Id) -> Id {
        let mut bytes = discriminator.0;
        bytes[..8].copy_from_slice(&millis.to_be_bytes());

        Id(bytes)
    }

    /// Simplified XOR distance between this Id and a target Id.
    ///
    /// The distance is the number of trailing non zero bits in the XOR result.
    ///
    /// Distance to self is 0
    /// Distance to the furthest Id is 160
    /// Distance to an Id with 5 leading matching bits is 155
    pub fn distance(&self, other: &Id) -> u8 {
        for i in 0..ID_SIZE {
            let a = self.0[i];
            let b = other.0[i];

            if a != b {
                // leading zeros so far + leading zeros of this byte
                let leading_zeros = (i as u32 * 8 + (a ^ b).leading_zeros()) as u8;

                return MAX_DISTANCE - leading_zeros;
            }
        }

        0
    }

    pub fn xor(&self, other: &Id) -> Id {
        let mut result = [0_u8; ID_SIZE];

        for (i, (a, b)) in self.0.iter().zip(other.0).enumerate() {
            result[i] = a ^ b;
        }

        Id(result)
    }

    pub fn is_zero(&self) -> bool {
        self == &Id::ZERO
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        let mut bytes = [0_u8; ID_SIZE];
        bytes[ID_SIZE - 8..].copy_from_slice(&value.to_be_bytes());

        Id(bytes)
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Self {
        Id(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() % 2 != 0 {
            return Err(Error::InvalidIdEncoding(s.to_string()));
        }

        let bytes = (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|_| Error::InvalidIdEncoding(s.to_string()))?;

        Id::from_bytes(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_to_self() {
        let id = Id::random();
        let distance = id.distance(&id);
        assert_eq!(distance, 0)
    }

    #[test]
    fn distance_to_id() {
        let id = Id::from_str("0639A1E24FBB8AB277DF033476AB0DE10FAB3BDC").unwrap();

        let target = Id::from_str("035b1aeb9737ade1a80933594f405d3f772aa08e").unwrap();

        let distance = id.distance(&target);

        assert_eq!(distance, 155)
    }

    #[test]
    fn display_round_trips_through_from_str() {
        let id = Id::random();

        assert_eq!(Id::from_str(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn invalid_size() {
        assert!(matches!(
            Id::from_bytes([0_u8; 19]),
            Err(Error::InvalidIdSize(19))
        ));
        assert!(Id::from_str("zz").is_err());
    }

    #[test]
    fn numeric_ordering() {
        assert!(Id::from(1) < Id::from(2));
        assert!(Id::from(u64::MAX) < Id::from_timestamp_millis(1, &Id::ZERO));
        assert!(Id::ZERO < Id::MAX);
    }

    #[test]
    fn timestamp_versions_are_monotonic() {
        let a = Id::from_timestamp_millis(1_000, &Id::MAX);
        let b = Id::from_timestamp_millis(1_001, &Id::ZERO);

        assert!(a < b);
    }

    #[test]
    fn xor_with_self_is_zero() {
        let id = Id::random();

        assert!(id.xor(&id).is_zero());
    }
}
