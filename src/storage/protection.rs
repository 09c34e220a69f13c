//! Who may claim a domain or an entry.

use ed25519_dalek::VerifyingKey;

use crate::common::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Whether anyone may claim protection.
pub enum ProtectionEnable {
    /// Anyone may protect an unprotected domain or entry.
    All,
    /// Only the master key may protect, see [ProtectionMode::MasterPublicKey].
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Whether a master key can override someone else's protection.
pub enum ProtectionMode {
    NoMaster,
    /// A key whose sha1 hash equals the domain (or content) id is its master key.
    MasterPublicKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Protection policy of a versioned store.
pub struct ProtectionConfig {
    /// Defaults to [ProtectionEnable::All]
    pub domain_enable: ProtectionEnable,
    /// Defaults to [ProtectionMode::MasterPublicKey]
    pub domain_mode: ProtectionMode,
    /// Defaults to [ProtectionEnable::All]
    pub entry_enable: ProtectionEnable,
    /// Defaults to [ProtectionMode::MasterPublicKey]
    pub entry_mode: ProtectionMode,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            domain_enable: ProtectionEnable::All,
            domain_mode: ProtectionMode::MasterPublicKey,
            entry_enable: ProtectionEnable::All,
            entry_mode: ProtectionMode::MasterPublicKey,
        }
    }
}

/// Sha1 of the public key, the id this key is master of.
pub fn key_hash(public_key: &VerifyingKey) -> Id {
    Id::hash_of(public_key.as_bytes())
}

/// Returns `true` if `public_key` is the master key of `target`.
pub fn is_master_key(target: &Id, public_key: Option<&VerifyingKey>) -> bool {
    public_key.map(|key| &key_hash(key) == target).unwrap_or(false)
}

/// Returns `true` if `public_key` may override protection of `target` under `mode`.
pub fn can_override(mode: ProtectionMode, target: &Id, public_key: Option<&VerifyingKey>) -> bool {
    mode == ProtectionMode::MasterPublicKey && is_master_key(target, public_key)
}

/// Returns `true` if `public_key` may put protection on `target`.
pub fn can_protect(
    enable: ProtectionEnable,
    mode: ProtectionMode,
    target: &Id,
    public_key: Option<&VerifyingKey>,
) -> bool {
    match enable {
        ProtectionEnable::All => public_key.is_some(),
        ProtectionEnable::None => can_override(mode, target, public_key),
    }
}

#[cfg(test)]
mod test {
    use ed25519_dalek::SigningKey;

    use super::*;

    #[test]
    fn master_key_overrides() {
        let key = SigningKey::from_bytes(&[1; 32]).verifying_key();
        let domain = key_hash(&key);

        assert!(can_override(ProtectionMode::MasterPublicKey, &domain, Some(&key)));
        assert!(!can_override(ProtectionMode::NoMaster, &domain, Some(&key)));
        assert!(!can_override(
            ProtectionMode::MasterPublicKey,
            &Id::random(),
            Some(&key)
        ));
        assert!(!can_override(ProtectionMode::MasterPublicKey, &domain, None));
    }

    #[test]
    fn restrictive_mode_requires_master_key() {
        let key = SigningKey::from_bytes(&[2; 32]).verifying_key();

        assert!(can_protect(
            ProtectionEnable::All,
            ProtectionMode::NoMaster,
            &Id::random(),
            Some(&key)
        ));
        assert!(!can_protect(
            ProtectionEnable::None,
            ProtectionMode::MasterPublicKey,
            &Id::random(),
            Some(&key)
        ));
        assert!(can_protect(
            ProtectionEnable::None,
            ProtectionMode::MasterPublicKey,
            &key_hash(&key),
            Some(&key)
        ));
    }
}
