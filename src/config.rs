use std::time::Duration;

use crate::{
    rpc::{server::DEFAULT_STORAGE_CHECK_INTERVAL, RequestPolicy},
    storage::ProtectionConfig,
};

/// Default number of connection channels shared by all operations.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Default policy of put, put_meta, put_confirm and add requests.
    ///
    /// Defaults to [RequestPolicy::default]
    pub put_policy: RequestPolicy,
    /// Default policy of get requests.
    ///
    /// Defaults to [RequestPolicy::default]
    pub get_policy: RequestPolicy,
    /// Default policy of remove requests.
    ///
    /// Defaults to [RequestPolicy::default]
    pub remove_policy: RequestPolicy,
    /// Default policy of digest requests.
    ///
    /// Defaults to [RequestPolicy::default]
    pub digest_policy: RequestPolicy,
    /// Who may protect domains and entries on the storage side.
    ///
    /// Only used by storage servers created from this config, like the
    /// ones of a [crate::Testnet].
    ///
    /// Defaults to [ProtectionConfig::default]
    pub protection: ProtectionConfig,
    /// Number of connection channels shared by all running operations.
    ///
    /// An operation holds one channel from routing until its last request
    /// is done, so this bounds how many operations run at once.
    ///
    /// Defaults to [DEFAULT_MAX_CONNECTIONS]
    pub max_connections: usize,
    /// How often storage servers sweep expired entries.
    ///
    /// Defaults to [DEFAULT_STORAGE_CHECK_INTERVAL]
    pub storage_check_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            put_policy: RequestPolicy::default(),
            get_policy: RequestPolicy::default(),
            remove_policy: RequestPolicy::default(),
            digest_policy: RequestPolicy::default(),
            protection: ProtectionConfig::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            storage_check_interval: DEFAULT_STORAGE_CHECK_INTERVAL,
        }
    }
}
