//! Miscellaneous common structs used throughout the library.

mod closest_peers;
mod digest;
mod entry;
mod filter;
mod id;
mod key;
pub mod messages;
mod outcome;
mod peer;

use std::time::{SystemTime, UNIX_EPOCH};

pub use closest_peers::*;
pub use digest::*;
pub use entry::*;
pub use filter::*;
pub use id::*;
pub use key::*;
pub use messages::*;
pub use outcome::*;
pub use peer::*;

/// Wall clock in millis since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
