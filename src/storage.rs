//! Local versioned storage of a peer.

mod backend;
mod layer;
pub mod lock;
mod memory;
pub mod protection;

pub use backend::Storage;
pub use layer::{latest_versions, ResponsibilityListener, StorageLayer};
pub use memory::MemoryStorage;
pub use protection::{ProtectionConfig, ProtectionEnable, ProtectionMode};
