//! A remote (or local) participant of the DHT.
use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddr,
};

use serde::{Deserialize, Serialize};

use crate::common::Id;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
/// A peer's id and the address it can be reached at.
pub struct Peer {
    pub id: Id,
    pub address: SocketAddr,
}

impl Peer {
    /// Creates a new Peer from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> Peer {
        Peer { id, address }
    }

    /// Creates a peer with a random [Id] and an unspecified address.
    pub fn random() -> Peer {
        Peer {
            id: Id::random(),
            address: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }
}

impl Debug for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &format!("{}", self.id))
            .field("address", &self.address)
            .finish()
    }
}
