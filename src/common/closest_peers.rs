//! Peers sorted by their XOR distance to a target.
use crate::common::{Id, Peer};

#[derive(Debug, Clone)]
/// An ordered set of peers, closest to `target` first, unique by [Peer::id].
pub struct ClosestPeers {
    target: Id,
    peers: Vec<Peer>,
}

impl ClosestPeers {
    pub fn new(target: Id) -> Self {
        Self {
            target,
            peers: Vec::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.target
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    // === Public Methods ===

    /// Insert a peer at its position by distance. Returns `false` if a peer
    /// with the same id was already present.
    pub fn add(&mut self, peer: Peer) -> bool {
        if self.peers.iter().any(|p| p.id == peer.id) {
            return false;
        }

        let seek = peer.id.xor(&self.target);

        let pos = match self
            .peers
            .binary_search_by(|probe| probe.id.xor(&self.target).cmp(&seek))
        {
            Ok(pos) | Err(pos) => pos,
        };

        self.peers.insert(pos, peer);

        true
    }

    /// Keep only the `k` closest peers.
    pub fn truncate(&mut self, k: usize) {
        self.peers.truncate(k);
    }

    pub fn into_vec(self) -> Vec<Peer> {
        self.peers
    }
}

impl Extend<Peer> for ClosestPeers {
    fn extend<T: IntoIterator<Item = Peer>>(&mut self, iter: T) {
        for peer in iter {
            self.add(peer);
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;

    fn peer(id: u64) -> Peer {
        Peer::new(Id::from(id), SocketAddr::from(([127, 0, 0, 1], id as u16)))
    }

    #[test]
    fn sorted_by_distance() {
        let mut closest = ClosestPeers::new(Id::from(0b1000));

        closest.add(peer(0b0001));
        closest.add(peer(0b1001));
        closest.add(peer(0b1100));
        closest.add(peer(0b1000));

        let ids: Vec<Id> = closest.peers().iter().map(|p| p.id).collect();

        assert_eq!(
            ids,
            vec![
                Id::from(0b1000),
                Id::from(0b1001),
                Id::from(0b1100),
                Id::from(0b0001)
            ]
        );
    }

    #[test]
    fn no_duplicate_ids() {
        let mut closest = ClosestPeers::new(Id::random());

        assert!(closest.add(peer(7)));
        assert!(!closest.add(peer(7)));
        assert_eq!(closest.len(), 1);
    }
}
