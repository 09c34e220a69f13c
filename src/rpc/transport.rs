//! Collaborators the quorum layer talks through: routing, transport and connection channels.

use std::fmt::Debug;

use futures::future::BoxFuture;

use crate::{
    common::{messages::RequestKind, Id, Peer, RequestSpecific, ResponseSpecific},
    error::TransportError,
    Error, Result,
};

use super::RequestPolicy;

/// Sends a single request to a single peer.
pub trait Transport: Send + Sync + Debug {
    fn send(
        &self,
        peer: &Peer,
        request: RequestSpecific,
    ) -> BoxFuture<'static, Result<ResponseSpecific, TransportError>>;
}

/// Finds the peers a request for `target` should be sent to.
pub trait Routing: Send + Sync + Debug {
    fn route(
        &self,
        target: Id,
        policy: &RequestPolicy,
        kind: RequestKind,
    ) -> BoxFuture<'static, Result<RoutingResult>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Candidates for a request, each list ordered by preference.
pub struct RoutingResult {
    /// Peers known to hold data for the target.
    pub direct_hits: Vec<Peer>,
    /// Peers close to the target, not known to hold anything.
    pub potential_hits: Vec<Peer>,
}

impl RoutingResult {
    /// Number of distinct candidates.
    pub fn len(&self) -> usize {
        let mut ids: Vec<&Id> = self
            .direct_hits
            .iter()
            .chain(self.potential_hits.iter())
            .map(|peer| &peer.id)
            .collect();
        ids.sort();
        ids.dedup();

        ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.direct_hits.is_empty() && self.potential_hits.is_empty()
    }
}

#[derive(Debug, Clone)]
/// A fixed number of connection channels shared by all operations of a [crate::Dht].
///
/// An operation waits for a free channel before sending anything, and
/// returns it when its [ChannelHandle] drops.
pub struct ConnectionPool {
    sender: flume::Sender<()>,
    receiver: flume::Receiver<()>,
}

impl ConnectionPool {
    pub fn new(max_connections: usize) -> Self {
        let capacity = max_connections.max(1);
        let (sender, receiver) = flume::bounded(capacity);

        for _ in 0..capacity {
            let _ = sender.try_send(());
        }

        Self { sender, receiver }
    }

    /// Wait for a free channel.
    pub async fn acquire(&self) -> Result<ChannelHandle> {
        self.receiver
            .recv_async()
            .await
            .map_err(|_| Error::DhtWasShutdown)?;

        Ok(ChannelHandle {
            sender: self.sender.clone(),
        })
    }

    /// Number of free channels.
    pub fn available(&self) -> usize {
        self.receiver.len()
    }
}

#[derive(Debug)]
/// A connection channel held by one operation.
pub struct ChannelHandle {
    sender: flume::Sender<()>,
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        let _ = self.sender.try_send(());
    }
}
