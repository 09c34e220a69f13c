//! An in-process network of storage servers, for tests and local experiments.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use futures::{
    future::{self, BoxFuture},
    FutureExt,
};
use tracing::trace;

use crate::{
    common::{messages::RequestKind, ClosestPeers, Id, Peer, RequestSpecific, ResponseSpecific},
    error::TransportError,
    rpc::{RequestPolicy, Routing, RoutingResult, StorageServer, StorageServerSettings, Transport},
    storage::{MemoryStorage, StorageLayer},
    Config, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Misbehavior injected into a single peer of a [Testnet].
pub enum Fault {
    /// Every request fails right away.
    Unreachable,
    /// Every request fails with [TransportError::Timeout] after the duration.
    Timeout(Duration),
    /// Every request is answered after the duration.
    Delay(Duration),
}

#[derive(Debug)]
struct Inner {
    client: Peer,
    peers: Vec<Peer>,
    servers: HashMap<Id, StorageServer>,
    faults: Mutex<HashMap<Id, Fault>>,
}

#[derive(Debug, Clone)]
/// Create a testnet of storage servers, reachable by any [crate::Dht] built
/// with [crate::DhtBuilder::testnet].
///
/// Routes every target to all of its peers, closest first. Peers already
/// holding data for the target are reported as direct hits.
pub struct Testnet {
    inner: Arc<Inner>,
}

impl Testnet {
    pub fn new(count: usize) -> Testnet {
        Testnet::with_config(count, &Config::default())
    }

    /// Create `count` peers whose storage follows the protection and expiry
    /// settings of `config`.
    pub fn with_config(count: usize, config: &Config) -> Testnet {
        let peers: Vec<Peer> = (0..count)
            .map(|i| {
                Peer::new(
                    Id::random(),
                    SocketAddr::from(([127, 0, 0, 1], 6881 + i as u16)),
                )
            })
            .collect();

        let servers = peers
            .iter()
            .map(|peer| {
                let storage = StorageLayer::new(Box::new(MemoryStorage::new()), config.protection);
                let settings = StorageServerSettings {
                    storage_check_interval: config.storage_check_interval,
                    ..Default::default()
                };

                (peer.id, StorageServer::new(peer.id, storage, settings))
            })
            .collect();

        Testnet {
            inner: Arc::new(Inner {
                client: Peer::new(Id::random(), SocketAddr::from(([127, 0, 0, 1], 6880))),
                peers,
                servers,
                faults: Mutex::new(HashMap::new()),
            }),
        }
    }

    // === Getters ===

    pub fn peers(&self) -> &[Peer] {
        &self.inner.peers
    }

    pub fn server(&self, peer: &Id) -> Option<&StorageServer> {
        self.inner.servers.get(peer)
    }

    pub fn servers(&self) -> impl Iterator<Item = &StorageServer> {
        self.inner.peers.iter().filter_map(|peer| self.server(&peer.id))
    }

    // === Public Methods ===

    pub fn set_fault(&self, peer: &Id, fault: Fault) {
        self.faults().insert(*peer, fault);
    }

    pub fn clear_fault(&self, peer: &Id) {
        self.faults().remove(peer);
    }

    /// Run [StorageServer::maintain] on every peer.
    pub fn maintain(&self) {
        for server in self.servers() {
            server.maintain();
        }
    }

    // === Private Methods ===

    fn faults(&self) -> MutexGuard<'_, HashMap<Id, Fault>> {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(
        &self,
        peer: &Id,
        request: &RequestSpecific,
    ) -> Result<ResponseSpecific, TransportError> {
        let server = self.server(peer).ok_or(TransportError::Unreachable)?;

        server
            .handle_request(&self.inner.client, request)
            .ok_or_else(|| TransportError::Rejected("Request filtered".to_string()))
    }
}

impl Routing for Testnet {
    fn route(
        &self,
        target: Id,
        _policy: &RequestPolicy,
        kind: RequestKind,
    ) -> BoxFuture<'static, Result<RoutingResult>> {
        let mut closest = ClosestPeers::new(target);
        closest.extend(self.inner.peers.iter().copied());

        let (direct_hits, potential_hits): (Vec<Peer>, Vec<Peer>) =
            closest.into_vec().into_iter().partition(|peer| {
                self.server(&peer.id)
                    .map(|server| !server.storage().backend().is_location_empty(&target))
                    .unwrap_or(false)
            });

        let result = RoutingResult {
            direct_hits,
            potential_hits,
        };

        trace!(?target, ?kind, direct = result.direct_hits.len(), "Routed");

        future::ready(Ok(result)).boxed()
    }
}

impl Transport for Testnet {
    fn send(
        &self,
        peer: &Peer,
        request: RequestSpecific,
    ) -> BoxFuture<'static, Result<ResponseSpecific, TransportError>> {
        let fault = self.faults().get(&peer.id).copied();

        let delay = match fault {
            None => return future::ready(self.handle(&peer.id, &request)).boxed(),
            Some(Fault::Unreachable) => {
                return future::ready(Err(TransportError::Unreachable)).boxed()
            }
            Some(Fault::Timeout(delay)) | Some(Fault::Delay(delay)) => delay,
        };

        let (sender, receiver) = flume::bounded(1);
        let testnet = self.clone();
        let id = peer.id;

        thread::spawn(move || {
            thread::sleep(delay);

            let response = match fault {
                Some(Fault::Delay(_)) => testnet.handle(&id, &request),
                _ => Err(TransportError::Timeout),
            };

            let _ = sender.send(response);
        });

        async move {
            receiver
                .recv_async()
                .await
                .unwrap_or(Err(TransportError::Cancelled))
        }
        .boxed()
    }
}
