//! Dht node.

mod requests;
mod testnet;

use std::{sync::Arc, time::Duration};

use futures::executor::ThreadPool;
use tracing::debug;

use crate::{
    common::{
        messages::{
            DigestRequestArguments, GetRequestArguments, PutMetaRequestArguments,
            PutRequestArguments, RemoveRequestArguments, RequestKind, Selection,
        },
        Id, RequestSpecific,
    },
    rpc::{
        Aggregator, ConnectionPool, DigestFuture, EvaluationScheme, GetFuture, PutFuture,
        QuorumRequestEngine, RemoveFuture, RequestPolicy, ResultFuture, Routing, Transport,
        VotingScheme,
    },
    storage::ProtectionConfig,
    Config, Error, Result,
};

pub use requests::{
    AddRequest, DigestRequest, GetRequest, PutMetaRequest, PutRequest, RemoveRequest,
};
pub use testnet::{Fault, Testnet};

#[derive(Debug, Clone)]
/// A client of a quorum-replicated, versioned DHT.
///
/// Every operation returns a typed future right away, and runs in the
/// background: route to candidates, narrow the policy to what is
/// available, wait for a connection channel, then ask peers until the
/// policy is satisfied or the failure budget is spent.
pub struct Dht(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    config: Config,
    routing: Arc<dyn Routing>,
    transport: Arc<dyn Transport>,
    connections: ConnectionPool,
    executor: ThreadPool,
}

/// Which candidates bound the minimum results of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidates {
    /// Every routed peer.
    All,
    /// Only peers known to hold data for the target.
    DirectHits,
}

/// Everything needed to drive one operation in the background.
#[derive(Debug)]
struct Operation {
    name: &'static str,
    target: Id,
    kind: RequestKind,
    policy: RequestPolicy,
    candidates: Candidates,
    cancel_on_finish: bool,
    request: RequestSpecific,
}

impl Dht {
    /// Returns a builder to edit settings before creating a Dht.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    // === Getters ===

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Number of connection channels currently free.
    pub fn available_connections(&self) -> usize {
        self.0.connections.available()
    }

    // === Public Methods ===

    /// Store entries, creating new keys or overwriting existing ones.
    pub fn put(&self, request: PutRequest) -> PutFuture {
        let evaluation = self.evaluation(request.evaluation_scheme());

        let entries = match request.entries() {
            Ok(entries) => entries,
            Err(error) => return PutFuture::failed(error.to_string(), evaluation),
        };

        let policy = request.policy_or(self.0.config.put_policy);
        let future = PutFuture::new(policy.minimum_results(), entries.len(), evaluation);

        self.spawn(
            Operation {
                name: "put",
                target: request.location(),
                kind: RequestKind::Put,
                policy,
                candidates: Candidates::All,
                cancel_on_finish: false,
                request: RequestSpecific::Put(PutRequestArguments {
                    entries,
                    owner: request.owner_key().copied(),
                    put_if_absent: request.is_put_if_absent(),
                    claim_domain_protection: request.claims_domain_protection(),
                }),
            },
            (*future).clone(),
            future.aggregator(),
        );

        future
    }

    /// Store values under the Sha1 hash of each value.
    pub fn add(&self, request: AddRequest) -> PutFuture {
        self.put(request.into())
    }

    /// Update metadata of stored entries, like their ttl or owner.
    pub fn put_meta(&self, request: PutMetaRequest) -> PutFuture {
        self.put_meta_inner(request, false)
    }

    /// Confirm entries stored as prepared, making them visible to readers.
    pub fn put_confirm(&self, request: PutMetaRequest) -> PutFuture {
        self.put_meta_inner(request, true)
    }

    pub fn get(&self, request: GetRequest) -> GetFuture {
        let evaluation = self.evaluation(request.evaluation_scheme());

        let selection = match request.selection() {
            Ok(selection) => selection,
            Err(error) => return GetFuture::failed(error.to_string(), evaluation),
        };

        let policy = request.policy_or(self.0.config.get_policy);
        let future = GetFuture::new(policy.minimum_results(), evaluation);

        self.spawn(
            Operation {
                name: "get",
                target: request.location(),
                kind: RequestKind::Get,
                policy,
                candidates: candidates_of(&selection),
                cancel_on_finish: true,
                request: RequestSpecific::Get(GetRequestArguments {
                    selection,
                    latest_only: request.is_latest_only(),
                }),
            },
            (*future).clone(),
            future.aggregator(),
        );

        future
    }

    pub fn remove(&self, request: RemoveRequest) -> RemoveFuture {
        let evaluation = self.evaluation(request.evaluation_scheme());

        let selection = match request.selection() {
            Ok(selection) => selection,
            Err(error) => return RemoveFuture::failed(error.to_string(), evaluation),
        };

        let policy = request.policy_or(self.0.config.remove_policy);
        let future = RemoveFuture::new(policy.minimum_results(), evaluation);

        self.spawn(
            Operation {
                name: "remove",
                target: request.location(),
                kind: RequestKind::Remove,
                policy,
                candidates: candidates_of(&selection),
                cancel_on_finish: true,
                request: RequestSpecific::Remove(RemoveRequestArguments {
                    selection,
                    owner: request.owner_key().copied(),
                    return_data: request.is_return_data(),
                }),
            },
            (*future).clone(),
            future.aggregator(),
        );

        future
    }

    pub fn digest(&self, request: DigestRequest) -> DigestFuture {
        let evaluation = self.evaluation(request.evaluation_scheme());

        let selection = match request.selection() {
            Ok(selection) => selection,
            Err(error) => return DigestFuture::failed(error.to_string(), evaluation),
        };

        let policy = request.policy_or(self.0.config.digest_policy);
        let future = DigestFuture::new(policy.minimum_results(), evaluation);

        self.spawn(
            Operation {
                name: "digest",
                target: request.location(),
                kind: RequestKind::Digest,
                policy,
                candidates: Candidates::All,
                cancel_on_finish: true,
                request: RequestSpecific::Digest(DigestRequestArguments { selection }),
            },
            (*future).clone(),
            future.aggregator(),
        );

        future
    }

    // === Private Methods ===

    fn put_meta_inner(&self, request: PutMetaRequest, confirm: bool) -> PutFuture {
        let evaluation = self.evaluation(request.evaluation_scheme());

        let updates = match request.updates() {
            Ok(updates) => updates,
            Err(error) => return PutFuture::failed(error.to_string(), evaluation),
        };

        let policy = request.policy_or(self.0.config.put_policy);
        let future = PutFuture::new(policy.minimum_results(), updates.len(), evaluation);

        let arguments = PutMetaRequestArguments {
            updates,
            owner: request.owner_key().copied(),
        };

        self.spawn(
            Operation {
                name: if confirm { "put_confirm" } else { "put_meta" },
                target: request.location(),
                kind: RequestKind::Put,
                policy,
                candidates: Candidates::DirectHits,
                cancel_on_finish: false,
                request: if confirm {
                    RequestSpecific::PutConfirm(arguments)
                } else {
                    RequestSpecific::PutMeta(arguments)
                },
            },
            (*future).clone(),
            future.aggregator(),
        );

        future
    }

    fn evaluation(
        &self,
        evaluation: Option<Arc<dyn EvaluationScheme>>,
    ) -> Arc<dyn EvaluationScheme> {
        evaluation.unwrap_or_else(|| Arc::new(VotingScheme))
    }

    fn spawn<T, A>(&self, operation: Operation, future: ResultFuture<T>, aggregator: A)
    where
        T: Send + 'static,
        A: Aggregator + 'static,
    {
        let inner = self.0.clone();

        self.0
            .executor
            .spawn_ok(drive(inner, operation, future, aggregator));
    }
}

/// Get and remove of explicit keys only need the peers holding them.
fn candidates_of(selection: &Selection) -> Candidates {
    if selection.is_range() {
        Candidates::All
    } else {
        Candidates::DirectHits
    }
}

async fn drive<T, A>(
    inner: Arc<Inner>,
    operation: Operation,
    future: ResultFuture<T>,
    aggregator: A,
) where
    T: Send + 'static,
    A: Aggregator,
{
    let Operation {
        name,
        target,
        kind,
        policy,
        candidates,
        cancel_on_finish,
        request,
    } = operation;

    let routing = match inner.routing.route(target, &policy, kind).await {
        Ok(routing) => routing,
        Err(error) => {
            debug!(operation = name, ?target, ?error, "Routing failed");
            future.fail(error.to_string());
            return;
        }
    };

    let available = match candidates {
        Candidates::All => routing.len(),
        Candidates::DirectHits => routing.direct_hits.len(),
    };
    let adjusted = policy.adjust_to(available);
    future.narrow_minimum_results(adjusted.minimum_results());

    debug!(
        operation = name,
        ?target,
        direct = routing.direct_hits.len(),
        potential = routing.potential_hits.len(),
        minimum_results = adjusted.minimum_results(),
        "Routed operation"
    );

    let _channel = match inner.connections.acquire().await {
        Ok(channel) => channel,
        Err(error) => {
            future.fail(error.to_string());
            return;
        }
    };

    let transport = inner.transport.clone();

    QuorumRequestEngine
        .execute(
            adjusted,
            routing.direct_hits,
            routing.potential_hits,
            cancel_on_finish,
            move |peer| transport.send(peer, request.clone()),
            aggregator,
            future.cancellation(),
        )
        .await;
}

#[derive(Debug, Default)]
/// Build a [Dht] from a [Config], a [Routing] and a [Transport].
pub struct DhtBuilder {
    config: Config,
    routing: Option<Arc<dyn Routing>>,
    transport: Option<Arc<dyn Transport>>,
    threads: Option<usize>,
}

impl DhtBuilder {
    /// Replace the whole [Config].
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set [Config::put_policy]
    pub fn put_policy(mut self, policy: RequestPolicy) -> Self {
        self.config.put_policy = policy;
        self
    }

    /// Set [Config::get_policy]
    pub fn get_policy(mut self, policy: RequestPolicy) -> Self {
        self.config.get_policy = policy;
        self
    }

    /// Set [Config::remove_policy]
    pub fn remove_policy(mut self, policy: RequestPolicy) -> Self {
        self.config.remove_policy = policy;
        self
    }

    /// Set [Config::digest_policy]
    pub fn digest_policy(mut self, policy: RequestPolicy) -> Self {
        self.config.digest_policy = policy;
        self
    }

    /// Set [Config::protection]
    pub fn protection(mut self, protection: ProtectionConfig) -> Self {
        self.config.protection = protection;
        self
    }

    /// Set [Config::max_connections]
    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.config.max_connections = max_connections;
        self
    }

    /// Set [Config::storage_check_interval]
    pub fn storage_check_interval(mut self, interval: Duration) -> Self {
        self.config.storage_check_interval = interval;
        self
    }

    pub fn routing(mut self, routing: Arc<dyn Routing>) -> Self {
        self.routing = Some(routing);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Route and send through an in-process [Testnet].
    pub fn testnet(self, testnet: &Testnet) -> Self {
        self.routing(Arc::new(testnet.clone()))
            .transport(Arc::new(testnet.clone()))
    }

    /// Number of threads driving operations.
    ///
    /// Defaults to one per cpu.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn build(self) -> Result<Dht> {
        let routing = self.routing.ok_or(Error::BuilderMissingFieldError("routing"))?;
        let transport = self
            .transport
            .ok_or(Error::BuilderMissingFieldError("transport"))?;

        let mut executor = ThreadPool::builder();
        executor.name_prefix("quorum-dht-");
        if let Some(threads) = self.threads {
            executor.pool_size(threads.max(1));
        }

        Ok(Dht(Arc::new(Inner {
            connections: ConnectionPool::new(self.config.max_connections),
            config: self.config,
            routing,
            transport,
            executor: executor.create()?,
        })))
    }
}
