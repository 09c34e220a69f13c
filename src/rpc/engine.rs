//! Quorum request engine.
//!
//! Sends one request per peer, a bounded number at a time, and replaces
//! failed peers from the candidate pool until enough peers answered or the
//! failure budget ran out.

use std::collections::{BTreeSet, VecDeque};

use futures::{
    future::{AbortHandle, Abortable, BoxFuture},
    stream::FuturesUnordered,
    FutureExt, StreamExt,
};
use tracing::{debug, trace};

use crate::{
    common::{Id, Peer, ResponseSpecific},
    error::TransportError,
};

use super::{future::Cancellation, RequestPolicy};

/// Reduces the responses of one operation and completes its future.
pub trait Aggregator: Send {
    /// Called once for every peer that answered or failed.
    fn on_response(&mut self, peer: &Peer, response: Result<ResponseSpecific, TransportError>);

    /// Called once, after the last response this aggregator will see.
    fn finish(self, summary: EngineSummary);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// What the engine did for an operation.
pub struct EngineSummary {
    pub contacted: usize,
    pub successes: usize,
    pub failures: usize,
    pub rounds: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Finish,
    Continue,
}

#[derive(Debug, Clone)]
/// Candidate pools and counters of a running quorum request.
pub struct QuorumState {
    direct_hits: VecDeque<Peer>,
    potential_hits: VecDeque<Peer>,
    policy: RequestPolicy,
    /// Requests in flight at once, fixed for the whole request.
    slots: usize,
    failures: usize,
    successes: usize,
    rounds: usize,
    contacted: usize,
}

impl QuorumState {
    /// Potential hits that are also direct hits are dropped, as are repeated
    /// peers within either list.
    pub fn new(policy: RequestPolicy, direct_hits: Vec<Peer>, potential_hits: Vec<Peer>) -> Self {
        let mut seen = BTreeSet::<Id>::new();

        let direct_hits = direct_hits
            .into_iter()
            .filter(|peer| seen.insert(peer.id))
            .collect();
        let potential_hits = potential_hits
            .into_iter()
            .filter(|peer| seen.insert(peer.id))
            .collect();

        Self {
            direct_hits,
            potential_hits,
            policy,
            slots: policy.parallel(),
            failures: 0,
            successes: 0,
            rounds: 0,
            contacted: 0,
        }
    }

    // === Getters ===

    pub fn policy(&self) -> &RequestPolicy {
        &self.policy
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn remaining(&self) -> usize {
        self.direct_hits.len() + self.potential_hits.len()
    }

    pub fn summary(&self, cancelled: bool) -> EngineSummary {
        EngineSummary {
            contacted: self.contacted,
            successes: self.successes,
            failures: self.failures,
            rounds: self.rounds,
            cancelled,
        }
    }

    // === Transitions ===

    /// The next peer to contact, direct hits first.
    pub fn next_peer(&mut self) -> Option<Peer> {
        let peer = self
            .direct_hits
            .pop_front()
            .or_else(|| self.potential_hits.pop_front());

        if peer.is_some() {
            self.contacted += 1;
        }

        peer
    }

    /// Successes a round waits for, given `active` requests in flight.
    pub fn round_target(&self, active: usize) -> usize {
        self.policy.minimum_results().min(active)
    }

    /// Record a finished round and decide whether to go on.
    ///
    /// `reached` is whether the round collected its target of successes.
    pub fn after_round(&mut self, succeeded: usize, failed: usize, reached: bool) -> Step {
        self.rounds += 1;
        self.successes += succeeded;
        self.failures += failed;

        if reached || self.failures > self.policy.max_failures() {
            return Step::Finish;
        }

        let minimum = self.policy.minimum_results().saturating_sub(succeeded);
        self.policy = self.policy.with_minimum_results(minimum);

        Step::Continue
    }
}

type Request = BoxFuture<'static, (Peer, Result<ResponseSpecific, TransportError>)>;

#[derive(Debug, Clone, Copy, Default)]
pub struct QuorumRequestEngine;

impl QuorumRequestEngine {
    /// Run a quorum request to completion.
    ///
    /// `factory` issues one request to one peer. Every request is registered
    /// on `cancellation`. The aggregator sees each contacted peer at most once,
    /// and is finished exactly once.
    ///
    /// With `cancel_on_finish`, requests still in flight when the aggregator
    /// finishes are aborted; otherwise they run to completion before this
    /// returns, without being reported.
    pub async fn execute<F, A>(
        &self,
        policy: RequestPolicy,
        direct_hits: Vec<Peer>,
        potential_hits: Vec<Peer>,
        cancel_on_finish: bool,
        factory: F,
        mut aggregator: A,
        cancellation: &Cancellation,
    ) where
        F: Fn(&Peer) -> BoxFuture<'static, Result<ResponseSpecific, TransportError>>,
        A: Aggregator,
    {
        let mut state = QuorumState::new(policy, direct_hits, potential_hits);

        if policy.minimum_results() == 0 {
            trace!("Nothing to ask for, finishing without requests");
            aggregator.finish(state.summary(false));
            return;
        }

        let mut in_flight = FuturesUnordered::<Request>::new();
        let mut handles = Vec::new();

        loop {
            if cancellation.is_cancelled() {
                break;
            }

            while in_flight.len() < state.slots() {
                let Some(peer) = state.next_peer() else {
                    break;
                };

                trace!(?peer, "Sending request");

                let (handle, registration) = AbortHandle::new_pair();
                cancellation.register(handle.clone());
                handles.push(handle);

                let request = Abortable::new(factory(&peer), registration).map(move |result| {
                    let response = result.unwrap_or(Err(TransportError::Cancelled));
                    (peer, response)
                });

                in_flight.push(request.boxed());
            }

            let active = in_flight.len();

            if active == 0 {
                debug!(summary = ?state.summary(false), "Candidates exhausted");
                break;
            }

            let target = state.round_target(active);
            let failure_limit = active - target + 1;
            let (mut succeeded, mut failed) = (0, 0);

            while succeeded < target && failed < failure_limit {
                let Some((peer, response)) = in_flight.next().await else {
                    break;
                };

                match &response {
                    Ok(_) => succeeded += 1,
                    Err(error) => {
                        trace!(?peer, ?error, "Request failed");
                        failed += 1
                    }
                }

                aggregator.on_response(&peer, response);
            }

            if state.after_round(succeeded, failed, succeeded >= target) == Step::Finish {
                break;
            }
        }

        let summary = state.summary(cancellation.is_cancelled());

        debug!(?summary, "Quorum request finished");

        aggregator.finish(summary);

        if cancel_on_finish || summary.cancelled {
            for handle in handles {
                handle.abort();
            }
        } else {
            while in_flight.next().await.is_some() {}
        }
    }
}
