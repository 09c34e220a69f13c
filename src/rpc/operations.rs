//! Typed futures of the put, get, remove and digest operations.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Debug, Formatter},
    ops::Deref,
    sync::{Arc, OnceLock},
};

use bytes::Bytes;
use tracing::debug;

use crate::{
    common::{
        CompositeKey, Digest, Entry, Peer, PutOutcome, RemoveResponseArguments, ResponseSpecific,
    },
    error::{EvaluationError, TransportError},
};

use super::{
    engine::{Aggregator, EngineSummary},
    evaluation::EvaluationScheme,
    future::{RawResults, ResultFuture},
};

pub type Outcomes = BTreeMap<CompositeKey, PutOutcome>;
pub type DataMap = BTreeMap<CompositeKey, Entry>;

/// Collects the successful responses of one operation into its [ResultFuture].
///
/// Transport failures are not recorded; they only count against the
/// engine's failure budget.
pub(crate) struct Collector<T> {
    operation: &'static str,
    results: RawResults<T>,
    future: ResultFuture<T>,
    extract: fn(ResponseSpecific) -> Option<T>,
}

impl<T> Collector<T> {
    fn new(
        operation: &'static str,
        future: ResultFuture<T>,
        extract: fn(ResponseSpecific) -> Option<T>,
    ) -> Self {
        Self {
            operation,
            results: Vec::new(),
            future,
            extract,
        }
    }
}

impl<T: Send> Aggregator for Collector<T> {
    fn on_response(&mut self, peer: &Peer, response: Result<ResponseSpecific, TransportError>) {
        let operation = self.operation;

        match response {
            Ok(response) => match (self.extract)(response) {
                Some(result) => self.results.push((*peer, result)),
                None => debug!(?peer, operation, "Unexpected response type"),
            },
            Err(error) => debug!(?peer, operation, ?error, "Request failed"),
        }
    }

    fn finish(self, summary: EngineSummary) {
        debug!(operation = self.operation, ?summary, "Operation finished");

        if summary.cancelled {
            self.future.fail("Cancelled");
        } else {
            self.future.complete(self.results);
        }
    }
}

/// Evaluate once the future is completed, recompute while it is pending.
fn memoized<T: Clone>(cell: &OnceLock<T>, completed: bool, evaluate: impl FnOnce() -> T) -> T {
    if completed {
        cell.get_or_init(evaluate).clone()
    } else {
        evaluate()
    }
}

macro_rules! typed_future {
    ($name:ident, $result:ty) => {
        impl Deref for $name {
            type Target = ResultFuture<$result>;

            fn deref(&self) -> &Self::Target {
                &self.inner
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("inner", &self.inner)
                    .field("evaluation", &self.evaluation)
                    .finish()
            }
        }
    };
}

// === Put ===

#[derive(Clone)]
/// Result of a put, put_meta or put_confirm.
pub struct PutFuture {
    inner: ResultFuture<Outcomes>,
    data_size: usize,
    evaluation: Arc<dyn EvaluationScheme>,
    stored: Arc<OnceLock<BTreeMap<CompositeKey, usize>>>,
    outcomes: Arc<OnceLock<Outcomes>>,
}

typed_future!(PutFuture, Outcomes);

impl PutFuture {
    /// `data_size` is the number of keys the request tried to store.
    pub fn new(
        minimum_results: usize,
        data_size: usize,
        evaluation: Arc<dyn EvaluationScheme>,
    ) -> Self {
        Self::from_inner(ResultFuture::new(minimum_results), data_size, evaluation)
    }

    pub(crate) fn failed(reason: impl Into<String>, evaluation: Arc<dyn EvaluationScheme>) -> Self {
        Self::from_inner(ResultFuture::failed(reason), 0, evaluation)
    }

    fn from_inner(
        inner: ResultFuture<Outcomes>,
        data_size: usize,
        evaluation: Arc<dyn EvaluationScheme>,
    ) -> Self {
        Self {
            inner,
            data_size,
            evaluation,
            stored: Default::default(),
            outcomes: Default::default(),
        }
    }

    pub(crate) fn aggregator(&self) -> Collector<Outcomes> {
        Collector::new("put", self.inner.clone(), |response| match response {
            ResponseSpecific::Outcomes(outcomes) => Some(outcomes),
            _ => None,
        })
    }

    /// Number of keys the request tried to store.
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// For every key, the number of peers that stored it.
    pub fn result(&self) -> BTreeMap<CompositeKey, usize> {
        memoized(&self.stored, self.is_completed(), || {
            self.inner.with_raw(|raw| {
                let mut stored = BTreeMap::new();

                for (_, outcomes) in raw {
                    for (key, outcome) in outcomes {
                        if outcome.is_stored() {
                            *stored.entry(*key).or_default() += 1;
                        }
                    }
                }

                stored
            })
        })
    }

    /// Average number of peers each stored key landed on.
    pub fn avg_stored_keys(&self) -> f64 {
        let result = self.result();

        if result.is_empty() {
            return 0.0;
        }

        result.values().sum::<usize>() as f64 / result.len() as f64
    }

    /// Every answering peer stored every key.
    ///
    /// Stricter than the quorum: one peer reporting anything but a stored
    /// outcome for any key fails it. See [Self::is_success_partially].
    pub fn is_success(&self) -> bool {
        if !self.inner.is_success() {
            return false;
        }

        let result = self.result();
        let peers = self.inner.results_len();

        let unanimous = self.inner.with_raw(|raw| {
            raw.iter()
                .flat_map(|(_, outcomes)| outcomes.keys())
                .all(|key| result.get(key).copied().unwrap_or(0) == peers)
        });

        unanimous && result.len() == self.data_size
    }

    /// Enough peers answered, and at least one key was stored somewhere.
    pub fn is_success_partially(&self) -> bool {
        self.inner.is_success() && !self.result().is_empty()
    }

    /// Outcome per key, as decided by the evaluation scheme.
    pub fn outcomes(&self) -> Outcomes {
        memoized(&self.outcomes, self.is_completed(), || {
            self.inner
                .with_raw(|raw| self.evaluation.evaluate_outcomes(raw))
        })
    }
}

// === Get ===

#[derive(Clone)]
pub struct GetFuture {
    inner: ResultFuture<DataMap>,
    evaluation: Arc<dyn EvaluationScheme>,
    data: Arc<OnceLock<DataMap>>,
    value: Arc<OnceLock<Result<Option<Bytes>, EvaluationError>>>,
}

typed_future!(GetFuture, DataMap);

impl GetFuture {
    pub fn new(minimum_results: usize, evaluation: Arc<dyn EvaluationScheme>) -> Self {
        Self::from_inner(ResultFuture::new(minimum_results), evaluation)
    }

    pub(crate) fn failed(reason: impl Into<String>, evaluation: Arc<dyn EvaluationScheme>) -> Self {
        Self::from_inner(ResultFuture::failed(reason), evaluation)
    }

    fn from_inner(inner: ResultFuture<DataMap>, evaluation: Arc<dyn EvaluationScheme>) -> Self {
        Self {
            inner,
            evaluation,
            data: Default::default(),
            value: Default::default(),
        }
    }

    pub(crate) fn aggregator(&self) -> Collector<DataMap> {
        Collector::new("get", self.inner.clone(), |response| match response {
            ResponseSpecific::Data(data) => Some(data),
            _ => None,
        })
    }

    /// Entries per key, as decided by the evaluation scheme.
    pub fn data_map(&self) -> DataMap {
        memoized(&self.data, self.is_completed(), || {
            self.inner.with_raw(|raw| self.evaluation.evaluate_data(raw))
        })
    }

    pub fn keys(&self) -> BTreeSet<CompositeKey> {
        self.data_map().into_keys().collect()
    }

    /// A single value, for gets that expect one entry per peer.
    pub fn data(&self) -> Result<Option<Bytes>, EvaluationError> {
        memoized(&self.value, self.is_completed(), || {
            let values: RawResults<Bytes> = self.inner.with_raw(|raw| {
                raw.iter()
                    .filter_map(|(peer, data)| {
                        data.values()
                            .next()
                            .map(|entry| (*peer, entry.value().clone()))
                    })
                    .collect()
            });

            self.evaluation.evaluate_value(&values)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.data_map().is_empty()
    }
}

// === Remove ===

#[derive(Clone)]
pub struct RemoveFuture {
    inner: ResultFuture<RemoveResponseArguments>,
    evaluation: Arc<dyn EvaluationScheme>,
    data: Arc<OnceLock<DataMap>>,
    removed: Arc<OnceLock<BTreeSet<CompositeKey>>>,
    outcomes: Arc<OnceLock<Outcomes>>,
}

typed_future!(RemoveFuture, RemoveResponseArguments);

impl RemoveFuture {
    pub fn new(minimum_results: usize, evaluation: Arc<dyn EvaluationScheme>) -> Self {
        Self::from_inner(ResultFuture::new(minimum_results), evaluation)
    }

    pub(crate) fn failed(reason: impl Into<String>, evaluation: Arc<dyn EvaluationScheme>) -> Self {
        Self::from_inner(ResultFuture::failed(reason), evaluation)
    }

    fn from_inner(
        inner: ResultFuture<RemoveResponseArguments>,
        evaluation: Arc<dyn EvaluationScheme>,
    ) -> Self {
        Self {
            inner,
            evaluation,
            data: Default::default(),
            removed: Default::default(),
            outcomes: Default::default(),
        }
    }

    pub(crate) fn aggregator(&self) -> Collector<RemoveResponseArguments> {
        Collector::new("remove", self.inner.clone(), |response| match response {
            ResponseSpecific::Removed(removed) => Some(removed),
            _ => None,
        })
    }

    /// Enough peers answered, and at least one of them removed something.
    pub fn is_removed(&self) -> bool {
        self.inner.is_success()
            && self.inner.with_raw(|raw| {
                raw.iter().any(|(_, removed)| {
                    removed
                        .outcomes
                        .values()
                        .any(|outcome| *outcome == PutOutcome::Ok)
                })
            })
    }

    /// Keys removed, as decided by the evaluation scheme.
    pub fn removed_keys(&self) -> BTreeSet<CompositeKey> {
        memoized(&self.removed, self.is_completed(), || {
            let keys: RawResults<BTreeSet<CompositeKey>> = self.inner.with_raw(|raw| {
                raw.iter()
                    .map(|(peer, removed)| {
                        let keys = removed
                            .outcomes
                            .iter()
                            .filter(|(_, outcome)| **outcome == PutOutcome::Ok)
                            .map(|(key, _)| *key)
                            .collect();

                        (*peer, keys)
                    })
                    .collect()
            });

            self.evaluation.evaluate_keys(&keys)
        })
    }

    /// Outcome per key, as decided by the evaluation scheme.
    pub fn outcomes(&self) -> Outcomes {
        memoized(&self.outcomes, self.is_completed(), || {
            let outcomes: RawResults<Outcomes> = self.inner.with_raw(|raw| {
                raw.iter()
                    .map(|(peer, removed)| (*peer, removed.outcomes.clone()))
                    .collect()
            });

            self.evaluation.evaluate_outcomes(&outcomes)
        })
    }

    /// Removed entries, if the request asked for them.
    pub fn data_map(&self) -> DataMap {
        memoized(&self.data, self.is_completed(), || {
            let data: RawResults<DataMap> = self.inner.with_raw(|raw| {
                raw.iter()
                    .map(|(peer, removed)| (*peer, removed.data.clone()))
                    .collect()
            });

            self.evaluation.evaluate_data(&data)
        })
    }
}

// === Digest ===

#[derive(Clone)]
pub struct DigestFuture {
    inner: ResultFuture<Digest>,
    evaluation: Arc<dyn EvaluationScheme>,
    digest: Arc<OnceLock<Digest>>,
}

typed_future!(DigestFuture, Digest);

impl DigestFuture {
    pub fn new(minimum_results: usize, evaluation: Arc<dyn EvaluationScheme>) -> Self {
        Self::from_inner(ResultFuture::new(minimum_results), evaluation)
    }

    pub(crate) fn failed(reason: impl Into<String>, evaluation: Arc<dyn EvaluationScheme>) -> Self {
        Self::from_inner(ResultFuture::failed(reason), evaluation)
    }

    fn from_inner(inner: ResultFuture<Digest>, evaluation: Arc<dyn EvaluationScheme>) -> Self {
        Self {
            inner,
            evaluation,
            digest: Default::default(),
        }
    }

    pub(crate) fn aggregator(&self) -> Collector<Digest> {
        Collector::new("digest", self.inner.clone(), |response| match response {
            ResponseSpecific::Digest(digest) => Some(digest),
            _ => None,
        })
    }

    /// The digest, as decided by the evaluation scheme.
    pub fn digest(&self) -> Digest {
        memoized(&self.digest, self.is_completed(), || {
            self.inner.with_raw(|raw| self.evaluation.evaluate_digest(raw))
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::{
        common::Id,
        rpc::evaluation::{CumulativeScheme, VotingScheme},
    };

    use super::*;

    fn key(content: u64) -> CompositeKey {
        CompositeKey::new(Id::from(1), Id::from(2), Id::from(content), Id::ZERO)
    }

    fn outcomes(outcomes: &[(u64, PutOutcome)]) -> ResponseSpecific {
        ResponseSpecific::Outcomes(
            outcomes
                .iter()
                .map(|(content, outcome)| (key(*content), *outcome))
                .collect(),
        )
    }

    fn finish<A: Aggregator>(aggregator: A) {
        aggregator.finish(EngineSummary::default());
    }

    #[test]
    fn put_with_a_timed_out_peer() {
        let future = PutFuture::new(2, 1, Arc::new(VotingScheme));
        let mut aggregator = future.aggregator();

        aggregator.on_response(&Peer::random(), Ok(outcomes(&[(1, PutOutcome::Ok)])));
        aggregator.on_response(&Peer::random(), Ok(outcomes(&[(1, PutOutcome::Ok)])));
        aggregator.on_response(&Peer::random(), Err(TransportError::Timeout));
        finish(aggregator);

        assert_eq!(future.result(), BTreeMap::from([(key(1), 2)]));
        assert_eq!(future.avg_stored_keys(), 2.0);
        assert!(future.is_success());
        assert!(future.is_success_partially());
    }

    #[test]
    fn put_success_is_unanimous() {
        let future = PutFuture::new(2, 2, Arc::new(VotingScheme));
        let mut aggregator = future.aggregator();

        aggregator.on_response(
            &Peer::random(),
            Ok(outcomes(&[(1, PutOutcome::Ok), (2, PutOutcome::Ok)])),
        );
        aggregator.on_response(
            &Peer::random(),
            Ok(outcomes(&[(1, PutOutcome::VersionFork), (2, PutOutcome::FailedSecurity)])),
        );
        finish(aggregator);

        assert_eq!(future.result(), BTreeMap::from([(key(1), 2), (key(2), 1)]));
        assert_eq!(future.avg_stored_keys(), 1.5);
        assert!(!future.is_success());
        assert!(future.is_success_partially());
    }

    #[test]
    fn put_below_minimum() {
        let future = PutFuture::new(3, 1, Arc::new(VotingScheme));
        let mut aggregator = future.aggregator();

        aggregator.on_response(&Peer::random(), Ok(outcomes(&[(1, PutOutcome::Ok)])));
        finish(aggregator);

        assert!(future.is_completed());
        assert!(!future.is_success());
        assert!(!future.is_success_partially());
        assert_eq!(future.result(), BTreeMap::from([(key(1), 1)]));
    }

    #[test]
    fn get_votes_and_cumulates() {
        let entry = |value: &'static [u8]| {
            BTreeMap::from([(key(1), Entry::new(value).with_valid_from_millis(0))])
        };

        let voting = GetFuture::new(1, Arc::new(VotingScheme));
        let cumulative = GetFuture::new(1, Arc::new(CumulativeScheme));

        for future in [&voting, &cumulative] {
            let mut aggregator = future.aggregator();
            for value in [&b"A"[..], b"A", b"B"] {
                aggregator.on_response(&Peer::random(), Ok(ResponseSpecific::Data(entry(value))));
            }
            finish(aggregator);
        }

        assert_eq!(voting.data(), Ok(Some(Bytes::from_static(b"A"))));
        assert_eq!(voting.keys(), BTreeSet::from([key(1)]));

        assert!(cumulative.data().is_err());
        assert_eq!(cumulative.keys(), BTreeSet::from([key(1)]));
    }

    #[test]
    fn remove_reports_removed_keys() {
        let future = RemoveFuture::new(1, Arc::new(CumulativeScheme));
        let mut aggregator = future.aggregator();

        aggregator.on_response(
            &Peer::random(),
            Ok(ResponseSpecific::Removed(RemoveResponseArguments {
                outcomes: BTreeMap::from([
                    (key(1), PutOutcome::Ok),
                    (key(2), PutOutcome::NotFound),
                ]),
                data: BTreeMap::new(),
            })),
        );
        finish(aggregator);

        assert!(future.is_removed());
        assert_eq!(future.removed_keys(), BTreeSet::from([key(1)]));
    }

    /// Voting that counts how often it was asked to evaluate.
    #[derive(Debug, Default)]
    struct CountingScheme(AtomicUsize);

    impl CountingScheme {
        fn count(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn evaluations(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl EvaluationScheme for CountingScheme {
        fn evaluate_keys(
            &self,
            raw: &RawResults<BTreeSet<CompositeKey>>,
        ) -> BTreeSet<CompositeKey> {
            self.count();
            VotingScheme.evaluate_keys(raw)
        }

        fn evaluate_data(&self, raw: &RawResults<DataMap>) -> DataMap {
            self.count();
            VotingScheme.evaluate_data(raw)
        }

        fn evaluate_digest(&self, raw: &RawResults<Digest>) -> Digest {
            self.count();
            VotingScheme.evaluate_digest(raw)
        }

        fn evaluate_outcomes(&self, raw: &RawResults<Outcomes>) -> Outcomes {
            self.count();
            VotingScheme.evaluate_outcomes(raw)
        }

        fn evaluate_value(
            &self,
            raw: &RawResults<Bytes>,
        ) -> Result<Option<Bytes>, EvaluationError> {
            self.count();
            VotingScheme.evaluate_value(raw)
        }
    }

    #[test]
    fn completed_results_are_evaluated_once() {
        let scheme = Arc::new(CountingScheme::default());

        let put = PutFuture::new(1, 1, scheme.clone());
        let mut aggregator = put.aggregator();
        aggregator.on_response(&Peer::random(), Ok(outcomes(&[(1, PutOutcome::Ok)])));

        // Pending, nothing to memoize yet.
        put.outcomes();
        put.outcomes();
        assert_eq!(scheme.evaluations(), 2);

        finish(aggregator);

        for _ in 0..3 {
            assert_eq!(put.outcomes(), BTreeMap::from([(key(1), PutOutcome::Ok)]));
        }
        assert_eq!(scheme.evaluations(), 3);

        let remove = RemoveFuture::new(1, scheme.clone());
        let mut aggregator = remove.aggregator();
        aggregator.on_response(
            &Peer::random(),
            Ok(ResponseSpecific::Removed(RemoveResponseArguments {
                outcomes: BTreeMap::from([(key(1), PutOutcome::Ok)]),
                data: BTreeMap::new(),
            })),
        );
        finish(aggregator);

        for _ in 0..3 {
            assert_eq!(remove.removed_keys(), BTreeSet::from([key(1)]));
            assert_eq!(remove.outcomes(), BTreeMap::from([(key(1), PutOutcome::Ok)]));
        }
        assert_eq!(scheme.evaluations(), 5);

        let get = GetFuture::new(1, scheme.clone());
        let mut aggregator = get.aggregator();
        aggregator.on_response(
            &Peer::random(),
            Ok(ResponseSpecific::Data(BTreeMap::from([(
                key(1),
                Entry::new(&b"A"[..]),
            )]))),
        );
        finish(aggregator);

        for _ in 0..3 {
            assert_eq!(get.data(), Ok(Some(Bytes::from_static(b"A"))));
        }
        assert_eq!(scheme.evaluations(), 6);
    }

    #[test]
    fn cancelled_operation_fails() {
        let future = DigestFuture::new(0, Arc::new(CumulativeScheme));

        future.aggregator().finish(EngineSummary {
            cancelled: true,
            ..Default::default()
        });

        assert_eq!(future.failed_reason(), Some("Cancelled".into()));
        assert!(future.digest().is_empty());
    }
}
