//! Reducing per-peer results to one logical result.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Debug,
};

use bytes::Bytes;

use crate::{
    common::{CompositeKey, Digest, Entry, Id, PutOutcome},
    error::EvaluationError,
};

use super::future::RawResults;

/// Reduces `{peer -> result}` to a single result.
pub trait EvaluationScheme: Send + Sync + Debug {
    fn evaluate_keys(&self, raw: &RawResults<BTreeSet<CompositeKey>>) -> BTreeSet<CompositeKey>;

    fn evaluate_data(
        &self,
        raw: &RawResults<BTreeMap<CompositeKey, Entry>>,
    ) -> BTreeMap<CompositeKey, Entry>;

    fn evaluate_digest(&self, raw: &RawResults<Digest>) -> Digest;

    fn evaluate_outcomes(
        &self,
        raw: &RawResults<BTreeMap<CompositeKey, PutOutcome>>,
    ) -> BTreeMap<CompositeKey, PutOutcome>;

    /// Reduce unkeyed values, one per peer.
    fn evaluate_value(&self, raw: &RawResults<Bytes>) -> Result<Option<Bytes>, EvaluationError>;
}

#[derive(Debug, Clone, Copy, Default)]
/// Keeps what at least half of the answering peers agree on, the first
/// seen value winning an even split.
///
/// Unkeyed values are decided by plurality instead, ties going to the value
/// seen first.
pub struct VotingScheme;

#[derive(Debug, Clone, Copy, Default)]
/// Unions everything the peers reported.
///
/// For results peers are expected to report disjoint parts of, like digests
/// and key sets. Unkeyed values can't be cumulated.
pub struct CumulativeScheme;

/// Half of `peers`, rounded up.
pub fn majority(peers: usize) -> usize {
    (peers + 1) / 2
}

/// Tally of equal values, in the order they were first seen.
struct Tally<'a, T>(Vec<(&'a T, usize)>);

impl<'a, T: PartialEq> Tally<'a, T> {
    fn new() -> Self {
        Self(Vec::new())
    }

    fn add(&mut self, value: &'a T) {
        match self.0.iter_mut().find(|(seen, _)| *seen == value) {
            Some((_, count)) => *count += 1,
            None => self.0.push((value, 1)),
        }
    }

    /// A value counted at least `threshold` times.
    fn reaching(&self, threshold: usize) -> Option<&'a T> {
        self.0
            .iter()
            .find(|(_, count)| *count >= threshold)
            .map(|(value, _)| *value)
    }

    /// The most counted value, the first seen among ties.
    fn plurality(&self) -> Option<&'a T> {
        let mut best: Option<(&'a T, usize)> = None;

        for &(value, count) in &self.0 {
            if best.map(|(_, best)| count > best).unwrap_or(true) {
                best = Some((value, count));
            }
        }

        best.map(|(value, _)| value)
    }
}

/// Per key, the value a majority of peers reported.
fn vote_per_key<'a, V: PartialEq + Clone + 'a>(
    peers: usize,
    maps: impl Iterator<Item = &'a BTreeMap<CompositeKey, V>>,
) -> BTreeMap<CompositeKey, V> {
    let mut tallies: BTreeMap<&CompositeKey, Tally<'a, V>> = BTreeMap::new();

    for map in maps {
        for (key, value) in map {
            tallies.entry(key).or_insert_with(Tally::new).add(value);
        }
    }

    let threshold = majority(peers);

    tallies
        .into_iter()
        .filter_map(|(key, tally)| tally.reaching(threshold).map(|value| (*key, value.clone())))
        .collect()
}

impl EvaluationScheme for VotingScheme {
    fn evaluate_keys(&self, raw: &RawResults<BTreeSet<CompositeKey>>) -> BTreeSet<CompositeKey> {
        let mut counts: BTreeMap<&CompositeKey, usize> = BTreeMap::new();

        for (_, keys) in raw {
            for key in keys {
                *counts.entry(key).or_default() += 1;
            }
        }

        let threshold = majority(raw.len());

        counts
            .into_iter()
            .filter(|(_, count)| *count >= threshold)
            .map(|(key, _)| *key)
            .collect()
    }

    fn evaluate_data(
        &self,
        raw: &RawResults<BTreeMap<CompositeKey, Entry>>,
    ) -> BTreeMap<CompositeKey, Entry> {
        vote_per_key(raw.len(), raw.iter().map(|(_, data)| data))
    }

    fn evaluate_digest(&self, raw: &RawResults<Digest>) -> Digest {
        let maps: Vec<BTreeMap<CompositeKey, BTreeSet<Id>>> = raw
            .iter()
            .map(|(_, digest)| {
                digest
                    .iter()
                    .map(|(key, based_on)| (*key, based_on.clone()))
                    .collect()
            })
            .collect();

        vote_per_key(raw.len(), maps.iter()).into_iter().collect()
    }

    fn evaluate_outcomes(
        &self,
        raw: &RawResults<BTreeMap<CompositeKey, PutOutcome>>,
    ) -> BTreeMap<CompositeKey, PutOutcome> {
        vote_per_key(raw.len(), raw.iter().map(|(_, outcomes)| outcomes))
    }

    fn evaluate_value(&self, raw: &RawResults<Bytes>) -> Result<Option<Bytes>, EvaluationError> {
        let mut tally = Tally::new();

        for (_, value) in raw {
            tally.add(value);
        }

        Ok(tally.plurality().cloned())
    }
}

impl EvaluationScheme for CumulativeScheme {
    fn evaluate_keys(&self, raw: &RawResults<BTreeSet<CompositeKey>>) -> BTreeSet<CompositeKey> {
        raw.iter().flat_map(|(_, keys)| keys.iter().copied()).collect()
    }

    fn evaluate_data(
        &self,
        raw: &RawResults<BTreeMap<CompositeKey, Entry>>,
    ) -> BTreeMap<CompositeKey, Entry> {
        raw.iter()
            .flat_map(|(_, data)| data.iter().map(|(key, entry)| (*key, entry.clone())))
            .collect()
    }

    fn evaluate_digest(&self, raw: &RawResults<Digest>) -> Digest {
        let mut digest = Digest::new();

        for (_, other) in raw {
            digest.merge(other);
        }

        digest
    }

    fn evaluate_outcomes(
        &self,
        raw: &RawResults<BTreeMap<CompositeKey, PutOutcome>>,
    ) -> BTreeMap<CompositeKey, PutOutcome> {
        raw.iter()
            .flat_map(|(_, outcomes)| outcomes.iter().map(|(key, outcome)| (*key, *outcome)))
            .collect()
    }

    fn evaluate_value(&self, _raw: &RawResults<Bytes>) -> Result<Option<Bytes>, EvaluationError> {
        Err(EvaluationError::Unsupported {
            scheme: "cumulative",
            result: "unkeyed values",
        })
    }
}

#[cfg(test)]
mod test {
    use crate::common::Peer;

    use super::*;

    fn key(content: u64) -> CompositeKey {
        CompositeKey::new(Id::from(1), Id::ZERO, Id::from(content), Id::ZERO)
    }

    fn values(values: &[&'static [u8]]) -> RawResults<Bytes> {
        values
            .iter()
            .map(|value| (Peer::random(), Bytes::from_static(*value)))
            .collect()
    }

    fn data(values: &[&'static [u8]]) -> RawResults<BTreeMap<CompositeKey, Entry>> {
        values
            .iter()
            .map(|value| {
                (
                    Peer::random(),
                    BTreeMap::from([(
                        key(1),
                        Entry::new(Bytes::from_static(*value)).with_valid_from_millis(0),
                    )]),
                )
            })
            .collect()
    }

    #[test]
    fn majority_of_peers() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 1);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 2);
        assert_eq!(majority(5), 3);
    }

    #[test]
    fn voting_with_even_peers() {
        // One of two peers holds the key.
        let mut raw = data(&[b"A"]);
        raw.push((Peer::random(), BTreeMap::new()));

        let voted = VotingScheme.evaluate_data(&raw);
        assert_eq!(
            voted.get(&key(1)).map(|entry| entry.value().clone()),
            Some(Bytes::from_static(b"A"))
        );

        let voted = VotingScheme.evaluate_data(&data(&[b"A", b"A", b"B", b"C"]));
        assert_eq!(
            voted.get(&key(1)).map(|entry| entry.value().clone()),
            Some(Bytes::from_static(b"A"))
        );

        // An even split goes to the value seen first.
        let voted = VotingScheme.evaluate_data(&data(&[b"B", b"A", b"A", b"B"]));
        assert_eq!(
            voted.get(&key(1)).map(|entry| entry.value().clone()),
            Some(Bytes::from_static(b"B"))
        );
    }

    #[test]
    fn voting_picks_majority() {
        let voted = VotingScheme.evaluate_data(&data(&[b"A", b"A", b"B"]));

        assert_eq!(
            voted.get(&key(1)).map(|entry| entry.value().clone()),
            Some(Bytes::from_static(b"A"))
        );

        let value = VotingScheme.evaluate_value(&values(&[b"A", b"A", b"B"]));
        assert_eq!(value, Ok(Some(Bytes::from_static(b"A"))));
    }

    #[test]
    fn voting_without_majority() {
        let voted = VotingScheme.evaluate_data(&data(&[b"A", b"B", b"C"]));
        assert!(voted.is_empty());

        let value = VotingScheme.evaluate_value(&values(&[b"A", b"B", b"C"]));
        assert_eq!(value, Ok(Some(Bytes::from_static(b"A"))));

        let value = VotingScheme.evaluate_value(&values(&[b"C", b"B", b"B", b"C"]));
        assert_eq!(value, Ok(Some(Bytes::from_static(b"C"))));

        assert_eq!(VotingScheme.evaluate_value(&Vec::new()), Ok(None));
    }

    #[test]
    fn voting_keys_and_outcomes() {
        let raw = vec![
            (Peer::random(), BTreeSet::from([key(1), key(2)])),
            (Peer::random(), BTreeSet::from([key(1)])),
            (Peer::random(), BTreeSet::from([key(1), key(3)])),
        ];
        assert_eq!(VotingScheme.evaluate_keys(&raw), BTreeSet::from([key(1)]));

        let raw = vec![
            (Peer::random(), BTreeMap::from([(key(1), PutOutcome::Ok)])),
            (Peer::random(), BTreeMap::from([(key(1), PutOutcome::VersionFork)])),
            (Peer::random(), BTreeMap::from([(key(1), PutOutcome::Ok)])),
        ];
        assert_eq!(
            VotingScheme.evaluate_outcomes(&raw),
            BTreeMap::from([(key(1), PutOutcome::Ok)])
        );
    }

    #[test]
    fn cumulative_unions() {
        let raw = vec![
            (Peer::random(), BTreeSet::from([key(1)])),
            (Peer::random(), BTreeSet::from([key(2)])),
        ];
        assert_eq!(
            CumulativeScheme.evaluate_keys(&raw),
            BTreeSet::from([key(1), key(2)])
        );

        let raw = vec![
            (Peer::random(), [(key(1), BTreeSet::new())].into_iter().collect()),
            (Peer::random(), [(key(2), BTreeSet::from([Id::from(1)]))].into_iter().collect()),
        ];
        assert_eq!(CumulativeScheme.evaluate_digest(&raw).size(), 2);
    }

    #[test]
    fn cumulative_values_are_unsupported() {
        assert!(matches!(
            CumulativeScheme.evaluate_value(&values(&[b"A"])),
            Err(EvaluationError::Unsupported { .. })
        ));
    }
}
