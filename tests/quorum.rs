//! End to end behavior of quorum operations against an in-process testnet.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use quorum_dht::{
    common::now_millis, rpc::RequestPolicy, CompositeKey, Config, Dht, Entry, Fault, GetRequest,
    Id, Peer, PutOutcome, PutRequest, RemoveRequest, SigningKey, Testnet,
};
use tracing::Level;

/// Print operation logs of failing tests.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn dht(testnet: &Testnet, policy: RequestPolicy) -> Dht {
    init_logging();

    Dht::builder()
        .testnet(testnet)
        .put_policy(policy)
        .get_policy(policy)
        .remove_policy(policy)
        .digest_policy(policy)
        .build()
        .unwrap()
}

/// Peers of the testnet, closest to `target` first.
fn closest(testnet: &Testnet, target: &Id) -> Vec<Peer> {
    let mut peers = testnet.peers().to_vec();
    peers.sort_by_key(|peer| peer.id.xor(target));
    peers
}

#[test]
fn put_with_a_timed_out_peer() {
    let testnet = Testnet::new(3);
    let dht = dht(&testnet, RequestPolicy::new(2, 5, 1));

    let location = Id::random();
    let domain = Id::random();
    let content = Id::random();

    let slow = closest(&testnet, &location)[2];
    testnet.set_fault(&slow.id, Fault::Timeout(Duration::from_millis(500)));

    let put = dht.put(
        PutRequest::new(location)
            .domain(domain)
            .data(content, Entry::new(&b"X"[..])),
    );
    put.await_completion();

    let key = CompositeKey::new(location, domain, content, Id::ZERO);

    assert!(put.is_success());
    assert_eq!(put.results_len(), 2);
    assert_eq!(put.avg_stored_keys(), 2.0);
    assert_eq!(put.result(), BTreeMap::from([(key, 2)]));
}

#[test]
fn disjoint_versions_fork() {
    let testnet = Testnet::new(5);
    let dht = dht(&testnet, RequestPolicy::default());

    let location = Id::random();
    let content = Id::from(1);

    let first = dht.put(
        PutRequest::new(location)
            .version(Id::from(1))
            .data(content, Entry::new(&b"first"[..])),
    );
    first.await_completion();
    assert!(first.is_success());

    let second = dht.put(
        PutRequest::new(location)
            .version(Id::from(2))
            .data(content, Entry::new(&b"second"[..])),
    );
    second.await_completion();

    let forked = CompositeKey::new(location, Id::ZERO, content, Id::from(2));
    assert_eq!(
        second.outcomes(),
        BTreeMap::from([(forked, PutOutcome::VersionFork)])
    );
    // Stored anyway, so the put still counts.
    assert!(second.is_success());

    let latest = dht.get(GetRequest::new(location).content(content).latest_only(true));
    latest.await_completion();
    assert_eq!(
        latest.keys().into_iter().map(|key| key.version).collect::<Vec<_>>(),
        vec![Id::from(1), Id::from(2)]
    );

    let merge = dht.put(
        PutRequest::new(location).version(Id::from(3)).data(
            content,
            Entry::new(&b"merged"[..])
                .with_based_on(Id::from(1))
                .with_based_on(Id::from(2)),
        ),
    );
    merge.await_completion();
    assert_eq!(
        merge.outcomes().into_values().collect::<Vec<_>>(),
        vec![PutOutcome::Ok]
    );

    let latest = dht.get(GetRequest::new(location).content(content).latest_only(true));
    latest.await_completion();
    assert_eq!(
        latest.keys().into_iter().map(|key| key.version).collect::<Vec<_>>(),
        vec![Id::from(3)]
    );
}

#[test]
fn expired_entries_are_swept() {
    let testnet = Testnet::with_config(
        4,
        &Config {
            storage_check_interval: Duration::ZERO,
            ..Default::default()
        },
    );
    let dht = dht(&testnet, RequestPolicy::default());

    let location = Id::random();

    let put = dht.put(
        PutRequest::new(location)
            .data(
                Id::from(1),
                Entry::new(&b"short lived"[..])
                    .with_valid_from_millis(now_millis() - 10_000)
                    .with_ttl_seconds(1),
            )
            .data(Id::from(2), Entry::new(&b"forever"[..])),
    );
    put.await_completion();
    assert!(put.is_success());

    testnet.maintain();

    let get = dht.get(GetRequest::new(location));
    get.await_completion();

    assert!(get.is_success());
    assert_eq!(
        get.keys().into_iter().map(|key| key.content).collect::<Vec<_>>(),
        vec![Id::from(2)]
    );
}

#[test]
fn range_remove_is_all_or_nothing() {
    let testnet = Testnet::new(4);
    let dht = dht(&testnet, RequestPolicy::default());

    let alice = SigningKey::from_bytes(&[1; 32]);
    let bob = SigningKey::from_bytes(&[2; 32]);

    let location = Id::random();

    let shared = dht.put(
        PutRequest::new(location)
            .data(Id::from(1), Entry::new(&b"shared"[..]))
            .owner(bob.verifying_key()),
    );
    shared.await_completion();
    assert!(shared.is_success());

    let owned = dht.put(
        PutRequest::new(location)
            .data(Id::from(2), Entry::new(&b"owned"[..]).sign(&alice))
            .owner(alice.verifying_key())
            .protect_entries(true),
    );
    owned.await_completion();
    assert!(owned.is_success());

    let remove = dht.remove(RemoveRequest::new(location).owner(bob.verifying_key()));
    remove.await_completion();

    assert!(!remove.is_removed());
    assert!(remove.removed_keys().is_empty());
    assert_eq!(
        remove.outcomes().into_values().collect::<BTreeSet<_>>(),
        BTreeSet::from([PutOutcome::FailedSecurity])
    );

    let get = dht.get(GetRequest::new(location));
    get.await_completion();
    assert_eq!(get.keys().len(), 2);

    let remove = dht.remove(RemoveRequest::new(location).owner(alice.verifying_key()));
    remove.await_completion();

    assert!(remove.is_removed());
    assert_eq!(remove.removed_keys().len(), 2);
}

#[test]
fn protected_domain_rejects_others() {
    let testnet = Testnet::new(4);
    let dht = dht(&testnet, RequestPolicy::default());

    let alice = SigningKey::from_bytes(&[1; 32]).verifying_key();
    let bob = SigningKey::from_bytes(&[2; 32]).verifying_key();

    let location = Id::random();
    let domain = Id::random();

    let claim = dht.put(
        PutRequest::new(location)
            .domain(domain)
            .data(Id::from(1), Entry::new(&b"a"[..]))
            .owner(alice)
            .protect_domain(true),
    );
    claim.await_completion();
    assert!(claim.is_success());

    let intrusion = dht.put(
        PutRequest::new(location)
            .domain(domain)
            .data(Id::from(2), Entry::new(&b"b"[..]))
            .owner(bob),
    );
    intrusion.await_completion();

    // Every peer answered, none of them stored anything.
    assert!(!intrusion.is_success());
    assert!(!intrusion.is_success_partially());
    assert_eq!(
        intrusion.outcomes().into_values().collect::<Vec<_>>(),
        vec![PutOutcome::FailedSecurity]
    );
}

#[test]
fn unreachable_peers_are_replaced() {
    let testnet = Testnet::new(6);
    let dht = dht(&testnet, RequestPolicy::new(3, 5, 0));

    let location = Id::random();

    for peer in &closest(&testnet, &location)[..2] {
        testnet.set_fault(&peer.id, Fault::Unreachable);
    }

    let put = dht.put(PutRequest::new(location).data(Id::from(1), Entry::new(&b"a"[..])));
    put.await_completion();

    assert!(put.is_success());
    assert_eq!(put.results_len(), 3);
}

#[test]
fn failure_budget_exhausted() {
    let testnet = Testnet::new(5);
    let dht = dht(&testnet, RequestPolicy::new(3, 1, 0));

    let location = Id::random();

    for peer in &closest(&testnet, &location)[..3] {
        testnet.set_fault(&peer.id, Fault::Unreachable);
    }

    let put = dht.put(PutRequest::new(location).data(Id::from(1), Entry::new(&b"a"[..])));
    put.await_completion();

    assert!(!put.is_success());
    assert!(!put.is_minimum_reached());
    assert!(put.failed_reason().is_some());
}

#[test]
fn cancelled_get() {
    let testnet = Testnet::new(3);
    let dht = dht(&testnet, RequestPolicy::default());

    let location = Id::random();

    let put = dht.put(PutRequest::new(location).data(Id::from(1), Entry::new(&b"a"[..])));
    put.await_completion();
    assert!(put.is_success());

    for peer in testnet.peers() {
        testnet.set_fault(&peer.id, Fault::Delay(Duration::from_secs(5)));
    }

    let get = dht.get(GetRequest::new(location).content(Id::from(1)));
    get.cancel();
    get.await_completion();

    assert_eq!(get.failed_reason(), Some("Cancelled".to_string()));
}
