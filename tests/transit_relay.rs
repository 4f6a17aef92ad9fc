//! End-to-end relay tests: frames really traverse the materialized
//! transit hops in both directions, and latency samples drive the
//! dead-path check.

mod common;

use std::collections::HashMap;

use common::{client_id, TestNet};

const T0: u64 = 1_000_000;
/// Far enough past the establish tick that the probe cadence has elapsed
/// again.
const T_PROBE: u64 = T0 + 40_000;

#[tokio::test]
async fn latency_probe_roundtrips_through_relay_chain() {
    let mut net = TestNet::new(10);
    let alice_id = client_id(20);
    let mut alice = net.endpoint("alice", alice_id);
    alice.start().await.unwrap();
    net.establish_endpoint_paths(&mut alice, alice_id, T0);
    alice.tick(T0 + 6_000);
    // Discard the establish-phase probe batch.
    net.pump(&mut HashMap::new(), T0 + 6_000);

    // The next due tick probes every established path.
    alice.tick(T_PROBE);
    let mut eps = HashMap::new();
    eps.insert(alice_id, &mut alice);
    net.pump(&mut eps, T_PROBE + 40);
    drop(eps);

    // The echo carried our timestamp back; the sample is the transit
    // delay the pump simulated.
    let measured: Vec<u64> = alice
        .paths()
        .established()
        .map(|p| p.latency)
        .filter(|l| *l > 0)
        .collect();
    assert!(!measured.is_empty(), "at least one path measured");
    assert!(measured.iter().all(|l| *l == 40), "sample is now minus echoed timestamp");
}

#[tokio::test]
async fn slow_paths_die_under_min_latency() {
    let mut net = TestNet::new(10);
    let alice_id = client_id(21);
    let mut alice = net.endpoint("alice", alice_id);
    alice.set_option("min-latency", "10").unwrap();
    alice.start().await.unwrap();
    net.establish_endpoint_paths(&mut alice, alice_id, T0);
    alice.tick(T0 + 6_000);
    net.pump(&mut HashMap::new(), T0 + 6_000);
    let established_before = alice.paths().num_established();
    assert!(established_before > 0);

    alice.tick(T_PROBE);
    let mut eps = HashMap::new();
    eps.insert(alice_id, &mut alice);
    // 40ms of simulated transit beats the 10ms minimum: every measured
    // path fails the dead check.
    net.pump(&mut eps, T_PROBE + 40);
    drop(eps);

    assert_eq!(alice.paths().num_established(), 0, "slow paths are dead");

    // The next tick replaces them and queues introset republishes.
    alice.tick(T_PROBE + 100);
    assert!(
        alice.paths().paths().iter().any(|p| !p.is_established()),
        "replacement builds scheduled"
    );
}

#[tokio::test]
async fn relay_registry_expires_transit_hops() {
    use shroud::crypto::{PathId, RouterId, SharedSecret, TunnelNonce};
    use shroud::router::PathRegistry;
    use shroud::transit::{TransitHop, TransitHopInfo, DEFAULT_TRANSIT_LIFETIME};
    use std::sync::Arc;

    let registry = PathRegistry::new();
    let hop = Arc::new(TransitHop::new(
        TransitHopInfo {
            tx_id: PathId::random().unwrap(),
            rx_id: PathId::random().unwrap(),
            upstream: RouterId::random().unwrap(),
            downstream: RouterId::random().unwrap(),
        },
        SharedSecret::random().unwrap(),
        T0,
        TunnelNonce::random().unwrap(),
    ));
    let up = hop.info.upstream;
    let tx = hop.info.tx_id;
    assert!(registry.register(hop));
    assert!(registry.get_by_upstream(&up, &tx).is_some());

    registry.expire(T0 + DEFAULT_TRANSIT_LIFETIME);
    assert!(registry.get_by_upstream(&up, &tx).is_some(), "still within lifetime");

    registry.expire(T0 + DEFAULT_TRANSIT_LIFETIME + 1);
    assert!(registry.get_by_upstream(&up, &tx).is_none(), "expired hop evicted");
    assert!(registry.is_empty());
}
