//! Integration tests for convergence under failures and concurrency.
//!
//! Tests the reconciler end to end:
//! 1. Failed links are retried while still required
//! 2. Concurrent updates from many threads settle on the union of the last updates,
//!    whether the scopes' peer sets are disjoint or shared
//! 3. Arbitrary update sequences match a simple per-scope model
//! 4. Scenario files run through the simulator

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use don_p2p::{
    ConnectionManager, Ed25519Signer, KeySource, LinkPhase, MemoryNetwork, Peer, PeerConfig,
    PeerId, Scope, Signer, StreamConfig,
};
use don_p2p_sim::{Scenario, SimOptions};
use proptest::prelude::*;

// ============================================================================
// Helper Functions
// ============================================================================

fn spawn_node(network: &MemoryNetwork, config: PeerConfig) -> Arc<ConnectionManager> {
    let signer = Arc::new(Ed25519Signer::new(KeySource::Generate));
    signer.initialize().unwrap();
    let transport = network.transport(signer.peer_id().unwrap());
    let manager = Arc::new(ConnectionManager::new(config, transport, signer).unwrap());
    manager.start().unwrap();
    manager
}

fn fast_retry() -> PeerConfig {
    PeerConfig::default().with_reconnect_interval(Duration::from_millis(50))
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn scope(n: usize) -> Scope {
    Scope::Named(format!("s{n}"))
}

/// Distinct per scope, so the merged config reveals which scopes contributed.
fn scope_config(n: usize) -> StreamConfig {
    StreamConfig::default().with_incoming_buffer(10 * (n + 1))
}

/// How the hub sees one spoke once it has converged.
type SpokeView = (Option<LinkPhase>, Option<StreamConfig>, Vec<Scope>);

/// One scope per entry of `subsets`, each on its own thread, churns a shared
/// set of six spokes: every spoke, then its subset, thirty times over. Even
/// scopes finish wanting every spoke; odd scopes finish withdrawn.
async fn churn_shared_spokes(subsets: &[BTreeSet<usize>]) -> Vec<SpokeView> {
    let network = MemoryNetwork::new();
    let hub = spawn_node(&network, fast_retry());
    let spokes: Vec<_> = (0..6).map(|_| spawn_node(&network, fast_retry())).collect();
    for spoke in &spokes {
        spoke
            .update_connections(&HashMap::from([(hub.local_id(), StreamConfig::default())]))
            .unwrap();
    }
    let ids: Vec<PeerId> = spokes.iter().map(|spoke| spoke.local_id()).collect();

    std::thread::scope(|s| {
        for (i, subset) in subsets.iter().enumerate() {
            let (hub, ids) = (&hub, &ids);
            s.spawn(move || {
                let every: HashMap<_, _> = ids.iter().map(|id| (*id, scope_config(i))).collect();
                let some: HashMap<_, _> =
                    subset.iter().map(|m| (ids[*m], scope_config(i))).collect();
                for round in 0..30 {
                    let desired = if round % 2 == 0 { &every } else { &some };
                    hub.update_connections_for(scope(i), desired).unwrap();
                }
                let last = if i % 2 == 0 { every } else { HashMap::new() };
                hub.update_connections_for(scope(i), &last).unwrap();
            });
        }
    });

    hub.await_converged(Duration::from_secs(5)).await.unwrap();
    ids.iter()
        .map(|id| (hub.link_phase(id), hub.effective_config(id), hub.contributing_scopes(id)))
        .collect()
}

// ============================================================================
// Failure and Retry
// ============================================================================

#[tokio::test]
async fn failed_link_is_reopened_while_required() {
    let network = MemoryNetwork::new();
    let a = spawn_node(&network, fast_retry());
    let b = spawn_node(&network, fast_retry());
    a.update_connections(&HashMap::from([(b.local_id(), StreamConfig::default())]))
        .unwrap();
    b.update_connections(&HashMap::from([(a.local_id(), StreamConfig::default())]))
        .unwrap();
    a.await_converged(Duration::from_secs(2)).await.unwrap();

    network.set_unreachable(b.local_id(), true);
    assert_eq!(a.link_phase(&b.local_id()), Some(LinkPhase::Unconnected));
    assert_eq!(a.pending_links(), 1);
    assert!(a.stats().link_failures >= 1);

    // Retries keep failing while the peer is unreachable.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let report = a.health_report();
    assert!(report[0].retrying);
    assert!(report[0].health.failed_attempts >= 1);
    assert!(report[0].health.last_error.is_some());

    network.set_unreachable(b.local_id(), false);
    a.await_converged(Duration::from_secs(2)).await.unwrap();
    b.await_converged(Duration::from_secs(2)).await.unwrap();
    assert!(network.is_linked(&a.local_id(), &b.local_id()));
    assert_eq!(a.health_report()[0].health.failed_attempts, 0);
    assert!(a.stats().links_opened >= 2);
}

#[tokio::test]
async fn remote_close_is_retried() {
    let network = MemoryNetwork::new();
    let a = spawn_node(&network, fast_retry());
    let b = spawn_node(&network, fast_retry());
    a.update_connections(&HashMap::from([(b.local_id(), StreamConfig::default())]))
        .unwrap();
    b.update_connections(&HashMap::from([(a.local_id(), StreamConfig::default())]))
        .unwrap();
    a.await_converged(Duration::from_secs(2)).await.unwrap();

    // b drops a for a while, then asks for it again.
    b.update_connections(&HashMap::new()).unwrap();
    assert!(eventually(|| a.link_phase(&b.local_id()) != Some(LinkPhase::Connected)).await);

    b.update_connections(&HashMap::from([(a.local_id(), StreamConfig::default())]))
        .unwrap();
    a.await_converged(Duration::from_secs(2)).await.unwrap();
    b.await_converged(Duration::from_secs(2)).await.unwrap();
    assert!(network.is_linked(&a.local_id(), &b.local_id()));
}

// ============================================================================
// Concurrent Updates
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_scopes_settle_on_the_union() {
    let network = MemoryNetwork::new();
    let hub = spawn_node(&network, fast_retry());
    let spokes: Vec<_> = (0..8).map(|_| spawn_node(&network, fast_retry())).collect();
    for spoke in &spokes {
        spoke
            .update_connections(&HashMap::from([(hub.local_id(), StreamConfig::default())]))
            .unwrap();
    }

    // Every thread adds its spoke, and odd threads withdraw it again.
    std::thread::scope(|s| {
        for (i, spoke) in spokes.iter().enumerate() {
            let hub = &hub;
            s.spawn(move || {
                let desired = HashMap::from([(spoke.local_id(), scope_config(i))]);
                for _ in 0..10 {
                    hub.update_connections_for(scope(i), &desired).unwrap();
                }
                if i % 2 == 1 {
                    hub.update_connections_for(scope(i), &HashMap::new()).unwrap();
                }
            });
        }
    });

    hub.await_converged(Duration::from_secs(3)).await.unwrap();
    for (i, spoke) in spokes.iter().enumerate() {
        let id = spoke.local_id();
        if i % 2 == 0 {
            assert_eq!(hub.link_phase(&id), Some(LinkPhase::Connected));
            assert_eq!(hub.effective_config(&id), Some(scope_config(i)));
        } else {
            assert!(eventually(|| hub.link_phase(&id).is_none()).await);
        }
    }
    assert_eq!(hub.health_report().len(), 4);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn overlapping_scopes_settle_under_concurrent_churn(
        subsets in prop::collection::vec(prop::collection::btree_set(0usize..6, 0..6), 8)
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let views = runtime.block_on(churn_shared_spokes(&subsets));

        let scopes: Vec<Scope> = [0, 2, 4, 6].into_iter().map(scope).collect();
        for (phase, config, contributing) in views {
            prop_assert_eq!(phase, Some(LinkPhase::Connected));
            prop_assert_eq!(config, Some(scope_config(6)));
            prop_assert_eq!(contributing, scopes.clone());
        }
    }
}

// ============================================================================
// Model Check
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn contributions_match_last_update_per_scope(
        updates in prop::collection::vec((0usize..3, prop::collection::btree_set(0usize..5, 0..5)), 1..20)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();

        let network = MemoryNetwork::new();
        let manager = spawn_node(&network, PeerConfig::default());
        let peers: Vec<PeerId> = (0..5u8).map(|n| PeerId::from_bytes([n + 1; 32])).collect();

        let mut model: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();
        for (s, members) in &updates {
            let desired = members
                .iter()
                .map(|m| (peers[*m], scope_config(*s)))
                .collect::<HashMap<_, _>>();
            manager.update_connections_for(scope(*s), &desired).unwrap();
            model.insert(*s, members.clone());
        }

        for (m, peer) in peers.iter().enumerate() {
            let expected: Vec<usize> = model
                .iter()
                .filter(|(_, members)| members.contains(&m))
                .map(|(s, _)| *s)
                .collect();
            let scopes: Vec<Scope> = expected.iter().map(|s| scope(*s)).collect();
            prop_assert_eq!(manager.contributing_scopes(peer), scopes);
            prop_assert_eq!(
                manager.effective_config(peer),
                expected.iter().max().map(|s| scope_config(*s))
            );
        }
        prop_assert_eq!(manager.pending_links(), model.values().flatten().collect::<BTreeSet<_>>().len());
    }
}

// ============================================================================
// Simulator
// ============================================================================

#[tokio::test]
async fn simulator_runs_scenario_file() {
    let json = r#"{
        "nodes": ["boot", "w1", "w2", "c1"],
        "bootstrappers": ["boot"],
        "dons": [
            {"id": 10, "members": ["w1", "w2"]},
            {"id": 20, "members": ["c1"]}
        ],
        "pairs": [[10, 20]],
        "messages": [{"from": "c1", "to": "w2", "payload": "result", "repeat": 4}]
    }"#;
    let scenario = Scenario::from_json(json).unwrap();

    let report = don_p2p_sim::run(&scenario, &SimOptions::default()).await.unwrap();

    assert!(report.converged());
    let c1 = report.node("c1").unwrap();
    // Both workers plus the bootstrapper.
    assert_eq!(c1.count_in(LinkPhase::Connected), 3);
    assert_eq!(report.node("w2").unwrap().received.get("c1"), Some(&4));
    assert_eq!(report.traffic[0].accepted, 4);

    let value = serde_json::to_value(&report).unwrap();
    assert_eq!(value["nodes"].as_array().unwrap().len(), 4);
}
