//! Integration test: multi-node anti-entropy convergence.
//!
//! Validates that:
//! - Replicas seeded with disjoint bit sets converge to the union
//!   within a bounded number of repair rounds
//! - A removed node's slices survive on the remaining replica, and a
//!   newly responsible node pulls them on its next pass
//! - An unreachable peer delays convergence but never prevents it
//! - A node that no longer owns a fragment keeps serving it to peers
//!
//! All exchanges run over the in-process transport, so rounds are
//! deterministic: one `run_cycle` per node per round, in host order.

use std::sync::Arc;
use std::time::Duration;

use bitgrid::antientropy::{AntiEntropy, AntiEntropyOptions, InProcessTransport, PeerTransport};
use bitgrid::stats::{self, AtomicStats, NoopStats, StatsSink};
use bitgrid::{Catalog, FragmentKey, Node, Topology};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct TestNode {
    node: Node,
    catalog: Arc<Catalog>,
    _dir: TempDir,
}

impl TestNode {
    fn new(host: &str, transport: &InProcessTransport) -> Self {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(Catalog::open(dir.path()).unwrap());
        let node = Node::new(host);
        transport.register(node.clone(), catalog.clone());
        Self {
            node,
            catalog,
            _dir: dir,
        }
    }

    fn seed(&self, key: &FragmentKey, row: u64, cols: &[u64]) {
        let fragment = self.catalog.fragment(key).unwrap();
        for &col in cols {
            fragment.set_bit(row, col).unwrap();
        }
    }

    fn cols(&self, key: &FragmentKey, row: u64) -> Vec<u64> {
        match self.catalog.get(key) {
            Some(fragment) => fragment.row(row).iter_cols().collect(),
            None => Vec::new(),
        }
    }

    fn repair_engine(
        &self,
        topology: &Arc<Topology>,
        transport: &Arc<InProcessTransport>,
        stats: Arc<dyn StatsSink>,
    ) -> Arc<AntiEntropy> {
        Arc::new(AntiEntropy::new(
            self.catalog.clone(),
            topology.clone(),
            self.node.clone(),
            transport.clone() as Arc<dyn PeerTransport>,
            stats,
            AntiEntropyOptions {
                interval: Duration::from_secs(3600),
                concurrency: 4,
                drain_timeout: Duration::from_secs(1),
            },
        ))
    }
}

async fn run_round(engines: &[Arc<AntiEntropy>]) {
    for engine in engines {
        engine.run_cycle().await;
    }
}

fn digests_equal(nodes: &[&TestNode], key: &FragmentKey) -> bool {
    let mut digests = nodes
        .iter()
        .map(|n| (*n.catalog.get(key).unwrap().digest().unwrap()).clone());
    let first = digests.next().unwrap();
    digests.all(|d| d == first)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disjoint_seeds_converge_to_union() {
    let transport = Arc::new(InProcessTransport::new());
    let a = TestNode::new("node-a", &transport);
    let b = TestNode::new("node-b", &transport);
    let c = TestNode::new("node-c", &transport);
    let topology = Arc::new(Topology::new(
        vec![a.node.clone(), b.node.clone(), c.node.clone()],
        3,
    ));
    let key = FragmentKey::new("graph", "edges", 0);

    a.seed(&key, 42, &[1, 2]);
    b.seed(&key, 42, &[3, 70_000]);
    c.seed(&key, 42, &[5]);
    // A second row, present on one node only.
    a.seed(&key, 99, &[17]);

    let engines: Vec<_> = [&a, &b, &c]
        .iter()
        .map(|n| n.repair_engine(&topology, &transport, Arc::new(NoopStats)))
        .collect();

    // One pull round per direction is the bound; two rounds is plenty.
    run_round(&engines).await;
    run_round(&engines).await;

    let expect = vec![1, 2, 3, 5, 70_000];
    for node in [&a, &b, &c] {
        assert_eq!(node.cols(&key, 42), expect, "row 42 on {}", node.node);
        assert_eq!(node.cols(&key, 99), vec![17], "row 99 on {}", node.node);
    }
    assert!(digests_equal(&[&a, &b, &c], &key));
}

#[tokio::test]
async fn removed_node_slices_survive_and_spread() {
    let transport = Arc::new(InProcessTransport::new());
    let a = TestNode::new("node-a", &transport);
    let b = TestNode::new("node-b", &transport);
    let c = TestNode::new("node-c", &transport);
    let all = [&a, &b, &c];
    let topology3 = Topology::new(
        vec![a.node.clone(), b.node.clone(), c.node.clone()],
        2,
    );
    let key = FragmentKey::new("graph", "edges", 0);

    // Replicated state on the two owners the ring picked.
    let owners = topology3.owners_of(&key);
    assert_eq!(owners.len(), 2);
    for node in all.iter().filter(|n| owners.contains(&n.node)) {
        node.seed(&key, 7, &[10, 20, 30]);
    }

    // owners[0] leaves the cluster. The ring keeps the surviving owner
    // in place, so its replica is retained, not rebuilt.
    let survivor = *all
        .iter()
        .find(|n| n.node == owners[1])
        .expect("surviving owner");
    let newcomer = *all
        .iter()
        .find(|n| !owners.contains(&n.node))
        .expect("non-owner");
    let topology2 = Arc::new(Topology::new(
        vec![survivor.node.clone(), newcomer.node.clone()],
        2,
    ));
    assert!(topology2.is_owner(&survivor.node, &key));
    assert!(topology2.is_owner(&newcomer.node, &key));
    assert_eq!(survivor.cols(&key, 7), vec![10, 20, 30]);

    // The newcomer learned the frame exists (a write created it, here
    // an empty open) and discovers the rest on its next pass.
    newcomer.catalog.fragment(&key).unwrap();
    let engine = newcomer.repair_engine(&topology2, &transport, Arc::new(NoopStats));
    engine.run_cycle().await;

    assert_eq!(newcomer.cols(&key, 7), vec![10, 20, 30]);
    assert!(digests_equal(&[survivor, newcomer], &key));
}

#[tokio::test]
async fn unreachable_peer_delays_but_does_not_prevent_convergence() {
    let transport = Arc::new(InProcessTransport::new());
    let a = TestNode::new("node-a", &transport);
    let b = TestNode::new("node-b", &transport);
    let c = TestNode::new("node-c", &transport);
    let topology = Arc::new(Topology::new(
        vec![a.node.clone(), b.node.clone(), c.node.clone()],
        3,
    ));
    let key = FragmentKey::new("graph", "edges", 0);

    a.seed(&key, 1, &[100]);
    b.seed(&key, 1, &[200]);
    c.seed(&key, 1, &[300]);

    transport.take_down(&c.node);
    let engine_a = a.repair_engine(&topology, &transport, Arc::new(NoopStats));
    let engine_b = b.repair_engine(&topology, &transport, Arc::new(NoopStats));

    let cycle = engine_a.run_cycle().await;
    assert_eq!(cycle.unreachable_peers, 1);
    engine_b.run_cycle().await;
    // a and b reconciled with each other despite c being down.
    assert_eq!(a.cols(&key, 1), vec![100, 200]);
    assert_eq!(b.cols(&key, 1), vec![100, 200]);

    transport.bring_up(&c.node);
    let engine_c = c.repair_engine(&topology, &transport, Arc::new(NoopStats));
    let engines = [engine_a, engine_b, engine_c];
    run_round(&engines).await;
    run_round(&engines).await;

    for node in [&a, &b, &c] {
        assert_eq!(node.cols(&key, 1), vec![100, 200, 300]);
    }
    assert!(digests_equal(&[&a, &b, &c], &key));
}

#[tokio::test]
async fn stale_fragment_kept_and_served() {
    let transport = Arc::new(InProcessTransport::new());
    let a = TestNode::new("node-a", &transport);
    let b = TestNode::new("node-b", &transport);
    let topology = Arc::new(Topology::new(vec![a.node.clone(), b.node.clone()], 1));
    let key = FragmentKey::new("graph", "edges", 0);

    // With one replica, exactly one node owns the key; the other plays
    // the stale holder left behind by an ownership change.
    let owners = topology.owners_of(&key);
    assert_eq!(owners.len(), 1);
    let (stale, _owner) = if owners[0] == a.node { (&b, &a) } else { (&a, &b) };
    stale.seed(&key, 3, &[11, 12]);

    let stats = Arc::new(AtomicStats::new());
    let engine = stale.repair_engine(&topology, &transport, stats.clone() as Arc<dyn StatsSink>);
    engine.run_cycle().await;
    engine.run_cycle().await;

    // Counted and logged, never deleted, still answering peers.
    assert_eq!(stats.get(stats::OWNERSHIP_MISMATCH), 2);
    assert_eq!(stale.cols(&key, 3), vec![11, 12]);
    let served = transport.fetch_digest(&stale.node, &key).await.unwrap();
    assert_eq!(served.len(), 1);
}
