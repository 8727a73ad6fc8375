//! Determinism: identical seeds and topologies reproduce identical runs.

use photonq_hardware::MemoryConfig;
use photonq_kernel::{StopTime, Timeline, SECOND};
use photonq_net::{Network, RecordingApp};
use photonq_quantum::Formalism;
use photonq_topology::{
    ClassicalConnection, NodeConfig, NodeType, QuantumConnection, StopTimeConfig, Topology,
    TopologyConfig,
};

fn line_topology() -> Topology {
    let config = TopologyConfig {
        is_parallel: false,
        stop_time: StopTimeConfig::At(3 * SECOND),
        nodes: vec![
            NodeConfig {
                name: "r1".into(),
                node_type: NodeType::QuantumRouter,
                seed: 0,
                memo_size: 4,
                stack_size: 2,
                group: None,
            },
            NodeConfig {
                name: "m".into(),
                node_type: NodeType::BSMNode,
                seed: 0,
                memo_size: 0,
                stack_size: 0,
                group: None,
            },
            NodeConfig {
                name: "r2".into(),
                node_type: NodeType::QuantumRouter,
                seed: 0,
                memo_size: 4,
                stack_size: 2,
                group: None,
            },
        ],
        qconnections: vec![
            QuantumConnection {
                node1: "r1".into(),
                node2: "m".into(),
                attenuation: 0.0,
                distance: 1_000.0,
                connection_type: None,
            },
            QuantumConnection {
                node1: "m".into(),
                node2: "r2".into(),
                attenuation: 0.0,
                distance: 1_000.0,
                connection_type: None,
            },
        ],
        cconnections: vec![
            ClassicalConnection {
                node1: "r1".into(),
                node2: "r2".into(),
                delay: 10_000_000,
            },
            ClassicalConnection {
                node1: "r1".into(),
                node2: "m".into(),
                delay: 5_000_000,
            },
            ClassicalConnection {
                node1: "m".into(),
                node2: "r2".into(),
                delay: 5_000_000,
            },
        ],
    };
    let mut topology = Topology::new(config);
    topology.detector_efficiency = 1.0;
    topology.memory_config = MemoryConfig {
        fidelity: 0.9,
        efficiency: 0.7,
        coherence_time: None,
        ..MemoryConfig::default()
    };
    topology
}

/// Snapshot of every memory-info record on every node.
fn snapshot(network: &Network) -> Vec<String> {
    let mut out = Vec::new();
    for (name, node) in &network.nodes {
        if let Some(rm) = &node.resource_manager {
            for info in &rm.memory_manager {
                out.push(format!(
                    "{name}[{}] {:?} {:?} {:?} {:.12} {:?}",
                    info.index,
                    info.state,
                    info.remote_node,
                    info.remote_memo,
                    info.fidelity,
                    info.entangle_time,
                ));
            }
        }
    }
    out
}

fn run_once(seed: u64) -> (Vec<String>, u64, u64) {
    let mut network = line_topology().build(seed, Formalism::Ket).expect("build");
    network.nodes.get_mut("r1").unwrap().app = Some(Box::<RecordingApp>::default());
    network.init().expect("init");
    network
        .request("r1", "r2", SECOND, 3 * SECOND - 1, 2, 0.9)
        .expect("request");
    let summary = network.run().expect("run");
    (snapshot(&network), summary.executed, summary.final_time)
}

#[test]
fn same_seed_reproduces_final_memory_state() {
    let (snap_a, executed_a, final_a) = run_once(42);
    let (snap_b, executed_b, final_b) = run_once(42);

    assert_eq!(snap_a, snap_b, "identical final memory-info snapshots");
    assert_eq!(executed_a, executed_b, "identical event counts");
    assert_eq!(final_a, final_b, "identical final times");
}

#[test]
fn different_seeds_may_diverge_but_run_clean() {
    // Lossy emission (efficiency 0.7) makes herald outcomes seed
    // dependent; both runs must still complete without kernel errors.
    let (_, executed_a, _) = run_once(1);
    let (_, executed_b, _) = run_once(2);
    assert!(executed_a > 0 && executed_b > 0);
}

#[test]
fn same_time_events_dispatch_by_priority_regardless_of_insertion() {
    let mut tl: Timeline<&str> = Timeline::new(StopTime::Never, 0);
    // Lower priority value wins even when inserted second.
    tl.schedule_priority(1_000, 7, "second").unwrap();
    tl.schedule_priority(1_000, 2, "first").unwrap();
    tl.schedule_priority(1_000, 7, "third").unwrap();

    tl.begin_run();
    assert_eq!(tl.pop_due().map(|e| e.kind), Some("first"));
    assert_eq!(tl.pop_due().map(|e| e.kind), Some("second"));
    assert_eq!(tl.pop_due().map(|e| e.kind), Some("third"));
}
