//! End-to-end entanglement distribution scenarios.

use photonq_hardware::MemoryConfig;
use photonq_kernel::SECOND;
use photonq_net::{MemoryState, RecordingApp};
use photonq_quantum::Formalism;
use photonq_topology::{
    ClassicalConnection, NodeConfig, NodeType, QuantumConnection, StopTimeConfig, Topology,
    TopologyConfig,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn router(name: &str, memo_size: usize) -> NodeConfig {
    NodeConfig {
        name: name.into(),
        node_type: NodeType::QuantumRouter,
        seed: 0,
        memo_size,
        stack_size: 2,
        group: None,
    }
}

fn bsm(name: &str) -> NodeConfig {
    NodeConfig {
        name: name.into(),
        node_type: NodeType::BSMNode,
        seed: 0,
        memo_size: 0,
        stack_size: 0,
        group: None,
    }
}

fn qc(a: &str, b: &str, distance: f64) -> QuantumConnection {
    QuantumConnection {
        node1: a.into(),
        node2: b.into(),
        attenuation: 0.0,
        distance,
        connection_type: None,
    }
}

fn cc(a: &str, b: &str, delay: u64) -> ClassicalConnection {
    ClassicalConnection {
        node1: a.into(),
        node2: b.into(),
        delay,
    }
}

/// r1 — m — r2 with 1 km legs, ideal hardware apart from raw fidelity.
fn two_router_topology(stop_time: u64, memo_size: usize, raw_fidelity: f64) -> Topology {
    let config = TopologyConfig {
        is_parallel: false,
        stop_time: StopTimeConfig::At(stop_time),
        nodes: vec![router("r1", memo_size), bsm("m"), router("r2", memo_size)],
        qconnections: vec![qc("r1", "m", 1_000.0), qc("m", "r2", 1_000.0)],
        cconnections: vec![
            cc("r1", "r2", 10_000_000),
            cc("r1", "m", 5_000_000),
            cc("m", "r2", 5_000_000),
        ],
    };
    let mut topology = Topology::new(config);
    topology.detector_efficiency = 1.0;
    topology.memory_config = MemoryConfig {
        fidelity: raw_fidelity,
        efficiency: 1.0,
        coherence_time: None,
        ..MemoryConfig::default()
    };
    topology
}

fn recording_app_of<'a>(network: &'a photonq_net::Network, node: &str) -> &'a RecordingApp {
    network.nodes[node]
        .app
        .as_ref()
        .expect("app installed")
        .as_any()
        .downcast_ref::<RecordingApp>()
        .expect("recording app")
}

// ============================================================================
// Scenario 1: two-node heralded generation
// ============================================================================

#[test]
fn two_node_generation_reaches_entangled() {
    init_tracing();
    let topology = two_router_topology(2 * SECOND, 4, 0.9);
    let mut network = topology.build(0, Formalism::Ket).expect("build");
    network.nodes.get_mut("r1").unwrap().app = Some(Box::<RecordingApp>::default());

    network.init().expect("init");
    network
        .request("r1", "r2", SECOND, 2 * SECOND - 1, 1, 0.9)
        .expect("request");
    network.run().expect("run");

    let app = recording_app_of(&network, "r1");
    assert_eq!(
        app.reserve_results.iter().map(|(_, ok)| *ok).collect::<Vec<_>>(),
        vec![true],
        "reservation approved"
    );

    let entangled: Vec<_> = app
        .entangled_memories
        .iter()
        .filter(|(_, remote, _, _)| remote == "r2")
        .collect();
    assert!(
        !entangled.is_empty(),
        "a memory on r1 reached ENTANGLED with r2"
    );
    for (_, _, fidelity, time) in &entangled {
        assert!((fidelity - 0.9).abs() < 1e-9, "fidelity equals raw fidelity");
        assert!(*time >= SECOND, "entanglement inside the reservation window");
    }

    // Pointer symmetry: entangled memories reference each other.
    for memory in &network.nodes["r1"].memories {
        if let Some(remote) = &memory.entangled_memory {
            if remote.node == "r2" {
                let far = &network.nodes["r2"];
                let index = far
                    .memory_index_by_name(&remote.memory)
                    .expect("remote memory exists");
                let back = far.memories[index]
                    .entangled_memory
                    .as_ref()
                    .expect("remote memory points back");
                assert_eq!(back.node, "r1");
                assert_eq!(back.memory, memory.name);
            }
        }
        assert!(
            memory.fidelity <= memory.raw_fidelity + 1e-12,
            "fidelity never exceeds raw fidelity without distillation"
        );
    }
}

#[test]
fn generation_works_in_bell_diagonal_formalism() {
    init_tracing();
    let topology = two_router_topology(2 * SECOND, 4, 0.9);
    let mut network = topology.build(3, Formalism::BellDiagonal).expect("build");
    network.nodes.get_mut("r1").unwrap().app = Some(Box::<RecordingApp>::default());

    network.init().expect("init");
    network
        .request("r1", "r2", SECOND, 2 * SECOND - 1, 1, 0.9)
        .expect("request");
    network.run().expect("run");

    let app = recording_app_of(&network, "r1");
    assert!(
        app.entangled_memories.iter().any(|(_, r, f, _)| r == "r2" && (f - 0.9).abs() < 1e-9),
        "BDS generation entangles with the raw fidelity"
    );

    // The BDS store holds the pair distribution for an entangled memory.
    let entangled_memory = network.nodes["r1"]
        .memories
        .iter()
        .find(|m| m.entangled_memory.is_some());
    if let Some(memory) = entangled_memory {
        let bds = network.qm.get_bds(memory.qstate_key).expect("pair state");
        assert!((bds.fidelity() - 0.9).abs() < 1e-9);
    }
}

// ============================================================================
// Scenario 2: three-node purify and swap
// ============================================================================

#[test]
fn linear_purify_and_swap_reaches_target() {
    init_tracing();
    let memory_size = 10usize;
    let config = TopologyConfig {
        is_parallel: false,
        stop_time: StopTimeConfig::At(30 * SECOND),
        nodes: vec![
            router("r1", memory_size),
            bsm("m1"),
            router("r2", 2 * memory_size),
            bsm("m2"),
            router("r3", memory_size),
        ],
        qconnections: vec![
            qc("r1", "m1", 1_000.0),
            qc("m1", "r2", 1_000.0),
            qc("r2", "m2", 1_000.0),
            qc("m2", "r3", 1_000.0),
        ],
        cconnections: vec![
            cc("r1", "r2", 10_000_000),
            cc("r2", "r3", 10_000_000),
            cc("r1", "r3", 20_000_000),
            cc("r1", "m1", 5_000_000),
            cc("m1", "r2", 5_000_000),
            cc("r2", "m2", 5_000_000),
            cc("m2", "r3", 5_000_000),
        ],
    };
    let mut topology = Topology::new(config);
    topology.detector_efficiency = 1.0;
    topology.memory_config = MemoryConfig {
        fidelity: 0.85,
        efficiency: 1.0,
        coherence_time: None,
        ..MemoryConfig::default()
    };
    topology.es_success_prob = 0.9;
    topology.es_degradation = 0.99;

    let mut network = topology.build(1, Formalism::Ket).expect("build");
    network.nodes.get_mut("r1").unwrap().app = Some(Box::<RecordingApp>::default());

    network.init().expect("init");
    network
        .request("r1", "r3", SECOND, 30 * SECOND - 1, memory_size, 0.9)
        .expect("request");
    network.run().expect("run");

    let app = recording_app_of(&network, "r1");
    assert!(
        app.reserve_results.iter().any(|(_, ok)| *ok),
        "reservation approved along the path"
    );

    let end_to_end: Vec<_> = app
        .entangled_memories
        .iter()
        .filter(|(_, remote, _, _)| remote == "r3")
        .collect();
    assert!(
        !end_to_end.is_empty(),
        "r1 reports memories entangled with r3"
    );

    // Both sides of every swap entered above the target, so the swapped
    // fidelity is bounded below by target² · degradation, and loosely by
    // the stratum floor 0.9 · 0.85² · 0.99.
    let floor = 0.9 * 0.85 * 0.85 * 0.99;
    for (_, _, fidelity, _) in &end_to_end {
        assert!(
            *fidelity >= floor,
            "end-to-end fidelity {fidelity} above stratum floor {floor}"
        );
    }
}

// ============================================================================
// Scenario 5: reservation rejection unwinds
// ============================================================================

#[test]
fn reservation_rejection_unwinds_and_later_requests_succeed() {
    init_tracing();
    // Interior r2 needs 2·size slots: size = 3 over a 4-slot middle fails.
    let memory_size = 3usize;
    let config = TopologyConfig {
        is_parallel: false,
        stop_time: StopTimeConfig::At(20 * SECOND),
        nodes: vec![
            router("r1", 8),
            bsm("m1"),
            router("r2", 4),
            bsm("m2"),
            router("r3", 8),
        ],
        qconnections: vec![
            qc("r1", "m1", 1_000.0),
            qc("m1", "r2", 1_000.0),
            qc("r2", "m2", 1_000.0),
            qc("m2", "r3", 1_000.0),
        ],
        cconnections: vec![cc("r1", "r2", 10_000_000), cc("r2", "r3", 10_000_000)],
    };
    let mut topology = Topology::new(config);
    topology.detector_efficiency = 1.0;
    topology.memory_config = MemoryConfig {
        fidelity: 0.9,
        efficiency: 1.0,
        coherence_time: None,
        ..MemoryConfig::default()
    };

    let mut network = topology.build(7, Formalism::Ket).expect("build");
    network.nodes.get_mut("r1").unwrap().app = Some(Box::<RecordingApp>::default());
    network.init().expect("init");

    // Oversized request: rejected at r2.
    network
        .request("r1", "r3", SECOND, 2 * SECOND, memory_size, 0.9)
        .expect("request");
    // A fitting request afterward must succeed over the same window.
    network
        .request("r1", "r3", 3 * SECOND, 4 * SECOND, 2, 0.9)
        .expect("request");
    network.run().expect("run");

    let app = recording_app_of(&network, "r1");
    let outcomes: Vec<bool> = app.reserve_results.iter().map(|(_, ok)| *ok).collect();
    assert_eq!(outcomes, vec![false, true], "reject then approve");

    let rejected_id = &app.reserve_results[0].0.id;
    for name in ["r1", "r2", "r3"] {
        let nm = network.nodes[name].network_manager.as_ref().expect("nm");
        assert!(
            nm.reserved_indices(rejected_id).is_empty(),
            "{name} holds no slots for the rejected reservation"
        );
    }
}

// ============================================================================
// Scenario 6: memory expiry cascade
// ============================================================================

#[test]
fn memory_expiry_resets_entanglement() {
    init_tracing();
    let mut topology = two_router_topology(4 * SECOND, 4, 0.9);
    topology.memory_config.coherence_time = Some(1.0);

    let mut network = topology.build(0, Formalism::Ket).expect("build");
    network.nodes.get_mut("r1").unwrap().app = Some(Box::<RecordingApp>::default());

    network.init().expect("init");
    network
        .request("r1", "r2", SECOND, 4 * SECOND - 1, 1, 0.9)
        .expect("request");
    network.run().expect("run");

    let app = recording_app_of(&network, "r1");
    assert!(
        !app.entangled_memories.is_empty(),
        "entanglement achieved before expiry"
    );

    // After the run, every coherence window has elapsed: no memory may
    // still claim entanglement from a stale generation.
    for node in ["r1", "r2"] {
        for memory in &network.nodes[node].memories {
            if let Some(generation_time) = memory.generation_time {
                let expire = memory.expire_time(generation_time).expect("finite coherence");
                assert!(
                    expire >= 4 * SECOND - 1,
                    "{}: stale entanglement survived its coherence window",
                    memory.name
                );
            }
        }
        let rm = network.nodes[node].resource_manager.as_ref().expect("rm");
        for info in &rm.memory_manager {
            if info.state == MemoryState::Raw {
                assert!(info.remote_node.is_none());
                assert_eq!(info.fidelity, 0.0);
            }
        }
    }
}
