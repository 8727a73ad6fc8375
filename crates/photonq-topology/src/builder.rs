//! Topology builder: node recipes and network wiring.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{bail, Context, Result};
use photonq_hardware::{
    ClassicalChannel, Detector, LightSource, Memory, MemoryConfig, QuantumChannel, SingleAtomBsm,
};
use photonq_kernel::{SimRng, MILLISECOND};
use photonq_net::{compute_forwarding, GenerationB, Network, NetworkManager, Node, NodeKind};
use photonq_net::{Bb84, Cascade, QkdDetectorBank, ResourceManager};
use photonq_quantum::Formalism;
use tracing::info;

use crate::config::{ConfigError, NodeType, QuantumConnection, TopologyConfig};

/// Builds a [`Network`] from a topology description plus hardware
/// defaults.
///
/// The JSON document carries the structure (nodes, connections); device
/// parameters it leaves out (memory coherence, detector efficiency, light
/// source settings) are fields on the builder with sensible defaults.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Parsed structural description.
    pub config: TopologyConfig,
    /// Memory parameters for every router memory.
    pub memory_config: MemoryConfig,
    /// BSM/QKD detector efficiency.
    pub detector_efficiency: f64,
    /// Detector dark count rate (Hz).
    pub detector_dark_count: f64,
    /// Detector count rate (Hz).
    pub detector_count_rate: f64,
    /// Detector time resolution (ps).
    pub detector_resolution: u64,
    /// Quantum channel polarization fidelity.
    pub polarization_fidelity: f64,
    /// Quantum channel qubit frequency (Hz).
    pub qc_frequency: u64,
    /// Light source pulse frequency (Hz).
    pub light_frequency: u64,
    /// Light source wavelength (nm).
    pub light_wavelength: f64,
    /// Light source mean photon number per pulse.
    pub mean_photon_num: f64,
    /// Classical delay for node pairs without an explicit connection (ps).
    pub default_cc_delay: u64,
    /// Swapping success probability installed into router rules.
    pub es_success_prob: f64,
    /// Swapping degradation factor installed into router rules.
    pub es_degradation: f64,
}

impl Topology {
    /// Wraps a parsed configuration with default hardware parameters.
    pub fn new(config: TopologyConfig) -> Self {
        Self {
            config,
            memory_config: MemoryConfig::default(),
            detector_efficiency: 0.9,
            detector_dark_count: 0.0,
            detector_count_rate: 25e6,
            detector_resolution: 150,
            polarization_fidelity: 1.0,
            qc_frequency: 80_000_000,
            light_frequency: 80_000_000,
            light_wavelength: 1550.0,
            mean_photon_num: 0.1,
            default_cc_delay: MILLISECOND,
            es_success_prob: 1.0,
            es_degradation: 0.95,
        }
    }

    /// Parses the JSON document and wraps it.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(TopologyConfig::from_json(text)?))
    }

    /// Constructs the network: nodes by recipe, channels, BSM relays,
    /// QKD pairing, and forwarding tables.
    pub fn build(&self, seed: u64, formalism: Formalism) -> Result<Network> {
        self.config.validate().context("topology validation")?;

        let stop_time = self.config.stop_time.to_stop_time();
        let mut network = Network::new(stop_time, seed, formalism);

        // Expand meet-in-the-middle connections into explicit BSM nodes.
        let (qconnections, auto_bsm) = self.expand_connections()?;

        let mut kinds: HashMap<String, NodeType> = HashMap::new();
        for node in &self.config.nodes {
            kinds.insert(node.name.clone(), node.node_type);
        }
        for name in &auto_bsm {
            kinds.insert(name.clone(), NodeType::BSMNode);
        }

        // Node construction by recipe.
        for config in &self.config.nodes {
            let node = self.build_node(
                &config.name,
                config.node_type,
                config.memo_size,
                seed.wrapping_add(config.seed),
                &mut network,
            );
            network.add_node(node)?;
        }
        for name in &auto_bsm {
            let node = self.build_node(name, NodeType::BSMNode, 0, seed, &mut network);
            network.add_node(node)?;
        }

        // Quantum channels, one per direction.
        for qc in &qconnections {
            for (sender, receiver) in
                [(&qc.node1, &qc.node2), (&qc.node2, &qc.node1)]
            {
                let channel = QuantumChannel::new(
                    format!("qc.{sender}.{receiver}"),
                    sender.clone(),
                    receiver.clone(),
                    qc.attenuation,
                    qc.distance,
                    self.polarization_fidelity,
                    self.qc_frequency,
                );
                network
                    .nodes
                    .get_mut(sender)
                    .expect("validated endpoint")
                    .assign_qchannel(channel);
            }
        }

        // Classical channels: explicit connections first, then a default
        // link for every remaining pair so control messages always have a
        // path.
        let mut wired: HashSet<(String, String)> = HashSet::new();
        for cc in &self.config.cconnections {
            for (sender, receiver) in
                [(&cc.node1, &cc.node2), (&cc.node2, &cc.node1)]
            {
                let channel = ClassicalChannel::new(
                    format!("cc.{sender}.{receiver}"),
                    sender.clone(),
                    receiver.clone(),
                    0.0,
                    Some(cc.delay),
                );
                network
                    .nodes
                    .get_mut(sender)
                    .expect("validated endpoint")
                    .assign_cchannel(channel);
                wired.insert((sender.clone(), receiver.clone()));
            }
        }
        let all_names: Vec<String> = network.nodes.keys().cloned().collect();
        for sender in &all_names {
            for receiver in &all_names {
                if sender == receiver || wired.contains(&(sender.clone(), receiver.clone())) {
                    continue;
                }
                let channel = ClassicalChannel::new(
                    format!("cc.{sender}.{receiver}"),
                    sender.clone(),
                    receiver.clone(),
                    0.0,
                    Some(self.default_cc_delay),
                );
                network
                    .nodes
                    .get_mut(sender)
                    .expect("known node")
                    .assign_cchannel(channel);
            }
        }

        // BSM relays need their two adjacent routers.
        self.attach_bsm_relays(&mut network, &kinds)?;

        // QKD pairing: a quantum connection between two QKD nodes fixes
        // alice (node1) and bob (node2).
        self.pair_qkd_nodes(&mut network, &qconnections, &kinds);

        // Forwarding tables over the router graph (BSM middles collapsed).
        self.install_forwarding(&mut network, &qconnections, &kinds);

        info!(
            nodes = network.nodes.len(),
            "topology built"
        );
        Ok(network)
    }

    fn build_node(
        &self,
        name: &str,
        node_type: NodeType,
        memo_size: usize,
        node_seed: u64,
        network: &mut Network,
    ) -> Node {
        let kind = match node_type {
            NodeType::QuantumRouter => NodeKind::QuantumRouter,
            NodeType::BSMNode => NodeKind::Bsm,
            NodeType::QKDNode => NodeKind::Qkd,
            NodeType::DQCNode => NodeKind::Dqc,
        };
        let mut node = Node::new(name.to_string(), kind, node_seed);
        node.rng = SimRng::for_entity(node_seed, name);

        match node_type {
            NodeType::QuantumRouter | NodeType::DQCNode => {
                for i in 0..memo_size {
                    let memory = Memory::new(
                        format!("{name}.memo[{i}]"),
                        name.to_string(),
                        &self.memory_config,
                        &mut network.qm,
                    );
                    node.memories.push(memory);
                }
                if node_type == NodeType::DQCNode {
                    for i in 0..memo_size {
                        let memory = Memory::new(
                            format!("{name}.data[{i}]"),
                            name.to_string(),
                            &self.memory_config,
                            &mut network.qm,
                        );
                        node.data_memories.push(memory);
                    }
                }
                node.resource_manager = Some(ResourceManager::new(memo_size));
                let mut nm = NetworkManager::new(memo_size);
                nm.es_success_prob = self.es_success_prob;
                nm.es_degradation = self.es_degradation;
                node.network_manager = Some(nm);
            }
            NodeType::BSMNode => {
                let detector = Detector::new(
                    self.detector_efficiency,
                    self.detector_dark_count,
                    self.detector_count_rate,
                    self.detector_resolution,
                );
                node.bsm = Some(SingleAtomBsm::new(
                    format!("{name}_bsm"),
                    [detector.clone(), detector],
                ));
            }
            NodeType::QKDNode => {
                node.light_source = Some(LightSource::new(
                    format!("{name}.lightsource"),
                    self.light_frequency,
                    self.light_wavelength,
                    self.mean_photon_num,
                ));
                node.detector_bank = Some(QkdDetectorBank::new(self.detector_efficiency));
            }
        }
        node
    }

    /// Splits meet-in-the-middle router connections around a fresh BSM
    /// node; passes everything else through.
    fn expand_connections(&self) -> Result<(Vec<QuantumConnection>, Vec<String>)> {
        let kinds: HashMap<&str, NodeType> = self
            .config
            .nodes
            .iter()
            .map(|n| (n.name.as_str(), n.node_type))
            .collect();

        let mut out = Vec::new();
        let mut auto = Vec::new();
        for qc in &self.config.qconnections {
            let both_routers = matches!(
                kinds.get(qc.node1.as_str()),
                Some(NodeType::QuantumRouter | NodeType::DQCNode)
            ) && matches!(
                kinds.get(qc.node2.as_str()),
                Some(NodeType::QuantumRouter | NodeType::DQCNode)
            );
            let meet = qc
                .connection_type
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case("meet_in_the_middle"));
            if both_routers && meet {
                let middle = format!("{}_{}_bsm", qc.node1, qc.node2);
                auto.push(middle.clone());
                out.push(QuantumConnection {
                    node1: qc.node1.clone(),
                    node2: middle.clone(),
                    attenuation: qc.attenuation,
                    distance: qc.distance / 2.0,
                    connection_type: None,
                });
                out.push(QuantumConnection {
                    node1: middle,
                    node2: qc.node2.clone(),
                    attenuation: qc.attenuation,
                    distance: qc.distance / 2.0,
                    connection_type: None,
                });
            } else {
                out.push(qc.clone());
            }
        }
        Ok((out, auto))
    }

    fn attach_bsm_relays(
        &self,
        network: &mut Network,
        kinds: &HashMap<String, NodeType>,
    ) -> Result<()> {
        let bsm_names: Vec<String> = kinds
            .iter()
            .filter(|(_, t)| **t == NodeType::BSMNode)
            .map(|(n, _)| n.clone())
            .collect();
        for name in bsm_names {
            let mut others: Vec<String> = network
                .nodes
                .values()
                .filter(|n| n.qchannels.contains_key(&name))
                .map(|n| n.name.clone())
                .collect();
            others.sort();
            if others.len() != 2 {
                bail!(ConfigError::BadBsmDegree(name, others.len()));
            }
            let node = network.nodes.get_mut(&name).expect("known BSM node");
            node.generation_b = Some(GenerationB::new(format!("{name}_eg"), others));
        }
        Ok(())
    }

    fn pair_qkd_nodes(
        &self,
        network: &mut Network,
        qconnections: &[QuantumConnection],
        kinds: &HashMap<String, NodeType>,
    ) {
        for qc in qconnections {
            let qkd_pair = kinds.get(&qc.node1) == Some(&NodeType::QKDNode)
                && kinds.get(&qc.node2) == Some(&NodeType::QKDNode);
            if !qkd_pair {
                continue;
            }
            let stack_size = |name: &str| {
                self.config
                    .nodes
                    .iter()
                    .find(|n| n.name == *name)
                    .map_or(2, |n| n.stack_size)
            };
            for (own, peer, role) in [
                (&qc.node1, &qc.node2, 0i8),
                (&qc.node2, &qc.node1, 1i8),
            ] {
                let node = network.nodes.get_mut(own).expect("known QKD node");
                let mut bb84 = Bb84::new(
                    format!("{own}.BB84"),
                    peer.clone(),
                    format!("{peer}.BB84"),
                );
                bb84.role = role;
                node.bb84 = Some(bb84);
                if stack_size(own) > 1 {
                    let mut cascade = Cascade::new(
                        format!("{own}.cascade"),
                        peer.clone(),
                        format!("{peer}.cascade"),
                    );
                    cascade.role = role;
                    node.cascade = Some(cascade);
                }
            }
        }
    }

    fn install_forwarding(
        &self,
        network: &mut Network,
        qconnections: &[QuantumConnection],
        kinds: &HashMap<String, NodeType>,
    ) {
        let is_router = |name: &str| {
            matches!(
                kinds.get(name),
                Some(NodeType::QuantumRouter | NodeType::DQCNode | NodeType::QKDNode)
            )
        };

        // Collapse BSM middles into router—router links.
        let mut links: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
        let mut bsm_legs: HashMap<String, Vec<(String, f64)>> = HashMap::new();
        for qc in qconnections {
            let (r, b, d) = if kinds.get(&qc.node1) == Some(&NodeType::BSMNode) {
                (&qc.node2, &qc.node1, qc.distance)
            } else if kinds.get(&qc.node2) == Some(&NodeType::BSMNode) {
                (&qc.node1, &qc.node2, qc.distance)
            } else {
                if is_router(&qc.node1) && is_router(&qc.node2) {
                    links
                        .entry(qc.node1.clone())
                        .or_default()
                        .push((qc.node2.clone(), qc.distance));
                    links
                        .entry(qc.node2.clone())
                        .or_default()
                        .push((qc.node1.clone(), qc.distance));
                }
                continue;
            };
            bsm_legs.entry(b.clone()).or_default().push((r.clone(), d));
        }
        for legs in bsm_legs.values() {
            if let [(r1, d1), (r2, d2)] = legs.as_slice() {
                links
                    .entry(r1.clone())
                    .or_default()
                    .push((r2.clone(), d1 + d2));
                links
                    .entry(r2.clone())
                    .or_default()
                    .push((r1.clone(), d1 + d2));
            }
        }

        let routers: Vec<String> = network
            .nodes
            .keys()
            .filter(|n| is_router(n))
            .cloned()
            .collect();
        for router in routers {
            let table = compute_forwarding(&router, &links);
            if let Some(nm) = network
                .nodes
                .get_mut(&router)
                .and_then(|n| n.network_manager.as_mut())
            {
                nm.forwarding_table = table;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StopTimeConfig;
    use crate::config::{ClassicalConnection, NodeConfig};

    fn router(name: &str) -> NodeConfig {
        NodeConfig {
            name: name.into(),
            node_type: NodeType::QuantumRouter,
            seed: 0,
            memo_size: 4,
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

    fn line_config() -> TopologyConfig {
        TopologyConfig {
            is_parallel: false,
            stop_time: StopTimeConfig::At(10_000_000_000_000),
            nodes: vec![router("r1"), bsm("m1"), router("r2")],
            qconnections: vec![qc("r1", "m1", 500.0), qc("m1", "r2", 500.0)],
            cconnections: vec![ClassicalConnection {
                node1: "r1".into(),
                node2: "r2".into(),
                delay: 1_000_000,
            }],
        }
    }

    #[test]
    fn builds_line_topology() {
        let network = Topology::new(line_config())
            .build(0, Formalism::Ket)
            .expect("build");

        assert_eq!(network.nodes.len(), 3);
        let r1 = &network.nodes["r1"];
        assert_eq!(r1.memories.len(), 4);
        assert!(r1.resource_manager.is_some());
        assert!(r1.qchannels.contains_key("m1"));
        assert!(r1.cchannels.contains_key("r2"));
        // Default classical links exist toward the middle too.
        assert!(r1.cchannels.contains_key("m1"));

        let m1 = &network.nodes["m1"];
        assert!(m1.bsm.is_some());
        let relay = m1.generation_b.as_ref().expect("relay installed");
        assert_eq!(relay.others, vec!["r1".to_string(), "r2".to_string()]);
    }

    #[test]
    fn forwarding_collapses_bsm_middle() {
        let network = Topology::new(line_config())
            .build(0, Formalism::Ket)
            .expect("build");
        let nm = network.nodes["r1"].network_manager.as_ref().expect("nm");
        assert_eq!(nm.forwarding_table["r2"], "r2", "BSM collapsed to a direct hop");
    }

    #[test]
    fn meet_in_the_middle_creates_bsm() {
        let mut config = line_config();
        config.nodes = vec![router("r1"), router("r2")];
        config.qconnections = vec![QuantumConnection {
            node1: "r1".into(),
            node2: "r2".into(),
            attenuation: 0.0,
            distance: 1000.0,
            connection_type: Some("meet_in_the_middle".into()),
        }];

        let network = Topology::new(config)
            .build(0, Formalism::Ket)
            .expect("build");
        assert!(network.nodes.contains_key("r1_r2_bsm"));
        let bsm = &network.nodes["r1_r2_bsm"];
        assert!(bsm.bsm.is_some());
        assert!(network.nodes["r1"].qchannels.contains_key("r1_r2_bsm"));
    }

    #[test]
    fn init_passes_on_built_network() {
        let mut network = Topology::new(line_config())
            .build(0, Formalism::Ket)
            .expect("build");
        network.init().expect("init");
        assert_eq!(
            network.nodes["r1"].map_to_middle_node.get("r2"),
            Some(&"m1".to_string())
        );
    }
}
