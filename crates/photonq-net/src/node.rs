//! Node model.
//!
//! A node owns its hardware components, its channel endpoints (addressed
//! by destination name), its protocol instances, and — on routers — the
//! resource and network managers. All cross-node references are names
//! resolved through the engine's node arena.

use std::collections::HashMap;

use photonq_hardware::{ClassicalChannel, Memory, QuantumChannel, SingleAtomBsm};
use photonq_kernel::SimRng;

use crate::app::Application;
use crate::generation::GenerationB;
use crate::network::NetworkManager;
use crate::qkd::{Bb84, Cascade, QkdDetectorBank};
use crate::resource::{ProtocolInstance, ResourceManager};

/// Node construction recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// End router: memory array plus the full protocol stack.
    QuantumRouter,
    /// Middle herald node with a BSM device.
    Bsm,
    /// QKD end node with BB84 and optional cascade.
    Qkd,
    /// Router extended with a data-memory array for teleportation-based
    /// distributed computation.
    Dqc,
}

/// A simulated network node.
pub struct Node {
    /// Globally unique node name.
    pub name: String,
    /// Construction recipe.
    pub kind: NodeKind,
    /// Communication memory array.
    pub memories: Vec<Memory>,
    /// Data memory array (DQC nodes only).
    pub data_memories: Vec<Memory>,
    /// BSM device (BSM nodes only).
    pub bsm: Option<SingleAtomBsm>,
    /// Generation relay (BSM nodes only).
    pub generation_b: Option<GenerationB>,
    /// Light source (QKD nodes only).
    pub light_source: Option<photonq_hardware::LightSource>,
    /// Detector bank (QKD nodes only).
    pub detector_bank: Option<QkdDetectorBank>,
    /// BB84 instance (QKD nodes only).
    pub bb84: Option<Bb84>,
    /// Cascade instance (QKD nodes with an error-correction layer).
    pub cascade: Option<Cascade>,
    /// Classical channels by destination node.
    pub cchannels: HashMap<String, ClassicalChannel>,
    /// Quantum channels by destination node.
    pub qchannels: HashMap<String, QuantumChannel>,
    /// Active protocol instances.
    pub protocols: Vec<ProtocolInstance>,
    /// Resource manager (routers only).
    pub resource_manager: Option<ResourceManager>,
    /// Network manager (routers only).
    pub network_manager: Option<NetworkManager>,
    /// Partner router reachable through each BSM middle node:
    /// partner name → middle name.
    pub map_to_middle_node: HashMap<String, String>,
    /// Installed application, if any.
    pub app: Option<Box<dyn Application>>,
    /// The node's deterministic RNG stream.
    pub rng: SimRng,
}

impl Node {
    /// Creates a bare node of the given kind. Hardware and managers are
    /// attached by the topology builder.
    pub fn new(name: String, kind: NodeKind, master_seed: u64) -> Self {
        let rng = SimRng::for_entity(master_seed, &name);
        Self {
            name,
            kind,
            memories: Vec::new(),
            data_memories: Vec::new(),
            bsm: None,
            generation_b: None,
            light_source: None,
            detector_bank: None,
            bb84: None,
            cascade: None,
            cchannels: HashMap::new(),
            qchannels: HashMap::new(),
            protocols: Vec::new(),
            resource_manager: None,
            network_manager: None,
            map_to_middle_node: HashMap::new(),
            app: None,
            rng,
        }
    }

    /// Attaches a classical channel toward a destination.
    pub fn assign_cchannel(&mut self, channel: ClassicalChannel) {
        self.cchannels.insert(channel.receiver.clone(), channel);
    }

    /// Attaches a quantum channel toward a destination.
    pub fn assign_qchannel(&mut self, channel: QuantumChannel) {
        self.qchannels.insert(channel.receiver.clone(), channel);
    }

    /// Finds an active protocol by name.
    pub fn protocol_index(&self, name: &str) -> Option<usize> {
        self.protocols.iter().position(|p| p.name() == name)
    }

    /// Index of the memory with the given name.
    pub fn memory_index_by_name(&self, name: &str) -> Option<usize> {
        self.memories.iter().position(|m| m.name == name)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("memories", &self.memories.len())
            .field("protocols", &self.protocols.len())
            .finish()
    }
}
