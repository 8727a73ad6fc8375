//! Protocol step context and effects.
//!
//! Protocol state machines run against a context borrowing their own
//! node's hardware, and describe everything else — messages, scheduling,
//! resource-manager bookkeeping — as effects the engine applies once the
//! step returns. The step itself never reaches across nodes.

use std::collections::HashMap;

use photonq_hardware::{ClassicalChannel, Memory, QuantumChannel};
use photonq_kernel::SimRng;
use photonq_quantum::QuantumManager;

use crate::message::Message;
use crate::resource::MemoryState;

/// Side effects produced by a protocol step.
#[derive(Debug)]
pub enum Effect {
    /// Send a classical message to another node over the direct channel.
    Send {
        /// Destination node name.
        dst: String,
        /// Message to deliver.
        message: Message,
    },
    /// Schedule a photon emission re-entry for a named protocol. The event
    /// is counter-pinned so simultaneous emissions resolve in submission
    /// order.
    ScheduleEmit {
        /// Absolute emission time (ps).
        time: u64,
        /// Protocol instance name.
        protocol: String,
    },
    /// Deliver an in-flight photon to a destination node at its channel
    /// arrival time. Counter-pinned: photons arriving coincidentally at a
    /// middle node dispatch in submission order regardless of which
    /// endpoint sits closer.
    DeliverPhoton {
        /// Destination node name.
        dst: String,
        /// Arrival time (ps).
        time: u64,
        /// The photon.
        photon: photonq_hardware::Photon,
    },
    /// Schedule a `start` re-entry for a named protocol.
    ScheduleStart {
        /// Absolute time (ps).
        time: u64,
        /// Protocol instance name.
        protocol: String,
    },
    /// Schedule an `update_memory` re-entry for a named protocol.
    ScheduleUpdateMemory {
        /// Absolute time (ps).
        time: u64,
        /// Protocol instance name.
        protocol: String,
    },
    /// Cancel every event previously scheduled for a protocol.
    CancelScheduledEvents {
        /// Protocol instance name.
        protocol: String,
    },
    /// Mirror a memory state change into the resource manager. When
    /// `protocol` is set, the named protocol is also detached and removed.
    RmUpdate {
        /// Protocol responsible for the transition, if any.
        protocol: Option<String>,
        /// Index of the affected memory.
        memory_index: usize,
        /// New bookkeeping state.
        state: MemoryState,
    },
    /// Move a memory's expiration event to a new time.
    UpdateExpireTime {
        /// Index of the affected memory.
        memory_index: usize,
        /// New expiration time (ps).
        time: u64,
    },
    /// Ask a remote resource manager to release a paired protocol.
    ReleaseRemoteProtocol {
        /// Remote node name.
        node: String,
        /// Remote protocol name.
        protocol: String,
    },
    /// Ask a remote resource manager to release a memory.
    ReleaseRemoteMemory {
        /// Remote node name.
        node: String,
        /// Remote memory name.
        memory: String,
    },
    /// Schedule a QKD stack operation on the own node.
    ScheduleQkd {
        /// Absolute time (ps).
        time: u64,
        /// Operation to run.
        op: crate::qkd::QkdOp,
    },
    /// Deliver a finished key to the next stack layer (cascade above BB84,
    /// or the key-manager application above cascade).
    PopKey {
        /// Key bits.
        key: Vec<u8>,
        /// Index of the stack layer that produced the key (0 = BB84).
        layer: usize,
    },
    /// Forward a key request to the next stack layer down (cascade asking
    /// BB84 for sifted keys).
    PushKeyRequest {
        /// Key length in bits.
        key_length: usize,
        /// Number of keys.
        key_count: usize,
    },
}

/// Borrowed view of the protocol's own node plus the shared quantum
/// manager, handed to every protocol step.
pub struct ProtoCtx<'a> {
    /// Current simulation time (ps).
    pub now: u64,
    /// Name of the node the protocol runs on.
    pub node_name: &'a str,
    /// The node's memory array.
    pub memories: &'a mut Vec<Memory>,
    /// Shared quantum state manager.
    pub qm: &'a mut QuantumManager,
    /// The node's RNG stream.
    pub rng: &'a mut SimRng,
    /// Classical channels by destination (read for delays).
    pub cchannels: &'a HashMap<String, ClassicalChannel>,
    /// Quantum channels by destination (mutated for time-bin allocation).
    pub qchannels: &'a mut HashMap<String, QuantumChannel>,
    /// Effects accumulated by the step.
    pub effects: &'a mut Vec<Effect>,
}

impl ProtoCtx<'_> {
    /// Queues a message send.
    pub fn send(&mut self, dst: impl Into<String>, message: Message) {
        self.effects.push(Effect::Send {
            dst: dst.into(),
            message,
        });
    }

    /// Classical delay toward a destination, if a channel exists.
    pub fn cc_delay(&self, dst: &str) -> Option<u64> {
        self.cchannels.get(dst).map(|c| c.delay)
    }

    /// Quantum-channel delay toward a destination, if a channel exists.
    pub fn qc_delay(&self, dst: &str) -> Option<u64> {
        self.qchannels.get(dst).map(|c| c.delay)
    }
}
