//! The simulation engine.
//!
//! [`Network`] owns the kernel timeline, the shared quantum manager, and
//! the node arena, and interprets [`EventKind`] operations against them.
//! Protocol steps run against a borrowed view of their own node and emit
//! effects; the engine applies the effects — sending messages over
//! channels, scheduling kernel events, and mirroring memory transitions
//! into the resource managers, which in turn fire rules and spawn new
//! protocol instances.

use std::collections::{BTreeMap, HashMap};

use photonq_hardware::{Photon, PhotonEncoding};
use photonq_kernel::{Event, EventId, StopTime, Timeline, TimelineSummary};
use photonq_quantum::{Formalism, QuantumManager, DEFAULT_CACHE_CAPACITY};
use tracing::{debug, info, warn};

use crate::effects::{Effect, ProtoCtx};
use crate::error::NetError;
use crate::generation::GenerationA;
use crate::message::{Message, MessageBody, MessageReceiver};
use crate::network::{
    compute_forwarding, Reservation, ReservationId, ReservationMessage, RoutingProtocol,
};
use crate::node::Node;
use crate::purification::Bbpssw;
use crate::qkd::{QkdCtx, QkdOp};
use crate::resource::{
    MemoryState, PairCondition, ProtocolInstance, ResourceManagerMessage, RuleKind,
};
use crate::swapping::{SwappingA, SwappingB};

// ============================================================================
// Event Kinds
// ============================================================================

/// Scheduled operations interpreted by the engine.
///
/// Each variant names its owning entity; dispatch is a lookup through the
/// node arena, never a pointer.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// Deliver a classical message.
    DeliverMessage {
        /// Receiving node.
        node: String,
        /// Sending node.
        src: String,
        /// The message.
        message: Message,
    },
    /// Deliver a photon.
    ReceiveQubit {
        /// Receiving node.
        node: String,
        /// Sending node.
        src: String,
        /// The photon.
        photon: Photon,
    },
    /// Re-enter a generation protocol to emit a photon.
    ProtocolEmit {
        /// Owning node.
        node: String,
        /// Protocol instance name.
        protocol: String,
    },
    /// Re-enter a protocol's `start`.
    ProtocolStart {
        /// Owning node.
        node: String,
        /// Protocol instance name.
        protocol: String,
    },
    /// Re-enter a generation protocol's round bookkeeping.
    ProtocolUpdateMemory {
        /// Owning node.
        node: String,
        /// Protocol instance name.
        protocol: String,
    },
    /// A memory's coherence window elapsed.
    MemoryExpire {
        /// Owning node.
        node: String,
        /// Slot index.
        memory_index: usize,
    },
    /// Install an approved reservation's rules.
    LoadRules {
        /// Owning node.
        node: String,
        /// The reservation.
        reservation: ReservationId,
    },
    /// Remove an expired reservation's rules.
    ExpireRules {
        /// Owning node.
        node: String,
        /// The reservation.
        reservation: ReservationId,
    },
    /// Reset the reserved memories at a reservation's start.
    ReleaseReservedMemories {
        /// Owning node.
        node: String,
        /// The reservation.
        reservation: ReservationId,
    },
    /// QKD stack operation.
    Qkd {
        /// Owning node.
        node: String,
        /// The operation.
        op: QkdOp,
    },
    /// A BSM detector fires spontaneously.
    DetectorDarkCount {
        /// Owning node.
        node: String,
        /// Detector index on the BSM device.
        detector: usize,
    },
}

// ============================================================================
// Network
// ============================================================================

/// The simulated network: kernel timeline, quantum manager, node arena.
pub struct Network {
    /// The simulation timeline.
    pub timeline: Timeline<EventKind>,
    /// The shared quantum state manager.
    pub qm: QuantumManager,
    /// Node arena, keyed by name.
    pub nodes: BTreeMap<String, Node>,
    /// Events scheduled on behalf of protocols, for cancellation.
    protocol_events: HashMap<(String, String), Vec<EventId>>,
}

impl Network {
    /// Creates an empty network.
    pub fn new(stop_time: StopTime, seed: u64, formalism: Formalism) -> Self {
        Self {
            timeline: Timeline::new(stop_time, seed),
            qm: QuantumManager::new(formalism, DEFAULT_CACHE_CAPACITY),
            nodes: BTreeMap::new(),
            protocol_events: HashMap::new(),
        }
    }

    /// Registers a node.
    pub fn add_node(&mut self, node: Node) -> Result<(), NetError> {
        if self.nodes.contains_key(&node.name) {
            return Err(NetError::DuplicateNode(node.name));
        }
        self.nodes.insert(node.name.clone(), node);
        Ok(())
    }

    /// Validates the configuration and initializes every node.
    ///
    /// Fatal checks: dangling channel endpoints. Also derives each
    /// router's partner → middle-node map and floods link states for
    /// distributed routing.
    pub fn init(&mut self) -> Result<(), NetError> {
        // Dangling endpoints are a configuration error.
        for node in self.nodes.values() {
            for channel in node.cchannels.values() {
                if !self.nodes.contains_key(&channel.receiver) {
                    return Err(NetError::DanglingEndpoint {
                        channel: channel.name.clone(),
                        endpoint: channel.receiver.clone(),
                    });
                }
            }
            for channel in node.qchannels.values() {
                if !self.nodes.contains_key(&channel.receiver) {
                    return Err(NetError::DanglingEndpoint {
                        channel: channel.name.clone(),
                        endpoint: channel.receiver.clone(),
                    });
                }
            }
        }

        // Partner router → middle node, derived from BSM adjacency.
        let mut middle_maps: HashMap<String, HashMap<String, String>> = HashMap::new();
        for node in self.nodes.values() {
            for dst in node.qchannels.keys() {
                let Some(peer) = self.nodes.get(dst) else {
                    continue;
                };
                if let Some(generation_b) = &peer.generation_b {
                    for other in &generation_b.others {
                        if other != &node.name {
                            middle_maps
                                .entry(node.name.clone())
                                .or_default()
                                .insert(other.clone(), peer.name.clone());
                        }
                    }
                }
            }
        }
        for (name, map) in middle_maps {
            if let Some(node) = self.nodes.get_mut(&name) {
                node.map_to_middle_node = map;
            }
        }

        // Seed dark-count self-scheduling for BSM detectors with a
        // positive rate.
        let mut dark_counts = Vec::new();
        for node in self.nodes.values_mut() {
            let name = node.name.clone();
            if let Some(bsm) = node.bsm.as_ref() {
                for detector in 0..2 {
                    if bsm.detectors()[detector].dark_count > 0.0 {
                        if let Some(interval) =
                            bsm.detectors()[detector].next_dark_interval(&mut node.rng)
                        {
                            dark_counts.push((name.clone(), detector, interval));
                        }
                    }
                }
            }
        }
        for (name, detector, interval) in dark_counts {
            let time = self.timeline.now() + interval;
            self.timeline.schedule(
                time,
                EventKind::DetectorDarkCount {
                    node: name,
                    detector,
                },
            )?;
        }

        // Distributed routing: advertise link states to every neighbor.
        let mut floods = Vec::new();
        for node in self.nodes.values() {
            if let Some(nm) = &node.network_manager {
                if let RoutingProtocol::Distributed { lsdb, seq } = &nm.routing {
                    if let Some((_, neighbors)) = lsdb.get(&node.name) {
                        let mut peers: Vec<String> = node.cchannels.keys().cloned().collect();
                        peers.sort();
                        for peer in peers {
                            floods.push((node.name.clone(), peer, neighbors.clone(), *seq));
                        }
                    }
                }
            }
        }
        for (origin, peer, neighbors, seq) in floods {
            let message = Message::to_network_manager(MessageBody::LinkState {
                origin: origin.clone(),
                neighbors,
                seq,
            });
            self.send_message(&origin, &peer, message, None)?;
        }

        info!(nodes = self.nodes.len(), "network initialized");
        Ok(())
    }

    /// Runs the simulation to the stop-time contract.
    pub fn run(&mut self) -> Result<TimelineSummary, NetError> {
        self.timeline.begin_run();
        while let Some(event) = self.timeline.pop_due() {
            self.handle(event)?;
        }
        Ok(self.timeline.end_run())
    }

    /// Stops the simulation at the current time.
    pub fn stop(&mut self) {
        self.timeline.stop();
    }

    /// Issues an entanglement request from a router's network manager.
    ///
    /// Side effects: local admission, then a reservation REQUEST forwarded
    /// along the path. The application eventually receives
    /// `get_reserve_res`.
    pub fn request(
        &mut self,
        initiator: &str,
        responder: &str,
        start_time: u64,
        end_time: u64,
        memory_size: usize,
        target_fidelity: f64,
    ) -> Result<(), NetError> {
        let node = self
            .nodes
            .get_mut(initiator)
            .ok_or_else(|| NetError::UnknownNode(initiator.to_string()))?;
        let nm = node
            .network_manager
            .as_mut()
            .expect("requests originate at routers");
        let seq = nm.next_seq;
        nm.next_seq += 1;

        let reservation = Reservation::new(
            ReservationId {
                node: initiator.to_string(),
                seq,
            },
            initiator.to_string(),
            responder.to_string(),
            start_time,
            end_time,
            memory_size,
            target_fidelity,
        );

        if nm.schedule(initiator, &reservation) {
            let next_hop = nm
                .forwarding_table
                .get(responder)
                .cloned()
                .ok_or_else(|| NetError::MissingRoute {
                    node: initiator.to_string(),
                    dst: responder.to_string(),
                })?;
            let message = Message::to_network_manager(MessageBody::Reservation(
                ReservationMessage::Request {
                    reservation,
                    qcaps: vec![initiator.to_string()],
                },
            ));
            self.send_message(initiator, &next_hop, message, None)?;
        } else if let Some(app) = node.app.as_mut() {
            app.get_reserve_res(&reservation, false);
        }
        Ok(())
    }

    /// Issues a QKD key request on a QKD node (alice side).
    pub fn qkd_push(
        &mut self,
        node_name: &str,
        key_length: usize,
        key_count: usize,
    ) -> Result<(), NetError> {
        let mut effects = Vec::new();
        {
            let node = self
                .nodes
                .get_mut(node_name)
                .ok_or_else(|| NetError::UnknownNode(node_name.to_string()))?;
            let now = self.timeline.now();
            if let Some(mut cascade) = node.cascade.take() {
                {
                    let mut ctx = qkd_ctx(node, &mut effects, now);
                    cascade.push(key_length, key_count, &mut ctx);
                }
                node.cascade = Some(cascade);
            } else if let Some(mut bb84) = node.bb84.take() {
                {
                    let mut ctx = qkd_ctx(node, &mut effects, now);
                    bb84.push(key_length, key_count, &mut ctx);
                }
                node.bb84 = Some(bb84);
            }
        }
        self.apply_effects(node_name, effects)
    }

    // ========================================================================
    // Event dispatch
    // ========================================================================

    fn handle(&mut self, event: Event<EventKind>) -> Result<(), NetError> {
        match event.kind {
            EventKind::DeliverMessage { node, src, message } => {
                self.receive_message(&node, &src, message)
            }
            EventKind::ReceiveQubit { node, src, photon } => {
                self.receive_qubit(&node, &src, photon)
            }
            EventKind::ProtocolEmit { node, protocol } => {
                self.with_protocol(&node, &protocol, |instance, ctx| {
                    if let ProtocolInstance::GenerationA(p) = instance {
                        p.emit_event(ctx);
                    }
                })
            }
            EventKind::ProtocolStart { node, protocol } => self.start_protocol(&node, &protocol),
            EventKind::ProtocolUpdateMemory { node, protocol } => {
                self.with_protocol(&node, &protocol, |instance, ctx| {
                    if let ProtocolInstance::GenerationA(p) = instance {
                        p.update_memory(ctx);
                    }
                })
            }
            EventKind::MemoryExpire { node, memory_index } => {
                self.memory_expire(&node, memory_index)
            }
            EventKind::LoadRules { node, reservation } => self.load_rules(&node, &reservation),
            EventKind::ExpireRules { node, reservation } => {
                self.expire_rules(&node, &reservation)
            }
            EventKind::ReleaseReservedMemories { node, reservation } => {
                let indices = self
                    .nodes
                    .get(&node)
                    .and_then(|n| n.network_manager.as_ref())
                    .map(|nm| nm.reserved_indices(&reservation))
                    .unwrap_or_default();
                for index in indices {
                    self.rm_update(&node, None, index, MemoryState::Raw)?;
                }
                Ok(())
            }
            EventKind::Qkd { node, op } => self.qkd_op(&node, &op),
            EventKind::DetectorDarkCount { node, detector } => {
                self.detector_dark_count(&node, detector)
            }
        }
    }

    /// Fires a spontaneous detection and schedules the next one.
    fn detector_dark_count(&mut self, node: &str, detector: usize) -> Result<(), NetError> {
        let mut effects = Vec::new();
        let next_interval = {
            let node_ref = self
                .nodes
                .get_mut(node)
                .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
            let now = self.timeline.now();
            let Some(bsm) = node_ref.bsm.as_mut() else {
                return Ok(());
            };
            let resolution = bsm.resolution();
            let trigger = bsm.detectors_mut()[detector].get(&mut node_ref.rng, now, true);
            if let Some(trigger) = trigger {
                if let Some(generation_b) = &node_ref.generation_b {
                    generation_b.bsm_update(
                        photonq_hardware::BsmResolution {
                            detector: detector as u8,
                            time: trigger.time,
                            resolution,
                        },
                        &mut effects,
                    );
                }
            }
            let bsm = node_ref.bsm.as_ref().expect("checked above");
            bsm.detectors()[detector].next_dark_interval(&mut node_ref.rng)
        };

        if let Some(interval) = next_interval {
            let time = self.timeline.now() + interval;
            self.timeline.schedule(
                time,
                EventKind::DetectorDarkCount {
                    node: node.to_string(),
                    detector,
                },
            )?;
        }
        self.apply_effects(node, effects)
    }

    // ========================================================================
    // Classical message plumbing
    // ========================================================================

    /// Transmits a message over the direct classical channel. Without an
    /// explicit priority the delivery event is counter-pinned, which keeps
    /// per-channel delivery FIFO and cross-channel order deterministic.
    pub fn send_message(
        &mut self,
        src: &str,
        dst: &str,
        message: Message,
        priority: Option<u64>,
    ) -> Result<(), NetError> {
        let node = self
            .nodes
            .get(src)
            .ok_or_else(|| NetError::UnknownNode(src.to_string()))?;
        let channel = node
            .cchannels
            .get(dst)
            .ok_or_else(|| NetError::MissingChannel {
                node: src.to_string(),
                dst: dst.to_string(),
            })?;
        let time = channel.delivery_time(self.timeline.now());
        let kind = EventKind::DeliverMessage {
            node: dst.to_string(),
            src: src.to_string(),
            message,
        };
        match priority {
            Some(p) => self.timeline.schedule_priority(time, p, kind)?,
            None => self.timeline.schedule_counter_priority(time, kind)?,
        };
        Ok(())
    }

    fn receive_message(&mut self, node: &str, src: &str, message: Message) -> Result<(), NetError> {
        match message.receiver {
            MessageReceiver::Protocol(name) => self.deliver_to_protocol(node, src, &name, message.body),
            MessageReceiver::GenerationBroadcast => {
                let names: Vec<String> = self
                    .nodes
                    .get(node)
                    .map(|n| {
                        n.protocols
                            .iter()
                            .filter(|p| matches!(p, ProtocolInstance::GenerationA(_)))
                            .map(|p| p.name().to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                for name in names {
                    if let MessageBody::Generation(msg) = &message.body {
                        self.with_protocol(node, &name, |instance, ctx| {
                            if let ProtocolInstance::GenerationA(p) = instance {
                                p.received_message(src, msg, ctx);
                            }
                        })?;
                    }
                }
                Ok(())
            }
            MessageReceiver::ResourceManager => {
                if let MessageBody::ResourceManager(msg) = message.body {
                    self.rm_received_message(node, src, msg)
                } else {
                    Ok(())
                }
            }
            MessageReceiver::NetworkManager => match message.body {
                MessageBody::Reservation(msg) => self.nm_received_message(node, src, msg),
                MessageBody::LinkState {
                    origin,
                    neighbors,
                    seq,
                } => self.link_state_received(node, src, origin, neighbors, seq),
                _ => Ok(()),
            },
        }
    }

    fn deliver_to_protocol(
        &mut self,
        node: &str,
        src: &str,
        name: &str,
        body: MessageBody,
    ) -> Result<(), NetError> {
        // QKD stack protocols live outside the protocol list.
        match &body {
            MessageBody::Bb84(msg) => {
                let mut effects = Vec::new();
                {
                    let node_ref = self
                        .nodes
                        .get_mut(node)
                        .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
                    let now = self.timeline.now();
                    if node_ref.bb84.as_ref().is_some_and(|p| p.name == name) {
                        let mut bb84 = node_ref.bb84.take().expect("checked above");
                        {
                            let mut ctx = qkd_ctx(node_ref, &mut effects, now);
                            bb84.received_message(src, msg, &mut ctx);
                        }
                        node_ref.bb84 = Some(bb84);
                    }
                }
                return self.apply_effects(node, effects);
            }
            MessageBody::Cascade(msg) => {
                let mut effects = Vec::new();
                {
                    let node_ref = self
                        .nodes
                        .get_mut(node)
                        .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
                    let now = self.timeline.now();
                    if node_ref.cascade.as_ref().is_some_and(|p| p.name == name) {
                        let mut cascade = node_ref.cascade.take().expect("checked above");
                        {
                            let mut ctx = qkd_ctx(node_ref, &mut effects, now);
                            cascade.received_message(src, msg, &mut ctx);
                        }
                        node_ref.cascade = Some(cascade);
                    }
                }
                return self.apply_effects(node, effects);
            }
            _ => {}
        }

        self.with_protocol(node, name, |instance, ctx| match (&body, instance) {
            (MessageBody::Generation(msg), ProtocolInstance::GenerationA(p)) => {
                p.received_message(src, msg, ctx);
            }
            (MessageBody::Purification(msg), ProtocolInstance::Purification(p)) => {
                p.received_message(src, msg, ctx);
            }
            (MessageBody::Swapping(msg), ProtocolInstance::SwappingB(p)) => {
                p.received_message(src, msg, ctx);
            }
            _ => {}
        })
    }

    // ========================================================================
    // Photon plumbing
    // ========================================================================

    fn receive_qubit(&mut self, node: &str, _src: &str, photon: Photon) -> Result<(), NetError> {
        let mut effects = Vec::new();
        {
            let node_ref = self
                .nodes
                .get_mut(node)
                .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
            let now = self.timeline.now();

            if let Some(bsm) = node_ref.bsm.as_mut() {
                let resolutions = bsm.get(photon, &mut node_ref.rng, now);
                if let Some(generation_b) = &node_ref.generation_b {
                    for resolution in resolutions {
                        generation_b.bsm_update(resolution, &mut effects);
                    }
                }
            } else if let Some(bank) = node_ref.detector_bank.as_mut() {
                if let PhotonEncoding::Polarization {
                    basis,
                    bit,
                    scrambled,
                } = photon.encoding
                {
                    bank.detect(basis, bit, scrambled, now, &mut node_ref.rng);
                }
            } else {
                debug!(node, "photon arrived at a node without optics; dropped");
            }
        }
        self.apply_effects(node, effects)
    }

    // ========================================================================
    // Protocol plumbing
    // ========================================================================

    /// Runs a closure against a named protocol with a borrowed node
    /// context, then applies the produced effects. Silently skips
    /// protocols that no longer exist (stale events).
    fn with_protocol(
        &mut self,
        node: &str,
        protocol: &str,
        f: impl FnOnce(&mut ProtocolInstance, &mut ProtoCtx<'_>),
    ) -> Result<(), NetError> {
        let mut effects = Vec::new();
        {
            let node_ref = self
                .nodes
                .get_mut(node)
                .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
            let Some(index) = node_ref.protocol_index(protocol) else {
                return Ok(());
            };
            let mut instance = node_ref.protocols.remove(index);
            let now = self.timeline.now();
            {
                let mut ctx = ProtoCtx {
                    now,
                    node_name: &node_ref.name,
                    memories: &mut node_ref.memories,
                    qm: &mut self.qm,
                    rng: &mut node_ref.rng,
                    cchannels: &node_ref.cchannels,
                    qchannels: &mut node_ref.qchannels,
                    effects: &mut effects,
                };
                f(&mut instance, &mut ctx);
            }
            node_ref.protocols.insert(index, instance);
        }
        self.apply_effects(node, effects)
    }

    fn start_protocol(&mut self, node: &str, protocol: &str) -> Result<(), NetError> {
        let own_name = node.to_string();
        self.with_protocol(node, protocol, |instance, ctx| match instance {
            ProtocolInstance::GenerationA(p) => p.start(&own_name, ctx),
            ProtocolInstance::Purification(p) => p.start(ctx),
            ProtocolInstance::SwappingA(p) => p.start(ctx),
            ProtocolInstance::SwappingB(_) | ProtocolInstance::GenerationB(_) => {}
        })
    }

    // ========================================================================
    // Effects
    // ========================================================================

    fn apply_effects(&mut self, node: &str, effects: Vec<Effect>) -> Result<(), NetError> {
        for effect in effects {
            match effect {
                Effect::Send { dst, message } => {
                    self.send_message(node, &dst, message, None)?;
                }
                Effect::ScheduleEmit { time, protocol } => {
                    let id = self.timeline.schedule_counter_priority(
                        time,
                        EventKind::ProtocolEmit {
                            node: node.to_string(),
                            protocol: protocol.clone(),
                        },
                    )?;
                    self.track_protocol_event(node, &protocol, id);
                }
                Effect::DeliverPhoton { dst, time, photon } => {
                    self.timeline.schedule_counter_priority(
                        time,
                        EventKind::ReceiveQubit {
                            node: dst,
                            src: node.to_string(),
                            photon,
                        },
                    )?;
                }
                Effect::ScheduleStart { time, protocol } => {
                    let id = self.timeline.schedule(
                        time,
                        EventKind::ProtocolStart {
                            node: node.to_string(),
                            protocol: protocol.clone(),
                        },
                    )?;
                    self.track_protocol_event(node, &protocol, id);
                }
                Effect::ScheduleUpdateMemory { time, protocol } => {
                    let id = self.timeline.schedule(
                        time,
                        EventKind::ProtocolUpdateMemory {
                            node: node.to_string(),
                            protocol: protocol.clone(),
                        },
                    )?;
                    self.track_protocol_event(node, &protocol, id);
                }
                Effect::CancelScheduledEvents { protocol } => {
                    if let Some(ids) = self
                        .protocol_events
                        .remove(&(node.to_string(), protocol))
                    {
                        for id in ids {
                            self.timeline.remove_event(id);
                        }
                    }
                }
                Effect::RmUpdate {
                    protocol,
                    memory_index,
                    state,
                } => {
                    self.rm_update(node, protocol.as_deref(), memory_index, state)?;
                }
                Effect::UpdateExpireTime { memory_index, time } => {
                    self.update_expire_time(node, memory_index, time)?;
                }
                Effect::ReleaseRemoteProtocol {
                    node: remote,
                    protocol,
                } => {
                    let message = Message::to_resource_manager(MessageBody::ResourceManager(
                        ResourceManagerMessage::ReleaseProtocol { protocol },
                    ));
                    self.send_message(node, &remote, message, None)?;
                }
                Effect::ReleaseRemoteMemory {
                    node: remote,
                    memory,
                } => {
                    let message = Message::to_resource_manager(MessageBody::ResourceManager(
                        ResourceManagerMessage::ReleaseMemory { memory },
                    ));
                    self.send_message(node, &remote, message, None)?;
                }
                Effect::ScheduleQkd { time, op } => {
                    self.timeline.schedule(
                        time,
                        EventKind::Qkd {
                            node: node.to_string(),
                            op,
                        },
                    )?;
                }
                Effect::PopKey { key, layer } => {
                    self.qkd_pop(node, key, layer)?;
                }
                Effect::PushKeyRequest {
                    key_length,
                    key_count,
                } => {
                    let mut effects = Vec::new();
                    {
                        let node_ref = self
                            .nodes
                            .get_mut(node)
                            .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
                        let now = self.timeline.now();
                        if let Some(mut bb84) = node_ref.bb84.take() {
                            {
                                let mut ctx = qkd_ctx(node_ref, &mut effects, now);
                                bb84.push(key_length, key_count, &mut ctx);
                            }
                            node_ref.bb84 = Some(bb84);
                        }
                    }
                    self.apply_effects(node, effects)?;
                }
            }
        }
        Ok(())
    }

    fn track_protocol_event(&mut self, node: &str, protocol: &str, id: EventId) {
        self.protocol_events
            .entry((node.to_string(), protocol.to_string()))
            .or_default()
            .push(id);
    }

    // ========================================================================
    // Resource manager
    // ========================================================================

    /// Mirrors a memory state change into the resource manager: hardware
    /// reset/expiration bookkeeping, protocol detachment, rule rescan, and
    /// the idle-memory application callback.
    pub fn rm_update(
        &mut self,
        node: &str,
        protocol: Option<&str>,
        memory_index: usize,
        state: MemoryState,
    ) -> Result<(), NetError> {
        let now = self.timeline.now();
        let mut expire_to_schedule = None;
        let mut cancelled_event = None;

        {
            let node_ref = self
                .nodes
                .get_mut(node)
                .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
            let Some(rm) = node_ref.resource_manager.as_mut() else {
                return Ok(());
            };
            let memory = &mut node_ref.memories[memory_index];
            let info = &mut rm.memory_manager[memory_index];

            match state {
                MemoryState::Raw => {
                    cancelled_event = memory.reset(&mut self.qm);
                    info.to_raw();
                }
                MemoryState::Occupied => info.to_occupied(),
                MemoryState::Entangled | MemoryState::Purified => {
                    let (remote_node, remote_memo) = match &memory.entangled_memory {
                        Some(remote) => (remote.node.clone(), remote.memory.clone()),
                        None => (String::new(), String::new()),
                    };
                    info.to_entangled(
                        remote_node,
                        remote_memo,
                        memory.fidelity,
                        now,
                        state == MemoryState::Purified,
                    );
                    // Refresh the expiration schedule from the coherence
                    // window.
                    if let Some(old) = memory.expiration_event.take() {
                        cancelled_event = Some(old);
                    }
                    if let Some(generation_time) = memory.generation_time {
                        expire_to_schedule = memory.expire_time(generation_time);
                    }
                }
            }

            // Detach the responsible protocol everywhere.
            if let Some(name) = protocol {
                if let Some(index) = node_ref.protocol_index(name) {
                    node_ref.protocols.remove(index);
                }
                let rm = node_ref
                    .resource_manager
                    .as_mut()
                    .expect("router checked above");
                rm.pending.retain(|p| p.name() != name);
                rm.waiting.retain(|p| p.name() != name);
                rm.detach_from_rule(name);
                self.protocol_events
                    .remove(&(node.to_string(), name.to_string()));
            }
        }

        if let Some(id) = cancelled_event {
            self.timeline.remove_event(id);
        }
        if let Some(time) = expire_to_schedule {
            let id = self.timeline.schedule(
                time.max(now),
                EventKind::MemoryExpire {
                    node: node.to_string(),
                    memory_index,
                },
            )?;
            let node_ref = self.nodes.get_mut(node).expect("checked above");
            node_ref.memories[memory_index].expiration_event = Some(id);
        }

        // Rule rescan for this memory.
        let fired = {
            let node_ref = self.nodes.get(node).expect("checked above");
            let rm = node_ref
                .resource_manager
                .as_ref()
                .expect("router checked above");
            let info = &rm.memory_manager[memory_index];
            rm.rules
                .iter()
                .find_map(|rule| {
                    let matched = rule.is_valid(info, &rm.memory_manager);
                    if matched.is_empty() {
                        None
                    } else {
                        Some((rule.id, matched))
                    }
                })
        };

        match fired {
            Some((rule_id, matched)) => self.fire_rule(node, rule_id, matched)?,
            None => {
                let node_ref = self.nodes.get_mut(node).expect("checked above");
                let info = node_ref
                    .resource_manager
                    .as_ref()
                    .expect("router checked above")
                    .memory_manager[memory_index]
                    .clone();
                if let Some(app) = node_ref.app.as_mut() {
                    app.get_memory(&info, now);
                }
            }
        }
        Ok(())
    }

    /// Fires a rule: claims the matched memories, instantiates the
    /// protocol, and issues pairing requests (or parks the instance in the
    /// waiting set).
    fn fire_rule(
        &mut self,
        node: &str,
        rule_id: u64,
        matched: Vec<usize>,
    ) -> Result<(), NetError> {
        struct PairRequest {
            dst: String,
            condition: PairCondition,
        }

        let now = self.timeline.now();
        let (instance, requests, memory_names) = {
            let node_ref = self.nodes.get_mut(node).expect("router exists");
            let own_name = node_ref.name.clone();
            let rm = node_ref
                .resource_manager
                .as_mut()
                .expect("router has a resource manager");
            let rule = rm.rule(rule_id).expect("fired rule exists").clone();

            for index in &matched {
                rm.memory_manager[*index].to_occupied();
            }

            let infos: Vec<_> = matched
                .iter()
                .map(|i| rm.memory_manager[*i].clone())
                .collect();
            let names: Vec<String> = matched
                .iter()
                .map(|i| node_ref.memories[*i].name.clone())
                .collect();

            let (instance, requests) = match &rule.kind {
                RuleKind::EntanglementGeneration {
                    middle,
                    partner,
                    initiate,
                    ..
                } => {
                    let mut p = GenerationA::new(
                        format!("EGA.{}", names[0]),
                        middle.clone(),
                        partner.clone(),
                        matched[0],
                        names[0].clone(),
                    );
                    p.rule_id = Some(rule_id);
                    let requests = if *initiate {
                        vec![PairRequest {
                            dst: partner.clone(),
                            condition: PairCondition::Generation {
                                remote_node: own_name.clone(),
                                reservation: rule.reservation.clone(),
                            },
                        }]
                    } else {
                        vec![]
                    };
                    (ProtocolInstance::GenerationA(p), requests)
                }

                RuleKind::Purification { initiate, .. } => {
                    if *initiate {
                        let remote_node = infos[0]
                            .remote_node
                            .clone()
                            .expect("purification needs entangled memories");
                        let mut p = Bbpssw::new(
                            format!("EP.{}.{}", names[0], names[1]),
                            matched[0],
                            names[0].clone(),
                            Some(matched[1]),
                            Some(names[1].clone()),
                            remote_node.clone(),
                            now,
                        );
                        p.rule_id = Some(rule_id);
                        let requests = vec![PairRequest {
                            dst: remote_node,
                            condition: PairCondition::Purification {
                                kept_remote_memo: infos[0]
                                    .remote_memo
                                    .clone()
                                    .expect("entangled info has a remote memo"),
                                meas_remote_memo: infos[1]
                                    .remote_memo
                                    .clone()
                                    .expect("entangled info has a remote memo"),
                            },
                        }];
                        (ProtocolInstance::Purification(p), requests)
                    } else {
                        let remote_node = infos[0]
                            .remote_node
                            .clone()
                            .expect("purification needs entangled memories");
                        let mut p = Bbpssw::new(
                            format!("EP.{}", names[0]),
                            matched[0],
                            names[0].clone(),
                            None,
                            None,
                            remote_node,
                            now,
                        );
                        p.rule_id = Some(rule_id);
                        (ProtocolInstance::Purification(p), vec![])
                    }
                }

                RuleKind::SwappingA {
                    left,
                    success_prob,
                    degradation,
                    ..
                } => {
                    // Order the two memories so index 0 faces the left
                    // neighbor.
                    let (li, ri) = if infos[0].remote_node.as_deref() == Some(left.as_str()) {
                        (0, 1)
                    } else {
                        (1, 0)
                    };
                    let left_node = infos[li].remote_node.clone().expect("entangled");
                    let right_node = infos[ri].remote_node.clone().expect("entangled");
                    let left_memo = infos[li].remote_memo.clone().expect("entangled");
                    let right_memo = infos[ri].remote_memo.clone().expect("entangled");
                    let mut p = SwappingA::new(
                        format!("ESA.{}.{}", names[li], names[ri]),
                        matched[li],
                        matched[ri],
                        left_node.clone(),
                        left_memo.clone(),
                        right_node.clone(),
                        right_memo.clone(),
                        *success_prob,
                        *degradation,
                    );
                    p.rule_id = Some(rule_id);
                    let requests = vec![
                        PairRequest {
                            dst: left_node,
                            condition: PairCondition::SwappingB {
                                memory_name: left_memo,
                            },
                        },
                        PairRequest {
                            dst: right_node,
                            condition: PairCondition::SwappingB {
                                memory_name: right_memo,
                            },
                        },
                    ];
                    (ProtocolInstance::SwappingA(p), requests)
                }

                RuleKind::SwappingB { .. } => {
                    let mut p = SwappingB::new(
                        format!("ESB.{}", names[0]),
                        matched[0],
                        names[0].clone(),
                    );
                    p.rule_id = Some(rule_id);
                    (ProtocolInstance::SwappingB(p), vec![])
                }
            };

            rm.rule_mut(rule_id)
                .expect("fired rule exists")
                .protocols
                .push(instance.name().to_string());

            (instance, requests, names)
        };

        let own_name = node.to_string();
        let instance_name = instance.name().to_string();
        debug!(node, protocol = %instance_name, "rule fired");

        let node_ref = self.nodes.get_mut(node).expect("router exists");
        let rm = node_ref
            .resource_manager
            .as_mut()
            .expect("router has a resource manager");
        if requests.is_empty() {
            rm.waiting.push(instance);
        } else {
            rm.pending.push(instance);
            for request in requests {
                let message = Message::to_resource_manager(MessageBody::ResourceManager(
                    ResourceManagerMessage::Request {
                        ini_protocol: instance_name.clone(),
                        ini_node: own_name.clone(),
                        ini_memories: memory_names.clone(),
                        condition: request.condition,
                    },
                ));
                self.send_message(node, &request.dst, message, None)?;
            }
        }
        Ok(())
    }

    fn rm_received_message(
        &mut self,
        node: &str,
        src: &str,
        msg: ResourceManagerMessage,
    ) -> Result<(), NetError> {
        match msg {
            ResourceManagerMessage::Request {
                ini_protocol,
                ini_node,
                ini_memories,
                condition,
            } => self.rm_pair_request(node, src, ini_protocol, ini_node, ini_memories, condition),
            ResourceManagerMessage::Response {
                ini_protocol,
                is_approved,
                paired_protocol,
                paired_node,
                paired_memories,
            } => self.rm_pair_response(
                node,
                src,
                ini_protocol,
                is_approved,
                paired_protocol,
                paired_node,
                paired_memories,
            ),
            ResourceManagerMessage::ReleaseProtocol { protocol } => {
                self.with_protocol(node, &protocol, |instance, ctx| {
                    if let ProtocolInstance::SwappingB(p) = instance {
                        p.release(ctx);
                    }
                })
            }
            ResourceManagerMessage::ReleaseMemory { memory } => {
                let holder = self.nodes.get(node).and_then(|n| {
                    let index = n.memory_index_by_name(&memory)?;
                    n.protocols
                        .iter()
                        .find(|p| p.memory_indices().contains(&index))
                        .map(|p| p.name().to_string())
                });
                if let Some(name) = holder {
                    self.with_protocol(node, &name, |instance, ctx| {
                        if let ProtocolInstance::SwappingB(p) = instance {
                            p.release(ctx);
                        }
                    })?;
                }
                Ok(())
            }
        }
    }

    /// Applies a pairing matcher against the waiting protocols; pairs and
    /// starts the match, or answers a rejection.
    fn rm_pair_request(
        &mut self,
        node: &str,
        src: &str,
        ini_protocol: String,
        ini_node: String,
        ini_memories: Vec<String>,
        condition: PairCondition,
    ) -> Result<(), NetError> {
        let now = self.timeline.now();
        let paired = {
            let node_ref = self
                .nodes
                .get_mut(node)
                .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
            let Some(rm) = node_ref.resource_manager.as_mut() else {
                return Ok(());
            };

            match &condition {
                PairCondition::Generation {
                    remote_node,
                    reservation,
                } => {
                    let position = rm.waiting.iter().position(|p| match p {
                        ProtocolInstance::GenerationA(g) => {
                            g.remote_node == *remote_node
                                && g.rule_id
                                    .and_then(|rid| rm.rule(rid))
                                    .is_some_and(|rule| &rule.reservation == reservation)
                        }
                        _ => false,
                    });
                    position.map(|i| rm.take_waiting(i))
                }
                PairCondition::SwappingB { memory_name } => {
                    let position = rm.waiting.iter().position(|p| match p {
                        ProtocolInstance::SwappingB(b) => b.memory_name == *memory_name,
                        _ => false,
                    });
                    position.map(|i| rm.take_waiting(i))
                }
                PairCondition::Purification {
                    kept_remote_memo,
                    meas_remote_memo,
                } => {
                    let kept_pos = rm.waiting.iter().position(|p| match p {
                        ProtocolInstance::Purification(b) => b.kept_name == *kept_remote_memo,
                        _ => false,
                    });
                    let meas_pos = rm.waiting.iter().position(|p| match p {
                        ProtocolInstance::Purification(b) => b.kept_name == *meas_remote_memo,
                        _ => false,
                    });
                    match (kept_pos, meas_pos) {
                        (Some(kp), Some(mp)) if kp != mp => {
                            // Merge the measured twin into the kept one.
                            let (first, second) = if kp < mp { (kp, mp) } else { (mp, kp) };
                            let mut high = rm.take_waiting(second);
                            let mut low = rm.take_waiting(first);
                            let (kept, meas) = if kp < mp {
                                (&mut low, &mut high)
                            } else {
                                (&mut high, &mut low)
                            };
                            let (
                                ProtocolInstance::Purification(kept),
                                ProtocolInstance::Purification(meas),
                            ) = (kept, meas)
                            else {
                                unreachable!("positions matched purification instances");
                            };
                            let old_kept_name = kept.name.clone();
                            let meas_name = meas.name.clone();
                            kept.meas_index = Some(meas.kept_index);
                            kept.meas_name = Some(meas.kept_name.clone());
                            kept.name = format!("{}.{}", kept.name, meas.kept_name);
                            // The responder's round opens at the merge.
                            kept.t0 = now;
                            rm.detach_from_rule(&old_kept_name);
                            rm.detach_from_rule(&meas_name);
                            let merged = if kp < mp { low } else { high };
                            Some(merged)
                        }
                        _ => None,
                    }
                }
            }
        };

        match paired {
            Some(mut instance) => {
                // Register the (possibly renamed) instance under its rule.
                let instance_name = instance.name().to_string();
                set_instance_others(&mut instance, &ini_protocol, &ini_node, &ini_memories);

                let node_ref = self.nodes.get_mut(node).expect("checked above");
                let paired_memories: Vec<String> = instance
                    .memory_indices()
                    .iter()
                    .map(|i| node_ref.memories[*i].name.clone())
                    .collect();
                if let Some(rule_id) = instance.rule_id() {
                    let rm = node_ref
                        .resource_manager
                        .as_mut()
                        .expect("checked above");
                    if let Some(rule) = rm.rule_mut(rule_id) {
                        if !rule.protocols.contains(&instance_name) {
                            rule.protocols.push(instance_name.clone());
                        }
                    }
                }
                node_ref.protocols.push(instance);

                let message = Message::to_resource_manager(MessageBody::ResourceManager(
                    ResourceManagerMessage::Response {
                        ini_protocol,
                        is_approved: true,
                        paired_protocol: Some(instance_name.clone()),
                        paired_node: Some(node.to_string()),
                        paired_memories,
                    },
                ));
                self.send_message(node, src, message, None)?;
                self.start_protocol(node, &instance_name)
            }
            None => {
                let message = Message::to_resource_manager(MessageBody::ResourceManager(
                    ResourceManagerMessage::Response {
                        ini_protocol,
                        is_approved: false,
                        paired_protocol: None,
                        paired_node: None,
                        paired_memories: Vec::new(),
                    },
                ));
                self.send_message(node, src, message, None)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rm_pair_response(
        &mut self,
        node: &str,
        src: &str,
        ini_protocol: String,
        is_approved: bool,
        paired_protocol: Option<String>,
        paired_node: Option<String>,
        paired_memories: Vec<String>,
    ) -> Result<(), NetError> {
        let node_ref = self
            .nodes
            .get_mut(node)
            .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
        let Some(rm) = node_ref.resource_manager.as_mut() else {
            return Ok(());
        };

        let Some(position) = rm.pending.iter().position(|p| p.name() == ini_protocol) else {
            // Protocol already gone (expired rule, memory expiry): undo
            // the remote pairing.
            if is_approved {
                if let Some(paired) = paired_protocol {
                    let message = Message::to_resource_manager(MessageBody::ResourceManager(
                        ResourceManagerMessage::ReleaseProtocol { protocol: paired },
                    ));
                    return self.send_message(node, src, message, None);
                }
            }
            return Ok(());
        };

        if is_approved {
            let paired_protocol = paired_protocol.ok_or_else(|| {
                NetError::UnpairedProtocol(ini_protocol.clone())
            })?;
            let paired_node = paired_node.unwrap_or_else(|| src.to_string());
            set_instance_others(
                &mut rm.pending[position],
                &paired_protocol,
                &paired_node,
                &paired_memories,
            );
            if rm.pending[position].is_ready() {
                let instance = rm.pending.remove(position);
                let name = instance.name().to_string();
                node_ref.protocols.push(instance);
                return self.start_protocol(node, &name);
            }
            Ok(())
        } else {
            let instance = rm.pending.remove(position);
            rm.detach_from_rule(&ini_protocol);
            let updates: Vec<(usize, MemoryState)> = instance
                .memory_indices()
                .iter()
                .map(|index| {
                    let info = &rm.memory_manager[*index];
                    let state = if info.remote_node.is_some() {
                        MemoryState::Entangled
                    } else {
                        MemoryState::Raw
                    };
                    (*index, state)
                })
                .collect();
            for (index, state) in updates {
                self.rm_update(node, None, index, state)?;
            }
            Ok(())
        }
    }

    // ========================================================================
    // Memory expiration
    // ========================================================================

    fn memory_expire(&mut self, node: &str, memory_index: usize) -> Result<(), NetError> {
        let holders = {
            let node_ref = self
                .nodes
                .get_mut(node)
                .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
            // Decoherence map first: the entangled pointer is nulled
            // before any observer runs.
            node_ref.memories[memory_index].expire(&mut self.qm);

            let mut holders: Vec<String> = node_ref
                .protocols
                .iter()
                .filter(|p| p.memory_indices().contains(&memory_index))
                .map(|p| p.name().to_string())
                .collect();
            if let Some(rm) = node_ref.resource_manager.as_ref() {
                for p in rm.pending.iter().chain(rm.waiting.iter()) {
                    if p.memory_indices().contains(&memory_index) {
                        holders.push(p.name().to_string());
                    }
                }
            }
            holders
        };

        if holders.is_empty() {
            return self.rm_update(node, None, memory_index, MemoryState::Raw);
        }

        for name in holders {
            // Active protocols get the expiry callback; parked instances
            // are pulled out of the pending/waiting sets first.
            let parked = {
                let node_ref = self.nodes.get_mut(node).expect("checked above");
                if node_ref.protocol_index(&name).is_some() {
                    None
                } else {
                    node_ref.resource_manager.as_mut().and_then(|rm| {
                        rm.take_pending(&name).or_else(|| {
                            rm.waiting
                                .iter()
                                .position(|p| p.name() == name)
                                .map(|i| rm.take_waiting(i))
                        })
                    })
                }
            };

            match parked {
                Some(mut instance) => {
                    let mut effects = Vec::new();
                    {
                        let node_ref = self.nodes.get_mut(node).expect("checked above");
                        let now = self.timeline.now();
                        let mut ctx = ProtoCtx {
                            now,
                            node_name: &node_ref.name,
                            memories: &mut node_ref.memories,
                            qm: &mut self.qm,
                            rng: &mut node_ref.rng,
                            cchannels: &node_ref.cchannels,
                            qchannels: &mut node_ref.qchannels,
                            effects: &mut effects,
                        };
                        instance_memory_expire(&mut instance, memory_index, &mut ctx);
                    }
                    self.apply_effects(node, effects)?;
                }
                None => {
                    self.with_protocol(node, &name, |instance, ctx| {
                        instance_memory_expire(instance, memory_index, ctx);
                    })?;
                }
            }
        }
        Ok(())
    }

    fn update_expire_time(
        &mut self,
        node: &str,
        memory_index: usize,
        time: u64,
    ) -> Result<(), NetError> {
        let existing = {
            let node_ref = self
                .nodes
                .get_mut(node)
                .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
            node_ref.memories[memory_index].expiration_event.take()
        };
        if let Some(id) = existing {
            self.timeline.remove_event(id);
        }
        let id = self.timeline.schedule(
            time.max(self.timeline.now()),
            EventKind::MemoryExpire {
                node: node.to_string(),
                memory_index,
            },
        )?;
        let node_ref = self.nodes.get_mut(node).expect("checked above");
        node_ref.memories[memory_index].expiration_event = Some(id);
        Ok(())
    }

    // ========================================================================
    // Network manager
    // ========================================================================

    fn nm_received_message(
        &mut self,
        node: &str,
        _src: &str,
        msg: ReservationMessage,
    ) -> Result<(), NetError> {
        match msg {
            ReservationMessage::Request {
                reservation,
                mut qcaps,
            } => {
                let admitted = {
                    let node_ref = self
                        .nodes
                        .get_mut(node)
                        .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
                    let Some(nm) = node_ref.network_manager.as_mut() else {
                        return Ok(());
                    };
                    debug_assert!(
                        self.timeline.now() < reservation.start_time,
                        "reservation must be admitted before its window opens"
                    );
                    nm.schedule(node, &reservation)
                };

                if admitted {
                    qcaps.push(node.to_string());
                    if node == reservation.responder {
                        let path = qcaps;
                        self.install_reservation(node, &reservation, &path)?;
                        {
                            let node_ref = self.nodes.get_mut(node).expect("checked above");
                            if let Some(app) = node_ref.app.as_mut() {
                                app.get_other_reservation(&reservation);
                            }
                        }
                        let message = Message::to_network_manager(MessageBody::Reservation(
                            ReservationMessage::Approve {
                                reservation: reservation.clone(),
                                path,
                            },
                        ));
                        self.forward_toward(node, &reservation.initiator.clone(), message)
                    } else {
                        let message = Message::to_network_manager(MessageBody::Reservation(
                            ReservationMessage::Request {
                                reservation: reservation.clone(),
                                qcaps,
                            },
                        ));
                        self.forward_toward(node, &reservation.responder.clone(), message)
                    }
                } else {
                    info!(node, "reservation rejected for capacity");
                    let message = Message::to_network_manager(MessageBody::Reservation(
                        ReservationMessage::Reject {
                            reservation: reservation.clone(),
                        },
                    ));
                    self.forward_toward(node, &reservation.initiator.clone(), message)
                }
            }

            ReservationMessage::Reject { reservation } => {
                {
                    let node_ref = self
                        .nodes
                        .get_mut(node)
                        .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
                    if let Some(nm) = node_ref.network_manager.as_mut() {
                        nm.unschedule(&reservation.id);
                    }
                }
                if node == reservation.initiator {
                    let node_ref = self.nodes.get_mut(node).expect("checked above");
                    if let Some(app) = node_ref.app.as_mut() {
                        app.get_reserve_res(&reservation, false);
                    }
                    Ok(())
                } else {
                    let message = Message::to_network_manager(MessageBody::Reservation(
                        ReservationMessage::Reject {
                            reservation: reservation.clone(),
                        },
                    ));
                    self.forward_toward(node, &reservation.initiator.clone(), message)
                }
            }

            ReservationMessage::Approve { reservation, path } => {
                self.install_reservation(node, &reservation, &path)?;
                if node == reservation.initiator {
                    let node_ref = self.nodes.get_mut(node).expect("checked above");
                    if let Some(app) = node_ref.app.as_mut() {
                        app.get_reserve_res(&reservation, true);
                    }
                    Ok(())
                } else {
                    let message = Message::to_network_manager(MessageBody::Reservation(
                        ReservationMessage::Approve {
                            reservation: reservation.clone(),
                            path,
                        },
                    ));
                    self.forward_toward(node, &reservation.initiator.clone(), message)
                }
            }
        }
    }

    /// Synthesizes and schedules a node's rules for an approved
    /// reservation.
    fn install_reservation(
        &mut self,
        node: &str,
        reservation: &Reservation,
        path: &[String],
    ) -> Result<(), NetError> {
        {
            let node_ref = self
                .nodes
                .get_mut(node)
                .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
            let map_to_middle = node_ref.map_to_middle_node.clone();
            let Some(nm) = node_ref.network_manager.as_mut() else {
                return Ok(());
            };
            let rules = nm.create_rules(node, path, reservation, &map_to_middle);
            nm.accepted_reservations.push(reservation.clone());
            nm.pending_rules.insert(reservation.id.clone(), rules);
        }

        // Reserved memories reset first (priority 1), rules load last
        // (default priority) at the window start; expiry leads the window
        // end (priority 0).
        self.timeline.schedule_priority(
            reservation.start_time,
            1,
            EventKind::ReleaseReservedMemories {
                node: node.to_string(),
                reservation: reservation.id.clone(),
            },
        )?;
        self.timeline.schedule(
            reservation.start_time,
            EventKind::LoadRules {
                node: node.to_string(),
                reservation: reservation.id.clone(),
            },
        )?;
        self.timeline.schedule_priority(
            reservation.end_time,
            0,
            EventKind::ExpireRules {
                node: node.to_string(),
                reservation: reservation.id.clone(),
            },
        )?;
        Ok(())
    }

    fn load_rules(&mut self, node: &str, reservation: &ReservationId) -> Result<(), NetError> {
        let rule_ids = {
            let node_ref = self
                .nodes
                .get_mut(node)
                .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
            let Some(nm) = node_ref.network_manager.as_mut() else {
                return Ok(());
            };
            let Some(rules) = nm.pending_rules.remove(reservation) else {
                return Ok(());
            };
            let rm = node_ref
                .resource_manager
                .as_mut()
                .expect("router has a resource manager");
            rules
                .into_iter()
                .map(|(priority, kind)| rm.load_rule(priority, reservation.clone(), kind))
                .collect::<Vec<_>>()
        };
        info!(node, rules = rule_ids.len(), "rules loaded");

        // Initial scan: fire on every already-eligible memory.
        for rule_id in rule_ids {
            loop {
                let fired = {
                    let node_ref = self.nodes.get(node).expect("checked above");
                    let rm = node_ref
                        .resource_manager
                        .as_ref()
                        .expect("checked above");
                    let Some(rule) = rm.rule(rule_id) else {
                        break;
                    };
                    rm.memory_manager.iter().find_map(|info| {
                        let matched = rule.is_valid(info, &rm.memory_manager);
                        if matched.is_empty() {
                            None
                        } else {
                            Some(matched)
                        }
                    })
                };
                match fired {
                    Some(matched) => self.fire_rule(node, rule_id, matched)?,
                    None => break,
                }
            }
        }
        Ok(())
    }

    fn expire_rules(&mut self, node: &str, reservation: &ReservationId) -> Result<(), NetError> {
        let expired_protocols = {
            let node_ref = self
                .nodes
                .get_mut(node)
                .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
            let Some(rm) = node_ref.resource_manager.as_mut() else {
                return Ok(());
            };
            let expired = rm.expire_rules_by_reservation(reservation);
            let names: Vec<String> = expired
                .iter()
                .flat_map(|rule| rule.protocols.iter().cloned())
                .collect();
            if let Some(nm) = node_ref.network_manager.as_mut() {
                nm.unschedule(reservation);
            }
            names
        };
        info!(node, protocols = expired_protocols.len(), "rules expired");

        for name in expired_protocols {
            let indices = {
                let node_ref = self.nodes.get_mut(node).expect("checked above");
                let taken = node_ref
                    .protocol_index(&name)
                    .map(|i| node_ref.protocols.remove(i))
                    .or_else(|| {
                        node_ref.resource_manager.as_mut().and_then(|rm| {
                            rm.take_pending(&name).or_else(|| {
                                rm.waiting
                                    .iter()
                                    .position(|p| p.name() == name)
                                    .map(|i| rm.take_waiting(i))
                            })
                        })
                    });
                taken.map(|p| p.memory_indices()).unwrap_or_default()
            };
            for index in indices {
                self.rm_update(node, None, index, MemoryState::Raw)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Distributed routing
    // ========================================================================

    fn link_state_received(
        &mut self,
        node: &str,
        src: &str,
        origin: String,
        neighbors: Vec<(String, f64)>,
        seq: u64,
    ) -> Result<(), NetError> {
        let (flood_targets, updated) = {
            let node_ref = self
                .nodes
                .get_mut(node)
                .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
            let Some(nm) = node_ref.network_manager.as_mut() else {
                return Ok(());
            };
            let RoutingProtocol::Distributed { lsdb, .. } = &mut nm.routing else {
                return Ok(());
            };

            let fresh = match lsdb.get(&origin) {
                Some((existing_seq, _)) => seq > *existing_seq,
                None => true,
            };
            if !fresh {
                (Vec::new(), false)
            } else {
                lsdb.insert(origin.clone(), (seq, neighbors.clone()));
                let links: BTreeMap<String, Vec<(String, f64)>> = lsdb
                    .iter()
                    .map(|(n, (_, adj))| (n.clone(), adj.clone()))
                    .collect();
                nm.forwarding_table = compute_forwarding(node, &links);
                let mut targets: Vec<String> = node_ref
                    .cchannels
                    .keys()
                    .filter(|peer| peer.as_str() != src)
                    .cloned()
                    .collect();
                targets.sort();
                (targets, true)
            }
        };

        if updated {
            for peer in flood_targets {
                let message = Message::to_network_manager(MessageBody::LinkState {
                    origin: origin.clone(),
                    neighbors: neighbors.clone(),
                    seq,
                });
                self.send_message(node, &peer, message, None)?;
            }
        }
        Ok(())
    }

    fn forward_toward(
        &mut self,
        node: &str,
        dst: &str,
        message: Message,
    ) -> Result<(), NetError> {
        let next_hop = {
            let node_ref = self
                .nodes
                .get(node)
                .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
            let nm = node_ref
                .network_manager
                .as_ref()
                .expect("forwarding happens at routers");
            nm.forwarding_table
                .get(dst)
                .cloned()
                .ok_or_else(|| NetError::MissingRoute {
                    node: node.to_string(),
                    dst: dst.to_string(),
                })?
        };
        self.send_message(node, &next_hop, message, None)
    }

    // ========================================================================
    // QKD stack
    // ========================================================================

    fn qkd_op(&mut self, node: &str, op: &QkdOp) -> Result<(), NetError> {
        let mut effects = Vec::new();
        {
            let node_ref = self
                .nodes
                .get_mut(node)
                .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
            let now = self.timeline.now();
            let Some(mut bb84) = node_ref.bb84.take() else {
                warn!(node, "QKD operation on a node without a BB84 stack");
                return Ok(());
            };
            {
                let mut ctx = qkd_ctx(node_ref, &mut effects, now);
                match op {
                    QkdOp::StartProtocol => bb84.start_protocol(&mut ctx),
                    QkdOp::BeginPhotonPulse => bb84.begin_photon_pulse(&mut ctx),
                    QkdOp::EndPhotonPulse => bb84.end_photon_pulse(&mut ctx),
                }
            }
            node_ref.bb84 = Some(bb84);
        }
        self.apply_effects(node, effects)
    }

    fn qkd_pop(&mut self, node: &str, key: Vec<u8>, layer: usize) -> Result<(), NetError> {
        let mut effects = Vec::new();
        {
            let node_ref = self
                .nodes
                .get_mut(node)
                .ok_or_else(|| NetError::UnknownNode(node.to_string()))?;
            let now = self.timeline.now();
            if layer == 0 && node_ref.cascade.is_some() {
                let mut cascade = node_ref.cascade.take().expect("checked above");
                {
                    let mut ctx = qkd_ctx(node_ref, &mut effects, now);
                    cascade.pop(key, &mut ctx);
                }
                node_ref.cascade = Some(cascade);
            } else if let Some(app) = node_ref.app.as_mut() {
                app.pop_key(key, now);
            }
        }
        self.apply_effects(node, effects)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Borrow-splitting constructor for the QKD context.
fn qkd_ctx<'a>(
    node: &'a mut Node,
    effects: &'a mut Vec<Effect>,
    now: u64,
) -> QkdCtx<'a> {
    let Node {
        name,
        light_source,
        detector_bank,
        rng,
        cchannels,
        qchannels,
        ..
    } = node;
    QkdCtx {
        now,
        node_name: name,
        light_source: light_source.as_ref().expect("QKD node has a light source"),
        detector_bank: detector_bank
            .as_mut()
            .expect("QKD node has a detector bank"),
        rng,
        cchannels,
        qchannels,
        effects,
    }
}

fn set_instance_others(
    instance: &mut ProtocolInstance,
    protocol: &str,
    node: &str,
    memories: &[String],
) {
    match instance {
        ProtocolInstance::GenerationA(p) => {
            p.set_others(protocol.to_string(), node.to_string(), memories.to_vec());
        }
        ProtocolInstance::Purification(p) => p.set_others(protocol.to_string()),
        ProtocolInstance::SwappingA(p) => {
            p.set_others(protocol.to_string(), node.to_string());
        }
        ProtocolInstance::SwappingB(p) => {
            p.set_others(protocol.to_string(), node.to_string());
        }
        ProtocolInstance::GenerationB(_) => {}
    }
}

fn instance_memory_expire(
    instance: &mut ProtocolInstance,
    memory_index: usize,
    ctx: &mut ProtoCtx<'_>,
) {
    match instance {
        ProtocolInstance::GenerationA(p) => p.memory_expire(memory_index, ctx),
        ProtocolInstance::Purification(p) => p.memory_expire(memory_index, ctx),
        ProtocolInstance::SwappingA(p) => p.memory_expire(memory_index, ctx),
        ProtocolInstance::SwappingB(p) => p.memory_expire(memory_index, ctx),
        ProtocolInstance::GenerationB(_) => {}
    }
}

