//! Resource management: memory bookkeeping and the rule engine.
//!
//! The memory manager is the single source of truth for rule conditions:
//! every hardware-level state change is mirrored here through the engine's
//! `rm_update` path. Rules are plain value types — a priority, a typed
//! argument record, and the reservation that owns them — interpreted by a
//! kind switch; conditions never capture closures, so the whole rule
//! engine is auditable and serializable.

use crate::generation::GenerationA;
use crate::network::ReservationId;
use crate::purification::Bbpssw;
use crate::swapping::{SwappingA, SwappingB};

// ============================================================================
// Memory Info
// ============================================================================

/// Logical state of a memory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryState {
    /// Free and unentangled.
    Raw,
    /// Claimed by a protocol.
    Occupied,
    /// Successfully entangled.
    Entangled,
    /// Entangled and successfully distilled.
    Purified,
}

impl MemoryState {
    /// Entangled in the broad sense (rule conditions treat a purified
    /// memory as entangled).
    pub fn is_entangled(self) -> bool {
        matches!(self, MemoryState::Entangled | MemoryState::Purified)
    }
}

/// The resource manager's shadow of one physical memory slot.
#[derive(Debug, Clone)]
pub struct MemoryInfo {
    /// Slot index in the node's memory array.
    pub index: usize,
    /// Current bookkeeping state.
    pub state: MemoryState,
    /// Remote node of the entangled pair, if any.
    pub remote_node: Option<String>,
    /// Remote memory name of the entangled pair, if any.
    pub remote_memo: Option<String>,
    /// Entanglement fidelity (0 when unentangled).
    pub fidelity: f64,
    /// Time the current entanglement was achieved.
    pub entangle_time: Option<u64>,
}

impl MemoryInfo {
    /// Fresh RAW info for a slot.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            state: MemoryState::Raw,
            remote_node: None,
            remote_memo: None,
            fidelity: 0.0,
            entangle_time: None,
        }
    }

    /// Clears the slot back to RAW.
    pub fn to_raw(&mut self) {
        self.state = MemoryState::Raw;
        self.remote_node = None;
        self.remote_memo = None;
        self.fidelity = 0.0;
        self.entangle_time = None;
    }

    /// Marks the slot claimed by a protocol.
    pub fn to_occupied(&mut self) {
        debug_assert_ne!(self.state, MemoryState::Occupied, "double occupation");
        self.state = MemoryState::Occupied;
    }

    /// Mirrors a successful entanglement from the hardware memory.
    pub fn to_entangled(
        &mut self,
        remote_node: String,
        remote_memo: String,
        fidelity: f64,
        now: u64,
        purified: bool,
    ) {
        self.state = if purified {
            MemoryState::Purified
        } else {
            MemoryState::Entangled
        };
        self.remote_node = Some(remote_node);
        self.remote_memo = Some(remote_memo);
        self.fidelity = fidelity;
        self.entangle_time = Some(now);
    }
}

// ============================================================================
// Pairing Conditions
// ============================================================================

/// Matcher carried by a pairing request, applied by the remote resource
/// manager against its waiting protocols.
#[derive(Debug, Clone)]
pub enum PairCondition {
    /// Match a waiting generation protocol whose partner is the requester
    /// and whose rule belongs to the same reservation.
    Generation {
        /// Requesting node name.
        remote_node: String,
        /// Owning reservation.
        reservation: ReservationId,
    },
    /// Match (and merge) the two waiting purification protocols holding
    /// the twin memories of the requester's pairs.
    Purification {
        /// Remote memory mirroring the requester's kept memory.
        kept_remote_memo: String,
        /// Remote memory mirroring the requester's measured memory.
        meas_remote_memo: String,
    },
    /// Match the waiting swapping-B protocol holding a specific memory.
    SwappingB {
        /// Name of the held memory.
        memory_name: String,
    },
}

/// Resource-manager pairing and release messages.
#[derive(Debug, Clone)]
pub enum ResourceManagerMessage {
    /// Ask the remote resource manager for an eligible protocol to pair.
    Request {
        /// Requesting protocol name.
        ini_protocol: String,
        /// Requesting node name.
        ini_node: String,
        /// Names of the memories held by the requesting protocol.
        ini_memories: Vec<String>,
        /// Eligibility matcher.
        condition: PairCondition,
    },
    /// Approve or reject a pairing request.
    Response {
        /// The requesting protocol this answers.
        ini_protocol: String,
        /// Whether a protocol was paired.
        is_approved: bool,
        /// Paired protocol name (on approval).
        paired_protocol: Option<String>,
        /// Node hosting the paired protocol.
        paired_node: Option<String>,
        /// Memories held by the paired protocol.
        paired_memories: Vec<String>,
    },
    /// Release a protocol paired with a now-invalid local protocol.
    ReleaseProtocol {
        /// Remote protocol name.
        protocol: String,
    },
    /// Release the protocol occupying a named memory.
    ReleaseMemory {
        /// Memory name.
        memory: String,
    },
}

// ============================================================================
// Rules
// ============================================================================

/// Typed rule argument records, one per rule kind.
#[derive(Debug, Clone)]
pub enum RuleKind {
    /// Create generation protocols for RAW memories.
    EntanglementGeneration {
        /// BSM node between this router and the partner.
        middle: String,
        /// Partner router.
        partner: String,
        /// Memory slots this rule may claim.
        indices: Vec<usize>,
        /// True on the side that sends the pairing request (toward the
        /// next node in the path); the other side waits.
        initiate: bool,
    },
    /// Distill pairs below the target fidelity.
    Purification {
        /// Memory slots this rule may claim.
        indices: Vec<usize>,
        /// Reservation target fidelity.
        target_fidelity: f64,
        /// True on the side that consumes two pairs and requests pairing.
        initiate: bool,
    },
    /// Swap two adjacent pairs at an interior router.
    SwappingA {
        /// Memory slots this rule may claim.
        indices: Vec<usize>,
        /// Reservation target fidelity.
        target_fidelity: f64,
        /// Left adjacent router in the swapping hierarchy.
        left: String,
        /// Right adjacent router in the swapping hierarchy.
        right: String,
        /// BSM success probability.
        success_prob: f64,
        /// Fidelity degradation factor.
        degradation: f64,
    },
    /// Hold an end of a swap and await the result.
    SwappingB {
        /// Memory slots this rule may claim.
        indices: Vec<usize>,
        /// Reservation target fidelity.
        target_fidelity: f64,
        /// Remote nodes this rule must NOT match (the far host for path
        /// ends; the two adjacent routers for interior nodes).
        forbidden: Vec<String>,
    },
}

/// A rule installed in a node's rule engine.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Rule id, unique per node.
    pub id: u64,
    /// Priority; lower scans first.
    pub priority: u64,
    /// Reservation whose lifetime bounds this rule.
    pub reservation: ReservationId,
    /// Typed condition/action record.
    pub kind: RuleKind,
    /// Names of protocols created by this rule and still alive.
    pub protocols: Vec<String>,
}

impl Rule {
    /// Evaluates the rule condition against a candidate memory info.
    ///
    /// Returns the slot indices the action would consume (empty when the
    /// condition does not hold).
    pub fn is_valid(&self, info: &MemoryInfo, manager: &[MemoryInfo]) -> Vec<usize> {
        match &self.kind {
            RuleKind::EntanglementGeneration { indices, .. } => {
                if info.state == MemoryState::Raw && indices.contains(&info.index) {
                    vec![info.index]
                } else {
                    vec![]
                }
            }

            RuleKind::Purification {
                indices,
                target_fidelity,
                initiate,
            } => {
                if !indices.contains(&info.index)
                    || !info.state.is_entangled()
                    || info.fidelity >= *target_fidelity
                {
                    return vec![];
                }
                if !initiate {
                    return vec![info.index];
                }
                // Initiating side: find a second pair with the same remote
                // node at the same fidelity.
                for other in manager {
                    if other.index != info.index
                        && indices.contains(&other.index)
                        && other.state.is_entangled()
                        && other.remote_node == info.remote_node
                        && (other.fidelity - info.fidelity).abs() < 1e-9
                    {
                        debug_assert_ne!(other.remote_memo, info.remote_memo);
                        return vec![info.index, other.index];
                    }
                }
                vec![]
            }

            RuleKind::SwappingA {
                indices,
                target_fidelity,
                left,
                right,
                ..
            } => {
                if !swap_candidate(info, indices, *target_fidelity) {
                    return vec![];
                }
                let adjacents = [left.as_str(), right.as_str()];
                for (j, adjacent) in adjacents.iter().enumerate() {
                    if info.remote_node.as_deref() == Some(*adjacent) {
                        let opposite = adjacents[(j + 1) % 2];
                        for other in manager {
                            if other.index != info.index
                                && swap_candidate(other, indices, *target_fidelity)
                                && other.remote_node.as_deref() == Some(opposite)
                            {
                                return vec![info.index, other.index];
                            }
                        }
                    }
                }
                vec![]
            }

            RuleKind::SwappingB {
                indices,
                target_fidelity,
                forbidden,
            } => {
                if swap_candidate(info, indices, *target_fidelity)
                    && info
                        .remote_node
                        .as_deref()
                        .is_some_and(|remote| !forbidden.iter().any(|f| f.as_str() == remote))
                {
                    vec![info.index]
                } else {
                    vec![]
                }
            }
        }
    }
}

fn swap_candidate(info: &MemoryInfo, indices: &[usize], target_fidelity: f64) -> bool {
    info.state.is_entangled()
        && indices.contains(&info.index)
        && info.fidelity >= target_fidelity
}

// ============================================================================
// Protocol Instances
// ============================================================================

/// Tagged protocol instance stored on a node or in the resource manager's
/// pending/waiting sets.
#[derive(Debug, Clone)]
pub enum ProtocolInstance {
    /// Generation end role.
    GenerationA(GenerationA),
    /// Generation middle relay.
    GenerationB(crate::generation::GenerationB),
    /// BBPSSW purification.
    Purification(Bbpssw),
    /// Swapping intermediate role.
    SwappingA(SwappingA),
    /// Swapping end role.
    SwappingB(SwappingB),
}

impl ProtocolInstance {
    /// Instance name.
    pub fn name(&self) -> &str {
        match self {
            ProtocolInstance::GenerationA(p) => &p.name,
            ProtocolInstance::GenerationB(p) => &p.name,
            ProtocolInstance::Purification(p) => &p.name,
            ProtocolInstance::SwappingA(p) => &p.name,
            ProtocolInstance::SwappingB(p) => &p.name,
        }
    }

    /// Rule that created the instance, if any.
    pub fn rule_id(&self) -> Option<u64> {
        match self {
            ProtocolInstance::GenerationA(p) => p.rule_id,
            ProtocolInstance::GenerationB(_) => None,
            ProtocolInstance::Purification(p) => p.rule_id,
            ProtocolInstance::SwappingA(p) => p.rule_id,
            ProtocolInstance::SwappingB(p) => p.rule_id,
        }
    }

    /// Sets the owning rule.
    pub fn set_rule(&mut self, rule_id: u64) {
        match self {
            ProtocolInstance::GenerationA(p) => p.rule_id = Some(rule_id),
            ProtocolInstance::GenerationB(_) => {}
            ProtocolInstance::Purification(p) => p.rule_id = Some(rule_id),
            ProtocolInstance::SwappingA(p) => p.rule_id = Some(rule_id),
            ProtocolInstance::SwappingB(p) => p.rule_id = Some(rule_id),
        }
    }

    /// Memory slots held by the instance.
    pub fn memory_indices(&self) -> Vec<usize> {
        match self {
            ProtocolInstance::GenerationA(p) => vec![p.memory_index],
            ProtocolInstance::GenerationB(_) => vec![],
            ProtocolInstance::Purification(p) => p.memory_indices(),
            ProtocolInstance::SwappingA(p) => vec![p.left_index, p.right_index],
            ProtocolInstance::SwappingB(p) => vec![p.memory_index],
        }
    }

    /// True once the instance is fully paired and may start.
    pub fn is_ready(&self) -> bool {
        match self {
            ProtocolInstance::GenerationA(p) => p.is_ready(),
            ProtocolInstance::GenerationB(_) => true,
            ProtocolInstance::Purification(p) => p.is_ready(),
            ProtocolInstance::SwappingA(p) => p.is_ready(),
            ProtocolInstance::SwappingB(p) => p.is_ready(),
        }
    }
}

// ============================================================================
// Resource Manager
// ============================================================================

/// Per-node resource manager: memory manager plus rule engine.
#[derive(Debug, Default)]
pub struct ResourceManager {
    /// One info per physical memory slot.
    pub memory_manager: Vec<MemoryInfo>,
    /// Installed rules, sorted by priority.
    pub rules: Vec<Rule>,
    /// Protocols awaiting a pairing response from a remote node.
    pub pending: Vec<ProtocolInstance>,
    /// Protocols awaiting a pairing request from a remote node.
    pub waiting: Vec<ProtocolInstance>,
    next_rule_id: u64,
}

impl ResourceManager {
    /// Creates a manager tracking `memory_count` slots.
    pub fn new(memory_count: usize) -> Self {
        Self {
            memory_manager: (0..memory_count).map(MemoryInfo::new).collect(),
            rules: Vec::new(),
            pending: Vec::new(),
            waiting: Vec::new(),
            next_rule_id: 0,
        }
    }

    /// Installs a rule, keeping the rule list sorted by priority.
    /// Returns the assigned rule id.
    pub fn load_rule(&mut self, priority: u64, reservation: ReservationId, kind: RuleKind) -> u64 {
        let id = self.next_rule_id;
        self.next_rule_id += 1;
        let rule = Rule {
            id,
            priority,
            reservation,
            kind,
            protocols: Vec::new(),
        };
        let pos = self
            .rules
            .partition_point(|existing| existing.priority <= priority);
        self.rules.insert(pos, rule);
        id
    }

    /// Removes every rule owned by a reservation and returns them (with
    /// the names of protocols they created, for termination).
    pub fn expire_rules_by_reservation(&mut self, reservation: &ReservationId) -> Vec<Rule> {
        let mut expired = Vec::new();
        self.rules.retain_mut(|rule| {
            if &rule.reservation == reservation {
                expired.push(rule.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Looks up a rule by id.
    pub fn rule(&self, id: u64) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Mutable rule lookup.
    pub fn rule_mut(&mut self, id: u64) -> Option<&mut Rule> {
        self.rules.iter_mut().find(|r| r.id == id)
    }

    /// Drops a protocol name from whichever rule owns it.
    pub fn detach_from_rule(&mut self, protocol: &str) {
        for rule in &mut self.rules {
            rule.protocols.retain(|p| p != protocol);
        }
    }

    /// Removes and returns a waiting protocol by index.
    pub fn take_waiting(&mut self, index: usize) -> ProtocolInstance {
        self.waiting.remove(index)
    }

    /// Removes and returns a pending protocol by name.
    pub fn take_pending(&mut self, name: &str) -> Option<ProtocolInstance> {
        let index = self.pending.iter().position(|p| p.name() == name)?;
        Some(self.pending.remove(index))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn entangled_info(index: usize, remote: &str, memo: &str, fidelity: f64) -> MemoryInfo {
        let mut info = MemoryInfo::new(index);
        info.to_entangled(remote.into(), memo.into(), fidelity, 1_000, false);
        info
    }

    fn reservation() -> ReservationId {
        ReservationId {
            node: "r1".into(),
            seq: 0,
        }
    }

    #[test]
    fn raw_transition_clears_bookkeeping() {
        let mut info = entangled_info(0, "r2", "r2.memo[0]", 0.9);
        info.to_raw();
        assert_eq!(info.state, MemoryState::Raw);
        assert!(info.remote_node.is_none());
        assert_eq!(info.fidelity, 0.0);
    }

    #[test]
    fn eg_rule_matches_raw_in_scope() {
        let rule = Rule {
            id: 0,
            priority: 10,
            reservation: reservation(),
            kind: RuleKind::EntanglementGeneration {
                middle: "m".into(),
                partner: "r2".into(),
                indices: vec![0, 1],
                initiate: true,
            },
            protocols: vec![],
        };
        let manager = vec![MemoryInfo::new(0), MemoryInfo::new(1), MemoryInfo::new(2)];

        assert_eq!(rule.is_valid(&manager[0], &manager), vec![0]);
        assert!(rule.is_valid(&manager[2], &manager).is_empty());

        let mut occupied = MemoryInfo::new(0);
        occupied.to_occupied();
        assert!(rule.is_valid(&occupied, &manager).is_empty());
    }

    #[test]
    fn ep_rule_needs_matching_twin() {
        let rule = Rule {
            id: 0,
            priority: 10,
            reservation: reservation(),
            kind: RuleKind::Purification {
                indices: vec![0, 1, 2],
                target_fidelity: 0.95,
                initiate: true,
            },
            protocols: vec![],
        };
        let manager = vec![
            entangled_info(0, "r2", "r2.memo[0]", 0.85),
            entangled_info(1, "r2", "r2.memo[1]", 0.85),
            entangled_info(2, "r3", "r3.memo[0]", 0.85),
        ];

        assert_eq!(rule.is_valid(&manager[0], &manager), vec![0, 1]);
        // No twin toward r3.
        assert!(rule.is_valid(&manager[2], &manager).is_empty());
    }

    #[test]
    fn ep_rule_ignores_memories_at_target() {
        let rule = Rule {
            id: 0,
            priority: 10,
            reservation: reservation(),
            kind: RuleKind::Purification {
                indices: vec![0, 1],
                target_fidelity: 0.9,
                initiate: true,
            },
            protocols: vec![],
        };
        let manager = vec![
            entangled_info(0, "r2", "r2.memo[0]", 0.92),
            entangled_info(1, "r2", "r2.memo[1]", 0.92),
        ];
        assert!(rule.is_valid(&manager[0], &manager).is_empty());
    }

    #[test]
    fn es_a_rule_pairs_opposite_sides() {
        let rule = Rule {
            id: 0,
            priority: 10,
            reservation: reservation(),
            kind: RuleKind::SwappingA {
                indices: vec![0, 1],
                target_fidelity: 0.8,
                left: "r1".into(),
                right: "r3".into(),
                success_prob: 1.0,
                degradation: 0.95,
            },
            protocols: vec![],
        };
        let manager = vec![
            entangled_info(0, "r1", "r1.memo[0]", 0.85),
            entangled_info(1, "r3", "r3.memo[0]", 0.85),
        ];
        assert_eq!(rule.is_valid(&manager[0], &manager), vec![0, 1]);
        assert_eq!(rule.is_valid(&manager[1], &manager), vec![1, 0]);
    }

    #[test]
    fn es_b_rule_excludes_forbidden_remotes() {
        let rule = Rule {
            id: 0,
            priority: 10,
            reservation: reservation(),
            kind: RuleKind::SwappingB {
                indices: vec![0],
                target_fidelity: 0.8,
                forbidden: vec!["r3".into()],
            },
            protocols: vec![],
        };
        let toward_r2 = vec![entangled_info(0, "r2", "r2.memo[0]", 0.85)];
        let toward_r3 = vec![entangled_info(0, "r3", "r3.memo[0]", 0.85)];

        assert_eq!(rule.is_valid(&toward_r2[0], &toward_r2), vec![0]);
        assert!(rule.is_valid(&toward_r3[0], &toward_r3).is_empty());
    }

    #[test]
    fn rules_stay_sorted_by_priority() {
        let mut rm = ResourceManager::new(4);
        rm.load_rule(
            20,
            reservation(),
            RuleKind::SwappingB {
                indices: vec![],
                target_fidelity: 0.9,
                forbidden: vec![],
            },
        );
        rm.load_rule(
            10,
            reservation(),
            RuleKind::SwappingB {
                indices: vec![],
                target_fidelity: 0.9,
                forbidden: vec![],
            },
        );
        assert!(rm.rules[0].priority <= rm.rules[1].priority);
    }

    #[test]
    fn expire_rules_by_reservation_removes_only_matching() {
        let mut rm = ResourceManager::new(4);
        let res_a = ReservationId {
            node: "r1".into(),
            seq: 0,
        };
        let res_b = ReservationId {
            node: "r1".into(),
            seq: 1,
        };
        rm.load_rule(
            10,
            res_a.clone(),
            RuleKind::SwappingB {
                indices: vec![],
                target_fidelity: 0.9,
                forbidden: vec![],
            },
        );
        rm.load_rule(
            10,
            res_b.clone(),
            RuleKind::SwappingB {
                indices: vec![],
                target_fidelity: 0.9,
                forbidden: vec![],
            },
        );

        let expired = rm.expire_rules_by_reservation(&res_a);
        assert_eq!(expired.len(), 1);
        assert_eq!(rm.rules.len(), 1);
        assert_eq!(rm.rules[0].reservation, res_b);
    }
}
