//! Network management: reservation, routing, and forwarding.
//!
//! Two layers with a strict split:
//!
//! - **Routing (control plane)** writes the forwarding table — either the
//!   static topology-derived variant (tables computed at build time) or
//!   the distributed variant (link-state advertisements flooded at init,
//!   tables recomputed on change).
//! - **Forwarding (data plane)** reads the table to relay reservation
//!   messages hop by hop.
//!
//! The reservation protocol admits requests against per-memory timecards
//! (interval-disjoint schedules), forwards along the path, and on success
//! synthesizes the generation/purification/swapping rules each hop needs
//! from its position in the path.

use std::collections::{BTreeMap, HashMap};

use crate::resource::RuleKind;

// ============================================================================
// Reservation
// ============================================================================

/// Globally unique reservation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationId {
    /// Initiating node name.
    pub node: String,
    /// Per-initiator sequence number.
    pub seq: u64,
}

/// A path-scoped allocation of memory capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    /// Unique id.
    pub id: ReservationId,
    /// Node that created the request.
    pub initiator: String,
    /// Node entanglement is requested with.
    pub responder: String,
    /// Simulation time at which entanglement should start (ps).
    pub start_time: u64,
    /// Simulation time at which resources are released (ps).
    pub end_time: u64,
    /// Number of entangled memory pairs requested.
    pub memory_size: usize,
    /// Desired end-to-end fidelity.
    pub fidelity: f64,
}

impl Reservation {
    /// Creates a reservation, validating the time window and size.
    pub fn new(
        id: ReservationId,
        initiator: String,
        responder: String,
        start_time: u64,
        end_time: u64,
        memory_size: usize,
        fidelity: f64,
    ) -> Self {
        assert!(start_time < end_time, "reservation window must be nonempty");
        assert!(memory_size > 0, "reservation must hold at least one memory");
        Self {
            id,
            initiator,
            responder,
            start_time,
            end_time,
            memory_size,
            fidelity,
        }
    }
}

/// Messages of the resource reservation protocol.
#[derive(Debug, Clone)]
pub enum ReservationMessage {
    /// Forwarded initiator → responder, accumulating the path.
    Request {
        /// The reservation being negotiated.
        reservation: Reservation,
        /// Names of nodes traversed so far (in order).
        qcaps: Vec<String>,
    },
    /// Propagated back toward the initiator, unwinding local reservations.
    Reject {
        /// The rejected reservation.
        reservation: Reservation,
    },
    /// Propagated back toward the initiator after the responder accepted.
    Approve {
        /// The approved reservation.
        reservation: Reservation,
        /// The full path (initiator first).
        path: Vec<String>,
    },
}

// ============================================================================
// Memory Timecards
// ============================================================================

/// Reservation schedule for one memory slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryTimeCard {
    /// Slot index in the node's memory array.
    pub memory_index: usize,
    /// Reservations sorted by time, pairwise disjoint.
    pub reservations: Vec<Reservation>,
}

impl MemoryTimeCard {
    /// Creates an empty card for a slot.
    pub fn new(memory_index: usize) -> Self {
        Self {
            memory_index,
            reservations: Vec::new(),
        }
    }

    /// Tries to insert a reservation; false when its window overlaps an
    /// existing one.
    pub fn add(&mut self, reservation: &Reservation) -> bool {
        match self.schedule_position(reservation) {
            Some(pos) => {
                self.reservations.insert(pos, reservation.clone());
                true
            }
            None => false,
        }
    }

    /// Removes a reservation by id; false when it was not present.
    pub fn remove(&mut self, id: &ReservationId) -> bool {
        match self.reservations.iter().position(|r| &r.id == id) {
            Some(pos) => {
                self.reservations.remove(pos);
                true
            }
            None => false,
        }
    }

    /// True when the card currently holds the reservation.
    pub fn holds(&self, id: &ReservationId) -> bool {
        self.reservations.iter().any(|r| &r.id == id)
    }

    /// Binary search for the insertion position; `None` on overlap.
    fn schedule_position(&self, reservation: &Reservation) -> Option<usize> {
        let (mut start, mut end) = (0isize, self.reservations.len() as isize - 1);
        while start <= end {
            let mid = ((start + end) / 2) as usize;
            let existing = &self.reservations[mid];
            if existing.start_time > reservation.end_time {
                end = mid as isize - 1;
            } else if existing.end_time < reservation.start_time {
                start = mid as isize + 1;
            } else {
                // Windows intersect.
                return None;
            }
        }
        Some(start as usize)
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Routing role: writes the forwarding table.
#[derive(Debug, Clone)]
pub enum RoutingProtocol {
    /// Table computed once from the topology at build time.
    Static,
    /// Link-state variant: floods advertisements and recomputes on change.
    Distributed {
        /// Known link states: origin → (sequence, neighbor links).
        lsdb: BTreeMap<String, (u64, Vec<(String, f64)>)>,
        /// Own advertisement sequence number.
        seq: u64,
    },
}

/// Computes a forwarding table (destination → next hop) from an adjacency
/// map using shortest path by length.
///
/// Ties are broken deterministically on the path's sorted node-name
/// sequence and then on its direction-canonical order, which makes
/// `path(src, dst)` the exact reverse of `path(dst, src)`.
pub fn compute_forwarding(
    origin: &str,
    links: &BTreeMap<String, Vec<(String, f64)>>,
) -> HashMap<String, String> {
    #[derive(Clone)]
    struct Best {
        dist: f64,
        path: Vec<String>,
    }

    fn rank(path: &[String]) -> (usize, Vec<&String>, Vec<&String>) {
        let mut sorted: Vec<&String> = path.iter().collect();
        sorted.sort();
        let forward: Vec<&String> = path.iter().collect();
        let mut backward = forward.clone();
        backward.reverse();
        let canonical = forward.clone().min(backward);
        (path.len(), sorted, canonical)
    }

    let mut best: BTreeMap<String, Best> = BTreeMap::new();
    best.insert(
        origin.to_string(),
        Best {
            dist: 0.0,
            path: vec![origin.to_string()],
        },
    );
    let mut visited: BTreeMap<String, Best> = BTreeMap::new();

    while let Some((node, entry)) = best
        .iter()
        .filter(|(n, _)| !visited.contains_key(*n))
        .min_by(|(_, a), (_, b)| {
            a.dist
                .partial_cmp(&b.dist)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| rank(&a.path).cmp(&rank(&b.path)))
        })
        .map(|(n, e)| (n.clone(), e.clone()))
    {
        visited.insert(node.clone(), entry.clone());
        for (neighbor, length) in links.get(&node).into_iter().flatten() {
            let candidate_dist = entry.dist + length;
            let mut candidate_path = entry.path.clone();
            candidate_path.push(neighbor.clone());
            let replace = match best.get(neighbor) {
                None => true,
                Some(current) => {
                    candidate_dist < current.dist - 1e-9
                        || ((candidate_dist - current.dist).abs() <= 1e-9
                            && rank(&candidate_path) < rank(&current.path))
                }
            };
            if replace {
                best.insert(
                    neighbor.clone(),
                    Best {
                        dist: candidate_dist,
                        path: candidate_path,
                    },
                );
            }
        }
    }

    let mut table = HashMap::new();
    for (dst, entry) in &visited {
        if dst != origin && entry.path.len() >= 2 {
            table.insert(dst.clone(), entry.path[1].clone());
        }
    }
    table
}

// ============================================================================
// Network Manager
// ============================================================================

/// Per-node network manager: forwarding table, routing role, and the
/// reservation protocol state.
#[derive(Debug)]
pub struct NetworkManager {
    /// Destination → next hop.
    pub forwarding_table: HashMap<String, String>,
    /// Routing role writing the table.
    pub routing: RoutingProtocol,
    /// Per-memory reservation schedules.
    pub timecards: Vec<MemoryTimeCard>,
    /// Success probability for swapping protocols created by rules.
    pub es_success_prob: f64,
    /// Degradation factor for swapping protocols created by rules.
    pub es_degradation: f64,
    /// Reservations approved on this node.
    pub accepted_reservations: Vec<Reservation>,
    /// Rules synthesized at approval, awaiting their load event.
    pub pending_rules: HashMap<ReservationId, Vec<(u64, RuleKind)>>,
    /// Next reservation sequence number (as initiator).
    pub next_seq: u64,
}

impl NetworkManager {
    /// Creates a manager for a node with `memory_count` reservable slots.
    pub fn new(memory_count: usize) -> Self {
        Self {
            forwarding_table: HashMap::new(),
            routing: RoutingProtocol::Static,
            timecards: (0..memory_count).map(MemoryTimeCard::new).collect(),
            es_success_prob: 1.0,
            es_degradation: 0.95,
            accepted_reservations: Vec::new(),
            pending_rules: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Tries to reserve capacity for a reservation on this node.
    ///
    /// End nodes hold `memory_size` slots; interior nodes hold twice that
    /// (one half per direction). On failure nothing is held.
    pub fn schedule(&mut self, own_name: &str, reservation: &Reservation) -> bool {
        let multiplier =
            if own_name == reservation.initiator || own_name == reservation.responder {
                1
            } else {
                2
            };
        let mut needed = multiplier * reservation.memory_size;

        let mut held = Vec::new();
        for card in &mut self.timecards {
            if needed == 0 {
                break;
            }
            if card.add(reservation) {
                held.push(card.memory_index);
                needed -= 1;
            }
        }

        if needed > 0 {
            for index in held {
                self.timecards[index].remove(&reservation.id);
            }
            return false;
        }
        true
    }

    /// Releases every slot held by a reservation.
    pub fn unschedule(&mut self, id: &ReservationId) {
        for card in &mut self.timecards {
            card.remove(id);
        }
    }

    /// Slot indices currently holding a reservation.
    pub fn reserved_indices(&self, id: &ReservationId) -> Vec<usize> {
        self.timecards
            .iter()
            .filter(|card| card.holds(id))
            .map(|card| card.memory_index)
            .collect()
    }

    /// Synthesizes the rules this node needs for an approved reservation,
    /// derived from its position in the path.
    pub fn create_rules(
        &self,
        own_name: &str,
        path: &[String],
        reservation: &Reservation,
        map_to_middle: &HashMap<String, String>,
    ) -> Vec<(u64, RuleKind)> {
        const RULE_PRIORITY: u64 = 10;

        let index = path
            .iter()
            .position(|n| n == own_name)
            .expect("own node on reservation path");
        let last = path.len() - 1;
        let size = reservation.memory_size;
        let memory_indices = self.reserved_indices(&reservation.id);

        let mut rules = Vec::new();

        // Generation toward the previous hop (waits for its request).
        if index > 0 {
            let previous = &path[index - 1];
            rules.push((
                RULE_PRIORITY,
                RuleKind::EntanglementGeneration {
                    middle: map_to_middle
                        .get(previous)
                        .cloned()
                        .unwrap_or_else(|| previous.clone()),
                    partner: previous.clone(),
                    indices: memory_indices.iter().copied().take(size).collect(),
                    initiate: false,
                },
            ));
        }

        // Generation toward the next hop (initiates pairing).
        if index < last {
            let next = &path[index + 1];
            let start = if index == 0 { 0 } else { size };
            rules.push((
                RULE_PRIORITY,
                RuleKind::EntanglementGeneration {
                    middle: map_to_middle
                        .get(next)
                        .cloned()
                        .unwrap_or_else(|| next.clone()),
                    partner: next.clone(),
                    indices: memory_indices.iter().copied().skip(start).collect(),
                    initiate: true,
                },
            ));
        }

        // Purification mirrors the generation split.
        if index > 0 {
            rules.push((
                RULE_PRIORITY,
                RuleKind::Purification {
                    indices: memory_indices.iter().copied().take(size).collect(),
                    target_fidelity: reservation.fidelity,
                    initiate: true,
                },
            ));
        }
        if index < last {
            let start = if index == 0 { 0 } else { size };
            rules.push((
                RULE_PRIORITY,
                RuleKind::Purification {
                    indices: memory_indices.iter().copied().skip(start).collect(),
                    target_fidelity: reservation.fidelity,
                    initiate: false,
                },
            ));
        }

        // Swapping: hosts wait for the far end; interior nodes swap their
        // hierarchy neighbors and wait otherwise.
        if index == 0 || index == last {
            let other_host = if index == 0 { &path[last] } else { &path[0] };
            rules.push((
                RULE_PRIORITY,
                RuleKind::SwappingB {
                    indices: memory_indices.clone(),
                    target_fidelity: reservation.fidelity,
                    forbidden: vec![other_host.clone()],
                },
            ));
        } else {
            let (left, right) = adjacent_nodes(path, own_name);
            rules.push((
                RULE_PRIORITY,
                RuleKind::SwappingA {
                    indices: memory_indices.clone(),
                    target_fidelity: reservation.fidelity,
                    left: left.clone(),
                    right: right.clone(),
                    success_prob: self.es_success_prob,
                    degradation: self.es_degradation,
                },
            ));
            rules.push((
                RULE_PRIORITY,
                RuleKind::SwappingB {
                    indices: memory_indices,
                    target_fidelity: reservation.fidelity,
                    forbidden: vec![left, right],
                },
            ));
        }

        rules
    }
}

/// Swapping-hierarchy neighbors of an interior node.
///
/// The path is repeatedly halved (keeping even positions plus the final
/// node) until the node lands on an odd position; its neighbors in that
/// reduced path are the two routers it will swap between.
fn adjacent_nodes(path: &[String], own: &str) -> (String, String) {
    let mut reduced: Vec<String> = path.to_vec();
    let mut index = reduced
        .iter()
        .position(|n| n == own)
        .expect("own node on path");
    while index % 2 == 0 {
        let final_index = reduced.len() - 1;
        reduced = reduced
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 2 == 0 || *i == final_index)
            .map(|(_, n)| n.clone())
            .collect();
        index = reduced
            .iter()
            .position(|n| n == own)
            .expect("own node survives halving");
    }
    (reduced[index - 1].clone(), reduced[index + 1].clone())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(seq: u64, start: u64, end: u64, size: usize) -> Reservation {
        Reservation::new(
            ReservationId {
                node: "r1".into(),
                seq,
            },
            "r1".into(),
            "r3".into(),
            start,
            end,
            size,
            0.9,
        )
    }

    #[test]
    fn timecard_rejects_overlap() {
        let mut card = MemoryTimeCard::new(0);
        assert!(card.add(&reservation(0, 100, 200, 1)));
        assert!(!card.add(&reservation(1, 150, 250, 1)));
        assert!(card.add(&reservation(2, 201, 300, 1)));
        assert!(card.add(&reservation(3, 0, 99, 1)));
        assert_eq!(card.reservations.len(), 3);
    }

    #[test]
    fn timecard_remove_releases_window() {
        let mut card = MemoryTimeCard::new(0);
        let r = reservation(0, 100, 200, 1);
        card.add(&r);
        assert!(card.remove(&r.id));
        assert!(card.add(&reservation(1, 150, 250, 1)));
        assert!(!card.remove(&r.id));
    }

    #[test]
    fn schedule_holds_double_capacity_at_interior() {
        let mut nm = NetworkManager::new(4);
        let r = reservation(0, 100, 200, 2);
        // r2 is interior for an r1 → r3 reservation.
        assert!(nm.schedule("r2", &r));
        assert_eq!(nm.reserved_indices(&r.id).len(), 4);
    }

    #[test]
    fn schedule_rolls_back_on_shortage() {
        let mut nm = NetworkManager::new(3);
        let r = reservation(0, 100, 200, 2);
        assert!(!nm.schedule("r2", &r), "needs 4 slots, has 3");
        assert!(nm.reserved_indices(&r.id).is_empty(), "rollback complete");
    }

    #[test]
    fn endpoint_holds_single_capacity() {
        let mut nm = NetworkManager::new(2);
        let r = reservation(0, 100, 200, 2);
        assert!(nm.schedule("r1", &r));
        assert_eq!(nm.reserved_indices(&r.id).len(), 2);
    }

    #[test]
    fn forwarding_prefers_shorter_paths() {
        let mut links = BTreeMap::new();
        links.insert(
            "a".to_string(),
            vec![("b".to_string(), 1.0), ("c".to_string(), 10.0)],
        );
        links.insert(
            "b".to_string(),
            vec![("a".to_string(), 1.0), ("c".to_string(), 1.0)],
        );
        links.insert(
            "c".to_string(),
            vec![("a".to_string(), 10.0), ("b".to_string(), 1.0)],
        );

        let table = compute_forwarding("a", &links);
        assert_eq!(table["c"], "b", "a→c via b is shorter");
    }

    #[test]
    fn forwarding_ties_are_symmetric() {
        // Diamond: a—b—d and a—c—d with equal lengths.
        let mut links = BTreeMap::new();
        links.insert(
            "a".to_string(),
            vec![("b".to_string(), 1.0), ("c".to_string(), 1.0)],
        );
        links.insert(
            "b".to_string(),
            vec![("a".to_string(), 1.0), ("d".to_string(), 1.0)],
        );
        links.insert(
            "c".to_string(),
            vec![("a".to_string(), 1.0), ("d".to_string(), 1.0)],
        );
        links.insert(
            "d".to_string(),
            vec![("b".to_string(), 1.0), ("c".to_string(), 1.0)],
        );

        let from_a = compute_forwarding("a", &links);
        let from_d = compute_forwarding("d", &links);
        // Both directions pick the same middle node.
        assert_eq!(from_a["d"], from_d["a"]);
        assert_eq!(from_a["d"], "b", "alphabetical tie-break");
    }

    #[test]
    fn adjacent_nodes_form_swap_hierarchy() {
        let path: Vec<String> = ["r1", "r2", "r3", "r4", "r5"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        // Odd positions swap their immediate neighbors first.
        assert_eq!(
            adjacent_nodes(&path, "r2"),
            ("r1".to_string(), "r3".to_string())
        );
        assert_eq!(
            adjacent_nodes(&path, "r4"),
            ("r3".to_string(), "r5".to_string())
        );
        // The middle of the reduced path swaps the two ends.
        assert_eq!(
            adjacent_nodes(&path, "r3"),
            ("r1".to_string(), "r5".to_string())
        );
    }

    #[test]
    fn create_rules_by_path_position() {
        let path: Vec<String> = ["r1", "r2", "r3"].iter().map(|s| s.to_string()).collect();
        let r = reservation(0, 100, 200, 1);
        let middle: HashMap<String, String> = [
            ("r1".to_string(), "m1".to_string()),
            ("r2".to_string(), "m1".to_string()),
            ("r3".to_string(), "m2".to_string()),
        ]
        .into_iter()
        .collect();

        // End node: EG-next + EP-wait + ESB.
        let mut nm_end = NetworkManager::new(2);
        assert!(nm_end.schedule("r1", &r));
        let rules = nm_end.create_rules("r1", &path, &r, &middle);
        assert_eq!(rules.len(), 3);
        assert!(matches!(
            rules[0].1,
            RuleKind::EntanglementGeneration { initiate: true, .. }
        ));
        assert!(matches!(rules[2].1, RuleKind::SwappingB { .. }));

        // Interior node: EG both sides, EP both sides, ESA + ESB.
        let mut nm_mid = NetworkManager::new(4);
        assert!(nm_mid.schedule("r2", &r));
        let rules = nm_mid.create_rules("r2", &path, &r, &middle);
        assert_eq!(rules.len(), 6);
        assert!(rules
            .iter()
            .any(|(_, k)| matches!(k, RuleKind::SwappingA { .. })));
    }
}
