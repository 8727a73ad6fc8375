//! Entanglement swapping.
//!
//! The A role runs at an intermediate router holding two memories
//! entangled with two different remote routers. It performs a local
//! Bell-state measurement, releases its own memories, and sends the two
//! outcome bits to the remote B roles; each B role applies the Pauli
//! correction and rebinds its memory to the far end. Post-success fidelity
//! is `f1 · f2 · degradation`; failure discards all three holdings.

use photonq_quantum::{Circuit, Formalism};
use tracing::info;

use crate::effects::{Effect, ProtoCtx};
use crate::message::{Message, MessageBody};
use crate::resource::MemoryState;

/// Messages sent by the A role to the B roles.
#[derive(Debug, Clone)]
pub enum SwappingMessage {
    /// Swapping outcome. A zero fidelity signals failure.
    SwapRes {
        /// Fidelity of the new pair (0 on failure).
        fidelity: f64,
        /// Far node the receiver is now entangled with.
        remote_node: Option<String>,
        /// Far memory name.
        remote_memo: Option<String>,
        /// Expiration time inherited from the shorter-lived parent pair.
        expire_time: Option<u64>,
        /// Bell measurement bits for the Pauli correction (empty for the
        /// left receiver, both bits for the right).
        meas_res: Vec<u8>,
    },
}

// ============================================================================
// Intermediate role (A)
// ============================================================================

/// Swapping protocol at the intermediate router.
#[derive(Debug, Clone)]
pub struct SwappingA {
    /// Protocol instance name (`ESA.<left>.<right>`).
    pub name: String,
    /// Index of the memory entangled toward the left remote.
    pub left_index: usize,
    /// Index of the memory entangled toward the right remote.
    pub right_index: usize,
    /// Left remote router name.
    pub left_node: String,
    /// Memory on the left remote entangled with `left_index`.
    pub left_remote_memo: String,
    /// Right remote router name.
    pub right_node: String,
    /// Memory on the right remote entangled with `right_index`.
    pub right_remote_memo: String,
    /// Paired protocol on the left remote.
    pub left_protocol: Option<String>,
    /// Paired protocol on the right remote.
    pub right_protocol: Option<String>,
    /// BSM success probability.
    pub success_prob: f64,
    /// Fidelity degradation factor.
    pub degradation: f64,
    /// Rule that created this instance.
    pub rule_id: Option<u64>,
}

impl SwappingA {
    /// Creates a swapping-A instance over two entangled memories.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        left_index: usize,
        right_index: usize,
        left_node: String,
        left_remote_memo: String,
        right_node: String,
        right_remote_memo: String,
        success_prob: f64,
        degradation: f64,
    ) -> Self {
        debug_assert_ne!(left_index, right_index);
        Self {
            name,
            left_index,
            right_index,
            left_node,
            left_remote_memo,
            right_node,
            right_remote_memo,
            left_protocol: None,
            right_protocol: None,
            success_prob,
            degradation,
            rule_id: None,
        }
    }

    /// True once both B roles are paired.
    pub fn is_ready(&self) -> bool {
        self.left_protocol.is_some() && self.right_protocol.is_some()
    }

    /// Pairs one of the B roles, matched by node name.
    pub fn set_others(&mut self, protocol: String, node: String) {
        if node == self.left_node {
            self.left_protocol = Some(protocol);
        } else if node == self.right_node {
            self.right_protocol = Some(protocol);
        } else {
            debug_assert!(false, "cannot pair {protocol} from {node}");
        }
    }

    /// Performs the swap and reports to both B roles.
    pub fn start(&mut self, ctx: &mut ProtoCtx<'_>) {
        info!(
            protocol = %self.name,
            left = %self.left_node,
            right = %self.right_node,
            "swapping start"
        );
        let left_fid = ctx.memories[self.left_index].fidelity;
        let right_fid = ctx.memories[self.right_index].fidelity;
        debug_assert!(left_fid > 0.0 && right_fid > 0.0);

        let (msg_left, msg_right);
        if ctx.rng.random_f64() < self.success_prob {
            let fidelity = left_fid * right_fid * self.degradation;
            let expire_time = self.joint_expire_time(ctx);
            let meas_res = self.bell_measure(ctx);

            msg_left = SwappingMessage::SwapRes {
                fidelity,
                remote_node: Some(self.right_node.clone()),
                remote_memo: Some(self.right_remote_memo.clone()),
                expire_time,
                meas_res: Vec::new(),
            };
            msg_right = SwappingMessage::SwapRes {
                fidelity,
                remote_node: Some(self.left_node.clone()),
                remote_memo: Some(self.left_remote_memo.clone()),
                expire_time,
                meas_res,
            };
        } else {
            msg_left = SwappingMessage::SwapRes {
                fidelity: 0.0,
                remote_node: None,
                remote_memo: None,
                expire_time: None,
                meas_res: Vec::new(),
            };
            msg_right = msg_left.clone();
        }

        let left_protocol = self.left_protocol.clone().expect("paired before start");
        let right_protocol = self.right_protocol.clone().expect("paired before start");
        ctx.send(
            self.left_node.clone(),
            Message::to_protocol(left_protocol, MessageBody::Swapping(msg_left)),
        );
        ctx.send(
            self.right_node.clone(),
            Message::to_protocol(right_protocol, MessageBody::Swapping(msg_right)),
        );

        ctx.effects.push(Effect::RmUpdate {
            protocol: Some(self.name.clone()),
            memory_index: self.left_index,
            state: MemoryState::Raw,
        });
        ctx.effects.push(Effect::RmUpdate {
            protocol: Some(self.name.clone()),
            memory_index: self.right_index,
            state: MemoryState::Raw,
        });
    }

    /// Bell measurement on the two local memories. Returns the two outcome
    /// bits for the right-hand Pauli correction.
    fn bell_measure(&self, ctx: &mut ProtoCtx<'_>) -> Vec<u8> {
        let left_key = ctx.memories[self.left_index].qstate_key;
        let right_key = ctx.memories[self.right_index].qstate_key;

        if ctx.qm.formalism() == Formalism::BellDiagonal {
            // Analytic path: combine the two pair states into the new
            // long-distance pair between the far keys.
            let left_pair = ctx.qm.get_bds(left_key).ok();
            let right_pair = ctx.qm.get_bds(right_key).ok();
            if let (Some(lp), Some(rp)) = (left_pair, right_pair) {
                let far_left = other_key(&lp.keys, left_key);
                let far_right = other_key(&rp.keys, right_key);
                let fidelity = lp.fidelity() * rp.fidelity() * self.degradation;
                let bds = photonq_quantum::BellDiagonalState::werner(
                    fidelity.clamp(0.0, 1.0),
                    [far_left, far_right],
                );
                let _ = ctx.qm.set_bds([far_left, far_right], bds.probs);
            }
            return vec![0, 0];
        }

        let mut circuit = Circuit::new(2);
        circuit.cx(0, 1).h(0).measure(0).measure(1);
        let samp = ctx.rng.random_f64();
        let outcome = ctx
            .qm
            .run_circuit(&circuit, &[left_key, right_key], Some(samp))
            .expect("swap circuit on registered keys");
        vec![outcome[&left_key], outcome[&right_key]]
    }

    /// Earliest expiration among the two parent pairs.
    fn joint_expire_time(&self, ctx: &ProtoCtx<'_>) -> Option<u64> {
        let expire_of = |index: usize| {
            let memory = &ctx.memories[index];
            memory
                .generation_time
                .and_then(|t| memory.expire_time(t))
        };
        match (expire_of(self.left_index), expire_of(self.right_index)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }

    /// Handles expiry of a held memory before pairing completed: releases
    /// the remote holdings and resets the local ones.
    pub fn memory_expire(&mut self, memory_index: usize, ctx: &mut ProtoCtx<'_>) {
        if self.left_protocol.is_some() {
            ctx.effects.push(Effect::ReleaseRemoteProtocol {
                node: self.left_node.clone(),
                protocol: self.left_protocol.clone().expect("checked above"),
            });
        } else {
            ctx.effects.push(Effect::ReleaseRemoteMemory {
                node: self.left_node.clone(),
                memory: self.left_remote_memo.clone(),
            });
        }
        if self.right_protocol.is_some() {
            ctx.effects.push(Effect::ReleaseRemoteProtocol {
                node: self.right_node.clone(),
                protocol: self.right_protocol.clone().expect("checked above"),
            });
        } else {
            ctx.effects.push(Effect::ReleaseRemoteMemory {
                node: self.right_node.clone(),
                memory: self.right_remote_memo.clone(),
            });
        }

        for index in [self.left_index, self.right_index] {
            let state = if index == memory_index {
                MemoryState::Raw
            } else {
                MemoryState::Entangled
            };
            ctx.effects.push(Effect::RmUpdate {
                protocol: Some(self.name.clone()),
                memory_index: index,
                state,
            });
        }
    }
}

fn other_key(
    keys: &[photonq_quantum::StateKey; 2],
    own: photonq_quantum::StateKey,
) -> photonq_quantum::StateKey {
    if keys[0] == own {
        keys[1]
    } else {
        keys[0]
    }
}

// ============================================================================
// End role (B)
// ============================================================================

/// Swapping protocol at an end router, waiting for the A role's result.
#[derive(Debug, Clone)]
pub struct SwappingB {
    /// Protocol instance name (`ESB.<memory>`).
    pub name: String,
    /// Index of the held memory.
    pub memory_index: usize,
    /// Name of the held memory.
    pub memory_name: String,
    /// Paired A-role protocol name.
    pub remote_protocol: Option<String>,
    /// Node hosting the A role.
    pub remote_node: Option<String>,
    /// Rule that created this instance.
    pub rule_id: Option<u64>,
}

impl SwappingB {
    /// Creates a swapping-B instance for one entangled memory.
    pub fn new(name: String, memory_index: usize, memory_name: String) -> Self {
        Self {
            name,
            memory_index,
            memory_name,
            remote_protocol: None,
            remote_node: None,
            rule_id: None,
        }
    }

    /// True once paired.
    pub fn is_ready(&self) -> bool {
        self.remote_protocol.is_some()
    }

    /// Pairs with the A role.
    pub fn set_others(&mut self, protocol: String, node: String) {
        self.remote_protocol = Some(protocol);
        self.remote_node = Some(node);
    }

    /// Applies the swap result.
    pub fn received_message(&mut self, src: &str, msg: &SwappingMessage, ctx: &mut ProtoCtx<'_>) {
        if Some(src) != self.remote_node.as_deref() {
            return;
        }
        let SwappingMessage::SwapRes {
            fidelity,
            remote_node,
            remote_memo,
            expire_time,
            meas_res,
        } = msg;

        let within_lifetime = expire_time.map_or(true, |t| ctx.now < t);
        if *fidelity > 0.0 && within_lifetime {
            self.apply_correction(meas_res, ctx);

            let remote = photonq_hardware::EntangledRemote {
                node: remote_node.clone().expect("success carries remote node"),
                memory: remote_memo.clone().expect("success carries remote memo"),
            };
            let now = ctx.now;
            ctx.memories[self.memory_index].set_entangled(remote, *fidelity, now);
            ctx.effects.push(Effect::RmUpdate {
                protocol: Some(self.name.clone()),
                memory_index: self.memory_index,
                state: MemoryState::Entangled,
            });
            // The new pair inherits the shorter parent lifetime; applied
            // after the bookkeeping update so it overrides the coherence
            // schedule derived there.
            if let Some(t) = expire_time {
                ctx.effects.push(Effect::UpdateExpireTime {
                    memory_index: self.memory_index,
                    time: *t,
                });
            }
        } else {
            ctx.effects.push(Effect::RmUpdate {
                protocol: Some(self.name.clone()),
                memory_index: self.memory_index,
                state: MemoryState::Raw,
            });
        }
    }

    fn apply_correction(&self, meas_res: &[u8], ctx: &mut ProtoCtx<'_>) {
        if ctx.qm.formalism() == Formalism::BellDiagonal || meas_res.is_empty() {
            return;
        }
        let mut circuit = Circuit::new(1);
        match meas_res {
            [1, 0] => {
                circuit.z(0);
            }
            [0, 1] => {
                circuit.x(0);
            }
            [1, 1] => {
                circuit.x(0).z(0);
            }
            _ => return,
        }
        let key = ctx.memories[self.memory_index].qstate_key;
        ctx.qm
            .run_circuit(&circuit, &[key], None)
            .expect("correction circuit on registered key");
    }

    /// Returns the memory to RAW on expiry.
    pub fn memory_expire(&mut self, memory_index: usize, ctx: &mut ProtoCtx<'_>) {
        debug_assert_eq!(memory_index, self.memory_index);
        ctx.effects.push(Effect::RmUpdate {
            protocol: Some(self.name.clone()),
            memory_index: self.memory_index,
            state: MemoryState::Raw,
        });
    }

    /// Released by the remote side: the memory keeps its entanglement.
    pub fn release(&mut self, ctx: &mut ProtoCtx<'_>) {
        ctx.effects.push(Effect::RmUpdate {
            protocol: Some(self.name.clone()),
            memory_index: self.memory_index,
            state: MemoryState::Entangled,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swapped_fidelity_is_product_with_degradation() {
        // The fidelity model itself: f1 · f2 · degradation.
        let f1: f64 = 0.9;
        let f2: f64 = 0.85;
        let degradation = 0.99;
        assert!((f1 * f2 * degradation - 0.757_35).abs() < 1e-6);
    }

    #[test]
    fn pairing_matches_by_node() {
        let mut a = SwappingA::new(
            "ESA.m0.m1".into(),
            0,
            1,
            "r1".into(),
            "r1.memo[0]".into(),
            "r3".into(),
            "r3.memo[0]".into(),
            1.0,
            0.95,
        );
        assert!(!a.is_ready());
        a.set_others("ESB.r1.memo[0]".into(), "r1".into());
        a.set_others("ESB.r3.memo[0]".into(), "r3".into());
        assert!(a.is_ready());
        assert_eq!(a.left_protocol.as_deref(), Some("ESB.r1.memo[0]"));
        assert_eq!(a.right_protocol.as_deref(), Some("ESB.r3.memo[0]"));
    }
}
