//! BBPSSW entanglement distillation.
//!
//! Consumes two pairs entangled between the same pair of nodes, keeps one
//! and measures the other; the surviving pair is kept iff the exchanged
//! measurement outcomes agree. Success probability and post-success
//! fidelity follow the Werner-state formulas of Dür and Briegel; the
//! Bell-diagonal variant applies the BBPSSW recurrence to the four
//! probabilities directly.
//!
//! The end whose rule supplied both memories (the primary) draws the
//! outcome and announces it; the responder applies it and echoes it back so
//! both sides commit after one classical delay each way.

use photonq_quantum::Formalism;
use tracing::info;

use crate::effects::{Effect, ProtoCtx};
use crate::message::{Message, MessageBody};
use crate::resource::MemoryState;

/// Messages exchanged by purification protocols.
#[derive(Debug, Clone)]
pub enum PurificationMessage {
    /// Outcome announcement (primary → responder) and echo (responder →
    /// primary).
    PurificationRes {
        /// Whether the round succeeded (measurement outcomes agreed).
        success: bool,
    },
}

/// BBPSSW purification protocol instance.
#[derive(Debug, Clone)]
pub struct Bbpssw {
    /// Protocol instance name (`EP.<kept>.<meas>`).
    pub name: String,
    /// Index of the memory kept on success.
    pub kept_index: usize,
    /// Name of the kept memory.
    pub kept_name: String,
    /// Index of the measured memory (absent until the responder side is
    /// merged at pairing).
    pub meas_index: Option<usize>,
    /// Name of the measured memory.
    pub meas_name: Option<String>,
    /// Paired protocol name on the remote node.
    pub remote_protocol: Option<String>,
    /// Remote node holding the twin pairs.
    pub remote_node: String,
    /// Rule that created this instance.
    pub rule_id: Option<u64>,
    /// True on the side that draws the outcome.
    pub is_primary: bool,
    /// Drawn outcome, once known.
    pub is_success: Option<bool>,
    /// Time the round opened: construction on the primary side, merge on
    /// the responder. Expiry handling is windowed against this.
    pub t0: u64,
}

impl Bbpssw {
    /// Creates a purification instance. `meas_index` is set on the primary
    /// side and merged in at pairing on the responder side.
    pub fn new(
        name: String,
        kept_index: usize,
        kept_name: String,
        meas_index: Option<usize>,
        meas_name: Option<String>,
        remote_node: String,
        t0: u64,
    ) -> Self {
        let is_primary = meas_index.is_some();
        Self {
            name,
            kept_index,
            kept_name,
            meas_index,
            meas_name,
            remote_protocol: None,
            remote_node,
            rule_id: None,
            is_primary,
            is_success: None,
            t0,
        }
    }

    /// Memory indices this protocol holds.
    pub fn memory_indices(&self) -> Vec<usize> {
        let mut v = vec![self.kept_index];
        if let Some(m) = self.meas_index {
            v.push(m);
        }
        v
    }

    /// True once paired.
    pub fn is_ready(&self) -> bool {
        self.remote_protocol.is_some()
    }

    /// Pairs with the remote protocol.
    pub fn set_others(&mut self, protocol: String) {
        self.remote_protocol = Some(protocol);
    }

    /// Starts the round. Only the primary acts; the responder waits for
    /// the announcement.
    pub fn start(&mut self, ctx: &mut ProtoCtx<'_>) {
        let Some(remote_protocol) = self.remote_protocol.clone() else {
            return;
        };
        if !self.is_primary || self.is_success.is_some() {
            return;
        }

        let fidelity = ctx.memories[self.kept_index].fidelity;
        debug_assert!(fidelity > 0.5, "purification needs fidelity above 1/2");

        let success = ctx.rng.random_f64() < success_probability(fidelity);
        self.is_success = Some(success);
        info!(protocol = %self.name, success, "purification outcome drawn");

        ctx.send(
            self.remote_node.clone(),
            Message::to_protocol(
                remote_protocol,
                MessageBody::Purification(PurificationMessage::PurificationRes { success }),
            ),
        );
    }

    /// Handles the outcome announcement or its echo.
    pub fn received_message(
        &mut self,
        src: &str,
        msg: &PurificationMessage,
        ctx: &mut ProtoCtx<'_>,
    ) {
        if src != self.remote_node {
            return;
        }
        let PurificationMessage::PurificationRes { success } = msg;

        if self.is_success.is_none() {
            // Responder: commit the announced outcome and echo it.
            self.is_success = Some(*success);
            if let Some(remote_protocol) = self.remote_protocol.clone() {
                ctx.send(
                    self.remote_node.clone(),
                    Message::to_protocol(
                        remote_protocol,
                        MessageBody::Purification(PurificationMessage::PurificationRes {
                            success: *success,
                        }),
                    ),
                );
            }
        }

        self.apply_outcome(ctx);
    }

    /// Applies the committed outcome to both memories.
    fn apply_outcome(&mut self, ctx: &mut ProtoCtx<'_>) {
        let success = self.is_success.expect("outcome committed before apply");

        if success {
            let old = ctx.memories[self.kept_index].fidelity;
            let improved = improved_fidelity(old);
            ctx.memories[self.kept_index].fidelity = improved;

            if ctx.qm.formalism() == Formalism::BellDiagonal && self.is_primary {
                let kept_key = ctx.memories[self.kept_index].qstate_key;
                if let Ok(bds) = ctx.qm.get_bds(kept_key) {
                    let probs = bds_purify(bds.probs);
                    ctx.qm
                        .set_bds(bds.keys, probs)
                        .expect("recurrence preserves the distribution");
                }
            }
        }

        if let Some(meas_index) = self.meas_index {
            ctx.effects.push(Effect::RmUpdate {
                protocol: Some(self.name.clone()),
                memory_index: meas_index,
                state: MemoryState::Raw,
            });
        }
        ctx.effects.push(Effect::RmUpdate {
            protocol: Some(self.name.clone()),
            memory_index: self.kept_index,
            state: if success {
                MemoryState::Purified
            } else {
                MemoryState::Raw
            },
        });
    }

    /// Handles expiry of one of the held memories.
    ///
    /// The consequence depends on where the round stands relative to the
    /// classical exchange, windowed against `t0` and the one-way delay to
    /// the partner:
    ///
    /// - primary, announcement still in flight: only the expired memory is
    ///   lost; the partner memory keeps its entanglement bookkeeping;
    /// - primary, echo in flight: the responder has already committed the
    ///   outcome against the expired pair, so both memories go RAW;
    /// - responder, announcement in flight: both memories go RAW;
    /// - responder, echo in flight: both go RAW only when the *kept*
    ///   memory expired — a late expiry of the measured memory resolves
    ///   through the outcome already committed on both sides, so no
    ///   bookkeeping update is issued here.
    pub fn memory_expire(&mut self, memory_index: usize, ctx: &mut ProtoCtx<'_>) {
        debug_assert!(self.memory_indices().contains(&memory_index));

        if self.meas_index.is_none() {
            // Unmerged single-memory instance: nothing is in flight yet.
            ctx.effects.push(Effect::RmUpdate {
                protocol: Some(self.name.clone()),
                memory_index,
                state: MemoryState::Raw,
            });
            return;
        }

        let delay = ctx.cc_delay(&self.remote_node).unwrap_or(0);
        let now = ctx.now;

        if self.is_primary {
            if now < self.t0 + delay {
                for index in self.memory_indices() {
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
            } else {
                debug_assert!(
                    now < self.t0 + 2 * delay,
                    "purification expiry after the echo window on {}",
                    self.name
                );
                self.expire_all_raw(ctx);
            }
        } else if now < self.t0 + delay {
            self.expire_all_raw(ctx);
        } else if now < self.t0 + 2 * delay && memory_index == self.kept_index {
            self.expire_all_raw(ctx);
        }
    }

    fn expire_all_raw(&self, ctx: &mut ProtoCtx<'_>) {
        for index in self.memory_indices() {
            ctx.effects.push(Effect::RmUpdate {
                protocol: Some(self.name.clone()),
                memory_index: index,
                state: MemoryState::Raw,
            });
        }
    }
}

// ============================================================================
// Fidelity formulas
// ============================================================================

/// BBPSSW success probability for a Werner state of fidelity `f`
/// (Dür and Briegel 2007, p. 14).
pub fn success_probability(f: f64) -> f64 {
    f * f + 2.0 * f * (1.0 - f) / 3.0 + 5.0 * ((1.0 - f) / 3.0).powi(2)
}

/// Post-success fidelity for a Werner state of fidelity `f`
/// (Dür and Briegel 2007, eq. 18).
pub fn improved_fidelity(f: f64) -> f64 {
    (f * f + ((1.0 - f) / 3.0).powi(2)) / success_probability(f)
}

/// BBPSSW recurrence on Bell-diagonal probabilities (Φ⁺, Φ⁻, Ψ⁺, Ψ⁻).
pub fn bds_purify(p: [f64; 4]) -> [f64; 4] {
    let n = (p[0] + p[1]).powi(2) + (p[2] + p[3]).powi(2);
    [
        (p[0] * p[0] + p[1] * p[1]) / n,
        2.0 * p[0] * p[1] / n,
        (p[2] * p[2] + p[3] * p[3]) / n,
        2.0 * p[2] * p[3] / n,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_input_always_succeeds() {
        assert!((success_probability(1.0) - 1.0).abs() < 1e-12);
        assert!((improved_fidelity(1.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn purification_improves_fidelity_above_half() {
        for f in [0.6, 0.7, 0.85, 0.95] {
            assert!(improved_fidelity(f) > f, "f={f}");
        }
    }

    #[test]
    fn werner_recurrence_matches_scalar_formulas() {
        let f: f64 = 0.85;
        let w = (1.0 - f) / 3.0;
        let out = bds_purify([f, w, w, w]);
        assert!((out.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((out[0] - improved_fidelity(f)).abs() < 1e-12);
    }

    #[test]
    fn primary_is_side_with_meas_memory() {
        let primary = Bbpssw::new(
            "EP.a.b".into(),
            0,
            "a".into(),
            Some(1),
            Some("b".into()),
            "r2".into(),
            0,
        );
        let responder = Bbpssw::new("EP.c".into(), 0, "c".into(), None, None, "r1".into(), 0);
        assert!(primary.is_primary);
        assert!(!responder.is_primary);
    }

    mod expiry_windows {
        use std::collections::HashMap;

        use photonq_hardware::{ClassicalChannel, Memory, MemoryConfig};
        use photonq_kernel::SimRng;
        use photonq_quantum::{Formalism, QuantumManager};

        use crate::effects::{Effect, ProtoCtx};
        use crate::purification::Bbpssw;
        use crate::resource::MemoryState;

        const DELAY: u64 = 1_000;

        struct Bench {
            memories: Vec<Memory>,
            qm: QuantumManager,
            rng: SimRng,
            cchannels: HashMap<String, ClassicalChannel>,
            qchannels: HashMap<String, photonq_hardware::QuantumChannel>,
        }

        fn bench() -> Bench {
            let mut qm = QuantumManager::new(Formalism::Ket, 16);
            let config = MemoryConfig::default();
            let memories = vec![
                Memory::new("r1.memo[0]".into(), "r1".into(), &config, &mut qm),
                Memory::new("r1.memo[1]".into(), "r1".into(), &config, &mut qm),
            ];
            let mut cchannels = HashMap::new();
            cchannels.insert(
                "r2".to_string(),
                ClassicalChannel::new(
                    "cc.r1.r2".into(),
                    "r1".into(),
                    "r2".into(),
                    0.0,
                    Some(DELAY),
                ),
            );
            Bench {
                memories,
                qm,
                rng: SimRng::new(0),
                cchannels,
                qchannels: HashMap::new(),
            }
        }

        fn expire_at(protocol: &mut Bbpssw, memory_index: usize, now: u64) -> Vec<(usize, MemoryState)> {
            let mut bench = bench();
            let mut effects = Vec::new();
            {
                let mut ctx = ProtoCtx {
                    now,
                    node_name: "r1",
                    memories: &mut bench.memories,
                    qm: &mut bench.qm,
                    rng: &mut bench.rng,
                    cchannels: &bench.cchannels,
                    qchannels: &mut bench.qchannels,
                    effects: &mut effects,
                };
                protocol.memory_expire(memory_index, &mut ctx);
            }
            effects
                .into_iter()
                .filter_map(|effect| match effect {
                    Effect::RmUpdate {
                        memory_index,
                        state,
                        ..
                    } => Some((memory_index, state)),
                    _ => None,
                })
                .collect()
        }

        fn primary() -> Bbpssw {
            Bbpssw::new(
                "EP.r1.memo[0].r1.memo[1]".into(),
                0,
                "r1.memo[0]".into(),
                Some(1),
                Some("r1.memo[1]".into()),
                "r2".into(),
                0,
            )
        }

        fn responder() -> Bbpssw {
            let mut p = Bbpssw::new(
                "EP.r1.memo[0]".into(),
                0,
                "r1.memo[0]".into(),
                None,
                None,
                "r2".into(),
                0,
            );
            // Merged at pairing: the measured twin joins without making
            // this side the outcome drawer.
            p.meas_index = Some(1);
            p.meas_name = Some("r1.memo[1]".into());
            p
        }

        #[test]
        fn primary_early_window_keeps_partner_entangled() {
            let updates = expire_at(&mut primary(), 1, DELAY / 2);
            assert!(updates.contains(&(1, MemoryState::Raw)));
            assert!(updates.contains(&(0, MemoryState::Entangled)));
        }

        #[test]
        fn primary_late_window_resets_both() {
            let updates = expire_at(&mut primary(), 0, DELAY + DELAY / 2);
            assert!(updates.contains(&(0, MemoryState::Raw)));
            assert!(updates.contains(&(1, MemoryState::Raw)));
        }

        #[test]
        fn responder_early_window_resets_both() {
            let updates = expire_at(&mut responder(), 1, DELAY / 2);
            assert!(updates.contains(&(0, MemoryState::Raw)));
            assert!(updates.contains(&(1, MemoryState::Raw)));
        }

        #[test]
        fn responder_late_kept_expiry_resets_both() {
            let updates = expire_at(&mut responder(), 0, DELAY + DELAY / 2);
            assert!(updates.contains(&(0, MemoryState::Raw)));
            assert!(updates.contains(&(1, MemoryState::Raw)));
        }

        #[test]
        fn responder_late_meas_expiry_defers_to_outcome() {
            let updates = expire_at(&mut responder(), 1, DELAY + DELAY / 2);
            assert!(updates.is_empty(), "no bookkeeping update is issued");
        }

        #[test]
        fn unmerged_instance_resets_only_itself() {
            let mut p = Bbpssw::new(
                "EP.r1.memo[0]".into(),
                0,
                "r1.memo[0]".into(),
                None,
                None,
                "r2".into(),
                0,
            );
            let updates = expire_at(&mut p, 0, DELAY / 2);
            assert_eq!(updates, vec![(0, MemoryState::Raw)]);
        }
    }
}
