//! BB84 sifting protocol.
//!
//! The alice role draws a random basis and bit per pulse and drives the
//! light source; the bob role draws measurement bases, reads the detector
//! bank, and the two sides sift matching-basis bits over the classical
//! channel. Each side accumulates sifted bits independently and pops a key
//! to the upper layer whenever enough bits are banked — the pulse-train
//! announcement carries the key length, so no side ever needs to peek at
//! the other's state.

use photonq_kernel::SECOND;
use tracing::{debug, info};

use crate::effects::Effect;
use crate::message::{Message, MessageBody};
use crate::qkd::{QkdCtx, QkdOp};

/// Messages exchanged by BB84 protocol instances.
#[derive(Debug, Clone)]
pub enum Bb84Message {
    /// Alice → bob: a pulse train is coming.
    BeginPhotonPulse {
        /// Light source pulse frequency (Hz).
        frequency: u64,
        /// Train duration in seconds.
        light_time: f64,
        /// Absolute emission start time at alice (ps).
        start_time: u64,
        /// Photon wavelength (nm).
        wavelength: f64,
        /// Target key length in bits.
        key_length: usize,
        /// Number of keys requested.
        key_count: usize,
    },
    /// Bob → alice: the train was measured.
    ReceivedQubits,
    /// Alice → bob: preparation bases for the last train.
    BasisList {
        /// One basis per pulse.
        bases: Vec<u8>,
    },
    /// Bob → alice: pulse indices where bases matched and a bit was
    /// detected.
    MatchingIndices {
        /// Matching pulse indices.
        indices: Vec<usize>,
    },
}

// ============================================================================
// Detector Bank
// ============================================================================

/// Bob-side polarization measurement bank.
///
/// Configured per pulse train with a basis list and timing; photons are
/// binned onto pulse indices by arrival time. A bit is recorded when the
/// measurement basis matches the preparation basis and the photon was not
/// scrambled in the fiber; any other case yields an uncorrelated bit, and
/// a missed detection leaves the slot invalid.
#[derive(Debug, Default)]
pub struct QkdDetectorBank {
    /// Detection efficiency per photon.
    pub efficiency: f64,
    /// Measurement basis per pulse.
    pub basis_list: Vec<u8>,
    /// Arrival time of pulse 0 (ps).
    pub start_time: u64,
    /// Pulse frequency (Hz).
    pub frequency: u64,
    /// Measured bit per pulse (-1 = none).
    pub bits: Vec<i8>,
}

impl QkdDetectorBank {
    /// Creates a bank with the given detection efficiency.
    pub fn new(efficiency: f64) -> Self {
        Self {
            efficiency,
            ..Self::default()
        }
    }

    /// Arms the bank for a pulse train.
    pub fn configure(&mut self, basis_list: Vec<u8>, start_time: u64, frequency: u64) {
        self.bits = vec![-1; basis_list.len()];
        self.basis_list = basis_list;
        self.start_time = start_time;
        self.frequency = frequency;
    }

    /// Registers a polarization photon.
    pub fn detect(
        &mut self,
        basis: u8,
        bit: u8,
        scrambled: bool,
        now: u64,
        rng: &mut photonq_kernel::SimRng,
    ) {
        if self.basis_list.is_empty() || now < self.start_time {
            return;
        }
        let offset = u128::from(now - self.start_time) * u128::from(self.frequency);
        let index = ((offset + u128::from(SECOND) / 2) / u128::from(SECOND)) as usize;
        if index >= self.bits.len() {
            return;
        }
        if rng.random_f64() >= self.efficiency {
            return;
        }
        let measured = if self.basis_list[index] == basis && !scrambled {
            bit
        } else {
            rng.coin()
        };
        self.bits[index] = measured as i8;
    }

    /// Takes the measured bits, clearing the bank.
    pub fn take_bits(&mut self) -> Vec<i8> {
        self.basis_list.clear();
        std::mem::take(&mut self.bits)
    }
}

// ============================================================================
// BB84 Protocol
// ============================================================================

/// BB84 protocol instance (one per QKD node).
#[derive(Debug)]
pub struct Bb84 {
    /// Protocol instance name (`<node>.BB84`).
    pub name: String,
    /// 0 = alice (sender), 1 = bob (receiver), -1 = unpaired.
    pub role: i8,
    /// Peer node name.
    pub peer_node: String,
    /// Peer protocol name.
    pub peer_protocol: String,
    /// True while a request is being served.
    pub working: bool,
    /// (Alice) true when no request is in flight.
    pub ready: bool,
    /// Pulse train duration (s).
    pub light_time: f64,
    /// Light source frequency (Hz).
    pub ls_freq: u64,
    /// Start time of the current train (ps).
    pub start_time: u64,
    /// Per-train preparation/measurement bases.
    pub basis_lists: Vec<Vec<u8>>,
    /// Per-train bits (alice: sent bits; bob: measured, -1 invalid).
    pub bit_lists: Vec<Vec<i8>>,
    /// Sifted bits banked toward the next key.
    pub key_bits: Vec<u8>,
    /// Outstanding request: key length in bits.
    pub key_length: usize,
    /// Outstanding request: keys still to deliver.
    pub keys_left: usize,
    /// Keys delivered over the lifetime of the instance.
    pub keys_delivered: u64,
}

impl Bb84 {
    /// Creates an unpaired BB84 instance.
    pub fn new(name: String, peer_node: String, peer_protocol: String) -> Self {
        Self {
            name,
            role: -1,
            peer_node,
            peer_protocol,
            working: false,
            ready: true,
            light_time: 0.0,
            ls_freq: 0,
            start_time: 0,
            basis_lists: Vec::new(),
            bit_lists: Vec::new(),
            key_bits: Vec::new(),
            key_length: 0,
            keys_left: 0,
            keys_delivered: 0,
        }
    }

    /// Receives a key request from the upper layer (alice only).
    pub fn push(&mut self, key_length: usize, key_count: usize, ctx: &mut QkdCtx<'_>) {
        assert_eq!(self.role, 0, "key generation must be requested from alice");
        info!(protocol = %self.name, key_length, key_count, "generating keys");

        self.key_length = key_length;
        self.keys_left = key_count;

        if self.ready {
            self.ready = false;
            self.working = true;
            self.start_protocol(ctx);
        }
    }

    /// (Alice) opens a pulse-train round.
    pub fn start_protocol(&mut self, ctx: &mut QkdCtx<'_>) {
        if self.keys_left == 0 {
            self.ready = true;
            self.working = false;
            return;
        }
        debug!(protocol = %self.name, "starting protocol");

        self.basis_lists.clear();
        self.bit_lists.clear();
        self.working = true;

        let ls = ctx.light_source;
        self.ls_freq = ls.frequency;
        self.light_time =
            self.key_length as f64 / (self.ls_freq as f64 * ls.mean_photon_num);

        let cc_delay = ctx
            .cchannels
            .get(&self.peer_node)
            .map(|c| c.delay)
            .unwrap_or(0);
        self.start_time = ctx.now + cc_delay;

        ctx.send(
            self.peer_node.clone(),
            Message::to_protocol(
                self.peer_protocol.clone(),
                MessageBody::Bb84(Bb84Message::BeginPhotonPulse {
                    frequency: self.ls_freq,
                    light_time: self.light_time,
                    start_time: self.start_time,
                    wavelength: ls.wavelength,
                    key_length: self.key_length,
                    key_count: self.keys_left,
                }),
            ),
        );
        ctx.effects.push(Effect::ScheduleQkd {
            time: self.start_time,
            op: QkdOp::BeginPhotonPulse,
        });
    }

    /// (Alice) emits one pulse train and schedules the next round.
    pub fn begin_photon_pulse(&mut self, ctx: &mut QkdCtx<'_>) {
        if !self.working {
            return;
        }
        debug!(protocol = %self.name, "photon pulse");

        let num_pulses = (self.light_time * self.ls_freq as f64).round() as usize;
        let basis_list: Vec<u8> = (0..num_pulses).map(|_| ctx.rng.coin()).collect();
        let bit_list: Vec<u8> = (0..num_pulses).map(|_| ctx.rng.coin()).collect();

        let states: Vec<(u8, u8)> = basis_list
            .iter()
            .zip(&bit_list)
            .map(|(basis, bit)| (*basis, *bit))
            .collect();
        let pulses = ctx.light_source.emit(&states, ctx.rng);
        let now = ctx.now;
        for (offset, photon) in pulses {
            if let Some(channel) = ctx.qchannels.get_mut(&self.peer_node) {
                // Each pulse travels independently; losses and noise are
                // applied per photon.
                if let Some((arrival, photon)) =
                    channel.transmit(photon, ctx.rng, now + offset)
                {
                    ctx.effects.push(Effect::DeliverPhoton {
                        dst: self.peer_node.clone(),
                        time: arrival,
                        photon,
                    });
                }
            }
        }

        self.basis_lists.push(basis_list);
        self.bit_lists.push(bit_list.iter().map(|b| *b as i8).collect());
        self.start_time = ctx.now;
    }

    /// Handles an incoming BB84 message.
    pub fn received_message(&mut self, src: &str, msg: &Bb84Message, ctx: &mut QkdCtx<'_>) {
        if src != self.peer_node {
            return;
        }
        match msg {
            Bb84Message::BeginPhotonPulse {
                frequency,
                light_time,
                start_time,
                key_length,
                key_count,
                ..
            } => {
                // Bob arms the detector bank for the incoming train.
                self.working = true;
                self.ls_freq = *frequency;
                self.light_time = *light_time;
                self.key_length = *key_length;
                self.keys_left = *key_count;

                let qc_delay = ctx
                    .qchannels
                    .get(&self.peer_node)
                    .map(|c| c.delay)
                    .unwrap_or(0);
                self.start_time = start_time + qc_delay;

                let num_pulses = (self.light_time * self.ls_freq as f64).round() as usize;
                let basis_list: Vec<u8> = (0..num_pulses).map(|_| ctx.rng.coin()).collect();
                ctx.detector_bank
                    .configure(basis_list.clone(), self.start_time, self.ls_freq);
                self.basis_lists.push(basis_list);

                let train_ps = (self.light_time * SECOND as f64).round() as u64;
                ctx.effects.push(Effect::ScheduleQkd {
                    time: self.start_time + train_ps.saturating_sub(1),
                    op: QkdOp::EndPhotonPulse,
                });
            }

            Bb84Message::ReceivedQubits => {
                // Alice discloses the preparation bases.
                if self.basis_lists.is_empty() {
                    return;
                }
                let bases = self.basis_lists.remove(0);
                ctx.send(
                    self.peer_node.clone(),
                    Message::to_protocol(
                        self.peer_protocol.clone(),
                        MessageBody::Bb84(Bb84Message::BasisList { bases }),
                    ),
                );
            }

            Bb84Message::BasisList { bases } => {
                // Bob sifts matching-basis bits.
                if self.basis_lists.is_empty() || self.bit_lists.is_empty() {
                    return;
                }
                let own_bases = self.basis_lists.remove(0);
                let bits = self.bit_lists.remove(0);

                let mut indices = Vec::new();
                for (i, alice_basis) in bases.iter().enumerate() {
                    if i < own_bases.len()
                        && i < bits.len()
                        && bits[i] != -1
                        && own_bases[i] == *alice_basis
                    {
                        indices.push(i);
                        self.key_bits.push(bits[i] as u8);
                    }
                }

                ctx.send(
                    self.peer_node.clone(),
                    Message::to_protocol(
                        self.peer_protocol.clone(),
                        MessageBody::Bb84(Bb84Message::MatchingIndices { indices }),
                    ),
                );
                self.pop_finished_keys(ctx);
            }

            Bb84Message::MatchingIndices { indices } => {
                // Alice keeps her bits at the matching indices.
                if self.bit_lists.is_empty() {
                    return;
                }
                let bits = self.bit_lists.remove(0);
                for i in indices {
                    if *i < bits.len() {
                        self.key_bits.push(bits[*i] as u8);
                    }
                }
                self.pop_finished_keys(ctx);

                if self.keys_left > 0 && self.working {
                    // Not enough sifted bits yet: next train after the
                    // fiber clears.
                    let qc_delay = ctx
                        .qchannels
                        .get(&self.peer_node)
                        .map(|c| c.delay)
                        .unwrap_or(0);
                    ctx.effects.push(Effect::ScheduleQkd {
                        time: ctx.now + qc_delay + 1,
                        op: QkdOp::StartProtocol,
                    });
                }
            }
        }
    }

    /// (Bob) closes the current train: reads out the detector bank and
    /// notifies alice.
    pub fn end_photon_pulse(&mut self, ctx: &mut QkdCtx<'_>) {
        if !self.working {
            return;
        }
        debug!(protocol = %self.name, "end photon pulse");
        self.bit_lists.push(ctx.detector_bank.take_bits());
        ctx.send(
            self.peer_node.clone(),
            Message::to_protocol(
                self.peer_protocol.clone(),
                MessageBody::Bb84(Bb84Message::ReceivedQubits),
            ),
        );
    }

    /// Pops every full key banked so far to the upper layer.
    fn pop_finished_keys(&mut self, ctx: &mut QkdCtx<'_>) {
        while self.key_length > 0
            && self.keys_left > 0
            && self.key_bits.len() >= self.key_length
        {
            let key: Vec<u8> = self.key_bits.drain(..self.key_length).collect();
            self.keys_left -= 1;
            self.keys_delivered += 1;
            info!(protocol = %self.name, "generated a sifted key");
            ctx.effects.push(Effect::PopKey { key, layer: 0 });
        }
        if self.keys_left == 0 {
            self.working = false;
        }
    }
}

/// Pairs two BB84 instances, fixing the alice/bob roles.
pub fn pair_bb84(sender: &mut Bb84, receiver: &mut Bb84) {
    sender.role = 0;
    receiver.role = 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use photonq_kernel::SimRng;

    #[test]
    fn detector_bank_bins_by_arrival_time() {
        let mut bank = QkdDetectorBank::new(1.0);
        let mut rng = SimRng::new(0);
        // 1 MHz → 1 µs pulse spacing, starting at t = 1000 ps.
        bank.configure(vec![0, 0, 0], 1_000, 1_000_000);

        bank.detect(0, 1, false, 1_000, &mut rng);
        bank.detect(0, 0, false, 1_001_000, &mut rng);

        let bits = bank.take_bits();
        assert_eq!(bits, vec![1, 0, -1]);
    }

    #[test]
    fn matching_basis_yields_faithful_bit() {
        let mut bank = QkdDetectorBank::new(1.0);
        let mut rng = SimRng::new(0);
        bank.configure(vec![1], 0, 1_000_000);
        bank.detect(1, 1, false, 0, &mut rng);
        assert_eq!(bank.take_bits(), vec![1]);
    }

    #[test]
    fn missed_detection_leaves_slot_invalid() {
        let mut bank = QkdDetectorBank::new(0.0);
        let mut rng = SimRng::new(0);
        bank.configure(vec![0], 0, 1_000_000);
        bank.detect(0, 1, false, 0, &mut rng);
        assert_eq!(bank.take_bits(), vec![-1]);
    }

    #[test]
    fn pairing_assigns_roles() {
        let mut alice = Bb84::new("a.BB84".into(), "b".into(), "b.BB84".into());
        let mut bob = Bb84::new("b.BB84".into(), "a".into(), "a.BB84".into());
        pair_bb84(&mut alice, &mut bob);
        assert_eq!(alice.role, 0);
        assert_eq!(bob.role, 1);
    }
}
