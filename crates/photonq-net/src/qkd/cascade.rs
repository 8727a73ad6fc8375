//! Cascade error correction.
//!
//! Sits above BB84. The first sifted key is disclosed outright so bob can
//! estimate the channel error rate and size the first-pass blocks; every
//! later key is corrected interactively: alice sends per-pass block
//! checksums, bob binary-searches each mismatched block over the classical
//! channel and flips the offending bit, re-checking all passes after every
//! correction (the cascade effect). A key with no remaining mismatches is
//! delivered to both key managers.
//!
//! Pass permutations are derived deterministically from (key id, pass), so
//! the two sides always agree on block membership without exchanging them.

use photonq_kernel::SimRng;
use tracing::{debug, info};

use crate::effects::Effect;
use crate::message::{Message, MessageBody};
use crate::qkd::QkdCtx;

/// Messages exchanged by cascade protocol instances.
#[derive(Debug, Clone)]
pub enum CascadeMessage {
    /// Alice → bob: disclosed estimation key.
    Key {
        /// The key bits.
        key: Vec<u8>,
    },
    /// Bob → alice: negotiated parameters from the estimated error rate.
    Params {
        /// First-pass block size.
        k: usize,
    },
    /// Alice → bob: per-pass block checksums for one key.
    Checksums {
        /// Key index.
        key_id: usize,
        /// `checksums[pass][block]` parities.
        checksums: Vec<Vec<u8>>,
    },
    /// Bob → alice: request the parity of a range (binary search step).
    SendForBinary {
        /// Key index.
        key_id: usize,
        /// Pass whose permutation orders the range.
        pass_id: usize,
        /// Range start (inclusive, permuted positions).
        start: usize,
        /// Range end (exclusive).
        end: usize,
    },
    /// Alice → bob: the requested parity.
    ReceiveForBinary {
        /// Key index.
        key_id: usize,
        /// Pass whose permutation orders the range.
        pass_id: usize,
        /// Range start (inclusive).
        start: usize,
        /// Range end (exclusive).
        end: usize,
        /// Parity of alice's bits over the range.
        checksum: u8,
    },
    /// Alice → bob: announce an upcoming batch.
    GenerateKey {
        /// Key length in bits.
        keylen: usize,
        /// Number of keys.
        frame_num: usize,
    },
    /// Bob → alice: a key matches on every pass.
    KeyIsValid {
        /// Key index.
        key_id: usize,
    },
}

/// Per-key correction state on the bob side.
#[derive(Debug, Clone, Default)]
struct KeyCorrection {
    /// Alice's checksums, once received.
    alice_checksums: Option<Vec<Vec<u8>>>,
    /// Binary search interval currently being narrowed: (pass, lo, hi).
    search: Option<(usize, usize, usize)>,
    /// Key already delivered upward.
    done: bool,
}

/// Cascade protocol instance (one per QKD node).
#[derive(Debug)]
pub struct Cascade {
    /// Protocol instance name (`<node>.cascade`).
    pub name: String,
    /// 0 = alice, 1 = bob, -1 = unpaired.
    pub role: i8,
    /// Peer node name.
    pub peer_node: String,
    /// Peer protocol name.
    pub peer_protocol: String,
    /// Number of cascade passes.
    pub w: usize,
    /// First-pass block size (from the error estimate).
    pub k1: usize,
    /// 0 = estimating, 1 = correcting.
    pub state: u8,
    /// Key length of the current batch.
    pub key_length: usize,
    /// Keys requested by the upper layer.
    pub frame_num: usize,
    /// Working keys by id (bob's copies carry channel errors).
    keys: Vec<Vec<u8>>,
    /// Estimation key (first key popped from BB84).
    estimation_key: Option<Vec<u8>>,
    /// Bob-side correction state per key.
    corrections: Vec<KeyCorrection>,
    /// Keys validated and delivered.
    pub valid_key_count: u64,
    /// Parity bits disclosed during correction (privacy accounting).
    pub disclosed_bits: u64,
}

impl Cascade {
    /// Creates an unpaired cascade instance.
    pub fn new(name: String, peer_node: String, peer_protocol: String) -> Self {
        Self {
            name,
            role: -1,
            peer_node,
            peer_protocol,
            w: 4,
            k1: 0,
            state: 0,
            key_length: 0,
            frame_num: 0,
            keys: Vec::new(),
            estimation_key: None,
            corrections: Vec::new(),
            valid_key_count: 0,
            disclosed_bits: 0,
        }
    }

    /// Receives a key request from the key manager (alice only).
    ///
    /// Requests one extra key from BB84 for the error estimate.
    pub fn push(&mut self, key_length: usize, key_count: usize, ctx: &mut QkdCtx<'_>) {
        assert_eq!(self.role, 0, "cascade requests must start at alice");
        info!(protocol = %self.name, key_length, key_count, "cascade request");

        self.key_length = key_length;
        self.frame_num = key_count;

        ctx.send(
            self.peer_node.clone(),
            Message::to_protocol(
                self.peer_protocol.clone(),
                MessageBody::Cascade(CascadeMessage::GenerateKey {
                    keylen: key_length,
                    frame_num: key_count,
                }),
            ),
        );
        ctx.effects.push(Effect::PushKeyRequest {
            key_length,
            key_count: key_count + 1,
        });
    }

    /// Receives a sifted key from BB84.
    pub fn pop(&mut self, key: Vec<u8>, ctx: &mut QkdCtx<'_>) {
        if self.estimation_key.is_none() {
            self.estimation_key = Some(key.clone());
            if self.role == 0 {
                // Disclose the estimation key so bob can measure the error
                // rate.
                ctx.send(
                    self.peer_node.clone(),
                    Message::to_protocol(
                        self.peer_protocol.clone(),
                        MessageBody::Cascade(CascadeMessage::Key { key }),
                    ),
                );
            }
            return;
        }

        let key_id = self.keys.len();
        self.keys.push(key);
        self.corrections.push(KeyCorrection::default());

        if self.role == 0 && self.state == 1 {
            self.send_checksums(key_id, ctx);
        }
    }

    /// Handles an incoming cascade message.
    pub fn received_message(&mut self, src: &str, msg: &CascadeMessage, ctx: &mut QkdCtx<'_>) {
        if src != self.peer_node {
            return;
        }
        match msg {
            CascadeMessage::GenerateKey { keylen, frame_num } => {
                self.key_length = *keylen;
                self.frame_num = *frame_num;
            }

            CascadeMessage::Key { key } => {
                // Bob: estimate the error rate and negotiate block size.
                let own = self
                    .estimation_key
                    .take()
                    .expect("estimation key popped before disclosure arrives");
                let errors = own
                    .iter()
                    .zip(key)
                    .filter(|(a, b)| a != b)
                    .count();
                let error_rate = errors as f64 / own.len().max(1) as f64;
                self.k1 = first_block_size(error_rate, self.key_length);
                self.state = 1;
                info!(protocol = %self.name, error_rate, k1 = self.k1, "cascade parameters");

                ctx.send(
                    self.peer_node.clone(),
                    Message::to_protocol(
                        self.peer_protocol.clone(),
                        MessageBody::Cascade(CascadeMessage::Params { k: self.k1 }),
                    ),
                );
            }

            CascadeMessage::Params { k } => {
                // Alice: parameters fixed; checksum every banked key.
                self.k1 = *k;
                self.state = 1;
                for key_id in 0..self.keys.len() {
                    self.send_checksums(key_id, ctx);
                }
            }

            CascadeMessage::Checksums { key_id, checksums } => {
                if *key_id >= self.keys.len() {
                    return;
                }
                self.corrections[*key_id].alice_checksums = Some(checksums.clone());
                self.advance_correction(*key_id, ctx);
            }

            CascadeMessage::SendForBinary {
                key_id,
                pass_id,
                start,
                end,
            } => {
                // Alice: answer with the parity of the requested range.
                let Some(key) = self.keys.get(*key_id) else {
                    return;
                };
                let order = pass_order(*key_id, *pass_id, key.len());
                let checksum = range_parity(key, &order, *start, *end);
                self.disclosed_bits += 1;
                ctx.send(
                    self.peer_node.clone(),
                    Message::to_protocol(
                        self.peer_protocol.clone(),
                        MessageBody::Cascade(CascadeMessage::ReceiveForBinary {
                            key_id: *key_id,
                            pass_id: *pass_id,
                            start: *start,
                            end: *end,
                            checksum,
                        }),
                    ),
                );
            }

            CascadeMessage::ReceiveForBinary {
                key_id,
                pass_id,
                start,
                end,
                checksum,
            } => {
                self.binary_step(*key_id, *pass_id, *start, *end, *checksum, ctx);
            }

            CascadeMessage::KeyIsValid { key_id } => {
                // Alice: her copy is the reference; deliver it.
                if *key_id < self.keys.len() && !self.corrections[*key_id].done {
                    self.corrections[*key_id].done = true;
                    self.valid_key_count += 1;
                    ctx.effects.push(Effect::PopKey {
                        key: self.keys[*key_id].clone(),
                        layer: 1,
                    });
                }
            }
        }
    }

    /// Alice: computes and sends the per-pass checksums for a key.
    fn send_checksums(&mut self, key_id: usize, ctx: &mut QkdCtx<'_>) {
        let key = &self.keys[key_id];
        let checksums = all_checksums(key, key_id, self.k1, self.w);
        ctx.send(
            self.peer_node.clone(),
            Message::to_protocol(
                self.peer_protocol.clone(),
                MessageBody::Cascade(CascadeMessage::Checksums { key_id, checksums }),
            ),
        );
    }

    /// Bob: finds the next mismatched block and either finishes the key or
    /// opens a binary search on it.
    fn advance_correction(&mut self, key_id: usize, ctx: &mut QkdCtx<'_>) {
        let Some(alice) = self.corrections[key_id].alice_checksums.clone() else {
            return;
        };
        let own = all_checksums(&self.keys[key_id], key_id, self.k1, self.w);

        let mut mismatch = None;
        'passes: for (pass_index, (own_pass, alice_pass)) in own.iter().zip(&alice).enumerate() {
            for (block, (own_sum, alice_sum)) in own_pass.iter().zip(alice_pass).enumerate() {
                if own_sum != alice_sum {
                    mismatch = Some((pass_index + 1, block));
                    break 'passes;
                }
            }
        }

        match mismatch {
            None => {
                if !self.corrections[key_id].done {
                    self.corrections[key_id].done = true;
                    self.valid_key_count += 1;
                    debug!(protocol = %self.name, key_id, "key corrected");
                    ctx.send(
                        self.peer_node.clone(),
                        Message::to_protocol(
                            self.peer_protocol.clone(),
                            MessageBody::Cascade(CascadeMessage::KeyIsValid { key_id }),
                        ),
                    );
                    ctx.effects.push(Effect::PopKey {
                        key: self.keys[key_id].clone(),
                        layer: 1,
                    });
                }
            }
            Some((pass, block)) => {
                let len = self.keys[key_id].len();
                let block_size = block_size_for_pass(self.k1, pass, len);
                let lo = block * block_size;
                let hi = (lo + block_size).min(len);
                if hi - lo == 1 {
                    // Single-bit block: the differing bit is known outright.
                    self.flip_bit(key_id, pass, lo);
                    self.advance_correction(key_id, ctx);
                } else {
                    self.corrections[key_id].search = Some((pass, lo, hi));
                    self.request_left_half(key_id, pass, lo, hi, ctx);
                }
            }
        }
    }

    /// Bob: one binary-search narrowing step from alice's range parity.
    fn binary_step(
        &mut self,
        key_id: usize,
        pass_id: usize,
        start: usize,
        end: usize,
        alice_parity: u8,
        ctx: &mut QkdCtx<'_>,
    ) {
        let Some((pass, lo, hi)) = self.corrections.get(key_id).and_then(|c| c.search) else {
            return;
        };
        debug_assert_eq!(pass, pass_id);

        let order = pass_order(key_id, pass_id, self.keys[key_id].len());
        let own_parity = range_parity(&self.keys[key_id], &order, start, end);

        // The queried range is the left half of (lo, hi); the error sits in
        // whichever half disagrees.
        let (new_lo, new_hi) = if own_parity != alice_parity {
            (start, end)
        } else {
            (end, hi)
        };
        let _ = lo;

        if new_hi - new_lo == 1 {
            self.flip_bit(key_id, pass_id, new_lo);
            self.corrections[key_id].search = None;
            self.advance_correction(key_id, ctx);
        } else {
            self.corrections[key_id].search = Some((pass_id, new_lo, new_hi));
            self.request_left_half(key_id, pass_id, new_lo, new_hi, ctx);
        }
    }

    fn request_left_half(
        &mut self,
        key_id: usize,
        pass_id: usize,
        lo: usize,
        hi: usize,
        ctx: &mut QkdCtx<'_>,
    ) {
        let mid = (lo + hi) / 2;
        ctx.send(
            self.peer_node.clone(),
            Message::to_protocol(
                self.peer_protocol.clone(),
                MessageBody::Cascade(CascadeMessage::SendForBinary {
                    key_id,
                    pass_id,
                    start: lo,
                    end: mid,
                }),
            ),
        );
    }

    /// Flips the bob bit at a permuted position.
    fn flip_bit(&mut self, key_id: usize, pass_id: usize, position: usize) {
        let order = pass_order(key_id, pass_id, self.keys[key_id].len());
        let raw = order[position];
        self.keys[key_id][raw] ^= 1;
    }
}

/// Pairs two cascade instances, fixing the alice/bob roles.
pub fn pair_cascade(sender: &mut Cascade, receiver: &mut Cascade) {
    sender.role = 0;
    receiver.role = 1;
}

// ============================================================================
// Block arithmetic
// ============================================================================

/// First-pass block size from the estimated error rate (≈ 0.73 / ε).
fn first_block_size(error_rate: f64, key_length: usize) -> usize {
    if error_rate <= f64::EPSILON {
        return key_length.max(1);
    }
    ((0.73 / error_rate).ceil() as usize).clamp(1, key_length.max(1))
}

/// Block size for a pass (doubles each pass, capped at the key length).
fn block_size_for_pass(k1: usize, pass: usize, key_length: usize) -> usize {
    (k1 << (pass - 1)).min(key_length.max(1))
}

/// Deterministic per-pass bit order shared by both sides. Pass 1 is the
/// identity; later passes shuffle with a generator derived from
/// (key id, pass).
fn pass_order(key_id: usize, pass: usize, len: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if pass <= 1 || len < 2 {
        return order;
    }
    let mut rng = SimRng::for_entity(
        ((key_id as u64) << 8) ^ (pass as u64),
        "cascade.pass.shuffle",
    );
    for i in (1..len).rev() {
        let j = rng.gen_range(i as u64 + 1) as usize;
        order.swap(i, j);
    }
    order
}

/// Parity of `key` over permuted positions `[start, end)`.
fn range_parity(key: &[u8], order: &[usize], start: usize, end: usize) -> u8 {
    order[start..end.min(order.len())]
        .iter()
        .fold(0u8, |acc, i| acc ^ key[*i])
}

/// All pass checksums for a key.
fn all_checksums(key: &[u8], key_id: usize, k1: usize, passes: usize) -> Vec<Vec<u8>> {
    let len = key.len();
    let mut out = Vec::with_capacity(passes);
    for pass in 1..=passes {
        let order = pass_order(key_id, pass, len);
        let block_size = block_size_for_pass(k1, pass, len);
        let mut sums = Vec::new();
        let mut lo = 0;
        while lo < len {
            let hi = (lo + block_size).min(len);
            sums.push(range_parity(key, &order, lo, hi));
            lo = hi;
        }
        out.push(sums);
    }
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_orders_agree_and_permute() {
        let a = pass_order(3, 2, 64);
        let b = pass_order(3, 2, 64);
        assert_eq!(a, b, "both sides derive the same order");
        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..64).collect::<Vec<_>>());
        assert_ne!(a, (0..64).collect::<Vec<_>>(), "pass 2 shuffles");
    }

    #[test]
    fn first_pass_is_identity() {
        assert_eq!(pass_order(0, 1, 8), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn checksum_mismatch_localizes_error() {
        let k1 = 4;
        let alice_key = vec![0u8; 16];
        let mut bob_key = alice_key.clone();
        bob_key[6] ^= 1;

        let alice_sums = all_checksums(&alice_key, 0, k1, 4);
        let bob_sums = all_checksums(&bob_key, 0, k1, 4);

        // Pass 1, block 1 (bits 4..8) must disagree.
        assert_ne!(alice_sums[0][1], bob_sums[0][1]);
        assert_eq!(alice_sums[0][0], bob_sums[0][0]);
    }

    #[test]
    fn block_size_doubles_and_caps() {
        assert_eq!(block_size_for_pass(4, 1, 128), 4);
        assert_eq!(block_size_for_pass(4, 2, 128), 8);
        assert_eq!(block_size_for_pass(4, 4, 128), 32);
        assert_eq!(block_size_for_pass(64, 3, 128), 128);
    }

    #[test]
    fn zero_error_rate_uses_whole_key_blocks() {
        assert_eq!(first_block_size(0.0, 128), 128);
        // ~3% error → blocks around 25 bits.
        let k = first_block_size(0.03, 128);
        assert!((20..=30).contains(&k), "k1 = {k}");
    }

    #[test]
    fn range_parity_is_xor_over_permutation() {
        let key = vec![1, 0, 1, 1];
        let order = vec![3, 2, 1, 0];
        assert_eq!(range_parity(&key, &order, 0, 2), 0); // bits 3,2 → 1^1
        assert_eq!(range_parity(&key, &order, 0, 4), 1);
    }
}
