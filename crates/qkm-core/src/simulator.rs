//! Quantum channel simulator.
//!
//! Models one completed BB84-style agreement round between an initiator and
//! a responder and returns two bitwise-identical keys. The configured error
//! rate flips the responder's measurements before sifting; the statistics
//! report the observed disagreement, but the returned keys only contain
//! positions that agree after error correction.
//!
//! ## Round structure
//!
//! 1. The initiator draws random bits and bases; the responder draws bases.
//! 2. Matching bases keep the bit (subject to the channel flip); mismatched
//!    bases yield a random measurement.
//! 3. Sifting keeps positions where the bases matched.
//! 4. Parity bisection corrects the responder's sifted bits.
//! 5. Positions still disagreeing are discarded.
//!
//! Rounds repeat, oversampling the remaining deficit, until exactly the
//! requested number of agreed bits has accumulated.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::reconcile::{reconcile, DEFAULT_BLOCK_SIZE};
use crate::record::{bytes_for_bits, KeyMaterial};

/// Tuning knobs for the simulated channel.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Expected fraction of prepared qubits that survive sifting.
    pub efficiency: f64,
    /// Block size for the parity bisection pass.
    pub block_size: usize,
    /// Upper bound on oversampling rounds before giving up.
    pub max_rounds: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            efficiency: 0.5,
            block_size: DEFAULT_BLOCK_SIZE,
            max_rounds: 64,
        }
    }
}

/// Statistics from one simulated agreement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    /// Qubits prepared across all rounds.
    pub prepared_qubits: usize,
    /// Bits surviving basis sifting.
    pub sifted_bits: usize,
    /// Sifted positions that disagreed before correction.
    pub raw_errors: usize,
    /// Bits flipped by the parity bisection pass.
    pub corrected_errors: usize,
    /// Sifted positions dropped because they still disagreed.
    pub discarded_bits: usize,
    /// Oversampling rounds used.
    pub rounds: usize,
}

impl ChannelStats {
    /// Observed quantum bit error rate before correction.
    pub fn qber(&self) -> f64 {
        if self.sifted_bits == 0 {
            0.0
        } else {
            self.raw_errors as f64 / self.sifted_bits as f64
        }
    }
}

/// Output of a simulated session: both key halves and statistics.
#[derive(Debug)]
pub struct SimulatedSession {
    /// The initiator's agreed key.
    pub initiator_key: KeyMaterial,
    /// The responder's agreed key.
    pub responder_key: KeyMaterial,
    /// Agreed key length in bits.
    pub key_size_bits: usize,
    /// Channel statistics.
    pub stats: ChannelStats,
}

/// BB84-style channel simulator.
///
/// Seed it with [`ChannelSimulator::with_seed`] for reproducible tests.
pub struct ChannelSimulator {
    rng: StdRng,
    config: SimulatorConfig,
}

impl ChannelSimulator {
    /// Create a simulator seeded from OS entropy.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            config: SimulatorConfig::default(),
        }
    }

    /// Create a deterministic simulator.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            config: SimulatorConfig::default(),
        }
    }

    /// Replace the tuning configuration.
    pub fn with_config(mut self, config: SimulatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Run one agreement and return two identical `key_size_bits` keys.
    ///
    /// Fails with [`CoreError::AgreementFailure`] when `error_rate` is not
    /// in `[0, 0.5)`; at 0.5 or above the parties can never converge.
    pub fn generate_pair(&mut self, key_size_bits: usize, error_rate: f64) -> Result<SimulatedSession> {
        if key_size_bits == 0 {
            return Err(CoreError::InvalidSize(0));
        }
        if !(0.0..0.5).contains(&error_rate) {
            return Err(CoreError::AgreementFailure(format!(
                "error rate {error_rate} outside [0, 0.5)"
            )));
        }

        let mut stats = ChannelStats::default();
        let mut agreed_initiator: Vec<bool> = Vec::with_capacity(key_size_bits);
        let mut agreed_responder: Vec<bool> = Vec::with_capacity(key_size_bits);
        let efficiency = self.config.efficiency.clamp(0.05, 1.0);

        while agreed_initiator.len() < key_size_bits {
            if stats.rounds >= self.config.max_rounds {
                return Err(CoreError::AgreementFailure(format!(
                    "only {} of {} bits agreed after {} rounds",
                    agreed_initiator.len(),
                    key_size_bits,
                    stats.rounds
                )));
            }
            stats.rounds += 1;

            let deficit = key_size_bits - agreed_initiator.len();
            let prepared = (deficit as f64 / efficiency).ceil() as usize + self.config.block_size;
            stats.prepared_qubits += prepared;

            let (initiator_sift, mut responder_sift) = self.sifted_round(prepared, error_rate);
            stats.sifted_bits += initiator_sift.len();
            stats.raw_errors += count_mismatches(&initiator_sift, &responder_sift);

            stats.corrected_errors +=
                reconcile(&initiator_sift, &mut responder_sift, self.config.block_size);

            for (a, b) in initiator_sift.into_iter().zip(responder_sift) {
                if a != b {
                    stats.discarded_bits += 1;
                    continue;
                }
                if agreed_initiator.len() == key_size_bits {
                    break;
                }
                agreed_initiator.push(a);
                agreed_responder.push(b);
            }
        }

        Ok(SimulatedSession {
            initiator_key: KeyMaterial::new(pack_bits(&agreed_initiator)),
            responder_key: KeyMaterial::new(pack_bits(&agreed_responder)),
            key_size_bits,
            stats,
        })
    }

    /// Prepare, transmit, measure and sift `prepared` qubits.
    fn sifted_round(&mut self, prepared: usize, error_rate: f64) -> (Vec<bool>, Vec<bool>) {
        let mut initiator = Vec::with_capacity(prepared / 2 + 1);
        let mut responder = Vec::with_capacity(prepared / 2 + 1);

        for _ in 0..prepared {
            let bit: bool = self.rng.gen();
            let initiator_basis: bool = self.rng.gen();
            let responder_basis: bool = self.rng.gen();

            let flipped = self.rng.gen_bool(error_rate);
            let measured = if initiator_basis == responder_basis {
                bit ^ flipped
            } else {
                self.rng.gen()
            };

            if initiator_basis == responder_basis {
                initiator.push(bit);
                responder.push(measured);
            }
        }

        (initiator, responder)
    }
}

impl Default for ChannelSimulator {
    fn default() -> Self {
        Self::new()
    }
}

fn count_mismatches(a: &[bool], b: &[bool]) -> usize {
    a.iter().zip(b).filter(|(x, y)| x != y).count()
}

/// Pack bits MSB-first; a trailing partial byte is zero-padded.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bytes_for_bits(bits.len())];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            out[i / 8] |= 0x80 >> (i % 8);
        }
    }
    out
}

/// Unpack the first `limit` bits, MSB-first.
pub fn unpack_bits(bytes: &[u8], limit: usize) -> Vec<bool> {
    (0..limit.min(bytes.len() * 8))
        .map(|i| bytes[i / 8] & (0x80 >> (i % 8)) != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zero_error_pair_is_identical() {
        let mut sim = ChannelSimulator::with_seed(7);
        let session = sim.generate_pair(256, 0.0).unwrap();

        assert_eq!(session.initiator_key.len(), 32);
        assert_eq!(session.initiator_key, session.responder_key);
        assert_eq!(session.stats.raw_errors, 0);
        assert_eq!(session.stats.qber(), 0.0);
    }

    #[test]
    fn test_noisy_channel_still_agrees() {
        let mut sim = ChannelSimulator::with_seed(99);
        let session = sim.generate_pair(512, 0.2).unwrap();

        assert_eq!(session.initiator_key, session.responder_key);
        assert_eq!(session.initiator_key.len(), 64);
        assert!(session.stats.raw_errors > 0);
        assert!(session.stats.corrected_errors > 0);
        assert!(session.stats.qber() > 0.05);
    }

    #[test]
    fn test_error_rate_half_fails_fast() {
        let mut sim = ChannelSimulator::with_seed(1);
        assert!(matches!(
            sim.generate_pair(256, 0.5),
            Err(CoreError::AgreementFailure(_))
        ));
        assert!(matches!(
            sim.generate_pair(256, 0.9),
            Err(CoreError::AgreementFailure(_))
        ));
        assert!(matches!(
            sim.generate_pair(256, f64::NAN),
            Err(CoreError::AgreementFailure(_))
        ));
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut sim = ChannelSimulator::with_seed(1);
        assert!(matches!(sim.generate_pair(0, 0.0), Err(CoreError::InvalidSize(0))));
    }

    #[test]
    fn test_seeded_simulators_are_deterministic() {
        let a = ChannelSimulator::with_seed(42).generate_pair(128, 0.1).unwrap();
        let b = ChannelSimulator::with_seed(42).generate_pair(128, 0.1).unwrap();
        assert_eq!(a.initiator_key, b.initiator_key);
        assert_eq!(a.stats, b.stats);
    }

    #[test]
    fn test_round_budget_exhaustion() {
        let config = SimulatorConfig {
            max_rounds: 0,
            ..SimulatorConfig::default()
        };
        let mut sim = ChannelSimulator::with_seed(3).with_config(config);
        assert!(matches!(
            sim.generate_pair(64, 0.0),
            Err(CoreError::AgreementFailure(_))
        ));
    }

    #[test]
    fn test_pack_unpack() {
        let bits = vec![true, false, true, true, false, false, false, true, true];
        let packed = pack_bits(&bits);
        assert_eq!(packed, vec![0b1011_0001, 0b1000_0000]);
        assert_eq!(unpack_bits(&packed, 9), bits);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_keys_identical_and_exact_length(
            seed in any::<u64>(),
            bits in 1usize..600,
            error_rate in 0.0f64..0.45,
        ) {
            let mut sim = ChannelSimulator::with_seed(seed);
            let session = sim.generate_pair(bits, error_rate).unwrap();

            prop_assert_eq!(session.key_size_bits, bits);
            prop_assert_eq!(session.initiator_key.len(), bytes_for_bits(bits));
            prop_assert_eq!(&session.initiator_key, &session.responder_key);

            // Padding bits past the declared size stay zero.
            let unused = bytes_for_bits(bits) * 8 - bits;
            if unused > 0 {
                let last = *session.initiator_key.as_bytes().last().unwrap();
                prop_assert_eq!(last & ((1u8 << unused) - 1), 0);
            }
        }

        #[test]
        fn prop_error_rate_at_or_above_half_fails(
            seed in any::<u64>(),
            error_rate in 0.5f64..=1.0,
        ) {
            let mut sim = ChannelSimulator::with_seed(seed);
            prop_assert!(matches!(
                sim.generate_pair(128, error_rate),
                Err(CoreError::AgreementFailure(_))
            ));
        }
    }
}
