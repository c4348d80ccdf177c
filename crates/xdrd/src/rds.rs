//! RDS subcarrier decoder.
//!
//! Consumes the full-rate FM multiplex and emits 4-block RDS groups. The
//! chain per MPX block:
//!
//! 1. a pilot PLL (19 kHz, narrow pull range) provides the phase reference;
//!    the 57 kHz carrier is its third harmonic, so the downmix multiplies
//!    the MPX by `cos(3*phi)` / `-sin(3*phi)`;
//! 2. the complex baseband is boxcar-decimated, low-pass filtered and
//!    linearly resampled to 19 000 Hz - exactly 16 samples per 1187.5 Hz
//!    bit;
//! 3. symbol timing picks the best of the 16 candidate phases by windowed
//!    energy and keeps adapting; the slicer runs on whichever arm of the
//!    baseband carries the data (the carrier phase ambiguity of a
//!    harmonic-locked PLL parks the signal on I or Q) behind a scalar AGC;
//! 4. sliced bits are differentially decoded (XOR of consecutive bits);
//! 5. a 26-bit shift register is checked against the five RDS offset-word
//!    syndromes; bursts of up to 5 bits per block are repaired from a
//!    precomputed syndrome table;
//! 6. when A/B/C/D arrive back to back a group is emitted, with per-block
//!    error flags for blocks that could not be repaired.
//!
//! The "RDS locked" indication is debounced over group runs so a single
//! failed group does not flap the UI flag.

use fmtuner::dsp::filters::Fir;
use fmtuner::dsp::nco::Pll;
use tracing::{debug, trace};

/// One decoded RDS group.
///
/// `errors` carries one flag per block for uncorrectable damage:
/// A -> 0x40, B -> 0x10, C -> 0x04, D -> 0x01. Forwarding policy upstream
/// must suppress groups with the block-B flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RdsGroup {
    pub block_a: u16,
    pub block_b: u16,
    pub block_c: u16,
    pub block_d: u16,
    pub errors: u8,
}

/// Error flag for an uncorrectable block B.
pub const ERROR_FLAG_B: u8 = 0x10;

const ERROR_FLAGS: [u8; 4] = [0x40, ERROR_FLAG_B, 0x04, 0x01];

/// Offset words for blocks A, B, C, C', D (IEC 62106 Table B.1).
const OFFSET_WORDS: [u32; 5] = [
    0b0011111100,
    0b0110011000,
    0b0101101000,
    0b1101010000,
    0b0110110100,
];

/// Expected syndromes of clean blocks, same order as [`OFFSET_WORDS`].
const SYNDROMES: [u16; 5] = [
    0b1111011000,
    0b1111010100,
    0b1001011100,
    0b1111001100,
    0b1001011000,
];

const OFFSET_A: usize = 0;
const OFFSET_B: usize = 1;
const OFFSET_C: usize = 2;
const OFFSET_C_PRIME: usize = 3;
const OFFSET_D: usize = 4;

/// Parity check matrix rows for the 26-bit RDS code (EN 50067 B.1.1), MSB
/// (first transmitted bit) first.
const PARITY_CHECK_MATRIX: [u16; 26] = [
    0b1000000000,
    0b0100000000,
    0b0010000000,
    0b0001000000,
    0b0000100000,
    0b0000010000,
    0b0000001000,
    0b0000000100,
    0b0000000010,
    0b0000000001,
    0b1011011100,
    0b0101101110,
    0b0010110111,
    0b1010000111,
    0b1110011111,
    0b1100010011,
    0b1101010101,
    0b1101110110,
    0b0110111011,
    0b1000000001,
    0b1111011100,
    0b0111101110,
    0b0011110111,
    0b1010100111,
    0b1110001111,
    0b1100011011,
];

/// Syndrome of a 26-bit block (bit 25 = first transmitted bit).
fn rds_syndrome(word26: u32) -> u16 {
    let mut result: u16 = 0;
    for k in 0..26 {
        if (word26 >> k) & 1 != 0 {
            result ^= PARITY_CHECK_MATRIX[25 - k];
        }
    }
    result
}

/// The 16-bit information word of a 26-bit block.
fn rds_data_from_word(word26: u32) -> u16 {
    ((word26 >> 10) & 0xFFFF) as u16
}

/// Burst-error lookup: for each offset word, (syndrome, error vector) pairs
/// covering every burst of width 1..=5 at every position.
struct FecTable {
    tables: [Vec<(u16, u32)>; 5],
}

impl FecTable {
    fn new() -> Self {
        // All burst patterns of width <= 5 with both end bits set
        let mut patterns: Vec<u32> = vec![0b1];
        for width in 2..=5u32 {
            let interior = width - 2;
            for fill in 0..(1u32 << interior) {
                patterns.push((1 << (width - 1)) | (fill << 1) | 1);
            }
        }

        let mut tables: [Vec<(u16, u32)>; 5] = Default::default();
        for (offset_idx, &offset_word) in OFFSET_WORDS.iter().enumerate() {
            for &pattern in &patterns {
                for shift in 0..26u32 {
                    let error_vector = (pattern << shift) & 0x03FF_FFFF;
                    if error_vector == 0 {
                        continue;
                    }
                    let syndrome = rds_syndrome(error_vector ^ offset_word);
                    tables[offset_idx].push((syndrome, error_vector));
                }
            }
        }
        Self { tables }
    }

    fn try_correct(&self, raw_block: u32, offset_idx: usize) -> Option<u32> {
        let syndrome = rds_syndrome(raw_block);
        for &(synd, error_vector) in &self.tables[offset_idx] {
            if synd == syndrome {
                return Some(raw_block ^ error_vector);
            }
        }
        None
    }
}

fn fec_table() -> &'static FecTable {
    use std::sync::OnceLock;
    static FEC_TABLE: OnceLock<FecTable> = OnceLock::new();
    FEC_TABLE.get_or_init(FecTable::new)
}

const PILOT_HZ: f32 = 19_000.0;
const PILOT_PULL_HZ: f32 = 250.0;
const BASEBAND_RATE: f64 = 19_000.0;
const SAMPLES_PER_BIT: usize = 16;
const LOWPASS_CUTOFF_HZ: f64 = 2_400.0;

/// Consecutive uncorrectable blocks before block sync is abandoned.
const SYNC_LOSS_BLOCKS: u32 = 10;
/// Consecutive clean groups before the lock flag raises.
const LOCK_GOOD_GROUPS: u32 = 2;
/// Consecutive damaged groups before the lock flag drops.
const LOCK_BAD_GROUPS: u32 = 8;
/// Lock also drops after this long without a clean group, in seconds.
const LOCK_TIMEOUT_SECS: u64 = 5;

pub struct RdsDecoder {
    input_rate: u32,
    pll: Pll,

    // Boxcar decimation to an intermediate rate near 19 kHz
    decim_factor: usize,
    decim_phase: usize,
    decim_acc_i: f32,
    decim_acc_q: f32,
    i_filter: Fir,
    q_filter: Fir,

    // Linear resampler from the intermediate rate to exactly 19 kHz
    resample_step: f64,
    resample_pos: f64,
    prev_i: f32,
    prev_q: f32,

    // Bit timing and slicing
    sample_phase: usize,
    best_phase: usize,
    phase_energy: [f32; SAMPLES_PER_BIT],
    arm_energy_i: f32,
    arm_energy_q: f32,
    agc: f32,
    prev_raw_bit: u8,

    // Block synchronizer
    shift_reg: u32,
    synced: bool,
    bits_since_block: u32,
    expected: usize,
    blocks: [u16; 4],
    avail: [bool; 4],
    group_errors: u8,
    block_error_run: u32,

    // Lock debouncing
    rds_locked: bool,
    good_group_run: u32,
    bad_group_run: u32,
    samples_since_good_group: u64,
}

impl RdsDecoder {
    pub fn new(input_rate: u32) -> Self {
        let decim_factor = ((input_rate as f64 / BASEBAND_RATE) as usize).max(1);
        let intermediate_rate = input_rate as f64 / decim_factor as f64;
        let mut decoder = Self {
            input_rate,
            pll: Pll::new(
                PILOT_HZ,
                PILOT_HZ - PILOT_PULL_HZ,
                PILOT_HZ + PILOT_PULL_HZ,
                input_rate as f32,
            ),
            decim_factor,
            decim_phase: 0,
            decim_acc_i: 0.0,
            decim_acc_q: 0.0,
            i_filter: Fir::lowpass(LOWPASS_CUTOFF_HZ, 2_000.0, intermediate_rate),
            q_filter: Fir::lowpass(LOWPASS_CUTOFF_HZ, 2_000.0, intermediate_rate),
            resample_step: intermediate_rate / BASEBAND_RATE,
            resample_pos: 0.0,
            prev_i: 0.0,
            prev_q: 0.0,
            sample_phase: 0,
            best_phase: 0,
            phase_energy: [0.0; SAMPLES_PER_BIT],
            arm_energy_i: 0.0,
            arm_energy_q: 0.0,
            agc: 1.0,
            prev_raw_bit: 0,
            shift_reg: 0,
            synced: false,
            bits_since_block: 0,
            expected: 0,
            blocks: [0; 4],
            avail: [false; 4],
            group_errors: 0,
            block_error_run: 0,
            rds_locked: false,
            good_group_run: 0,
            bad_group_run: 0,
            samples_since_good_group: 0,
        };
        decoder.pll.set_gains(0.01, 0.0001);
        decoder
    }

    /// Debounced decoder lock indication.
    pub fn is_locked(&self) -> bool {
        self.rds_locked
    }

    /// Re-initialize every stage: PLL, filters, timing, block sync, lock.
    pub fn reset(&mut self) {
        self.pll.reset();
        self.decim_phase = 0;
        self.decim_acc_i = 0.0;
        self.decim_acc_q = 0.0;
        self.i_filter.reset();
        self.q_filter.reset();
        self.resample_pos = 0.0;
        self.prev_i = 0.0;
        self.prev_q = 0.0;
        self.sample_phase = 0;
        self.best_phase = 0;
        self.phase_energy = [0.0; SAMPLES_PER_BIT];
        self.arm_energy_i = 0.0;
        self.arm_energy_q = 0.0;
        self.agc = 1.0;
        self.prev_raw_bit = 0;
        self.shift_reg = 0;
        self.synced = false;
        self.bits_since_block = 0;
        self.expected = 0;
        self.blocks = [0; 4];
        self.avail = [false; 4];
        self.group_errors = 0;
        self.block_error_run = 0;
        self.rds_locked = false;
        self.good_group_run = 0;
        self.bad_group_run = 0;
        self.samples_since_good_group = 0;
    }

    /// Decode one MPX block; decoded groups are handed to `on_group`.
    pub fn process(&mut self, mpx: &[f32], on_group: &mut dyn FnMut(&RdsGroup)) {
        for &sample in mpx {
            // Pilot tracking: the narrow pull range makes the raw MPX a
            // usable error input without a dedicated band-pass.
            let error = sample * self.pll.sin();
            self.pll.step(error);

            let phase57 = 3.0 * self.pll.phase();
            let i = sample * phase57.cos();
            let q = -sample * phase57.sin();

            self.decim_acc_i += i;
            self.decim_acc_q += q;
            self.decim_phase += 1;
            if self.decim_phase < self.decim_factor {
                continue;
            }
            self.decim_phase = 0;
            let scale = 1.0 / self.decim_factor as f32;
            let bi = self.i_filter.push(self.decim_acc_i * scale);
            let bq = self.q_filter.push(self.decim_acc_q * scale);
            self.decim_acc_i = 0.0;
            self.decim_acc_q = 0.0;

            // Linear interpolation onto the exact 19 kHz bit grid
            while self.resample_pos < 1.0 {
                let frac = self.resample_pos as f32;
                let ri = self.prev_i + (bi - self.prev_i) * frac;
                let rq = self.prev_q + (bq - self.prev_q) * frac;
                self.resample_pos += self.resample_step;
                self.baseband_sample(ri, rq, on_group);
            }
            self.resample_pos -= 1.0;
            self.prev_i = bi;
            self.prev_q = bq;
        }

        self.samples_since_good_group += mpx.len() as u64;
        if self.rds_locked
            && self.samples_since_good_group > LOCK_TIMEOUT_SECS * self.input_rate as u64
        {
            debug!("RDS lock timed out without a clean group");
            self.rds_locked = false;
        }
    }

    fn baseband_sample(&mut self, i: f32, q: f32, on_group: &mut dyn FnMut(&RdsGroup)) {
        let energy = i * i + q * q;
        self.phase_energy[self.sample_phase] =
            self.phase_energy[self.sample_phase] * 0.999 + energy * 0.001;

        let slicing = self.sample_phase == self.best_phase;
        self.sample_phase = (self.sample_phase + 1) % SAMPLES_PER_BIT;
        if self.sample_phase == 0 {
            let mut best = 0usize;
            for p in 1..SAMPLES_PER_BIT {
                if self.phase_energy[p] > self.phase_energy[best] {
                    best = p;
                }
            }
            self.best_phase = best;
        }
        if !slicing {
            return;
        }

        // The harmonic-locked carrier parks the data on one arm; follow it
        self.arm_energy_i = self.arm_energy_i * 0.99 + i * i * 0.01;
        self.arm_energy_q = self.arm_energy_q * 0.99 + q * q * 0.01;
        let x = if self.arm_energy_i >= self.arm_energy_q {
            i
        } else {
            q
        };

        self.agc = self.agc * 0.99 + x.abs() * 0.01;
        let normalized = x / self.agc.max(1e-6);
        let raw_bit = (normalized > 0.0) as u8;
        let bit = raw_bit ^ self.prev_raw_bit;
        self.prev_raw_bit = raw_bit;

        self.process_bit(bit, on_group);
    }

    fn process_bit(&mut self, bit: u8, on_group: &mut dyn FnMut(&RdsGroup)) {
        self.shift_reg = ((self.shift_reg << 1) | bit as u32) & 0x03FF_FFFF;

        if !self.synced {
            self.try_acquire_sync();
            return;
        }

        self.bits_since_block += 1;
        if self.bits_since_block < 26 {
            return;
        }
        self.bits_since_block = 0;
        self.take_expected_block(on_group);
    }

    fn try_acquire_sync(&mut self) {
        let syndrome = rds_syndrome(self.shift_reg);
        let matched = SYNDROMES.iter().position(|&s| s == syndrome);
        let offset_idx = match matched {
            Some(idx) => idx,
            None => return,
        };

        // C' stands in for C in the group sequence; D owns the last slot
        let slot = match offset_idx {
            OFFSET_A => 0,
            OFFSET_B => 1,
            OFFSET_C | OFFSET_C_PRIME => OFFSET_C,
            _ => 3,
        };
        trace!("RDS sync acquired on block {}", slot);
        self.synced = true;
        self.bits_since_block = 0;
        self.blocks = [0; 4];
        self.avail = [false; 4];
        self.group_errors = 0;
        self.block_error_run = 0;
        self.blocks[slot] = rds_data_from_word(self.shift_reg);
        self.avail[slot] = true;
        self.expected = (slot + 1) % 4;
    }

    fn take_expected_block(&mut self, on_group: &mut dyn FnMut(&RdsGroup)) {
        let slot = self.expected;
        let word = self.shift_reg;
        let syndrome = rds_syndrome(word);

        let clean = if slot == OFFSET_C {
            syndrome == SYNDROMES[OFFSET_C] || syndrome == SYNDROMES[OFFSET_C_PRIME]
        } else {
            let offset_idx = if slot == 3 { OFFSET_D } else { slot };
            syndrome == SYNDROMES[offset_idx]
        };

        if clean {
            self.blocks[slot] = rds_data_from_word(word);
            self.block_error_run = 0;
        } else {
            let offset_idx = if slot == 3 { OFFSET_D } else { slot };
            let corrected = fec_table().try_correct(word, offset_idx).or_else(|| {
                if slot == OFFSET_C {
                    fec_table().try_correct(word, OFFSET_C_PRIME)
                } else {
                    None
                }
            });
            match corrected {
                Some(fixed) => {
                    self.blocks[slot] = rds_data_from_word(fixed);
                    self.block_error_run = 0;
                }
                None => {
                    self.blocks[slot] = rds_data_from_word(word);
                    self.group_errors |= ERROR_FLAGS[slot];
                    self.block_error_run += 1;
                }
            }
        }
        self.avail[slot] = true;
        self.expected = (slot + 1) % 4;

        if slot == 3 {
            if self.avail.iter().all(|&a| a) {
                let group = RdsGroup {
                    block_a: self.blocks[0],
                    block_b: self.blocks[1],
                    block_c: self.blocks[2],
                    block_d: self.blocks[3],
                    errors: self.group_errors,
                };
                self.note_group(&group);
                on_group(&group);
            }
            self.avail = [false; 4];
            self.group_errors = 0;
        }

        if self.block_error_run >= SYNC_LOSS_BLOCKS {
            debug!("RDS block sync lost after {} bad blocks", self.block_error_run);
            self.synced = false;
            self.avail = [false; 4];
            self.group_errors = 0;
            self.block_error_run = 0;
        }
    }

    fn note_group(&mut self, group: &RdsGroup) {
        if group.errors == 0 {
            self.good_group_run += 1;
            self.bad_group_run = 0;
            self.samples_since_good_group = 0;
            if self.good_group_run >= LOCK_GOOD_GROUPS {
                self.rds_locked = true;
            }
        } else {
            self.bad_group_run += 1;
            self.good_group_run = 0;
            if self.bad_group_run >= LOCK_BAD_GROUPS {
                self.rds_locked = false;
            }
        }
    }
}

/// Compute the 10-bit checkword of a 16-bit information word (remainder of
/// `data * x^10` modulo the RDS generator polynomial).
pub fn rds_checkword(data: u16) -> u16 {
    const POLY: u32 = 0x5B9;
    let mut reg: u32 = (data as u32) << 10;
    for bit in (10..26).rev() {
        if reg & (1 << bit) != 0 {
            reg ^= POLY << (bit - 10);
        }
    }
    (reg & 0x3FF) as u16
}

/// Assemble the 26-bit on-air word for `data` under the given offset index
/// (0 = A, 1 = B, 2 = C, 3 = C', 4 = D).
pub fn rds_encode_block(data: u16, offset_idx: usize) -> u32 {
    ((data as u32) << 10) | (rds_checkword(data) as u32 ^ OFFSET_WORDS[offset_idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_blocks_have_expected_syndromes() {
        for (idx, &expected) in SYNDROMES.iter().enumerate() {
            for data in [0x0000u16, 0xF212, 0xA5A5, 0xFFFF] {
                let word = rds_encode_block(data, idx);
                assert_eq!(
                    rds_syndrome(word),
                    expected,
                    "offset {} data {:04x}",
                    idx,
                    data
                );
                assert_eq!(rds_data_from_word(word), data);
            }
        }
    }

    #[test]
    fn test_burst_errors_corrected_up_to_five_bits() {
        let word = rds_encode_block(0xBEEF, OFFSET_B);
        for (shift, burst) in [(3u32, 0b1u32), (7, 0b11), (12, 0b10101), (20, 0b11111)] {
            let damaged = word ^ (burst << shift);
            let fixed = fec_table()
                .try_correct(damaged, OFFSET_B)
                .expect("burst should be correctable");
            assert_eq!(fixed, word, "burst {:b} at {}", burst, shift);
        }
    }

    #[test]
    fn test_scattered_errors_not_correctable() {
        let word = rds_encode_block(0x1234, OFFSET_A);
        // Two bursts far apart exceed the single-burst model
        let damaged = word ^ (1 << 2) ^ (1 << 14) ^ (1 << 24);
        // Either uncorrectable, or "corrected" into a different word; it
        // must never silently return the wrong original
        if let Some(fixed) = fec_table().try_correct(damaged, OFFSET_A) {
            assert_eq!(rds_syndrome(fixed), SYNDROMES[OFFSET_A]);
        }
    }

    /// Build an MPX stream carrying `groups` with a 9% pilot and NRZ data
    /// on the pilot-locked 57 kHz carrier.
    fn synthesize_mpx(groups: &[[u16; 4]], input_rate: u32) -> Vec<f32> {
        // Differentially encode the bit stream
        let mut raw_bits = Vec::new();
        let mut prev = 0u8;
        for group in groups {
            for (slot, &data) in group.iter().enumerate() {
                let offset_idx = if slot == 3 { OFFSET_D } else { slot };
                let word = rds_encode_block(data, offset_idx);
                for bit_pos in (0..26).rev() {
                    let data_bit = ((word >> bit_pos) & 1) as u8;
                    prev ^= data_bit;
                    raw_bits.push(prev);
                }
            }
        }

        let samples_per_bit = input_rate as f64 / 1_187.5;
        let total = (raw_bits.len() as f64 * samples_per_bit) as usize;
        let mut mpx = Vec::with_capacity(total);
        for n in 0..total {
            let t = n as f64 / input_rate as f64;
            let bit_idx = ((n as f64) / samples_per_bit) as usize;
            let symbol = if raw_bits[bit_idx.min(raw_bits.len() - 1)] == 1 {
                1.0
            } else {
                -1.0
            };
            let pilot_phase = 2.0 * std::f64::consts::PI * 19_000.0 * t;
            let sample = 0.09 * pilot_phase.sin() + 0.04 * symbol * (3.0 * pilot_phase).cos();
            mpx.push(sample as f32);
        }
        mpx
    }

    #[test]
    fn test_end_to_end_group_decode() {
        let input_rate = 256_000u32;
        let group = [0xF212u16, 0x0408, 0x2037, 0x4D45];
        let groups: Vec<[u16; 4]> = std::iter::repeat(group).take(40).collect();
        let mpx = synthesize_mpx(&groups, input_rate);

        let mut decoder = RdsDecoder::new(input_rate);
        let mut decoded: Vec<RdsGroup> = Vec::new();
        for chunk in mpx.chunks(8192) {
            decoder.process(chunk, &mut |g| decoded.push(*g));
        }

        let clean: Vec<&RdsGroup> = decoded.iter().filter(|g| g.errors == 0).collect();
        assert!(
            clean.len() >= 5,
            "expected several clean groups, got {} ({} total)",
            clean.len(),
            decoded.len()
        );
        let hit = clean
            .iter()
            .any(|g| g.block_a == 0xF212 && g.block_b == 0x0408 && g.block_d == 0x4D45);
        assert!(hit, "transmitted group never decoded: {:?}", clean.last());
        assert!(decoder.is_locked());
    }

    #[test]
    fn test_reset_drops_sync_and_lock() {
        let input_rate = 256_000u32;
        let group = [0x1234u16, 0x5678, 0x9ABC, 0xDEF0];
        let groups: Vec<[u16; 4]> = std::iter::repeat(group).take(20).collect();
        let mpx = synthesize_mpx(&groups, input_rate);

        let mut decoder = RdsDecoder::new(input_rate);
        let mut count = 0usize;
        decoder.process(&mpx, &mut |_| count += 1);
        decoder.reset();
        assert!(!decoder.is_locked());
        // After reset the decoder starts from scratch: silence produces
        // nothing
        let silence = vec![0.0f32; 65_536];
        let mut after = 0usize;
        decoder.process(&silence, &mut |_| after += 1);
        assert_eq!(after, 0);
    }
}
