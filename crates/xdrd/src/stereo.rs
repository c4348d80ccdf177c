//! Pilot-tracking stereo decoder.
//!
//! The 19 kHz pilot is isolated with a band-pass filter and tracked by a
//! second-order PLL; the doubled oscillator phase coherently demultiplexes
//! the 38 kHz L-R subcarrier. The direct MPX path runs through a delay line
//! of half the pilot filter latency so both paths line up at the matrix.
//!
//! Stereo separation is blended rather than switched: the blend target is
//! the product of four quality factors (pilot magnitude, pilot-to-MPX
//! ratio, pilot coherence against the band magnitude, and PLL frequency
//! error), each linear between its hold and acquire thresholds. The target
//! is capped at 1.0 once the decoder is locked and at 0.50 before lock, and
//! the blend follows it with a 30 ms attack and 120 ms release. The
//! user-visible stereo flag is debounced separately (10 blocks to acquire,
//! 18 to drop) so it does not flap on fades.

use fmtuner::dsp::filters::Fir;
use fmtuner::dsp::nco::Pll;

const PILOT_HZ: f32 = 19_000.0;
const PILOT_PULL_HZ: f32 = 250.0;
const PLL_ALPHA: f32 = 0.01;
const PLL_BETA: f32 = 0.0001;

const PILOT_ACQUIRE_BLOCKS: u32 = 10;
const PILOT_LOSS_BLOCKS: u32 = 18;

const PILOT_ABS_ACQUIRE: f32 = 0.0028;
const PILOT_ABS_HOLD: f32 = 0.0018;
const PILOT_RATIO_ACQUIRE: f32 = 0.060;
const PILOT_RATIO_HOLD: f32 = 0.035;
const PILOT_COHERENCE_ACQUIRE: f32 = 0.25;
const PILOT_COHERENCE_HOLD: f32 = 0.16;
const PLL_LOCK_ACQUIRE_HZ: f32 = 120.0;
const PLL_LOCK_HOLD_HZ: f32 = 220.0;
const MPX_MIN_ACQUIRE: f32 = 0.008;
const MPX_MIN_HOLD: f32 = 0.004;

const MATRIX_SCALE: f32 = 0.5;
const PRELOCK_BLEND_CAP: f32 = 0.50;

#[inline]
fn quality_factor(value: f32, hold: f32, acquire: f32) -> f32 {
    ((value - hold) / (acquire - hold).max(1e-4)).clamp(0.0, 1.0)
}

pub struct StereoDecoder {
    input_rate: u32,
    downsample_factor: usize,

    pll: Pll,
    pilot_filter: Fir,
    left_filter: Fir,
    right_filter: Fir,

    delay_line: Vec<f32>,
    delay_pos: usize,

    // Envelope trackers feeding the pilot-present predicate
    pilot_band_magnitude: f32,
    mpx_magnitude: f32,
    pilot_i: f32,
    pilot_q: f32,
    pilot_magnitude: f32,

    stereo_blend: f32,
    blend_attack: f32,
    blend_release: f32,

    stereo_detected: bool,
    pilot_count: u32,
    pilot_loss_count: u32,
    pilot_level_tenths_khz: i32,

    force_mono: bool,
    decim_phase: usize,
    deemph_alpha: f32,
    deemph_enabled: bool,
    deemph_left: f32,
    deemph_right: f32,
}

impl StereoDecoder {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        let fs = input_rate as f32;
        let pilot_filter = Fir::bandpass(18_750.0, 19_250.0, 3_000.0, input_rate as f64);
        // Align the direct MPX path with the pilot filter latency
        let delay_samples = (pilot_filter.len() - 1) / 2 + 1;

        let mut decoder = Self {
            input_rate,
            downsample_factor: (input_rate / output_rate).max(1) as usize,
            pll: Pll::new(
                PILOT_HZ,
                PILOT_HZ - PILOT_PULL_HZ,
                PILOT_HZ + PILOT_PULL_HZ,
                fs,
            ),
            pilot_filter,
            left_filter: Fir::lowpass(15_000.0, 4_000.0, input_rate as f64),
            right_filter: Fir::lowpass(15_000.0, 4_000.0, input_rate as f64),
            delay_line: vec![0.0; delay_samples + 1],
            delay_pos: 0,
            pilot_band_magnitude: 0.0,
            mpx_magnitude: 0.0,
            pilot_i: 0.0,
            pilot_q: 0.0,
            pilot_magnitude: 0.0,
            stereo_blend: 0.0,
            blend_attack: 1.0 - (-1.0 / (0.030 * fs)).exp(),
            blend_release: 1.0 - (-1.0 / (0.120 * fs)).exp(),
            stereo_detected: false,
            pilot_count: 0,
            pilot_loss_count: 0,
            pilot_level_tenths_khz: 0,
            force_mono: false,
            decim_phase: 0,
            deemph_alpha: 1.0,
            deemph_enabled: true,
            deemph_left: 0.0,
            deemph_right: 0.0,
        };
        decoder.pll.set_gains(PLL_ALPHA, PLL_BETA);
        decoder.set_deemphasis(75);
        decoder
    }

    /// Re-initialize filter history, PLL phase, blend and detection state.
    pub fn reset(&mut self) {
        self.pll.reset();
        self.pilot_filter.reset();
        self.left_filter.reset();
        self.right_filter.reset();
        self.delay_line.iter_mut().for_each(|d| *d = 0.0);
        self.delay_pos = 0;
        self.pilot_band_magnitude = 0.0;
        self.mpx_magnitude = 0.0;
        self.pilot_i = 0.0;
        self.pilot_q = 0.0;
        self.pilot_magnitude = 0.0;
        self.stereo_blend = 0.0;
        self.stereo_detected = false;
        self.pilot_count = 0;
        self.pilot_loss_count = 0;
        self.pilot_level_tenths_khz = 0;
        self.decim_phase = 0;
        self.deemph_left = 0.0;
        self.deemph_right = 0.0;
    }

    pub fn set_force_mono(&mut self, force: bool) {
        self.force_mono = force;
    }

    /// Output deemphasis; `tau_us <= 0` bypasses it.
    pub fn set_deemphasis(&mut self, tau_us: i32) {
        if tau_us <= 0 {
            self.deemph_enabled = false;
            self.deemph_alpha = 1.0;
            return;
        }
        self.deemph_enabled = true;
        let tau = tau_us as f32 * 1e-6;
        let output_rate = self.input_rate as f32 / self.downsample_factor as f32;
        let dt = 1.0 / output_rate;
        self.deemph_alpha = dt / (tau + dt);
    }

    /// Debounced stereo indication.
    pub fn is_stereo(&self) -> bool {
        self.stereo_detected
    }

    /// Pilot deviation estimate in tenths of a kHz, 0..=750.
    pub fn pilot_level_tenths_khz(&self) -> i32 {
        self.pilot_level_tenths_khz
    }

    fn blend_target(
        &self,
        pilot_mag: f32,
        pilot_ratio: f32,
        pilot_coherence: f32,
        pll_err_hz: f32,
    ) -> f32 {
        if self.force_mono {
            return 0.0;
        }

        let abs_q = quality_factor(pilot_mag, PILOT_ABS_HOLD, PILOT_ABS_ACQUIRE);
        let ratio_q = quality_factor(pilot_ratio, PILOT_RATIO_HOLD, PILOT_RATIO_ACQUIRE);
        let coh_q = quality_factor(pilot_coherence, PILOT_COHERENCE_HOLD, PILOT_COHERENCE_ACQUIRE);
        let pll_q = quality_factor(
            PLL_LOCK_HOLD_HZ - pll_err_hz,
            0.0,
            PLL_LOCK_HOLD_HZ - PLL_LOCK_ACQUIRE_HZ,
        );
        let quality = abs_q * ratio_q * coh_q * pll_q;

        if self.stereo_detected {
            return quality.min(1.0);
        }

        let prelock = self.mpx_magnitude > MPX_MIN_ACQUIRE
            && pilot_mag > PILOT_ABS_HOLD * 0.85
            && pilot_ratio > PILOT_RATIO_HOLD
            && pilot_coherence > PILOT_COHERENCE_HOLD
            && pll_err_hz < PLL_LOCK_HOLD_HZ;
        if !prelock {
            return 0.0;
        }
        quality.min(PRELOCK_BLEND_CAP)
    }

    /// Decode one MPX block into stereo audio.
    ///
    /// Returns the number of output sample pairs written (input length
    /// divided by the downsample factor).
    pub fn process(&mut self, mpx: &[f32], left: &mut [f32], right: &mut [f32]) -> usize {
        let mut out_count = 0;

        for &sample in mpx {
            let pilot = self.pilot_filter.push(sample);
            self.pilot_band_magnitude =
                self.pilot_band_magnitude * 0.995 + pilot.abs() * 0.005;
            self.mpx_magnitude = self.mpx_magnitude * 0.995 + sample.abs() * 0.005;

            let vco_i = self.pll.cos();
            let vco_q = self.pll.sin();
            let error = pilot * vco_q;
            self.pll.step(error);

            self.pilot_i = self.pilot_i * 0.995 + pilot * vco_i * 0.005;
            self.pilot_q = self.pilot_q * 0.995 + pilot * vco_q * 0.005;
            let pilot_mag_now =
                (self.pilot_i * self.pilot_i + self.pilot_q * self.pilot_q).sqrt();
            let pilot_ratio_now = self.pilot_band_magnitude / self.mpx_magnitude.max(1e-3);
            let pilot_coherence_now = pilot_mag_now / self.pilot_band_magnitude.max(1e-4);
            let pll_err_hz_now = self.pll.frequency_error_hz();
            let target = self.blend_target(
                pilot_mag_now,
                pilot_ratio_now,
                pilot_coherence_now,
                pll_err_hz_now,
            );

            let delayed = self.delay_line[self.delay_pos];
            self.delay_line[self.delay_pos] = sample;
            self.delay_pos = (self.delay_pos + 1) % self.delay_line.len();

            // Mono carries (L+R); halve so blended output keeps its loudness
            let mono = delayed * MATRIX_SCALE;
            let subcarrier = (2.0 * self.pll.phase()).cos();
            let lr = 2.0 * delayed * subcarrier;
            let stereo_left = (delayed + lr) * MATRIX_SCALE;
            let stereo_right = (delayed - lr) * MATRIX_SCALE;

            let coeff = if target > self.stereo_blend {
                self.blend_attack
            } else {
                self.blend_release
            };
            self.stereo_blend += (target - self.stereo_blend) * coeff;

            let left_raw = mono + (stereo_left - mono) * self.stereo_blend;
            let right_raw = mono + (stereo_right - mono) * self.stereo_blend;

            let left_filt = self.left_filter.push(left_raw);
            let right_filt = self.right_filter.push(right_raw);

            self.decim_phase += 1;
            if self.decim_phase < self.downsample_factor {
                continue;
            }
            self.decim_phase = 0;

            let (mut l, mut r) = (left_filt, right_filt);
            if self.deemph_enabled {
                self.deemph_left += self.deemph_alpha * (l - self.deemph_left);
                self.deemph_right += self.deemph_alpha * (r - self.deemph_right);
                l = self.deemph_left;
                r = self.deemph_right;
            }
            if out_count < left.len() && out_count < right.len() {
                left[out_count] = l.clamp(-1.0, 1.0);
                right[out_count] = r.clamp(-1.0, 1.0);
                out_count += 1;
            }
        }

        self.update_detection();
        out_count
    }

    fn update_detection(&mut self) {
        let pilot_mag = (self.pilot_i * self.pilot_i + self.pilot_q * self.pilot_q).sqrt();
        self.pilot_magnitude = self.pilot_magnitude * 0.9 + pilot_mag * 0.1;

        let (abs_thr, ratio_thr, coh_thr, pll_thr, mpx_thr) = if self.stereo_detected {
            (
                PILOT_ABS_HOLD,
                PILOT_RATIO_HOLD,
                PILOT_COHERENCE_HOLD,
                PLL_LOCK_HOLD_HZ,
                MPX_MIN_HOLD,
            )
        } else {
            (
                PILOT_ABS_ACQUIRE,
                PILOT_RATIO_ACQUIRE,
                PILOT_COHERENCE_ACQUIRE,
                PLL_LOCK_ACQUIRE_HZ,
                MPX_MIN_ACQUIRE,
            )
        };

        let pilot_ratio = self.pilot_band_magnitude / self.mpx_magnitude.max(1e-3);
        let pilot_coherence = self.pilot_magnitude / self.pilot_band_magnitude.max(1e-4);
        let pll_err_hz = self.pll.frequency_error_hz();
        let pilot_present = self.mpx_magnitude > mpx_thr
            && self.pilot_magnitude > abs_thr
            && pilot_ratio > ratio_thr
            && pilot_coherence > coh_thr
            && pll_err_hz < pll_thr;

        if !self.stereo_detected {
            if pilot_present {
                self.pilot_count += 1;
                self.pilot_loss_count = 0;
                if self.pilot_count >= PILOT_ACQUIRE_BLOCKS {
                    self.stereo_detected = true;
                }
            } else {
                self.pilot_count = 0;
            }
        } else if pilot_present {
            self.pilot_loss_count = 0;
        } else {
            self.pilot_loss_count += 1;
            if self.pilot_loss_count >= PILOT_LOSS_BLOCKS {
                self.stereo_detected = false;
                self.pilot_count = 0;
                self.pilot_loss_count = 0;
            }
        }

        let calibrated = self.pilot_magnitude * 8.0;
        self.pilot_level_tenths_khz = ((calibrated * 750.0).round() as i32).clamp(0, 750);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: u32 = 256_000;
    const BLOCK: usize = 8192;

    /// Stereo MPX with a 9% pilot: mono tone on L+R, difference tone on the
    /// 38 kHz subcarrier.
    fn stereo_mpx(blocks: usize) -> Vec<Vec<f32>> {
        let mut out = Vec::new();
        let mut k = 0u64;
        for _ in 0..blocks {
            let mut block = Vec::with_capacity(BLOCK);
            for _ in 0..BLOCK {
                let t = k as f64 / FS as f64;
                k += 1;
                let pilot_phase = 2.0 * std::f64::consts::PI * 19_000.0 * t;
                let l = (2.0 * std::f64::consts::PI * 1_000.0 * t).sin() * 0.4;
                let r = (2.0 * std::f64::consts::PI * 2_500.0 * t).sin() * 0.4;
                let mpx = (l + r) * 0.5
                    + 0.09 * pilot_phase.sin()
                    + (l - r) * 0.5 * (2.0 * pilot_phase).cos();
                block.push(mpx as f32);
            }
            out.push(block);
        }
        out
    }

    #[test]
    fn test_forced_mono_channels_match() {
        let mut decoder = StereoDecoder::new(FS, 32_000);
        decoder.set_force_mono(true);
        decoder.set_deemphasis(0);

        let mut left = vec![0.0f32; BLOCK];
        let mut right = vec![0.0f32; BLOCK];
        let mut diff_sum = 0.0f64;
        let mut diff_count = 0usize;
        for (i, block) in stereo_mpx(4).iter().enumerate() {
            let n = decoder.process(block, &mut left, &mut right);
            if i >= 1 {
                // 4000+ samples of settling have passed by the second block
                for k in 0..n {
                    diff_sum += (left[k] - right[k]).abs() as f64;
                    diff_count += 1;
                }
            }
        }
        assert!(diff_count > 0);
        let mean_abs_diff = diff_sum / diff_count as f64;
        assert!(mean_abs_diff < 1e-4, "mean abs diff {}", mean_abs_diff);
    }

    #[test]
    fn test_stereo_acquired_on_clean_pilot() {
        let mut decoder = StereoDecoder::new(FS, 32_000);
        let mut left = vec![0.0f32; BLOCK];
        let mut right = vec![0.0f32; BLOCK];
        for block in stereo_mpx(16) {
            decoder.process(&block, &mut left, &mut right);
        }
        assert!(decoder.is_stereo());
        assert!(decoder.pilot_level_tenths_khz() > 20);
    }

    #[test]
    fn test_no_stereo_on_silence() {
        let mut decoder = StereoDecoder::new(FS, 32_000);
        let silence = vec![0.0f32; BLOCK];
        let mut left = vec![0.0f32; BLOCK];
        let mut right = vec![0.0f32; BLOCK];
        for _ in 0..16 {
            decoder.process(&silence, &mut left, &mut right);
        }
        assert!(!decoder.is_stereo());
        assert_eq!(decoder.pilot_level_tenths_khz(), 0);
    }

    #[test]
    fn test_output_count_follows_downsample_factor() {
        let mut decoder = StereoDecoder::new(FS, 32_000);
        let block = vec![0.0f32; BLOCK];
        let mut left = vec![0.0f32; BLOCK];
        let mut right = vec![0.0f32; BLOCK];
        let n = decoder.process(&block, &mut left, &mut right);
        assert_eq!(n, BLOCK / 8);
    }

    #[test]
    fn test_stereo_drop_is_debounced() {
        let mut decoder = StereoDecoder::new(FS, 32_000);
        let mut left = vec![0.0f32; BLOCK];
        let mut right = vec![0.0f32; BLOCK];
        for block in stereo_mpx(16) {
            decoder.process(&block, &mut left, &mut right);
        }
        assert!(decoder.is_stereo());

        // A handful of silent blocks must not drop the flag yet
        let silence = vec![0.0f32; BLOCK];
        for _ in 0..4 {
            decoder.process(&silence, &mut left, &mut right);
        }
        assert!(decoder.is_stereo());

        for _ in 0..32 {
            decoder.process(&silence, &mut left, &mut right);
        }
        assert!(!decoder.is_stereo());
    }

    #[test]
    fn test_reset_clears_detection() {
        let mut decoder = StereoDecoder::new(FS, 32_000);
        let mut left = vec![0.0f32; BLOCK];
        let mut right = vec![0.0f32; BLOCK];
        for block in stereo_mpx(16) {
            decoder.process(&block, &mut left, &mut right);
        }
        assert!(decoder.is_stereo());
        decoder.reset();
        assert!(!decoder.is_stereo());
        assert_eq!(decoder.pilot_level_tenths_khz(), 0);
    }
}
