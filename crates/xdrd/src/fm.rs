//! Wideband FM discriminator.
//!
//! Converts baseband I/Q into the composite FM multiplex. Two discriminator
//! flavors are available:
//!
//! - [`DiscriminatorMode::Fast`]: the cross-product approximation
//!   `dphi ~ (q*i_prev - i*q_prev) / |z_prev|^2`, no `atan2` per sample;
//! - [`DiscriminatorMode::Exact`]: the wrap-corrected phase difference via
//!   `atan2`, residuals folded into `(-PI, PI]`.
//!
//! Output is scaled so a full 75 kHz deviation maps to 1.0. The full-rate
//! MPX stream feeds the stereo and RDS decoders; in forced-mono operation a
//! channel-filtered, decimated and deemphasized mono stream is produced as
//! well. The channel filter follows the TEF tuner bandwidth ladder: a
//! requested bandwidth snaps to the nearest table entry and tightens the
//! filter below its 120 kHz default.

use fmtuner::dsp::agc::Agc;
use fmtuner::dsp::filters::Fir;
use num_complex::Complex;
use std::f32::consts::PI;
use tracing::debug;

/// FM deviation of a broadcast carrier, Hz.
const DEVIATION_HZ: f64 = 75_000.0;

/// Default mono channel filter cutoff, Hz.
const CHANNEL_CUTOFF_HZ: f64 = 120_000.0;

/// TEF-style bandwidth ladder, Hz. Zero means "widest".
pub const TEF_BANDWIDTHS_HZ: [u32; 17] = [
    311_000, 287_000, 254_000, 236_000, 217_000, 200_000, 184_000, 168_000, 151_000, 133_000,
    114_000, 97_000, 84_000, 72_000, 64_000, 56_000, 0,
];

/// Snap a requested bandwidth to the nearest ladder entry.
///
/// Zero (and anything wider than the widest real entry maps naturally)
/// selects the "widest" setting.
pub fn nearest_tef_bandwidth(bandwidth_hz: u32) -> u32 {
    if bandwidth_hz == 0 {
        return 0;
    }
    let mut best = 0u32;
    let mut best_dist = u32::MAX;
    for &tef in TEF_BANDWIDTHS_HZ.iter() {
        if tef == 0 {
            continue;
        }
        let dist = tef.abs_diff(bandwidth_hz);
        if dist < best_dist {
            best_dist = dist;
            best = tef;
        }
    }
    // Beyond the widest entry the ladder opens fully
    if bandwidth_hz > best && best == TEF_BANDWIDTHS_HZ[0] {
        return 0;
    }
    best
}

/// Discriminator algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscriminatorMode {
    /// Cross-product approximation, no `atan2`.
    Fast,
    /// Wrap-correct `atan2` phase difference.
    Exact,
}

/// Optional complex AGC ahead of the discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DspAgcMode {
    Off,
    Fast,
    Slow,
}

/// The FM discriminator with its mono channel path.
pub struct FmDemod {
    input_rate: u32,
    output_rate: u32,
    downsample_factor: usize,
    mode: DiscriminatorMode,
    inv_deviation: f32,

    last_phase: f32,
    prev: Complex<f32>,
    agc: Option<Agc>,

    channel_filter: Fir,
    channel_cutoff_hz: f64,
    tef_bandwidth_hz: u32,
    decim_phase: usize,

    deemph_alpha: f32,
    deemph_enabled: bool,
    deemph_state: f32,

    clip_ratio: f64,
}

impl FmDemod {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        let mut demod = Self {
            input_rate,
            output_rate,
            downsample_factor: (input_rate / output_rate).max(1) as usize,
            mode: DiscriminatorMode::Exact,
            inv_deviation: (input_rate as f64 / (2.0 * std::f64::consts::PI * DEVIATION_HZ)) as f32,
            last_phase: 0.0,
            prev: Complex::new(1.0, 0.0),
            agc: None,
            channel_filter: Self::design_channel_filter(CHANNEL_CUTOFF_HZ, input_rate),
            channel_cutoff_hz: CHANNEL_CUTOFF_HZ,
            tef_bandwidth_hz: 0,
            decim_phase: 0,
            deemph_alpha: 1.0,
            deemph_enabled: true,
            deemph_state: 0.0,
            clip_ratio: 0.0,
        };
        demod.set_deemphasis(75);
        demod
    }

    fn design_channel_filter(cutoff_hz: f64, input_rate: u32) -> Fir {
        let transition = (cutoff_hz * 0.35).max(8_000.0);
        Fir::lowpass(cutoff_hz, transition, input_rate as f64)
    }

    /// Select the discriminator algorithm.
    pub fn set_mode(&mut self, mode: DiscriminatorMode) {
        self.mode = mode;
    }

    /// Configure the input AGC.
    pub fn set_dsp_agc_mode(&mut self, mode: DspAgcMode) {
        self.agc = match mode {
            DspAgcMode::Off => None,
            DspAgcMode::Fast => Some(Agc::new(0.05, 1.0)),
            DspAgcMode::Slow => Some(Agc::new(0.005, 1.0)),
        };
    }

    /// Apply a requested channel bandwidth via the TEF ladder.
    pub fn set_bandwidth_hz(&mut self, bandwidth_hz: u32) {
        let tef = nearest_tef_bandwidth(bandwidth_hz);
        if tef == self.tef_bandwidth_hz && bandwidth_hz != 0 {
            return;
        }
        self.tef_bandwidth_hz = tef;
        let cutoff = if tef == 0 {
            CHANNEL_CUTOFF_HZ
        } else {
            (tef as f64 / 2.0).min(CHANNEL_CUTOFF_HZ)
        };
        if (cutoff - self.channel_cutoff_hz).abs() > 1.0 {
            debug!("channel filter cutoff {} Hz (TEF {})", cutoff, tef);
            self.channel_cutoff_hz = cutoff;
            self.channel_filter = Self::design_channel_filter(cutoff, self.input_rate);
        }
    }

    /// The TEF bandwidth currently applied (0 = widest).
    pub fn tef_bandwidth_hz(&self) -> u32 {
        self.tef_bandwidth_hz
    }

    /// Set mono deemphasis; `tau_us <= 0` bypasses it.
    pub fn set_deemphasis(&mut self, tau_us: i32) {
        if tau_us <= 0 {
            self.deemph_enabled = false;
            self.deemph_alpha = 1.0;
            return;
        }
        self.deemph_enabled = true;
        let tau = tau_us as f32 * 1e-6;
        let dt = 1.0 / self.output_rate as f32;
        self.deemph_alpha = dt / (tau + dt);
    }

    /// Fraction of bytes pinned at 0 or 255 in the last byte-input block.
    pub fn clip_ratio(&self) -> f64 {
        self.clip_ratio
    }

    /// Re-initialize all demodulator state.
    pub fn reset(&mut self) {
        self.last_phase = 0.0;
        self.prev = Complex::new(1.0, 0.0);
        if let Some(agc) = self.agc.as_mut() {
            agc.reset();
        }
        self.channel_filter.reset();
        self.decim_phase = 0;
        self.deemph_state = 0.0;
        self.clip_ratio = 0.0;
    }

    #[inline]
    fn discriminate(&mut self, sample: Complex<f32>) -> f32 {
        let z = match self.agc.as_mut() {
            Some(agc) => agc.execute(sample),
            None => sample,
        };
        let delta = match self.mode {
            DiscriminatorMode::Fast => {
                let cross = z.im * self.prev.re - z.re * self.prev.im;
                let mag_sq = self.prev.norm_sqr();
                self.prev = z;
                cross / (mag_sq + 1e-12)
            }
            DiscriminatorMode::Exact => {
                let phase = z.im.atan2(z.re);
                let mut d = phase - self.last_phase;
                while d > PI {
                    d -= 2.0 * PI;
                }
                while d <= -PI {
                    d += 2.0 * PI;
                }
                self.last_phase = phase;
                d
            }
        };
        delta * self.inv_deviation
    }

    #[inline]
    fn mono_step(&mut self, mpx: f32, mono: &mut [f32], produced: &mut usize) {
        let filtered = self.channel_filter.push(mpx);
        self.decim_phase += 1;
        if self.decim_phase < self.downsample_factor {
            return;
        }
        self.decim_phase = 0;
        let out = if self.deemph_enabled {
            self.deemph_state += self.deemph_alpha * (filtered - self.deemph_state);
            self.deemph_state
        } else {
            filtered
        };
        if *produced < mono.len() {
            mono[*produced] = out;
            *produced += 1;
        }
    }

    /// Demodulate pre-decimated complex I/Q.
    ///
    /// Fills `mpx` (one output per input sample) and, when `mono` is given,
    /// produces the decimated mono stream. Returns the mono sample count
    /// (zero when `mono` is `None`).
    pub fn process_complex(
        &mut self,
        iq: &[Complex<f32>],
        mpx: &mut [f32],
        mut mono: Option<&mut [f32]>,
    ) -> usize {
        let n = iq.len().min(mpx.len());
        let mut produced = 0;
        for k in 0..n {
            let sample = self.discriminate(iq[k]);
            mpx[k] = sample;
            if let Some(mono_buf) = mono.as_deref_mut() {
                self.mono_step(sample, mono_buf, &mut produced);
            }
        }
        produced
    }

    /// Demodulate raw u8 I/Q bytes, updating the clip ratio.
    pub fn process_bytes(
        &mut self,
        iq: &[u8],
        mpx: &mut [f32],
        mut mono: Option<&mut [f32]>,
    ) -> usize {
        let n = (iq.len() / 2).min(mpx.len());
        let mut clipped = 0usize;
        let mut produced = 0;
        for k in 0..n {
            let bi = iq[k * 2];
            let bq = iq[k * 2 + 1];
            if bi == 0 || bi == 255 {
                clipped += 1;
            }
            if bq == 0 || bq == 255 {
                clipped += 1;
            }
            let z = Complex::new(
                (bi as f32 - 127.5) / 127.5,
                (bq as f32 - 127.5) / 127.5,
            );
            let sample = self.discriminate(z);
            mpx[k] = sample;
            if let Some(mono_buf) = mono.as_deref_mut() {
                self.mono_step(sample, mono_buf, &mut produced);
            }
        }
        self.clip_ratio = if n > 0 {
            clipped as f64 / (2 * n) as f64
        } else {
            0.0
        };
        produced
    }
}
