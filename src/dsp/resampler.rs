//! Polyphase rational resampler.
//!
//! Converts a real sample stream from one rate to another through a bank of
//! 32 polyphase sub-filters cut from a single Kaiser-windowed sinc
//! prototype (~60 dB stopband). The conversion ratio is arbitrary within
//! `(0, 8]`: for each input sample pushed, between 0 and
//! [`MAX_OUTPUT`](RationalResampler::MAX_OUTPUT) output samples are
//! produced, and the fractional sampling position is carried in double
//! precision so long streams do not drift.
//!
//! # Example
//!
//! ```
//! use fmtuner::dsp::resampler::RationalResampler;
//!
//! // 256 kHz multiplex down to 32 kHz audio
//! let mut resamp = RationalResampler::new(32_000.0 / 256_000.0);
//! let mut out = [0.0f32; RationalResampler::MAX_OUTPUT];
//! let produced = resamp.execute(0.5, &mut out);
//! assert!(produced <= 1);
//! ```

/// Number of polyphase branches.
const NPFB: usize = 32;

/// Prototype half length in input samples.
const HALF_LENGTH: usize = 12;

/// Kaiser beta for roughly 60 dB of stopband rejection.
const KAISER_BETA: f64 = 5.653;

/// Normalized prototype cutoff relative to the narrower Nyquist.
const CUTOFF: f64 = 0.47;

/// Zeroth-order modified Bessel function of the first kind.
fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    let half_x = x / 2.0;
    for k in 1..32 {
        term *= (half_x / k as f64) * (half_x / k as f64);
        sum += term;
        if term < 1e-16 * sum {
            break;
        }
    }
    sum
}

fn kaiser(n: usize, len: usize, beta: f64) -> f64 {
    let m = (len - 1) as f64;
    let x = 2.0 * n as f64 / m - 1.0;
    bessel_i0(beta * (1.0 - x * x).max(0.0).sqrt()) / bessel_i0(beta)
}

/// Real-in/real-out polyphase resampler with double-precision timing.
pub struct RationalResampler {
    ratio: f64,
    step: f64,
    phase: f64,
    taps: Vec<f32>,
    history: Vec<f32>,
    pos: usize,
}

impl RationalResampler {
    /// Largest number of outputs a single input sample can produce.
    pub const MAX_OUTPUT: usize = 8;

    /// Create a resampler with conversion ratio `fo / fi`.
    ///
    /// # Panics
    ///
    /// Panics unless `0 < ratio <= 8`.
    pub fn new(ratio: f64) -> Self {
        assert!(
            ratio > 0.0 && ratio <= Self::MAX_OUTPUT as f64,
            "Resampling ratio must be in (0, {}]",
            Self::MAX_OUTPUT
        );

        let branch_len = 2 * HALF_LENGTH;
        let total_len = branch_len * NPFB;
        let center = (total_len - 1) as f64 / 2.0;
        // Prototype runs at the interpolated rate; cutoff tracks the
        // narrower of the two Nyquist bands.
        let fc = CUTOFF * ratio.min(1.0) / NPFB as f64;

        let mut taps = Vec::with_capacity(total_len);
        let mut sum = 0.0f64;
        for n in 0..total_len {
            let m = n as f64 - center;
            let sinc = if m.abs() < 1e-9 {
                2.0 * fc
            } else {
                (2.0 * std::f64::consts::PI * fc * m).sin() / (std::f64::consts::PI * m)
            };
            let h = sinc * kaiser(n, total_len, KAISER_BETA);
            sum += h;
            taps.push(h as f32);
        }

        // Unity DC gain per polyphase branch.
        let scale = (NPFB as f64 / sum) as f32;
        for t in taps.iter_mut() {
            *t *= scale;
        }

        Self {
            ratio,
            step: 1.0 / ratio,
            phase: 0.0,
            taps,
            history: vec![0.0; branch_len],
            pos: 0,
        }
    }

    /// The configured conversion ratio `fo / fi`.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Clear filter history and fractional position.
    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|h| *h = 0.0);
        self.pos = 0;
        self.phase = 0.0;
    }

    fn interpolate(&self, branch: usize) -> f32 {
        let branch_len = self.history.len();
        let mut acc = 0.0f32;
        let mut idx = self.pos;
        for k in 0..branch_len {
            idx = if idx == 0 { branch_len - 1 } else { idx - 1 };
            acc += self.taps[branch + k * NPFB] * self.history[idx];
        }
        acc
    }

    /// Push one input sample; write up to [`MAX_OUTPUT`](Self::MAX_OUTPUT)
    /// output samples into `output` and return how many were produced.
    pub fn execute(&mut self, input: f32, output: &mut [f32; Self::MAX_OUTPUT]) -> usize {
        self.history[self.pos] = input;
        self.pos = (self.pos + 1) % self.history.len();

        let mut produced = 0;
        while self.phase < 1.0 && produced < Self::MAX_OUTPUT {
            let branch = ((self.phase * NPFB as f64) as usize).min(NPFB - 1);
            output[produced] = self.interpolate(branch);
            produced += 1;
            self.phase += self.step;
        }
        self.phase -= 1.0;
        produced
    }

    /// Resample a whole block (convenience wrapper over [`execute`](Self::execute)).
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let mut out = Vec::with_capacity((input.len() as f64 * self.ratio) as usize + 8);
        let mut scratch = [0.0f32; Self::MAX_OUTPUT];
        for &x in input {
            let n = self.execute(x, &mut scratch);
            out.extend_from_slice(&scratch[..n]);
        }
        out
    }
}
