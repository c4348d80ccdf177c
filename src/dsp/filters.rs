//! Digital filter implementations.
//!
//! This module provides the FIR filters used across the receiver:
//! - [`Fir`]: stateful real-in/real-out FIR with a circular history buffer
//! - [`ComplexFir`]: the same structure over complex samples
//!
//! Taps are designed with the windowed-sinc method under a Nuttall window,
//! which keeps stopband sidelobes below roughly -90 dB. Low-pass designs are
//! normalized to unity DC gain; band-pass designs are normalized by the sum
//! of absolute coefficients so the passband peak stays near unity.
//!
//! # Example
//!
//! ```
//! use fmtuner::dsp::filters::Fir;
//!
//! // Isolate the 0-15 kHz mono audio from a 256 kHz FM multiplex
//! let mut audio = Fir::lowpass(15_000.0, 4_000.0, 256_000.0);
//! let y = audio.push(0.25);
//! assert!(y.is_finite());
//! ```

use num_complex::Complex;
use std::f64::consts::PI;

/// Smallest and largest tap counts produced by [`tap_count`].
const MIN_TAPS: usize = 63;
const MAX_TAPS: usize = 511;

/// Tap count heuristic: `ceil(3.8 * fs / transition)` clamped to
/// [63, 511] and forced odd so the filter has a well-defined center tap.
pub fn tap_count(sample_rate: f64, transition_hz: f64) -> usize {
    let raw = (3.8 * sample_rate / transition_hz).ceil() as usize;
    let mut n = raw.clamp(MIN_TAPS, MAX_TAPS);
    if n % 2 == 0 {
        n += 1;
    }
    n
}

/// Nuttall window value for tap `n` of a `count`-tap filter.
fn nuttall(n: usize, count: usize) -> f64 {
    let x = 2.0 * PI * n as f64 / (count - 1) as f64;
    0.355768 - 0.487396 * x.cos() + 0.144232 * (2.0 * x).cos() - 0.012604 * (3.0 * x).cos()
}

/// Design low-pass taps with unity DC gain.
///
/// # Panics
///
/// Panics if `sample_rate` or `transition_hz` is not positive.
pub fn lowpass_taps(cutoff_hz: f64, transition_hz: f64, sample_rate: f64) -> Vec<f32> {
    assert!(sample_rate > 0.0, "Sample rate must be greater than 0");
    assert!(transition_hz > 0.0, "Transition width must be greater than 0");

    let count = tap_count(sample_rate, transition_hz);
    let mid = (count / 2) as isize;
    let omega = 2.0 * PI * cutoff_hz / sample_rate;

    let mut taps = Vec::with_capacity(count);
    let mut sum = 0.0f64;
    for n in 0..count {
        let m = n as isize - mid;
        let sinc = if m == 0 {
            omega / PI
        } else {
            (omega * m as f64).sin() / (PI * m as f64)
        };
        let h = sinc * nuttall(n, count);
        sum += h;
        taps.push(h as f32);
    }

    if sum.abs() > 1e-12 {
        let inv = (1.0 / sum) as f32;
        for t in taps.iter_mut() {
            *t *= inv;
        }
    }
    taps
}

/// Design band-pass taps for the band `[low_hz, high_hz]`.
pub fn bandpass_taps(low_hz: f64, high_hz: f64, transition_hz: f64, sample_rate: f64) -> Vec<f32> {
    assert!(sample_rate > 0.0, "Sample rate must be greater than 0");
    assert!(high_hz > low_hz, "Band edges must be ordered");

    let count = tap_count(sample_rate, transition_hz);
    let mid = (count / 2) as isize;

    let mut taps = Vec::with_capacity(count);
    let mut sum_abs = 0.0f64;
    for n in 0..count {
        let m = n as isize - mid;
        let h = if m == 0 {
            2.0 * (high_hz - low_hz) / sample_rate
        } else {
            let mm = m as f64;
            ((2.0 * PI * high_hz * mm / sample_rate).sin()
                - (2.0 * PI * low_hz * mm / sample_rate).sin())
                / (PI * mm)
        } * nuttall(n, count);
        sum_abs += h.abs();
        taps.push(h as f32);
    }

    if sum_abs > 1e-12 {
        let inv = (1.0 / sum_abs) as f32;
        for t in taps.iter_mut() {
            *t *= inv;
        }
    }
    taps
}

/// Stateful real FIR filter.
///
/// The history buffer has exactly one slot per tap and is written circularly;
/// the convolution walks the taps against the history in reverse order from
/// the newest sample, so the filter can be fed sample by sample with no
/// per-block edge effects.
pub struct Fir {
    taps: Vec<f32>,
    history: Vec<f32>,
    pos: usize,
}

impl Fir {
    /// Create a filter from explicit taps.
    ///
    /// # Panics
    ///
    /// Panics if `taps` is empty.
    pub fn from_taps(taps: Vec<f32>) -> Self {
        assert!(!taps.is_empty(), "Filter must have at least one tap");
        let history = vec![0.0; taps.len()];
        Self {
            taps,
            history,
            pos: 0,
        }
    }

    /// Create a low-pass filter (unity DC gain, Nuttall window).
    pub fn lowpass(cutoff_hz: f64, transition_hz: f64, sample_rate: f64) -> Self {
        Self::from_taps(lowpass_taps(cutoff_hz, transition_hz, sample_rate))
    }

    /// Create a band-pass filter for `[low_hz, high_hz]`.
    pub fn bandpass(low_hz: f64, high_hz: f64, transition_hz: f64, sample_rate: f64) -> Self {
        Self::from_taps(bandpass_taps(low_hz, high_hz, transition_hz, sample_rate))
    }

    /// Number of taps.
    pub fn len(&self) -> usize {
        self.taps.len()
    }

    /// True if the filter has no taps (never the case after construction).
    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    /// The filter coefficients.
    pub fn taps(&self) -> &[f32] {
        &self.taps
    }

    /// Group delay in samples for the linear-phase designs used here.
    pub fn group_delay(&self) -> usize {
        (self.taps.len() - 1) / 2
    }

    /// Clear the filter history.
    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|h| *h = 0.0);
        self.pos = 0;
    }

    /// Push one sample and return the filtered output.
    pub fn push(&mut self, input: f32) -> f32 {
        self.history[self.pos] = input;
        self.pos = (self.pos + 1) % self.history.len();

        let mut acc = 0.0f32;
        let mut idx = self.pos;
        for &tap in &self.taps {
            idx = if idx == 0 { self.history.len() - 1 } else { idx - 1 };
            acc += tap * self.history[idx];
        }
        acc
    }

    /// Filter a block of samples.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        input.iter().map(|&x| self.push(x)).collect()
    }
}

/// Stateful complex FIR filter with real coefficients.
pub struct ComplexFir {
    taps: Vec<f32>,
    history: Vec<Complex<f32>>,
    pos: usize,
}

impl ComplexFir {
    /// Create a filter from explicit taps.
    ///
    /// # Panics
    ///
    /// Panics if `taps` is empty.
    pub fn from_taps(taps: Vec<f32>) -> Self {
        assert!(!taps.is_empty(), "Filter must have at least one tap");
        let history = vec![Complex::new(0.0, 0.0); taps.len()];
        Self {
            taps,
            history,
            pos: 0,
        }
    }

    /// Number of taps.
    pub fn len(&self) -> usize {
        self.taps.len()
    }

    /// True if the filter has no taps (never the case after construction).
    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    /// Clear the filter history.
    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|h| *h = Complex::new(0.0, 0.0));
        self.pos = 0;
    }

    /// Push one sample into the history without computing an output.
    pub fn push(&mut self, input: Complex<f32>) {
        self.history[self.pos] = input;
        self.pos = (self.pos + 1) % self.history.len();
    }

    /// Convolve the taps against the current history.
    pub fn execute(&self) -> Complex<f32> {
        let mut acc = Complex::new(0.0f32, 0.0f32);
        let mut idx = self.pos;
        for &tap in &self.taps {
            idx = if idx == 0 { self.history.len() - 1 } else { idx - 1 };
            acc += self.history[idx] * tap;
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_tap_count_heuristic() {
        // 3.8 * 256000 / 4000 = 243.2 -> 244 -> odd 245
        assert_eq!(tap_count(256_000.0, 4_000.0), 245);
        // Wide transition clamps to the minimum
        assert_eq!(tap_count(256_000.0, 100_000.0), 63);
        // Narrow transition clamps to the maximum
        assert_eq!(tap_count(256_000.0, 100.0), 511);
        // Always odd
        assert_eq!(tap_count(256_000.0, 3_000.0) % 2, 1);
    }

    #[test]
    fn test_lowpass_unity_dc_gain() {
        let taps = lowpass_taps(15_000.0, 4_000.0, 256_000.0);
        let sum: f32 = taps.iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_lowpass_dc_signal() {
        let mut fir = Fir::lowpass(15_000.0, 4_000.0, 256_000.0);
        let n = fir.len();
        let mut last = 0.0;
        for _ in 0..(4 * n) {
            last = fir.push(0.5);
        }
        // After the history fills, a DC input passes with unity gain
        assert_relative_eq!(last, 0.5, epsilon = 1e-3);
    }

    #[test]
    fn test_lowpass_attenuates_stopband_tone() {
        let fs = 256_000.0;
        let mut fir = Fir::lowpass(15_000.0, 4_000.0, fs);
        let freq = 40_000.0;
        let mut power_in = 0.0f64;
        let mut power_out = 0.0f64;
        for i in 0..8192 {
            let x = (2.0 * std::f64::consts::PI * freq * i as f64 / fs).sin() as f32;
            let y = fir.push(x);
            if i >= 1024 {
                power_in += (x as f64) * (x as f64);
                power_out += (y as f64) * (y as f64);
            }
        }
        let atten_db = 10.0 * (power_out / power_in).log10();
        assert!(atten_db < -60.0, "stopband attenuation {} dB", atten_db);
    }

    #[test]
    fn test_bandpass_passes_pilot_rejects_audio() {
        let fs = 256_000.0;
        let mut fir = Fir::bandpass(18_750.0, 19_250.0, 3_000.0, fs);
        let mut pass = 0.0f64;
        let mut stop = 0.0f64;
        for i in 0..16384 {
            let t = i as f64 / fs;
            let pilot = (2.0 * std::f64::consts::PI * 19_000.0 * t).sin() as f32;
            let y = fir.push(pilot);
            if i >= 2048 {
                pass += (y as f64) * (y as f64);
            }
        }
        fir.reset();
        for i in 0..16384 {
            let t = i as f64 / fs;
            let audio = (2.0 * std::f64::consts::PI * 1_000.0 * t).sin() as f32;
            let y = fir.push(audio);
            if i >= 2048 {
                stop += (y as f64) * (y as f64);
            }
        }
        assert!(pass > 100.0 * stop, "pass {} stop {}", pass, stop);
    }

    #[test]
    fn test_fir_reset_restores_initial_output() {
        let mut fir = Fir::lowpass(15_000.0, 4_000.0, 256_000.0);
        let first = fir.push(1.0);
        for _ in 0..100 {
            fir.push(0.3);
        }
        fir.reset();
        assert_relative_eq!(fir.push(1.0), first);
    }

    #[test]
    fn test_complex_fir_dc() {
        let taps = lowpass_taps(15_000.0, 4_000.0, 256_000.0);
        let n = taps.len();
        let mut fir = ComplexFir::from_taps(taps);
        for _ in 0..(2 * n) {
            fir.push(Complex::new(1.0, -0.5));
        }
        let out = fir.execute();
        assert_relative_eq!(out.re, 1.0, epsilon = 1e-3);
        assert_relative_eq!(out.im, -0.5, epsilon = 1e-3);
    }

    #[test]
    #[should_panic(expected = "at least one tap")]
    fn test_fir_empty_taps() {
        let _ = Fir::from_taps(Vec::new());
    }
}
