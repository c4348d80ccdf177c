//! Numerically controlled oscillator with an integrated phase-locked loop.
//!
//! The oscillator keeps its phase in radians and advances by an
//! instantaneous angular frequency. A second-order loop filter steers the
//! oscillator from an externally computed phase-error sample: the integral
//! path (`beta`) nudges the frequency, the proportional path (`alpha`) nudges
//! the phase directly. The frequency is clamped to a configurable window so
//! a burst of noise cannot drag the loop away from its capture range.
//!
//! # Example
//!
//! ```
//! use fmtuner::dsp::nco::Pll;
//!
//! // 19 kHz pilot tracker at the 256 kHz DSP rate, +/- 250 Hz pull range
//! let mut pll = Pll::new(19_000.0, 18_750.0, 19_250.0, 256_000.0);
//! pll.set_gains(0.01, 0.0001);
//!
//! let pilot_sample = 0.002f32;
//! let error = pilot_sample * pll.sin();
//! pll.step(error);
//! ```

use std::f32::consts::PI;

/// Second-order PLL around an NCO, phase in radians.
#[derive(Debug, Clone)]
pub struct Pll {
    phase: f32,
    freq: f32,
    nominal_freq: f32,
    min_freq: f32,
    max_freq: f32,
    alpha: f32,
    beta: f32,
    sample_rate: f32,
}

impl Pll {
    /// Create a PLL centered on `freq_hz`, clamped to `[min_hz, max_hz]`.
    ///
    /// Frequencies are converted to radians per sample at `sample_rate`.
    /// Default gains are `alpha = 0.01`, `beta = 0.0001`.
    pub fn new(freq_hz: f32, min_hz: f32, max_hz: f32, sample_rate: f32) -> Self {
        let to_omega = 2.0 * PI / sample_rate;
        Self {
            phase: 0.0,
            freq: freq_hz * to_omega,
            nominal_freq: freq_hz * to_omega,
            min_freq: min_hz * to_omega,
            max_freq: max_hz * to_omega,
            alpha: 0.01,
            beta: 0.0001,
            sample_rate,
        }
    }

    /// Set the proportional (`alpha`, phase) and integral (`beta`, frequency)
    /// loop gains.
    pub fn set_gains(&mut self, alpha: f32, beta: f32) {
        self.alpha = alpha;
        self.beta = beta;
    }

    /// Current phase in radians, wrapped to `[0, 2*PI)`.
    pub fn phase(&self) -> f32 {
        self.phase
    }

    /// `cos` of the current phase.
    pub fn cos(&self) -> f32 {
        self.phase.cos()
    }

    /// `sin` of the current phase.
    pub fn sin(&self) -> f32 {
        self.phase.sin()
    }

    /// Current frequency in Hz.
    pub fn frequency_hz(&self) -> f32 {
        self.freq * self.sample_rate / (2.0 * PI)
    }

    /// Absolute distance from the nominal frequency in Hz.
    pub fn frequency_error_hz(&self) -> f32 {
        (self.freq - self.nominal_freq).abs() * self.sample_rate / (2.0 * PI)
    }

    /// Apply one phase-error sample and advance the oscillator.
    pub fn step(&mut self, phase_error: f32) {
        self.freq = (self.freq + self.beta * phase_error).clamp(self.min_freq, self.max_freq);
        self.phase += self.freq + self.alpha * phase_error;
        if self.phase > 2.0 * PI {
            self.phase -= 2.0 * PI;
        } else if self.phase < 0.0 {
            self.phase += 2.0 * PI;
        }
    }

    /// Advance the oscillator with no error input (free run).
    pub fn advance(&mut self) {
        self.step(0.0);
    }

    /// Return phase to zero and frequency to nominal.
    pub fn reset(&mut self) {
        self.phase = 0.0;
        self.freq = self.nominal_freq;
    }
}
