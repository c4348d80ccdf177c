//! Automatic gain control for complex sample streams.
//!
//! The AGC tracks the signal envelope with an exponential moving average and
//! applies the inverse gain so downstream slicers see a stable amplitude.
//! Bandwidth controls how fast the envelope estimate (and therefore the
//! gain) reacts; the initial gain seeds the loop so weak signals do not take
//! seconds to come up.

use num_complex::Complex;

/// Complex AGC with configurable bandwidth and initial gain.
#[derive(Debug, Clone)]
pub struct Agc {
    target: f32,
    bandwidth: f32,
    gain: f32,
    initial_gain: f32,
    envelope: f32,
    gain_min: f32,
    gain_max: f32,
}

impl Agc {
    /// Create an AGC.
    ///
    /// # Arguments
    ///
    /// * `bandwidth` - loop bandwidth in `[0, 1]`; lower is smoother
    /// * `initial_gain` - gain applied before the envelope estimate settles
    pub fn new(bandwidth: f32, initial_gain: f32) -> Self {
        Self {
            target: 1.0,
            bandwidth: bandwidth.clamp(0.0, 1.0),
            gain: initial_gain,
            initial_gain,
            envelope: 1.0,
            gain_min: 1e-6,
            gain_max: 1e6,
        }
    }

    /// Current gain value.
    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Current envelope estimate.
    pub fn envelope(&self) -> f32 {
        self.envelope
    }

    /// Restore the initial gain and envelope.
    pub fn reset(&mut self) {
        self.gain = self.initial_gain;
        self.envelope = 1.0;
    }

    /// Normalize one complex sample.
    pub fn execute(&mut self, sample: Complex<f32>) -> Complex<f32> {
        let out = sample * self.gain;

        let mag = out.norm();
        self.envelope = (1.0 - self.bandwidth) * self.envelope + self.bandwidth * mag;

        if self.envelope > 1e-10 {
            let error = self.target / self.envelope;
            self.gain *= 1.0 + self.bandwidth * (error - 1.0);
            self.gain = self.gain.clamp(self.gain_min, self.gain_max);
        }

        out
    }

    /// Normalize one real sample.
    pub fn execute_real(&mut self, x: f32) -> f32 {
        self.execute(Complex::new(x, 0.0)).re
    }
}
