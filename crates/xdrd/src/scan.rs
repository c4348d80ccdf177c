//! Band-scan engine.
//!
//! A scan sweeps the requested range by retuning across integration
//! centers wide enough that the usable 45% of the I/Q spectrum covers
//! several channels at once. Each center contributes two averaged FFTs;
//! per-channel power is summed over the bins inside the channel bandwidth
//! (with a DC guard band excluded), converted to the same compensated
//! 0..120 level the live signal estimator produces, and the maximum across
//! overlapping centers wins. Channels no FFT covered are probed directly
//! with a short read so the client always receives a complete line.
//!
//! The result line is `<kHz>=<level>,<kHz>=<level>,` - the trailing comma
//! is part of the wire format.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use num_complex::Complex;
use rustfft::FftPlanner;
use tracing::{debug, info};

use fmtuner::tuner::Tuner;

use crate::control::XdrCommandState;
use crate::server::{ScanConfig, XdrServer};
use crate::signal::compute_signal_level;

const SCAN_RETRIES: usize = 2;
const FFT_AVERAGES: usize = 2;
const SCAN_READ_SAMPLES_CAP: usize = 32_768;
const RETUNE_DISCARD_SAMPLES: usize = 2_048;
const MAX_FFT_SIZE: usize = 16_384;
const MIN_FFT_SIZE: usize = 1_024;
const USABLE_SPECTRUM_FRACTION: f64 = 0.45;
const CENTER_STEP_FRACTION: f64 = 0.75;
const DC_REJECT_HZ: f32 = 4_000.0;
const POWER_FLOOR: f64 = 1e-20;

/// Tuner- and config-derived inputs for one sweep step.
pub struct ScanParams<'a> {
    pub iq_sample_rate: u32,
    pub effective_gain_db: i32,
    pub gain_comp_factor: f64,
    pub signal_bias_db: f64,
    pub signal_floor_dbfs: f64,
    pub signal_ceil_dbfs: f64,
    pub retry_sleep: Duration,
    pub running: &'a AtomicBool,
}

fn nearest_pow2(n: usize) -> usize {
    let mut p = 1usize;
    while (p << 1) <= n {
        p <<= 1;
    }
    p
}

fn bin_wrap(idx: i64, nfft: i64) -> usize {
    idx.rem_euclid(nfft) as usize
}

/// Render one finished scan line body (without the `U` prefix).
///
/// Every covered channel becomes `<kHz>=<level.1>,`; the trailing comma is
/// intentional.
pub fn format_scan_line(levels: &[f32], start_khz: i32, step_khz: i32) -> String {
    let mut line = String::new();
    for (ch, &level) in levels.iter().enumerate() {
        if !level.is_finite() {
            continue;
        }
        let freq_khz = start_khz + ch as i32 * step_khz;
        line.push_str(&format!("{}={:.1},", freq_khz, level));
    }
    line
}

pub struct ScanEngine {
    active: bool,
    config: ScanConfig,
    restore_freq_hz: u32,
    restore_bandwidth_hz: i32,
    planner: FftPlanner<f32>,
}

impl Default for ScanEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanEngine {
    pub fn new() -> Self {
        Self {
            active: false,
            config: ScanConfig::default(),
            restore_freq_hz: 0,
            restore_bandwidth_hz: 0,
            planner: FftPlanner::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Consume scan start/cancel requests from the control server.
    pub fn handle_control(
        &mut self,
        server: &XdrServer,
        state: &XdrCommandState,
        current_freq_hz: u32,
        current_bandwidth_hz: i32,
        tuner_connected: bool,
        restore: &mut dyn FnMut(u32, i32),
    ) {
        if let Some(config) = server.consume_scan_start() {
            self.config = config;
            self.active = true;
            self.restore_freq_hz = current_freq_hz;
            self.restore_bandwidth_hz = current_bandwidth_hz;
            if config.bandwidth_hz > 0 {
                state.request_bandwidth(config.bandwidth_hz);
            }
            info!(
                "scan start from={} to={} step={} bw={} mode={}",
                config.start_khz,
                config.stop_khz,
                config.step_khz,
                config.bandwidth_hz,
                if config.continuous { "continuous" } else { "single" }
            );
        }

        if server.consume_scan_cancel() {
            let was_active = self.active;
            self.active = false;
            debug!("scan cancel requested");
            if was_active && tuner_connected {
                restore(self.restore_freq_hz, self.restore_bandwidth_hz);
            }
        }
    }

    /// Run one full sweep when a scan is active. Returns `true` when the
    /// sweep consumed this loop iteration.
    #[allow(clippy::too_many_arguments)]
    pub fn run_if_active(
        &mut self,
        server: &XdrServer,
        tuner: &mut Tuner,
        iq_buffer: &mut [u8],
        sdr_buf_samples: usize,
        params: &ScanParams<'_>,
        capture: &mut dyn FnMut(&[u8], usize),
        restore: &mut dyn FnMut(u32, i32),
    ) -> bool {
        if !self.active || !tuner.is_connected() {
            return false;
        }

        let start_khz = self.config.start_khz.min(self.config.stop_khz);
        let stop_khz = self.config.start_khz.max(self.config.stop_khz);
        let step_khz = self.config.step_khz.max(5);
        let channel_bandwidth_hz = if self.config.bandwidth_hz > 0 {
            self.config.bandwidth_hz.clamp(10_000, 200_000)
        } else {
            56_000
        };
        let channel_count = ((stop_khz - start_khz) / step_khz + 1) as usize;
        let mut levels = vec![f32::NEG_INFINITY; channel_count];

        if params.iq_sample_rate == 0 {
            self.finish_sweep(restore);
            return true;
        }

        let sample_rate = params.iq_sample_rate as i64;
        let usable_half_span_hz = (sample_rate as f64 * USABLE_SPECTRUM_FRACTION) as i64;
        let center_step_hz = ((sample_rate as f64 * CENTER_STEP_FRACTION) as i64)
            .max(step_khz as i64 * 1000);
        let mut center_hz = start_khz as i64 * 1000 + usable_half_span_hz / 2;
        let end_center_hz = stop_khz as i64 * 1000 + usable_half_span_hz / 2;
        let scan_read_samples = sdr_buf_samples.min(SCAN_READ_SAMPLES_CAP.max(8192));

        while center_hz <= end_center_hz {
            if !params.running.load(Ordering::Acquire) || server.consume_scan_cancel() {
                self.active = false;
                break;
            }

            let _ = tuner.set_frequency(center_hz as u32);
            // One short read lets the tuner and its NCO settle after retune
            let _ = tuner.read_iq(iq_buffer, sdr_buf_samples.min(RETUNE_DISCARD_SAMPLES));

            for _ in 0..FFT_AVERAGES {
                let mut samples = 0usize;
                for _ in 0..SCAN_RETRIES {
                    samples = tuner.read_iq(iq_buffer, scan_read_samples);
                    if samples > 0 {
                        break;
                    }
                    std::thread::sleep(params.retry_sleep);
                }
                if samples == 0 {
                    continue;
                }
                capture(iq_buffer, samples);

                self.accumulate_fft(
                    &iq_buffer[..samples * 2],
                    center_hz,
                    usable_half_span_hz,
                    start_khz,
                    step_khz,
                    channel_bandwidth_hz,
                    params,
                    &mut levels,
                );
            }

            center_hz += center_step_hz;
        }

        // Probe any channel the sweep never covered so the line is complete
        for ch in 0..channel_count {
            if levels[ch].is_finite() {
                continue;
            }
            let freq_khz = start_khz + ch as i32 * step_khz;
            let _ = tuner.set_frequency(freq_khz as u32 * 1000);
            let mut samples = 0usize;
            for _ in 0..SCAN_RETRIES {
                samples = tuner.read_iq(iq_buffer, sdr_buf_samples.min(4096));
                if samples > 0 {
                    break;
                }
                std::thread::sleep(params.retry_sleep);
            }
            if samples == 0 {
                levels[ch] = 0.0;
                continue;
            }
            capture(iq_buffer, samples);
            let signal = compute_signal_level(
                iq_buffer,
                samples,
                params.effective_gain_db,
                params.gain_comp_factor,
                params.signal_bias_db,
                params.signal_floor_dbfs,
                params.signal_ceil_dbfs,
            );
            levels[ch] = signal.level120;
        }

        let line = format_scan_line(&levels, start_khz, step_khz);
        if !line.is_empty() {
            server.push_scan_line(line);
        }

        if !self.config.continuous || !self.active {
            self.finish_sweep(restore);
        }
        true
    }

    fn finish_sweep(&mut self, restore: &mut dyn FnMut(u32, i32)) {
        self.active = false;
        restore(self.restore_freq_hz, self.restore_bandwidth_hz);
    }

    /// Window, transform and integrate one read into the level table.
    #[allow(clippy::too_many_arguments)]
    fn accumulate_fft(
        &mut self,
        iq_bytes: &[u8],
        center_hz: i64,
        usable_half_span_hz: i64,
        start_khz: i32,
        step_khz: i32,
        channel_bandwidth_hz: i32,
        params: &ScanParams<'_>,
        levels: &mut [f32],
    ) {
        let samples = iq_bytes.len() / 2;
        let nfft = nearest_pow2(samples.min(MAX_FFT_SIZE));
        if nfft < MIN_FFT_SIZE {
            return;
        }
        let bin_hz = params.iq_sample_rate as f32 / nfft as f32;
        let bin_half = (((channel_bandwidth_hz as f32 * 0.5) / bin_hz).round() as i64).max(1);
        let dc_reject_bins = ((DC_REJECT_HZ / bin_hz.max(1.0)).round() as i64).max(1);

        // Remove the DC offset of the byte stream before windowing
        let mut mean_i = 0.0f64;
        let mut mean_q = 0.0f64;
        for k in 0..nfft {
            mean_i += (iq_bytes[k * 2] as f64 - 127.5) / 127.5;
            mean_q += (iq_bytes[k * 2 + 1] as f64 - 127.5) / 127.5;
        }
        mean_i /= nfft as f64;
        mean_q /= nfft as f64;

        let mut buffer: Vec<Complex<f32>> = Vec::with_capacity(nfft);
        for k in 0..nfft {
            let i = ((iq_bytes[k * 2] as f64 - 127.5) / 127.5 - mean_i) as f32;
            let q = ((iq_bytes[k * 2 + 1] as f64 - 127.5) / 127.5 - mean_q) as f32;
            // Hann window
            let w = 0.5
                - 0.5
                    * ((2.0 * std::f32::consts::PI * k as f32) / (nfft as f32 - 1.0)).cos();
            buffer.push(Complex::new(i * w, q * w));
        }

        let fft = self.planner.plan_fft_forward(nfft);
        fft.process(&mut buffer);

        let span_low_hz = center_hz - usable_half_span_hz;
        let span_high_hz = center_hz + usable_half_span_hz;
        let nfft_norm = (nfft as f64) * (nfft as f64);
        let safe_ceil = params.signal_ceil_dbfs.max(params.signal_floor_dbfs + 1.0);

        for (ch, level) in levels.iter_mut().enumerate() {
            let freq_hz = (start_khz + ch as i32 * step_khz) as i64 * 1000;
            if freq_hz < span_low_hz || freq_hz > span_high_hz {
                continue;
            }

            let rel_hz = (freq_hz - center_hz) as f32;
            let center_bin =
                ((rel_hz / params.iq_sample_rate as f32) * nfft as f32).round() as i64;
            let mut sum = 0.0f64;
            let mut used_bins = 0usize;
            for b in (center_bin - bin_half)..=(center_bin + bin_half) {
                if b.abs() <= dc_reject_bins {
                    continue;
                }
                let z = buffer[bin_wrap(b, nfft as i64)];
                sum += z.norm_sqr() as f64;
                used_bins += 1;
            }
            if used_bins == 0 {
                continue;
            }

            let band_power = (sum / nfft_norm).max(POWER_FLOOR);
            let dbfs = 10.0 * (band_power + 1e-12).log10();
            let compensated = dbfs
                - params.effective_gain_db as f64 * params.gain_comp_factor
                + params.signal_bias_db;
            let clipped = compensated.clamp(params.signal_floor_dbfs, safe_ceil);
            let level120 = (((clipped - params.signal_floor_dbfs)
                / (safe_ceil - params.signal_floor_dbfs))
                * 120.0) as f32;
            *level = level.max(level120);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_pow2() {
        assert_eq!(nearest_pow2(16_384), 16_384);
        assert_eq!(nearest_pow2(20_000), 16_384);
        assert_eq!(nearest_pow2(1_500), 1_024);
        assert_eq!(nearest_pow2(1), 1);
    }

    #[test]
    fn test_scan_line_format_trailing_comma() {
        let levels = vec![0.0f32, 42.35, 120.0];
        let line = format_scan_line(&levels, 87_500, 100);
        assert_eq!(line, "87500=0.0,87600=42.3,87700=120.0,");
        assert!(line.ends_with(','));
    }

    #[test]
    fn test_scan_line_skips_uncovered_channels() {
        let levels = vec![1.0f32, f32::NEG_INFINITY, 3.0];
        let line = format_scan_line(&levels, 100_000, 50);
        assert_eq!(line, "100000=1.0,100100=3.0,");
    }

    fn default_params(running: &AtomicBool) -> ScanParams<'_> {
        ScanParams {
            iq_sample_rate: 256_000,
            effective_gain_db: 0,
            gain_comp_factor: 0.5,
            signal_bias_db: 0.0,
            signal_floor_dbfs: -90.0,
            signal_ceil_dbfs: -15.0,
            retry_sleep: Duration::from_millis(1),
            running,
        }
    }

    #[test]
    fn test_fft_silence_measures_floor() {
        let running = AtomicBool::new(true);
        let params = default_params(&running);
        let mut engine = ScanEngine::new();

        // All-127 bytes: pure DC, removed before the FFT
        let iq = vec![127u8; 16_384 * 2];
        let center_hz = 87_550_000i64;
        let mut levels = vec![f32::NEG_INFINITY; 2];
        engine.accumulate_fft(
            &iq,
            center_hz,
            115_200,
            87_500,
            100,
            56_000,
            &params,
            &mut levels,
        );
        for &level in &levels {
            assert!(level.is_finite());
            assert_eq!(level, 0.0);
        }
    }

    #[test]
    fn test_fft_tone_raises_matching_channel() {
        let running = AtomicBool::new(true);
        let params = default_params(&running);
        let mut engine = ScanEngine::new();

        // Complex tone at +50 kHz from the integration center
        let fs = 256_000.0f64;
        let tone_hz = 50_000.0f64;
        let mut iq = Vec::with_capacity(16_384 * 2);
        for n in 0..16_384 {
            let w = 2.0 * std::f64::consts::PI * tone_hz * n as f64 / fs;
            iq.push((w.cos() * 90.0 + 127.5) as u8);
            iq.push((w.sin() * 90.0 + 127.5) as u8);
        }

        // Center at 100.000 MHz: the tone lands on 100.050 MHz
        let center_hz = 100_000_000i64;
        let start_khz = 99_950;
        let step_khz = 50;
        let mut levels = vec![f32::NEG_INFINITY; 5];
        engine.accumulate_fft(
            &iq,
            center_hz,
            115_200,
            start_khz,
            step_khz,
            30_000,
            &params,
            &mut levels,
        );

        // Channel index 2 sits on the tone
        let tone_level = levels[2];
        assert!(tone_level > 60.0, "tone level {}", tone_level);
        assert!(
            tone_level > levels[4] + 20.0,
            "tone {} vs empty {}",
            tone_level,
            levels[4]
        );
    }
}
