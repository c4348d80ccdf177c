//! Per-block DSP orchestration: bytes in, stereo audio out.
//!
//! The pipeline owns the IQ decimator, the FM discriminator, the stereo
//! decoder and the AF post-processor, and wires one tuner read through all
//! of them. The MPX block is handed to the RDS sink before anything
//! downstream touches it.
//!
//! Rate plan: the discriminator always runs at the 256 kHz DSP rate. In
//! the stereo path the stereo decoder also runs at the DSP rate on both
//! sides (its own decimation idles at factor 1 and its deemphasis is
//! bypassed) and the AF post-processor owns the single rate change down to
//! 32 kHz together with deemphasis and DC blocking. The mono path uses the
//! discriminator's channel-filtered, decimated and deemphasized stream
//! directly.

use num_complex::Complex;
use tracing::debug;

use fmtuner::dsp::decimator::IqDecimator;

use crate::af::AfPostProcessor;
use crate::fm::{DiscriminatorMode, DspAgcMode, FmDemod};
use crate::stereo::StereoDecoder;

/// Metadata of one processed block; audio lives in the pipeline's buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockResult {
    /// Audio samples produced per channel.
    pub out_samples: usize,
    /// MPX samples the discriminator produced this call.
    pub demod_samples: usize,
    /// Debounced stereo indication from the decoder.
    pub stereo_detected: bool,
    /// Pilot deviation in tenths of a kHz.
    pub pilot_tenths_khz: i32,
}

pub struct DspPipeline {
    stereo_enabled: bool,
    block_samples: usize,
    iq_decimation: usize,

    demod: FmDemod,
    stereo: StereoDecoder,
    af_post: AfPostProcessor,
    iq_decimator: IqDecimator,

    iq_staging: Vec<u8>,
    iq_decimated: Vec<Complex<f32>>,
    demod_buf: Vec<f32>,
    stereo_left: Vec<f32>,
    stereo_right: Vec<f32>,
    audio_left: Vec<f32>,
    audio_right: Vec<f32>,

    applied_bandwidth_hz: Option<u32>,
    applied_deemphasis: Option<i32>,
    applied_force_mono: Option<bool>,
}

impl DspPipeline {
    pub fn new(
        input_rate: u32,
        output_rate: u32,
        stereo_enabled: bool,
        block_samples: usize,
        iq_decimation: usize,
    ) -> Self {
        let block_samples = block_samples.clamp(1024, 32_768);
        let iq_decimation = iq_decimation.max(1);

        // The stereo decoder runs rate-neutral; resampling and deemphasis
        // belong to the AF post-processor in this wiring.
        let mut stereo = StereoDecoder::new(input_rate, input_rate);
        stereo.set_deemphasis(0);

        Self {
            stereo_enabled,
            block_samples,
            iq_decimation,
            demod: FmDemod::new(input_rate, output_rate),
            stereo,
            af_post: AfPostProcessor::new(input_rate, output_rate),
            iq_decimator: IqDecimator::new(iq_decimation),
            iq_staging: Vec::new(),
            iq_decimated: vec![Complex::new(0.0, 0.0); block_samples],
            demod_buf: vec![0.0; block_samples],
            stereo_left: vec![0.0; block_samples],
            stereo_right: vec![0.0; block_samples],
            audio_left: vec![0.0; block_samples],
            audio_right: vec![0.0; block_samples],
            applied_bandwidth_hz: None,
            applied_deemphasis: None,
            applied_force_mono: None,
        }
    }

    /// DSP block size in samples at the decimated rate.
    pub fn block_samples(&self) -> usize {
        self.block_samples
    }

    /// Samples the tuner must deliver to fill one DSP block.
    pub fn sdr_block_samples(&self) -> usize {
        self.block_samples * self.iq_decimation
    }

    /// Fraction of bytes at the ADC rails in the last processed block.
    pub fn clip_ratio(&self) -> f64 {
        self.demod.clip_ratio()
    }

    /// The processed audio of the last block: `(left, right)`, sized per
    /// [`BlockResult::out_samples`].
    pub fn audio(&self) -> (&[f32], &[f32]) {
        (&self.audio_left, &self.audio_right)
    }

    /// Mutable audio access for post-pipeline shaping (retune mute).
    pub fn audio_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.audio_left, &mut self.audio_right)
    }

    /// Re-initialize every owned component and the byte staging buffer.
    pub fn reset(&mut self) {
        self.demod.reset();
        self.stereo.reset();
        self.af_post.reset();
        self.iq_decimator.reset();
        self.iq_staging.clear();
    }

    /// Select the discriminator algorithm.
    pub fn set_discriminator_mode(&mut self, mode: DiscriminatorMode) {
        self.demod.set_mode(mode);
    }

    /// Configure the complex AGC ahead of the discriminator.
    pub fn set_dsp_agc_mode(&mut self, mode: DspAgcMode) {
        self.demod.set_dsp_agc_mode(mode);
    }

    /// Apply a channel bandwidth request; idempotent per value.
    pub fn set_bandwidth_hz(&mut self, bandwidth_hz: u32) {
        if self.applied_bandwidth_hz == Some(bandwidth_hz) {
            return;
        }
        self.applied_bandwidth_hz = Some(bandwidth_hz);
        self.demod.set_bandwidth_hz(bandwidth_hz);
    }

    /// Apply a deemphasis mode (0 = 50 us, 1 = 75 us, 2 = off); idempotent
    /// per value.
    pub fn set_deemphasis_mode(&mut self, mode: i32) {
        if self.applied_deemphasis == Some(mode) {
            return;
        }
        self.applied_deemphasis = Some(mode);
        let tau_us = match mode {
            0 => 50,
            1 => 75,
            _ => 0,
        };
        debug!("deemphasis mode {} ({} us)", mode, tau_us);
        self.demod.set_deemphasis(tau_us);
        self.af_post.set_deemphasis(tau_us);
    }

    /// Force mono reproduction; idempotent per value.
    pub fn set_force_mono(&mut self, force: bool) {
        if self.applied_force_mono == Some(force) {
            return;
        }
        self.applied_force_mono = Some(force);
        self.stereo.set_force_mono(force);
    }

    /// Process one tuner read of `samples` complex I/Q byte pairs.
    ///
    /// Returns `None` when the staging buffer has not yet accumulated one
    /// full SDR block (decimated operation only); the partial tail is kept
    /// for the next call. The MPX block is delivered to `rds_sink` before
    /// the stereo and AF stages run.
    pub fn process(
        &mut self,
        iq: &[u8],
        samples: usize,
        rds_sink: &mut dyn FnMut(&[f32]),
    ) -> Option<BlockResult> {
        if samples == 0 || iq.len() < samples * 2 {
            return None;
        }

        let demod_samples;
        let use_complex;
        if self.iq_decimation > 1 {
            self.iq_staging.extend_from_slice(&iq[..samples * 2]);
            let needed_bytes = self.sdr_block_samples() * 2;
            if self.iq_staging.len() < needed_bytes {
                return None;
            }
            demod_samples = {
                let chunk = &self.iq_staging[..needed_bytes];
                self.iq_decimator
                    .execute(chunk, &mut self.iq_decimated[..self.block_samples])
            };
            self.iq_staging.drain(..needed_bytes);
            if demod_samples == 0 {
                return None;
            }
            use_complex = true;
        } else {
            demod_samples = samples.min(self.block_samples);
            use_complex = false;
        }

        let mut out_samples;
        let mut stereo_detected = false;
        let mut pilot_tenths_khz = 0;

        if !self.stereo_enabled {
            // Mono path: the discriminator produces the resampled mono
            // stream alongside the MPX.
            out_samples = if use_complex {
                self.demod.process_complex(
                    &self.iq_decimated[..demod_samples],
                    &mut self.demod_buf[..demod_samples],
                    Some(&mut self.stereo_left),
                )
            } else {
                self.demod.process_bytes(
                    &iq[..demod_samples * 2],
                    &mut self.demod_buf[..demod_samples],
                    Some(&mut self.stereo_left),
                )
            };
            rds_sink(&self.demod_buf[..demod_samples]);
            // MPX mono carries (L+R); halve to match stereo loudness
            for i in 0..out_samples {
                let mono = self.stereo_left[i] * 0.5;
                self.audio_left[i] = mono;
                self.audio_right[i] = mono;
            }
        } else {
            if use_complex {
                self.demod.process_complex(
                    &self.iq_decimated[..demod_samples],
                    &mut self.demod_buf[..demod_samples],
                    None,
                );
            } else {
                self.demod.process_bytes(
                    &iq[..demod_samples * 2],
                    &mut self.demod_buf[..demod_samples],
                    None,
                );
            }
            rds_sink(&self.demod_buf[..demod_samples]);

            let stereo_samples = self.stereo.process(
                &self.demod_buf[..demod_samples],
                &mut self.stereo_left,
                &mut self.stereo_right,
            );
            out_samples = self.af_post.process(
                &self.stereo_left[..stereo_samples],
                &self.stereo_right[..stereo_samples],
                &mut self.audio_left,
                &mut self.audio_right,
            );
            stereo_detected = self.stereo.is_stereo();
            pilot_tenths_khz = self.stereo.pilot_level_tenths_khz();
        }

        out_samples = out_samples.min(self.block_samples);
        for i in 0..out_samples {
            self.audio_left[i] = self.audio_left[i].clamp(-1.0, 1.0);
            self.audio_right[i] = self.audio_right[i].clamp(-1.0, 1.0);
        }

        Some(BlockResult {
            out_samples,
            demod_samples,
            stereo_detected,
            pilot_tenths_khz,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IN_RATE: u32 = 256_000;
    const OUT_RATE: u32 = 32_000;
    const BLOCK: usize = 8192;

    fn silence_bytes(samples: usize) -> Vec<u8> {
        let mut v = Vec::with_capacity(samples * 2);
        for i in 0..samples * 2 {
            v.push(if i % 2 == 0 { 127 } else { 128 });
        }
        v
    }

    #[test]
    fn test_undecimated_block_produces_audio() {
        let mut pipeline = DspPipeline::new(IN_RATE, OUT_RATE, true, BLOCK, 1);
        let iq = silence_bytes(BLOCK);
        let mut sink_calls = 0usize;
        let result = pipeline
            .process(&iq, BLOCK, &mut |mpx| {
                sink_calls += 1;
                assert_eq!(mpx.len(), BLOCK);
            })
            .expect("block should process");
        assert_eq!(sink_calls, 1);
        assert_eq!(result.demod_samples, BLOCK);
        assert!((result.out_samples as isize - (BLOCK / 8) as isize).abs() <= 2);
        let (left, _right) = pipeline.audio();
        for &s in &left[..result.out_samples] {
            assert!((-1.0..=1.0).contains(&s));
        }
    }

    #[test]
    fn test_staging_withholds_until_full_chunk() {
        let mut pipeline = DspPipeline::new(IN_RATE, OUT_RATE, true, BLOCK, 8);
        assert_eq!(pipeline.sdr_block_samples(), BLOCK * 8);

        // Half an SDR block: no output, tail retained
        let half = silence_bytes(BLOCK * 4);
        let mut sink_calls = 0usize;
        assert!(pipeline
            .process(&half, BLOCK * 4, &mut |_| sink_calls += 1)
            .is_none());
        assert_eq!(sink_calls, 0);

        // Second half completes the chunk
        let result = pipeline
            .process(&half, BLOCK * 4, &mut |_| sink_calls += 1)
            .expect("second half should complete the block");
        assert_eq!(sink_calls, 1);
        assert_eq!(result.demod_samples, BLOCK);
    }

    #[test]
    fn test_mono_path_uses_discriminator_stream() {
        let mut pipeline = DspPipeline::new(IN_RATE, OUT_RATE, false, BLOCK, 1);
        let iq = silence_bytes(BLOCK);
        let result = pipeline
            .process(&iq, BLOCK, &mut |_| {})
            .expect("block should process");
        assert_eq!(result.out_samples, BLOCK / 8);
        assert!(!result.stereo_detected);
        let (left, right) = pipeline.audio();
        for i in 0..result.out_samples {
            assert_eq!(left[i], right[i]);
        }
    }

    #[test]
    fn test_reset_clears_staging() {
        let mut pipeline = DspPipeline::new(IN_RATE, OUT_RATE, true, BLOCK, 8);
        let partial = silence_bytes(BLOCK);
        assert!(pipeline.process(&partial, BLOCK, &mut |_| {}).is_none());
        pipeline.reset();
        // After reset the same partial amount again yields nothing: the
        // earlier tail is gone
        assert!(pipeline.process(&partial, BLOCK, &mut |_| {}).is_none());
    }

    #[test]
    fn test_setters_idempotent_per_value() {
        let mut pipeline = DspPipeline::new(IN_RATE, OUT_RATE, true, BLOCK, 1);
        pipeline.set_bandwidth_hz(56_000);
        pipeline.set_bandwidth_hz(56_000);
        pipeline.set_deemphasis_mode(1);
        pipeline.set_deemphasis_mode(1);
        pipeline.set_force_mono(true);
        pipeline.set_force_mono(true);

        let iq = silence_bytes(BLOCK);
        assert!(pipeline.process(&iq, BLOCK, &mut |_| {}).is_some());
    }

    #[test]
    fn test_zero_samples_rejected() {
        let mut pipeline = DspPipeline::new(IN_RATE, OUT_RATE, true, BLOCK, 1);
        assert!(pipeline.process(&[], 0, &mut |_| {}).is_none());
    }
}
