//! Audio-frequency post-processing.
//!
//! Runs once per channel after the stereo matrix: polyphase resample from
//! the DSP rate to the audio rate, one-pole deemphasis, then a DC blocker
//! (`y = (x - x_prev) + R * y_prev`, R = 0.995) to strip the residual
//! carrier offset the discriminator leaves behind. The resampler carries
//! fractional state, so arbitrary block sizes never drop samples.

use fmtuner::dsp::resampler::RationalResampler;

const DC_BLOCK_R: f32 = 0.995;

struct Channel {
    resampler: RationalResampler,
    deemph_state: f32,
    dc_prev_in: f32,
    dc_prev_out: f32,
}

impl Channel {
    fn new(ratio: f64) -> Self {
        Self {
            resampler: RationalResampler::new(ratio),
            deemph_state: 0.0,
            dc_prev_in: 0.0,
            dc_prev_out: 0.0,
        }
    }

    fn reset(&mut self) {
        self.resampler.reset();
        self.deemph_state = 0.0;
        self.dc_prev_in = 0.0;
        self.dc_prev_out = 0.0;
    }
}

/// Stereo AF post-processor: resample, deemphasize, DC-block.
pub struct AfPostProcessor {
    left: Channel,
    right: Channel,
    output_rate: u32,
    deemph_alpha: f32,
    deemph_enabled: bool,
}

impl AfPostProcessor {
    pub fn new(input_rate: u32, output_rate: u32) -> Self {
        let ratio = output_rate as f64 / input_rate as f64;
        let mut post = Self {
            left: Channel::new(ratio),
            right: Channel::new(ratio),
            output_rate,
            deemph_alpha: 1.0,
            deemph_enabled: true,
        };
        post.set_deemphasis(75);
        post
    }

    /// Re-initialize resampler, deemphasis and DC-block state.
    pub fn reset(&mut self) {
        self.left.reset();
        self.right.reset();
    }

    /// Set deemphasis; `tau_us <= 0` bypasses it.
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

    /// Process up to `in_samples` of each channel, writing at most
    /// `out_left.len().min(out_right.len())` output samples. Returns the
    /// output sample count.
    pub fn process(
        &mut self,
        in_left: &[f32],
        in_right: &[f32],
        out_left: &mut [f32],
        out_right: &mut [f32],
    ) -> usize {
        let in_samples = in_left.len().min(in_right.len());
        let capacity = out_left.len().min(out_right.len());

        let mut out_count = 0;
        let mut left_tmp = [0.0f32; RationalResampler::MAX_OUTPUT];
        let mut right_tmp = [0.0f32; RationalResampler::MAX_OUTPUT];

        for i in 0..in_samples {
            if out_count >= capacity {
                break;
            }
            let left_n = self.left.resampler.execute(in_left[i], &mut left_tmp);
            let right_n = self.right.resampler.execute(in_right[i], &mut right_tmp);
            let produced = left_n.min(right_n);

            for p in 0..produced {
                if out_count >= capacity {
                    break;
                }
                let mut l = left_tmp[p];
                let mut r = right_tmp[p];
                if self.deemph_enabled {
                    self.left.deemph_state += self.deemph_alpha * (l - self.left.deemph_state);
                    self.right.deemph_state += self.deemph_alpha * (r - self.right.deemph_state);
                    l = self.left.deemph_state;
                    r = self.right.deemph_state;
                }

                let dc_l = (l - self.left.dc_prev_in) + DC_BLOCK_R * self.left.dc_prev_out;
                self.left.dc_prev_in = l;
                self.left.dc_prev_out = dc_l;
                let dc_r = (r - self.right.dc_prev_in) + DC_BLOCK_R * self.right.dc_prev_out;
                self.right.dc_prev_in = r;
                self.right.dc_prev_out = dc_r;

                out_left[out_count] = dc_l;
                out_right[out_count] = dc_r;
                out_count += 1;
            }
        }
        out_count
    }
}
