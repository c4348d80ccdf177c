//! Runtime-loop helpers: auto-gain stepping and the retune mute envelope.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::control::XdrCommandState;
use crate::signal::SignalLevelResult;

/// Clip ratio above which the gain steps down.
const OVERLOAD_CLIP_RATIO: f64 = 0.02;
/// Raw level above which the gain steps down, dBFS.
const OVERLOAD_DBFS: f64 = -5.0;
/// Clip ratio below which a gain step up is considered.
const WEAK_CLIP_RATIO: f64 = 5e-4;
/// Compensated level below which a gain step up is considered, dBFS.
const WEAK_COMPENSATED_DBFS: f64 = -47.0;
/// Smoothed 0..120 level below which a gain step up is considered.
const WEAK_LEVEL120: f32 = 35.0;

/// Minimum spacing between gain-down steps.
const GAIN_DOWN_HOLDOFF: Duration = Duration::from_millis(900);
/// Minimum spacing between gain-up steps.
const GAIN_UP_HOLDOFF: Duration = Duration::from_secs(4);

/// Hysteresis timestamps for the auto-gain loop; `None` means the loop has
/// not stepped in that direction yet, so the first step is always allowed.
#[derive(Default)]
pub struct GainTimers {
    pub last_down: Option<Instant>,
    pub last_up: Option<Instant>,
}

/// Step the TEF AGC mode when the tuner front end clips or starves.
///
/// Inactive whenever a manual gain (`cli_gain >= 0`), the hardware AGC
/// (`ims_agc_enabled`) or the sdrpp gain strategy is in charge.
#[allow(clippy::too_many_arguments)]
pub fn maybe_adjust_auto_gain(
    sdrpp_gain_strategy: bool,
    cli_gain: i32,
    ims_agc_enabled: bool,
    state: &XdrCommandState,
    timers: &mut GainTimers,
    signal: &SignalLevelResult,
    clip_ratio: f64,
    rf_level_filtered: f32,
) {
    if sdrpp_gain_strategy || cli_gain >= 0 || ims_agc_enabled {
        return;
    }

    let now = Instant::now();
    let overload = clip_ratio > OVERLOAD_CLIP_RATIO || signal.dbfs > OVERLOAD_DBFS;
    let weak = clip_ratio < WEAK_CLIP_RATIO
        && signal.compensated_dbfs < WEAK_COMPENSATED_DBFS
        && rf_level_filtered < WEAK_LEVEL120;

    use std::sync::atomic::Ordering;
    let down_allowed = timers
        .last_down
        .map_or(true, |t| now.duration_since(t) >= GAIN_DOWN_HOLDOFF);
    let up_allowed = timers
        .last_up
        .map_or(true, |t| now.duration_since(t) >= GAIN_UP_HOLDOFF);

    if overload && down_allowed {
        let current = state.requested_agc_mode.load(Ordering::Relaxed).clamp(0, 3);
        if current < 3 {
            state.requested_agc_mode.store(current + 1, Ordering::Relaxed);
            state.pending_agc.store(true, Ordering::Release);
            timers.last_down = Some(now);
            debug!(
                "clip-protect: A{} -> A{} (dbfs={:.2}, clip={:.4})",
                current,
                current + 1,
                signal.dbfs,
                clip_ratio
            );
        }
    } else if weak && up_allowed {
        let current = state.requested_agc_mode.load(Ordering::Relaxed).clamp(0, 3);
        if current > 0 {
            state.requested_agc_mode.store(current - 1, Ordering::Relaxed);
            state.pending_agc.store(true, Ordering::Release);
            timers.last_up = Some(now);
            debug!(
                "sensitivity-up: A{} -> A{} (comp={:.2}, clip={:.4})",
                current,
                current - 1,
                signal.compensated_dbfs,
                clip_ratio
            );
        }
    }
}

/// Retune mute window state.
///
/// Arming seeds both the total window length and the remaining counter;
/// blocks are shaped until the counter drains. The envelope fades in from
/// silence over `R = min(fs_out/200, N/2)` samples at the front of the
/// window, runs at unity through the middle, and fades back to silence
/// over the final `R` samples, so neither the tuner re-lock click nor the
/// resumption edge reaches the speaker.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetuneMute {
    remaining: usize,
    total: usize,
}

impl RetuneMute {
    /// Start a mute window of `total` samples.
    pub fn arm(&mut self, total: usize) {
        self.remaining = total;
        self.total = total;
    }

    /// True while a window is draining.
    pub fn is_active(&self) -> bool {
        self.remaining > 0
    }

    /// Shape one audio block in place; consumes up to `out_samples` of the
    /// remaining window.
    pub fn apply(&mut self, left: &mut [f32], right: &mut [f32], out_samples: usize, ramp: usize) {
        if self.remaining == 0 || out_samples == 0 {
            return;
        }
        let count = out_samples.min(self.remaining).min(left.len()).min(right.len());
        let already = self.total - self.remaining;
        let fade = ramp.min(self.total / 2).max(1);

        for i in 0..count {
            let idx = already + i;
            let gain = if idx < fade {
                idx as f32 / fade as f32
            } else if idx >= self.total - fade {
                (self.total - 1 - idx) as f32 / fade as f32
            } else {
                1.0
            }
            .clamp(0.0, 1.0);
            left[i] *= gain;
            right[i] *= gain;
        }

        self.remaining -= count;
        if self.remaining == 0 {
            self.total = 0;
        }
    }
}
