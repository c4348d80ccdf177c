//! RF signal level estimation from raw tuner I/Q.
//!
//! The level pipeline is: average I/Q power over a block, convert to dBFS,
//! compensate for the gain actually applied at the tuner, bias, clamp and
//! map onto the 0..120 scale the XDR clients display. Clip ratios come
//! straight from the byte stream: a tuner byte pinned at 0 or 255 means the
//! ADC ran out of headroom.

/// Near-clip margin in byte counts: samples within this distance of the
/// rails count toward [`SignalLevelResult::near_clip_ratio`].
const NEAR_CLIP_MARGIN: u8 = 3;

/// One block's worth of level measurements.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalLevelResult {
    /// Raw block power in dB relative to full scale.
    pub dbfs: f64,
    /// `dbfs` with applied-gain compensation and bias.
    pub compensated_dbfs: f64,
    /// `compensated_dbfs` clamped and mapped linearly onto 0..120.
    pub level120: f32,
    /// Fraction of bytes exactly at 0 or 255.
    pub hard_clip_ratio: f64,
    /// Fraction of bytes at or inside the near-clip margin.
    pub near_clip_ratio: f64,
}

/// Measure a block of raw u8 I/Q.
///
/// `samples` is the complex sample count; `iq` must hold at least
/// `2 * samples` bytes. `applied_gain_db` is the gain the tuner is known to
/// be running with, and `gain_comp_factor` scales how much of it is
/// subtracted back out of the reading.
pub fn compute_signal_level(
    iq: &[u8],
    samples: usize,
    applied_gain_db: i32,
    gain_comp_factor: f64,
    bias_db: f64,
    floor_dbfs: f64,
    ceil_dbfs: f64,
) -> SignalLevelResult {
    let bytes = &iq[..(samples * 2).min(iq.len())];
    if bytes.is_empty() {
        return SignalLevelResult::default();
    }

    let mut power = 0.0f64;
    let mut hard_clipped = 0usize;
    let mut near_clipped = 0usize;
    for pair in bytes.chunks_exact(2) {
        for &b in pair {
            if b == 0 || b == 255 {
                hard_clipped += 1;
            }
            if b <= NEAR_CLIP_MARGIN || b >= 255 - NEAR_CLIP_MARGIN {
                near_clipped += 1;
            }
        }
        let i = (pair[0] as f64 - 127.5) / 127.5;
        let q = (pair[1] as f64 - 127.5) / 127.5;
        power += i * i + q * q;
    }
    let count = (bytes.len() / 2).max(1);
    let avg_power = power / count as f64;

    let dbfs = 10.0 * (avg_power + 1e-12).log10();
    let compensated_dbfs = dbfs - applied_gain_db as f64 * gain_comp_factor + bias_db;

    let safe_ceil = ceil_dbfs.max(floor_dbfs + 1.0);
    let clipped = compensated_dbfs.clamp(floor_dbfs, safe_ceil);
    let level120 = (((clipped - floor_dbfs) / (safe_ceil - floor_dbfs)) * 120.0) as f32;

    SignalLevelResult {
        dbfs,
        compensated_dbfs,
        level120,
        hard_clip_ratio: hard_clipped as f64 / bytes.len() as f64,
        near_clip_ratio: near_clipped as f64 / bytes.len() as f64,
    }
}

/// State for the asymmetric one-pole level smoother.
///
/// Rising levels are tracked faster than falling ones so a station popping
/// up is visible immediately while fades decay gently.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalLevelSmoother {
    state: Option<f32>,
}

/// Smoothing coefficient used when the input is above the current state.
const SMOOTH_RISE: f32 = 0.25;
/// Smoothing coefficient used when the input is below the current state.
const SMOOTH_FALL: f32 = 0.05;

/// Smooth one level sample. The first call seeds the state with `x`.
pub fn smooth_signal_level(x: f32, smoother: &mut SignalLevelSmoother) -> f32 {
    let state = match smoother.state {
        None => x,
        Some(prev) => {
            let coeff = if x > prev { SMOOTH_RISE } else { SMOOTH_FALL };
            prev + (x - prev) * coeff
        }
    };
    smoother.state = Some(state);
    state
}
