//! Shared control-plane request registers.
//!
//! One value of [`XdrCommandState`] is owned by the application and
//! borrowed by both the control server threads (writers) and the pipeline
//! loop (the only reader). Every request cell has a paired pending flag
//! that the pipeline consumes with test-and-clear semantics; the pipeline
//! never writes a request cell back.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

/// Atomic request registers written by the control plane.
pub struct XdrCommandState {
    pub requested_frequency_hz: AtomicU32,
    pub requested_custom_gain: AtomicI32,
    pub requested_agc_mode: AtomicI32,
    pub requested_bandwidth_hz: AtomicI32,
    pub requested_volume: AtomicI32,
    pub requested_deemphasis: AtomicI32,
    pub requested_force_mono: AtomicBool,

    pub pending_frequency: AtomicBool,
    pub pending_gain: AtomicBool,
    pub pending_agc: AtomicBool,
    pub pending_bandwidth: AtomicBool,

    pub pending_start: AtomicBool,
    pub pending_stop: AtomicBool,
}

impl XdrCommandState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        frequency_hz: u32,
        custom_gain: i32,
        agc_mode: i32,
        bandwidth_hz: i32,
        volume_percent: i32,
        deemphasis_mode: i32,
        force_mono: bool,
    ) -> Self {
        Self {
            requested_frequency_hz: AtomicU32::new(frequency_hz),
            requested_custom_gain: AtomicI32::new(custom_gain),
            requested_agc_mode: AtomicI32::new(agc_mode.clamp(0, 3)),
            requested_bandwidth_hz: AtomicI32::new(bandwidth_hz.clamp(0, 400_000)),
            requested_volume: AtomicI32::new(volume_percent.clamp(0, 100)),
            requested_deemphasis: AtomicI32::new(deemphasis_mode.clamp(0, 2)),
            requested_force_mono: AtomicBool::new(force_mono),
            pending_frequency: AtomicBool::new(false),
            pending_gain: AtomicBool::new(false),
            pending_agc: AtomicBool::new(false),
            pending_bandwidth: AtomicBool::new(false),
            pending_start: AtomicBool::new(false),
            pending_stop: AtomicBool::new(false),
        }
    }

    /// Request a retune.
    pub fn request_frequency(&self, freq_hz: u32) {
        self.requested_frequency_hz.store(freq_hz, Ordering::Relaxed);
        self.pending_frequency.store(true, Ordering::Release);
    }

    /// Request the TEF-style custom gain flags (RF*10 + IF digits).
    pub fn request_custom_gain(&self, flags: i32) {
        let rf = i32::from((flags / 10) % 10 != 0);
        let ifv = i32::from(flags % 10 != 0);
        self.requested_custom_gain
            .store(rf * 10 + ifv, Ordering::Relaxed);
        self.pending_gain.store(true, Ordering::Release);
    }

    /// Request an AGC mode, clamped to 0..=3.
    pub fn request_agc_mode(&self, mode: i32) {
        self.requested_agc_mode
            .store(mode.clamp(0, 3), Ordering::Relaxed);
        self.pending_agc.store(true, Ordering::Release);
    }

    /// Request a channel bandwidth, clamped to [0, 400 kHz].
    pub fn request_bandwidth(&self, bandwidth_hz: i32) {
        self.requested_bandwidth_hz
            .store(bandwidth_hz.clamp(0, 400_000), Ordering::Relaxed);
        self.pending_bandwidth.store(true, Ordering::Release);
    }

    /// Consume a pending flag (test-and-clear; pipeline side only).
    pub fn take(flag: &AtomicBool) -> bool {
        flag.swap(false, Ordering::AcqRel)
    }
}
