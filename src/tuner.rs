//! Tuner capability over the two supported backends.
//!
//! A [`Tuner`] is a tagged enum over the rtl_tcp network client and the
//! direct USB device, in the same spirit as an enum of I/Q sources: one
//! value, one call surface, no trait-object hierarchy. Setters are fallible
//! but a failure never takes the receive loop down; callers log and carry on.

use tracing::warn;

use crate::error::{Error, Result};
use crate::rtltcp::RtlTcpClient;

#[cfg(feature = "rtlsdr")]
use crate::rtlsdr::RtlSdrDevice;

/// Which backend a [`Tuner`] should drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerSource {
    /// rtl_tcp network client
    RtlTcp,
    /// Direct USB device (requires the `rtlsdr` feature)
    RtlSdr,
}

/// Valid range for frequency correction, in ppm.
pub const PPM_RANGE: std::ops::RangeInclusive<i32> = -250..=250;

/// A tuner: either an rtl_tcp client or a local RTL-SDR dongle.
pub enum Tuner {
    /// rtl_tcp backend
    RtlTcp(RtlTcpClient),
    /// Direct USB backend (requires the `rtlsdr` feature)
    #[cfg(feature = "rtlsdr")]
    RtlSdr(RtlSdrDevice),
}

impl Tuner {
    /// Build the rtl_tcp backend.
    pub fn from_rtl_tcp(host: impl Into<String>, port: u16) -> Self {
        Tuner::RtlTcp(RtlTcpClient::new(host, port))
    }

    /// Build the direct USB backend.
    #[cfg(feature = "rtlsdr")]
    pub fn from_rtl_sdr(device_index: usize) -> Self {
        Tuner::RtlSdr(RtlSdrDevice::new(device_index))
    }

    /// Backend name for logs and status output.
    pub fn name(&self) -> &'static str {
        match self {
            Tuner::RtlTcp(_) => "rtl_tcp",
            #[cfg(feature = "rtlsdr")]
            Tuner::RtlSdr(_) => "rtl_sdr",
        }
    }

    /// True when the backend currently holds an open connection or device.
    pub fn is_connected(&self) -> bool {
        match self {
            Tuner::RtlTcp(c) => c.is_connected(),
            #[cfg(feature = "rtlsdr")]
            Tuner::RtlSdr(d) => d.is_connected(),
        }
    }

    /// Shrink I/O buffering so retunes take effect quickly (USB backend
    /// only; the network client is already small-buffered).
    pub fn set_low_latency_mode(&mut self, enable: bool) {
        match self {
            Tuner::RtlTcp(_) => {}
            #[cfg(feature = "rtlsdr")]
            Tuner::RtlSdr(d) => d.set_low_latency_mode(enable),
        }
        let _ = enable;
    }

    /// Connect the backend.
    pub fn connect(&mut self) -> Result<()> {
        match self {
            Tuner::RtlTcp(c) => c.connect(),
            #[cfg(feature = "rtlsdr")]
            Tuner::RtlSdr(d) => d.connect(),
        }
    }

    /// Disconnect the backend; safe to call when already disconnected.
    pub fn disconnect(&mut self) {
        match self {
            Tuner::RtlTcp(c) => c.disconnect(),
            #[cfg(feature = "rtlsdr")]
            Tuner::RtlSdr(d) => d.disconnect(),
        }
    }

    /// Tune to `freq_hz`.
    pub fn set_frequency(&mut self, freq_hz: u32) -> Result<()> {
        match self {
            Tuner::RtlTcp(c) => c.set_frequency(freq_hz),
            #[cfg(feature = "rtlsdr")]
            Tuner::RtlSdr(d) => d.set_frequency(freq_hz),
        }
    }

    /// Set the device sample rate.
    pub fn set_sample_rate(&mut self, rate_hz: u32) -> Result<()> {
        match self {
            Tuner::RtlTcp(c) => c.set_sample_rate(rate_hz),
            #[cfg(feature = "rtlsdr")]
            Tuner::RtlSdr(d) => d.set_sample_rate(rate_hz),
        }
    }

    /// Apply a frequency correction; ppm outside [-250, 250] is rejected.
    pub fn set_frequency_correction(&mut self, ppm: i32) -> Result<()> {
        if !PPM_RANGE.contains(&ppm) {
            return Err(Error::OutOfRange {
                setting: "frequency correction ppm",
                value: ppm as i64,
                min: *PPM_RANGE.start() as i64,
                max: *PPM_RANGE.end() as i64,
            });
        }
        match self {
            Tuner::RtlTcp(c) => c.set_frequency_correction(ppm),
            #[cfg(feature = "rtlsdr")]
            Tuner::RtlSdr(d) => d.set_frequency_correction(ppm),
        }
    }

    /// Switch between manual and automatic tuner gain.
    pub fn set_gain_mode(&mut self, manual: bool) -> Result<()> {
        match self {
            Tuner::RtlTcp(c) => c.set_gain_mode(manual),
            #[cfg(feature = "rtlsdr")]
            Tuner::RtlSdr(d) => d.set_gain_mode(manual),
        }
    }

    /// Set the tuner gain in tenths of a dB.
    pub fn set_gain(&mut self, gain_tenths_db: u32) -> Result<()> {
        match self {
            Tuner::RtlTcp(c) => c.set_gain(gain_tenths_db),
            #[cfg(feature = "rtlsdr")]
            Tuner::RtlSdr(d) => d.set_gain(gain_tenths_db),
        }
    }

    /// Enable or disable the RTL2832 digital AGC.
    pub fn set_agc(&mut self, enable: bool) -> Result<()> {
        match self {
            Tuner::RtlTcp(c) => c.set_agc(enable),
            #[cfg(feature = "rtlsdr")]
            Tuner::RtlSdr(d) => d.set_agc(enable),
        }
    }

    /// Read up to `max_samples` complex samples of raw u8 I/Q.
    ///
    /// Returns the number of complete complex samples written (bytes / 2).
    pub fn read_iq(&mut self, buffer: &mut [u8], max_samples: usize) -> usize {
        match self {
            Tuner::RtlTcp(c) => c.read_iq(buffer, max_samples),
            #[cfg(feature = "rtlsdr")]
            Tuner::RtlSdr(d) => d.read_iq(buffer, max_samples),
        }
    }

    /// Apply a setter result: log a failure and report whether it succeeded.
    ///
    /// Convenience for the pattern where a failed tuner command must not
    /// abort the pipeline.
    pub fn log_if_failed(what: &str, result: Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("tuner {} failed: {}", what, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtl_tcp_variant_name() {
        let tuner = Tuner::from_rtl_tcp("localhost", 1234);
        assert_eq!(tuner.name(), "rtl_tcp");
        assert!(!tuner.is_connected());
    }

    #[test]
    fn test_ppm_range_enforced() {
        let mut tuner = Tuner::from_rtl_tcp("localhost", 1234);
        assert!(tuner.set_frequency_correction(300).is_err());
        assert!(tuner.set_frequency_correction(-300).is_err());
    }

    #[test]
    fn test_log_if_failed() {
        assert!(Tuner::log_if_failed("noop", Ok(())));
        assert!(!Tuner::log_if_failed(
            "boom",
            Err(Error::not_connected("rtl_tcp"))
        ));
    }
}
