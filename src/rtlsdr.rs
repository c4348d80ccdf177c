//! Direct RTL-SDR USB backend (requires the `rtlsdr` feature).

use rtl_sdr_rs::{RtlSdr, TunerGain, DEFAULT_BUF_LENGTH};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A locally attached RTL2832 dongle.
///
/// Wraps `rtl_sdr_rs` with the same connect/read surface as the rtl_tcp
/// client so the two can sit behind one [`Tuner`](crate::tuner::Tuner)
/// value. Reads are buffered: the device delivers fixed USB transfers and
/// the caller drains them at its own block size.
pub struct RtlSdrDevice {
    device_index: usize,
    device: Option<RtlSdr>,
    buf: Vec<u8>,
    pos: usize,
    end: usize,
    low_latency: bool,
}

impl RtlSdrDevice {
    /// Create a handle for device `device_index`; nothing is opened yet.
    pub fn new(device_index: usize) -> Self {
        Self {
            device_index,
            device: None,
            buf: vec![0u8; DEFAULT_BUF_LENGTH],
            pos: 0,
            end: 0,
            low_latency: false,
        }
    }

    /// In low-latency mode the USB transfer buffer shrinks so retunes take
    /// effect within a few milliseconds of stream data.
    pub fn set_low_latency_mode(&mut self, enable: bool) {
        self.low_latency = enable;
        let len = if enable { 16_384 } else { DEFAULT_BUF_LENGTH };
        self.buf = vec![0u8; len];
        self.pos = 0;
        self.end = 0;
    }

    /// True when the device is open.
    pub fn is_connected(&self) -> bool {
        self.device.is_some()
    }

    /// Open the device and reset its streaming buffer.
    pub fn connect(&mut self) -> Result<()> {
        let mut device = RtlSdr::open_with_index(self.device_index)?;
        let _ = device.set_bias_tee(false);
        device.reset_buffer()?;
        debug!("rtl_sdr device {} opened", self.device_index);
        self.device = Some(device);
        self.pos = 0;
        self.end = 0;
        Ok(())
    }

    /// Close the device.
    pub fn disconnect(&mut self) {
        self.device = None;
    }

    fn with_device<T>(&mut self, f: impl FnOnce(&mut RtlSdr) -> Result<T>) -> Result<T> {
        match self.device.as_mut() {
            Some(d) => f(d),
            None => Err(Error::not_connected("rtl_sdr")),
        }
    }

    /// Tune to `freq_hz`.
    pub fn set_frequency(&mut self, freq_hz: u32) -> Result<()> {
        self.with_device(|d| Ok(d.set_center_freq(freq_hz)?))
    }

    /// Set the device sample rate.
    pub fn set_sample_rate(&mut self, rate_hz: u32) -> Result<()> {
        self.with_device(|d| Ok(d.set_sample_rate(rate_hz)?))
    }

    /// Apply a frequency correction in ppm.
    pub fn set_frequency_correction(&mut self, ppm: i32) -> Result<()> {
        self.with_device(|d| Ok(d.set_freq_correction(ppm)?))
    }

    /// Switch between manual and automatic tuner gain.
    ///
    /// The underlying driver folds gain mode into the gain call, so manual
    /// mode is recorded and applied together with [`set_gain`](Self::set_gain).
    pub fn set_gain_mode(&mut self, manual: bool) -> Result<()> {
        if !manual {
            self.with_device(|d| Ok(d.set_tuner_gain(TunerGain::Auto)?))
        } else {
            Ok(())
        }
    }

    /// Set the tuner gain in tenths of a dB (manual mode).
    pub fn set_gain(&mut self, gain_tenths_db: u32) -> Result<()> {
        self.with_device(|d| Ok(d.set_tuner_gain(TunerGain::Manual(gain_tenths_db as i32))?))
    }

    /// Enable or disable the RTL2832 digital AGC.
    pub fn set_agc(&mut self, enable: bool) -> Result<()> {
        self.with_device(|d| Ok(d.set_agc_mode(enable)?))
    }

    /// Read up to `max_samples` complex samples of raw I/Q into `buffer`.
    ///
    /// Returns the number of complete complex samples (bytes / 2); zero on
    /// read failure or when disconnected.
    pub fn read_iq(&mut self, buffer: &mut [u8], max_samples: usize) -> usize {
        let device = match self.device.as_mut() {
            Some(d) => d,
            None => return 0,
        };

        let wanted = (max_samples * 2).min(buffer.len());
        let mut total = 0;
        while total < wanted {
            if self.pos >= self.end {
                match device.read_sync(&mut self.buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        self.pos = 0;
                        self.end = n;
                    }
                    Err(e) => {
                        warn!("rtl_sdr read error: {}", e);
                        break;
                    }
                }
            }
            let take = (self.end - self.pos).min(wanted - total);
            buffer[total..total + take].copy_from_slice(&self.buf[self.pos..self.pos + take]);
            self.pos += take;
            total += take;
        }
        total / 2
    }
}
