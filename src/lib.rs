#![doc = include_str!("../readme.md")]

pub mod dsp;
pub mod error;
pub mod rtltcp;
#[cfg(feature = "rtlsdr")]
pub mod rtlsdr;
pub mod tuner;

pub use error::{Error, Result};
pub use tuner::{Tuner, TunerSource};

/// Fixed internal DSP rate of the receiver chain, in samples per second.
///
/// Tuner sample rates must be an integer multiple of this; the quotient is
/// the I/Q decimation factor.
pub const DSP_RATE: u32 = 256_000;

/// Audio output rate, in samples per second.
pub const AUDIO_RATE: u32 = 32_000;

/// Validate a tuner sample rate against [`DSP_RATE`] and return the
/// decimation factor.
///
/// # Example
///
/// ```
/// use fmtuner::iq_decimation;
///
/// assert_eq!(iq_decimation(2_048_000).unwrap(), 8);
/// assert!(iq_decimation(123_456).is_err());
/// ```
pub fn iq_decimation(iq_sample_rate: u32) -> Result<usize> {
    if iq_sample_rate == 0 || iq_sample_rate % DSP_RATE != 0 {
        return Err(Error::RateMismatch {
            rate_hz: iq_sample_rate,
            dsp_rate_hz: DSP_RATE,
        });
    }
    Ok((iq_sample_rate / DSP_RATE) as usize)
}
