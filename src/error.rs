//! Receiver fault taxonomy.
//!
//! Failures in this crate fall into a handful of distinct domains, and the
//! recovery policy differs per domain, so each gets its own variant with
//! the data a caller needs to act on it:
//!
//! - connection-establishment faults carry the backend name and cause, and
//!   are retried by the session layer when auto-reconnect is on;
//! - an operation on a closed link is a state fault, never retried;
//! - rtl_tcp wire desync names what was expected and what actually arrived,
//!   because the only cure is a reconnect, not a resend;
//! - plain I/O faults keep the failed operation and the underlying
//!   `io::Error` as `source()`;
//! - rate and range violations are rejected before any hardware is touched
//!   and report the violated bound, not just "invalid value".
//!
//! There is deliberately no catch-all variant and no blanket
//! `From<io::Error>`: every I/O failure is tagged with the operation that
//! produced it at the call site.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// A specialized Result type for receiver operations
pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong, grouped by failure domain.
#[derive(Debug)]
pub enum Error {
    /// A tuner backend could not be reached or opened.
    Connect {
        /// Backend name (`rtl_tcp`, `rtl_sdr`).
        backend: &'static str,
        detail: String,
    },

    /// An operation was attempted on a backend that holds no open
    /// connection or device.
    NotConnected { backend: &'static str },

    /// The rtl_tcp byte stream stopped following the wire protocol; the
    /// link must be torn down and re-established.
    Desync {
        /// Which protocol element was being read.
        expected: &'static str,
        /// What actually arrived (or how the read ended).
        found: String,
    },

    /// An I/O operation on an open socket, device or file failed.
    Io {
        operation: &'static str,
        source: io::Error,
    },

    /// The tuner sample rate does not divide down to the DSP rate.
    RateMismatch { rate_hz: u32, dsp_rate_hz: u32 },

    /// A requested setting violates a hard bound of the hardware or the
    /// DSP chain.
    OutOfRange {
        setting: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// A configuration file could not be read or parsed.
    ConfigFile { path: PathBuf, detail: String },

    /// The audio subsystem failed (device lookup, WAV sink, stream).
    Audio {
        /// Which stage failed (`device`, `wav`, `stream`).
        stage: &'static str,
        detail: String,
    },

    /// A component that must be started at most once was started again.
    AlreadyRunning { what: &'static str },

    /// Fault reported by the RTL-SDR USB driver (requires the `rtlsdr`
    /// feature).
    #[cfg(feature = "rtlsdr")]
    Driver(rtl_sdr_rs::error::RtlsdrError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connect { backend, detail } => {
                write!(f, "cannot connect to {}: {}", backend, detail)
            }
            Error::NotConnected { backend } => write!(f, "{} is not connected", backend),
            Error::Desync { expected, found } => {
                write!(
                    f,
                    "rtl_tcp stream desync, expected {}, found {}",
                    expected, found
                )
            }
            Error::Io { operation, source } => write!(f, "{} failed: {}", operation, source),
            Error::RateMismatch {
                rate_hz,
                dsp_rate_hz,
            } => write!(
                f,
                "IQ sample rate {} Hz is not an integer multiple of the {} Hz DSP rate",
                rate_hz, dsp_rate_hz
            ),
            Error::OutOfRange {
                setting,
                value,
                min,
                max,
            } => write!(f, "{} {} outside [{}, {}]", setting, value, min, max),
            Error::ConfigFile { path, detail } => {
                write!(f, "config file {}: {}", path.display(), detail)
            }
            Error::Audio { stage, detail } => write!(f, "audio {}: {}", stage, detail),
            Error::AlreadyRunning { what } => write!(f, "{} is already running", what),
            #[cfg(feature = "rtlsdr")]
            Error::Driver(err) => write!(f, "RTL-SDR driver: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(feature = "rtlsdr")]
impl From<rtl_sdr_rs::error::RtlsdrError> for Error {
    fn from(err: rtl_sdr_rs::error::RtlsdrError) -> Self {
        Error::Driver(err)
    }
}

impl Error {
    /// Connection-establishment fault for `backend`.
    pub fn connect(backend: &'static str, detail: impl Into<String>) -> Self {
        Error::Connect {
            backend,
            detail: detail.into(),
        }
    }

    /// Operation attempted on a closed `backend`.
    pub fn not_connected(backend: &'static str) -> Self {
        Error::NotConnected { backend }
    }

    /// rtl_tcp wire desync: `expected` names the protocol element,
    /// `found` what arrived instead.
    pub fn desync(expected: &'static str, found: impl Into<String>) -> Self {
        Error::Desync {
            expected,
            found: found.into(),
        }
    }

    /// Tag an `io::Error` with the operation that produced it.
    pub fn io(operation: &'static str, source: io::Error) -> Self {
        Error::Io { operation, source }
    }

    /// Audio subsystem fault at `stage`.
    pub fn audio(stage: &'static str, detail: impl Into<String>) -> Self {
        Error::Audio {
            stage,
            detail: detail.into(),
        }
    }
}
