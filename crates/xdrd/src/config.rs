//! INI configuration.
//!
//! Sections: `[rtl_tcp]`, `[audio]`, `[tuner]`, `[xdr]`, `[processing]`,
//! `[sdr]`, `[debug]`, `[reconnection]`. Unknown sections and keys are
//! ignored; out-of-range numbers are clamped or dropped per field; booleans
//! accept `1/0`, `true/false`, `yes/no`, `on/off` in any case.

use std::path::Path;

use configparser::ini::Ini;
use tracing::warn;

use fmtuner::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RtlTcpSection {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct AudioSection {
    pub device: String,
    pub startup_volume: i32,
}

#[derive(Debug, Clone)]
pub struct TunerSection {
    /// Startup frequency in kHz.
    pub default_freq: u32,
    /// 0 = 50 us, 1 = 75 us, 2 = off.
    pub deemphasis: i32,
}

#[derive(Debug, Clone)]
pub struct XdrSection {
    pub port: u16,
    pub password: String,
    pub guest_mode: bool,
}

#[derive(Debug, Clone)]
pub struct ProcessingSection {
    pub agc_mode: i32,
    pub client_gain_allowed: bool,
    pub stereo: bool,
    pub rds: bool,
    pub dsp_block_samples: usize,
    /// `fast` or `exact`.
    pub discriminator: String,
    /// `off`, `fast` or `slow`.
    pub dsp_agc: String,
}

#[derive(Debug, Clone)]
pub struct SdrSection {
    pub signal_bias_db: f64,
    pub signal_floor_dbfs: f64,
    pub signal_ceil_dbfs: f64,
    pub freq_correction_ppm: i32,
    pub low_latency_iq: bool,
    pub default_custom_gain_flags: i32,
    /// `tef` (AGC-mode gain table) or `sdrpp` (fixed gain + RTL AGC).
    pub gain_strategy: String,
    pub sdrpp_rtl_agc: bool,
    pub sdrpp_rtl_agc_gain_db: i32,
}

#[derive(Debug, Clone)]
pub struct DebugSection {
    pub log_level: i32,
}

#[derive(Debug, Clone)]
pub struct ReconnectionSection {
    pub auto_reconnect: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rtl_tcp: RtlTcpSection,
    pub audio: AudioSection,
    pub tuner: TunerSection,
    pub xdr: XdrSection,
    pub processing: ProcessingSection,
    pub sdr: SdrSection,
    pub debug: DebugSection,
    pub reconnection: ReconnectionSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rtl_tcp: RtlTcpSection {
                host: "localhost".into(),
                port: 1234,
            },
            audio: AudioSection {
                device: String::new(),
                startup_volume: 100,
            },
            tuner: TunerSection {
                default_freq: 88_600,
                deemphasis: 0,
            },
            xdr: XdrSection {
                port: 7373,
                password: String::new(),
                guest_mode: false,
            },
            processing: ProcessingSection {
                agc_mode: 2,
                client_gain_allowed: true,
                stereo: true,
                rds: true,
                dsp_block_samples: 8192,
                discriminator: "exact".into(),
                dsp_agc: "off".into(),
            },
            sdr: SdrSection {
                signal_bias_db: 0.0,
                signal_floor_dbfs: -90.0,
                signal_ceil_dbfs: -15.0,
                freq_correction_ppm: 0,
                low_latency_iq: false,
                default_custom_gain_flags: 0,
                gain_strategy: "tef".into(),
                sdrpp_rtl_agc: false,
                sdrpp_rtl_agc_gain_db: 30,
            },
            debug: DebugSection { log_level: 1 },
            reconnection: ReconnectionSection {
                auto_reconnect: true,
            },
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

struct Loader {
    ini: Ini,
}

impl Loader {
    fn string(&self, section: &str, key: &str, into: &mut String) {
        if let Some(value) = self.ini.get(section, key) {
            *into = value;
        }
    }

    fn bool(&self, section: &str, key: &str, into: &mut bool) {
        if let Some(raw) = self.ini.get(section, key) {
            match parse_bool(&raw) {
                Some(value) => *into = value,
                None => warn!("config [{}] {}: not a boolean: {}", section, key, raw),
            }
        }
    }

    fn int(&self, section: &str, key: &str, range: std::ops::RangeInclusive<i64>, into: &mut i64) {
        if let Some(raw) = self.ini.get(section, key) {
            match raw.trim().parse::<i64>() {
                Ok(value) => *into = value.clamp(*range.start(), *range.end()),
                Err(_) => warn!("config [{}] {}: not an integer: {}", section, key, raw),
            }
        }
    }

    fn float(&self, section: &str, key: &str, into: &mut f64) {
        if let Some(raw) = self.ini.get(section, key) {
            match raw.trim().parse::<f64>() {
                Ok(value) => *into = value,
                Err(_) => warn!("config [{}] {}: not a number: {}", section, key, raw),
            }
        }
    }
}

impl Config {
    /// Load and merge a config file over the defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let mut ini = Ini::new();
        ini.load(path).map_err(|e| Error::ConfigFile {
            path: path.to_path_buf(),
            detail: e,
        })?;
        let loader = Loader { ini };
        let mut config = Config::default();

        loader.string("rtl_tcp", "host", &mut config.rtl_tcp.host);
        let mut port = config.rtl_tcp.port as i64;
        loader.int("rtl_tcp", "port", 1..=65_535, &mut port);
        config.rtl_tcp.port = port as u16;

        loader.string("audio", "device", &mut config.audio.device);
        let mut volume = config.audio.startup_volume as i64;
        loader.int("audio", "startup_volume", 0..=100, &mut volume);
        config.audio.startup_volume = volume as i32;

        let mut freq = config.tuner.default_freq as i64;
        loader.int("tuner", "default_freq", 1..=i64::from(u32::MAX), &mut freq);
        config.tuner.default_freq = freq as u32;
        let mut deemphasis = config.tuner.deemphasis as i64;
        loader.int("tuner", "deemphasis", 0..=2, &mut deemphasis);
        config.tuner.deemphasis = deemphasis as i32;

        let mut xdr_port = config.xdr.port as i64;
        loader.int("xdr", "port", 1..=65_535, &mut xdr_port);
        config.xdr.port = xdr_port as u16;
        loader.string("xdr", "password", &mut config.xdr.password);
        loader.bool("xdr", "guest_mode", &mut config.xdr.guest_mode);
        loader.bool("xdr", "guest", &mut config.xdr.guest_mode);

        let mut agc_mode = config.processing.agc_mode as i64;
        loader.int("processing", "agc_mode", 0..=3, &mut agc_mode);
        config.processing.agc_mode = agc_mode as i32;
        loader.bool(
            "processing",
            "client_gain_allowed",
            &mut config.processing.client_gain_allowed,
        );
        loader.bool(
            "processing",
            "allow_client_gain_override",
            &mut config.processing.client_gain_allowed,
        );
        loader.bool("processing", "stereo", &mut config.processing.stereo);
        loader.bool("processing", "rds", &mut config.processing.rds);
        let mut block = config.processing.dsp_block_samples as i64;
        loader.int("processing", "dsp_block_samples", 1024..=32_768, &mut block);
        config.processing.dsp_block_samples = block as usize;
        loader.string(
            "processing",
            "discriminator",
            &mut config.processing.discriminator,
        );
        loader.string("processing", "dsp_agc", &mut config.processing.dsp_agc);

        loader.float("sdr", "signal_bias_db", &mut config.sdr.signal_bias_db);
        loader.float("sdr", "signal_floor_dbfs", &mut config.sdr.signal_floor_dbfs);
        loader.float("sdr", "signal_ceil_dbfs", &mut config.sdr.signal_ceil_dbfs);
        let mut ppm = config.sdr.freq_correction_ppm as i64;
        loader.int("sdr", "freq_correction_ppm", -250..=250, &mut ppm);
        config.sdr.freq_correction_ppm = ppm as i32;
        loader.bool("sdr", "low_latency_iq", &mut config.sdr.low_latency_iq);
        let mut gain_flags = config.sdr.default_custom_gain_flags as i64;
        loader.int("sdr", "default_custom_gain_flags", 0..=99, &mut gain_flags);
        config.sdr.default_custom_gain_flags = gain_flags as i32;
        loader.string("sdr", "gain_strategy", &mut config.sdr.gain_strategy);
        loader.bool("sdr", "sdrpp_rtl_agc", &mut config.sdr.sdrpp_rtl_agc);
        let mut sdrpp_gain = config.sdr.sdrpp_rtl_agc_gain_db as i64;
        loader.int("sdr", "sdrpp_rtl_agc_gain_db", 0..=49, &mut sdrpp_gain);
        config.sdr.sdrpp_rtl_agc_gain_db = sdrpp_gain as i32;

        let mut log_level = config.debug.log_level as i64;
        loader.int("debug", "log_level", 0..=3, &mut log_level);
        config.debug.log_level = log_level as i32;

        loader.bool(
            "reconnection",
            "auto_reconnect",
            &mut config.reconnection.auto_reconnect,
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn load(content: &str) -> Config {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "xdrd_config_test_{}_{}.ini",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        drop(file);
        let config = Config::load_from_file(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        config
    }

    #[test]
    fn test_defaults_without_file_content() {
        let config = load("");
        assert_eq!(config.rtl_tcp.host, "localhost");
        assert_eq!(config.rtl_tcp.port, 1234);
        assert_eq!(config.xdr.port, 7373);
        assert!(config.processing.stereo);
        assert!(config.reconnection.auto_reconnect);
        assert_eq!(config.processing.dsp_block_samples, 8192);
    }

    #[test]
    fn test_sections_parsed() {
        let config = load(
            "[rtl_tcp]\nhost = radio.local\nport = 9999\n\
             [tuner]\ndefault_freq = 101700\ndeemphasis = 1\n\
             [xdr]\npassword = hunter2\nguest = yes\n\
             [processing]\nstereo = off\ndsp_block_samples = 4096\n\
             [reconnection]\nauto_reconnect = 0\n",
        );
        assert_eq!(config.rtl_tcp.host, "radio.local");
        assert_eq!(config.rtl_tcp.port, 9999);
        assert_eq!(config.tuner.default_freq, 101_700);
        assert_eq!(config.tuner.deemphasis, 1);
        assert_eq!(config.xdr.password, "hunter2");
        assert!(config.xdr.guest_mode);
        assert!(!config.processing.stereo);
        assert_eq!(config.processing.dsp_block_samples, 4096);
        assert!(!config.reconnection.auto_reconnect);
    }

    #[test]
    fn test_out_of_range_values_clamped() {
        let config = load(
            "[processing]\nagc_mode = 9\ndsp_block_samples = 100\n\
             [sdr]\nfreq_correction_ppm = 4000\n[audio]\nstartup_volume = 500\n",
        );
        assert_eq!(config.processing.agc_mode, 3);
        assert_eq!(config.processing.dsp_block_samples, 1024);
        assert_eq!(config.sdr.freq_correction_ppm, 250);
        assert_eq!(config.audio.startup_volume, 100);
    }

    #[test]
    fn test_unknown_sections_and_keys_ignored() {
        let config = load("[nonsense]\nfoo = bar\n[tuner]\nunknown_key = 42\n");
        assert_eq!(config.tuner.default_freq, 88_600);
    }

    #[test]
    fn test_bad_boolean_keeps_default() {
        let config = load("[processing]\nstereo = maybe\n");
        assert!(config.processing.stereo);
    }

    #[test]
    fn test_missing_file_is_error() {
        let missing = Path::new("/nonexistent/xdrd.ini");
        assert!(Config::load_from_file(missing).is_err());
    }
}
