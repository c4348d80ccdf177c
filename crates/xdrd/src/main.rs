//! FM broadcast tuner daemon speaking the XDR control protocol.
//!
//! Consumes raw I/Q from an rtl_tcp server or a local RTL-SDR dongle,
//! demodulates wideband FM with stereo and RDS, and serves xdr-gtk
//! compatible clients over TCP.
//!
//! # Usage examples
//!
//! ```bash
//! # rtl_tcp source, speaker output
//! xdrd -t localhost:1234 -f 88600 -s
//!
//! # direct USB dongle at 2.048 MS/s, WAV capture
//! xdrd --source rtl_sdr --iq-rate 2048000 -f 101700 -w out.wav
//!
//! # guarded server with password and guest access
//! xdrd -t radio.local -s -P hunter2 -G
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{debug, error, info};

use fmtuner::tuner::TunerSource;

use xdrd::audio;
use xdrd::{AppOptions, Application, Config};

/// Tuner sample rates the DSP chain accepts.
const SUPPORTED_IQ_RATES: [u32; 3] = [256_000, 1_024_000, 2_048_000];

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    #[value(name = "rtl_tcp")]
    RtlTcp,
    #[value(name = "rtl_sdr")]
    RtlSdr,
}

#[derive(Parser, Debug)]
#[command(
    name = "xdrd",
    about = "FM broadcast tuner daemon with stereo, RDS and band scan",
    long_about = None
)]
struct Args {
    /// Configuration file (INI)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// rtl_tcp server as HOST[:PORT]
    #[arg(short = 't', long = "tcp")]
    tcp: Option<String>,

    /// Tuner sample rate in Hz (256000, 1024000 or 2048000)
    #[arg(long = "iq-rate")]
    iq_rate: Option<u32>,

    /// I/Q source backend
    #[arg(long = "source", value_enum, default_value = "rtl_tcp")]
    source: SourceArg,

    /// RTL-SDR device index (rtl_sdr source)
    #[arg(long = "rtl-device", default_value_t = 0)]
    rtl_device: usize,

    /// Startup frequency in kHz
    #[arg(short = 'f', long = "freq")]
    freq: Option<u32>,

    /// Manual tuner gain in dB (disables automatic gain stepping)
    #[arg(short = 'g', long = "gain")]
    gain: Option<i32>,

    /// Write decoded audio to a WAV file
    #[arg(short = 'w', long = "wav")]
    wav: Option<PathBuf>,

    /// Write raw I/Q bytes to a capture file
    #[arg(short = 'i', long = "iq")]
    iq: Option<PathBuf>,

    /// Shrink I/Q buffering for faster retunes
    #[arg(long = "low-latency-iq", overrides_with = "no_low_latency_iq")]
    low_latency_iq: bool,

    /// Keep full-size I/Q buffering
    #[arg(long = "no-low-latency-iq", overrides_with = "low_latency_iq")]
    no_low_latency_iq: bool,

    /// Play decoded audio on the default (or selected) output device
    #[arg(short = 's', long = "audio")]
    audio: bool,

    /// List audio output devices and exit
    #[arg(short = 'l', long = "list-audio")]
    list_audio: bool,

    /// Audio output device selector (substring match)
    #[arg(short = 'd', long = "device")]
    device: Option<String>,

    /// XDR server password
    #[arg(short = 'P', long = "password")]
    password: Option<String>,

    /// Admit clients with a wrong password as guests
    #[arg(short = 'G', long = "guest")]
    guest: bool,
}

fn init_logging(log_level: i32) {
    let level = match log_level {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.kind() == clap::error::ErrorKind::DisplayHelp
            || e.kind() == clap::error::ErrorKind::DisplayVersion =>
        {
            let _ = e.print();
            return 0;
        }
        Err(e) => {
            let _ = e.print();
            return 1;
        }
    };

    let config = match args.config.as_ref() {
        Some(path) => match Config::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                return 1;
            }
        },
        None => Config::default(),
    };

    init_logging(config.debug.log_level);

    if args.list_audio {
        for name in audio::list_audio_devices() {
            println!("{}", name);
        }
        return 0;
    }

    if args.wav.is_none() && args.iq.is_none() && !args.audio {
        eprintln!("at least one of -w, -i or -s is required");
        return 1;
    }

    let iq_sample_rate = args.iq_rate.unwrap_or(256_000);
    if !SUPPORTED_IQ_RATES.contains(&iq_sample_rate) {
        error!(
            "unsupported IQ rate {} (expected one of {:?})",
            iq_sample_rate, SUPPORTED_IQ_RATES
        );
        return 1;
    }

    let (tcp_host, tcp_port) = match args.tcp.as_deref() {
        Some(addr) => match addr.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host.to_string(), port),
                Err(_) => {
                    error!("invalid port in --tcp {}", addr);
                    return 1;
                }
            },
            None => (addr.to_string(), config.rtl_tcp.port),
        },
        None => (config.rtl_tcp.host.clone(), config.rtl_tcp.port),
    };

    let tuner_source = match args.source {
        SourceArg::RtlTcp => TunerSource::RtlTcp,
        SourceArg::RtlSdr => TunerSource::RtlSdr,
    };

    let low_latency_iq = if args.low_latency_iq {
        true
    } else if args.no_low_latency_iq {
        false
    } else {
        config.sdr.low_latency_iq
    };

    let options = AppOptions {
        freq_khz: args.freq.unwrap_or(config.tuner.default_freq),
        gain: args.gain.unwrap_or(-1),
        wav_file: args.wav,
        iq_file: args.iq,
        enable_speaker: args.audio,
        audio_device: args.device.unwrap_or_default(),
        xdr_password: args
            .password
            .unwrap_or_else(|| config.xdr.password.clone()),
        xdr_guest_mode: args.guest || config.xdr.guest_mode,
        xdr_port: config.xdr.port,
        tcp_host,
        tcp_port,
        iq_sample_rate,
        tuner_source,
        rtl_device_index: args.rtl_device,
        low_latency_iq,
        config,
    };

    info!(
        "xdrd starting: source={:?} iq_rate={} freq={} kHz",
        options.tuner_source, options.iq_sample_rate, options.freq_khz
    );
    debug!(
        "audio: speaker={} wav={:?} device='{}'",
        options.enable_speaker, options.wav_file, options.audio_device
    );

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        if let Err(e) = ctrlc::set_handler(move || {
            running.store(false, Ordering::Release);
        }) {
            error!("cannot install signal handler: {}", e);
            return 1;
        }
    }

    Application::new(options).run(running)
}
