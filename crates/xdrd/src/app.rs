//! Application assembly and the outer runtime loop.
//!
//! One thread (this one) owns the tuner, the DSP pipeline and the audio
//! sinks. The control server writes atomic request registers from its own
//! threads; this loop drains them at block boundaries, so every DSP block
//! observes a consistent set of settings. The RDS worker receives MPX
//! blocks over its bounded queue and reports groups back through the
//! control server.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use fmtuner::tuner::{Tuner, TunerSource};
use fmtuner::{iq_decimation, AUDIO_RATE, DSP_RATE};

use crate::audio::AudioOutput;
use crate::config::Config;
use crate::control::XdrCommandState;
use crate::fm::{DiscriminatorMode, DspAgcMode};
use crate::pipeline::DspPipeline;
use crate::rds_worker::RdsWorker;
use crate::runtime::{maybe_adjust_auto_gain, GainTimers, RetuneMute};
use crate::scan::{ScanEngine, ScanParams};
use crate::server::{ServerOptions, XdrServer};
use crate::signal::{compute_signal_level, smooth_signal_level, SignalLevelSmoother};

/// Gain in dB applied per TEF AGC mode 0..=3.
const AGC_TO_GAIN_DB: [i32; 4] = [44, 36, 30, 24];

/// Gain compensation factor feeding the signal level estimate.
const SIGNAL_GAIN_COMP_FACTOR: f64 = 0.5;

/// Consecutive zero-reads before a reconnect attempt.
const READ_FAILURES_BEFORE_RECONNECT: u32 = 20;

/// Everything `main` resolves from CLI and config before the run starts.
pub struct AppOptions {
    pub config: Config,
    pub tcp_host: String,
    pub tcp_port: u16,
    pub iq_sample_rate: u32,
    pub tuner_source: TunerSource,
    pub rtl_device_index: usize,
    pub freq_khz: u32,
    /// Manual tuner gain in dB; negative means automatic.
    pub gain: i32,
    pub wav_file: Option<PathBuf>,
    pub iq_file: Option<PathBuf>,
    pub enable_speaker: bool,
    pub audio_device: String,
    pub xdr_password: String,
    pub xdr_guest_mode: bool,
    pub xdr_port: u16,
    pub low_latency_iq: bool,
}

/// TEF-style gain plan: AGC mode table, custom RF/IF flags, optional
/// sdrpp-style fixed gain.
struct GainStrategy {
    sdrpp: bool,
    cli_gain: i32,
    sdrpp_rtl_agc: bool,
    sdrpp_gain_db: i32,
}

impl GainStrategy {
    /// The IF custom flag hands gain control to the tuner hardware.
    fn is_ims_agc_enabled(&self, state: &XdrCommandState) -> bool {
        if self.cli_gain >= 0 {
            return false;
        }
        state.requested_custom_gain.load(Ordering::Relaxed) % 10 != 0
    }

    fn applied_gain_db(&self, state: &XdrCommandState) -> i32 {
        let agc_mode = state.requested_agc_mode.load(Ordering::Relaxed).clamp(0, 3);
        let custom = state.requested_custom_gain.load(Ordering::Relaxed);
        let ceq = (custom / 10) % 10 != 0;
        let mut gain_db = AGC_TO_GAIN_DB[agc_mode as usize] + if ceq { 4 } else { 0 };
        if self.cli_gain >= 0 {
            gain_db = self.cli_gain;
        }
        gain_db.clamp(0, 49)
    }

    /// Gain the signal estimator should compensate for.
    fn effective_gain_db(&self, state: &XdrCommandState) -> i32 {
        if self.is_ims_agc_enabled(state) {
            0
        } else {
            self.applied_gain_db(state)
        }
    }

    /// Push the whole gain plan to the tuner.
    fn apply(&self, tuner: &mut Tuner, state: &XdrCommandState, reason: &str) {
        if self.sdrpp {
            let gain_db = if self.cli_gain >= 0 {
                self.cli_gain.clamp(0, 49)
            } else {
                self.sdrpp_gain_db
            };
            let ok_mode = Tuner::log_if_failed("set_gain_mode", tuner.set_gain_mode(true));
            let ok_gain =
                Tuner::log_if_failed("set_gain", tuner.set_gain(gain_db as u32 * 10));
            let ok_agc = Tuner::log_if_failed("set_agc", tuner.set_agc(self.sdrpp_rtl_agc));
            debug!(
                "{}: strategy=sdrpp rtl_agc={} if_gain={} dB (ok={}/{}/{})",
                reason, self.sdrpp_rtl_agc, gain_db, ok_mode, ok_gain, ok_agc
            );
            return;
        }

        let agc_mode = state.requested_agc_mode.load(Ordering::Relaxed).clamp(0, 3);
        let ims_agc = self.is_ims_agc_enabled(state);
        let gain_db = self.applied_gain_db(state);

        if ims_agc {
            Tuner::log_if_failed("set_gain_mode", tuner.set_gain_mode(false));
            Tuner::log_if_failed("set_agc", tuner.set_agc(true));
        } else {
            Tuner::log_if_failed("set_gain_mode", tuner.set_gain_mode(true));
            Tuner::log_if_failed("set_agc", tuner.set_agc(false));
            Tuner::log_if_failed("set_gain", tuner.set_gain(gain_db as u32 * 10));
        }
        debug!(
            "{}: A{} -> mode={} tuner_gain={} dB",
            reason,
            agc_mode,
            if ims_agc { "auto" } else { "manual" },
            gain_db
        );
    }
}

/// The tuner plus its connection book-keeping.
struct TunerSession {
    tuner: Tuner,
    connected: bool,
    read_failures: u32,
    iq_sample_rate: u32,
    freq_correction_ppm: i32,
    auto_reconnect: bool,
}

impl TunerSession {
    fn connect(&mut self, state: &XdrCommandState, gain: &GainStrategy) {
        if self.connected {
            return;
        }
        info!("connecting to {}...", self.tuner.name());
        if let Err(e) = self.tuner.connect() {
            warn!("failed to connect to {}: {}", self.tuner.name(), e);
            return;
        }

        let freq_hz = state.requested_frequency_hz.load(Ordering::Relaxed);
        let ok_freq = Tuner::log_if_failed("set_frequency", self.tuner.set_frequency(freq_hz));
        let ok_rate = Tuner::log_if_failed(
            "set_sample_rate",
            self.tuner.set_sample_rate(self.iq_sample_rate),
        );
        if self.freq_correction_ppm != 0 {
            Tuner::log_if_failed(
                "set_frequency_correction",
                self.tuner.set_frequency_correction(self.freq_correction_ppm),
            );
        }
        if !ok_freq || !ok_rate {
            warn!("failed to initialize {} stream", self.tuner.name());
            self.tuner.disconnect();
            return;
        }

        self.connected = true;
        info!(
            "connected to {} at {} kHz, {} S/s",
            self.tuner.name(),
            freq_hz / 1000,
            self.iq_sample_rate
        );
        gain.apply(&mut self.tuner, state, "connect/apply");
    }

    fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.tuner.disconnect();
        self.connected = false;
        info!("disconnected from {}", self.tuner.name());
    }

    fn reset_read_failures(&mut self) {
        self.read_failures = 0;
    }

    fn note_read_failure_and_maybe_reconnect(
        &mut self,
        state: &XdrCommandState,
        gain: &GainStrategy,
    ) {
        self.read_failures += 1;
        if self.auto_reconnect && self.read_failures >= READ_FAILURES_BEFORE_RECONNECT {
            warn!("no IQ data, reconnecting...");
            self.disconnect();
            self.connect(state, gain);
            self.read_failures = 0;
        }
    }
}

pub struct Application {
    options: AppOptions,
}

impl Application {
    pub fn new(options: AppOptions) -> Self {
        Self { options }
    }

    /// Run until `running` clears. Returns the process exit code.
    pub fn run(&self, running: Arc<AtomicBool>) -> i32 {
        let config = &self.options.config;

        let decimation = match iq_decimation(self.options.iq_sample_rate) {
            Ok(d) => d,
            Err(e) => {
                error!("{}", e);
                return 1;
            }
        };

        let state = Arc::new(XdrCommandState::new(
            self.options.freq_khz * 1000,
            config.sdr.default_custom_gain_flags,
            config.processing.agc_mode,
            0,
            config.audio.startup_volume,
            config.tuner.deemphasis,
            false,
        ));

        let gain = GainStrategy {
            sdrpp: config.sdr.gain_strategy.eq_ignore_ascii_case("sdrpp"),
            cli_gain: self.options.gain,
            sdrpp_rtl_agc: config.sdr.sdrpp_rtl_agc,
            sdrpp_gain_db: config.sdr.sdrpp_rtl_agc_gain_db,
        };

        let mut tuner = match self.options.tuner_source {
            TunerSource::RtlTcp => {
                Tuner::from_rtl_tcp(self.options.tcp_host.clone(), self.options.tcp_port)
            }
            TunerSource::RtlSdr => {
                #[cfg(feature = "rtlsdr")]
                {
                    Tuner::from_rtl_sdr(self.options.rtl_device_index)
                }
                #[cfg(not(feature = "rtlsdr"))]
                {
                    error!("rtl_sdr source requires the 'rtlsdr' build feature");
                    return 1;
                }
            }
        };
        tuner.set_low_latency_mode(self.options.low_latency_iq);
        let direct_usb = matches!(self.options.tuner_source, TunerSource::RtlSdr);

        let mut session = TunerSession {
            tuner,
            connected: false,
            read_failures: 0,
            iq_sample_rate: self.options.iq_sample_rate,
            freq_correction_ppm: config.sdr.freq_correction_ppm,
            auto_reconnect: config.reconnection.auto_reconnect,
        };

        let mut pipeline = DspPipeline::new(
            DSP_RATE,
            AUDIO_RATE,
            config.processing.stereo,
            config.processing.dsp_block_samples,
            decimation,
        );
        pipeline.set_deemphasis_mode(config.tuner.deemphasis);
        pipeline.set_force_mono(false);
        pipeline.set_bandwidth_hz(0);
        debug!(
            "dsp block_samples={} sdr_block_samples={} decimation={}",
            pipeline.block_samples(),
            pipeline.sdr_block_samples(),
            decimation
        );
        if config.processing.discriminator.eq_ignore_ascii_case("fast") {
            pipeline.set_discriminator_mode(DiscriminatorMode::Fast);
        }
        match config.processing.dsp_agc.to_ascii_lowercase().as_str() {
            "fast" => pipeline.set_dsp_agc_mode(DspAgcMode::Fast),
            "slow" => pipeline.set_dsp_agc_mode(DspAgcMode::Slow),
            _ => {}
        }

        let mut audio = AudioOutput::new();
        let audio_device = if !self.options.audio_device.is_empty() {
            self.options.audio_device.clone()
        } else {
            config.audio.device.clone()
        };
        if let Err(e) = audio.init(
            self.options.enable_speaker,
            self.options.wav_file.as_deref(),
            Some(audio_device.as_str()),
        ) {
            error!("audio output init failed: {}", e);
            session.disconnect();
            return 1;
        }

        let mut iq_capture: Option<File> = match self.options.iq_file.as_ref() {
            Some(path) => match File::create(path) {
                Ok(file) => {
                    info!("IQ capture to {}", path.display());
                    Some(file)
                }
                Err(e) => {
                    error!("cannot open IQ capture file {}: {}", path.display(), e);
                    audio.shutdown();
                    session.disconnect();
                    return 1;
                }
            },
            None => None,
        };

        let mut server = XdrServer::new(
            self.options.xdr_port,
            Arc::clone(&state),
            ServerOptions {
                allow_client_gain: config.processing.client_gain_allowed,
                sdrpp_gain_strategy: gain.sdrpp,
            },
        );
        server.set_password(self.options.xdr_password.clone());
        server.set_guest_mode(self.options.xdr_guest_mode);
        if let Err(e) = server.start() {
            warn!("failed to start XDR server: {}", e);
        }
        let server = Arc::new(server);

        let mut rds_worker = if config.processing.rds {
            let rds_server = Arc::clone(&server);
            let mut worker = RdsWorker::new(
                DSP_RATE,
                Box::new(move |group| {
                    rds_server.update_rds(
                        group.block_a,
                        group.block_b,
                        group.block_c,
                        group.block_d,
                        group.errors,
                    );
                }),
            );
            worker.start();
            Some(worker)
        } else {
            None
        };

        let sdr_buf_samples = pipeline.sdr_block_samples();
        let mut iq_buffer = vec![0u8; sdr_buf_samples * 2];
        let retune_mute_samples = (AUDIO_RATE / 25) as usize;
        let fade_samples = (AUDIO_RATE / 200) as usize;
        let no_data_sleep = if direct_usb {
            Duration::from_millis(2)
        } else {
            Duration::from_millis(10)
        };
        let scan_retry_sleep = if direct_usb {
            Duration::from_millis(2)
        } else {
            Duration::from_millis(5)
        };

        let mut scan_engine = ScanEngine::new();
        let mut gain_timers = GainTimers::default();
        let mut mute = RetuneMute::default();
        let mut smoother = SignalLevelSmoother::default();
        let mut active = false;
        let mut applied_bandwidth_hz: i32 = 0;

        info!(
            "waiting for client connection on port {}",
            self.options.xdr_port
        );

        while running.load(Ordering::Acquire) {
            audio.set_volume_percent(state.requested_volume.load(Ordering::Relaxed));

            if XdrCommandState::take(&state.pending_stop) {
                state.pending_start.store(false, Ordering::Release);
                active = false;
                pipeline.reset();
                audio.clear_realtime_queue();
                session.disconnect();
            }

            if XdrCommandState::take(&state.pending_start) {
                session.connect(&state, &gain);
                pipeline.reset();
                active = session.connected;
            }

            if !active {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }

            // -- control and scan ------------------------------------------
            {
                let worker_ref = rds_worker.as_ref();
                let mut restore = |restore_freq: u32, restore_bw: i32| {
                    state
                        .requested_bandwidth_hz
                        .store(restore_bw, Ordering::Relaxed);
                    state.pending_bandwidth.store(true, Ordering::Release);
                    state.request_frequency(restore_freq);
                    pipeline.reset();
                    audio.clear_realtime_queue();
                    mute.arm(retune_mute_samples);
                    if let Some(worker) = worker_ref {
                        worker.request_reset();
                    }
                };

                scan_engine.handle_control(
                    &server,
                    &state,
                    state.requested_frequency_hz.load(Ordering::Relaxed),
                    applied_bandwidth_hz,
                    session.connected,
                    &mut restore,
                );
            }

            if session.connected && XdrCommandState::take(&state.pending_frequency) {
                let freq_hz = state.requested_frequency_hz.load(Ordering::Relaxed);
                Tuner::log_if_failed("set_frequency", session.tuner.set_frequency(freq_hz));
                server.push_line(format!("F{}", freq_hz));
                audio.clear_realtime_queue();
                pipeline.reset();
                mute.arm(retune_mute_samples);
                if let Some(worker) = rds_worker.as_ref() {
                    worker.request_reset();
                }
            }

            let gain_changed = XdrCommandState::take(&state.pending_gain);
            let agc_changed = XdrCommandState::take(&state.pending_agc);
            if session.connected && (gain_changed || agc_changed) {
                gain.apply(&mut session.tuner, &state, "runtime/update");
            }

            if XdrCommandState::take(&state.pending_bandwidth) {
                let target = state.requested_bandwidth_hz.load(Ordering::Relaxed);
                if target != applied_bandwidth_hz {
                    pipeline.set_bandwidth_hz(target.max(0) as u32);
                    debug!("applied W{} (previous W{})", target, applied_bandwidth_hz);
                    applied_bandwidth_hz = target;
                }
            }

            // One scan sweep consumes the whole iteration
            {
                let effective_gain_db = gain.effective_gain_db(&state);
                let worker_ref = rds_worker.as_ref();
                let params = ScanParams {
                    iq_sample_rate: self.options.iq_sample_rate,
                    effective_gain_db,
                    gain_comp_factor: SIGNAL_GAIN_COMP_FACTOR,
                    signal_bias_db: config.sdr.signal_bias_db,
                    signal_floor_dbfs: config.sdr.signal_floor_dbfs,
                    signal_ceil_dbfs: config.sdr.signal_ceil_dbfs,
                    retry_sleep: scan_retry_sleep,
                    running: &running,
                };
                let (pipeline_ref, mute_ref) = (&mut pipeline, &mut mute);
                let audio_ref = &audio;
                let mut restore = |restore_freq: u32, restore_bw: i32| {
                    state
                        .requested_bandwidth_hz
                        .store(restore_bw, Ordering::Relaxed);
                    state.pending_bandwidth.store(true, Ordering::Release);
                    state.request_frequency(restore_freq);
                    pipeline_ref.reset();
                    audio_ref.clear_realtime_queue();
                    mute_ref.arm(retune_mute_samples);
                    if let Some(worker) = worker_ref {
                        worker.request_reset();
                    }
                };
                let mut capture = |bytes: &[u8], samples: usize| {
                    if let Some(file) = iq_capture.as_mut() {
                        let _ = file.write_all(&bytes[..samples * 2]);
                    }
                };
                if scan_engine.run_if_active(
                    &server,
                    &mut session.tuner,
                    &mut iq_buffer,
                    sdr_buf_samples,
                    &params,
                    &mut capture,
                    &mut restore,
                ) {
                    continue;
                }
            }

            pipeline.set_deemphasis_mode(state.requested_deemphasis.load(Ordering::Relaxed));
            let force_mono = state.requested_force_mono.load(Ordering::Relaxed);
            pipeline.set_force_mono(force_mono);

            let samples = session.tuner.read_iq(&mut iq_buffer, sdr_buf_samples);
            if samples == 0 {
                session.note_read_failure_and_maybe_reconnect(&state, &gain);
                std::thread::sleep(no_data_sleep);
                continue;
            }
            session.reset_read_failures();
            if let Some(file) = iq_capture.as_mut() {
                let _ = file.write_all(&iq_buffer[..samples * 2]);
            }

            // -- one audio block -------------------------------------------
            let effective_gain_db = gain.effective_gain_db(&state);
            let signal = compute_signal_level(
                &iq_buffer,
                samples,
                effective_gain_db,
                SIGNAL_GAIN_COMP_FACTOR,
                config.sdr.signal_bias_db,
                config.sdr.signal_floor_dbfs,
                config.sdr.signal_ceil_dbfs,
            );
            let clip_ratio = signal.hard_clip_ratio.max(signal.near_clip_ratio);
            let rf_level_filtered = smooth_signal_level(signal.level120, &mut smoother);

            maybe_adjust_auto_gain(
                gain.sdrpp,
                gain.cli_gain,
                gain.is_ims_agc_enabled(&state),
                &state,
                &mut gain_timers,
                &signal,
                clip_ratio,
                rf_level_filtered,
            );

            let worker_ref = rds_worker.as_ref();
            let result = pipeline.process(&iq_buffer, samples, &mut |mpx| {
                if let Some(worker) = worker_ref {
                    worker.enqueue(mpx);
                }
            });
            let result = match result {
                Some(r) => r,
                None => continue,
            };

            let stereo_indicator = result.stereo_detected
                || (force_mono && config.processing.stereo && result.pilot_tenths_khz >= 20);
            server.update_signal(rf_level_filtered, stereo_indicator);

            if result.out_samples > 0 {
                let (left, right) = pipeline.audio_mut();
                mute.apply(left, right, result.out_samples, fade_samples);
                let (left, right) = pipeline.audio();
                audio.write(&left[..result.out_samples], &right[..result.out_samples]);
            }
        }

        // Orderly teardown: worker first, then sinks, server, tuner
        if let Some(worker) = rds_worker.as_mut() {
            worker.stop();
        }
        drop(rds_worker);
        audio.shutdown();
        iq_capture.take();
        drop(server);
        session.disconnect();

        info!("shutdown complete");
        0
    }
}
