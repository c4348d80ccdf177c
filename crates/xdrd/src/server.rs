//! XDR control server.
//!
//! Speaks the line protocol of xdr-gtk: the server greets every connection
//! with a 16-character salt, the client answers with
//! `SHA-1(salt || password)` in hex, and the server replies `a0` (denied),
//! `a1` (guest) or `a2` (authenticated). Afterwards newline-terminated
//! commands flow in (first character selects the command) and status lines
//! flow out (`F`, `S`, `R`, `U`).
//!
//! Commands only write the shared atomic request registers or the scan
//! queue; the pipeline thread drains them at block boundaries. Clients are
//! serviced one at a time; the handler alternates between flushing the
//! outbound queue and reading with a short timeout.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use fmtuner::error::{Error, Result};

use crate::control::XdrCommandState;
use crate::rds::ERROR_FLAG_B;

const SALT_LENGTH: usize = 16;
const HASH_LENGTH: usize = 40;
const SALT_CHARS: &[u8] = b"QWERTYUIOPASDFGHJKLZXCVBNMqwertyuiopasdfghjklzxcvbnm0123456789_-";

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const CLIENT_READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Default pacing of pushed signal lines, milliseconds.
const DEFAULT_SIGNAL_INTERVAL_MS: i32 = 500;

/// One band-scan request as assembled by the `S` command family.
#[derive(Debug, Clone, Copy)]
pub struct ScanConfig {
    pub start_khz: i32,
    pub stop_khz: i32,
    pub step_khz: i32,
    pub bandwidth_hz: i32,
    pub antenna: i32,
    pub continuous: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            start_khz: 87_500,
            stop_khz: 108_000,
            step_khz: 100,
            bandwidth_hz: 0,
            antenna: 0,
            continuous: false,
        }
    }
}

/// Server behavior toggles mirrored from the configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerOptions {
    pub allow_client_gain: bool,
    pub sdrpp_gain_strategy: bool,
}

struct Shared {
    outbound: Mutex<VecDeque<String>>,
    scan_draft: Mutex<ScanConfig>,
    scan_start: Mutex<Option<ScanConfig>>,
    scan_cancel: AtomicBool,
    running: AtomicBool,
    signal_interval_ms: AtomicI32,
    last_signal_push: Mutex<Option<Instant>>,
    client_connected: AtomicBool,
}

/// The control server; owns the accept thread.
pub struct XdrServer {
    port: u16,
    bound_port: u16,
    password: String,
    guest_mode: bool,
    options: ServerOptions,
    state: Arc<XdrCommandState>,
    shared: Arc<Shared>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl XdrServer {
    pub fn new(port: u16, state: Arc<XdrCommandState>, options: ServerOptions) -> Self {
        Self {
            port,
            bound_port: 0,
            password: String::new(),
            guest_mode: false,
            options,
            state,
            shared: Arc::new(Shared {
                outbound: Mutex::new(VecDeque::new()),
                scan_draft: Mutex::new(ScanConfig::default()),
                scan_start: Mutex::new(None),
                scan_cancel: AtomicBool::new(false),
                running: AtomicBool::new(false),
                signal_interval_ms: AtomicI32::new(DEFAULT_SIGNAL_INTERVAL_MS),
                last_signal_push: Mutex::new(None),
                client_connected: AtomicBool::new(false),
            }),
            accept_thread: None,
        }
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = password.into();
    }

    pub fn set_guest_mode(&mut self, enabled: bool) {
        self.guest_mode = enabled;
    }

    /// The port actually bound (useful when constructed with port 0).
    pub fn port(&self) -> u16 {
        self.bound_port
    }

    /// Bind the listener and spawn the accept thread.
    pub fn start(&mut self) -> Result<()> {
        if self.accept_thread.is_some() {
            return Err(Error::AlreadyRunning { what: "XDR server" });
        }
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .map_err(|e| Error::io("bind XDR listener", e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::io("configure XDR listener", e))?;
        self.bound_port = listener
            .local_addr()
            .map_err(|e| Error::io("query XDR listener address", e))?
            .port();
        info!("XDR server listening on port {}", self.bound_port);

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let state = Arc::clone(&self.state);
        let password = self.password.clone();
        let guest_mode = self.guest_mode;
        let options = self.options;

        self.accept_thread = Some(
            thread::Builder::new()
                .name("xdr-accept".into())
                .spawn(move || {
                    while shared.running.load(Ordering::Acquire) {
                        match listener.accept() {
                            Ok((stream, peer)) => {
                                debug!("XDR client connected from {}", peer);
                                shared.client_connected.store(true, Ordering::Release);
                                if let Err(e) = handle_client(
                                    stream, &shared, &state, &password, guest_mode, &options,
                                ) {
                                    debug!("XDR client session ended: {}", e);
                                }
                                shared.client_connected.store(false, Ordering::Release);
                                // A vanished client must not leave a sweep running
                                shared.scan_cancel.store(true, Ordering::Release);
                                shared.outbound.lock().unwrap().clear();
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                                thread::sleep(ACCEPT_POLL);
                            }
                            Err(e) => {
                                warn!("XDR accept error: {}", e);
                                thread::sleep(ACCEPT_POLL);
                            }
                        }
                    }
                })
                .expect("spawning xdr accept thread"),
        );
        Ok(())
    }

    /// Stop accepting and join the accept thread.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }

    /// Queue an arbitrary status line for the connected client.
    pub fn push_line(&self, line: String) {
        if !self.shared.client_connected.load(Ordering::Acquire) {
            return;
        }
        self.shared.outbound.lock().unwrap().push_back(line);
    }

    /// Publish the smoothed signal level and stereo flag, paced by the
    /// client-configured interval.
    pub fn update_signal(&self, level: f32, stereo: bool) {
        if !self.shared.client_connected.load(Ordering::Acquire) {
            return;
        }
        let interval = self.shared.signal_interval_ms.load(Ordering::Relaxed).max(0);
        {
            let mut last = self.shared.last_signal_push.lock().unwrap();
            if let Some(prev) = *last {
                if prev.elapsed() < Duration::from_millis(interval as u64) {
                    return;
                }
            }
            *last = Some(Instant::now());
        }
        let flag = if stereo { 's' } else { 'm' };
        self.push_line(format!("S{}{:.2}", flag, level));
    }

    /// Publish one RDS group. Groups whose block B is flagged
    /// uncorrectable are suppressed here, before anything reaches the wire.
    pub fn update_rds(&self, a: u16, b: u16, c: u16, d: u16, errors: u8) {
        if errors & ERROR_FLAG_B != 0 {
            return;
        }
        self.push_line(format!("R{:04x}{:04x}{:04x}{:04x}{:02x}", a, b, c, d, errors));
    }

    /// Publish one completed scan line (body without the leading `U`).
    pub fn push_scan_line(&self, body: String) {
        self.push_line(format!("U{}", body));
    }

    /// Take a queued scan request, if any.
    pub fn consume_scan_start(&self) -> Option<ScanConfig> {
        self.shared.scan_start.lock().unwrap().take()
    }

    /// Test-and-clear the scan cancel flag.
    pub fn consume_scan_cancel(&self) -> bool {
        self.shared.scan_cancel.swap(false, Ordering::AcqRel)
    }
}

impl Drop for XdrServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn generate_salt() -> String {
    let mut rng = rand::thread_rng();
    (0..SALT_LENGTH)
        .map(|_| SALT_CHARS[rng.gen_range(0..SALT_CHARS.len())] as char)
        .collect()
}

fn password_hash(salt: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn handle_client(
    stream: TcpStream,
    shared: &Shared,
    state: &XdrCommandState,
    password: &str,
    guest_mode: bool,
    options: &ServerOptions,
) -> std::io::Result<()> {
    stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT))?;
    stream.set_nodelay(true)?;
    let mut writer = stream.try_clone()?;
    let mut reader = stream;

    // Stale pushes from a previous session are meaningless to this client
    shared.outbound.lock().unwrap().clear();
    *shared.last_signal_push.lock().unwrap() = None;

    let salt = generate_salt();
    writer.write_all(format!("{}\n", salt).as_bytes())?;

    let client_hash = read_line_blocking(&mut reader, HASH_LENGTH + 2, Duration::from_secs(10))?;
    let expected = password_hash(&salt, password);
    let auth_ok = expected.eq_ignore_ascii_case(client_hash.trim());

    let auth_level = if auth_ok {
        writer.write_all(b"a2\n")?;
        2
    } else if guest_mode {
        writer.write_all(b"a1\n")?;
        1
    } else {
        writer.write_all(b"a0\n")?;
        return Ok(());
    };

    let mut pending = String::new();
    loop {
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        // Flush queued status lines
        loop {
            let line = shared.outbound.lock().unwrap().pop_front();
            match line {
                Some(line) => {
                    writer.write_all(line.as_bytes())?;
                    writer.write_all(b"\n")?;
                }
                None => break,
            }
        }

        let mut buf = [0u8; 256];
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => pending.push_str(&String::from_utf8_lossy(&buf[..n])),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e),
        }

        while let Some(pos) = pending.find('\n') {
            let line: String = pending[..pos].trim_end_matches('\r').to_string();
            pending.drain(..=pos);
            if let Some(reply) = process_command(&line, shared, state, options, auth_level) {
                writer.write_all(reply.as_bytes())?;
                writer.write_all(b"\n")?;
            }
        }
    }
    Ok(())
}

fn read_line_blocking(
    reader: &mut TcpStream,
    max_len: usize,
    timeout: Duration,
) -> std::io::Result<String> {
    let start = Instant::now();
    let mut line = String::new();
    while start.elapsed() < timeout && line.len() <= max_len {
        let mut byte = [0u8; 1];
        match reader.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' {
                    return Ok(line);
                }
                line.push(byte[0] as char);
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e),
        }
    }
    Ok(line)
}

fn process_command(
    line: &str,
    shared: &Shared,
    state: &XdrCommandState,
    options: &ServerOptions,
    auth_level: u8,
) -> Option<String> {
    let mut chars = line.chars();
    let command = chars.next()?;
    let arg = chars.as_str();

    match command {
        'T' => {
            let value: u64 = arg.parse().ok()?;
            // Hz when already in the broadcast-band range, kHz otherwise
            let freq_hz = if value >= 100_000_000 {
                value as u32
            } else {
                (value * 1000) as u32
            };
            debug!("tune request {} Hz", freq_hz);
            state.request_frequency(freq_hz);
            // Tuning away is how clients stop a running sweep
            shared.scan_cancel.store(true, Ordering::Release);
            Some(line.to_string())
        }
        'Y' => {
            let volume: i32 = arg.parse().ok()?;
            state
                .requested_volume
                .store(volume.clamp(0, 100), Ordering::Relaxed);
            Some(line.to_string())
        }
        'A' => {
            let mode: i32 = arg.parse().ok()?;
            if options.sdrpp_gain_strategy || !options.allow_client_gain {
                let previous = state.requested_agc_mode.load(Ordering::Relaxed);
                return Some(format!("A{}", previous));
            }
            state.request_agc_mode(mode);
            Some(line.to_string())
        }
        'G' => {
            let flags: i32 = arg.parse().ok()?;
            if options.sdrpp_gain_strategy || !options.allow_client_gain {
                let previous = state.requested_custom_gain.load(Ordering::Relaxed);
                return Some(format!("G{}{}", (previous / 10) % 10, previous % 10));
            }
            state.request_custom_gain(flags);
            Some(line.to_string())
        }
        'W' => {
            let bandwidth: i32 = arg.parse().ok()?;
            let clamped = bandwidth.clamp(0, 400_000);
            state.request_bandwidth(clamped);
            Some(format!("W{}", clamped))
        }
        'D' => {
            let mode: i32 = arg.parse().ok()?;
            state
                .requested_deemphasis
                .store(mode.clamp(0, 2), Ordering::Relaxed);
            Some(line.to_string())
        }
        'B' => {
            let mono: i32 = arg.parse().ok()?;
            state
                .requested_force_mono
                .store(mono != 0, Ordering::Relaxed);
            Some(line.to_string())
        }
        'I' => {
            if let Some(interval) = arg.split(',').next().and_then(|v| v.parse::<i32>().ok()) {
                shared
                    .signal_interval_ms
                    .store(interval.max(0), Ordering::Relaxed);
            }
            Some(line.to_string())
        }
        'X' => {
            state.pending_start.store(true, Ordering::Release);
            Some("X".to_string())
        }
        'x' => {
            state.pending_stop.store(true, Ordering::Release);
            Some("OK".to_string())
        }
        'S' => process_scan_command(arg, shared).map(|_| line.to_string()),
        'P' => Some(format!("a{}", auth_level)),
        _ => None,
    }
}

fn process_scan_command(arg: &str, shared: &Shared) -> Option<()> {
    if arg.is_empty() {
        let draft = *shared.scan_draft.lock().unwrap();
        *shared.scan_start.lock().unwrap() = Some(draft);
        return Some(());
    }

    let mut chars = arg.chars();
    let sub = chars.next()?;
    let value = chars.as_str();
    let mut draft = shared.scan_draft.lock().unwrap();
    match sub {
        'a' => draft.start_khz = value.parse().ok()?,
        'b' => draft.stop_khz = value.parse().ok()?,
        'c' => draft.step_khz = value.parse::<i32>().ok()?.max(5),
        'w' => draft.bandwidth_hz = value.parse().ok()?,
        'z' => draft.antenna = value.parse().ok()?,
        'm' => {
            draft.continuous = match value.parse::<i32>() {
                Ok(v) => v != 0,
                Err(_) => !draft.continuous,
            }
        }
        _ => return None,
    }
    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpStream;

    fn start_server(guest: bool, password: &str) -> (XdrServer, Arc<XdrCommandState>) {
        let state = Arc::new(XdrCommandState::new(88_600_000, 0, 2, 0, 50, 0, false));
        let mut server = XdrServer::new(
            0,
            Arc::clone(&state),
            ServerOptions {
                allow_client_gain: true,
                sdrpp_gain_strategy: false,
            },
        );
        server.set_password(password);
        server.set_guest_mode(guest);
        server.start().unwrap();
        (server, state)
    }

    fn connect(port: u16) -> (BufReader<TcpStream>, TcpStream) {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        (reader, stream)
    }

    fn read_reply(reader: &mut BufReader<TcpStream>) -> String {
        let mut line = String::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => return line.trim_end().to_string(),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => panic!("read error: {}", e),
            }
        }
        line.trim_end().to_string()
    }

    #[test]
    fn test_guest_auth_and_tune() {
        let (mut server, state) = start_server(true, "secret");
        let (mut reader, mut stream) = connect(server.port());

        let salt = read_reply(&mut reader);
        assert_eq!(salt.len(), SALT_LENGTH);

        // 40 wrong hex chars: denied as user, admitted as guest
        stream.write_all(b"0000000000000000000000000000000000000000\n").unwrap();
        assert_eq!(read_reply(&mut reader), "a1");

        stream.write_all(b"T101700\n").unwrap();
        assert_eq!(read_reply(&mut reader), "T101700");

        // Frequency lands in the request register in Hz
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(
            state.requested_frequency_hz.load(Ordering::Relaxed),
            101_700_000
        );
        assert!(state.pending_frequency.load(Ordering::Acquire));

        server.stop();
    }

    #[test]
    fn test_password_auth_accepted() {
        let (mut server, _state) = start_server(false, "secret");
        let (mut reader, mut stream) = connect(server.port());

        let salt = read_reply(&mut reader);
        let hash = password_hash(&salt, "secret");
        stream.write_all(format!("{}\n", hash).as_bytes()).unwrap();
        assert_eq!(read_reply(&mut reader), "a2");

        stream.write_all(b"P\n").unwrap();
        assert_eq!(read_reply(&mut reader), "a2");

        server.stop();
    }

    #[test]
    fn test_wrong_password_denied_without_guest_mode() {
        let (mut server, _state) = start_server(false, "secret");
        let (mut reader, mut stream) = connect(server.port());

        let _salt = read_reply(&mut reader);
        stream.write_all(b"1111111111111111111111111111111111111111\n").unwrap();
        assert_eq!(read_reply(&mut reader), "a0");

        server.stop();
    }

    #[test]
    fn test_scan_commands_assemble_request() {
        let (mut server, _state) = start_server(true, "");
        let (mut reader, mut stream) = connect(server.port());

        let salt = read_reply(&mut reader);
        let hash = password_hash(&salt, "");
        stream.write_all(format!("{}\n", hash).as_bytes()).unwrap();
        assert_eq!(read_reply(&mut reader), "a2");

        for cmd in ["Sa87500", "Sb87600", "Sc100", "Sw0", "S"] {
            stream.write_all(format!("{}\n", cmd).as_bytes()).unwrap();
            assert_eq!(read_reply(&mut reader), cmd);
        }

        std::thread::sleep(Duration::from_millis(50));
        let config = server.consume_scan_start().expect("scan queued");
        assert_eq!(config.start_khz, 87_500);
        assert_eq!(config.stop_khz, 87_600);
        assert_eq!(config.step_khz, 100);
        assert!(!config.continuous);

        server.stop();
    }

    #[test]
    fn test_rds_block_b_errors_suppressed() {
        let (server, _state) = {
            let state = Arc::new(XdrCommandState::new(88_600_000, 0, 2, 0, 50, 0, false));
            let server = XdrServer::new(0, Arc::clone(&state), ServerOptions::default());
            (server, state)
        };
        // Pretend a client is attached so pushes are not short-circuited
        server
            .shared
            .client_connected
            .store(true, Ordering::Release);

        server.update_rds(0x1234, 0x5678, 0x9ABC, 0xDEF0, ERROR_FLAG_B);
        assert!(server.shared.outbound.lock().unwrap().is_empty());

        server.update_rds(0x1234, 0x5678, 0x9ABC, 0xDEF0, 0x00);
        let line = server
            .shared
            .outbound
            .lock()
            .unwrap()
            .pop_front()
            .expect("clean group forwarded");
        assert_eq!(line, "R123456789abcdef000");
    }

    #[test]
    fn test_bandwidth_clamped_in_reply() {
        let (mut server, state) = start_server(true, "");
        let (mut reader, mut stream) = connect(server.port());

        let salt = read_reply(&mut reader);
        let hash = password_hash(&salt, "");
        stream.write_all(format!("{}\n", hash).as_bytes()).unwrap();
        assert_eq!(read_reply(&mut reader), "a2");

        stream.write_all(b"W999999\n").unwrap();
        assert_eq!(read_reply(&mut reader), "W400000");
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(
            state.requested_bandwidth_hz.load(Ordering::Relaxed),
            400_000
        );

        server.stop();
    }
}
