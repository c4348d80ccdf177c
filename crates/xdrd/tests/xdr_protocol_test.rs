//! End-to-end protocol test: a fake rtl_tcp server feeds silence, the full
//! application runs against it, and an XDR client drives it over TCP.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fmtuner::tuner::TunerSource;
use xdrd::{AppOptions, Application, Config};

/// Serve the rtl_tcp handshake and an endless stream of midpoint I/Q.
fn spawn_fake_rtl_tcp(running: Arc<AtomicBool>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        listener.set_nonblocking(true).unwrap();
        while running.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((mut sock, _)) => {
                    let mut header = Vec::new();
                    header.extend_from_slice(b"RTL0");
                    header.extend_from_slice(&5u32.to_be_bytes());
                    header.extend_from_slice(&29u32.to_be_bytes());
                    if sock.write_all(&header).is_err() {
                        continue;
                    }
                    sock.set_nonblocking(true).unwrap();
                    let silence = vec![127u8; 16_384];
                    let mut cmd = [0u8; 256];
                    while running.load(Ordering::Acquire) {
                        // Drain tuner commands; they need no reply
                        let _ = sock.read(&mut cmd);
                        match sock.write(&silence) {
                            Ok(_) => {}
                            Err(e)
                                if e.kind() == std::io::ErrorKind::WouldBlock =>
                            {
                                thread::sleep(Duration::from_millis(1));
                            }
                            Err(_) => break,
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(_) => break,
            }
        }
    });
    port
}

fn find_free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn read_line(reader: &mut BufReader<TcpStream>, timeout: Duration) -> Option<String> {
    let deadline = Instant::now() + timeout;
    let mut line = String::new();
    while Instant::now() < deadline {
        match reader.read_line(&mut line) {
            Ok(0) => return None,
            Ok(_) => return Some(line.trim_end().to_string()),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => return None,
        }
    }
    None
}

fn connect_with_retry(port: u16) -> (BufReader<TcpStream>, TcpStream) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(Duration::from_millis(100)))
                    .unwrap();
                let reader = BufReader::new(stream.try_clone().unwrap());
                return (reader, stream);
            }
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(50)),
            Err(e) => panic!("cannot connect to XDR server: {}", e),
        }
    }
}

#[test]
fn guest_auth_tune_and_scan_line() {
    let running = Arc::new(AtomicBool::new(true));
    let rtl_port = spawn_fake_rtl_tcp(Arc::clone(&running));
    let xdr_port = find_free_port();

    let options = AppOptions {
        config: {
            let mut config = Config::default();
            config.xdr.port = xdr_port;
            // RDS stays on; the silence stream simply decodes nothing
            config
        },
        tcp_host: "127.0.0.1".into(),
        tcp_port: rtl_port,
        iq_sample_rate: 256_000,
        tuner_source: TunerSource::RtlTcp,
        rtl_device_index: 0,
        freq_khz: 88_600,
        gain: -1,
        wav_file: None,
        iq_file: None,
        enable_speaker: false,
        audio_device: String::new(),
        xdr_password: "testpass".into(),
        xdr_guest_mode: true,
        xdr_port,
        low_latency_iq: false,
    };

    let app_running = Arc::clone(&running);
    let app_thread = thread::spawn(move || Application::new(options).run(app_running));

    let (mut reader, mut stream) = connect_with_retry(xdr_port);

    // Handshake: 16-char salt, wrong hash, guest admission
    let salt = read_line(&mut reader, Duration::from_secs(5)).expect("salt");
    assert_eq!(salt.len(), 16);
    stream
        .write_all(b"0000000000000000000000000000000000000000\n")
        .unwrap();
    assert_eq!(
        read_line(&mut reader, Duration::from_secs(5)).expect("auth reply"),
        "a1"
    );

    // Start the tuner
    stream.write_all(b"X\n").unwrap();
    assert_eq!(
        read_line(&mut reader, Duration::from_secs(5)).expect("start reply"),
        "X"
    );

    // Tune: kHz argument echoed back, applied in Hz. Pushed status lines
    // may interleave with the echo once the tuner runs.
    stream.write_all(b"T101700\n").unwrap();
    let mut saw_echo = false;
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        match read_line(&mut reader, Duration::from_millis(500)) {
            Some(line) if line == "T101700" => {
                saw_echo = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_echo, "tune command not echoed");

    // The pipeline confirms the applied retune with an F line
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut saw_f_line = false;
    while Instant::now() < deadline {
        match read_line(&mut reader, Duration::from_millis(500)) {
            Some(line) if line.starts_with('F') => {
                assert_eq!(line, "F101700000");
                saw_f_line = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_f_line, "no F line after retune");

    // Two-channel sweep over a silent band; echoes are absorbed by the
    // wait for the U line below
    for cmd in ["Sa87500", "Sb87600", "Sc100", "Sw0", "S"] {
        stream.write_all(format!("{}\n", cmd).as_bytes()).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut scan_line = None;
    while Instant::now() < deadline {
        match read_line(&mut reader, Duration::from_millis(500)) {
            Some(line) if line.starts_with('U') => {
                scan_line = Some(line);
                break;
            }
            _ => {}
        }
    }
    let scan_line = scan_line.expect("no scan line received");
    assert_eq!(scan_line, "U87500=0.0,87600=0.0,");
    assert!(scan_line.ends_with(','));

    running.store(false, Ordering::Release);
    let code = app_thread.join().expect("app thread");
    assert_eq!(code, 0);
}
