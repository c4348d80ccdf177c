//! rtl_tcp network client.
//!
//! Speaks the osmocom rtl_tcp protocol: on connect the server sends a
//! 12-byte magic header (`RTL0` + tuner type + gain count); afterwards the
//! client sends 5-byte commands (a command byte followed by a 32-bit
//! big-endian argument) and reads a continuous stream of unsigned 8-bit
//! interleaved I/Q bytes.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

const CMD_SET_FREQUENCY: u8 = 0x01;
const CMD_SET_SAMPLE_RATE: u8 = 0x02;
const CMD_SET_GAIN_MODE: u8 = 0x03;
const CMD_SET_GAIN: u8 = 0x04;
const CMD_SET_FREQ_CORRECTION: u8 = 0x05;
const CMD_SET_AGC_MODE: u8 = 0x08;

const MAGIC_HEADER_LEN: usize = 12;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Client for an rtl_tcp server.
pub struct RtlTcpClient {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl RtlTcpClient {
    /// Create a disconnected client for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
        }
    }

    /// True when a stream is currently open.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect and validate the 12-byte magic header.
    pub fn connect(&mut self) -> Result<()> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| Error::io("resolve rtl_tcp host", e))?
            .next()
            .ok_or_else(|| {
                Error::connect("rtl_tcp", format!("no address for {}", self.host))
            })?;

        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| Error::connect("rtl_tcp", format!("{}:{}: {}", self.host, self.port, e)))?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| Error::io("configure rtl_tcp socket", e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::io("configure rtl_tcp socket", e))?;

        let mut header = [0u8; MAGIC_HEADER_LEN];
        let mut stream = stream;
        stream
            .read_exact(&mut header)
            .map_err(|e| Error::desync("magic header", e.to_string()))?;
        if &header[..4] != b"RTL0" {
            return Err(Error::desync(
                "magic header",
                format!("{:02x?}", &header[..4]),
            ));
        }
        let tuner_type = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        debug!("rtl_tcp connected, tuner type {}", tuner_type);

        self.stream = Some(stream);
        Ok(())
    }

    /// Drop the connection.
    pub fn disconnect(&mut self) {
        self.stream = None;
    }

    fn send_command(&mut self, cmd: u8, arg: u32) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::not_connected("rtl_tcp"))?;
        let mut buf = [0u8; 5];
        buf[0] = cmd;
        buf[1..5].copy_from_slice(&arg.to_be_bytes());
        stream
            .write_all(&buf)
            .map_err(|e| Error::io("send tuner command", e))?;
        Ok(())
    }

    /// Tune to `freq_hz`.
    pub fn set_frequency(&mut self, freq_hz: u32) -> Result<()> {
        self.send_command(CMD_SET_FREQUENCY, freq_hz)
    }

    /// Set the device sample rate.
    pub fn set_sample_rate(&mut self, rate_hz: u32) -> Result<()> {
        self.send_command(CMD_SET_SAMPLE_RATE, rate_hz)
    }

    /// Apply a frequency correction in ppm.
    pub fn set_frequency_correction(&mut self, ppm: i32) -> Result<()> {
        self.send_command(CMD_SET_FREQ_CORRECTION, ppm as u32)
    }

    /// Switch between manual (`true`) and hardware-managed gain.
    pub fn set_gain_mode(&mut self, manual: bool) -> Result<()> {
        self.send_command(CMD_SET_GAIN_MODE, manual as u32)
    }

    /// Set the tuner gain in tenths of a dB.
    pub fn set_gain(&mut self, gain_tenths_db: u32) -> Result<()> {
        self.send_command(CMD_SET_GAIN, gain_tenths_db)
    }

    /// Enable or disable the RTL2832 digital AGC.
    pub fn set_agc(&mut self, enable: bool) -> Result<()> {
        self.send_command(CMD_SET_AGC_MODE, enable as u32)
    }

    /// Read up to `max_samples` complex samples of raw I/Q into `buffer`.
    ///
    /// Returns the number of complete complex samples read (bytes / 2).
    /// A zero return means the read timed out or the stream closed; the
    /// caller decides whether to retry or reconnect.
    pub fn read_iq(&mut self, buffer: &mut [u8], max_samples: usize) -> usize {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return 0,
        };

        let wanted = (max_samples * 2).min(buffer.len());
        let mut total = 0;
        while total < wanted {
            match stream.read(&mut buffer[total..wanted]) {
                Ok(0) => {
                    warn!("rtl_tcp stream closed by peer");
                    break;
                }
                Ok(n) => total += n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    break;
                }
                Err(e) => {
                    warn!("rtl_tcp read error: {}", e);
                    break;
                }
            }
        }
        total / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn spawn_fake_server() -> (u16, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            // Magic header: "RTL0", tuner type 5 (R820T), 29 gain steps
            let mut header = Vec::new();
            header.extend_from_slice(b"RTL0");
            header.extend_from_slice(&5u32.to_be_bytes());
            header.extend_from_slice(&29u32.to_be_bytes());
            sock.write_all(&header).unwrap();

            // Capture one command, then stream a short burst of IQ
            let mut cmd = [0u8; 5];
            sock.read_exact(&mut cmd).unwrap();
            let iq = vec![0xAAu8; 512];
            sock.write_all(&iq).unwrap();
            cmd.to_vec()
        });
        (port, handle)
    }

    #[test]
    fn test_connect_and_tune() {
        let (port, server) = spawn_fake_server();
        let mut client = RtlTcpClient::new("127.0.0.1", port);
        client.connect().unwrap();
        assert!(client.is_connected());

        client.set_frequency(101_700_000).unwrap();

        let mut buf = vec![0u8; 512];
        let samples = client.read_iq(&mut buf, 256);
        assert_eq!(samples, 256);

        let cmd = server.join().unwrap();
        assert_eq!(cmd[0], CMD_SET_FREQUENCY);
        assert_eq!(
            u32::from_be_bytes([cmd[1], cmd[2], cmd[3], cmd[4]]),
            101_700_000
        );
    }

    #[test]
    fn test_commands_fail_when_disconnected() {
        let mut client = RtlTcpClient::new("127.0.0.1", 1);
        assert!(client.set_frequency(100_000_000).is_err());
        let mut buf = vec![0u8; 16];
        assert_eq!(client.read_iq(&mut buf, 8), 0);
    }
}
