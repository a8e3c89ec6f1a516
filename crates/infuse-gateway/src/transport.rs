//! Gateway transports.
//!
//! Everything below the frame reconstructor: a byte pipe with short-timeout
//! reads, plus frame/ping write helpers shared by all implementations.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use infuse_epacket::frame::{encode_frame, PING_FRAME};

/// A byte transport to the gateway device.
///
/// `read_bytes` blocks for at most ~100 ms and returns whatever arrived
/// (possibly nothing) so worker loops can poll their stop flag.
pub trait Transport: Send {
    fn read_bytes(&mut self, max: usize) -> io::Result<Vec<u8>>;

    fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Write a sync-framed packet.
    fn write_frame(&mut self, payload: &[u8]) -> io::Result<()> {
        self.write_raw(&encode_frame(payload))
    }

    /// Magic 1-byte frame requesting that the peer emit its identity packet.
    fn ping(&mut self) -> io::Result<()> {
        self.write_raw(&PING_FRAME)
    }
}

// ============================================================
// Serial
// ============================================================

/// Raw POSIX serial port, 8N1, with a 100 ms read timeout via VTIME.
#[cfg(unix)]
pub struct SerialPort {
    file: std::fs::File,
}

#[cfg(unix)]
impl SerialPort {
    pub fn open(path: &str, baud: u32) -> io::Result<Self> {
        use nix::sys::termios::{
            cfmakeraw, cfsetspeed, tcgetattr, tcsetattr, SetArg, SpecialCharacterIndices,
        };

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;

        let mut tio = tcgetattr(&file).map_err(io::Error::from)?;
        cfmakeraw(&mut tio);
        cfsetspeed(&mut tio, baud_rate(baud)).map_err(io::Error::from)?;
        // Non-canonical read: return whatever is available after ≤ 100 ms.
        tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;
        tcsetattr(&file, SetArg::TCSANOW, &tio).map_err(io::Error::from)?;

        tracing::info!(path, baud, "Serial port open");
        Ok(Self { file })
    }
}

#[cfg(unix)]
fn baud_rate(baud: u32) -> nix::sys::termios::BaudRate {
    use nix::sys::termios::BaudRate;
    match baud {
        9_600 => BaudRate::B9600,
        19_200 => BaudRate::B19200,
        38_400 => BaudRate::B38400,
        57_600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        460_800 => BaudRate::B460800,
        921_600 => BaudRate::B921600,
        other => {
            tracing::warn!(baud = other, "Unsupported baud rate, using 115200");
            BaudRate::B115200
        }
    }
}

#[cfg(unix)]
impl Transport for SerialPort {
    fn read_bytes(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let n = self.file.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)?;
        self.file.flush()
    }
}

// ============================================================
// Segger RTT
// ============================================================

/// RTT channel 0 exposed by a running J-Link as a local TCP ("telnet")
/// server, plus an optional modem-trace side channel captured straight to
/// disk.
pub struct RttPort {
    stream: TcpStream,
    modem_trace: Option<ModemTrace>,
}

struct ModemTrace {
    stream: TcpStream,
    file: std::fs::File,
}

impl RttPort {
    pub fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_millis(100)))?;
        stream.set_nodelay(true)?;
        tracing::info!(addr, "RTT port connected");
        Ok(Self {
            stream,
            modem_trace: None,
        })
    }

    /// Attach an nRF LTE modem-trace channel; bytes are appended to a
    /// timestamped capture file next to the working directory.
    pub fn with_modem_trace(mut self, addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_millis(1)))?;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let name = format!("{now}_nrf_modem_trace.bin");
        tracing::info!(file = %name, "Capturing modem trace");
        let file = std::fs::File::create(&name)?;
        self.modem_trace = Some(ModemTrace { stream, file });
        Ok(self)
    }

    fn drain_modem_trace(&mut self) {
        let Some(trace) = self.modem_trace.as_mut() else {
            return;
        };
        let mut buf = [0u8; 1024];
        match trace.stream.read(&mut buf) {
            Ok(0) | Err(_) => {}
            Ok(n) => {
                if let Err(err) = trace.file.write_all(&buf[..n]) {
                    tracing::warn!(error = %err, "Modem trace write failed");
                }
            }
        }
    }
}

impl Transport for RttPort {
    fn read_bytes(&mut self, max: usize) -> io::Result<Vec<u8>> {
        self.drain_modem_trace();

        let mut buf = vec![0u8; max];
        match self.stream.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        // RTT buffers are small; the J-Link accepts partial writes.
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let written = self.stream.write(remaining)?;
            remaining = &remaining[written..];
            if written == 0 {
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        self.stream.flush()
    }
}

// ============================================================
// In-memory transport for tests
// ============================================================

/// Shared-handle in-memory transport. Tests push device-side bytes with
/// [`push_bytes`](Self::push_bytes) and read back everything the gateway
/// wrote with [`take_written`](Self::take_written).
#[derive(Clone, Default)]
pub struct MockTransport {
    rx: Arc<Mutex<VecDeque<u8>>>,
    tx: Arc<Mutex<Vec<u8>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&self, bytes: &[u8]) {
        self.rx.lock().expect("mock lock").extend(bytes.iter().copied());
    }

    /// Drain everything written to the transport so far.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut *self.tx.lock().expect("mock lock"))
    }
}

impl Transport for MockTransport {
    fn read_bytes(&mut self, max: usize) -> io::Result<Vec<u8>> {
        let mut rx = self.rx.lock().expect("mock lock");
        if rx.is_empty() {
            drop(rx);
            // Mimic the serial read timeout.
            std::thread::sleep(Duration::from_millis(5));
            return Ok(Vec::new());
        }
        let take = rx.len().min(max);
        Ok(rx.drain(..take).collect())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.tx.lock().expect("mock lock").extend_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_round_trip() {
        let mock = MockTransport::new();
        let mut handle = mock.clone();

        mock.push_bytes(&[1, 2, 3]);
        assert_eq!(handle.read_bytes(16).unwrap(), vec![1, 2, 3]);
        assert_eq!(handle.read_bytes(16).unwrap(), Vec::<u8>::new());

        handle.write_frame(&[9, 9]).unwrap();
        handle.ping().unwrap();
        let written = mock.take_written();
        assert_eq!(&written[..6], &[0xD5, 0xCA, 2, 0, 9, 9]);
        assert_eq!(&written[6..], &PING_FRAME);
    }
}
