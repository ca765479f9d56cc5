//! Serial transport seam.
//!
//! All hardware I/O goes through the [`Transport`] trait so the link, queue
//! and coordinator layers can be exercised against scripted implementations.
//! [`SerialTransport`] is the one production implementation; it is the only
//! place in the crate that touches an OS serial handle.

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};

use crate::error::{Error, Result};
use crate::protocol::BAUD_RATE;

/// Delay after opening the port before trusting input.
///
/// The microcontroller resets on port open and prints a boot banner;
/// the firmware is not ready to answer until roughly 2 s have passed.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Bound on waiting for a single response line.
pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// One open connection to a chamber module.
///
/// `read_line` returns the next newline-terminated line with the terminator
/// stripped, or an empty string once [`READ_TIMEOUT`] elapses with nothing
/// buffered - the caller decides whether that is a timeout error.
pub trait Transport: Send {
    /// Write the full command buffer.
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Flush pending output to the device.
    fn flush(&mut self) -> Result<()>;

    /// Read one response line within the read timeout.
    fn read_line(&mut self) -> Result<String>;

    /// Drop any buffered input (stale responses, boot banner remnants).
    fn discard_input(&mut self) -> Result<()>;
}

/// Factory that opens a fresh connection, used by the link on every
/// connect and reconnect.
pub type TransportOpener = Box<dyn Fn() -> Result<Box<dyn Transport>> + Send>;

/// Production transport over an OS serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    read_timeout: Duration,
}

impl SerialTransport {
    /// Open `port_name` at 115200 8N1, wait out the boot banner and
    /// discard whatever the device printed while settling.
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_timeout(port_name, READ_TIMEOUT)
    }

    /// Open with a custom response read timeout.
    pub fn open_with_timeout(port_name: &str, read_timeout: Duration) -> Result<Self> {
        let port = serialport::new(port_name, BAUD_RATE)
            // Short per-syscall timeout; read_line enforces the real bound.
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| Error::connection(format!("{}: {}", port_name, e)))?;

        let mut transport = Self { port, read_timeout };

        thread::sleep(SETTLE_DELAY);
        transport.discard_input()?;

        Ok(transport)
    }

    /// Build an opener for the link layer to (re)connect with.
    pub fn opener(port_name: impl Into<String>) -> TransportOpener {
        let port_name = port_name.into();
        Box::new(move || {
            SerialTransport::open(&port_name).map(|t| Box::new(t) as Box<dyn Transport>)
        })
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes).map_err(Error::transport)
    }

    fn flush(&mut self) -> Result<()> {
        self.port.flush().map_err(Error::transport)
    }

    fn read_line(&mut self) -> Result<String> {
        let deadline = Instant::now() + self.read_timeout;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];

        while Instant::now() < deadline {
            match self.port.read(&mut byte) {
                Ok(0) => continue,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        return Ok(String::from_utf8_lossy(&line).into_owned());
                    }
                    line.push(byte[0]);
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::transport(e)),
            }
        }

        // Timed out. A partial line without its terminator is not a usable
        // answer either way; surface what we have and let the codec decide.
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(Error::transport)
    }
}
