//! Device link: connection lifecycle and request/response exchange for
//! exactly one chamber module.
//!
//! The link owns the only reference to its serial connection. All state is
//! guarded by one mutex which [`DeviceLink::execute`] holds for the entire
//! attempt, so a connect/retry sequence is atomic with respect to other
//! callers on the same device.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{classify_response, Response};
use crate::transport::{Transport, TransportOpener};
use crate::types::{Command, ConnectionState};

/// Retries after the first attempt before giving up.
pub const MAX_RETRIES: u32 = 2;

/// Base backoff between attempts; multiplied by the attempt count.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(150);

struct LinkInner {
    opener: TransportOpener,
    transport: Option<Box<dyn Transport>>,
    state: ConnectionState,
}

/// Manages one serial connection with retry and reconnect.
pub struct DeviceLink {
    label: String,
    inner: Mutex<LinkInner>,
}

impl DeviceLink {
    /// Create a link that opens its connection lazily via `opener`.
    ///
    /// `label` identifies the device in log output.
    pub fn new(label: impl Into<String>, opener: TransportOpener) -> Self {
        Self {
            label: label.into(),
            inner: Mutex::new(LinkInner {
                opener,
                transport: None,
                state: ConnectionState::Disconnected,
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().unwrap().state.clone()
    }

    /// True if a connection is currently open.
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected)
    }

    /// Tear the link down permanently.
    ///
    /// Idempotent and safe to call while a command is in flight: the
    /// in-flight `execute` finishes its attempt first (it holds the lock),
    /// after which every call fails fast with [`Error::LinkClosed`].
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !matches!(inner.state, ConnectionState::Faulted(_)) {
            log::info!("{}: link closed", self.label);
            inner.state = ConnectionState::Faulted("closed by teardown".into());
        }
        inner.transport = None;
    }

    /// Perform one synchronous request/response exchange.
    ///
    /// Connects on demand. `Ack` and `ERR:` answers return immediately -
    /// they are definitive answers, not transport failures. Timeouts,
    /// unexpected lines and transport errors drop the connection, back off
    /// proportionally to the retry count and reconnect, up to
    /// [`MAX_RETRIES`] additional attempts.
    pub fn execute(&self, command: &Command) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        if matches!(inner.state, ConnectionState::Faulted(_)) {
            return Err(Error::LinkClosed);
        }

        // Initial connect failures are reported immediately; the retry loop
        // only covers failures of an established exchange.
        if inner.transport.is_none() {
            Self::connect(&self.label, &mut inner)?;
        }

        let bytes = command.encode();
        let mut last_error = Error::Timeout;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                thread::sleep(RETRY_BACKOFF * attempt);
                if inner.transport.is_none() {
                    if let Err(err) = Self::connect(&self.label, &mut inner) {
                        log::warn!("{}: reconnect failed: {}", self.label, err);
                        last_error = err;
                        continue;
                    }
                }
            }

            match Self::exchange(inner.transport.as_mut().expect("connected"), &bytes) {
                Ok(Response::Ack) => return Ok(()),
                Ok(Response::Board(reason)) => {
                    // A definitive answer from the firmware; never retried.
                    return Err(Error::Board(reason));
                }
                Ok(Response::Empty) => last_error = Error::Timeout,
                Ok(Response::Unexpected(raw)) => last_error = Error::UnexpectedResponse(raw),
                Err(err) => last_error = err,
            }

            log::warn!(
                "{}: attempt {}/{} failed: {}",
                self.label,
                attempt + 1,
                MAX_RETRIES + 1,
                last_error
            );
            inner.transport = None;
            inner.state = ConnectionState::Disconnected;
        }

        Err(Error::MaxRetries {
            attempts: MAX_RETRIES + 1,
            last: Box::new(last_error),
        })
    }

    fn connect(label: &str, inner: &mut LinkInner) -> Result<()> {
        inner.state = ConnectionState::Connecting;
        match (inner.opener)() {
            Ok(transport) => {
                log::info!("{}: connected", label);
                inner.transport = Some(transport);
                inner.state = ConnectionState::Connected;
                Ok(())
            }
            Err(err) => {
                inner.state = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    fn exchange(transport: &mut Box<dyn Transport>, bytes: &[u8]) -> Result<Response> {
        transport.discard_input()?;
        transport.write_all(bytes)?;
        transport.flush()?;
        let line = transport.read_line()?;
        Ok(classify_response(&line))
    }
}
