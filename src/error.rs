//! Crate-level error types.

use std::error::Error as StdError;

/// Crate-level error type.
///
/// Errors split into two families: definitive answers (`Board`,
/// `InvalidCommand`) that must never be retried, and transport-level
/// failures (`Transport`, `Timeout`, `UnexpectedResponse`) that the link
/// retries internally before giving up with `MaxRetries`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Opening the serial port failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A read or write failed mid-exchange.
    #[error("transport error: {source}")]
    Transport {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// No response line arrived within the read timeout.
    #[error("timed out waiting for response")]
    Timeout,

    /// The device answered with a line the codec could not classify.
    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(String),

    /// A well-formed `ERR:` answer from the firmware, surfaced verbatim.
    #[error("board error: {0}")]
    Board(String),

    /// All retry attempts were exhausted.
    #[error("giving up after {attempts} attempts: {last}")]
    MaxRetries {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    /// The command was rejected before transmission.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The link was explicitly torn down; no further commands are accepted.
    #[error("link closed")]
    LinkClosed,

    /// The settings document could not be read or written.
    #[error("settings error: {0}")]
    Settings(String),
}

impl Error {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Wrap an I/O or serial error that occurred mid-exchange.
    pub fn transport(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Transport {
            source: Box::new(source),
        }
    }

    /// Create an invalid-command error.
    pub fn invalid_command(msg: impl Into<String>) -> Self {
        Self::InvalidCommand(msg.into())
    }

    /// True for errors that mean the device never gave a usable answer.
    ///
    /// These are the errors `execute` retries over; a `Board` answer or a
    /// rejected command is definitive and returns `false`.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout | Self::UnexpectedResponse(_)
        )
    }

    /// True if this is a well-formed `ERR:` answer from the firmware.
    pub fn is_board_error(&self) -> bool {
        matches!(self, Self::Board(_))
    }

    /// True if the error came from losing (or failing to open) the connection.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::LinkClosed)
    }

    /// True if the response read timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Crate-level result type.
pub type Result<T> = std::result::Result<T, Error>;
