//! Core types for the chamber fleet: device identity, connection state,
//! command intents and execution reports.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{self, CHANNEL_COUNT, DUTY_MAX};

/// Chamber numbers at or above this value were synthesized for devices
/// whose serial number has no entry in the chamber map.
pub const SYNTHESIZED_CHAMBER_BASE: u32 = 1000;

/// Identity of one detected chamber module.
///
/// Identities are immutable once a scan completes; the next scan replaces
/// the whole set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// OS path of the serial port (e.g. `/dev/ttyACM0`, `COM5`).
    pub port_name: String,
    /// USB serial number reported by the module.
    pub serial_number: String,
    /// Stable chamber number, either mapped from the serial number or
    /// synthesized (≥ [`SYNTHESIZED_CHAMBER_BASE`]).
    pub chamber: u32,
}

impl DeviceIdentity {
    /// True if the chamber number was synthesized rather than mapped.
    pub fn is_synthesized(&self) -> bool {
        self.chamber >= SYNTHESIZED_CHAMBER_BASE
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chamber {} ({})", self.chamber, self.port_name)
    }
}

/// Connection state of a single device link.
///
/// Owned exclusively by that device's [`DeviceLink`](crate::link::DeviceLink).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal state entered only by explicit teardown.
    Faulted(String),
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Faulted(reason) => write!(f, "faulted: {}", reason),
        }
    }
}

/// A queued, not-yet-executed command destined for one device.
///
/// Intents are validated on construction and never mutated afterwards;
/// out-of-range values are rejected before the codec is ever reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Set all six channel duty cycles at once.
    SetChannels([u16; CHANNEL_COUNT]),
    /// Set the fan speed in percent.
    SetFan(u8),
    /// Liveness probe.
    Ping,
}

impl Command {
    /// Build a `SETALL` intent, rejecting duty values above [`DUTY_MAX`].
    pub fn set_channels(duty: [u16; CHANNEL_COUNT]) -> Result<Self> {
        if let Some(bad) = duty.iter().find(|d| **d > DUTY_MAX) {
            return Err(Error::invalid_command(format!(
                "duty value {} exceeds {}",
                bad, DUTY_MAX
            )));
        }
        Ok(Self::SetChannels(duty))
    }

    /// Build a `FAN_SET` intent, rejecting percentages above 100.
    pub fn set_fan(percent: u8) -> Result<Self> {
        if percent > 100 {
            return Err(Error::invalid_command(format!(
                "fan percent {} exceeds 100",
                percent
            )));
        }
        Ok(Self::SetFan(percent))
    }

    /// The kind tag used in execution reports.
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::SetChannels(_) => CommandKind::SetChannels,
            Self::SetFan(_) => CommandKind::SetFan,
            Self::Ping => CommandKind::Ping,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::SetChannels(duty) => protocol::encode_set_channels(duty),
            Self::SetFan(percent) => protocol::encode_fan_set(*percent),
            Self::Ping => protocol::encode_ping(),
        }
    }
}

/// Command type tag for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    SetChannels,
    SetFan,
    Ping,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetChannels => write!(f, "SETALL"),
            Self::SetFan => write!(f, "FAN_SET"),
            Self::Ping => write!(f, "PING"),
        }
    }
}

/// Outcome of one executed intent, delivered on the coordinator's
/// result stream for the UI to render.
#[derive(Debug, Clone)]
pub struct CommandReport {
    pub device_index: usize,
    pub kind: CommandKind,
    pub success: bool,
    pub message: String,
}

impl CommandReport {
    pub(crate) fn new(device_index: usize, kind: CommandKind, result: &Result<()>) -> Self {
        match result {
            Ok(()) => Self {
                device_index,
                kind,
                success: true,
                message: String::new(),
            },
            Err(err) => Self {
                device_index,
                kind,
                success: false,
                message: err.to_string(),
            },
        }
    }
}

/// Convert a brightness percentage to a 12-bit duty cycle.
///
/// Monotonic in `percent`, with `encode_duty(0) == 0` and
/// `encode_duty(100) == DUTY_MAX`. Out-of-range input is clamped.
pub fn encode_duty(percent: u8) -> u16 {
    let percent = percent.min(100) as f64;
    // Multiply before dividing so exact halves (e.g. 30% -> 1228.5) round
    // consistently instead of drifting on the representation of 1/100.
    let duty = (percent * DUTY_MAX as f64 / 100.0).round() as u16;
    duty.min(DUTY_MAX)
}
