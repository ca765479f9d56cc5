//! Unified serial control for fleets of LED/fan growth-chamber modules.
//!
//! This crate drives up to 16 microcontroller-backed chamber modules over
//! per-device serial links. Each module exposes six PWM light channels and
//! a fan through a newline-terminated ASCII protocol (`SETALL`, `FAN_SET`,
//! `PING`). The crate owns the hard parts - per-device command queues,
//! connection lifecycle with retry and reconnect, and adaptive evaluation
//! of per-channel time-of-day windows - behind one coordinator interface.
//!
//! # Getting Started
//!
//! ```no_run
//! use std::collections::HashMap;
//! use chamber_link::{FleetConfig, FleetCoordinator, FleetSettings, UsbEnumerator};
//!
//! // Chamber numbers for known module serial numbers; unmapped modules
//! // get synthesized ids starting at 1000.
//! let chamber_map: HashMap<String, u32> =
//!     HashMap::from([("A1B2C3".to_string(), 1)]);
//!
//! // Desired intensities and schedules live in the settings document.
//! let settings = FleetSettings::load("chambers.json").unwrap_or_default();
//!
//! let (fleet, reports) = FleetCoordinator::new(
//!     Box::new(UsbEnumerator::new(0x2e8a, 0x000a)),
//!     Box::new(chamber_map),
//!     Box::new(settings),
//!     FleetConfig::default(),
//! );
//!
//! // Detect the fleet and push the current state everywhere.
//! let devices = fleet.scan_devices();
//! println!("found {} module(s)", devices.len());
//! fleet.apply_all();
//!
//! // Lights on channel 0 follow an 08:00–20:00 window from now on;
//! // the scheduler re-applies affected devices when windows open/close.
//! fleet.set_schedule(0, 0, "08:00", "20:00", true).unwrap();
//! fleet.set_scheduling_enabled(true);
//!
//! // Execution outcomes arrive on the report stream.
//! for report in reports.iter() {
//!     println!(
//!         "device {} {} -> {}",
//!         report.device_index,
//!         report.kind,
//!         if report.success { "ok" } else { report.message.as_str() }
//!     );
//! }
//! ```
//!
//! # Architecture
//!
//! - [`protocol`] - pure codec for the wire format.
//! - [`transport`] - the serial seam; the only module touching hardware.
//! - [`link`] - one connection per device: lifecycle, retries, reconnect.
//! - [`queue`] - per-device worker so a slow module is never flooded and
//!   redundant `SETALL` intents coalesce (last-value-wins).
//! - [`scheduler`] - per-channel on/off windows with an adaptive re-poll
//!   interval that tightens near window boundaries.
//! - [`fleet`] - the coordinator: scan, duty resolution, fan-out,
//!   result aggregation.
//! - [`settings`] - the persisted JSON document (intensities, windows, fan).
//!
//! # Concurrency Model
//!
//! One worker thread per device plus one scheduler timer thread and one
//! dispatcher loop. Serial handles are exclusively owned by their device's
//! link; commands for the same device execute in enqueue order (modulo
//! `SETALL` coalescing); devices are independent of each other.

pub mod error;
pub mod fleet;
pub mod link;
pub mod protocol;
pub mod queue;
pub mod scheduler;
pub mod settings;
pub mod transport;
pub mod types;

// Crate-level error types
pub use error::{Error, Result};

// Coordinator and its collaborator seams
pub use fleet::{
    ChamberMap, FleetConfig, FleetCoordinator, IntensitySource, OpenerFactory, PortCandidate,
    PortEnumerator, UsbEnumerator,
};

// Device link and queue
pub use link::DeviceLink;
pub use queue::CommandQueue;

// Scheduling
pub use scheduler::{ChannelSchedule, ScheduleEvent, Scheduler, TickReport};

// Persisted settings
pub use settings::{ChamberSettings, ChannelSettings, FanSettings, FleetSettings};

// Transport seam
pub use transport::{SerialTransport, Transport, TransportOpener};

// Core types
pub use types::{
    encode_duty, Command, CommandKind, CommandReport, ConnectionState, DeviceIdentity,
    SYNTHESIZED_CHAMBER_BASE,
};
