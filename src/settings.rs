//! Persisted fleet settings.
//!
//! A JSON document keyed by chamber identifier. Each entry carries the six
//! per-channel intensities and schedule windows plus the fan setting. The
//! document is produced and consumed here but owned by the caller - the
//! core reads intensities from it through [`IntensitySource`].

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fleet::IntensitySource;
use crate::protocol::CHANNEL_COUNT;
use crate::scheduler::{parse_hhmm, ChannelSchedule};

/// One channel's persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Desired brightness percent.
    pub intensity: u8,
    /// Window start, `HH:MM`.
    pub on_time: String,
    /// Window end, `HH:MM`.
    pub off_time: String,
    /// Whether the window is applied.
    pub enabled: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            intensity: 0,
            on_time: "08:00".into(),
            off_time: "00:00".into(),
            enabled: false,
        }
    }
}

/// Persisted fan state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FanSettings {
    pub enabled: bool,
    pub speed: u8,
}

/// All persisted state for one chamber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChamberSettings {
    pub channels: [ChannelSettings; CHANNEL_COUNT],
    pub fan: FanSettings,
}

/// The whole settings document, keyed by chamber number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FleetSettings {
    pub chambers: BTreeMap<u32, ChamberSettings>,
}

impl FleetSettings {
    /// Read and normalize a settings document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Settings(format!("{}: {}", path.as_ref().display(), e)))?;
        let mut settings: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Settings(format!("{}: {}", path.as_ref().display(), e)))?;
        settings.normalize();
        Ok(settings)
    }

    /// Write the document as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Settings(e.to_string()))?;
        fs::write(path.as_ref(), text)
            .map_err(|e| Error::Settings(format!("{}: {}", path.as_ref().display(), e)))
    }

    /// Clamp out-of-range values and disable entries with invalid times.
    pub fn normalize(&mut self) {
        for chamber in self.chambers.values_mut() {
            for channel in chamber.channels.iter_mut() {
                channel.intensity = channel.intensity.min(100);
                if channel.enabled
                    && (parse_hhmm(&channel.on_time).is_err()
                        || parse_hhmm(&channel.off_time).is_err())
                {
                    log::warn!(
                        "disabling schedule with invalid times {:?}/{:?}",
                        channel.on_time,
                        channel.off_time
                    );
                    channel.enabled = false;
                }
            }
            chamber.fan.speed = chamber.fan.speed.min(100);
        }
    }

    /// Settings for one chamber, creating a default entry on first touch.
    pub fn chamber_mut(&mut self, chamber: u32) -> &mut ChamberSettings {
        self.chambers.entry(chamber).or_default()
    }

    /// The schedule stored for one channel of one chamber, or the default.
    pub fn channel_schedule(&self, chamber: u32, channel: usize) -> ChannelSchedule {
        self.chambers
            .get(&chamber)
            .and_then(|c| c.channels.get(channel))
            .map(|ch| ChannelSchedule::from_times(&ch.on_time, &ch.off_time, ch.enabled))
            .unwrap_or_default()
    }
}

impl IntensitySource for FleetSettings {
    fn intensity(&self, chamber: u32, channel: usize) -> u8 {
        self.chambers
            .get(&chamber)
            .and_then(|c| c.channels.get(channel))
            .map(|ch| ch.intensity)
            .unwrap_or(0)
    }

    fn fan(&self, chamber: u32) -> Option<u8> {
        self.chambers
            .get(&chamber)
            .and_then(|c| c.fan.enabled.then_some(c.fan.speed))
    }
}

/// Shared, mutable settings handle for callers that edit the document
/// while the coordinator reads from it.
impl IntensitySource for Arc<Mutex<FleetSettings>> {
    fn intensity(&self, chamber: u32, channel: usize) -> u8 {
        self.lock().unwrap().intensity(chamber, channel)
    }

    fn fan(&self, chamber: u32) -> Option<u8> {
        self.lock().unwrap().fan(chamber)
    }
}
