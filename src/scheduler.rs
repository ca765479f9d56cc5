//! Per-channel time-of-day scheduling.
//!
//! Every `(device, channel)` pair can carry an on/off window evaluated
//! against local wall-clock time. Windows are stored keyed by chamber
//! number so they survive re-scans of the fleet; the device binding table
//! maps device indices to chambers and is rebuilt on each scan.
//!
//! Evaluation runs on one dedicated timer thread that re-arms itself after
//! each tick with an adaptive delay: tight polling only when a window
//! boundary is about to pass, relaxed otherwise.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Timelike;

use crate::error::{Error, Result};
use crate::protocol::CHANNEL_COUNT;

/// Minutes in a day; window arithmetic wraps at this modulus.
pub const MINUTES_PER_DAY: u32 = 1440;

/// Re-poll when the nearest boundary is ≤ 1 minute away.
const URGENT_POLL: Duration = Duration::from_millis(100);
/// Re-poll when the nearest boundary is ≤ 5 minutes away.
const FAST_POLL: Duration = Duration::from_millis(250);
/// Re-poll when the nearest boundary is ≤ 15 minutes away.
const NORMAL_POLL: Duration = Duration::from_secs(1);
/// Re-poll when no boundary is near.
const RELAXED_POLL: Duration = Duration::from_secs(5);
/// Re-poll when no channel anywhere has a schedule enabled.
const IDLE_POLL: Duration = Duration::from_secs(30);

/// Parse an `HH:MM` time into minutes since midnight.
pub fn parse_hhmm(text: &str) -> Result<u32> {
    let (h, m) = text
        .split_once(':')
        .ok_or_else(|| Error::invalid_command(format!("bad time {:?}", text)))?;
    let hours: u32 = h
        .trim()
        .parse()
        .map_err(|_| Error::invalid_command(format!("bad time {:?}", text)))?;
    let minutes: u32 = m
        .trim()
        .parse()
        .map_err(|_| Error::invalid_command(format!("bad time {:?}", text)))?;
    if hours > 23 || minutes > 59 {
        return Err(Error::invalid_command(format!("bad time {:?}", text)));
    }
    Ok(hours * 60 + minutes)
}

/// Format minutes since midnight as `HH:MM`.
pub fn format_hhmm(minutes: u32) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// One channel's on/off window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSchedule {
    pub on_minutes: u32,
    pub off_minutes: u32,
    pub enabled: bool,
}

impl Default for ChannelSchedule {
    /// `on=08:00, off=00:00, enabled=false`.
    fn default() -> Self {
        Self {
            on_minutes: 8 * 60,
            off_minutes: 0,
            enabled: false,
        }
    }
}

impl ChannelSchedule {
    /// Build from `HH:MM` strings.
    ///
    /// Invariant: times must be valid whenever `enabled` is true. A schedule
    /// with an unparseable time is forced disabled and keeps defaults for
    /// the bad field.
    pub fn from_times(on: &str, off: &str, enabled: bool) -> Self {
        let default = Self::default();
        match (parse_hhmm(on), parse_hhmm(off)) {
            (Ok(on_minutes), Ok(off_minutes)) => Self {
                on_minutes,
                off_minutes,
                enabled,
            },
            (on_res, off_res) => {
                if enabled {
                    log::warn!("invalid schedule times {:?}/{:?}, disabling", on, off);
                }
                Self {
                    on_minutes: on_res.unwrap_or(default.on_minutes),
                    off_minutes: off_res.unwrap_or(default.off_minutes),
                    enabled: false,
                }
            }
        }
    }

    /// Whether the window contains `now` (minutes since midnight).
    ///
    /// `on == off` means a 24-hour window (always active); `off < on`
    /// means the window crosses midnight.
    pub fn is_active_at(&self, now: u32) -> bool {
        let (on, off) = (self.on_minutes, self.off_minutes);
        if on == off {
            return true;
        }
        if on < off {
            on <= now && now < off
        } else {
            now >= on || now < off
        }
    }

    /// Minutes until the nearest upcoming on/off boundary, wrapping at
    /// midnight. `None` for 24-hour windows, which have no boundary.
    pub fn minutes_to_boundary(&self, now: u32) -> Option<u32> {
        if self.on_minutes == self.off_minutes {
            return None;
        }
        let until = |t: u32| {
            let d = (t + MINUTES_PER_DAY - now) % MINUTES_PER_DAY;
            if d == 0 {
                MINUTES_PER_DAY
            } else {
                d
            }
        };
        Some(until(self.on_minutes).min(until(self.off_minutes)))
    }
}

/// Result of one evaluation tick.
#[derive(Debug, Default)]
pub struct TickReport {
    /// `(device_index, channel)` pairs whose active state flipped.
    pub changed: Vec<(usize, usize)>,
    /// Minutes to the nearest boundary across all enabled channels.
    pub min_boundary: Option<u32>,
    /// Enabled channels examined this tick.
    pub enabled_count: usize,
}

/// Delay before the next evaluation, derived from the tick outcome.
pub fn repoll_delay(report: &TickReport) -> Duration {
    if report.enabled_count == 0 {
        return IDLE_POLL;
    }
    match report.min_boundary {
        Some(m) if m <= 1 => URGENT_POLL,
        Some(m) if m <= 5 => FAST_POLL,
        Some(m) if m <= 15 => NORMAL_POLL,
        _ => RELAXED_POLL,
    }
}

struct Entry {
    schedule: ChannelSchedule,
    /// Cached active state; `None` until first observation.
    active: Option<bool>,
}

/// Schedule table plus transition cache. All access goes through the
/// owning [`Scheduler`]'s lock.
#[derive(Default)]
struct Core {
    /// Keyed by `(chamber, channel)` so schedules survive re-scans.
    entries: HashMap<(u32, usize), Entry>,
    /// Device index → chamber number, rebuilt on each scan.
    bindings: Vec<u32>,
}

impl Core {
    fn set_schedule(&mut self, chamber: u32, channel: usize, schedule: ChannelSchedule) {
        // Reset the cache so the next tick re-announces this key.
        self.entries
            .insert((chamber, channel), Entry { schedule, active: None });
    }

    fn schedule(&self, chamber: u32, channel: usize) -> ChannelSchedule {
        self.entries
            .get(&(chamber, channel))
            .map(|e| e.schedule)
            .unwrap_or_default()
    }

    fn evaluate_at(&mut self, now: u32) -> TickReport {
        let mut report = TickReport::default();

        for (device_index, chamber) in self.bindings.iter().enumerate() {
            for channel in 0..CHANNEL_COUNT {
                let Some(entry) = self.entries.get_mut(&(*chamber, channel)) else {
                    continue;
                };
                if !entry.schedule.enabled {
                    continue;
                }
                report.enabled_count += 1;

                let active = entry.schedule.is_active_at(now);
                if entry.active != Some(active) {
                    entry.active = Some(active);
                    report.changed.push((device_index, channel));
                }

                if let Some(boundary) = entry.schedule.minutes_to_boundary(now) {
                    report.min_boundary = Some(match report.min_boundary {
                        Some(current) => current.min(boundary),
                        None => boundary,
                    });
                }
            }
        }

        report
    }
}

/// Event delivered to the coordinator when channel states flip.
#[derive(Debug, Clone)]
pub struct ScheduleEvent {
    pub changed: Vec<(usize, usize)>,
}

struct Shared {
    core: Mutex<Core>,
    running: AtomicBool,
    /// Guards the timer's re-arm wait; notified to cancel a pending wait
    /// (disable, schedule edits).
    wakeup: Mutex<()>,
    condvar: Condvar,
}

impl Shared {
    /// Cut a pending re-arm wait short so the next tick happens promptly.
    fn wake(&self) {
        let _guard = self.wakeup.lock().unwrap();
        self.condvar.notify_all();
    }
}

/// Periodic evaluator for all channel schedules.
pub struct Scheduler {
    shared: Arc<Shared>,
    event_tx: Sender<ScheduleEvent>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a stopped scheduler that reports flips on `event_tx`.
    pub fn new(event_tx: Sender<ScheduleEvent>) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core::default()),
                running: AtomicBool::new(false),
                wakeup: Mutex::new(()),
                condvar: Condvar::new(),
            }),
            event_tx,
            handle: Mutex::new(None),
        }
    }

    /// Replace the device → chamber binding table (done on each scan).
    pub fn bind_devices(&self, chambers: Vec<u32>) {
        self.shared.core.lock().unwrap().bindings = chambers;
        self.shared.wake();
    }

    /// Install a schedule for a `(chamber, channel)` key.
    ///
    /// The transition cache for the key resets, so the next tick always
    /// reports it as changed.
    pub fn set_schedule(&self, chamber: u32, channel: usize, schedule: ChannelSchedule) {
        self.shared
            .core
            .lock()
            .unwrap()
            .set_schedule(chamber, channel, schedule);
        // Evaluate promptly instead of waiting out the armed delay.
        self.shared.wake();
    }

    /// The schedule stored for a key, or the default when none is set.
    pub fn schedule(&self, chamber: u32, channel: usize) -> ChannelSchedule {
        self.shared.core.lock().unwrap().schedule(chamber, channel)
    }

    /// Whether `(device, channel)` is currently inside its window.
    ///
    /// `None` when the device is unknown or the channel has no enabled
    /// schedule - the caller then uses the desired intensity unmodified.
    /// Between ticks the cached state from the last evaluation is the
    /// source of truth; an unobserved key is computed from the clock.
    pub fn is_active(&self, device_index: usize, channel: usize) -> Option<bool> {
        let core = self.shared.core.lock().unwrap();
        let chamber = *core.bindings.get(device_index)?;
        let entry = core.entries.get(&(chamber, channel))?;
        if !entry.schedule.enabled {
            return None;
        }
        Some(
            entry
                .active
                .unwrap_or_else(|| entry.schedule.is_active_at(local_now_minutes())),
        )
    }

    /// Start or stop the periodic evaluation. Idempotent either way;
    /// stopping cancels any pending re-arm wait.
    pub fn set_running(&self, run: bool) {
        if run {
            if self.shared.running.swap(true, Ordering::SeqCst) {
                return;
            }
            let shared = Arc::clone(&self.shared);
            let event_tx = self.event_tx.clone();
            let handle = thread::spawn(move || timer_loop(&shared, &event_tx));
            *self.handle.lock().unwrap() = Some(handle);
        } else {
            {
                // Flip the flag under the wakeup lock so the timer cannot
                // miss the notification between its check and its wait.
                let _guard = self.shared.wakeup.lock().unwrap();
                if !self.shared.running.swap(false, Ordering::SeqCst) {
                    return;
                }
                self.shared.condvar.notify_all();
            }
            if let Some(handle) = self.handle.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }

    /// One evaluation against an explicit clock; used by the timer thread
    /// and directly by tests.
    pub fn evaluate_at(&self, now_minutes: u32) -> TickReport {
        self.shared.core.lock().unwrap().evaluate_at(now_minutes)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.set_running(false);
    }
}

fn timer_loop(shared: &Shared, event_tx: &Sender<ScheduleEvent>) {
    log::debug!("scheduler: timer started");
    while shared.running.load(Ordering::SeqCst) {
        let report = shared.core.lock().unwrap().evaluate_at(local_now_minutes());

        if !report.changed.is_empty() {
            log::debug!("scheduler: {} channel(s) flipped", report.changed.len());
            if event_tx
                .send(ScheduleEvent {
                    changed: report.changed.clone(),
                })
                .is_err()
            {
                // Receiver gone; nothing left to notify.
                break;
            }
        }

        let delay = repoll_delay(&report);
        let guard = shared.wakeup.lock().unwrap();
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        let _ = shared.condvar.wait_timeout(guard, delay);
    }
    log::debug!("scheduler: timer stopped");
}

fn local_now_minutes() -> u32 {
    let now = chrono::Local::now();
    now.hour() * 60 + now.minute()
}
