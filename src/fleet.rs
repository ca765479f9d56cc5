//! Fleet coordinator: owns the device links, queues and scheduler, and
//! fans out apply requests across the fleet.
//!
//! The coordinator translates desired channel intensities plus schedule
//! state into concrete duty-cycle vectors, enqueues them on the per-device
//! queues, and aggregates execution outcomes onto one result stream. The
//! device table is rebuilt wholesale on every scan - there is no global
//! port cache.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::link::DeviceLink;
use crate::protocol::CHANNEL_COUNT;
use crate::queue::CommandQueue;
use crate::scheduler::{ChannelSchedule, ScheduleEvent, Scheduler};
use crate::transport::{SerialTransport, TransportOpener};
use crate::types::{
    encode_duty, Command, CommandReport, DeviceIdentity, SYNTHESIZED_CHAMBER_BASE,
};

/// How often the dispatcher wakes to drain deferred devices when no
/// scheduler event arrives.
const DISPATCH_POLL: Duration = Duration::from_millis(250);

/// Fleet-level tuning knobs.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Upper bound on managed devices; extra detections are ignored.
    pub max_devices: usize,
    /// Pause between devices during `apply_all`, so a shared USB
    /// controller is not saturated.
    pub inter_device_delay: Duration,
    /// Upper bound on devices applied per scheduler tick; the remainder
    /// is deferred to a follow-up tick.
    pub max_apply_per_tick: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            max_devices: 16,
            inter_device_delay: Duration::from_millis(25),
            max_apply_per_tick: 4,
        }
    }
}

/// A serial port that looks like a chamber module.
#[derive(Debug, Clone)]
pub struct PortCandidate {
    pub port_name: String,
    pub serial_number: String,
}

/// Collaborator that enumerates candidate serial ports.
pub trait PortEnumerator: Send + Sync {
    fn enumerate(&self) -> Vec<PortCandidate>;
}

/// Enumerates USB serial ports filtered by vendor/product id.
pub struct UsbEnumerator {
    vendor_id: u16,
    product_id: u16,
}

impl UsbEnumerator {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }
}

impl PortEnumerator for UsbEnumerator {
    fn enumerate(&self) -> Vec<PortCandidate> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(err) => {
                log::warn!("port enumeration failed: {}", err);
                return Vec::new();
            }
        };

        ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                serialport::SerialPortType::UsbPort(info)
                    if info.vid == self.vendor_id && info.pid == self.product_id =>
                {
                    Some(PortCandidate {
                        serial_number: info
                            .serial_number
                            .unwrap_or_else(|| port.port_name.clone()),
                        port_name: port.port_name,
                    })
                }
                _ => None,
            })
            .collect()
    }
}

/// Collaborator mapping a module's serial number to its chamber number.
pub trait ChamberMap: Send + Sync {
    fn chamber_for(&self, serial_number: &str) -> Option<u32>;
}

impl ChamberMap for std::collections::HashMap<String, u32> {
    fn chamber_for(&self, serial_number: &str) -> Option<u32> {
        self.get(serial_number).copied()
    }
}

/// Collaborator supplying desired intensities, keyed by chamber so values
/// survive re-scans. Read-only to the core.
pub trait IntensitySource: Send + Sync {
    /// Desired brightness percent for one channel.
    fn intensity(&self, chamber: u32, channel: usize) -> u8;

    /// Desired fan percent, or `None` to leave the fan untouched.
    fn fan(&self, chamber: u32) -> Option<u8> {
        let _ = chamber;
        None
    }
}

/// Factory producing a transport opener for a named port.
pub type OpenerFactory = Box<dyn Fn(&str) -> TransportOpener + Send + Sync>;

struct DeviceSlot {
    identity: DeviceIdentity,
    link: Arc<DeviceLink>,
    queue: CommandQueue,
}

struct FleetInner {
    config: FleetConfig,
    enumerator: Box<dyn PortEnumerator>,
    chamber_map: Box<dyn ChamberMap>,
    intensities: Box<dyn IntensitySource>,
    opener_factory: OpenerFactory,
    devices: Mutex<Vec<DeviceSlot>>,
    scheduler: Arc<Scheduler>,
    report_tx: Sender<CommandReport>,
    /// Devices deferred past the per-tick apply bound.
    pending: Mutex<VecDeque<usize>>,
    running: AtomicBool,
}

/// Owns the fleet: N device links + queues, the scheduler, and the
/// dispatcher that turns schedule flips into re-applies.
pub struct FleetCoordinator {
    inner: Arc<FleetInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl FleetCoordinator {
    /// Create a coordinator using real serial transports.
    ///
    /// Returns the coordinator and the receiving end of the result stream
    /// (`CommandReport` per executed intent).
    pub fn new(
        enumerator: Box<dyn PortEnumerator>,
        chamber_map: Box<dyn ChamberMap>,
        intensities: Box<dyn IntensitySource>,
        config: FleetConfig,
    ) -> (Self, Receiver<CommandReport>) {
        Self::with_transport_factory(
            enumerator,
            chamber_map,
            intensities,
            config,
            Box::new(|port| SerialTransport::opener(port)),
        )
    }

    /// Create a coordinator with a custom transport factory.
    ///
    /// This is the seam integration tests use to run the full stack
    /// against scripted transports instead of hardware.
    pub fn with_transport_factory(
        enumerator: Box<dyn PortEnumerator>,
        chamber_map: Box<dyn ChamberMap>,
        intensities: Box<dyn IntensitySource>,
        config: FleetConfig,
        opener_factory: OpenerFactory,
    ) -> (Self, Receiver<CommandReport>) {
        let (event_tx, event_rx) = mpsc::channel();
        let (report_tx, report_rx) = mpsc::channel();
        let scheduler = Arc::new(Scheduler::new(event_tx));

        let inner = Arc::new(FleetInner {
            config,
            enumerator,
            chamber_map,
            intensities,
            opener_factory,
            devices: Mutex::new(Vec::new()),
            scheduler,
            report_tx,
            pending: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
        });

        let dispatcher_inner = Arc::clone(&inner);
        let dispatcher = thread::spawn(move || dispatch_loop(&dispatcher_inner, &event_rx));

        (
            Self {
                inner,
                dispatcher: Mutex::new(Some(dispatcher)),
            },
            report_rx,
        )
    }

    /// Tear down the previous fleet and rebuild it from a fresh port scan.
    ///
    /// Serial numbers found in the chamber map get their mapped number;
    /// unmapped modules get synthesized ids starting at 1000.
    pub fn scan_devices(&self) -> Vec<DeviceIdentity> {
        let mut devices = self.inner.devices.lock().unwrap();

        // Full teardown of the previous generation.
        for slot in devices.iter_mut() {
            slot.queue.shutdown();
            slot.link.close();
        }
        devices.clear();
        self.inner.pending.lock().unwrap().clear();

        let mut identities = Vec::new();
        let mut chambers = Vec::new();

        for (index, candidate) in self
            .inner
            .enumerator
            .enumerate()
            .into_iter()
            .take(self.inner.config.max_devices)
            .enumerate()
        {
            let chamber = self
                .inner
                .chamber_map
                .chamber_for(&candidate.serial_number)
                .unwrap_or(SYNTHESIZED_CHAMBER_BASE + index as u32);

            let identity = DeviceIdentity {
                port_name: candidate.port_name.clone(),
                serial_number: candidate.serial_number,
                chamber,
            };
            log::info!("detected {}", identity);

            let opener = (self.inner.opener_factory)(&candidate.port_name);
            let link = Arc::new(DeviceLink::new(identity.to_string(), opener));
            let queue = CommandQueue::new(index, Arc::clone(&link), self.inner.report_tx.clone());

            identities.push(identity.clone());
            chambers.push(chamber);
            devices.push(DeviceSlot {
                identity,
                link,
                queue,
            });
        }

        self.inner.scheduler.bind_devices(chambers);
        identities
    }

    /// Identities of the current fleet, in device-index order.
    pub fn devices(&self) -> Vec<DeviceIdentity> {
        self.inner
            .devices
            .lock()
            .unwrap()
            .iter()
            .map(|slot| slot.identity.clone())
            .collect()
    }

    /// The scheduler owned by this coordinator.
    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Start or stop periodic schedule evaluation.
    pub fn set_scheduling_enabled(&self, enabled: bool) {
        self.inner.scheduler.set_running(enabled);
    }

    /// Install a schedule for one channel of one device.
    ///
    /// Invalid `HH:MM` strings force the schedule disabled.
    pub fn set_schedule(
        &self,
        device_index: usize,
        channel: usize,
        on_time: &str,
        off_time: &str,
        enabled: bool,
    ) -> Result<()> {
        if channel >= CHANNEL_COUNT {
            return Err(Error::invalid_command(format!(
                "channel {} out of range",
                channel
            )));
        }
        let chamber = self.chamber_of(device_index)?;
        let schedule = ChannelSchedule::from_times(on_time, off_time, enabled);
        self.inner.scheduler.set_schedule(chamber, channel, schedule);
        Ok(())
    }

    /// Resolve the duty vector for one device and enqueue it.
    pub fn apply_to_device(&self, device_index: usize) -> Result<()> {
        self.inner.apply_to_device(device_index)
    }

    /// Apply every device, pausing briefly between devices.
    pub fn apply_all(&self) {
        let count = self.inner.devices.lock().unwrap().len();
        for index in 0..count {
            if let Err(err) = self.inner.apply_to_device(index) {
                log::warn!("apply_all: device {} skipped: {}", index, err);
            }
            if index + 1 < count {
                thread::sleep(self.inner.config.inter_device_delay);
            }
        }
    }

    /// Apply the given devices, bounded per tick; the remainder is
    /// deferred and drained on following ticks.
    pub fn apply_changed(&self, device_indices: &[usize]) {
        self.inner.note_changed(device_indices);
        self.inner.drain_pending();
    }

    /// Stop the dispatcher and scheduler, drain the queues, close links.
    /// Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.scheduler.set_running(false);
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }

        let mut devices = self.inner.devices.lock().unwrap();
        for slot in devices.iter_mut() {
            slot.queue.shutdown();
            slot.link.close();
        }
        devices.clear();
    }
}

impl Drop for FleetCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl FleetCoordinator {
    fn chamber_of(&self, device_index: usize) -> Result<u32> {
        self.inner
            .devices
            .lock()
            .unwrap()
            .get(device_index)
            .map(|slot| slot.identity.chamber)
            .ok_or_else(|| Error::invalid_command(format!("no such device {}", device_index)))
    }
}

impl FleetInner {
    /// Build the duty vector for a device from desired intensities and
    /// schedule state, then enqueue `SETALL` (and `FAN_SET` if the source
    /// drives the fan).
    ///
    /// A channel whose schedule is enabled but outside its window is
    /// forced to duty 0; the desired intensity itself is never modified,
    /// so reactivation restores it.
    fn apply_to_device(&self, device_index: usize) -> Result<()> {
        let devices = self.devices.lock().unwrap();
        let slot = devices
            .get(device_index)
            .ok_or_else(|| Error::invalid_command(format!("no such device {}", device_index)))?;
        let chamber = slot.identity.chamber;

        let mut duty = [0u16; CHANNEL_COUNT];
        for (channel, slot_duty) in duty.iter_mut().enumerate() {
            let desired = self.intensities.intensity(chamber, channel);
            *slot_duty = match self.scheduler.is_active(device_index, channel) {
                Some(false) => 0,
                _ => encode_duty(desired),
            };
        }

        slot.queue.enqueue(Command::set_channels(duty)?)?;

        if let Some(percent) = self.intensities.fan(chamber) {
            slot.queue.enqueue(Command::set_fan(percent)?)?;
        }

        Ok(())
    }

    fn note_changed(&self, device_indices: &[usize]) {
        let mut pending = self.pending.lock().unwrap();
        for &index in device_indices {
            if !pending.contains(&index) {
                pending.push_back(index);
            }
        }
    }

    /// Apply at most `max_apply_per_tick` deferred devices.
    fn drain_pending(&self) {
        for _ in 0..self.config.max_apply_per_tick {
            let Some(index) = self.pending.lock().unwrap().pop_front() else {
                return;
            };
            if let Err(err) = self.apply_to_device(index) {
                log::warn!("deferred apply: device {} skipped: {}", index, err);
            }
        }
    }
}

/// Consumes scheduler events and fans out re-applies, bounded per tick.
/// The timeout arm keeps draining devices deferred from earlier ticks.
fn dispatch_loop(inner: &Arc<FleetInner>, event_rx: &Receiver<ScheduleEvent>) {
    log::debug!("dispatcher started");
    while inner.running.load(Ordering::SeqCst) {
        match event_rx.recv_timeout(DISPATCH_POLL) {
            Ok(event) => {
                let devices: Vec<usize> = {
                    let mut seen = Vec::new();
                    for (device, _channel) in event.changed {
                        if !seen.contains(&device) {
                            seen.push(device);
                        }
                    }
                    seen
                };
                inner.note_changed(&devices);
                inner.drain_pending();
            }
            Err(RecvTimeoutError::Timeout) => inner.drain_pending(),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use std::collections::HashMap;
    use std::sync::mpsc::Receiver;

    /// Transport that acks everything and records lines per port.
    struct AckTransport {
        port: String,
        lines: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl Transport for AckTransport {
        fn write_all(&mut self, bytes: &[u8]) -> crate::Result<()> {
            self.lines.lock().unwrap().push((
                self.port.clone(),
                String::from_utf8_lossy(bytes).trim_end().to_string(),
            ));
            Ok(())
        }

        fn flush(&mut self) -> crate::Result<()> {
            Ok(())
        }

        fn read_line(&mut self) -> crate::Result<String> {
            Ok("OK".into())
        }

        fn discard_input(&mut self) -> crate::Result<()> {
            Ok(())
        }
    }

    struct FixedPorts(Vec<PortCandidate>);

    impl PortEnumerator for FixedPorts {
        fn enumerate(&self) -> Vec<PortCandidate> {
            self.0.clone()
        }
    }

    struct FixedIntensities {
        percent: u8,
        fan: Option<u8>,
    }

    impl IntensitySource for FixedIntensities {
        fn intensity(&self, _chamber: u32, _channel: usize) -> u8 {
            self.percent
        }

        fn fan(&self, _chamber: u32) -> Option<u8> {
            self.fan
        }
    }

    type Lines = Arc<Mutex<Vec<(String, String)>>>;

    fn fixture(
        ports: Vec<PortCandidate>,
        map: HashMap<String, u32>,
        intensities: FixedIntensities,
    ) -> (FleetCoordinator, Receiver<CommandReport>, Lines) {
        let lines: Lines = Arc::new(Mutex::new(Vec::new()));
        let lines_for_factory = Arc::clone(&lines);
        let factory: OpenerFactory = Box::new(move |port| {
            let port = port.to_string();
            let lines = Arc::clone(&lines_for_factory);
            Box::new(move || {
                Ok(Box::new(AckTransport {
                    port: port.clone(),
                    lines: Arc::clone(&lines),
                }) as Box<dyn Transport>)
            })
        });

        let (fleet, reports) = FleetCoordinator::with_transport_factory(
            Box::new(FixedPorts(ports)),
            Box::new(map),
            Box::new(intensities),
            FleetConfig::default(),
            factory,
        );
        (fleet, reports, lines)
    }

    fn candidate(port: &str, serial: &str) -> PortCandidate {
        PortCandidate {
            port_name: port.into(),
            serial_number: serial.into(),
        }
    }

    #[test]
    fn scan_maps_and_synthesizes_chambers() {
        let map: HashMap<String, u32> = [("SER-A".to_string(), 3)].into_iter().collect();
        let (fleet, _reports, _lines) = fixture(
            vec![candidate("/dev/ttyACM0", "SER-A"), candidate("/dev/ttyACM1", "SER-B")],
            map,
            FixedIntensities {
                percent: 0,
                fan: None,
            },
        );

        let identities = fleet.scan_devices();
        assert_eq!(identities.len(), 2);
        assert_eq!(identities[0].chamber, 3);
        assert!(!identities[0].is_synthesized());
        assert_eq!(identities[1].chamber, SYNTHESIZED_CHAMBER_BASE + 1);
        assert!(identities[1].is_synthesized());

        fleet.shutdown();
    }

    #[test]
    fn apply_uses_desired_intensity_without_schedule() {
        let (fleet, reports, lines) = fixture(
            vec![candidate("/dev/ttyACM0", "SER-A")],
            HashMap::new(),
            FixedIntensities {
                percent: 80,
                fan: None,
            },
        );
        fleet.scan_devices();

        fleet.apply_to_device(0).unwrap();
        let report = reports.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(report.success);

        fleet.shutdown();
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].1, "SETALL 3276 3276 3276 3276 3276 3276");
    }

    #[test]
    fn inactive_schedule_forces_zero_and_reactivation_restores() {
        let (fleet, reports, lines) = fixture(
            vec![candidate("/dev/ttyACM0", "SER-A")],
            HashMap::new(),
            FixedIntensities {
                percent: 80,
                fan: None,
            },
        );
        fleet.scan_devices();
        fleet.set_schedule(0, 0, "08:00", "20:00", true).unwrap();

        // 07:59 - outside the window: channel 0 forced to zero.
        fleet.scheduler().evaluate_at(7 * 60 + 59);
        fleet.apply_to_device(0).unwrap();
        assert!(reports.recv_timeout(Duration::from_secs(2)).unwrap().success);

        // 08:00 - the window opens; the preserved intensity comes back.
        let report = fleet.scheduler().evaluate_at(8 * 60);
        assert_eq!(report.changed, vec![(0, 0)]);
        fleet.apply_to_device(0).unwrap();
        assert!(reports.recv_timeout(Duration::from_secs(2)).unwrap().success);

        fleet.shutdown();
        let lines = lines.lock().unwrap();
        assert_eq!(lines[0].1, "SETALL 0 3276 3276 3276 3276 3276");
        assert_eq!(lines[1].1, "SETALL 3276 3276 3276 3276 3276 3276");
    }

    #[test]
    fn applying_same_state_twice_is_idempotent() {
        let (fleet, reports, lines) = fixture(
            vec![candidate("/dev/ttyACM0", "SER-A")],
            HashMap::new(),
            FixedIntensities {
                percent: 55,
                fan: None,
            },
        );
        fleet.scan_devices();

        fleet.apply_to_device(0).unwrap();
        assert!(reports.recv_timeout(Duration::from_secs(2)).unwrap().success);
        fleet.apply_to_device(0).unwrap();
        assert!(reports.recv_timeout(Duration::from_secs(2)).unwrap().success);

        fleet.shutdown();
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].1, lines[1].1);
    }

    #[test]
    fn fan_setting_is_applied_after_channels() {
        let (fleet, reports, lines) = fixture(
            vec![candidate("/dev/ttyACM0", "SER-A")],
            HashMap::new(),
            FixedIntensities {
                percent: 0,
                fan: Some(65),
            },
        );
        fleet.scan_devices();

        fleet.apply_to_device(0).unwrap();
        assert!(reports.recv_timeout(Duration::from_secs(2)).unwrap().success);
        assert!(reports.recv_timeout(Duration::from_secs(2)).unwrap().success);

        fleet.shutdown();
        let lines = lines.lock().unwrap();
        assert_eq!(lines[0].1, "SETALL 0 0 0 0 0 0");
        assert_eq!(lines[1].1, "FAN_SET 65");
    }

    #[test]
    fn apply_changed_defers_past_per_tick_bound() {
        let ports: Vec<PortCandidate> = (0..6)
            .map(|i| candidate(&format!("/dev/ttyACM{}", i), &format!("SER-{}", i)))
            .collect();
        let (fleet, reports, _lines) = fixture(
            ports,
            HashMap::new(),
            FixedIntensities {
                percent: 10,
                fan: None,
            },
        );
        fleet.scan_devices();

        // Six devices, bound is four per tick: at most four apply now.
        // (The dispatcher may drain deferred devices concurrently, so the
        // pending count can only shrink below two.)
        fleet.apply_changed(&[0, 1, 2, 3, 4, 5]);
        assert!(fleet.inner.pending.lock().unwrap().len() <= 2);

        // A follow-up tick drains the remainder.
        fleet.apply_changed(&[]);
        assert!(fleet.inner.pending.lock().unwrap().is_empty());

        for _ in 0..6 {
            assert!(reports.recv_timeout(Duration::from_secs(2)).unwrap().success);
        }
        fleet.shutdown();
    }

    #[test]
    fn rescan_rebuilds_the_fleet() {
        let map: HashMap<String, u32> = [("SER-A".to_string(), 9)].into_iter().collect();
        let (fleet, _reports, _lines) = fixture(
            vec![candidate("/dev/ttyACM0", "SER-A")],
            map,
            FixedIntensities {
                percent: 0,
                fan: None,
            },
        );

        let first = fleet.scan_devices();
        let second = fleet.scan_devices();
        assert_eq!(first, second);
        assert_eq!(fleet.devices().len(), 1);

        fleet.shutdown();
    }

    #[test]
    fn set_schedule_rejects_bad_channel() {
        let (fleet, _reports, _lines) = fixture(
            vec![candidate("/dev/ttyACM0", "SER-A")],
            HashMap::new(),
            FixedIntensities {
                percent: 0,
                fan: None,
            },
        );
        fleet.scan_devices();

        let err = fleet
            .set_schedule(0, CHANNEL_COUNT, "08:00", "20:00", true)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCommand(_)));

        fleet.shutdown();
    }
}
