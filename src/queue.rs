//! Per-device command queue.
//!
//! Every device gets one queue with one dedicated worker thread, so the
//! device link is never invoked concurrently for the same device and slow
//! hardware is never flooded. `enqueue` is non-blocking; results travel
//! back to the coordinator on a shared report channel.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::link::DeviceLink;
use crate::types::{Command, CommandReport};

/// Worker dequeue poll interval.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// How long the worker waits for follow-up `SetChannels` intents before
/// executing; only the newest survives (last-value-wins).
const COALESCE_WINDOW: Duration = Duration::from_millis(30);

/// Bound on waiting for the worker to drain the shutdown sentinel.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

enum QueueMsg {
    Intent(Command),
    Shutdown,
}

/// FIFO of pending intents for one device, drained by a dedicated worker.
pub struct CommandQueue {
    tx: Sender<QueueMsg>,
    handle: Option<JoinHandle<()>>,
    done_rx: Receiver<()>,
    label: String,
}

impl CommandQueue {
    /// Spawn the worker for `device_index`, executing against `link` and
    /// reporting outcomes on `report_tx`.
    pub fn new(
        device_index: usize,
        link: Arc<DeviceLink>,
        report_tx: Sender<CommandReport>,
    ) -> Self {
        let (tx, rx) = mpsc::channel();
        // The worker never sends on done_tx; dropping it at thread exit is
        // the completion signal shutdown() waits on.
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let label = format!("queue[{}]", device_index);
        let thread_label = label.clone();

        let handle = thread::spawn(move || {
            let _done = done_tx;
            worker_loop(device_index, &thread_label, &rx, &link, &report_tx);
            log::debug!("{}: worker exiting", thread_label);
        });

        Self {
            tx,
            handle: Some(handle),
            done_rx,
            label,
        }
    }

    /// Queue an intent for execution. Non-blocking and thread-safe.
    pub fn enqueue(&self, command: Command) -> Result<()> {
        self.tx
            .send(QueueMsg::Intent(command))
            .map_err(|_| Error::LinkClosed)
    }

    /// Stop the worker: send the sentinel, then wait a bounded time for the
    /// worker to drain and exit. A worker that fails to stop in time is
    /// logged and abandoned, not retried.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.tx.send(QueueMsg::Shutdown);

        match self.done_rx.recv_timeout(SHUTDOWN_TIMEOUT) {
            // The worker dropped its end of the channel on exit.
            Err(RecvTimeoutError::Disconnected) | Ok(()) => {
                let _ = handle.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("{}: worker did not stop within {:?}", self.label, SHUTDOWN_TIMEOUT);
            }
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    device_index: usize,
    label: &str,
    rx: &Receiver<QueueMsg>,
    link: &DeviceLink,
    report_tx: &Sender<CommandReport>,
) {
    loop {
        let command = match rx.recv_timeout(POLL_TIMEOUT) {
            Ok(QueueMsg::Intent(command)) => command,
            Ok(QueueMsg::Shutdown) => return,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };

        let mut backlog = VecDeque::new();
        let mut shutdown = false;

        let command = if matches!(command, Command::SetChannels(_)) {
            coalesce_set_channels(rx, command, &mut backlog, &mut shutdown)
        } else {
            command
        };

        run_one(device_index, label, link, report_tx, command);
        while let Some(next) = backlog.pop_front() {
            run_one(device_index, label, link, report_tx, next);
        }

        if shutdown {
            return;
        }
    }
}

/// Wait out the batching window for more `SetChannels` intents, keeping
/// only the newest. A different intent type ends the window; it is stashed
/// and executed afterwards in arrival order.
fn coalesce_set_channels(
    rx: &Receiver<QueueMsg>,
    mut latest: Command,
    backlog: &mut VecDeque<Command>,
    shutdown: &mut bool,
) -> Command {
    let deadline = Instant::now() + COALESCE_WINDOW;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return latest;
        }
        match rx.recv_timeout(deadline - now) {
            Ok(QueueMsg::Intent(cmd @ Command::SetChannels(_))) => latest = cmd,
            Ok(QueueMsg::Intent(other)) => {
                backlog.push_back(other);
                return latest;
            }
            Ok(QueueMsg::Shutdown) => {
                *shutdown = true;
                return latest;
            }
            Err(_) => return latest,
        }
    }
}

fn run_one(
    device_index: usize,
    label: &str,
    link: &DeviceLink,
    report_tx: &Sender<CommandReport>,
    command: Command,
) {
    let kind = command.kind();
    let result = link.execute(&command);

    if let Err(err) = &result {
        // A failed intent is reported and the queue moves on.
        log::warn!("{}: {} failed: {}", label, kind, err);
    }

    let _ = report_tx.send(CommandReport::new(device_index, kind, &result));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Transport, TransportOpener};
    use crate::types::CommandKind;
    use std::sync::Mutex;

    /// Transport that acks everything and records each command line.
    struct RecordingTransport {
        lines: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    }

    impl Transport for RecordingTransport {
        fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
            self.lines
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(bytes).trim_end().to_string());
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn read_line(&mut self) -> Result<String> {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            Ok("OK".into())
        }

        fn discard_input(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn recording_link(delay: Duration) -> (Arc<DeviceLink>, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let lines_for_opener = Arc::clone(&lines);
        let opener: TransportOpener = Box::new(move || {
            Ok(Box::new(RecordingTransport {
                lines: Arc::clone(&lines_for_opener),
                delay,
            }) as Box<dyn Transport>)
        });
        (Arc::new(DeviceLink::new("dev0", opener)), lines)
    }

    #[test]
    fn executes_in_enqueue_order() {
        let (link, lines) = recording_link(Duration::ZERO);
        let (report_tx, report_rx) = mpsc::channel();
        let mut queue = CommandQueue::new(0, link, report_tx);

        queue.enqueue(Command::set_fan(40).unwrap()).unwrap();
        queue.enqueue(Command::Ping).unwrap();

        let first = report_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = report_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.kind, CommandKind::SetFan);
        assert_eq!(second.kind, CommandKind::Ping);
        assert!(first.success && second.success);

        queue.shutdown();
        assert_eq!(
            *lines.lock().unwrap(),
            vec!["FAN_SET 40".to_string(), "PING".to_string()]
        );
    }

    #[test]
    fn coalesces_set_channels_last_value_wins() {
        let (link, lines) = recording_link(Duration::ZERO);
        let (report_tx, report_rx) = mpsc::channel();
        let mut queue = CommandQueue::new(0, link, report_tx);

        queue
            .enqueue(Command::set_channels([1, 1, 1, 1, 1, 1]).unwrap())
            .unwrap();
        queue
            .enqueue(Command::set_channels([2, 2, 2, 2, 2, 2]).unwrap())
            .unwrap();

        let report = report_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(report.kind, CommandKind::SetChannels);

        queue.shutdown();
        let lines = lines.lock().unwrap();
        assert_eq!(*lines, vec!["SETALL 2 2 2 2 2 2".to_string()]);
    }

    #[test]
    fn other_intents_end_the_window_and_run_after() {
        let (link, lines) = recording_link(Duration::ZERO);
        let (report_tx, report_rx) = mpsc::channel();
        let mut queue = CommandQueue::new(0, link, report_tx);

        queue
            .enqueue(Command::set_channels([5, 5, 5, 5, 5, 5]).unwrap())
            .unwrap();
        queue.enqueue(Command::set_fan(70).unwrap()).unwrap();

        let first = report_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = report_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.kind, CommandKind::SetChannels);
        assert_eq!(second.kind, CommandKind::SetFan);

        queue.shutdown();
        assert_eq!(
            *lines.lock().unwrap(),
            vec!["SETALL 5 5 5 5 5 5".to_string(), "FAN_SET 70".to_string()]
        );
    }

    #[test]
    fn failure_does_not_stop_the_queue() {
        // A link with no usable port: every execute fails.
        let opener: TransportOpener = Box::new(|| Err(Error::connection("gone")));
        let link = Arc::new(DeviceLink::new("dev0", opener));
        let (report_tx, report_rx) = mpsc::channel();
        let mut queue = CommandQueue::new(3, link, report_tx);

        queue.enqueue(Command::Ping).unwrap();
        queue.enqueue(Command::set_fan(10).unwrap()).unwrap();

        let first = report_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = report_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(!first.success);
        assert!(!second.success);
        assert_eq!(first.device_index, 3);
        assert!(first.message.contains("connection failed"));

        queue.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (link, _lines) = recording_link(Duration::ZERO);
        let (report_tx, _report_rx) = mpsc::channel();
        let mut queue = CommandQueue::new(0, link, report_tx);

        queue.shutdown();
        queue.shutdown();
        assert!(queue.enqueue(Command::Ping).is_err());
    }
}
