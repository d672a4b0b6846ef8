//! Control panel handle and configuration.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::device::CpDevice;
use super::scheduler::Scheduler;
use crate::core::{
    COMMAND_QUEUE_DEPTH, CRC_SIZE, Capability, DEFAULT_OFFLINE_RETRY_COUNT, DEFAULT_POLL_INTERVAL,
    DEFAULT_RESPONSE_TIMEOUT, DEFAULT_SC_RETRY_INTERVAL, EVENT_QUEUE_DEPTH, FrameError,
    HEADER_SIZE, MAX_ADDRESS, MAX_FRAME_SIZE, OsdpError, PdInfo, ProtocolError, SECURE_OVERHEAD,
    TransportError,
};
use crate::message::{Command, Event, Message};
use crate::transport::{Channel, FrameReader};

/// Control panel configuration.
#[derive(Debug, Clone)]
pub struct CpConfig {
    /// Per-device reply timeout.
    pub response_timeout: Duration,
    /// Pause between round-robin cycles.
    pub poll_interval: Duration,
    /// Consecutive timeouts before a device is marked Offline.
    pub offline_retry_count: u32,
    /// Delay before re-attempting a failed secure-channel handshake.
    pub sc_retry_interval: Duration,
    /// Depth of each per-device command queue.
    pub command_queue_depth: usize,
    /// Depth of the event delivery queue.
    pub event_queue_depth: usize,
}

impl Default for CpConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            offline_retry_count: DEFAULT_OFFLINE_RETRY_COUNT,
            sc_retry_interval: DEFAULT_SC_RETRY_INTERVAL,
            command_queue_depth: COMMAND_QUEUE_DEPTH,
            event_queue_depth: EVENT_QUEUE_DEPTH,
        }
    }
}

impl CpConfig {
    /// Set the per-device reply timeout.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the pause between round-robin cycles.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the offline retry budget.
    pub fn with_offline_retry_count(mut self, count: u32) -> Self {
        self.offline_retry_count = count;
        self
    }

    /// Set the handshake retry interval.
    pub fn with_sc_retry_interval(mut self, interval: Duration) -> Self {
        self.sc_retry_interval = interval;
        self
    }
}

/// Published per-device status, readable without locking.
#[derive(Debug, Clone, Default)]
pub struct DeviceStatus {
    /// The device answered within its retry budget.
    pub online: bool,
    /// The secure channel is established and verified.
    pub sc_active: bool,
    /// Capability set advertised since the device last came online.
    pub capabilities: Option<Vec<Capability>>,
}

/// An event delivered to the application, tagged with its source device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    /// Source device address.
    pub address: u8,
    /// The event.
    pub event: Event,
}

/// Receives device events on the application side.
///
/// Returned by [`ControlPanel::start`]; `None` results mean the panel has
/// stopped.
pub struct EventReceiver {
    rx: mpsc::Receiver<DeviceEvent>,
}

impl EventReceiver {
    /// Wait indefinitely for the next event.
    pub async fn recv(&mut self) -> Option<DeviceEvent> {
        self.rx.recv().await
    }

    /// Wait up to `timeout` for the next event.
    ///
    /// Returns `None` on expiry or once the panel has stopped.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<DeviceEvent> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }
}

struct DeviceEntry {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<DeviceStatus>,
}

/// A control panel: the polling master driving every registered device
/// over one shared half-duplex channel.
///
/// `start` spawns the scheduler onto the current tokio runtime; the
/// handle interacts with it only through queues and status watches.
pub struct ControlPanel {
    entries: HashMap<u8, DeviceEntry>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ControlPanel {
    /// Start a control panel over `channel` driving `devices`.
    ///
    /// Devices are polled in registration order. Addresses must be unique
    /// and in range.
    pub fn start(
        channel: Box<dyn Channel>,
        devices: Vec<PdInfo>,
        config: CpConfig,
    ) -> Result<(Self, EventReceiver), OsdpError> {
        if devices.is_empty() {
            return Err(ProtocolError::UnexpectedState("no devices registered".into()).into());
        }

        let mut entries = HashMap::with_capacity(devices.len());
        let mut scheduled = Vec::with_capacity(devices.len());
        for info in devices {
            if info.address > MAX_ADDRESS {
                return Err(ProtocolError::UnexpectedState(format!(
                    "address {} out of range",
                    info.address
                ))
                .into());
            }
            let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue_depth);
            let (status_tx, status_rx) = watch::channel(DeviceStatus::default());
            if entries
                .insert(info.address, DeviceEntry { cmd_tx, status_rx })
                .is_some()
            {
                return Err(ProtocolError::UnexpectedState(format!(
                    "address {} registered twice",
                    info.address
                ))
                .into());
            }
            scheduled.push(CpDevice::new(info, cmd_rx, status_tx));
        }

        let (event_tx, event_rx) = mpsc::channel(config.event_queue_depth);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Scheduler {
            channel,
            reader: FrameReader::new(),
            devices: scheduled,
            event_tx,
            shutdown_rx,
            config,
        };
        let task = tokio::spawn(scheduler.run());

        Ok((
            Self {
                entries,
                shutdown_tx,
                task,
            },
            EventReceiver { rx: event_rx },
        ))
    }

    /// Queue a command for the device's next scheduling turn.
    ///
    /// Success means the command was accepted onto the device's queue, not
    /// that it has been delivered. Fails immediately when the address is
    /// unknown, when a secure-only command targets a device whose secure
    /// channel is not active, or when the queue is full.
    pub fn send_command(&self, address: u8, command: Command) -> Result<(), OsdpError> {
        let entry = self
            .entries
            .get(&address)
            .ok_or(FrameError::UnknownAddress(address))?;
        if command.requires_secure() && !entry.status_rx.borrow().sc_active {
            return Err(
                ProtocolError::CommandRejected("secure channel not active".into()).into(),
            );
        }
        if !fits_one_frame(&command) {
            return Err(
                ProtocolError::CommandRejected("command too large for one frame".into()).into(),
            );
        }

        use mpsc::error::TrySendError;
        entry.cmd_tx.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => {
                ProtocolError::CommandRejected("command queue full".into()).into()
            }
            TrySendError::Closed(_) => OsdpError::Transport(TransportError::Closed),
        })
    }

    /// Whether the device is currently online.
    ///
    /// Unknown addresses report `false`.
    pub fn is_online(&self, address: u8) -> bool {
        self.entries
            .get(&address)
            .is_some_and(|entry| entry.status_rx.borrow().online)
    }

    /// Whether the device's secure channel is active.
    ///
    /// Unknown addresses report `false`.
    pub fn is_sc_active(&self, address: u8) -> bool {
        self.entries
            .get(&address)
            .is_some_and(|entry| entry.status_rx.borrow().sc_active)
    }

    /// The capability set the device advertised since it last came online,
    /// if any.
    pub fn capabilities(&self, address: u8) -> Option<Vec<Capability>> {
        self.entries
            .get(&address)?
            .status_rx
            .borrow()
            .capabilities
            .clone()
    }

    /// Wait until the device's secure channel becomes active.
    ///
    /// `None` waits indefinitely. Returns `false` on expiry, for unknown
    /// addresses, or if the panel stops first.
    pub async fn wait_sc_active(&self, address: u8, timeout: Option<Duration>) -> bool {
        let Some(entry) = self.entries.get(&address) else {
            return false;
        };
        let mut rx = entry.status_rx.clone();
        let wait = async move {
            loop {
                if rx.borrow_and_update().sc_active {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or(false),
            None => wait.await,
        }
    }

    /// Stop the panel: the scheduler exits at its next safe point (after
    /// any in-flight exchange), the channel is released, and key material
    /// is scrubbed. Pending `recv` and `send_command` calls observe a
    /// definite non-success.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        let _ = (&mut self.task).await;
    }
}

impl Drop for ControlPanel {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Whether the command fits a single frame even with secure overhead.
fn fits_one_frame(command: &Command) -> bool {
    let encoded = Message::Command(command.clone()).encode();
    HEADER_SIZE + encoded.len() + SECURE_OVERHEAD + CRC_SIZE <= MAX_FRAME_SIZE
}
