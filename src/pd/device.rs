//! Peripheral device runner and application handle.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{
    BROADCAST_ADDRESS, COMMAND_QUEUE_DEPTH, CRC_SIZE, Capability, DEFAULT_READ_TIMEOUT,
    EVENT_QUEUE_DEPTH, HEADER_SIZE, MAX_ADDRESS, MAX_FRAME_SIZE, OsdpError, PdFlags, PdInfo,
    ProtocolError, REPLY_FLAG, SCBK_DEFAULT, ScbkKey, SECURE_OVERHEAD, SecurityError,
    TransportError,
};
use crate::message::{Command, Event, Message, NakCode};
use crate::secure::{Role, SecureSession};
use crate::transport::{Channel, Control, Frame, FrameReader, header_bytes, write_frame};

/// Peripheral device configuration.
#[derive(Debug, Clone)]
pub struct PdConfig {
    /// Channel read timeout; bounds each loop iteration so shutdown is
    /// observed promptly.
    pub read_timeout: Duration,
    /// Depth of the decoded-command queue toward the application.
    pub command_queue_depth: usize,
    /// Depth of the outgoing event queue.
    pub event_queue_depth: usize,
}

impl Default for PdConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            command_queue_depth: COMMAND_QUEUE_DEPTH,
            event_queue_depth: EVENT_QUEUE_DEPTH,
        }
    }
}

impl PdConfig {
    /// Set the channel read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Peripheral device protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PdState {
    /// No CP contact yet (or stopped).
    #[default]
    Idle,
    /// Secure channel handshake in progress.
    HandshakePending,
    /// Operational over plaintext frames.
    InsecureOnline,
    /// Operational over the secure channel.
    Secure,
    /// Decoding a command for the application.
    ProcessingCommand,
    /// Unrecoverable frame or security error; recovers on the CP's next
    /// handshake attempt.
    Failed,
}

/// Receives decoded commands on the application side.
///
/// Returned by [`PeripheralDevice::start`]; `None` results mean the
/// device has stopped.
pub struct CommandReceiver {
    rx: mpsc::Receiver<Command>,
}

impl CommandReceiver {
    /// Wait indefinitely for the next command.
    pub async fn recv(&mut self) -> Option<Command> {
        self.rx.recv().await
    }

    /// Wait up to `timeout` for the next command.
    ///
    /// Returns `None` on expiry or once the device has stopped.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Command> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }
}

/// A peripheral device: the polled slave end of the link.
///
/// `start` spawns the protocol loop onto the current tokio runtime; the
/// handle interacts with it only through queues and status watches.
pub struct PeripheralDevice {
    address: u8,
    state_rx: watch::Receiver<PdState>,
    event_tx: mpsc::Sender<Event>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PeripheralDevice {
    /// Start a peripheral device on the given channel.
    ///
    /// A registration without a base key starts in install mode: the
    /// handshake runs over the well-known default key until the CP commits
    /// a real one via a `Keyset` command.
    pub fn start(
        channel: Box<dyn Channel>,
        info: PdInfo,
        capabilities: Vec<Capability>,
        config: PdConfig,
    ) -> Result<(Self, CommandReceiver), OsdpError> {
        if info.address > MAX_ADDRESS {
            return Err(ProtocolError::UnexpectedState(format!(
                "address {} out of range",
                info.address
            ))
            .into());
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue_depth);
        let (event_tx, event_rx) = mpsc::channel(config.event_queue_depth);
        let (state_tx, state_rx) = watch::channel(PdState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let base_key = info
            .secure_channel_key
            .clone()
            .unwrap_or_else(|| ScbkKey::from_bytes(SCBK_DEFAULT));
        let address = info.address;

        let runner = PdRunner {
            channel,
            reader: FrameReader::new(),
            info,
            base_key,
            session: SecureSession::new(Role::Pd),
            capabilities,
            cmd_tx,
            event_rx,
            state_tx,
            shutdown_rx,
            config,
        };
        let task = tokio::spawn(runner.run());

        Ok((
            Self {
                address,
                state_rx,
                event_tx,
                shutdown_tx,
                task,
            },
            CommandReceiver { rx: cmd_rx },
        ))
    }

    /// The device's address.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Current protocol state.
    pub fn state(&self) -> PdState {
        *self.state_rx.borrow()
    }

    /// Whether the secure channel is active.
    pub fn is_sc_active(&self) -> bool {
        self.state() == PdState::Secure
    }

    /// Wait until the secure channel becomes active.
    ///
    /// `None` waits indefinitely. Returns `false` on expiry or if the
    /// device stops first.
    pub async fn wait_sc_active(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.state_rx.clone();
        let wait = async move {
            loop {
                if *rx.borrow_and_update() == PdState::Secure {
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

    /// Queue an event for opportunistic delivery on the next poll reply.
    ///
    /// Delivery is FIFO with no duplicate suppression.
    pub fn notify_event(&self, event: Event) -> Result<(), OsdpError> {
        let encoded = Message::Event(event.clone()).encode();
        if HEADER_SIZE + encoded.len() + SECURE_OVERHEAD + CRC_SIZE > MAX_FRAME_SIZE {
            return Err(
                ProtocolError::CommandRejected("event too large for one frame".into()).into(),
            );
        }

        use mpsc::error::TrySendError;
        self.event_tx.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => {
                ProtocolError::CommandRejected("event queue full".into()).into()
            }
            TrySendError::Closed(_) => TransportError::Closed.into(),
        })
    }

    /// Stop the device: the loop exits at its next safe point, the channel
    /// is released, and key material is scrubbed. Pending `recv` calls
    /// observe `None`.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        let _ = (&mut self.task).await;
    }
}

impl Drop for PeripheralDevice {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// The PD protocol loop state.
struct PdRunner {
    channel: Box<dyn Channel>,
    reader: FrameReader,
    info: PdInfo,
    base_key: ScbkKey,
    session: SecureSession,
    capabilities: Vec<Capability>,
    cmd_tx: mpsc::Sender<Command>,
    event_rx: mpsc::Receiver<Event>,
    state_tx: watch::Sender<PdState>,
    shutdown_rx: watch::Receiver<bool>,
    config: PdConfig,
}

impl PdRunner {
    async fn run(mut self) {
        info!(address = self.info.address, name = %self.info.name, "peripheral device started");
        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            let frame = match self
                .reader
                .read_frame(&mut self.channel, self.config.read_timeout)
                .await
            {
                Ok(frame) => frame,
                Err(OsdpError::Transport(TransportError::Timeout)) => continue,
                Err(OsdpError::Transport(TransportError::Closed)) => {
                    warn!(address = self.info.address, "channel closed");
                    break;
                }
                Err(err) => {
                    debug!(address = self.info.address, "read error: {err}");
                    continue;
                }
            };

            if frame.is_reply() {
                continue;
            }
            let target = frame.device_address();
            if target != self.info.address && target != BROADCAST_ADDRESS {
                debug!(
                    address = self.info.address,
                    "ignoring frame for address {target}"
                );
                continue;
            }

            let reply = self.handle_frame(&frame);
            // Broadcast frames are processed but never answered; replying
            // from every device would collide on the shared bus.
            if target == BROADCAST_ADDRESS {
                continue;
            }
            if let Some(reply) = reply {
                if let Err(err) = write_frame(&mut self.channel, &reply).await {
                    warn!(address = self.info.address, "write failed: {err}");
                    break;
                }
            }
        }

        self.session.reset();
        self.set_state(PdState::Idle);
        info!(address = self.info.address, "peripheral device stopped");
    }

    fn handle_frame(&mut self, frame: &Frame) -> Option<Frame> {
        let secure_request = frame.control.secure;
        let plaintext = if secure_request {
            if !self.session.is_active() {
                warn!(
                    address = self.info.address,
                    "secure frame without active session"
                );
                return Some(self.reply_plain(frame, Message::Nak(NakCode::SecurityRequired)));
            }
            let header = frame.header();
            match self.session.decrypt(&header, &frame.payload) {
                Ok(plain) => plain,
                Err(SecurityError::ReplayDetected) => {
                    warn!(address = self.info.address, "replay detected");
                    return Some(self.reply_plain(frame, Message::Nak(NakCode::SequenceError)));
                }
                Err(err) => {
                    warn!(address = self.info.address, "secure payload rejected: {err}");
                    self.session.fail();
                    self.set_state(PdState::Failed);
                    return Some(self.reply_plain(frame, Message::Nak(NakCode::SecurityFailed)));
                }
            }
        } else {
            frame.payload.clone()
        };

        let message = match Message::decode(&plaintext) {
            Ok(message) => message,
            Err(err) => {
                debug!(address = self.info.address, "undecodable message: {err}");
                return Some(self.reply(frame, secure_request, Message::Nak(NakCode::Malformed)));
            }
        };

        match message {
            Message::SecureInit { cp_nonce } => {
                self.set_state(PdState::HandshakePending);
                match self.session.begin_pd(cp_nonce, &self.base_key) {
                    Ok((pd_nonce, pd_proof)) => {
                        debug!(address = self.info.address, "answering handshake challenge");
                        Some(self.reply_plain(frame, Message::SecureReply { pd_nonce, pd_proof }))
                    }
                    Err(err) => {
                        warn!(address = self.info.address, "handshake failed: {err}");
                        self.session.fail();
                        self.set_state(PdState::Failed);
                        Some(self.reply_plain(frame, Message::Nak(NakCode::SecurityFailed)))
                    }
                }
            }
            Message::SecureFinish { cp_proof } => match self.session.pd_finish(&cp_proof) {
                Ok(()) => {
                    info!(address = self.info.address, "secure channel active");
                    self.set_state(PdState::Secure);
                    Some(self.reply_plain(frame, Message::Ack))
                }
                Err(err) => {
                    warn!(address = self.info.address, "handshake failed: {err}");
                    self.set_state(PdState::Failed);
                    Some(self.reply_plain(frame, Message::Nak(NakCode::SecurityFailed)))
                }
            },
            Message::Poll => {
                self.refresh_operational_state();
                let reply = self.take_event_or_ack();
                Some(self.reply(frame, secure_request, reply))
            }
            Message::CapabilityRequest => {
                self.refresh_operational_state();
                let caps = Message::Capabilities(self.capabilities.clone());
                Some(self.reply(frame, secure_request, caps))
            }
            Message::Command(command) => Some(self.handle_command(frame, secure_request, command)),
            other => {
                debug!(
                    address = self.info.address,
                    "unexpected reply-kind message: {other:?}"
                );
                Some(self.reply(frame, secure_request, Message::Nak(NakCode::Malformed)))
            }
        }
    }

    fn handle_command(&mut self, frame: &Frame, secure_request: bool, command: Command) -> Frame {
        if command.requires_secure() && !(secure_request && self.session.is_active()) {
            warn!(
                address = self.info.address,
                "secure-only command over insecure link rejected"
            );
            return self.reply(frame, secure_request, Message::Nak(NakCode::SecurityRequired));
        }
        if self.info.flags.contains(PdFlags::ENFORCE_SECURE) && !secure_request {
            warn!(
                address = self.info.address,
                "plaintext command rejected, secure channel enforced"
            );
            return self.reply_plain(frame, Message::Nak(NakCode::SecurityRequired));
        }

        self.set_state(PdState::ProcessingCommand);
        let committed_key = match &command {
            Command::Keyset { key, .. } => Some(key.clone()),
            _ => None,
        };

        use mpsc::error::TrySendError;
        let reply = match self.cmd_tx.try_send(command) {
            Ok(()) => {
                if let Some(key) = committed_key {
                    info!(address = self.info.address, "base key committed via keyset");
                    self.base_key = key;
                }
                self.take_event_or_ack()
            }
            Err(TrySendError::Full(_)) => {
                warn!(address = self.info.address, "command queue full");
                Message::Nak(NakCode::Busy)
            }
            Err(TrySendError::Closed(_)) => Message::Nak(NakCode::Busy),
        };
        self.refresh_operational_state();
        self.reply(frame, secure_request, reply)
    }

    /// Piggyback at most one pending event per reply; otherwise ACK.
    fn take_event_or_ack(&mut self) -> Message {
        match self.event_rx.try_recv() {
            Ok(event) => Message::Event(event),
            Err(_) => Message::Ack,
        }
    }

    fn refresh_operational_state(&mut self) {
        let state = if self.session.is_active() {
            PdState::Secure
        } else {
            PdState::InsecureOnline
        };
        self.set_state(state);
    }

    fn reply(&mut self, request: &Frame, secure: bool, message: Message) -> Frame {
        if secure && self.session.is_active() {
            let plain = message.encode();
            let control = Control::new(request.control.sequence).with_secure();
            let address = request.device_address();
            let header = header_bytes(address | REPLY_FLAG, control, plain.len() + SECURE_OVERHEAD);
            match self.session.encrypt(&header, &plain) {
                Ok(payload) => return Frame::reply(address, control, payload),
                Err(err) => {
                    warn!(address = self.info.address, "encrypt failed: {err}");
                    self.session.fail();
                    self.set_state(PdState::Failed);
                    return self.reply_plain(request, Message::Nak(NakCode::SecurityFailed));
                }
            }
        }
        self.reply_plain(request, message)
    }

    fn reply_plain(&self, request: &Frame, message: Message) -> Frame {
        Frame::reply(
            request.device_address(),
            Control::new(request.control.sequence),
            message.encode(),
        )
    }

    fn set_state(&self, state: PdState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}
