//! The round-robin poll scheduler: the heart of the CP role.
//!
//! Each scheduling turn services one device: at most one handshake
//! attempt, or one command-bearing frame, or a poll. A device with a
//! backlog of queued commands still sends only one per turn, preserving
//! fairness across devices. Every exchange is bounded by the per-device
//! response timeout; devices transition Offline after a configurable
//! number of consecutive timeouts and back Online on the first valid
//! reply.

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::device::CpDevice;
use super::panel::{CpConfig, DeviceEvent};
use crate::core::{
    FrameError, OsdpError, SECURE_OVERHEAD, SecurityError, TransportError,
};
use crate::message::{Command, Message, NakCode};
use crate::transport::{Channel, Control, Frame, FrameReader, header_bytes, write_frame};

pub(crate) struct Scheduler {
    pub(crate) channel: Box<dyn Channel>,
    pub(crate) reader: FrameReader,
    pub(crate) devices: Vec<CpDevice>,
    pub(crate) event_tx: mpsc::Sender<DeviceEvent>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
    pub(crate) config: CpConfig,
}

impl Scheduler {
    pub(crate) async fn run(mut self) {
        info!(devices = self.devices.len(), "control panel started");
        'outer: loop {
            for idx in 0..self.devices.len() {
                if *self.shutdown_rx.borrow() {
                    break 'outer;
                }
                self.service(idx).await;
            }
            if *self.shutdown_rx.borrow() {
                break;
            }
            sleep(self.config.poll_interval).await;
        }

        for device in &mut self.devices {
            device.session.reset();
        }
        info!("control panel stopped");
    }

    /// Service one device for one turn.
    async fn service(&mut self, idx: usize) {
        let Self {
            channel,
            reader,
            devices,
            event_tx,
            config,
            ..
        } = self;
        let device = &mut devices[idx];
        let now = Instant::now();

        // A device that is not secure gets a handshake turn whenever the
        // retry gate allows; everything else waits behind it.
        if !device.session.is_active() && device.sc_attempt_due(now) {
            match Self::handshake(channel, reader, config, device).await {
                Ok(()) => {
                    device.mark_online();
                    device.next_sc_attempt = None;
                    device.publish_status();
                    info!(address = device.info.address, "secure channel active");
                }
                Err(OsdpError::Transport(_)) => device.on_timeout(config),
                Err(err) => {
                    warn!(address = device.info.address, "handshake failed: {err}");
                    device.session.fail();
                    device.schedule_sc_retry(now, config);
                    device.publish_status();
                }
            }
            return;
        }

        // Command turn: drain at most one queued command.
        let command = match device.cmd_rx.try_recv() {
            Ok(command) => {
                if command.requires_secure() && !device.session.is_active() {
                    // The precondition was checked at enqueue time but the
                    // session may have failed since; never send it plaintext.
                    warn!(
                        address = device.info.address,
                        "dropping secure-only command, secure channel lost"
                    );
                    None
                } else {
                    Some(command)
                }
            }
            Err(_) => None,
        };

        let message = match command {
            Some(command) => {
                if let Command::Keyset { key, .. } = &command {
                    device.pending_keyset = Some(key.clone());
                }
                Message::Command(command)
            }
            None if device.online && !device.capabilities_known => Message::CapabilityRequest,
            None => Message::Poll,
        };
        let secure = device.session.is_active();

        match Self::exchange(channel, reader, config, device, &message, secure).await {
            Ok(reply) => {
                device.mark_online();
                Self::process_reply(device, event_tx, config, reply);
            }
            Err(OsdpError::Transport(_)) => device.on_timeout(config),
            Err(OsdpError::Security(err)) => {
                warn!(address = device.info.address, "secure exchange failed: {err}");
                device.pending_keyset = None;
                device.session.fail();
                device.schedule_sc_retry(now, config);
                device.publish_status();
            }
            Err(err) => {
                debug!(address = device.info.address, "exchange error: {err}");
                device.pending_keyset = None;
            }
        }
    }

    /// Run the full key exchange with one device: challenge, verify the
    /// PD's proof, prove ourselves, await the ack.
    async fn handshake(
        channel: &mut Box<dyn Channel>,
        reader: &mut FrameReader,
        config: &CpConfig,
        device: &mut CpDevice,
    ) -> Result<(), OsdpError> {
        debug!(address = device.info.address, "starting handshake");
        let cp_nonce = device.session.begin_cp();
        let reply = Self::exchange(
            channel,
            reader,
            config,
            device,
            &Message::SecureInit { cp_nonce },
            false,
        )
        .await?;
        let Message::SecureReply { pd_nonce, pd_proof } = reply else {
            return Err(
                SecurityError::HandshakeFailed("unexpected handshake reply".into()).into(),
            );
        };

        let base_key = device.base_key.clone();
        let cp_proof = device.session.cp_complete(pd_nonce, &pd_proof, &base_key)?;
        let reply = Self::exchange(
            channel,
            reader,
            config,
            device,
            &Message::SecureFinish { cp_proof },
            false,
        )
        .await?;
        match reply {
            Message::Ack => {
                device.session.activate();
                Ok(())
            }
            _ => Err(SecurityError::HandshakeFailed("handshake not acknowledged".into()).into()),
        }
    }

    /// Send one frame and wait for the matching reply.
    async fn exchange(
        channel: &mut Box<dyn Channel>,
        reader: &mut FrameReader,
        config: &CpConfig,
        device: &mut CpDevice,
        message: &Message,
        secure: bool,
    ) -> Result<Message, OsdpError> {
        let plain = message.encode();
        let seq = device.next_seq();
        let frame = if secure {
            let control = Control::new(seq).with_secure();
            let header = header_bytes(device.address(), control, plain.len() + SECURE_OVERHEAD);
            let payload = device.session.encrypt(&header, &plain)?;
            Frame::new(device.address(), control, payload)
        } else {
            Frame::new(device.address(), Control::new(seq), plain)
        };

        // Half-duplex: one outstanding exchange at a time, so anything
        // still buffered is a stale or foreign frame.
        reader.clear();
        write_frame(channel, &frame).await?;

        let deadline = Instant::now() + config.response_timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(TransportError::Timeout)?;
            let reply = reader.read_frame(channel, remaining).await?;

            if !reply.is_reply() {
                // Our own transmission echoed back on the shared bus.
                continue;
            }
            if reply.device_address() != device.address() {
                debug!(
                    "discarding reply: {}",
                    FrameError::UnknownAddress(reply.device_address())
                );
                continue;
            }
            if reply.control.sequence != seq {
                debug!(address = device.info.address, "discarding stale reply");
                continue;
            }

            let plain = if reply.control.secure {
                let header = reply.header();
                device.session.decrypt(&header, &reply.payload)?
            } else {
                reply.payload.clone()
            };
            return Ok(Message::decode(&plain)?);
        }
    }

    /// Apply one validated reply to device and application state.
    fn process_reply(
        device: &mut CpDevice,
        event_tx: &mpsc::Sender<DeviceEvent>,
        config: &CpConfig,
        reply: Message,
    ) {
        match reply {
            Message::Ack => device.commit_pending_keyset(),
            Message::Event(event) => {
                device.commit_pending_keyset();
                let delivery = event_tx.try_send(DeviceEvent {
                    address: device.info.address,
                    event,
                });
                if delivery.is_err() {
                    warn!(
                        address = device.info.address,
                        "event queue full, dropping event"
                    );
                }
            }
            Message::Capabilities(capabilities) => {
                debug!(
                    address = device.info.address,
                    count = capabilities.len(),
                    "capabilities received"
                );
                device.set_capabilities(capabilities);
            }
            Message::Nak(code) => {
                device.pending_keyset = None;
                warn!(address = device.info.address, ?code, "command NAKed");
                if matches!(code, NakCode::SecurityFailed | NakCode::SecurityRequired) {
                    device.session.fail();
                    device.schedule_sc_retry(Instant::now(), config);
                }
            }
            other => {
                debug!(
                    address = device.info.address,
                    "unexpected reply: {other:?}"
                );
            }
        }
        device.publish_status();
    }
}
