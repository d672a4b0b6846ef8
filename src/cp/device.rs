//! Per-device state on the control panel side.

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::info;

use super::panel::{CpConfig, DeviceStatus};
use crate::core::{ADDRESS_MASK, Capability, PdInfo, SCBK_DEFAULT, ScbkKey};
use crate::message::Command;
use crate::secure::{Role, SecureSession};

/// CP-side bookkeeping for one registered peripheral device.
pub(crate) struct CpDevice {
    pub(crate) info: PdInfo,
    /// Current base key; starts as the well-known default in install mode
    /// and is swapped in place when a `Keyset` command is acknowledged.
    pub(crate) base_key: ScbkKey,
    pub(crate) session: SecureSession,
    pub(crate) online: bool,
    /// Consecutive reply timeouts.
    pub(crate) timeouts: u32,
    link_seq: u8,
    pub(crate) capabilities_known: bool,
    /// Earliest instant for the next handshake attempt; `None` = due now.
    pub(crate) next_sc_attempt: Option<Instant>,
    /// Key awaiting commit once the in-flight `Keyset` is acknowledged.
    pub(crate) pending_keyset: Option<ScbkKey>,
    pub(crate) cmd_rx: mpsc::Receiver<Command>,
    status_tx: watch::Sender<DeviceStatus>,
}

impl CpDevice {
    pub(crate) fn new(
        info: PdInfo,
        cmd_rx: mpsc::Receiver<Command>,
        status_tx: watch::Sender<DeviceStatus>,
    ) -> Self {
        let base_key = info
            .secure_channel_key
            .clone()
            .unwrap_or_else(|| ScbkKey::from_bytes(SCBK_DEFAULT));
        Self {
            info,
            base_key,
            session: SecureSession::new(Role::Cp),
            online: false,
            timeouts: 0,
            link_seq: 0,
            capabilities_known: false,
            next_sc_attempt: None,
            pending_keyset: None,
            cmd_rx,
            status_tx,
        }
    }

    /// The 7-bit wire address.
    pub(crate) fn address(&self) -> u8 {
        self.info.address & ADDRESS_MASK
    }

    /// Advance and return the 2-bit link sequence for the next exchange.
    pub(crate) fn next_seq(&mut self) -> u8 {
        self.link_seq = (self.link_seq + 1) & 0x03;
        self.link_seq
    }

    /// Whether a handshake attempt is allowed this turn.
    pub(crate) fn sc_attempt_due(&self, now: Instant) -> bool {
        self.next_sc_attempt.is_none_or(|at| now >= at)
    }

    /// Schedule the next handshake attempt after a security failure.
    pub(crate) fn schedule_sc_retry(&mut self, now: Instant, config: &CpConfig) {
        self.next_sc_attempt = Some(now + config.sc_retry_interval);
    }

    /// Record a valid reply: reset the timeout budget, Offline -> Online.
    pub(crate) fn mark_online(&mut self) {
        self.timeouts = 0;
        if !self.online {
            info!(address = self.info.address, name = %self.info.name, "device online");
            self.online = true;
            self.publish_status();
        }
    }

    /// Record a reply timeout; past the retry budget the device goes
    /// Offline and its session and cached capabilities are discarded.
    pub(crate) fn on_timeout(&mut self, config: &CpConfig) {
        self.pending_keyset = None;
        self.timeouts += 1;
        if self.timeouts >= config.offline_retry_count && self.online {
            info!(address = self.info.address, name = %self.info.name, "device offline");
            self.online = false;
            self.session.reset();
            self.capabilities_known = false;
            self.next_sc_attempt = None;
            self.publish_status();
        }
    }

    /// Swap in the new base key once the PD has acknowledged a `Keyset`.
    /// The session stays active; the next handshake uses the new key.
    pub(crate) fn commit_pending_keyset(&mut self) {
        if let Some(key) = self.pending_keyset.take() {
            info!(address = self.info.address, "base key committed via keyset");
            self.base_key = key;
        }
    }

    pub(crate) fn set_capabilities(&mut self, capabilities: Vec<Capability>) {
        self.capabilities_known = true;
        self.status_tx.send_modify(|status| {
            status.capabilities = Some(capabilities);
        });
    }

    /// Push the current online/secure flags to the application.
    pub(crate) fn publish_status(&self) {
        let online = self.online;
        let sc_active = self.session.is_active();
        self.status_tx.send_modify(|status| {
            status.online = online;
            status.sc_active = sc_active;
            if !online {
                status.capabilities = None;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{mpsc, watch};

    fn test_device() -> (CpDevice, watch::Receiver<DeviceStatus>) {
        let (_cmd_tx, cmd_rx) = mpsc::channel(4);
        let (status_tx, status_rx) = watch::channel(DeviceStatus::default());
        let info = PdInfo::new(12, "dev").with_key(ScbkKey::from_bytes([0x11; 16]));
        (CpDevice::new(info, cmd_rx, status_tx), status_rx)
    }

    #[test]
    fn test_offline_after_retry_budget() {
        let (mut device, status_rx) = test_device();
        let config = CpConfig::default();

        device.mark_online();
        assert!(status_rx.borrow().online);

        for _ in 0..config.offline_retry_count - 1 {
            device.on_timeout(&config);
            assert!(status_rx.borrow().online);
        }
        device.on_timeout(&config);
        assert!(!status_rx.borrow().online);

        // First valid reply brings the device straight back.
        device.mark_online();
        assert!(status_rx.borrow().online);
        assert_eq!(device.timeouts, 0);
    }

    #[test]
    fn test_offline_discards_capabilities() {
        let (mut device, status_rx) = test_device();
        let config = CpConfig::default();

        device.mark_online();
        device.set_capabilities(vec![]);
        assert!(status_rx.borrow().capabilities.is_some());

        for _ in 0..config.offline_retry_count {
            device.on_timeout(&config);
        }
        assert!(status_rx.borrow().capabilities.is_none());
        assert!(!device.capabilities_known);
    }

    #[test]
    fn test_keyset_commit_swaps_base_key() {
        let (mut device, _status_rx) = test_device();
        let new_key = ScbkKey::from_bytes([0x22; 16]);

        device.pending_keyset = Some(new_key.clone());
        device.commit_pending_keyset();
        assert_eq!(device.base_key, new_key);
        assert!(device.pending_keyset.is_none());

        // A timeout with no pending keyset leaves the key alone.
        device.on_timeout(&CpConfig::default());
        assert_eq!(device.base_key, new_key);
    }

    #[test]
    fn test_link_sequence_wraps() {
        let (mut device, _status_rx) = test_device();
        let seqs: Vec<u8> = (0..6).map(|_| device.next_seq()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 0, 1, 2]);
    }
}
