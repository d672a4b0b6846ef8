//! Per-device secure channel session.
//!
//! A `SecureSession` owns the handshake progression and, once active, all
//! encrypt/decrypt operations for one device. The CP side and the PD side
//! each hold their own instance; sessions are never shared across devices
//! or with the application.
//!
//! Secure payload layout (replacing the plaintext message bytes):
//!
//! ```text
//! +--------------------+--------------------------------------+
//! | Sequence (LE64)    | XChaCha20-Poly1305 ciphertext + tag  |
//! +--------------------+--------------------------------------+
//! ```
//!
//! The frame header and the sequence value form the associated data, so
//! tampering with either fails authentication. The sequence is strictly
//! monotonic per direction: the replay check runs before any decryption
//! and a repeated or out-of-order value is rejected without touching
//! session state.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{RngCore, rngs::OsRng};
use zeroize::Zeroize;

use super::kdf::{
    self, SessionKeys, derive_session_keys,
};
use crate::core::{
    AEAD_NONCE_SIZE, CHALLENGE_SIZE, HEADER_SIZE, PROOF_SIZE, ScbkKey, SECURE_OVERHEAD,
    SEQUENCE_SIZE, SecurityError,
};

/// Which end of the link this session belongs to.
///
/// Determines nonce direction separation: CP-to-PD and PD-to-CP traffic
/// never share a nonce even at equal sequence values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Control panel (polling master).
    Cp,
    /// Peripheral device (polled slave).
    Pd,
}

impl Role {
    fn direction(self) -> u8 {
        match self {
            Role::Cp => 0x00,
            Role::Pd => 0x01,
        }
    }

    fn opposite(self) -> Role {
        match self {
            Role::Cp => Role::Pd,
            Role::Pd => Role::Cp,
        }
    }
}

/// Secure channel status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScStatus {
    /// No handshake attempted since creation or the last reset.
    #[default]
    NotStarted,
    /// Key exchange in progress.
    Negotiating,
    /// Session keys established and verified on both ends.
    Active,
    /// Handshake or authentication failure; awaiting re-attempt.
    Failed,
}

/// Secure channel state for a single device.
pub struct SecureSession {
    role: Role,
    status: ScStatus,
    keys: Option<SessionKeys>,
    cp_nonce: [u8; CHALLENGE_SIZE],
    pd_nonce: [u8; CHALLENGE_SIZE],
    send_seq: u64,
    recv_high: u64,
}

impl SecureSession {
    /// Create a fresh session for the given role.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            status: ScStatus::NotStarted,
            keys: None,
            cp_nonce: [0u8; CHALLENGE_SIZE],
            pd_nonce: [0u8; CHALLENGE_SIZE],
            send_seq: 0,
            recv_high: 0,
        }
    }

    /// Current status.
    pub fn status(&self) -> ScStatus {
        self.status
    }

    /// Whether encrypted traffic can flow.
    pub fn is_active(&self) -> bool {
        self.status == ScStatus::Active
    }

    /// Tear the session back to `NotStarted`, scrubbing key material and
    /// resetting both sequence counters.
    pub fn reset(&mut self) {
        self.status = ScStatus::NotStarted;
        self.keys = None;
        self.cp_nonce.zeroize();
        self.pd_nonce.zeroize();
        self.send_seq = 0;
        self.recv_high = 0;
    }

    /// Mark the session failed and scrub key material.
    pub fn fail(&mut self) {
        self.reset();
        self.status = ScStatus::Failed;
    }

    /// CP: start a handshake, returning the challenge nonce to send.
    pub fn begin_cp(&mut self) -> [u8; CHALLENGE_SIZE] {
        self.reset();
        OsRng.fill_bytes(&mut self.cp_nonce);
        self.status = ScStatus::Negotiating;
        self.cp_nonce
    }

    /// PD: answer a challenge, deriving keys and returning the PD nonce
    /// and proof for the reply.
    pub fn begin_pd(
        &mut self,
        cp_nonce: [u8; CHALLENGE_SIZE],
        base: &ScbkKey,
    ) -> Result<([u8; CHALLENGE_SIZE], [u8; PROOF_SIZE]), SecurityError> {
        self.reset();
        self.cp_nonce = cp_nonce;
        OsRng.fill_bytes(&mut self.pd_nonce);

        let keys = derive_session_keys(base, &self.cp_nonce, &self.pd_nonce)?;
        let proof = kdf::pd_proof(&keys, &self.cp_nonce, &self.pd_nonce)?;
        self.keys = Some(keys);
        self.status = ScStatus::Negotiating;
        Ok((self.pd_nonce, proof))
    }

    /// CP: process the PD's handshake reply.
    ///
    /// Derives keys, verifies the PD proof, and returns the CP proof for
    /// the final handshake message. The session stays `Negotiating` until
    /// [`activate`](Self::activate) once the PD acknowledges.
    pub fn cp_complete(
        &mut self,
        pd_nonce: [u8; CHALLENGE_SIZE],
        pd_proof: &[u8; PROOF_SIZE],
        base: &ScbkKey,
    ) -> Result<[u8; PROOF_SIZE], SecurityError> {
        if self.status != ScStatus::Negotiating {
            return Err(SecurityError::HandshakeFailed(
                "no handshake in progress".into(),
            ));
        }
        self.pd_nonce = pd_nonce;

        let keys = derive_session_keys(base, &self.cp_nonce, &self.pd_nonce)?;
        if let Err(err) = kdf::verify_pd_proof(&keys, &self.cp_nonce, &self.pd_nonce, pd_proof) {
            self.fail();
            return Err(err);
        }
        let proof = kdf::cp_proof(&keys, &self.cp_nonce, &self.pd_nonce)?;
        self.keys = Some(keys);
        Ok(proof)
    }

    /// PD: verify the CP's final proof and activate the session.
    pub fn pd_finish(&mut self, cp_proof: &[u8; PROOF_SIZE]) -> Result<(), SecurityError> {
        let Some(keys) = self.keys.as_ref() else {
            return Err(SecurityError::HandshakeFailed(
                "no handshake in progress".into(),
            ));
        };
        if let Err(err) = kdf::verify_cp_proof(keys, &self.cp_nonce, &self.pd_nonce, cp_proof) {
            self.fail();
            return Err(err);
        }
        self.status = ScStatus::Active;
        Ok(())
    }

    /// Transition `Negotiating -> Active` (CP side, after the PD ack).
    pub fn activate(&mut self) {
        if self.status == ScStatus::Negotiating {
            self.status = ScStatus::Active;
        }
    }

    /// Encrypt a message into a secure payload for the given frame header.
    pub fn encrypt(
        &mut self,
        header: &[u8; HEADER_SIZE],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, SecurityError> {
        let keys = self.active_keys()?;
        let seq = self.send_seq + 1;

        let nonce = construct_nonce(self.role.direction(), seq);
        let aad = construct_aad(header, seq);
        let cipher = XChaCha20Poly1305::new(keys.enc_key().into());
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| SecurityError::MacMismatch)?;

        self.send_seq = seq;
        let mut payload = Vec::with_capacity(SEQUENCE_SIZE + ciphertext.len());
        payload.extend_from_slice(&seq.to_le_bytes());
        payload.extend_from_slice(&ciphertext);
        Ok(payload)
    }

    /// Decrypt a secure payload received under the given frame header.
    ///
    /// The replay check runs before decryption; a rejected payload leaves
    /// the session state untouched.
    pub fn decrypt(
        &mut self,
        header: &[u8; HEADER_SIZE],
        payload: &[u8],
    ) -> Result<Vec<u8>, SecurityError> {
        if payload.len() < SECURE_OVERHEAD {
            return Err(SecurityError::MacMismatch);
        }
        let mut seq_bytes = [0u8; SEQUENCE_SIZE];
        seq_bytes.copy_from_slice(&payload[..SEQUENCE_SIZE]);
        let seq = u64::from_le_bytes(seq_bytes);

        if seq <= self.recv_high {
            return Err(SecurityError::ReplayDetected);
        }

        let keys = self.active_keys()?;
        let nonce = construct_nonce(self.role.opposite().direction(), seq);
        let aad = construct_aad(header, seq);
        let cipher = XChaCha20Poly1305::new(keys.enc_key().into());
        let plaintext = cipher
            .decrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &payload[SEQUENCE_SIZE..],
                    aad: &aad,
                },
            )
            .map_err(|_| SecurityError::MacMismatch)?;

        self.recv_high = seq;
        Ok(plaintext)
    }

    fn active_keys(&self) -> Result<&SessionKeys, SecurityError> {
        match (&self.keys, self.status) {
            (Some(keys), ScStatus::Active) => Ok(keys),
            _ => Err(SecurityError::HandshakeFailed(
                "secure channel not active".into(),
            )),
        }
    }
}

/// XChaCha20 nonce: direction byte, zero padding, sequence (LE64).
fn construct_nonce(direction: u8, seq: u64) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[0] = direction;
    nonce[AEAD_NONCE_SIZE - SEQUENCE_SIZE..].copy_from_slice(&seq.to_le_bytes());
    nonce
}

/// Associated data: frame header followed by the sequence (LE64).
fn construct_aad(header: &[u8; HEADER_SIZE], seq: u64) -> [u8; HEADER_SIZE + SEQUENCE_SIZE] {
    let mut aad = [0u8; HEADER_SIZE + SEQUENCE_SIZE];
    aad[..HEADER_SIZE].copy_from_slice(header);
    aad[HEADER_SIZE..].copy_from_slice(&seq.to_le_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: [u8; HEADER_SIZE] = [0x53, 0x65, 0x08, 0x20, 0x00];

    /// Run the full handshake between a CP and a PD session.
    fn establish(base: &ScbkKey) -> (SecureSession, SecureSession) {
        let mut cp = SecureSession::new(Role::Cp);
        let mut pd = SecureSession::new(Role::Pd);

        let cp_nonce = cp.begin_cp();
        let (pd_nonce, pd_proof) = pd.begin_pd(cp_nonce, base).unwrap();
        let cp_proof = cp.cp_complete(pd_nonce, &pd_proof, base).unwrap();
        pd.pd_finish(&cp_proof).unwrap();
        cp.activate();

        assert!(cp.is_active());
        assert!(pd.is_active());
        (cp, pd)
    }

    #[test]
    fn test_handshake_establishes_both_sides() {
        establish(&ScbkKey::from_bytes([0x42; 16]));
    }

    #[test]
    fn test_handshake_wrong_key_fails() {
        let mut cp = SecureSession::new(Role::Cp);
        let mut pd = SecureSession::new(Role::Pd);

        let cp_nonce = cp.begin_cp();
        let (pd_nonce, pd_proof) = pd
            .begin_pd(cp_nonce, &ScbkKey::from_bytes([0x01; 16]))
            .unwrap();

        let err = cp
            .cp_complete(pd_nonce, &pd_proof, &ScbkKey::from_bytes([0x02; 16]))
            .unwrap_err();
        assert!(matches!(err, SecurityError::HandshakeFailed(_)));
        assert_eq!(cp.status(), ScStatus::Failed);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip_both_directions() {
        let base = ScbkKey::from_bytes([0x42; 16]);
        let (mut cp, mut pd) = establish(&base);

        let payload = cp.encrypt(&HEADER, b"command bytes").unwrap();
        assert_eq!(pd.decrypt(&HEADER, &payload).unwrap(), b"command bytes");

        let reply = pd.encrypt(&HEADER, b"reply bytes").unwrap();
        assert_eq!(cp.decrypt(&HEADER, &reply).unwrap(), b"reply bytes");
    }

    #[test]
    fn test_replay_rejected_without_state_change() {
        let base = ScbkKey::from_bytes([0x42; 16]);
        let (mut cp, mut pd) = establish(&base);

        let payload = cp.encrypt(&HEADER, b"once").unwrap();
        pd.decrypt(&HEADER, &payload).unwrap();
        assert_eq!(
            pd.decrypt(&HEADER, &payload).unwrap_err(),
            SecurityError::ReplayDetected
        );

        // A later legitimate payload still decrypts.
        let next = cp.encrypt(&HEADER, b"twice").unwrap();
        assert_eq!(pd.decrypt(&HEADER, &next).unwrap(), b"twice");
    }

    #[test]
    fn test_out_of_order_sequence_rejected() {
        let base = ScbkKey::from_bytes([0x42; 16]);
        let (mut cp, mut pd) = establish(&base);

        let first = cp.encrypt(&HEADER, b"one").unwrap();
        let second = cp.encrypt(&HEADER, b"two").unwrap();

        pd.decrypt(&HEADER, &second).unwrap();
        assert_eq!(
            pd.decrypt(&HEADER, &first).unwrap_err(),
            SecurityError::ReplayDetected
        );
    }

    #[test]
    fn test_tampered_header_fails_auth() {
        let base = ScbkKey::from_bytes([0x42; 16]);
        let (mut cp, mut pd) = establish(&base);

        let payload = cp.encrypt(&HEADER, b"data").unwrap();
        let mut tampered = HEADER;
        tampered[1] ^= 0x01;
        assert_eq!(
            pd.decrypt(&tampered, &payload).unwrap_err(),
            SecurityError::MacMismatch
        );
    }

    #[test]
    fn test_direction_separation() {
        let base = ScbkKey::from_bytes([0x42; 16]);
        let (_cp, mut pd) = establish(&base);

        // A PD payload reflected back at the PD must not decrypt even
        // though the keys match: the nonce direction differs.
        let payload = pd.encrypt(&HEADER, b"pd-origin").unwrap();
        assert_eq!(
            pd.decrypt(&HEADER, &payload).unwrap_err(),
            SecurityError::MacMismatch
        );
    }

    #[test]
    fn test_reset_scrubs_state() {
        let base = ScbkKey::from_bytes([0x42; 16]);
        let (mut cp, _pd) = establish(&base);

        cp.reset();
        assert_eq!(cp.status(), ScStatus::NotStarted);
        assert!(cp.encrypt(&HEADER, b"x").is_err());
    }
}
