//! Session key derivation and handshake proofs.
//!
//! Both sides seed HKDF-SHA256 with the device's base key and the pair of
//! handshake nonces, expanding one encryption key and one MAC key. The MAC
//! key authenticates the handshake itself: each side proves possession of
//! the base key with a truncated HMAC over both nonces.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::core::{
    CHALLENGE_SIZE, MAC_KEY_SIZE, PROOF_SIZE, ScbkKey, SecurityError, SESSION_KEY_SIZE,
};

type HmacSha256 = Hmac<Sha256>;

const INFO_ENC: &[u8] = b"osdp-sc enc";
const INFO_MAC: &[u8] = b"osdp-sc mac";
const LABEL_CP: &[u8] = b"cp";
const LABEL_PD: &[u8] = b"pd";

/// Derived per-session key material.
///
/// Zeroized on drop.
pub struct SessionKeys {
    enc: [u8; SESSION_KEY_SIZE],
    mac: [u8; MAC_KEY_SIZE],
}

impl SessionKeys {
    /// Get the payload encryption key.
    pub fn enc_key(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.enc
    }

    /// Get the MAC key.
    pub fn mac_key(&self) -> &[u8; MAC_KEY_SIZE] {
        &self.mac
    }
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.enc.zeroize();
        self.mac.zeroize();
    }
}

/// Derive session keys from a base key and the two handshake nonces.
pub fn derive_session_keys(
    base: &ScbkKey,
    cp_nonce: &[u8; CHALLENGE_SIZE],
    pd_nonce: &[u8; CHALLENGE_SIZE],
) -> Result<SessionKeys, SecurityError> {
    let mut salt = [0u8; CHALLENGE_SIZE * 2];
    salt[..CHALLENGE_SIZE].copy_from_slice(cp_nonce);
    salt[CHALLENGE_SIZE..].copy_from_slice(pd_nonce);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), base.as_bytes());
    let mut enc = [0u8; SESSION_KEY_SIZE];
    let mut mac = [0u8; MAC_KEY_SIZE];
    hkdf.expand(INFO_ENC, &mut enc)
        .and_then(|()| hkdf.expand(INFO_MAC, &mut mac))
        .map_err(|_| SecurityError::HandshakeFailed("key derivation failed".into()))?;

    Ok(SessionKeys { enc, mac })
}

fn proof_mac(
    keys: &SessionKeys,
    label: &[u8],
    cp_nonce: &[u8; CHALLENGE_SIZE],
    pd_nonce: &[u8; CHALLENGE_SIZE],
) -> Result<HmacSha256, SecurityError> {
    let mut mac = HmacSha256::new_from_slice(&keys.mac).map_err(|_| SecurityError::KeyRejected)?;
    mac.update(label);
    mac.update(cp_nonce);
    mac.update(pd_nonce);
    Ok(mac)
}

fn compute_proof(
    keys: &SessionKeys,
    label: &[u8],
    cp_nonce: &[u8; CHALLENGE_SIZE],
    pd_nonce: &[u8; CHALLENGE_SIZE],
) -> Result<[u8; PROOF_SIZE], SecurityError> {
    let digest = proof_mac(keys, label, cp_nonce, pd_nonce)?.finalize().into_bytes();
    let mut proof = [0u8; PROOF_SIZE];
    proof.copy_from_slice(&digest[..PROOF_SIZE]);
    Ok(proof)
}

fn verify_proof(
    keys: &SessionKeys,
    label: &[u8],
    cp_nonce: &[u8; CHALLENGE_SIZE],
    pd_nonce: &[u8; CHALLENGE_SIZE],
    proof: &[u8; PROOF_SIZE],
) -> Result<(), SecurityError> {
    proof_mac(keys, label, cp_nonce, pd_nonce)?
        .verify_truncated_left(proof)
        .map_err(|_| SecurityError::HandshakeFailed("proof verification failed".into()))
}

/// The CP's proof of base-key possession.
pub fn cp_proof(
    keys: &SessionKeys,
    cp_nonce: &[u8; CHALLENGE_SIZE],
    pd_nonce: &[u8; CHALLENGE_SIZE],
) -> Result<[u8; PROOF_SIZE], SecurityError> {
    compute_proof(keys, LABEL_CP, cp_nonce, pd_nonce)
}

/// The PD's proof of base-key possession.
pub fn pd_proof(
    keys: &SessionKeys,
    cp_nonce: &[u8; CHALLENGE_SIZE],
    pd_nonce: &[u8; CHALLENGE_SIZE],
) -> Result<[u8; PROOF_SIZE], SecurityError> {
    compute_proof(keys, LABEL_PD, cp_nonce, pd_nonce)
}

/// Verify a CP proof in constant time.
pub fn verify_cp_proof(
    keys: &SessionKeys,
    cp_nonce: &[u8; CHALLENGE_SIZE],
    pd_nonce: &[u8; CHALLENGE_SIZE],
    proof: &[u8; PROOF_SIZE],
) -> Result<(), SecurityError> {
    verify_proof(keys, LABEL_CP, cp_nonce, pd_nonce, proof)
}

/// Verify a PD proof in constant time.
pub fn verify_pd_proof(
    keys: &SessionKeys,
    cp_nonce: &[u8; CHALLENGE_SIZE],
    pd_nonce: &[u8; CHALLENGE_SIZE],
    proof: &[u8; PROOF_SIZE],
) -> Result<(), SecurityError> {
    verify_proof(keys, LABEL_PD, cp_nonce, pd_nonce, proof)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CP_NONCE: [u8; CHALLENGE_SIZE] = [1, 2, 3, 4, 5, 6, 7, 8];
    const PD_NONCE: [u8; CHALLENGE_SIZE] = [9, 10, 11, 12, 13, 14, 15, 16];

    #[test]
    fn test_derivation_is_deterministic() {
        let base = ScbkKey::from_bytes([0x42; 16]);
        let a = derive_session_keys(&base, &CP_NONCE, &PD_NONCE).unwrap();
        let b = derive_session_keys(&base, &CP_NONCE, &PD_NONCE).unwrap();
        assert_eq!(a.enc_key(), b.enc_key());
        assert_eq!(a.mac_key(), b.mac_key());
    }

    #[test]
    fn test_derivation_depends_on_all_inputs() {
        let base = ScbkKey::from_bytes([0x42; 16]);
        let reference = derive_session_keys(&base, &CP_NONCE, &PD_NONCE).unwrap();

        let other_key = derive_session_keys(&ScbkKey::from_bytes([0x43; 16]), &CP_NONCE, &PD_NONCE)
            .unwrap();
        assert_ne!(reference.enc_key(), other_key.enc_key());

        let other_nonce = derive_session_keys(&base, &PD_NONCE, &CP_NONCE).unwrap();
        assert_ne!(reference.enc_key(), other_nonce.enc_key());

        assert_ne!(reference.enc_key(), reference.mac_key());
    }

    #[test]
    fn test_proofs_verify() {
        let base = ScbkKey::from_bytes([0x42; 16]);
        let keys = derive_session_keys(&base, &CP_NONCE, &PD_NONCE).unwrap();

        let cp = cp_proof(&keys, &CP_NONCE, &PD_NONCE).unwrap();
        let pd = pd_proof(&keys, &CP_NONCE, &PD_NONCE).unwrap();
        assert_ne!(cp, pd);

        assert!(verify_cp_proof(&keys, &CP_NONCE, &PD_NONCE, &cp).is_ok());
        assert!(verify_pd_proof(&keys, &CP_NONCE, &PD_NONCE, &pd).is_ok());

        // Cross-role and wrong-key proofs fail closed.
        assert!(verify_cp_proof(&keys, &CP_NONCE, &PD_NONCE, &pd).is_err());
        let other = derive_session_keys(&ScbkKey::from_bytes([0x43; 16]), &CP_NONCE, &PD_NONCE)
            .unwrap();
        assert!(verify_cp_proof(&other, &CP_NONCE, &PD_NONCE, &cp).is_err());
    }
}
