//! Secure channel engine: key derivation, handshake, encrypted framing.

mod kdf;
mod session;

pub use kdf::{
    SessionKeys, cp_proof, derive_session_keys, pd_proof, verify_cp_proof, verify_pd_proof,
};
pub use session::{Role, ScStatus, SecureSession};
