//! Device registration types: addresses, base keys, flags, capabilities.

use rand::{RngCore, rngs::OsRng};
use zeroize::Zeroize;

use super::constants::{SCBK_DEFAULT, SCBK_SIZE};

/// A 16-byte Secure Channel Base Key (SCBK).
///
/// Zeroized on drop. How key material is persisted is up to the
/// application; the protocol core only ever consumes the raw bytes.
#[derive(Clone)]
pub struct ScbkKey {
    key: [u8; SCBK_SIZE],
}

impl ScbkKey {
    /// Generate a fresh random base key.
    pub fn generate() -> Self {
        let mut key = [0u8; SCBK_SIZE];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Create a key from existing key material.
    pub fn from_bytes(key: [u8; SCBK_SIZE]) -> Self {
        Self { key }
    }

    /// The well-known install-mode base key.
    pub fn install_default() -> Self {
        Self { key: SCBK_DEFAULT }
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn as_bytes(&self) -> &[u8; SCBK_SIZE] {
        &self.key
    }
}

impl Drop for ScbkKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl PartialEq for ScbkKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ScbkKey {}

impl std::fmt::Debug for ScbkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ScbkKey(..)")
    }
}

/// Per-device behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PdFlags(u8);

impl PdFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Refuse plaintext operational traffic; never fall back to
    /// insecure-online after a security failure.
    pub const ENFORCE_SECURE: Self = Self(0x01);

    /// Combine with another flag set.
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Check whether every flag in `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Registration record for one peripheral device.
///
/// Immutable after registration. A `None` base key puts the device in
/// install mode: the handshake runs over the well-known default key until
/// the application commits a real one via a `Keyset` command.
#[derive(Debug, Clone)]
pub struct PdInfo {
    /// Device address, unique within a CP (0..=126).
    pub address: u8,
    /// Human-readable device name, used only for diagnostics.
    pub name: String,
    /// Behavior flags.
    pub flags: PdFlags,
    /// Pre-shared secure-channel base key, or `None` for install mode.
    pub secure_channel_key: Option<ScbkKey>,
}

impl PdInfo {
    /// Create a registration record with no key (install mode) and no flags.
    pub fn new(address: u8, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            flags: PdFlags::NONE,
            secure_channel_key: None,
        }
    }

    /// Set the pre-shared base key.
    pub fn with_key(mut self, key: ScbkKey) -> Self {
        self.secure_channel_key = Some(key);
        self
    }

    /// Set behavior flags.
    pub fn with_flags(mut self, flags: PdFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Functional capability categories a PD can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CapabilityFunction {
    /// Monitoring of input contact status.
    ContactStatusMonitoring = 0x01,
    /// Control of output relays.
    OutputControl = 0x02,
    /// Card data formats the reader can report.
    CardDataFormat = 0x03,
    /// On-reader LED control.
    LedControl = 0x04,
    /// Audible annunciator (buzzer) control.
    AudibleOutput = 0x05,
    /// Text display output.
    TextOutput = 0x06,
    /// Secure-channel communication support.
    CommunicationSecurity = 0x07,
    /// Receive buffer sizing.
    ReceiveBufferSize = 0x08,
}

impl CapabilityFunction {
    /// Parse a capability function from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::ContactStatusMonitoring),
            0x02 => Some(Self::OutputControl),
            0x03 => Some(Self::CardDataFormat),
            0x04 => Some(Self::LedControl),
            0x05 => Some(Self::AudibleOutput),
            0x06 => Some(Self::TextOutput),
            0x07 => Some(Self::CommunicationSecurity),
            0x08 => Some(Self::ReceiveBufferSize),
            _ => None,
        }
    }

    /// Convert to the wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One advertised capability: what, how compliant, and how many units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    /// Capability category.
    pub function: CapabilityFunction,
    /// Compliance level within that category.
    pub compliance: u8,
    /// Number of supported units (outputs, LEDs, ...).
    pub num_items: u8,
}

impl Capability {
    /// Create a capability triple.
    pub fn new(function: CapabilityFunction, compliance: u8, num_items: u8) -> Self {
        Self {
            function,
            compliance,
            num_items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation_unique() {
        let k1 = ScbkKey::generate();
        let k2 = ScbkKey::generate();
        assert_ne!(k1, k2);
        assert_eq!(k1.as_bytes().len(), SCBK_SIZE);
    }

    #[test]
    fn test_install_default_key() {
        assert_eq!(ScbkKey::install_default().as_bytes(), &SCBK_DEFAULT);
    }

    #[test]
    fn test_flags() {
        let flags = PdFlags::NONE;
        assert!(!flags.contains(PdFlags::ENFORCE_SECURE));

        let flags = flags.with(PdFlags::ENFORCE_SECURE);
        assert!(flags.contains(PdFlags::ENFORCE_SECURE));
    }

    #[test]
    fn test_pd_info_builder() {
        let info = PdInfo::new(101, "reader-0")
            .with_key(ScbkKey::install_default())
            .with_flags(PdFlags::ENFORCE_SECURE);
        assert_eq!(info.address, 101);
        assert_eq!(info.name, "reader-0");
        assert!(info.secure_channel_key.is_some());
        assert!(info.flags.contains(PdFlags::ENFORCE_SECURE));
    }

    #[test]
    fn test_capability_function_roundtrip() {
        for f in [
            CapabilityFunction::ContactStatusMonitoring,
            CapabilityFunction::OutputControl,
            CapabilityFunction::CardDataFormat,
            CapabilityFunction::LedControl,
            CapabilityFunction::AudibleOutput,
            CapabilityFunction::TextOutput,
            CapabilityFunction::CommunicationSecurity,
            CapabilityFunction::ReceiveBufferSize,
        ] {
            assert_eq!(CapabilityFunction::from_byte(f.as_byte()), Some(f));
        }
        assert_eq!(CapabilityFunction::from_byte(0x00), None);
        assert_eq!(CapabilityFunction::from_byte(0xFF), None);
    }
}
