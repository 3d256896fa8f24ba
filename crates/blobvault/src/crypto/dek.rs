//! [`DekBytes`]: owned, zeroizing buffer for a per-blob Data Encryption Key.

use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::Zeroize;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Key material of the wrong length was offered as a DEK.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("DEK has invalid length: expected {KEY_LEN} bytes, got {0}")]
pub struct InvalidKeyLength(pub usize);

/// Fixed-size key buffer that holds exactly [`KEY_LEN`] bytes.
///
/// Zeroised on drop.
#[derive(Clone)]
pub struct DekBytes(Box<[u8; KEY_LEN]>);

impl DekBytes {
    /// Generate a fresh random DEK from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut buf = Box::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut buf[..]);
        Self(buf)
    }

    /// Copy key material out of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidKeyLength`] if the slice is not [`KEY_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, InvalidKeyLength> {
        if bytes.len() != KEY_LEN {
            return Err(InvalidKeyLength(bytes.len()));
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Drop for DekBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for DekBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DekBytes([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        let a = DekBytes::generate();
        let b = DekBytes::generate();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn from_slice_round_trip() {
        let key = [0x42u8; KEY_LEN];
        let dek = DekBytes::from_slice(&key).unwrap();
        assert_eq!(dek.as_bytes(), &key);
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(
            DekBytes::from_slice(&[0u8; 16]).unwrap_err(),
            InvalidKeyLength(16)
        );
    }

    #[test]
    fn dek_bytes_redacted_in_debug() {
        let dek = DekBytes::from_slice(&[0xFFu8; KEY_LEN]).unwrap();
        let rendered = format!("{dek:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("255"));
    }
}
