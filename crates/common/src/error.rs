//! Common error types shared across crates.

use thiserror::Error;

use crate::envelope::EnvelopeError;

/// Caller-facing error for every storage operation.
///
/// The four crypto/format kinds are raised at the point of detection and are
/// never retried or downgraded:
/// - [`StorageError::Validation`] → `"validation"`
/// - [`StorageError::AuthenticationFailure`] → `"authentication_failure"`
/// - [`StorageError::KeyResolution`] → `"key_resolution"`
/// - [`StorageError::UnknownFormat`] → `"unknown_format"`
///
/// [`StorageError::Io`] covers the physical store itself (missing file,
/// permissions, full disk).
#[derive(Debug, Error)]
pub enum StorageError {
    /// Empty input, content signature mismatch, size limit, invalid name, or a
    /// short/truncated header.
    #[error("validation error: {0}")]
    Validation(String),

    /// The AEAD tag (or the wrapped key) did not verify: tampering, wrong key,
    /// wrong associated data, or corruption.
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    /// The key needed for this blob is unknown, or the required half of the
    /// key pair is not configured on this host, or the KMS is unreachable.
    #[error("key resolution error: {0}")]
    KeyResolution(String),

    /// The leading bytes match no recognised format.
    #[error("unknown blob format: {0}")]
    UnknownFormat(String),

    /// The physical store failed to read or write bytes.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns a short machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::Validation(_) => "validation",
            StorageError::AuthenticationFailure(_) => "authentication_failure",
            StorageError::KeyResolution(_) => "key_resolution",
            StorageError::UnknownFormat(_) => "unknown_format",
            StorageError::Io(_) => "io",
        }
    }
}

impl From<EnvelopeError> for StorageError {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::BadMagic => StorageError::UnknownFormat(e.to_string()),
            other => StorageError::Validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(StorageError::Validation("x".into()).code(), "validation");
        assert_eq!(
            StorageError::AuthenticationFailure("x".into()).code(),
            "authentication_failure"
        );
        assert_eq!(StorageError::KeyResolution("x".into()).code(), "key_resolution");
        assert_eq!(StorageError::UnknownFormat("x".into()).code(), "unknown_format");
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(StorageError::from(io).code(), "io");
    }

    #[test]
    fn display_includes_message() {
        let e = StorageError::Validation("content is empty".into());
        assert!(e.to_string().contains("content is empty"));
    }

    #[test]
    fn envelope_errors_map_to_validation_except_magic() {
        let short = EnvelopeError::ShortHeader {
            format: "EG2",
            needed: 39,
            available: 5,
        };
        assert!(matches!(StorageError::from(short), StorageError::Validation(_)));
        assert!(matches!(
            StorageError::from(EnvelopeError::BadMagic),
            StorageError::UnknownFormat(_)
        ));
    }
}
