//! DEK wrapping through a Key Management Service.
//!
//! # Key rotation
//!
//! New blobs are wrapped under the *active* key id. Blobs written under older
//! ids stay readable for as long as their private key remains configured;
//! removing it turns reads of those blobs into [`KmsError::PrivateKeyUnavailable`],
//! which callers see as a key resolution error rather than corruption.
//!
//! # Security invariants
//!
//! - Wrapping is randomised (OAEP), so wrapping the same DEK twice never
//!   yields the same bytes.
//! - Unwrapped DEKs are returned as [`DekBytes`] and zeroised on drop.

pub mod local;

pub use local::{KmsKey, LocalRsaKms};

use common::StorageError;
use thiserror::Error;

use crate::crypto::DekBytes;

/// Errors produced by the key wrapping layer.
#[derive(Debug, Error)]
pub enum KmsError {
    /// No key pair is configured for this id.
    #[error("unknown KMS key id {0}")]
    UnknownKeyId(u8),

    /// The id is known but this host has no private key for it.
    #[error("private key for KMS key id {0} is not available on this host")]
    PrivateKeyUnavailable(u8),

    /// The active id has no public key configured.
    #[error("active KMS key id {0} is not configured")]
    ActiveKeyNotConfigured(u8),

    /// A configured private key does not belong to the public key of its id.
    #[error("private key for KMS key id {0} does not match its public key")]
    KeyPairMismatch(u8),

    /// The KMS could not be reached or timed out.
    #[error("KMS unavailable: {0}")]
    Unavailable(String),

    /// Wrapping failed.
    #[error("wrapping the DEK under key id {key_id} failed: {reason}")]
    WrapFailed { key_id: u8, reason: String },

    /// The private key is present but the wrapped bytes do not decode to a DEK.
    #[error("wrapped key for key id {0} was rejected")]
    UnwrapRejected(u8),
}

impl From<KmsError> for StorageError {
    fn from(e: KmsError) -> Self {
        match e {
            KmsError::UnwrapRejected(_) => StorageError::AuthenticationFailure(e.to_string()),
            other => StorageError::KeyResolution(other.to_string()),
        }
    }
}

/// A DEK encrypted under a KMS key.
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedKey {
    /// Id of the key the DEK was wrapped under.
    pub key_id: u8,
    /// Wrapped DEK bytes.
    pub ciphertext: Vec<u8>,
}

impl std::fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedKey")
            .field("key_id", &self.key_id)
            .field("len", &self.ciphertext.len())
            .finish()
    }
}

/// Wraps and unwraps per-blob DEKs.
///
/// Implementations are shared read-only across concurrent calls and must not
/// retry internally; a failed call is reported to the caller as-is.
#[cfg_attr(test, mockall::automock)]
pub trait KeyWrapper: Send + Sync {
    /// Key id that [`KeyWrapper::wrap_key`] currently uses.
    fn active_key_id(&self) -> u8;

    /// Wrap `dek` under the active key.
    ///
    /// # Errors
    ///
    /// Returns a [`KmsError`] if the KMS cannot wrap.
    fn wrap_key(&self, dek: &DekBytes) -> Result<WrappedKey, KmsError>;

    /// Recover the DEK wrapped under `key_id`.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::UnknownKeyId`] or [`KmsError::PrivateKeyUnavailable`]
    /// if this host cannot unwrap for `key_id`, and
    /// [`KmsError::UnwrapRejected`] if `wrapped` is corrupt.
    fn unwrap_key(&self, key_id: u8, wrapped: &[u8]) -> Result<DekBytes, KmsError>;
}
