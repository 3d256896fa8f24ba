//! AES-256-GCM streaming primitives and DEK handling.
//!
//! No KMS or storage dependencies. The envelope header that carries the IV
//! and tag is defined in [`common::envelope`].

pub mod aead;
pub mod dek;

pub use aead::{
    decrypt_verified, generate_iv, verify_stream, CipherError, DecryptReader, GcmEncryptor,
    DEFAULT_CHUNK_SIZE,
};
pub use dek::{DekBytes, InvalidKeyLength, KEY_LEN};
