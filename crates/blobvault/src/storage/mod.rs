//! Named blob storage.
//!
//! [`Storage`] is the interface callers see. [`EncryptedStorage`] implements it
//! on top of a [`PhysicalStore`] that only moves opaque bytes.

pub mod encrypted;
pub mod physical;

pub use encrypted::{BlobInfo, EncryptedStorage};
pub use physical::{FsStore, PhysicalStore};

use std::io::{Read, Seek};

use common::StorageError;
use uuid::Uuid;

use crate::content::ContentPolicy;
use crate::crypto::{DekBytes, DEFAULT_CHUNK_SIZE};

/// Content handed to [`Storage::save`].
pub struct Content<'a> {
    pub(crate) reader: &'a mut dyn Read,
    pub(crate) stable_id: Option<Uuid>,
}

impl<'a> Content<'a> {
    /// Content read from `reader`, bound to the name it is stored under.
    pub fn new(reader: &'a mut dyn Read) -> Self {
        Self {
            reader,
            stable_id: None,
        }
    }

    /// Bind the content to `id` instead of its stored name, so the blob
    /// survives being renamed.
    pub fn with_stable_id(mut self, id: Uuid) -> Self {
        self.stable_id = Some(id);
        self
    }

    pub fn stable_id(&self) -> Option<Uuid> {
        self.stable_id
    }
}

/// Tunables shared by every operation of an [`EncryptedStorage`].
#[derive(Debug)]
pub struct StorageOptions {
    /// Plaintext bytes processed per read or write call.
    pub chunk_size: usize,
    /// Largest plaintext accepted by `save`, if any.
    pub max_plaintext_bytes: Option<u64>,
    /// Expected leading bytes of stored documents.
    pub content_policy: ContentPolicy,
    /// Key for decrypting legacy EG1 blobs.
    pub legacy_key: Option<DekBytes>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_plaintext_bytes: None,
            content_policy: ContentPolicy::default(),
            legacy_key: None,
        }
    }
}

/// A store of named blobs.
pub trait Storage {
    /// Plaintext view returned by [`Storage::open`].
    type Reader: Read + Seek;

    /// Store `content` under `name`, or under a fresh variant of `name` if it
    /// is taken. Returns the name actually used.
    ///
    /// # Errors
    ///
    /// [`StorageError::Validation`] for empty, oversized or mis-signed content
    /// and invalid names; [`StorageError::KeyResolution`] if the DEK cannot be
    /// wrapped.
    fn save(&self, name: &str, content: Content<'_>) -> Result<String, StorageError>;

    /// Open the plaintext stored under `name`.
    ///
    /// # Errors
    ///
    /// See [`crate::router::Router::route`].
    fn open(&self, name: &str) -> Result<Self::Reader, StorageError>;

    /// Plaintext length of `name`, without decrypting.
    ///
    /// # Errors
    ///
    /// [`StorageError::UnknownFormat`] if `name` is not a recognised blob and
    /// [`StorageError::Validation`] if its header is malformed.
    fn size(&self, name: &str) -> Result<u64, StorageError>;
}
