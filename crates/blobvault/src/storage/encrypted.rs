//! EG2 envelope encryption on top of a [`PhysicalStore`].
//!
//! # Write path
//!
//! 1. Read the first chunk; reject empty or mis-signed content before any
//!    key material exists.
//! 2. Generate a DEK and IV, wrap the DEK under the active KMS key.
//! 3. Write the header with a zero tag, stream the ciphertext after it, then
//!    patch the real tag in at [`Eg2Header::TAG_OFFSET`].
//! 4. Commit the staged bytes under the final name.
//!
//! Any failure before step 4 drops the staged write, so a failed save never
//! leaves a blob behind.
//!
//! # Read path
//!
//! Delegated to [`Router`], which authenticates the whole ciphertext before
//! handing out plaintext.

use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use common::envelope::{MAX_AAD_LEN, TAG_LEN};
use common::{AadKind, Eg2Header, StorageError};

use super::physical::{FsStore, PhysicalStore};
use super::{Content, Storage, StorageOptions};
use crate::config::Config;
use crate::crypto::aead::read_full;
use crate::crypto::{generate_iv, DekBytes, GcmEncryptor};
use crate::kms::{KeyWrapper, LocalRsaKms};
use crate::router::{
    read_eg2_header, read_legacy_header, read_prefix, sniff, sniff_len, BlobFormat, OpenedBlob,
    Router,
};

/// Header-level facts about a stored blob, read without decrypting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobInfo {
    pub name: String,
    pub format: BlobFormat,
    pub key_id: Option<u8>,
    pub aad_kind: Option<AadKind>,
    pub stable_id: Option<Uuid>,
    pub header_len: u64,
    pub stored_len: u64,
    pub plaintext_len: u64,
    pub needs_migration: bool,
}

/// Storage that writes EG2 and reads EG2, EG1 and unencrypted documents.
pub struct EncryptedStorage<P> {
    physical: P,
    kms: Arc<dyn KeyWrapper>,
    options: StorageOptions,
}

impl EncryptedStorage<FsStore> {
    /// Filesystem storage with the local RSA KMS, both taken from `cfg`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage root cannot be created or any key or
    /// option fails to load.
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let physical = FsStore::new(&cfg.storage_root)
            .with_context(|| format!("creating storage root {}", cfg.storage_root))?;
        let kms = LocalRsaKms::from_config(cfg)?;
        Ok(Self::new(physical, Arc::new(kms), cfg.storage_options()?))
    }
}

impl<P: PhysicalStore> EncryptedStorage<P> {
    pub fn new(physical: P, kms: Arc<dyn KeyWrapper>, options: StorageOptions) -> Self {
        Self {
            physical,
            kms,
            options,
        }
    }

    pub fn physical(&self) -> &P {
        &self.physical
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    fn router(&self) -> Router<'_> {
        Router {
            kms: self.kms.as_ref(),
            legacy_key: self.options.legacy_key.as_ref(),
            policy: &self.options.content_policy,
            chunk_size: self.options.chunk_size,
        }
    }

    fn check_limit(&self, name: &str, len: u64) -> Result<(), StorageError> {
        match self.options.max_plaintext_bytes {
            Some(max) if len > max => Err(StorageError::Validation(format!(
                "{name} exceeds the maximum size of {max} bytes"
            ))),
            _ => Ok(()),
        }
    }

    /// Read the header of `name` and report what it says.
    ///
    /// # Errors
    ///
    /// [`StorageError::UnknownFormat`] for unrecognised blobs and
    /// [`StorageError::Validation`] for malformed headers.
    pub fn inspect(&self, name: &str) -> Result<BlobInfo, StorageError> {
        let stored_len = self.physical.len(name)?;
        let mut reader = self.physical.open(name)?;
        let policy = &self.options.content_policy;
        let format = sniff(&read_prefix(&mut reader, sniff_len(policy))?, policy);

        let mut info = BlobInfo {
            name: name.to_owned(),
            format,
            key_id: None,
            aad_kind: None,
            stable_id: None,
            header_len: 0,
            stored_len,
            plaintext_len: stored_len,
            needs_migration: format.needs_migration(),
        };
        match format {
            BlobFormat::Eg2 => {
                let header = read_eg2_header(&mut reader)?;
                info.key_id = Some(header.key_id);
                info.aad_kind = Some(header.aad_kind);
                if header.aad_kind == AadKind::StableId {
                    info.stable_id = Uuid::from_slice(&header.aad).ok();
                }
                info.header_len = header.encoded_len() as u64;
            }
            BlobFormat::Legacy => {
                let header = read_legacy_header(&mut reader)?;
                info.key_id = Some(header.key_id);
                info.aad_kind = Some(AadKind::Name);
                info.header_len = common::LegacyHeader::LEN as u64;
            }
            BlobFormat::Passthrough => {}
            BlobFormat::Unknown => {
                return Err(StorageError::UnknownFormat(format!(
                    "{name}: leading bytes match neither EG2, EG1 nor the content signature"
                )))
            }
        }
        // Both header readers fail on a short blob, so this cannot underflow.
        info.plaintext_len = stored_len - info.header_len;
        Ok(info)
    }

    /// Rewrite `name` as a fresh EG2 blob under the active key.
    ///
    /// The plaintext is read through the normal authenticated path. The new
    /// blob keeps the stable identifier of the old one unless `stable_id`
    /// overrides it. The old blob is left in place; the returned name is where
    /// the new one was stored.
    ///
    /// # Errors
    ///
    /// Any error of [`Storage::open`] or [`Storage::save`].
    pub fn reencrypt(
        &self,
        name: &str,
        stable_id: Option<Uuid>,
    ) -> Result<String, StorageError> {
        let before = self.inspect(name)?;
        let mut plaintext = Storage::open(self, name)?;

        let mut content = Content::new(&mut plaintext);
        if let Some(id) = stable_id.or(before.stable_id) {
            content = content.with_stable_id(id);
        }
        let stored = Storage::save(self, name, content)?;
        info!(
            from = name,
            to = %stored,
            from_format = ?before.format,
            from_key_id = ?before.key_id,
            key_id = self.kms.active_key_id(),
            "blob re-encrypted"
        );
        Ok(stored)
    }

    /// Delete `name` from the physical store. A missing blob is not an error.
    ///
    /// # Errors
    ///
    /// [`StorageError::Io`] if the store cannot remove it.
    pub fn remove(&self, name: &str) -> Result<(), StorageError> {
        self.physical.delete(name)?;
        info!(name, "blob removed");
        Ok(())
    }
}

impl<P: PhysicalStore> Storage for EncryptedStorage<P> {
    type Reader = OpenedBlob<P::Reader>;

    fn save(&self, name: &str, content: Content<'_>) -> Result<String, StorageError> {
        let Content { reader, stable_id } = content;

        let mut buf = Zeroizing::new(vec![0u8; self.options.chunk_size.max(1)]);
        let mut n = read_full(&mut *reader, &mut buf)?;
        if n == 0 {
            return Err(StorageError::Validation(format!(
                "{name}: refusing to store empty content"
            )));
        }
        self.options.content_policy.check(name, &buf[..n])?;
        self.check_limit(name, n as u64)?;

        let stored = self.physical.available_name(name)?;
        let (aad_kind, aad) = match stable_id {
            Some(id) => (AadKind::StableId, id.as_bytes().to_vec()),
            None => (AadKind::Name, stored.as_bytes().to_vec()),
        };
        if aad.len() > MAX_AAD_LEN {
            return Err(StorageError::Validation(format!(
                "{stored}: name is too long to bind as associated data, use a stable id"
            )));
        }

        let dek = DekBytes::generate();
        let iv = generate_iv();
        let wrapped = self.kms.wrap_key(&dek)?;
        let mut header = Eg2Header {
            key_id: wrapped.key_id,
            aad_kind,
            aad,
            iv,
            tag: [0u8; TAG_LEN],
            wrapped_key: wrapped.ciphertext,
        };

        let mut staged = self.physical.stage(&stored)?;
        staged.write_all(&header.encode()?)?;

        let mut enc = GcmEncryptor::new(&dek, &iv, &header.aad);
        while n > 0 {
            self.check_limit(name, enc.processed() + n as u64)?;
            enc.encrypt_in_place(&mut buf[..n])?;
            staged.write_all(&buf[..n])?;
            n = read_full(&mut *reader, &mut buf)?;
        }
        let plaintext_len = enc.processed();
        header.tag = enc.finalize();

        staged.seek(SeekFrom::Start(Eg2Header::TAG_OFFSET as u64))?;
        staged.write_all(&header.tag)?;
        staged.flush()?;
        self.physical.commit(staged, &stored)?;

        info!(
            name = %stored,
            key_id = header.key_id,
            aad_kind = ?header.aad_kind,
            plaintext_len,
            "blob stored"
        );
        Ok(stored)
    }

    fn open(&self, name: &str) -> Result<Self::Reader, StorageError> {
        let reader = self.physical.open(name)?;
        self.router().route(name, reader).inspect_err(|e| {
            warn!(name, code = e.code(), error = %e, "failed to open blob");
        })
    }

    fn size(&self, name: &str) -> Result<u64, StorageError> {
        self.inspect(name).map(|info| info.plaintext_len)
    }
}
