//! Encrypted blob storage.
//!
//! Blobs are written as EG2 envelopes: a fresh AES-256-GCM key per blob,
//! wrapped by a KMS key and stored in the header next to the IV and tag.
//! Reads also accept legacy EG1 blobs and unencrypted documents so a store
//! can be migrated in place.
//!
//! ```no_run
//! use std::io::{Cursor, Read};
//!
//! use blobvault::{Config, Content, EncryptedStorage, Storage};
//!
//! # fn main() -> anyhow::Result<()> {
//! let cfg = Config::from_env()?;
//! let storage = EncryptedStorage::from_config(&cfg)?;
//!
//! let mut upload = Cursor::new(b"%PDF-1.7\n".to_vec());
//! let name = storage.save("contract.pdf", Content::new(&mut upload))?;
//! let mut plaintext = Vec::new();
//! storage.open(&name)?.read_to_end(&mut plaintext)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod content;
pub mod crypto;
pub mod kms;
pub mod router;
pub mod storage;

pub use common::{AadKind, StorageError};
pub use config::Config;
pub use content::ContentPolicy;
pub use kms::{KeyWrapper, KmsError, LocalRsaKms, WrappedKey};
pub use router::{BlobFormat, OpenedBlob};
pub use storage::{
    BlobInfo, Content, EncryptedStorage, FsStore, PhysicalStore, Storage, StorageOptions,
};
