//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use tempfile::TempDir;

use blobvault::crypto::DekBytes;
use blobvault::kms::KmsKey;
use blobvault::{
    Content, ContentPolicy, EncryptedStorage, FsStore, LocalRsaKms, Storage, StorageOptions,
};

pub const LEGACY_KEY: [u8; 32] = [0x42; 32];

/// Two RSA key pairs, generated once per test binary.
pub fn rsa_keys() -> &'static [RsaPrivateKey; 2] {
    static KEYS: OnceLock<[RsaPrivateKey; 2]> = OnceLock::new();
    KEYS.get_or_init(|| {
        [
            RsaPrivateKey::new(&mut OsRng, 1024).expect("keygen"),
            RsaPrivateKey::new(&mut OsRng, 1024).expect("keygen"),
        ]
    })
}

/// Which key ids a host has, and whether it holds the private half.
pub struct KeySpec {
    pub id: u8,
    pub pair: usize,
    pub private: bool,
}

pub fn full(id: u8, pair: usize) -> KeySpec {
    KeySpec {
        id,
        pair,
        private: true,
    }
}

pub fn public_only(id: u8, pair: usize) -> KeySpec {
    KeySpec {
        id,
        pair,
        private: false,
    }
}

pub fn kms(keys: &[KeySpec], active: u8) -> LocalRsaKms {
    let keys = keys.iter().map(|spec| {
        let private = rsa_keys()[spec.pair].clone();
        KmsKey::new(
            spec.id,
            private.to_public_key(),
            spec.private.then_some(private),
        )
        .expect("key pair")
    });
    LocalRsaKms::new(keys, active).expect("kms")
}

pub fn options(legacy: bool) -> StorageOptions {
    StorageOptions {
        chunk_size: 4096,
        max_plaintext_bytes: None,
        content_policy: ContentPolicy::pdf(),
        legacy_key: legacy.then(|| DekBytes::from_slice(&LEGACY_KEY).expect("legacy key")),
    }
}

pub fn storage_at(
    root: &Path,
    kms: LocalRsaKms,
    options: StorageOptions,
) -> EncryptedStorage<FsStore> {
    EncryptedStorage::new(FsStore::new(root).expect("root"), Arc::new(kms), options)
}

/// A store in a fresh temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub storage: EncryptedStorage<FsStore>,
}

impl Harness {
    pub fn new(kms: LocalRsaKms, options: StorageOptions) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage_at(dir.path(), kms, options);
        Self { dir, storage }
    }

    /// Single key id 1, legacy key configured.
    pub fn simple() -> Self {
        Self::new(kms(&[full(1, 0)], 1), options(true))
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn raw(&self, name: &str) -> Vec<u8> {
        fs::read(self.path(name)).expect("read raw blob")
    }

    pub fn write_raw(&self, name: &str, bytes: &[u8]) {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, bytes).expect("write raw blob");
    }

    pub fn put(&self, name: &str, data: &[u8]) -> String {
        self.storage
            .save(name, Content::new(&mut Cursor::new(data.to_vec())))
            .expect("save")
    }

    pub fn read(&self, name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        self.storage
            .open(name)
            .expect("open")
            .read_to_end(&mut out)
            .expect("read");
        out
    }
}

/// A PDF-looking document of `len` bytes with non-repeating content.
pub fn pdf(len: usize) -> Vec<u8> {
    let mut doc = b"%PDF-1.7\n".to_vec();
    doc.extend((0..len.saturating_sub(doc.len())).map(|i| (i * 7 % 256) as u8));
    doc.truncate(len);
    doc
}

pub fn flip_byte(data: &mut [u8], idx: usize) {
    data[idx] ^= 0x01;
}

/// A legacy EG1 blob for `plaintext` stored as `name`.
pub fn forge_eg1(name: &str, plaintext: &[u8], key: &[u8; 32]) -> Vec<u8> {
    let iv = [0x24u8; 12];
    let cipher = Aes256Gcm::new_from_slice(key).expect("key");
    let mut body = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), name.as_bytes(), &mut body)
        .expect("encrypt");

    let mut out = b"EG1".to_vec();
    out.push(1);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&body);
    out
}
