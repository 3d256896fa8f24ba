//! [`LocalRsaKms`]: in-process KMS wrapping DEKs with RSA-OAEP (SHA-256).
//!
//! Stands in for a remote KMS or HSM behind the same [`KeyWrapper`] trait.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use tracing::info;
use zeroize::Zeroizing;

use super::{KeyWrapper, KmsError, WrappedKey};
use crate::config::Config;
use crate::crypto::DekBytes;

/// Key material for one key id.
pub struct KmsKey {
    key_id: u8,
    public_key: RsaPublicKey,
    private_key: Option<RsaPrivateKey>,
}

impl KmsKey {
    /// Pair a public key with an optional private key.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::KeyPairMismatch`] if `private_key` does not belong
    /// to `public_key`.
    pub fn new(
        key_id: u8,
        public_key: RsaPublicKey,
        private_key: Option<RsaPrivateKey>,
    ) -> Result<Self, KmsError> {
        if let Some(private) = &private_key {
            if private.to_public_key() != public_key {
                return Err(KmsError::KeyPairMismatch(key_id));
            }
        }
        Ok(Self {
            key_id,
            public_key,
            private_key,
        })
    }

    /// Id this key is registered under.
    pub fn key_id(&self) -> u8 {
        self.key_id
    }

    /// Returns `true` if this host can unwrap under this key.
    pub fn can_unwrap(&self) -> bool {
        self.private_key.is_some()
    }
}

impl std::fmt::Debug for KmsKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmsKey")
            .field("key_id", &self.key_id)
            .field("private_key", &self.private_key.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

/// Software KMS holding RSA key pairs keyed by id.
#[derive(Debug)]
pub struct LocalRsaKms {
    keys: BTreeMap<u8, KmsKey>,
    active_id: u8,
}

impl LocalRsaKms {
    /// Build a KMS from key material.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::ActiveKeyNotConfigured`] if no key carries
    /// `active_id`.
    pub fn new(keys: impl IntoIterator<Item = KmsKey>, active_id: u8) -> Result<Self, KmsError> {
        let keys: BTreeMap<u8, KmsKey> = keys.into_iter().map(|k| (k.key_id, k)).collect();
        if !keys.contains_key(&active_id) {
            return Err(KmsError::ActiveKeyNotConfigured(active_id));
        }
        Ok(Self { keys, active_id })
    }

    /// Load every configured key pair from its PEM files.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or parsed, if a private key
    /// does not match its public key, or if the active id is not configured.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mut keys = Vec::new();
        for (id, paths) in cfg.key_paths()? {
            let public = load_public_key(&paths.public)
                .with_context(|| format!("KMS key id {id}: public key"))?;
            let private = paths
                .private
                .as_deref()
                .map(load_private_key)
                .transpose()
                .with_context(|| format!("KMS key id {id}: private key"))?;
            keys.push(KmsKey::new(id, public, private)?);
        }
        let kms = Self::new(keys, cfg.kms_active_key_id)?;
        let unwrap_key_ids: Vec<u8> = kms
            .keys
            .values()
            .filter(|k| k.can_unwrap())
            .map(KmsKey::key_id)
            .collect();
        info!(
            active_key_id = kms.active_id,
            key_ids = ?kms.key_ids().collect::<Vec<_>>(),
            unwrap_key_ids = ?unwrap_key_ids,
            "local KMS loaded"
        );
        Ok(kms)
    }

    /// Ids of all configured keys, ascending.
    pub fn key_ids(&self) -> impl Iterator<Item = u8> + '_ {
        self.keys.keys().copied()
    }
}

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

impl KeyWrapper for LocalRsaKms {
    fn active_key_id(&self) -> u8 {
        self.active_id
    }

    fn wrap_key(&self, dek: &DekBytes) -> Result<WrappedKey, KmsError> {
        let key = self
            .keys
            .get(&self.active_id)
            .ok_or(KmsError::ActiveKeyNotConfigured(self.active_id))?;
        let ciphertext = key
            .public_key
            .encrypt(&mut OsRng, oaep(), dek.as_bytes())
            .map_err(|e| KmsError::WrapFailed {
                key_id: self.active_id,
                reason: e.to_string(),
            })?;
        Ok(WrappedKey {
            key_id: self.active_id,
            ciphertext,
        })
    }

    fn unwrap_key(&self, key_id: u8, wrapped: &[u8]) -> Result<DekBytes, KmsError> {
        let key = self.keys.get(&key_id).ok_or(KmsError::UnknownKeyId(key_id))?;
        let private = key
            .private_key
            .as_ref()
            .ok_or(KmsError::PrivateKeyUnavailable(key_id))?;
        let raw = private
            .decrypt_blinded(&mut OsRng, oaep(), wrapped)
            .map(Zeroizing::new)
            .map_err(|_| KmsError::UnwrapRejected(key_id))?;
        DekBytes::from_slice(&raw).map_err(|_| KmsError::UnwrapRejected(key_id))
    }
}

/// Read a PEM public key (SPKI or PKCS#1).
///
/// # Errors
///
/// Returns an error if the file cannot be read or holds no RSA public key.
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey> {
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    RsaPublicKey::from_public_key_pem(&pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(&pem))
        .with_context(|| format!("{} is not a PEM RSA public key", path.display()))
}

/// Read an unencrypted PEM private key (PKCS#8 or PKCS#1).
///
/// # Errors
///
/// Returns an error if the file cannot be read or holds no RSA private key.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey> {
    let pem = Zeroizing::new(
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
    );
    RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .with_context(|| format!("{} is not a PEM RSA private key", path.display()))
}
