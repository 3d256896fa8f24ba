//! Configuration loading and validation for the blob store.
//!
//! All values are read from `BLOBVAULT_*` environment variables at startup.
//! Construction fails with a clear error message if any required variable is
//! missing or invalid, so misconfiguration never surfaces at first use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::Deserialize;
use zeroize::Zeroizing;

use crate::content::ContentPolicy;
use crate::crypto::{aead::BLOCK_LEN, DekBytes, DEFAULT_CHUNK_SIZE};
use crate::storage::StorageOptions;

/// Validated blob store configuration.
#[derive(Clone, Deserialize)]
pub struct Config {
    /// Root directory of the physical store. **Required.**
    pub storage_root: String,

    /// Key id new blobs are wrapped under.
    #[serde(default = "default_active_key_id")]
    pub kms_active_key_id: u8,

    /// Public keys as `id=path[,id=path...]` (PEM, SPKI or PKCS#1). **Required.**
    pub kms_public_keys: String,

    /// Private keys as `id=path[,id=path...]` (PEM, PKCS#8 or PKCS#1).
    /// Ids without a private key can wrap but not unwrap on this host.
    #[serde(default)]
    pub kms_private_keys: String,

    /// Base directory for relative key paths. Defaults to the working directory.
    #[serde(default)]
    pub kms_key_dir: Option<String>,

    /// Base64 (standard or URL-safe) 32-byte key for legacy EG1 blobs.
    /// Absent means EG1 reads fail with a key resolution error.
    #[serde(default)]
    pub legacy_key_b64: Option<String>,

    /// Bytes processed per read during encryption and authentication.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Optional upper bound on the plaintext accepted by `save`.
    #[serde(default)]
    pub max_plaintext_bytes: Option<u64>,

    /// Leading bytes every covered document must start with.
    #[serde(default = "default_content_signature")]
    pub content_signature: String,

    /// Comma-separated extensions the signature applies to; empty means all.
    #[serde(default = "default_signature_extensions")]
    pub content_signature_extensions: String,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_active_key_id() -> u8 {
    1
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_content_signature() -> String {
    "%PDF-".into()
}
fn default_signature_extensions() -> String {
    "pdf".into()
}
fn default_log_level() -> String {
    "info".into()
}

/// Resolved key material locations for one key id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPaths {
    /// PEM public key.
    pub public: PathBuf,
    /// PEM private key, if this host may unwrap.
    pub private: Option<PathBuf>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("storage_root", &self.storage_root)
            .field("kms_active_key_id", &self.kms_active_key_id)
            .field("kms_public_keys", &self.kms_public_keys)
            .field("kms_private_keys", &self.kms_private_keys)
            .field("kms_key_dir", &self.kms_key_dir)
            .field(
                "legacy_key_b64",
                &self.legacy_key_b64.as_ref().map(|_| "[REDACTED]"),
            )
            .field("chunk_size", &self.chunk_size)
            .field("max_plaintext_bytes", &self.max_plaintext_bytes)
            .field("content_signature", &self.content_signature)
            .field(
                "content_signature_extensions",
                &self.content_signature_extensions,
            )
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any required variable is absent or cannot be parsed.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::with_prefix("BLOBVAULT"))
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first failure.
    pub fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.storage_root, "BLOBVAULT_STORAGE_ROOT")?;
        ensure_non_empty(&self.kms_public_keys, "BLOBVAULT_KMS_PUBLIC_KEYS")?;
        ensure_non_empty(&self.content_signature, "BLOBVAULT_CONTENT_SIGNATURE")?;

        self.key_paths()?;

        if self.chunk_size == 0 || self.chunk_size % BLOCK_LEN != 0 {
            anyhow::bail!("BLOBVAULT_CHUNK_SIZE must be a positive multiple of {BLOCK_LEN}");
        }
        if self.max_plaintext_bytes == Some(0) {
            anyhow::bail!("BLOBVAULT_MAX_PLAINTEXT_BYTES must be > 0 when set");
        }
        self.legacy_key()?;
        Ok(())
    }

    /// Resolve the configured key files per key id.
    ///
    /// # Errors
    ///
    /// Returns an error if either list is malformed, if a private key is
    /// listed for an id without a public key, or if the active id has no
    /// public key.
    pub fn key_paths(&self) -> Result<BTreeMap<u8, KeyPaths>> {
        let public = parse_key_list(&self.kms_public_keys, "BLOBVAULT_KMS_PUBLIC_KEYS")?;
        let mut private = parse_key_list(&self.kms_private_keys, "BLOBVAULT_KMS_PRIVATE_KEYS")?;

        if let Some(orphan) = private.keys().find(|id| !public.contains_key(id)) {
            anyhow::bail!("private key configured for KMS key id {orphan} without a public key");
        }
        if !public.contains_key(&self.kms_active_key_id) {
            anyhow::bail!(
                "active KMS key id {} has no public key in BLOBVAULT_KMS_PUBLIC_KEYS",
                self.kms_active_key_id
            );
        }

        let base = self.kms_key_dir.as_deref().map(Path::new);
        Ok(public
            .into_iter()
            .map(|(id, path)| {
                let paths = KeyPaths {
                    public: resolve(base, &path),
                    private: private.remove(&id).map(|p| resolve(base, &p)),
                };
                (id, paths)
            })
            .collect())
    }

    /// Decode the legacy EG1 key, if configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not base64 or not exactly 32 bytes.
    pub fn legacy_key(&self) -> Result<Option<DekBytes>> {
        let Some(value) = self.legacy_key_b64.as_deref().map(str::trim) else {
            return Ok(None);
        };
        if value.is_empty() {
            return Ok(None);
        }
        let raw = [STANDARD, URL_SAFE, STANDARD_NO_PAD, URL_SAFE_NO_PAD]
            .iter()
            .find_map(|engine| engine.decode(value).ok())
            .map(Zeroizing::new)
            .context("BLOBVAULT_LEGACY_KEY_B64 is not valid base64")?;
        DekBytes::from_slice(&raw)
            .map(Some)
            .map_err(|e| anyhow!("BLOBVAULT_LEGACY_KEY_B64: {e}"))
    }

    /// Content signature policy derived from the signature settings.
    pub fn content_policy(&self) -> ContentPolicy {
        ContentPolicy::new(
            self.content_signature.as_bytes().to_vec(),
            self.content_signature_extensions.split(','),
        )
    }

    /// Storage tuning and policy derived from this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the legacy key is malformed.
    pub fn storage_options(&self) -> Result<StorageOptions> {
        Ok(StorageOptions {
            chunk_size: self.chunk_size,
            max_plaintext_bytes: self.max_plaintext_bytes,
            content_policy: self.content_policy(),
            legacy_key: self.legacy_key()?,
        })
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}

/// Parse `id=path[,id=path...]`.
fn parse_key_list(value: &str, name: &str) -> Result<BTreeMap<u8, String>> {
    let mut out = BTreeMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, path) = entry
            .split_once('=')
            .with_context(|| format!("{name}: entry {entry:?} must look like id=path"))?;
        let id: u8 = id
            .trim()
            .parse()
            .with_context(|| format!("{name}: key id {:?} must be an integer 0-255", id.trim()))?;
        let path = path.trim();
        if path.is_empty() {
            anyhow::bail!("{name}: key id {id} has an empty path");
        }
        if out.insert(id, path.to_owned()).is_some() {
            anyhow::bail!("{name}: key id {id} is listed more than once");
        }
    }
    Ok(out)
}

fn resolve(base: Option<&Path>, path: &str) -> PathBuf {
    let p = Path::new(path);
    match base {
        Some(base) if p.is_relative() => base.join(p),
        _ => p.to_path_buf(),
    }
}
