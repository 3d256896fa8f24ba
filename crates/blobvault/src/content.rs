//! Expected content signature for stored documents.
//!
//! Saved content is checked on its first chunk, decrypted content on its first
//! bytes, and unencrypted legacy files are recognised by the same signature.

use std::path::Path;

use common::StorageError;

/// Leading bytes of every PDF document.
pub const PDF_SIGNATURE: &[u8] = b"%PDF-";

/// Which names must carry which leading bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentPolicy {
    signature: Vec<u8>,
    extensions: Vec<String>,
}

impl ContentPolicy {
    /// Build a policy. An empty extension list applies the signature to every
    /// name; otherwise only to names whose extension (case-insensitive) is
    /// listed.
    pub fn new<I, S>(signature: impl Into<Vec<u8>>, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            signature: signature.into(),
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    /// `%PDF-` for `.pdf` names.
    pub fn pdf() -> Self {
        Self::new(PDF_SIGNATURE, ["pdf"])
    }

    /// The leading bytes this policy looks for.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Returns `true` if `name` must start with the signature.
    pub fn applies_to(&self, name: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    /// Returns `true` if `prefix` starts with the signature.
    pub fn matches(&self, prefix: &[u8]) -> bool {
        prefix.starts_with(&self.signature)
    }

    /// Check the first bytes of `name`'s plaintext.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Validation`] if the policy applies to `name` and
    /// `prefix` does not start with the signature.
    pub fn check(&self, name: &str, prefix: &[u8]) -> Result<(), StorageError> {
        if self.applies_to(name) && !self.matches(prefix) {
            return Err(StorageError::Validation(format!(
                "{name} does not start with the expected content signature"
            )));
        }
        Ok(())
    }
}

impl Default for ContentPolicy {
    fn default() -> Self {
        Self::pdf()
    }
}
