//! Byte-level storage underneath [`super::EncryptedStorage`].
//!
//! A physical store knows nothing about envelopes. It validates names, picks
//! a free name on collision, and publishes a write atomically: bytes go to a
//! staging area first and only appear under their final name on
//! [`PhysicalStore::commit`]. A staged write that is dropped without commit
//! leaves nothing behind.

use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tempfile::NamedTempFile;
use tracing::debug;

use common::StorageError;

/// Length of the random suffix appended to a colliding name.
const SUFFIX_LEN: usize = 7;

/// Attempts at finding a free name before giving up.
const MAX_NAME_ATTEMPTS: usize = 100;

/// Atomic named-object storage.
///
/// Names use `/` as separator and are always relative.
pub trait PhysicalStore: Send + Sync {
    /// Write handle returned by [`PhysicalStore::stage`].
    type Staged: Write + Seek;

    /// Read handle returned by [`PhysicalStore::open`].
    type Reader: Read + Seek;

    /// Normalise `name` into the form it would be stored under.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Validation`] if nothing usable is left.
    fn valid_name(&self, name: &str) -> Result<String, StorageError>;

    /// `name` if it is free, otherwise a variant with a random suffix before
    /// the extension.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Validation`] for invalid names.
    fn available_name(&self, name: &str) -> Result<String, StorageError>;

    /// Open a staging handle for a write that will be committed as `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the staging area cannot be created.
    fn stage(&self, name: &str) -> Result<Self::Staged, StorageError>;

    /// Publish `staged` as `name`. Fails rather than replace an existing object.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] with [`io::ErrorKind::AlreadyExists`] if
    /// `name` was taken since [`PhysicalStore::available_name`].
    fn commit(&self, staged: Self::Staged, name: &str) -> Result<(), StorageError>;

    /// Open the bytes stored under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if `name` does not exist.
    fn open(&self, name: &str) -> Result<Self::Reader, StorageError>;

    /// Stored length of `name` in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if `name` does not exist.
    fn len(&self, name: &str) -> Result<u64, StorageError>;

    /// Returns `true` if `name` exists.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid names or I/O failures.
    fn exists(&self, name: &str) -> Result<bool, StorageError>;

    /// Remove `name`. Removing a missing object is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] for I/O failures.
    fn delete(&self, name: &str) -> Result<(), StorageError>;
}

/// Local filesystem store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open (and create if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of an already-valid stored name.
    fn path(&self, name: &str) -> Result<PathBuf, StorageError> {
        let valid = self.valid_name(name)?;
        if valid != name {
            return Err(StorageError::Validation(format!(
                "{name:?} is not a stored name"
            )));
        }
        Ok(self.root.join(valid))
    }
}

/// Keep `[A-Za-z0-9._-]`, turning spaces into underscores.
fn sanitize_component(component: &str) -> String {
    component
        .trim()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect()
}

/// `dir/stem.ext` -> `dir/stem_<suffix>.ext`
fn with_suffix(name: &str, suffix: &str) -> String {
    let (dir, file) = match name.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, name),
    };
    // A leading dot is part of the stem, not an extension.
    let file = match file.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{suffix}{}", &file[..dot], &file[dot..]),
        _ => format!("{file}_{suffix}"),
    };
    match dir {
        Some(dir) => format!("{dir}/{file}"),
        None => file,
    }
}

impl PhysicalStore for FsStore {
    type Staged = NamedTempFile;
    type Reader = File;

    fn valid_name(&self, name: &str) -> Result<String, StorageError> {
        let invalid = || StorageError::Validation(format!("invalid stored name {name:?}"));
        if name.is_empty() || name.starts_with('/') || Path::new(name).has_root() {
            return Err(invalid());
        }

        let mut parts = Vec::new();
        for component in name.split('/') {
            let clean = sanitize_component(component);
            if clean.is_empty() || clean == "." || clean == ".." {
                return Err(invalid());
            }
            parts.push(clean);
        }
        let joined = parts.join("/");

        // Nothing may resolve outside the root.
        if !Path::new(&joined)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(invalid());
        }
        Ok(joined)
    }

    fn available_name(&self, name: &str) -> Result<String, StorageError> {
        let name = self.valid_name(name)?;
        if !self.exists(&name)? {
            return Ok(name);
        }
        for _ in 0..MAX_NAME_ATTEMPTS {
            let candidate = with_suffix(&name, &random_suffix());
            if !self.exists(&candidate)? {
                debug!(requested = %name, chosen = %candidate, "name taken, using variant");
                return Ok(candidate);
            }
        }
        Err(StorageError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free name derived from {name:?}"),
        )))
    }

    fn stage(&self, name: &str) -> Result<Self::Staged, StorageError> {
        let path = self.path(name)?;
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir)?;
        Ok(NamedTempFile::new_in(dir)?)
    }

    fn commit(&self, staged: Self::Staged, name: &str) -> Result<(), StorageError> {
        let path = self.path(name)?;
        staged.as_file().sync_all()?;
        staged.persist_noclobber(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn open(&self, name: &str) -> Result<Self::Reader, StorageError> {
        Ok(File::open(self.path(name)?)?)
    }

    fn len(&self, name: &str) -> Result<u64, StorageError> {
        Ok(fs::metadata(self.path(name)?)?.len())
    }

    fn exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.path(name)?.try_exists()?)
    }

    fn delete(&self, name: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path(name)?) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => Ok(other?),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::SeekFrom;

    use super::*;

    fn store() -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn names_are_sanitised_per_component() {
        let (_dir, store) = store();
        assert_eq!(
            store.valid_name("signature/my contract (v2).pdf").unwrap(),
            "signature/my_contract_v2.pdf"
        );
        assert_eq!(store.valid_name("a-b_c.d").unwrap(), "a-b_c.d");
    }

    #[test]
    fn traversal_and_empty_names_are_rejected() {
        let (_dir, store) = store();
        for bad in ["", "/etc/passwd", "../x.pdf", "a/../../x", "a//b", "a/./b", "???"] {
            assert!(
                matches!(store.valid_name(bad), Err(StorageError::Validation(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn suffix_goes_before_the_extension() {
        assert_eq!(with_suffix("dir/doc.pdf", "abc1234"), "dir/doc_abc1234.pdf");
        assert_eq!(with_suffix("doc", "abc1234"), "doc_abc1234");
        assert_eq!(with_suffix(".hidden", "abc1234"), ".hidden_abc1234");
        assert_eq!(with_suffix("a.tar.gz", "abc1234"), "a.tar_abc1234.gz");
    }

    #[test]
    fn staged_write_is_invisible_until_commit() {
        let (_dir, store) = store();
        let mut staged = store.stage("docs/a.pdf").unwrap();
        staged.write_all(b"placeholder").unwrap();
        staged.seek(SeekFrom::Start(0)).unwrap();
        staged.write_all(b"P").unwrap();
        assert!(!store.exists("docs/a.pdf").unwrap());

        store.commit(staged, "docs/a.pdf").unwrap();
        assert_eq!(store.len("docs/a.pdf").unwrap(), 11);
        let mut out = String::new();
        store.open("docs/a.pdf").unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "Placeholder");
    }

    #[test]
    fn dropped_stage_leaves_nothing() {
        let (dir, store) = store();
        let mut staged = store.stage("a.pdf").unwrap();
        staged.write_all(b"partial").unwrap();
        drop(staged);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn collisions_get_a_suffixed_name() {
        let (_dir, store) = store();
        let staged = store.stage("a.pdf").unwrap();
        store.commit(staged, "a.pdf").unwrap();

        let other = store.available_name("a.pdf").unwrap();
        assert_ne!(other, "a.pdf");
        assert!(other.starts_with("a_") && other.ends_with(".pdf"));
        assert_eq!(other.len(), "a_.pdf".len() + SUFFIX_LEN);
    }

    #[test]
    fn commit_never_replaces() {
        let (_dir, store) = store();
        store.commit(store.stage("a.pdf").unwrap(), "a.pdf").unwrap();
        let err = store
            .commit(store.stage("a.pdf").unwrap(), "a.pdf")
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(ref e) if e.kind() == io::ErrorKind::AlreadyExists));
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = store();
        store.commit(store.stage("a.pdf").unwrap(), "a.pdf").unwrap();
        store.delete("a.pdf").unwrap();
        store.delete("a.pdf").unwrap();
        assert!(!store.exists("a.pdf").unwrap());
    }
}
