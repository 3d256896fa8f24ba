//! Format detection and per-format decode paths.
//!
//! Every read goes through [`Router::route`]: the first bytes of the stored
//! blob decide whether it is EG2, legacy EG1, an unencrypted document still
//! awaiting migration, or something this service never wrote.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use serde::Serialize;
use tracing::{debug, warn};

use common::envelope::{EG1_MAGIC, EG2_MAGIC, MAGIC_LEN};
use common::{Eg2Header, LegacyHeader, StorageError};

use crate::content::ContentPolicy;
use crate::crypto::aead::read_full;
use crate::crypto::{decrypt_verified, DecryptReader, DekBytes};
use crate::kms::KeyWrapper;

/// On-disk format of a stored blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobFormat {
    /// Current envelope, DEK wrapped by the KMS.
    Eg2,
    /// Single-key legacy envelope.
    Legacy,
    /// Unencrypted document recognised by its content signature.
    Passthrough,
    /// None of the above.
    Unknown,
}

impl BlobFormat {
    /// Returns `true` for formats that should be rewritten as EG2.
    pub fn needs_migration(self) -> bool {
        matches!(self, BlobFormat::Legacy | BlobFormat::Passthrough)
    }
}

/// Number of leading bytes needed to classify a blob under `policy`.
pub fn sniff_len(policy: &ContentPolicy) -> usize {
    MAGIC_LEN.max(policy.signature().len())
}

/// Classify a blob by its leading bytes.
///
/// Magic prefixes win over the content signature. Fewer than three bytes is
/// never a valid envelope.
pub fn sniff(prefix: &[u8], policy: &ContentPolicy) -> BlobFormat {
    if prefix.len() >= MAGIC_LEN {
        if prefix.starts_with(EG2_MAGIC) {
            return BlobFormat::Eg2;
        }
        if prefix.starts_with(EG1_MAGIC) {
            return BlobFormat::Legacy;
        }
    }
    if !policy.signature().is_empty() && policy.matches(prefix) {
        return BlobFormat::Passthrough;
    }
    BlobFormat::Unknown
}

/// Read up to `len` leading bytes and rewind.
pub(crate) fn read_prefix<R: Read + Seek>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    reader.seek(SeekFrom::Start(0))?;
    let mut buf = vec![0u8; len];
    let n = read_full(reader, &mut buf)?;
    buf.truncate(n);
    reader.seek(SeekFrom::Start(0))?;
    Ok(buf)
}

/// Read and decode a complete EG2 header from the current position.
///
/// The fixed part is read first so a corrupt length field cannot make us
/// allocate more than the declared header.
pub(crate) fn read_eg2_header<R: Read>(reader: &mut R) -> Result<Eg2Header, StorageError> {
    let mut fixed = [0u8; Eg2Header::FIXED_LEN];
    let n = read_full(reader, &mut fixed)?;
    let declared = Eg2Header::declared_len(&fixed[..n])?;

    let mut buf = fixed.to_vec();
    buf.resize(declared, 0);
    let got = read_full(reader, &mut buf[Eg2Header::FIXED_LEN..])?;
    let (header, _) = Eg2Header::decode(&buf[..Eg2Header::FIXED_LEN + got])?;
    Ok(header)
}

/// Read and decode the fixed EG1 header from the current position.
pub(crate) fn read_legacy_header<R: Read>(
    reader: &mut R,
) -> Result<LegacyHeader, StorageError> {
    let mut fixed = [0u8; LegacyHeader::LEN];
    let n = read_full(reader, &mut fixed)?;
    Ok(LegacyHeader::decode(&fixed[..n])?)
}

/// Everything a read needs besides the blob itself.
pub struct Router<'a> {
    pub kms: &'a dyn KeyWrapper,
    pub legacy_key: Option<&'a DekBytes>,
    pub policy: &'a ContentPolicy,
    pub chunk_size: usize,
}

impl Router<'_> {
    /// Detect the format of `reader` and return a plaintext view over it.
    ///
    /// `name` is the stored name; it is the AAD of EG1 blobs and of EG2 blobs
    /// with a name AAD.
    ///
    /// # Errors
    ///
    /// - [`StorageError::UnknownFormat`] if no format matches.
    /// - [`StorageError::Validation`] for malformed headers or plaintext that
    ///   fails the content signature.
    /// - [`StorageError::KeyResolution`] if the key cannot be obtained.
    /// - [`StorageError::AuthenticationFailure`] if the tag does not verify.
    pub fn route<R: Read + Seek>(
        &self,
        name: &str,
        mut reader: R,
    ) -> Result<OpenedBlob<R>, StorageError> {
        let prefix = read_prefix(&mut reader, sniff_len(self.policy))?;
        let format = sniff(&prefix, self.policy);
        debug!(name, ?format, "routing blob");

        match format {
            BlobFormat::Eg2 => self.open_eg2(name, reader),
            BlobFormat::Legacy => self.open_legacy(name, reader),
            BlobFormat::Passthrough => {
                warn!(name, "serving unencrypted blob, migration to EG2 pending");
                Ok(OpenedBlob::passthrough(reader)?)
            }
            BlobFormat::Unknown => Err(StorageError::UnknownFormat(format!(
                "{name}: leading bytes match neither EG2, EG1 nor the content signature"
            ))),
        }
    }

    fn open_eg2<R: Read + Seek>(
        &self,
        name: &str,
        mut reader: R,
    ) -> Result<OpenedBlob<R>, StorageError> {
        let header = read_eg2_header(&mut reader)?;
        let dek = self.kms.unwrap_key(header.key_id, &header.wrapped_key)?;
        let plain = decrypt_verified(
            reader,
            &dek,
            &header.iv,
            &header.aad,
            &header.tag,
            header.encoded_len() as u64,
            self.chunk_size,
        )?;

        let mut blob = OpenedBlob {
            format: BlobFormat::Eg2,
            key_id: Some(header.key_id),
            len: plain.len(),
            body: Body::Decrypted(plain),
        };
        self.check_plaintext(name, &mut blob)?;
        Ok(blob)
    }

    fn open_legacy<R: Read + Seek>(
        &self,
        name: &str,
        mut reader: R,
    ) -> Result<OpenedBlob<R>, StorageError> {
        let header = read_legacy_header(&mut reader)?;
        let key = self.legacy_key.ok_or_else(|| {
            StorageError::KeyResolution(format!(
                "{name} is a legacy EG1 blob but no legacy key is configured"
            ))
        })?;
        let plain = decrypt_verified(
            reader,
            key,
            &header.iv,
            name.as_bytes(),
            &header.tag,
            LegacyHeader::LEN as u64,
            self.chunk_size,
        )?;
        warn!(
            name,
            key_id = header.key_id,
            "serving legacy EG1 blob, migration to EG2 pending"
        );

        let mut blob = OpenedBlob {
            format: BlobFormat::Legacy,
            key_id: Some(header.key_id),
            len: plain.len(),
            body: Body::Decrypted(plain),
        };
        self.check_plaintext(name, &mut blob)?;
        Ok(blob)
    }

    fn check_plaintext<R: Read + Seek>(
        &self,
        name: &str,
        blob: &mut OpenedBlob<R>,
    ) -> Result<(), StorageError> {
        if !self.policy.applies_to(name) {
            return Ok(());
        }
        let prefix = read_prefix(blob, self.policy.signature().len())?;
        self.policy.check(name, &prefix)
    }
}

#[derive(Debug)]
enum Body<R> {
    Plain(R),
    /// Reads from the verified ciphertext copy, not from the store.
    Decrypted(DecryptReader<File>),
}

/// Plaintext of a stored blob, positioned at its start.
#[derive(Debug)]
pub struct OpenedBlob<R> {
    format: BlobFormat,
    key_id: Option<u8>,
    len: u64,
    body: Body<R>,
}

impl<R: Read + Seek> OpenedBlob<R> {
    fn passthrough(mut reader: R) -> io::Result<Self> {
        let len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(Self {
            format: BlobFormat::Passthrough,
            key_id: None,
            len,
            body: Body::Plain(reader),
        })
    }
}

impl<R> OpenedBlob<R> {
    /// Format the blob was stored in.
    pub fn format(&self) -> BlobFormat {
        self.format
    }

    /// Key id from the header, if the blob was encrypted.
    pub fn key_id(&self) -> Option<u8> {
        self.key_id
    }

    /// Plaintext length.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if the plaintext is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if the blob should be rewritten as EG2.
    pub fn needs_migration(&self) -> bool {
        self.format.needs_migration()
    }
}

impl<R: Read> Read for OpenedBlob<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.body {
            Body::Plain(r) => r.read(buf),
            Body::Decrypted(r) => r.read(buf),
        }
    }
}

impl<R: Seek> Seek for OpenedBlob<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.body {
            Body::Plain(r) => r.seek(pos),
            Body::Decrypted(r) => r.seek(pos),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use common::envelope::IV_LEN;
    use common::AadKind;

    use super::*;
    use crate::crypto::{generate_iv, GcmEncryptor};
    use crate::kms::{KmsError, MockKeyWrapper};

    fn pdf(len: usize) -> Vec<u8> {
        let mut doc = b"%PDF-1.7\n".to_vec();
        doc.resize(len, b'x');
        doc
    }

    fn eg2_blob(dek: &DekBytes, aad_kind: AadKind, aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let iv: [u8; IV_LEN] = generate_iv();
        let mut body = plaintext.to_vec();
        let mut enc = GcmEncryptor::new(dek, &iv, aad);
        enc.encrypt_in_place(&mut body).unwrap();
        let header = Eg2Header {
            key_id: 4,
            aad_kind,
            aad: aad.to_vec(),
            iv,
            tag: enc.finalize(),
            wrapped_key: vec![0x5A; 48],
        };
        let mut out = header.encode().unwrap();
        out.extend_from_slice(&body);
        out
    }

    fn router<'a>(kms: &'a MockKeyWrapper, policy: &'a ContentPolicy) -> Router<'a> {
        Router {
            kms,
            legacy_key: None,
            policy,
            chunk_size: 1024,
        }
    }

    fn kms_returning(dek: [u8; 32]) -> MockKeyWrapper {
        let mut kms = MockKeyWrapper::new();
        kms.expect_unwrap_key()
            .withf(|id, wrapped| *id == 4 && wrapped.len() == 48)
            .returning(move |_, _| Ok(DekBytes::from_slice(&dek).unwrap()));
        kms
    }

    #[test]
    fn sniff_prefers_magic_over_signature() {
        let policy = ContentPolicy::pdf();
        assert_eq!(sniff(b"EG2\x02", &policy), BlobFormat::Eg2);
        assert_eq!(sniff(b"EG1\x01", &policy), BlobFormat::Legacy);
        assert_eq!(sniff(b"%PDF-1.4", &policy), BlobFormat::Passthrough);
        assert_eq!(sniff(b"EG", &policy), BlobFormat::Unknown);
        assert_eq!(sniff(b"", &policy), BlobFormat::Unknown);
        assert_eq!(sniff(b"GIF89a", &policy), BlobFormat::Unknown);
    }

    #[test]
    fn only_legacy_and_passthrough_need_migration() {
        assert!(!BlobFormat::Eg2.needs_migration());
        assert!(BlobFormat::Legacy.needs_migration());
        assert!(BlobFormat::Passthrough.needs_migration());
        assert!(!BlobFormat::Unknown.needs_migration());
    }

    #[test]
    fn eg2_with_stable_id_decrypts() {
        let dek = DekBytes::generate();
        let raw = *dek.as_bytes();
        let plaintext = pdf(5000);
        let blob = eg2_blob(&dek, AadKind::StableId, &[7u8; 16], &plaintext);

        let kms = kms_returning(raw);
        let policy = ContentPolicy::pdf();
        let router = router(&kms, &policy);

        let mut opened = router.route("doc.pdf", Cursor::new(blob)).unwrap();
        assert_eq!(opened.format(), BlobFormat::Eg2);
        assert_eq!(opened.key_id(), Some(4));
        assert_eq!(opened.len(), 5000);
        let mut out = Vec::new();
        opened.read_to_end(&mut out).unwrap();
        assert_eq!(out, plaintext);
    }

    #[test]
    fn decrypted_plaintext_must_carry_the_signature() {
        let dek = DekBytes::generate();
        let raw = *dek.as_bytes();
        let blob = eg2_blob(&dek, AadKind::Name, b"doc.pdf", b"<html>not a pdf</html>");

        let kms = kms_returning(raw);
        let policy = ContentPolicy::pdf();
        let router = router(&kms, &policy);

        let err = router.route("doc.pdf", Cursor::new(blob)).unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)), "{err}");
    }

    #[test]
    fn kms_failure_is_key_resolution() {
        let dek = DekBytes::generate();
        let blob = eg2_blob(&dek, AadKind::Name, b"doc.pdf", &pdf(64));

        let mut kms = MockKeyWrapper::new();
        kms.expect_unwrap_key()
            .returning(|_, _| Err(KmsError::Unavailable("connection refused".into())));
        let policy = ContentPolicy::pdf();
        let router = router(&kms, &policy);

        let err = router.route("doc.pdf", Cursor::new(blob)).unwrap_err();
        assert!(matches!(err, StorageError::KeyResolution(_)), "{err}");
    }

    #[test]
    fn truncated_eg2_header_is_validation() {
        let dek = DekBytes::generate();
        let blob = eg2_blob(&dek, AadKind::Name, b"doc.pdf", &pdf(64));

        let mut kms = MockKeyWrapper::new();
        kms.expect_unwrap_key().never();
        let policy = ContentPolicy::pdf();
        let router = router(&kms, &policy);

        for cut in [4, Eg2Header::FIXED_LEN - 1, Eg2Header::FIXED_LEN + 3] {
            let err = router
                .route("doc.pdf", Cursor::new(blob[..cut].to_vec()))
                .unwrap_err();
            assert!(matches!(err, StorageError::Validation(_)), "cut {cut}: {err}");
        }
    }

    #[test]
    fn passthrough_is_served_as_is() {
        let kms = MockKeyWrapper::new();
        let policy = ContentPolicy::pdf();
        let router = router(&kms, &policy);

        let doc = pdf(300);
        let mut opened = router.route("old.pdf", Cursor::new(doc.clone())).unwrap();
        assert_eq!(opened.format(), BlobFormat::Passthrough);
        assert!(opened.needs_migration());
        assert_eq!(opened.len(), 300);
        let mut out = Vec::new();
        opened.read_to_end(&mut out).unwrap();
        assert_eq!(out, doc);
    }

    #[test]
    fn unknown_prefix_is_rejected() {
        let kms = MockKeyWrapper::new();
        let policy = ContentPolicy::pdf();
        let router = router(&kms, &policy);

        for data in [b"EG".to_vec(), b"PK\x03\x04zip".to_vec(), Vec::new()] {
            let err = router.route("x.pdf", Cursor::new(data)).unwrap_err();
            assert!(matches!(err, StorageError::UnknownFormat(_)), "{err}");
        }
    }
}
