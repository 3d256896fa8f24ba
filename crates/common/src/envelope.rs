//! Binary envelope headers written in front of every encrypted blob.
//!
//! All integers are big-endian. The current format is EG2; EG1 is the legacy
//! single-key format and is only ever decoded.
//!
//! ```text
//! EG2: "EG2" | version=2 (1) | key_id (1) | aad_kind (1) | aad_len (1)
//!      | wrapped_len (2) | reserved (2) | iv (12) | tag (16)
//!      | aad (aad_len) | wrapped_key (wrapped_len) | ciphertext
//!
//! EG1: "EG1" | key_id (1) | iv (12) | tag (16) | ciphertext
//! ```
//!
//! The ciphertext has the same length as the plaintext; the tag lives in the
//! header, so `plaintext_len = stored_len - header_len`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Leading bytes of an EG2 blob.
pub const EG2_MAGIC: &[u8; 3] = b"EG2";

/// Leading bytes of a legacy EG1 blob.
pub const EG1_MAGIC: &[u8; 3] = b"EG1";

/// Length of either magic prefix.
pub const MAGIC_LEN: usize = 3;

/// Version byte that follows the EG2 magic.
pub const EG2_VERSION: u8 = 2;

/// Byte length of the GCM IV stored in both headers.
pub const IV_LEN: usize = 12;

/// Byte length of the GCM authentication tag stored in both headers.
pub const TAG_LEN: usize = 16;

/// Byte length of a stable-identifier AAD (a binary UUID).
pub const STABLE_ID_LEN: usize = 16;

/// Largest AAD that fits the one-byte length field.
pub const MAX_AAD_LEN: usize = u8::MAX as usize;

/// Largest wrapped key that fits the two-byte length field.
pub const MAX_WRAPPED_LEN: usize = u16::MAX as usize;

/// Errors produced while packing or unpacking a header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Fewer bytes than the fixed part of the header.
    #[error("blob too short for {format} header: need {needed} bytes, have {available}")]
    ShortHeader {
        format: &'static str,
        needed: usize,
        available: usize,
    },

    /// The fixed part parsed but the variable sections run past the buffer.
    #[error("header declares more bytes than present: {declared} declared, {available} available")]
    DeclaredLengthExceeded { declared: usize, available: usize },

    /// The magic does not match the format being decoded.
    #[error("unrecognised magic bytes")]
    BadMagic,

    /// EG2 magic with a version byte other than 2.
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    /// AAD kind byte is neither 0 (name) nor 1 (stable identifier).
    #[error("unknown AAD kind {0}")]
    UnknownAadKind(u8),

    /// A stable-identifier AAD that is not exactly 16 bytes.
    #[error("stable identifier AAD must be {STABLE_ID_LEN} bytes, got {0}")]
    StableIdLength(usize),

    /// AAD longer than the one-byte length field allows.
    #[error("associated data is {0} bytes; at most {MAX_AAD_LEN} fit in the header")]
    AadTooLong(usize),

    /// Wrapped key longer than the two-byte length field allows.
    #[error("wrapped key is {0} bytes; at most {MAX_WRAPPED_LEN} fit in the header")]
    WrappedKeyTooLong(usize),
}

// ---------------------------------------------------------------------------
// AAD kind
// ---------------------------------------------------------------------------

/// What the associated data bound into the tag represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AadKind {
    /// UTF-8 stored name. Read compatibility only; breaks if the blob is renamed.
    Name,
    /// Caller-supplied 16-byte stable identifier.
    StableId,
}

impl AadKind {
    /// Wire value of this kind.
    pub fn as_byte(self) -> u8 {
        match self {
            AadKind::Name => 0,
            AadKind::StableId => 1,
        }
    }
}

impl TryFrom<u8> for AadKind {
    type Error = EnvelopeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AadKind::Name),
            1 => Ok(AadKind::StableId),
            other => Err(EnvelopeError::UnknownAadKind(other)),
        }
    }
}

// ---------------------------------------------------------------------------
// EG2
// ---------------------------------------------------------------------------

/// Parsed EG2 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eg2Header {
    /// KMS key id the DEK is wrapped under.
    pub key_id: u8,
    /// Meaning of [`Eg2Header::aad`].
    pub aad_kind: AadKind,
    /// Associated data bound into the tag.
    pub aad: Vec<u8>,
    /// GCM IV.
    pub iv: [u8; IV_LEN],
    /// GCM tag over `aad` and the ciphertext.
    pub tag: [u8; TAG_LEN],
    /// DEK wrapped by the KMS.
    pub wrapped_key: Vec<u8>,
}

impl Eg2Header {
    /// Length of the fixed part, before the AAD and wrapped key.
    pub const FIXED_LEN: usize = 39;

    /// Offset of the IV inside the header.
    pub const IV_OFFSET: usize = 11;

    /// Offset of the tag inside the header.
    pub const TAG_OFFSET: usize = 23;

    /// Total encoded length, and therefore the ciphertext offset.
    pub fn encoded_len(&self) -> usize {
        Self::FIXED_LEN + self.aad.len() + self.wrapped_key.len()
    }

    /// Pack the header into its exact byte layout.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::AadTooLong`], [`EnvelopeError::WrappedKeyTooLong`]
    /// or [`EnvelopeError::StableIdLength`] if a section does not fit.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let aad_len = u8::try_from(self.aad.len())
            .map_err(|_| EnvelopeError::AadTooLong(self.aad.len()))?;
        let wrapped_len = u16::try_from(self.wrapped_key.len())
            .map_err(|_| EnvelopeError::WrappedKeyTooLong(self.wrapped_key.len()))?;
        check_aad(self.aad_kind, &self.aad)?;

        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(EG2_MAGIC);
        out.push(EG2_VERSION);
        out.push(self.key_id);
        out.push(self.aad_kind.as_byte());
        out.push(aad_len);
        out.extend_from_slice(&wrapped_len.to_be_bytes());
        out.extend_from_slice(&[0u8; 2]);
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.aad);
        out.extend_from_slice(&self.wrapped_key);
        Ok(out)
    }

    /// Validate the fixed part of a header and return the full header length
    /// it declares.
    ///
    /// Only the first [`Eg2Header::FIXED_LEN`] bytes are examined, so this is
    /// enough to size a blob without reading the variable sections.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::ShortHeader`] if `buf` is shorter than the
    /// fixed part, or a magic/version/kind error.
    pub fn declared_len(buf: &[u8]) -> Result<usize, EnvelopeError> {
        if buf.len() < Self::FIXED_LEN {
            return Err(EnvelopeError::ShortHeader {
                format: "EG2",
                needed: Self::FIXED_LEN,
                available: buf.len(),
            });
        }
        if &buf[..MAGIC_LEN] != EG2_MAGIC {
            return Err(EnvelopeError::BadMagic);
        }
        if buf[3] != EG2_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(buf[3]));
        }
        AadKind::try_from(buf[5])?;
        let aad_len = usize::from(buf[6]);
        let wrapped_len = usize::from(u16::from_be_bytes([buf[7], buf[8]]));
        Ok(Self::FIXED_LEN + aad_len + wrapped_len)
    }

    /// Unpack a header from the start of `buf`.
    ///
    /// Returns the header and the offset at which the ciphertext begins.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::DeclaredLengthExceeded`] if the declared AAD
    /// and wrapped-key lengths run past the end of `buf`, plus every error of
    /// [`Eg2Header::declared_len`].
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), EnvelopeError> {
        let declared = Self::declared_len(buf)?;
        if buf.len() < declared {
            return Err(EnvelopeError::DeclaredLengthExceeded {
                declared,
                available: buf.len(),
            });
        }

        let aad_kind = AadKind::try_from(buf[5])?;
        let aad_end = Self::FIXED_LEN + usize::from(buf[6]);
        let aad = buf[Self::FIXED_LEN..aad_end].to_vec();
        check_aad(aad_kind, &aad)?;

        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&buf[Self::IV_OFFSET..Self::TAG_OFFSET]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&buf[Self::TAG_OFFSET..Self::FIXED_LEN]);

        let header = Self {
            key_id: buf[4],
            aad_kind,
            aad,
            iv,
            tag,
            wrapped_key: buf[aad_end..declared].to_vec(),
        };
        Ok((header, declared))
    }
}

fn check_aad(kind: AadKind, aad: &[u8]) -> Result<(), EnvelopeError> {
    if kind == AadKind::StableId && aad.len() != STABLE_ID_LEN {
        return Err(EnvelopeError::StableIdLength(aad.len()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// EG1 (legacy, decode only)
// ---------------------------------------------------------------------------

/// Parsed legacy EG1 header. The AAD is implicitly the stored name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyHeader {
    /// Key id recorded at write time. Informational; EG1 always used one key.
    pub key_id: u8,
    /// GCM IV.
    pub iv: [u8; IV_LEN],
    /// GCM tag.
    pub tag: [u8; TAG_LEN],
}

impl LegacyHeader {
    /// Fixed header length, and therefore the ciphertext offset.
    pub const LEN: usize = MAGIC_LEN + 1 + IV_LEN + TAG_LEN;

    /// Unpack the fixed legacy header from the start of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::ShortHeader`] or [`EnvelopeError::BadMagic`].
    pub fn decode(buf: &[u8]) -> Result<Self, EnvelopeError> {
        if buf.len() < Self::LEN {
            return Err(EnvelopeError::ShortHeader {
                format: "EG1",
                needed: Self::LEN,
                available: buf.len(),
            });
        }
        if &buf[..MAGIC_LEN] != EG1_MAGIC {
            return Err(EnvelopeError::BadMagic);
        }
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&buf[4..4 + IV_LEN]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&buf[4 + IV_LEN..Self::LEN]);
        Ok(Self {
            key_id: buf[MAGIC_LEN],
            iv,
            tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Eg2Header {
        Eg2Header {
            key_id: 7,
            aad_kind: AadKind::StableId,
            aad: vec![0xAA; STABLE_ID_LEN],
            iv: [0x11; IV_LEN],
            tag: [0x22; TAG_LEN],
            wrapped_key: vec![0x33; 256],
        }
    }

    #[test]
    fn eg2_exact_layout() {
        let bytes = sample().encode().unwrap();
        assert_eq!(&bytes[..3], b"EG2");
        assert_eq!(bytes[3], 2);
        assert_eq!(bytes[4], 7);
        assert_eq!(bytes[5], 1);
        assert_eq!(bytes[6], 16);
        assert_eq!(&bytes[7..9], &[0x01, 0x00]);
        assert_eq!(&bytes[9..11], &[0, 0]);
        assert_eq!(&bytes[11..23], &[0x11; 12]);
        assert_eq!(&bytes[23..39], &[0x22; 16]);
        assert_eq!(&bytes[39..55], &[0xAA; 16]);
        assert_eq!(bytes.len(), 39 + 16 + 256);
    }

    #[test]
    fn eg2_decode_returns_payload_offset() {
        let header = sample();
        let mut bytes = header.encode().unwrap();
        bytes.extend_from_slice(b"ciphertext");
        let (decoded, offset) = Eg2Header::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(offset, header.encoded_len());
        assert_eq!(&bytes[offset..], b"ciphertext");
    }

    #[test]
    fn name_aad_may_have_any_length() {
        let header = Eg2Header {
            aad_kind: AadKind::Name,
            aad: b"signature/documents/contract.pdf".to_vec(),
            ..sample()
        };
        let bytes = header.encode().unwrap();
        assert_eq!(bytes[5], 0);
        assert_eq!(Eg2Header::decode(&bytes).unwrap().0, header);
    }

    #[test]
    fn encode_rejects_oversized_sections() {
        let long_aad = Eg2Header {
            aad_kind: AadKind::Name,
            aad: vec![b'a'; 256],
            ..sample()
        };
        assert_eq!(long_aad.encode(), Err(EnvelopeError::AadTooLong(256)));

        let long_wrap = Eg2Header {
            wrapped_key: vec![0; 65_536],
            ..sample()
        };
        assert_eq!(
            long_wrap.encode(),
            Err(EnvelopeError::WrappedKeyTooLong(65_536))
        );
    }

    #[test]
    fn encode_rejects_short_stable_id() {
        let header = Eg2Header {
            aad: vec![1, 2, 3],
            ..sample()
        };
        assert_eq!(header.encode(), Err(EnvelopeError::StableIdLength(3)));
    }

    #[test]
    fn decode_rejects_short_fixed_part() {
        let bytes = sample().encode().unwrap();
        let err = Eg2Header::decode(&bytes[..20]).unwrap_err();
        assert!(matches!(err, EnvelopeError::ShortHeader { needed: 39, .. }));
    }

    #[test]
    fn decode_rejects_declared_lengths_past_end() {
        let bytes = sample().encode().unwrap();
        let err = Eg2Header::decode(&bytes[..100]).unwrap_err();
        assert_eq!(
            err,
            EnvelopeError::DeclaredLengthExceeded {
                declared: 39 + 16 + 256,
                available: 100
            }
        );
    }

    #[test]
    fn decode_rejects_wrong_version_and_kind() {
        let mut bytes = sample().encode().unwrap();
        bytes[3] = 3;
        assert_eq!(
            Eg2Header::decode(&bytes).unwrap_err(),
            EnvelopeError::UnsupportedVersion(3)
        );
        bytes[3] = 2;
        bytes[5] = 9;
        assert_eq!(
            Eg2Header::decode(&bytes).unwrap_err(),
            EnvelopeError::UnknownAadKind(9)
        );
    }

    #[test]
    fn declared_len_needs_only_fixed_part() {
        let bytes = sample().encode().unwrap();
        assert_eq!(
            Eg2Header::declared_len(&bytes[..Eg2Header::FIXED_LEN]).unwrap(),
            bytes.len()
        );
    }

    #[test]
    fn legacy_decode() {
        let mut bytes = b"EG1".to_vec();
        bytes.push(4);
        bytes.extend_from_slice(&[0x01; IV_LEN]);
        bytes.extend_from_slice(&[0x02; TAG_LEN]);
        bytes.extend_from_slice(b"rest");
        let header = LegacyHeader::decode(&bytes).unwrap();
        assert_eq!(header.key_id, 4);
        assert_eq!(header.iv, [0x01; IV_LEN]);
        assert_eq!(header.tag, [0x02; TAG_LEN]);
        assert_eq!(LegacyHeader::LEN, 32);
    }

    #[test]
    fn legacy_decode_rejects_short_and_foreign() {
        assert!(matches!(
            LegacyHeader::decode(b"EG1\x00"),
            Err(EnvelopeError::ShortHeader { .. })
        ));
        assert_eq!(
            LegacyHeader::decode(&[0u8; 40]),
            Err(EnvelopeError::BadMagic)
        );
    }
}
