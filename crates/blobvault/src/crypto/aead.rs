//! Streaming AES-256-GCM with a detached tag.
//!
//! The stored ciphertext is exactly as long as the plaintext and the 16-byte
//! tag lives in the envelope header, so neither side ever needs the whole blob
//! in memory. Encryption runs the CTR keystream and GHASH chunk by chunk.
//! Decryption is two-pass: [`decrypt_verified`] recomputes the tag while
//! copying the ciphertext into a private unlinked temp file, and only then
//! hands out a [`DecryptReader`] over that copy. The reader XORs the keystream
//! into the caller's buffer and supports seeking. Later changes to the stored
//! blob never reach it.
//!
//! Output is bit-compatible with standard AES-256-GCM (96-bit IV, 128-bit tag).

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ghash::universal_hash::UniversalHash;
use ghash::GHash;
use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;
use thiserror::Error;

use common::envelope::{IV_LEN, TAG_LEN};
use common::StorageError;

use super::dek::DekBytes;

/// Default amount of data processed per read (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// AES block length; chunk sizes must be a multiple of it.
pub const BLOCK_LEN: usize = 16;

/// Largest plaintext GCM can protect under one IV: 2^32 - 2 blocks.
pub const MAX_PLAINTEXT_LEN: u64 = ((1u64 << 32) - 2) * BLOCK_LEN as u64;

type Aes256Ctr = ctr::Ctr32BE<Aes256>;

/// Errors produced by the AEAD layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The recomputed tag does not match the stored one.
    #[error("authentication tag mismatch")]
    AuthenticationFailed,

    /// More data than GCM allows under a single IV.
    #[error("plaintext exceeds the GCM limit of {MAX_PLAINTEXT_LEN} bytes")]
    TooLong,

    /// Reading the ciphertext stream failed.
    #[error("ciphertext stream error: {0}")]
    Io(#[from] io::Error),
}

impl From<CipherError> for StorageError {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::AuthenticationFailed => StorageError::AuthenticationFailure(e.to_string()),
            CipherError::TooLong => StorageError::Validation(e.to_string()),
            CipherError::Io(io) => StorageError::Io(io),
        }
    }
}

/// Generate a fresh random 96-bit IV via the OS CSPRNG.
pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Read until `buf` is full or the reader is exhausted.
pub(crate) fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

// ---------------------------------------------------------------------------
// Key schedule
// ---------------------------------------------------------------------------

fn block_cipher(dek: &DekBytes) -> Aes256 {
    Aes256::new(GenericArray::from_slice(dek.as_bytes()))
}

/// Counter block `IV || counter` (big-endian 32-bit counter).
fn counter_block(iv: &[u8; IV_LEN], counter: u32) -> aes::Block {
    let mut block = aes::Block::default();
    block[..IV_LEN].copy_from_slice(iv);
    block[IV_LEN..].copy_from_slice(&counter.to_be_bytes());
    block
}

/// CTR keystream starting at `inc32(J0)`, i.e. counter 2.
fn keystream(dek: &DekBytes, iv: &[u8; IV_LEN]) -> Aes256Ctr {
    Aes256Ctr::new(
        GenericArray::from_slice(dek.as_bytes()),
        &counter_block(iv, 2),
    )
}

/// Running GHASH over `aad || ciphertext`, tolerant of arbitrary chunk sizes.
struct TagState {
    ghash: GHash,
    mask: aes::Block,
    aad_len: u64,
    text_len: u64,
    pending: [u8; BLOCK_LEN],
    pending_len: usize,
}

impl TagState {
    fn new(cipher: &Aes256, iv: &[u8; IV_LEN], aad: &[u8]) -> Self {
        let mut h = aes::Block::default();
        cipher.encrypt_block(&mut h);
        let mut mask = counter_block(iv, 1);
        cipher.encrypt_block(&mut mask);

        let mut ghash = GHash::new(&h);
        ghash.update_padded(aad);
        Self {
            ghash,
            mask,
            aad_len: aad.len() as u64,
            text_len: 0,
            pending: [0u8; BLOCK_LEN],
            pending_len: 0,
        }
    }

    fn update(&mut self, mut data: &[u8]) {
        self.text_len += data.len() as u64;

        if self.pending_len > 0 {
            let take = (BLOCK_LEN - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len < BLOCK_LEN {
                return;
            }
            self.ghash.update(&[*ghash::Block::from_slice(&self.pending)]);
            self.pending_len = 0;
        }

        let whole = data.len() - data.len() % BLOCK_LEN;
        // No padding is applied: `whole` is a multiple of the block length.
        self.ghash.update_padded(&data[..whole]);

        let rest = &data[whole..];
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    fn finalize(mut self) -> [u8; TAG_LEN] {
        if self.pending_len > 0 {
            self.ghash.update_padded(&self.pending[..self.pending_len]);
        }
        let mut lengths = ghash::Block::default();
        lengths[..8].copy_from_slice(&(self.aad_len * 8).to_be_bytes());
        lengths[8..].copy_from_slice(&(self.text_len * 8).to_be_bytes());
        self.ghash.update(&[lengths]);

        let s = self.ghash.finalize();
        let mut tag = [0u8; TAG_LEN];
        for (i, byte) in tag.iter_mut().enumerate() {
            *byte = s[i] ^ self.mask[i];
        }
        tag
    }
}

// ---------------------------------------------------------------------------
// Encryption
// ---------------------------------------------------------------------------

/// Incremental encryptor: feed plaintext chunks, collect the tag at the end.
pub struct GcmEncryptor {
    ctr: Aes256Ctr,
    tag: TagState,
}

impl GcmEncryptor {
    /// Start a new encryption under `dek`/`iv`, binding `aad` into the tag.
    pub fn new(dek: &DekBytes, iv: &[u8; IV_LEN], aad: &[u8]) -> Self {
        let cipher = block_cipher(dek);
        Self {
            ctr: keystream(dek, iv),
            tag: TagState::new(&cipher, iv, aad),
        }
    }

    /// Encrypt `chunk` in place. Chunks may have any length.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::TooLong`] once the total would exceed
    /// [`MAX_PLAINTEXT_LEN`]; `chunk` is left untouched in that case.
    pub fn encrypt_in_place(&mut self, chunk: &mut [u8]) -> Result<(), CipherError> {
        if self.tag.text_len + chunk.len() as u64 > MAX_PLAINTEXT_LEN {
            return Err(CipherError::TooLong);
        }
        self.ctr.apply_keystream(chunk);
        self.tag.update(chunk);
        Ok(())
    }

    /// Number of bytes encrypted so far.
    pub fn processed(&self) -> u64 {
        self.tag.text_len
    }

    /// Finish and return the authentication tag.
    pub fn finalize(self) -> [u8; TAG_LEN] {
        self.tag.finalize()
    }
}

// ---------------------------------------------------------------------------
// Decryption
// ---------------------------------------------------------------------------

/// Recompute the tag over everything `reader` yields and compare it with
/// `expected` in constant time.
///
/// Returns the ciphertext length on success.
///
/// # Errors
///
/// Returns [`CipherError::AuthenticationFailed`] on mismatch (including a
/// truncated stream) and [`CipherError::Io`] if reading fails.
pub fn verify_stream<R: Read + ?Sized>(
    dek: &DekBytes,
    iv: &[u8; IV_LEN],
    aad: &[u8],
    expected: &[u8; TAG_LEN],
    reader: &mut R,
    chunk_size: usize,
) -> Result<u64, CipherError> {
    verify_into(dek, iv, aad, expected, reader, &mut io::sink(), chunk_size)
}

/// [`verify_stream`], also writing every ciphertext byte it hashes to `copy`.
fn verify_into<R: Read + ?Sized, W: Write>(
    dek: &DekBytes,
    iv: &[u8; IV_LEN],
    aad: &[u8],
    expected: &[u8; TAG_LEN],
    reader: &mut R,
    copy: &mut W,
    chunk_size: usize,
) -> Result<u64, CipherError> {
    let mut state = TagState::new(&block_cipher(dek), iv, aad);
    let mut buf = vec![0u8; chunk_size.max(BLOCK_LEN)];
    loop {
        let n = read_full(reader, &mut buf)?;
        if n == 0 {
            break;
        }
        state.update(&buf[..n]);
        if state.text_len > MAX_PLAINTEXT_LEN {
            return Err(CipherError::AuthenticationFailed);
        }
        copy.write_all(&buf[..n])?;
    }
    let len = state.text_len;
    let tag = state.finalize();
    if bool::from(tag.ct_eq(expected)) {
        Ok(len)
    } else {
        Err(CipherError::AuthenticationFailed)
    }
}

/// Authenticate the ciphertext that starts at `start` in `inner` and runs to
/// the end of the stream, then return a reader over the plaintext.
///
/// The ciphertext is copied into an anonymous temp file while it is hashed,
/// and the reader decrypts from that copy, so the bytes served are exactly
/// the bytes that verified. The copy holds ciphertext only and disappears
/// when the reader is dropped.
///
/// # Errors
///
/// Returns [`CipherError::AuthenticationFailed`] if the tag does not verify
/// and [`CipherError::Io`] if the stream or the temp file fails.
pub fn decrypt_verified<R: Read + Seek>(
    mut inner: R,
    dek: &DekBytes,
    iv: &[u8; IV_LEN],
    aad: &[u8],
    tag: &[u8; TAG_LEN],
    start: u64,
    chunk_size: usize,
) -> Result<DecryptReader<File>, CipherError> {
    inner.seek(SeekFrom::Start(start))?;
    let mut copy = tempfile::tempfile()?;
    let len = verify_into(dek, iv, aad, tag, &mut inner, &mut copy, chunk_size)?;
    copy.flush()?;
    copy.seek(SeekFrom::Start(0))?;
    Ok(DecryptReader {
        inner: copy,
        ctr: keystream(dek, iv),
        len,
        pos: 0,
    })
}

/// Plaintext view over already-authenticated ciphertext.
///
/// Reads decrypt straight into the caller's buffer; seeking repositions both
/// the underlying stream and the CTR keystream.
pub struct DecryptReader<R> {
    inner: R,
    ctr: Aes256Ctr,
    len: u64,
    pos: u64,
}

impl<R> DecryptReader<R> {
    /// Plaintext length.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns `true` if the plaintext is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<R> std::fmt::Debug for DecryptReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptReader")
            .field("len", &self.len)
            .field("pos", &self.pos)
            .finish_non_exhaustive()
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len.saturating_sub(self.pos);
        if remaining == 0 || out.is_empty() {
            return Ok(0);
        }
        let want = usize::try_from(remaining).map_or(out.len(), |r| r.min(out.len()));
        let n = self.inner.read(&mut out[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "ciphertext shorter than its authenticated length",
            ));
        }
        self.ctr.apply_keystream(&mut out[..n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Seek> Seek for DecryptReader<R> {
    fn seek(&mut self, to: SeekFrom) -> io::Result<u64> {
        let target = match to {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::End(d) => i128::from(self.len) + i128::from(d),
            SeekFrom::Current(d) => i128::from(self.pos) + i128::from(d),
        };
        let target = u64::try_from(target).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")
        })?;

        // Positions past the end are allowed; reads there return 0.
        let effective = target.min(self.len);
        self.inner.seek(SeekFrom::Start(effective))?;
        self.ctr
            .try_seek(effective)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        self.pos = target;
        Ok(target)
    }
}
