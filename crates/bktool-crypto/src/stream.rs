//! Chunked XChaCha20-Poly1305 file streams
//!
//! Encrypted file format (binary):
//! ```text
//! header (25 bytes):
//!   [4 bytes: magic "BKT1"][1 byte: version][4 bytes: chunk_size, BE][16 bytes: random nonce prefix]
//! body, one or more chunks:
//!   [ciphertext][16 bytes: Poly1305 tag]
//! nonce(i) = nonce_prefix || i (8 bytes, big-endian)
//! AAD(i)   = header || final_flag (1 byte)
//! ```
//!
//! Every chunk but the last carries exactly `chunk_size` plaintext bytes. The
//! last one is always shorter (possibly empty) and is the only chunk sealed
//! with `final_flag = 1`, so dropping, reordering, truncating or extending
//! chunks all fail authentication.

use std::io::{self, Read, Write};

use bktool_core::{BkError, BkResult, Mode};
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::kdf::DerivedKey;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

pub const MAGIC: &[u8; 4] = b"BKT1";
pub const FORMAT_VERSION: u8 = 1;
pub const NONCE_PREFIX_SIZE: usize = 16;
pub const HEADER_SIZE: usize = 4 + 1 + 4 + NONCE_PREFIX_SIZE;

pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;
pub const MIN_CHUNK_SIZE: u32 = 1024;
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Bytes a frame adds on top of `plaintext_len`.
pub fn frame_overhead(plaintext_len: u64, chunk_size: u32) -> u64 {
    let chunks = plaintext_len / u64::from(chunk_size) + 1;
    HEADER_SIZE as u64 + TAG_SIZE as u64 * chunks
}

fn check_chunk_size(chunk_size: u32) -> BkResult<()> {
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
        return Err(BkError::InvalidParameter(format!(
            "chunk size {chunk_size} out of range ({MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE})"
        )));
    }
    Ok(())
}

/// An authenticated stream transform bound to one key and one direction.
///
/// Built once per run and reused for every file. Each `encrypt` call draws a
/// fresh nonce prefix, so one instance can seal any number of files.
pub struct StreamCipher {
    mode: Mode,
    aead: XChaCha20Poly1305,
    chunk_size: u32,
}

impl StreamCipher {
    pub fn new_for_encryption(key: DerivedKey) -> BkResult<Self> {
        Self::new(key, Mode::Encrypt)
    }

    pub fn new_for_decryption(key: DerivedKey) -> BkResult<Self> {
        Self::new(key, Mode::Decrypt)
    }

    /// The key is consumed; its bytes are wiped when it drops here.
    fn new(key: DerivedKey, mode: Mode) -> BkResult<Self> {
        if key.len() != KEY_SIZE {
            return Err(BkError::InvalidParameter(format!(
                "key must be {KEY_SIZE} bytes, got {}",
                key.len()
            )));
        }
        let aead = XChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|e| BkError::InvalidParameter(format!("cipher key rejected: {e}")))?;
        Ok(Self {
            mode,
            aead,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Plaintext bytes per chunk for frames this cipher writes. Decryption
    /// always follows the size recorded in each frame's header.
    pub fn with_chunk_size(mut self, chunk_size: u32) -> BkResult<Self> {
        check_chunk_size(chunk_size)?;
        self.chunk_size = chunk_size;
        Ok(self)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    fn expect_mode(&self, expected: Mode) -> BkResult<()> {
        if self.mode != expected {
            return Err(BkError::ModeMismatch {
                expected,
                actual: self.mode,
            });
        }
        Ok(())
    }

    /// Wrap a plaintext source; reading the result yields the encrypted frame.
    pub fn encrypt<R: Read>(&self, source: R) -> BkResult<EncryptReader<R>> {
        self.expect_mode(Mode::Encrypt)?;

        let mut nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
        OsRng
            .try_fill_bytes(&mut nonce_prefix)
            .map_err(|e| BkError::Entropy(e.to_string()))?;

        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(MAGIC);
        header[4] = FORMAT_VERSION;
        header[5..9].copy_from_slice(&self.chunk_size.to_be_bytes());
        header[9..].copy_from_slice(&nonce_prefix);

        let chunk_size = self.chunk_size as usize;
        Ok(EncryptReader {
            source,
            aead: self.aead.clone(),
            header,
            chunk_size,
            chunk_index: 0,
            out: header.to_vec(),
            out_pos: 0,
            finished: false,
            plaintext_len: 0,
            scratch: Vec::with_capacity(chunk_size + TAG_SIZE),
        })
    }

    /// Wrap a ciphertext source; reading the result yields verified plaintext.
    pub fn decrypt<R: Read>(&self, source: R) -> BkResult<DecryptReader<R>> {
        self.expect_mode(Mode::Decrypt)?;
        Ok(DecryptReader {
            source,
            aead: self.aead.clone(),
            header: None,
            chunk_size: 0,
            chunk_index: 0,
            buf: Vec::new(),
            out_pos: 0,
            finished: false,
            plaintext_len: 0,
        })
    }

    /// Encrypt all of `source` into `sink`. Returns the plaintext byte count.
    pub fn encrypt_to<R: Read, W: Write + ?Sized>(&self, source: R, sink: &mut W) -> BkResult<u64> {
        let mut reader = self.encrypt(source)?;
        io::copy(&mut reader, sink)?;
        Ok(reader.plaintext_len())
    }

    /// Decrypt and authenticate all of `source` into `sink`. Returns the
    /// plaintext byte count. Output is trustworthy only when this returns `Ok`.
    pub fn decrypt_to<R: Read, W: Write + ?Sized>(&self, source: R, sink: &mut W) -> BkResult<u64> {
        let mut reader = self.decrypt(source)?;
        let written = io::copy(&mut reader, sink)?;
        Ok(written)
    }
}

impl std::fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCipher")
            .field("mode", &self.mode)
            .field("chunk_size", &self.chunk_size)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

fn chunk_nonce(header: &[u8; HEADER_SIZE], chunk_index: u64) -> XNonce {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..NONCE_PREFIX_SIZE].copy_from_slice(&header[9..]);
    nonce[NONCE_PREFIX_SIZE..].copy_from_slice(&chunk_index.to_be_bytes());
    *XNonce::from_slice(&nonce)
}

fn chunk_aad(header: &[u8; HEADER_SIZE], last: bool) -> [u8; HEADER_SIZE + 1] {
    let mut aad = [0u8; HEADER_SIZE + 1];
    aad[..HEADER_SIZE].copy_from_slice(header);
    aad[HEADER_SIZE] = u8::from(last);
    aad
}

/// Read until `buf` is full or the source is exhausted.
fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Lazily produces `header || sealed chunks` from a plaintext source.
pub struct EncryptReader<R> {
    source: R,
    aead: XChaCha20Poly1305,
    header: [u8; HEADER_SIZE],
    chunk_size: usize,
    chunk_index: u64,
    out: Vec<u8>,
    out_pos: usize,
    finished: bool,
    plaintext_len: u64,
    scratch: Vec<u8>,
}

impl<R: Read> EncryptReader<R> {
    /// Plaintext bytes consumed so far (the full size once EOF is returned).
    pub fn plaintext_len(&self) -> u64 {
        self.plaintext_len
    }

    fn seal_next_chunk(&mut self) -> io::Result<()> {
        self.scratch.clear();
        self.scratch.resize(self.chunk_size, 0);
        let n = read_full(&mut self.source, &mut self.scratch)?;
        self.scratch.truncate(n);

        let last = n < self.chunk_size;
        let nonce = chunk_nonce(&self.header, self.chunk_index);
        let aad = chunk_aad(&self.header, last);
        self.aead
            .encrypt_in_place(&nonce, &aad, &mut self.scratch)
            .map_err(|e| BkError::InvalidParameter(format!("chunk encryption failed: {e}")))?;

        std::mem::swap(&mut self.out, &mut self.scratch);
        self.out_pos = 0;
        self.plaintext_len += n as u64;
        self.finished = last;
        self.chunk_index = self
            .chunk_index
            .checked_add(1)
            .ok_or_else(|| BkError::InvalidParameter("chunk counter exhausted".into()))?;
        Ok(())
    }
}

impl<R: Read> Read for EncryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.out_pos < self.out.len() {
                let n = buf.len().min(self.out.len() - self.out_pos);
                buf[..n].copy_from_slice(&self.out[self.out_pos..self.out_pos + n]);
                self.out_pos += n;
                return Ok(n);
            }
            if self.finished || buf.is_empty() {
                return Ok(0);
            }
            self.seal_next_chunk()?;
        }
    }
}

/// Lazily authenticates and yields plaintext from an encrypted frame.
///
/// Each chunk is verified before any of its bytes are released, but the
/// stream as a whole is only proven complete once `read` returns `Ok(0)`.
pub struct DecryptReader<R> {
    source: R,
    aead: XChaCha20Poly1305,
    header: Option<[u8; HEADER_SIZE]>,
    chunk_size: usize,
    chunk_index: u64,
    buf: Vec<u8>,
    out_pos: usize,
    finished: bool,
    plaintext_len: u64,
}

impl<R: Read> DecryptReader<R> {
    /// Verified plaintext bytes produced so far.
    pub fn plaintext_len(&self) -> u64 {
        self.plaintext_len
    }

    fn read_header(&mut self) -> io::Result<[u8; HEADER_SIZE]> {
        let mut header = [0u8; HEADER_SIZE];
        let n = read_full(&mut self.source, &mut header)?;
        if n < HEADER_SIZE {
            return Err(BkError::Authentication(format!(
                "truncated header: {n} of {HEADER_SIZE} bytes"
            ))
            .into());
        }
        if &header[..4] != MAGIC || header[4] != FORMAT_VERSION {
            return Err(BkError::Authentication("not a bktool encrypted frame".into()).into());
        }
        let chunk_size = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
        if check_chunk_size(chunk_size).is_err() {
            return Err(BkError::Authentication(format!(
                "header declares invalid chunk size {chunk_size}"
            ))
            .into());
        }
        self.chunk_size = chunk_size as usize;
        self.buf = Vec::with_capacity(self.chunk_size + TAG_SIZE);
        self.header = Some(header);
        Ok(header)
    }

    fn open_next_chunk(&mut self, header: [u8; HEADER_SIZE]) -> io::Result<()> {
        let sealed_len = self.chunk_size + TAG_SIZE;
        self.buf.clear();
        self.buf.resize(sealed_len, 0);
        let n = read_full(&mut self.source, &mut self.buf)?;
        self.buf.truncate(n);

        if n < TAG_SIZE {
            return Err(BkError::Authentication(format!(
                "stream truncated before final chunk {}",
                self.chunk_index
            ))
            .into());
        }

        // A full-size chunk is never the last one.
        let last = n < sealed_len;
        let nonce = chunk_nonce(&header, self.chunk_index);
        let aad = chunk_aad(&header, last);
        self.aead
            .decrypt_in_place(&nonce, &aad, &mut self.buf)
            .map_err(|_| {
                BkError::Authentication(format!(
                    "chunk {} failed verification: wrong key or corrupted data",
                    self.chunk_index
                ))
            })?;

        self.out_pos = 0;
        self.plaintext_len += self.buf.len() as u64;
        self.finished = last;
        self.chunk_index += 1;
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.out_pos < self.buf.len() {
                let n = buf.len().min(self.buf.len() - self.out_pos);
                buf[..n].copy_from_slice(&self.buf[self.out_pos..self.out_pos + n]);
                self.out_pos += n;
                return Ok(n);
            }
            if self.finished || buf.is_empty() {
                return Ok(0);
            }
            let header = match self.header {
                Some(h) => h,
                None => self.read_header()?,
            };
            self.open_next_chunk(header)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(byte: u8) -> DerivedKey {
        DerivedKey::from_bytes(vec![byte; KEY_SIZE])
    }

    fn encryptor(byte: u8) -> StreamCipher {
        StreamCipher::new_for_encryption(key(byte)).unwrap()
    }

    fn decryptor(byte: u8) -> StreamCipher {
        StreamCipher::new_for_decryption(key(byte)).unwrap()
    }

    fn seal(cipher: &StreamCipher, plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        cipher.encrypt_to(plaintext, &mut out).unwrap();
        out
    }

    fn open(cipher: &StreamCipher, frame: &[u8]) -> BkResult<Vec<u8>> {
        let mut out = Vec::new();
        cipher.decrypt_to(frame, &mut out)?;
        Ok(out)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let plaintext = b"hello, encrypted world!";
        let frame = seal(&encryptor(7), plaintext);
        assert_eq!(open(&decryptor(7), &frame).unwrap(), plaintext);
    }

    #[test]
    fn test_encrypt_decrypt_empty() {
        let frame = seal(&encryptor(7), b"");
        assert_eq!(frame.len() as u64, frame_overhead(0, DEFAULT_CHUNK_SIZE));
        assert_eq!(open(&decryptor(7), &frame).unwrap(), b"");
    }

    #[test]
    fn test_chunk_boundaries() {
        let enc = encryptor(1).with_chunk_size(1024).unwrap();
        let dec = decryptor(1);
        for len in [1023usize, 1024, 1025, 2048, 3000] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frame = seal(&enc, &data);
            assert_eq!(frame.len() as u64, len as u64 + frame_overhead(len as u64, 1024));
            assert_eq!(open(&dec, &frame).unwrap(), data, "length {len}");
        }
    }

    #[test]
    fn test_encrypted_size() {
        // header (25) + plaintext (11) + one tag (16)
        let frame = seal(&encryptor(0), b"hello world");
        assert_eq!(frame.len(), 25 + 11 + 16);
    }

    #[test]
    fn test_nonce_uniqueness() {
        let cipher = encryptor(3);
        let a = seal(&cipher, b"same plaintext");
        let b = seal(&cipher, b"same plaintext");
        assert_ne!(a[9..HEADER_SIZE], b[9..HEADER_SIZE], "nonce prefixes must differ");
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let frame = seal(&encryptor(1), b"secret data");
        let err = open(&decryptor(2), &frame).unwrap_err();
        assert_eq!(err.kind(), "authentication");
    }

    #[test]
    fn test_every_bit_flip_detected() {
        let frame = seal(&encryptor(5), b"hello world");
        let dec = decryptor(5);
        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut tampered = frame.clone();
                tampered[byte] ^= 1 << bit;
                let err = open(&dec, &tampered).unwrap_err();
                assert!(
                    matches!(err, BkError::Authentication(_)),
                    "flip at byte {byte} bit {bit} gave {err:?}"
                );
            }
        }
    }

    #[test]
    fn test_truncation_detected() {
        let enc = encryptor(9).with_chunk_size(1024).unwrap();
        let dec = decryptor(9);
        let frame = seal(&enc, &vec![0x5Au8; 2500]);

        // Cut inside the header, inside a chunk, and exactly at a chunk boundary
        let boundary = HEADER_SIZE + 1024 + TAG_SIZE;
        for cut in [0, 10, HEADER_SIZE, HEADER_SIZE + 100, boundary, frame.len() - 1] {
            let err = open(&dec, &frame[..cut]).unwrap_err();
            assert_eq!(err.kind(), "authentication", "cut at {cut}");
        }
    }

    #[test]
    fn test_appended_bytes_detected() {
        let mut frame = seal(&encryptor(4), b"short");
        frame.extend_from_slice(b"garbage");
        assert_eq!(open(&decryptor(4), &frame).unwrap_err().kind(), "authentication");
    }

    #[test]
    fn test_chunk_reorder_detected() {
        let enc = encryptor(6).with_chunk_size(1024).unwrap();
        let data: Vec<u8> = (0..3000).map(|i| (i % 7) as u8).collect();
        let frame = seal(&enc, &data);

        let sealed = 1024 + TAG_SIZE;
        let mut swapped = frame[..HEADER_SIZE].to_vec();
        swapped.extend_from_slice(&frame[HEADER_SIZE + sealed..HEADER_SIZE + 2 * sealed]);
        swapped.extend_from_slice(&frame[HEADER_SIZE..HEADER_SIZE + sealed]);
        swapped.extend_from_slice(&frame[HEADER_SIZE + 2 * sealed..]);

        assert_eq!(open(&decryptor(6), &swapped).unwrap_err().kind(), "authentication");
    }

    #[test]
    fn test_mode_mismatch() {
        let enc = encryptor(1);
        let dec = decryptor(1);

        let err = enc.decrypt(&b""[..]).map(|_| ()).unwrap_err();
        assert!(matches!(
            err,
            BkError::ModeMismatch { expected: Mode::Decrypt, actual: Mode::Encrypt }
        ));
        let err = dec.encrypt(&b""[..]).map(|_| ()).unwrap_err();
        assert_eq!(err.kind(), "mode_mismatch");
    }

    #[test]
    fn test_invalid_key_size() {
        for len in [0usize, 16, 31, 33, 64] {
            let err = StreamCipher::new_for_encryption(DerivedKey::from_bytes(vec![0; len]))
                .unwrap_err();
            assert_eq!(err.kind(), "invalid_parameter", "key length {len}");
        }
    }

    #[test]
    fn test_invalid_chunk_size() {
        assert!(encryptor(0).with_chunk_size(MIN_CHUNK_SIZE - 1).is_err());
        assert!(encryptor(0).with_chunk_size(MAX_CHUNK_SIZE + 1).is_err());
        assert!(encryptor(0).with_chunk_size(MIN_CHUNK_SIZE).is_ok());
    }

    #[test]
    fn test_decrypt_follows_header_chunk_size() {
        let frame = seal(&encryptor(2).with_chunk_size(4096).unwrap(), &[1u8; 10_000]);
        // Decryptor configured with a different size still reads the frame
        let dec = decryptor(2).with_chunk_size(1024).unwrap();
        assert_eq!(open(&dec, &frame).unwrap(), vec![1u8; 10_000]);
    }

    #[test]
    fn test_small_reads() {
        let enc = encryptor(8).with_chunk_size(1024).unwrap();
        let data: Vec<u8> = (0..5000).map(|i| (i * 31 % 256) as u8).collect();

        let mut reader = enc.encrypt(&data[..]).unwrap();
        let mut frame = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            frame.extend_from_slice(&buf[..n]);
        }
        assert_eq!(reader.plaintext_len(), 5000);

        let mut reader = decryptor(8).decrypt(&frame[..]).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 13];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, data);
        assert_eq!(reader.plaintext_len(), 5000);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn roundtrip_any_plaintext(data in prop::collection::vec(any::<u8>(), 0..5000)) {
            let enc = encryptor(11).with_chunk_size(1024).unwrap();
            let frame = seal(&enc, &data);
            prop_assert_eq!(frame.len() as u64, data.len() as u64 + frame_overhead(data.len() as u64, 1024));
            prop_assert_eq!(open(&decryptor(11), &frame).unwrap(), data);
        }
    }
}
