//! Streaming AES-256-GCM with a 128-bit IV.
//!
//! The one-shot AEAD APIs want the whole message in memory, which does not
//! work for multi-gigabyte dumps. This module drives the GCM construction
//! directly: CTR keystream from `ctr::Ctr32BE` and authentication from
//! `ghash`, so ciphertext can be produced and consumed chunk by chunk.
//!
//! With a 16-byte IV the pre-counter block is `J0 = GHASH_H(IV || 0^64 || [128]_64)`,
//! payload counters start at `inc32(J0)` and the tag is
//! `E_K(J0) XOR GHASH_H(C || [0]_64 || [len(C)]_64)`. No associated data is used.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use ghash::GHash;
use ghash::universal_hash::{KeyInit as HashKeyInit, UniversalHash};
use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::crypto::key::EncryptionKey;
use crate::errors::{BackupError, Result};

pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

/// GCM caps a single message at 2^39 - 256 bits.
pub const MAX_MESSAGE_LEN: u64 = (1 << 36) - 32;

pub type Iv = [u8; IV_LEN];
pub type Tag = [u8; TAG_LEN];

type Aes256Ctr32 = ctr::Ctr32BE<Aes256>;

/// Shared GCM state. Always hashes ciphertext, whichever direction it runs in.
struct GcmCore {
    keystream: Aes256Ctr32,
    ghash: GHash,
    tag_mask: ghash::Block,
    pending: [u8; BLOCK_LEN],
    pending_len: usize,
    ciphertext_len: u64,
}

impl GcmCore {
    fn new(key: &EncryptionKey, iv: &Iv) -> Self {
        let aes = Aes256::new(GenericArray::from_slice(key.as_bytes()));

        let mut hash_key = aes::Block::default();
        aes.encrypt_block(&mut hash_key);

        let mut j0_hash = <GHash as HashKeyInit>::new(&hash_key);
        j0_hash.update(&[ghash::Block::clone_from_slice(iv)]);
        j0_hash.update(&[length_block(0, (IV_LEN as u64) * 8)]);
        let j0 = j0_hash.finalize();

        let mut counter = j0.clone();
        inc32(counter.as_mut_slice());

        let mut tag_mask = j0;
        aes.encrypt_block(&mut tag_mask);

        let keystream = <Aes256Ctr32 as KeyIvInit>::new(
            GenericArray::from_slice(key.as_bytes()),
            &counter,
        );

        GcmCore {
            keystream,
            ghash: <GHash as HashKeyInit>::new(&hash_key),
            tag_mask,
            pending: [0u8; BLOCK_LEN],
            pending_len: 0,
            ciphertext_len: 0,
        }
    }

    /// Reserves room for `len` more bytes; false once the GCM message limit would be crossed.
    fn reserve(&mut self, len: usize) -> bool {
        match self.ciphertext_len.checked_add(len as u64) {
            Some(total) if total <= MAX_MESSAGE_LEN => {
                self.ciphertext_len = total;
                true
            }
            _ => false,
        }
    }

    fn apply_keystream(&mut self, buf: &mut [u8]) -> bool {
        self.keystream.try_apply_keystream(buf).is_ok()
    }

    fn absorb(&mut self, mut data: &[u8]) {
        if self.pending_len > 0 {
            let take = (BLOCK_LEN - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len < BLOCK_LEN {
                return;
            }
            self.ghash
                .update(&[ghash::Block::clone_from_slice(&self.pending)]);
            self.pending_len = 0;
        }

        let mut blocks = data.chunks_exact(BLOCK_LEN);
        for block in &mut blocks {
            self.ghash.update(&[ghash::Block::clone_from_slice(block)]);
        }
        let rest = blocks.remainder();
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    fn finish(self) -> Tag {
        let GcmCore {
            mut ghash,
            tag_mask,
            pending,
            pending_len,
            ciphertext_len,
            ..
        } = self;

        if pending_len > 0 {
            ghash.update_padded(&pending[..pending_len]);
        }
        ghash.update(&[length_block(0, ciphertext_len * 8)]);
        let digest = ghash.finalize();

        let mut tag = [0u8; TAG_LEN];
        for (out, (d, m)) in tag.iter_mut().zip(digest.iter().zip(tag_mask.iter())) {
            *out = d ^ m;
        }
        tag
    }
}

fn length_block(aad_bits: u64, text_bits: u64) -> ghash::Block {
    let mut block = ghash::Block::default();
    block[..8].copy_from_slice(&aad_bits.to_be_bytes());
    block[8..].copy_from_slice(&text_bits.to_be_bytes());
    block
}

/// Increments the low 32 bits of a counter block, big-endian, mod 2^32.
fn inc32(block: &mut [u8]) {
    let low = u32::from_be_bytes([block[12], block[13], block[14], block[15]]).wrapping_add(1);
    block[12..16].copy_from_slice(&low.to_be_bytes());
}

/// One encryption: fresh random IV, any number of `update` calls, one `finalize`.
pub struct CipherSession {
    iv: Iv,
    core: GcmCore,
}

impl CipherSession {
    /// Draws a fresh IV from the OS CSPRNG. Callers cannot supply an IV.
    pub fn new(key: &EncryptionKey) -> Result<Self> {
        let mut iv = [0u8; IV_LEN];
        OsRng.try_fill_bytes(&mut iv).map_err(|e| {
            BackupError::encryption(
                "failed to draw a random IV from the OS",
                std::io::Error::other(e),
            )
        })?;
        debug!("New cipher session, iv={}", hex::encode(iv));
        Ok(Self::from_parts(key, iv))
    }

    #[cfg(test)]
    pub(crate) fn with_iv(key: &EncryptionKey, iv: Iv) -> Self {
        Self::from_parts(key, iv)
    }

    fn from_parts(key: &EncryptionKey, iv: Iv) -> Self {
        CipherSession {
            core: GcmCore::new(key, &iv),
            iv,
        }
    }

    pub fn iv(&self) -> &Iv {
        &self.iv
    }

    /// Bytes of ciphertext produced so far.
    pub fn processed_len(&self) -> u64 {
        self.core.ciphertext_len
    }

    /// Encrypts `buf` in place.
    pub fn update_in_place(&mut self, buf: &mut [u8]) -> Result<()> {
        if !self.core.reserve(buf.len()) || !self.core.apply_keystream(buf) {
            return Err(BackupError::encryption(
                "plaintext exceeds the AES-GCM single-message limit",
                std::io::Error::other("message too long"),
            ));
        }
        self.core.absorb(buf);
        Ok(())
    }

    pub fn update(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        let mut out = chunk.to_vec();
        self.update_in_place(&mut out)?;
        Ok(out)
    }

    /// Consumes the session and returns the tag over everything passed to `update`.
    pub fn finalize(self) -> Tag {
        self.core.finish()
    }
}

/// Mirror of [`CipherSession`]. Plaintext it yields is untrusted until `verify` returns `Ok`.
pub struct DecipherSession {
    core: GcmCore,
}

impl DecipherSession {
    pub fn new(key: &EncryptionKey, iv: &Iv) -> Self {
        DecipherSession {
            core: GcmCore::new(key, iv),
        }
    }

    /// Decrypts `buf` in place.
    pub fn update_in_place(&mut self, buf: &mut [u8]) -> Result<()> {
        if !self.core.reserve(buf.len()) {
            return Err(BackupError::Integrity(
                "ciphertext exceeds the AES-GCM single-message limit".to_string(),
            ));
        }
        self.core.absorb(buf);
        if !self.core.apply_keystream(buf) {
            return Err(BackupError::Integrity(
                "ciphertext exceeds the AES-GCM keystream".to_string(),
            ));
        }
        Ok(())
    }

    /// Constant-time comparison against the stored tag.
    pub fn verify(self, expected: &Tag) -> Result<()> {
        let computed = self.core.finish();
        if bool::from(computed[..].ct_eq(&expected[..])) {
            Ok(())
        } else {
            Err(BackupError::Integrity(
                "authentication tag does not match; artifact is corrupt, truncated or was sealed with a different key"
                    .to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::aead::Aead;
    use aes_gcm::aead::consts::U16;
    use aes_gcm::{AesGcm, Nonce};
    use std::collections::HashSet;

    type ReferenceGcm = AesGcm<Aes256, U16>;

    fn test_key() -> EncryptionKey {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(7).wrapping_add(3);
        }
        EncryptionKey::from_bytes(bytes)
    }

    fn reference_seal(key: &EncryptionKey, iv: &Iv, plaintext: &[u8]) -> Vec<u8> {
        let cipher = <ReferenceGcm as aes_gcm::KeyInit>::new(GenericArray::from_slice(key.as_bytes()));
        cipher
            .encrypt(Nonce::<U16>::from_slice(iv), plaintext)
            .expect("reference encryption")
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_matches_reference_aes_gcm_with_16_byte_iv() -> anyhow::Result<()> {
        let key = test_key();
        let iv: Iv = *b"0123456789abcdef";
        for len in [0usize, 1, 15, 16, 17, 31, 32, 33, 1000, 4096 + 5] {
            let plaintext = pattern(len);
            let mut session = CipherSession::with_iv(&key, iv);
            let mut output = session.update(&plaintext)?;
            output.extend_from_slice(&session.finalize());
            assert_eq!(output, reference_seal(&key, &iv, &plaintext), "length {}", len);
        }
        Ok(())
    }

    #[test]
    fn test_chunking_does_not_change_output() -> anyhow::Result<()> {
        let key = test_key();
        let iv = [0x42u8; IV_LEN];
        let plaintext = pattern(777);

        let mut whole = CipherSession::with_iv(&key, iv);
        let expected = whole.update(&plaintext)?;
        let expected_tag = whole.finalize();

        for split in [1usize, 3, 16, 17, 100, 500] {
            let mut session = CipherSession::with_iv(&key, iv);
            let mut out = Vec::new();
            for chunk in plaintext.chunks(split) {
                out.extend(session.update(chunk)?);
            }
            assert_eq!(out, expected, "chunk size {}", split);
            assert_eq!(session.finalize(), expected_tag, "chunk size {}", split);
        }
        Ok(())
    }

    #[test]
    fn test_decipher_round_trip_and_verify() -> anyhow::Result<()> {
        let key = test_key();
        let plaintext = pattern(300);
        let mut session = CipherSession::new(&key)?;
        let iv = *session.iv();
        let mut buf = session.update(&plaintext)?;
        let tag = session.finalize();

        let mut decipher = DecipherSession::new(&key, &iv);
        for chunk in buf.chunks_mut(7) {
            decipher.update_in_place(chunk)?;
        }
        decipher.verify(&tag)?;
        assert_eq!(buf, plaintext);
        Ok(())
    }

    #[test]
    fn test_wrong_tag_is_integrity_error() -> anyhow::Result<()> {
        let key = test_key();
        let mut session = CipherSession::new(&key)?;
        let iv = *session.iv();
        let mut buf = session.update(b"mongodump archive bytes")?;
        let mut tag = session.finalize();
        tag[0] ^= 0x01;

        let mut decipher = DecipherSession::new(&key, &iv);
        decipher.update_in_place(&mut buf)?;
        let err = decipher.verify(&tag).unwrap_err();
        assert_eq!(err.kind(), "IntegrityError");
        Ok(())
    }

    #[test]
    fn test_wrong_key_fails_verification() -> anyhow::Result<()> {
        let key = test_key();
        let mut session = CipherSession::new(&key)?;
        let iv = *session.iv();
        let mut buf = session.update(b"payload")?;
        let tag = session.finalize();

        let other = EncryptionKey::from_bytes([9u8; 32]);
        let mut decipher = DecipherSession::new(&other, &iv);
        decipher.update_in_place(&mut buf)?;
        assert!(matches!(decipher.verify(&tag), Err(BackupError::Integrity(_))));
        Ok(())
    }

    #[test]
    fn test_fresh_iv_per_session() -> anyhow::Result<()> {
        let key = test_key();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let session = CipherSession::new(&key)?;
            assert!(seen.insert(*session.iv()), "IV repeated");
        }
        Ok(())
    }

    #[test]
    fn test_inc32_wraps_low_word_only() {
        let mut block = [0xAAu8; 16];
        block[12..].copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        inc32(&mut block);
        assert_eq!(&block[..12], &[0xAAu8; 12]);
        assert_eq!(&block[12..], &[0, 0, 0, 0]);

        let mut block = [0u8; 16];
        block[15] = 0x01;
        inc32(&mut block);
        assert_eq!(block[15], 0x02);
    }

    #[test]
    fn test_empty_message_has_tag_only() -> anyhow::Result<()> {
        let key = test_key();
        let iv = [7u8; IV_LEN];
        let session = CipherSession::with_iv(&key, iv);
        let tag = session.finalize();
        assert_eq!(tag.to_vec(), reference_seal(&key, &iv, &[]));
        Ok(())
    }
}
