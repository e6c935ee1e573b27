// src/crypto/aead.rs
// AES-256-GCM envelope cipher

use ring::aead::{Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{CoreError, CoreResult};

use super::CipherProvider;

/// AES-256-GCM cipher with a random 96-bit nonce per sealing.
/// Payload layout: `nonce || ciphertext+tag`.
pub struct AeadCipher {
    prefix: String,
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AeadCipher {
    pub fn new(prefix: impl Into<String>, key: &[u8]) -> CoreResult<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| CoreError::invalid_argument("AEAD key must be 32 bytes"))?;
        Ok(Self {
            prefix: prefix.into(),
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Generate fresh 32-byte key material.
    pub fn generate_key() -> CoreResult<Vec<u8>> {
        let mut key = vec![0u8; 32];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| CoreError::internal("secure random unavailable"))?;
        Ok(key)
    }
}

impl CipherProvider for AeadCipher {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn seal(&self, plaintext: &[u8]) -> CoreResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CoreError::internal("secure random unavailable"))?;

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| CoreError::internal("AEAD seal failed"))?;

        let mut out = nonce_bytes.to_vec();
        out.extend(in_out);
        Ok(out)
    }

    fn open(&self, ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CoreError::internal("ciphertext too short"));
        }
        let (nonce_bytes, body) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CoreError::internal("malformed nonce"))?;

        let mut in_out = body.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CoreError::internal("AEAD open failed (wrong key or corrupt data)"))?;
        Ok(plain.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let cipher = AeadCipher::new("v1.", &[3u8; 32]).unwrap();
        let sealed = cipher.seal(b"secret").unwrap();
        assert_eq!(cipher.open(&sealed).unwrap(), b"secret");
    }

    #[test]
    fn nonces_differ_between_sealings() {
        let cipher = AeadCipher::new("v1.", &[3u8; 32]).unwrap();
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let writer = AeadCipher::new("v1.", &[3u8; 32]).unwrap();
        let reader = AeadCipher::new("v1.", &[4u8; 32]).unwrap();
        let sealed = writer.seal(b"secret").unwrap();
        assert!(reader.open(&sealed).is_err());
    }

    #[test]
    fn short_key_is_rejected() {
        assert!(AeadCipher::new("v1.", &[0u8; 16]).is_err());
    }
}
