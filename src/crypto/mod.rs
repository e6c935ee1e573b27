// src/crypto/mod.rs

//! Envelope encryption for at-rest data.
//!
//! An ordered provider list encrypts new data with the first (primary)
//! provider; the rest stay decrypt-only so old ciphertexts remain readable
//! during rotation. Every provider tags its output with a short prefix and
//! decryption dispatches on it. Payloads with no recognized prefix are
//! treated as legacy plaintext.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{CoreError, CoreResult};

pub mod aead;
pub mod dek;

pub use aead::AeadCipher;
pub use dek::{DekManager, Kms, LocalKms};

/// One envelope cipher. `seal` returns `nonce || ciphertext+tag`.
pub trait CipherProvider: Send + Sync {
    /// Tag prepended to every payload this provider writes, e.g. `"v1."`.
    fn prefix(&self) -> &str;

    fn seal(&self, plaintext: &[u8]) -> CoreResult<Vec<u8>>;

    fn open(&self, ciphertext: &[u8]) -> CoreResult<Vec<u8>>;
}

/// Field- and body-level encryption with independently togglable subsystems.
#[derive(Clone)]
pub struct EncryptionService {
    providers: Vec<Arc<dyn CipherProvider>>,
    db_disabled: bool,
    attachments_disabled: bool,
}

impl EncryptionService {
    pub fn new(
        providers: Vec<Arc<dyn CipherProvider>>,
        db_disabled: bool,
        attachments_disabled: bool,
    ) -> Self {
        Self {
            providers,
            db_disabled,
            attachments_disabled,
        }
    }

    /// No providers at all; every seal/open is a passthrough.
    pub fn disabled() -> Self {
        Self {
            providers: Vec::new(),
            db_disabled: true,
            attachments_disabled: true,
        }
    }

    pub fn db_enabled(&self) -> bool {
        !self.db_disabled && !self.providers.is_empty()
    }

    pub fn attachments_enabled(&self) -> bool {
        !self.attachments_disabled && !self.providers.is_empty()
    }

    fn primary(&self) -> CoreResult<&Arc<dyn CipherProvider>> {
        self.providers
            .first()
            .ok_or_else(|| CoreError::internal("no encryption providers configured"))
    }

    /// Encrypt a datastore field. Output is `prefix + base64(nonce || ct)`.
    pub fn seal_field(&self, plaintext: &str) -> CoreResult<String> {
        if !self.db_enabled() {
            return Ok(plaintext.to_string());
        }
        let provider = self.primary()?;
        let sealed = provider.seal(plaintext.as_bytes())?;
        Ok(format!("{}{}", provider.prefix(), BASE64.encode(sealed)))
    }

    /// Decrypt a datastore field, dispatching on the provider prefix.
    /// Unprefixed payloads are returned verbatim (pre-encryption rows).
    pub fn open_field(&self, payload: &str) -> CoreResult<String> {
        for provider in &self.providers {
            if let Some(body) = payload.strip_prefix(provider.prefix()) {
                let sealed = BASE64
                    .decode(body)
                    .map_err(|e| CoreError::internal(format!("malformed ciphertext: {e}")))?;
                let plain = provider.open(&sealed)?;
                return String::from_utf8(plain)
                    .map_err(|e| CoreError::internal(format!("non-UTF-8 plaintext: {e}")));
            }
        }
        Ok(payload.to_string())
    }

    /// Encrypt an attachment body. Output is `prefix bytes + nonce || ct`.
    pub fn seal_body(&self, data: &[u8]) -> CoreResult<Vec<u8>> {
        if !self.attachments_enabled() {
            return Ok(data.to_vec());
        }
        let provider = self.primary()?;
        let mut out = provider.prefix().as_bytes().to_vec();
        out.extend(provider.seal(data)?);
        Ok(out)
    }

    pub fn open_body(&self, data: &[u8]) -> CoreResult<Vec<u8>> {
        for provider in &self.providers {
            let prefix = provider.prefix().as_bytes();
            if data.len() > prefix.len() && &data[..prefix.len()] == prefix {
                return provider.open(&data[prefix.len()..]);
            }
        }
        Ok(data.to_vec())
    }
}
