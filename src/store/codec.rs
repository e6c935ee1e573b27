// src/store/codec.rs
// Serialization + at-rest encryption of the stored entry content payload

use std::sync::{Arc, OnceLock};

use crate::crypto::EncryptionService;
use crate::error::{CoreError, CoreResult};
use crate::model::ContentBlock;

/// Encodes a content-block list into the single stored payload string and
/// back. Both datastore adapters share one codec so at-rest encryption is
/// uniform across backends.
///
/// The encryption service binds after construction: DEK-backed providers
/// load their key material from the datastore, and the datastore needs the
/// codec first. Until `bind` is called the codec passes payloads through
/// unencrypted, which is exactly the window in which only DEK records are
/// read and written.
#[derive(Clone)]
pub struct EntryCodec {
    crypto: Arc<OnceLock<Arc<EncryptionService>>>,
}

impl EntryCodec {
    pub fn new(crypto: Arc<EncryptionService>) -> Self {
        let slot = OnceLock::new();
        let _ = slot.set(crypto);
        Self {
            crypto: Arc::new(slot),
        }
    }

    /// A codec whose encryption service is bound later by the registry.
    pub fn deferred() -> Self {
        Self {
            crypto: Arc::new(OnceLock::new()),
        }
    }

    /// Passthrough codec for tests and encryption-disabled deployments.
    pub fn plaintext() -> Self {
        Self::new(Arc::new(EncryptionService::disabled()))
    }

    pub fn bind(&self, crypto: Arc<EncryptionService>) -> CoreResult<()> {
        self.crypto
            .set(crypto)
            .map_err(|_| CoreError::internal("entry codec already bound"))
    }

    fn service(&self) -> Option<&EncryptionService> {
        self.crypto.get().map(|arc| arc.as_ref())
    }

    pub fn encode_content(&self, blocks: &[ContentBlock]) -> CoreResult<String> {
        let json = serde_json::to_string(blocks)?;
        match self.service() {
            Some(crypto) => crypto.seal_field(&json),
            None => Ok(json),
        }
    }

    pub fn decode_content(&self, payload: &str) -> CoreResult<Vec<ContentBlock>> {
        let json = match self.service() {
            Some(crypto) => crypto.open_field(payload)?,
            None => payload.to_string(),
        };
        Ok(serde_json::from_str(&json)?)
    }
}
