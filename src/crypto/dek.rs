// src/crypto/dek.rs

//! KMS-wrapped data-encryption keys persisted in the datastore.
//!
//! The DEK record for a provider holds an ordered list of wrapped keys:
//! index 0 is the primary, the rest are legacy. Bootstrap inserts the first
//! wrapped DEK race-safely; rotation prepends a fresh one under an
//! optimistic lock on the record revision.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::model::{DekRecord, WrappedDek};
use crate::store::Datastore;

use super::aead::AeadCipher;
use super::CipherProvider;

/// Key-wrapping service. Production deployments back this with an external
/// KMS; `LocalKms` wraps under a configured master key.
pub trait Kms: Send + Sync {
    fn wrap(&self, dek: &[u8]) -> CoreResult<Vec<u8>>;
    fn unwrap(&self, wrapped: &[u8]) -> CoreResult<Vec<u8>>;
}

/// Wraps DEKs with AES-256-GCM under a locally held master key.
pub struct LocalKms {
    cipher: AeadCipher,
}

impl LocalKms {
    pub fn new(master_key: &[u8]) -> CoreResult<Self> {
        Ok(Self {
            cipher: AeadCipher::new("kms.", master_key)?,
        })
    }

    pub fn from_base64(master_key_b64: &str) -> CoreResult<Self> {
        let key = BASE64
            .decode(master_key_b64)
            .map_err(|e| CoreError::invalid_argument(format!("malformed KMS master key: {e}")))?;
        Self::new(&key)
    }
}

impl Kms for LocalKms {
    fn wrap(&self, dek: &[u8]) -> CoreResult<Vec<u8>> {
        self.cipher.seal(dek)
    }

    fn unwrap(&self, wrapped: &[u8]) -> CoreResult<Vec<u8>> {
        self.cipher.open(wrapped)
    }
}

const ROTATION_RETRIES: usize = 5;

/// Loads, bootstraps, and rotates the persisted DEK record for one provider
/// name, and turns its keys into cipher providers.
pub struct DekManager {
    store: Arc<dyn Datastore>,
    kms: Arc<dyn Kms>,
    provider_name: String,
}

impl DekManager {
    pub fn new(store: Arc<dyn Datastore>, kms: Arc<dyn Kms>, provider_name: impl Into<String>) -> Self {
        Self {
            store,
            kms,
            provider_name: provider_name.into(),
        }
    }

    /// Load the record, creating it with a fresh wrapped DEK when absent,
    /// and build one cipher provider per stored key (primary first).
    pub async fn load_providers(&self) -> CoreResult<Vec<Arc<dyn CipherProvider>>> {
        let record = match self.store.get_dek_record(&self.provider_name).await? {
            Some(record) => record,
            None => self.bootstrap().await?,
        };
        self.providers_from_record(&record)
    }

    async fn bootstrap(&self) -> CoreResult<DekRecord> {
        let dek = AeadCipher::generate_key()?;
        let wrapped = self.kms.wrap(&dek)?;
        let candidate = DekRecord {
            provider: self.provider_name.clone(),
            wrapped_deks: vec![WrappedDek {
                key_id: 1,
                wrapped: BASE64.encode(wrapped),
            }],
            revision: 1,
        };
        // Insert-if-absent: a racing bootstrap on another node wins cleanly
        // and we adopt whatever got stored.
        let stored = self.store.insert_dek_record_if_absent(&candidate).await?;
        info!(
            provider = %self.provider_name,
            revision = stored.revision,
            "DEK record ready"
        );
        Ok(stored)
    }

    /// Generate a new DEK, wrap it, and prepend it as the new primary.
    /// Retries on revision races; the final miss surfaces as
    /// PRECONDITION_FAILED so the caller can decide to retry later.
    pub async fn rotate(&self) -> CoreResult<DekRecord> {
        for attempt in 0..ROTATION_RETRIES {
            let current = self
                .store
                .get_dek_record(&self.provider_name)
                .await?
                .ok_or_else(|| {
                    CoreError::internal(format!(
                        "DEK record missing for provider {}",
                        self.provider_name
                    ))
                })?;

            let dek = AeadCipher::generate_key()?;
            let wrapped = self.kms.wrap(&dek)?;
            let next_key_id = current
                .wrapped_deks
                .iter()
                .map(|w| w.key_id)
                .max()
                .unwrap_or(0)
                + 1;

            let mut wrapped_deks = vec![WrappedDek {
                key_id: next_key_id,
                wrapped: BASE64.encode(wrapped),
            }];
            wrapped_deks.extend(current.wrapped_deks.iter().cloned());

            let next = DekRecord {
                provider: current.provider.clone(),
                wrapped_deks,
                revision: current.revision + 1,
            };

            if self.store.update_dek_record(&next, current.revision).await? {
                info!(
                    provider = %self.provider_name,
                    key_id = next_key_id,
                    revision = next.revision,
                    "rotated DEK"
                );
                return Ok(next);
            }
            debug!(
                provider = %self.provider_name,
                attempt,
                "DEK rotation lost the revision race, retrying"
            );
        }
        Err(CoreError::PreconditionFailed(format!(
            "DEK rotation for {} kept losing the revision race",
            self.provider_name
        )))
    }

    fn providers_from_record(
        &self,
        record: &DekRecord,
    ) -> CoreResult<Vec<Arc<dyn CipherProvider>>> {
        let mut providers: Vec<Arc<dyn CipherProvider>> = Vec::with_capacity(record.wrapped_deks.len());
        for wrapped in &record.wrapped_deks {
            let sealed = BASE64.decode(&wrapped.wrapped).map_err(|e| {
                CoreError::internal(format!("malformed wrapped DEK {}: {e}", wrapped.key_id))
            })?;
            let dek = self.kms.unwrap(&sealed)?;
            providers.push(Arc::new(AeadCipher::new(
                format!("d{}.", wrapped.key_id),
                &dek,
            )?));
        }
        Ok(providers)
    }
}
