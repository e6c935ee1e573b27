// src/config/mod.rs
// Central configuration for the memory service core

pub mod helpers;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use helpers::{env_bool, env_opt, env_or, env_parsed, env_secs};

/// Which primary datastore backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatastoreKind {
    /// Relational adapter (SQLite via sqlx).
    Sqlite,
    /// Document adapter (in-process document collections).
    Document,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatastoreConfig {
    pub kind: DatastoreKind,
    /// SQLite database path; ignored by the document adapter.
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl DatastoreConfig {
    pub fn from_env() -> Self {
        let kind = match env_or("MEMSVC_DATASTORE_TYPE", "sqlite").as_str() {
            "document" => DatastoreKind::Document,
            _ => DatastoreKind::Sqlite,
        };
        Self {
            kind,
            url: env_or("MEMSVC_DATASTORE_URL", "memory-service.db"),
            max_connections: env_parsed("MEMSVC_DATASTORE_MAX_CONNECTIONS", 8),
            busy_timeout: env_secs("MEMSVC_DATASTORE_BUSY_TIMEOUT_SECS", 5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    None,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub kind: CacheKind,
    /// TTL of the hot latest-epoch cache.
    pub epoch_ttl: Duration,
    /// How long a resumer record survives after `complete()`.
    pub record_ttl: Duration,
    /// Upper bound on the lifetime of an in-progress resumer record.
    pub record_max_lifetime: Duration,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let kind = match env_or("MEMSVC_CACHE_TYPE", "memory").as_str() {
            "none" => CacheKind::None,
            _ => CacheKind::Memory,
        };
        Self {
            kind,
            epoch_ttl: env_secs("MEMSVC_CACHE_EPOCH_TTL_SECS", 30),
            record_ttl: env_secs("MEMSVC_RESUMER_RECORD_TTL_SECS", 120),
            record_max_lifetime: env_secs("MEMSVC_RESUMER_RECORD_MAX_LIFETIME_SECS", 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorKind {
    None,
    /// Embeddings live beside memberships; queries filter by JOIN.
    Colocated,
    /// Embeddings live in an external vector store (Qdrant); queries carry
    /// an explicit group-id filter bounded by `external_max_groups`.
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    pub kind: VectorKind,
    pub url: String,
    pub collection: String,
    /// For the external mode: the user's top-N recently updated groups are
    /// searchable; entries outside that set are not.
    pub external_max_groups: usize,
}

impl VectorConfig {
    pub fn from_env() -> Self {
        let kind = match env_or("MEMSVC_VECTOR_TYPE", "none").as_str() {
            "colocated" => VectorKind::Colocated,
            "external" => VectorKind::External,
            _ => VectorKind::None,
        };
        Self {
            kind,
            url: env_or("MEMSVC_VECTOR_URL", "http://localhost:6334"),
            collection: env_or("MEMSVC_VECTOR_COLLECTION", "memory_service_entries"),
            external_max_groups: env_parsed("MEMSVC_VECTOR_EXTERNAL_MAX_GROUPS", 100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    None,
    /// OpenAI-compatible hosted embeddings endpoint.
    Hosted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub dimensions: usize,
}

impl EmbeddingConfig {
    pub fn from_env() -> CoreResult<Self> {
        let provider = match env_or("MEMSVC_EMBEDDING_PROVIDER", "none").as_str() {
            "hosted" => EmbeddingProviderKind::Hosted,
            "none" => EmbeddingProviderKind::None,
            other => {
                // in-process models are not part of this build
                return Err(CoreError::invalid_argument(format!(
                    "unsupported embedding provider {other:?}; supported: hosted, none"
                )));
            }
        };
        Ok(Self {
            provider,
            base_url: env_or("MEMSVC_EMBEDDING_BASE_URL", "https://api.openai.com/v1"),
            api_key: env_or("MEMSVC_EMBEDDING_API_KEY", ""),
            model: env_or("MEMSVC_EMBEDDING_MODEL", "text-embedding-3-small"),
            dimensions: env_parsed("MEMSVC_EMBEDDING_DIMENSIONS", 1536),
        })
    }
}

/// One entry in the ordered encryption provider list. The first provider is
/// primary (used for new ciphertexts); the rest are decrypt-only legacy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionProviderConfig {
    /// `aead:<tag>:<base64-key>` for a static AEAD key, `dek:<name>` for a
    /// datastore-persisted DEK wrapped by the KMS master key.
    pub spec: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub providers: Vec<EncryptionProviderConfig>,
    pub db_disabled: bool,
    pub attachments_disabled: bool,
    /// Base64 master key for the local KMS used to wrap DEKs.
    pub kms_master_key: Option<String>,
}

impl EncryptionConfig {
    pub fn from_env() -> Self {
        let providers = env_opt("MEMSVC_ENCRYPTION_PROVIDERS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| EncryptionProviderConfig {
                        spec: s.trim().to_string(),
                    })
                    .filter(|p| !p.spec.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Self {
            providers,
            db_disabled: env_bool("MEMSVC_ENCRYPTION_DB_DISABLED", false),
            attachments_disabled: env_bool("MEMSVC_ENCRYPTION_ATTACHMENTS_DISABLED", false),
            kms_master_key: env_opt("MEMSVC_KMS_MASTER_KEY"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    pub interval: Duration,
    pub batch_size: usize,
    /// A claim older than this is considered stale and re-claimable.
    pub stale_claim_timeout: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Per-task wall-clock budget.
    pub task_timeout: Duration,
    /// Cadence of the recurring attachment-eviction singleton.
    pub eviction_interval: Duration,
}

impl TasksConfig {
    pub fn from_env() -> Self {
        Self {
            interval: env_secs("MEMSVC_TASKS_INTERVAL_SECS", 5),
            batch_size: env_parsed("MEMSVC_TASKS_BATCH_SIZE", 10),
            stale_claim_timeout: env_secs("MEMSVC_TASKS_STALE_CLAIM_TIMEOUT_SECS", 300),
            base_backoff: env_secs("MEMSVC_TASKS_BASE_BACKOFF_SECS", 5),
            max_backoff: env_secs("MEMSVC_TASKS_MAX_BACKOFF_SECS", 3600),
            task_timeout: env_secs("MEMSVC_TASKS_TASK_TIMEOUT_SECS", 60),
            eviction_interval: env_secs("MEMSVC_TASKS_EVICTION_INTERVAL_SECS", 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentsConfig {
    /// Root directory of the filesystem attachment store.
    pub root: String,
    /// SSRF toggle for import-from-URL.
    pub allow_private_source_urls: bool,
    /// Unlinked attachments older than this are evictable.
    pub orphan_ttl: Duration,
    /// Grace between soft delete and hard delete.
    pub tombstone_retention: Duration,
    /// HMAC key for signed download URLs.
    pub url_signing_key: String,
    pub signed_url_ttl: Duration,
}

impl AttachmentsConfig {
    pub fn from_env() -> Self {
        Self {
            root: env_or("MEMSVC_ATTACHMENTS_ROOT", "attachments"),
            allow_private_source_urls: env_bool("MEMSVC_ATTACHMENTS_ALLOW_PRIVATE_SOURCE_URLS", false),
            orphan_ttl: env_secs("MEMSVC_ATTACHMENTS_ORPHAN_TTL_SECS", 86_400),
            tombstone_retention: env_secs("MEMSVC_ATTACHMENTS_TOMBSTONE_RETENTION_SECS", 604_800),
            url_signing_key: env_or("MEMSVC_ATTACHMENTS_URL_SIGNING_KEY", ""),
            signed_url_ttl: env_secs("MEMSVC_ATTACHMENTS_SIGNED_URL_TTL_SECS", 900),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumerConfig {
    pub enabled: bool,
    /// Network identity this node advertises in resumer records, so peer
    /// replicas can redirect clients here. Must stay wire-stable.
    pub advertised_host: String,
    pub advertised_port: u16,
}

impl ResumerConfig {
    pub fn from_env() -> Self {
        Self {
            enabled: env_bool("MEMSVC_RESUMER_ENABLED", true),
            advertised_host: env_or("MEMSVC_RESUMER_ADVERTISED_HOST", "127.0.0.1"),
            advertised_port: env_parsed("MEMSVC_RESUMER_ADVERTISED_PORT", 8080),
        }
    }
}

/// Main configuration structure - composes all domain configs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub datastore: DatastoreConfig,
    pub cache: CacheConfig,
    pub vector: VectorConfig,
    pub embedding: EmbeddingConfig,
    pub encryption: EncryptionConfig,
    pub tasks: TasksConfig,
    pub attachments: AttachmentsConfig,
    pub resumer: ResumerConfig,
}

impl Config {
    pub fn from_env() -> CoreResult<Self> {
        // Don't panic if .env doesn't exist (for production)
        dotenvy::dotenv().ok();

        let config = Self {
            datastore: DatastoreConfig::from_env(),
            cache: CacheConfig::from_env(),
            vector: VectorConfig::from_env(),
            embedding: EmbeddingConfig::from_env()?,
            encryption: EncryptionConfig::from_env(),
            tasks: TasksConfig::from_env(),
            attachments: AttachmentsConfig::from_env(),
            resumer: ResumerConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on inconsistent settings instead of degrading at runtime.
    pub fn validate(&self) -> CoreResult<()> {
        if self.vector.kind == VectorKind::External && self.vector.url.is_empty() {
            return Err(CoreError::invalid_argument(
                "external vector store requires MEMSVC_VECTOR_URL",
            ));
        }
        if self.vector.kind == VectorKind::Colocated
            && self.datastore.kind != DatastoreKind::Sqlite
        {
            return Err(CoreError::invalid_argument(
                "colocated vector store requires the relational datastore",
            ));
        }
        if self.vector.kind != VectorKind::None
            && self.embedding.provider == EmbeddingProviderKind::None
        {
            return Err(CoreError::invalid_argument(
                "vector indexing requires an embedding provider",
            ));
        }
        if self.embedding.provider == EmbeddingProviderKind::Hosted
            && self.embedding.api_key.is_empty()
        {
            return Err(CoreError::invalid_argument(
                "hosted embeddings require MEMSVC_EMBEDDING_API_KEY",
            ));
        }
        if self.embedding.provider != EmbeddingProviderKind::None
            && self.embedding.dimensions == 0
        {
            return Err(CoreError::invalid_argument(
                "embedding dimensions must be positive",
            ));
        }
        if self.vector.kind == VectorKind::External && self.vector.external_max_groups == 0 {
            return Err(CoreError::invalid_argument(
                "external vector store requires a positive max-groups bound",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            datastore: DatastoreConfig {
                kind: DatastoreKind::Document,
                url: String::new(),
                max_connections: 1,
                busy_timeout: Duration::from_secs(1),
            },
            cache: CacheConfig {
                kind: CacheKind::Memory,
                epoch_ttl: Duration::from_secs(30),
                record_ttl: Duration::from_secs(120),
                record_max_lifetime: Duration::from_secs(3600),
            },
            vector: VectorConfig {
                kind: VectorKind::None,
                url: String::new(),
                collection: "c".into(),
                external_max_groups: 10,
            },
            embedding: EmbeddingConfig {
                provider: EmbeddingProviderKind::None,
                base_url: String::new(),
                api_key: String::new(),
                model: String::new(),
                dimensions: 0,
            },
            encryption: EncryptionConfig {
                providers: Vec::new(),
                db_disabled: false,
                attachments_disabled: false,
                kms_master_key: None,
            },
            tasks: TasksConfig::from_env(),
            attachments: AttachmentsConfig::from_env(),
            resumer: ResumerConfig {
                enabled: true,
                advertised_host: "127.0.0.1".into(),
                advertised_port: 8080,
            },
        }
    }

    #[test]
    fn vector_without_embedding_is_rejected() {
        let mut config = base_config();
        config.datastore.kind = DatastoreKind::Sqlite;
        config.vector.kind = VectorKind::Colocated;
        assert!(config.validate().is_err());
    }

    #[test]
    fn colocated_requires_relational_datastore() {
        let mut config = base_config();
        config.vector.kind = VectorKind::Colocated;
        config.embedding.provider = EmbeddingProviderKind::Hosted;
        config.embedding.api_key = "k".into();
        config.embedding.dimensions = 8;
        assert!(config.validate().is_err());
    }
}
