// src/state.rs

//! Configuration-driven backend registry. Inspects the config once at
//! startup, binds the concrete adapters behind their interfaces, and wires
//! the engines. No global mutable singletons; everything hangs off this
//! value.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::access::AccessControl;
use crate::attachments::{AttachmentService, AttachmentStore, FsAttachmentStore, UrlSigner};
use crate::cache::{CacheAdapter, MemoryCache, NoopCache};
use crate::config::{
    CacheKind, Config, DatastoreKind, EmbeddingProviderKind, VectorKind,
};
use crate::conversation::ConversationEngine;
use crate::crypto::{CipherProvider, DekManager, EncryptionService, LocalKms};
use crate::crypto::aead::AeadCipher;
use crate::embedding::{DisabledEmbeddings, EmbeddingProvider, HostedEmbeddings};
use crate::error::{CoreError, CoreResult};
use crate::resumer::ResponseResumer;
use crate::search::SearchEngine;
use crate::sharing::SharingService;
use crate::store::codec::EntryCodec;
use crate::store::document::DocumentDatastore;
use crate::store::sqlite::SqliteDatastore;
use crate::store::Datastore;
use crate::tasks::TaskProcessor;
use crate::vector::{ColocatedVectorIndex, QdrantVectorIndex, VectorIndex};

/// All bound adapters and engines for one process.
pub struct ServiceState {
    pub config: Config,
    pub store: Arc<dyn Datastore>,
    pub cache: Arc<dyn CacheAdapter>,
    pub vector: Option<Arc<dyn VectorIndex>>,
    pub embedding: Arc<dyn EmbeddingProvider>,
    pub encryption: Arc<EncryptionService>,
    pub blobs: Arc<dyn AttachmentStore>,
    pub access: Arc<AccessControl>,
    pub conversations: Arc<ConversationEngine>,
    pub sharing: Arc<SharingService>,
    pub attachments: Arc<AttachmentService>,
    pub search: Arc<SearchEngine>,
    pub resumer: Arc<ResponseResumer>,
    pub tasks: Arc<TaskProcessor>,
}

impl ServiceState {
    pub async fn build(config: Config) -> CoreResult<Self> {
        config.validate()?;

        // The codec binds its encryption service after the datastore is up:
        // DEK-backed providers read their key material from the datastore.
        let codec = EntryCodec::deferred();
        let mut sqlite: Option<Arc<SqliteDatastore>> = None;
        let store: Arc<dyn Datastore> = match config.datastore.kind {
            DatastoreKind::Sqlite => {
                info!("using relational datastore at {}", config.datastore.url);
                let adapter =
                    Arc::new(SqliteDatastore::connect(&config.datastore, codec.clone()).await?);
                sqlite = Some(adapter.clone());
                adapter
            }
            DatastoreKind::Document => {
                info!("using in-process document datastore");
                Arc::new(DocumentDatastore::new(codec.clone()))
            }
        };

        let encryption = Arc::new(
            build_encryption(&config, store.clone()).await?,
        );
        codec.bind(encryption.clone())?;

        let embedding: Arc<dyn EmbeddingProvider> = match config.embedding.provider {
            EmbeddingProviderKind::None => Arc::new(DisabledEmbeddings),
            EmbeddingProviderKind::Hosted => {
                info!(
                    "using hosted embeddings model {} ({} dims)",
                    config.embedding.model, config.embedding.dimensions
                );
                Arc::new(HostedEmbeddings::new(&config.embedding))
            }
        };

        let vector: Option<Arc<dyn VectorIndex>> = match config.vector.kind {
            VectorKind::None => None,
            VectorKind::Colocated => {
                let sqlite = sqlite.as_ref().ok_or_else(|| {
                    CoreError::invalid_argument(
                        "colocated vector store requires the relational datastore",
                    )
                })?;
                Some(Arc::new(ColocatedVectorIndex::new(sqlite.pool().clone())))
            }
            VectorKind::External => {
                info!("using external vector store at {}", config.vector.url);
                Some(Arc::new(QdrantVectorIndex::new(&config.vector)?))
            }
        };
        if let Some(vector) = &vector {
            // Dimension check happens here, before any traffic.
            vector.ensure_ready(embedding.dimensions()).await?;
        }

        let cache: Arc<dyn CacheAdapter> = match config.cache.kind {
            CacheKind::None => Arc::new(NoopCache),
            CacheKind::Memory => Arc::new(MemoryCache::new(config.cache.clone())),
        };

        let access = Arc::new(AccessControl::new(store.clone()));

        let signer = if config.attachments.url_signing_key.is_empty() {
            None
        } else {
            Some(UrlSigner::new(config.attachments.url_signing_key.as_bytes()))
        };
        let blobs: Arc<dyn AttachmentStore> = Arc::new(FsAttachmentStore::new(
            &config.attachments.root,
            encryption.clone(),
            signer,
            config.attachments.signed_url_ttl,
        ));

        let conversations = Arc::new(ConversationEngine::new(
            store.clone(),
            access.clone(),
            cache.clone(),
            vector.clone(),
            embedding.clone(),
        ));
        let sharing = Arc::new(SharingService::new(store.clone(), access.clone()));
        let attachments = Arc::new(AttachmentService::new(
            store.clone(),
            blobs.clone(),
            access.clone(),
            config.attachments.clone(),
        ));
        let search = Arc::new(SearchEngine::new(
            store.clone(),
            access.clone(),
            vector.clone(),
            embedding.clone(),
            config.vector.external_max_groups,
        ));
        let resumer = Arc::new(ResponseResumer::new(cache.clone(), &config.resumer));
        let tasks = Arc::new(TaskProcessor::new(
            store.clone(),
            vector.clone(),
            embedding.clone(),
            blobs.clone(),
            config.tasks.clone(),
            config.attachments.clone(),
        ));

        Ok(Self {
            config,
            store,
            cache,
            vector,
            embedding,
            encryption,
            blobs,
            access,
            conversations,
            sharing,
            attachments,
            search,
            resumer,
            tasks,
        })
    }

    /// Start the background task processor loop.
    pub fn spawn_task_processor(&self) -> JoinHandle<()> {
        self.tasks.clone().spawn()
    }
}

/// Assemble the ordered provider list from config: the first provider is
/// primary, the rest decrypt-only. A `dek:` spec expands to one provider
/// per stored wrapped key, newest first.
async fn build_encryption(
    config: &Config,
    store: Arc<dyn Datastore>,
) -> CoreResult<EncryptionService> {
    let mut providers: Vec<Arc<dyn CipherProvider>> = Vec::new();

    for provider_config in &config.encryption.providers {
        let spec = provider_config.spec.as_str();
        match spec.split_once(':') {
            Some(("aead", rest)) => {
                let (tag, key_b64) = rest.split_once(':').ok_or_else(|| {
                    CoreError::invalid_argument(format!(
                        "aead provider spec must be aead:<tag>:<base64-key>, got {spec:?}"
                    ))
                })?;
                use base64::Engine as _;
                let key = base64::engine::general_purpose::STANDARD
                    .decode(key_b64)
                    .map_err(|e| {
                        CoreError::invalid_argument(format!("malformed aead key: {e}"))
                    })?;
                providers.push(Arc::new(AeadCipher::new(format!("{tag}."), &key)?));
            }
            Some(("dek", name)) => {
                let master_key = config.encryption.kms_master_key.as_deref().ok_or_else(
                    || {
                        CoreError::invalid_argument(
                            "dek providers require MEMSVC_KMS_MASTER_KEY",
                        )
                    },
                )?;
                let kms = Arc::new(LocalKms::from_base64(master_key)?);
                let manager = DekManager::new(store.clone(), kms, name);
                providers.extend(manager.load_providers().await?);
            }
            _ => {
                return Err(CoreError::invalid_argument(format!(
                    "unknown encryption provider spec {spec:?}"
                )));
            }
        }
    }

    if providers.is_empty() {
        return Ok(EncryptionService::disabled());
    }
    Ok(EncryptionService::new(
        providers,
        config.encryption.db_disabled,
        config.encryption.attachments_disabled,
    ))
}
