// src/attachments/mod.rs

//! Attachment lifecycle: blob storage behind a trait, signed download URLs,
//! SSRF-guarded URL import, orphan TTLs and eviction hand-off.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use tracing::warn;
use uuid::Uuid;

use crate::access::{AccessControl, Principal};
use crate::config::AttachmentsConfig;
use crate::error::{CoreError, CoreResult};
use crate::model::{AccessLevel, Attachment, AttachmentStatus};
use crate::store::Datastore;

pub mod fs;
pub mod import;
pub mod signing;

pub use fs::FsAttachmentStore;
pub use import::UrlImporter;
pub use signing::UrlSigner;

pub type ByteStream = Pin<Box<dyn Stream<Item = CoreResult<Bytes>> + Send>>;

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub storage_key: String,
    pub size: i64,
    pub sha256: String,
}

/// Blob storage by opaque storage key. Direct signed-URL download is an
/// optional capability.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    async fn put(&self, data: ByteStream) -> CoreResult<StoredBlob>;

    async fn get(&self, storage_key: &str) -> CoreResult<ByteStream>;

    async fn delete(&self, storage_key: &str) -> CoreResult<()>;

    /// None when the store cannot sign URLs.
    fn sign_download_url(
        &self,
        storage_key: &str,
        ttl: Option<Duration>,
    ) -> CoreResult<Option<String>> {
        let _ = (storage_key, ttl);
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    pub content_type: String,
}

/// Attachment operations over the datastore + blob store pair.
pub struct AttachmentService {
    store: Arc<dyn Datastore>,
    blobs: Arc<dyn AttachmentStore>,
    access: Arc<AccessControl>,
    importer: UrlImporter,
    config: AttachmentsConfig,
}

impl AttachmentService {
    pub fn new(
        store: Arc<dyn Datastore>,
        blobs: Arc<dyn AttachmentStore>,
        access: Arc<AccessControl>,
        config: AttachmentsConfig,
    ) -> Self {
        let importer = UrlImporter::new(config.allow_private_source_urls);
        Self {
            store,
            blobs,
            access,
            importer,
            config,
        }
    }

    /// Direct upload. The record starts unlinked with an orphan TTL and is
    /// bound to an entry when an append references it.
    pub async fn upload(
        &self,
        principal: &Principal,
        request: UploadRequest,
        data: ByteStream,
    ) -> CoreResult<Attachment> {
        let user_id = principal.require_user()?;
        let blob = self.blobs.put(data).await?;
        let now = Utc::now();

        let attachment = Attachment {
            id: Uuid::new_v4(),
            storage_key: blob.storage_key,
            filename: request.filename,
            content_type: request.content_type,
            size: blob.size,
            sha256: blob.sha256,
            user_id: user_id.to_string(),
            entry_id: None,
            expires_at: Some(now + self.config.orphan_ttl),
            created_at: now,
            deleted_at: None,
            status: AttachmentStatus::Ready,
            source_url: None,
        };
        self.store.create_attachment(&attachment).await?;
        Ok(attachment)
    }

    /// Import from an external URL. Target refusal (SSRF guard, bad scheme)
    /// fails the call; a fetch error after the record exists marks it
    /// FAILED without failing the create.
    pub async fn import_from_url(
        &self,
        principal: &Principal,
        request: UploadRequest,
        source_url: &str,
    ) -> CoreResult<Attachment> {
        let user_id = principal.require_user()?;
        let url = self.importer.validate(source_url).await?;
        let now = Utc::now();

        let pending = Attachment {
            id: Uuid::new_v4(),
            storage_key: String::new(),
            filename: request.filename,
            content_type: request.content_type,
            size: 0,
            sha256: String::new(),
            user_id: user_id.to_string(),
            entry_id: None,
            expires_at: Some(now + self.config.orphan_ttl),
            created_at: now,
            deleted_at: None,
            status: AttachmentStatus::Pending,
            source_url: Some(source_url.to_string()),
        };
        self.store.create_attachment(&pending).await?;

        let fetched = match self.importer.fetch(&url).await {
            Ok(stream) => self.blobs.put(stream).await,
            Err(e) => Err(e),
        };
        match fetched {
            Ok(blob) => {
                self.store
                    .finalize_attachment(
                        pending.id,
                        AttachmentStatus::Ready,
                        Some(&blob.storage_key),
                        Some(blob.size),
                        Some(&blob.sha256),
                    )
                    .await?;
            }
            Err(e) => {
                warn!("attachment import from {} failed: {}", source_url, e);
                self.store
                    .finalize_attachment(pending.id, AttachmentStatus::Failed, None, None, None)
                    .await?;
            }
        }
        self.store.get_attachment(pending.id).await
    }

    pub async fn get(&self, principal: &Principal, id: Uuid) -> CoreResult<Attachment> {
        let attachment = self.store.get_attachment(id).await?;
        self.authorize_read(principal, &attachment).await?;
        Ok(attachment)
    }

    pub async fn download(
        &self,
        principal: &Principal,
        id: Uuid,
    ) -> CoreResult<(Attachment, ByteStream)> {
        let attachment = self.get(principal, id).await?;
        if attachment.status != AttachmentStatus::Ready {
            return Err(CoreError::invalid_argument(format!(
                "attachment {} is {}",
                id,
                attachment.status.as_str()
            )));
        }
        let stream = self.blobs.get(&attachment.storage_key).await?;
        Ok((attachment, stream))
    }

    /// Signed direct-download URL, when the blob store supports it.
    pub async fn sign_download_url(
        &self,
        principal: &Principal,
        id: Uuid,
    ) -> CoreResult<Option<String>> {
        let attachment = self.get(principal, id).await?;
        if attachment.status != AttachmentStatus::Ready {
            return Ok(None);
        }
        self.blobs
            .sign_download_url(&attachment.storage_key, Some(self.config.signed_url_ttl))
    }

    pub async fn delete(&self, principal: &Principal, id: Uuid) -> CoreResult<()> {
        let attachment = self.store.get_attachment(id).await?;
        let user_id = principal.require_user()?;
        if attachment.user_id != user_id {
            // Owners of the containing group may also remove it.
            match attachment.entry_id {
                Some(entry_id) => {
                    let entry = self.store.get_entry(entry_id).await?;
                    self.access
                        .ensure_access(principal, entry.conversation_group_id, AccessLevel::Manager)
                        .await?;
                }
                None => {
                    return Err(CoreError::not_found(format!("attachment {id}")));
                }
            }
        }
        self.store.soft_delete_attachment(id).await
    }

    /// Uploader always reads; anyone with READER on the linked entry's
    /// group reads too. Everything else is NOT_FOUND, not FORBIDDEN.
    async fn authorize_read(
        &self,
        principal: &Principal,
        attachment: &Attachment,
    ) -> CoreResult<()> {
        if let Some(user_id) = principal.user_id.as_deref() {
            if attachment.user_id == user_id {
                return Ok(());
            }
        }
        if let Some(entry_id) = attachment.entry_id {
            let entry = self.store.get_entry(entry_id).await?;
            return self
                .access
                .ensure_access(principal, entry.conversation_group_id, AccessLevel::Reader)
                .await
                .map(|_| ());
        }
        Err(CoreError::not_found(format!("attachment {}", attachment.id)))
    }
}
