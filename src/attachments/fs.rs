// src/attachments/fs.rs

//! Filesystem attachment store. Bodies land under a sharded path derived
//! from the storage key; sha256 is computed over the plaintext during put.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use crate::crypto::EncryptionService;
use crate::error::{CoreError, CoreResult};

use super::signing::UrlSigner;
use super::{AttachmentStore, ByteStream, StoredBlob};

pub struct FsAttachmentStore {
    root: PathBuf,
    crypto: Arc<EncryptionService>,
    signer: Option<UrlSigner>,
    signed_url_ttl: Duration,
}

impl FsAttachmentStore {
    pub fn new(
        root: impl Into<PathBuf>,
        crypto: Arc<EncryptionService>,
        signer: Option<UrlSigner>,
        signed_url_ttl: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            crypto,
            signer,
            signed_url_ttl,
        }
    }

    fn blob_path(&self, storage_key: &str) -> CoreResult<PathBuf> {
        // Keys are our own hex uuids; anything else could escape the root.
        if storage_key.len() != 32 || !storage_key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CoreError::invalid_argument(format!(
                "malformed storage key {storage_key:?}"
            )));
        }
        Ok(self
            .root
            .join(&storage_key[0..2])
            .join(&storage_key[2..4])
            .join(storage_key))
    }
}

#[async_trait]
impl AttachmentStore for FsAttachmentStore {
    async fn put(&self, mut data: ByteStream) -> CoreResult<StoredBlob> {
        let storage_key = Uuid::new_v4().simple().to_string();
        let final_path = self.blob_path(&storage_key)?;
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_dir = self.root.join("tmp");
        tokio::fs::create_dir_all(&tmp_dir).await?;
        let tmp_path = tmp_dir.join(&storage_key);

        let mut hasher = Sha256::new();
        let mut size: i64 = 0;

        if self.crypto.attachments_enabled() {
            // Sealing needs the whole body; hash the plaintext as it arrives.
            let mut body = Vec::new();
            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                hasher.update(&chunk);
                size += chunk.len() as i64;
                body.extend_from_slice(&chunk);
            }
            let sealed = self.crypto.seal_body(&body)?;
            tokio::fs::write(&tmp_path, sealed).await?;
        } else {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            while let Some(chunk) = data.next().await {
                let chunk = chunk?;
                hasher.update(&chunk);
                size += chunk.len() as i64;
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
        }

        tokio::fs::rename(&tmp_path, &final_path).await?;
        let sha256 = hex::encode(hasher.finalize());
        debug!("stored attachment blob {} ({} bytes)", storage_key, size);

        Ok(StoredBlob {
            storage_key,
            size,
            sha256,
        })
    }

    async fn get(&self, storage_key: &str) -> CoreResult<ByteStream> {
        let path = self.blob_path(storage_key)?;

        if self.crypto.attachments_enabled() {
            let sealed = tokio::fs::read(&path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CoreError::not_found(format!("attachment blob {storage_key}"))
                } else {
                    e.into()
                }
            })?;
            let body = self.crypto.open_body(&sealed)?;
            let chunk = bytes::Bytes::from(body);
            return Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })));
        }

        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::not_found(format!("attachment blob {storage_key}"))
            } else {
                e.into()
            }
        })?;
        Ok(Box::pin(
            ReaderStream::new(file).map(|chunk| chunk.map_err(CoreError::from)),
        ))
    }

    async fn delete(&self, storage_key: &str) -> CoreResult<()> {
        let path = self.blob_path(storage_key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn sign_download_url(&self, storage_key: &str, ttl: Option<Duration>) -> CoreResult<Option<String>> {
        match &self.signer {
            Some(signer) => Ok(Some(
                signer.sign(storage_key, ttl.unwrap_or(self.signed_url_ttl))?,
            )),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn stream_of(parts: Vec<&'static [u8]>) -> ByteStream {
        Box::pin(futures::stream::iter(
            parts.into_iter().map(|p| Ok(Bytes::from_static(p))),
        ))
    }

    async fn collect(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAttachmentStore::new(
            dir.path(),
            Arc::new(EncryptionService::disabled()),
            None,
            Duration::from_secs(60),
        );

        let blob = store.put(stream_of(vec![b"hello ", b"world"])).await.unwrap();
        assert_eq!(blob.size, 11);
        assert_eq!(
            blob.sha256,
            hex::encode(Sha256::digest(b"hello world"))
        );

        let body = collect(store.get(&blob.storage_key).await.unwrap()).await;
        assert_eq!(body, b"hello world");

        store.delete(&blob.storage_key).await.unwrap();
        assert!(store.get(&blob.storage_key).await.is_err());
        // Deleting again stays idempotent.
        store.delete(&blob.storage_key).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_storage_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsAttachmentStore::new(
            dir.path(),
            Arc::new(EncryptionService::disabled()),
            None,
            Duration::from_secs(60),
        );
        assert!(store.get("../../etc/passwd").await.is_err());
        assert!(store.get("short").await.is_err());
    }
}
