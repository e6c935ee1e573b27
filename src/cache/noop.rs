// src/cache/noop.rs
// Disabled cache variant; the resumer degrades to its unavailable sentinel

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::CoreResult;

use super::{CacheAdapter, ResponseRecord, TokenStream};

pub struct NoopCache;

#[async_trait]
impl CacheAdapter for NoopCache {
    fn enabled(&self) -> bool {
        false
    }

    async fn epoch_get(&self, _conversation_id: Uuid, _client_id: &str) -> Option<i64> {
        None
    }

    async fn epoch_put(&self, _conversation_id: Uuid, _client_id: &str, _epoch: i64) {}

    async fn epoch_invalidate(&self, _conversation_id: Uuid, _client_id: &str) {}

    async fn record_get(&self, _conversation_id: Uuid) -> Option<ResponseRecord> {
        None
    }

    async fn record_put(&self, _conversation_id: Uuid, _record: ResponseRecord) {}

    async fn record_mark_completed(&self, _conversation_id: Uuid, _completed_offset: u64) {}

    async fn record_mark_cancel_requested(&self, _conversation_id: Uuid) {}

    async fn record_remove(&self, _conversation_id: Uuid) {}

    async fn stream_publish(&self, _conversation_id: Uuid, _chunk: Bytes) -> CoreResult<u64> {
        Ok(0)
    }

    async fn stream_complete(&self, _conversation_id: Uuid) -> CoreResult<()> {
        Ok(())
    }

    fn stream_subscribe(&self, _conversation_id: Uuid, _from_offset: u64) -> TokenStream {
        Box::pin(futures::stream::empty())
    }

    async fn cancel_publish(&self, _conversation_id: Uuid) -> CoreResult<()> {
        Ok(())
    }

    fn cancel_subscribe(&self, _conversation_id: Uuid) -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(false);
        rx
    }
}
