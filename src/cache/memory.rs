// src/cache/memory.rs

//! In-process cache variant: moka-backed epoch cache plus per-conversation
//! stream state (chunk log + wakeup + cancel channel).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::CoreResult;

use super::{CacheAdapter, ResponseRecord, TokenChunk, TokenStream};

struct RecordSlot {
    record: ResponseRecord,
    created_at: Instant,
    /// Set when the record completed; the slot expires at this instant.
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct StreamBuf {
    /// Chunks keyed by their starting byte offset, in publish order.
    chunks: Vec<(u64, Bytes)>,
    total: u64,
    completed: bool,
}

struct ResponseState {
    record: Mutex<Option<RecordSlot>>,
    buf: Mutex<StreamBuf>,
    notify: Notify,
    cancel_tx: watch::Sender<bool>,
}

impl ResponseState {
    fn new() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            record: Mutex::new(None),
            buf: Mutex::new(StreamBuf::default()),
            notify: Notify::new(),
            cancel_tx,
        }
    }

    /// Everything at or after `pos`, plus whether the stream has completed.
    /// A `pos` landing inside a chunk slices it so replay resumes exactly
    /// one byte past the acknowledged offset.
    fn collect_from(&self, pos: u64) -> (Vec<TokenChunk>, bool) {
        let buf = self.buf.lock();
        let mut out = Vec::new();
        for (start, bytes) in &buf.chunks {
            let end = start + bytes.len() as u64;
            if end <= pos {
                continue;
            }
            let skip = pos.saturating_sub(*start) as usize;
            out.push(TokenChunk {
                bytes: bytes.slice(skip..),
                offset: end,
            });
        }
        (out, buf.completed)
    }
}

pub struct MemoryCache {
    epochs: moka::future::Cache<(Uuid, String), i64>,
    responses: Mutex<HashMap<Uuid, Arc<ResponseState>>>,
    config: CacheConfig,
}

impl MemoryCache {
    pub fn new(config: CacheConfig) -> Self {
        let epochs = moka::future::Cache::builder()
            .time_to_live(config.epoch_ttl)
            .max_capacity(100_000)
            .build();
        Self {
            epochs,
            responses: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn state(&self, conversation_id: Uuid) -> Arc<ResponseState> {
        let mut responses = self.responses.lock();
        responses
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(ResponseState::new()))
            .clone()
    }

    fn existing_state(&self, conversation_id: Uuid) -> Option<Arc<ResponseState>> {
        self.responses.lock().get(&conversation_id).cloned()
    }

    /// Drop the state when its record has expired; returns the live record.
    fn live_record(&self, conversation_id: Uuid) -> Option<ResponseRecord> {
        let state = self.existing_state(conversation_id)?;
        let now = Instant::now();
        let expired = {
            let slot = state.record.lock();
            match slot.as_ref() {
                None => return None,
                Some(slot) => {
                    slot.expires_at.is_some_and(|at| at <= now)
                        || now.duration_since(slot.created_at) > self.config.record_max_lifetime
                }
            }
        };
        if expired {
            self.responses.lock().remove(&conversation_id);
            return None;
        }
        let slot = state.record.lock();
        slot.as_ref().map(|s| s.record.clone())
    }
}

#[async_trait]
impl CacheAdapter for MemoryCache {
    fn enabled(&self) -> bool {
        true
    }

    async fn epoch_get(&self, conversation_id: Uuid, client_id: &str) -> Option<i64> {
        self.epochs
            .get(&(conversation_id, client_id.to_string()))
            .await
    }

    async fn epoch_put(&self, conversation_id: Uuid, client_id: &str, epoch: i64) {
        self.epochs
            .insert((conversation_id, client_id.to_string()), epoch)
            .await;
    }

    async fn epoch_invalidate(&self, conversation_id: Uuid, client_id: &str) {
        self.epochs
            .invalidate(&(conversation_id, client_id.to_string()))
            .await;
    }

    async fn record_get(&self, conversation_id: Uuid) -> Option<ResponseRecord> {
        self.live_record(conversation_id)
    }

    async fn record_put(&self, conversation_id: Uuid, record: ResponseRecord) {
        let state = self.state(conversation_id);
        *state.record.lock() = Some(RecordSlot {
            record,
            created_at: Instant::now(),
            expires_at: None,
        });
    }

    async fn record_mark_completed(&self, conversation_id: Uuid, completed_offset: u64) {
        if let Some(state) = self.existing_state(conversation_id) {
            let mut slot = state.record.lock();
            if let Some(slot) = slot.as_mut() {
                slot.record.completed = true;
                slot.record.completed_offset = completed_offset;
                slot.expires_at = Some(Instant::now() + self.config.record_ttl);
            }
        }
    }

    async fn record_mark_cancel_requested(&self, conversation_id: Uuid) {
        if let Some(state) = self.existing_state(conversation_id) {
            let mut slot = state.record.lock();
            if let Some(slot) = slot.as_mut() {
                slot.record.cancel_requested = true;
            }
        }
    }

    async fn record_remove(&self, conversation_id: Uuid) {
        self.responses.lock().remove(&conversation_id);
    }

    async fn stream_publish(&self, conversation_id: Uuid, chunk: Bytes) -> CoreResult<u64> {
        let state = self.state(conversation_id);
        let offset = {
            let mut buf = state.buf.lock();
            if buf.completed {
                return Ok(buf.total);
            }
            let start = buf.total;
            buf.total += chunk.len() as u64;
            buf.chunks.push((start, chunk));
            buf.total
        };
        state.notify.notify_waiters();
        Ok(offset)
    }

    async fn stream_complete(&self, conversation_id: Uuid) -> CoreResult<()> {
        let state = self.state(conversation_id);
        state.buf.lock().completed = true;
        state.notify.notify_waiters();
        Ok(())
    }

    fn stream_subscribe(&self, conversation_id: Uuid, from_offset: u64) -> TokenStream {
        let state = self.state(conversation_id);
        Box::pin(async_stream::stream! {
            let mut pos = from_offset;
            loop {
                // Register for wakeup before checking, so a publish between
                // the check and the await cannot be lost.
                let notified = state.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let (batch, completed) = state.collect_from(pos);
                if !batch.is_empty() {
                    for chunk in batch {
                        pos = chunk.offset;
                        yield chunk;
                    }
                    continue;
                }
                if completed {
                    break;
                }
                notified.await;
            }
        })
    }

    async fn cancel_publish(&self, conversation_id: Uuid) -> CoreResult<()> {
        let state = self.state(conversation_id);
        let _ = state.cancel_tx.send_replace(true);
        state.notify.notify_waiters();
        Ok(())
    }

    fn cancel_subscribe(&self, conversation_id: Uuid) -> watch::Receiver<bool> {
        self.state(conversation_id).cancel_tx.subscribe()
    }
}
