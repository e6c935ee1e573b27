// src/cache/mod.rs

//! Cache adapter: hot latest-epoch reads, resumer response records, and the
//! per-conversation token stream channels the resumer replays from.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::CoreResult;

pub mod memory;
pub mod noop;

pub use memory::MemoryCache;
pub use noop::NoopCache;

/// One replayed chunk. `offset` is the byte-cumulative position of the end
/// of this chunk over the UTF-8 token stream; it is the resume cursor a
/// client acknowledges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenChunk {
    pub bytes: Bytes,
    pub offset: u64,
}

pub type TokenStream = Pin<Box<dyn Stream<Item = TokenChunk> + Send>>;

/// Cached state of one in-flight (or recently completed) generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    /// Network identity of the node recording the generation. Peers use it
    /// to redirect replay/cancel calls; it must stay wire-stable.
    pub advertised_host: String,
    pub advertised_port: u16,
    pub completed: bool,
    pub completed_offset: u64,
    pub cancel_requested: bool,
}

#[async_trait]
pub trait CacheAdapter: Send + Sync {
    /// False for the noop variant; the resumer degrades gracefully.
    fn enabled(&self) -> bool;

    // -- latest-epoch cache ----------------------------------------------

    async fn epoch_get(&self, conversation_id: Uuid, client_id: &str) -> Option<i64>;

    async fn epoch_put(&self, conversation_id: Uuid, client_id: &str, epoch: i64);

    async fn epoch_invalidate(&self, conversation_id: Uuid, client_id: &str);

    // -- resumer response records ----------------------------------------

    async fn record_get(&self, conversation_id: Uuid) -> Option<ResponseRecord>;

    async fn record_put(&self, conversation_id: Uuid, record: ResponseRecord);

    /// Marks completion and starts the post-completion retention countdown.
    async fn record_mark_completed(&self, conversation_id: Uuid, completed_offset: u64);

    async fn record_mark_cancel_requested(&self, conversation_id: Uuid);

    async fn record_remove(&self, conversation_id: Uuid);

    // -- token stream channel --------------------------------------------

    /// Append a chunk; returns the new cumulative byte offset.
    async fn stream_publish(&self, conversation_id: Uuid, chunk: Bytes) -> CoreResult<u64>;

    async fn stream_complete(&self, conversation_id: Uuid) -> CoreResult<()>;

    /// Full stream from `from_offset` forward until the producer completes.
    /// Subscribers always observe a contiguous prefix in producer order.
    fn stream_subscribe(&self, conversation_id: Uuid, from_offset: u64) -> TokenStream;

    // -- cancel channel ---------------------------------------------------

    async fn cancel_publish(&self, conversation_id: Uuid) -> CoreResult<()>;

    fn cancel_subscribe(&self, conversation_id: Uuid) -> watch::Receiver<bool>;
}
