// src/resumer/mod.rs

//! Resumable response engine.
//!
//! One node records a generation's tokens into the cache stream channel and
//! advertises itself in the response record. Clients replay from any byte
//! offset; a replica that does not own the record answers with a redirect
//! to the advertised node instead of attempting a cross-node stream.
//! Cancellation is a cooperative one-shot signal the recorder observes.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{CacheAdapter, ResponseRecord, TokenStream};
use crate::config::ResumerConfig;
use crate::error::{CoreError, CoreResult};

/// Network identity a recording node publishes into its records. Compared
/// by exact equality; the encoding must stay bit-identical across versions
/// for rolling upgrades.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for AdvertisedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Replay result: a finite stream (possibly empty when no record exists),
/// or the unavailable sentinel when the resumer is disabled.
pub enum ResumeOutcome {
    Stream(TokenStream),
    Unavailable,
}

impl fmt::Debug for ResumeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeOutcome::Stream(_) => f.write_str("ResumeOutcome::Stream(..)"),
            ResumeOutcome::Unavailable => f.write_str("ResumeOutcome::Unavailable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The cancel signal was published (idempotent).
    Requested,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Token appended; the new cumulative byte offset.
    Recorded(u64),
    /// A cancel signal arrived; the record is completed and the producer
    /// should short-circuit.
    Cancelled,
}

pub struct ResponseResumer {
    cache: Arc<dyn CacheAdapter>,
    advertised: AdvertisedAddress,
    enabled: bool,
}

impl ResponseResumer {
    pub fn new(cache: Arc<dyn CacheAdapter>, config: &ResumerConfig) -> Self {
        let enabled = config.enabled && cache.enabled();
        Self {
            cache,
            advertised: AdvertisedAddress {
                host: config.advertised_host.clone(),
                port: config.advertised_port,
            },
            enabled,
        }
    }

    pub fn advertised_address(&self) -> &AdvertisedAddress {
        &self.advertised
    }

    /// Start recording a generation for the conversation. Disabled resumer
    /// returns a no-op recorder so the generation pipeline is unchanged.
    pub async fn recorder(&self, conversation_id: Uuid) -> CoreResult<Recorder> {
        if !self.enabled {
            return Ok(Recorder::noop(conversation_id));
        }

        self.cache
            .record_put(
                conversation_id,
                ResponseRecord {
                    advertised_host: self.advertised.host.clone(),
                    advertised_port: self.advertised.port,
                    completed: false,
                    completed_offset: 0,
                    cancel_requested: false,
                },
            )
            .await;
        let cancel_rx = self.cache.cancel_subscribe(conversation_id);

        Ok(Recorder {
            cache: Some(self.cache.clone()),
            conversation_id,
            cancel_rx: Some(cancel_rx),
            offset: 0,
            completed: false,
        })
    }

    /// Replay the stream strictly after `from_offset`. No record → empty
    /// stream (the transport maps it to the client's sentinel). A record
    /// owned by a peer → REDIRECT carrying the advertised address.
    pub async fn replay(
        &self,
        conversation_id: Uuid,
        from_offset: u64,
    ) -> CoreResult<ResumeOutcome> {
        if !self.enabled {
            return Ok(ResumeOutcome::Unavailable);
        }
        let Some(record) = self.cache.record_get(conversation_id).await else {
            return Ok(ResumeOutcome::Stream(Box::pin(futures::stream::empty())));
        };
        self.redirect_unless_local(&record)?;

        debug!(
            "replaying conversation {} from offset {}",
            conversation_id, from_offset
        );
        Ok(ResumeOutcome::Stream(
            self.cache.stream_subscribe(conversation_id, from_offset),
        ))
    }

    /// Publish the cooperative cancel signal. Repeat signals and cancels of
    /// unknown conversations are idempotent no-ops.
    pub async fn request_cancel(&self, conversation_id: Uuid) -> CoreResult<CancelOutcome> {
        if !self.enabled {
            return Ok(CancelOutcome::Unavailable);
        }
        let Some(record) = self.cache.record_get(conversation_id).await else {
            return Ok(CancelOutcome::Requested);
        };
        self.redirect_unless_local(&record)?;

        self.cache.record_mark_cancel_requested(conversation_id).await;
        self.cache.cancel_publish(conversation_id).await?;
        debug!("cancel requested for conversation {}", conversation_id);
        Ok(CancelOutcome::Requested)
    }

    /// The subset of conversations with a live, not-yet-completed record.
    /// Clients use it to discover reconnectable streams.
    pub async fn check(&self, conversation_ids: &[Uuid]) -> CoreResult<Vec<Uuid>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let mut in_progress = Vec::new();
        for &conversation_id in conversation_ids {
            if let Some(record) = self.cache.record_get(conversation_id).await {
                if !record.completed {
                    in_progress.push(conversation_id);
                }
            }
        }
        Ok(in_progress)
    }

    /// Best-effort: callers use it to wait for a cancellation to settle.
    pub async fn has_response_in_progress(&self, conversation_id: Uuid) -> CoreResult<bool> {
        if !self.enabled {
            return Ok(false);
        }
        Ok(self
            .cache
            .record_get(conversation_id)
            .await
            .is_some_and(|record| !record.completed))
    }

    fn redirect_unless_local(&self, record: &ResponseRecord) -> CoreResult<()> {
        if record.advertised_host != self.advertised.host
            || record.advertised_port != self.advertised.port
        {
            return Err(CoreError::Redirect {
                host: record.advertised_host.clone(),
                port: record.advertised_port,
            });
        }
        Ok(())
    }
}

/// Producer-side handle for one generation. Appends tokens to the stream,
/// watches the cancel channel, and completes the record exactly once.
pub struct Recorder {
    cache: Option<Arc<dyn CacheAdapter>>,
    conversation_id: Uuid,
    cancel_rx: Option<watch::Receiver<bool>>,
    offset: u64,
    completed: bool,
}

impl Recorder {
    fn noop(conversation_id: Uuid) -> Self {
        Self {
            cache: None,
            conversation_id,
            cancel_rx: None,
            offset: 0,
            completed: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Append one token's UTF-8 bytes. Receipt of a cancel signal is
    /// synonymous with completion: the record is finished and the producer
    /// is told to short-circuit.
    pub async fn record(&mut self, token: &str) -> CoreResult<RecordOutcome> {
        let Some(cache) = self.cache.clone() else {
            return Ok(RecordOutcome::Recorded(self.offset));
        };
        if self.completed {
            return Ok(RecordOutcome::Cancelled);
        }
        if self.cancel_requested() {
            self.complete().await?;
            return Ok(RecordOutcome::Cancelled);
        }

        let offset = cache
            .stream_publish(self.conversation_id, Bytes::from(token.to_owned()))
            .await?;
        self.offset = offset;
        Ok(RecordOutcome::Recorded(offset))
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_rx
            .as_ref()
            .is_some_and(|rx| *rx.borrow())
    }

    /// Resolves when a cancel signal arrives; pends forever on a recorder
    /// whose channel never fires. Intended for `select!` in the producer.
    pub async fn cancelled(&mut self) {
        match self.cancel_rx.as_mut() {
            Some(rx) => {
                while !*rx.borrow_and_update() {
                    if rx.changed().await.is_err() {
                        futures::future::pending::<()>().await;
                    }
                }
            }
            None => futures::future::pending::<()>().await,
        }
    }

    /// Idempotent. Marks the record complete at the final offset and closes
    /// the stream so replaying subscribers terminate.
    pub async fn complete(&mut self) -> CoreResult<()> {
        if self.completed {
            return Ok(());
        }
        self.completed = true;
        if let Some(cache) = self.cache.clone() {
            cache
                .record_mark_completed(self.conversation_id, self.offset)
                .await;
            cache.stream_complete(self.conversation_id).await?;
        }
        Ok(())
    }
}
