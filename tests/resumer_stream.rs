// tests/resumer_stream.rs
// Resumable response engine: replay, offsets, redirects, cancel, sentinels

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use memory_service::cache::{CacheAdapter, MemoryCache, NoopCache, TokenStream};
use memory_service::config::ResumerConfig;
use memory_service::error::CoreError;
use memory_service::resumer::{
    CancelOutcome, RecordOutcome, ResponseResumer, ResumeOutcome,
};
use uuid::Uuid;

use common::cache_config;

fn resumer_on(cache: Arc<dyn CacheAdapter>, host: &str, port: u16) -> ResponseResumer {
    ResponseResumer::new(
        cache,
        &ResumerConfig {
            enabled: true,
            advertised_host: host.to_string(),
            advertised_port: port,
        },
    )
}

async fn collect_bytes(mut stream: TokenStream) -> (Vec<u8>, Option<u64>) {
    let mut bytes = Vec::new();
    let mut last_offset = None;
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk.bytes);
        last_offset = Some(chunk.offset);
    }
    (bytes, last_offset)
}

#[tokio::test]
async fn replay_from_offset_yields_exact_suffix() {
    let cache: Arc<dyn CacheAdapter> = Arc::new(MemoryCache::new(cache_config()));
    let node_a = resumer_on(cache.clone(), "10.0.0.1", 7000);
    let conversation = Uuid::new_v4();

    let mut recorder = node_a.recorder(conversation).await.unwrap();
    assert_eq!(
        recorder.record("abc").await.unwrap(),
        RecordOutcome::Recorded(3)
    );
    assert_eq!(
        recorder.record("de").await.unwrap(),
        RecordOutcome::Recorded(5)
    );
    assert_eq!(
        recorder.record("fgh").await.unwrap(),
        RecordOutcome::Recorded(8)
    );
    recorder.complete().await.unwrap();

    // Full replay equals the concatenation of every token.
    let ResumeOutcome::Stream(stream) = node_a.replay(conversation, 0).await.unwrap() else {
        panic!("expected a stream");
    };
    let (bytes, last) = collect_bytes(stream).await;
    assert_eq!(bytes, b"abcdefgh");
    assert_eq!(last, Some(8));

    // Replay from offset 5 yields exactly the bytes from 5 onward.
    let ResumeOutcome::Stream(stream) = node_a.replay(conversation, 5).await.unwrap() else {
        panic!("expected a stream");
    };
    let (bytes, _) = collect_bytes(stream).await;
    assert_eq!(bytes, b"fgh");

    // And the prefix law: bytes[0..5] ++ replay(5) == replay(0).
    let ResumeOutcome::Stream(stream) = node_a.replay(conversation, 0).await.unwrap() else {
        panic!("expected a stream");
    };
    let (full, _) = collect_bytes(stream).await;
    assert_eq!(&full[..5], b"abcde");
}

#[tokio::test]
async fn peer_node_redirects_to_the_recording_node() {
    let cache: Arc<dyn CacheAdapter> = Arc::new(MemoryCache::new(cache_config()));
    let node_a = resumer_on(cache.clone(), "10.0.0.1", 7000);
    let node_b = resumer_on(cache.clone(), "10.0.0.2", 7000);
    let conversation = Uuid::new_v4();

    let mut recorder = node_a.recorder(conversation).await.unwrap();
    recorder.record("abc").await.unwrap();
    recorder.record("de").await.unwrap();
    recorder.record("fgh").await.unwrap();

    // Reconnect against the wrong replica: REDIRECT carrying A's address.
    let err = node_b.replay(conversation, 5).await.unwrap_err();
    match err {
        CoreError::Redirect { host, port } => {
            assert_eq!(host, "10.0.0.1");
            assert_eq!(port, 7000);
        }
        other => panic!("expected redirect, got {other:?}"),
    }

    // Following the redirect to A streams the suffix, then completion.
    let replay = tokio::spawn({
        let node_a = resumer_on(cache.clone(), "10.0.0.1", 7000);
        async move {
            let ResumeOutcome::Stream(stream) = node_a.replay(conversation, 5).await.unwrap()
            else {
                panic!("expected a stream");
            };
            collect_bytes(stream).await
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    recorder.complete().await.unwrap();

    let (bytes, _) = replay.await.unwrap();
    assert_eq!(bytes, b"fgh");
}

#[tokio::test]
async fn cancel_is_redirect_gated_and_cooperative() {
    let cache: Arc<dyn CacheAdapter> = Arc::new(MemoryCache::new(cache_config()));
    let node_a = resumer_on(cache.clone(), "10.0.0.1", 7000);
    let node_b = resumer_on(cache.clone(), "10.0.0.2", 7000);
    let conversation = Uuid::new_v4();

    let mut recorder = node_a.recorder(conversation).await.unwrap();
    recorder.record("partial").await.unwrap();

    // Cancel against the wrong replica redirects.
    let err = node_b.request_cancel(conversation).await.unwrap_err();
    assert!(matches!(err, CoreError::Redirect { .. }));

    // Cancel on the owning node reaches the recorder cooperatively.
    assert_eq!(
        node_a.request_cancel(conversation).await.unwrap(),
        CancelOutcome::Requested
    );
    assert!(recorder.cancel_requested());
    assert_eq!(
        recorder.record("ignored").await.unwrap(),
        RecordOutcome::Cancelled
    );

    // Completion is observable: subscribers terminate and the record settles.
    let ResumeOutcome::Stream(stream) = node_a.replay(conversation, 0).await.unwrap() else {
        panic!("expected a stream");
    };
    let (bytes, _) = collect_bytes(stream).await;
    assert_eq!(bytes, b"partial");
    assert!(!node_a.has_response_in_progress(conversation).await.unwrap());

    // Repeat cancels are idempotent.
    assert_eq!(
        node_a.request_cancel(conversation).await.unwrap(),
        CancelOutcome::Requested
    );
}

#[tokio::test]
async fn check_reports_only_in_progress_records() {
    let cache: Arc<dyn CacheAdapter> = Arc::new(MemoryCache::new(cache_config()));
    let node = resumer_on(cache, "10.0.0.1", 7000);

    let running = Uuid::new_v4();
    let finished = Uuid::new_v4();
    let unknown = Uuid::new_v4();

    let mut active = node.recorder(running).await.unwrap();
    active.record("x").await.unwrap();

    let mut done = node.recorder(finished).await.unwrap();
    done.record("y").await.unwrap();
    done.complete().await.unwrap();

    let reconnectable = node.check(&[running, finished, unknown]).await.unwrap();
    assert_eq!(reconnectable, vec![running]);
    assert!(node.has_response_in_progress(running).await.unwrap());
    assert!(!node.has_response_in_progress(unknown).await.unwrap());
}

#[tokio::test]
async fn missing_record_replays_an_empty_sequence() {
    let cache: Arc<dyn CacheAdapter> = Arc::new(MemoryCache::new(cache_config()));
    let node = resumer_on(cache, "10.0.0.1", 7000);

    let ResumeOutcome::Stream(stream) = node.replay(Uuid::new_v4(), 42).await.unwrap() else {
        panic!("expected a stream");
    };
    let (bytes, last) = collect_bytes(stream).await;
    assert!(bytes.is_empty());
    assert_eq!(last, None);
}

#[tokio::test]
async fn disabled_resumer_degrades_to_sentinels() {
    let node = ResponseResumer::new(
        Arc::new(NoopCache),
        &ResumerConfig {
            enabled: true,
            advertised_host: "10.0.0.1".into(),
            advertised_port: 7000,
        },
    );
    let conversation = Uuid::new_v4();

    // Recording is a no-op.
    let mut recorder = node.recorder(conversation).await.unwrap();
    assert_eq!(
        recorder.record("x").await.unwrap(),
        RecordOutcome::Recorded(0)
    );
    recorder.complete().await.unwrap();

    assert!(matches!(
        node.replay(conversation, 0).await.unwrap(),
        ResumeOutcome::Unavailable
    ));
    assert_eq!(
        node.request_cancel(conversation).await.unwrap(),
        CancelOutcome::Unavailable
    );
    assert!(node.check(&[conversation]).await.unwrap().is_empty());
}
