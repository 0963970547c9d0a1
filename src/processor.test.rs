use std::sync::Arc;
use std::time::Duration;

use crate::config::ProcessorConfigBuilder;
use crate::testing::InMemoryTokenStore;
use crate::testing::NoopEventHandlerInvoker;
use crate::testing::VecMessageSource;
use crate::transaction::NoopTransactionManager;

use super::*;

fn build_processor(segments: u32) -> StreamingEventProcessor {
    let config = ProcessorConfigBuilder::new()
        .name("proc")
        .message_source(Arc::new(VecMessageSource::new(false)))
        .token_store(Arc::new(InMemoryTokenStore::new()))
        .event_handler_invoker(Arc::new(NoopEventHandlerInvoker))
        .transaction_manager(Arc::new(NoopTransactionManager))
        .initial_segment_count(segments)
        .build()
        .unwrap();
    StreamingEventProcessor::new(config)
}

#[tokio::test]
async fn start_is_idempotent_while_running() {
    let processor = build_processor(2);
    processor.start().await.unwrap();
    processor.start().await.unwrap();
    assert!(processor.is_running());
    processor.shut_down().await;
}

#[tokio::test]
async fn start_fails_while_shutting_down() {
    let processor = build_processor(2);
    processor.start().await.unwrap();

    let shutdown = processor.shutdown_async().await;
    let err = processor.start().await.unwrap_err();
    assert_eq!(err.kind(), crate::error::PsepErrorKind::IllegalState);
    shutdown.await;
}

#[tokio::test]
async fn shutdown_async_is_idempotent_before_next_start() {
    let processor = build_processor(2);
    processor.start().await.unwrap();

    let first = processor.shutdown_async().await;
    let second = processor.shutdown_async().await;
    first.await;
    second.await;
    assert!(!processor.is_running());
}

#[tokio::test]
async fn not_started_shutdown_returns_already_completed_future() {
    let processor = build_processor(2);
    let fut = processor.shutdown_async().await;
    tokio::time::timeout(Duration::from_millis(50), fut)
        .await
        .expect("not-started shutdown must resolve immediately");
}

#[tokio::test]
async fn max_capacity_defaults_to_max_int16() {
    let processor = build_processor(1);
    assert_eq!(processor.max_capacity(), i16::MAX as i32);
}

#[tokio::test]
async fn reset_tokens_rejected_while_running() {
    let processor = build_processor(1);
    processor.start().await.unwrap();
    let err = processor.reset_tokens(None, None).await.unwrap_err();
    assert_eq!(err.kind(), crate::error::PsepErrorKind::IllegalState);
    processor.shut_down().await;
}
