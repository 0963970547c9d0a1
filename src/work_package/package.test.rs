use std::sync::Arc;
use std::time::Duration;

use crate::segment::Segment;
use crate::source::TrackedEvent;
use crate::testing::AlwaysFailExtendTokenStore;
use crate::testing::InMemoryTokenStore;
use crate::testing::RecordingEventHandlerInvoker;
use crate::token::store::TokenStore;
use crate::token::tracking_token::TrackingToken;
use crate::transaction::NoopTransactionManager;

use super::*;

fn event(position: i64, routing_key: u64) -> TrackedEvent {
    TrackedEvent {
        token: TrackingToken::at(position),
        routing_key,
        payload_type: "test.event",
        payload: Vec::new(),
    }
}

async fn spawn_single_segment(
    handler: Arc<RecordingEventHandlerInvoker>,
) -> (WorkPackageHandle, Arc<InMemoryTokenStore>, &'static str) {
    let store = Arc::new(InMemoryTokenStore::new());
    store
        .initialize_token_segments("proc", 1, TrackingToken::at(-1))
        .await
        .unwrap();
    let owner_id = "owner-1";
    let token = store.fetch_token("proc", 0, owner_id).await.unwrap();

    let handle = spawn(WorkPackageParams {
        processor_name: "proc".to_string(),
        owner_id: owner_id.to_string(),
        segment: Segment::whole(),
        initial_token: token,
        token_store: store.clone(),
        handler,
        transaction_manager: Arc::new(NoopTransactionManager),
        rollback_configuration: Arc::new(|_| true),
        batch_size: 4,
        claim_extension_threshold: Duration::from_secs(60),
    });

    (handle, store, owner_id)
}

#[tokio::test]
async fn delivers_events_in_order_and_persists_token() {
    let handler = Arc::new(RecordingEventHandlerInvoker::new());
    let (handle, store, owner_id) = spawn_single_segment(handler.clone()).await;

    for i in 0..5 {
        assert!(handle.schedule_event(event(i, 0)).await);
    }
    handle.schedule_batch_processing();

    let mut last_token = handle.current_token().await;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        last_token = handle.current_token().await;
        if last_token == TrackingToken::at(4) {
            break;
        }
    }
    assert_eq!(last_token, TrackingToken::at(4));
    assert_eq!(handler.seen().len(), 5);

    let persisted = store.fetch_token("proc", 0, owner_id).await;
    // Re-fetching re-claims; that's fine for this assertion's purpose since
    // no other owner competes in this test.
    assert_eq!(persisted.unwrap(), TrackingToken::at(4));

    handle.abort("test teardown").await;
}

#[tokio::test]
async fn handler_failure_aborts_the_work_package() {
    let handler = Arc::new(RecordingEventHandlerInvoker::new());
    handler.fail_on_routing_key(0);
    let (handle, _store, _owner_id) = spawn_single_segment(handler).await;

    assert!(handle.schedule_event(event(0, 0)).await);
    handle.schedule_batch_processing();

    let mut state = handle.state().await;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        state = handle.state().await;
        if state == WorkPackageState::Aborted {
            break;
        }
    }
    assert_eq!(state, WorkPackageState::Aborted);
}

#[tokio::test]
async fn abort_completes_cleanly_with_no_pending_events() {
    let handler = Arc::new(RecordingEventHandlerInvoker::new());
    let (handle, store, owner_id) = spawn_single_segment(handler).await;
    handle.abort("shutting down").await;
    // The claim must be released once the task has actually exited.
    let reclaim = store.fetch_token("proc", 0, owner_id).await;
    assert!(reclaim.is_ok());
}

#[tokio::test]
async fn repeated_claim_extension_failure_aborts_the_work_package() {
    let store = Arc::new(AlwaysFailExtendTokenStore::new());
    store
        .initialize_token_segments("proc", 1, TrackingToken::at(-1))
        .await
        .unwrap();
    let owner_id = "owner-1";
    let token = store.fetch_token("proc", 0, owner_id).await.unwrap();

    let handle = spawn(WorkPackageParams {
        processor_name: "proc".to_string(),
        owner_id: owner_id.to_string(),
        segment: Segment::whole(),
        initial_token: token,
        token_store: store.clone(),
        handler: Arc::new(RecordingEventHandlerInvoker::new()),
        transaction_manager: Arc::new(NoopTransactionManager),
        rollback_configuration: Arc::new(|_| true),
        batch_size: 4,
        claim_extension_threshold: Duration::from_millis(10),
    });

    let mut state = handle.state().await;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        state = handle.state().await;
        if state == WorkPackageState::Aborted {
            break;
        }
    }
    assert_eq!(state, WorkPackageState::Aborted, "extend_claim always failing must abort the work package");
}
