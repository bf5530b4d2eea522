//! Integration tests for the sync coordinator: start/stop discipline,
//! state projection, denied handling and forced syncs.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use common::{fresh_session, go_offline, go_online, refresh_body, seed_session, seed_token, settle};
use fieldbook_core::replication::{
    LocalStore, RemoteStore, ReplicationDirection, ReplicationEvent, ReplicationHandle, Replicator,
};
use fieldbook_core::sync::{ForceSyncOutcome, SkipReason, SyncCoordinator, SyncErrorCause, SyncState};
use fieldbook_core::Result;

/// A replicator the test script drives by hand: every `replicate` call is
/// counted and hands its event sender back to the test.
#[derive(Clone, Default)]
struct ScriptedReplicator {
    starts: Arc<AtomicUsize>,
    feed: Arc<Mutex<Option<mpsc::Sender<ReplicationEvent>>>>,
}

impl ScriptedReplicator {
    fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    async fn emit(&self, event: ReplicationEvent) {
        let sender = self
            .feed
            .lock()
            .unwrap()
            .clone()
            .expect("no replication session running");
        sender.send(event).await.expect("event pump gone");
    }
}

impl Replicator for ScriptedReplicator {
    fn replicate(
        &self,
        _local: &LocalStore,
        _remote: &RemoteStore,
        events: mpsc::Sender<ReplicationEvent>,
    ) -> Result<ReplicationHandle> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.feed.lock().unwrap() = Some(events);

        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(async move {
            let _ = shutdown_rx.recv().await;
        });
        Ok(ReplicationHandle::new(shutdown, task))
    }
}

/// An authenticated-online stack with a coordinator wired to the scripted
/// replicator.
async fn online_coordinator() -> (common::TestStack, SyncCoordinator, ScriptedReplicator) {
    let stack = common::stack().await;
    go_online(&stack).await;
    seed_session(&stack, &fresh_session());
    seed_token(&stack, "tok-live");
    stack.sessions.bootstrap().await.unwrap();

    let replicator = ScriptedReplicator::default();
    let coordinator = SyncCoordinator::new(
        &stack.config,
        stack.sessions.clone(),
        stack.connectivity.clone(),
        Arc::new(replicator.clone()),
    )
    .unwrap();
    (stack, coordinator, replicator)
}

#[tokio::test]
async fn test_local_store_available_before_any_auth() {
    let stack = common::stack().await;
    go_offline(&stack).await;

    let replicator = ScriptedReplicator::default();
    let coordinator = SyncCoordinator::new(
        &stack.config,
        stack.sessions.clone(),
        stack.connectivity.clone(),
        Arc::new(replicator),
    )
    .unwrap();

    // Unauthenticated and offline, yet the local store works.
    assert_eq!(coordinator.local_store().name(), "fieldbook_local");
    assert!(coordinator.local_store().path().is_dir());
}

#[tokio::test]
async fn test_start_sync_is_idempotent() {
    let (_stack, coordinator, replicator) = online_coordinator().await;

    coordinator.start_sync().await.unwrap();
    coordinator.start_sync().await.unwrap();

    // Exactly one live replication session.
    assert_eq!(replicator.starts(), 1);
}

#[tokio::test]
async fn test_start_sync_offline_reports_offline_not_inactive() {
    let stack = common::stack().await;
    go_offline(&stack).await;
    seed_session(&stack, &fresh_session());

    let replicator = ScriptedReplicator::default();
    let coordinator = SyncCoordinator::new(
        &stack.config,
        stack.sessions.clone(),
        stack.connectivity.clone(),
        Arc::new(replicator.clone()),
    )
    .unwrap();

    coordinator.start_sync().await.unwrap();

    assert_eq!(replicator.starts(), 0);
    assert_eq!(coordinator.sync_state(), SyncState::Offline);
}

#[tokio::test]
async fn test_change_events_project_immediately_with_counts() {
    let (_stack, coordinator, replicator) = online_coordinator().await;
    coordinator.start_sync().await.unwrap();
    let mut transitions = coordinator.subscribe();

    replicator
        .emit(ReplicationEvent::Change {
            direction: ReplicationDirection::Pull,
            docs_read: 4,
            docs_written: 4,
        })
        .await;

    // Change bypasses the debounce window entirely.
    let transition = tokio::time::timeout(Duration::from_millis(50), transitions.recv())
        .await
        .expect("change was debounced")
        .unwrap();
    assert_eq!(transition.new, SyncState::Change);
    assert_eq!(transition.detail.direction, Some(ReplicationDirection::Pull));
    assert_eq!(transition.detail.docs_read, Some(4));
}

#[tokio::test]
async fn test_denied_is_terminal_until_restarted() {
    let (_stack, coordinator, replicator) = online_coordinator().await;
    coordinator.start_sync().await.unwrap();

    replicator
        .emit(ReplicationEvent::Denied {
            reason: "replication access revoked".to_string(),
        })
        .await;
    settle().await;

    assert_eq!(coordinator.sync_state(), SyncState::Error);
    // No automatic retry of a denied session.
    assert_eq!(replicator.starts(), 1);

    // A routine stop must not mask the error state.
    coordinator.stop_sync().await;
    settle().await;
    assert_eq!(coordinator.sync_state(), SyncState::Error);

    // An explicit stop/start cycle recovers.
    coordinator.start_sync().await.unwrap();
    assert_eq!(replicator.starts(), 2);
}

#[tokio::test]
async fn test_denied_carries_cause() {
    let (_stack, coordinator, replicator) = online_coordinator().await;
    coordinator.start_sync().await.unwrap();
    let mut transitions = coordinator.subscribe();

    replicator
        .emit(ReplicationEvent::Denied {
            reason: "forbidden".to_string(),
        })
        .await;

    let transition = transitions.recv().await.unwrap();
    assert_eq!(transition.new, SyncState::Error);
    assert_eq!(transition.detail.cause, Some(SyncErrorCause::Denied));
}

#[tokio::test]
async fn test_complete_after_intentional_stop_is_ignored() {
    let (_stack, coordinator, replicator) = online_coordinator().await;
    coordinator.start_sync().await.unwrap();

    coordinator.stop_sync().await;
    settle().await;
    assert_eq!(coordinator.sync_state(), SyncState::Inactive);

    // The cancelled handle drains its last "caught up" notification; it
    // must not read as a real completion.
    replicator.emit(ReplicationEvent::Complete).await;
    settle().await;
    assert_eq!(coordinator.sync_state(), SyncState::Inactive);
}

#[tokio::test]
async fn test_auth_error_asks_for_silent_refresh_and_restarts() {
    let (stack, coordinator, replicator) = online_coordinator().await;

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(refresh_body("tok-fresh")))
        .expect(1)
        .mount(&stack.server)
        .await;

    coordinator.start_sync().await.unwrap();
    replicator
        .emit(ReplicationEvent::Error {
            status: Some(401),
            message: "token expired".to_string(),
        })
        .await;

    // The refresh succeeds and the coordinator restarts replication with
    // a binding that carries the new token.
    settle().await;
    settle().await;
    assert_eq!(replicator.starts(), 2);
    assert_eq!(stack.sessions.access_token().unwrap().token, "tok-fresh");
}

#[tokio::test]
async fn test_force_sync_skips_when_offline() {
    let stack = common::stack().await;
    go_offline(&stack).await;

    let replicator = ScriptedReplicator::default();
    let coordinator = SyncCoordinator::new(
        &stack.config,
        stack.sessions.clone(),
        stack.connectivity.clone(),
        Arc::new(replicator),
    )
    .unwrap();

    assert_eq!(
        coordinator.force_sync_now().await,
        ForceSyncOutcome::Skipped(SkipReason::Offline)
    );
}

#[tokio::test]
async fn test_force_sync_skips_when_unauthenticated() {
    let stack = common::stack().await;
    go_online(&stack).await;
    stack.sessions.bootstrap().await.unwrap();

    let replicator = ScriptedReplicator::default();
    let coordinator = SyncCoordinator::new(
        &stack.config,
        stack.sessions.clone(),
        stack.connectivity.clone(),
        Arc::new(replicator),
    )
    .unwrap();

    assert_eq!(
        coordinator.force_sync_now().await,
        ForceSyncOutcome::Skipped(SkipReason::Unauthenticated)
    );
}

#[tokio::test]
async fn test_force_sync_skips_without_remote_binding() {
    let stack = common::stack().await;
    go_online(&stack).await;
    // Authenticated offline-style: a session with an exhausted refresh
    // path and no access token cannot bind the remote store.
    seed_session(&stack, &common::stale_session());
    stack.sessions.bootstrap().await.unwrap();
    assert!(stack.sessions.is_authenticated());

    let replicator = ScriptedReplicator::default();
    let coordinator = SyncCoordinator::new(
        &stack.config,
        stack.sessions.clone(),
        stack.connectivity.clone(),
        Arc::new(replicator),
    )
    .unwrap();

    assert_eq!(
        coordinator.force_sync_now().await,
        ForceSyncOutcome::Skipped(SkipReason::RemoteBindingFailed)
    );
}

#[tokio::test]
async fn test_force_sync_restarts_running_session() {
    let (_stack, coordinator, replicator) = online_coordinator().await;
    coordinator.start_sync().await.unwrap();

    assert_eq!(coordinator.force_sync_now().await, ForceSyncOutcome::Started);
    assert_eq!(replicator.starts(), 2);
}

#[tokio::test]
async fn test_going_offline_stops_session_and_shows_offline() {
    let (stack, coordinator, replicator) = online_coordinator().await;
    coordinator.start_sync().await.unwrap();
    assert_eq!(replicator.starts(), 1);

    stack.connectivity.report_link_change(false);
    settle().await;

    assert_eq!(coordinator.sync_state(), SyncState::Offline);
    // Session is still authenticated; only replication stopped.
    assert!(stack.sessions.is_authenticated());
}
