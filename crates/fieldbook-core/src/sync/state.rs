//! The debounced sync-state cell.
//!
//! Two write paths into one state cell: an immediate path for
//! high-priority states (`Error`, `Offline`, `Change`) and a
//! timer-coalesced path for the rest, where the last write within the
//! window wins. Rapid `active`/`paused` flapping during replication
//! batches collapses into one visible transition; problems never wait.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{SyncDetail, SyncState, SyncTransition};

/// A debounced, subscribable state cell.
#[derive(Clone)]
pub struct StateCell {
    inner: Arc<CellInner>,
}

struct CellInner {
    window: Duration,
    current: Mutex<SyncState>,
    pending: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<SyncTransition>,
}

impl std::fmt::Debug for StateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCell")
            .field("current", &self.current())
            .field("window", &self.inner.window)
            .finish_non_exhaustive()
    }
}

impl StateCell {
    /// Create a cell in the `Inactive` state with the given debounce
    /// window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(CellInner {
                window,
                current: Mutex::new(SyncState::Inactive),
                pending: Mutex::new(None),
                events,
            }),
        }
    }

    /// The current state.
    #[must_use]
    pub fn current(&self) -> SyncState {
        *lock(&self.inner.current)
    }

    /// Subscribe to state transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncTransition> {
        self.inner.events.subscribe()
    }

    /// Write a new state.
    ///
    /// High-priority states apply immediately; the rest are deferred by
    /// the debounce window, and a newer write within the window replaces
    /// the deferred one.
    pub fn set(&self, state: SyncState, detail: SyncDetail) {
        // Any new write supersedes a deferred one.
        if let Some(pending) = lock(&self.inner.pending).take() {
            pending.abort();
        }

        if state.is_immediate() {
            CellInner::apply(&self.inner, state, detail);
            return;
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            CellInner::apply(&inner, state, detail);
        });
        *lock(&self.inner.pending) = Some(handle);
    }
}

impl CellInner {
    fn apply(inner: &Arc<Self>, state: SyncState, detail: SyncDetail) {
        let mut current = lock(&inner.current);
        // Progress updates re-emit even without a state change so the UI
        // can show live document counts; everything else only on change.
        if *current == state && state != SyncState::Change {
            return;
        }

        let old = *current;
        *current = state;
        drop(current);

        tracing::debug!("Sync state changed: {old} -> {state}");
        let _ = inner.events.send(SyncTransition {
            old,
            new: state,
            detail,
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicationDirection;

    #[tokio::test(start_paused = true)]
    async fn test_immediate_state_applies_without_delay() {
        let cell = StateCell::new(Duration::from_millis(300));
        let mut events = cell.subscribe();

        cell.set(SyncState::Offline, SyncDetail::with_reason("connection_lost"));
        assert_eq!(cell.current(), SyncState::Offline);

        let transition = events.recv().await.unwrap();
        assert_eq!(transition.old, SyncState::Inactive);
        assert_eq!(transition.new, SyncState::Offline);
        assert_eq!(transition.detail.reason.as_deref(), Some("connection_lost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_state_waits_for_window() {
        let cell = StateCell::new(Duration::from_millis(300));

        cell.set(SyncState::Active, SyncDetail::default());
        assert_eq!(cell.current(), SyncState::Inactive);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(cell.current(), SyncState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_write_wins_within_window() {
        let cell = StateCell::new(Duration::from_millis(300));
        let mut events = cell.subscribe();

        cell.set(SyncState::Active, SyncDetail::default());
        tokio::time::sleep(Duration::from_millis(100)).await;
        cell.set(SyncState::Paused, SyncDetail::default());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(cell.current(), SyncState::Paused);

        // Only the winning write produced a transition.
        let transition = events.recv().await.unwrap();
        assert_eq!(transition.new, SyncState::Paused);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_state_does_not_reemit() {
        let cell = StateCell::new(Duration::from_millis(300));
        let mut events = cell.subscribe();

        cell.set(SyncState::Offline, SyncDetail::default());
        cell.set(SyncState::Offline, SyncDetail::default());

        assert!(events.recv().await.is_ok());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_reemits_for_progress() {
        let cell = StateCell::new(Duration::from_millis(300));
        let mut events = cell.subscribe();

        cell.set(
            SyncState::Change,
            SyncDetail::for_change(ReplicationDirection::Pull, 5, 5),
        );
        cell.set(
            SyncState::Change,
            SyncDetail::for_change(ReplicationDirection::Pull, 10, 10),
        );

        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first.detail.docs_read, Some(5));
        assert_eq!(second.detail.docs_read, Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_write_cancels_pending_debounce() {
        let cell = StateCell::new(Duration::from_millis(300));

        cell.set(SyncState::Complete, SyncDetail::default());
        cell.set(SyncState::Error, SyncDetail::with_cause(super::super::SyncErrorCause::Sync));

        tokio::time::sleep(Duration::from_millis(400)).await;
        // The deferred Complete must not overwrite the immediate Error.
        assert_eq!(cell.current(), SyncState::Error);
    }
}
