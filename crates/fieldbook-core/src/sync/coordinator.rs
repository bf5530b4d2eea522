//! The sync coordinator.
//!
//! Owns the local store handle and the remote store binding, and drives a
//! continuous bidirectional replication session in response to auth and
//! connectivity events. At most one replication session is live per
//! process; `start_sync` while one is running is a no-op, not an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};

use crate::config::{Config, ServerConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Error, Result};
use crate::replication::{
    LocalStore, RemoteStore, ReplicationEvent, ReplicationHandle, Replicator,
};
use crate::session::{AuthEvent, SessionManager};

use super::{StateCell, SyncDetail, SyncErrorCause, SyncState, SyncTransition};

/// Outcome of a [`SyncCoordinator::force_sync_now`] request.
///
/// Unmet preconditions are reported structurally rather than as errors:
/// a user pressing "sync now" while offline is a normal situation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceSyncOutcome {
    /// A fresh replication session was started
    Started,
    /// Preconditions were not met; nothing was started
    Skipped(SkipReason),
}

/// Why a forced sync could not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Connectivity is down
    Offline,
    /// No authenticated user
    Unauthenticated,
    /// The remote store binding could not be constructed
    RemoteBindingFailed,
}

/// Coordinates replication between the local and remote stores.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    server: ServerConfig,
    local: LocalStore,
    replicator: Arc<dyn Replicator>,
    sessions: SessionManager,
    connectivity: ConnectivityMonitor,
    state: StateCell,
    active: tokio::sync::Mutex<Option<ReplicationHandle>>,
    remote: Mutex<Option<RemoteStore>>,
    /// Set before cancelling a session so a trailing `Complete` event from
    /// the cancelled handle is not mistaken for a real completion.
    manual_stop: AtomicBool,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("local", &self.inner.local)
            .field("state", &self.sync_state())
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    /// Create the coordinator, eagerly opening the local store.
    ///
    /// The local store is independent of auth state: local-only operation
    /// must always work, so a failure here is fatal to construction.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: &Config,
        sessions: SessionManager,
        connectivity: ConnectivityMonitor,
        replicator: Arc<dyn Replicator>,
    ) -> Result<Self> {
        let data_dir = config
            .storage
            .data_dir
            .clone()
            .or_else(Config::data_dir)
            .unwrap_or_else(|| std::path::PathBuf::from("."));
        let local = LocalStore::open(&config.sync.local_store_name, &data_dir)?;

        let coordinator = Self {
            inner: Arc::new(CoordinatorInner {
                server: config.server.clone(),
                local,
                replicator,
                sessions,
                connectivity,
                state: StateCell::new(config.sync.debounce_window),
                active: tokio::sync::Mutex::new(None),
                remote: Mutex::new(None),
                manual_stop: AtomicBool::new(false),
            }),
        };
        coordinator.spawn_auth_listener();
        Ok(coordinator)
    }

    /// The local store handle. Always available, independent of auth and
    /// connectivity.
    #[must_use]
    pub fn local_store(&self) -> &LocalStore {
        &self.inner.local
    }

    /// Current sync state.
    #[must_use]
    pub fn sync_state(&self) -> SyncState {
        self.inner.state.current()
    }

    /// Subscribe to sync-state transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncTransition> {
        self.inner.state.subscribe()
    }

    /// Start the replication session if conditions allow.
    ///
    /// Offline is not an error: the state machine moves to `Offline` (not
    /// `Inactive`) and nothing starts. A session already running makes
    /// this a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error when the remote binding cannot be constructed or
    /// the replicator refuses to start.
    pub async fn start_sync(&self) -> Result<()> {
        if !self.inner.connectivity.online() {
            tracing::info!("Cannot start sync: connectivity is down");
            self.inner
                .state
                .set(SyncState::Offline, SyncDetail::with_reason("connection_lost"));
            return Ok(());
        }

        let mut active = self.inner.active.lock().await;
        if active.is_some() {
            tracing::debug!("Sync already in progress");
            return Ok(());
        }

        let remote = self.current_or_new_remote()?;
        self.inner.manual_stop.store(false, Ordering::SeqCst);

        let (events_tx, events_rx) = mpsc::channel(64);
        let handle = self
            .inner
            .replicator
            .replicate(&self.inner.local, &remote, events_tx)?;
        *active = Some(handle);
        drop(active);

        self.inner
            .state
            .set(SyncState::Active, SyncDetail::default());
        self.spawn_event_pump(events_rx);
        tracing::info!("Replication started against '{}'", remote.store_id());
        Ok(())
    }

    /// Stop the replication session, marking the stop as intentional.
    ///
    /// An `Offline` or `Error` state is not overwritten by a routine stop;
    /// those must stay visible until resolved.
    pub async fn stop_sync(&self) {
        let mut active = self.inner.active.lock().await;
        if let Some(handle) = active.take() {
            self.inner.manual_stop.store(true, Ordering::SeqCst);
            handle.cancel();
            tracing::info!("Replication stopped");

            let current = self.inner.state.current();
            if current != SyncState::Offline && current != SyncState::Error {
                self.inner
                    .state
                    .set(SyncState::Inactive, SyncDetail::with_reason("sync_stopped"));
            }
        }
    }

    /// Stop and restart the session unconditionally, reporting unmet
    /// preconditions as a structured outcome.
    pub async fn force_sync_now(&self) -> ForceSyncOutcome {
        if !self.inner.connectivity.online() {
            tracing::info!("Cannot force sync: connectivity is down");
            return ForceSyncOutcome::Skipped(SkipReason::Offline);
        }
        if !self.inner.sessions.is_authenticated() {
            tracing::info!("Cannot force sync: not authenticated");
            return ForceSyncOutcome::Skipped(SkipReason::Unauthenticated);
        }
        if let Err(e) = self.current_or_new_remote() {
            tracing::info!("Cannot force sync: {e}");
            return ForceSyncOutcome::Skipped(SkipReason::RemoteBindingFailed);
        }

        self.stop_sync().await;
        match self.start_sync().await {
            Ok(()) => ForceSyncOutcome::Started,
            Err(e) => {
                tracing::error!("Forced sync failed to start: {e}");
                ForceSyncOutcome::Skipped(SkipReason::RemoteBindingFailed)
            }
        }
    }

    /// Build a fresh remote binding from the current session record and
    /// token source. Rebuilt (not reused) whenever the token changes.
    fn bind_remote(&self) -> Result<RemoteStore> {
        if self.inner.sessions.access_token().is_none() {
            return Err(Error::RemoteBindingFailed(
                "no access token available".to_string(),
            ));
        }
        let session = self.inner.sessions.session_info().ok_or_else(|| {
            Error::RemoteBindingFailed("no session record available".to_string())
        })?;
        if session.remote_store_id.is_empty() {
            return Err(Error::RemoteBindingFailed(
                "session has no remote store id".to_string(),
            ));
        }

        let remote = RemoteStore::new(
            &self.inner.server,
            &session.remote_store_id,
            Arc::new(self.inner.sessions.clone()),
        );
        tracing::debug!("Remote store bound: '{}'", remote.store_id());
        *lock(&self.inner.remote) = Some(remote.clone());
        Ok(remote)
    }

    fn current_or_new_remote(&self) -> Result<RemoteStore> {
        if let Some(remote) = lock(&self.inner.remote).clone() {
            return Ok(remote);
        }
        self.bind_remote()
    }

    fn drop_remote(&self) {
        *lock(&self.inner.remote) = None;
    }

    /// Project replication events onto the sync-state machine.
    fn spawn_event_pump(&self, mut events: mpsc::Receiver<ReplicationEvent>) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ReplicationEvent::Active => {
                        coordinator
                            .inner
                            .state
                            .set(SyncState::Active, SyncDetail::default());
                    }
                    ReplicationEvent::Change {
                        direction,
                        docs_read,
                        docs_written,
                    } => {
                        coordinator.inner.state.set(
                            SyncState::Change,
                            SyncDetail::for_change(direction, docs_read, docs_written),
                        );
                    }
                    ReplicationEvent::Paused => {
                        coordinator
                            .inner
                            .state
                            .set(SyncState::Paused, SyncDetail::default());
                    }
                    ReplicationEvent::Denied { reason } => {
                        tracing::error!("Replication denied: {reason}");
                        // Denied sessions are not retried automatically; a
                        // stop/start cycle is required to recover.
                        coordinator.inner.state.set(
                            SyncState::Error,
                            SyncDetail::with_cause(SyncErrorCause::Denied),
                        );
                    }
                    ReplicationEvent::Error { status, message } => {
                        tracing::error!("Replication error: {message}");
                        coordinator
                            .inner
                            .state
                            .set(SyncState::Error, SyncDetail::with_cause(SyncErrorCause::Sync));

                        if matches!(status, Some(401 | 403)) {
                            // An auth-class failure is the session
                            // manager's problem before it is ours.
                            coordinator.inner.sessions.refresh_silently().await;
                        }
                    }
                    ReplicationEvent::Complete => {
                        let intentional = coordinator.inner.manual_stop.load(Ordering::SeqCst);
                        let current = coordinator.inner.state.current();
                        if !intentional && current != SyncState::Offline {
                            coordinator
                                .inner
                                .state
                                .set(SyncState::Complete, SyncDetail::default());
                        }
                    }
                }
            }
        });
    }

    fn spawn_auth_listener(&self) {
        let coordinator = self.clone();
        let mut events = self.inner.sessions.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(AuthEvent::SyncOnline) => {
                        if let Err(e) = coordinator.rebind_and_start().await {
                            tracing::error!("Could not start replication: {e}");
                        }
                    }
                    Ok(AuthEvent::SyncOffline) => {
                        coordinator.handle_sync_offline().await;
                    }
                    Ok(AuthEvent::Unauthenticated) => {
                        coordinator.stop_sync().await;
                        coordinator.drop_remote();
                    }
                    Ok(AuthEvent::RefreshSucceeded) => {
                        if coordinator.inner.sessions.is_sync_online() {
                            if let Err(e) = coordinator.restart_with_fresh_binding().await {
                                tracing::error!(
                                    "Could not restart replication after refresh: {e}"
                                );
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Sync coordinator lagged by {skipped} auth events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Rebuild the remote binding and start replication.
    async fn rebind_and_start(&self) -> Result<()> {
        self.bind_remote()?;
        self.start_sync().await
    }

    /// Token rotated: tear down the session and rebuild the binding so
    /// every request carries the new token.
    async fn restart_with_fresh_binding(&self) -> Result<()> {
        self.stop_sync().await;
        self.bind_remote()?;
        self.start_sync().await
    }

    async fn handle_sync_offline(&self) {
        self.stop_sync().await;
        if !self.inner.connectivity.online() {
            // Lost connectivity, not user choice: show `offline` rather
            // than `inactive`.
            self.inner
                .state
                .set(SyncState::Offline, SyncDetail::with_reason("connection_lost"));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
