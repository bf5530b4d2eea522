//! Store handles and the replication seam.
//!
//! The replication wire protocol itself lives outside this crate: the sync
//! coordinator orchestrates an existing continuous bidirectional session,
//! it does not speak the protocol. This module defines the seam — the
//! local and remote store handles, the event vocabulary a replication
//! session emits, and the [`Replicator`] trait a protocol implementation
//! plugs into.
//!
//! Access tokens rotate far more often than a store handle lives, so the
//! remote handle never bakes a token in: every outgoing request pulls the
//! *current* bearer token from a [`TokenSource`] at send time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::error::{Error, Result};

/// Supplier of the current bearer token. Implemented by the session
/// manager; replication code never reads token storage directly.
pub trait TokenSource: Send + Sync {
    /// The access token to present right now, if any valid one exists.
    fn bearer_token(&self) -> Option<String>;
}

/// Handle to the local durable store.
///
/// Initialized once, eagerly, independent of auth state — local-only
/// operation must always work.
#[derive(Debug, Clone)]
pub struct LocalStore {
    name: String,
    path: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) the local store directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(name: &str, data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(name);
        std::fs::create_dir_all(&path)
            .map_err(|e| Error::StorageFailed(format!("cannot open local store '{name}': {e}")))?;

        tracing::debug!("Local store '{name}' ready at {}", path.display());
        Ok(Self {
            name: name.to_string(),
            path,
        })
    }

    /// Store name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// On-disk location of the store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Handle to the per-user remote store, bound to a token source rather
/// than a token.
#[derive(Clone)]
pub struct RemoteStore {
    url: String,
    store_id: String,
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("url", &self.url)
            .field("store_id", &self.store_id)
            .finish_non_exhaustive()
    }
}

impl RemoteStore {
    /// Bind a remote store handle for `store_id`.
    #[must_use]
    pub fn new(server: &ServerConfig, store_id: &str, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            url: server.replication_url(store_id),
            store_id: store_id.to_string(),
            client: reqwest::Client::new(),
            tokens,
        }
    }

    /// Identifier of the remote store.
    #[must_use]
    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    /// Base URL of the remote store.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Build a request against the store with the current bearer token
    /// injected. This is the rotation point: the handle outlives any
    /// individual token.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] when no valid token is available.
    pub fn authorized_request(
        &self,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder> {
        let token = self.tokens.bearer_token().ok_or(Error::Unauthorized)?;
        let url = if path.is_empty() {
            self.url.clone()
        } else {
            format!("{}/{}", self.url, path.trim_start_matches('/'))
        };
        Ok(self.client.request(method, url).bearer_auth(token))
    }
}

/// Direction of a replication batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationDirection {
    /// Local documents flowing to the remote store
    Push,
    /// Remote documents flowing to the local store
    Pull,
}

/// Events emitted by a running replication session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    /// The session is processing documents
    Active,
    /// A batch of documents moved
    Change {
        /// Which way the batch flowed
        direction: ReplicationDirection,
        /// Documents read from the source
        docs_read: u64,
        /// Documents written to the target
        docs_written: u64,
    },
    /// Both sides are caught up; the session idles until new changes
    Paused,
    /// The remote store refused access
    Denied {
        /// Server-provided reason
        reason: String,
    },
    /// Transport or storage failure
    Error {
        /// HTTP status, when the failure was an HTTP response
        status: Option<u16>,
        /// Failure description
        message: String,
    },
    /// The session finished naturally (non-continuous or cancelled)
    Complete,
}

/// A running replication session. Dropping the handle does not stop the
/// session; call [`ReplicationHandle::cancel`].
#[derive(Debug)]
pub struct ReplicationHandle {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ReplicationHandle {
    /// Wrap a spawned replication task with its shutdown channel.
    #[must_use]
    pub fn new(shutdown: broadcast::Sender<()>, task: JoinHandle<()>) -> Self {
        Self { shutdown, task }
    }

    /// Cancel the session immediately.
    pub fn cancel(self) {
        let _ = self.shutdown.send(());
        self.task.abort();
    }

    /// Whether the underlying task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// A replication protocol implementation.
///
/// `replicate` starts a continuous bidirectional session between the two
/// stores and reports its lifecycle through `events`. It returns once the
/// session is running; the handle stops it.
pub trait Replicator: Send + Sync {
    /// Start a replication session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be started at all; runtime
    /// failures are reported as [`ReplicationEvent::Error`] events.
    fn replicate(
        &self,
        local: &LocalStore,
        remote: &RemoteStore,
        events: mpsc::Sender<ReplicationEvent>,
    ) -> Result<ReplicationHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FixedToken(Option<String>);

    impl TokenSource for FixedToken {
        fn bearer_token(&self) -> Option<String> {
            self.0.clone()
        }
    }

    #[test]
    fn test_local_store_open_creates_directory() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open("fieldbook_local", dir.path()).unwrap();

        assert_eq!(store.name(), "fieldbook_local");
        assert!(store.path().is_dir());
    }

    #[tokio::test]
    async fn test_authorized_request_injects_current_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/db/records_u42/_changes"))
            .and(header("Authorization", "Bearer tok-now"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = ServerConfig {
            base_url: server.uri(),
            ..Default::default()
        };
        let remote = RemoteStore::new(
            &config,
            "records_u42",
            Arc::new(FixedToken(Some("tok-now".to_string()))),
        );

        let response = remote
            .authorized_request(reqwest::Method::GET, "_changes")
            .unwrap()
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());
    }

    #[test]
    fn test_authorized_request_without_token_fails() {
        let config = ServerConfig::default();
        let remote = RemoteStore::new(&config, "records_u42", Arc::new(FixedToken(None)));

        let result = remote.authorized_request(reqwest::Method::GET, "");
        assert!(matches!(result, Err(Error::Unauthorized)));
    }

    #[tokio::test]
    async fn test_replication_handle_cancel_stops_task() {
        let (shutdown, _) = broadcast::channel(1);
        let mut rx = shutdown.subscribe();
        let task = tokio::spawn(async move {
            let _ = rx.recv().await;
        });

        let handle = ReplicationHandle::new(shutdown, task);
        assert!(!handle.is_finished());
        handle.cancel();
    }
}
