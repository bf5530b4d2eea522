//! Common test utilities for Fieldbook integration tests.
//!
//! Builds the full service stack (connectivity monitor, secure store,
//! session manager) against a wiremock server, and seeds stored sessions
//! so tests can start from any point of the lifecycle.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fieldbook_core::config::{Config, InstallMode, StorageConfig};
use fieldbook_core::connectivity::ConnectivityMonitor;
use fieldbook_core::session::{
    AccessToken, ContinueOfflinePrompt, SessionManager, SessionRecord, StaleSessionPrompt,
    SESSION_KEY, TOKEN_KEY,
};
use fieldbook_core::storage::SecureStore;

/// The assembled service stack for one test.
pub struct TestStack {
    pub server: MockServer,
    pub config: Config,
    pub connectivity: ConnectivityMonitor,
    pub store: Arc<SecureStore>,
    pub sessions: SessionManager,
    pub dir: tempfile::TempDir,
}

/// Build a stack against a fresh mock server and temp data directory.
pub async fn stack() -> TestStack {
    stack_with_prompt(Arc::new(ContinueOfflinePrompt)).await
}

/// Build a stack with a specific stale-session prompt.
pub async fn stack_with_prompt(prompt: Arc<dyn StaleSessionPrompt>) -> TestStack {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().expect("Failed to create temp directory");

    let mut config = Config::default();
    config.server.base_url = server.uri();
    config.storage = StorageConfig {
        mode: InstallMode::Installed,
        data_dir: Some(dir.path().to_path_buf()),
    };
    config.connectivity.probe_timeout = Duration::from_millis(500);
    config.connectivity.poll_enabled = false;
    config.sync.debounce_window = Duration::from_millis(10);

    let connectivity = ConnectivityMonitor::new(config.connectivity.clone(), &config.server);
    let store = Arc::new(SecureStore::open(&config.storage));
    let sessions = SessionManager::new(&config, connectivity.clone(), Arc::clone(&store), prompt);

    TestStack {
        server,
        config,
        connectivity,
        store,
        sessions,
        dir,
    }
}

/// Mount a healthy liveness endpoint and settle the monitor online.
///
/// Waits for the session manager's connectivity listener to drain the
/// transition before returning, so tests can seed state without racing it.
pub async fn go_online(stack: &TestStack) {
    Mock::given(method("HEAD"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&stack.server)
        .await;
    stack.connectivity.check().await;
    assert!(stack.connectivity.online());
    settle().await;
}

/// Settle the monitor offline (the mock server answers probes with 503).
pub async fn go_offline(stack: &TestStack) {
    Mock::given(method("HEAD"))
        .and(path("/api/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&stack.server)
        .await;
    stack.connectivity.check().await;
    assert!(!stack.connectivity.online());
    settle().await;
}

/// A session record that is valid for offline work and refreshable.
pub fn fresh_session() -> SessionRecord {
    let now = Utc::now();
    SessionRecord {
        username: "linnaea".to_string(),
        email: "l@club.org".to_string(),
        role: "member".to_string(),
        remote_store_id: "records_linnaea".to_string(),
        refresh_token: "ref-1".to_string(),
        refresh_token_expires_at: now + chrono::Duration::days(7),
        remember_me: true,
        expires_at: now + chrono::Duration::days(7),
    }
}

/// A session record whose refresh path is exhausted but which is still
/// usable offline.
pub fn stale_session() -> SessionRecord {
    let mut session = fresh_session();
    session.refresh_token_expires_at = Utc::now() - chrono::Duration::hours(1);
    session
}

/// Persist a session record as a previous run would have left it.
pub fn seed_session(stack: &TestStack, session: &SessionRecord) {
    stack.store.set_remember(session.remember_me);
    stack
        .store
        .store_securely(SESSION_KEY, session)
        .expect("Failed to seed session");
}

/// Persist a valid access token expiring in one hour.
pub fn seed_token(stack: &TestStack, token: &str) {
    stack
        .store
        .store_securely(
            TOKEN_KEY,
            &AccessToken {
                token: token.to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            },
        )
        .expect("Failed to seed token");
}

/// Standard successful login response body.
pub fn login_body() -> serde_json::Value {
    serde_json::json!({
        "data": {
            "user": {"username": "linnaea", "email": "l@club.org", "role": "member"},
            "token": "tok-1",
            "refreshToken": "ref-1",
            "tokenExpiresAt": (Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
            "refreshTokenExpiresAt": (Utc::now() + chrono::Duration::days(7)).to_rfc3339(),
            "dbName": "records_linnaea",
        }
    })
}

/// Standard successful refresh response body.
pub fn refresh_body(token: &str) -> serde_json::Value {
    serde_json::json!({
        "data": {
            "token": token,
            "expiresAt": (Utc::now() + chrono::Duration::hours(1)).to_rfc3339(),
        }
    })
}

/// Give spawned listener tasks a moment to drain their channels.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
