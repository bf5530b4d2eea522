//! The session and token manager.
//!
//! Owns the authenticated/unauthenticated state, the access token and its
//! silent-refresh timer, and the persisted session record. Three
//! independently-changing signals (connectivity, token validity,
//! replication health) meet here; the manager is the single writer of the
//! persisted session state, which is what keeps login, refresh and logout
//! from racing each other into lost updates.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::api::{ApiClient, UserInfo};
use crate::config::{Config, SessionConfig};
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::error::{Error, Result};
use crate::replication::TokenSource;
use crate::storage::SecureStore;

use super::{
    refresh_delay, AccessToken, AuthEvent, RefreshOutcome, SessionRecord, StaleSessionChoice,
    StaleSessionPrompt, SESSION_KEY, TOKEN_KEY,
};

/// Manages the session lifecycle across online/offline transitions.
///
/// An explicit long-lived service object: construct once at process start
/// (inside a tokio runtime) and clone cheaply into consumers.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    api: ApiClient,
    store: Arc<SecureStore>,
    connectivity: ConnectivityMonitor,
    config: SessionConfig,
    events: broadcast::Sender<AuthEvent>,
    authenticated: AtomicBool,
    sync_online: AtomicBool,
    /// Bumped on every identity change (login, logout, account deletion).
    /// In-flight refresh results from an older epoch are discarded rather
    /// than re-authenticating a session the user already left.
    epoch: AtomicU64,
    token_cache: Mutex<Option<AccessToken>>,
    /// Single-flight gate: holds the receiver for the in-flight refresh,
    /// if any. Concurrent callers await that instead of racing a second
    /// network call.
    refresh_gate: tokio::sync::Mutex<Option<watch::Receiver<Option<RefreshOutcome>>>>,
    refresh_timer: Mutex<Option<JoinHandle<()>>>,
    prompt: Arc<dyn StaleSessionPrompt>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("authenticated", &self.is_authenticated())
            .field("sync_online", &self.is_sync_online())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create the manager and attach it to connectivity transitions.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(
        config: &Config,
        connectivity: ConnectivityMonitor,
        store: Arc<SecureStore>,
        prompt: Arc<dyn StaleSessionPrompt>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let manager = Self {
            inner: Arc::new(ManagerInner {
                api: ApiClient::new(config.server.clone()),
                store,
                connectivity,
                config: config.session.clone(),
                events,
                authenticated: AtomicBool::new(false),
                sync_online: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                token_cache: Mutex::new(None),
                refresh_gate: tokio::sync::Mutex::new(None),
                refresh_timer: Mutex::new(None),
                prompt,
            }),
        };
        manager.spawn_connectivity_listener();
        manager
    }

    /// Subscribe to authentication lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.events.subscribe()
    }

    /// Whether the user may use the app (possibly offline).
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.inner.authenticated.load(Ordering::SeqCst)
    }

    /// Whether the remote store is believed reachable for replication.
    #[must_use]
    pub fn is_sync_online(&self) -> bool {
        self.inner.sync_online.load(Ordering::SeqCst)
    }

    /// The stored session record, for non-authentication uses (remote
    /// store identity, profile display). Read-only for callers.
    #[must_use]
    pub fn session_info(&self) -> Option<SessionRecord> {
        self.inner.store.retrieve_securely(SESSION_KEY).ok().flatten()
    }

    /// The current valid access token, if any.
    #[must_use]
    pub fn access_token(&self) -> Option<AccessToken> {
        lock(&self.inner.token_cache)
            .clone()
            .filter(|token| token.is_valid(Utc::now()))
    }

    /// Startup protocol: recover whatever session a previous run left
    /// behind and settle into the matching state.
    ///
    /// # Errors
    ///
    /// Infallible in the protocol itself; errors only surface from event
    /// machinery. A missing or expired session is a normal outcome, not an
    /// error.
    pub async fn bootstrap(&self) -> Result<()> {
        // The remember-me flag is unknown until a session is found, so
        // startup scans every backend instead of routing by flag.
        let Some(raw) = self.inner.store.find_existing_session(SESSION_KEY) else {
            tracing::info!("No previous session found, user is unauthenticated");
            self.emit_unauthenticated();
            self.emit_sync_offline();
            return Ok(());
        };

        let session: SessionRecord = match serde_json::from_str(&raw) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Stored session is unreadable ({e}), treating as absent");
                self.emit_unauthenticated();
                self.emit_sync_offline();
                return Ok(());
            }
        };

        if !session.is_usable(Utc::now()) {
            tracing::info!("Expired session found, user is unauthenticated");
            self.emit_unauthenticated();
            self.emit_sync_offline();
            return Ok(());
        }

        self.inner.store.set_remember(session.remember_me);

        if self.inner.connectivity.online() {
            self.resume_online_auth(&session).await;
        } else {
            tracing::info!("Offline with a valid session, user is authenticated");
            self.emit_authenticated();
            self.emit_sync_offline();
        }
        Ok(())
    }

    /// Log in with username and password. Online only.
    ///
    /// # Errors
    ///
    /// [`Error::Offline`] when connectivity is down, [`Error::LoginRejected`]
    /// when the server refuses the credentials, storage errors when the
    /// session cannot be persisted (the login does not take effect).
    pub async fn login(&self, username: &str, password: &str, remember: bool) -> Result<UserInfo> {
        if !self.inner.connectivity.online() {
            let err = Error::Offline("login");
            self.emit(AuthEvent::LoginFailed {
                reason: err.to_string(),
            });
            return Err(err);
        }

        let data = match self.inner.api.login(username, password).await {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Login failed: {e}");
                self.emit(AuthEvent::LoginFailed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.store.set_remember(remember);

        let ttl = if remember {
            self.inner.config.remembered_session_ttl
        } else {
            self.inner.config.short_session_ttl
        };
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));

        let session = SessionRecord {
            username: data.user.username.clone(),
            email: data.user.email.clone(),
            role: data.user.role.clone(),
            remote_store_id: data.db_name.clone(),
            refresh_token: data.refresh_token.clone(),
            refresh_token_expires_at: data.refresh_token_expires_at,
            remember_me: remember,
            expires_at,
        };
        let token = AccessToken {
            token: data.token.clone(),
            expires_at: data.token_expires_at,
        };

        // Trust-establishing path: persistence failures block the login.
        let persisted = self
            .inner
            .store
            .store_securely(SESSION_KEY, &session)
            .and_then(|()| self.inner.store.store_securely(TOKEN_KEY, &token));
        if let Err(e) = persisted {
            self.emit(AuthEvent::LoginFailed {
                reason: e.to_string(),
            });
            return Err(e);
        }

        self.cache_token(Some(token));
        self.arm_refresh_timer(data.token_expires_at);
        self.emit(AuthEvent::LoginSucceeded {
            username: data.user.username.clone(),
        });
        self.emit_authenticated();
        self.emit_sync_online();
        tracing::info!("User '{}' logged in", data.user.username);
        Ok(data.user)
    }

    /// Log out. The server call is best-effort; the local logout always
    /// completes so local state stays consistent with user intent.
    pub async fn logout(&self) {
        if self.inner.connectivity.online() {
            if let Some(token) = self.valid_stored_token() {
                if let Err(e) = self.inner.api.logout(&token.token).await {
                    tracing::warn!("Server logout failed, proceeding locally: {e}");
                }
            }
        }

        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.emit_unauthenticated();
        self.emit_sync_offline();
        self.clear_session();
        self.emit(AuthEvent::LoggedOut);
        tracing::info!("User logged out");
    }

    /// Request an account. Online only; the server's confirmation message
    /// is returned for display.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<String> {
        if !self.inner.connectivity.online() {
            let err = Error::Offline("register");
            self.emit(AuthEvent::RegistrationFailed {
                reason: err.to_string(),
            });
            return Err(err);
        }

        match self.inner.api.register(username, email, password).await {
            Ok(message) => {
                self.emit(AuthEvent::RegistrationSucceeded {
                    message: message.clone(),
                });
                Ok(message)
            }
            Err(e) => {
                self.emit(AuthEvent::RegistrationFailed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Request a password reset email. Best-effort: a transport failure
    /// after submission still reports the request as made, since the email
    /// may well be on its way.
    pub async fn request_password_reset(&self, email: &str) -> Result<()> {
        if !self.inner.connectivity.online() {
            return Err(Error::Offline("request a password reset"));
        }

        if let Err(e) = self.inner.api.forgot_password(email).await {
            tracing::warn!("Password reset request errored, reporting as accepted: {e}");
        }
        self.emit(AuthEvent::PasswordResetRequested);
        Ok(())
    }

    /// Change the current user's password. Trust-establishing: every
    /// failure propagates, and a 401/403 clears the session outright.
    pub async fn change_password(
        &self,
        username: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<()> {
        if !self.inner.connectivity.online() {
            return Err(Error::Offline("change the password"));
        }
        let Some(token) = self.valid_stored_token() else {
            return Err(Error::Unauthorized);
        };

        match self
            .inner
            .api
            .change_password(&token.token, username, current_password, new_password)
            .await
        {
            Ok(()) => Ok(()),
            Err(Error::Unauthorized) => {
                tracing::warn!("Unauthorized while changing password, clearing session");
                self.emit_unauthenticated();
                self.emit_sync_offline();
                self.clear_session();
                Err(Error::Unauthorized)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the current user's account, then clear all local session
    /// state.
    pub async fn delete_account(&self, password: &str) -> Result<()> {
        if !self.inner.connectivity.online() {
            return Err(Error::Offline("delete the account"));
        }
        let Some(session) = self.valid_stored_session() else {
            return Err(Error::SessionMissing);
        };
        let Some(token) = self.valid_stored_token() else {
            return Err(Error::Unauthorized);
        };

        self.inner
            .api
            .delete_account(&token.token, &session.username, password)
            .await?;

        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.emit_unauthenticated();
        self.emit_sync_offline();
        self.clear_session();
        Ok(())
    }

    /// Fetch the current user from the server, opportunistically. Never
    /// required for offline operation; a 401 clears the session.
    pub async fn current_user(&self) -> Option<UserInfo> {
        if !self.inner.connectivity.online() {
            return None;
        }
        let token = self.valid_stored_token()?;

        match self.inner.api.me(&token.token).await {
            Ok(user) => Some(user),
            Err(Error::Unauthorized) => {
                tracing::warn!("Unauthorized access, clearing session");
                self.emit_unauthenticated();
                self.emit_sync_offline();
                self.clear_session();
                None
            }
            Err(e) => {
                tracing::warn!("Could not fetch user from server: {e}");
                None
            }
        }
    }

    /// Silently refresh the access token.
    ///
    /// At most one refresh is ever in flight: callers arriving while one
    /// is running await the same outcome instead of issuing a duplicate
    /// request. A failed refresh clears the whole session — it is never
    /// partially applied.
    pub async fn refresh_silently(&self) -> RefreshOutcome {
        let tx = {
            let mut gate = self.inner.refresh_gate.lock().await;
            if let Some(in_flight) = gate.as_ref() {
                let mut rx = in_flight.clone();
                drop(gate);
                loop {
                    if let Some(outcome) = *rx.borrow() {
                        return outcome;
                    }
                    if rx.changed().await.is_err() {
                        return RefreshOutcome::Failed;
                    }
                }
            }
            let (tx, rx) = watch::channel(None);
            *gate = Some(rx);
            tx
        };

        self.emit(AuthEvent::RefreshStarted);
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let outcome = self.do_refresh(epoch).await;

        *self.inner.refresh_gate.lock().await = None;
        let _ = tx.send(Some(outcome));
        outcome
    }

    async fn do_refresh(&self, epoch: u64) -> RefreshOutcome {
        let Some(session) = self.valid_stored_session() else {
            tracing::info!("Refresh: no valid session, user is unauthenticated");
            self.emit_unauthenticated();
            self.emit_sync_offline();
            self.emit(AuthEvent::RefreshFailed {
                reason: "no valid session available".to_string(),
            });
            return RefreshOutcome::Failed;
        };

        if !self.inner.connectivity.online() {
            // Cannot refresh while offline; the valid session keeps the
            // user authenticated against the local store.
            tracing::info!("Refresh: offline with a valid session, staying authenticated");
            self.emit_authenticated();
            self.emit_sync_offline();
            self.emit(AuthEvent::RefreshSucceeded);
            return RefreshOutcome::OfflineFallback;
        }

        if !session.can_refresh(Utc::now()) {
            tracing::info!("Refresh: no valid refresh token, user is unauthenticated");
            self.emit_unauthenticated();
            self.emit_sync_offline();
            self.emit(AuthEvent::RefreshFailed {
                reason: "no valid refresh token available".to_string(),
            });
            return RefreshOutcome::Failed;
        }

        match self.inner.api.refresh_token(&session.refresh_token).await {
            Ok(data) => {
                if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                    // The session changed hands while the request was in
                    // flight; a stale result must not re-authenticate.
                    tracing::debug!("Discarding refresh result from a previous session epoch");
                    return RefreshOutcome::Failed;
                }

                let token = AccessToken {
                    token: data.token,
                    expires_at: data.expires_at,
                };
                if let Err(e) = self.inner.store.store_securely(TOKEN_KEY, &token) {
                    tracing::error!("Failed to persist refreshed token: {e}");
                    self.fail_refresh(e.to_string());
                    return RefreshOutcome::Failed;
                }

                self.cache_token(Some(token));
                self.emit(AuthEvent::RefreshSucceeded);
                self.emit_authenticated();
                self.emit_sync_online();
                self.arm_refresh_timer(data.expires_at);
                tracing::debug!("Access token refreshed");
                RefreshOutcome::Refreshed
            }
            Err(e) => {
                if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                    return RefreshOutcome::Failed;
                }
                tracing::error!("Silent token refresh failed: {e}");
                self.fail_refresh(e.to_string());
                RefreshOutcome::Failed
            }
        }
    }

    /// A dead refresh path means the session can no longer be trusted.
    fn fail_refresh(&self, reason: String) {
        self.clear_session();
        self.emit(AuthEvent::RefreshFailed { reason });
        self.emit_unauthenticated();
        self.emit_sync_offline();
    }

    /// Resume authenticated-online state from a valid session: use the
    /// stored token, else refresh, else put the ambiguity to the user.
    async fn resume_online_auth(&self, session: &SessionRecord) {
        if let Some(token) = self.valid_stored_token() {
            let expires_at = token.expires_at;
            self.cache_token(Some(token));
            self.emit_authenticated();
            self.emit_sync_online();
            self.arm_refresh_timer(expires_at);
            tracing::info!("Valid access token found, user is authenticated online");
            return;
        }

        if session.can_refresh(Utc::now()) {
            tracing::info!("No valid access token, attempting silent refresh");
            self.refresh_silently().await;
            return;
        }

        // Online with a valid session but nothing refreshable: an
        // ambiguous state that must not be resolved silently.
        match self.inner.prompt.choose() {
            StaleSessionChoice::Relogin => {
                tracing::info!("Stale session: user chose to re-login, clearing session");
                self.emit_unauthenticated();
                self.emit_sync_offline();
                self.clear_session();
            }
            StaleSessionChoice::ContinueOffline => {
                tracing::info!("Stale session: user chose to keep working offline");
                self.emit_authenticated();
                self.emit_sync_offline();
            }
        }
    }

    fn spawn_connectivity_listener(&self) {
        let manager = self.clone();
        let mut events = self.inner.connectivity.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectivityEvent::Online) => manager.handle_online().await,
                    Ok(ConnectivityEvent::Offline) => manager.handle_offline(),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Connectivity listener lagged by {skipped} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Connectivity came back: re-validate the stored session and try to
    /// resume authenticated-online state.
    async fn handle_online(&self) {
        match self.valid_stored_session() {
            Some(session) => {
                if self.inner.connectivity.online() {
                    self.resume_online_auth(&session).await;
                } else {
                    // Flapped again before we got here.
                    self.emit_sync_offline();
                }
            }
            None => {
                if self.is_authenticated() {
                    // The session vanished while the user was working;
                    // force re-authentication rather than limping on.
                    tracing::warn!("Back online but the session is gone, forcing re-login");
                    self.emit_unauthenticated();
                    self.emit_sync_offline();
                    self.clear_session();
                }
            }
        }
    }

    /// Going offline must never log the user out; only replication stops.
    fn handle_offline(&self) {
        self.emit_sync_offline();
    }

    fn valid_stored_session(&self) -> Option<SessionRecord> {
        self.inner
            .store
            .retrieve_securely::<SessionRecord>(SESSION_KEY)
            .ok()
            .flatten()
            .filter(|session| session.is_usable(Utc::now()))
    }

    fn valid_stored_token(&self) -> Option<AccessToken> {
        self.inner
            .store
            .retrieve_securely::<AccessToken>(TOKEN_KEY)
            .ok()
            .flatten()
            .filter(|token| token.is_valid(Utc::now()))
    }

    fn arm_refresh_timer(&self, expires_at: DateTime<Utc>) {
        let delay = refresh_delay(expires_at, Utc::now(), self.inner.config.refresh_threshold);
        tracing::debug!("Arming token refresh in {delay:?}");

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.refresh_silently().await;
        });

        if let Some(previous) = lock(&self.inner.refresh_timer).replace(handle) {
            previous.abort();
        }
    }

    fn clear_refresh_timer(&self) {
        if let Some(handle) = lock(&self.inner.refresh_timer).take() {
            handle.abort();
        }
    }

    fn clear_session(&self) {
        if let Err(e) = self.inner.store.remove_securely(SESSION_KEY) {
            tracing::warn!("Failed to remove session record: {e}");
        }
        if let Err(e) = self.inner.store.remove_securely(TOKEN_KEY) {
            tracing::warn!("Failed to remove token record: {e}");
        }
        self.cache_token(None);
        self.clear_refresh_timer();
    }

    fn cache_token(&self, token: Option<AccessToken>) {
        *lock(&self.inner.token_cache) = token;
    }

    fn emit(&self, event: AuthEvent) {
        let _ = self.inner.events.send(event);
    }

    fn emit_authenticated(&self) {
        self.inner.authenticated.store(true, Ordering::SeqCst);
        self.emit(AuthEvent::Authenticated);
    }

    fn emit_unauthenticated(&self) {
        self.inner.authenticated.store(false, Ordering::SeqCst);
        self.emit(AuthEvent::Unauthenticated);
    }

    fn emit_sync_online(&self) {
        self.inner.sync_online.store(true, Ordering::SeqCst);
        self.emit(AuthEvent::SyncOnline);
    }

    fn emit_sync_offline(&self) {
        self.inner.sync_online.store(false, Ordering::SeqCst);
        self.emit(AuthEvent::SyncOffline);
    }
}

impl TokenSource for SessionManager {
    fn bearer_token(&self) -> Option<String> {
        lock(&self.inner.token_cache)
            .as_ref()
            .filter(|token| token.is_valid(Utc::now()))
            .map(|token| token.token.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
