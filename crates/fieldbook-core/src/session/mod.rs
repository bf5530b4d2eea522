//! Session, token and authentication state management.
//!
//! A *session record* describes a logged-in user's entitlement to use the
//! app, independent of any specific access token: it is what lets field
//! work continue against the local store while disconnected. The
//! short-lived *access token* only matters while online, and the *refresh
//! token* exists solely to mint new access tokens without re-entering a
//! password.
//!
//! Two independent flags fall out of this: `authenticated` (may the user
//! work at all, possibly against local-only data) and `sync-online` (do we
//! additionally believe the remote store is reachable right now).
//! Authenticated-but-offline is a first-class steady state, not an error.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod manager;

pub use manager::SessionManager;

use crate::api::UserInfo;

/// Storage key for the session record.
pub const SESSION_KEY: &str = "fieldbook_session";

/// Storage key for the access-token record.
pub const TOKEN_KEY: &str = "fieldbook_auth_token";

/// Grace period used when the refresh threshold has already passed, so the
/// timer never fires synchronously into itself.
pub(crate) const IMMEDIATE_REFRESH_GRACE: Duration = Duration::from_millis(100);

/// Durable description of a logged-in user, one per install.
///
/// Owned exclusively by the [`SessionManager`]: created by login, expiry
/// fields updated by refresh, deleted by logout. Everything else reads it
/// through accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Login name
    pub username: String,
    /// Contact email
    pub email: String,
    /// Authorization role
    pub role: String,
    /// Identifier of this user's remote replication store
    pub remote_store_id: String,
    /// Longer-lived credential used solely to mint access tokens
    pub refresh_token: String,
    /// Refresh token expiry
    pub refresh_token_expires_at: DateTime<Utc>,
    /// Whether the user asked to be remembered across restarts
    pub remember_me: bool,
    /// Sole gate for "is this session still usable to work offline"
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Whether this session still entitles the user to work (offline or
    /// not).
    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Whether a new access token can be minted while online.
    #[must_use]
    pub fn can_refresh(&self, now: DateTime<Utc>) -> bool {
        !self.refresh_token.is_empty() && self.refresh_token_expires_at > now
    }

    /// The user described by this session.
    #[must_use]
    pub fn user(&self) -> UserInfo {
        UserInfo {
            username: self.username.clone(),
            email: self.email.clone(),
            role: self.role.clone(),
        }
    }
}

/// Short-lived bearer credential for API and replication calls.
///
/// An expired record is treated identically to an absent one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    /// The bearer token
    pub token: String,
    /// Expiry instant; past this the record is dead weight
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Whether the token can still be presented to the server.
    #[must_use]
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Authentication lifecycle events, consumed by the UI and the sync
/// coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// The user may use the app (possibly against local-only data)
    Authenticated,
    /// No usable session; the app is locked to the login surface
    Unauthenticated,
    /// The remote store is believed reachable; replication should run
    SyncOnline,
    /// Replication must not be attempted right now
    SyncOffline,
    /// A silent token refresh began
    RefreshStarted,
    /// A silent token refresh completed (or fell back cleanly offline)
    RefreshSucceeded,
    /// A silent token refresh failed terminally
    RefreshFailed {
        /// Why the refresh could not complete
        reason: String,
    },
    /// Login completed
    LoginSucceeded {
        /// The logged-in username
        username: String,
    },
    /// Login was rejected or impossible
    LoginFailed {
        /// Why the login failed
        reason: String,
    },
    /// The user logged out (locally final, whatever the server said)
    LoggedOut,
    /// Account registration accepted by the server
    RegistrationSucceeded {
        /// Server confirmation message
        message: String,
    },
    /// Account registration rejected
    RegistrationFailed {
        /// Why the registration failed
        reason: String,
    },
    /// A password reset email was requested
    PasswordResetRequested,
}

/// Outcome of a silent refresh attempt. Concurrent callers all observe the
/// outcome of the single in-flight attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new access token was minted and persisted
    Refreshed,
    /// Offline with a valid session: no token, but still authenticated
    OfflineFallback,
    /// Terminal failure; the session was cleared
    Failed,
}

/// The user's answer to the stale-session decision point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleSessionChoice {
    /// Keep working against the local store with the cached session
    ContinueOffline,
    /// Clear the session and force a fresh login
    Relogin,
}

/// Decision seam for the one state that must never be resolved silently:
/// a valid session, online, but no way to obtain a fresh token.
///
/// The embedder decides how to ask (blocking dialog, banner, stdin); the
/// manager only requires an answer.
pub trait StaleSessionPrompt: Send + Sync {
    /// Ask the user whether to continue offline or re-login.
    fn choose(&self) -> StaleSessionChoice;
}

/// A prompt that always continues offline. Useful for headless consumers
/// and as a conservative default: it never destroys a session by itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinueOfflinePrompt;

impl StaleSessionPrompt for ContinueOfflinePrompt {
    fn choose(&self) -> StaleSessionChoice {
        StaleSessionChoice::ContinueOffline
    }
}

/// Delay until the silent refresh for a token expiring at `expires_at`
/// should fire: `threshold` before expiry, or almost immediately when that
/// instant has already passed.
#[must_use]
pub fn refresh_delay(
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Duration {
    let threshold =
        chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
    (expires_at - now - threshold)
        .to_std()
        .map_or(IMMEDIATE_REFRESH_GRACE, |delay| {
            delay.max(IMMEDIATE_REFRESH_GRACE)
        })
}
