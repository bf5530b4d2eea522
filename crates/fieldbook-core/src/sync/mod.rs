//! Replication coordination module.
//!
//! This module drives a continuous bidirectional replication session
//! between the local store and the per-user remote store, in response to
//! authentication and connectivity events. It exposes a single named
//! sync-state machine to the rest of the application.
//!
//! ## States
//!
//! | State | Meaning |
//! |-------|---------|
//! | `Inactive` | No replication session, by choice |
//! | `Active` | Session running |
//! | `Change` | Documents moving right now |
//! | `Paused` | Both sides caught up, session idling |
//! | `Error` | Session failed (`denied` or `sync` cause) |
//! | `Offline` | No session because connectivity is down |
//! | `Complete` | A session finished naturally |
//!
//! Transitions are debounced to keep the UI from flickering, except for
//! `Error`, `Offline` and `Change`, which apply immediately so problems
//! and live progress are never hidden.

use crate::replication::ReplicationDirection;

pub mod coordinator;
pub mod state;

pub use coordinator::{ForceSyncOutcome, SkipReason, SyncCoordinator};
pub use state::StateCell;

/// Named state of the replication session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No replication session, by choice
    Inactive,
    /// Session running
    Active,
    /// Documents moving right now
    Change,
    /// Both sides caught up, session idling
    Paused,
    /// Session failed
    Error,
    /// No session because connectivity is down
    Offline,
    /// A session finished naturally
    Complete,
}

impl SyncState {
    /// Whether this state bypasses the debounce window. Problems and live
    /// progress apply immediately; cosmetic transitions coalesce.
    #[must_use]
    pub fn is_immediate(self) -> bool {
        matches!(self, Self::Error | Self::Offline | Self::Change)
    }

    /// Stable lowercase name for logs and UIs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Change => "change",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Offline => "offline",
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cause attached to an [`SyncState::Error`] transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorCause {
    /// The remote store refused access
    Denied,
    /// Transport or storage failure
    Sync,
}

/// Detail payload accompanying a sync-state transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncDetail {
    /// Direction of the batch, for `Change` transitions
    pub direction: Option<ReplicationDirection>,
    /// Documents read from the source
    pub docs_read: Option<u64>,
    /// Documents written to the target
    pub docs_written: Option<u64>,
    /// Error cause, for `Error` transitions
    pub cause: Option<SyncErrorCause>,
    /// Free-form reason (`connection_lost`, `sync_stopped`, ...)
    pub reason: Option<String>,
}

impl SyncDetail {
    /// Detail carrying only a reason string.
    #[must_use]
    pub fn with_reason(reason: &str) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }

    /// Detail carrying an error cause.
    #[must_use]
    pub fn with_cause(cause: SyncErrorCause) -> Self {
        Self {
            cause: Some(cause),
            ..Self::default()
        }
    }

    /// Detail for a progress (`Change`) transition.
    #[must_use]
    pub fn for_change(direction: ReplicationDirection, docs_read: u64, docs_written: u64) -> Self {
        Self {
            direction: Some(direction),
            docs_read: Some(docs_read),
            docs_written: Some(docs_written),
            ..Self::default()
        }
    }
}

/// A sync-state transition, emitted to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTransition {
    /// State before the transition
    pub old: SyncState,
    /// State after the transition
    pub new: SyncState,
    /// Associated detail payload
    pub detail: SyncDetail,
}
