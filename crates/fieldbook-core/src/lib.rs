//! # Fieldbook Core Library
//!
//! `fieldbook-core` provides the offline-first session and replication
//! coordination for Fieldbook, a record-keeping application for naturalist
//! field work that must keep working while disconnected and reconcile
//! changes once connectivity returns.
//!
//! ## Features
//!
//! - **Connectivity monitoring**: health-probe based online/offline
//!   detection with exponential backoff and background re-validation
//! - **Secure session storage**: capability-probing persistence with
//!   durable, obfuscated and volatile backends
//! - **Session management**: access-token lifecycle with silent refresh
//!   across online/offline transitions
//! - **Sync coordination**: a debounced state machine driving a continuous
//!   bidirectional replication session between local and remote stores
//!
//! ## Modules
//!
//! - [`api`] - HTTP client for the authentication contract
//! - [`config`] - Configuration management
//! - [`connectivity`] - Online/offline detection with backoff
//! - [`replication`] - Store handles and the replication seam
//! - [`session`] - Session, token and authentication state management
//! - [`storage`] - Secure capability-probing key/value persistence
//! - [`sync`] - Replication coordination and the sync state machine
//!
//! ## Example
//!
//! ```rust,ignore
//! use fieldbook_core::config::Config;
//! use fieldbook_core::connectivity::ConnectivityMonitor;
//! use fieldbook_core::session::SessionManager;
//!
//! let config = Config::load()?;
//! let connectivity = ConnectivityMonitor::new(config.connectivity.clone(), &config.server);
//! let sessions = SessionManager::new(&config, connectivity.clone(), store, prompt)?;
//! sessions.bootstrap().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::unused_async)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]

pub mod api;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod replication;
pub mod session;
pub mod storage;
pub mod sync;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Margin before access-token expiry at which a silent refresh fires
pub const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 120;

/// Seed interval for connectivity retry backoff (30 s)
pub const DEFAULT_INITIAL_RETRY_SECS: u64 = 30;

/// Ceiling for connectivity retry backoff (5 min)
pub const DEFAULT_MAX_RETRY_SECS: u64 = 300;

/// Timeout for a single liveness probe
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 3;

/// Background re-probe interval while online
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Debounce window for low-priority sync-state transitions
pub const DEFAULT_SYNC_DEBOUNCE_MS: u64 = 300;

/// Session lifetime when the user asked to be remembered (7 days)
pub const REMEMBERED_SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Session lifetime for a single sitting (1 day)
pub const SHORT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
