//! Connectivity detection with API health checks.
//!
//! The platform's idea of "connected" is not good enough for replication:
//! a machine can hold a link while the API is down, and captive portals
//! answer anything. The monitor therefore probes a lightweight health
//! endpoint and exposes a two-valued state (`Online`/`Offline`) via
//! subscription, with exponential backoff while down and periodic
//! background re-validation while up.
//!
//! The monitor is an explicit long-lived service object constructed once
//! at process start; clone it cheaply to hand it to consumers.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::{ConnectivityConfig, ServerConfig};

/// Connectivity state change, emitted only on actual transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// The health endpoint answered; replication may be attempted
    Online,
    /// The health endpoint is unreachable
    Offline,
}

/// Monitors connectivity to the Fieldbook server.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    health_url: String,
    config: ConnectivityConfig,
    online: AtomicBool,
    retry_count: AtomicU32,
    events: broadcast::Sender<ConnectivityEvent>,
    timers: Mutex<Timers>,
}

#[derive(Default)]
struct Timers {
    retry: Option<JoinHandle<()>>,
    poll: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("health_url", &self.inner.health_url)
            .field("online", &self.online())
            .finish_non_exhaustive()
    }
}

impl ConnectivityMonitor {
    /// Create a new monitor and schedule the initial probe.
    ///
    /// Must be called from within a tokio runtime. The monitor starts in
    /// the offline state; the first successful probe emits [`ConnectivityEvent::Online`].
    #[must_use]
    pub fn new(config: ConnectivityConfig, server: &ServerConfig) -> Self {
        let (events, _) = broadcast::channel(32);
        let client = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .unwrap_or_default();

        let inner = Arc::new(Inner {
            client,
            health_url: server.health_url(),
            config,
            online: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            events,
            timers: Mutex::new(Timers::default()),
        });

        let monitor = Self { inner };
        let startup = Arc::clone(&monitor.inner);
        tokio::spawn(async move {
            Inner::check_connection(&startup).await;
        });
        monitor
    }

    /// Last-known connectivity state. Synchronous and cheap.
    #[must_use]
    pub fn online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Subscribe to connectivity transitions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.inner.events.subscribe()
    }

    /// Force an immediate probe, bypassing any pending retry timer.
    pub async fn check(&self) {
        Inner::check_connection(&self.inner).await;
    }

    /// Feed a platform-level reachability hint into the monitor.
    ///
    /// A `false` hint short-circuits directly to the offline path without
    /// waiting for a probe to time out; a `true` hint triggers a probe
    /// (the platform's optimism is verified before we believe it).
    pub fn report_link_change(&self, up: bool) {
        let inner = Arc::clone(&self.inner);
        if up {
            tokio::spawn(async move {
                Inner::check_connection(&inner).await;
            });
        } else {
            Inner::emit_offline(&inner);
            Inner::schedule_retry(&inner);
        }
    }

    /// Stop background timers. The monitor keeps answering `online()` with
    /// the last-known value but no longer probes.
    pub fn shutdown(&self) {
        let mut timers = self
            .inner
            .timers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(handle) = timers.retry.take() {
            handle.abort();
        }
        if let Some(handle) = timers.poll.take() {
            handle.abort();
        }
    }
}

impl Inner {
    async fn probe(&self) -> bool {
        match self
            .client
            .head(&self.health_url)
            .header("Cache-Control", "no-cache")
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("Liveness probe failed: {e}");
                false
            }
        }
    }

    async fn check_connection(this: &Arc<Self>) {
        if this.probe().await {
            this.emit_online();
            this.retry_count.store(0, Ordering::SeqCst);
            Self::start_polling(this);
        } else {
            Self::emit_offline(this);
            Self::schedule_retry(this);
        }
    }

    /// Transition to online. Repeated calls while already online never re-emit.
    fn emit_online(&self) {
        if !self.online.swap(true, Ordering::SeqCst) {
            tracing::info!("Connectivity restored");
            let _ = self.events.send(ConnectivityEvent::Online);
        }
    }

    /// Transition to offline. Repeated calls while already offline never re-emit.
    fn emit_offline(this: &Arc<Self>) {
        if this.online.swap(false, Ordering::SeqCst) {
            tracing::warn!("Connectivity lost");
            let _ = this.events.send(ConnectivityEvent::Offline);
        }
        this.stop_polling();
    }

    /// Schedule the next probe with exponential backoff.
    fn schedule_retry(this: &Arc<Self>) {
        let count = this.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = retry_delay(count, &this.config);
        tracing::debug!("Scheduling connectivity retry #{count} in {delay:?}");

        let inner = Arc::clone(this);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            Self::check_connection(&inner).await;
        });

        let mut timers = this
            .timers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(previous) = timers.retry.replace(handle) {
            previous.abort();
        }
        if let Some(poll) = timers.poll.take() {
            poll.abort();
        }
    }

    /// Re-probe periodically while online to catch silent API outages.
    fn start_polling(this: &Arc<Self>) {
        if !this.config.poll_enabled {
            return;
        }

        let inner = Arc::clone(this);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(inner.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                if inner.online.load(Ordering::SeqCst) {
                    Self::check_connection(&inner).await;
                }
            }
        });

        let mut timers = this
            .timers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(previous) = timers.poll.replace(handle) {
            previous.abort();
        }
    }

    fn stop_polling(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(handle) = timers.poll.take() {
            handle.abort();
        }
    }
}

/// Delay before retry attempt `retry_count` (1-based): the seed interval
/// doubling up to a capped ceiling.
#[must_use]
pub fn retry_delay(retry_count: u32, config: &ConnectivityConfig) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(16);
    config
        .initial_retry
        .saturating_mul(1 << exponent)
        .min(config.max_retry)
}
