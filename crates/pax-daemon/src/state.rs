//! Shared daemon state.
//!
//! Holds the engine, the notification queue and the shutdown flag that
//! every background task and HTTP handler sees.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use pax_core::MarketEngine;

use crate::notify::DigestNotificationQueue;

/// Shared daemon state handed to handlers and timers.
pub type SharedState = Arc<DaemonStateHandle>;

/// Handle to daemon state.
#[derive(Debug)]
pub struct DaemonStateHandle {
    engine: MarketEngine,
    notifications: Arc<DigestNotificationQueue>,
    /// Shutdown flag (atomic for lock-free checking).
    shutdown: AtomicBool,
    started_at: DateTime<Utc>,
}

impl DaemonStateHandle {
    /// Creates a daemon state handle around a built engine.
    #[must_use]
    pub fn new(engine: MarketEngine, notifications: Arc<DigestNotificationQueue>) -> Self {
        Self {
            engine,
            notifications,
            shutdown: AtomicBool::new(false),
            started_at: Utc::now(),
        }
    }

    /// The market engine.
    #[must_use]
    pub const fn engine(&self) -> &MarketEngine {
        &self.engine
    }

    /// The digest notification queue the engine enqueues into.
    #[must_use]
    pub const fn notifications(&self) -> &Arc<DigestNotificationQueue> {
        &self.notifications
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Get the daemon start time.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Get daemon uptime in seconds.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        let now = Utc::now();
        u64::try_from((now - self.started_at).num_seconds()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use pax_core::config::PaxConfig;

    use super::*;
    use crate::notify::LogDigestSink;

    #[test]
    fn test_shutdown_flag() {
        let notifications = Arc::new(DigestNotificationQueue::new(20, Arc::new(LogDigestSink)));
        let engine = MarketEngine::builder(PaxConfig::default())
            .notifier(notifications.clone())
            .build();
        let state = DaemonStateHandle::new(engine, notifications);
        assert!(!state.is_shutdown_requested());
        state.request_shutdown();
        assert!(state.is_shutdown_requested());
        assert!(state.started_at() <= Utc::now());
    }
}
