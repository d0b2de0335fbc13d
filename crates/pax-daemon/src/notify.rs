//! Digest notification queue.
//!
//! Engine events are queued per actor and delivered in batches when the
//! digest flush timer fires. Two gates apply before anything is queued:
//!
//! - the actor must have opted in through the consent registry
//! - the actor must be under the per-day cap, counted in UTC days
//!
//! Delivery itself belongs to a [`DigestSink`]; the default sink writes
//! digests to the log.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use pax_core::clock::{Clock, SystemClock};
use pax_core::error::ExternalError;
use pax_core::events::EngineEvent;
use pax_core::external::NotificationChannel;
use serde::Serialize;
use tracing::{debug, info, warn};

/// A batch of events for one actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Digest {
    /// Recipient.
    pub actor: String,
    /// Events in the order they were queued.
    pub events: Vec<EngineEvent>,
    /// When the digest was assembled.
    pub flushed_at: DateTime<Utc>,
}

/// Delivery transport for digests.
#[async_trait]
pub trait DigestSink: Send + Sync {
    /// Delivers one digest.
    async fn deliver(&self, digest: &Digest) -> Result<(), ExternalError>;
}

/// Sink that writes each digest to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDigestSink;

#[async_trait]
impl DigestSink for LogDigestSink {
    async fn deliver(&self, digest: &Digest) -> Result<(), ExternalError> {
        let kinds: Vec<&str> = digest.events.iter().map(EngineEvent::name).collect();
        info!(
            actor = %digest.actor,
            events = digest.events.len(),
            kinds = ?kinds,
            "notification digest"
        );
        Ok(())
    }
}

/// Result of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Digests handed to the sink successfully.
    pub delivered: usize,
    /// Digests the sink refused; their events are dropped.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
struct DailyCount {
    day: NaiveDate,
    count: u32,
}

/// Consent-gated, capped, batching notification channel.
pub struct DigestNotificationQueue {
    consent: DashMap<String, bool>,
    pending: Mutex<BTreeMap<String, Vec<EngineEvent>>>,
    daily: DashMap<String, DailyCount>,
    daily_cap: u32,
    sink: Arc<dyn DigestSink>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for DigestNotificationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestNotificationQueue")
            .field("consented", &self.consent.len())
            .field("pending_actors", &self.pending.lock().len())
            .field("daily_cap", &self.daily_cap)
            .finish_non_exhaustive()
    }
}

impl DigestNotificationQueue {
    /// Creates a queue on the system clock.
    #[must_use]
    pub fn new(daily_cap: u32, sink: Arc<dyn DigestSink>) -> Self {
        Self::with_clock(daily_cap, sink, Arc::new(SystemClock))
    }

    /// Creates a queue on an explicit clock.
    #[must_use]
    pub fn with_clock(daily_cap: u32, sink: Arc<dyn DigestSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            consent: DashMap::new(),
            pending: Mutex::new(BTreeMap::new()),
            daily: DashMap::new(),
            daily_cap,
            sink,
            clock,
        }
    }

    /// Records an actor's consent decision.
    pub fn set_consent(&self, actor: &str, consented: bool) {
        let key = actor.trim().to_ascii_lowercase();
        if consented {
            self.consent.insert(key, true);
        } else {
            self.consent.remove(&key);
            self.pending.lock().remove(&key);
        }
        debug!(actor, consented, "notification consent updated");
    }

    /// Whether `actor` has consented.
    #[must_use]
    pub fn has_consent(&self, actor: &str) -> bool {
        self.consent
            .get(&actor.trim().to_ascii_lowercase())
            .is_some_and(|consented| *consented)
    }

    /// Events currently queued for `actor`.
    #[must_use]
    pub fn pending_for(&self, actor: &str) -> usize {
        self.pending
            .lock()
            .get(&actor.trim().to_ascii_lowercase())
            .map_or(0, Vec::len)
    }

    /// Drains every queue and hands one digest per actor to the sink.
    ///
    /// Daily counters from earlier UTC days are dropped first.
    pub async fn flush(&self) -> FlushReport {
        let today = self.clock.now().date_naive();
        self.daily.retain(|_, counter| counter.day == today);
        let drained = std::mem::take(&mut *self.pending.lock());
        let mut report = FlushReport::default();
        if drained.is_empty() {
            return report;
        }
        let flushed_at = self.clock.now();
        for (actor, events) in drained {
            let digest = Digest {
                actor,
                events,
                flushed_at,
            };
            match self.sink.deliver(&digest).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        actor = %digest.actor,
                        events = digest.events.len(),
                        error = %e,
                        "digest delivery failed, dropping"
                    );
                    report.failed += 1;
                },
            }
        }
        debug!(
            delivered = report.delivered,
            failed = report.failed,
            "notification digests flushed"
        );
        report
    }

    fn take_daily_slot(&self, key: &str) -> bool {
        let today = self.clock.now().date_naive();
        let mut entry = self
            .daily
            .entry(key.to_string())
            .or_insert(DailyCount { day: today, count: 0 });
        if entry.day != today {
            *entry = DailyCount { day: today, count: 0 };
        }
        if entry.count >= self.daily_cap {
            return false;
        }
        entry.count += 1;
        true
    }
}

#[async_trait]
impl NotificationChannel for DigestNotificationQueue {
    async fn may_notify(&self, actor: &str) -> bool {
        self.has_consent(actor)
    }

    async fn enqueue(&self, actor: &str, event: EngineEvent) -> Result<(), ExternalError> {
        let key = actor.trim().to_ascii_lowercase();
        if !self.has_consent(&key) {
            return Err(ExternalError::Rejected(format!(
                "{actor} has not consented to notifications"
            )));
        }
        if !self.take_daily_slot(&key) {
            debug!(
                actor,
                event = event.name(),
                cap = self.daily_cap,
                "daily notification cap reached"
            );
            return Err(ExternalError::Rejected(format!(
                "{actor} reached the daily cap of {} notifications",
                self.daily_cap
            )));
        }
        self.pending.lock().entry(key).or_default().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use pax_core::clock::ManualClock;
    use pax_core::lease::LeaseStatus;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        digests: Mutex<Vec<Digest>>,
    }

    #[async_trait]
    impl DigestSink for RecordingSink {
        async fn deliver(&self, digest: &Digest) -> Result<(), ExternalError> {
            self.digests.lock().push(digest.clone());
            Ok(())
        }
    }

    fn event(at: DateTime<Utc>) -> EngineEvent {
        EngineEvent::LeaseTransitioned {
            lease_id: "lease-1".to_string(),
            vertical: "solar".to_string(),
            from: Some(LeaseStatus::Active),
            to: LeaseStatus::GracePeriod,
            holder: Some("0xHolder".to_string()),
            at,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 23, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_requires_consent() {
        let queue = DigestNotificationQueue::new(20, Arc::new(LogDigestSink));
        assert!(!queue.may_notify("0xHolder").await);
        assert!(queue.enqueue("0xHolder", event(t0())).await.is_err());

        queue.set_consent("0xHOLDER", true);
        assert!(queue.may_notify("0xholder").await);
        queue.enqueue("0xHolder", event(t0())).await.unwrap();
        assert_eq!(queue.pending_for("0xholder"), 1);

        queue.set_consent("0xHolder", false);
        assert_eq!(queue.pending_for("0xHolder"), 0);
    }

    #[tokio::test]
    async fn test_daily_cap_resets_at_utc_midnight() {
        let clock = Arc::new(ManualClock::new(t0()));
        let queue = DigestNotificationQueue::with_clock(3, Arc::new(LogDigestSink), clock.clone());
        queue.set_consent("0xHolder", true);
        for _ in 0..3 {
            queue.enqueue("0xHolder", event(t0())).await.unwrap();
        }
        assert!(queue.enqueue("0xHolder", event(t0())).await.is_err());

        clock.advance(Duration::hours(1));
        queue.enqueue("0xHolder", event(t0())).await.unwrap();
        assert_eq!(queue.pending_for("0xHolder"), 4);
    }

    #[tokio::test]
    async fn test_flush_groups_events_per_actor() {
        let clock = Arc::new(ManualClock::new(t0()));
        let sink = Arc::new(RecordingSink::default());
        let queue = DigestNotificationQueue::with_clock(20, sink.clone(), clock.clone());
        queue.set_consent("0xA", true);
        queue.set_consent("0xB", true);
        queue.enqueue("0xA", event(t0())).await.unwrap();
        queue.enqueue("0xB", event(t0())).await.unwrap();
        queue.enqueue("0xA", event(t0())).await.unwrap();

        let report = queue.flush().await;
        assert_eq!(report.delivered, 2);
        let digests = sink.digests.lock().clone();
        assert_eq!(digests[0].actor, "0xa");
        assert_eq!(digests[0].events.len(), 2);
        assert_eq!(digests[1].events.len(), 1);
        assert_eq!(digests[0].flushed_at, t0());

        assert_eq!(queue.flush().await, FlushReport::default());
    }

    #[tokio::test]
    async fn test_flush_drops_counters_from_previous_days() {
        let clock = Arc::new(ManualClock::new(t0()));
        let queue = DigestNotificationQueue::with_clock(5, Arc::new(LogDigestSink), clock.clone());
        queue.set_consent("0xA", true);
        queue.set_consent("0xB", true);
        queue.enqueue("0xA", event(t0())).await.unwrap();
        queue.flush().await;
        assert_eq!(queue.daily.len(), 1);

        clock.advance(Duration::hours(2));
        queue.enqueue("0xB", event(t0())).await.unwrap();
        queue.flush().await;
        assert_eq!(queue.daily.len(), 1);
        assert!(queue.daily.contains_key("0xb"));
    }
}
