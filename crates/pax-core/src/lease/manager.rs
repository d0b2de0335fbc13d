//! Lease lifecycle manager.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::state::{LeaseSlot, LeaseStatus};
use crate::bidding::{AuctionRound, BidEvaluator, OpenRound, RoundPurpose};
use crate::clock::Clock;
use crate::config::LeaseConfig;
use crate::error::{EngineError, EntityKind};
use crate::events::EngineEvent;
use crate::external::{NotificationChannel, VerticalRegistry};
use crate::priority::PriorityCache;

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// The sweep did not run because another was in flight.
    pub skipped: bool,
    /// Verticals moved ACTIVE -> GRACE_PERIOD.
    pub entered_grace: Vec<String>,
    /// Verticals moved GRACE_PERIOD -> PAUSED.
    pub paused: Vec<String>,
    /// Verticals moved to EXPIRED.
    pub expired: Vec<String>,
    /// Re-auction rounds opened, as `(vertical, auction_id)`.
    pub reauctions_opened: Vec<(String, String)>,
    /// Expired verticals left for a later sweep by the per-sweep cap.
    pub deferred: Vec<String>,
    /// Verticals whose transition failed to persist.
    pub failed: Vec<String>,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Returns `true` if the sweep changed nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.entered_grace.is_empty()
            && self.paused.is_empty()
            && self.expired.is_empty()
            && self.reauctions_opened.is_empty()
    }
}

/// Clears the in-flight flag when a sweep ends, including on early return.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives lease slots through their lifecycle.
///
/// Every write goes to the registry first and then synchronously
/// invalidates the vertical's priority cache entry. Each load, transition
/// and persist runs under the vertical's lock, so concurrent operations on
/// one vertical apply one after another.
pub struct LeaseLifecycleManager {
    registry: Arc<dyn VerticalRegistry>,
    cache: Arc<PriorityCache>,
    auctions: Arc<BidEvaluator>,
    notifier: Arc<dyn NotificationChannel>,
    config: LeaseConfig,
    clock: Arc<dyn Clock>,
    sweeping: AtomicBool,
    vertical_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl fmt::Debug for LeaseLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseLifecycleManager")
            .field("config", &self.config)
            .field("sweeping", &self.sweeping.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl LeaseLifecycleManager {
    /// Creates a manager.
    #[must_use]
    pub fn new(
        registry: Arc<dyn VerticalRegistry>,
        cache: Arc<PriorityCache>,
        auctions: Arc<BidEvaluator>,
        notifier: Arc<dyn NotificationChannel>,
        config: LeaseConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            cache,
            auctions,
            notifier,
            config,
            clock,
            sweeping: AtomicBool::new(false),
            vertical_locks: DashMap::new(),
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Returns the slot for `vertical`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] if the vertical was never leased and
    /// [`EngineError::ExternalUnavailable`] if the registry cannot be read.
    pub async fn status(&self, vertical: &str) -> Result<LeaseSlot, EngineError> {
        self.load(vertical).await
    }

    /// Awards `vertical` to `holder`.
    ///
    /// Creates the slot on first award; otherwise the slot must be EXPIRED.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for a blank holder,
    /// [`EngineError::StateConflict`] if the slot is still held, and
    /// [`EngineError::ExternalUnavailable`] on registry failure.
    pub async fn award(&self, vertical: &str, holder: &str) -> Result<LeaseSlot, EngineError> {
        let holder = holder.trim();
        if holder.is_empty() {
            return Err(EngineError::validation("holder", "must not be empty"));
        }
        let vertical = vertical.trim();
        if vertical.is_empty() {
            return Err(EngineError::validation("vertical", "must not be empty"));
        }
        let guard = self.lock_vertical(vertical).await;
        let existing = self
            .registry
            .load_slot(vertical)
            .await
            .map_err(|e| EngineError::external("vertical_registry", e))?;

        let now = self.clock.now();
        let (slot, from) = match existing {
            None => (LeaseSlot::award(vertical, holder, now, self.config.duration()), None),
            Some(mut slot) => {
                let from = slot.status;
                slot.reaward(holder, now, self.config.duration())?;
                (slot, Some(from))
            },
        };
        self.persist(&slot).await?;
        drop(guard);
        info!(
            vertical,
            holder,
            lease_id = %slot.lease_id,
            lease_end = %slot.lease_end,
            "lease awarded"
        );
        self.notify_transition(holder, &slot, from).await;
        Ok(slot)
    }

    /// Renews the lease by one term from its current end date.
    ///
    /// Only the current holder may renew, and only from ACTIVE or
    /// GRACE_PERIOD.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown vertical,
    /// [`EngineError::StateConflict`] if `actor` is not the holder or the
    /// slot is PAUSED or EXPIRED, and [`EngineError::ExternalUnavailable`]
    /// on registry failure.
    pub async fn renew(&self, vertical: &str, actor: &str) -> Result<LeaseSlot, EngineError> {
        let guard = self.lock_vertical(vertical).await;
        let mut slot = self.load(vertical).await?;
        if !slot.holder_matches(actor.trim()) {
            return Err(EngineError::conflict(
                EntityKind::Lease,
                vertical,
                "only the current holder may renew",
            ));
        }
        let from = slot.status;
        slot.renew(self.clock.now(), self.config.duration())?;
        self.persist(&slot).await?;
        drop(guard);
        info!(
            vertical,
            lease_end = %slot.lease_end,
            renewal_count = slot.renewal_count,
            "lease renewed"
        );
        if let Some(holder) = slot.holder.clone() {
            self.notify_transition(&holder, &slot, Some(from)).await;
        }
        Ok(slot)
    }

    /// Expires the lease immediately and opens a re-auction.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown vertical,
    /// [`EngineError::StateConflict`] if already expired, and
    /// [`EngineError::ExternalUnavailable`] on registry failure.
    pub async fn expire(&self, vertical: &str) -> Result<LeaseSlot, EngineError> {
        let guard = self.lock_vertical(vertical).await;
        let mut slot = self.load(vertical).await?;
        let from = slot.status;
        slot.expire(self.clock.now())?;
        self.persist(&slot).await?;
        info!(
            vertical,
            previous_holder = slot.previous_holder.as_deref().unwrap_or("none"),
            "lease expired"
        );
        if let Err(e) = self.open_reauction(&slot).await {
            warn!(
                vertical,
                error = %e,
                "re-auction not opened after expiry, next sweep will retry"
            );
        }
        drop(guard);
        if let Some(previous) = slot.previous_holder.clone() {
            self.notify_transition(&previous, &slot, Some(from)).await;
        }
        Ok(slot)
    }

    /// Awards the slot to the winner of a settled lease re-auction.
    ///
    /// Returns `None` for standard rounds and rounds without a winner.
    ///
    /// # Errors
    ///
    /// Propagates [`LeaseLifecycleManager::award`] failures.
    pub async fn on_auction_settled(
        &self,
        round: &AuctionRound,
    ) -> Result<Option<LeaseSlot>, EngineError> {
        if round.purpose != RoundPurpose::LeaseAward || !round.settled {
            return Ok(None);
        }
        let Some(winner) = round.winner.as_deref() else {
            debug!(
                vertical = %round.vertical,
                auction_id = %round.auction_id,
                "lease re-auction closed without bids"
            );
            return Ok(None);
        };
        self.award(&round.vertical, winner).await.map(Some)
    }

    // =========================================================================
    // Sweep
    // =========================================================================

    /// Runs one lifecycle sweep.
    ///
    /// 1. ACTIVE slots past lease end enter GRACE_PERIOD.
    /// 2. GRACE_PERIOD slots past their renewal deadline pause if a round is
    ///    live on the vertical, otherwise expire.
    /// 3. PAUSED slots whose blocking round is settled or cancelled expire.
    /// 4. EXPIRED slots without a pending re-auction get one, up to
    ///    `max_reauctions_per_sweep`.
    ///
    /// Returns a skipped report if another sweep is still running.
    pub async fn sweep(&self) -> SweepReport {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            debug!("lease sweep already in flight, skipping");
            return SweepReport::skipped();
        }
        let _guard = SweepGuard(&self.sweeping);

        let now = self.clock.now();
        let mut report = SweepReport::default();
        self.sweep_active(now, &mut report).await;
        self.sweep_grace(now, &mut report).await;
        self.sweep_paused(now, &mut report).await;
        self.sweep_expired(&mut report).await;

        if !report.is_noop() {
            info!(
                entered_grace = report.entered_grace.len(),
                paused = report.paused.len(),
                expired = report.expired.len(),
                reauctions = report.reauctions_opened.len(),
                deferred = report.deferred.len(),
                failed = report.failed.len(),
                "lease sweep completed"
            );
        }
        report
    }

    async fn sweep_active(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        for listed in self.list(LeaseStatus::Active).await {
            if now < listed.lease_end {
                continue;
            }
            let guard = self.lock_vertical(&listed.vertical).await;
            let Some(mut slot) = self
                .reload_in_status(&listed.vertical, LeaseStatus::Active)
                .await
            else {
                continue;
            };
            if now < slot.lease_end || slot.enter_grace(now, self.config.grace()).is_err() {
                continue;
            }
            let persisted = self.persist_in_sweep(&slot, report).await;
            drop(guard);
            if persisted {
                report.entered_grace.push(slot.vertical.clone());
                if let Some(holder) = slot.holder.clone() {
                    self.notify_transition(&holder, &slot, Some(LeaseStatus::Active)).await;
                }
            }
        }
    }

    async fn sweep_grace(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        for listed in self.list(LeaseStatus::GracePeriod).await {
            if listed.renewal_deadline.is_none_or(|deadline| now < deadline) {
                continue;
            }
            let guard = self.lock_vertical(&listed.vertical).await;
            let Some(mut slot) = self
                .reload_in_status(&listed.vertical, LeaseStatus::GracePeriod)
                .await
            else {
                continue;
            };
            if slot.renewal_deadline.is_none_or(|deadline| now < deadline) {
                continue;
            }
            let live = self
                .auctions
                .book()
                .live_round_for_vertical(&slot.vertical, now);
            let transition = match &live {
                Some(round) => slot.pause(now, round.auction_id.clone()),
                None => slot.expire(now),
            };
            if transition.is_err() || !self.persist_in_sweep(&slot, report).await {
                continue;
            }
            drop(guard);
            if live.is_some() {
                report.paused.push(slot.vertical.clone());
            } else {
                report.expired.push(slot.vertical.clone());
            }
            let recipient = slot.holder.clone().or_else(|| slot.previous_holder.clone());
            if let Some(recipient) = recipient {
                self.notify_transition(&recipient, &slot, Some(LeaseStatus::GracePeriod)).await;
            }
        }
    }

    async fn sweep_paused(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let book = self.auctions.book();
        for listed in self.list(LeaseStatus::Paused).await {
            let guard = self.lock_vertical(&listed.vertical).await;
            let Some(mut slot) = self
                .reload_in_status(&listed.vertical, LeaseStatus::Paused)
                .await
            else {
                continue;
            };
            let blocking_over = slot
                .blocking_auction_id
                .as_deref()
                .is_none_or(|auction_id| {
                    book.round(auction_id)
                        .is_ok_and(|round| round.is_terminal())
                });
            if !blocking_over {
                continue;
            }
            if let Some(next) = book.live_round_for_vertical(&slot.vertical, now) {
                slot.blocking_auction_id = Some(next.auction_id);
                slot.updated_at = now;
                self.persist_in_sweep(&slot, report).await;
                continue;
            }
            if slot.expire(now).is_err() || !self.persist_in_sweep(&slot, report).await {
                continue;
            }
            drop(guard);
            report.expired.push(slot.vertical.clone());
            if let Some(previous) = slot.previous_holder.clone() {
                self.notify_transition(&previous, &slot, Some(LeaseStatus::Paused)).await;
            }
        }
    }

    async fn sweep_expired(&self, report: &mut SweepReport) {
        let mut budget = self.config.max_reauctions_per_sweep;
        for listed in self.list(LeaseStatus::Expired).await {
            let _guard = self.lock_vertical(&listed.vertical).await;
            let Some(slot) = self
                .reload_in_status(&listed.vertical, LeaseStatus::Expired)
                .await
            else {
                continue;
            };
            if self
                .auctions
                .book()
                .has_unsettled_round(&slot.vertical, RoundPurpose::LeaseAward)
            {
                continue;
            }
            if budget == 0 {
                report.deferred.push(slot.vertical.clone());
                continue;
            }
            match self.open_reauction(&slot).await {
                Ok(round) => {
                    budget -= 1;
                    report
                        .reauctions_opened
                        .push((slot.vertical.clone(), round.auction_id));
                },
                Err(e) => {
                    warn!(vertical = %slot.vertical, error = %e, "failed to open lease re-auction");
                    report.failed.push(slot.vertical.clone());
                },
            }
        }
        if !report.deferred.is_empty() {
            warn!(
                deferred = report.deferred.len(),
                "re-auction cap reached, deferring to next sweep"
            );
        }
    }

    async fn open_reauction(&self, slot: &LeaseSlot) -> Result<AuctionRound, EngineError> {
        let book = self.auctions.book();
        let eligible: Vec<String> = slot
            .previous_holder
            .iter()
            .filter(|holder| book.historical_bid_count(holder) >= self.config.min_historical_bids)
            .cloned()
            .collect();
        let now = self.clock.now();
        let round = self
            .auctions
            .open_round(OpenRound {
                vertical: slot.vertical.clone(),
                reserve_price: self.config.reauction_reserve_price,
                start_time: Some(now),
                end_time: now + self.config.reauction_duration(),
                purpose: RoundPurpose::LeaseAward,
                eligible_bidders: eligible.clone(),
            })
            .await?;

        let previous_holder_eligible = !eligible.is_empty();
        info!(
            vertical = %slot.vertical,
            auction_id = %round.auction_id,
            previous_holder_eligible,
            "lease re-auction opened"
        );
        for holder in &eligible {
            let event = EngineEvent::ReauctionOpened {
                vertical: slot.vertical.clone(),
                auction_id: round.auction_id.clone(),
                previous_holder_eligible,
                at: now,
            };
            self.notify(holder, event).await;
        }
        Ok(round)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn lock_vertical(&self, vertical: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .vertical_locks
            .entry(vertical.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Re-reads a listed slot under its lock; `None` if it moved on.
    async fn reload_in_status(&self, vertical: &str, status: LeaseStatus) -> Option<LeaseSlot> {
        match self.load(vertical).await {
            Ok(slot) if slot.status == status => Some(slot),
            Ok(_) => None,
            Err(e) => {
                debug!(vertical, error = %e, "lease slot unavailable during sweep");
                None
            },
        }
    }

    async fn load(&self, vertical: &str) -> Result<LeaseSlot, EngineError> {
        self.registry
            .load_slot(vertical)
            .await
            .map_err(|e| EngineError::external("vertical_registry", e))?
            .ok_or_else(|| EngineError::not_found(EntityKind::Lease, vertical))
    }

    async fn list(&self, status: LeaseStatus) -> Vec<LeaseSlot> {
        match self.registry.slots_in_status(status).await {
            Ok(slots) => slots,
            Err(e) => {
                warn!(%status, error = %e, "vertical registry unavailable, skipping sweep step");
                Vec::new()
            },
        }
    }

    async fn persist(&self, slot: &LeaseSlot) -> Result<(), EngineError> {
        let result = self.registry.store_slot(slot.clone()).await;
        self.cache.invalidate(&slot.vertical);
        result.map_err(|e| EngineError::external("vertical_registry", e))
    }

    async fn persist_in_sweep(&self, slot: &LeaseSlot, report: &mut SweepReport) -> bool {
        match self.persist(slot).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    vertical = %slot.vertical,
                    status = %slot.status,
                    error = %e,
                    "failed to persist lease transition"
                );
                report.failed.push(slot.vertical.clone());
                false
            },
        }
    }

    async fn notify_transition(
        &self,
        recipient: &str,
        slot: &LeaseSlot,
        from: Option<LeaseStatus>,
    ) {
        let event = EngineEvent::LeaseTransitioned {
            lease_id: slot.lease_id.clone(),
            vertical: slot.vertical.clone(),
            from,
            to: slot.status,
            holder: slot.holder.clone(),
            at: slot.updated_at,
        };
        self.notify(recipient, event).await;
    }

    async fn notify(&self, recipient: &str, event: EngineEvent) {
        if !self.notifier.may_notify(recipient).await {
            return;
        }
        let name = event.name();
        if let Err(e) = self.notifier.enqueue(recipient, event).await {
            warn!(recipient, event = name, error = %e, "notification dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use tokio::sync::Notify;

    use super::*;
    use crate::bidding::AuctionBook;
    use crate::clock::ManualClock;
    use crate::config::{BiddingConfig, PriorityConfig, TieBreakConfig};
    use crate::error::{ErrorKind, ExternalError};
    use crate::external::{AllowAllCompliance, InMemoryVerticalRegistry, NoRandomnessOracle};
    use crate::priority::PriorityResolver;
    use crate::tiebreak::TieBreakCoordinator;

    #[derive(Default)]
    struct RecordingChannel {
        events: Mutex<Vec<(String, EngineEvent)>>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl NotificationChannel for RecordingChannel {
        async fn may_notify(&self, _actor: &str) -> bool {
            true
        }

        async fn enqueue(&self, actor: &str, event: EngineEvent) -> Result<(), ExternalError> {
            if self.fail {
                return Err(ExternalError::Unavailable("queue full".to_string()));
            }
            self.events.lock().push((actor.to_string(), event));
            Ok(())
        }
    }

    /// Registry that yields on every read and can park one load until
    /// released.
    #[derive(Default)]
    struct SteppedRegistry {
        inner: InMemoryVerticalRegistry,
        hold_next_load: AtomicBool,
        load_parked: Notify,
        resume_load: Notify,
    }

    #[async_trait::async_trait]
    impl VerticalRegistry for SteppedRegistry {
        async fn load_slot(&self, vertical: &str) -> Result<Option<LeaseSlot>, ExternalError> {
            let slot = self.inner.load_slot(vertical).await?;
            if self.hold_next_load.swap(false, Ordering::SeqCst) {
                self.load_parked.notify_one();
                self.resume_load.notified().await;
            } else {
                tokio::task::yield_now().await;
            }
            Ok(slot)
        }

        async fn store_slot(&self, slot: LeaseSlot) -> Result<(), ExternalError> {
            tokio::task::yield_now().await;
            self.inner.store_slot(slot).await
        }

        async fn slots_in_status(
            &self,
            status: LeaseStatus,
        ) -> Result<Vec<LeaseSlot>, ExternalError> {
            let slots = self.inner.slots_in_status(status).await?;
            tokio::task::yield_now().await;
            Ok(slots)
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    struct Fixture {
        manager: LeaseLifecycleManager,
        auctions: Arc<BidEvaluator>,
        resolver: Arc<PriorityResolver>,
        cache: Arc<PriorityCache>,
        channel: Arc<RecordingChannel>,
        clock: Arc<ManualClock>,
    }

    fn fixture_with(config: LeaseConfig, channel: RecordingChannel) -> Fixture {
        fixture_on(Arc::new(InMemoryVerticalRegistry::new()), config, channel)
    }

    fn fixture_on(
        registry: Arc<dyn VerticalRegistry>,
        config: LeaseConfig,
        channel: RecordingChannel,
    ) -> Fixture {
        let clock = Arc::new(ManualClock::new(t0()));
        let cache = Arc::new(PriorityCache::new(Duration::seconds(30), clock.clone()));
        let channel = Arc::new(channel);
        let resolver = Arc::new(PriorityResolver::new(
            registry.clone(),
            Arc::new(AllowAllCompliance),
            cache.clone(),
            PriorityConfig::default(),
        ));
        let tiebreak = Arc::new(TieBreakCoordinator::new(
            Arc::new(NoRandomnessOracle),
            channel.clone(),
            TieBreakConfig::default(),
            clock.clone(),
        ));
        let auctions = Arc::new(BidEvaluator::new(
            Arc::new(AuctionBook::new()),
            resolver.clone(),
            tiebreak,
            BiddingConfig::default(),
            clock.clone(),
        ));
        let manager = LeaseLifecycleManager::new(
            registry,
            cache.clone(),
            auctions.clone(),
            channel.clone(),
            config,
            clock.clone(),
        );
        Fixture {
            manager,
            auctions,
            resolver,
            cache,
            channel,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(LeaseConfig::default(), RecordingChannel::default())
    }

    #[tokio::test]
    async fn test_award_and_status() {
        let f = fixture();
        let slot = f.manager.award("solar", "0xHolder").await.unwrap();
        assert_eq!(slot.status, LeaseStatus::Active);
        assert_eq!(f.manager.status("solar").await.unwrap(), slot);
        assert!(f.manager.award("solar", "0xOther").await.is_err());
        let missing = f.manager.status("mortgage").await.unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert_eq!(f.channel.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_renew_only_by_holder_and_from_current_end() {
        let f = fixture();
        let slot = f.manager.award("solar", "0xHolder").await.unwrap();
        assert!(f.manager.renew("solar", "0xOther").await.is_err());

        f.clock.advance(Duration::days(10));
        let renewed = f.manager.renew("solar", "0xholder").await.unwrap();
        assert_eq!(renewed.lease_end, slot.lease_end + Duration::days(90));
    }

    #[tokio::test]
    async fn test_sweep_walks_active_grace_expired() {
        let f = fixture();
        f.manager.award("solar", "0xHolder").await.unwrap();

        f.clock.advance(Duration::days(90));
        let report = f.manager.sweep().await;
        assert_eq!(report.entered_grace, vec!["solar".to_string()]);
        let slot = f.manager.status("solar").await.unwrap();
        assert_eq!(slot.renewal_deadline, Some(t0() + Duration::days(97)));

        f.clock.advance(Duration::days(7));
        let report = f.manager.sweep().await;
        assert_eq!(report.expired, vec!["solar".to_string()]);
        assert_eq!(report.reauctions_opened.len(), 1);
        let slot = f.manager.status("solar").await.unwrap();
        assert_eq!(slot.status, LeaseStatus::Expired);
        assert!(slot.holder.is_none());

        // The pending re-auction is not duplicated.
        let again = f.manager.sweep().await;
        assert!(again.reauctions_opened.is_empty());
        assert!(f.manager.renew("solar", "0xHolder").await.is_err());
    }

    #[tokio::test]
    async fn test_grace_with_live_round_pauses_then_expires_once() {
        let f = fixture();
        f.manager.award("solar", "0xHolder").await.unwrap();
        f.clock.advance(Duration::days(90));
        f.manager.sweep().await;

        f.clock.advance(Duration::days(7) - Duration::hours(1));
        let round = f
            .auctions
            .open_round(OpenRound {
                vertical: "solar".to_string(),
                reserve_price: dec!(10),
                start_time: None,
                end_time: f.clock.now() + Duration::hours(3),
                purpose: RoundPurpose::Standard,
                eligible_bidders: Vec::new(),
            })
            .await
            .unwrap();

        f.clock.advance(Duration::hours(1));
        let report = f.manager.sweep().await;
        assert_eq!(report.paused, vec!["solar".to_string()]);
        assert!(report.expired.is_empty());
        let slot = f.manager.status("solar").await.unwrap();
        assert_eq!(slot.status, LeaseStatus::Paused);
        assert_eq!(slot.blocking_auction_id.as_deref(), Some(round.auction_id.as_str()));

        // Ended but unsettled still blocks.
        f.clock.advance(Duration::hours(3));
        assert!(f.manager.sweep().await.expired.is_empty());

        f.auctions.settle(&round.auction_id).await.unwrap();
        let report = f.manager.sweep().await;
        assert_eq!(report.expired, vec!["solar".to_string()]);
        assert_eq!(report.reauctions_opened.len(), 1);
        assert_eq!(f.manager.sweep().await.reauctions_opened.len(), 0);

        let lease_rounds: Vec<_> = f
            .auctions
            .book()
            .rounds_for_vertical("solar")
            .into_iter()
            .filter(|r| r.purpose == RoundPurpose::LeaseAward)
            .collect();
        assert_eq!(lease_rounds.len(), 1);
    }

    #[tokio::test]
    async fn test_reauction_cap_defers_excess() {
        let config = LeaseConfig {
            max_reauctions_per_sweep: 1,
            ..LeaseConfig::default()
        };
        let f = fixture_with(config, RecordingChannel::default());
        f.manager.award("mortgage", "0xA").await.unwrap();
        f.manager.award("solar", "0xB").await.unwrap();
        f.clock.advance(Duration::days(90));
        f.manager.sweep().await;
        f.clock.advance(Duration::days(7));

        let report = f.manager.sweep().await;
        assert_eq!(report.expired.len(), 2);
        assert_eq!(report.reauctions_opened.len(), 1);
        assert_eq!(report.deferred, vec!["solar".to_string()]);

        let next = f.manager.sweep().await;
        assert_eq!(next.reauctions_opened.len(), 1);
        assert_eq!(next.reauctions_opened[0].0, "solar");
    }

    #[tokio::test]
    async fn test_expire_invalidates_cache_and_settlement_reawards() {
        let f = fixture();
        f.manager.award("solar", "0xHolder").await.unwrap();
        let generation = f.cache.generation("solar");
        let slot = f.manager.status("solar").await.unwrap();
        assert!(f.cache.insert_if_current("solar", Some(slot), generation));

        let expired = f.manager.expire("solar").await.unwrap();
        assert_eq!(expired.status, LeaseStatus::Expired);
        assert!(f.cache.get("solar").is_none());

        let round = f
            .auctions
            .book()
            .rounds_for_vertical("solar")
            .into_iter()
            .find(|r| r.purpose == RoundPurpose::LeaseAward)
            .unwrap();
        f.auctions
            .place_bid(&round.auction_id, "0xNew", dec!(150))
            .await
            .unwrap();
        f.clock.advance(Duration::hours(72));
        let settlement = f.auctions.settle(&round.auction_id).await.unwrap();
        let slot = f
            .manager
            .on_auction_settled(&settlement.round)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(slot.status, LeaseStatus::Active);
        assert_eq!(slot.holder.as_deref(), Some("0xNew"));
        assert_ne!(slot.lease_id, expired.lease_id);
    }

    #[tokio::test]
    async fn test_previous_holder_eligibility_requires_history() {
        let config = LeaseConfig {
            min_historical_bids: 1,
            ..LeaseConfig::default()
        };
        let f = fixture_with(config, RecordingChannel::default());
        f.manager.award("solar", "0xHolder").await.unwrap();
        f.manager.award("mortgage", "0xNewcomer").await.unwrap();
        let warmup = f
            .auctions
            .open_round(OpenRound {
                vertical: "insurance".to_string(),
                reserve_price: dec!(1),
                start_time: None,
                end_time: t0() + Duration::hours(1),
                purpose: RoundPurpose::Standard,
                eligible_bidders: Vec::new(),
            })
            .await
            .unwrap();
        f.auctions
            .place_bid(&warmup.auction_id, "0xHolder", dec!(5))
            .await
            .unwrap();

        f.manager.expire("solar").await.unwrap();
        f.manager.expire("mortgage").await.unwrap();
        let eligible = |vertical: &str| {
            f.auctions
                .book()
                .rounds_for_vertical(vertical)
                .into_iter()
                .find(|r| r.purpose == RoundPurpose::LeaseAward)
                .unwrap()
                .eligible_bidders
        };
        assert_eq!(eligible("solar"), vec!["0xHolder".to_string()]);
        assert!(eligible("mortgage").is_empty());
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_block_transition() {
        let f = fixture_with(
            LeaseConfig::default(),
            RecordingChannel {
                fail: true,
                ..RecordingChannel::default()
            },
        );
        f.manager.award("solar", "0xHolder").await.unwrap();
        let expired = f.manager.expire("solar").await.unwrap();
        assert_eq!(expired.status, LeaseStatus::Expired);
    }

    #[tokio::test]
    async fn test_overlapping_sweep_is_skipped() {
        let f = fixture();
        f.manager.sweeping.store(true, Ordering::Release);
        assert!(f.manager.sweep().await.skipped);
        f.manager.sweeping.store(false, Ordering::Release);
        assert!(!f.manager.sweep().await.skipped);
    }

    #[tokio::test]
    async fn test_concurrent_renewals_both_extend() {
        let f = fixture_on(
            Arc::new(SteppedRegistry::default()),
            LeaseConfig::default(),
            RecordingChannel::default(),
        );
        let slot = f.manager.award("solar", "0xHolder").await.unwrap();

        let (first, second) = tokio::join!(
            f.manager.renew("solar", "0xHolder"),
            f.manager.renew("solar", "0xHolder")
        );
        assert!(first.is_ok() && second.is_ok());
        let stored = f.manager.status("solar").await.unwrap();
        assert_eq!(stored.renewal_count, 2);
        assert_eq!(stored.lease_end, slot.lease_end + Duration::days(180));
    }

    #[tokio::test]
    async fn test_concurrent_first_awards_have_one_winner() {
        let f = fixture_on(
            Arc::new(SteppedRegistry::default()),
            LeaseConfig::default(),
            RecordingChannel::default(),
        );
        let (a, b) = tokio::join!(f.manager.award("solar", "0xA"), f.manager.award("solar", "0xB"));
        assert_eq!(u8::from(a.is_ok()) + u8::from(b.is_ok()), 1);
        let winner = if a.is_ok() { "0xA" } else { "0xB" };
        let stored = f.manager.status("solar").await.unwrap();
        assert_eq!(stored.holder.as_deref(), Some(winner));
    }

    #[tokio::test]
    async fn test_sweep_racing_renewal_keeps_renewal() {
        let f = fixture_on(
            Arc::new(SteppedRegistry::default()),
            LeaseConfig::default(),
            RecordingChannel::default(),
        );
        let slot = f.manager.award("solar", "0xHolder").await.unwrap();
        f.clock.advance(Duration::days(90));

        let (report, renewed) = tokio::join!(
            f.manager.sweep(),
            f.manager.renew("solar", "0xHolder")
        );
        assert!(renewed.is_ok());
        assert!(report.failed.is_empty());
        let stored = f.manager.status("solar").await.unwrap();
        assert_eq!(stored.status, LeaseStatus::Active);
        assert_eq!(stored.renewal_count, 1);
        assert_eq!(stored.lease_end, slot.lease_end + Duration::days(90));
    }

    #[tokio::test]
    async fn test_lookup_in_flight_during_expiry_is_not_cached() {
        let registry = Arc::new(SteppedRegistry::default());
        let f = fixture_on(registry.clone(), LeaseConfig::default(), RecordingChannel::default());
        f.manager.award("solar", "0xHolder").await.unwrap();

        registry.hold_next_load.store(true, Ordering::SeqCst);
        let resolver = f.resolver.clone();
        let lookup = tokio::spawn(async move {
            resolver.resolve("solar", Some("0xHolder"), None).await
        });
        registry.load_parked.notified().await;

        f.manager.expire("solar").await.unwrap();
        registry.resume_load.notify_one();
        lookup.await.unwrap();

        let grant = f.resolver.resolve("solar", Some("0xHolder"), None).await;
        assert!(!grant.is_priority_holder);
        assert_eq!(f.manager.status("solar").await.unwrap().status, LeaseStatus::Expired);
    }
}
