//! Engine facade.
//!
//! [`MarketEngine`] wires the resolver, bid evaluator, tie-break
//! coordinator, bounty matcher and lease manager together and exposes the
//! operations remote callers use. Every operation returns an
//! [`OperationOutcome`] envelope instead of a bare error.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bidding::{
    AuctionBook, AuctionRound, Bid, BidEvaluator, BidOutcome, OpenRound, RoundPurpose, Settlement,
};
use crate::bounty::{
    Allocation, BountyBook, BountyMatcher, BountyPool, DepositRequest, ReleaseReceipt,
    TransactionAttributes,
};
use crate::clock::{Clock, SystemClock};
use crate::config::PaxConfig;
use crate::error::{EngineError, ErrorKind};
use crate::events::EngineEvent;
use crate::external::{
    AllowAllCompliance, ComplianceGate, CriteriaOracle, DiscardNotifications,
    InMemoryVerticalRegistry, NoCriteriaOracle, NoRandomnessOracle, NotificationChannel,
    RandomnessOracle, VerticalRegistry,
};
use crate::lease::{LeaseLifecycleManager, LeaseSlot, SweepReport};
use crate::money::Multiplier;
use crate::priority::{PriorityCache, PriorityGrant, PriorityResolver};
use crate::tiebreak::TieBreakCoordinator;

// =============================================================================
// Outcome envelope
// =============================================================================

/// Failure details carried by an [`OperationOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Whether resubmitting with fresh state may succeed.
    pub retryable: bool,
}

impl From<&EngineError> for ErrorReport {
    fn from(error: &EngineError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

/// Structured result of an engine operation.
#[derive(Debug, Serialize)]
pub struct OperationOutcome<T> {
    /// Whether the operation succeeded.
    pub success: bool,
    /// The operation's result. Rejected bids carry their outcome here too.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Failure details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl<T> OperationOutcome<T> {
    /// A successful outcome.
    #[must_use]
    pub const fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// A failed outcome.
    #[must_use]
    pub fn failed(error: &EngineError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorReport::from(error)),
        }
    }

    /// Converts back into a `Result`, dropping any data on failure.
    ///
    /// # Errors
    ///
    /// Returns the [`ErrorReport`] of a failed outcome.
    pub fn into_result(self) -> Result<T, ErrorReport> {
        match (self.data, self.error) {
            (Some(data), None) if self.success => Ok(data),
            (_, Some(error)) => Err(error),
            (_, None) => Err(ErrorReport {
                kind: ErrorKind::StateConflict,
                message: "operation produced no result".to_string(),
                retryable: false,
            }),
        }
    }
}

impl<T> From<Result<T, EngineError>> for OperationOutcome<T> {
    fn from(result: Result<T, EngineError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(error) => Self::failed(&error),
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builds a [`MarketEngine`], defaulting every collaborator to its null or
/// in-memory implementation.
pub struct MarketEngineBuilder {
    config: PaxConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<dyn VerticalRegistry>,
    compliance: Arc<dyn ComplianceGate>,
    randomness: Arc<dyn RandomnessOracle>,
    criteria: Arc<dyn CriteriaOracle>,
    notifier: Arc<dyn NotificationChannel>,
}

impl fmt::Debug for MarketEngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketEngineBuilder")
            .field("config", &self.config)
            .field("randomness_configured", &self.randomness.is_configured())
            .field("criteria_configured", &self.criteria.is_configured())
            .finish_non_exhaustive()
    }
}

impl MarketEngineBuilder {
    /// Starts a builder from `config`.
    #[must_use]
    pub fn new(config: PaxConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            registry: Arc::new(InMemoryVerticalRegistry::new()),
            compliance: Arc::new(AllowAllCompliance),
            randomness: Arc::new(NoRandomnessOracle),
            criteria: Arc::new(NoCriteriaOracle),
            notifier: Arc::new(DiscardNotifications),
        }
    }

    /// Sets the clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the vertical registry.
    #[must_use]
    pub fn registry(mut self, registry: Arc<dyn VerticalRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Sets the compliance gate.
    #[must_use]
    pub fn compliance(mut self, compliance: Arc<dyn ComplianceGate>) -> Self {
        self.compliance = compliance;
        self
    }

    /// Sets the randomness oracle.
    #[must_use]
    pub fn randomness_oracle(mut self, oracle: Arc<dyn RandomnessOracle>) -> Self {
        self.randomness = oracle;
        self
    }

    /// Sets the criteria oracle.
    #[must_use]
    pub fn criteria_oracle(mut self, oracle: Arc<dyn CriteriaOracle>) -> Self {
        self.criteria = oracle;
        self
    }

    /// Sets the notification channel.
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn NotificationChannel>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Wires the engine.
    #[must_use]
    pub fn build(self) -> MarketEngine {
        let Self {
            config,
            clock,
            registry,
            compliance,
            randomness,
            criteria,
            notifier,
        } = self;

        let randomness_configured = randomness.is_configured();
        let criteria_configured = criteria.is_configured();
        let cache = Arc::new(PriorityCache::new(config.priority.cache_ttl(), clock.clone()));
        let resolver = Arc::new(PriorityResolver::new(
            registry.clone(),
            compliance,
            cache.clone(),
            config.priority.clone(),
        ));
        let tiebreak = Arc::new(TieBreakCoordinator::new(
            randomness,
            notifier.clone(),
            config.tie_break.clone(),
            clock.clone(),
        ));
        let auctions = Arc::new(BidEvaluator::new(
            Arc::new(AuctionBook::new()),
            resolver.clone(),
            tiebreak.clone(),
            config.bidding.clone(),
            clock.clone(),
        ));
        let bounties = BountyMatcher::new(
            Arc::new(BountyBook::new(clock.clone())),
            criteria,
            tiebreak.clone(),
            config.bounty.clone(),
            clock.clone(),
        );
        let leases = LeaseLifecycleManager::new(
            registry,
            cache,
            auctions.clone(),
            notifier.clone(),
            config.lease.clone(),
            clock.clone(),
        );

        info!(
            randomness_oracle = randomness_configured,
            criteria_oracle = criteria_configured,
            compliance_failure_mode = ?config.priority.compliance_failure_mode,
            "market engine initialized"
        );
        MarketEngine {
            config,
            clock,
            resolver,
            auctions,
            tiebreak,
            bounties,
            leases,
            notifier,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// The priority auction and incentive allocation engine.
pub struct MarketEngine {
    config: PaxConfig,
    clock: Arc<dyn Clock>,
    resolver: Arc<PriorityResolver>,
    auctions: Arc<BidEvaluator>,
    tiebreak: Arc<TieBreakCoordinator>,
    bounties: BountyMatcher,
    leases: LeaseLifecycleManager,
    notifier: Arc<dyn NotificationChannel>,
}

impl fmt::Debug for MarketEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketEngine")
            .field("auctions", &self.auctions)
            .field("bounties", &self.bounties)
            .field("leases", &self.leases)
            .finish_non_exhaustive()
    }
}

impl MarketEngine {
    /// Shorthand for [`MarketEngineBuilder::new`].
    #[must_use]
    pub fn builder(config: PaxConfig) -> MarketEngineBuilder {
        MarketEngineBuilder::new(config)
    }

    /// The engine's configuration.
    #[must_use]
    pub const fn config(&self) -> &PaxConfig {
        &self.config
    }

    /// The engine's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The tie-break coordinator, for audit queries.
    #[must_use]
    pub const fn tiebreak(&self) -> &Arc<TieBreakCoordinator> {
        &self.tiebreak
    }

    // -------------------------------------------------------------------------
    // Priority
    // -------------------------------------------------------------------------

    /// Resolves an actor's priority on a vertical. Never fails.
    pub async fn resolve_priority(
        &self,
        vertical: &str,
        actor: Option<&str>,
        nonce: Option<&str>,
    ) -> OperationOutcome<PriorityGrant> {
        OperationOutcome::ok(self.resolver.resolve(vertical, actor, nonce).await)
    }

    // -------------------------------------------------------------------------
    // Auctions
    // -------------------------------------------------------------------------

    /// Opens an auction round.
    pub async fn open_auction(&self, request: OpenRound) -> OperationOutcome<AuctionRound> {
        self.auctions.open_round(request).await.into()
    }

    /// Returns a round.
    pub fn auction(&self, auction_id: &str) -> OperationOutcome<AuctionRound> {
        self.auctions.book().round(auction_id).into()
    }

    /// Returns a round's bids, best first.
    pub fn ranked_bids(&self, auction_id: &str) -> OperationOutcome<Vec<Bid>> {
        self.auctions.book().ranked_bids(auction_id).into()
    }

    /// Places a bid. A rejected bid is a failed outcome that still carries
    /// the [`BidOutcome`].
    pub async fn place_bid(
        &self,
        auction_id: &str,
        bidder: &str,
        raw_amount: Decimal,
    ) -> OperationOutcome<BidOutcome> {
        match self.auctions.place_bid(auction_id, bidder, raw_amount).await {
            Ok(outcome) => {
                let error = outcome.rejection.as_ref().map(|rejection| ErrorReport {
                    kind: rejection.kind(),
                    message: rejection.to_string(),
                    retryable: rejection.kind() != ErrorKind::Validation,
                });
                OperationOutcome {
                    success: outcome.accepted,
                    data: Some(outcome),
                    error,
                }
            },
            Err(error) => OperationOutcome::failed(&error),
        }
    }

    /// Settles a round, notifies the winner and awards the lease for lease
    /// re-auctions.
    pub async fn settle_auction(&self, auction_id: &str) -> OperationOutcome<Settlement> {
        let mut settlement = match self.auctions.settle(auction_id).await {
            Ok(settlement) => settlement,
            Err(error) => return OperationOutcome::failed(&error),
        };

        if settlement.round.purpose == RoundPurpose::LeaseAward {
            match self.leases.on_auction_settled(&settlement.round).await {
                Ok(slot) => settlement.awarded_lease = slot,
                Err(e) => warn!(
                    auction_id,
                    vertical = %settlement.round.vertical,
                    error = %e,
                    "lease re-auction settled but the slot could not be awarded"
                ),
            }
        }

        if let Some(winner) = settlement.winner.as_ref() {
            if self.notifier.may_notify(&winner.bidder).await {
                let event = EngineEvent::AuctionSettled {
                    auction_id: auction_id.to_string(),
                    vertical: settlement.round.vertical.clone(),
                    winner: Some(winner.bidder.clone()),
                    effective_amount: Some(winner.effective_amount),
                    at: self.clock.now(),
                };
                if let Err(e) = self.notifier.enqueue(&winner.bidder, event).await {
                    warn!(auction_id, error = %e, "settlement notification dropped");
                }
            }
        }
        OperationOutcome::ok(settlement)
    }

    /// Cancels a round.
    pub fn cancel_auction(&self, auction_id: &str) -> OperationOutcome<AuctionRound> {
        self.auctions.cancel(auction_id).into()
    }

    /// Imports a bid recorded before effective amounts existed.
    pub fn import_legacy_bid(
        &self,
        auction_id: &str,
        bidder: &str,
        raw_amount: Decimal,
        submitted_at: DateTime<Utc>,
    ) -> OperationOutcome<Bid> {
        self.auctions
            .import_legacy_bid(auction_id, bidder, raw_amount, submitted_at)
            .into()
    }

    /// Backfills the effective amount of a legacy bid.
    pub fn backfill_effective(
        &self,
        auction_id: &str,
        bid_id: &str,
        multiplier: Multiplier,
    ) -> OperationOutcome<Bid> {
        self.auctions
            .backfill_effective(auction_id, bid_id, multiplier)
            .into()
    }

    // -------------------------------------------------------------------------
    // Bounties
    // -------------------------------------------------------------------------

    /// Creates a bounty pool.
    pub fn deposit_bounty(&self, request: DepositRequest) -> OperationOutcome<BountyPool> {
        self.bounties.book().deposit(request).into()
    }

    /// Adds funds to a pool.
    pub fn top_up_bounty(&self, pool_id: &str, amount: Decimal) -> OperationOutcome<BountyPool> {
        self.bounties.book().top_up(pool_id, amount).into()
    }

    /// Returns a pool.
    pub fn bounty_pool(&self, pool_id: &str) -> OperationOutcome<BountyPool> {
        self.bounties.book().pool(pool_id).into()
    }

    /// Proposes bounty allocations for a completed transaction.
    pub async fn match_bounties(
        &self,
        tx: &TransactionAttributes,
        winning_price: Option<Decimal>,
    ) -> OperationOutcome<Vec<Allocation>> {
        self.bounties.match_bounties(tx, winning_price).await.into()
    }

    /// Releases funds from one pool.
    pub fn release_allocation(
        &self,
        pool_id: &str,
        amount: Decimal,
    ) -> OperationOutcome<ReleaseReceipt> {
        self.bounties.book().release(pool_id, amount).into()
    }

    // -------------------------------------------------------------------------
    // Leases
    // -------------------------------------------------------------------------

    /// Returns the lease slot of a vertical.
    pub async fn lease_status(&self, vertical: &str) -> OperationOutcome<LeaseSlot> {
        self.leases.status(vertical).await.into()
    }

    /// Renews a lease on behalf of its holder.
    pub async fn renew_lease(&self, vertical: &str, actor: &str) -> OperationOutcome<LeaseSlot> {
        self.leases.renew(vertical, actor).await.into()
    }

    /// Expires a lease and opens its re-auction.
    pub async fn expire_lease(&self, vertical: &str) -> OperationOutcome<LeaseSlot> {
        self.leases.expire(vertical).await.into()
    }

    /// Awards a vertical's lease.
    pub async fn award_lease(&self, vertical: &str, holder: &str) -> OperationOutcome<LeaseSlot> {
        self.leases.award(vertical, holder).await.into()
    }

    /// Runs one lease lifecycle sweep.
    pub async fn sweep_leases(&self) -> SweepReport {
        self.leases.sweep().await
    }

    /// Drops idle rate-limit windows and tie-break records past retention.
    pub fn prune_idle_state(&self) -> PruneReport {
        let report = PruneReport {
            rate_limit_actors: self.auctions.limiter().prune(self.clock.now()),
            tie_break_records: self.tiebreak.prune(),
        };
        if report.rate_limit_actors + report.tie_break_records > 0 {
            debug!(
                rate_limit_actors = report.rate_limit_actors,
                tie_break_records = report.tie_break_records,
                "idle engine state pruned"
            );
        }
        report
    }

    /// Per-actor rate limit windows currently held.
    #[must_use]
    pub fn rate_limited_actors(&self) -> usize {
        self.auctions.limiter().tracked_actors()
    }
}

/// What [`MarketEngine::prune_idle_state`] dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Actors whose rate-limit window emptied.
    pub rate_limit_actors: usize,
    /// Tie-break records past the ledger retention.
    pub tie_break_records: usize,
}
