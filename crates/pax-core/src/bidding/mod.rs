//! Bid evaluation.
//!
//! [`BidEvaluator`] turns raw bids into priority-adjusted effective bids
//! and maintains each round's high bid. A bid passes these gates in order:
//!
//! 1. The round is live (not settled, not cancelled, not past its end).
//! 2. The raw amount meets the reserve price.
//! 3. The bidder is under the per-actor rate limit.
//! 4. Inside `[start, priority_window_end + grace]` only the priority holder
//!    may bid.
//! 5. The effective amount is not below the current effective high bid.
//!
//! The final comparison is repeated under the round's mutex. A bid that was
//! ahead when it started but behind at commit time is reported as
//! [`BidRejection::ConcurrencyLost`].

mod book;
mod rate_limit;
mod round;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use self::book::AuctionBook;
pub use self::rate_limit::SlidingWindowLimiter;
pub use self::round::{AuctionRound, Bid, HighBid, RoundPurpose, rank_bids, rank_order};
use crate::clock::Clock;
use crate::config::BiddingConfig;
use crate::error::{EngineError, EntityKind, ErrorKind};
use crate::lease::LeaseSlot;
use crate::money::{EffectiveAmount, Multiplier, effective_amount, validate_amount};
use crate::priority::PriorityResolver;
use crate::tiebreak::{TieBreakCoordinator, TieBreakPurpose, WatcherHandle, tied_at_top};

// =============================================================================
// Requests and outcomes
// =============================================================================

/// Parameters for opening a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRound {
    /// The vertical being auctioned.
    pub vertical: String,
    /// Minimum raw bid.
    pub reserve_price: Decimal,
    /// When bidding opens; defaults to now.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// When bidding closes.
    pub end_time: DateTime<Utc>,
    /// Why the round exists.
    #[serde(default)]
    pub purpose: RoundPurpose,
    /// Previous holders invited to a lease re-auction.
    #[serde(default)]
    pub eligible_bidders: Vec<String>,
}

/// Reason a bid was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum BidRejection {
    /// The round is settled, cancelled or past its end time.
    NotActive,
    /// The raw amount is below the reserve price.
    BelowReserve {
        /// The round's reserve.
        reserve_price: Decimal,
    },
    /// The bidder exhausted the rolling bid budget.
    RateLimited {
        /// When the next bid will be counted.
        retry_at: DateTime<Utc>,
    },
    /// The holder-only window is still open.
    OutsidePriorityWindow {
        /// When general bidding opens, grace included.
        opens_at: DateTime<Utc>,
    },
    /// The effective amount is below the current high bid.
    BelowHighBid {
        /// The current effective high bid.
        effective_high_bid: Decimal,
    },
    /// Another bid committed first and now outranks this one.
    ConcurrencyLost,
}

impl BidRejection {
    /// Maps the rejection onto the engine's error taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::BelowReserve { .. } => ErrorKind::Validation,
            Self::ConcurrencyLost => ErrorKind::ConcurrencyLost,
            Self::NotActive
            | Self::RateLimited { .. }
            | Self::OutsidePriorityWindow { .. }
            | Self::BelowHighBid { .. } => ErrorKind::StateConflict,
        }
    }
}

impl fmt::Display for BidRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotActive => f.write_str("auction is no longer active"),
            Self::BelowReserve { reserve_price } => {
                write!(f, "bid is below the reserve price of {reserve_price}")
            },
            Self::RateLimited { retry_at } => {
                write!(f, "bid rate limit exceeded, retry after {retry_at}")
            },
            Self::OutsidePriorityWindow { opens_at } => write!(
                f,
                "only the priority holder may bid during the priority window, \
                 general bidding opens at {opens_at}"
            ),
            Self::BelowHighBid { effective_high_bid } => write!(
                f,
                "effective bid is below current high bid of {effective_high_bid}"
            ),
            Self::ConcurrencyLost => f.write_str(
                "a higher bid was committed concurrently; effective bid is below current high bid",
            ),
        }
    }
}

/// Result of a bid attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidOutcome {
    /// The round bid on.
    pub auction_id: String,
    /// Whether the bid was recorded.
    pub accepted: bool,
    /// Id of the recorded bid.
    pub bid_id: Option<String>,
    /// This bid's effective amount, once computed.
    pub effective_amount: Option<Decimal>,
    /// The round's effective high bid after this attempt.
    pub effective_high_bid: Option<Decimal>,
    /// Whether this bid is now the high bid.
    pub became_high_bid: bool,
    /// Why the bid was rejected.
    pub rejection: Option<BidRejection>,
    /// Human-readable form of `rejection`.
    pub reason: Option<String>,
}

impl BidOutcome {
    fn rejected(
        auction_id: &str,
        effective: Option<Decimal>,
        high: Option<Decimal>,
        rejection: BidRejection,
    ) -> Self {
        Self {
            auction_id: auction_id.to_string(),
            accepted: false,
            bid_id: None,
            effective_amount: effective,
            effective_high_bid: high,
            became_high_bid: false,
            reason: Some(rejection.to_string()),
            rejection: Some(rejection),
        }
    }
}

/// Result of settling a round.
#[derive(Debug, Serialize)]
pub struct Settlement {
    /// The round after settlement.
    pub round: AuctionRound,
    /// The winning bid under the deterministic ordering.
    pub winner: Option<HighBid>,
    /// Bidders tied at the top effective amount, in bid order.
    pub tied_bidders: Vec<String>,
    /// Whether the tie was submitted to the randomness oracle.
    pub tie_break_requested: bool,
    /// Lease slot awarded by a settled lease re-auction.
    pub awarded_lease: Option<LeaseSlot>,
    /// Background watcher recording the oracle's verdict.
    #[serde(skip)]
    pub watcher: Option<WatcherHandle>,
}

// =============================================================================
// Evaluator
// =============================================================================

/// Places, settles and cancels bids on auction rounds.
pub struct BidEvaluator {
    book: Arc<AuctionBook>,
    resolver: Arc<PriorityResolver>,
    tiebreak: Arc<TieBreakCoordinator>,
    limiter: SlidingWindowLimiter,
    config: BiddingConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for BidEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BidEvaluator")
            .field("book", &self.book)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BidEvaluator {
    /// Creates an evaluator over `book`.
    #[must_use]
    pub fn new(
        book: Arc<AuctionBook>,
        resolver: Arc<PriorityResolver>,
        tiebreak: Arc<TieBreakCoordinator>,
        config: BiddingConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter =
            SlidingWindowLimiter::new(config.rate_limit_max_bids, config.rate_limit_window());
        Self {
            book,
            resolver,
            tiebreak,
            limiter,
            config,
            clock,
        }
    }

    /// The underlying auction book.
    #[must_use]
    pub const fn book(&self) -> &Arc<AuctionBook> {
        &self.book
    }

    /// The per-actor rate limiter.
    #[must_use]
    pub const fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    /// Opens a new round.
    ///
    /// Standard rounds on a vertical with an active lease get a holder-only
    /// window whose length is derived from a fresh per-round nonce.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for a bad reserve or time range,
    /// and [`EngineError::StateConflict`] if the vertical already has a
    /// round of the same purpose in progress.
    pub async fn open_round(&self, request: OpenRound) -> Result<AuctionRound, EngineError> {
        let vertical = request.vertical.trim().to_string();
        if vertical.is_empty() {
            return Err(EngineError::validation("vertical", "must not be empty"));
        }
        let reserve_price = validate_amount("reserve_price", request.reserve_price)?;
        let now = self.clock.now();
        let start_time = request.start_time.unwrap_or(now);
        if request.end_time <= start_time {
            return Err(EngineError::validation("end_time", "must be after start_time"));
        }

        if self.book.is_vertical_occupied(&vertical, request.purpose, now) {
            return Err(EngineError::conflict(
                EntityKind::Vertical,
                vertical,
                format!("a {} round is already in progress", request.purpose),
            ));
        }

        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let priority_holder = match request.purpose {
            RoundPurpose::Standard => self.resolver.active_holder(&vertical).await,
            RoundPurpose::LeaseAward => None,
        };
        let priority_window_end = if priority_holder.is_some() {
            let window = self.resolver.window_seconds(&vertical, Some(&nonce));
            (start_time + chrono::Duration::seconds(i64::from(window))).min(request.end_time)
        } else {
            start_time
        };

        let round = AuctionRound {
            auction_id: format!("auction-{}", uuid::Uuid::new_v4()),
            vertical,
            purpose: request.purpose,
            reserve_price,
            start_time,
            end_time: request.end_time,
            priority_window_end,
            priority_window_nonce: nonce,
            priority_holder,
            settled: false,
            cancelled: false,
            high_bid: None,
            bid_count: 0,
            eligible_bidders: request.eligible_bidders,
            winner: None,
        };
        self.book.insert_if_vertical_free(round.clone(), self.clock.now())?;
        info!(
            auction_id = %round.auction_id,
            vertical = %round.vertical,
            purpose = %round.purpose,
            reserve_price = %round.reserve_price,
            has_priority_window = round.has_priority_window(),
            "auction round opened"
        );
        Ok(round)
    }

    /// Places a bid.
    ///
    /// Business rejections are reported in the returned [`BidOutcome`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for a malformed bidder or amount
    /// and [`EngineError::NotFound`] for an unknown round.
    pub async fn place_bid(
        &self,
        auction_id: &str,
        bidder: &str,
        raw_amount: Decimal,
    ) -> Result<BidOutcome, EngineError> {
        let bidder = bidder.trim();
        if bidder.is_empty() {
            return Err(EngineError::validation("bidder", "must not be empty"));
        }
        let raw_amount = validate_amount("raw_amount", raw_amount)?;
        let entry = self.book.entry(auction_id)?;
        let snapshot = entry.lock().round.clone();
        let now = self.clock.now();
        let seen_high = snapshot.effective_high();

        if !snapshot.is_live(now) {
            return Ok(BidOutcome::rejected(auction_id, None, seen_high, BidRejection::NotActive));
        }
        if raw_amount < snapshot.reserve_price {
            return Ok(BidOutcome::rejected(
                auction_id,
                None,
                seen_high,
                BidRejection::BelowReserve {
                    reserve_price: snapshot.reserve_price,
                },
            ));
        }
        if let Err(retry_at) = self.limiter.try_acquire(bidder, now) {
            debug!(auction_id, bidder, %retry_at, "bid rate limited");
            return Ok(BidOutcome::rejected(
                auction_id,
                None,
                seen_high,
                BidRejection::RateLimited { retry_at },
            ));
        }

        let grant = self
            .resolver
            .resolve(
                &snapshot.vertical,
                Some(bidder),
                Some(&snapshot.priority_window_nonce),
            )
            .await;
        if snapshot.has_priority_window() && !grant.is_priority_holder {
            let opens_at = snapshot.priority_window_end + self.config.grace();
            if now <= opens_at {
                return Ok(BidOutcome::rejected(
                    auction_id,
                    None,
                    seen_high,
                    BidRejection::OutsidePriorityWindow { opens_at },
                ));
            }
        }

        let effective = effective_amount(raw_amount, grant.multiplier)?;
        if let Some(high) = seen_high.filter(|high| effective < *high) {
            return Ok(BidOutcome::rejected(
                auction_id,
                Some(effective),
                Some(high),
                BidRejection::BelowHighBid {
                    effective_high_bid: high,
                },
            ));
        }

        let mut guard = entry.lock();
        let now = self.clock.now();
        if !guard.round.is_live(now) {
            let high = guard.round.effective_high();
            return Ok(BidOutcome::rejected(
                auction_id,
                Some(effective),
                high,
                BidRejection::NotActive,
            ));
        }
        let current = guard.round.effective_high();
        if let Some(high) = current.filter(|high| effective < *high) {
            return Ok(BidOutcome::rejected(
                auction_id,
                Some(effective),
                Some(high),
                BidRejection::ConcurrencyLost,
            ));
        }

        let bid = Bid::new(bidder, raw_amount, EffectiveAmount::Known(effective), now);
        let bid_id = bid.bid_id.clone();
        let became_high_bid = current.is_none_or(|high| effective > high);
        if became_high_bid {
            guard.round.high_bid = Some(HighBid {
                bidder: bidder.to_string(),
                raw_amount,
                effective_amount: effective,
                placed_at: now,
            });
        }
        guard.round.bid_count += 1;
        guard.bids.push(bid);
        let effective_high_bid = guard.round.effective_high();
        drop(guard);

        self.book.record_bid_history(bidder);
        debug!(
            auction_id,
            bidder,
            %raw_amount,
            %effective,
            multiplier = %grant.multiplier,
            became_high_bid,
            "bid accepted"
        );
        Ok(BidOutcome {
            auction_id: auction_id.to_string(),
            accepted: true,
            bid_id: Some(bid_id),
            effective_amount: Some(effective),
            effective_high_bid,
            became_high_bid,
            rejection: None,
            reason: None,
        })
    }

    /// Settles a round whose end time has passed.
    ///
    /// The earliest bid at the top effective amount wins immediately. A tie
    /// is also submitted to the randomness oracle, whose answer is recorded
    /// in the background for audit and never changes the settled winner.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown round and
    /// [`EngineError::StateConflict`] if the round is terminal or still open.
    pub async fn settle(&self, auction_id: &str) -> Result<Settlement, EngineError> {
        let entry = self.book.entry(auction_id)?;
        let (round, tied_bidders) = {
            let mut guard = entry.lock();
            let now = self.clock.now();
            check_not_terminal(&guard.round)?;
            if now < guard.round.end_time {
                return Err(EngineError::conflict(
                    EntityKind::Auction,
                    auction_id,
                    format!("bidding is open until {}", guard.round.end_time),
                ));
            }
            guard.round.settled = true;
            guard.round.winner = guard.round.high_bid.as_ref().map(|bid| bid.bidder.clone());
            let tied = tied_at_top(
                guard
                    .bids
                    .iter()
                    .filter_map(|bid| {
                        bid.effective
                            .known()
                            .map(|amount| (bid.bidder.clone(), amount))
                    }),
            );
            (guard.round.clone(), tied)
        };

        info!(
            auction_id,
            vertical = %round.vertical,
            winner = round.winner.as_deref().unwrap_or("none"),
            bid_count = round.bid_count,
            tied = tied_bidders.len(),
            "auction settled"
        );

        let mut tie_break_requested = false;
        let mut watcher = None;
        if tied_bidders.len() >= 2 {
            if let Some(handle) = self
                .tiebreak
                .request_tie_break(auction_id, tied_bidders.clone(), TieBreakPurpose::AuctionTie)
                .await
            {
                tie_break_requested = true;
                watcher = Some(self.tiebreak.spawn_watcher(handle));
            }
        }

        Ok(Settlement {
            winner: round.high_bid.clone(),
            round,
            tied_bidders,
            tie_break_requested,
            awarded_lease: None,
            watcher,
        })
    }

    /// Cancels a round. Bids already recorded are kept.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown round and
    /// [`EngineError::StateConflict`] if it is already terminal.
    pub fn cancel(&self, auction_id: &str) -> Result<AuctionRound, EngineError> {
        let entry = self.book.entry(auction_id)?;
        let mut guard = entry.lock();
        check_not_terminal(&guard.round)?;
        guard.round.cancelled = true;
        info!(auction_id, vertical = %guard.round.vertical, "auction cancelled");
        Ok(guard.round.clone())
    }

    /// Records a bid placed before effective amounts existed.
    ///
    /// The bid's effective amount is `Unknown`; it never becomes the high bid.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for a malformed bidder or amount
    /// and [`EngineError::NotFound`] for an unknown round.
    pub fn import_legacy_bid(
        &self,
        auction_id: &str,
        bidder: &str,
        raw_amount: Decimal,
        submitted_at: DateTime<Utc>,
    ) -> Result<Bid, EngineError> {
        let bidder = bidder.trim();
        if bidder.is_empty() {
            return Err(EngineError::validation("bidder", "must not be empty"));
        }
        let raw_amount = validate_amount("raw_amount", raw_amount)?;
        let entry = self.book.entry(auction_id)?;
        let bid = Bid::new(bidder, raw_amount, EffectiveAmount::Unknown, submitted_at);
        entry.lock().bids.push(bid.clone());
        self.book.record_bid_history(bidder);
        Ok(bid)
    }

    /// Fills in the effective amount of a legacy bid. Allowed once per bid.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown round or bid, and
    /// [`EngineError::StateConflict`] if the bid already has an amount.
    pub fn backfill_effective(
        &self,
        auction_id: &str,
        bid_id: &str,
        multiplier: Multiplier,
    ) -> Result<Bid, EngineError> {
        let entry = self.book.entry(auction_id)?;
        let mut guard = entry.lock();
        let bid = guard
            .bids
            .iter_mut()
            .find(|bid| bid.bid_id == bid_id)
            .ok_or_else(|| {
                EngineError::not_found(EntityKind::Auction, format!("{auction_id}/{bid_id}"))
            })?;
        if !bid.effective.is_unknown() {
            return Err(EngineError::conflict(
                EntityKind::Auction,
                auction_id,
                format!("bid {bid_id} already has an effective amount"),
            ));
        }
        bid.effective = EffectiveAmount::Known(effective_amount(bid.raw_amount, multiplier)?);
        Ok(bid.clone())
    }
}

fn check_not_terminal(round: &AuctionRound) -> Result<(), EngineError> {
    if round.settled {
        return Err(EngineError::conflict(
            EntityKind::Auction,
            round.auction_id.clone(),
            "auction is already settled",
        ));
    }
    if round.cancelled {
        return Err(EngineError::conflict(
            EntityKind::Auction,
            round.auction_id.clone(),
            "auction is already cancelled",
        ));
    }
    Ok(())
}
