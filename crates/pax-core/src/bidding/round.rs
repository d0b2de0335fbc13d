//! Auction rounds, bids, and bid ranking.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::money::EffectiveAmount;

/// Why a round was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundPurpose {
    /// An ordinary listing round.
    #[default]
    Standard,
    /// A re-auction of an expired lease slot; settling awards the slot.
    LeaseAward,
}

impl RoundPurpose {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::LeaseAward => "LEASE_AWARD",
        }
    }

    /// Parses a purpose string.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for unrecognised values.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "STANDARD" => Ok(Self::Standard),
            "LEASE_AWARD" => Ok(Self::LeaseAward),
            _ => Err(EngineError::validation(
                "purpose",
                format!("unknown round purpose: {s}"),
            )),
        }
    }
}

impl fmt::Display for RoundPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The current leading bid of a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighBid {
    /// Leading bidder.
    pub bidder: String,
    /// Raw amount as submitted.
    pub raw_amount: Decimal,
    /// Priority-adjusted amount. Always `>= raw_amount`.
    pub effective_amount: Decimal,
    /// When the bid was accepted.
    pub placed_at: DateTime<Utc>,
}

/// One bidding round for a vertical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuctionRound {
    /// Round identifier.
    pub auction_id: String,
    /// The vertical being auctioned.
    pub vertical: String,
    /// Why the round exists.
    pub purpose: RoundPurpose,
    /// Minimum raw bid.
    pub reserve_price: Decimal,
    /// When bidding opens.
    pub start_time: DateTime<Utc>,
    /// When bidding closes.
    pub end_time: DateTime<Utc>,
    /// End of the holder-only window. Equal to `start_time` when the round
    /// opened without a priority holder.
    pub priority_window_end: DateTime<Utc>,
    /// Per-round salt for the window hash, kept for audit.
    pub priority_window_nonce: String,
    /// The priority holder at the time the round opened.
    pub priority_holder: Option<String>,
    /// Terminal: settled.
    pub settled: bool,
    /// Terminal: cancelled.
    pub cancelled: bool,
    /// Leading bid, if any.
    pub high_bid: Option<HighBid>,
    /// Number of accepted bids.
    pub bid_count: u64,
    /// Previous holders invited to a lease re-auction.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub eligible_bidders: Vec<String>,
    /// Winner recorded at settlement.
    pub winner: Option<String>,
}

impl AuctionRound {
    /// Returns `true` once the round is settled or cancelled.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.settled || self.cancelled
    }

    /// Returns `true` while the round accepts bids.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && now < self.end_time
    }

    /// Returns `true` if the round opened with a holder-only window.
    #[must_use]
    pub fn has_priority_window(&self) -> bool {
        self.priority_window_end > self.start_time
    }

    /// Returns the current effective high bid.
    #[must_use]
    pub fn effective_high(&self) -> Option<Decimal> {
        self.high_bid.as_ref().map(|bid| bid.effective_amount)
    }

    /// Returns `true` if the round satisfies its structural invariants.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.priority_window_end <= self.end_time
            && self.start_time < self.end_time
            && !(self.settled && self.cancelled)
            && self
                .high_bid
                .as_ref()
                .is_none_or(|bid| bid.effective_amount >= bid.raw_amount)
    }
}

/// A recorded bid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    /// Bid identifier.
    pub bid_id: String,
    /// Bidder identity.
    pub bidder: String,
    /// Raw amount as submitted.
    pub raw_amount: Decimal,
    /// Priority-adjusted amount; `Unknown` for legacy bids.
    pub effective: EffectiveAmount,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
}

impl Bid {
    pub(crate) fn new(
        bidder: impl Into<String>,
        raw_amount: Decimal,
        effective: EffectiveAmount,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            bid_id: format!("bid-{}", uuid::Uuid::new_v4()),
            bidder: bidder.into(),
            raw_amount,
            effective,
            submitted_at,
        }
    }
}

/// Ranking order for bids, best first.
///
/// Effective amount descending with `Unknown` last, then raw amount
/// descending, then earliest submission.
#[must_use]
pub fn rank_order(a: &Bid, b: &Bid) -> Ordering {
    b.effective
        .cmp(&a.effective)
        .then_with(|| b.raw_amount.cmp(&a.raw_amount))
        .then_with(|| a.submitted_at.cmp(&b.submitted_at))
}

/// Sorts bids best first.
pub fn rank_bids(bids: &mut [Bid]) {
    bids.sort_by(rank_order);
}
