//! Events emitted to the notification channel.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::lease::LeaseStatus;
use crate::tiebreak::TieBreakPurpose;

/// A best-effort notification about an engine state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A lease slot changed status.
    LeaseTransitioned {
        /// The lease being transitioned.
        lease_id: String,
        /// The vertical.
        vertical: String,
        /// Status before the transition; `None` on first award.
        from: Option<LeaseStatus>,
        /// Status after the transition.
        to: LeaseStatus,
        /// Holder after the transition.
        holder: Option<String>,
        /// When the transition was recorded.
        at: DateTime<Utc>,
    },

    /// A re-auction round was opened for an expired slot.
    ReauctionOpened {
        /// The vertical being re-auctioned.
        vertical: String,
        /// The new round.
        auction_id: String,
        /// Whether the previous holder was auto-eligible.
        previous_holder_eligible: bool,
        /// When the round opened.
        at: DateTime<Utc>,
    },

    /// An auction round settled.
    AuctionSettled {
        /// The settled round.
        auction_id: String,
        /// The round's vertical.
        vertical: String,
        /// The winning bidder, if any bids were placed.
        winner: Option<String>,
        /// The winner's effective amount.
        effective_amount: Option<Decimal>,
        /// When the round settled.
        at: DateTime<Utc>,
    },

    /// The randomness oracle resolved a tie after the fallback was applied.
    TieBreakResolved {
        /// The subject of the tie (auction id or transaction id).
        subject_id: String,
        /// What the tie was about.
        purpose: TieBreakPurpose,
        /// The verifiably random winner.
        winner: String,
        /// When the resolution was recorded.
        at: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Short event name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::LeaseTransitioned { .. } => "lease_transitioned",
            Self::ReauctionOpened { .. } => "reauction_opened",
            Self::AuctionSettled { .. } => "auction_settled",
            Self::TieBreakResolved { .. } => "tie_break_resolved",
        }
    }
}
