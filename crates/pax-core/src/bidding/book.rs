//! In-process store of auction rounds and their bids.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;

use super::round::{AuctionRound, Bid, RoundPurpose, rank_bids};
use crate::error::{EngineError, EntityKind};

/// A round together with its bid history.
#[derive(Debug, Clone)]
pub(crate) struct AuctionEntry {
    pub(crate) round: AuctionRound,
    pub(crate) bids: Vec<Bid>,
}

/// Auction rounds keyed by id, each behind its own mutex.
///
/// Commits on one round serialize on that round's mutex; rounds never
/// contend with each other. Rounds are kept after they end for audit.
#[derive(Default)]
pub struct AuctionBook {
    rounds: DashMap<String, Arc<Mutex<AuctionEntry>>>,
    bid_history: DashMap<String, u64>,
    vertical_gates: DashMap<String, Arc<Mutex<()>>>,
}

impl fmt::Debug for AuctionBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuctionBook")
            .field("rounds", &self.rounds.len())
            .field("wallets", &self.bid_history.len())
            .finish()
    }
}

impl AuctionBook {
    /// Creates an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a freshly opened round.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::StateConflict`] if the id is taken.
    pub fn insert(&self, round: AuctionRound) -> Result<(), EngineError> {
        let auction_id = round.auction_id.clone();
        match self.rounds.entry(auction_id.clone()) {
            Entry::Occupied(_) => Err(EngineError::conflict(
                EntityKind::Auction,
                auction_id,
                "auction id already exists",
            )),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(AuctionEntry {
                    round,
                    bids: Vec::new(),
                })));
                Ok(())
            },
        }
    }

    /// Adds a round unless its vertical already has a conflicting one.
    ///
    /// A standard round conflicts with any live round on the vertical; a
    /// lease-award round conflicts with an unsettled lease-award round.
    /// The check and the insert happen under the vertical's gate, so two
    /// racing openers cannot both succeed.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::StateConflict`] if the vertical is occupied or
    /// the id is taken.
    pub fn insert_if_vertical_free(
        &self,
        round: AuctionRound,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let gate = self
            .vertical_gates
            .entry(round.vertical.clone())
            .or_default()
            .clone();
        let _held = gate.lock();
        if self.is_vertical_occupied(&round.vertical, round.purpose, now) {
            return Err(EngineError::conflict(
                EntityKind::Vertical,
                round.vertical.clone(),
                format!("a {} round is already in progress", round.purpose),
            ));
        }
        self.insert(round)
    }

    /// Returns `true` if opening a `purpose` round on `vertical` at `now`
    /// would conflict with an existing round.
    #[must_use]
    pub fn is_vertical_occupied(
        &self,
        vertical: &str,
        purpose: RoundPurpose,
        now: DateTime<Utc>,
    ) -> bool {
        match purpose {
            RoundPurpose::Standard => self.live_round_for_vertical(vertical, now).is_some(),
            RoundPurpose::LeaseAward => {
                self.has_unsettled_round(vertical, RoundPurpose::LeaseAward)
            },
        }
    }

    pub(crate) fn entry(&self, auction_id: &str) -> Result<Arc<Mutex<AuctionEntry>>, EngineError> {
        self.rounds
            .get(auction_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::not_found(EntityKind::Auction, auction_id))
    }

    /// Returns a snapshot of a round.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for unknown ids.
    pub fn round(&self, auction_id: &str) -> Result<AuctionRound, EngineError> {
        Ok(self.entry(auction_id)?.lock().round.clone())
    }

    /// Returns the round's bids, best first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for unknown ids.
    pub fn ranked_bids(&self, auction_id: &str) -> Result<Vec<Bid>, EngineError> {
        let mut bids = self.entry(auction_id)?.lock().bids.clone();
        rank_bids(&mut bids);
        Ok(bids)
    }

    fn snapshot(&self) -> Vec<AuctionRound> {
        let entries: Vec<Arc<Mutex<AuctionEntry>>> = self
            .rounds
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut rounds: Vec<AuctionRound> = entries
            .iter()
            .map(|entry| entry.lock().round.clone())
            .collect();
        rounds.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.auction_id.cmp(&b.auction_id))
        });
        rounds
    }

    /// Rounds for `vertical`, oldest first.
    #[must_use]
    pub fn rounds_for_vertical(&self, vertical: &str) -> Vec<AuctionRound> {
        self.snapshot()
            .into_iter()
            .filter(|round| round.vertical == vertical)
            .collect()
    }

    /// The earliest-opened round on `vertical` still accepting bids.
    #[must_use]
    pub fn live_round_for_vertical(
        &self,
        vertical: &str,
        now: DateTime<Utc>,
    ) -> Option<AuctionRound> {
        self.rounds_for_vertical(vertical)
            .into_iter()
            .find(|round| round.is_live(now))
    }

    /// Returns `true` if a non-terminal round with `purpose` exists on
    /// `vertical`, whether or not bidding has closed.
    #[must_use]
    pub fn has_unsettled_round(&self, vertical: &str, purpose: RoundPurpose) -> bool {
        self.rounds_for_vertical(vertical)
            .iter()
            .any(|round| round.purpose == purpose && !round.is_terminal())
    }

    /// Accepted bids recorded for `wallet` across all rounds.
    #[must_use]
    pub fn historical_bid_count(&self, wallet: &str) -> u64 {
        self.bid_history
            .get(&wallet.to_ascii_lowercase())
            .map_or(0, |count| *count)
    }

    pub(crate) fn record_bid_history(&self, wallet: &str) {
        *self
            .bid_history
            .entry(wallet.to_ascii_lowercase())
            .or_insert(0) += 1;
    }

    /// Number of rounds ever opened.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    /// Returns `true` if no round was ever opened.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}
