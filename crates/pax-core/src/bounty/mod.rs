//! Bounty pools, matching and allocation.
//!
//! A pool is a standing escrow commitment scoped to a vertical. When a
//! transaction completes, [`BountyMatcher::match_bounties`] finds the active
//! pools whose criteria it satisfies, ranks them by available balance and
//! trims the list to the stacking cap. Allocations are proposals; funds move
//! only through [`BountyBook::release`].

mod criteria;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use self::criteria::{MatchCriteria, TransactionAttributes};
use crate::clock::Clock;
use crate::config::BountyConfig;
use crate::error::{EngineError, EntityKind};
use crate::external::CriteriaOracle;
use crate::money::{MAX_AMOUNT, round_money, validate_amount, validate_positive_amount};
use crate::tiebreak::{TieBreakCoordinator, TieBreakPurpose};

// =============================================================================
// Pools
// =============================================================================

/// A standing, vertical-scoped incentive pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BountyPool {
    /// Pool identifier.
    pub pool_id: String,
    /// The vertical the pool pays out in.
    pub vertical: String,
    /// Who funded the pool.
    pub owner: String,
    /// Where released funds are sent.
    pub payout_address: String,
    /// Sum of all deposits.
    pub total_deposited: Decimal,
    /// Sum of all releases. Never exceeds `total_deposited`.
    pub total_released: Decimal,
    /// Conditions for a payout.
    pub criteria: MatchCriteria,
    /// Inactive pools are skipped by matching.
    pub active: bool,
    /// Creation time; defines the pool list order.
    pub created_at: DateTime<Utc>,
}

impl BountyPool {
    /// Deposited minus released.
    #[must_use]
    pub fn available(&self) -> Decimal {
        self.total_deposited - self.total_released
    }

    /// Returns `true` if the pool can pay out.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.active && self.available() > Decimal::ZERO
    }
}

/// Parameters for creating a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRequest {
    /// The vertical the pool pays out in.
    pub vertical: String,
    /// Who funds the pool.
    pub owner: String,
    /// Where released funds go; defaults to the owner.
    #[serde(default)]
    pub payout_address: Option<String>,
    /// Initial deposit.
    pub amount: Decimal,
    /// Payout conditions.
    #[serde(default)]
    pub criteria: MatchCriteria,
}

/// A proposed payout from one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Source pool.
    pub pool_id: String,
    /// Pool owner.
    pub owner: String,
    /// Payout address.
    pub payout_address: String,
    /// Proposed amount.
    pub amount: Decimal,
}

/// Result of releasing funds from a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseReceipt {
    /// The pool released from.
    pub pool_id: String,
    /// Amount released.
    pub amount: Decimal,
    /// Recipient of the funds.
    pub payout_address: String,
    /// Pool total released after this release.
    pub total_released: Decimal,
    /// Pool balance after this release.
    pub available: Decimal,
    /// Whether this release emptied and deactivated the pool.
    pub deactivated: bool,
}

/// Pools keyed by id.
///
/// Every mutation locks only the targeted pool's entry.
pub struct BountyBook {
    pools: DashMap<String, BountyPool>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for BountyBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BountyBook")
            .field("pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}

impl BountyBook {
    /// Creates an empty book.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            pools: DashMap::new(),
            clock,
        }
    }

    /// Creates a pool with an initial deposit.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for blank identities, a
    /// non-positive or over-precise amount, or malformed criteria.
    pub fn deposit(&self, request: DepositRequest) -> Result<BountyPool, EngineError> {
        let vertical = non_blank("vertical", &request.vertical)?;
        let owner = non_blank("owner", &request.owner)?;
        let payout_address = match request.payout_address.as_deref() {
            Some(address) => non_blank("payout_address", address)?,
            None => owner.clone(),
        };
        let amount = validate_positive_amount("amount", request.amount)?;
        request.criteria.validate()?;

        let pool = BountyPool {
            pool_id: format!("pool-{}", uuid::Uuid::new_v4()),
            vertical,
            owner,
            payout_address,
            total_deposited: amount,
            total_released: Decimal::ZERO,
            criteria: request.criteria,
            active: true,
            created_at: self.clock.now(),
        };
        self.pools.insert(pool.pool_id.clone(), pool.clone());
        info!(
            pool_id = %pool.pool_id,
            vertical = %pool.vertical,
            owner = %pool.owner,
            %amount,
            "bounty pool created"
        );
        Ok(pool)
    }

    /// Adds funds to a pool and re-activates it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for a bad amount and
    /// [`EngineError::NotFound`] for an unknown pool.
    pub fn top_up(&self, pool_id: &str, amount: Decimal) -> Result<BountyPool, EngineError> {
        let amount = validate_positive_amount("amount", amount)?;
        let mut pool = self
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Pool, pool_id))?;
        pool.total_deposited = pool
            .total_deposited
            .checked_add(amount)
            .filter(|total| *total <= MAX_AMOUNT)
            .ok_or_else(|| {
                EngineError::validation("amount", format!("pool balance would exceed {MAX_AMOUNT}"))
            })?;
        pool.active = true;
        debug!(pool_id, %amount, available = %pool.available(), "bounty pool topped up");
        Ok(pool.clone())
    }

    /// Releases `amount` from one pool.
    ///
    /// Deactivates the pool when its balance reaches zero. No other pool is
    /// touched.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for a bad amount,
    /// [`EngineError::NotFound`] for an unknown pool, and
    /// [`EngineError::StateConflict`] if the pool is inactive or the amount
    /// exceeds its balance.
    pub fn release(&self, pool_id: &str, amount: Decimal) -> Result<ReleaseReceipt, EngineError> {
        let amount = validate_positive_amount("amount", amount)?;
        let mut pool = self
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| EngineError::not_found(EntityKind::Pool, pool_id))?;
        if !pool.active {
            return Err(EngineError::conflict(EntityKind::Pool, pool_id, "pool is inactive"));
        }
        let available = pool.available();
        if amount > available {
            return Err(EngineError::conflict(
                EntityKind::Pool,
                pool_id,
                format!("release of {amount} exceeds available balance {available}"),
            ));
        }

        pool.total_released += amount;
        let deactivated = pool.available().is_zero();
        if deactivated {
            pool.active = false;
        }
        info!(pool_id, %amount, available = %pool.available(), deactivated, "bounty released");
        Ok(ReleaseReceipt {
            pool_id: pool_id.to_string(),
            amount,
            payout_address: pool.payout_address.clone(),
            total_released: pool.total_released,
            available: pool.available(),
            deactivated,
        })
    }

    /// Returns a snapshot of a pool.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for an unknown pool.
    pub fn pool(&self, pool_id: &str) -> Result<BountyPool, EngineError> {
        self.pools
            .get(pool_id)
            .map(|pool| pool.clone())
            .ok_or_else(|| EngineError::not_found(EntityKind::Pool, pool_id))
    }

    /// Eligible pools in `vertical`, in pool list order.
    #[must_use]
    pub fn candidates(&self, vertical: &str) -> Vec<BountyPool> {
        let mut pools: Vec<BountyPool> = self
            .pools
            .iter()
            .filter(|pool| pool.vertical == vertical && pool.is_eligible())
            .map(|pool| pool.clone())
            .collect();
        pools.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.pool_id.cmp(&b.pool_id))
        });
        pools
    }
}

fn non_blank(field: &str, value: &str) -> Result<String, EngineError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::validation(field, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

// =============================================================================
// Matching
// =============================================================================

/// Matches transactions against pools and applies the stacking cap.
pub struct BountyMatcher {
    book: Arc<BountyBook>,
    oracle: Arc<dyn CriteriaOracle>,
    tiebreak: Arc<TieBreakCoordinator>,
    config: BountyConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for BountyMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BountyMatcher")
            .field("book", &self.book)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BountyMatcher {
    /// Creates a matcher over `book`.
    #[must_use]
    pub fn new(
        book: Arc<BountyBook>,
        oracle: Arc<dyn CriteriaOracle>,
        tiebreak: Arc<TieBreakCoordinator>,
        config: BountyConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            book,
            oracle,
            tiebreak,
            config,
            clock,
        }
    }

    /// The underlying pool book.
    #[must_use]
    pub const fn book(&self) -> &Arc<BountyBook> {
        &self.book
    }

    /// Proposes allocations for a completed transaction.
    ///
    /// The cap is `stacking_cap_multiple * price`, where the price is
    /// `winning_price`, else the transaction's ask price, else zero. A zero
    /// price disables the cap.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for a malformed transaction or
    /// price. Oracle failures fall back silently to local matching.
    pub async fn match_bounties(
        &self,
        tx: &TransactionAttributes,
        winning_price: Option<Decimal>,
    ) -> Result<Vec<Allocation>, EngineError> {
        non_blank("transaction_id", &tx.transaction_id)?;
        non_blank("vertical", &tx.vertical)?;
        let price = match winning_price.or(tx.ask_price) {
            Some(price) => validate_amount("winning_price", price)?,
            None => Decimal::ZERO,
        };

        let candidates = self.book.candidates(tx.vertical.trim());
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let mut matched = self.evaluate(tx, candidates).await;
        matched.sort_by(|a, b| b.available().cmp(&a.available()));
        self.order_top_tie(tx, &mut matched).await;

        let allocations = apply_cap(&matched, price, self.config.stacking_cap_multiple);
        debug!(
            transaction_id = %tx.transaction_id,
            matched = matched.len(),
            allocations = allocations.len(),
            %price,
            "bounties matched"
        );
        Ok(allocations)
    }

    async fn evaluate(
        &self,
        tx: &TransactionAttributes,
        candidates: Vec<BountyPool>,
    ) -> Vec<BountyPool> {
        if self.config.criteria_oracle_enabled && self.oracle.is_configured() {
            let call = self.oracle.evaluate(tx, &candidates);
            let result = tokio::time::timeout(self.config.criteria_oracle_timeout(), call).await;
            match result {
                Ok(Ok(attestation)) => {
                    debug!(
                        transaction_id = %tx.transaction_id,
                        attestation_id = attestation.attestation_id.as_deref().unwrap_or("none"),
                        "criteria oracle attested matches"
                    );
                    return candidates
                        .into_iter()
                        .filter(|pool| attestation.matched_pool_ids.contains(&pool.pool_id))
                        .collect();
                },
                Ok(Err(e)) => {
                    warn!(
                        transaction_id = %tx.transaction_id,
                        error = %e,
                        "criteria oracle failed, matching locally"
                    );
                },
                Err(_) => {
                    warn!(
                        transaction_id = %tx.transaction_id,
                        timeout_ms = self.config.criteria_oracle_timeout_ms,
                        "criteria oracle timed out, matching locally"
                    );
                },
            }
        }
        let now = self.clock.now();
        candidates
            .into_iter()
            .filter(|pool| pool.criteria.matches(tx, now))
            .collect()
    }

    /// Moves the oracle-chosen pool to the front of a tied top group.
    async fn order_top_tie(&self, tx: &TransactionAttributes, ranked: &mut [BountyPool]) {
        let Some(top) = ranked.first().map(BountyPool::available) else {
            return;
        };
        let tied = ranked.iter().take_while(|pool| pool.available() == top).count();
        if tied < 2 {
            return;
        }
        let candidates: Vec<String> = ranked[..tied]
            .iter()
            .map(|pool| pool.payout_address.clone())
            .collect();
        let subject_id = bounty_tie_subject(&tx.transaction_id);
        let Some(handle) = self
            .tiebreak
            .request_tie_break(&subject_id, candidates, TieBreakPurpose::BountyAllocation)
            .await
        else {
            return;
        };
        let config = self.tiebreak.config();
        let Some(winner) = self
            .tiebreak
            .await_resolution(handle.subject_id(), config.await_timeout(), config.poll_interval())
            .await
        else {
            return;
        };
        if let Some(position) = ranked[..tied]
            .iter()
            .position(|pool| pool.payout_address.eq_ignore_ascii_case(&winner))
        {
            ranked[..=position].rotate_right(1);
        }
    }
}

/// Ledger key for a bounty tie, kept apart from auction ids.
#[must_use]
pub fn bounty_tie_subject(transaction_id: &str) -> String {
    format!("bounty:{transaction_id}")
}

/// Walks `ranked` allocating `min(available, remaining)` until the cap is
/// spent. Pools past the cap are dropped.
#[must_use]
pub fn apply_cap(ranked: &[BountyPool], price: Decimal, cap_multiple: Decimal) -> Vec<Allocation> {
    let allocation = |pool: &BountyPool, amount: Decimal| Allocation {
        pool_id: pool.pool_id.clone(),
        owner: pool.owner.clone(),
        payout_address: pool.payout_address.clone(),
        amount,
    };
    if price.is_zero() {
        return ranked
            .iter()
            .map(|pool| allocation(pool, pool.available()))
            .collect();
    }

    // An unrepresentable cap exceeds every balance.
    let Some(mut remaining) = price.checked_mul(cap_multiple).map(round_money) else {
        return ranked
            .iter()
            .map(|pool| allocation(pool, pool.available()))
            .collect();
    };
    let mut allocations = Vec::new();
    for pool in ranked {
        if remaining <= Decimal::ZERO {
            break;
        }
        let amount = pool.available().min(remaining);
        remaining -= amount;
        allocations.push(allocation(pool, amount));
    }
    allocations
}
