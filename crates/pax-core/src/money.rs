//! Monetary primitives.
//!
//! Every monetary value in the engine is a [`Decimal`]. Computed amounts are
//! rounded exactly once, half-up to two decimal places, by [`round_money`].
//! Values that are already rounded are never passed through it again.
//!
//! Legacy bid records may not carry an effective amount. Those are modelled
//! as [`EffectiveAmount::Unknown`], which is distinct from a known amount of
//! zero and ranks below every known amount.

use std::cmp::Ordering;
use std::fmt;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Number of decimal places carried by monetary amounts.
pub const MONEY_DP: u32 = 2;

/// Largest amount accepted from a caller (10^15).
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(2_764_472_320, 232_830, 0, false, 0);

/// Rounds a computed amount half-up to [`MONEY_DP`] places.
#[must_use]
pub fn round_money(value: Decimal) -> Decimal {
    let mut rounded =
        value.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(MONEY_DP);
    rounded
}

/// Validates a caller-supplied amount: non-negative, at most two decimals,
/// at most [`MAX_AMOUNT`].
///
/// # Errors
///
/// Returns [`EngineError::Validation`] when the amount is negative, too large
/// or carries more precision than [`MONEY_DP`].
pub fn validate_amount(field: &str, value: Decimal) -> Result<Decimal, EngineError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(EngineError::validation(field, format!("must not be negative, got {value}")));
    }
    if value > MAX_AMOUNT {
        return Err(EngineError::validation(
            field,
            format!("must not exceed {MAX_AMOUNT}, got {value}"),
        ));
    }
    if value.normalize().scale() > MONEY_DP {
        return Err(EngineError::validation(
            field,
            format!("at most {MONEY_DP} decimal places allowed, got {value}"),
        ));
    }
    Ok(value)
}

/// Validates an amount that must be strictly positive.
///
/// # Errors
///
/// Returns [`EngineError::Validation`] for zero, negative or over-precise
/// amounts.
pub fn validate_positive_amount(field: &str, value: Decimal) -> Result<Decimal, EngineError> {
    let value = validate_amount(field, value)?;
    if value.is_zero() {
        return Err(EngineError::validation(field, "must be greater than zero"));
    }
    Ok(value)
}

/// Priority bid multiplier. Always `>= 1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Multiplier(Decimal);

impl Multiplier {
    /// The neutral multiplier granted to non-priority bidders.
    pub const ONE: Self = Self(Decimal::ONE);

    /// Default multiplier granted to a confirmed priority holder (1.2x).
    pub const DEFAULT_PRIORITY: Self = Self(Decimal::from_parts(12, 0, 0, false, 1));

    /// Creates a multiplier.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if `value < 1.0`.
    pub fn new(value: Decimal) -> Result<Self, EngineError> {
        if value < Decimal::ONE {
            return Err(EngineError::validation(
                "multiplier",
                format!("must be >= 1.0, got {value}"),
            ));
        }
        Ok(Self(value))
    }

    /// Returns the raw decimal value.
    #[must_use]
    pub const fn value(self) -> Decimal {
        self.0
    }

    /// Returns `true` if this multiplier boosts bids.
    #[must_use]
    pub fn is_boosted(self) -> bool {
        self.0 > Decimal::ONE
    }
}

impl Default for Multiplier {
    fn default() -> Self {
        Self::ONE
    }
}

impl TryFrom<Decimal> for Multiplier {
    type Error = EngineError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Multiplier> for Decimal {
    fn from(value: Multiplier) -> Self {
        value.0
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x", self.0)
    }
}

/// Applies a priority multiplier to a raw bid.
///
/// `effective(r, m) = round(r * m, 2)`.
///
/// # Errors
///
/// Returns [`EngineError::Validation`] if the product is not representable.
pub fn effective_amount(raw: Decimal, multiplier: Multiplier) -> Result<Decimal, EngineError> {
    raw.checked_mul(multiplier.value())
        .map(round_money)
        .ok_or_else(|| {
            EngineError::validation(
                "raw_amount",
                format!("{raw} x {multiplier} is out of range"),
            )
        })
}

/// A bid's priority-adjusted amount, or the explicit absence of one.
///
/// `Unknown` ranks below every `Known` value, including `Known(0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "amount", rename_all = "snake_case")]
pub enum EffectiveAmount {
    /// Recorded before priority multipliers existed.
    Unknown,
    /// A computed effective amount.
    Known(Decimal),
}

impl EffectiveAmount {
    /// Returns the known amount, if any.
    #[must_use]
    pub const fn known(self) -> Option<Decimal> {
        match self {
            Self::Unknown => None,
            Self::Known(amount) => Some(amount),
        }
    }

    /// Returns `true` if the amount is unknown.
    #[must_use]
    pub const fn is_unknown(self) -> bool {
        matches!(self, Self::Unknown)
    }
}

impl From<Option<Decimal>> for EffectiveAmount {
    fn from(value: Option<Decimal>) -> Self {
        value.map_or(Self::Unknown, Self::Known)
    }
}

impl PartialOrd for EffectiveAmount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EffectiveAmount {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Unknown, Self::Unknown) => Ordering::Equal,
            (Self::Unknown, Self::Known(_)) => Ordering::Less,
            (Self::Known(_), Self::Unknown) => Ordering::Greater,
            (Self::Known(a), Self::Known(b)) => a.cmp(b),
        }
    }
}

impl fmt::Display for EffectiveAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            Self::Known(amount) => write!(f, "{amount}"),
        }
    }
}
