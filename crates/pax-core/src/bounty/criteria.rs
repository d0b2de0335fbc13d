//! Bounty match criteria.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Attributes of a completed transaction that pools are matched against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAttributes {
    /// Transaction identifier, also the tie-break subject.
    pub transaction_id: String,
    /// The vertical the transaction happened in.
    pub vertical: String,
    /// Lead quality score.
    #[serde(default)]
    pub quality_score: Option<Decimal>,
    /// Region or country code.
    #[serde(default)]
    pub region: Option<String>,
    /// Credit score.
    #[serde(default)]
    pub credit_score: Option<u32>,
    /// When the underlying lead was created.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Reserve or ask price, used when no winning price is given.
    #[serde(default)]
    pub ask_price: Option<Decimal>,
}

/// Conditions a transaction must meet for a pool to pay out.
///
/// Every present criterion must hold; absent criteria always hold. A
/// present criterion whose transaction attribute is missing does not hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MatchCriteria {
    /// Minimum quality score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_quality_score: Option<Decimal>,
    /// Allowed regions, compared case-insensitively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_regions: Option<Vec<String>>,
    /// Minimum credit score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_credit_score: Option<u32>,
    /// Maximum lead age in hours.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_hours: Option<u32>,
}

impl MatchCriteria {
    /// Returns `true` if no criterion is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.min_quality_score.is_none()
            && self.allowed_regions.is_none()
            && self.min_credit_score.is_none()
            && self.max_age_hours.is_none()
    }

    /// Rejects malformed criteria.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for a negative quality floor, an
    /// empty or blank region list, or a zero age limit.
    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some(score) = self.min_quality_score {
            if score.is_sign_negative() && !score.is_zero() {
                return Err(EngineError::validation(
                    "criteria.min_quality_score",
                    "must not be negative",
                ));
            }
        }
        if let Some(regions) = &self.allowed_regions {
            if regions.is_empty() {
                return Err(EngineError::validation(
                    "criteria.allowed_regions",
                    "must list at least one region when present",
                ));
            }
            if regions.iter().any(|region| region.trim().is_empty()) {
                return Err(EngineError::validation(
                    "criteria.allowed_regions",
                    "regions must not be blank",
                ));
            }
        }
        if self.max_age_hours == Some(0) {
            return Err(EngineError::validation(
                "criteria.max_age_hours",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Evaluates the criteria against `tx` at `now`.
    #[must_use]
    pub fn matches(&self, tx: &TransactionAttributes, now: DateTime<Utc>) -> bool {
        if let Some(floor) = self.min_quality_score {
            if tx.quality_score.is_none_or(|score| score < floor) {
                return false;
            }
        }
        if let Some(regions) = &self.allowed_regions {
            let Some(region) = tx.region.as_deref().map(str::trim) else {
                return false;
            };
            if !regions
                .iter()
                .any(|allowed| allowed.trim().eq_ignore_ascii_case(region))
            {
                return false;
            }
        }
        if let Some(floor) = self.min_credit_score {
            if tx.credit_score.is_none_or(|score| score < floor) {
                return false;
            }
        }
        if let Some(max_hours) = self.max_age_hours {
            let Some(created_at) = tx.created_at else {
                return false;
            };
            if now - created_at > Duration::hours(i64::from(max_hours)) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn tx() -> TransactionAttributes {
        TransactionAttributes {
            transaction_id: "tx-1".to_string(),
            vertical: "solar".to_string(),
            quality_score: Some(dec!(7.5)),
            region: Some("US-CA".to_string()),
            credit_score: Some(700),
            created_at: Some(now() - Duration::hours(10)),
            ask_price: Some(dec!(50)),
        }
    }

    #[test]
    fn test_empty_criteria_match_everything() {
        let criteria = MatchCriteria::default();
        assert!(criteria.is_empty());
        assert!(criteria.matches(&tx(), now()));
        let bare = TransactionAttributes {
            quality_score: None,
            region: None,
            credit_score: None,
            created_at: None,
            ..tx()
        };
        assert!(criteria.matches(&bare, now()));
    }

    #[test]
    fn test_all_criteria_are_anded() {
        let criteria = MatchCriteria {
            min_quality_score: Some(dec!(7)),
            allowed_regions: Some(vec!["us-ca".to_string(), "US-NV".to_string()]),
            min_credit_score: Some(650),
            max_age_hours: Some(24),
        };
        assert!(criteria.matches(&tx(), now()));

        let low_quality = TransactionAttributes {
            quality_score: Some(dec!(6.9)),
            ..tx()
        };
        assert!(!criteria.matches(&low_quality, now()));

        let wrong_region = TransactionAttributes {
            region: Some("US-TX".to_string()),
            ..tx()
        };
        assert!(!criteria.matches(&wrong_region, now()));

        let too_old = TransactionAttributes {
            created_at: Some(now() - Duration::hours(25)),
            ..tx()
        };
        assert!(!criteria.matches(&too_old, now()));
    }

    #[test]
    fn test_missing_attribute_fails_present_criterion() {
        let criteria = MatchCriteria {
            min_credit_score: Some(600),
            ..MatchCriteria::default()
        };
        let no_credit = TransactionAttributes {
            credit_score: None,
            ..tx()
        };
        assert!(!criteria.matches(&no_credit, now()));
    }

    #[test]
    fn test_validate_rejects_malformed() {
        let empty_regions = MatchCriteria {
            allowed_regions: Some(Vec::new()),
            ..MatchCriteria::default()
        };
        assert!(empty_regions.validate().is_err());

        let zero_age = MatchCriteria {
            max_age_hours: Some(0),
            ..MatchCriteria::default()
        };
        assert!(zero_age.validate().is_err());

        let negative = MatchCriteria {
            min_quality_score: Some(dec!(-1)),
            ..MatchCriteria::default()
        };
        assert!(negative.validate().is_err());
        assert!(MatchCriteria::default().validate().is_ok());
    }
}
