//! Lease slot state and transitions.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EntityKind};

/// Lifecycle status of a vertical's lease slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseStatus {
    /// The holder has priority.
    Active,
    /// Lease end has passed; the holder may still renew.
    GracePeriod,
    /// Renewal deadline has passed while a live auction was running.
    Paused,
    /// The lease has ended and the slot awaits a new award.
    Expired,
}

impl LeaseStatus {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::GracePeriod => "GRACE_PERIOD",
            Self::Paused => "PAUSED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Parses a status string.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] for unrecognised values.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "GRACE_PERIOD" => Ok(Self::GracePeriod),
            "PAUSED" => Ok(Self::Paused),
            "EXPIRED" => Ok(Self::Expired),
            _ => Err(EngineError::validation(
                "lease_status",
                format!("unknown lease status: {s}"),
            )),
        }
    }

    /// Returns `true` if the holder may renew from this status.
    #[must_use]
    pub const fn is_renewable(&self) -> bool {
        matches!(self, Self::Active | Self::GracePeriod)
    }
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lease slot per vertical. Never deleted; expired slots are kept for
/// audit and re-awarded in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSlot {
    /// Identifier of the current award. Changes on every award.
    pub lease_id: String,
    /// The vertical this slot governs.
    pub vertical: String,
    /// Current status.
    pub status: LeaseStatus,
    /// Current holder. Cleared the instant the lease expires.
    pub holder: Option<String>,
    /// Holder at the time of the last expiry.
    pub previous_holder: Option<String>,
    /// End of the current lease term.
    pub lease_end: DateTime<Utc>,
    /// Set iff `status == GracePeriod`.
    pub renewal_deadline: Option<DateTime<Utc>>,
    /// The auction that caused the slot to pause, while `Paused`.
    pub blocking_auction_id: Option<String>,
    /// Renewals since the last award.
    pub renewal_count: u32,
    /// When the current lease was awarded.
    pub awarded_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl LeaseSlot {
    /// Creates a freshly awarded, active slot.
    #[must_use]
    pub fn award(
        vertical: impl Into<String>,
        holder: impl Into<String>,
        now: DateTime<Utc>,
        term: Duration,
    ) -> Self {
        Self {
            lease_id: new_lease_id(),
            vertical: vertical.into(),
            status: LeaseStatus::Active,
            holder: Some(holder.into()),
            previous_holder: None,
            lease_end: now + term,
            renewal_deadline: None,
            blocking_auction_id: None,
            renewal_count: 0,
            awarded_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` if the slot satisfies its structural invariants.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        let grace = matches!(self.status, LeaseStatus::GracePeriod);
        let paused = matches!(self.status, LeaseStatus::Paused);
        let expired = matches!(self.status, LeaseStatus::Expired);
        grace == self.renewal_deadline.is_some()
            && paused == self.blocking_auction_id.is_some()
            && !(expired && self.holder.is_some())
    }

    /// Case-insensitive holder comparison.
    #[must_use]
    pub fn holder_matches(&self, actor: &str) -> bool {
        self.holder
            .as_deref()
            .is_some_and(|holder| holder.eq_ignore_ascii_case(actor))
    }

    fn conflict(&self, reason: impl Into<String>) -> EngineError {
        EngineError::conflict(EntityKind::Lease, self.vertical.clone(), reason)
    }

    /// ACTIVE -> GRACE_PERIOD.
    pub(crate) fn enter_grace(
        &mut self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<(), EngineError> {
        if self.status != LeaseStatus::Active {
            return Err(self.conflict(format!("cannot enter grace period from {}", self.status)));
        }
        self.status = LeaseStatus::GracePeriod;
        self.renewal_deadline = Some(self.lease_end + grace);
        self.updated_at = now;
        Ok(())
    }

    /// ACTIVE | GRACE_PERIOD -> ACTIVE, extending from the current end date.
    pub(crate) fn renew(&mut self, now: DateTime<Utc>, term: Duration) -> Result<(), EngineError> {
        if !self.status.is_renewable() {
            return Err(self.conflict(format!("lease is {} and cannot be renewed", self.status)));
        }
        self.status = LeaseStatus::Active;
        self.lease_end += term;
        self.renewal_deadline = None;
        self.renewal_count = self.renewal_count.saturating_add(1);
        self.updated_at = now;
        Ok(())
    }

    /// GRACE_PERIOD -> PAUSED while `auction_id` is live.
    pub(crate) fn pause(
        &mut self,
        now: DateTime<Utc>,
        auction_id: impl Into<String>,
    ) -> Result<(), EngineError> {
        if self.status != LeaseStatus::GracePeriod {
            return Err(self.conflict(format!("cannot pause from {}", self.status)));
        }
        self.status = LeaseStatus::Paused;
        self.renewal_deadline = None;
        self.blocking_auction_id = Some(auction_id.into());
        self.updated_at = now;
        Ok(())
    }

    /// ACTIVE | GRACE_PERIOD | PAUSED -> EXPIRED. Revokes the holder.
    pub(crate) fn expire(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if self.status == LeaseStatus::Expired {
            return Err(self.conflict("lease is already expired"));
        }
        self.status = LeaseStatus::Expired;
        self.previous_holder = self.holder.take();
        self.renewal_deadline = None;
        self.blocking_auction_id = None;
        self.updated_at = now;
        Ok(())
    }

    /// EXPIRED -> ACTIVE under a new holder and lease id.
    pub(crate) fn reaward(
        &mut self,
        holder: impl Into<String>,
        now: DateTime<Utc>,
        term: Duration,
    ) -> Result<(), EngineError> {
        if self.status != LeaseStatus::Expired {
            return Err(self.conflict(format!(
                "cannot award a slot that is {}",
                self.status
            )));
        }
        self.lease_id = new_lease_id();
        self.status = LeaseStatus::Active;
        self.holder = Some(holder.into());
        self.lease_end = now + term;
        self.renewal_count = 0;
        self.awarded_at = now;
        self.updated_at = now;
        Ok(())
    }
}

fn new_lease_id() -> String {
    format!("lease-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn slot() -> LeaseSlot {
        LeaseSlot::award("solar", "0xHolder", t0(), Duration::days(90))
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for status in [
            LeaseStatus::Active,
            LeaseStatus::GracePeriod,
            LeaseStatus::Paused,
            LeaseStatus::Expired,
        ] {
            assert_eq!(LeaseStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(LeaseStatus::parse("active").is_err());
    }

    #[test]
    fn test_award_is_active_and_consistent() {
        let slot = slot();
        assert_eq!(slot.status, LeaseStatus::Active);
        assert_eq!(slot.lease_end, t0() + Duration::days(90));
        assert!(slot.is_consistent());
        assert!(slot.holder_matches("0XHOLDER"));
        assert!(!slot.holder_matches("0xOther"));
    }

    #[test]
    fn test_grace_sets_deadline_from_lease_end() {
        let mut slot = slot();
        let later = slot.lease_end + Duration::hours(1);
        slot.enter_grace(later, Duration::days(7)).unwrap();
        assert_eq!(slot.status, LeaseStatus::GracePeriod);
        assert_eq!(slot.renewal_deadline, Some(slot.lease_end + Duration::days(7)));
        assert!(slot.is_consistent());
    }

    #[test]
    fn test_renew_extends_from_current_end() {
        let mut slot = slot();
        let original_end = slot.lease_end;
        slot.enter_grace(original_end, Duration::days(7)).unwrap();
        slot.renew(original_end + Duration::days(3), Duration::days(90))
            .unwrap();
        assert_eq!(slot.status, LeaseStatus::Active);
        assert_eq!(slot.lease_end, original_end + Duration::days(90));
        assert_eq!(slot.renewal_deadline, None);
        assert_eq!(slot.renewal_count, 1);
        assert!(slot.is_consistent());
    }

    #[test]
    fn test_expire_revokes_holder() {
        let mut slot = slot();
        slot.expire(t0()).unwrap();
        assert_eq!(slot.status, LeaseStatus::Expired);
        assert_eq!(slot.holder, None);
        assert_eq!(slot.previous_holder.as_deref(), Some("0xHolder"));
        assert!(slot.is_consistent());
        assert!(slot.expire(t0()).is_err());
        assert!(slot.renew(t0(), Duration::days(90)).is_err());
    }

    #[test]
    fn test_pause_requires_grace() {
        let mut slot = slot();
        assert!(slot.pause(t0(), "auction-1").is_err());
        slot.enter_grace(t0(), Duration::days(7)).unwrap();
        slot.pause(t0(), "auction-1").unwrap();
        assert_eq!(slot.status, LeaseStatus::Paused);
        assert_eq!(slot.renewal_deadline, None);
        assert!(slot.is_consistent());
        assert!(slot.renew(t0(), Duration::days(90)).is_err());
    }

    #[test]
    fn test_reaward_only_from_expired() {
        let mut slot = slot();
        assert!(slot.reaward("0xNew", t0(), Duration::days(90)).is_err());
        let first_lease = slot.lease_id.clone();
        slot.expire(t0()).unwrap();
        slot.reaward("0xNew", t0(), Duration::days(90)).unwrap();
        assert_eq!(slot.status, LeaseStatus::Active);
        assert_eq!(slot.holder.as_deref(), Some("0xNew"));
        assert_ne!(slot.lease_id, first_lease);
        assert!(slot.is_consistent());
    }
}
