//! External collaborator seams.
//!
//! The engine talks to five collaborators it does not own. Each is a trait
//! with a default implementation, chosen once when the engine is built:
//!
//! | Collaborator            | Default                  | Fallback when failing          |
//! |-------------------------|--------------------------|--------------------------------|
//! | [`VerticalRegistry`]    | [`InMemoryVerticalRegistry`] | reads: no priority; writes: error |
//! | [`ComplianceGate`]      | [`AllowAllCompliance`]   | fail-open (configurable)       |
//! | [`RandomnessOracle`]    | [`NoRandomnessOracle`]   | deterministic ordering         |
//! | [`CriteriaOracle`]      | [`NoCriteriaOracle`]     | local AND-matching             |
//! | [`NotificationChannel`] | [`DiscardNotifications`] | drop the notification          |
//!
//! Optional collaborators advertise themselves through `is_configured`, so
//! business logic checks a capability instead of matching on `Option`.

mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use self::memory::InMemoryVerticalRegistry;
use crate::bounty::{BountyPool, TransactionAttributes};
use crate::error::ExternalError;
use crate::events::EngineEvent;
use crate::lease::{LeaseSlot, LeaseStatus};
use crate::tiebreak::TieBreakRequest;

// =============================================================================
// Vertical Registry
// =============================================================================

/// Storage for lease slots, owned by the vertical taxonomy service.
#[async_trait]
pub trait VerticalRegistry: Send + Sync {
    /// Loads the slot for `vertical`, if one was ever awarded.
    async fn load_slot(&self, vertical: &str) -> Result<Option<LeaseSlot>, ExternalError>;

    /// Inserts or replaces the slot for `slot.vertical`.
    async fn store_slot(&self, slot: LeaseSlot) -> Result<(), ExternalError>;

    /// Lists slots currently in `status`, ordered by vertical.
    async fn slots_in_status(&self, status: LeaseStatus) -> Result<Vec<LeaseSlot>, ExternalError>;
}

// =============================================================================
// Compliance Gate
// =============================================================================

/// Answer from the compliance gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceDecision {
    /// Whether the actor may transact in the vertical.
    pub allowed: bool,
    /// Optional explanation for a denial.
    pub reason: Option<String>,
}

impl ComplianceDecision {
    /// An unconditional allow.
    #[must_use]
    pub const fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// A denial with a reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Advisory allow/deny check consulted before granting priority perks.
#[async_trait]
pub trait ComplianceGate: Send + Sync {
    /// Checks whether `actor` may transact in `vertical`.
    async fn can_transact(
        &self,
        actor: &str,
        vertical: &str,
        context: &str,
    ) -> Result<ComplianceDecision, ExternalError>;
}

/// Compliance gate that allows every actor.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllCompliance;

#[async_trait]
impl ComplianceGate for AllowAllCompliance {
    async fn can_transact(
        &self,
        _actor: &str,
        _vertical: &str,
        _context: &str,
    ) -> Result<ComplianceDecision, ExternalError> {
        Ok(ComplianceDecision::allow())
    }
}

// =============================================================================
// Randomness Oracle
// =============================================================================

/// Status of a tie-break request as reported by the oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OracleStatus {
    /// Not yet resolved.
    Pending,
    /// Resolved with a verifiably random winner.
    Fulfilled {
        /// The selected candidate.
        winner: String,
    },
    /// The oracle gave up on this request.
    Failed {
        /// Oracle-reported reason.
        reason: String,
    },
}

/// Verifiable randomness source used to break ties.
#[async_trait]
pub trait RandomnessOracle: Send + Sync {
    /// Whether a real oracle is behind this handle.
    fn is_configured(&self) -> bool {
        true
    }

    /// Submits a tie-break request.
    async fn request(&self, request: &TieBreakRequest) -> Result<(), ExternalError>;

    /// Polls the status of the request for `subject_id`.
    async fn poll(&self, subject_id: &str) -> Result<OracleStatus, ExternalError>;
}

/// Placeholder for deployments without a randomness oracle.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRandomnessOracle;

#[async_trait]
impl RandomnessOracle for NoRandomnessOracle {
    fn is_configured(&self) -> bool {
        false
    }

    async fn request(&self, _request: &TieBreakRequest) -> Result<(), ExternalError> {
        Err(ExternalError::Unavailable(
            "randomness oracle not configured".to_string(),
        ))
    }

    async fn poll(&self, _subject_id: &str) -> Result<OracleStatus, ExternalError> {
        Err(ExternalError::Unavailable(
            "randomness oracle not configured".to_string(),
        ))
    }
}

// =============================================================================
// Criteria Oracle
// =============================================================================

/// Attested result of a batch criteria evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriteriaAttestation {
    /// Pools whose criteria the transaction satisfies.
    pub matched_pool_ids: Vec<String>,
    /// Oracle attestation reference, kept for audit.
    pub attestation_id: Option<String>,
}

/// Batch evaluator of bounty criteria against one transaction.
#[async_trait]
pub trait CriteriaOracle: Send + Sync {
    /// Whether a real oracle is behind this handle.
    fn is_configured(&self) -> bool {
        true
    }

    /// Evaluates every candidate pool against `transaction` in one call.
    async fn evaluate(
        &self,
        transaction: &TransactionAttributes,
        pools: &[BountyPool],
    ) -> Result<CriteriaAttestation, ExternalError>;
}

/// Placeholder for deployments without a criteria oracle.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCriteriaOracle;

#[async_trait]
impl CriteriaOracle for NoCriteriaOracle {
    fn is_configured(&self) -> bool {
        false
    }

    async fn evaluate(
        &self,
        _transaction: &TransactionAttributes,
        _pools: &[BountyPool],
    ) -> Result<CriteriaAttestation, ExternalError> {
        Err(ExternalError::Unavailable(
            "criteria oracle not configured".to_string(),
        ))
    }
}

// =============================================================================
// Notification Channel
// =============================================================================

/// Best-effort delivery of engine events to actors.
///
/// Consent and volume gating belong to the channel; the engine only asks
/// [`NotificationChannel::may_notify`] before enqueueing.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Whether `actor` has consented to notifications.
    async fn may_notify(&self, actor: &str) -> bool;

    /// Queues `event` for `actor`.
    async fn enqueue(&self, actor: &str, event: EngineEvent) -> Result<(), ExternalError>;
}

/// Channel that never notifies.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardNotifications;

#[async_trait]
impl NotificationChannel for DiscardNotifications {
    async fn may_notify(&self, _actor: &str) -> bool {
        false
    }

    async fn enqueue(&self, _actor: &str, _event: EngineEvent) -> Result<(), ExternalError> {
        Ok(())
    }
}
