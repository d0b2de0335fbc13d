//! Tie-break coordination.
//!
//! When two or more candidates share the top rank, the coordinator asks the
//! [`RandomnessOracle`] for a verifiable winner. Every path degrades to
//! "no winner", which callers answer with their own deterministic ordering:
//!
//! - [`TieBreakCoordinator::request_tie_break`] returns `None` when no oracle
//!   is configured, when there is no real tie, or when the request fails.
//! - [`TieBreakCoordinator::await_resolution`] returns `None` on oracle
//!   failure or once its deadline passes. It never returns an error.
//! - [`TieBreakCoordinator::spawn_watcher`] polls in a detached task after
//!   the fallback has been applied and only records the winner for audit.
//!
//! # Request lifecycle
//!
//! ```text
//! NONE -> PENDING -> FULFILLED
//!                 \-> FAILED
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::TieBreakConfig;
use crate::events::EngineEvent;
use crate::external::{NotificationChannel, OracleStatus, RandomnessOracle};

// =============================================================================
// Types
// =============================================================================

/// What a tie-break decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TieBreakPurpose {
    /// Equal top effective bids in an auction round.
    AuctionTie,
    /// Equal top balances among matched bounty pools.
    BountyAllocation,
}

impl TieBreakPurpose {
    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AuctionTie => "AUCTION_TIE",
            Self::BountyAllocation => "BOUNTY_ALLOCATION",
        }
    }
}

impl fmt::Display for TieBreakPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolution status of a tie-break request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStatus {
    /// Not yet submitted.
    #[default]
    None,
    /// Submitted and awaiting the oracle.
    Pending,
    /// The oracle selected a winner.
    Fulfilled,
    /// The oracle failed, or returned an invalid winner.
    Failed,
}

impl ResolutionStatus {
    /// Returns `true` for `Fulfilled` and `Failed`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Fulfilled | Self::Failed)
    }
}

/// A tie event and its resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TieBreakRequest {
    /// Auction id or transaction id.
    pub subject_id: String,
    /// Tied candidates in fallback order.
    pub candidates: Vec<String>,
    /// What the tie is about.
    pub purpose: TieBreakPurpose,
    /// Current resolution status.
    pub status: ResolutionStatus,
    /// The oracle's winner once fulfilled.
    pub winner: Option<String>,
    /// When the request was submitted.
    pub requested_at: Option<DateTime<Utc>>,
    /// When the resolution was recorded.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl TieBreakRequest {
    /// Creates an unsubmitted request.
    #[must_use]
    pub fn new(
        subject_id: impl Into<String>,
        candidates: Vec<String>,
        purpose: TieBreakPurpose,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            candidates,
            purpose,
            status: ResolutionStatus::None,
            winner: None,
            requested_at: None,
            resolved_at: None,
        }
    }

    fn is_candidate(&self, winner: &str) -> bool {
        self.candidates
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(winner))
    }
}

/// Proof that a request was submitted to the oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TieBreakHandle {
    subject_id: String,
    purpose: TieBreakPurpose,
}

impl TieBreakHandle {
    /// The subject the request was submitted for.
    #[must_use]
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// The purpose tag of the request.
    #[must_use]
    pub const fn purpose(&self) -> TieBreakPurpose {
        self.purpose
    }
}

/// Handle to a detached watcher task.
///
/// Dropping the handle leaves the watcher running.
#[derive(Debug)]
pub struct WatcherHandle {
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Returns `true` once the watcher has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the watcher.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Waits for the watcher to stop. Used by tests and shutdown paths.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            debug!(error = %e, "tie-break watcher ended abnormally");
        }
    }
}

/// Returns the ids whose value equals the maximum, in input order.
///
/// Fewer than two results means there is no tie.
#[must_use]
pub fn tied_at_top<T, I>(entries: I) -> Vec<String>
where
    T: Ord + Copy,
    I: IntoIterator<Item = (String, T)>,
{
    let entries: Vec<(String, T)> = entries.into_iter().collect();
    let Some(max) = entries.iter().map(|(_, value)| *value).max() else {
        return Vec::new();
    };
    let mut tied: Vec<String> = Vec::new();
    for (id, value) in entries {
        if value == max && !tied.iter().any(|seen| seen.eq_ignore_ascii_case(&id)) {
            tied.push(id);
        }
    }
    tied
}

// =============================================================================
// Coordinator
// =============================================================================

/// Submits ties to the randomness oracle and tracks their resolution.
pub struct TieBreakCoordinator {
    oracle: Arc<dyn RandomnessOracle>,
    notifier: Arc<dyn NotificationChannel>,
    config: TieBreakConfig,
    clock: Arc<dyn Clock>,
    ledger: DashMap<String, TieBreakRequest>,
}

impl fmt::Debug for TieBreakCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieBreakCoordinator")
            .field("oracle_configured", &self.oracle.is_configured())
            .field("requests", &self.ledger.len())
            .finish_non_exhaustive()
    }
}

impl TieBreakCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(
        oracle: Arc<dyn RandomnessOracle>,
        notifier: Arc<dyn NotificationChannel>,
        config: TieBreakConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            oracle,
            notifier,
            config,
            clock,
            ledger: DashMap::new(),
        }
    }

    /// Returns the coordinator's configuration.
    #[must_use]
    pub const fn config(&self) -> &TieBreakConfig {
        &self.config
    }

    /// Submits a tie to the oracle.
    ///
    /// Returns `None` when the caller should apply its fallback ordering
    /// right away: no oracle configured, fewer than two candidates, or a
    /// failed submission.
    pub async fn request_tie_break(
        &self,
        subject_id: &str,
        candidates: Vec<String>,
        purpose: TieBreakPurpose,
    ) -> Option<TieBreakHandle> {
        if !self.oracle.is_configured() {
            debug!(
                subject_id,
                %purpose,
                "no randomness oracle configured, using fallback ordering"
            );
            return None;
        }
        if candidates.len() < 2 {
            return None;
        }
        if self.recorded_winner(subject_id).is_some()
            && self
                .request(subject_id)
                .is_some_and(|recorded| recorded.candidates == candidates)
        {
            debug!(subject_id, %purpose, "tie already resolved, reusing recorded winner");
            return Some(TieBreakHandle {
                subject_id: subject_id.to_string(),
                purpose,
            });
        }

        let mut request = TieBreakRequest::new(subject_id, candidates, purpose);
        request.status = ResolutionStatus::Pending;
        request.requested_at = Some(self.clock.now());

        if let Err(e) = self.oracle.request(&request).await {
            warn!(
                subject_id,
                %purpose,
                error = %e,
                "randomness oracle request failed, using fallback ordering"
            );
            request.status = ResolutionStatus::Failed;
            self.ledger.insert(subject_id.to_string(), request);
            return None;
        }

        info!(subject_id, %purpose, candidates = request.candidates.len(), "tie-break requested");
        self.ledger.insert(subject_id.to_string(), request);
        Some(TieBreakHandle {
            subject_id: subject_id.to_string(),
            purpose,
        })
    }

    /// Polls the oracle until a winner is known or `timeout` elapses.
    ///
    /// Returns `None` on oracle failure, on timeout, when the subject was
    /// never submitted, or when the oracle names a non-candidate.
    pub async fn await_resolution(
        &self,
        subject_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Option<String> {
        if !self.ledger.contains_key(subject_id) {
            return None;
        }
        if let Some(winner) = self.recorded_winner(subject_id) {
            return Some(winner);
        }

        let outcome =
            tokio::time::timeout(timeout, self.poll_until_terminal(subject_id, poll_interval))
                .await;
        match outcome {
            Ok(Some(OracleStatus::Fulfilled { winner })) => self.record_winner(subject_id, winner),
            Ok(Some(OracleStatus::Failed { reason })) => {
                warn!(
                    subject_id,
                    reason = %reason,
                    "randomness oracle failed, keeping fallback ordering"
                );
                self.mark_failed(subject_id);
                None
            },
            Ok(Some(OracleStatus::Pending) | None) => None,
            Err(_) => {
                warn!(
                    subject_id,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "tie-break resolution timed out, keeping fallback ordering"
                );
                None
            },
        }
    }

    async fn poll_until_terminal(
        &self,
        subject_id: &str,
        poll_interval: Duration,
    ) -> Option<OracleStatus> {
        loop {
            match self.oracle.poll(subject_id).await {
                Ok(OracleStatus::Pending) => {},
                Ok(status) => return Some(status),
                Err(e) => debug!(subject_id, error = %e, "tie-break poll failed, retrying"),
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Starts a detached watcher for a tie whose fallback was already applied.
    ///
    /// On success the watcher records the winner and emits
    /// [`EngineEvent::TieBreakResolved`] to consenting candidates. Every
    /// failure inside the watcher is logged and dropped.
    pub fn spawn_watcher(self: &Arc<Self>, handle: TieBreakHandle) -> WatcherHandle {
        let coordinator = Arc::clone(self);
        let timeout = self.config.watcher_timeout();
        let poll_interval = self.config.watcher_poll_interval();
        let task = tokio::spawn(async move {
            let subject_id = handle.subject_id;
            let Some(winner) = coordinator
                .await_resolution(&subject_id, timeout, poll_interval)
                .await
            else {
                return;
            };
            coordinator
                .announce(&subject_id, handle.purpose, &winner)
                .await;
        });
        WatcherHandle { task }
    }

    async fn announce(&self, subject_id: &str, purpose: TieBreakPurpose, winner: &str) {
        let candidates = self
            .ledger
            .get(subject_id)
            .map(|request| request.candidates.clone())
            .unwrap_or_default();
        let event = EngineEvent::TieBreakResolved {
            subject_id: subject_id.to_string(),
            purpose,
            winner: winner.to_string(),
            at: self.clock.now(),
        };
        for candidate in candidates {
            if !self.notifier.may_notify(&candidate).await {
                continue;
            }
            if let Err(e) = self.notifier.enqueue(&candidate, event.clone()).await {
                debug!(
                    subject_id,
                    candidate = %candidate,
                    error = %e,
                    "tie-break notification dropped"
                );
            }
        }
    }

    /// Returns the recorded request for `subject_id`.
    #[must_use]
    pub fn request(&self, subject_id: &str) -> Option<TieBreakRequest> {
        self.ledger.get(subject_id).map(|entry| entry.clone())
    }

    /// Returns the oracle winner recorded for `subject_id`, if any.
    #[must_use]
    pub fn recorded_winner(&self, subject_id: &str) -> Option<String> {
        self.ledger.get(subject_id).and_then(|entry| {
            (entry.status == ResolutionStatus::Fulfilled)
                .then(|| entry.winner.clone())
                .flatten()
        })
    }

    /// Drops ledger records whose last activity is older than the
    /// configured retention. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let cutoff = self.clock.now() - self.config.ledger_retention();
        let before = self.ledger.len();
        self.ledger.retain(|_, request| {
            request
                .resolved_at
                .or(request.requested_at)
                .is_some_and(|at| at > cutoff)
        });
        let dropped = before.saturating_sub(self.ledger.len());
        if dropped > 0 {
            debug!(dropped, "tie-break ledger pruned");
        }
        dropped
    }

    fn record_winner(&self, subject_id: &str, winner: String) -> Option<String> {
        let now = self.clock.now();
        let mut entry = self.ledger.get_mut(subject_id)?;
        if entry.status.is_terminal() {
            return entry.winner.clone();
        }
        if !entry.is_candidate(&winner) {
            warn!(
                subject_id,
                winner = %winner,
                "randomness oracle named a non-candidate, discarding"
            );
            entry.status = ResolutionStatus::Failed;
            entry.resolved_at = Some(now);
            return None;
        }
        info!(subject_id, winner = %winner, purpose = %entry.purpose, "tie-break resolved");
        entry.status = ResolutionStatus::Fulfilled;
        entry.winner = Some(winner.clone());
        entry.resolved_at = Some(now);
        Some(winner)
    }

    fn mark_failed(&self, subject_id: &str) {
        if let Some(mut entry) = self.ledger.get_mut(subject_id) {
            if !entry.status.is_terminal() {
                entry.status = ResolutionStatus::Failed;
                entry.resolved_at = Some(self.clock.now());
            }
        }
    }
}
