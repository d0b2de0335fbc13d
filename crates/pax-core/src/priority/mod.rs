//! Priority resolution.
//!
//! Decides whether an actor currently holds lease priority on a vertical and
//! what that is worth: a bid multiplier and an early-bidding window.
//!
//! Slot lookups go through a [`PriorityCache`] with a short TTL. The lease
//! manager invalidates a vertical's entry synchronously on every write.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{ComplianceFailureMode, PriorityConfig};
use crate::external::{ComplianceGate, VerticalRegistry};
use crate::lease::{LeaseSlot, LeaseStatus};
use crate::money::Multiplier;

/// Compliance context string sent with priority checks.
const COMPLIANCE_CONTEXT: &str = "priority_bid";

/// Result of a priority lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityGrant {
    /// Whether the actor is the confirmed holder of an active lease.
    pub is_priority_holder: bool,
    /// Multiplier applied to the actor's raw bids.
    pub multiplier: Multiplier,
    /// Length of the early-bidding window in seconds.
    pub window_seconds: u32,
}

impl PriorityGrant {
    /// The non-priority default: multiplier 1.0, no window.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            is_priority_holder: false,
            multiplier: Multiplier::ONE,
            window_seconds: 0,
        }
    }
}

impl Default for PriorityGrant {
    fn default() -> Self {
        Self::none()
    }
}

/// Computes the priority window length for a round.
///
/// The value is a stable hash of `(vertical, nonce)` folded into
/// `[min_secs, max_secs]`. A missing nonce hashes like an empty one.
#[must_use]
pub fn compute_window_seconds(
    vertical: &str,
    nonce: Option<&str>,
    min_secs: u32,
    max_secs: u32,
) -> u32 {
    let (low, high) = if min_secs <= max_secs {
        (min_secs, max_secs)
    } else {
        (max_secs, min_secs)
    };
    let mut hasher = Sha256::new();
    hasher.update(vertical.as_bytes());
    hasher.update(b":");
    hasher.update(nonce.unwrap_or_default().as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let value = u64::from_be_bytes(prefix);
    let span = u64::from(high - low) + 1;
    low + u32::try_from(value % span).unwrap_or(0)
}

// =============================================================================
// Cache
// =============================================================================

#[derive(Debug, Clone)]
struct CachedSlot {
    slot: Option<LeaseSlot>,
    fetched_at: DateTime<Utc>,
}

/// Short-lived cache of lease slots keyed by vertical.
///
/// Absent slots are cached too, so a burst of bids on an unleased vertical
/// does not hammer the registry.
///
/// Every invalidation bumps a per-vertical generation. A lookup result is
/// only stored if no invalidation happened since the lookup started, so a
/// slot read before a write can never outlive that write.
pub struct PriorityCache {
    entries: DashMap<String, CachedSlot>,
    generations: DashMap<String, u64>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for PriorityCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl PriorityCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            generations: DashMap::new(),
            ttl,
            clock,
        }
    }

    /// Current invalidation generation of `vertical`.
    #[must_use]
    pub fn generation(&self, vertical: &str) -> u64 {
        self.generations.get(vertical).map_or(0, |generation| *generation)
    }

    /// Returns the cached slot, or `None` on a miss or an expired entry.
    #[must_use]
    pub fn get(&self, vertical: &str) -> Option<Option<LeaseSlot>> {
        let now = self.clock.now();
        let entry = self.entries.get(vertical)?;
        if now - entry.fetched_at >= self.ttl {
            drop(entry);
            self.entries.remove(vertical);
            return None;
        }
        Some(entry.slot.clone())
    }

    /// Stores a lookup that started at `generation`.
    ///
    /// Returns `false`, storing nothing, if `vertical` was invalidated since.
    pub fn insert_if_current(
        &self,
        vertical: &str,
        slot: Option<LeaseSlot>,
        generation: u64,
    ) -> bool {
        let current = self.generations.entry(vertical.to_string()).or_insert(0);
        if *current != generation {
            debug!(vertical, "priority cache write skipped, slot changed during lookup");
            return false;
        }
        self.entries.insert(
            vertical.to_string(),
            CachedSlot {
                slot,
                fetched_at: self.clock.now(),
            },
        );
        true
    }

    /// Drops the entry for `vertical` and fences out in-flight lookups.
    pub fn invalidate(&self, vertical: &str) {
        let mut generation = self.generations.entry(vertical.to_string()).or_insert(0);
        *generation = generation.wrapping_add(1);
        if self.entries.remove(vertical).is_some() {
            debug!(vertical, "priority cache invalidated");
        }
    }

    /// Number of cached verticals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolves priority grants against the registry and compliance gate.
pub struct PriorityResolver {
    registry: Arc<dyn VerticalRegistry>,
    compliance: Arc<dyn ComplianceGate>,
    cache: Arc<PriorityCache>,
    config: PriorityConfig,
}

impl fmt::Debug for PriorityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityResolver")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PriorityResolver {
    /// Creates a resolver sharing `cache` with the lease manager.
    #[must_use]
    pub fn new(
        registry: Arc<dyn VerticalRegistry>,
        compliance: Arc<dyn ComplianceGate>,
        cache: Arc<PriorityCache>,
        config: PriorityConfig,
    ) -> Self {
        Self {
            registry,
            compliance,
            cache,
            config,
        }
    }

    /// Returns the resolver's configuration.
    #[must_use]
    pub const fn config(&self) -> &PriorityConfig {
        &self.config
    }

    /// Window length for a round on `vertical` with `nonce`, within the
    /// configured bounds.
    #[must_use]
    pub fn window_seconds(&self, vertical: &str, nonce: Option<&str>) -> u32 {
        compute_window_seconds(
            vertical,
            nonce,
            self.config.window_min_secs,
            self.config.window_max_secs,
        )
    }

    /// Loads the slot for `vertical`, through the cache.
    ///
    /// A registry failure is treated as "no slot" and is not cached.
    pub async fn slot(&self, vertical: &str) -> Option<LeaseSlot> {
        if let Some(cached) = self.cache.get(vertical) {
            return cached;
        }
        let generation = self.cache.generation(vertical);
        match self.registry.load_slot(vertical).await {
            Ok(slot) => {
                self.cache.insert_if_current(vertical, slot.clone(), generation);
                slot
            },
            Err(e) => {
                warn!(
                    vertical,
                    error = %e,
                    "vertical registry unavailable, resolving without priority"
                );
                None
            },
        }
    }

    /// Returns the holder of `vertical` if its lease is ACTIVE.
    pub async fn active_holder(&self, vertical: &str) -> Option<String> {
        self.slot(vertical)
            .await
            .filter(|slot| slot.status == LeaseStatus::Active)
            .and_then(|slot| slot.holder)
    }

    /// Resolves `actor`'s priority on `vertical`.
    ///
    /// The multiplier and window are computed on every call; only the slot
    /// lookup is cached.
    pub async fn resolve(
        &self,
        vertical: &str,
        actor: Option<&str>,
        nonce: Option<&str>,
    ) -> PriorityGrant {
        let Some(actor) = actor.map(str::trim).filter(|actor| !actor.is_empty()) else {
            return PriorityGrant::none();
        };
        let Some(slot) = self.slot(vertical).await else {
            return PriorityGrant::none();
        };
        if slot.status != LeaseStatus::Active || !slot.holder_matches(actor) {
            return PriorityGrant::none();
        }
        if !self.compliance_allows(actor, vertical).await {
            return PriorityGrant::none();
        }

        PriorityGrant {
            is_priority_holder: true,
            multiplier: self.config.multiplier,
            window_seconds: self.window_seconds(vertical, nonce),
        }
    }

    async fn compliance_allows(&self, actor: &str, vertical: &str) -> bool {
        let check = self
            .compliance
            .can_transact(actor, vertical, COMPLIANCE_CONTEXT);
        let failure = match tokio::time::timeout(self.config.compliance_timeout(), check).await {
            Ok(Ok(decision)) => {
                if !decision.allowed {
                    debug!(
                        actor,
                        vertical,
                        reason = decision.reason.as_deref().unwrap_or("unspecified"),
                        "compliance gate denied priority"
                    );
                }
                return decision.allowed;
            },
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {}ms", self.config.compliance_timeout_ms),
        };

        match self.config.compliance_failure_mode {
            ComplianceFailureMode::FailOpen => {
                warn!(
                    actor,
                    vertical,
                    error = %failure,
                    "compliance gate unavailable, granting priority (fail-open)"
                );
                true
            },
            ComplianceFailureMode::FailClosed => {
                warn!(
                    actor,
                    vertical,
                    error = %failure,
                    "compliance gate unavailable, withholding priority (fail-closed)"
                );
                false
            },
        }
    }
}
