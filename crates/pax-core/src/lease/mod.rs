//! Lease lifecycle.
//!
//! A vertical's lease slot moves through
//! `ACTIVE -> GRACE_PERIOD -> {EXPIRED | PAUSED}`, with `PAUSED -> EXPIRED`
//! once the blocking auction is over. Renewal returns ACTIVE and
//! GRACE_PERIOD slots to ACTIVE. Expired slots are re-auctioned and
//! re-awarded in place.

mod manager;
mod state;

pub use self::manager::{LeaseLifecycleManager, SweepReport};
pub use self::state::{LeaseSlot, LeaseStatus};
