//! Priority auction and incentive allocation engine.
//!
//! Verticals (solar, mortgage, insurance, ...) are leased to a single holder.
//! The holder bids in that vertical's auctions with a multiplier and an early
//! window. Buyers and sellers pre-fund bounty pools that pay out when a
//! qualifying transaction completes.
//!
//! # Components
//!
//! - [`priority`]: who holds priority on a vertical, and what it is worth
//! - [`bidding`]: effective bids, the priority window gate, rate limiting,
//!   high-bid maintenance and settlement
//! - [`tiebreak`]: verifiable-random tie resolution with deterministic
//!   fallback
//! - [`bounty`]: criteria matching, ranking and the stacking cap
//! - [`lease`]: the lease state machine and its periodic sweep
//! - [`engine`]: the facade wiring the above together
//!
//! External systems (registry, compliance, oracles, notifications) plug in
//! through the traits in [`external`].
//!
//! # Example
//!
//! ```rust,no_run
//! use pax_core::config::PaxConfig;
//! use pax_core::engine::MarketEngine;
//!
//! # async fn example() {
//! let engine = MarketEngine::builder(PaxConfig::default()).build();
//! let outcome = engine.award_lease("solar", "0xHolder").await;
//! assert!(outcome.success);
//! # }
//! ```

pub mod bidding;
pub mod bounty;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod external;
pub mod lease;
pub mod money;
pub mod priority;
pub mod tiebreak;

pub use engine::{MarketEngine, MarketEngineBuilder, OperationOutcome, PruneReport};
pub use error::{EngineError, ErrorKind, ExternalError};
