//! pax-daemon - HTTP host for the PAX market engine.
//!
//! # Modules
//!
//! - [`api`]: axum router exposing the engine operations
//! - [`notify`]: consent-gated digest notification queue
//! - [`scheduler`]: non-overlapping periodic timers (lease sweep, digest
//!   flush)
//! - [`state`]: shared daemon state and the shutdown flag

pub mod api;
pub mod notify;
pub mod scheduler;
pub mod state;
