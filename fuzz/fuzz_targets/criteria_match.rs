//! Fuzz harness for bounty criteria.
//!
//! Feeds arbitrary JSON to `MatchCriteria` and `TransactionAttributes`
//! deserialization and evaluates every criteria set that validates. Matching
//! must never panic, including on extreme scores and timestamps.

#![no_main]
use libfuzzer_sys::fuzz_target;
use pax_core::bounty::{MatchCriteria, TransactionAttributes};

fuzz_target!(|data: &[u8]| {
    let Some(split) = data.iter().position(|byte| *byte == 0) else {
        return;
    };
    let (criteria, tx) = data.split_at(split);
    let Ok(criteria) = serde_json::from_slice::<MatchCriteria>(criteria) else {
        return;
    };
    if criteria.validate().is_err() {
        return;
    }
    let Ok(tx) = serde_json::from_slice::<TransactionAttributes>(&tx[1..]) else {
        return;
    };
    let now = tx.created_at.unwrap_or_default();
    let _ = criteria.matches(&tx, now);
});
