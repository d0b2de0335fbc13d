//! End-to-end bidding through the engine facade.
//!
//! Covers the priority window gate, effective-amount ranking, the per-actor
//! rate limit, settlement with ties, and the outcome envelope.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use pax_core::bidding::{OpenRound, RoundPurpose};
use pax_core::clock::ManualClock;
use pax_core::config::PaxConfig;
use pax_core::engine::MarketEngine;
use pax_core::error::{ErrorKind, ExternalError};
use pax_core::external::{OracleStatus, RandomnessOracle};
use pax_core::money::{MAX_AMOUNT, Multiplier};
use pax_core::tiebreak::{ResolutionStatus, TieBreakRequest};
use rust_decimal_macros::dec;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn engine(clock: &Arc<ManualClock>) -> MarketEngine {
    MarketEngine::builder(PaxConfig::default())
        .clock(clock.clone())
        .build()
}

fn round_request(end: DateTime<Utc>) -> OpenRound {
    OpenRound {
        vertical: "solar".to_string(),
        reserve_price: dec!(50),
        start_time: None,
        end_time: end,
        purpose: RoundPurpose::Standard,
        eligible_bidders: Vec::new(),
    }
}

/// Oracle that always picks the last candidate after a few polls.
#[derive(Default)]
struct LastCandidateOracle {
    polls: AtomicUsize,
    last: parking_lot::Mutex<Option<String>>,
}

#[async_trait]
impl RandomnessOracle for LastCandidateOracle {
    async fn request(&self, request: &TieBreakRequest) -> Result<(), ExternalError> {
        *self.last.lock() = request.candidates.last().cloned();
        Ok(())
    }

    async fn poll(&self, _subject_id: &str) -> Result<OracleStatus, ExternalError> {
        if self.polls.fetch_add(1, Ordering::SeqCst) < 2 {
            return Ok(OracleStatus::Pending);
        }
        let winner = self.last.lock().clone().unwrap_or_default();
        Ok(OracleStatus::Fulfilled { winner })
    }
}

#[tokio::test]
async fn test_holder_window_then_general_bidding() {
    let clock = Arc::new(ManualClock::new(t0()));
    let engine = engine(&clock);
    assert!(engine.award_lease("solar", "0xHolder").await.success);

    let round = engine
        .open_auction(round_request(t0() + Duration::hours(1)))
        .await
        .into_result()
        .unwrap();
    assert!(round.has_priority_window());
    let window = (round.priority_window_end - round.start_time).num_seconds();
    assert!((5..=10).contains(&window));

    let blocked = engine.place_bid(&round.auction_id, "0xGeneral", dec!(500)).await;
    assert!(!blocked.success);
    assert_eq!(blocked.error.unwrap().kind, ErrorKind::StateConflict);

    let holder = engine.place_bid(&round.auction_id, "0xHolder", dec!(100)).await;
    assert!(holder.success);
    assert_eq!(holder.data.unwrap().effective_amount, Some(dec!(120.00)));

    clock.set(round.priority_window_end + Duration::seconds(2));
    let general = engine.place_bid(&round.auction_id, "0xGeneral", dec!(115)).await;
    assert!(!general.success);
    assert!(
        general
            .data
            .unwrap()
            .reason
            .unwrap()
            .contains("below current high bid")
    );

    let general = engine.place_bid(&round.auction_id, "0xGeneral", dec!(121)).await;
    assert!(general.success);

    clock.set(t0() + Duration::hours(1));
    let settlement = engine.settle_auction(&round.auction_id).await.into_result().unwrap();
    assert_eq!(settlement.winner.unwrap().bidder, "0xGeneral");
    assert!(settlement.round.settled);
}

#[tokio::test]
async fn test_sixth_bid_in_window_is_rate_limited() {
    let clock = Arc::new(ManualClock::new(t0()));
    let engine = engine(&clock);
    let round = engine
        .open_auction(round_request(t0() + Duration::hours(1)))
        .await
        .into_result()
        .unwrap();

    for i in 0..5 {
        let outcome = engine
            .place_bid(&round.auction_id, "0xSpam", dec!(60) + rust_decimal::Decimal::from(i))
            .await;
        assert!(outcome.success, "bid {i} should be accepted");
        clock.advance(Duration::seconds(1));
    }

    let sixth = engine.place_bid(&round.auction_id, "0xSpam", dec!(100)).await;
    assert!(!sixth.success);
    assert!(sixth.data.unwrap().reason.unwrap().contains("rate limit"));
    let extra = engine.place_bid(&round.auction_id, "0xSpam", dec!(101)).await;
    assert!(!extra.success);

    clock.advance(Duration::seconds(60));
    let seventh = engine.place_bid(&round.auction_id, "0xSpam", dec!(102)).await;
    assert!(seventh.success);
}

#[tokio::test]
async fn test_rejections_on_reserve_and_inactive_rounds() {
    let clock = Arc::new(ManualClock::new(t0()));
    let engine = engine(&clock);
    let round = engine
        .open_auction(round_request(t0() + Duration::minutes(10)))
        .await
        .into_result()
        .unwrap();

    let low = engine.place_bid(&round.auction_id, "0xA", dec!(10)).await;
    assert!(low.data.unwrap().reason.unwrap().contains("reserve"));

    assert!(engine.cancel_auction(&round.auction_id).success);
    let cancelled = engine.place_bid(&round.auction_id, "0xA", dec!(60)).await;
    assert!(cancelled.data.unwrap().reason.unwrap().contains("no longer active"));

    let missing = engine.place_bid("auction-missing", "0xA", dec!(60)).await;
    assert_eq!(missing.error.unwrap().kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn test_tie_settles_on_earliest_bid_and_watcher_records_oracle_winner() {
    let clock = Arc::new(ManualClock::new(t0()));
    let mut config = PaxConfig::default();
    config.tie_break.watcher_poll_interval_ms = 5;
    config.tie_break.watcher_timeout_secs = 5;
    let engine = MarketEngine::builder(config)
        .clock(clock.clone())
        .randomness_oracle(Arc::new(LastCandidateOracle::default()))
        .build();

    let round = engine
        .open_auction(round_request(t0() + Duration::hours(1)))
        .await
        .into_result()
        .unwrap();
    assert!(engine.place_bid(&round.auction_id, "0xEarly", dec!(75)).await.success);
    clock.advance(Duration::seconds(3));
    let late = engine.place_bid(&round.auction_id, "0xLate", dec!(75)).await;
    assert!(late.success);
    assert!(!late.data.unwrap().became_high_bid);

    clock.set(t0() + Duration::hours(1));
    let settlement = engine.settle_auction(&round.auction_id).await.into_result().unwrap();
    assert_eq!(settlement.winner.as_ref().unwrap().bidder, "0xEarly");
    assert!(settlement.tie_break_requested);

    settlement.watcher.unwrap().join().await;
    let request = engine.tiebreak().request(&round.auction_id).unwrap();
    assert_eq!(request.status, ResolutionStatus::Fulfilled);
    assert_eq!(request.winner.as_deref(), Some("0xLate"));

    // The settled winner is not rewritten by the oracle.
    let stored = engine.auction(&round.auction_id).into_result().unwrap();
    assert_eq!(stored.winner.as_deref(), Some("0xEarly"));
}

#[tokio::test]
async fn test_concurrent_bids_serialize_per_round() {
    let clock = Arc::new(ManualClock::new(t0()));
    let engine = Arc::new(engine(&clock));
    let round = engine
        .open_auction(round_request(t0() + Duration::hours(1)))
        .await
        .into_result()
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..20u32 {
        let engine = Arc::clone(&engine);
        let auction_id = round.auction_id.clone();
        tasks.push(tokio::spawn(async move {
            let bidder = format!("0xBidder{i}");
            engine
                .place_bid(&auction_id, &bidder, dec!(60) + rust_decimal::Decimal::from(i))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let stored = engine.auction(&round.auction_id).into_result().unwrap();
    assert_eq!(stored.effective_high(), Some(dec!(79)));
    let ranked = engine.ranked_bids(&round.auction_id).into_result().unwrap();
    assert_eq!(ranked[0].raw_amount, dec!(79));
    assert_eq!(u64::try_from(ranked.len()).unwrap(), stored.bid_count);
}

#[tokio::test]
async fn test_oversized_holder_bids_are_validation_errors() {
    let clock = Arc::new(ManualClock::new(t0()));
    let mut config = PaxConfig::default();
    config.priority.multiplier = Multiplier::new(rust_decimal::Decimal::MAX).unwrap();
    let boosted = MarketEngine::builder(config).clock(clock.clone()).build();
    let engine = engine(&clock);
    for engine in [&engine, &boosted] {
        assert!(engine.award_lease("solar", "0xHolder").await.success);
    }

    let round = engine
        .open_auction(round_request(t0() + Duration::hours(1)))
        .await
        .into_result()
        .unwrap();
    let huge = engine
        .place_bid(&round.auction_id, "0xHolder", rust_decimal::Decimal::MAX)
        .await;
    assert_eq!(huge.error.unwrap().kind, ErrorKind::Validation);
    let ceiling = engine.place_bid(&round.auction_id, "0xHolder", MAX_AMOUNT).await;
    assert_eq!(
        ceiling.data.unwrap().effective_amount,
        Some(rust_decimal::Decimal::new(120_000_000_000_000_000, 2))
    );

    let round = boosted
        .open_auction(round_request(t0() + Duration::hours(1)))
        .await
        .into_result()
        .unwrap();
    let overflow = boosted.place_bid(&round.auction_id, "0xHolder", MAX_AMOUNT).await;
    assert_eq!(overflow.error.unwrap().kind, ErrorKind::Validation);
    assert_eq!(boosted.auction(&round.auction_id).into_result().unwrap().bid_count, 0);
}
