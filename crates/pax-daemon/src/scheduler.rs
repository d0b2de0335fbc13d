//! Non-overlapping periodic timers.
//!
//! Each timer runs its job to completion before waiting for the next tick;
//! ticks missed while a job runs are skipped rather than replayed.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::state::SharedState;

/// Spawns `job` every `period` until shutdown is requested.
///
/// The first run happens one full period after spawning.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    state: SharedState,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut(SharedState) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(timer = name, period_secs = period.as_secs(), "periodic timer started");
        loop {
            interval.tick().await;
            if state.is_shutdown_requested() {
                break;
            }
            debug!(timer = name, "timer fired");
            job(state.clone()).await;
        }
        info!(timer = name, "periodic timer stopped");
    })
}

/// Spawns the lease sweep timer. Each tick also prunes idle engine state.
pub fn spawn_lease_sweep(state: SharedState, period: Duration) -> JoinHandle<()> {
    spawn_periodic("lease_sweep", period, state, |state| async move {
        let report = state.engine().sweep_leases().await;
        if report.skipped {
            debug!("previous lease sweep still running");
        }
        state.engine().prune_idle_state();
    })
}

/// Spawns the notification digest flush timer.
pub fn spawn_digest_flush(state: SharedState, period: Duration) -> JoinHandle<()> {
    spawn_periodic("digest_flush", period, state, |state| async move {
        state.notifications().flush().await;
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use pax_core::MarketEngine;
    use pax_core::bidding::{OpenRound, RoundPurpose};
    use pax_core::clock::{Clock, ManualClock};
    use pax_core::config::PaxConfig;
    use rust_decimal::Decimal;

    use super::*;
    use crate::notify::{DigestNotificationQueue, LogDigestSink};
    use crate::state::DaemonStateHandle;

    fn state() -> SharedState {
        let notifications = Arc::new(DigestNotificationQueue::new(20, Arc::new(LogDigestSink)));
        let engine = MarketEngine::builder(PaxConfig::default()).build();
        Arc::new(DaemonStateHandle::new(engine, notifications))
    }

    #[tokio::test]
    async fn test_timer_runs_until_shutdown() {
        let state = state();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = spawn_periodic("test", Duration::from_millis(20), state.clone(), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(runs.load(Ordering::SeqCst) >= 2);

        state.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        let stopped_at = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(runs.load(Ordering::SeqCst), stopped_at);
    }

    #[tokio::test]
    async fn test_slow_job_never_overlaps() {
        let state = state();
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));
        let (active_job, overlapped_job) = (active.clone(), overlapped.clone());
        let handle = spawn_periodic("slow", Duration::from_millis(10), state.clone(), move |_| {
            let active = active_job.clone();
            let overlapped = overlapped_job.clone();
            async move {
                if active.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(35)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        state.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sweep_timer_prunes_idle_rate_limit_windows() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = MarketEngine::builder(PaxConfig::default())
            .clock(clock.clone())
            .build();
        let round = engine
            .open_auction(OpenRound {
                vertical: "solar".to_string(),
                reserve_price: Decimal::ONE,
                start_time: None,
                end_time: clock.now() + chrono::Duration::hours(1),
                purpose: RoundPurpose::Standard,
                eligible_bidders: Vec::new(),
            })
            .await
            .into_result()
            .unwrap();
        assert!(engine.place_bid(&round.auction_id, "0xBidder", Decimal::TEN).await.success);
        assert_eq!(engine.rate_limited_actors(), 1);

        let notifications = Arc::new(DigestNotificationQueue::new(20, Arc::new(LogDigestSink)));
        let state: SharedState = Arc::new(DaemonStateHandle::new(engine, notifications));
        clock.advance(chrono::Duration::seconds(61));
        let handle = spawn_lease_sweep(state.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(80)).await;
        state.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.engine().rate_limited_actors(), 0);
    }
}
