//! Clock and timer service.
//!
//! Session timeouts are wall-clock based, so every time read goes through a
//! [`Clock`]. Production uses [`SystemClock`]; tests drive a [`ManualClock`].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Elapsed time from `earlier` to `later`, clamped at zero on clock skew.
pub fn elapsed(earlier: DateTime<Utc>, later: DateTime<Utc>) -> ChronoDuration {
    let delta = later.signed_duration_since(earlier);
    if delta < ChronoDuration::zero() {
        ChronoDuration::zero()
    } else {
        delta
    }
}

/// Whole minutes between two instants, zero on skew.
pub fn whole_minutes(earlier: DateTime<Utc>, later: DateTime<Utc>) -> u32 {
    u32::try_from(elapsed(earlier, later).num_minutes()).unwrap_or(u32::MAX)
}

/// Runs `tick` every `period` on its own task, starting one period from now.
///
/// Each tick finishes before the next one starts. Late ticks are delayed
/// rather than bunched so a stalled runtime never replays a burst of checks.
pub fn spawn_ticker<F, Fut>(period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            tick().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn elapsed_clamps_negative_deltas() {
        let later = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap();
        let earlier = later - ChronoDuration::minutes(3);
        assert_eq!(elapsed(later, earlier), ChronoDuration::zero());
        assert_eq!(whole_minutes(later, earlier), 0);
        assert_eq!(whole_minutes(earlier, later), 3);
    }

    #[test]
    fn whole_minutes_truncates() {
        let start = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap();
        assert_eq!(whole_minutes(start, start + ChronoDuration::seconds(119)), 1);
    }

    #[test]
    fn manual_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 1, 31, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(ChronoDuration::minutes(16));
        assert_eq!(clock.now(), start + ChronoDuration::minutes(16));
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_fires_once_per_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = spawn_ticker(Duration::from_secs(60), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}
        });

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        handle.abort();
    }
}
