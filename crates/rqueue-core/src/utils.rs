//! Millisecond clock and polling helpers shared by the client and worker.

use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert milliseconds since the Unix epoch back into a UTC datetime.
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Convert a UTC datetime into milliseconds since the Unix epoch.
pub fn to_unix_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert a duration into whole milliseconds.
pub fn to_ms(duration: Duration) -> i64 {
    duration.as_millis() as i64
}

/// Cooperative poll loop used by `Job::result` and `Job::abort`.
///
/// The first `tick` returns immediately so callers probe once before
/// sleeping; every subsequent tick sleeps one poll interval. The returned
/// value is the elapsed time since the poller was created, which callers
/// compare against their wait budget.
pub struct Poller {
    interval: Duration,
    started: Instant,
    first: bool,
}

impl Poller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            started: Instant::now(),
            first: true,
        }
    }

    pub async fn tick(&mut self) -> Duration {
        if self.first {
            self.first = false;
        } else {
            tokio::time::sleep(self.interval).await;
        }
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_round_trip() {
        let now = timestamp_ms();
        let dt = ms_to_datetime(now);
        assert_eq!(to_unix_ms(dt), now);
    }

    #[test]
    fn test_to_ms() {
        assert_eq!(to_ms(Duration::from_secs(2)), 2000);
        assert_eq!(to_ms(Duration::from_millis(1500)), 1500);
    }

    #[tokio::test]
    async fn test_poller_first_tick_is_immediate() {
        let mut poller = Poller::new(Duration::from_secs(60));
        let elapsed = poller.tick().await;
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_poller_sleeps_between_ticks() {
        let mut poller = Poller::new(Duration::from_millis(20));
        poller.tick().await;
        let elapsed = poller.tick().await;
        assert!(elapsed >= Duration::from_millis(20));
    }
}
