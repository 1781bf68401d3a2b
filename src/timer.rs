use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel::tick;
use parking_lot::Mutex;

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Time source for expiration decisions, with one-second resolution.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;

    /// Releases any background resources. Safe to call more than once.
    fn stop(&self) {}
}

/// Reads the wall clock on every call.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        unix_now()
    }
}

/// A clock that trades accuracy for cheap reads: `now_unix` is a single
/// atomic load, refreshed every `step` by a background ticker thread.
pub struct CachedClock {
    now: Arc<AtomicI64>,
    stopped: Arc<AtomicBool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl CachedClock {
    pub fn new(step: Duration) -> Self {
        let now = Arc::new(AtomicI64::new(unix_now()));
        let stopped = Arc::new(AtomicBool::new(false));
        let ticker = {
            let now = now.clone();
            let stopped = stopped.clone();
            std::thread::spawn(move || {
                let ticker = tick(step);
                while ticker.recv().is_ok() {
                    if stopped.load(Ordering::Acquire) {
                        break;
                    }
                    now.store(unix_now(), Ordering::Release);
                }
            })
        };
        Self {
            now,
            stopped,
            ticker: Mutex::new(Some(ticker)),
        }
    }
}

impl Clock for CachedClock {
    fn now_unix(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }

    fn stop(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(ticker) = self.ticker.lock().take() {
                let _ = ticker.join();
            }
        }
    }
}

impl Drop for CachedClock {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Test clock advanced by hand.
#[cfg(test)]
pub(crate) struct ManualClock(AtomicI64);

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new(start: i64) -> Self {
        Self(AtomicI64::new(start))
    }

    pub(crate) fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_unix(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{CachedClock, Clock, ManualClock, SystemClock};

    #[test]
    fn system_clock_reads_wall_time() {
        // 2020-01-01 as a floor; anything earlier means the clock is broken.
        assert!(SystemClock.now_unix() > 1_577_836_800);
    }

    #[test]
    fn cached_clock_tracks_wall_time() {
        let clock = CachedClock::new(Duration::from_millis(10));
        let wall = super::unix_now();
        assert!((clock.now_unix() - wall).abs() <= 1);
        clock.stop();
    }

    #[test]
    fn cached_clock_stop_is_idempotent() {
        let clock = CachedClock::new(Duration::from_millis(5));
        clock.stop();
        clock.stop();
        // Reads still work after the ticker is gone.
        assert!(clock.now_unix() > 0);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now_unix(), 100);
        clock.advance(5);
        assert_eq!(clock.now_unix(), 105);
    }
}
