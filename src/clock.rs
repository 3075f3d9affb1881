//! Sleeping, cancellation and a virtual device clock
//!
//! The pacing engine never sleeps directly: it goes through a [`Sleeper`]
//! so a simulated device clock can be advanced deterministically in tests,
//! and every sleep can be cut short by a [`CancelToken`].

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation signal shared between threads
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation and wake every waiter
    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock() = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Block for up to `timeout`. Returns true if cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = flag.lock();
        while !*cancelled {
            if cvar.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        *cancelled
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Blocking sleep used by the pacing engine
pub trait Sleeper {
    /// Sleep for `duration`. Returns false if `cancel` fired first.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool;
}

/// Sleeps the calling thread, waking early on cancellation
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        !cancel.wait_timeout(duration)
    }
}

#[derive(Debug)]
struct VirtualState {
    now: f64,
    /// Device seconds elapsed per slept second
    rate: f64,
    sleeps: Vec<f64>,
}

/// Manually advanced clock
///
/// Sleeping through it advances the clock by `duration * rate`, which
/// lets tests model a device clock that drifts from host time.
#[derive(Debug, Clone)]
pub struct VirtualClock {
    state: Arc<Mutex<VirtualState>>,
}

impl VirtualClock {
    pub fn new(start: f64) -> Self {
        Self::with_rate(start, 1.0)
    }

    pub fn with_rate(start: f64, rate: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(VirtualState {
                now: start,
                rate,
                sleeps: Vec::new(),
            })),
        }
    }

    pub fn now(&self) -> f64 {
        self.state.lock().now
    }

    pub fn advance(&self, seconds: f64) {
        self.state.lock().now += seconds;
    }

    /// Every sleep requested so far, in seconds
    pub fn sleeps(&self) -> Vec<f64> {
        self.state.lock().sleeps.clone()
    }
}

impl Sleeper for VirtualClock {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let mut state = self.state.lock();
        let seconds = duration.as_secs_f64();
        state.sleeps.push(seconds);
        state.now += seconds * state.rate;
        true
    }
}

/// Device clock source for simulated hardware
#[derive(Debug, Clone)]
pub enum SimClock {
    /// Follows host time, offset to an epoch-based start
    Wall { origin: Instant, epoch: f64 },
    Virtual(VirtualClock),
}

impl SimClock {
    /// Wall clock reading seconds since the Unix epoch
    pub fn wall() -> Self {
        let epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        SimClock::Wall {
            origin: Instant::now(),
            epoch,
        }
    }

    pub fn now(&self) -> f64 {
        match self {
            SimClock::Wall { origin, epoch } => epoch + origin.elapsed().as_secs_f64(),
            SimClock::Virtual(clock) => clock.now(),
        }
    }
}

impl From<VirtualClock> for SimClock {
    fn from(clock: VirtualClock) -> Self {
        SimClock::Virtual(clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_virtual_clock_sleep() {
        let clock = VirtualClock::with_rate(10.0, 0.5);
        let cancel = CancelToken::new();

        assert!(clock.sleep(Duration::from_millis(200), &cancel));
        assert!((clock.now() - 10.1).abs() < 1e-9);
        assert_eq!(clock.sleeps().len(), 1);

        cancel.cancel();
        assert!(!clock.sleep(Duration::from_millis(200), &cancel));
        assert!((clock.now() - 10.1).abs() < 1e-9);
    }

    #[test]
    fn test_cancel_wakes_sleeper() {
        let cancel = CancelToken::new();
        let remote = cancel.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let started = Instant::now();
        let completed = ThreadSleeper.sleep(Duration::from_secs(10), &cancel);
        handle.join().unwrap();

        assert!(!completed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_thread_sleeper_completes() {
        let cancel = CancelToken::new();
        assert!(ThreadSleeper.sleep(Duration::from_millis(5), &cancel));
        assert!(!cancel.is_cancelled());
    }
}
