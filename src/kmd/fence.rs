use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Result of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
}

struct WaitGuard<'a>(&'a FenceCounter);
impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A CPU-visible, monotonically increasing fence value written by the device.
///
/// Waiters poll for a short while and then sleep on a condition variable. The
/// writer only touches the lock when somebody is actually sleeping.
#[derive(Debug)]
pub struct FenceCounter {
    value: AtomicU64,
    waiting: AtomicU32,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Default for FenceCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

impl FenceCounter {
    #[must_use]
    pub fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
            waiting: AtomicU32::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    #[must_use]
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_signaled(&self, target: u64) -> bool {
        self.value() >= target
    }

    /// Advances the counter to `value`. Lower values are ignored so the counter
    /// never moves backwards.
    pub fn signal(&self, value: u64) {
        self.value.fetch_max(value, Ordering::SeqCst);

        if self.waiting.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }

    /// Waits until the counter reaches `target`.
    ///
    /// Spins for `spin` before going to sleep. `deadline == None` blocks without
    /// a bound.
    pub fn wait(&self, target: u64, spin: Duration, deadline: Option<Instant>) -> WaitStatus {
        let start = Instant::now();

        loop {
            if self.is_signaled(target) {
                return WaitStatus::Signaled;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return WaitStatus::TimedOut;
            }
            if start.elapsed() >= spin {
                break;
            }
            std::hint::spin_loop();
        }

        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = WaitGuard(self);

        let mut guard = self.lock.lock();
        loop {
            if self.is_signaled(target) {
                return WaitStatus::Signaled;
            }
            match deadline {
                Some(d) => {
                    if self.cond.wait_until(&mut guard, d).timed_out() {
                        return if self.is_signaled(target) {
                            WaitStatus::Signaled
                        } else {
                            WaitStatus::TimedOut
                        };
                    }
                }
                None => self.cond.wait(&mut guard),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_is_monotonic() {
        let fence = FenceCounter::new(5);
        fence.signal(3);
        assert_eq!(fence.value(), 5);
        fence.signal(9);
        assert_eq!(fence.value(), 9);
    }

    #[test]
    fn wait_times_out_when_not_signaled() {
        let fence = FenceCounter::new(0);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(
            fence.wait(1, Duration::from_micros(10), Some(deadline)),
            WaitStatus::TimedOut
        );
    }

    #[test]
    fn blocked_waiter_wakes_on_signal() {
        let fence = Arc::new(FenceCounter::new(0));
        let waiter = {
            let fence = fence.clone();
            thread::spawn(move || fence.wait(3, Duration::ZERO, None))
        };

        thread::sleep(Duration::from_millis(10));
        fence.signal(2);
        fence.signal(3);

        assert_eq!(waiter.join().unwrap(), WaitStatus::Signaled);
    }
}
