use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Records between two cancellation polls on hot loops.
pub const CANCEL_CHECK_INTERVAL: usize = 64;

/// Cooperative cancellation flag shared between an operator and its controller.
///
/// The flag moves from running to cancel-requested at most once and is never
/// reset. Threads parked in [`CancellationSignal::wait_timeout`] are woken as
/// soon as [`CancellationSignal::cancel`] is called.
#[derive(Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    cancelled: AtomicBool,
    lock: Mutex<()>,
    wakeup: Condvar,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            log::info!("Cancellation requested");
        }
        let _guard = self.inner.lock.lock();
        self.inner.wakeup.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Sleep for at most `timeout`, returning early on cancellation.
    ///
    /// Returns `true` if cancellation has been requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_cancelled() {
            if self.inner.wakeup.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_cancelled()
    }

    /// A counter that polls this signal once every [`CANCEL_CHECK_INTERVAL`] ticks.
    pub fn checker(&self) -> CancellationCheck {
        CancellationCheck {
            signal: self.clone(),
            interval: CANCEL_CHECK_INTERVAL,
            ticks: 0,
        }
    }
}

impl std::fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Amortized polling of a [`CancellationSignal`] from a record loop.
pub struct CancellationCheck {
    signal: CancellationSignal,
    interval: usize,
    ticks: usize,
}

impl CancellationCheck {
    /// Count one unit of work; returns `true` when cancellation was observed.
    #[inline]
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        if self.ticks >= self.interval {
            self.ticks = 0;
            return self.signal.is_cancelled();
        }
        false
    }

    /// Poll the signal right now, regardless of the interval.
    pub fn now(&mut self) -> bool {
        self.ticks = 0;
        self.signal.is_cancelled()
    }
}
