use crossbeam::utils::CachePadded;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Cheaply clonable one-shot flag shared between the controller and workers.
///
/// Once triggered it stays triggered. [`StopSignal::trigger`] reports whether
/// this call was the one that flipped it, which gives at-most-once hooks.
#[derive(Clone, Default)]
#[repr(transparent)]
pub struct StopSignal(Arc<CachePadded<AtomicBool>>);

impl StopSignal {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the first caller.
    #[inline]
    pub fn trigger(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    #[inline(always)]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Sleep until triggered or `total` elapsed. Returns `false` if triggered.
    pub fn sleep_interruptible(&self, total: Duration) -> bool {
        let start = Instant::now();
        let tick = Duration::from_millis(5);
        loop {
            if self.is_triggered() {
                return false;
            }
            let elapsed = start.elapsed();
            if elapsed >= total {
                return true;
            }
            std::thread::sleep(tick.min(total - elapsed));
        }
    }
}

impl fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopSignal")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}
