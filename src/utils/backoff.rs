use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Idle policy for a worker that found nothing to run.
///
/// The first `spin_rounds` idle rounds busy-spin, rounds up to `yield_rounds`
/// yield the thread, and later rounds sleep with an exponentially growing
/// delay capped at `max_sleep_us`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub spin_rounds: u32,
    pub yield_rounds: u32,
    pub initial_sleep_us: u64,
    pub max_sleep_us: u64,
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            spin_rounds: 16,
            yield_rounds: 48,
            initial_sleep_us: 10,
            max_sleep_us: 2_000,
            factor: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStep {
    Spin,
    Yield,
    Sleep(Duration),
}

#[derive(Debug)]
pub struct IdleBackoff {
    cfg: BackoffConfig,
    attempt: u32,
}

impl IdleBackoff {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self { cfg, attempt: 0 }
    }

    #[inline]
    pub fn on_success(&mut self) {
        self.attempt = 0;
    }

    #[inline]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Next tier for the current idle streak. Advances the streak.
    #[inline]
    pub fn next_step(&mut self) -> BackoffStep {
        let attempt = self.attempt;
        self.attempt = self.attempt.saturating_add(1);

        if attempt < self.cfg.spin_rounds {
            return BackoffStep::Spin;
        }
        if attempt < self.cfg.yield_rounds.max(self.cfg.spin_rounds) {
            return BackoffStep::Yield;
        }
        BackoffStep::Sleep(self.sleep_for(attempt))
    }

    fn sleep_for(&self, attempt: u32) -> Duration {
        let sleeping = attempt.saturating_sub(self.cfg.yield_rounds.max(self.cfg.spin_rounds));
        let exp = (self.cfg.initial_sleep_us as f64) * self.cfg.factor.powi(sleeping.min(64) as i32);
        let capped = exp.min(self.cfg.max_sleep_us as f64).max(0.0) as u64;
        Duration::from_micros(capped)
    }

    /// Performs one backoff step and returns the wall time it took.
    pub fn snooze(&mut self) -> Duration {
        let started = Instant::now();
        match self.next_step() {
            BackoffStep::Spin => {
                for _ in 0..(1u32 << self.attempt.min(6)) {
                    std::hint::spin_loop();
                }
            }
            BackoffStep::Yield => std::thread::yield_now(),
            BackoffStep::Sleep(delay) => std::thread::sleep(delay),
        }
        started.elapsed()
    }
}
