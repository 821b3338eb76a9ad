mod summary;

pub use summary::{ArrowSummary, ComponentSummary, WorkerSummary};

use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::time::{Duration, Instant};

#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastOutcome {
    #[default]
    NotRunYet = 0,
    Success = 1,
    NothingToDo = 2,
    Finished = 3,
    Error = 4,
}

impl LastOutcome {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LastOutcome::Success,
            2 => LastOutcome::NothingToDo,
            3 => LastOutcome::Finished,
            4 => LastOutcome::Error,
            _ => LastOutcome::NotRunYet,
        }
    }
}

#[inline]
fn nanos(d: Duration) -> u64 {
    d.as_nanos().min(u64::MAX as u128) as u64
}

/// Per-arrow counters, updated by whichever worker executes the arrow.
#[derive(Debug, Default)]
pub struct ArrowMetrics {
    processed: CachePadded<AtomicU64>,
    transient_errors: AtomicU64,
    executions: AtomicU64,
    idle_visits: AtomicU64,
    busy_ns: AtomicU64,
    wait_ns: AtomicU64,
    last_latency_ns: AtomicU64,
    last_outcome: AtomicU8,
}

impl ArrowMetrics {
    #[inline]
    pub(crate) fn record_processed(&self, n: u64) {
        self.processed.fetch_add(n, Relaxed);
    }

    #[inline]
    pub(crate) fn record_transient_error(&self) {
        self.transient_errors.fetch_add(1, Relaxed);
    }

    /// One `execute_one` call. Successful calls count as busy time, the
    /// rest as wait time.
    pub(crate) fn record_execution(&self, outcome: LastOutcome, elapsed: Duration) {
        self.executions.fetch_add(1, Relaxed);
        let ns = nanos(elapsed);
        match outcome {
            LastOutcome::Success => {
                self.busy_ns.fetch_add(ns, Relaxed);
                self.last_latency_ns.store(ns, Relaxed);
            }
            LastOutcome::NothingToDo => {
                self.idle_visits.fetch_add(1, Relaxed);
                self.wait_ns.fetch_add(ns, Relaxed);
            }
            _ => {
                self.wait_ns.fetch_add(ns, Relaxed);
            }
        }
        self.last_outcome.store(outcome as u8, Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Relaxed)
    }

    pub fn transient_errors(&self) -> u64 {
        self.transient_errors.load(Relaxed)
    }

    pub fn snapshot(&self) -> ArrowMetricsSnapshot {
        ArrowMetricsSnapshot {
            processed: self.processed.load(Relaxed),
            transient_errors: self.transient_errors.load(Relaxed),
            executions: self.executions.load(Relaxed),
            idle_visits: self.idle_visits.load(Relaxed),
            busy_ns: self.busy_ns.load(Relaxed),
            wait_ns: self.wait_ns.load(Relaxed),
            last_latency_ns: self.last_latency_ns.load(Relaxed),
            last_outcome: LastOutcome::from_u8(self.last_outcome.load(Relaxed)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrowMetricsSnapshot {
    pub processed: u64,
    pub transient_errors: u64,
    pub executions: u64,
    pub idle_visits: u64,
    pub busy_ns: u64,
    pub wait_ns: u64,
    pub last_latency_ns: u64,
    pub last_outcome: LastOutcome,
}

impl ArrowMetricsSnapshot {
    /// Mean busy time per processed record, in milliseconds.
    pub fn avg_latency_ms(&self) -> f64 {
        if self.processed == 0 {
            return 0.0;
        }
        self.busy_ns as f64 / 1e6 / self.processed as f64
    }
}

pub(crate) const NO_ARROW: usize = usize::MAX;

/// Per-worker counters. Written only by the owning worker thread.
#[derive(Debug)]
pub struct WorkerMetrics {
    visits: CachePadded<AtomicU64>,
    assignments: AtomicU64,
    completed: AtomicU64,
    useful_ns: AtomicU64,
    idle_ns: AtomicU64,
    scheduler_ns: AtomicU64,
    last_heartbeat_ns: AtomicU64,
    current_arrow: AtomicUsize,
    cpu_id: AtomicUsize,
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self {
            visits: CachePadded::new(AtomicU64::new(0)),
            assignments: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            useful_ns: AtomicU64::new(0),
            idle_ns: AtomicU64::new(0),
            scheduler_ns: AtomicU64::new(0),
            last_heartbeat_ns: AtomicU64::new(0),
            current_arrow: AtomicUsize::new(NO_ARROW),
            cpu_id: AtomicUsize::new(usize::MAX),
        }
    }
}

impl WorkerMetrics {
    pub(crate) fn record_visit(&self, scheduler: Duration, assigned: bool) {
        self.visits.fetch_add(1, Relaxed);
        self.scheduler_ns.fetch_add(nanos(scheduler), Relaxed);
        if assigned {
            self.assignments.fetch_add(1, Relaxed);
        }
    }

    pub(crate) fn record_useful(&self, d: Duration) {
        self.completed.fetch_add(1, Relaxed);
        self.useful_ns.fetch_add(nanos(d), Relaxed);
    }

    pub(crate) fn record_idle(&self, d: Duration) {
        self.idle_ns.fetch_add(nanos(d), Relaxed);
    }

    pub(crate) fn heartbeat(&self, epoch: Instant) {
        self.last_heartbeat_ns.store(nanos(epoch.elapsed()), Relaxed);
    }

    pub(crate) fn set_current_arrow(&self, index: Option<usize>) {
        self.current_arrow.store(index.unwrap_or(NO_ARROW), Relaxed);
    }

    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.cpu_id.store(cpu, Relaxed);
    }

    pub fn snapshot(&self) -> WorkerMetricsSnapshot {
        let current = self.current_arrow.load(Relaxed);
        let cpu = self.cpu_id.load(Relaxed);
        WorkerMetricsSnapshot {
            visits: self.visits.load(Relaxed),
            assignments: self.assignments.load(Relaxed),
            completed: self.completed.load(Relaxed),
            useful_ns: self.useful_ns.load(Relaxed),
            idle_ns: self.idle_ns.load(Relaxed),
            scheduler_ns: self.scheduler_ns.load(Relaxed),
            last_heartbeat_ns: self.last_heartbeat_ns.load(Relaxed),
            current_arrow: (current != NO_ARROW).then_some(current),
            cpu_id: (cpu != usize::MAX).then_some(cpu),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetricsSnapshot {
    pub visits: u64,
    pub assignments: u64,
    /// Executions that did useful work. Zero while the worker warms up.
    pub completed: u64,
    pub useful_ns: u64,
    pub idle_ns: u64,
    pub scheduler_ns: u64,
    /// Nanoseconds since the run epoch at the last heartbeat.
    pub last_heartbeat_ns: u64,
    pub current_arrow: Option<usize>,
    pub cpu_id: Option<usize>,
}

impl WorkerMetricsSnapshot {
    /// Share of accounted time spent executing arrows.
    pub fn utilization(&self) -> f64 {
        let total = self.useful_ns + self.idle_ns + self.scheduler_ns;
        if total == 0 {
            return 0.0;
        }
        self.useful_ns as f64 / total as f64
    }

    /// Time since the last heartbeat, with `epoch` the instant heartbeats are
    /// measured from.
    pub fn heartbeat_age(&self, epoch: Instant) -> Duration {
        Duration::from_nanos(nanos(epoch.elapsed()).saturating_sub(self.last_heartbeat_ns))
    }
}
