use crate::arrow::ArrowHandle;
use crate::topology::Topology;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How the scheduler picks among eligible arrows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPolicy {
    /// Largest input backlog first, ties rotate.
    #[default]
    Backlog,
    /// First eligible arrow after a rotating cursor.
    RoundRobin,
}

/// Hands out arrow claims to workers and watches for stalls.
pub struct Scheduler<T> {
    topology: Arc<Topology<T>>,
    policy: SchedulerPolicy,
    stall: StallDetector,
}

impl<T: Send + 'static> Scheduler<T> {
    pub fn new(topology: Arc<Topology<T>>, policy: SchedulerPolicy, stall_threshold: Duration) -> Self {
        Self {
            topology,
            policy,
            stall: StallDetector::new(stall_threshold),
        }
    }

    #[inline]
    pub fn topology(&self) -> &Arc<Topology<T>> {
        &self.topology
    }

    #[inline]
    pub fn policy(&self) -> SchedulerPolicy {
        self.policy
    }

    /// Claims work for `worker_id`, or `None` when the worker should back off.
    pub fn assign(&self, worker_id: usize) -> Option<ArrowHandle<T>> {
        let handle = self.topology.select(worker_id, self.policy);
        if handle.is_none() {
            self.topology.promote_drained();
            self.report_idle();
        }
        handle
    }

    /// Called when a worker found nothing to do, assigned or not.
    pub fn report_idle(&self) {
        if !self.topology.all_finished() {
            self.stall.check(self.topology.total_backlog());
        }
    }

    /// Called after every successful execution.
    #[inline]
    pub fn report_progress(&self) {
        self.stall.progress();
    }

    pub fn deadlock_warnings(&self) -> u64 {
        self.stall.warnings.load(Ordering::Relaxed)
    }
}

/// Flags a run where nothing has succeeded for longer than the threshold.
/// One warning per stall episode; progress re-arms it.
struct StallDetector {
    epoch: Instant,
    last_progress_ns: AtomicU64,
    threshold_ns: u64,
    warned: AtomicBool,
    warnings: AtomicU64,
}

impl StallDetector {
    fn new(threshold: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            last_progress_ns: AtomicU64::new(0),
            threshold_ns: threshold.as_nanos().min(u64::MAX as u128) as u64,
            warned: AtomicBool::new(false),
            warnings: AtomicU64::new(0),
        }
    }

    #[inline]
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos().min(u64::MAX as u128) as u64
    }

    #[inline]
    fn progress(&self) {
        self.last_progress_ns.store(self.now_ns(), Ordering::Relaxed);
        if self.warned.load(Ordering::Relaxed) {
            self.warned.store(false, Ordering::Relaxed);
        }
    }

    fn check(&self, backlog: usize) {
        if self.threshold_ns == 0 {
            return;
        }
        let idle_ns = self
            .now_ns()
            .saturating_sub(self.last_progress_ns.load(Ordering::Relaxed));
        if idle_ns < self.threshold_ns || self.warned.swap(true, Ordering::AcqRel) {
            return;
        }
        self.warnings.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            backlog,
            "[Scheduler] no arrow has made progress for {:?}; possible deadlock",
            Duration::from_nanos(idle_ns)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrow::Emit;
    use crate::control::ServiceRegistry;
    use crate::topology::TopologyBuilder;

    fn stuck_topology() -> Arc<Topology<u32>> {
        let mut b = TopologyBuilder::<u32>::new();
        let q = b.mailbox("q");
        b.source("idle", || Emit::<u32>::NotReady, q)
            .sink("sink", |_: &mut u32| -> anyhow::Result<()> { Ok(()) }, q);
        let topo = Arc::new(b.build().expect("valid"));
        topo.activate_initial_sources(&ServiceRegistry::new())
            .expect("activate");
        topo
    }

    #[test]
    fn stall_warns_once_per_episode() {
        let detector = StallDetector::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        detector.check(3);
        detector.check(3);
        assert_eq!(detector.warnings.load(Ordering::Relaxed), 1);

        detector.progress();
        std::thread::sleep(Duration::from_millis(5));
        detector.check(3);
        assert_eq!(detector.warnings.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn zero_threshold_disables_detection() {
        let detector = StallDetector::new(Duration::ZERO);
        detector.check(10);
        assert_eq!(detector.warnings.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn idle_source_eventually_reports_stall() {
        let topo = stuck_topology();
        let scheduler = Scheduler::new(topo, SchedulerPolicy::Backlog, Duration::from_millis(50));

        // The source is always eligible but never produces.
        let handle = scheduler.assign(0).expect("source is eligible");
        assert_eq!(handle.name(), "idle");
        drop(handle);

        std::thread::sleep(Duration::from_millis(80));
        scheduler.report_idle();
        scheduler.report_idle();
        assert_eq!(scheduler.deadlock_warnings(), 1);

        scheduler.report_progress();
        scheduler.report_idle();
        assert_eq!(scheduler.deadlock_warnings(), 1);
    }
}
