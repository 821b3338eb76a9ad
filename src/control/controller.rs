use crate::config::EngineConfig;
use crate::control::run_state::RunState;
use crate::control::{LifecycleListener, ServiceRegistry};
use crate::error::EngineError;
use crate::metrics::ComponentSummary;
use crate::scheduler::Scheduler;
use crate::topology::Topology;
use crate::worker::{self, JOIN_POLL, WorkerConfig, WorkerHandle, WorkerShared};
use parking_lot::Mutex;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;

/// How a [`ProcessingController::wait_until_finished`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every sink finished; workers have been joined.
    Finished,
    /// The timeout elapsed first. The run keeps going.
    TimedOut,
    /// A stop was requested; workers have been joined or detached.
    Stopped,
}

/// Cloneable stop trigger for a running controller. Usable from any thread,
/// including while another thread blocks in `wait_until_finished`.
#[derive(Clone)]
pub struct StopHandle {
    run: Arc<RunState>,
}

impl StopHandle {
    /// Same as [`ProcessingController::request_stop`].
    pub fn request_stop(&self) {
        self.run.request_stop();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.run.stop_requested()
    }
}

/// Owns the worker pool and drives one run of a topology.
pub struct ProcessingController<T: Send + 'static> {
    topology: Arc<Topology<T>>,
    config: EngineConfig,
    scheduler: Arc<Scheduler<T>>,
    services: Arc<ServiceRegistry>,
    run: Arc<RunState>,
    workers: Vec<WorkerHandle>,
    started_at: Option<Instant>,
    last_split: Mutex<Option<(Instant, u64)>>,
    term_flag: Option<Arc<AtomicBool>>,
    detached: usize,
    log_guard: Option<WorkerGuard>,
}

impl<T: Send + 'static> ProcessingController<T> {
    pub fn new(topology: Topology<T>, config: EngineConfig) -> Self {
        let topology = Arc::new(topology);
        let scheduler = Arc::new(Scheduler::new(
            topology.clone(),
            config.scheduler,
            config.deadlock_threshold(),
        ));
        Self {
            topology,
            scheduler,
            config,
            services: Arc::new(ServiceRegistry::new()),
            run: Arc::new(RunState::new(None)),
            workers: Vec::new(),
            started_at: None,
            last_split: Mutex::new(None),
            term_flag: None,
            detached: 0,
            log_guard: None,
        }
    }

    /// Services handed to every arrow's `open` hook. Set before `start`.
    pub fn with_services(mut self, services: ServiceRegistry) -> Self {
        self.services = Arc::new(services);
        self
    }

    pub fn with_listener(self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.run.set_listener(listener);
        self
    }

    #[inline]
    pub fn topology(&self) -> &Arc<Topology<T>> {
        &self.topology
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.run.is_finished() || self.topology.all_finished()
    }

    pub fn is_stopped(&self) -> bool {
        self.run.stop_requested()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            run: self.run.clone(),
        }
    }

    /// Opens the topology and spawns `n_workers` threads (the configured
    /// count when zero).
    pub fn start(&mut self, n_workers: usize) -> Result<(), EngineError> {
        if self.started_at.is_some() {
            return Err(EngineError::AlreadyStarted);
        }
        self.config.validate()?;
        if let Some(logger) = &self.config.logger {
            self.log_guard = logger
                .init()
                .map_err(|e| EngineError::Config(format!("logger: {e:#}")))?;
        }
        let n_workers = if n_workers == 0 {
            self.config.workers.max(1)
        } else {
            n_workers
        };

        if self.config.handle_term_signals {
            let term_flag = Arc::new(AtomicBool::new(false));
            for sig in TERM_SIGNALS {
                if let Err(e) = flag::register(*sig, term_flag.clone()) {
                    tracing::warn!("[Controller] cannot register signal {sig}: {e}");
                }
            }
            self.term_flag = Some(term_flag);
        }

        self.topology.activate_initial_sources(&self.services)?;
        self.started_at = Some(Instant::now());
        *self.last_split.lock() = Some((Instant::now(), 0));

        tracing::info!(
            "[Controller] starting {} workers over {} arrows ({:?} scheduling)",
            n_workers,
            self.topology.arrows().len(),
            self.config.scheduler
        );
        self.scale(n_workers)
    }

    /// Grows the worker pool to `n_workers`. Shrinking a live pool is not
    /// supported; a smaller count is logged and ignored.
    pub fn scale(&mut self, n_workers: usize) -> Result<(), EngineError> {
        if self.started_at.is_none() {
            return Err(EngineError::NotStarted);
        }
        let current = self.workers.len();
        if n_workers < current {
            tracing::warn!(
                "[Controller] cannot scale down from {current} to {n_workers} workers; keeping {current}"
            );
            return Ok(());
        }
        let shared = WorkerShared {
            scheduler: self.scheduler.clone(),
            services: self.services.clone(),
            run: self.run.clone(),
        };
        for id in current..n_workers {
            let cfg = WorkerConfig {
                assignment_budget: self.config.assignment_budget,
                backoff: self.config.backoff.clone(),
                cpu: self.config.affinity.core_for_worker(id),
            };
            let handle = worker::spawn(id, cfg, shared.clone())?;
            self.workers.push(handle);
        }
        if n_workers > current {
            tracing::debug!("[Controller] scaled workers {current} -> {n_workers}");
        }
        Ok(())
    }

    /// Cooperative stop: workers finish their current execution and exit.
    /// Queued records are left in place.
    pub fn request_stop(&self) {
        self.run.request_stop();
    }

    /// Blocks until the topology finishes, a stop is requested, a fatal
    /// error occurs or `timeout` elapses. A timeout past the representable
    /// range waits without a deadline.
    pub fn wait_until_finished(&mut self, timeout: Duration) -> Result<RunStatus, EngineError> {
        if self.started_at.is_none() {
            return Err(EngineError::NotStarted);
        }
        let deadline = Instant::now().checked_add(timeout);

        loop {
            if let Some(term) = &self.term_flag
                && term.load(Ordering::Relaxed)
            {
                tracing::warn!("[Controller] termination signal received");
                self.request_stop();
            }

            self.check_worker_timeouts();
            if let Some(err) = self.run.failure() {
                self.shutdown_workers();
                self.print_final_report();
                return Err(err);
            }

            self.topology.promote_drained();
            if self.topology.all_finished() {
                self.run.notify_finished();
                self.shutdown_workers();
                self.print_final_report();
                return Ok(RunStatus::Finished);
            }

            if self.run.stop_requested() {
                self.shutdown_workers();
                if let Some(err) = self.run.failure() {
                    return Err(err);
                }
                self.print_final_report();
                return Ok(RunStatus::Stopped);
            }

            let nap = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(RunStatus::TimedOut);
                    }
                    self.config.poll_interval().min(deadline - now)
                }
                None => self.config.poll_interval(),
            };
            // Wakes early when a worker fails the run.
            self.run.stop_signal().sleep_interruptible(nap);
        }
    }

    /// Fails the run when a worker has sat inside one execution past its
    /// timeout. Workers that have not completed anything yet get the warmup
    /// timeout instead.
    fn check_worker_timeouts(&self) {
        for w in &self.workers {
            if w.is_done() {
                continue;
            }
            let m = w.metrics().snapshot();
            let Some(index) = m.current_arrow else {
                continue;
            };
            let limit = if m.completed == 0 {
                self.config.warmup_timeout()
            } else {
                self.config.worker_timeout()
            };
            if limit.is_zero() {
                continue;
            }
            let age = m.heartbeat_age(self.run.epoch);
            if age <= limit {
                continue;
            }
            let arrow = self
                .topology
                .arrows()
                .get(index)
                .map_or("<unknown>", |a| a.name());
            self.run.fail(
                arrow,
                EngineError::WorkerTimeout {
                    worker_id: w.id(),
                    arrow: arrow.to_string(),
                    elapsed_ms: age.as_millis().min(u64::MAX as u128) as u64,
                },
            );
            return;
        }
    }

    /// Joins exited workers; detaches the ones still running after the
    /// grace period.
    fn shutdown_workers(&mut self) {
        let deadline = Instant::now().checked_add(self.config.stop_grace());
        loop {
            let mut pending = 0;
            for w in &mut self.workers {
                if !w.try_join() {
                    pending += 1;
                }
            }
            if pending == 0 {
                return;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            thread::sleep(JOIN_POLL);
        }
        for w in &mut self.workers {
            if !w.is_done() {
                w.detach();
                self.detached += 1;
            }
        }
    }

    /// Workers given up on after the stop grace period.
    pub fn detached_workers(&self) -> usize {
        self.detached
    }

    /// Copies out every counter. Instantaneous throughput is measured since
    /// the previous snapshot.
    pub fn snapshot_metrics(&self) -> ComponentSummary {
        let uptime = self
            .started_at
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);
        let summary = ComponentSummary::collect(
            &self.topology,
            &self.workers,
            uptime,
            self.run.epoch,
            self.scheduler.deadlock_warnings(),
        );

        let now = Instant::now();
        let mut last = self.last_split.lock();
        let latest = match *last {
            Some((at, processed)) => {
                let secs = now.duration_since(at).as_secs_f64();
                if secs > 0.0 {
                    summary.total_processed.saturating_sub(processed) as f64 / secs
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        *last = Some((now, summary.total_processed));
        summary.with_latest_throughput(latest)
    }

    pub fn print_report(&self) {
        tracing::info!("[Controller] status\n{}", self.snapshot_metrics());
    }

    pub fn print_final_report(&self) {
        tracing::info!("[Controller] final report\n{}", self.snapshot_metrics());
    }
}

impl<T: Send + 'static> Drop for ProcessingController<T> {
    fn drop(&mut self) {
        if self.workers.iter().any(|w| !w.is_done()) {
            self.run.request_stop();
            self.shutdown_workers();
        }
    }
}
