use crate::arrow::{ArrowHandle, ExecOutcome, WorkerContext};
use crate::control::ServiceRegistry;
use crate::control::run_state::RunState;
use crate::error::EngineError;
use crate::metrics::WorkerMetrics;
use crate::scheduler::Scheduler;
use crate::utils::backoff::{BackoffConfig, IdleBackoff};
use crate::utils::try_pin_core;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub(crate) struct WorkerConfig {
    pub(crate) assignment_budget: u32,
    pub(crate) backoff: BackoffConfig,
    pub(crate) cpu: Option<usize>,
}

/// Everything a worker thread shares with the controller.
pub(crate) struct WorkerShared<T> {
    pub(crate) scheduler: Arc<Scheduler<T>>,
    pub(crate) services: Arc<ServiceRegistry>,
    pub(crate) run: Arc<RunState>,
}

impl<T> Clone for WorkerShared<T> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
            services: self.services.clone(),
            run: self.run.clone(),
        }
    }
}

/// Controller-side view of a worker thread.
pub struct WorkerHandle {
    id: usize,
    metrics: Arc<WorkerMetrics>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    /// Thread has exited, or was detached.
    pub fn is_done(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Joins if the thread already exited. Returns `false` while it runs.
    pub(crate) fn try_join(&mut self) -> bool {
        let Some(join) = self.join.take_if(|j| j.is_finished()) else {
            return self.join.is_none();
        };
        if join.join().is_err() {
            tracing::error!("[Worker {}] thread panicked outside arrow execution", self.id);
        }
        true
    }

    /// Gives up on the thread. It keeps running until it notices the stop.
    pub(crate) fn detach(&mut self) {
        if self.join.take().is_some() {
            tracing::warn!("[Worker {}] did not stop within the grace period; detached", self.id);
        }
    }
}

pub(crate) fn spawn<T: Send + 'static>(
    id: usize,
    cfg: WorkerConfig,
    shared: WorkerShared<T>,
) -> Result<WorkerHandle, EngineError> {
    let metrics = Arc::new(WorkerMetrics::default());
    let join = {
        let metrics = metrics.clone();
        thread::Builder::new()
            .name(format!("arrowrt-worker-{id}"))
            .spawn(move || run_loop(id, cfg, shared, &metrics))
            .map_err(|source| EngineError::WorkerSpawn {
                worker_id: id,
                source,
            })?
    };
    Ok(WorkerHandle {
        id,
        metrics,
        join: Some(join),
    })
}

fn run_loop<T: Send + 'static>(
    id: usize,
    cfg: WorkerConfig,
    shared: WorkerShared<T>,
    metrics: &WorkerMetrics,
) {
    if let Some(core_id) = cfg.cpu {
        match try_pin_core(core_id) {
            Ok(core_id) => {
                metrics.set_cpu(core_id);
                tracing::info!("[Worker {id}] pinned to core: {core_id}");
            }
            Err(e) => tracing::warn!("[Worker {id}] cannot pin core: {e}"),
        }
    }

    let WorkerShared {
        scheduler,
        services,
        run,
    } = shared;
    let ctx = WorkerContext {
        worker_id: id,
        services: &services,
    };
    let mut backoff = IdleBackoff::new(cfg.backoff.clone());
    let topology = scheduler.topology().clone();

    tracing::debug!("[Worker {id}] started");
    metrics.heartbeat(run.epoch);

    while !run.should_exit() {
        let visit = Instant::now();
        let assignment = scheduler.assign(id);
        metrics.record_visit(visit.elapsed(), assignment.is_some());

        match assignment {
            None => {
                if topology.all_finished() {
                    run.notify_finished();
                    break;
                }
                metrics.record_idle(backoff.snooze());
            }
            Some(arrow) => {
                metrics.set_current_arrow(Some(arrow.index()));
                let idle = run_assignment(&arrow, &ctx, &cfg, &scheduler, &run, metrics);
                metrics.set_current_arrow(None);
                drop(arrow);
                if idle {
                    scheduler.report_idle();
                    metrics.record_idle(backoff.snooze());
                } else {
                    backoff.on_success();
                }
            }
        }
        metrics.heartbeat(run.epoch);
    }

    metrics.heartbeat(run.epoch);
    tracing::debug!("[Worker {id}] exiting");
}

/// Executes the claimed arrow until it runs dry or the budget is spent.
/// Returns `true` when not a single execution succeeded.
fn run_assignment<T: Send + 'static>(
    arrow: &ArrowHandle<T>,
    ctx: &WorkerContext<'_>,
    cfg: &WorkerConfig,
    scheduler: &Scheduler<T>,
    run: &RunState,
    metrics: &WorkerMetrics,
) -> bool {
    let mut successes = 0u32;

    loop {
        // The controller times out a worker whose heartbeat goes stale inside one execution.
        metrics.heartbeat(run.epoch);
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| arrow.execute_one(ctx))).unwrap_or_else(
            |panic| {
                ExecOutcome::Error(EngineError::ArrowFailed {
                    arrow: arrow.name().to_string(),
                    detail: format!("panicked: {}", panic_message(panic.as_ref())),
                })
            },
        );
        let elapsed = started.elapsed();
        arrow.metrics().record_execution(outcome.as_last(), elapsed);

        match outcome {
            ExecOutcome::Success => {
                metrics.record_useful(elapsed);
                scheduler.report_progress();
                successes += 1;
                if successes >= cfg.assignment_budget || run.should_exit() {
                    return false;
                }
            }
            ExecOutcome::NothingToDo => {
                metrics.record_idle(elapsed);
                return successes == 0;
            }
            ExecOutcome::Finished => {
                metrics.record_useful(elapsed);
                scheduler.report_progress();
                let topology = scheduler.topology();
                topology.promote_drained();
                if topology.all_finished() {
                    run.notify_finished();
                }
                return false;
            }
            ExecOutcome::Error(err) => {
                run.fail(arrow.name(), err);
                return false;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Upper bound on how long [`WorkerHandle::try_join`] polling waits between checks.
pub(crate) const JOIN_POLL: Duration = Duration::from_millis(1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let caught = catch_unwind(|| panic!("boom {}", 7)).expect_err("panicked");
        assert_eq!(panic_message(caught.as_ref()), "boom 7");
        let caught = catch_unwind(|| std::panic::panic_any(5u8)).expect_err("panicked");
        assert_eq!(panic_message(caught.as_ref()), "unknown panic payload");
    }
}
