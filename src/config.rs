use crate::error::EngineError;
use crate::scheduler::SchedulerPolicy;
use crate::utils::AffinityConfig;
use crate::utils::backoff::BackoffConfig;
use crate::utils::logger::LoggerConfig;
use crate::utils::params_io::load_cfg_merge;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "ARROWRT";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Workers started when `start` is given zero.
    pub workers: usize,
    pub mailbox_capacity: usize,
    pub scheduler: SchedulerPolicy,
    pub backoff: BackoffConfig,
    /// Successful executions a worker runs on one arrow before going back
    /// to the scheduler.
    pub assignment_budget: u32,
    /// How long stopped workers get to exit before they are detached.
    pub stop_grace_ms: u64,
    /// Controller wait-loop poll period.
    pub poll_interval_ms: u64,
    /// No progress for this long logs a deadlock warning. Zero disables it.
    pub deadlock_threshold_ms: u64,
    pub subevent_max_in_flight: usize,
    pub affinity: AffinityConfig,
    /// Treat SIGTERM/SIGINT as a stop request.
    pub handle_term_signals: bool,
    /// A worker inside one execution for longer than this fails the run.
    /// Zero disables the check.
    pub worker_timeout_ms: u64,
    /// Same as `worker_timeout_ms`, applied until the worker has completed
    /// its first useful execution.
    pub warmup_timeout_ms: u64,
    /// Installed by the controller on `start`. Left out, logging is up to the
    /// embedding application.
    pub logger: Option<LoggerConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            mailbox_capacity: 64,
            scheduler: SchedulerPolicy::Backlog,
            backoff: BackoffConfig::default(),
            assignment_budget: 16,
            stop_grace_ms: 5_000,
            poll_interval_ms: 10,
            deadlock_threshold_ms: 10_000,
            subevent_max_in_flight: 16,
            affinity: AffinityConfig::default(),
            handle_term_signals: false,
            worker_timeout_ms: 8_000,
            warmup_timeout_ms: 30_000,
            logger: None,
        }
    }
}

impl EngineConfig {
    /// Reads the given files in order (missing ones are skipped), then
    /// applies `ARROWRT__*` environment overrides.
    pub fn load<P: AsRef<Path>>(paths: impl IntoIterator<Item = P>) -> anyhow::Result<Self> {
        let cfg: Self = load_cfg_merge(paths, Some(ENV_PREFIX))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.mailbox_capacity == 0 {
            return Err(EngineError::Config("mailbox_capacity must be positive".into()));
        }
        if self.assignment_budget == 0 {
            return Err(EngineError::Config("assignment_budget must be positive".into()));
        }
        if self.subevent_max_in_flight == 0 {
            return Err(EngineError::Config(
                "subevent_max_in_flight must be positive".into(),
            ));
        }
        if self.backoff.factor < 1.0 {
            return Err(EngineError::Config("backoff.factor must be at least 1.0".into()));
        }
        Ok(())
    }

    #[inline]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    #[inline]
    pub fn deadlock_threshold(&self) -> Duration {
        Duration::from_millis(self.deadlock_threshold_ms)
    }

    #[inline]
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    #[inline]
    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.warmup_timeout_ms)
    }
}
