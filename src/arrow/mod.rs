mod merge;
mod processor;
mod source;
mod split;
mod subevent;

pub use processor::{ParallelProcessor, RecordProcessor};
pub use source::{Emit, IterSource, RecordSource};
pub use subevent::SubeventProcessor;

pub(crate) use merge::MergeStage;
pub(crate) use processor::{ProcessorLogic, ProcessorStage};
pub(crate) use source::SourceStage;
pub(crate) use split::{Route, SplitStage};
pub(crate) use subevent::SubeventStage;

use crate::control::ServiceRegistry;
use crate::error::{EngineError, is_fatal};
use crate::mailbox::Mailbox;
use crate::metrics::{ArrowMetrics, LastOutcome};
use crate::warn_throttled;
use crossbeam::utils::CachePadded;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrowStatus {
    Unopened = 0,
    Running = 1,
    /// No new input will arrive; buffered work and downstream drain remain.
    Draining = 2,
    Finished = 3,
}

impl ArrowStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ArrowStatus::Running,
            2 => ArrowStatus::Draining,
            3 => ArrowStatus::Finished,
            _ => ArrowStatus::Unopened,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrowKind {
    Source,
    Processor,
    Sink,
    Merge,
    Split,
    Subevent,
}

impl fmt::Display for ArrowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArrowKind::Source => "source",
            ArrowKind::Processor => "processor",
            ArrowKind::Sink => "sink",
            ArrowKind::Merge => "merge",
            ArrowKind::Split => "split",
            ArrowKind::Subevent => "subevent",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum ExecOutcome {
    Success,
    NothingToDo,
    Finished,
    Error(EngineError),
}

impl ExecOutcome {
    pub(crate) fn as_last(&self) -> LastOutcome {
        match self {
            ExecOutcome::Success => LastOutcome::Success,
            ExecOutcome::NothingToDo => LastOutcome::NothingToDo,
            ExecOutcome::Finished => LastOutcome::Finished,
            ExecOutcome::Error(_) => LastOutcome::Error,
        }
    }
}

/// What an executing arrow knows about the worker running it.
pub struct WorkerContext<'a> {
    pub worker_id: usize,
    pub services: &'a ServiceRegistry,
}

/// Identity, lifecycle and accounting shared by every arrow variant.
pub struct ArrowCore {
    name: String,
    index: usize,
    kind: ArrowKind,
    parallel: bool,
    status: AtomicU8,
    active: CachePadded<AtomicUsize>,
    /// Set by the single executor that runs the finish path.
    closing: AtomicBool,
    metrics: ArrowMetrics,
}

impl ArrowCore {
    pub(crate) fn new(name: String, index: usize, kind: ArrowKind, parallel: bool) -> Self {
        Self {
            name,
            index,
            kind,
            parallel,
            status: AtomicU8::new(ArrowStatus::Unopened as u8),
            active: CachePadded::new(AtomicUsize::new(0)),
            closing: AtomicBool::new(false),
            metrics: ArrowMetrics::default(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn kind(&self) -> ArrowKind {
        self.kind
    }

    #[inline]
    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    #[inline]
    pub fn status(&self) -> ArrowStatus {
        ArrowStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub fn metrics(&self) -> &ArrowMetrics {
        &self.metrics
    }

    #[inline]
    pub fn active_executors(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn transition(&self, from: ArrowStatus, to: ArrowStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn enter_draining(&self) -> bool {
        self.transition(ArrowStatus::Running, ArrowStatus::Draining)
    }

    /// Non-parallel arrows admit one executor at a time.
    pub(crate) fn try_claim(&self) -> bool {
        if self.parallel {
            self.active.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        self.try_claim_exclusive()
    }

    /// Claim that succeeds only with no other executor, parallel or not.
    pub(crate) fn try_claim_exclusive(&self) -> bool {
        self.active
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn release(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    /// True for the only executor currently inside the arrow.
    #[inline]
    pub(crate) fn is_sole_executor(&self) -> bool {
        self.active_executors() <= 1
    }

    /// Runs `hook` once, then closes every output. Sinks finish immediately,
    /// everything else waits in Draining until the outputs are drained.
    pub(crate) fn finish<T>(&self, outputs: &[Arc<Mailbox<T>>], hook: impl FnOnce()) -> ExecOutcome {
        if self.closing.swap(true, Ordering::AcqRel) {
            return ExecOutcome::Finished;
        }
        self.enter_draining();
        hook();
        for out in outputs {
            out.close();
        }
        if outputs.is_empty() {
            self.transition(ArrowStatus::Draining, ArrowStatus::Finished);
        }
        tracing::debug!("[Arrow] '{}' closed its outputs", self.name);
        ExecOutcome::Finished
    }

    /// Counts and logs a record dropped because user code failed on it.
    pub(crate) fn record_transient(&self, err: &anyhow::Error) {
        self.metrics.record_transient_error();
        warn_throttled!(
            Duration::from_secs(5),
            arrow = self.name.as_str(),
            "[Arrow] record dropped: {err:#}"
        );
    }

    pub(crate) fn fail(&self, err: anyhow::Error) -> ExecOutcome {
        ExecOutcome::Error(EngineError::ArrowFailed {
            arrow: self.name.clone(),
            detail: format!("{err:#}"),
        })
    }

    /// Fatal errors stop the run; anything else drops the record.
    pub(crate) fn on_user_error(&self, err: anyhow::Error) -> Option<ExecOutcome> {
        if is_fatal(&err) {
            return Some(self.fail(err));
        }
        self.record_transient(&err);
        None
    }
}

impl fmt::Debug for ArrowCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrowCore")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("kind", &self.kind)
            .field("parallel", &self.parallel)
            .field("status", &self.status())
            .field("active", &self.active_executors())
            .finish()
    }
}

/// Variant-specific behaviour behind an arrow. The set of implementors is
/// closed: source, processor/sink, merge, split, subevent.
pub(crate) trait Stage<T>: Send + Sync {
    fn open(&self, _services: &ServiceRegistry) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute_one(&self, core: &ArrowCore, ctx: &WorkerContext<'_>) -> ExecOutcome;

    fn inputs(&self) -> &[Arc<Mailbox<T>>];

    fn outputs(&self) -> &[Arc<Mailbox<T>>];

    /// Records buffered inside the arrow.
    fn held(&self) -> usize {
        0
    }

    fn backlog(&self) -> usize {
        self.inputs().iter().map(|m| m.available()).sum::<usize>() + self.held()
    }

    /// Nothing left but the end-of-stream finish. Such an arrow is claimed
    /// by one executor at a time, even when parallel.
    fn finish_pending(&self) -> bool {
        let inputs = self.inputs();
        !inputs.is_empty() && self.held() == 0 && inputs.iter().all(|m| m.is_drained())
    }

    fn has_work(&self) -> bool {
        if self.finish_pending() {
            return true;
        }
        let has_input = self.inputs().iter().any(|m| m.available() > 0);
        (has_input || self.held() > 0) && can_push(self.outputs())
    }
}

#[inline]
pub(crate) fn can_push<T>(outputs: &[Arc<Mailbox<T>>]) -> bool {
    outputs.is_empty() || outputs.iter().any(|m| m.has_capacity())
}

/// A processing stage together with its runtime state.
pub struct Arrow<T> {
    core: ArrowCore,
    stage: Box<dyn Stage<T>>,
}

impl<T: Send + 'static> Arrow<T> {
    pub(crate) fn new(core: ArrowCore, stage: Box<dyn Stage<T>>) -> Self {
        Self { core, stage }
    }

    #[inline]
    pub fn core(&self) -> &ArrowCore {
        &self.core
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.core.name()
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.core.index()
    }

    #[inline]
    pub fn kind(&self) -> ArrowKind {
        self.core.kind()
    }

    #[inline]
    pub fn status(&self) -> ArrowStatus {
        self.core.status()
    }

    #[inline]
    pub fn metrics(&self) -> &ArrowMetrics {
        self.core.metrics()
    }

    pub fn inputs(&self) -> &[Arc<Mailbox<T>>] {
        self.stage.inputs()
    }

    pub fn outputs(&self) -> &[Arc<Mailbox<T>>] {
        self.stage.outputs()
    }

    pub fn held(&self) -> usize {
        self.stage.held()
    }

    pub fn backlog(&self) -> usize {
        self.stage.backlog()
    }

    pub(crate) fn finish_pending(&self) -> bool {
        self.stage.finish_pending()
    }

    /// Eligible for scheduling, ignoring executor claims.
    pub fn is_runnable(&self) -> bool {
        match self.status() {
            ArrowStatus::Running | ArrowStatus::Draining => {}
            ArrowStatus::Unopened | ArrowStatus::Finished => return false,
        }
        !self.core.is_closing() && self.stage.has_work()
    }

    /// Runs one unit of work. The caller must hold an [`ArrowHandle`].
    pub fn execute_one(&self, ctx: &WorkerContext<'_>) -> ExecOutcome {
        match self.status() {
            ArrowStatus::Finished => return ExecOutcome::Finished,
            ArrowStatus::Unopened => return ExecOutcome::NothingToDo,
            _ => {}
        }
        if self.core.is_closing() {
            return ExecOutcome::Finished;
        }
        self.stage.execute_one(&self.core, ctx)
    }

    /// Calls the user open hook and moves Unopened to Running.
    pub(crate) fn open(&self, services: &ServiceRegistry) -> Result<(), EngineError> {
        if self.status() != ArrowStatus::Unopened {
            return Ok(());
        }
        self.stage
            .open(services)
            .map_err(|e| EngineError::ArrowFailed {
                arrow: self.name().to_string(),
                detail: format!("open failed: {e:#}"),
            })?;
        self.core
            .transition(ArrowStatus::Unopened, ArrowStatus::Running);
        tracing::debug!("[Arrow] '{}' ({}) opened", self.name(), self.kind());
        Ok(())
    }

    /// Draining -> Finished once every output is closed and empty.
    pub(crate) fn try_promote_finished(&self) -> bool {
        if self.status() != ArrowStatus::Draining || !self.core.is_closing() {
            return false;
        }
        if !self.outputs().iter().all(|m| m.is_drained()) {
            return false;
        }
        let promoted = self
            .core
            .transition(ArrowStatus::Draining, ArrowStatus::Finished);
        if promoted {
            tracing::debug!("[Arrow] '{}' finished", self.name());
        }
        promoted
    }
}

impl<T> fmt::Debug for Arrow<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.core.fmt(f)
    }
}

/// Executor claim on an arrow, released on drop.
pub struct ArrowHandle<T> {
    arrow: Arc<Arrow<T>>,
}

impl<T: Send + 'static> ArrowHandle<T> {
    pub(crate) fn claim(arrow: &Arc<Arrow<T>>) -> Option<Self> {
        let claimed = if arrow.finish_pending() {
            arrow.core.try_claim_exclusive()
        } else {
            arrow.core.try_claim()
        };
        claimed.then(|| Self {
            arrow: Arc::clone(arrow),
        })
    }
}

impl<T> Deref for ArrowHandle<T> {
    type Target = Arrow<T>;

    fn deref(&self) -> &Arrow<T> {
        &self.arrow
    }
}

impl<T> Drop for ArrowHandle<T> {
    fn drop(&mut self) {
        self.arrow.core.release();
    }
}

/// Pushes `msg` and acks it on `input` when it leaves. Returns the message
/// back when the output is full.
pub(crate) fn forward<T>(
    core: &ArrowCore,
    input: Option<&Mailbox<T>>,
    output: &Mailbox<T>,
    msg: crate::mailbox::Message<T>,
) -> Result<(), Forward<T>> {
    let barrier = msg.is_barrier();
    match output.try_push(msg) {
        Ok(()) => {
            if let Some(input) = input {
                input.ack(barrier);
            }
            core.metrics().record_processed(1);
            Ok(())
        }
        Err(e) if e.is_full() => Err(Forward::Blocked(e.into_inner())),
        Err(e) => Err(Forward::Closed(EngineError::ArrowFailed {
            arrow: core.name().to_string(),
            detail: format!("output mailbox '{}' closed early: {e}", output.name()),
        })),
    }
}

pub(crate) enum Forward<T> {
    Blocked(crate::mailbox::Message<T>),
    Closed(EngineError),
}
