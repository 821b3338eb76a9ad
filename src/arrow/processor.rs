use super::{ArrowCore, ExecOutcome, Forward, Stage, WorkerContext, forward};
use crate::control::ServiceRegistry;
use crate::mailbox::{Mailbox, Message, Pop};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Per-record transform or sink logic that may keep mutable state.
/// The arrow running it never has more than one executor.
pub trait RecordProcessor<T>: Send {
    fn open(&mut self, _services: &ServiceRegistry) -> anyhow::Result<()> {
        Ok(())
    }

    /// An `Err` drops the record unless it is fatal (see [`crate::error::is_fatal`]).
    fn process(&mut self, record: &mut T) -> anyhow::Result<()>;

    /// Called once when the input has been fully consumed.
    fn finish(&mut self) {}
}

impl<T, F> RecordProcessor<T> for F
where
    F: FnMut(&mut T) -> anyhow::Result<()> + Send,
{
    fn process(&mut self, record: &mut T) -> anyhow::Result<()> {
        self(record)
    }
}

/// Thread-safe per-record logic, run by any number of executors at once.
pub trait ParallelProcessor<T>: Send + Sync {
    fn open(&self, _services: &ServiceRegistry) -> anyhow::Result<()> {
        Ok(())
    }

    fn process(&self, record: &mut T) -> anyhow::Result<()>;

    fn finish(&self) {}
}

impl<T, F> ParallelProcessor<T> for F
where
    F: Fn(&mut T) -> anyhow::Result<()> + Send + Sync,
{
    fn process(&self, record: &mut T) -> anyhow::Result<()> {
        self(record)
    }
}

pub(crate) enum ProcessorLogic<T> {
    Sequential(Mutex<Box<dyn RecordProcessor<T>>>),
    Parallel(Box<dyn ParallelProcessor<T>>),
}

impl<T> ProcessorLogic<T> {
    pub(crate) fn is_parallel(&self) -> bool {
        matches!(self, ProcessorLogic::Parallel(_))
    }

    fn open(&self, services: &ServiceRegistry) -> anyhow::Result<()> {
        match self {
            ProcessorLogic::Sequential(p) => p.lock().open(services),
            ProcessorLogic::Parallel(p) => p.open(services),
        }
    }

    fn process(&self, record: &mut T) -> anyhow::Result<()> {
        match self {
            ProcessorLogic::Sequential(p) => p.lock().process(record),
            ProcessorLogic::Parallel(p) => p.process(record),
        }
    }

    fn finish(&self) {
        match self {
            ProcessorLogic::Sequential(p) => p.lock().finish(),
            ProcessorLogic::Parallel(p) => p.finish(),
        }
    }
}

/// One input, zero (sink) or one output.
pub(crate) struct ProcessorStage<T> {
    logic: ProcessorLogic<T>,
    inputs: [Arc<Mailbox<T>>; 1],
    outputs: Vec<Arc<Mailbox<T>>>,
    held: Mutex<VecDeque<Message<T>>>,
}

impl<T: Send + 'static> ProcessorStage<T> {
    pub(crate) fn new(
        logic: ProcessorLogic<T>,
        input: Arc<Mailbox<T>>,
        output: Option<Arc<Mailbox<T>>>,
    ) -> Self {
        Self {
            logic,
            inputs: [input],
            outputs: output.into_iter().collect(),
            held: Mutex::new(VecDeque::new()),
        }
    }

    /// Retries the oldest held record. `None` when nothing is held.
    fn flush_held(&self, core: &ArrowCore, out: &Mailbox<T>) -> Option<ExecOutcome> {
        let mut held = self.held.lock();
        let msg = held.pop_front()?;
        Some(match forward(core, Some(&self.inputs[0]), out, msg) {
            Ok(()) => ExecOutcome::Success,
            Err(Forward::Blocked(msg)) => {
                held.push_front(msg);
                ExecOutcome::NothingToDo
            }
            Err(Forward::Closed(e)) => ExecOutcome::Error(e),
        })
    }

    fn finish(&self, core: &ArrowCore) -> ExecOutcome {
        if !core.is_sole_executor() || !self.held.lock().is_empty() {
            return ExecOutcome::NothingToDo;
        }
        core.finish(&self.outputs, || self.logic.finish())
    }
}

impl<T: Send + 'static> Stage<T> for ProcessorStage<T> {
    fn open(&self, services: &ServiceRegistry) -> anyhow::Result<()> {
        self.logic.open(services)
    }

    fn execute_one(&self, core: &ArrowCore, _ctx: &WorkerContext<'_>) -> ExecOutcome {
        let input = &self.inputs[0];
        let output = self.outputs.first();

        if let Some(out) = output
            && let Some(outcome) = self.flush_held(core, out)
        {
            return outcome;
        }

        let mut msg = match input.try_pop() {
            Pop::Item(msg) => msg,
            Pop::Empty => return ExecOutcome::NothingToDo,
            Pop::UpstreamFinished => return self.finish(core),
        };
        if input.is_closed() {
            core.enter_draining();
        }

        if let Err(e) = self.logic.process(msg.payload_mut()) {
            input.ack_message(&msg);
            return core.on_user_error(e).unwrap_or(ExecOutcome::Success);
        }

        let Some(out) = output else {
            input.ack_message(&msg);
            core.metrics().record_processed(1);
            return ExecOutcome::Success;
        };

        match forward(core, Some(input), out, msg) {
            Ok(()) => ExecOutcome::Success,
            Err(Forward::Blocked(msg)) => {
                self.held.lock().push_back(msg);
                ExecOutcome::NothingToDo
            }
            Err(Forward::Closed(e)) => ExecOutcome::Error(e),
        }
    }

    fn inputs(&self) -> &[Arc<Mailbox<T>>] {
        &self.inputs
    }

    fn outputs(&self) -> &[Arc<Mailbox<T>>] {
        &self.outputs
    }

    fn held(&self) -> usize {
        self.held.lock().len()
    }
}
