use super::{ArrowCore, ExecOutcome, Forward, Stage, WorkerContext, forward};
use crate::mailbox::{Mailbox, Message, Pop};
use parking_lot::Mutex;
use std::sync::Arc;

/// Fan-in: several inputs into one output. Inputs are polled in declaration
/// order, so a lower index always wins when several have records.
pub(crate) struct MergeStage<T> {
    inputs: Vec<Arc<Mailbox<T>>>,
    outputs: [Arc<Mailbox<T>>; 1],
    /// Blocked record and the input it came from.
    held: Mutex<Option<(Message<T>, usize)>>,
}

impl<T: Send + 'static> MergeStage<T> {
    pub(crate) fn new(inputs: Vec<Arc<Mailbox<T>>>, output: Arc<Mailbox<T>>) -> Self {
        Self {
            inputs,
            outputs: [output],
            held: Mutex::new(None),
        }
    }
}

impl<T: Send + 'static> Stage<T> for MergeStage<T> {
    fn execute_one(&self, core: &ArrowCore, _ctx: &WorkerContext<'_>) -> ExecOutcome {
        let out = &self.outputs[0];
        let mut held = self.held.lock();

        let (msg, from) = match held.take() {
            Some(entry) => entry,
            None => {
                let mut finished = 0;
                let mut popped = None;
                for (idx, input) in self.inputs.iter().enumerate() {
                    match input.try_pop() {
                        Pop::Item(msg) => {
                            popped = Some((msg, idx));
                            break;
                        }
                        Pop::Empty => {}
                        Pop::UpstreamFinished => finished += 1,
                    }
                }
                match popped {
                    Some(entry) => entry,
                    None if finished == self.inputs.len() => {
                        drop(held);
                        return core.finish(&self.outputs, || {});
                    }
                    None => return ExecOutcome::NothingToDo,
                }
            }
        };

        if self.inputs.iter().all(|m| m.is_closed()) {
            core.enter_draining();
        }

        match forward(core, Some(&self.inputs[from]), out, msg) {
            Ok(()) => ExecOutcome::Success,
            Err(Forward::Blocked(msg)) => {
                *held = Some((msg, from));
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
        usize::from(self.held.lock().is_some())
    }
}
