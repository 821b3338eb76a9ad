use super::{ArrowCore, ExecOutcome, Forward, Stage, WorkerContext, forward};
use crate::mailbox::{Mailbox, Message, Pop};
use parking_lot::Mutex;
use std::sync::Arc;

pub(crate) type Route<T> = Box<dyn Fn(&T) -> usize + Send + Sync>;

/// Fan-out: each record goes to the output picked by the routing function.
pub(crate) struct SplitStage<T> {
    route: Route<T>,
    inputs: [Arc<Mailbox<T>>; 1],
    outputs: Vec<Arc<Mailbox<T>>>,
    /// Blocked record and its target output. Later records wait behind it.
    held: Mutex<Option<(Message<T>, usize)>>,
}

impl<T: Send + 'static> SplitStage<T> {
    pub(crate) fn new(route: Route<T>, input: Arc<Mailbox<T>>, outputs: Vec<Arc<Mailbox<T>>>) -> Self {
        Self {
            route,
            inputs: [input],
            outputs,
            held: Mutex::new(None),
        }
    }
}

impl<T: Send + 'static> Stage<T> for SplitStage<T> {
    fn execute_one(&self, core: &ArrowCore, _ctx: &WorkerContext<'_>) -> ExecOutcome {
        let input = &self.inputs[0];
        let mut held = self.held.lock();

        let (msg, target) = match held.take() {
            Some(entry) => entry,
            None => {
                let msg = match input.try_pop() {
                    Pop::Item(msg) => msg,
                    Pop::Empty => return ExecOutcome::NothingToDo,
                    Pop::UpstreamFinished => {
                        drop(held);
                        return core.finish(&self.outputs, || {});
                    }
                };
                if input.is_closed() {
                    core.enter_draining();
                }
                let target = (self.route)(msg.payload());
                if target >= self.outputs.len() {
                    input.ack_message(&msg);
                    core.record_transient(&anyhow::anyhow!(
                        "route returned output {target}, only {} outputs",
                        self.outputs.len()
                    ));
                    return ExecOutcome::Success;
                }
                (msg, target)
            }
        };

        match forward(core, Some(input), &self.outputs[target], msg) {
            Ok(()) => ExecOutcome::Success,
            Err(Forward::Blocked(msg)) => {
                *held = Some((msg, target));
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

    fn has_work(&self) -> bool {
        if let Some((_, target)) = self.held.lock().as_ref() {
            return self.outputs[*target].has_capacity();
        }
        let input = &self.inputs[0];
        input.is_drained() || (input.available() > 0 && super::can_push(&self.outputs))
    }
}
