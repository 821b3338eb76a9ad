use super::{ArrowCore, ExecOutcome, Forward, Stage, WorkerContext, forward};
use crate::control::ServiceRegistry;
use crate::mailbox::{Mailbox, Message, Pop};
use ahash::AHashMap;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Fine-grained parallelism inside one record: a parent is split into
/// sub-records, those are processed independently by any worker, and the
/// results are merged back into the parent.
pub trait SubeventProcessor<T, S>: Send + Sync {
    fn open(&self, _services: &ServiceRegistry) -> anyhow::Result<()> {
        Ok(())
    }

    fn split(&self, parent: &mut T) -> anyhow::Result<Vec<S>>;

    fn process(&self, sub: &mut S) -> anyhow::Result<()>;

    /// `subs` arrive in the order `split` produced them.
    fn merge(&self, parent: &mut T, subs: Vec<S>) -> anyhow::Result<()>;
}

struct SubTask<S> {
    parent_id: u64,
    index: usize,
    data: S,
}

struct Assembly<T, S> {
    parent: Message<T>,
    results: Vec<Option<S>>,
    received: usize,
    failed: Option<anyhow::Error>,
}

pub(crate) struct SubeventStage<T, S> {
    processor: Box<dyn SubeventProcessor<T, S>>,
    inputs: [Arc<Mailbox<T>>; 1],
    outputs: [Arc<Mailbox<T>>; 1],
    tasks: SegQueue<SubTask<S>>,
    assemblies: Mutex<AHashMap<u64, Assembly<T, S>>>,
    /// Merged parents waiting for output capacity.
    ready: Mutex<VecDeque<Message<T>>>,
    next_parent: AtomicU64,
    /// Parents admitted and not yet forwarded or dropped.
    in_flight: AtomicUsize,
    max_in_flight: usize,
}

impl<T: Send + 'static, S: Send + 'static> SubeventStage<T, S> {
    pub(crate) fn new(
        processor: Box<dyn SubeventProcessor<T, S>>,
        input: Arc<Mailbox<T>>,
        output: Arc<Mailbox<T>>,
        max_in_flight: usize,
    ) -> Self {
        Self {
            processor,
            inputs: [input],
            outputs: [output],
            tasks: SegQueue::new(),
            assemblies: Mutex::new(AHashMap::new()),
            ready: Mutex::new(VecDeque::new()),
            next_parent: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: max_in_flight.max(1),
        }
    }

    fn forward_ready(&self, core: &ArrowCore) -> Option<ExecOutcome> {
        let mut ready = self.ready.lock();
        let msg = ready.pop_front()?;
        match forward(core, Some(&self.inputs[0]), &self.outputs[0], msg) {
            Ok(()) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                Some(ExecOutcome::Success)
            }
            Err(Forward::Blocked(msg)) => {
                ready.push_front(msg);
                None
            }
            Err(Forward::Closed(e)) => Some(ExecOutcome::Error(e)),
        }
    }

    /// A parent that will never reach the output.
    fn drop_parent(&self, core: &ArrowCore, parent: &Message<T>, err: anyhow::Error) -> ExecOutcome {
        self.inputs[0].ack_message(parent);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        core.on_user_error(err).unwrap_or(ExecOutcome::Success)
    }

    fn merge_into_ready(
        &self,
        core: &ArrowCore,
        mut parent: Message<T>,
        subs: Vec<S>,
    ) -> ExecOutcome {
        if let Err(e) = self.processor.merge(parent.payload_mut(), subs) {
            return self.drop_parent(core, &parent, e);
        }
        self.ready.lock().push_back(parent);
        ExecOutcome::Success
    }

    fn run_task(&self, core: &ArrowCore, mut task: SubTask<S>) -> ExecOutcome {
        let result = self.processor.process(&mut task.data);

        let mut assemblies = self.assemblies.lock();
        let Some(asm) = assemblies.get_mut(&task.parent_id) else {
            return ExecOutcome::Success;
        };
        match result {
            Ok(()) => asm.results[task.index] = Some(task.data),
            Err(e) => {
                if asm.failed.is_none() {
                    asm.failed = Some(e);
                }
            }
        }
        asm.received += 1;
        if asm.received < asm.results.len() {
            return ExecOutcome::Success;
        }
        let Some(asm) = assemblies.remove(&task.parent_id) else {
            return ExecOutcome::Success;
        };
        drop(assemblies);

        if let Some(e) = asm.failed {
            return self.drop_parent(core, &asm.parent, e);
        }
        let subs = asm.results.into_iter().flatten().collect();
        self.merge_into_ready(core, asm.parent, subs)
    }

    fn admit(&self, core: &ArrowCore, mut parent: Message<T>) -> ExecOutcome {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let subs = match self.processor.split(parent.payload_mut()) {
            Ok(subs) => subs,
            Err(e) => return self.drop_parent(core, &parent, e),
        };
        if subs.is_empty() {
            return self.merge_into_ready(core, parent, Vec::new());
        }

        let parent_id = self.next_parent.fetch_add(1, Ordering::Relaxed);
        let count = subs.len();
        self.assemblies.lock().insert(
            parent_id,
            Assembly {
                parent,
                results: (0..count).map(|_| None).collect(),
                received: 0,
                failed: None,
            },
        );
        for (index, data) in subs.into_iter().enumerate() {
            self.tasks.push(SubTask {
                parent_id,
                index,
                data,
            });
        }
        ExecOutcome::Success
    }
}

impl<T: Send + 'static, S: Send + 'static> Stage<T> for SubeventStage<T, S> {
    fn open(&self, services: &ServiceRegistry) -> anyhow::Result<()> {
        self.processor.open(services)
    }

    fn execute_one(&self, core: &ArrowCore, _ctx: &WorkerContext<'_>) -> ExecOutcome {
        if let Some(outcome) = self.forward_ready(core) {
            return outcome;
        }
        if let Some(task) = self.tasks.pop() {
            return self.run_task(core, task);
        }
        if self.in_flight.load(Ordering::Acquire) >= self.max_in_flight {
            return ExecOutcome::NothingToDo;
        }

        let input = &self.inputs[0];
        match input.try_pop() {
            Pop::Item(msg) => {
                if input.is_closed() {
                    core.enter_draining();
                }
                self.admit(core, msg)
            }
            Pop::Empty => ExecOutcome::NothingToDo,
            Pop::UpstreamFinished => {
                if !core.is_sole_executor() || self.in_flight.load(Ordering::Acquire) > 0 {
                    return ExecOutcome::NothingToDo;
                }
                core.finish(&self.outputs, || {})
            }
        }
    }

    fn inputs(&self) -> &[Arc<Mailbox<T>>] {
        &self.inputs
    }

    fn outputs(&self) -> &[Arc<Mailbox<T>>] {
        &self.outputs
    }

    fn held(&self) -> usize {
        self.ready.lock().len() + self.tasks.len()
    }

    fn backlog(&self) -> usize {
        let admissible = if self.in_flight.load(Ordering::Acquire) < self.max_in_flight {
            self.inputs[0].available()
        } else {
            0
        };
        admissible + self.held()
    }

    fn finish_pending(&self) -> bool {
        self.held() == 0
            && self.in_flight.load(Ordering::Acquire) == 0
            && self.inputs[0].is_drained()
    }

    fn has_work(&self) -> bool {
        if !self.tasks.is_empty() {
            return true;
        }
        if !self.ready.lock().is_empty() && self.outputs[0].has_capacity() {
            return true;
        }
        let in_flight = self.in_flight.load(Ordering::Acquire);
        let input = &self.inputs[0];
        if in_flight == 0 && input.is_drained() {
            return true;
        }
        in_flight < self.max_in_flight && input.available() > 0
    }
}
