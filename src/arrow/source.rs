use super::{ArrowCore, ExecOutcome, Forward, Stage, WorkerContext, forward};
use crate::control::ServiceRegistry;
use crate::mailbox::{Mailbox, Message};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// What a source produced on one call.
#[derive(Debug)]
pub enum Emit<T> {
    Record(T),
    /// A checkpoint record; barrier mailboxes order everything around it.
    Barrier(T),
    /// Nothing right now, ask again later.
    NotReady,
    EndOfStream,
    /// This attempt failed; the source is asked again on a later turn.
    TransientError(anyhow::Error),
}

/// User-supplied record producer. Never called concurrently.
pub trait RecordSource<T>: Send {
    fn open(&mut self, _services: &ServiceRegistry) -> anyhow::Result<()> {
        Ok(())
    }

    fn produce_next(&mut self) -> Emit<T>;

    /// Called once after end of stream or the record limit.
    fn close(&mut self) {}
}

impl<T, F> RecordSource<T> for F
where
    F: FnMut() -> Emit<T> + Send,
{
    fn produce_next(&mut self) -> Emit<T> {
        self()
    }
}

/// Source backed by an iterator; ends when the iterator does.
pub struct IterSource<I>(I);

impl<I> IterSource<I> {
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self(iter.into_iter())
    }
}

impl<T, I> RecordSource<T> for IterSource<I>
where
    I: Iterator<Item = T> + Send,
{
    fn produce_next(&mut self) -> Emit<T> {
        match self.0.next() {
            Some(v) => Emit::Record(v),
            None => Emit::EndOfStream,
        }
    }
}

pub(crate) struct SourceStage<T> {
    source: Mutex<Box<dyn RecordSource<T>>>,
    /// Produced record waiting for output capacity.
    held: Mutex<Option<Message<T>>>,
    outputs: [Arc<Mailbox<T>>; 1],
    limit: Option<u64>,
    emitted: AtomicU64,
}

impl<T: Send + 'static> SourceStage<T> {
    pub(crate) fn new(
        source: Box<dyn RecordSource<T>>,
        output: Arc<Mailbox<T>>,
        limit: Option<u64>,
    ) -> Self {
        Self {
            source: Mutex::new(source),
            held: Mutex::new(None),
            outputs: [output],
            limit,
            emitted: AtomicU64::new(0),
        }
    }

    fn end_of_stream(&self, core: &ArrowCore) -> ExecOutcome {
        let emitted = self.emitted.load(Ordering::Relaxed);
        core.finish(&self.outputs, || self.source.lock().close());
        tracing::info!("[Source] '{}' reached end of stream after {emitted} records", core.name());
        ExecOutcome::Finished
    }
}

impl<T: Send + 'static> Stage<T> for SourceStage<T> {
    fn open(&self, services: &ServiceRegistry) -> anyhow::Result<()> {
        self.source.lock().open(services)
    }

    fn execute_one(&self, core: &ArrowCore, _ctx: &WorkerContext<'_>) -> ExecOutcome {
        let out = &self.outputs[0];
        let mut held = self.held.lock();

        if let Some(msg) = held.take() {
            return match forward(core, None, out, msg) {
                Ok(()) => ExecOutcome::Success,
                Err(Forward::Blocked(msg)) => {
                    *held = Some(msg);
                    ExecOutcome::NothingToDo
                }
                Err(Forward::Closed(e)) => ExecOutcome::Error(e),
            };
        }

        if self
            .limit
            .is_some_and(|limit| self.emitted.load(Ordering::Relaxed) >= limit)
        {
            drop(held);
            return self.end_of_stream(core);
        }

        let emitted = self.source.lock().produce_next();
        let msg = match emitted {
            Emit::Record(v) => Message::Data(v),
            Emit::Barrier(v) => Message::Barrier(v),
            Emit::NotReady => return ExecOutcome::NothingToDo,
            Emit::TransientError(e) => {
                return match core.on_user_error(e) {
                    Some(fatal) => fatal,
                    None => ExecOutcome::Success,
                };
            }
            Emit::EndOfStream => {
                drop(held);
                return self.end_of_stream(core);
            }
        };
        self.emitted.fetch_add(1, Ordering::Relaxed);

        match forward(core, None, out, msg) {
            Ok(()) => ExecOutcome::Success,
            Err(Forward::Blocked(msg)) => {
                *held = Some(msg);
                ExecOutcome::Success
            }
            Err(Forward::Closed(e)) => ExecOutcome::Error(e),
        }
    }

    fn inputs(&self) -> &[Arc<Mailbox<T>>] {
        &[]
    }

    fn outputs(&self) -> &[Arc<Mailbox<T>>] {
        &self.outputs
    }

    fn held(&self) -> usize {
        usize::from(self.held.lock().is_some())
    }

    fn backlog(&self) -> usize {
        0
    }

    fn has_work(&self) -> bool {
        self.outputs[0].has_capacity()
    }
}
