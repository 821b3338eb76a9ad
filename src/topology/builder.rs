use super::Topology;
use crate::arrow::{
    Arrow, ArrowCore, ArrowKind, MergeStage, ParallelProcessor, ProcessorLogic, ProcessorStage,
    RecordProcessor, RecordSource, SourceStage, SplitStage, Stage, SubeventProcessor,
    SubeventStage,
};
use crate::config::EngineConfig;
use crate::error::TopologyError;
use crate::mailbox::{Mailbox, MailboxMode};
use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Handle to a mailbox declared on a [`TopologyBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MailboxId(pub(crate) usize);

struct PendingArrow<T> {
    name: String,
    kind: ArrowKind,
    parallel: bool,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
    stage: Box<dyn Stage<T>>,
}

/// Declares mailboxes and arrows, then validates the graph in [`Self::build`].
///
/// Wiring mistakes do not panic: they are collected and the first one is
/// returned by `build`.
pub struct TopologyBuilder<T> {
    default_capacity: usize,
    subevent_max_in_flight: usize,
    mailboxes: Vec<Arc<Mailbox<T>>>,
    arrows: Vec<PendingArrow<T>>,
    errors: Vec<TopologyError>,
}

impl<T: Send + 'static> Default for TopologyBuilder<T> {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl<T: Send + 'static> TopologyBuilder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            default_capacity: cfg.mailbox_capacity,
            subevent_max_in_flight: cfg.subevent_max_in_flight,
            mailboxes: Vec::new(),
            arrows: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn with_default_capacity(mut self, capacity: usize) -> Self {
        self.default_capacity = capacity;
        self
    }

    pub fn mailbox(&mut self, name: impl Into<String>) -> MailboxId {
        self.add_mailbox(name.into(), self.default_capacity, MailboxMode::Plain)
    }

    pub fn mailbox_with_capacity(&mut self, name: impl Into<String>, capacity: usize) -> MailboxId {
        self.add_mailbox(name.into(), capacity, MailboxMode::Plain)
    }

    /// Mailbox that keeps barrier records ordered against everything else.
    pub fn barrier_mailbox(&mut self, name: impl Into<String>, capacity: usize) -> MailboxId {
        self.add_mailbox(name.into(), capacity, MailboxMode::Barrier)
    }

    pub fn source(
        &mut self,
        name: impl Into<String>,
        source: impl RecordSource<T> + 'static,
        output: MailboxId,
    ) -> &mut Self {
        self.add_source(name.into(), Box::new(source), output, None)
    }

    /// Source that ends after `limit` records even if more are available.
    pub fn source_with_limit(
        &mut self,
        name: impl Into<String>,
        source: impl RecordSource<T> + 'static,
        output: MailboxId,
        limit: u64,
    ) -> &mut Self {
        self.add_source(name.into(), Box::new(source), output, Some(limit))
    }

    pub fn processor(
        &mut self,
        name: impl Into<String>,
        processor: impl RecordProcessor<T> + 'static,
        input: MailboxId,
        output: MailboxId,
    ) -> &mut Self {
        let logic = ProcessorLogic::Sequential(Mutex::new(Box::new(processor)));
        self.add_processor(name.into(), logic, input, Some(output))
    }

    pub fn parallel_processor(
        &mut self,
        name: impl Into<String>,
        processor: impl ParallelProcessor<T> + 'static,
        input: MailboxId,
        output: MailboxId,
    ) -> &mut Self {
        let logic = ProcessorLogic::Parallel(Box::new(processor));
        self.add_processor(name.into(), logic, input, Some(output))
    }

    pub fn sink(
        &mut self,
        name: impl Into<String>,
        sink: impl RecordProcessor<T> + 'static,
        input: MailboxId,
    ) -> &mut Self {
        let logic = ProcessorLogic::Sequential(Mutex::new(Box::new(sink)));
        self.add_processor(name.into(), logic, input, None)
    }

    pub fn parallel_sink(
        &mut self,
        name: impl Into<String>,
        sink: impl ParallelProcessor<T> + 'static,
        input: MailboxId,
    ) -> &mut Self {
        let logic = ProcessorLogic::Parallel(Box::new(sink));
        self.add_processor(name.into(), logic, input, None)
    }

    pub fn merge(&mut self, name: impl Into<String>, inputs: &[MailboxId], output: MailboxId) -> &mut Self {
        let name = name.into();
        let (Some(ins), Some(out)) = (self.resolve_all(inputs), self.resolve(output)) else {
            return self;
        };
        if ins.is_empty() {
            self.errors.push(TopologyError::Unwired(name));
            return self;
        }
        let stage = MergeStage::new(ins, out);
        self.push_arrow(
            name,
            ArrowKind::Merge,
            false,
            inputs.iter().map(|m| m.0).collect(),
            vec![output.0],
            Box::new(stage),
        )
    }

    /// `route` picks the output index for each record. An index past the end
    /// drops the record and counts a transient error.
    pub fn split(
        &mut self,
        name: impl Into<String>,
        input: MailboxId,
        outputs: &[MailboxId],
        route: impl Fn(&T) -> usize + Send + Sync + 'static,
    ) -> &mut Self {
        let name = name.into();
        let (Some(inp), Some(outs)) = (self.resolve(input), self.resolve_all(outputs)) else {
            return self;
        };
        if outs.is_empty() {
            self.errors.push(TopologyError::Unwired(name));
            return self;
        }
        let stage = SplitStage::new(Box::new(route), inp, outs);
        self.push_arrow(
            name,
            ArrowKind::Split,
            false,
            vec![input.0],
            outputs.iter().map(|m| m.0).collect(),
            Box::new(stage),
        )
    }

    pub fn subevent<S: Send + 'static>(
        &mut self,
        name: impl Into<String>,
        processor: impl SubeventProcessor<T, S> + 'static,
        input: MailboxId,
        output: MailboxId,
    ) -> &mut Self {
        let max_in_flight = self.subevent_max_in_flight;
        self.subevent_with_window(name, processor, input, output, max_in_flight)
    }

    /// Like [`Self::subevent`] with an explicit bound on parents in flight.
    pub fn subevent_with_window<S: Send + 'static>(
        &mut self,
        name: impl Into<String>,
        processor: impl SubeventProcessor<T, S> + 'static,
        input: MailboxId,
        output: MailboxId,
        max_in_flight: usize,
    ) -> &mut Self {
        let (Some(inp), Some(out)) = (self.resolve(input), self.resolve(output)) else {
            return self;
        };
        let stage = SubeventStage::new(Box::new(processor), inp, out, max_in_flight);
        self.push_arrow(
            name.into(),
            ArrowKind::Subevent,
            true,
            vec![input.0],
            vec![output.0],
            Box::new(stage),
        )
    }

    /// Validates the graph and freezes it.
    pub fn build(self) -> Result<Topology<T>, TopologyError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }
        if self.arrows.is_empty() {
            return Err(TopologyError::Empty);
        }
        if !self.arrows.iter().any(|a| a.kind == ArrowKind::Source) {
            return Err(TopologyError::NoSource);
        }

        let mut names = AHashSet::with_capacity(self.arrows.len());
        for a in &self.arrows {
            if !names.insert(a.name.as_str()) {
                return Err(TopologyError::DuplicateName(a.name.clone()));
            }
        }

        let n_mailboxes = self.mailboxes.len();
        let mut producer: Vec<Option<usize>> = vec![None; n_mailboxes];
        let mut consumer: Vec<Option<usize>> = vec![None; n_mailboxes];
        for (idx, a) in self.arrows.iter().enumerate() {
            let mut seen = AHashSet::new();
            for &m in a.inputs.iter().chain(a.outputs.iter()) {
                if !seen.insert(m) {
                    return Err(TopologyError::SelfLoop {
                        arrow: a.name.clone(),
                        mailbox: self.mailboxes[m].name().to_string(),
                    });
                }
            }
            for &m in &a.outputs {
                if let Some(first) = producer[m].replace(idx) {
                    return Err(TopologyError::MultipleProducers {
                        mailbox: self.mailboxes[m].name().to_string(),
                        first: self.arrows[first].name.clone(),
                        second: a.name.clone(),
                    });
                }
            }
            for &m in &a.inputs {
                if let Some(first) = consumer[m].replace(idx) {
                    return Err(TopologyError::MultipleConsumers {
                        mailbox: self.mailboxes[m].name().to_string(),
                        first: self.arrows[first].name.clone(),
                        second: a.name.clone(),
                    });
                }
            }
        }

        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); self.arrows.len()];
        for m in 0..n_mailboxes {
            let name = self.mailboxes[m].name();
            let (Some(p), Some(c)) = (producer[m], consumer[m]) else {
                return Err(match producer[m] {
                    None => TopologyError::NoProducer(name.to_string()),
                    Some(_) => TopologyError::NoConsumer(name.to_string()),
                });
            };
            downstream[p].push(c);
        }

        let order = topological_order(&downstream).map_err(|stuck| {
            TopologyError::Cycle(stuck.into_iter().map(|i| self.arrows[i].name.clone()).collect())
        })?;

        let arrows: Vec<Arc<Arrow<T>>> = self
            .arrows
            .into_iter()
            .enumerate()
            .map(|(index, p)| {
                let core = ArrowCore::new(p.name, index, p.kind, p.parallel);
                Arc::new(Arrow::new(core, p.stage))
            })
            .collect();

        let by_name: AHashMap<String, usize> = arrows
            .iter()
            .map(|a| (a.name().to_string(), a.index()))
            .collect();

        tracing::debug!(
            "[Topology] built {} arrows over {} mailboxes",
            arrows.len(),
            n_mailboxes
        );

        Ok(Topology::new(arrows, self.mailboxes, downstream, order, by_name))
    }

    fn add_mailbox(&mut self, name: String, capacity: usize, mode: MailboxMode) -> MailboxId {
        let id = MailboxId(self.mailboxes.len());
        self.mailboxes.push(Arc::new(Mailbox::new(name, capacity, mode)));
        id
    }

    fn resolve(&mut self, id: MailboxId) -> Option<Arc<Mailbox<T>>> {
        match self.mailboxes.get(id.0) {
            Some(m) => Some(Arc::clone(m)),
            None => {
                self.errors.push(TopologyError::UnknownMailbox(id.0));
                None
            }
        }
    }

    fn resolve_all(&mut self, ids: &[MailboxId]) -> Option<Vec<Arc<Mailbox<T>>>> {
        ids.iter().map(|&id| self.resolve(id)).collect()
    }

    fn add_source(
        &mut self,
        name: String,
        source: Box<dyn RecordSource<T>>,
        output: MailboxId,
        limit: Option<u64>,
    ) -> &mut Self {
        let Some(out) = self.resolve(output) else {
            return self;
        };
        let stage = SourceStage::new(source, out, limit);
        self.push_arrow(name, ArrowKind::Source, false, Vec::new(), vec![output.0], Box::new(stage))
    }

    fn add_processor(
        &mut self,
        name: String,
        logic: ProcessorLogic<T>,
        input: MailboxId,
        output: Option<MailboxId>,
    ) -> &mut Self {
        let Some(inp) = self.resolve(input) else {
            return self;
        };
        let out = match output {
            Some(id) => match self.resolve(id) {
                Some(m) => Some(m),
                None => return self,
            },
            None => None,
        };
        let kind = if output.is_some() {
            ArrowKind::Processor
        } else {
            ArrowKind::Sink
        };
        let parallel = logic.is_parallel();
        let stage = ProcessorStage::new(logic, inp, out);
        self.push_arrow(
            name,
            kind,
            parallel,
            vec![input.0],
            output.map(|m| m.0).into_iter().collect(),
            Box::new(stage),
        )
    }

    fn push_arrow(
        &mut self,
        name: String,
        kind: ArrowKind,
        parallel: bool,
        inputs: Vec<usize>,
        outputs: Vec<usize>,
        stage: Box<dyn Stage<T>>,
    ) -> &mut Self {
        self.arrows.push(PendingArrow {
            name,
            kind,
            parallel,
            inputs,
            outputs,
            stage,
        });
        self
    }
}

/// Kahn's algorithm over the arrow graph. On a cycle, returns the arrows
/// that could not be ordered.
fn topological_order(downstream: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
    let n = downstream.len();
    let mut in_degree = vec![0usize; n];
    for targets in downstream {
        for &t in targets {
            in_degree[t] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &t in &downstream[i] {
            in_degree[t] -= 1;
            if in_degree[t] == 0 {
                queue.push_back(t);
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        Err((0..n).filter(|&i| in_degree[i] > 0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrow::{Emit, IterSource};

    fn passthrough(_: &mut u32) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn linear_pipeline_builds_in_order() {
        let mut b = TopologyBuilder::<u32>::new();
        let q1 = b.mailbox("q1");
        let q2 = b.mailbox("q2");
        b.source("src", IterSource::new(0..10u32), q1)
            .processor("double", passthrough, q1, q2)
            .sink("sink", passthrough, q2);
        let topo = b.build().expect("valid topology");

        assert_eq!(topo.arrows().len(), 3);
        assert_eq!(topo.sources(), &[0]);
        assert_eq!(topo.sinks(), &[2]);
        assert_eq!(topo.order(), &[0, 1, 2]);
        assert_eq!(topo.arrow("double").map(|a| a.kind()), Some(ArrowKind::Processor));
    }

    #[test]
    fn no_source_is_rejected() {
        let mut b = TopologyBuilder::<u32>::new();
        let q = b.mailbox("q");
        b.sink("sink", passthrough, q);
        assert_eq!(b.build().err(), Some(TopologyError::NoSource));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut b = TopologyBuilder::<u32>::new();
        let q1 = b.mailbox("q1");
        let q2 = b.mailbox("q2");
        b.source("a", IterSource::new(0..1u32), q1)
            .processor("a", passthrough, q1, q2)
            .sink("s", passthrough, q2);
        assert_eq!(b.build().err(), Some(TopologyError::DuplicateName("a".into())));
    }

    #[test]
    fn shared_consumer_is_rejected() {
        let mut b = TopologyBuilder::<u32>::new();
        let q = b.mailbox("q");
        b.source("src", IterSource::new(0..1u32), q)
            .sink("s1", passthrough, q)
            .sink("s2", passthrough, q);
        assert!(matches!(
            b.build(),
            Err(TopologyError::MultipleConsumers { .. })
        ));
    }

    #[test]
    fn dangling_mailbox_is_rejected() {
        let mut b = TopologyBuilder::<u32>::new();
        let q = b.mailbox("q");
        let _orphan = b.mailbox("orphan");
        b.source("src", IterSource::new(0..1u32), q)
            .sink("s", passthrough, q);
        assert_eq!(b.build().err(), Some(TopologyError::NoProducer("orphan".into())));
    }

    #[test]
    fn unknown_mailbox_is_reported() {
        let mut b = TopologyBuilder::<u32>::new();
        let q = b.mailbox("q");
        b.source("src", IterSource::new(0..1u32), q)
            .sink("s", passthrough, MailboxId(9));
        assert_eq!(b.build().err(), Some(TopologyError::UnknownMailbox(9)));
    }

    #[test]
    fn cycle_is_rejected() {
        let mut b = TopologyBuilder::<u32>::new();
        let a = b.mailbox("a");
        let fwd = b.mailbox("fwd");
        let back = b.mailbox("back");
        let out = b.mailbox("out");
        b.source("src", || Emit::<u32>::EndOfStream, a)
            .merge("join", &[a, back], fwd)
            .split("fork", fwd, &[back, out], |v: &u32| (*v % 2) as usize)
            .sink("sink", passthrough, out);
        match b.build() {
            Err(TopologyError::Cycle(names)) => {
                assert!(names.contains(&"join".to_string()));
                assert!(names.contains(&"fork".to_string()));
                assert!(!names.contains(&"src".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other.err()),
        }
    }

    #[test]
    fn kahn_orders_diamond() {
        let downstream = vec![vec![1, 2], vec![3], vec![3], vec![]];
        let order = topological_order(&downstream).expect("acyclic");
        assert_eq!(order.first(), Some(&0));
        assert_eq!(order.last(), Some(&3));
    }
}
