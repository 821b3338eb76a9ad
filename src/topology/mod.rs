mod builder;

pub use builder::{MailboxId, TopologyBuilder};

use crate::arrow::{Arrow, ArrowHandle, ArrowStatus};
use crate::control::ServiceRegistry;
use crate::error::EngineError;
use crate::mailbox::Mailbox;
use crate::scheduler::SchedulerPolicy;
use ahash::AHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Validated, immutable arrow graph. Arrow indices are positions in
/// [`Topology::arrows`].
pub struct Topology<T> {
    arrows: Vec<Arc<Arrow<T>>>,
    mailboxes: Vec<Arc<Mailbox<T>>>,
    downstream: Vec<Vec<usize>>,
    order: Vec<usize>,
    sources: Vec<usize>,
    sinks: Vec<usize>,
    by_name: AHashMap<String, usize>,
    activated: AtomicBool,
    cursor: AtomicUsize,
}

impl<T: Send + 'static> Topology<T> {
    pub(crate) fn new(
        arrows: Vec<Arc<Arrow<T>>>,
        mailboxes: Vec<Arc<Mailbox<T>>>,
        downstream: Vec<Vec<usize>>,
        order: Vec<usize>,
        by_name: AHashMap<String, usize>,
    ) -> Self {
        let sources = arrows
            .iter()
            .filter(|a| a.inputs().is_empty())
            .map(|a| a.index())
            .collect();
        let sinks = arrows
            .iter()
            .filter(|a| a.outputs().is_empty())
            .map(|a| a.index())
            .collect();
        Self {
            arrows,
            mailboxes,
            downstream,
            order,
            sources,
            sinks,
            by_name,
            activated: AtomicBool::new(false),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn arrows(&self) -> &[Arc<Arrow<T>>] {
        &self.arrows
    }

    pub fn arrow(&self, name: &str) -> Option<&Arc<Arrow<T>>> {
        self.by_name.get(name).map(|&i| &self.arrows[i])
    }

    pub fn mailboxes(&self) -> &[Arc<Mailbox<T>>] {
        &self.mailboxes
    }

    pub fn mailbox(&self, id: MailboxId) -> Option<&Arc<Mailbox<T>>> {
        self.mailboxes.get(id.0)
    }

    pub fn mailbox_by_name(&self, name: &str) -> Option<&Arc<Mailbox<T>>> {
        self.mailboxes.iter().find(|m| m.name() == name)
    }

    pub fn sources(&self) -> &[usize] {
        &self.sources
    }

    pub fn sinks(&self) -> &[usize] {
        &self.sinks
    }

    /// Arrow indices, upstream before downstream.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Opens every source and, transitively, everything downstream of them.
    /// Arrows open in breadth-first order from the sources. Runs once.
    pub fn activate_initial_sources(&self, services: &ServiceRegistry) -> Result<(), EngineError> {
        if self.activated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut queue: VecDeque<usize> = self.sources.iter().copied().collect();
        while let Some(idx) = queue.pop_front() {
            let arrow = &self.arrows[idx];
            if arrow.status() != ArrowStatus::Unopened {
                continue;
            }
            arrow.open(services)?;
            queue.extend(self.downstream[idx].iter().copied());
        }
        tracing::info!(
            "[Topology] activated {} arrows from {} sources",
            self.arrows
                .iter()
                .filter(|a| a.status() != ArrowStatus::Unopened)
                .count(),
            self.sources.len()
        );
        Ok(())
    }

    /// Every sink has finished.
    pub fn all_finished(&self) -> bool {
        self.sinks
            .iter()
            .all(|&i| self.arrows[i].status() == ArrowStatus::Finished)
    }

    /// Moves drained arrows to Finished. Returns how many moved.
    pub fn promote_drained(&self) -> usize {
        self.order
            .iter()
            .filter(|&&i| self.arrows[i].try_promote_finished())
            .count()
    }

    /// Records waiting in mailboxes and inside arrows.
    pub fn total_backlog(&self) -> usize {
        self.mailboxes.iter().map(|m| m.depth()).sum::<usize>()
            + self.arrows.iter().map(|a| a.held()).sum::<usize>()
    }

    /// Claims the next arrow `worker_id` should run under the default policy.
    pub fn next_runnable_for(&self, worker_id: usize) -> Option<ArrowHandle<T>> {
        self.select(worker_id, SchedulerPolicy::Backlog)
    }

    /// Claims an eligible arrow. The scan starts at a rotating cursor so
    /// equally loaded arrows take turns.
    pub(crate) fn select(&self, _worker_id: usize, policy: SchedulerPolicy) -> Option<ArrowHandle<T>> {
        let n = self.arrows.len();
        if n == 0 {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        let claimable = |a: &Arc<Arrow<T>>| {
            let shared = a.core().is_parallel() && !a.finish_pending();
            (shared || a.core().active_executors() == 0) && a.is_runnable()
        };
        let in_cursor_order = move || {
            (0..n)
                .map(move |off| &self.arrows[(start + off) % n])
                .filter(move |a| claimable(*a))
        };

        match policy {
            SchedulerPolicy::RoundRobin => in_cursor_order().find_map(ArrowHandle::claim),
            SchedulerPolicy::Backlog => {
                // Strictly greater replaces, so ties keep cursor order.
                let mut best: Option<(usize, &Arc<Arrow<T>>)> = None;
                for a in in_cursor_order() {
                    let backlog = a.backlog();
                    if best.is_none_or(|(b, _)| backlog > b) {
                        best = Some((backlog, a));
                    }
                }
                let (_, best) = best?;
                // Lost the race for the best arrow: take whatever else is free.
                ArrowHandle::claim(best).or_else(|| in_cursor_order().find_map(ArrowHandle::claim))
            }
        }
    }
}
