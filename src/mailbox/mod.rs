mod message;

pub use message::{Message, Pop};

use crate::error::PushError;
use crate::utils::StopSignal;
use crossbeam::queue::ArrayQueue;
use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxMode {
    #[default]
    Plain,
    Barrier,
}

/// Bounded queue between exactly one producing and one consuming arrow.
///
/// Plain mode is a lock-free ring. Barrier mode is a locked deque that also
/// tracks records popped but not yet acknowledged by the consumer.
pub struct Mailbox<T> {
    name: String,
    capacity: usize,
    closed: CachePadded<AtomicBool>,
    store: Store<T>,
}

enum Store<T> {
    Plain(ArrayQueue<Message<T>>),
    Barrier(Mutex<BarrierQueue<T>>),
}

struct BarrierQueue<T> {
    queue: VecDeque<Message<T>>,
    /// Data records handed to the consumer and not yet acked.
    in_flight: usize,
    /// A barrier was handed out and not yet acked; the gate is down.
    barrier_out: bool,
    /// Number of barriers handed out so far.
    epoch: u64,
}

impl<T> Mailbox<T> {
    pub fn new(name: impl Into<String>, capacity: usize, mode: MailboxMode) -> Self {
        let capacity = capacity.max(1);
        let store = match mode {
            MailboxMode::Plain => Store::Plain(ArrayQueue::new(capacity)),
            MailboxMode::Barrier => Store::Barrier(Mutex::new(BarrierQueue {
                queue: VecDeque::with_capacity(capacity),
                in_flight: 0,
                barrier_out: false,
                epoch: 0,
            })),
        };
        Self {
            name: name.into(),
            capacity,
            closed: CachePadded::new(AtomicBool::new(false)),
            store,
        }
    }

    pub fn plain(name: impl Into<String>, capacity: usize) -> Self {
        Self::new(name, capacity, MailboxMode::Plain)
    }

    pub fn barrier(name: impl Into<String>, capacity: usize) -> Self {
        Self::new(name, capacity, MailboxMode::Barrier)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mode(&self) -> MailboxMode {
        match self.store {
            Store::Plain(_) => MailboxMode::Plain,
            Store::Barrier(_) => MailboxMode::Barrier,
        }
    }

    /// Non-blocking push. On failure the message comes back inside the error.
    pub fn try_push(&self, msg: Message<T>) -> Result<(), PushError<Message<T>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PushError::closed(msg));
        }
        match &self.store {
            Store::Plain(q) => q.push(msg).map_err(PushError::full),
            Store::Barrier(lock) => {
                let mut q = lock.lock();
                if q.queue.len() >= self.capacity {
                    return Err(PushError::full(msg));
                }
                // A barrier waits until the current epoch has been picked up.
                if msg.is_barrier() && matches!(q.queue.back(), Some(prev) if !prev.is_barrier()) {
                    return Err(PushError::full(msg));
                }
                q.queue.push_back(msg);
                Ok(())
            }
        }
    }

    /// Cooperative push for producers living outside the engine.
    pub fn push(
        &self,
        mut msg: Message<T>,
        stop: &StopSignal,
        timeout: Option<Duration>,
    ) -> Result<(), PushError<Message<T>>> {
        let start = Instant::now();
        let backoff = Backoff::new();
        let mut spins: u32 = 0;

        loop {
            match self.try_push(msg) {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_full() => return Err(e),
                Err(e) => msg = e.into_inner(),
            }
            if stop.is_triggered() || timeout.is_some_and(|t| start.elapsed() >= t) {
                return Err(PushError::full(msg));
            }
            spins = spins.saturating_add(1);
            if spins < 64 {
                backoff.spin();
            } else if spins < 256 {
                backoff.snooze();
            } else {
                thread::sleep(Duration::from_micros(2));
            }
        }
    }

    pub fn try_pop(&self) -> Pop<T> {
        // Read before popping: a push can never follow the close.
        let closed = self.closed.load(Ordering::Acquire);
        match &self.store {
            Store::Plain(q) => match q.pop() {
                Some(m) => Pop::Item(m),
                None if closed => Pop::UpstreamFinished,
                None => Pop::Empty,
            },
            Store::Barrier(lock) => {
                let mut q = lock.lock();
                if q.barrier_out {
                    return Pop::Empty;
                }
                let front_is_barrier = match q.queue.front() {
                    None if closed => return Pop::UpstreamFinished,
                    None => return Pop::Empty,
                    Some(m) => m.is_barrier(),
                };
                if front_is_barrier {
                    if q.in_flight > 0 {
                        return Pop::Empty;
                    }
                    q.barrier_out = true;
                    q.epoch += 1;
                } else {
                    q.in_flight += 1;
                }
                match q.queue.pop_front() {
                    Some(m) => Pop::Item(m),
                    None => Pop::Empty,
                }
            }
        }
    }

    /// Consumer-side acknowledgement that a popped message has left the
    /// consuming arrow. Required in barrier mode, a no-op in plain mode.
    pub fn ack(&self, barrier: bool) {
        if let Store::Barrier(lock) = &self.store {
            let mut q = lock.lock();
            if barrier {
                q.barrier_out = false;
            } else {
                q.in_flight = q.in_flight.saturating_sub(1);
            }
        }
    }

    #[inline]
    pub fn ack_message(&self, msg: &Message<T>) {
        self.ack(msg.is_barrier());
    }

    /// Pops up to `max` messages that are available right now.
    ///
    /// Messages taken from a barrier mailbox must still be acked.
    pub fn drain(&self, max: usize) -> Vec<Message<T>> {
        let mut out = Vec::with_capacity(max.min(self.capacity));
        while out.len() < max {
            match self.try_pop() {
                Pop::Item(m) => out.push(m),
                Pop::Empty | Pop::UpstreamFinished => break,
            }
        }
        out
    }

    /// Producer-side end-of-stream. Idempotent.
    #[inline]
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn depth(&self) -> usize {
        match &self.store {
            Store::Plain(q) => q.len(),
            Store::Barrier(lock) => lock.lock().queue.len(),
        }
    }

    #[inline]
    pub fn has_capacity(&self) -> bool {
        self.depth() < self.capacity
    }

    /// Messages a pop could hand out right now. Zero while a barrier gate is
    /// down or a queued barrier is waiting for in-flight records.
    pub fn available(&self) -> usize {
        match &self.store {
            Store::Plain(q) => q.len(),
            Store::Barrier(lock) => {
                let q = lock.lock();
                if q.barrier_out {
                    return 0;
                }
                match q.queue.front() {
                    Some(m) if m.is_barrier() && q.in_flight > 0 => 0,
                    _ => q.queue.len(),
                }
            }
        }
    }

    /// Closed and nothing left to pop.
    #[inline]
    pub fn is_drained(&self) -> bool {
        self.is_closed() && self.depth() == 0
    }

    /// Barriers handed out so far. Always zero in plain mode.
    pub fn epoch(&self) -> u64 {
        match &self.store {
            Store::Plain(_) => 0,
            Store::Barrier(lock) => lock.lock().epoch,
        }
    }

    pub fn snapshot(&self) -> MailboxSnapshot {
        MailboxSnapshot {
            name: self.name.clone(),
            mode: self.mode(),
            depth: self.depth(),
            capacity: self.capacity,
            closed: self.is_closed(),
        }
    }
}

impl<T> fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .field("depth", &self.depth())
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxSnapshot {
    pub name: String,
    pub mode: MailboxMode,
    pub depth: usize,
    pub capacity: usize,
    pub closed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PushFailReason;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn data(v: u32) -> Message<u32> {
        Message::Data(v)
    }

    #[test]
    fn plain_rejects_when_full_and_returns_value() {
        let mb = Mailbox::plain("q", 2);
        mb.try_push(data(1)).expect("first push");
        mb.try_push(data(2)).expect("second push");
        let err = mb.try_push(data(3)).expect_err("must be full");
        assert_eq!(err.reason, PushFailReason::Full);
        assert_eq!(err.into_inner(), data(3));
        assert!(!mb.has_capacity());
    }

    #[test]
    fn close_then_drain_reports_upstream_finished() {
        let mb = Mailbox::plain("q", 4);
        mb.try_push(data(1)).expect("push");
        mb.close();
        let err = mb.try_push(data(2)).expect_err("closed");
        assert_eq!(err.reason, PushFailReason::Closed);
        assert_eq!(mb.try_pop(), Pop::Item(data(1)));
        assert_eq!(mb.try_pop(), Pop::UpstreamFinished);
        assert!(mb.is_drained());
    }

    #[test]
    fn empty_open_mailbox_reports_empty() {
        let mb: Mailbox<u32> = Mailbox::barrier("q", 4);
        assert_eq!(mb.try_pop(), Pop::Empty);
        mb.close();
        assert_eq!(mb.try_pop(), Pop::UpstreamFinished);
    }

    #[test]
    fn barrier_push_waits_for_current_epoch() {
        let mb = Mailbox::barrier("q", 8);
        mb.try_push(data(1)).expect("push");
        let err = mb
            .try_push(Message::Barrier(100))
            .expect_err("barrier behind queued data");
        assert!(err.is_full());

        assert!(mb.try_pop().is_item());
        mb.try_push(Message::Barrier(100)).expect("queue empty now");
    }

    #[test]
    fn barrier_pops_only_after_prior_records_acked() {
        let mb = Mailbox::barrier("q", 8);
        mb.try_push(data(1)).expect("push");
        assert_eq!(mb.try_pop(), Pop::Item(data(1)));
        mb.try_push(Message::Barrier(100)).expect("barrier");
        mb.try_push(data(2)).expect("after barrier");

        assert_eq!(mb.try_pop(), Pop::Empty);
        assert_eq!(mb.available(), 0);

        mb.ack(false);
        assert_eq!(mb.try_pop(), Pop::Item(Message::Barrier(100)));
        assert_eq!(mb.epoch(), 1);

        // Gate stays down until the barrier itself is acked.
        assert_eq!(mb.try_pop(), Pop::Empty);
        mb.ack(true);
        assert_eq!(mb.try_pop(), Pop::Item(data(2)));
    }

    #[test]
    fn cooperative_push_times_out_when_full() {
        let mb = Mailbox::plain("q", 1);
        let stop = StopSignal::new();
        mb.try_push(data(1)).expect("push");
        let err = mb
            .push(data(2), &stop, Some(Duration::from_millis(10)))
            .expect_err("still full");
        assert_eq!(err.into_inner(), data(2));
    }

    #[test]
    fn single_producer_fifo_across_threads() {
        let mb = Arc::new(Mailbox::plain("q", 16));
        let producer = {
            let mb = mb.clone();
            thread::spawn(move || {
                let stop = StopSignal::new();
                for i in 0..10_000u32 {
                    mb.push(data(i), &stop, None).expect("push");
                }
                mb.close();
            })
        };

        let mut expected = 0u32;
        loop {
            match mb.try_pop() {
                Pop::Item(m) => {
                    assert_eq!(m.into_payload(), expected);
                    expected += 1;
                }
                Pop::Empty => thread::yield_now(),
                Pop::UpstreamFinished => break,
            }
        }
        producer.join().expect("producer");
        assert_eq!(expected, 10_000);
    }

    proptest! {
        #[test]
        fn barrier_never_overtakes_unacked_records(ops in proptest::collection::vec(0u8..4, 1..200)) {
            let mb = Mailbox::barrier("q", 4);
            let mut next = 0u32;
            let mut unacked_data = 0usize;
            let mut barrier_out = false;

            for op in ops {
                match op {
                    0 => { let _ = mb.try_push(data(next)); next += 1; }
                    1 => { let _ = mb.try_push(Message::Barrier(next)); next += 1; }
                    2 => match mb.try_pop() {
                        Pop::Item(m) if m.is_barrier() => {
                            prop_assert_eq!(unacked_data, 0);
                            prop_assert!(!barrier_out);
                            barrier_out = true;
                        }
                        Pop::Item(_) => {
                            prop_assert!(!barrier_out);
                            unacked_data += 1;
                        }
                        _ => {}
                    },
                    _ => {
                        if barrier_out {
                            mb.ack(true);
                            barrier_out = false;
                        } else if unacked_data > 0 {
                            mb.ack(false);
                            unacked_data -= 1;
                        }
                    }
                }
                prop_assert!(mb.depth() <= mb.capacity());
            }
        }
    }
}
