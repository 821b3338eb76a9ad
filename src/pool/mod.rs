use crate::error::PoolError;
use crate::utils::StopSignal;
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Slots the pool may grow to. Checkouts beyond it fail with
    /// [`PoolError::CapacityExceeded`].
    pub soft_limit: usize,
    /// Items created up front.
    pub prefill: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            soft_limit: 256,
            prefill: 0,
        }
    }
}

/// Identifies one checkout of one slot. Stale or foreign tickets are rejected
/// at checkin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolTicket {
    pool_id: u64,
    slot: usize,
    generation: u64,
}

impl PoolTicket {
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct Slot<T> {
    item: Option<T>,
    generation: u64,
    checked_out: bool,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type Reset<T> = Box<dyn Fn(&mut T) + Send + Sync>;

struct PoolShared<T> {
    id: u64,
    soft_limit: usize,
    slots: Mutex<Slots<T>>,
    factory: Factory<T>,
    reset: Reset<T>,
}

/// Thread-safe recycling pool for expensive-to-build records.
///
/// Checkout hands out a move-only [`Pooled`] handle; dropping it returns the
/// item. Items are reset before they become available again.
pub struct ResourcePool<T> {
    shared: Arc<PoolShared<T>>,
}

impl<T> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> ResourcePool<T> {
    pub fn new(
        cfg: PoolConfig,
        factory: impl Fn() -> T + Send + Sync + 'static,
        reset: impl Fn(&mut T) + Send + Sync + 'static,
    ) -> Self {
        let pool = Self {
            shared: Arc::new(PoolShared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                soft_limit: cfg.soft_limit.max(1),
                slots: Mutex::new(Slots {
                    slots: Vec::new(),
                    free: Vec::new(),
                }),
                factory: Box::new(factory),
                reset: Box::new(reset),
            }),
        };
        pool.prefill(cfg.prefill);
        pool
    }

    /// Pool whose items are rebuilt with `Default` on reset.
    pub fn with_default(cfg: PoolConfig) -> Self
    where
        T: Default,
    {
        Self::new(cfg, T::default, |item: &mut T| *item = T::default())
    }

    /// Creates free items until `n` slots exist (bounded by the soft limit).
    pub fn prefill(&self, n: usize) -> usize {
        let target = n.min(self.shared.soft_limit);
        let mut created = 0;
        let mut s = self.shared.slots.lock();
        while s.slots.len() < target {
            let idx = s.slots.len();
            s.slots.push(Slot {
                item: Some((self.shared.factory)()),
                generation: 0,
                checked_out: false,
            });
            s.free.push(idx);
            created += 1;
        }
        created
    }

    pub fn try_checkout(&self) -> Result<Pooled<T>, PoolError> {
        let shared = &self.shared;
        let mut s = shared.slots.lock();

        if let Some(idx) = s.free.pop() {
            let slot = &mut s.slots[idx];
            slot.checked_out = true;
            slot.generation += 1;
            let generation = slot.generation;
            let recycled = slot.item.take();
            drop(s);
            let item = recycled.unwrap_or_else(|| (shared.factory)());
            return Ok(self.handle(item, idx, generation));
        }

        if s.slots.len() >= shared.soft_limit {
            return Err(PoolError::CapacityExceeded {
                limit: shared.soft_limit,
            });
        }

        // Reserve the slot, build the item outside the lock.
        let idx = s.slots.len();
        s.slots.push(Slot {
            item: None,
            generation: 1,
            checked_out: true,
        });
        drop(s);
        let item = (shared.factory)();
        Ok(self.handle(item, idx, 1))
    }

    /// Retries [`Self::try_checkout`] with spin/yield/sleep backoff until an
    /// item frees up, `stop` is triggered or `timeout` elapses.
    pub fn checkout(
        &self,
        stop: &StopSignal,
        timeout: Option<Duration>,
    ) -> Result<Pooled<T>, PoolError> {
        let start = Instant::now();
        let backoff = Backoff::new();
        let mut spins: u32 = 0;

        loop {
            match self.try_checkout() {
                Ok(p) => return Ok(p),
                Err(PoolError::CapacityExceeded { .. }) => {}
                Err(e) => return Err(e),
            }
            if stop.is_triggered() {
                return Err(PoolError::Cancelled);
            }
            if let Some(t) = timeout
                && start.elapsed() >= t
            {
                return Err(PoolError::Timeout);
            }
            spins = spins.saturating_add(1);
            if spins < 64 {
                backoff.spin();
            } else if spins < 256 {
                backoff.snooze();
            } else {
                thread::sleep(Duration::from_micros(50));
            }
        }
    }

    pub fn checkin(&self, pooled: Pooled<T>) -> Result<(), PoolError> {
        let (item, ticket) = pooled.detach();
        self.checkin_ticket(item, ticket)
    }

    /// Returns an item taken out with [`Pooled::detach`]. The item is dropped
    /// when the ticket is stale, already returned or from another pool.
    pub fn checkin_ticket(&self, item: T, ticket: PoolTicket) -> Result<(), PoolError> {
        self.shared.checkin(item, ticket)
    }

    pub fn soft_limit(&self) -> usize {
        self.shared.soft_limit
    }

    /// Slots created so far.
    pub fn len(&self) -> usize {
        self.shared.slots.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn available(&self) -> usize {
        self.shared.slots.lock().free.len()
    }

    pub fn checked_out(&self) -> usize {
        let s = self.shared.slots.lock();
        s.slots.iter().filter(|slot| slot.checked_out).count()
    }

    fn handle(&self, item: T, slot: usize, generation: u64) -> Pooled<T> {
        Pooled {
            item: Some(item),
            ticket: PoolTicket {
                pool_id: self.shared.id,
                slot,
                generation,
            },
            pool: Arc::downgrade(&self.shared),
        }
    }
}

impl<T> PoolShared<T> {
    fn checkin(&self, mut item: T, ticket: PoolTicket) -> Result<(), PoolError> {
        let rejected = PoolError::DoubleCheckin {
            slot: ticket.slot,
            generation: ticket.generation,
        };
        if ticket.pool_id != self.id {
            return Err(rejected);
        }

        {
            let mut s = self.slots.lock();
            match s.slots.get_mut(ticket.slot) {
                Some(slot) if slot.checked_out && slot.generation == ticket.generation => {
                    slot.checked_out = false;
                }
                _ => return Err(rejected),
            }
        }

        (self.reset)(&mut item);

        let mut s = self.slots.lock();
        s.slots[ticket.slot].item = Some(item);
        s.free.push(ticket.slot);
        Ok(())
    }
}

impl<T> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.shared.slots.lock();
        f.debug_struct("ResourcePool")
            .field("id", &self.shared.id)
            .field("soft_limit", &self.shared.soft_limit)
            .field("slots", &s.slots.len())
            .field("free", &s.free.len())
            .finish()
    }
}

/// Move-only handle to a checked-out item. Dropping it checks the item back in.
///
/// A handle that outlives its pool simply drops the item.
pub struct Pooled<T> {
    item: Option<T>,
    ticket: PoolTicket,
    pool: Weak<PoolShared<T>>,
}

impl<T> Pooled<T> {
    #[inline]
    pub fn ticket(&self) -> PoolTicket {
        self.ticket
    }

    /// Take the item out for explicit checkin via
    /// [`ResourcePool::checkin_ticket`]. Nothing is returned to the pool on drop.
    pub fn detach(mut self) -> (T, PoolTicket) {
        let item = self.item.take().expect("pooled item present until detach");
        (item, self.ticket)
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled item present until detach")
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled item present until detach")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        let Some(item) = self.item.take() else {
            return;
        };
        if let Some(pool) = self.pool.upgrade()
            && let Err(e) = pool.checkin(item, self.ticket)
        {
            tracing::error!("[Pool] failed to recycle item on drop: {e}");
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("item", &self.item)
            .field("ticket", &self.ticket)
            .finish()
    }
}
