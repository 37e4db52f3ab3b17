use crate::error::{PipelineError, Result};
use crate::metrics::{QueueStats, QueueStatsSnapshot};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Ordering as KeyOrdering;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Maximum number of entries a queue holds at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Capacity {
    /// No admission limit
    #[default]
    Unbounded,
    /// At most this many entries
    Bounded(NonZeroUsize),
}

impl Capacity {
    /// The admission limit, or `None` when unbounded
    pub fn limit(&self) -> Option<usize> {
        match self {
            Capacity::Unbounded => None,
            Capacity::Bounded(limit) => Some(limit.get()),
        }
    }

    fn admits(&self, len: usize) -> bool {
        self.limit().map_or(true, |limit| len < limit)
    }
}

/// `0` is the unbounded sentinel
impl From<usize> for Capacity {
    fn from(capacity: usize) -> Self {
        NonZeroUsize::new(capacity).map_or(Capacity::Unbounded, Capacity::Bounded)
    }
}

impl TryFrom<i64> for Capacity {
    type Error = PipelineError;

    fn try_from(capacity: i64) -> Result<Self> {
        usize::try_from(capacity)
            .map(Capacity::from)
            .map_err(|_| PipelineError::InvalidCapacity(capacity))
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capacity::Unbounded => f.write_str("unbounded"),
            Capacity::Bounded(limit) => write!(f, "{limit}"),
        }
    }
}

/// Decides which of two keys leaves the queue first.
///
/// `compare(a, b) == Less` means `a` is dequeued before `b`. Entries whose keys
/// compare `Equal` come out in unspecified relative order; callers that need a
/// strict sequence must hand out unique keys.
pub trait KeyOrder<K>: Send + Sync + 'static {
    fn compare(&self, a: &K, b: &K) -> KeyOrdering;
}

/// Smallest key first
#[derive(Debug, Clone, Copy, Default)]
pub struct MinFirst;

impl<K: Ord> KeyOrder<K> for MinFirst {
    fn compare(&self, a: &K, b: &K) -> KeyOrdering {
        a.cmp(b)
    }
}

/// Largest key first
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxFirst;

impl<K: Ord> KeyOrder<K> for MaxFirst {
    fn compare(&self, a: &K, b: &K) -> KeyOrdering {
        b.cmp(a)
    }
}

impl<K, F> KeyOrder<K> for F
where
    F: Fn(&K, &K) -> KeyOrdering + Send + Sync + 'static,
{
    fn compare(&self, a: &K, b: &K) -> KeyOrdering {
        self(a, b)
    }
}

/// An ordering key paired with the item it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<K, T> {
    pub key: K,
    pub item: T,
}

impl<K, T> Entry<K, T> {
    pub fn new(key: K, item: T) -> Self {
        Self { key, item }
    }
}

/// Binary heap keyed by a runtime `KeyOrder`, plus the count of predicate waiters.
/// Only ever touched under the queue lock.
struct State<K, T> {
    entries: Vec<Entry<K, T>>,
    filtered_waiters: usize,
}

impl<K, T> State<K, T> {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn peek(&self) -> Option<&Entry<K, T>> {
        self.entries.first()
    }

    fn push(&mut self, entry: Entry<K, T>, order: &impl KeyOrder<K>) {
        self.entries.push(entry);
        let mut child = self.entries.len() - 1;
        while child > 0 {
            let parent = (child - 1) / 2;
            if order.compare(&self.entries[child].key, &self.entries[parent].key)
                != KeyOrdering::Less
            {
                break;
            }
            self.entries.swap(child, parent);
            child = parent;
        }
    }

    fn pop(&mut self, order: &impl KeyOrder<K>) -> Option<Entry<K, T>> {
        let last = self.entries.len().checked_sub(1)?;
        self.entries.swap(0, last);
        let top = self.entries.pop();

        let len = self.entries.len();
        let mut parent = 0;
        loop {
            let left = 2 * parent + 1;
            let right = left + 1;
            let mut best = parent;
            if left < len && self.precedes(left, best, order) {
                best = left;
            }
            if right < len && self.precedes(right, best, order) {
                best = right;
            }
            if best == parent {
                break;
            }
            self.entries.swap(parent, best);
            parent = best;
        }
        top
    }

    fn precedes(&self, a: usize, b: usize, order: &impl KeyOrder<K>) -> bool {
        order.compare(&self.entries[a].key, &self.entries[b].key) == KeyOrdering::Less
    }
}

struct Shared<K, T, O> {
    state: Mutex<State<K, T>>,
    not_empty: Condvar,
    not_full: Condvar,
    cancelled: AtomicBool,
    capacity: Capacity,
    order: O,
    stats: QueueStats,
}

impl<K, T, O> Shared<K, T, O> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) -> bool {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Taking the lock orders this broadcast after any waiter that checked the
        // flag but has not parked yet.
        let _state = self.state.lock();
        self.not_empty.notify_all();
        self.not_full.notify_all();
        true
    }

    fn after_pop(&self, state: &State<K, T>) {
        self.stats.record_dequeued();
        self.not_full.notify_one();
        // The front changed, which may satisfy a predicate waiter.
        if state.filtered_waiters > 0 {
            self.not_empty.notify_all();
        }
    }
}

impl<K, T, O> Drop for Shared<K, T, O> {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Locked state of one waiting dequeue; keeps `filtered_waiters` counted even
/// if the predicate panics.
struct Waiting<'a, K, T> {
    state: MutexGuard<'a, State<K, T>>,
    filtered: bool,
}

impl<'a, K, T> Waiting<'a, K, T> {
    fn register(mut state: MutexGuard<'a, State<K, T>>, filtered: bool) -> Self {
        if filtered {
            state.filtered_waiters += 1;
        }
        Self { state, filtered }
    }
}

impl<K, T> Drop for Waiting<'_, K, T> {
    fn drop(&mut self) {
        if self.filtered {
            self.state.filtered_waiters -= 1;
        }
    }
}

/// A bounded, priority-ordered, blocking queue.
///
/// Entries leave in key order as decided by the queue's [`KeyOrder`], never in
/// arrival order. Producers block while the queue is full; consumers block
/// while it is empty (or while the front entry does not match what they wait
/// for). [`cancel`](Self::cancel) is a one-shot broadcast: every current and
/// future wait returns `None` from then on, even if entries remain.
///
/// Handles are cheap clones of one shared queue. Every waiter holds a handle,
/// so dropping handles never releases anyone: call `cancel` to shut a queue
/// down. [`RunningPipeline`](crate::RunningPipeline) does so when dropped.
pub struct PriorityQueue<K, T, O = MinFirst> {
    shared: Arc<Shared<K, T, O>>,
}

impl<K, T, O> Clone for PriorityQueue<K, T, O> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, T, O> fmt::Debug for PriorityQueue<K, T, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("len", &self.shared.state.lock().len())
            .field("capacity", &self.shared.capacity)
            .field("cancelled", &self.shared.is_cancelled())
            .finish()
    }
}

impl<K: Ord, T> PriorityQueue<K, T, MinFirst> {
    /// Create a queue that hands out the smallest key first
    pub fn new(capacity: impl Into<Capacity>) -> Self {
        Self::with_order(capacity, MinFirst)
    }
}

impl<K, T, O> PriorityQueue<K, T, O>
where
    K: Eq,
    O: KeyOrder<K>,
{
    /// Create a queue ordered by `order`
    pub fn with_order(capacity: impl Into<Capacity>, order: O) -> Self {
        let capacity = capacity.into();
        let reserve = capacity.limit().unwrap_or(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    entries: Vec::with_capacity(reserve),
                    filtered_waiters: 0,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                cancelled: AtomicBool::new(false),
                capacity,
                order,
                stats: QueueStats::default(),
            }),
        }
    }

    /// Insert an entry, blocking while the queue is full.
    ///
    /// Returns the entry back if the queue is cancelled while waiting for
    /// space. A queue with room admits even after cancellation.
    pub fn enqueue(&self, entry: Entry<K, T>) -> std::result::Result<(), Entry<K, T>> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        if !shared.capacity.admits(state.len()) {
            shared.stats.record_enqueue_wait();
            while !shared.capacity.admits(state.len()) {
                if shared.is_cancelled() {
                    return Err(entry);
                }
                shared.not_full.wait(&mut state);
            }
        }
        self.insert(&mut state, entry);
        Ok(())
    }

    /// Insert an entry if there is room, handing it back otherwise
    pub fn try_enqueue(&self, entry: Entry<K, T>) -> std::result::Result<(), Entry<K, T>> {
        let mut state = self.shared.state.lock();
        if !self.shared.capacity.admits(state.len()) {
            return Err(entry);
        }
        self.insert(&mut state, entry);
        Ok(())
    }

    fn insert(&self, state: &mut State<K, T>, entry: Entry<K, T>) {
        let shared = &*self.shared;
        state.push(entry, &shared.order);
        shared.stats.record_enqueued();
        if state.filtered_waiters > 0 {
            shared.not_empty.notify_all();
        } else {
            shared.not_empty.notify_one();
        }
    }

    /// Remove the best-ordered entry without blocking.
    ///
    /// Ignores cancellation: entries left in a cancelled queue can still be
    /// drained this way.
    pub fn try_dequeue(&self) -> Option<Entry<K, T>> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        let popped = state.pop(&shared.order);
        if popped.is_some() {
            shared.after_pop(&state);
        }
        popped
    }

    /// Block until an entry is available and remove the best-ordered one.
    ///
    /// Returns `None` once the queue is cancelled.
    pub fn wait_dequeue(&self) -> Option<Entry<K, T>> {
        self.wait_pop(|_| true, false)
    }

    /// Block until the best-ordered entry has key `key`, then remove it.
    ///
    /// Entries with other keys are left in place. Any number of threads may
    /// wait for different keys at the same time. Returns `None` once the queue
    /// is cancelled.
    pub fn wait_dequeue_for_key(&self, key: K) -> Option<Entry<K, T>> {
        self.wait_pop(move |entry| entry.key == key, true)
    }

    /// Block until the best-ordered entry satisfies `accept`, then remove it.
    ///
    /// `accept` is only ever shown the front of the queue and is re-evaluated
    /// every time the queue changes. Returns `None` once the queue is cancelled.
    pub fn wait_dequeue_where<P>(&self, accept: P) -> Option<Entry<K, T>>
    where
        P: FnMut(&Entry<K, T>) -> bool,
    {
        self.wait_pop(accept, true)
    }

    fn wait_pop<P>(&self, mut accept: P, filtered: bool) -> Option<Entry<K, T>>
    where
        P: FnMut(&Entry<K, T>) -> bool,
    {
        let shared = &*self.shared;
        let mut waiting = Waiting::register(shared.state.lock(), filtered);

        let popped = loop {
            if shared.is_cancelled() {
                break None;
            }
            if waiting.state.peek().is_some_and(&mut accept) {
                break waiting.state.pop(&shared.order);
            }
            shared.not_empty.wait(&mut waiting.state);
        };

        if popped.is_some() {
            shared.after_pop(&waiting.state);
        }
        popped
    }

    /// Key of the entry the next dequeue would return
    pub fn peek_key(&self) -> Option<K>
    where
        K: Clone,
    {
        self.shared.state.lock().peek().map(|entry| entry.key.clone())
    }
}

impl<K, T, O> PriorityQueue<K, T, O> {
    /// Cancel every current and future wait on this queue.
    ///
    /// Permanent and idempotent.
    pub fn cancel(&self) {
        if self.shared.cancel() {
            debug!(capacity = %self.shared.capacity, "queue cancelled");
        }
    }

    /// Whether [`cancel`](Self::cancel) has been called
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Number of entries currently queued
    pub fn len(&self) -> usize {
        self.shared.state.lock().len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The admission limit this queue was created with
    pub fn capacity(&self) -> Capacity {
        self.shared.capacity
    }

    /// Occupancy as a percentage of capacity (0-100); always 0 when unbounded
    pub fn utilization(&self) -> u32 {
        match self.shared.capacity.limit() {
            Some(limit) => ((self.len() * 100 / limit) as u32).min(100),
            None => 0,
        }
    }

    /// Lifetime enqueue/dequeue counters
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.shared.stats.snapshot()
    }
}
