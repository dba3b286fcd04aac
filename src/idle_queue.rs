//! The idle deque (§4.2): the set of instances currently available to be
//! borrowed, plus the FIFO queue of waiters blocked on an empty deque.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::state::{ObjectId, PooledObject};

/// A borrow-side waiter: satisfied either with an instance id that just
/// became available, or woken with `None` when the pool closes.
type Waiter = oneshot::Sender<Option<ObjectId>>;

struct Inner {
    deque: VecDeque<ObjectId>,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

/// LIFO/FIFO idle deque with fair (FIFO) waiter wakeup, independent of the
/// pop order used for non-blocking takes (§5: "waiter fairness is always
/// FIFO regardless of the configured borrow policy").
pub struct IdleQueue {
    inner: Mutex<Inner>,
}

impl Default for IdleQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl IdleQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                deque: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().deque.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Push to the front (LIFO slot) — also where a waiter, if any is
    /// waiting, gets woken directly without ever touching the deque.
    pub fn push_front(&self, id: ObjectId) {
        self.push(id, true);
    }

    /// Push to the back (FIFO slot / eviction-test "original position").
    pub fn push_back(&self, id: ObjectId) {
        self.push(id, false);
    }

    fn push(&self, id: ObjectId, front: bool) {
        let mut g = self.inner.lock();
        if let Some(waiter) = g.waiters.pop_front() {
            // Hand the instance directly to the longest-waiting caller;
            // never touches the deque, so LIFO/FIFO ordering among idle
            // instances is unaffected by waiter traffic.
            if waiter.send(Some(id)).is_ok() {
                return;
            }
            // Waiter's future was dropped (cancelled) between the pop and
            // the send; fall through and place the instance normally.
        }
        if front {
            g.deque.push_front(id);
        } else {
            g.deque.push_back(id);
        }
    }

    /// Non-blocking pop honoring the configured LIFO/FIFO borrow policy.
    pub fn try_take(&self, lifo: bool) -> Option<ObjectId> {
        let mut g = self.inner.lock();
        if lifo {
            g.deque.pop_front()
        } else {
            g.deque.pop_back()
        }
    }

    /// Remove a specific instance if it is currently idle (used by the
    /// evictor to pull a candidate out for testing).
    pub fn remove(&self, id: ObjectId) -> bool {
        let mut g = self.inner.lock();
        if let Some(pos) = g.deque.iter().position(|x| *x == id) {
            g.deque.remove(pos);
            true
        } else {
            false
        }
    }

    /// Register a waiter and return the receiver half. Returns `None`
    /// directly (no waiter registered) if an instance is already idle or
    /// the queue is closed, so the caller can retry `try_take` immediately.
    pub fn register_waiter(&self, lifo: bool) -> Result<Option<ObjectId>, oneshot::Receiver<Option<ObjectId>>> {
        let mut g = self.inner.lock();
        if g.closed {
            return Ok(None);
        }
        let popped = if lifo { g.deque.pop_front() } else { g.deque.pop_back() };
        if popped.is_some() {
            return Ok(popped);
        }
        let (tx, rx) = oneshot::channel();
        g.waiters.push_back(tx);
        Err(rx)
    }

    /// Weakly consistent snapshot in borrow order (front to back), for the
    /// evictor to sweep without holding the deque lock during each test.
    pub fn snapshot(&self) -> Vec<ObjectId> {
        self.inner.lock().deque.iter().copied().collect()
    }

    /// Wake every waiter with `None` and mark the queue closed; no further
    /// waiters will be registered (`register_waiter` short-circuits).
    pub fn close(&self) {
        let mut g = self.inner.lock();
        g.closed = true;
        for waiter in g.waiters.drain(..) {
            let _ = waiter.send(None);
        }
    }

    pub fn drain(&self) -> Vec<ObjectId> {
        self.inner.lock().deque.drain(..).collect()
    }
}
