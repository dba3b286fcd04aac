//! The per-instance state machine (§3, §4.1).
//!
//! Ten states exist so that races between a borrower and the evictor/
//! validator can be expressed precisely instead of with a single "is this
//! idle?" boolean — see `EVICTION_RETURN_TO_HEAD` below for the canonical
//! example.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
// `tokio::time::Instant` rather than `std::time::Instant`: under
// `#[tokio::test(start_paused = true)]` it tracks the paused virtual clock,
// which is what lets the eviction/abandonment tests in `tests/scenarios.rs`
// advance time deterministically instead of sleeping in real time.
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Unique identity for a managed instance, minted once at creation and held
/// for the instance's entire lifetime. Stands in for the reference-identity
/// lookup the source language gets from an `IdentityHashMap` (§3's
/// "all-objects index ... keyed by instance identity").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The state machine described in §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Allocated,
    Eviction,
    EvictionReturnToHead,
    Validation,
    ValidationPreallocated,
    ValidationReturnToHead,
    Invalid,
    Abandoned,
    Returning,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Allocated => "ALLOCATED",
            Self::Eviction => "EVICTION",
            Self::EvictionReturnToHead => "EVICTION_RETURN_TO_HEAD",
            Self::Validation => "VALIDATION",
            Self::ValidationPreallocated => "VALIDATION_PREALLOCATED",
            Self::ValidationReturnToHead => "VALIDATION_RETURN_TO_HEAD",
            Self::Invalid => "INVALID",
            Self::Abandoned => "ABANDONED",
            Self::Returning => "RETURNING",
        };
        f.write_str(name)
    }
}

/// Where an evicted-test candidate should be reinserted once the test ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reinsert {
    /// Put back at its original logical position (tail of the sweep order).
    Original,
    /// Put back at the head — a borrow raced the eviction/validation test.
    Head,
    /// Do not reinsert; the object was allocated, destroyed, or preallocated
    /// out from under the test.
    None,
}

struct Timestamps {
    created_at: Instant,
    last_borrow_time: Option<Instant>,
    last_return_time: Option<Instant>,
    last_use_time: Instant,
}

struct Inner<T> {
    value: Option<T>,
    state: State,
    timestamps: Timestamps,
}

/// A managed instance plus its state machine and timestamps (§3).
///
/// The per-instance mutex lives here; factory calls are never made while it
/// is held (§3 invariant 6, §9 "factory calls outside locks").
pub struct PooledObject<T> {
    pub id: ObjectId,
    inner: Mutex<Inner<T>>,
}

impl<T> PooledObject<T> {
    pub fn new(value: T) -> Self {
        let now = Instant::now();
        Self {
            id: ObjectId::next(),
            inner: Mutex::new(Inner {
                value: Some(value),
                state: State::Idle,
                timestamps: Timestamps {
                    created_at: now,
                    last_borrow_time: None,
                    last_return_time: None,
                    last_use_time: now,
                },
            }),
        }
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub fn created_at(&self) -> Instant {
        self.inner.lock().timestamps.created_at
    }

    /// Time since the instance was last returned (or created, if never
    /// returned) — what the eviction policy calls "idle time".
    pub fn idle_duration(&self) -> Duration {
        let g = self.inner.lock();
        let since = g.timestamps.last_return_time.unwrap_or(g.timestamps.created_at);
        since.elapsed()
    }

    /// Time since the instance was last observed in use by a caller —
    /// what the abandonment detector calls "idle-active time".
    pub fn time_since_last_use(&self) -> Duration {
        self.inner.lock().timestamps.last_use_time.elapsed()
    }

    /// Client-observable touch: callers that hold a borrowed instance across
    /// a long operation call this to prove they are still alive, resetting
    /// the abandonment clock.
    pub fn touch(&self) {
        self.inner.lock().timestamps.last_use_time = Instant::now();
    }

    /// IDLE or EVICTION → ALLOCATED; returns whether the caller now owns the
    /// instance. From EVICTION, ownership is not granted (the evictor must
    /// finish its test and put the object back), but the state moves to
    /// `EvictionReturnToHead` so the evictor knows a borrow raced it.
    pub fn allocate(&self) -> bool {
        let mut g = self.inner.lock();
        match g.state {
            State::Idle => {
                g.state = State::Allocated;
                let now = Instant::now();
                g.timestamps.last_borrow_time = Some(now);
                g.timestamps.last_use_time = now;
                true
            }
            State::Eviction => {
                g.state = State::EvictionReturnToHead;
                false
            }
            State::Validation | State::ValidationReturnToHead => {
                g.state = State::ValidationPreallocated;
                false
            }
            _ => false,
        }
    }

    /// ALLOCATED → RETURNING. Fails (misuse) if not currently allocated —
    /// this is the hook §8 invariant 6 ("a second `return(v)` raises a
    /// misuse error") is built on.
    pub fn mark_returning(&self) -> Result<()> {
        let mut g = self.inner.lock();
        match g.state {
            State::Allocated => {
                g.state = State::Returning;
                Ok(())
            }
            State::Abandoned => Err(Error::misuse("instance was already reclaimed as abandoned")),
            other => Err(Error::misuse(format!(
                "return of instance not in ALLOCATED state (was {other})"
            ))),
        }
    }

    /// RETURNING → IDLE.
    pub fn deallocate(&self) {
        let mut g = self.inner.lock();
        debug_assert_eq!(g.state, State::Returning);
        g.state = State::Idle;
        g.timestamps.last_return_time = Some(Instant::now());
    }

    /// IDLE → EVICTION. Fails if a borrow got there first.
    pub fn start_eviction_test(&self) -> bool {
        let mut g = self.inner.lock();
        if g.state == State::Idle {
            g.state = State::Eviction;
            true
        } else {
            false
        }
    }

    /// End an eviction test, reporting where (if anywhere) the object
    /// should be reinserted in the idle deque.
    pub fn end_eviction_test(&self) -> Reinsert {
        let mut g = self.inner.lock();
        match g.state {
            State::Eviction => {
                g.state = State::Idle;
                Reinsert::Original
            }
            State::EvictionReturnToHead => {
                g.state = State::Idle;
                Reinsert::Head
            }
            _ => Reinsert::None,
        }
    }

    /// EVICTION → VALIDATION, EVICTION_RETURN_TO_HEAD → VALIDATION_RETURN_TO_HEAD,
    /// for `testWhileIdle`. The head marker carries through so a borrow that
    /// raced the eviction test (but not this validation pass) still gets its
    /// instance back at the front of the deque.
    pub fn start_idle_validation(&self) -> bool {
        let mut g = self.inner.lock();
        match g.state {
            State::Eviction => {
                g.state = State::Validation;
                true
            }
            State::EvictionReturnToHead => {
                g.state = State::ValidationReturnToHead;
                true
            }
            _ => false,
        }
    }

    /// End an idle-validation pass, reporting how to proceed. `passed`
    /// indicates whether `Factory::validate` accepted the instance.
    ///
    /// A borrow that races validation itself (`allocate` saw `VALIDATION` or
    /// `VALIDATION_RETURN_TO_HEAD` and moved the state to
    /// `VALIDATION_PREALLOCATED`) never got the instance back synchronously —
    /// `allocate` returned `false` and that caller already went back around
    /// the borrow loop. If validation then passes, the instance becomes
    /// `ALLOCATED` with nobody holding it; it is not reinserted, and is left
    /// for the abandonment detector to reclaim it (see DESIGN.md).
    pub fn end_idle_validation(&self, passed: bool) -> Reinsert {
        let mut g = self.inner.lock();
        if !passed {
            return Reinsert::None;
        }
        match g.state {
            State::Validation => {
                g.state = State::Idle;
                Reinsert::Original
            }
            State::ValidationReturnToHead => {
                g.state = State::Idle;
                Reinsert::Head
            }
            State::ValidationPreallocated => {
                g.state = State::Allocated;
                Reinsert::None
            }
            _ => Reinsert::None,
        }
    }

    /// `now - lastUseTime >= timeout` while ALLOCATED → ABANDONED. Returns
    /// `true` if the transition happened (caller should then destroy it).
    pub fn mark_abandoned_if_stale(&self, timeout: Duration) -> bool {
        let mut g = self.inner.lock();
        if g.state == State::Allocated && g.timestamps.last_use_time.elapsed() >= timeout {
            g.state = State::Abandoned;
            true
        } else {
            false
        }
    }

    /// Force straight to INVALID without touching the value slot — used
    /// when the caller already holds the value itself (e.g. a borrow whose
    /// activation/validation failed, see `pool.rs::discard_allocated`).
    pub fn force_invalid(&self) {
        self.inner.lock().state = State::Invalid;
    }

    /// Any state → INVALID, taking the wrapped value for disposal. Returns
    /// `None` if the value was already taken (double-destroy).
    pub fn invalidate_and_take(&self) -> Option<T> {
        let mut g = self.inner.lock();
        g.state = State::Invalid;
        g.value.take()
    }

    /// Run `f` against the wrapped value without changing state. Panics if
    /// the value has already been taken — callers must not touch a value
    /// after `invalidate_and_take`.
    pub fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let g = self.inner.lock();
        f(g.value.as_ref().expect("pooled value already taken"))
    }

    pub fn with_value_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.inner.lock();
        f(g.value.as_mut().expect("pooled value already taken"))
    }

    /// Move the value out for the duration of a borrow. Only valid while
    /// `ALLOCATED` — the caller becomes the value's sole owner until it
    /// calls [`Self::put_value`] back on return.
    pub fn take_value(&self) -> T {
        let mut g = self.inner.lock();
        debug_assert_eq!(g.state, State::Allocated);
        g.value.take().expect("pooled value already taken")
    }

    /// Put a borrowed value back. Only valid while `RETURNING`.
    pub fn put_value(&self, value: T) {
        let mut g = self.inner.lock();
        debug_assert_eq!(g.state, State::Returning);
        g.value = Some(value);
    }

    /// Move the value out for an evictor-driven `testWhileIdle` validation
    /// call. Unlike [`Self::take_value`], this carries no state assertion —
    /// the object is mid `VALIDATION`/`VALIDATION_RETURN_TO_HEAD` here, not
    /// `ALLOCATED` — and exists so the value can be validated outside the
    /// lock instead of through [`Self::with_value`], whose `FnOnce(&T) -> R`
    /// signature cannot express a borrowed future (see DESIGN.md).
    pub fn take_value_for_test(&self) -> T {
        self.inner.lock().value.take().expect("pooled value already taken")
    }

    /// Counterpart to [`Self::take_value_for_test`] for a validation pass
    /// that passed and is being reinserted into the idle deque.
    pub fn put_value_after_test(&self, value: T) {
        self.inner.lock().value = Some(value);
    }
}
