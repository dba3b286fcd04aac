//! The pool core (§4.6-§4.9): `borrow`/`return`/`invalidate`, capacity
//! admission, and the background maintenance loop.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::abandoned::scan_and_reclaim;
use crate::config::PoolConfig;
use crate::error::{BoxError, Error, Result, SwallowedExceptionListener, TracingSwallowedExceptionListener};
use crate::eviction::{DefaultEvictionPolicy, EvictionPolicy};
use crate::evictor;
use crate::factory::Factory;
use crate::idle_queue::IdleQueue;
use crate::state::{ObjectId, PooledObject, State};

/// Point-in-time counters (§6: `numIdle`/`numActive`/`numWaiters`, plus
/// `createdCount` for observability).
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub num_idle: usize,
    pub num_active: usize,
    pub num_waiters: usize,
    pub created: u64,
}

struct PoolShared<F: Factory> {
    factory: F,
    config: PoolConfig,
    all_objects: DashMap<ObjectId, Arc<PooledObject<F::Item>>>,
    idle: IdleQueue,
    policy: Box<dyn EvictionPolicy>,
    listener: Box<dyn SwallowedExceptionListener>,
    total: AtomicUsize,
    created: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
    evictor_handle: StdMutex<Option<JoinHandle<()>>>,
}

enum CreateOutcome<T> {
    Created(Arc<PooledObject<T>>),
    AtCapacity,
    Invalid,
}

enum FinishOutcome<F: Factory> {
    Ready(Managed<F>),
    Retry,
}

impl<F: Factory> PoolShared<F> {
    fn swallow(&self, operation: &str, error: Error) {
        let boxed: BoxError = Box::new(error);
        self.listener.on_swallowed_exception(operation, &boxed);
    }

    fn try_reserve_slot(&self) -> bool {
        if self.config.max_total < 0 {
            self.total.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        let max = self.config.max_total as usize;
        loop {
            let cur = self.total.load(Ordering::Acquire);
            if cur >= max {
                return false;
            }
            if self
                .total
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release_slot(&self) {
        self.total.fetch_sub(1, Ordering::AcqRel);
    }

    /// Create a brand-new instance, applying `test_on_create` if configured,
    /// then passivating it into the same canonical "ready to idle" shape a
    /// returned instance ends up in (§8's `addObject(); borrow()` round-trip:
    /// the factory sees `make → passivate → activate`, never a raw freshly
    /// made value handed straight to `activate`). Leaves the instance `Idle`
    /// and registered in `all_objects` on success; never allocates it.
    async fn try_create(&self) -> Result<CreateOutcome<F::Item>> {
        if !self.try_reserve_slot() {
            return Ok(CreateOutcome::AtCapacity);
        }
        match self.factory.make().await {
            Ok(mut value) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                if self.config.test_on_create {
                    let ok = self.factory.validate(&value).await;
                    if !ok {
                        if let Err(e) = self.factory.destroy(&mut value).await {
                            self.swallow("destroy-invalid-new", e);
                        }
                        self.release_slot();
                        return Ok(CreateOutcome::Invalid);
                    }
                }
                if let Err(e) = self.factory.passivate(&mut value).await {
                    self.swallow("passivate-new", e);
                    if let Err(e) = self.factory.destroy(&mut value).await {
                        self.swallow("destroy-failed-passivation", e);
                    }
                    self.release_slot();
                    return Ok(CreateOutcome::Invalid);
                }
                let obj = Arc::new(PooledObject::new(value));
                self.all_objects.insert(obj.id, obj.clone());
                Ok(CreateOutcome::Created(obj))
            }
            Err(e) => {
                self.release_slot();
                Err(e)
            }
        }
    }

    /// Destroy an instance that was allocated to a caller but never made it
    /// back into the idle deque (activation/validation failure on borrow).
    async fn discard_allocated(&self, obj: &PooledObject<F::Item>, mut value: F::Item) {
        obj.force_invalid();
        if let Err(e) = self.factory.destroy(&mut value).await {
            self.swallow("destroy-rejected-on-borrow", e);
        }
        self.all_objects.remove(&obj.id);
        self.release_slot();
    }

    async fn finish_borrow(self: &Arc<Self>, obj: Arc<PooledObject<F::Item>>, created_new: bool) -> Result<FinishOutcome<F>> {
        let id = obj.id;
        let mut value = obj.take_value();

        if let Err(e) = self.factory.activate(&mut value).await {
            self.discard_allocated(&obj, value).await;
            return if created_new {
                Err(Error::UnableToActivate(Box::new(e)))
            } else {
                Ok(FinishOutcome::Retry)
            };
        }

        if self.config.test_on_borrow && !self.factory.validate(&value).await {
            self.discard_allocated(&obj, value).await;
            return if created_new {
                Err(Error::UnableToValidate)
            } else {
                Ok(FinishOutcome::Retry)
            };
        }

        Ok(FinishOutcome::Ready(Managed {
            id,
            value: Some(value),
            shared: self.clone(),
        }))
    }

    /// ALLOCATED → destroyed-or-idle. `invalidate` forces destruction
    /// regardless of validation.
    async fn complete_return(self: &Arc<Self>, id: ObjectId, mut value: F::Item, invalidate: bool) -> Result<()> {
        let Some(obj) = self.all_objects.get(&id).map(|e| e.value().clone()) else {
            // The abandonment detector already reclaimed this id: it moves an
            // instance ALLOCATED -> ABANDONED -> INVALID and removes it from
            // `all_objects` in one synchronous pass (`abandoned.rs`), so by
            // the time a late `return` arrives the lookup above always misses
            // — the `State::Abandoned` branch below never actually sees it.
            // Per §9 Open Question 3: silently drop if abandonment handling
            // is enabled, else misuse.
            return if self.config.abandoned.is_some() {
                Ok(())
            } else {
                Err(Error::misuse("returned instance is not recognized by this pool"))
            };
        };

        if obj.state() == State::Abandoned {
            // Per §9 Open Question 3: silently drop if abandonment handling
            // is enabled (the detector already reclaimed it), else misuse.
            return if self.config.abandoned.is_some() {
                Ok(())
            } else {
                Err(Error::misuse("instance was already reclaimed as abandoned"))
            };
        }

        obj.mark_returning()?;

        let mut discard = invalidate || self.closed.load(Ordering::Acquire);

        if !discard {
            if let Err(e) = self.factory.passivate(&mut value).await {
                self.swallow("passivate", e);
                discard = true;
            }
        }

        if !discard && self.config.test_on_return && !self.factory.validate(&value).await {
            discard = true;
        }

        if !discard && self.config.max_idle >= 0 && self.idle.len() as i64 >= self.config.max_idle {
            discard = true;
        }

        obj.put_value(value);
        obj.deallocate();

        if discard {
            if let Some(mut v) = obj.invalidate_and_take() {
                if let Err(e) = self.factory.destroy(&mut v).await {
                    self.swallow("destroy-on-return", e);
                }
            }
            self.all_objects.remove(&id);
            self.release_slot();
        } else {
            self.idle.push_front(id);
        }
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        let mut num_active = 0;
        for entry in self.all_objects.iter() {
            if matches!(
                entry.value().state(),
                State::Allocated | State::Returning
            ) {
                num_active += 1;
            }
        }
        PoolStats {
            num_idle: self.idle.len(),
            num_active,
            num_waiters: self.idle.waiter_count(),
            created: self.created.load(Ordering::Relaxed),
        }
    }

    async fn ensure_min_idle(&self) {
        while self.idle.len() < self.config.min_idle {
            match self.try_create().await {
                Ok(CreateOutcome::Created(obj)) => self.idle.push_front(obj.id),
                Ok(CreateOutcome::AtCapacity) | Ok(CreateOutcome::Invalid) => break,
                Err(e) => {
                    self.swallow("ensure-min-idle-create", e);
                    break;
                }
            }
        }
    }

    async fn destroy_idle(&self, id: ObjectId) {
        let Some(obj) = self.all_objects.get(&id).map(|e| e.value().clone()) else {
            return;
        };
        if let Some(mut v) = obj.invalidate_and_take() {
            if let Err(e) = self.factory.destroy(&mut v).await {
                self.swallow("destroy-on-clear", e);
            }
        }
        self.all_objects.remove(&id);
        self.release_slot();
    }
}

/// A generic, concurrent object pool.
///
/// Cheap to clone: internally an `Arc` around the shared state, so handing
/// copies to multiple tasks is the expected usage pattern (mirrors
/// `tokio::sync::Semaphore`/connection-pool ergonomics elsewhere in the
/// ecosystem).
pub struct Pool<F: Factory>(Arc<PoolShared<F>>);

impl<F: Factory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Pool(self.0.clone())
    }
}

impl<F: Factory> Pool<F> {
    /// Build a pool with default eviction policy and a tracing-based
    /// swallowed-exception listener. Use [`PoolBuilder`] to customize either.
    pub fn new(factory: F, config: PoolConfig) -> Result<Self> {
        PoolBuilder::new(factory, config).build()
    }

    /// Borrow an instance, waiting up to `config.max_wait` (or forever if
    /// unset) when the pool is exhausted and `block_when_exhausted` is set.
    pub async fn borrow(&self) -> Result<Managed<F>> {
        self.borrow_inner(self.0.config.max_wait).await
    }

    /// Borrow an instance, overriding the configured wait with an explicit
    /// bound (§5's `borrow(d)`).
    pub async fn borrow_for(&self, wait: Duration) -> Result<Managed<F>> {
        self.borrow_inner(Some(wait)).await
    }

    /// Borrow without blocking: fail immediately with
    /// [`Error::Exhausted`] if nothing is available.
    pub async fn try_borrow(&self) -> Result<Managed<F>> {
        if self.0.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        loop {
            if let Some(id) = self.0.idle.try_take(self.0.config.lifo) {
                let Some(obj) = self.0.all_objects.get(&id).map(|e| e.value().clone()) else {
                    continue;
                };
                if !obj.allocate() {
                    continue;
                }
                match self.0.finish_borrow(obj, false).await? {
                    FinishOutcome::Ready(m) => return Ok(m),
                    FinishOutcome::Retry => continue,
                }
            }
            return match self.0.try_create().await? {
                CreateOutcome::Created(obj) => {
                    if !obj.allocate() {
                        continue;
                    }
                    match self.0.finish_borrow(obj, true).await? {
                        FinishOutcome::Ready(m) => Ok(m),
                        FinishOutcome::Retry => unreachable!("created instances never retry"),
                    }
                }
                CreateOutcome::Invalid => Err(Error::UnableToValidate),
                CreateOutcome::AtCapacity => Err(Error::Exhausted {
                    active: self.0.stats().num_active,
                    max_total: self.0.config.max_total,
                }),
            };
        }
    }

    async fn borrow_inner(&self, wait_override: Option<Duration>) -> Result<Managed<F>> {
        loop {
            if self.0.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }

            if let Some(id) = self.0.idle.try_take(self.0.config.lifo) {
                let Some(obj) = self.0.all_objects.get(&id).map(|e| e.value().clone()) else {
                    continue;
                };
                if !obj.allocate() {
                    continue;
                }
                match self.0.finish_borrow(obj, false).await? {
                    FinishOutcome::Ready(m) => return Ok(m),
                    FinishOutcome::Retry => continue,
                }
            }

            match self.0.try_create().await? {
                CreateOutcome::Created(obj) => {
                    if !obj.allocate() {
                        continue;
                    }
                    match self.0.finish_borrow(obj, true).await? {
                        FinishOutcome::Ready(m) => return Ok(m),
                        FinishOutcome::Retry => unreachable!("created instances never retry"),
                    }
                }
                CreateOutcome::Invalid => return Err(Error::UnableToValidate),
                CreateOutcome::AtCapacity => {
                    if !self.0.config.block_when_exhausted {
                        return Err(Error::Exhausted {
                            active: self.0.stats().num_active,
                            max_total: self.0.config.max_total,
                        });
                    }

                    if let Some(abandoned) = &self.0.config.abandoned {
                        if abandoned.remove_abandoned_on_borrow {
                            let reclaimed =
                                scan_and_reclaim(&self.0.all_objects, &self.0.factory, abandoned, self.0.listener.as_ref())
                                    .await;
                            if reclaimed > 0 {
                                continue;
                            }
                        }
                    }

                    match self.0.idle.register_waiter(self.0.config.lifo) {
                        Ok(Some(id)) => {
                            let Some(obj) = self.0.all_objects.get(&id).map(|e| e.value().clone()) else {
                                continue;
                            };
                            if !obj.allocate() {
                                continue;
                            }
                            match self.0.finish_borrow(obj, false).await? {
                                FinishOutcome::Ready(m) => return Ok(m),
                                FinishOutcome::Retry => continue,
                            }
                        }
                        Ok(None) => return Err(Error::Closed),
                        Err(rx) => {
                            let woken = match wait_override {
                                Some(d) => tokio::time::timeout(d, rx)
                                    .await
                                    .map_err(|_| Error::Timeout { waited: d })?
                                    .map_err(|_| Error::Closed)?,
                                None => rx.await.map_err(|_| Error::Closed)?,
                            };
                            match woken {
                                Some(id) => {
                                    let Some(obj) = self.0.all_objects.get(&id).map(|e| e.value().clone()) else {
                                        continue;
                                    };
                                    if !obj.allocate() {
                                        continue;
                                    }
                                    match self.0.finish_borrow(obj, false).await? {
                                        FinishOutcome::Ready(m) => return Ok(m),
                                        FinishOutcome::Retry => continue,
                                    }
                                }
                                None => return Err(Error::Closed),
                            }
                        }
                    }
                }
            }
        }
    }

    /// Return a borrowed instance. Equivalent to dropping it, made
    /// explicit so callers can observe errors (e.g. double-return misuse).
    pub async fn return_object(&self, managed: Managed<F>) -> Result<()> {
        managed.release().await
    }

    /// Return and destroy a borrowed instance regardless of its health.
    pub async fn invalidate_object(&self, managed: Managed<F>) -> Result<()> {
        managed.invalidate().await
    }

    /// Create and idle an instance ahead of demand, applying
    /// `test_on_create` if configured. Does not run `activate` — the
    /// instance is not being lent to anyone (mirrors commons-pool2's
    /// `addObject`).
    pub async fn add_object(&self) -> Result<()> {
        if self.0.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        match self.0.try_create().await? {
            CreateOutcome::Created(obj) => {
                self.0.idle.push_front(obj.id);
                Ok(())
            }
            CreateOutcome::Invalid => Err(Error::UnableToValidate),
            CreateOutcome::AtCapacity => Err(Error::Exhausted {
                active: self.0.stats().num_active,
                max_total: self.0.config.max_total,
            }),
        }
    }

    /// Destroy every currently idle instance. Active (borrowed) instances
    /// are unaffected and will be cleaned up normally on return.
    pub async fn clear(&self) {
        for id in self.0.idle.drain() {
            self.0.destroy_idle(id).await;
        }
    }

    /// Close the pool: stop the evictor, wake all waiters with
    /// [`Error::Closed`], and destroy every idle instance. Already-borrowed
    /// instances are destroyed as they are returned rather than reinserted.
    /// Idempotent.
    pub async fn close(&self) {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.0.cancel.cancel();
        self.0.idle.close();
        self.clear().await;
        let handle = self.0.evictor_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        self.0.stats()
    }

    pub fn num_idle(&self) -> usize {
        self.0.idle.len()
    }

    pub fn num_active(&self) -> usize {
        self.0.stats().num_active
    }

    pub fn num_waiters(&self) -> usize {
        self.0.idle.waiter_count()
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }
}

/// Builder for [`Pool`], the place to override the eviction policy or
/// swallowed-exception listener (§7).
pub struct PoolBuilder<F: Factory> {
    factory: F,
    config: PoolConfig,
    policy: Box<dyn EvictionPolicy>,
    listener: Box<dyn SwallowedExceptionListener>,
}

impl<F: Factory> PoolBuilder<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            policy: Box::new(DefaultEvictionPolicy),
            listener: Box::new(TracingSwallowedExceptionListener),
        }
    }

    pub fn eviction_policy(mut self, policy: impl EvictionPolicy) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn swallowed_exception_listener(mut self, listener: impl SwallowedExceptionListener) -> Self {
        self.listener = Box::new(listener);
        self
    }

    pub fn build(self) -> Result<Pool<F>> {
        self.config.validate()?;
        let shared = Arc::new(PoolShared {
            factory: self.factory,
            config: self.config,
            all_objects: DashMap::new(),
            idle: IdleQueue::new(),
            policy: self.policy,
            listener: self.listener,
            total: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            evictor_handle: StdMutex::new(None),
        });

        if shared.config.eviction_enabled() {
            let handle = spawn_evictor(shared.clone());
            *shared.evictor_handle.lock().unwrap() = Some(handle);
        }

        Ok(Pool(shared))
    }
}

fn spawn_evictor<F: Factory>(shared: Arc<PoolShared<F>>) -> JoinHandle<()> {
    let period = shared
        .config
        .time_between_eviction_runs
        .expect("eviction_enabled() guarantees this is set");
    let cancel = shared.cancel.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let outcome = evictor::sweep_once(
                &shared.idle,
                &shared.all_objects,
                &shared.factory,
                &shared.config,
                shared.policy.as_ref(),
                shared.listener.as_ref(),
            )
            .await;
            tracing::trace!(tested = outcome.tested, evicted = outcome.evicted, "evictor sweep");

            if let Some(abandoned) = &shared.config.abandoned {
                if abandoned.remove_abandoned_on_maintenance {
                    let reclaimed =
                        scan_and_reclaim(&shared.all_objects, &shared.factory, abandoned, shared.listener.as_ref()).await;
                    if reclaimed > 0 {
                        tracing::debug!(reclaimed, "evictor reclaimed abandoned instances");
                    }
                }
            }

            shared.ensure_min_idle().await;
        }
    })
}

/// RAII handle to a borrowed instance (§6). Dropping it without calling
/// [`Managed::release`]/[`Managed::invalidate`] returns it automatically —
/// the drop path spawns a task to run the same async return logic.
pub struct Managed<F: Factory> {
    id: ObjectId,
    value: Option<F::Item>,
    shared: Arc<PoolShared<F>>,
}

impl<F: Factory> Managed<F> {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Reset the abandonment-detector clock; call this during a long
    /// operation on a borrowed instance to prove it is still in active use.
    pub fn touch(&self) {
        if let Some(obj) = self.shared.all_objects.get(&self.id) {
            obj.touch();
        }
    }

    /// Return the instance normally (passivate / `test_on_return` / idle
    /// reinsertion per configuration).
    pub async fn release(mut self) -> Result<()> {
        let id = self.id;
        let value = self.value.take().expect("value missing");
        let shared = self.shared.clone();
        shared.complete_return(id, value, false).await
    }

    /// Return the instance but force destruction, bypassing validation.
    pub async fn invalidate(mut self) -> Result<()> {
        let id = self.id;
        let value = self.value.take().expect("value missing");
        let shared = self.shared.clone();
        shared.complete_return(id, value, true).await
    }
}

impl<F: Factory> std::ops::Deref for Managed<F> {
    type Target = F::Item;
    fn deref(&self) -> &F::Item {
        self.value.as_ref().expect("value missing")
    }
}

impl<F: Factory> std::ops::DerefMut for Managed<F> {
    fn deref_mut(&mut self) -> &mut F::Item {
        self.value.as_mut().expect("value missing")
    }
}

impl<F: Factory> Drop for Managed<F> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            let id = self.id;
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = shared.complete_return(id, value, false).await {
                    tracing::warn!(error = %e, "auto-return on drop failed");
                }
            });
        }
    }
}
