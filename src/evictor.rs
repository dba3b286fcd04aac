//! Evictor sweep mechanics (§4.4): deciding how many idle instances to test
//! on a tick and running one pass over them. The periodic `tokio::time`
//! loop that drives this lives in `pool.rs`, since replenishing `min_idle`
//! requires the pool's own creation path (`test_on_create`, activation,
//! the create counter) — see DESIGN.md.

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::PoolConfig;
use crate::error::SwallowedExceptionListener;
use crate::eviction::{EvictionContext, EvictionPolicy};
use crate::factory::Factory;
use crate::idle_queue::IdleQueue;
use crate::state::{ObjectId, PooledObject, Reinsert};

/// How many idle instances one evictor tick should inspect (§4.4 step 1).
///
/// Positive `n` is an absolute count, capped at the current idle size.
/// Negative `-k` means "inspect `ceil(idle_size / k)` instances" — a
/// fraction of the deque, so large pools don't pay a full sweep every tick.
pub fn compute_num_tests(num_tests_per_eviction_run: i64, idle_size: usize) -> usize {
    if idle_size == 0 {
        return 0;
    }
    if num_tests_per_eviction_run >= 0 {
        (num_tests_per_eviction_run as usize).min(idle_size)
    } else {
        let k = num_tests_per_eviction_run.unsigned_abs() as usize;
        idle_size.div_ceil(k)
    }
}

/// Outcome of one evictor sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepOutcome {
    pub tested: usize,
    pub evicted: usize,
}

/// Run a single eviction sweep over up to `compute_num_tests(...)` idle
/// candidates, applying `policy` and, when `config.test_while_idle`, the
/// factory's `validate`.
pub async fn sweep_once<F: Factory>(
    idle: &IdleQueue,
    all_objects: &DashMap<ObjectId, Arc<PooledObject<F::Item>>>,
    factory: &F,
    config: &PoolConfig,
    policy: &dyn EvictionPolicy,
    listener: &dyn SwallowedExceptionListener,
) -> SweepOutcome {
    let snapshot = idle.snapshot();
    let num_tests = compute_num_tests(config.num_tests_per_eviction_run, snapshot.len());
    let mut outcome = SweepOutcome::default();
    let mut remaining_idle = snapshot.len();

    for id in snapshot.into_iter().take(num_tests) {
        let Some(obj) = all_objects.get(&id).map(|e| e.value().clone()) else {
            continue;
        };
        if !obj.start_eviction_test() {
            // Already borrowed (or otherwise not idle) by the time we got
            // here; nothing of ours to reinsert.
            continue;
        }
        // Best-effort: may already be gone if a borrower raced us between
        // the snapshot and here (see state.rs's EVICTION_RETURN_TO_HEAD).
        idle.remove(id);
        remaining_idle = remaining_idle.saturating_sub(1);
        outcome.tested += 1;

        let ctx = EvictionContext {
            idle_duration: obj.idle_duration(),
            idle_count: remaining_idle + 1,
            min_idle: config.min_idle,
        };

        if policy.should_evict(ctx, config) {
            destroy_and_remove(&obj, id, all_objects, factory, listener).await;
            outcome.evicted += 1;
            continue;
        }

        if config.test_while_idle {
            if !obj.start_idle_validation() {
                // Raced to ALLOCATED between end of hard/soft check and here;
                // nothing to do, the borrower owns it now.
                continue;
            }
            // Moved out (rather than validated through `with_value`) so the
            // factory's `&T`-borrowing future isn't held across the lock —
            // see `take_value_for_test`'s doc comment.
            let mut value = obj.take_value_for_test();
            let valid = factory.validate(&value).await;
            if !valid {
                obj.force_invalid();
                if let Err(err) = factory.destroy(&mut value).await {
                    let boxed: crate::error::BoxError = Box::new(err);
                    listener.on_swallowed_exception("destroy-failed-validation", &boxed);
                }
                all_objects.remove(&id);
                outcome.evicted += 1;
                continue;
            }
            obj.put_value_after_test(value);
            match obj.end_idle_validation(true) {
                Reinsert::Original => idle.push_back(id),
                Reinsert::Head => idle.push_front(id),
                Reinsert::None => {}
            }
        } else {
            match obj.end_eviction_test() {
                Reinsert::Original => idle.push_back(id),
                Reinsert::Head => idle.push_front(id),
                Reinsert::None => {}
            }
        }
    }

    outcome
}

async fn destroy_and_remove<F: Factory>(
    obj: &PooledObject<F::Item>,
    id: ObjectId,
    all_objects: &DashMap<ObjectId, Arc<PooledObject<F::Item>>>,
    factory: &F,
    listener: &dyn SwallowedExceptionListener,
) {
    tracing::debug!(%id, "evicting idle instance");
    if let Some(mut value) = obj.invalidate_and_take() {
        if let Err(err) = factory.destroy(&mut value).await {
            let boxed: crate::error::BoxError = Box::new(err);
            listener.on_swallowed_exception("destroy-evicted", &boxed);
        }
    }
    all_objects.remove(&id);
}
