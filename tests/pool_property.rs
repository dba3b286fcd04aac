//! Property tests for the core pool invariants: capacity bounds, the
//! created/destroyed/live counter identity, and FIFO waiter fairness under
//! contention.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use proptest::prelude::*;
use respool::{Factory, Pool, PoolConfig, Result};

struct CountingFactory {
    counter: AtomicU64,
    destroyed: AtomicU64,
}

impl CountingFactory {
    fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        }
    }
}

impl Factory for CountingFactory {
    type Item = u64;

    async fn make(&self) -> Result<u64> {
        Ok(self.counter.fetch_add(1, Ordering::SeqCst))
    }

    async fn destroy(&self, _instance: &mut u64) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Invariant 1: idleSize + activeCount <= liveCount <= maxTotal
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(30))]

    #[test]
    fn active_plus_idle_never_exceeds_max_total(
        max_total in 1i64..8,
        ops in proptest::collection::vec(prop_oneof![Just(true), Just(false)], 1..30),
        lifo in any::<bool>(),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

        rt.block_on(async {
            let config = PoolConfig {
                max_total,
                max_idle: max_total,
                lifo,
                block_when_exhausted: false,
                ..Default::default()
            };
            let pool = Pool::new(CountingFactory::new(), config).unwrap();
            let mut held = Vec::new();

            for op_is_borrow in &ops {
                if *op_is_borrow {
                    if let Ok(managed) = pool.borrow().await {
                        held.push(managed);
                    }
                } else if !held.is_empty() {
                    let managed = held.pop().unwrap();
                    pool.return_object(managed).await.unwrap();
                }

                let stats = pool.stats();
                prop_assert!(
                    (stats.num_idle + stats.num_active) as i64 <= max_total,
                    "idle={} + active={} exceeds max_total={}",
                    stats.num_idle, stats.num_active, max_total,
                );
            }

            for managed in held {
                pool.return_object(managed).await.unwrap();
            }
            let stats = pool.stats();
            prop_assert_eq!(stats.num_active, 0);
            Ok(())
        })?;
    }
}

// ---------------------------------------------------------------------------
// Invariant 4: createdCount - destroyedCount == liveCount at quiescence.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn created_minus_destroyed_equals_live_at_quiescence() {
    let factory = std::sync::Arc::new(CountingFactory::new());
    let pool = respool_test_support::pool_with_shared_factory(factory.clone(), PoolConfig {
        max_total: 4,
        max_idle: 4,
        ..Default::default()
    });

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pool.borrow().await.unwrap());
    }
    // Invalidate two, return two normally.
    pool.invalidate_object(held.pop().unwrap()).await.unwrap();
    pool.invalidate_object(held.pop().unwrap()).await.unwrap();
    for managed in held {
        pool.return_object(managed).await.unwrap();
    }

    let stats = pool.stats();
    let live = (stats.num_idle + stats.num_active) as u64;
    assert_eq!(stats.created - factory.destroyed.load(Ordering::SeqCst), live);
}

// ---------------------------------------------------------------------------
// Invariant 5: FIFO waiter fairness under contention.
// ---------------------------------------------------------------------------

#[tokio::test]
async fn earliest_waiter_receives_the_next_returned_instance() {
    let mut config = PoolConfig {
        max_total: 1,
        max_idle: 1,
        block_when_exhausted: true,
        ..Default::default()
    };
    config.max_wait = Some(Duration::from_secs(5));
    let pool = Pool::new(CountingFactory::new(), config).unwrap();

    let held = pool.borrow().await.unwrap();

    let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut waiters = Vec::new();
    for i in 0..3 {
        let pool = pool.clone();
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            let managed = pool.borrow().await.unwrap();
            order.lock().unwrap().push(i);
            managed
        }));
        // Ensure waiters register strictly in spawn order before the next
        // one starts racing for the single slot.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    pool.return_object(held).await.unwrap();
    let first = waiters.remove(0).await.unwrap();
    pool.return_object(first).await.unwrap();
    let second = waiters.remove(0).await.unwrap();
    pool.return_object(second).await.unwrap();
    let third = waiters.remove(0).await.unwrap();
    pool.return_object(third).await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

mod respool_test_support {
    use respool::{Factory, Pool, PoolConfig, Result};
    use std::sync::Arc;

    pub struct ArcFactory<F>(pub Arc<F>);

    impl<F: Factory> Factory for ArcFactory<F> {
        type Item = F::Item;

        async fn make(&self) -> Result<Self::Item> {
            self.0.make().await
        }

        async fn destroy(&self, instance: &mut Self::Item) -> Result<()> {
            self.0.destroy(instance).await
        }

        async fn validate(&self, instance: &Self::Item) -> bool {
            self.0.validate(instance).await
        }

        async fn activate(&self, instance: &mut Self::Item) -> Result<()> {
            self.0.activate(instance).await
        }

        async fn passivate(&self, instance: &mut Self::Item) -> Result<()> {
            self.0.passivate(instance).await
        }
    }

    pub fn pool_with_shared_factory<F: Factory>(factory: Arc<F>, config: PoolConfig) -> Pool<ArcFactory<F>> {
        Pool::new(ArcFactory(factory), config).unwrap()
    }
}
