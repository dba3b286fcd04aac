//! Abandonment detection (§4.5): reclaiming instances a caller borrowed and
//! never returned or touched.

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::AbandonedConfig;
use crate::error::SwallowedExceptionListener;
use crate::factory::Factory;
use crate::state::{ObjectId, PooledObject};

/// Scan every live instance for staleness and reclaim the ones that have
/// crossed `config.remove_abandoned_timeout` while `ALLOCATED`.
///
/// Reclamation destroys the instance via the factory with no pool-internal
/// lock held (§4.9's "factory calls outside locks" — the per-instance mutex
/// is only held long enough to flip the state to `Abandoned` and take the
/// value). Returns the number of instances reclaimed.
pub async fn scan_and_reclaim<F: Factory>(
    all_objects: &DashMap<ObjectId, Arc<PooledObject<F::Item>>>,
    factory: &F,
    config: &AbandonedConfig,
    listener: &dyn SwallowedExceptionListener,
) -> usize {
    let candidates: Vec<Arc<PooledObject<F::Item>>> = all_objects.iter().map(|e| e.value().clone()).collect();

    let mut reclaimed = 0;
    for obj in candidates {
        if !obj.mark_abandoned_if_stale(config.remove_abandoned_timeout) {
            continue;
        }
        tracing::debug!(id = %obj.id, "reclaiming abandoned instance");
        if let Some(mut value) = obj.invalidate_and_take() {
            if let Err(err) = factory.destroy(&mut value).await {
                let boxed: crate::error::BoxError = Box::new(err);
                listener.on_swallowed_exception("destroy-abandoned", &boxed);
            }
        }
        all_objects.remove(&obj.id);
        reclaimed += 1;
    }
    reclaimed
}
