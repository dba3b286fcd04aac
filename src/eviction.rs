//! Eviction policy (§4.3): the pure decision of whether an idle instance
//! should be destroyed during an evictor sweep.

use std::time::Duration;

use crate::config::PoolConfig;

/// Inputs the policy needs about one candidate and the pool it lives in.
#[derive(Debug, Clone, Copy)]
pub struct EvictionContext {
    /// How long the instance has been sitting idle.
    pub idle_duration: Duration,
    /// Idle-deque size *before* this candidate would be evicted.
    pub idle_count: usize,
    /// Configured `min_idle` — soft eviction never drops below it.
    pub min_idle: usize,
}

/// Decides whether a candidate idle instance should be evicted.
///
/// The default implementation mirrors commons-pool2's
/// `DefaultEvictionPolicy`: evict if the hard `min_evictable_idle_time` is
/// exceeded, OR if the soft threshold is exceeded *and* the idle count is
/// still above `min_idle` after removing this one. Per §9's Open Question 2,
/// both checks always run — a configured hard timeout never short-circuits
/// the soft-eviction check.
pub trait EvictionPolicy: Send + Sync + 'static {
    fn should_evict(&self, ctx: EvictionContext, config: &PoolConfig) -> bool;
}

/// The default, commons-pool2-compatible policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEvictionPolicy;

impl EvictionPolicy for DefaultEvictionPolicy {
    fn should_evict(&self, ctx: EvictionContext, config: &PoolConfig) -> bool {
        if ctx.idle_duration >= config.min_evictable_idle_time {
            return true;
        }
        if let Some(soft) = config.soft_min_evictable_idle_time {
            if ctx.idle_duration >= soft && ctx.idle_count > ctx.min_idle {
                return true;
            }
        }
        false
    }
}
