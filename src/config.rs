//! Pool configuration (§6).

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration recognized by [`crate::Pool`], mirroring §6's table.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolConfig {
    /// Cap on live instances. Negative means unlimited.
    pub max_total: i64,
    /// Cap on idle-deque size; excess instances are destroyed on return.
    /// Negative means unlimited.
    pub max_idle: i64,
    /// Maintenance refills the idle deque to this level.
    pub min_idle: usize,
    /// If `true`, `borrow` waits (up to `max_wait`) when exhausted; if
    /// `false`, it fails immediately with [`Error::Exhausted`].
    pub block_when_exhausted: bool,
    /// Default wait for a blocking borrow. `None` means wait forever.
    pub max_wait: Option<Duration>,
    /// `true` pops idle instances from the front (LIFO) on borrow; `false`
    /// pops from the back (FIFO). Waiter fairness is always FIFO regardless
    /// of this setting (§5).
    pub lifo: bool,
    /// Validate instances the factory just created.
    pub test_on_create: bool,
    /// Validate instances immediately before lending them out.
    pub test_on_borrow: bool,
    /// Validate instances immediately before accepting a return.
    pub test_on_return: bool,
    /// Validate idle instances during evictor sweeps.
    pub test_while_idle: bool,
    /// Interval between evictor ticks. `None` (or `<= 0`) disables the
    /// evictor entirely.
    pub time_between_eviction_runs: Option<Duration>,
    /// Size of the idle slice the evictor inspects per tick. Positive values
    /// are an absolute count (capped at the current idle size); negative `-k`
    /// means "ceil(idle_size / k)" (§4.4 step 1).
    pub num_tests_per_eviction_run: i64,
    /// Hard idle-time eviction threshold.
    pub min_evictable_idle_time: Duration,
    /// Soft idle-time eviction threshold, active only while
    /// `idle_count > min_idle`. `None` disables soft eviction.
    pub soft_min_evictable_idle_time: Option<Duration>,
    /// Abandonment detection settings. `None` disables the detector
    /// entirely (both on-borrow and on-maintenance scans).
    pub abandoned: Option<AbandonedConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: -1,
            max_idle: 8,
            min_idle: 0,
            block_when_exhausted: true,
            max_wait: None,
            lifo: true,
            test_on_create: false,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            time_between_eviction_runs: None,
            num_tests_per_eviction_run: 3,
            min_evictable_idle_time: Duration::from_secs(30 * 60),
            soft_min_evictable_idle_time: None,
            abandoned: None,
        }
    }
}

impl PoolConfig {
    /// Validate the configuration, returning [`Error::Configuration`] if
    /// any field is internally inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.max_total == 0 {
            return Err(Error::configuration("max_total must not be 0"));
        }
        if self.max_total > 0 && self.min_idle as i64 > self.max_total {
            return Err(Error::configuration(format!(
                "min_idle ({}) must not exceed max_total ({})",
                self.min_idle, self.max_total
            )));
        }
        if self.num_tests_per_eviction_run == 0 {
            return Err(Error::configuration(
                "num_tests_per_eviction_run must not be 0",
            ));
        }
        if let Some(abandoned) = &self.abandoned {
            abandoned.validate()?;
        }
        Ok(())
    }

    /// Whether the evictor should run at all.
    #[must_use]
    pub fn eviction_enabled(&self) -> bool {
        matches!(self.time_between_eviction_runs, Some(d) if !d.is_zero())
    }
}

/// Abandonment-detection settings (§6's `abandonedConfig.*`).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AbandonedConfig {
    /// Scan allocated instances for abandonment when a `borrow` finds the
    /// pool near starvation (§4.6 step 2).
    pub remove_abandoned_on_borrow: bool,
    /// Scan allocated instances for abandonment on every evictor tick
    /// (§4.4 step 5).
    pub remove_abandoned_on_maintenance: bool,
    /// How long an allocated instance may go unused before it is considered
    /// abandoned.
    pub remove_abandoned_timeout: Duration,
}

impl Default for AbandonedConfig {
    fn default() -> Self {
        Self {
            remove_abandoned_on_borrow: false,
            remove_abandoned_on_maintenance: false,
            remove_abandoned_timeout: Duration::from_secs(300),
        }
    }
}

impl AbandonedConfig {
    fn validate(&self) -> Result<()> {
        if self.remove_abandoned_timeout.is_zero() {
            return Err(Error::configuration(
                "remove_abandoned_timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let config = PoolConfig::default();
        assert_eq!(config.max_total, -1);
        assert_eq!(config.max_idle, 8);
        assert_eq!(config.min_idle, 0);
        assert!(config.block_when_exhausted);
        assert!(config.max_wait.is_none());
        assert!(config.lifo);
        assert_eq!(config.num_tests_per_eviction_run, 3);
        assert_eq!(config.min_evictable_idle_time, Duration::from_secs(1800));
        assert!(config.soft_min_evictable_idle_time.is_none());
    }

    #[test]
    fn rejects_zero_max_total() {
        let config = PoolConfig {
            max_total: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_min_idle_above_max_total() {
        let config = PoolConfig {
            max_total: 2,
            min_idle: 3,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn negative_max_total_is_unlimited_and_skips_min_idle_check() {
        let config = PoolConfig {
            max_total: -1,
            min_idle: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn eviction_enabled_reflects_interval() {
        let mut config = PoolConfig::default();
        assert!(!config.eviction_enabled());
        config.time_between_eviction_runs = Some(Duration::from_millis(50));
        assert!(config.eviction_enabled());
    }

    #[test]
    fn abandoned_config_rejects_zero_timeout() {
        let config = PoolConfig {
            abandoned: Some(AbandonedConfig {
                remove_abandoned_timeout: Duration::ZERO,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
