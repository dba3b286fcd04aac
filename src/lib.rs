#![allow(clippy::excessive_nesting)]

//! # respool
//!
//! A generic, concurrent in-process object pool: LIFO/FIFO borrow with FIFO
//! waiter fairness, background idle eviction, and abandonment detection,
//! built around a pluggable [`Factory`] for whatever is actually expensive
//! to create — database connections, TLS sessions, parser buffers.
//!
//! The state machine (`state`) and idle deque (`idle_queue`) are the two
//! pieces worth reading first; everything else in [`pool`] choreographs
//! around them.

pub mod abandoned;
pub mod config;
pub mod error;
pub mod eviction;
pub mod evictor;
pub mod factory;
pub mod idle_queue;
pub mod pool;
pub mod state;

pub use config::{AbandonedConfig, PoolConfig};
pub use error::{Error, Result, SwallowedExceptionListener, TracingSwallowedExceptionListener};
pub use eviction::{DefaultEvictionPolicy, EvictionContext, EvictionPolicy};
pub use factory::Factory;
pub use pool::{Managed, Pool, PoolBuilder, PoolStats};
pub use state::ObjectId;
