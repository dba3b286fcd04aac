//! The object factory contract (§6: "consumed" interface).
//!
//! The factory is the pool's only collaborator for actually constructing and
//! disposing of pooled instances; it is out of scope for this crate's own
//! implementation (callers supply it), but the trait shape lives here
//! because every other module depends on it.

use std::future::Future;

use crate::error::Result;

/// User-supplied factory for a pooled type.
///
/// Mirrors commons-pool2's `PooledObjectFactory`: `make`/`destroy` create and
/// dispose of instances, `validate`/`activate`/`passivate` run around each
/// borrow/return. All methods are async so factories may perform I/O (opening
/// a socket, pinging a server) without blocking a pool-internal lock — §4.9's
/// "factory calls outside locks" invariant depends on this.
///
/// Default `validate`/`activate`/`passivate` are no-ops, matching
/// commons-pool2's `BasePooledObjectFactory` defaults; only `make` must be
/// provided.
pub trait Factory: Send + Sync + 'static {
    /// The pooled instance type.
    type Item: Send + 'static;

    /// Create a brand-new instance. Called outside any pool-internal lock.
    fn make(&self) -> impl Future<Output = Result<Self::Item>> + Send;

    /// Dispose of an instance permanently. Errors are swallowed by the pool
    /// (§7) and reported via [`crate::error::SwallowedExceptionListener`];
    /// this method itself returns a plain `Result` so factories can still
    /// express failure for logging purposes.
    fn destroy(
        &self,
        _instance: &mut Self::Item,
    ) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Check whether an instance is still usable. Must not itself throw in
    /// the sense of propagating a caller-visible error; returning `Ok(false)`
    /// is the only way to fail validation. The default accepts everything.
    fn validate(&self, _instance: &Self::Item) -> impl Future<Output = bool> + Send {
        async { true }
    }

    /// Re-initialize an instance immediately before it is lent out.
    /// Failure causes the instance to be destroyed (§4.6 step f).
    fn activate(&self, _instance: &mut Self::Item) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Reset an instance immediately after it is returned, before it is
    /// placed back in the idle deque. Failure causes destruction (§4.7 step
    /// 4).
    fn passivate(&self, _instance: &mut Self::Item) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Minimal factories reused across this crate's unit and integration
    //! tests.
    use super::Factory;
    use crate::error::{Error, Result};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Hands out monotonically increasing `u64`s; never fails any step.
    #[derive(Default)]
    pub struct CountingFactory {
        pub next: AtomicU64,
        pub made: AtomicUsize,
        pub destroyed: AtomicUsize,
    }

    impl Factory for CountingFactory {
        type Item = u64;

        async fn make(&self) -> Result<u64> {
            self.made.fetch_add(1, Ordering::SeqCst);
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }

        async fn destroy(&self, _instance: &mut u64) -> Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Fails `make` a configurable number of times before succeeding.
    #[derive(Default)]
    pub struct FlakyCreateFactory {
        pub remaining_failures: AtomicUsize,
        pub next: AtomicU64,
    }

    impl Factory for FlakyCreateFactory {
        type Item = u64;

        async fn make(&self) -> Result<u64> {
            let remaining = self.remaining_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Create(Box::new(std::io::Error::other("flaky"))));
            }
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }
    }

    /// `validate` returns `false` exactly `fail_first_n` times, then `true`.
    pub struct InvalidatingFactory {
        pub fail_first_n: AtomicUsize,
        pub next: AtomicU64,
        pub destroyed: AtomicUsize,
    }

    impl Factory for InvalidatingFactory {
        type Item = u64;

        async fn make(&self) -> Result<u64> {
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }

        async fn destroy(&self, _instance: &mut u64) -> Result<()> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn validate(&self, _instance: &u64) -> bool {
            let remaining = self.fail_first_n.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first_n.fetch_sub(1, Ordering::SeqCst);
                false
            } else {
                true
            }
        }
    }
}
