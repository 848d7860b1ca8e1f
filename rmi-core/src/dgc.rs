//! C7: the lease sweeper — the background half of distributed garbage
//! collection. `Skeleton`/`Registry` (C3/C4) carry the refcount and lease
//! bookkeeping; this module is just the periodic timer that calls
//! `Registry::evict_expired`, grounded on the teacher's periodic
//! housekeeping tasks (e.g. `freeq-server`'s idle-connection reaper) that
//! run a fixed-interval `tokio::time::interval` loop for the life of the
//! process.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::registry::Registry;

/// Sweeps `lease_millis / 4` rather than the lease itself: reclaiming
/// shortly after expiry instead of waiting up to a full extra lease period.
/// A sweep interval of zero (lease configured to zero, used in tests) is
/// clamped up so the background task doesn't spin.
fn sweep_interval(registry: &Registry) -> Duration {
    let lease = registry.config.lease();
    let quarter = lease / 4;
    quarter.max(Duration::from_millis(50))
}

/// Owns the periodic sweep task; dropping it stops the sweep.
pub struct LeaseSweeper {
    handle: tokio::task::JoinHandle<()>,
}

impl LeaseSweeper {
    /// Spawns a task that calls `registry.evict_expired()` on a fixed
    /// interval until the registry itself is dropped (held only via a
    /// `Weak`, so the sweeper never keeps the registry alive on its own).
    pub fn spawn(registry: &Arc<Registry>) -> Self {
        let interval = sweep_interval(registry);
        let weak = Arc::downgrade(registry);
        let handle = tokio::spawn(Self::run(weak, interval));
        Self { handle }
    }

    async fn run(registry: Weak<Registry>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let Some(registry) = registry.upgrade() else { break };
            let evicted = registry.evict_expired();
            if !evicted.is_empty() {
                tracing::debug!(count = evicted.len(), ids = ?evicted, "lease sweep evicted skeletons");
            }
        }
    }
}

impl Drop for LeaseSweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use crate::skeleton::{InvocationContext, RemoteObject, RmiArg};
    use crate::value::RmiValue;
    use async_trait::async_trait;
    use std::time::Instant;

    struct Dummy;
    #[async_trait]
    impl RemoteObject for Dummy {
        fn interfaces(&self) -> Vec<String> {
            vec!["Dummy".into()]
        }
        async fn dispatch(
            &self,
            _m: &str,
            _p: &[String],
            _a: Vec<RmiArg>,
            _ctx: &InvocationContext,
        ) -> Result<RmiArg, crate::error::RmiError> {
            Ok(RmiArg::Value(RmiValue::Unit))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_an_auto_published_object_past_its_lease() {
        let registry = Registry::new(RegistryConfig::default().with_lease_millis(0));
        registry.publish_auto(Arc::new(Dummy));
        assert_eq!(registry.skeleton_count(), 1);

        let sweeper = LeaseSweeper::spawn(&registry);
        let deadline = Instant::now() + Duration::from_secs(1);
        while registry.skeleton_count() > 0 && Instant::now() < deadline {
            tokio::time::advance(Duration::from_millis(60)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.skeleton_count(), 0);
        drop(sweeper);
    }
}
