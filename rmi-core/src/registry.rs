//! C3: the exported-object registry — `byId`, `byObject`, the auto-export
//! interface set, and fault observers.
//!
//! Grounded on `freeq-server`'s `SharedState`: several indices over the
//! same underlying records, guarded by one lock, mutated through small
//! transactional methods rather than exposing the maps directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::RmiError;
use crate::skeleton::{object_identity, PeerId, RemoteObject, Skeleton};

/// Prefix reserved for auto-generated object ids (spec §6). Application
/// code may not publish under a name starting with this.
pub const AUTO_ID_PREFIX: &str = "#";

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub lease_millis: u64,
    pub default_authorize: bool,
    pub multi_connection_mode: bool,
    pub remote_exception_enabled: bool,
    pub latency_timeout_millis: Option<u64>,
    pub suppress_all_invocation_faults: bool,
    pub codebases: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lease_millis: 600_000,
            default_authorize: true,
            multi_connection_mode: false,
            remote_exception_enabled: true,
            latency_timeout_millis: None,
            suppress_all_invocation_faults: false,
            codebases: Vec::new(),
        }
    }
}

impl RegistryConfig {
    pub fn with_lease_millis(mut self, v: u64) -> Self {
        self.lease_millis = v;
        self
    }
    pub fn with_default_authorize(mut self, v: bool) -> Self {
        self.default_authorize = v;
        self
    }
    pub fn with_multi_connection_mode(mut self, v: bool) -> Self {
        self.multi_connection_mode = v;
        self
    }
    pub fn with_remote_exception_enabled(mut self, v: bool) -> Self {
        self.remote_exception_enabled = v;
        self
    }
    pub fn with_latency_timeout_millis(mut self, v: Option<u64>) -> Self {
        self.latency_timeout_millis = v;
        self
    }
    pub fn with_suppress_all_invocation_faults(mut self, v: bool) -> Self {
        self.suppress_all_invocation_faults = v;
        self
    }
    pub fn with_codebases(mut self, v: Vec<String>) -> Self {
        self.codebases = v;
        self
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_millis)
    }
}

/// Fan-out target for handler disposal (spec §4.1's `broadcastFault`). Each
/// observer runs under its own error boundary: a panicking observer must
/// not stop the broadcast from reaching the rest.
pub trait FaultObserver: Send + Sync {
    fn on_fault(&self, peer: PeerId, error: &RmiError);
}

struct RegistryInner {
    by_id: HashMap<String, Arc<Skeleton>>,
    by_object: HashMap<usize, Arc<Skeleton>>,
    observers: Vec<Arc<dyn FaultObserver>>,
    next_auto_id: u64,
}

pub struct Registry {
    inner: Mutex<RegistryInner>,
    pub config: RegistryConfig,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner {
                by_id: HashMap::new(),
                by_object: HashMap::new(),
                observers: Vec::new(),
                next_auto_id: 1,
            }),
            config,
        })
    }

    /// `publish(name, object)` — pins a skeleton under `name`.
    pub fn publish(&self, name: &str, object: Arc<dyn RemoteObject>) -> Result<Arc<Skeleton>, RmiError> {
        if name.starts_with(AUTO_ID_PREFIX) {
            return Err(RmiError::ReservedName(name.to_string()));
        }
        let mut inner = self.inner.lock();
        let identity = object_identity(&object);
        if let Some(existing) = inner.by_id.get(name) {
            if object_identity(&existing.object) != identity {
                return Err(RmiError::NameAlreadyBound(name.to_string()));
            }
            existing.mark_explicitly_published();
            existing.add_name(name.to_string());
            return Ok(existing.clone());
        }

        let skeleton = if let Some(existing) = inner.by_object.get(&identity) {
            existing.clone()
        } else {
            Arc::new(Skeleton::new(format!("{AUTO_ID_PREFIX}{identity}"), object, false))
        };
        skeleton.mark_explicitly_published();
        skeleton.add_name(name.to_string());
        inner.by_id.insert(name.to_string(), skeleton.clone());
        inner.by_object.insert(identity, skeleton.clone());
        Ok(skeleton)
    }

    /// `publish(object) -> name` — idempotent auto-publish, used for
    /// auto-export of remote-typed arguments (spec §4.4).
    pub fn publish_auto(&self, object: Arc<dyn RemoteObject>) -> Arc<Skeleton> {
        let identity = object_identity(&object);
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.by_object.get(&identity) {
            existing.touch();
            return existing.clone();
        }
        let counter = inner.next_auto_id;
        inner.next_auto_id += 1;
        let id = format!("{AUTO_ID_PREFIX}{counter}");
        let skeleton = Arc::new(Skeleton::new(id.clone(), object, false));
        inner.by_id.insert(id, skeleton.clone());
        inner.by_object.insert(identity, skeleton.clone());
        skeleton
    }

    pub fn lookup_by_id(&self, id: &str) -> Option<Arc<Skeleton>> {
        self.inner.lock().by_id.get(id).cloned()
    }

    pub fn lookup_by_object(&self, object: &Arc<dyn RemoteObject>) -> Option<Arc<Skeleton>> {
        self.inner.lock().by_object.get(&object_identity(object)).cloned()
    }

    /// `unpublish(nameOrObject)` by name: removes exactly that alias (see
    /// DESIGN.md's Open Question resolution on implicit auto-id removal).
    pub fn unpublish_name(&self, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(skeleton) = inner.by_id.remove(name) {
            skeleton.remove_name(name);
            if skeleton.names().is_empty() {
                if skeleton.has_any_remote_ref() {
                    // Still live on a peer: keep the record, but the pin
                    // against lease eviction only lasts until unpublish.
                    skeleton.clear_explicitly_published();
                } else {
                    let identity = object_identity(&skeleton.object);
                    inner.by_object.remove(&identity);
                }
            }
        }
    }

    /// `unpublish(object)` by identity: removes every name this object was
    /// published under, but the skeleton record itself is only dropped once
    /// no peer still references it (same ref-count-aware behavior as
    /// `unpublish_name`, spec §4.1).
    pub fn unpublish_object(&self, object: &Arc<dyn RemoteObject>) {
        let identity = object_identity(object);
        let mut inner = self.inner.lock();
        let Some(skeleton) = inner.by_object.get(&identity).cloned() else {
            return;
        };
        for name in skeleton.names() {
            inner.by_id.remove(&name);
            skeleton.remove_name(&name);
        }
        if skeleton.has_any_remote_ref() {
            skeleton.clear_explicitly_published();
        } else {
            inner.by_object.remove(&identity);
        }
    }

    pub fn attach_fault_observer(&self, observer: Arc<dyn FaultObserver>) {
        self.inner.lock().observers.push(observer);
    }

    pub fn detach_fault_observer(&self, observer: &Arc<dyn FaultObserver>) {
        let target = Arc::as_ptr(observer);
        self.inner.lock().observers.retain(|o| !std::ptr::eq(Arc::as_ptr(o), target));
    }

    pub fn broadcast_fault(&self, peer: PeerId, error: &RmiError) {
        let observers = self.inner.lock().observers.clone();
        for observer in observers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                observer.on_fault(peer, error);
            }));
            if result.is_err() {
                tracing::warn!(%peer, "fault observer panicked; continuing broadcast");
            }
        }
    }

    /// Sweep used by the lease background task (C7, `dgc::LeaseSweeper`).
    pub fn evict_expired(&self) -> Vec<String> {
        let lease = self.config.lease();
        let mut inner = self.inner.lock();
        let expired: Vec<(usize, Vec<String>)> = inner
            .by_object
            .iter()
            .filter(|(_, sk)| sk.is_evictable(lease))
            .map(|(id, sk)| (*id, sk.names()))
            .collect();
        let mut evicted_ids = Vec::new();
        for (identity, names) in expired {
            if let Some(sk) = inner.by_object.remove(&identity) {
                evicted_ids.push(sk.id.clone());
                for name in names {
                    inner.by_id.remove(&name);
                }
            }
        }
        evicted_ids
    }

    pub fn skeleton_count(&self) -> usize {
        self.inner.lock().by_object.len()
    }
}

static NEXT_TEST_PEER: AtomicU64 = AtomicU64::new(100);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::{InvocationContext, RmiArg};
    use crate::value::RmiValue;
    use async_trait::async_trait;

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
        ) -> Result<RmiArg, RmiError> {
            Ok(RmiArg::Value(RmiValue::Unit))
        }
    }

    fn test_peer() -> PeerId {
        NEXT_TEST_PEER.fetch_add(1, Ordering::Relaxed)
    }

    #[test]
    fn publish_rejects_reserved_prefix() {
        let registry = Registry::new(RegistryConfig::default());
        let err = registry.publish("#reserved", Arc::new(Dummy)).unwrap_err();
        assert!(matches!(err, RmiError::ReservedName(_)));
    }

    #[test]
    fn publish_same_name_twice_with_different_objects_fails() {
        let registry = Registry::new(RegistryConfig::default());
        registry.publish("calc", Arc::new(Dummy)).unwrap();
        let err = registry.publish("calc", Arc::new(Dummy)).unwrap_err();
        assert!(matches!(err, RmiError::NameAlreadyBound(_)));
    }

    #[test]
    fn publish_auto_is_idempotent_by_identity() {
        let registry = Registry::new(RegistryConfig::default());
        let obj: Arc<dyn RemoteObject> = Arc::new(Dummy);
        let first = registry.publish_auto(obj.clone());
        let second = registry.publish_auto(obj);
        assert_eq!(first.id, second.id);
        assert_eq!(registry.skeleton_count(), 1);
    }

    #[test]
    fn explicit_publish_pins_against_eviction() {
        let registry = Registry::new(RegistryConfig::default().with_lease_millis(0));
        registry.publish("calc", Arc::new(Dummy)).unwrap();
        let evicted = registry.evict_expired();
        assert!(evicted.is_empty());
        assert_eq!(registry.skeleton_count(), 1);
    }

    #[test]
    fn auto_published_object_is_evicted_after_lease_with_no_refs() {
        let registry = Registry::new(RegistryConfig::default().with_lease_millis(0));
        registry.publish_auto(Arc::new(Dummy));
        let evicted = registry.evict_expired();
        assert_eq!(evicted.len(), 1);
        assert_eq!(registry.skeleton_count(), 0);
    }

    #[test]
    fn auto_published_object_with_live_ref_is_not_evicted() {
        let registry = Registry::new(RegistryConfig::default().with_lease_millis(0));
        let sk = registry.publish_auto(Arc::new(Dummy));
        sk.add_ref(test_peer());
        let evicted = registry.evict_expired();
        assert!(evicted.is_empty());
    }

    #[test]
    fn unpublish_name_removes_only_that_alias() {
        let registry = Registry::new(RegistryConfig::default());
        let sk = registry.publish("calc", Arc::new(Dummy)).unwrap();
        sk.add_name("calculator".into());
        registry.unpublish_name("calc");
        assert!(registry.lookup_by_id("calc").is_none());
        assert!(registry.lookup_by_id("calculator").is_some());
    }

    #[test]
    fn fault_broadcast_survives_panicking_observer() {
        struct Panicky;
        impl FaultObserver for Panicky {
            fn on_fault(&self, _peer: PeerId, _error: &RmiError) {
                panic!("boom");
            }
        }
        struct Counter(Arc<std::sync::atomic::AtomicUsize>);
        impl FaultObserver for Counter {
            fn on_fault(&self, _peer: PeerId, _error: &RmiError) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
        let registry = Registry::new(RegistryConfig::default());
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        registry.attach_fault_observer(Arc::new(Panicky));
        registry.attach_fault_observer(Arc::new(Counter(count.clone())));
        registry.broadcast_fault(1, &RmiError::Transport("eof".into()));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unpublish_name_keeps_the_skeleton_alive_for_a_live_remote_ref() {
        let registry = Registry::new(RegistryConfig::default());
        let sk = registry.publish("calc", Arc::new(Dummy)).unwrap();
        sk.add_ref(test_peer());
        registry.unpublish_name("calc");
        assert!(registry.lookup_by_id("calc").is_none());
        assert_eq!(registry.skeleton_count(), 1);
        assert!(!sk.is_explicitly_published());
    }

    #[test]
    fn unpublish_name_drops_the_skeleton_once_unreferenced() {
        let registry = Registry::new(RegistryConfig::default().with_lease_millis(0));
        registry.publish("calc", Arc::new(Dummy)).unwrap();
        registry.unpublish_name("calc");
        assert_eq!(registry.skeleton_count(), 0);
    }

    #[test]
    fn unpublish_object_removes_every_name_but_keeps_a_referenced_skeleton() {
        let registry = Registry::new(RegistryConfig::default().with_lease_millis(0));
        let obj: Arc<dyn RemoteObject> = Arc::new(Dummy);
        let sk = registry.publish("calc", obj.clone()).unwrap();
        sk.add_name("calculator".into());
        let peer = test_peer();
        sk.add_ref(peer);

        registry.unpublish_object(&obj);

        assert!(registry.lookup_by_id("calc").is_none());
        assert!(registry.lookup_by_id("calculator").is_none());
        assert_eq!(registry.skeleton_count(), 1);
        assert!(!sk.is_explicitly_published());

        sk.remove_ref(peer);
        let evicted = registry.evict_expired();
        assert_eq!(evicted.len(), 1);
    }
}
