//! C4: the skeleton — a published object's server-side record, its alias
//! names, its per-peer reference counts, and method dispatch.
//!
//! Spec §9 replaces reflection-based dispatch with a precomputed
//! "interface-method registry": there is no `invoke(name, args)` that walks
//! a runtime method table, only [`RemoteObject::dispatch`], which an
//! application implements as a `match` over `(method_name,
//! param_descriptors)`. The match arms *are* the dispatch table; the
//! exact-match-over-boxed preference required by spec §4.2's overload rule
//! falls out of matching on [`crate::value::RmiValue::type_descriptor`]
//! strings rather than any runtime type inspection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::RmiError;
use crate::transport::PeerEndpoint;
use crate::value::RmiValue;

/// Identity of a peer handler, assigned when it is constructed. Skeletons
/// key their reference counts on this rather than a `PeerEndpoint` so that
/// two distinct handlers to the same host/port (multi-connection mode)
/// never get conflated into one refcount bucket.
pub type PeerId = u64;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_peer_id() -> PeerId {
    NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Per-invocation context handed to [`RemoteObject::dispatch`]: who is
/// calling, and a cooperative cancellation flag the method body may poll
/// for spec §4.3 step 5's thread-interrupt substitute.
#[derive(Clone)]
pub struct InvocationContext {
    pub peer_id: PeerId,
    pub auth_id: Option<String>,
    cancelled: Arc<AtomicBool>,
}

impl InvocationContext {
    pub fn new(peer_id: PeerId, auth_id: Option<String>, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            peer_id,
            auth_id,
            cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// An invocation argument or return value after stub-vs-value decoding:
/// either a plain application value, or a live remote reference (spec
/// §4.5's pointer routing — a stub that crosses back onto the object's own
/// process "becomes" the real object; [`crate::peer::PeerHandler`] resolves
/// that before a [`RemoteObject`] ever sees it, so from here the two cases
/// look the same).
///
/// Both [`Skeleton::object`] and [`crate::stub::Stub`] implement
/// `RemoteObject`, so a `Remote` arg works uniformly whether it resolved to
/// the genuine local object or to a proxy forwarding back over the wire —
/// this is the substitute for Java's dynamic-proxy-as-argument pattern in
/// spec §9's S3 scenario (a callback object passed to a remote method).
#[derive(Clone)]
pub enum RmiArg {
    Value(RmiValue),
    Remote(Arc<dyn RemoteObject>),
}

impl std::fmt::Debug for RmiArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RmiArg::Value(v) => f.debug_tuple("Value").field(v).finish(),
            RmiArg::Remote(_) => f.debug_tuple("Remote").finish(),
        }
    }
}

impl RmiArg {
    pub fn as_value(&self) -> Option<&RmiValue> {
        match self {
            RmiArg::Value(v) => Some(v),
            RmiArg::Remote(_) => None,
        }
    }

    pub fn as_remote(&self) -> Option<&Arc<dyn RemoteObject>> {
        match self {
            RmiArg::Remote(r) => Some(r),
            RmiArg::Value(_) => None,
        }
    }

    pub fn type_descriptor(&self) -> &str {
        match self {
            RmiArg::Value(v) => v.type_descriptor(),
            RmiArg::Remote(_) => "remote",
        }
    }
}

/// An object an application publishes on the registry, or a proxy standing
/// in for one reached over the network. `dispatch` is the hand-written
/// substitute for reflection (spec §9); it is async so that a
/// [`crate::stub::Stub`] can implement this trait by forwarding the call
/// over its peer handler and awaiting the response, letting application
/// code treat a local object and a remote proxy identically.
#[async_trait]
pub trait RemoteObject: Send + Sync + 'static {
    /// The interface names this object satisfies, used for auto-export
    /// checks and `InterfaceReply` responses.
    fn interfaces(&self) -> Vec<String>;

    async fn dispatch(
        &self,
        method_name: &str,
        param_descriptors: &[String],
        args: Vec<RmiArg>,
        ctx: &InvocationContext,
    ) -> Result<RmiArg, RmiError>;

    /// Whether a given method is annotated fault-suppressed (spec §4.3
    /// step 4, §8 property 7): a disposed handler or transport fault
    /// yields the type-default value instead of an error.
    fn is_fault_suppressed(&self, _method_name: &str) -> bool {
        false
    }

    /// `Some((objectId, originEndpoint))` if this `RemoteObject` is itself a
    /// proxy standing in for an object published elsewhere (a
    /// [`crate::stub::Stub`]); `None` for a genuine local implementation.
    /// The peer handler consults this when encoding an `RmiArg::Remote`
    /// argument, so a stub that has already traveled once keeps pointing at
    /// its true origin rather than the hop that is re-sending it (spec
    /// §4.5's pointer-routing invariant).
    fn remote_origin(&self) -> Option<(String, PeerEndpoint)> {
        None
    }
}

/// Returns a stable identity for an exported object: the data address of
/// its trait-object pointer, stripped of the vtable by casting to a thin
/// pointer. Two `Arc`s cloned from the same allocation always compare
/// equal under this key, and two distinct objects never collide — this is
/// the "identity-based, never merges two distinct objects" rule in spec §4.1.
pub fn object_identity(object: &Arc<dyn RemoteObject>) -> usize {
    Arc::as_ptr(object) as *const u8 as usize
}

/// C4: one record per exported object (spec §3's "Skeleton").
pub struct Skeleton {
    pub id: String,
    pub object: Arc<dyn RemoteObject>,
    names: Mutex<std::collections::HashSet<String>>,
    remote_refs: Mutex<HashMap<PeerId, u64>>,
    last_referenced_at: Mutex<Instant>,
    explicitly_published: AtomicBool,
}

impl Skeleton {
    pub fn new(id: String, object: Arc<dyn RemoteObject>, explicitly_published: bool) -> Self {
        let mut names = std::collections::HashSet::new();
        if !explicitly_published {
            // auto-generated ids are their own alias (spec §3 invariant)
            names.insert(id.clone());
        }
        Self {
            id,
            object,
            names: Mutex::new(names),
            remote_refs: Mutex::new(HashMap::new()),
            last_referenced_at: Mutex::new(Instant::now()),
            explicitly_published: AtomicBool::new(explicitly_published),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.names.lock().iter().cloned().collect()
    }

    pub fn add_name(&self, name: String) {
        self.names.lock().insert(name);
    }

    pub fn remove_name(&self, name: &str) {
        self.names.lock().remove(name);
    }

    pub fn is_explicitly_published(&self) -> bool {
        self.explicitly_published.load(Ordering::Relaxed)
    }

    pub fn mark_explicitly_published(&self) {
        self.explicitly_published.store(true, Ordering::Relaxed);
    }

    /// Lifts the eviction pin (spec §3: the pin lasts "until explicit
    /// unpublish"). Called once a skeleton's last published name is removed
    /// but it survives because a peer still references it.
    pub fn clear_explicitly_published(&self) {
        self.explicitly_published.store(false, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        *self.last_referenced_at.lock() = Instant::now();
    }

    /// Receipt of `NewReference(objectId)` from `peer`.
    pub fn add_ref(&self, peer: PeerId) {
        *self.remote_refs.lock().entry(peer).or_insert(0) += 1;
        self.touch();
    }

    /// Receipt of `Finalize(objectId)` from `peer`. Negative counts are
    /// clamped to zero (spec §4.4): a buggy or duplicate `Finalize` cannot
    /// drive the bookkeeping negative.
    pub fn remove_ref(&self, peer: PeerId) {
        let mut refs = self.remote_refs.lock();
        if let Some(count) = refs.get_mut(&peer) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn has_any_remote_ref(&self) -> bool {
        self.remote_refs.lock().values().any(|c| *c > 0)
    }

    /// Spec §3: "eligible for eviction when all remoteRefs are zero and the
    /// lease has elapsed and it was not explicitly published."
    pub fn is_evictable(&self, lease: Duration) -> bool {
        if self.is_explicitly_published() {
            return false;
        }
        if self.has_any_remote_ref() {
            return false;
        }
        self.last_referenced_at.lock().elapsed() >= lease
    }
}

impl std::fmt::Debug for Skeleton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Skeleton")
            .field("id", &self.id)
            .field("names", &self.names())
            .field("explicitly_published", &self.is_explicitly_published())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;
    #[async_trait]
    impl RemoteObject for Echo {
        fn interfaces(&self) -> Vec<String> {
            vec!["Echo".into()]
        }
        async fn dispatch(
            &self,
            method_name: &str,
            _params: &[String],
            args: Vec<RmiArg>,
            _ctx: &InvocationContext,
        ) -> Result<RmiArg, RmiError> {
            match method_name {
                "echo" => Ok(args.into_iter().next().unwrap_or(RmiArg::Value(RmiValue::Unit))),
                other => Err(RmiError::NoSuchMethod {
                    object_id: "echo".into(),
                    method: other.into(),
                }),
            }
        }
    }

    #[test]
    fn auto_generated_id_is_its_own_alias() {
        let sk = Skeleton::new("#1".into(), Arc::new(Echo), false);
        assert!(sk.names().contains(&"#1".to_string()));
    }

    #[test]
    fn explicitly_published_has_no_implicit_alias() {
        let sk = Skeleton::new("calc".into(), Arc::new(Echo), true);
        assert!(sk.names().is_empty());
    }

    #[test]
    fn eviction_requires_zero_refs_and_elapsed_lease_and_not_pinned() {
        let sk = Skeleton::new("#1".into(), Arc::new(Echo), false);
        assert!(sk.is_evictable(Duration::from_millis(0)));
        sk.add_ref(1);
        assert!(!sk.is_evictable(Duration::from_millis(0)));
        sk.remove_ref(1);
        assert!(sk.is_evictable(Duration::from_millis(0)));

        let pinned = Skeleton::new("calc".into(), Arc::new(Echo), true);
        assert!(!pinned.is_evictable(Duration::from_millis(0)));
    }

    #[test]
    fn negative_refcounts_clamp_to_zero() {
        let sk = Skeleton::new("#1".into(), Arc::new(Echo), false);
        sk.remove_ref(1);
        sk.remove_ref(1);
        assert!(!sk.has_any_remote_ref());
    }

    #[test]
    fn object_identity_distinguishes_distinct_instances() {
        let a: Arc<dyn RemoteObject> = Arc::new(Echo);
        let b: Arc<dyn RemoteObject> = Arc::new(Echo);
        let a2 = a.clone();
        assert_eq!(object_identity(&a), object_identity(&a2));
        assert_ne!(object_identity(&a), object_identity(&b));
    }
}
