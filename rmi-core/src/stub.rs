//! C5: the stub — a client-side proxy standing in for an object published
//! on some peer.
//!
//! Spec §9 retires the dynamic proxy: there is no runtime vtable synthesis
//! in Rust, so `Stub` is an explicit struct that implements
//! [`RemoteObject`] itself, forwarding `dispatch` calls over its owning
//! [`crate::peer::PeerHandler`]. This mirrors `freeq-sdk`'s `ClientHandle`
//! — a small cloneable handle wrapping a channel to a background task — but
//! a `Stub` forwards over the wire instead of to an in-process task.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::RmiError;
use crate::peer::{InvokeOptions as PeerInvokeOptions, PeerHandler, PendingInvocation};
use crate::skeleton::{object_identity, InvocationContext, RemoteObject, RmiArg};
use crate::transport::PeerEndpoint;

/// Per-call knobs that stand in for the Java annotations named in the
/// original design (`@Cached`, `@FaultSuppressed`, `async` return type):
/// with no reflection, the caller states them explicitly at the call site
/// instead of the runtime discovering them from the method signature.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub cache_ttl: Option<Duration>,
    pub fault_suppressed: bool,
    pub fire_and_forget: bool,
    pub deadline: Option<Duration>,
}

struct CacheEntry {
    value: RmiArg,
    expires_at: Instant,
}

/// A fingerprint for one call argument, used as part of the `@Cached` key
/// (spec §4.3 step 2) so two calls to the same method with different
/// argument values never collide in the cache. Remote arguments fingerprint
/// by identity rather than value, matching `Stub`'s own identity-based
/// equality.
fn arg_fingerprint(arg: &RmiArg) -> String {
    match arg {
        RmiArg::Value(v) => format!("v:{v:?}"),
        RmiArg::Remote(obj) => format!("r:{}", object_identity(obj)),
    }
}

fn build_cache_key(method_name: &str, param_descriptors: &[String], args: &[RmiArg]) -> (String, Vec<String>, Vec<String>) {
    (
        method_name.to_string(),
        param_descriptors.to_vec(),
        args.iter().map(arg_fingerprint).collect(),
    )
}

/// C5: one stub per `(peer handler, objectId, interface set)`, deduplicated
/// by [`PeerHandler`]'s flyweight cache (see `PeerHandler::get_cached_stub`
/// / `insert_stub`).
pub struct Stub {
    pub object_id: String,
    pub origin: PeerEndpoint,
    peer: Arc<PeerHandler>,
    interfaces: Vec<String>,
    hash_cache: OnceLock<u64>,
    cache: Mutex<HashMap<(String, Vec<String>, Vec<String>), CacheEntry>>,
}

impl Stub {
    /// Constructed only through [`PeerHandler::get_cached_stub`] /
    /// `insert_stub` so the flyweight invariant in spec §3 ("stubs are
    /// deduplicated, not replaced") holds; `new` itself does not consult
    /// the cache.
    pub(crate) fn new(peer: Arc<PeerHandler>, object_id: String, origin: PeerEndpoint, interfaces: Vec<String>) -> Self {
        Self {
            object_id,
            origin,
            peer,
            interfaces,
            hash_cache: OnceLock::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Spec §4.3 step 1: cache `hashCode()` after first resolution.
    pub fn hash_code(&self) -> u64 {
        *self.hash_cache.get_or_init(|| {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            self.origin.host.hash(&mut hasher);
            self.origin.port.hash(&mut hasher);
            self.object_id.hash(&mut hasher);
            hasher.finish()
        })
    }

    fn cached(&self, key: &(String, Vec<String>, Vec<String>)) -> Option<RmiArg> {
        let mut cache = self.cache.lock();
        match cache.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn store_cache(&self, key: (String, Vec<String>, Vec<String>), value: RmiArg, ttl: Duration) {
        self.cache.lock().insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Spec §4.3: build and send the invocation, honoring the cached / async
    /// / fault-suppressed / deadline options.
    pub async fn call(
        &self,
        method_name: &str,
        param_descriptors: Vec<String>,
        args: Vec<RmiArg>,
        options: InvokeOptions,
    ) -> Result<RmiArg, RmiError> {
        let cache_key = build_cache_key(method_name, &param_descriptors, &args);
        if let Some(ttl) = options.cache_ttl {
            if let Some(value) = self.cached(&cache_key) {
                return Ok(value);
            }
            let _ = ttl;
        }

        let result = self
            .peer
            .invoke(
                &self.object_id,
                method_name,
                param_descriptors,
                args,
                PeerInvokeOptions {
                    suppress_faults: options.fault_suppressed,
                    fire_and_forget: options.fire_and_forget,
                    deadline: options.deadline,
                },
            )
            .await;

        if let (Ok(value), Some(ttl)) = (&result, options.cache_ttl) {
            self.store_cache(cache_key, value.clone(), ttl);
        }
        result
    }

    /// Best-effort cancellation of an in-flight call issued by this stub
    /// (spec §4.3 step 5 / §9's cancellation-token redesign note).
    pub async fn interrupt(&self, invocation_id: u64) {
        self.peer.send_interrupt(invocation_id).await;
    }

    /// Send the call without waiting, returning a handle that exposes the
    /// invocation id before the result arrives — the building block for
    /// "start a call, then interrupt it from another task" (spec §4.3 step
    /// 5), which the one-shot `call` method has no way to express since it
    /// only learns the id internally.
    pub async fn call_cancellable(&self, method_name: &str, param_descriptors: Vec<String>, args: Vec<RmiArg>) -> Result<CancellableCall<'_>, RmiError> {
        let pending = self.peer.begin_invoke(&self.object_id, method_name, param_descriptors, args, false).await?;
        Ok(CancellableCall { stub: self, pending })
    }
}

/// A call in flight, issued via [`Stub::call_cancellable`].
pub struct CancellableCall<'a> {
    stub: &'a Stub,
    pending: PendingInvocation,
}

impl<'a> CancellableCall<'a> {
    pub fn invocation_id(&self) -> u64 {
        self.pending.invocation_id
    }

    pub async fn interrupt(&self) {
        self.stub.peer.send_interrupt(self.pending.invocation_id).await;
    }

    pub async fn wait(self) -> Result<RmiArg, RmiError> {
        self.stub.peer.await_invocation(self.pending, false, None).await
    }
}

impl PartialEq for Stub {
    /// Spec §4.3 step 1 / §8 property 3: two stubs are `equals` exactly
    /// when they name the same `(remoteEndpoint, objectId)`, independent of
    /// which `PeerHandler` instance backs either one.
    fn eq(&self, other: &Self) -> bool {
        self.origin == other.origin && self.object_id == other.object_id
    }
}

impl Eq for Stub {}

#[async_trait]
impl RemoteObject for Stub {
    fn interfaces(&self) -> Vec<String> {
        self.interfaces.clone()
    }

    async fn dispatch(
        &self,
        method_name: &str,
        param_descriptors: &[String],
        args: Vec<RmiArg>,
        _ctx: &InvocationContext,
    ) -> Result<RmiArg, RmiError> {
        self.call(method_name, param_descriptors.to_vec(), args, InvokeOptions::default()).await
    }

    fn remote_origin(&self) -> Option<(String, PeerEndpoint)> {
        Some((self.object_id.clone(), self.origin.clone()))
    }
}

impl Drop for Stub {
    /// Spec §4.7 / §9: the DGC finalizer substitute. The last local
    /// reference to this flyweight going away — i.e. the containing `Arc`'s
    /// strong count hitting zero — emits `Finalize(objectId)`. Best-effort:
    /// if the send queue is gone the peer is already disposed and the
    /// origin's lease timer will reclaim the skeleton regardless.
    fn drop(&mut self) {
        self.peer.notify_local_stub_dropped(&self.object_id);
    }
}

// Stub equality, hash-code caching, and the Finalize-on-drop behavior all
// require a live PeerHandler to construct; they are exercised end-to-end in
// rmi-core/tests rather than with a mock handler here.
