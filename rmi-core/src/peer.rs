//! C6: the peer handler — the core loop owning one connection.
//!
//! Grounded on `freeq-server/src/connection/mod.rs`'s
//! `handle_io_with_meta`: a writer task draining an `mpsc` channel paired
//! with a reader loop that dispatches by message tag, plus
//! `arti-rpcserver::Connection`'s per-request cancel-handle table and
//! litep2p's `oneshot`-per-pending-request completion primitive.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Semaphore};

use crate::auth::{run_initiator_handshake, run_listener_handshake, Authenticator, Authorizer, AuthTarget};
use crate::codec::{read_message, write_message, ArgSlot, Message, RemoteErrorPayload, ReturnOutcome};
use crate::error::{RemoteErrorValue, RmiError};
use crate::facade::RmiRegistryFacade;
use crate::registry::Registry;
use crate::skeleton::{next_peer_id, InvocationContext, PeerId, RemoteObject, RmiArg};
use crate::stub::Stub;
use crate::transport::{ByteStream, PeerEndpoint};
use crate::value::{RmiValue, ValueCodec};

pub const DEFAULT_WORKER_POOL_SIZE: usize = 8;
const SEND_QUEUE_CAPACITY: usize = 256;
const LIVENESS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Authenticating,
    Running,
    Disposing,
    Disposed,
}

/// Per-call knobs threaded down from [`crate::stub::InvokeOptions`].
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub suppress_faults: bool,
    pub fire_and_forget: bool,
    pub deadline: Option<Duration>,
}

struct PendingSlot {
    tx: oneshot::Sender<Result<RmiArg, RmiError>>,
    suppress_faults: bool,
}

/// A sent-but-not-yet-answered invocation: the handle needed to interrupt
/// it (spec §4.3 step 5) before waiting for the result.
pub struct PendingInvocation {
    pub invocation_id: u64,
    rx: oneshot::Receiver<Result<RmiArg, RmiError>>,
}

/// Everything a [`PeerHandler`] needs from the process that owns it, kept
/// as one struct so `accept`/`connect` callers don't pass six separate
/// arguments (spec §9's "injected collaborator" note applies here too: the
/// registry and facade are handed in, never reached through a static).
pub struct PeerHandlerConfig {
    pub local_endpoint: PeerEndpoint,
    pub worker_pool_size: usize,
    pub registry: Arc<Registry>,
    pub facade: Weak<RmiRegistryFacade>,
    pub value_codec: Arc<dyn ValueCodec>,
    pub authorizer: Arc<dyn Authorizer>,
}

fn stub_cache_key(object_id: &str, interfaces: &[String]) -> (String, Vec<String>) {
    let mut ifaces = interfaces.to_vec();
    ifaces.sort();
    (object_id.to_string(), ifaces)
}

/// C6: the per-connection owner of the sender loop, receiver loop, and
/// pending-invocation table (spec §3's "Peer handler").
pub struct PeerHandler {
    pub id: PeerId,
    pub remote_endpoint: PeerEndpoint,
    local_endpoint: PeerEndpoint,
    state: Mutex<PeerState>,
    dispose_reason: Mutex<Option<RmiError>>,
    disposed_once: AtomicBool,
    pending: Mutex<HashMap<u64, PendingSlot>>,
    inbound_cancels: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    interface_waiters: Mutex<HashMap<u64, oneshot::Sender<Vec<String>>>>,
    inbound_stubs: Mutex<HashMap<(String, Vec<String>), Weak<Stub>>>,
    next_inv_id: AtomicU64,
    next_req_id: AtomicU64,
    send_tx: mpsc::Sender<Message>,
    auth_identity: Mutex<Option<String>>,
    registry: Arc<Registry>,
    facade: Weak<RmiRegistryFacade>,
    value_codec: Arc<dyn ValueCodec>,
    authorizer: Arc<dyn Authorizer>,
    worker_semaphore: Arc<Semaphore>,
    last_activity: Mutex<Instant>,
    ping_sent_at: Mutex<Option<Instant>>,
}

impl PeerHandler {
    /// Listener side: the transport is already accepted; run the handshake
    /// (spec §6) and, on success, spawn the sender/receiver loops.
    pub async fn accept<S>(
        stream: S,
        remote_addr: SocketAddr,
        authenticator: Arc<dyn Authenticator>,
        config: PeerHandlerConfig,
    ) -> Result<Arc<PeerHandler>, RmiError>
    where
        S: ByteStream,
    {
        let mut stream = stream;
        let remote_endpoint = PeerEndpoint::from(remote_addr);
        let auth_identity = run_listener_handshake(&mut stream, authenticator.as_ref(), remote_addr).await?;
        Ok(Self::spawn(stream, remote_endpoint, auth_identity, config))
    }

    /// Initiator side: answer the listener's challenge, then spawn the
    /// loops. A rejected handshake surfaces not as an explicit failure
    /// message (the wire format has none) but as the transport closing
    /// before `Running` is reached — callers should treat an immediate
    /// disposal right after `connect` as `RmiError::Authentication`.
    pub async fn connect<S>(
        stream: S,
        remote_endpoint: PeerEndpoint,
        auth_id: Option<&str>,
        credential: &[u8],
        config: PeerHandlerConfig,
    ) -> Result<Arc<PeerHandler>, RmiError>
    where
        S: ByteStream,
    {
        let mut stream = stream;
        run_initiator_handshake(&mut stream, auth_id, credential).await?;
        Ok(Self::spawn(stream, remote_endpoint, auth_id.map(str::to_string), config))
    }

    fn spawn<S>(stream: S, remote_endpoint: PeerEndpoint, auth_identity: Option<String>, config: PeerHandlerConfig) -> Arc<Self>
    where
        S: ByteStream,
    {
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let worker_pool_size = if config.worker_pool_size == 0 {
            DEFAULT_WORKER_POOL_SIZE
        } else {
            config.worker_pool_size
        };
        let handler = Arc::new(Self {
            id: next_peer_id(),
            remote_endpoint,
            local_endpoint: config.local_endpoint,
            state: Mutex::new(PeerState::Running),
            dispose_reason: Mutex::new(None),
            disposed_once: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            inbound_cancels: Mutex::new(HashMap::new()),
            interface_waiters: Mutex::new(HashMap::new()),
            inbound_stubs: Mutex::new(HashMap::new()),
            next_inv_id: AtomicU64::new(1),
            next_req_id: AtomicU64::new(1),
            send_tx,
            auth_identity: Mutex::new(auth_identity),
            registry: config.registry,
            facade: config.facade,
            value_codec: config.value_codec,
            authorizer: config.authorizer,
            worker_semaphore: Arc::new(Semaphore::new(worker_pool_size)),
            last_activity: Mutex::new(Instant::now()),
            ping_sent_at: Mutex::new(None),
        });

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(Self::sender_loop(handler.clone(), write_half, send_rx));
        tokio::spawn(Self::receiver_loop(handler.clone(), read_half));
        Self::spawn_liveness_task(&handler);
        tracing::info!(peer = handler.id, remote = %handler.remote_endpoint, "peer handler running");
        handler
    }

    async fn sender_loop<W>(handler: Arc<Self>, mut write_half: W, mut rx: mpsc::Receiver<Message>)
    where
        W: tokio::io::AsyncWrite + Unpin + Send,
    {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write_message(&mut write_half, &msg).await {
                tracing::warn!(peer = handler.id, error = %e, "sender loop write failed");
                handler.dispose(e).await;
                break;
            }
        }
    }

    async fn receiver_loop<R>(handler: Arc<Self>, mut read_half: R)
    where
        R: tokio::io::AsyncRead + Unpin + Send,
    {
        loop {
            match read_message(&mut read_half).await {
                Ok(msg) => {
                    *handler.last_activity.lock() = Instant::now();
                    let handler = handler.clone();
                    let peer_id = handler.id;
                    if let Err(e) = handler.handle_inbound(msg).await {
                        tracing::warn!(peer = peer_id, error = %e, "error handling inbound message");
                    }
                }
                Err(e) => {
                    tracing::info!(peer = handler.id, error = %e, "receiver loop closed");
                    handler.dispose(e).await;
                    break;
                }
            }
        }
    }

    fn spawn_liveness_task(handler: &Arc<Self>) {
        let weak = Arc::downgrade(handler);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(LIVENESS_INTERVAL);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                let Some(handler) = weak.upgrade() else { break };
                if *handler.state.lock() != PeerState::Running {
                    break;
                }
                let idle = handler.last_activity.lock().elapsed();
                if idle >= LIVENESS_INTERVAL {
                    *handler.ping_sent_at.lock() = Some(Instant::now());
                    if handler.send_tx.send(Message::Ping).await.is_err() {
                        break;
                    }
                }
            }
        });
    }

    async fn handle_inbound(self: Arc<Self>, msg: Message) -> Result<(), RmiError> {
        match msg {
            Message::Invocation {
                inv_id,
                object_id,
                method_name,
                param_descriptors,
                args,
            } => {
                let handler = self.clone();
                tokio::spawn(async move {
                    handler.dispatch_invocation(inv_id, object_id, method_name, param_descriptors, args).await;
                });
                Ok(())
            }
            Message::Return { inv_id, outcome } => {
                let slot = self.pending.lock().remove(&inv_id);
                if let Some(slot) = slot {
                    let result = match outcome {
                        ReturnOutcome::Ok { value, .. } => self.decode_arg_slot(value).await,
                        ReturnOutcome::Err(payload) => Err(outcome_to_error(payload)),
                    };
                    let _ = slot.tx.send(result);
                }
                Ok(())
            }
            Message::NewReference { object_id } => {
                if let Some(sk) = self.registry.lookup_by_id(&object_id) {
                    sk.add_ref(self.id);
                }
                Ok(())
            }
            Message::Finalize { object_id } => {
                if let Some(sk) = self.registry.lookup_by_id(&object_id) {
                    sk.remove_ref(self.id);
                }
                Ok(())
            }
            Message::InterfaceRequest { req_id, object_id } => {
                let interfaces = self.registry.lookup_by_id(&object_id).map(|s| s.object.interfaces()).unwrap_or_default();
                self.send_tx
                    .send(Message::InterfaceReply { req_id, interfaces })
                    .await
                    .map_err(|_| RmiError::Transport("send queue closed".into()))
            }
            Message::InterfaceReply { req_id, interfaces } => {
                if let Some(tx) = self.interface_waiters.lock().remove(&req_id) {
                    let _ = tx.send(interfaces);
                }
                Ok(())
            }
            Message::Interrupt { inv_id } => {
                // A missing entry means the invocation already completed;
                // spec §4.6 resolves the race by discarding the late
                // interrupt.
                if let Some(flag) = self.inbound_cancels.lock().get(&inv_id) {
                    flag.store(true, Ordering::Relaxed);
                }
                Ok(())
            }
            Message::Ping => self.send_tx.send(Message::Pong).await.map_err(|_| RmiError::Transport("send queue closed".into())),
            Message::Pong => {
                if let Some(sent_at) = self.ping_sent_at.lock().take() {
                    tracing::debug!(peer = self.id, rtt_ms = sent_at.elapsed().as_millis() as u64, "liveness round trip");
                }
                Ok(())
            }
            Message::Close { reason } => {
                self.dispose(RmiError::RemoteFailure(reason)).await;
                Ok(())
            }
            Message::AuthChallenge { .. } | Message::AuthResponse { .. } => {
                Err(RmiError::Protocol("auth frame received outside handshake".into()))
            }
        }
    }

    async fn dispatch_invocation(
        self: Arc<Self>,
        inv_id: u64,
        object_id: String,
        method_name: String,
        param_descriptors: Vec<String>,
        arg_slots: Vec<ArgSlot>,
    ) {
        let _permit = self.worker_semaphore.clone().acquire_owned().await;
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.inbound_cancels.lock().insert(inv_id, cancel_flag.clone());

        let outcome = self.run_invocation(&object_id, &method_name, &param_descriptors, arg_slots, cancel_flag).await;

        self.inbound_cancels.lock().remove(&inv_id);
        let _ = self.send_tx.send(Message::Return { inv_id, outcome }).await;
    }

    async fn run_invocation(
        &self,
        object_id: &str,
        method_name: &str,
        param_descriptors: &[String],
        arg_slots: Vec<ArgSlot>,
        cancel_flag: Arc<AtomicBool>,
    ) -> ReturnOutcome {
        let skeleton = match self.registry.lookup_by_id(object_id) {
            Some(s) => s,
            None => {
                return error_to_outcome(RmiError::ObjectNotFound(object_id.to_string()));
            }
        };

        let class_name = skeleton.object.interfaces().into_iter().next().unwrap_or_default();
        let auth_id = self.auth_identity.lock().clone();
        let target = AuthTarget {
            object_id,
            class_name: &class_name,
            method: method_name,
        };
        if !self.authorizer.authorize(auth_id.as_deref(), target) {
            return error_to_outcome(RmiError::Authorization {
                object_id: object_id.to_string(),
                method: method_name.to_string(),
            });
        }

        let mut args = Vec::with_capacity(arg_slots.len());
        for slot in arg_slots {
            match self.decode_arg_slot(slot).await {
                Ok(a) => args.push(a),
                Err(e) => return error_to_outcome(e),
            }
        }

        let ctx = InvocationContext::new(self.id, auth_id, cancel_flag);
        match skeleton.object.dispatch(method_name, param_descriptors, args, &ctx).await {
            Ok(value) => match self.encode_rmi_arg(&value).await {
                Ok(slot) => ReturnOutcome::Ok {
                    return_type_descriptor: value.type_descriptor().to_string(),
                    value: slot,
                },
                Err(e) => error_to_outcome(e),
            },
            Err(e) => error_to_outcome(e),
        }
    }

    /// Argument/return encoding policy (spec §4.4): a live remote reference
    /// encodes by `(objectId, originEndpoint)`, auto-publishing a genuine
    /// local object the first time it crosses the wire.
    async fn encode_rmi_arg(&self, value: &RmiArg) -> Result<ArgSlot, RmiError> {
        match value {
            RmiArg::Value(v) => Ok(ArgSlot::Value(self.value_codec.encode(v)?)),
            RmiArg::Remote(obj) => {
                if let Some((object_id, origin)) = obj.remote_origin() {
                    Ok(ArgSlot::StubRef {
                        object_id,
                        origin_host: origin.host,
                        origin_port: origin.port,
                    })
                } else {
                    let skeleton = self.registry.publish_auto(obj.clone());
                    Ok(ArgSlot::StubRef {
                        object_id: skeleton.id.clone(),
                        origin_host: self.local_endpoint.host.clone(),
                        origin_port: self.local_endpoint.port,
                    })
                }
            }
        }
    }

    /// The pointer-routing decode (spec §4.5): a stub-by-reference whose
    /// origin is this process's own listener endpoint resolves to the real
    /// local object; otherwise it becomes a [`Stub`] against the origin,
    /// obtained through the facade rather than routed back through
    /// whichever peer happened to deliver it.
    async fn decode_arg_slot(&self, slot: ArgSlot) -> Result<RmiArg, RmiError> {
        match slot {
            ArgSlot::Value(bytes) => Ok(RmiArg::Value(self.value_codec.decode(&bytes)?)),
            ArgSlot::StubRef {
                object_id,
                origin_host,
                origin_port,
            } => {
                let origin = PeerEndpoint::new(origin_host, origin_port);
                if origin == self.local_endpoint {
                    let skeleton = self
                        .registry
                        .lookup_by_id(&object_id)
                        .ok_or_else(|| RmiError::ObjectNotFound(object_id.clone()))?;
                    Ok(RmiArg::Remote(skeleton.object.clone()))
                } else {
                    let facade = self
                        .facade
                        .upgrade()
                        .ok_or_else(|| RmiError::Transport("registry facade no longer available".into()))?;
                    let stub = facade.get_stub(origin, object_id, Vec::new()).await?;
                    Ok(RmiArg::Remote(stub as Arc<dyn RemoteObject>))
                }
            }
        }
    }

    /// Outbound call from a [`Stub`] (spec §4.3).
    pub async fn invoke(
        self: &Arc<Self>,
        object_id: &str,
        method_name: &str,
        param_descriptors: Vec<String>,
        args: Vec<RmiArg>,
        options: InvokeOptions,
    ) -> Result<RmiArg, RmiError> {
        if options.fire_and_forget {
            return self.send_fire_and_forget(object_id, method_name, param_descriptors, args).await;
        }
        match self.begin_invoke(object_id, method_name, param_descriptors, args, options.suppress_faults).await {
            Ok(pending) => self.await_invocation(pending, options.suppress_faults, options.deadline).await,
            Err(e) if self.effective_suppress_faults(options.suppress_faults) && e.is_transport_class() => {
                Ok(RmiArg::Value(RmiValue::Unit))
            }
            Err(e) => Err(e),
        }
    }

    fn current_dispose_reason(&self) -> RmiError {
        self.dispose_reason.lock().clone().unwrap_or_else(|| RmiError::RemoteFailure("handler disposed".into()))
    }

    /// Folds the registry-wide overrides (spec §4.1) into a per-call
    /// `suppress_faults` flag: `suppressAllInvocationFaults` forces every
    /// call on this registry to behave as suppressed, and
    /// `remoteExceptionEnabled = false` means transport-class faults never
    /// reach application code as an error at all.
    fn effective_suppress_faults(&self, suppress_faults: bool) -> bool {
        suppress_faults || self.registry.config.suppress_all_invocation_faults || !self.registry.config.remote_exception_enabled
    }

    /// Spec §5: a call with no per-call deadline falls back to the
    /// registry-wide `latencyTimeoutMillis`, if configured.
    fn effective_deadline(&self, deadline: Option<Duration>) -> Option<Duration> {
        deadline.or_else(|| self.registry.config.latency_timeout_millis.map(Duration::from_millis))
    }

    fn disposed_result(&self, suppress_faults: bool) -> Result<RmiArg, RmiError> {
        if self.effective_suppress_faults(suppress_faults) {
            Ok(RmiArg::Value(RmiValue::Unit))
        } else {
            Err(self.current_dispose_reason())
        }
    }

    async fn send_fire_and_forget(
        self: &Arc<Self>,
        object_id: &str,
        method_name: &str,
        param_descriptors: Vec<String>,
        args: Vec<RmiArg>,
    ) -> Result<RmiArg, RmiError> {
        if matches!(*self.state.lock(), PeerState::Disposing | PeerState::Disposed) {
            return self.disposed_result(true);
        }
        let mut encoded_args = Vec::with_capacity(args.len());
        for a in &args {
            encoded_args.push(self.encode_rmi_arg(a).await?);
        }
        let inv_id = self.next_inv_id.fetch_add(1, Ordering::Relaxed);
        let message = Message::Invocation {
            inv_id,
            object_id: object_id.to_string(),
            method_name: method_name.to_string(),
            param_descriptors,
            args: encoded_args,
        };
        self.send_tx.send(message).await.map_err(|_| RmiError::Transport("send queue closed".into()))?;
        Ok(RmiArg::Value(RmiValue::Unit))
    }

    /// The send half of an outbound call, split out so a caller (spec §4.3
    /// step 5, S5's interrupt scenario) can learn the invocation id before
    /// the response arrives and send an `Interrupt` frame for it.
    pub async fn begin_invoke(
        self: &Arc<Self>,
        object_id: &str,
        method_name: &str,
        param_descriptors: Vec<String>,
        args: Vec<RmiArg>,
        suppress_faults: bool,
    ) -> Result<PendingInvocation, RmiError> {
        if matches!(*self.state.lock(), PeerState::Disposing | PeerState::Disposed) {
            return Err(self.current_dispose_reason());
        }

        let mut encoded_args = Vec::with_capacity(args.len());
        for a in &args {
            encoded_args.push(self.encode_rmi_arg(a).await?);
        }

        let inv_id = self.next_inv_id.fetch_add(1, Ordering::Relaxed);
        let message = Message::Invocation {
            inv_id,
            object_id: object_id.to_string(),
            method_name: method_name.to_string(),
            param_descriptors,
            args: encoded_args,
        };

        let (tx, rx) = oneshot::channel();
        // Registered before the frame is written (spec §4.4): the response
        // can never arrive and find no entry waiting for it.
        let suppress_faults = self.effective_suppress_faults(suppress_faults);
        self.pending.lock().insert(inv_id, PendingSlot { tx, suppress_faults });

        if self.send_tx.send(message).await.is_err() {
            self.pending.lock().remove(&inv_id);
            return Err(RmiError::Transport("send queue closed".into()));
        }

        Ok(PendingInvocation { invocation_id: inv_id, rx })
    }

    /// The wait half: block on the completion signal, honoring a deadline
    /// (spec §5's "invocation with a configured deadline auto-completes
    /// locally with `TimeoutError`") and fault suppression.
    pub async fn await_invocation(&self, pending: PendingInvocation, suppress_faults: bool, deadline: Option<Duration>) -> Result<RmiArg, RmiError> {
        let suppress_faults = self.effective_suppress_faults(suppress_faults);
        let deadline = self.effective_deadline(deadline);
        let PendingInvocation { invocation_id, rx } = pending;
        let result = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(Ok(r)) => r,
                Ok(Err(_)) => Err(RmiError::RemoteFailure("completion channel dropped".into())),
                Err(_) => {
                    self.pending.lock().remove(&invocation_id);
                    Err(RmiError::Timeout(deadline))
                }
            },
            None => rx.await.unwrap_or_else(|_| Err(RmiError::RemoteFailure("completion channel dropped".into()))),
        };

        match result {
            Err(e) if suppress_faults && e.is_transport_class() => Ok(RmiArg::Value(RmiValue::Unit)),
            other => other,
        }
    }

    /// Spec §4.4 optional path: ask the far side for an object's declared
    /// interfaces when the caller has no a priori knowledge of them.
    pub async fn request_interfaces(self: &Arc<Self>, object_id: &str) -> Result<Vec<String>, RmiError> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.interface_waiters.lock().insert(req_id, tx);
        self.send_tx
            .send(Message::InterfaceRequest {
                req_id,
                object_id: object_id.to_string(),
            })
            .await
            .map_err(|_| RmiError::Transport("send queue closed".into()))?;
        rx.await.map_err(|_| RmiError::RemoteFailure("interface request dropped before reply".into()))
    }

    /// Stubs are cached by `Weak` reference only: once the last `Arc<Stub>`
    /// is dropped the entry must stop keeping it alive, or `Finalize` (sent
    /// from `Stub::drop`) would never fire and distributed GC (spec §4.7)
    /// could never reclaim the skeleton on the far side.
    pub(crate) fn get_cached_stub(&self, object_id: &str, interfaces: &[String]) -> Option<Arc<Stub>> {
        let key = stub_cache_key(object_id, interfaces);
        let mut cache = self.inbound_stubs.lock();
        match cache.get(&key).and_then(Weak::upgrade) {
            Some(stub) => Some(stub),
            None => {
                cache.remove(&key);
                None
            }
        }
    }

    /// The flyweight constructor backing `RmiRegistryFacade::get_stub`
    /// (spec §4.9 step 2): mints a new [`Stub`] only on first request for
    /// `(objectId, interfaces)`, emitting `NewReference` exactly then.
    pub(crate) async fn get_or_create_stub(self: &Arc<Self>, object_id: String, interfaces: Vec<String>) -> Arc<Stub> {
        let key = stub_cache_key(&object_id, &interfaces);
        if let Some(existing) = self.inbound_stubs.lock().get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let stub = Arc::new(Stub::new(self.clone(), object_id.clone(), self.remote_endpoint.clone(), interfaces));
        self.inbound_stubs.lock().insert(key, Arc::downgrade(&stub));
        let _ = self.send_tx.send(Message::NewReference { object_id }).await;
        stub
    }

    pub(crate) fn notify_local_stub_dropped(&self, object_id: &str) {
        self.inbound_stubs.lock().retain(|(id, _), weak| id != object_id || weak.strong_count() > 0);
        let _ = self.send_tx.try_send(Message::Finalize { object_id: object_id.to_string() });
    }

    pub(crate) async fn send_interrupt(&self, invocation_id: u64) {
        let _ = self.send_tx.send(Message::Interrupt { inv_id: invocation_id }).await;
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    pub fn auth_identity(&self) -> Option<String> {
        self.auth_identity.lock().clone()
    }

    /// Explicit close (spec §4.4's first disposal trigger).
    pub async fn close(self: &Arc<Self>, reason: impl Into<String>) {
        let reason_str = reason.into();
        let _ = self.send_tx.send(Message::Close { reason: reason_str.clone() }).await;
        self.dispose(RmiError::RemoteFailure(reason_str)).await;
    }

    /// At-most-once disposal (spec §4.4): drains `pending` with the dispose
    /// reason (or the type-default for fault-suppressed calls), then fans
    /// out through the registry's fault observers and reports to the
    /// facade so it can prune this handler from its endpoint map.
    pub async fn dispose(self: &Arc<Self>, reason: RmiError) {
        if self.disposed_once.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = PeerState::Disposing;
        *self.dispose_reason.lock() = Some(reason.clone());

        let pending: Vec<(u64, PendingSlot)> = self.pending.lock().drain().collect();
        for (_, slot) in pending {
            let result = if slot.suppress_faults {
                Ok(RmiArg::Value(RmiValue::Unit))
            } else {
                Err(reason.clone())
            };
            let _ = slot.tx.send(result);
        }

        if let Some(facade) = self.facade.upgrade() {
            facade.on_peer_disposed(self.id, &self.remote_endpoint).await;
        }
        self.registry.broadcast_fault(self.id, &reason);

        *self.state.lock() = PeerState::Disposed;
        tracing::info!(peer = self.id, %reason, "peer handler disposed");
    }
}

fn error_to_outcome(err: RmiError) -> ReturnOutcome {
    let (kind, message, stack_frames) = match err {
        RmiError::Transport(m) => ("TransportError", m, vec![]),
        RmiError::RemoteFailure(m) => ("RemoteFailure", m, vec![]),
        RmiError::ObjectNotFound(m) => ("ObjectNotFoundError", m, vec![]),
        RmiError::NoSuchMethod { object_id, method } => ("NoSuchMethodError", format!("no such method {method} on {object_id}"), vec![]),
        RmiError::Authentication(m) => ("AuthenticationError", m, vec![]),
        RmiError::Authorization { object_id, method } => (
            "AuthorizationError",
            format!("not authorized to invoke {method} on {object_id}"),
            vec![],
        ),
        RmiError::UnmarshalableArgument(m) => ("UnmarshalableArgumentError", m, vec![]),
        RmiError::Timeout(d) => ("TimeoutError", format!("timed out after {d:?}"), vec![]),
        RmiError::Application(v) => ("ApplicationError", v.message, v.stack_frames),
        RmiError::Protocol(m) => ("RemoteFailure", m, vec![]),
        RmiError::NameAlreadyBound(m) => ("RemoteFailure", m, vec![]),
        RmiError::ReservedName(m) => ("RemoteFailure", m, vec![]),
    };
    ReturnOutcome::Err(RemoteErrorPayload {
        kind: kind.to_string(),
        message,
        stack_frames,
    })
}

/// The far side's structured error value reconstructed into a local
/// `RmiError` "of the right category" (spec §9's exception-marshalling
/// redesign note) — not a byte-for-byte restoration of the original
/// variant's fields, since the wire format never carries them separately.
fn outcome_to_error(payload: RemoteErrorPayload) -> RmiError {
    match payload.kind.as_str() {
        "ObjectNotFoundError" => RmiError::ObjectNotFound(payload.message),
        "NoSuchMethodError" => RmiError::NoSuchMethod {
            object_id: String::new(),
            method: payload.message,
        },
        "AuthenticationError" => RmiError::Authentication(payload.message),
        "AuthorizationError" => RmiError::Authorization {
            object_id: String::new(),
            method: payload.message,
        },
        "UnmarshalableArgumentError" => RmiError::UnmarshalableArgument(payload.message),
        "TimeoutError" => RmiError::Timeout(Duration::from_secs(0)),
        "ApplicationError" => RmiError::Application(RemoteErrorValue::new("ApplicationError", payload.message).with_frames(payload.stack_frames)),
        "TransportError" => RmiError::Transport(payload.message),
        _ => RmiError::RemoteFailure(payload.message),
    }
}
