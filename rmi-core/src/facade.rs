//! C9: the registry facade — the one process-wide object an application
//! actually holds, mapping `(host, port)` to a live peer handler and
//! brokering stub retrieval. Spec §9 retires the global registry singleton
//! in favor of this: a plain struct passed to (or owned by) application
//! code, never reached through a static.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};

use crate::auth::{Authenticator, Authorizer, DefaultAuthorizer, NoAuthAuthenticator};
use crate::error::RmiError;
use crate::peer::{PeerHandler, PeerHandlerConfig, PeerState, DEFAULT_WORKER_POOL_SIZE};
use crate::registry::Registry;
use crate::skeleton::PeerId;
use crate::stub::Stub;
use crate::transport::PeerEndpoint;
use crate::value::{JsonValueCodec, ValueCodec};

pub struct FacadeConfig {
    pub local_endpoint: PeerEndpoint,
    pub worker_pool_size: usize,
    pub value_codec: Arc<dyn ValueCodec>,
    pub authorizer: Arc<dyn Authorizer>,
    pub authenticator: Arc<dyn Authenticator>,
    /// Identity this facade presents to peers it dials (spec §4.8's
    /// handshake response). `None` answers every challenge anonymously,
    /// which a listener-side `Authenticator` is free to accept or not.
    pub auth_id: Option<String>,
    pub credential: Vec<u8>,
}

impl FacadeConfig {
    /// Sensible defaults: JSON value codec, no auth, authorize everything.
    pub fn new(local_endpoint: PeerEndpoint) -> Self {
        Self {
            local_endpoint,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            value_codec: Arc::new(JsonValueCodec),
            authorizer: Arc::new(DefaultAuthorizer { allow: true }),
            authenticator: Arc::new(NoAuthAuthenticator),
            auth_id: None,
            credential: Vec::new(),
        }
    }

    pub fn with_value_codec(mut self, codec: Arc<dyn ValueCodec>) -> Self {
        self.value_codec = codec;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// The credential this facade offers when it dials out (spec §4.8). Not
    /// consulted for inbound connections, which go through `authenticator`.
    pub fn with_credential(mut self, auth_id: impl Into<String>, credential: impl Into<Vec<u8>>) -> Self {
        self.auth_id = Some(auth_id.into());
        self.credential = credential.into();
        self
    }
}

/// C9: the process-level coordinator (spec §4.9).
pub struct RmiRegistryFacade {
    local_endpoint: PeerEndpoint,
    worker_pool_size: usize,
    registry: Arc<Registry>,
    peers: Mutex<HashMap<PeerEndpoint, Arc<PeerHandler>>>,
    value_codec: Arc<dyn ValueCodec>,
    authorizer: Arc<dyn Authorizer>,
    authenticator: Arc<dyn Authenticator>,
    auth_id: Option<String>,
    credential: Vec<u8>,
    self_weak: Mutex<Weak<Self>>,
}

impl RmiRegistryFacade {
    pub fn new(registry: Arc<Registry>, config: FacadeConfig) -> Arc<Self> {
        let facade = Arc::new(Self {
            local_endpoint: config.local_endpoint,
            worker_pool_size: config.worker_pool_size,
            registry,
            peers: Mutex::new(HashMap::new()),
            value_codec: config.value_codec,
            authorizer: config.authorizer,
            authenticator: config.authenticator,
            auth_id: config.auth_id,
            credential: config.credential,
            self_weak: Mutex::new(Weak::new()),
        });
        *facade.self_weak.lock() = Arc::downgrade(&facade);
        facade
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn local_endpoint(&self) -> &PeerEndpoint {
        &self.local_endpoint
    }

    fn peer_config(&self) -> PeerHandlerConfig {
        PeerHandlerConfig {
            local_endpoint: self.local_endpoint.clone(),
            worker_pool_size: self.worker_pool_size,
            registry: self.registry.clone(),
            facade: self.self_weak.lock().clone(),
            value_codec: self.value_codec.clone(),
            authorizer: self.authorizer.clone(),
        }
    }

    /// Spec §4.9 step 1: reuse a live handler to `endpoint` unless
    /// `multiConnectionMode` is set, in which case always dial fresh.
    async fn resolve_handler(&self, endpoint: &PeerEndpoint) -> Result<Arc<PeerHandler>, RmiError> {
        if !self.registry.config.multi_connection_mode {
            if let Some(existing) = self.peers.lock().get(endpoint).cloned() {
                if existing.state() == PeerState::Running {
                    return Ok(existing);
                }
            }
        }

        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true).ok();
        let handler = PeerHandler::connect(stream, endpoint.clone(), self.auth_id.as_deref(), &self.credential, self.peer_config()).await?;
        self.peers.lock().insert(endpoint.clone(), handler.clone());
        Ok(handler)
    }

    /// `getStub(host, port, objectId, ifaces...)` (spec §4.9): resolve the
    /// connection, then ask the handler for its flyweight stub. An empty
    /// `interfaces` asks the far side what it implements first.
    pub async fn get_stub(&self, endpoint: PeerEndpoint, object_id: String, interfaces: Vec<String>) -> Result<Arc<Stub>, RmiError> {
        let handler = self.resolve_handler(&endpoint).await?;
        if let Some(existing) = handler.get_cached_stub(&object_id, &interfaces) {
            return Ok(existing);
        }
        let interfaces = if interfaces.is_empty() {
            handler.request_interfaces(&object_id).await.unwrap_or_default()
        } else {
            interfaces
        };
        Ok(handler.get_or_create_stub(object_id, interfaces).await)
    }

    /// Accept loop for the listening side: one [`PeerHandler`] per inbound
    /// connection, each running its own handshake concurrently so a slow or
    /// hostile dialer cannot stall other connections.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), RmiError> {
        loop {
            let (stream, remote_addr) = listener.accept().await?;
            stream.set_nodelay(true).ok();
            let authenticator = self.authenticator.clone();
            let config = self.peer_config();
            tokio::spawn(async move {
                match PeerHandler::accept(stream, remote_addr, authenticator, config).await {
                    Ok(handler) => {
                        tracing::info!(peer = handler.id, remote = %remote_addr, "accepted connection");
                    }
                    Err(e) => tracing::warn!(%remote_addr, error = %e, "handshake failed"),
                }
            });
        }
    }

    /// Spec §4.9: the sink for handler self-disposal. Prunes the handler
    /// from the reuse map before the registry fans out to application fault
    /// observers (see `PeerHandler::dispose`, which calls this first).
    pub async fn on_peer_disposed(&self, peer_id: PeerId, endpoint: &PeerEndpoint) {
        let mut peers = self.peers.lock();
        if peers.get(endpoint).is_some_and(|existing| existing.id == peer_id) {
            peers.remove(endpoint);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.peers.lock().len()
    }
}
