//! `rmi-core`: an object-oriented remote method invocation runtime over a
//! bidirectional, multiplexed TCP (or other byte-stream) connection.
//!
//! The nine components named in the protocol design map directly onto this
//! crate's modules:
//!
//! - [`transport`] (C1) — the byte-stream boundary plain TCP and optional
//!   TLS sit behind.
//! - [`codec`] (C2) — the length-framed wire message format.
//! - [`registry`] (C3) — the exported-object indices and fault observers.
//! - [`skeleton`] (C4) — a published object's server-side record and the
//!   `RemoteObject` dispatch trait.
//! - [`stub`] (C5) — the client-side proxy.
//! - [`peer`] (C6) — the per-connection sender/receiver loops and pending
//!   invocation table.
//! - [`dgc`] (C7) — the lease-based distributed garbage collector.
//! - [`auth`] (C8) — the authentication handshake and authorization grid.
//! - [`facade`] (C9) — the process-wide `(host, port) -> peer handler` map
//!   and `getStub` entry point.

pub mod auth;
pub mod codec;
pub mod dgc;
pub mod error;
pub mod facade;
pub mod peer;
pub mod registry;
pub mod skeleton;
pub mod stub;
pub mod transport;
pub mod value;

pub use error::{RemoteErrorValue, RmiError, SharedError};
pub use facade::{FacadeConfig, RmiRegistryFacade};
pub use registry::{FaultObserver, Registry, RegistryConfig};
pub use skeleton::{InvocationContext, PeerId, RemoteObject, RmiArg, Skeleton};
pub use stub::{CancellableCall, InvokeOptions, Stub};
pub use transport::PeerEndpoint;
pub use value::{JsonValueCodec, RmiValue, ValueCodec};
