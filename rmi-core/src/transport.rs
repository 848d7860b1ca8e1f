//! C1: the paired byte-stream transport.
//!
//! The core never looks past a `(reader, writer)` pair of opaque byte
//! streams — plain TCP, an optional TLS wrapper, or anything else the
//! application plugs in. This mirrors the teacher's
//! `connection::handle`/`handle_generic` split: `handle` is the plain-TCP
//! convenience entry point, `handle_generic` accepts anything that is
//! `AsyncRead + AsyncWrite`.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Canonical identity of a peer: the `(host, port)` pair it is reachable at.
///
/// Used as the registry facade's connection-reuse key and as the "origin"
/// carried by a stub-by-reference so a round-tripped stub can find its way
/// home (pointer routing, spec §4.5).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub host: String,
    pub port: u16,
}

impl PeerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<SocketAddr> for PeerEndpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

/// Trait bound alias for anything the peer handler can read from and write
/// to. Plain TCP, TLS, and compression wrappers all satisfy this without
/// the core knowing which.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> ByteStream for T {}

/// Split a plain TCP connection into owned halves, the way
/// `connection::handle` does for the teacher's IRC protocol.
pub fn split_tcp(stream: TcpStream) -> std::io::Result<(TcpReadHalf, TcpWriteHalf)> {
    stream.set_nodelay(true)?;
    let (r, w) = stream.into_split();
    Ok((r, w))
}

pub type TcpReadHalf = tokio::net::tcp::OwnedReadHalf;
pub type TcpWriteHalf = tokio::net::tcp::OwnedWriteHalf;

#[cfg(feature = "tls")]
pub mod tls {
    //! Optional TLS transport, feature-gated behind `tls`.
    //!
    //! Grounded on the teacher's `tokio_rustls` usage in
    //! `freeq-server`/`freeq-sdk` (`TlsAcceptor`/`TlsConnector` wrapping a
    //! plain `TcpStream`). Kept intentionally thin: the core only needs
    //! *a* pluggable encrypted transport to prove the byte-stream boundary
    //! is real, not a full TLS configuration surface.

    use std::io;
    use std::sync::Arc;

    use tokio::net::TcpStream;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, ServerConfig};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    pub async fn accept(
        acceptor: &TlsAcceptor,
        stream: TcpStream,
    ) -> io::Result<tokio_rustls::server::TlsStream<TcpStream>> {
        acceptor.accept(stream).await
    }

    pub async fn connect(
        connector: &TlsConnector,
        server_name: &str,
        stream: TcpStream,
    ) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        connector.connect(name, stream).await
    }

    pub fn acceptor(config: ServerConfig) -> TlsAcceptor {
        TlsAcceptor::from(Arc::new(config))
    }

    pub fn connector(config: ClientConfig) -> TlsConnector {
        TlsConnector::from(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_displays_as_host_colon_port() {
        let ep = PeerEndpoint::new("example.test", 7000);
        assert_eq!(ep.to_string(), "example.test:7000");
    }

    #[test]
    fn endpoint_from_socket_addr() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let ep: PeerEndpoint = addr.into();
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 9000);
    }
}
