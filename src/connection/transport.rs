//! Duplex byte transports.
//!
//! The engine owns exactly one transport at a time: a TCP stream
//! (nodelay/keepalive configured per options, address family optionally
//! pinned) or a local Unix socket. Either is split into boxed halves so
//! the engine can read and write concurrently without caring which it
//! got.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket};
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::config::{ClientOptions, Endpoint, IpFamily};
use crate::error::{RedlinkError, Result};

pub(crate) type Reader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type Writer = Box<dyn AsyncWrite + Send + Unpin>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonic id for log correlation across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Open the transport described by `endpoint` and split it.
pub(crate) async fn connect(
    endpoint: &Endpoint,
    options: &ClientOptions,
) -> Result<(Reader, Writer)> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let addr = resolve(host, *port, options.family).await?;
            let socket = if addr.is_ipv6() {
                TcpSocket::new_v6()?
            } else {
                TcpSocket::new_v4()?
            };
            socket.set_keepalive(options.socket_keepalive)?;
            let stream = socket.connect(addr).await?;
            stream.set_nodelay(options.socket_nodelay)?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(RedlinkError::InvalidArgument(
            "unix sockets are not supported on this platform".into(),
        )),
    }
}

/// Resolve `host:port`, honoring the configured address family.
async fn resolve(host: &str, port: u16, family: Option<IpFamily>) -> Result<SocketAddr> {
    let addrs = lookup_host((host, port)).await?;
    let picked = match family {
        None => addrs.into_iter().next(),
        Some(IpFamily::V4) => addrs.into_iter().find(SocketAddr::is_ipv4),
        Some(IpFamily::V6) => addrs.into_iter().find(SocketAddr::is_ipv6),
    };
    picked.ok_or_else(|| {
        RedlinkError::InvalidArgument(format!("no address of requested family for {host}:{port}"))
    })
}

// ── Tests ──────────────────────────────────────────────────────────
