//! Backend connections owned by the pool.
//!
//! A [`PooledConnection`] wraps a framed backend stream together with the
//! bookkeeping the pool needs (last use, closed state) and the frames cached
//! by the first successful handshake so later clients can be authenticated
//! without contacting the backend.

use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use derive_more::{Display, From, Into};
use socket2::{SockRef, TcpKeepalive};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, lookup_host},
    time::{Instant, timeout},
};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::{
    codec::PacketCodec,
    packet::Packet,
    pool::{ConnectionFactory, Poolable},
    relay::{ConnError, PacketIo},
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier assigned to each backend connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, From, Into)]
#[display("{_0}")]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identifier.
    #[must_use]
    pub fn next() -> Self { Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)) }

    /// Return the inner numeric identifier.
    #[must_use]
    pub const fn get(self) -> u64 { self.0 }
}

/// Frames captured by the first successful handshake on a connection.
#[derive(Clone, Debug, Default)]
pub(crate) struct AuthCache {
    pub handshake: Option<Packet>,
    pub auth_ok: Option<Packet>,
    pub authenticated: bool,
}

/// A backend connection plus pool metadata.
pub struct PooledConnection<S = TcpStream> {
    id: ConnectionId,
    framed: Option<Framed<S, PacketCodec>>,
    last_used: Instant,
    pub(crate) auth: AuthCache,
}

impl<S> std::fmt::Debug for PooledConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("closed", &self.framed.is_none())
            .field("last_used", &self.last_used)
            .field("authenticated", &self.auth.authenticated)
            .finish_non_exhaustive()
    }
}

impl<S> PooledConnection<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Wrap an established backend stream.
    pub fn new(stream: S, codec: PacketCodec) -> Self {
        Self {
            id: ConnectionId::next(),
            framed: Some(Framed::new(stream, codec)),
            last_used: Instant::now(),
            auth: AuthCache::default(),
        }
    }
}

impl<S> PooledConnection<S> {
    /// Identifier used in logs.
    #[must_use]
    pub fn id(&self) -> ConnectionId { self.id }

    /// Whether a first-time handshake has succeeded on this connection.
    #[must_use]
    pub fn is_authenticated(&self) -> bool { self.auth.authenticated }

    fn framed_mut(&mut self) -> Result<&mut Framed<S, PacketCodec>, ConnError> {
        self.framed.as_mut().ok_or(ConnError::Closed)
    }
}

impl<S: Send + 'static> Poolable for PooledConnection<S> {
    fn is_closed(&self) -> bool { self.framed.is_none() }

    fn last_used(&self) -> Instant { self.last_used }

    fn refresh_use_time(&mut self) { self.last_used = Instant::now(); }

    fn close(&mut self) {
        if self.framed.take().is_some() {
            debug!(conn_id = %self.id, "backend connection closed");
        }
    }
}

#[async_trait]
impl<S> PacketIo for PooledConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_packet(&mut self) -> Result<Packet, ConnError> {
        let result = self.framed_mut()?.read_packet().await;
        if result.is_err() {
            self.close();
        }
        result
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnError> {
        let result = self.framed_mut()?.write_packet(packet).await;
        if result.is_err() {
            self.close();
        }
        result
    }
}

/// Dials backend connections over TCP.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    keepalive: Option<Duration>,
    codec: PacketCodec,
}

impl TcpConnector {
    /// Default dial timeout.
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

    /// Connector for `host:port` with default timeouts.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            keepalive: Some(Duration::from_secs(60)),
            codec: PacketCodec::default(),
        }
    }

    /// Set the dial timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set the TCP keepalive idle time, or disable keepalive with `None`.
    #[must_use]
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Set the codec used for backend framing.
    #[must_use]
    pub fn with_codec(mut self, codec: PacketCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Address string in `host:port` form.
    #[must_use]
    pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }

    async fn dial(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in lookup_host((self.host.as_str(), self.port)).await? {
            match self.dial_addr(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses resolved for {}", self.address()),
            )
        }))
    }

    async fn dial_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            )),
        }
    }

    fn configure(&self, stream: &TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY: {e}");
        }
        let Some(idle) = self.keepalive else {
            return;
        };
        let socket = SockRef::from(stream);
        if let Err(e) = socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle)) {
            warn!("failed to enable TCP keepalive: {e}");
        }
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnector {
    type Connection = PooledConnection<TcpStream>;

    async fn connect(&self) -> io::Result<Self::Connection> {
        let stream = self.dial().await?;
        self.configure(&stream);
        let conn = PooledConnection::new(stream, self.codec);
        debug!(conn_id = %conn.id(), backend = %self.address(), "backend connection opened");
        Ok(conn)
    }
}
