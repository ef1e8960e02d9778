#![doc(html_root_url = "https://docs.rs/umyproxy/latest")]
//! Public API for the `umyproxy` library.
//!
//! `umyproxy` sits between MySQL clients on a local Unix socket and one MySQL
//! server, multiplexing client sessions over a bounded pool of authenticated
//! backend connections. The building blocks are usable on their own: the
//! packet codec, the connection pool, the handshake relay, and the reply
//! completion tracker.

pub mod auth;
pub mod backend;
pub mod byte_order;
pub mod codec;
pub mod command;
pub mod metrics;
pub mod packet;
pub mod panic;
pub mod pool;
pub mod relay;
pub mod response;
pub mod server;
pub mod session;

pub use backend::{ConnectionId, PooledConnection, TcpConnector};
pub use codec::{CodecError, PacketCodec};
pub use command::Command;
pub use packet::{Frame, MAX_PAYLOAD_LEN, Packet};
pub use pool::{ConnectionFactory, Pool, PoolError, PoolOptions, Poolable};
pub use response::{Progress, ResponseShape, ResponseTracker};
pub use server::{BackoffConfig, ProxyConfig, ProxyServer, ServerError};
pub use session::{SessionError, serve_client};
