//! Test helpers shared across server modules.

use std::{
    io,
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use rstest::fixture;
use tokio::{
    io::{DuplexStream, duplex},
    net::UnixStream,
};

use crate::{backend::PooledConnection, codec::PacketCodec, pool::ConnectionFactory};

/// Factory whose backend connections hang up immediately.
///
/// Sessions against it fail during the handshake, which is enough to
/// exercise accept and shutdown paths.
#[derive(Debug, Default)]
pub struct HangupFactory {
    pub dialed: AtomicUsize,
}

#[async_trait]
impl ConnectionFactory for HangupFactory {
    type Connection = PooledConnection<DuplexStream>;

    async fn connect(&self) -> io::Result<Self::Connection> {
        self.dialed.fetch_add(1, Ordering::SeqCst);
        let (ours, _theirs) = duplex(64);
        Ok(PooledConnection::new(ours, PacketCodec::default()))
    }
}

#[fixture]
/// Returns a unique socket path under the system temporary directory.
///
/// The file does not exist yet.
pub fn socket_path() -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let n = NEXT.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("umyproxy-test-{}-{n}.socket", std::process::id()))
}

/// Connected pair of Unix streams.
pub fn unix_pair() -> (UnixStream, UnixStream) { UnixStream::pair().expect("create unix stream pair") }
