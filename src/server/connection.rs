//! Session task spawning for [`ProxyServer`](super::ProxyServer).

use std::sync::Arc;

use futures::FutureExt;
use log::{error, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::UnixStream,
};
use tokio_util::task::TaskTracker;

use crate::{
    backend::PooledConnection,
    codec::PacketCodec,
    metrics,
    pool::{ConnectionFactory, Pool},
    session::serve_client,
};

/// Spawn a task serving one client, logging and discarding any panic.
pub(super) fn spawn_session<F, B>(
    stream: UnixStream,
    pool: Arc<Pool<F>>,
    codec: PacketCodec,
    tracker: &TaskTracker,
) where
    F: ConnectionFactory<Connection = PooledConnection<B>>,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tracker.spawn(async move {
        let fut = std::panic::AssertUnwindSafe(serve_client(stream, &pool, codec)).catch_unwind();

        match fut.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                metrics::inc_session_errors();
                warn!("session ended with error: error={e}");
            }
            Err(panic) => {
                metrics::inc_session_panics();
                let panic_msg = crate::panic::format_panic(panic);
                // Emit via both `log` and `tracing` for tests that capture either.
                error!("session task panicked: panic={panic_msg}");
                tracing::error!(panic = %panic_msg, "session task panicked");
            }
        }
    });
}
