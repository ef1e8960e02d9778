//! Accept-loop utilities for server runtime.

use std::{io, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use log::warn;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{UnixListener, UnixStream},
    select,
    time::{Duration, sleep},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::backoff::BackoffConfig;
use crate::{
    backend::PooledConnection,
    codec::PacketCodec,
    pool::{ConnectionFactory, Pool},
    server::connection::spawn_session,
};

/// Abstraction for sources of incoming connections consumed by the accept loop.
///
/// Implementations must be cancellation-safe: dropping a pending `accept()`
/// future must not leak resources.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub(in crate::server) trait AcceptListener: Send + Sync {
    async fn accept(&self) -> io::Result<UnixStream>;
    fn local_path(&self) -> Option<PathBuf>;
}

#[async_trait]
impl AcceptListener for UnixListener {
    async fn accept(&self) -> io::Result<UnixStream> {
        UnixListener::accept(self).await.map(|(stream, _)| stream)
    }

    fn local_path(&self) -> Option<PathBuf> {
        self.local_addr()
            .ok()
            .and_then(|addr| addr.as_pathname().map(PathBuf::from))
    }
}

#[derive(Debug)]
pub(in crate::server) struct AcceptLoopOptions {
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
    pub backoff: BackoffConfig,
    pub codec: PacketCodec,
}

/// Accepts incoming clients and spawns a session task for each.
///
/// Failures to accept a connection trigger an exponential back-off governed
/// by `options.backoff`. The loop terminates when `options.shutdown` is
/// cancelled, and all spawned sessions are tracked by `options.tracker`.
pub(in crate::server) async fn accept_loop<F, B, L>(
    listener: L,
    pool: Arc<Pool<F>>,
    options: AcceptLoopOptions,
) where
    F: ConnectionFactory<Connection = PooledConnection<B>>,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    L: AcceptListener,
{
    let backoff = options.backoff.normalized();
    debug_assert!(
        backoff.initial_delay <= backoff.max_delay,
        "BackoffConfig invariant violated: initial_delay > max_delay"
    );
    let mut delay = backoff.initial_delay;
    while let Some(next_delay) =
        accept_iteration(&listener, &pool, &options, &backoff, delay).await
    {
        delay = next_delay;
    }
}

#[expect(
    clippy::integer_division_remainder_used,
    reason = "tokio::select! expands to modulus internally"
)]
async fn accept_iteration<F, B, L>(
    listener: &L,
    pool: &Arc<Pool<F>>,
    options: &AcceptLoopOptions,
    backoff: &BackoffConfig,
    delay: Duration,
) -> Option<Duration>
where
    F: ConnectionFactory<Connection = PooledConnection<B>>,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    L: AcceptListener,
{
    select! {
        biased;

        () = options.shutdown.cancelled() => None,
        res = listener.accept() => Some(match res {
            Ok(stream) => {
                spawn_session(stream, Arc::clone(pool), options.codec, &options.tracker);
                backoff.initial_delay
            }
            Err(e) => {
                let local_path = listener.local_path();
                warn!("accept error: error={e:?}, local_path={local_path:?}");
                sleep(delay).await;
                backoff.after_failure(delay)
            }
        }),
    }
}
