//! Runtime control for [`ProxyServer`].

mod accept;
mod backoff;

use std::{sync::Arc, time::Duration};

#[cfg(test)]
pub(super) use accept::MockAcceptListener;
pub(super) use accept::{AcceptLoopOptions, accept_loop};
pub use backoff::BackoffConfig;
use futures::Future;
use log::{info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    select,
    signal,
    time::{sleep, timeout},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{ProxyServer, ServerError, remove_socket_file};
use crate::{
    backend::PooledConnection,
    pool::{ConnectionFactory, Pool},
};

impl<F, B> ProxyServer<F>
where
    F: ConnectionFactory<Connection = PooledConnection<B>>,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Run the proxy until Ctrl+C is received.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::sync::Arc;
    ///
    /// use umyproxy::{
    ///     backend::TcpConnector,
    ///     pool::{Pool, PoolOptions},
    ///     server::{ProxyConfig, ProxyServer},
    /// };
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), umyproxy::server::ServerError> {
    /// let pool = Arc::new(Pool::new(
    ///     TcpConnector::new("127.0.0.1", 3306),
    ///     PoolOptions::default(),
    /// ));
    /// let server = ProxyServer::bind(ProxyConfig::default(), pool)?;
    /// server.run().await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::RemoveSocket`] if the socket file cannot be
    /// removed after shutdown. Accept failures are retried with exponential
    /// back-off and do not surface as errors.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_with_shutdown(async {
            let _ = signal::ctrl_c().await;
        })
        .await
    }

    /// Run the proxy until the `shutdown` future resolves.
    ///
    /// Once `shutdown` resolves the server stops accepting, closes the pool,
    /// and polls the pool's open connection count until it reaches zero or
    /// the configured shutdown timeout elapses. The socket file is removed
    /// either way; sessions still running at that point are abandoned.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::RemoveSocket`] if the socket file cannot be
    /// removed after shutdown.
    #[expect(
        clippy::integer_division_remainder_used,
        reason = "tokio::select! expands to modulus internally"
    )]
    pub async fn run_with_shutdown<S>(self, shutdown: S) -> Result<(), ServerError>
    where
        S: Future<Output = ()> + Send,
    {
        let ProxyServer {
            listener,
            pool,
            config,
        } = self;
        let shutdown_token = CancellationToken::new();
        let tracker = TaskTracker::new();

        let mut accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&pool),
            AcceptLoopOptions {
                shutdown: shutdown_token.clone(),
                tracker: tracker.clone(),
                backoff: config.backoff,
                codec: config.codec,
            },
        ));

        select! {
            () = shutdown => shutdown_token.cancel(),
            res = &mut accept_task => {
                if let Err(e) = res {
                    warn!("accept loop terminated unexpectedly: {e}");
                }
            }
        }
        if !accept_task.is_finished() && let Err(e) = accept_task.await {
            warn!("accept loop terminated unexpectedly: {e}");
        }

        info!("shutting down: {} session(s) active", tracker.len());
        pool.close();
        if drain_pool(&pool, config.shutdown_timeout, config.drain_interval).await {
            info!("all backend connections returned");
        } else {
            warn!(
                "shutdown timeout of {:?} reached with {} backend connection(s) still open",
                config.shutdown_timeout,
                pool.open_size()
            );
        }
        tracker.close();

        remove_socket_file(&config.socket_path)
    }
}

/// Poll `pool` every `interval` until no connections are open or `deadline` passes.
///
/// Returns `true` if the pool drained in time.
pub(super) async fn drain_pool<F: ConnectionFactory>(
    pool: &Pool<F>,
    deadline: Duration,
    interval: Duration,
) -> bool {
    let drained = async {
        while pool.open_size() > 0 {
            sleep(interval).await;
        }
    };
    timeout(deadline, drained).await.is_ok()
}
