//! Unix-socket front end for the proxy.
//!
//! [`ProxyServer`] owns the listening socket file, accepts clients, and runs
//! one session task per client against a shared [`Pool`]. Shutdown stops
//! accepting, closes the pool, and waits a bounded time for checked-out
//! backend connections to come back before removing the socket file.

use std::{
    fs,
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use log::{debug, info};
use tokio::net::UnixListener;

use crate::{
    codec::PacketCodec,
    pool::{ConnectionFactory, Pool},
};

mod connection;
pub mod error;
mod runtime;

pub use error::ServerError;
/// Re-exported configuration types for server backoff behavior.
pub use runtime::BackoffConfig;

#[cfg(test)]
pub(crate) mod test_util;

/// Default location of the listening socket.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/umyproxy.socket";

/// Front-end configuration.
///
/// # Default Values
/// - `socket_path`: [`DEFAULT_SOCKET_PATH`]
/// - `socket_mode`: `0o777`, so any local user may connect
/// - `shutdown_timeout`: 10 seconds
/// - `drain_interval`: 100 milliseconds
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Path of the Unix socket clients connect to.
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket file.
    pub socket_mode: u32,
    /// How long shutdown waits for checked-out connections to be returned.
    pub shutdown_timeout: Duration,
    /// How often shutdown re-checks the open connection count.
    pub drain_interval: Duration,
    /// Retry timing for failed `accept()` calls.
    pub backoff: BackoffConfig,
    /// Codec used on client connections.
    pub codec: PacketCodec,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            socket_mode: 0o777,
            shutdown_timeout: Duration::from_secs(10),
            drain_interval: Duration::from_millis(100),
            backoff: BackoffConfig::default(),
            codec: PacketCodec::default(),
        }
    }
}

impl ProxyConfig {
    /// Set the socket path.
    #[must_use]
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Set the socket file permission bits.
    #[must_use]
    pub fn with_socket_mode(mut self, mode: u32) -> Self {
        self.socket_mode = mode;
        self
    }

    /// Set the shutdown drain deadline.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the drain polling interval.
    #[must_use]
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Set the accept back-off configuration.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the client-side codec.
    #[must_use]
    pub fn with_codec(mut self, codec: PacketCodec) -> Self {
        self.codec = codec;
        self
    }
}

/// Listening proxy bound to a Unix socket.
pub struct ProxyServer<F: ConnectionFactory> {
    listener: UnixListener,
    pool: Arc<Pool<F>>,
    config: ProxyConfig,
}

impl<F: ConnectionFactory> std::fmt::Debug for ProxyServer<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> ProxyServer<F> {
    /// Bind the listening socket described by `config`.
    ///
    /// A file already present at the socket path is removed first, and the
    /// new socket file is given `config.socket_mode` permissions. Must be
    /// called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::RemoveSocket`] if a stale file cannot be
    /// removed, [`ServerError::Bind`] if binding fails, or
    /// [`ServerError::Permissions`] if the mode cannot be applied.
    pub fn bind(config: ProxyConfig, pool: Arc<Pool<F>>) -> Result<Self, ServerError> {
        let path = config.socket_path.clone();
        remove_socket_file(&path)?;
        let listener = UnixListener::bind(&path).map_err(|source| ServerError::Bind {
            path: path.clone(),
            source,
        })?;
        fs::set_permissions(&path, fs::Permissions::from_mode(config.socket_mode)).map_err(
            |source| ServerError::Permissions {
                path: path.clone(),
                source,
            },
        )?;
        info!("listening on {}", path.display());
        Ok(Self {
            listener,
            pool,
            config,
        })
    }

    /// Path of the listening socket.
    #[must_use]
    pub fn socket_path(&self) -> &Path { &self.config.socket_path }

    /// Pool shared by every session.
    #[must_use]
    pub fn pool(&self) -> &Arc<Pool<F>> { &self.pool }
}

/// Remove the file at `path`, ignoring a missing file.
fn remove_socket_file(path: &Path) -> Result<(), ServerError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("removed stale socket file {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ServerError::RemoveSocket {
            path: path.to_path_buf(),
            source,
        }),
    }
}
