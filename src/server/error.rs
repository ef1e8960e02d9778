//! Errors raised by [`ProxyServer`](super::ProxyServer) operations.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors that may occur while binding or shutting down the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding the listening socket failed.
    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Applying permissions to the socket file failed.
    #[error("failed to set permissions on {}: {source}", path.display())]
    Permissions {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// Removing the socket file failed.
    #[error("failed to remove socket file {}: {source}", path.display())]
    RemoveSocket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
