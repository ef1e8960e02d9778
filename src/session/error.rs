//! Errors that end a client session.

use thiserror::Error;

use crate::{
    auth::AuthError,
    pool::PoolError,
    relay::{Peer, Phase, RelayError},
};

/// Reason a client session ended abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No backend connection could be checked out.
    #[error("backend checkout failed: {0}")]
    Checkout(#[source] PoolError),
    /// The handshake did not complete.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    /// A command or its reply could not be relayed.
    #[error(transparent)]
    Relay(#[from] RelayError),
    /// The client sent a command packet with no opcode.
    #[error("client sent an empty command packet")]
    EmptyCommand,
}

impl SessionError {
    /// Whether the backend connection may be mid-exchange and must not be reused.
    ///
    /// Only failures on the client side between commands leave the backend
    /// idle at a message boundary.
    #[must_use]
    pub fn poisons_backend(&self) -> bool {
        match self {
            Self::Checkout(_) | Self::EmptyCommand => false,
            Self::Auth(_) => true,
            Self::Relay(e) => !(e.peer == Peer::Client && e.phase == Phase::Command),
        }
    }
}
