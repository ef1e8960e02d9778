//! One proxied client session.
//!
//! A session owns its client stream for its whole life: it checks a backend
//! connection out of the pool, authenticates the client over it, relays
//! commands and replies until the client quits or disconnects, and finally
//! returns the backend connection. Backend connections left mid-exchange by
//! a failure are closed before they go back to the pool.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::{
    auth::authenticate,
    backend::PooledConnection,
    codec::PacketCodec,
    command::Command,
    metrics::{self, Direction},
    packet::Packet,
    pool::{ConnectionFactory, Pool, PoolError, Poolable},
    relay::{PacketIo, Peer, Phase, recv, send},
    response::{ResponseShape, relay_response},
};

pub mod error;

pub use error::SessionError;

/// `ER_CON_COUNT_ERROR`, sent when no backend connection is available.
const ER_CON_COUNT_ERROR: u16 = 1040;

/// Serve one client connection until it quits, disconnects, or fails.
///
/// A client that closes its socket between commands ends the session
/// normally.
///
/// # Errors
///
/// Returns a [`SessionError`] describing the first failure. The backend
/// connection has already been returned to the pool, or closed, by then.
pub async fn serve_client<F, B, S>(
    stream: S,
    pool: &Pool<F>,
    codec: PacketCodec,
) -> Result<(), SessionError>
where
    F: ConnectionFactory<Connection = PooledConnection<B>>,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    metrics::inc_sessions();
    let _active = ActiveSession;
    let mut client = Framed::new(stream, codec);

    let mut backend = match pool.get().await {
        Ok(conn) => conn,
        Err(e) => {
            refuse(&mut client, &e).await;
            return Err(SessionError::Checkout(e));
        }
    };
    let mut lease = Lease {
        pool,
        returned: false,
    };
    let conn_id = backend.id();
    debug!(%conn_id, replay = backend.is_authenticated(), "backend checked out");

    let result = run(&mut backend, &mut client).await;
    if let Err(e) = &result
        && e.poisons_backend()
    {
        backend.close();
    }
    lease.returned = true;
    if let Err(e) = pool.put(backend) {
        debug!(%conn_id, error = %e, "backend connection not returned to pool");
    }
    result
}

/// Frees the pool slot of a checked-out backend that is dropped instead of
/// returned, as happens when the session panics or is cancelled.
struct Lease<'a, F: ConnectionFactory> {
    pool: &'a Pool<F>,
    returned: bool,
}

impl<F: ConnectionFactory> Drop for Lease<'_, F> {
    fn drop(&mut self) {
        if !self.returned {
            warn!("session dropped its backend connection without returning it");
            self.pool.forfeit();
        }
    }
}

async fn run<B, C>(backend: &mut PooledConnection<B>, client: &mut C) -> Result<(), SessionError>
where
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    C: PacketIo + ?Sized,
{
    authenticate(backend, client).await?;

    loop {
        let packet = match recv(client, Peer::Client, Phase::Command).await {
            Ok(packet) => packet,
            Err(e) if e.is_clean_close() => {
                debug!(conn_id = %backend.id(), "client disconnected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let Some(opcode) = packet.leading_byte() else {
            return Err(SessionError::EmptyCommand);
        };
        let command = Command::from(opcode);
        let shape = ResponseShape::for_command(command);
        if shape == ResponseShape::Quit {
            debug!(conn_id = %backend.id(), "client quit");
            return Ok(());
        }

        debug!(conn_id = %backend.id(), %command, "relaying command");
        send(backend, &packet, Peer::Backend, Phase::Command).await?;
        metrics::inc_frames(Direction::ToBackend);
        relay_response(backend, client, shape).await?;
    }
}

/// Tell a client that no backend connection could be provided.
///
/// Sent in place of the server greeting, as a saturated server would.
async fn refuse<C: PacketIo + ?Sized>(client: &mut C, reason: &PoolError) {
    let packet = Packet::error(0, ER_CON_COUNT_ERROR, "08004", &reason.to_string());
    if let Err(e) = send(client, &packet, Peer::Client, Phase::Handshake).await {
        warn!(error = %e, "failed to notify client of checkout failure");
    }
}

struct ActiveSession;

impl Drop for ActiveSession {
    fn drop(&mut self) { metrics::dec_sessions(); }
}
