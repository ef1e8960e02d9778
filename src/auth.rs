//! Authentication of a client against a pooled backend connection.
//!
//! The first client to use a backend connection is relayed through the real
//! handshake: the backend's greeting, the client's response, and the backend's
//! verdict pass through byte for byte. On success the greeting and verdict are
//! cached on the connection, and every later client is answered from that
//! cache without contacting the backend at all.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::{
    backend::PooledConnection,
    relay::{PacketIo, Peer, Phase, RelayError, recv, send},
};

/// Failure while authenticating a client.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Reading or writing a handshake packet failed.
    #[error(transparent)]
    Relay(#[from] RelayError),
    /// The backend rejected the client's credentials.
    #[error("backend rejected authentication")]
    Failed,
    /// Replay was attempted on a connection with no cached handshake.
    #[error("connection has no cached authentication to replay")]
    NoAuth,
}

/// Authenticate `client` over `backend`, relaying or replaying as appropriate.
///
/// # Errors
///
/// Returns [`AuthError::Failed`] if the backend rejects the credentials, or
/// [`AuthError::Relay`] if any packet exchange fails.
pub async fn authenticate<S, C>(
    backend: &mut PooledConnection<S>,
    client: &mut C,
) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    C: PacketIo + ?Sized,
{
    if backend.is_authenticated() {
        replay_handshake(backend, client).await
    } else {
        relay_handshake(backend, client).await
    }
}

/// Relay the full handshake between `client` and `backend`.
///
/// The backend's greeting and verdict are cached on the connection; the
/// connection is marked authenticated only if the verdict is not an error.
///
/// # Errors
///
/// Returns [`AuthError::Failed`] after forwarding an error verdict, or
/// [`AuthError::Relay`] if any read or write fails.
pub async fn relay_handshake<S, C>(
    backend: &mut PooledConnection<S>,
    client: &mut C,
) -> Result<(), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    C: PacketIo + ?Sized,
{
    let handshake = recv(backend, Peer::Backend, Phase::Handshake).await?;
    send(client, &handshake, Peer::Client, Phase::Handshake).await?;
    backend.auth.handshake = Some(handshake);

    let response = recv(client, Peer::Client, Phase::AuthResponse).await?;
    send(backend, &response, Peer::Backend, Phase::AuthResponse).await?;

    let verdict = recv(backend, Peer::Backend, Phase::AuthResult).await?;
    send(client, &verdict, Peer::Client, Phase::AuthResult).await?;
    let failed = verdict.is_err();
    backend.auth.auth_ok = Some(verdict);

    if failed {
        debug!(conn_id = %backend.id(), "backend rejected handshake");
        return Err(AuthError::Failed);
    }
    backend.auth.authenticated = true;
    debug!(conn_id = %backend.id(), "handshake relayed");
    Ok(())
}

/// Answer `client`'s handshake from the frames cached on `backend`.
///
/// The client's authentication response is read and discarded. Nothing is
/// written to or read from the backend.
///
/// # Errors
///
/// Returns [`AuthError::NoAuth`] if the connection has not completed a
/// handshake, or [`AuthError::Relay`] if a client read or write fails.
pub async fn replay_handshake<S, C>(
    backend: &mut PooledConnection<S>,
    client: &mut C,
) -> Result<(), AuthError>
where
    C: PacketIo + ?Sized,
{
    let (true, Some(handshake), Some(auth_ok)) = (
        backend.auth.authenticated,
        backend.auth.handshake.as_ref(),
        backend.auth.auth_ok.as_ref(),
    ) else {
        return Err(AuthError::NoAuth);
    };

    send(client, handshake, Peer::Client, Phase::Handshake).await?;
    recv(client, Peer::Client, Phase::AuthResponse).await?;
    send(client, auth_ok, Peer::Client, Phase::AuthResult).await?;
    debug!(conn_id = %backend.id(), "handshake replayed from cache");
    Ok(())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::{fixture, rstest};
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};
    use tokio_util::codec::Framed;

    use super::*;
    use crate::{
        codec::PacketCodec,
        packet::{ERR_MARKER, OK_MARKER, Packet},
        pool::Poolable,
        relay::ConnError,
    };

    type Wire = Framed<DuplexStream, PacketCodec>;

    struct Harness {
        backend: PooledConnection<DuplexStream>,
        backend_peer: Wire,
        client: Wire,
        client_peer: Wire,
    }

    #[fixture]
    fn harness() -> Harness {
        let (backend_io, backend_peer) = duplex(4096);
        let (client_io, client_peer) = duplex(4096);
        Harness {
            backend: PooledConnection::new(backend_io, PacketCodec::default()),
            backend_peer: Framed::new(backend_peer, PacketCodec::default()),
            client: Framed::new(client_io, PacketCodec::default()),
            client_peer: Framed::new(client_peer, PacketCodec::default()),
        }
    }

    fn greeting() -> Packet { Packet::new(0, &b"\x0a8.0.36\x00greeting"[..]) }

    fn credentials() -> Packet { Packet::new(1, &b"\x8d\xa6user\x00scramble"[..]) }

    fn ok() -> Packet { Packet::new(2, Bytes::from_static(&[OK_MARKER, 0, 0, 2, 0, 0, 0])) }

    fn access_denied() -> Packet {
        Packet::new(2, Bytes::from_static(&[ERR_MARKER, 0x15, 0x04, b'#', b'2', b'8', b'0', b'0', b'0']))
    }

    /// Play the real backend and the real client for one handshake.
    async fn script_first_time(h: &mut Harness, verdict: Packet) -> Result<(), AuthError> {
        let Harness {
            backend,
            backend_peer,
            client,
            client_peer,
        } = h;
        let server = async {
            backend_peer.write_packet(&greeting()).await?;
            let creds = backend_peer.read_packet().await?;
            backend_peer.write_packet(&verdict).await?;
            Ok::<_, ConnError>(creds)
        };
        let user = async {
            let hello = client_peer.read_packet().await?;
            client_peer.write_packet(&credentials()).await?;
            let verdict = client_peer.read_packet().await?;
            Ok::<_, ConnError>((hello, verdict))
        };
        let (result, creds, seen) = tokio::join!(authenticate(backend, client), server, user);
        assert_eq!(creds.expect("backend script"), credentials());
        let (hello, verdict_seen) = seen.expect("client script");
        assert_eq!(hello, greeting());
        assert_eq!(verdict_seen, verdict);
        result
    }

    #[rstest]
    #[tokio::test]
    async fn first_client_is_relayed_and_cached(harness: Harness) {
        let mut h = harness;
        script_first_time(&mut h, ok()).await.expect("handshake succeeds");

        assert!(h.backend.is_authenticated());
        assert_eq!(h.backend.auth.handshake, Some(greeting()));
        assert_eq!(h.backend.auth.auth_ok, Some(ok()));
    }

    #[rstest]
    #[tokio::test]
    async fn rejected_credentials_report_auth_failed(harness: Harness) {
        let mut h = harness;
        let err = script_first_time(&mut h, access_denied())
            .await
            .expect_err("backend rejects");

        assert!(matches!(err, AuthError::Failed));
        assert!(!h.backend.is_authenticated());
    }

    #[rstest]
    #[tokio::test]
    async fn later_client_is_answered_from_cache(harness: Harness) {
        let mut h = harness;
        script_first_time(&mut h, ok()).await.expect("first handshake");

        let Harness {
            mut backend,
            backend_peer,
            client,
            client_peer,
        } = h;
        drop((client, client_peer));
        let (client_io, client_peer) = duplex(4096);
        let mut client = Framed::new(client_io, PacketCodec::default());
        let mut client_peer = Framed::new(client_peer, PacketCodec::default());

        let user = async {
            let hello = client_peer.read_packet().await.expect("cached greeting");
            client_peer
                .write_packet(&Packet::new(1, &b"other credentials"[..]))
                .await
                .expect("send credentials");
            let verdict = client_peer.read_packet().await.expect("cached verdict");
            (hello, verdict)
        };
        let (result, (hello, verdict)) = tokio::join!(authenticate(&mut backend, &mut client), user);
        result.expect("replay succeeds");
        assert_eq!(hello, greeting());
        assert_eq!(verdict, ok());

        // Closing our end lets the backend peer observe everything that was sent.
        backend.close();
        let mut raw = backend_peer.into_inner();
        let mut leftover = Vec::new();
        raw.read_to_end(&mut leftover).await.expect("drain backend side");
        assert!(leftover.is_empty(), "replay must not touch the backend");
    }

    #[rstest]
    #[tokio::test]
    async fn replay_without_cache_is_rejected(harness: Harness) {
        let mut h = harness;
        let err = replay_handshake(&mut h.backend, &mut h.client)
            .await
            .expect_err("nothing cached");
        assert!(matches!(err, AuthError::NoAuth));
    }

    #[rstest]
    #[tokio::test]
    async fn client_hangup_mid_handshake_is_tagged(harness: Harness) {
        let Harness {
            mut backend,
            mut backend_peer,
            mut client,
            client_peer,
        } = harness;
        drop(client_peer);
        backend_peer.write_packet(&greeting()).await.expect("greet");

        let err = authenticate(&mut backend, &mut client)
            .await
            .expect_err("client is gone");
        let AuthError::Relay(relay) = err else {
            panic!("expected relay error, got {err:?}");
        };
        assert_eq!(relay.peer, Peer::Client);
        assert_eq!(relay.phase, Phase::Handshake);
    }
}
