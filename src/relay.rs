//! Packet I/O shared by the authentication relay, the response relay, and the
//! session loop.
//!
//! Both ends of a proxied session speak the same framing, so they sit behind
//! one [`PacketIo`] trait. Failures are tagged with the [`Peer`] and [`Phase`]
//! they happened in, which is all a session log line needs to explain why a
//! client was dropped.

use std::io;

use async_trait::async_trait;
use derive_more::Display;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::{codec::PacketCodec, packet::Packet};

/// Failure of a single packet read or write.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The connection was already closed locally.
    #[error("connection is closed")]
    Closed,
    /// The peer closed the stream at a message boundary.
    #[error("connection closed by peer")]
    Eof,
    /// Transport or codec failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Which end of the session an operation touched.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Peer {
    #[display("client")]
    Client,
    #[display("backend")]
    Backend,
}

/// Session phase an operation belonged to.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Phase {
    #[display("handshake")]
    Handshake,
    #[display("auth response")]
    AuthResponse,
    #[display("auth result")]
    AuthResult,
    #[display("command")]
    Command,
    #[display("response")]
    Response,
}

/// Direction of a failed operation.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Op {
    #[display("read")]
    Read,
    #[display("write")]
    Write,
}

/// A packet read or write that failed, with the side and phase it failed in.
#[derive(Debug, Error)]
#[error("{op} {peer} {phase} failed: {source}")]
pub struct RelayError {
    pub peer: Peer,
    pub phase: Phase,
    pub op: Op,
    #[source]
    pub source: ConnError,
}

impl RelayError {
    /// Whether the peer simply went away between messages.
    #[must_use]
    pub fn is_clean_close(&self) -> bool {
        self.op == Op::Read && matches!(self.source, ConnError::Eof)
    }
}

/// Reads and writes whole [`Packet`]s.
#[async_trait]
pub trait PacketIo: Send {
    /// Read the next logical message.
    async fn read_packet(&mut self) -> Result<Packet, ConnError>;

    /// Write a logical message and flush it.
    async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnError>;
}

#[async_trait]
impl<S> PacketIo for Framed<S, PacketCodec>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_packet(&mut self) -> Result<Packet, ConnError> {
        match self.next().await {
            Some(result) => Ok(result?),
            None => Err(ConnError::Eof),
        }
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnError> {
        self.send(packet).await?;
        Ok(())
    }
}

/// Read one packet from `io`, tagging any failure.
///
/// # Errors
///
/// Returns a [`RelayError`] carrying `peer` and `phase` if the read fails.
pub async fn recv<P: PacketIo + ?Sized>(
    io: &mut P,
    peer: Peer,
    phase: Phase,
) -> Result<Packet, RelayError> {
    io.read_packet().await.map_err(|source| RelayError {
        peer,
        phase,
        op: Op::Read,
        source,
    })
}

/// Write one packet to `io`, tagging any failure.
///
/// # Errors
///
/// Returns a [`RelayError`] carrying `peer` and `phase` if the write fails.
pub async fn send<P: PacketIo + ?Sized>(
    io: &mut P,
    packet: &Packet,
    peer: Peer,
    phase: Phase,
) -> Result<(), RelayError> {
    io.write_packet(packet).await.map_err(|source| RelayError {
        peer,
        phase,
        op: Op::Write,
        source,
    })
}
