//! Framing codec for the client/server wire protocol.
//!
//! Every frame is a 4-byte header (3-byte little-endian payload length and a
//! 1-byte sequence number) followed by the payload. [`PacketCodec`] decodes
//! whole logical [`Packet`]s: a frame carrying exactly [`MAX_PAYLOAD_LEN`]
//! bytes is joined with the frames that follow it until a shorter frame ends
//! the message. Encoding performs the inverse split.
//!
//! # Error Handling
//!
//! Failures are reported through the structured [`CodecError`] taxonomy and
//! surface as [`io::Error`] because `tokio_util` codecs speak `io::Error`.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    byte_order::{read_le_u24, write_le_u24},
    packet::{MAX_PAYLOAD_LEN, Packet},
};

pub mod error;

pub use error::{CodecError, EofError, FramingError, ProtocolError};

/// Frame header size: 3 length bytes plus the sequence number.
pub const HEADER_LEN: usize = 4;

/// Default cap on a reassembled message (64 MiB).
pub const DEFAULT_MAX_PACKET_LENGTH: usize = 64 * 1024 * 1024;

/// Decodes and encodes logical [`Packet`]s.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use tokio_util::codec::Decoder;
/// use umyproxy::codec::PacketCodec;
///
/// let mut codec = PacketCodec::default();
/// let mut buf = BytesMut::from(&[0x02, 0x00, 0x00, 0x00, 0x01, 0x02][..]);
/// let packet = codec
///     .decode(&mut buf)
///     .expect("valid frame")
///     .expect("complete frame");
/// assert_eq!(packet.payload.as_ref(), &[0x01, 0x02]);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct PacketCodec {
    max_packet_length: usize,
    strict_sequence: bool,
}

impl PacketCodec {
    /// Construct a codec capping reassembled messages at `max_packet_length` bytes.
    #[must_use]
    pub fn new(max_packet_length: usize) -> Self {
        Self {
            max_packet_length,
            strict_sequence: false,
        }
    }

    /// Reject continuation frames whose sequence number does not follow the
    /// previous frame.
    ///
    /// Disabled by default: continuation sequence numbers are consumed without
    /// validation.
    #[must_use]
    pub fn with_strict_sequence(mut self, strict: bool) -> Self {
        self.strict_sequence = strict;
        self
    }

    /// Return the maximum message length accepted by this codec.
    #[must_use]
    pub fn max_packet_length(&self) -> usize { self.max_packet_length }

    /// Scan the buffered frames of the next message without consuming them.
    ///
    /// Returns the number of buffered bytes and the total payload length once
    /// the terminating frame has arrived.
    fn scan(&self, src: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
        let mut offset = 0;
        let mut total = 0;
        let mut previous_seq: Option<u8> = None;
        loop {
            let Some(header) = read_header(src, offset) else {
                return Ok(None);
            };
            if self.strict_sequence
                && let Some(prev) = previous_seq
                && header.sequence_id != prev.wrapping_add(1)
            {
                return Err(ProtocolError::SequenceViolation {
                    expected: prev.wrapping_add(1),
                    actual: header.sequence_id,
                }
                .into());
            }
            total += header.len;
            if total > self.max_packet_length {
                return Err(FramingError::OversizedPacket {
                    size: total,
                    max: self.max_packet_length,
                }
                .into());
            }
            let end = offset + HEADER_LEN + header.len;
            if src.len() < end {
                return Ok(None);
            }
            offset = end;
            if header.len < MAX_PAYLOAD_LEN {
                return Ok(Some((offset, total)));
            }
            previous_seq = Some(header.sequence_id);
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self { Self::new(DEFAULT_MAX_PACKET_LENGTH) }
}

struct FrameHeader {
    len: usize,
    sequence_id: u8,
}

fn read_header(src: &[u8], offset: usize) -> Option<FrameHeader> {
    let bytes = src.get(offset..offset + HEADER_LEN)?;
    let [l0, l1, l2, sequence_id] = <[u8; HEADER_LEN]>::try_from(bytes).ok()?;
    Some(FrameHeader {
        len: read_le_u24([l0, l1, l2]) as usize,
        sequence_id,
    })
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((message_len, payload_len)) = self.scan(src)? else {
            return Ok(None);
        };

        let mut message = src.split_to(message_len);
        let sequence_id = message[3];
        if message_len == HEADER_LEN + payload_len {
            message.advance(HEADER_LEN);
            return Ok(Some(Packet::new(sequence_id, message.freeze())));
        }

        let mut payload = BytesMut::with_capacity(payload_len);
        while let Some(header) = read_header(&message, 0) {
            message.advance(HEADER_LEN);
            payload.extend_from_slice(&message.split_to(header.len));
        }
        Ok(Some(Packet::new(sequence_id, payload.freeze())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        match self.decode(src)? {
            Some(packet) => Ok(Some(packet)),
            None => Err(build_eof_error(src).into()),
        }
    }
}

/// Determine whether the stream closed mid-header or mid-frame.
fn build_eof_error(src: &BytesMut) -> CodecError {
    // Skip the complete continuation frames so the report covers the frame
    // that was actually cut short.
    let mut offset = 0;
    while let Some(header) = read_header(src, offset) {
        let end = offset + HEADER_LEN + header.len;
        if src.len() < end {
            return CodecError::Eof(EofError::MidFrame {
                bytes_received: src.len() - offset - HEADER_LEN,
                expected: header.len,
            });
        }
        offset = end;
    }
    CodecError::Eof(EofError::MidHeader {
        bytes_received: src.len() - offset,
        header_size: HEADER_LEN,
    })
}

impl Encoder<Packet> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&Packet>>::encode(self, &item, dst)
    }
}

impl Encoder<&Packet> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = item.payload.len();
        if payload_len > self.max_packet_length {
            return Err(CodecError::Framing(FramingError::OversizedPacket {
                size: payload_len,
                max: self.max_packet_length,
            })
            .into());
        }

        let frames = payload_len / MAX_PAYLOAD_LEN + 1;
        dst.reserve(payload_len + frames * HEADER_LEN);
        for frame in item.frames() {
            #[expect(
                clippy::cast_possible_truncation,
                reason = "frames never exceed MAX_PAYLOAD_LEN, which fits in 24 bits"
            )]
            let len = frame.payload.len() as u32;
            dst.put_slice(&write_le_u24(len));
            dst.put_u8(frame.sequence_id);
            dst.put_slice(&frame.payload);
        }
        Ok(())
    }
}
