//! Error types for the codec layer.
//!
//! This module separates framing errors (frame boundaries that cannot be
//! trusted), protocol errors (well-formed frames arriving out of order), I/O
//! errors, and EOF conditions.
//!
//! Every codec error is fatal for the connection it occurred on: once a frame
//! boundary is lost there is no way to resynchronise a length-prefixed stream.

use std::io;

use thiserror::Error;

/// Framing-level errors occurring during frame boundary detection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// The reassembled message would exceed the configured maximum.
    #[error("packet exceeds max length: {size} > {max}")]
    OversizedPacket {
        /// Message size announced by the frame headers seen so far.
        size: usize,
        /// Maximum allowed message size.
        max: usize,
    },
}

/// Protocol-level errors occurring after successful frame extraction.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A continuation frame did not carry the next sequence number.
    #[error("sequence violation: expected {expected}, got {actual}")]
    SequenceViolation {
        /// Sequence number implied by the previous frame.
        expected: u8,
        /// Sequence number actually received.
        actual: u8,
    },
}

/// EOF received before a message was complete.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum EofError {
    /// EOF received mid-frame.
    #[error("premature EOF: {bytes_received} bytes of {expected} byte frame received")]
    MidFrame {
        /// Payload bytes received before EOF.
        bytes_received: usize,
        /// Payload size announced by the header.
        expected: usize,
    },

    /// EOF received while reading a frame header.
    #[error("premature EOF during header: {bytes_received} of {header_size} header bytes")]
    MidHeader {
        /// Header bytes received before EOF.
        bytes_received: usize,
        /// Expected header size.
        header_size: usize,
    },
}

/// Top-level codec error taxonomy.
///
/// # Examples
///
/// ```
/// use umyproxy::codec::{CodecError, FramingError};
///
/// let err = CodecError::Framing(FramingError::OversizedPacket {
///     size: 2000,
///     max: 1024,
/// });
/// assert_eq!(err.error_type(), "framing");
/// ```
#[derive(Debug, Error)]
pub enum CodecError {
    /// Framing layer error.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// Protocol layer error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport layer I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stream ended inside a message.
    #[error("EOF: {0}")]
    Eof(#[from] EofError),
}

impl CodecError {
    /// Returns the error category as a string for logging and metrics.
    ///
    /// One of: `"framing"`, `"protocol"`, `"io"`, or `"eof"`.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Framing(_) => "framing",
            Self::Protocol(_) => "protocol",
            Self::Io(_) => "io",
            Self::Eof(_) => "eof",
        }
    }
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => e,
            CodecError::Framing(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            CodecError::Protocol(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            CodecError::Eof(e) => io::Error::new(io::ErrorKind::UnexpectedEof, e),
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
