//! Logical protocol messages and their wire frames.
//!
//! A [`Packet`] is one logical request or response unit. On the wire it is
//! carried by one or more [`Frame`]s: every frame whose payload is exactly
//! [`MAX_PAYLOAD_LEN`] bytes announces that another frame follows, so a
//! message whose length is a multiple of the maximum ends with an empty frame.

use bytes::Bytes;

use crate::byte_order::{U24_MAX, read_le_u16_at};

/// Largest payload a single frame can carry (`2^24 - 1`).
pub const MAX_PAYLOAD_LEN: usize = U24_MAX as usize;

/// Leading byte of an OK result.
pub const OK_MARKER: u8 = 0x00;
/// Leading byte of an end-of-block (EOF) marker.
pub const EOF_MARKER: u8 = 0xfe;
/// Leading byte of an error result.
pub const ERR_MARKER: u8 = 0xff;
/// Leading byte of a server request for a client-side file (`LOAD DATA LOCAL INFILE`).
pub const LOCAL_INFILE_MARKER: u8 = 0xfb;

/// EOF markers are always shorter than this; longer `0xfe` payloads are row data
/// starting with an 8-byte length-encoded integer.
const EOF_MAX_LEN: usize = 9;

/// Server status flag announcing that another result set follows.
pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
/// Server status flag announcing that an execute opened a cursor instead of
/// streaming rows.
pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;

/// A single frame as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Per-exchange sequence number; wraps at 255.
    pub sequence_id: u8,
    /// At most [`MAX_PAYLOAD_LEN`] bytes.
    pub payload: Bytes,
}

/// A complete logical message, reassembled from one or more frames.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    /// Sequence number of the first frame carrying this message.
    pub sequence_id: u8,
    /// Full message payload.
    pub payload: Bytes,
}

impl Packet {
    /// Build a packet from a sequence number and payload.
    #[must_use]
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Build an error result carrying `code`, a five-character `sql_state`,
    /// and a human-readable `message`.
    ///
    /// # Examples
    ///
    /// ```
    /// use umyproxy::packet::Packet;
    ///
    /// let err = Packet::error(0, 1040, "08004", "Too many connections");
    /// assert!(err.is_err());
    /// assert_eq!(&err.payload[1..3], &1040_u16.to_le_bytes());
    /// assert_eq!(&err.payload[3..9], b"#08004");
    /// ```
    #[must_use]
    pub fn error(sequence_id: u8, code: u16, sql_state: &str, message: &str) -> Self {
        let mut payload = Vec::with_capacity(9 + message.len());
        payload.push(ERR_MARKER);
        payload.extend_from_slice(&code.to_le_bytes());
        payload.push(b'#');
        payload.extend_from_slice(sql_state.as_bytes());
        payload.extend_from_slice(message.as_bytes());
        Self::new(sequence_id, payload)
    }

    /// First payload byte, if any.
    #[must_use]
    pub fn leading_byte(&self) -> Option<u8> { self.payload.first().copied() }

    /// Whether this is an OK result.
    #[must_use]
    pub fn is_ok(&self) -> bool { self.leading_byte() == Some(OK_MARKER) }

    /// Whether this is an error result.
    #[must_use]
    pub fn is_err(&self) -> bool { self.leading_byte() == Some(ERR_MARKER) }

    /// Whether this is an end-of-block marker.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.leading_byte() == Some(EOF_MARKER) && self.payload.len() < EOF_MAX_LEN
    }

    /// Whether the server is asking the client to upload a local file.
    #[must_use]
    pub fn is_local_infile(&self) -> bool { self.leading_byte() == Some(LOCAL_INFILE_MARKER) }

    /// Server status flags carried by an OK or EOF result.
    ///
    /// Returns `None` for other packets or when the payload is truncated.
    #[must_use]
    pub fn status_flags(&self) -> Option<u16> {
        if self.is_eof() {
            // marker, warnings: u16, status: u16
            return read_le_u16_at(&self.payload, 3);
        }
        if self.is_ok() {
            // marker, affected rows, last insert id, status: u16
            let rows_len = lenenc_int_len(&self.payload, 1)?;
            let id_len = lenenc_int_len(&self.payload, 1 + rows_len)?;
            return read_le_u16_at(&self.payload, 1 + rows_len + id_len);
        }
        None
    }

    /// Whether an OK or EOF result announces a further result set.
    #[must_use]
    pub fn more_results_exist(&self) -> bool {
        self.status_flags()
            .is_some_and(|flags| flags & SERVER_MORE_RESULTS_EXISTS != 0)
    }

    /// Whether an OK or EOF result announces an open cursor.
    #[must_use]
    pub fn cursor_exists(&self) -> bool {
        self.status_flags()
            .is_some_and(|flags| flags & SERVER_STATUS_CURSOR_EXISTS != 0)
    }

    /// Split the payload into wire frames.
    ///
    /// Sequence numbers increase from [`Packet::sequence_id`] and wrap at 255.
    /// An empty payload, or one whose length is an exact multiple of
    /// [`MAX_PAYLOAD_LEN`], ends with an empty frame.
    ///
    /// # Examples
    ///
    /// ```
    /// use umyproxy::packet::{MAX_PAYLOAD_LEN, Packet};
    ///
    /// let packet = Packet::new(3, vec![0_u8; MAX_PAYLOAD_LEN]);
    /// let frames: Vec<_> = packet.frames().collect();
    /// assert_eq!(frames.len(), 2);
    /// assert_eq!(frames[1].sequence_id, 4);
    /// assert!(frames[1].payload.is_empty());
    /// ```
    pub fn frames(&self) -> impl Iterator<Item = Frame> + '_ {
        let full = self.payload.len() / MAX_PAYLOAD_LEN;
        (0..=full).map(move |index| {
            let start = index * MAX_PAYLOAD_LEN;
            let end = (start + MAX_PAYLOAD_LEN).min(self.payload.len());
            Frame {
                sequence_id: self.sequence_id.wrapping_add(wrapping_index(index)),
                payload: self.payload.slice(start..end),
            }
        })
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "sequence numbers are defined modulo 256"
)]
fn wrapping_index(index: usize) -> u8 { (index % 256) as u8 }

/// Length in bytes of the length-encoded integer starting at `offset`.
fn lenenc_int_len(buf: &[u8], offset: usize) -> Option<usize> {
    match *buf.get(offset)? {
        0xfc => Some(3),
        0xfd => Some(4),
        0xfe => Some(9),
        0xfb | 0xff => None,
        _ => Some(1),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::ok(&[0x00, 0x00, 0x00, 0x02, 0x00], true, false, false)]
    #[case::err(&[0xff, 0x15, 0x04], false, true, false)]
    #[case::eof(&[0xfe, 0x00, 0x00, 0x02, 0x00], false, false, true)]
    #[case::long_fe_is_row(&[0xfe, 1, 2, 3, 4, 5, 6, 7, 8, 9], false, false, false)]
    #[case::row(&[0x03, b'a', b'b', b'c'], false, false, false)]
    #[case::empty(&[], false, false, false)]
    fn classifies_leading_markers(
        #[case] payload: &'static [u8],
        #[case] ok: bool,
        #[case] err: bool,
        #[case] eof: bool,
    ) {
        let packet = Packet::new(1, payload);
        assert_eq!(packet.is_ok(), ok);
        assert_eq!(packet.is_err(), err);
        assert_eq!(packet.is_eof(), eof);
    }

    #[rstest]
    #[case::eof_more(&[0xfe, 0x00, 0x00, 0x0a, 0x00], true)]
    #[case::eof_last(&[0xfe, 0x00, 0x00, 0x02, 0x00], false)]
    #[case::ok_more(&[0x00, 0x01, 0x00, 0x08, 0x00, 0x00, 0x00], true)]
    #[case::ok_wide_ids(&[0x00, 0xfc, 0x10, 0x27, 0x00, 0x08, 0x00], true)]
    #[case::ok_truncated(&[0x00, 0x01], false)]
    #[case::err(&[0xff, 0x08, 0x00, 0x08, 0x00], false)]
    fn reads_more_results_flag(#[case] payload: &'static [u8], #[case] more: bool) {
        assert_eq!(Packet::new(0, payload).more_results_exist(), more);
    }

    #[rstest]
    #[case::empty(0, 1)]
    #[case::small(1, 1)]
    #[case::below_max(MAX_PAYLOAD_LEN - 1, 1)]
    #[case::exact_max(MAX_PAYLOAD_LEN, 2)]
    #[case::above_max(MAX_PAYLOAD_LEN + 100, 2)]
    #[case::double_max(2 * MAX_PAYLOAD_LEN, 3)]
    fn splits_into_expected_frame_count(#[case] len: usize, #[case] frames: usize) {
        let packet = Packet::new(0, vec![7_u8; len]);
        let split: Vec<_> = packet.frames().collect();
        assert_eq!(split.len(), frames);
        assert_eq!(split.iter().map(|f| f.payload.len()).sum::<usize>(), len);
        let (last, head) = split.split_last().expect("at least one frame");
        assert!(head.iter().all(|f| f.payload.len() == MAX_PAYLOAD_LEN));
        assert!(last.payload.len() < MAX_PAYLOAD_LEN);
    }

    #[rstest]
    #[case::request(&[0xfb, b'd', b'a', b't', b'a'], true)]
    #[case::ok(&[0x00, 0x00, 0x00], false)]
    #[case::empty(&[], false)]
    fn detects_local_infile_request(#[case] payload: &'static [u8], #[case] expected: bool) {
        assert_eq!(Packet::new(1, payload).is_local_infile(), expected);
    }

    #[test]
    fn frame_sequence_wraps() {
        let packet = Packet::new(255, vec![0_u8; MAX_PAYLOAD_LEN + 1]);
        let ids: Vec<_> = packet.frames().map(|f| f.sequence_id).collect();
        assert_eq!(ids, vec![255, 0]);
    }
}
