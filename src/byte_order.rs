//! Helpers for the wire protocol's little-endian integer fields.
//!
//! Packet headers carry a 3-byte little-endian payload length, and a few
//! response payloads embed little-endian `u16` counters and status flags.
//! Keeping the conversions here lets protocol code stay explicit about wire
//! endianness.

/// Largest value representable in a 3-byte length field.
pub const U24_MAX: u32 = 0x00ff_ffff;

/// Serialise the low 24 bits of `value` in little-endian order.
///
/// # Examples
///
/// ```
/// use umyproxy::byte_order::write_le_u24;
///
/// assert_eq!(write_le_u24(0x0012_3456), [0x56, 0x34, 0x12]);
/// ```
#[must_use]
pub fn write_le_u24(value: u32) -> [u8; 3] {
    let [lo, mid, hi, _] = value.to_le_bytes();
    [lo, mid, hi]
}

/// Parse a 3-byte little-endian length field.
///
/// # Examples
///
/// ```
/// use umyproxy::byte_order::read_le_u24;
///
/// assert_eq!(read_le_u24([0xff, 0xff, 0xff]), 0x00ff_ffff);
/// ```
#[must_use]
pub fn read_le_u24(bytes: [u8; 3]) -> u32 {
    let [lo, mid, hi] = bytes;
    u32::from_le_bytes([lo, mid, hi, 0])
}

/// Read a little-endian `u16` at `offset`, or `None` when `buf` is too short.
#[must_use]
pub fn read_le_u16_at(buf: &[u8], offset: usize) -> Option<u16> {
    let end = offset.checked_add(2)?;
    buf.get(offset..end)
        .and_then(|slice| <[u8; 2]>::try_from(slice).ok())
        .map(u16::from_le_bytes)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{U24_MAX, read_le_u16_at, read_le_u24, write_le_u24};

    #[rstest]
    #[case::zero(0, [0, 0, 0])]
    #[case::one(1, [1, 0, 0])]
    #[case::mixed(0x0001_0203, [0x03, 0x02, 0x01])]
    #[case::max(U24_MAX, [0xff, 0xff, 0xff])]
    fn u24_matches_wire_layout(#[case] value: u32, #[case] bytes: [u8; 3]) {
        assert_eq!(write_le_u24(value), bytes);
        assert_eq!(read_le_u24(bytes), value);
    }

    #[test]
    fn u24_write_discards_high_byte() {
        assert_eq!(write_le_u24(0xaa00_0001), [1, 0, 0]);
    }

    #[rstest]
    #[case(&[0x34, 0x12], 0, Some(0x1234))]
    #[case(&[0x00, 0x02, 0x00], 1, Some(0x0002))]
    #[case(&[0x01], 0, None)]
    #[case(&[0x01, 0x02], usize::MAX, None)]
    fn u16_reads_are_bounds_checked(
        #[case] buf: &[u8],
        #[case] offset: usize,
        #[case] expected: Option<u16>,
    ) {
        assert_eq!(read_le_u16_at(buf, offset), expected);
    }
}
