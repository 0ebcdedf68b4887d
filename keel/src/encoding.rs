//! Variable length integer codec
//!
//! Every numeric parameter on the wire is a "VLQ" integer: big endian groups of 7 bits, the high
//! bit of each byte set when more bytes follow. Negative values are sign extended through the
//! variable width, so small negative numbers are as cheap as small positive ones.
use crate::buffer::OutputBuffer;
use core::fmt;

/// Error type for representing a failed read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReadError;

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("read past end of message")
    }
}

/// Trait implemented for types that can be read from an input message
///
/// The `'de` lifetime allows the implementation to return references to the original data buffer.
/// This permits zero-copy reading of variable length data like byte arrays.
pub trait Readable<'de>: Sized {
    /// Attempt to read a `Self` from the input buffer, advancing the buffer if successful.
    fn read(data: &mut &'de [u8]) -> Result<Self, ReadError>;
}

/// Trait implemented for types that can be written to an `OutputBuffer`
pub trait Writable {
    /// Outputs the value to an `OutputBuffer`
    ///
    /// Writing cannot fail. A full buffer truncates, callers size their messages up front.
    fn write(&self, output: &mut impl OutputBuffer);
}

pub(crate) fn next_byte(data: &mut &[u8]) -> Result<u8, ReadError> {
    match data.split_first() {
        Some((&v, rest)) => {
            *data = rest;
            Ok(v)
        }
        None => Err(ReadError),
    }
}

/// Decodes one integer, advancing `data` past it
///
/// A first byte matching `0b?11x_xxxx` starts a negative number.
pub fn parse_int(data: &mut &[u8]) -> Result<u32, ReadError> {
    let mut c = next_byte(data)? as u32;
    let mut v = c & 0x7F;
    if (c & 0x60) == 0x60 {
        v |= (-0x20i32) as u32;
    }
    while c & 0x80 != 0 {
        c = next_byte(data)? as u32;
        v = (v << 7) | (c & 0x7F);
    }
    Ok(v)
}

/// Encodes one integer using the fewest bytes that still decode to `v`
pub fn encode_int(output: &mut impl OutputBuffer, v: u32) {
    let sv = v as i32;
    if !(-(1 << 26)..(3 << 26)).contains(&sv) {
        output.output(&[((sv >> 28) & 0x7F) as u8 | 0x80]);
    }
    if !(-(1 << 19)..(3 << 19)).contains(&sv) {
        output.output(&[((sv >> 21) & 0x7F) as u8 | 0x80]);
    }
    if !(-(1 << 12)..(3 << 12)).contains(&sv) {
        output.output(&[((sv >> 14) & 0x7F) as u8 | 0x80]);
    }
    if !(-(1 << 5)..(3 << 5)).contains(&sv) {
        output.output(&[((sv >> 7) & 0x7F) as u8 | 0x80]);
    }
    output.output(&[(sv & 0x7F) as u8]);
}

/// Number of bytes [`encode_int`] emits for `v`
pub fn encoded_int_len(v: u32) -> usize {
    let sv = v as i32;
    [
        -(1 << 5)..(3 << 5),
        -(1 << 12)..(3 << 12),
        -(1 << 19)..(3 << 19),
        -(1 << 26)..(3 << 26),
    ]
    .iter()
    .position(|range| range.contains(&sv))
    .map_or(5, |idx| idx + 1)
}

/// Largest message id representable by the two byte id form
pub const MSGID_MAX: u16 = 0x3FFF;

/// Decodes a message id
pub fn parse_msgid(data: &mut &[u8]) -> Result<u16, ReadError> {
    let c = next_byte(data)? as u16;
    if c & 0x80 == 0 {
        return Ok(c);
    }
    let lo = next_byte(data)? as u16;
    Ok(((c & 0x7F) << 7) | (lo & 0x7F))
}

/// Encodes a message id, one byte below 0x80 and two bytes otherwise
pub fn encode_msgid(output: &mut impl OutputBuffer, id: u16) {
    if id < 0x80 {
        output.output(&[id as u8]);
    } else {
        output.output(&[0x80 | ((id >> 7) & 0x7F) as u8, (id & 0x7F) as u8]);
    }
}

macro_rules! int_readwrite {
    ( $type:tt ) => {
        impl Readable<'_> for $type {
            fn read(data: &mut &[u8]) -> Result<Self, ReadError> {
                parse_int(data).map(|v| v as $type)
            }
        }

        impl Writable for $type {
            fn write(&self, output: &mut impl OutputBuffer) {
                encode_int(output, *self as u32)
            }
        }
    };
}

int_readwrite!(u32);
int_readwrite!(i32);
int_readwrite!(u16);
int_readwrite!(i16);
int_readwrite!(u8);

impl Readable<'_> for bool {
    fn read(data: &mut &[u8]) -> Result<Self, ReadError> {
        parse_int(data).map(|v| v != 0)
    }
}

impl Writable for bool {
    fn write(&self, output: &mut impl OutputBuffer) {
        encode_int(output, u32::from(*self))
    }
}

impl<'de> Readable<'de> for &'de [u8] {
    fn read(data: &mut &'de [u8]) -> Result<&'de [u8], ReadError> {
        let mut cursor = *data;
        let len = parse_int(&mut cursor)? as usize;
        if cursor.len() < len {
            return Err(ReadError);
        }
        let (ret, rest) = cursor.split_at(len);
        *data = rest;
        Ok(ret)
    }
}

impl Writable for &[u8] {
    fn write(&self, output: &mut impl OutputBuffer) {
        encode_int(output, self.len() as u32);
        output.output(self);
    }
}

impl Writable for &str {
    fn write(&self, output: &mut impl OutputBuffer) {
        self.as_bytes().write(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(v: i32) -> Vec<u8> {
        let mut out = Vec::new();
        v.write(&mut out);
        out
    }

    #[test]
    fn single_byte_range() {
        assert_eq!(encoded(0), [0x00]);
        assert_eq!(encoded(95), [0x5F]);
        assert_eq!(encoded(-1), [0x7F]);
        assert_eq!(encoded(-32), [0x60]);
    }

    #[test]
    fn multi_byte_boundaries() {
        assert_eq!(encoded(96), [0x80, 0x60]);
        assert_eq!(encoded(-33), [0xFF, 0x5F]);
        assert_eq!(encoded(i32::MAX).len(), 5);
        assert_eq!(encoded(i32::MIN).len(), 5);
    }

    #[test]
    fn parse_matches_encode() {
        let samples = [
            0,
            1,
            -1,
            95,
            96,
            -32,
            -33,
            12_287,
            12_288,
            -4096,
            -4097,
            1 << 20,
            -(1 << 20),
            i32::MAX,
            i32::MIN,
        ];
        for v in samples {
            let buf = encoded(v);
            let mut data = &buf[..];
            assert_eq!(parse_int(&mut data), Ok(v as u32), "value {v}");
            assert!(data.is_empty());
        }
    }

    #[test]
    fn width_boundaries_round_trip() {
        let edges = [
            (95, 1),
            (96, 2),
            (-32, 1),
            (-33, 2),
            ((3 << 12) - 1, 2),
            (3 << 12, 3),
            (-(1 << 12), 2),
            (-(1 << 12) - 1, 3),
            ((3 << 19) - 1, 3),
            (3 << 19, 4),
            (-(1 << 19), 3),
            (-(1 << 19) - 1, 4),
            ((3 << 26) - 1, 4),
            (3 << 26, 5),
            (-(1 << 26), 4),
            (-(1 << 26) - 1, 5),
        ];
        for (v, len) in edges {
            let buf = encoded(v);
            assert_eq!(buf.len(), len, "value {v}");
            assert_eq!(encoded_int_len(v as u32), len, "value {v}");
            let mut data = &buf[..];
            assert_eq!(parse_int(&mut data), Ok(v as u32), "value {v}");
        }
    }

    #[test]
    fn strided_sweep_round_trips() {
        let mut v = i32::MIN as i64;
        while v <= i32::MAX as i64 {
            let v32 = v as i32;
            let buf = encoded(v32);
            assert_eq!(buf.len(), encoded_int_len(v32 as u32), "value {v32}");
            let mut data = &buf[..];
            assert_eq!(parse_int(&mut data), Ok(v32 as u32), "value {v32}");
            assert!(data.is_empty());
            v += 65_537;
        }
    }

    #[test]
    fn truncated_int_is_error() {
        let mut data: &[u8] = &[0x80];
        assert_eq!(parse_int(&mut data), Err(ReadError));
        let mut empty: &[u8] = &[];
        assert_eq!(parse_int(&mut empty), Err(ReadError));
    }

    #[test]
    fn msgid_forms() {
        for id in 0..=MSGID_MAX {
            let mut out = Vec::new();
            encode_msgid(&mut out, id);
            assert_eq!(out.len(), if id < 0x80 { 1 } else { 2 });
            let mut data = &out[..];
            assert_eq!(parse_msgid(&mut data), Ok(id));
            assert!(data.is_empty());
        }
    }

    #[test]
    fn buffer_read_leaves_input_on_overrun() {
        let src: &[u8] = &[3, b'a', b'b'];
        let mut data = src;
        assert_eq!(<&[u8]>::read(&mut data), Err(ReadError));
        assert_eq!(data, src);

        let src: &[u8] = &[2, b'a', b'b', 7];
        let mut data = src;
        assert_eq!(<&[u8]>::read(&mut data), Ok(&b"ab"[..]));
        assert_eq!(data, &[7]);
    }
}
