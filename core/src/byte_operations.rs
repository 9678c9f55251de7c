//! Cursor-based primitives over a packet's byte payload.
//!
//! All multi-byte integers on this wire are big-endian. Reads never touch
//! bytes past the packet length; running out of input yields
//! [`ProtocolError::Truncated`] instead of panicking.

use crate::error::ProtocolError;

pub struct PacketReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        PacketReader { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.bytes.len()
    }

    /// Returns the next byte without advancing the cursor.
    pub fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn take(&mut self, wanted: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < wanted {
            return Err(ProtocolError::Truncated {
                offset: self.pos,
                wanted,
                remaining: self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + wanted];
        self.pos += wanted;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_i8(&mut self) -> Result<i8, ProtocolError> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn get_u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_i16(&mut self) -> Result<i16, ProtocolError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_i32(&mut self) -> Result<i32, ProtocolError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// 64-bit experience values are the only 8-byte fields on the wire.
    pub fn get_u64(&mut self) -> Result<u64, ProtocolError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        self.take(len)
    }

    /// Fixed-length string; the length usually comes from a preceding
    /// 1-byte length field.
    pub fn get_string(&mut self, len: usize) -> Result<String, ProtocolError> {
        Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
    }

    /// Reads up to (and consuming) `delim`, or to end of packet if the
    /// delimiter never occurs.
    pub fn get_string_delim(&mut self, delim: u8) -> String {
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos] != delim {
            self.pos += 1;
        }
        let s = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
        if self.pos < self.bytes.len() {
            self.pos += 1;
        }
        s
    }

    /// Consumes the rest of the packet as a string.
    pub fn get_remaining_string(&mut self) -> String {
        let s = String::from_utf8_lossy(&self.bytes[self.pos..]).into_owned();
        self.pos = self.bytes.len();
        s
    }

    /// Parses an ASCII decimal integer digit by digit, stopping at `delim`
    /// (consumed) or end of packet. At least one digit is required and any
    /// other byte before the delimiter is an error.
    pub fn get_ascii_int(&mut self, delim: Option<u8>) -> Result<i64, ProtocolError> {
        let mut value: i64 = 0;
        let mut digits = 0;
        while let Some(b) = self.peek() {
            if Some(b) == delim {
                self.pos += 1;
                break;
            }
            if !b.is_ascii_digit() {
                return Err(ProtocolError::BadDigit(b));
            }
            // A malformed field must not wrap; the wire never carries
            // values near this bound.
            value = value
                .checked_mul(10)
                .and_then(|v| v.checked_add(i64::from(b - b'0')))
                .ok_or(ProtocolError::DecimalOverflow(self.pos))?;
            self.pos += 1;
            digits += 1;
        }
        if digits == 0 {
            return Err(ProtocolError::Truncated {
                offset: self.pos,
                wanted: 1,
                remaining: self.remaining(),
            });
        }
        Ok(value)
    }
}

/// Appends a big-endian u16.
pub fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Appends a big-endian u32.
pub fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Appends an unsigned value as ASCII decimal digits.
pub fn put_decimal(buf: &mut Vec<u8>, value: u32) {
    if value == 0 {
        buf.push(b'0');
        return;
    }
    // u32::MAX has 10 decimal digits.
    let mut digits = [0u8; 10];
    let mut n = value;
    let mut i = digits.len();
    while n > 0 {
        i -= 1;
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
    }
    buf.extend_from_slice(&digits[i..]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian_integers() {
        let bytes = [
            0x42, // u8
            0xff, // i8: -1
            0x12, 0x34, // u16
            0xff, 0xff, // i16: -1
            0x12, 0x34, 0x56, 0x78, // u32
            0xff, 0xff, 0xff, 0xfe, // i32: -2
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // u64
        ];
        let mut r = PacketReader::new(&bytes);

        assert_eq!(r.get_u8().unwrap(), 0x42);
        assert_eq!(r.get_i8().unwrap(), -1);
        assert_eq!(r.get_u16().unwrap(), 0x1234);
        assert_eq!(r.get_i16().unwrap(), -1);
        assert_eq!(r.get_u32().unwrap(), 0x12345678);
        assert_eq!(r.get_i32().unwrap(), -2);
        assert_eq!(r.get_u64().unwrap(), 0x0102030405060708);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn truncated_read_reports_offset_and_leaves_cursor() {
        let bytes = [0x01, 0x02, 0x03];
        let mut r = PacketReader::new(&bytes);
        assert_eq!(r.get_u16().unwrap(), 0x0102);

        let err = r.get_u32().unwrap_err();
        match err {
            ProtocolError::Truncated {
                offset,
                wanted,
                remaining,
            } => {
                assert_eq!(offset, 2);
                assert_eq!(wanted, 4);
                assert_eq!(remaining, 1);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }
        // Failed read must not consume anything.
        assert_eq!(r.position(), 2);
        assert_eq!(r.get_u8().unwrap(), 0x03);
    }

    #[test]
    fn fixed_and_delimited_strings() {
        let bytes = b"abc def rest";
        let mut r = PacketReader::new(bytes);
        assert_eq!(r.get_string(3).unwrap(), "abc");
        assert_eq!(r.get_u8().unwrap(), b' ');
        assert_eq!(r.get_string_delim(b' '), "def");
        assert_eq!(r.get_remaining_string(), "rest");
        assert!(!r.has_remaining());
    }

    #[test]
    fn delimited_string_without_delimiter_runs_to_end() {
        let mut r = PacketReader::new(b"nodots");
        assert_eq!(r.get_string_delim(b'.'), "nodots");
        assert!(!r.has_remaining());
    }

    #[test]
    fn ascii_int_with_and_without_delimiter() {
        let mut r = PacketReader::new(b"1023 1027");
        assert_eq!(r.get_ascii_int(Some(b' ')).unwrap(), 1023);
        assert_eq!(r.get_ascii_int(None).unwrap(), 1027);
        assert!(!r.has_remaining());
    }

    #[test]
    fn ascii_int_rejects_non_digits() {
        let mut r = PacketReader::new(b"12x");
        assert!(matches!(
            r.get_ascii_int(None),
            Err(ProtocolError::BadDigit(b'x'))
        ));
    }

    #[test]
    fn ascii_int_rejects_overflowing_values() {
        let mut r = PacketReader::new(b"99999999999999999999999");
        assert!(matches!(
            r.get_ascii_int(None),
            Err(ProtocolError::DecimalOverflow(_))
        ));
        // i64::MAX itself still parses.
        let mut r = PacketReader::new(b"9223372036854775807");
        assert_eq!(r.get_ascii_int(None).unwrap(), i64::MAX);
    }

    #[test]
    fn ascii_int_requires_at_least_one_digit() {
        let mut r = PacketReader::new(b"");
        assert!(matches!(
            r.get_ascii_int(None),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn put_decimal_matches_display() {
        for value in [0u32, 1, 9, 10, 99, 100, 65535, 4294967295] {
            let mut buf = Vec::new();
            put_decimal(&mut buf, value);
            assert_eq!(buf, value.to_string().into_bytes());
        }
    }

    #[test]
    fn put_integers_are_big_endian() {
        let mut buf = Vec::new();
        put_u16(&mut buf, 0x1234);
        put_u32(&mut buf, 0x56789abc);
        assert_eq!(buf, [0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc]);
    }
}
