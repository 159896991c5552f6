use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{TgError, TgResult};
use crate::util::safe_converter::PrecheckedCast;

/// Database NULL for variable length longs
pub const U64_NULL: u64 = 0x0fff_ffff_ffff_ffff;
/// Single byte encoding of [U64_NULL]
pub const U64_PACKED_NULL: u8 = 0xf0;

pub const MAX_UTF_LEN: usize = 65535;

const LARGE_WRITE_THRESHOLD: usize = 100_000;
const LARGE_WRITE_SLACK: usize = 2048;

/// Growable big-endian output buffer for protocol messages.
///
/// Values are appended at the end, but fixed-width values can be overwritten at any position
///  that was already written (`write_*_at`). A frame's length prefix is not known until its
///  payload is serialized, so it is written as a placeholder and backpatched.
pub struct ProtocolOutputStream {
    buf: BytesMut,
}

impl Default for ProtocolOutputStream {
    fn default() -> Self {
        ProtocolOutputStream::with_capacity(256)
    }
}

impl ProtocolOutputStream {
    pub fn new() -> ProtocolOutputStream {
        Default::default()
    }

    pub fn with_capacity(capacity: usize) -> ProtocolOutputStream {
        ProtocolOutputStream {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    /// Grow geometrically, or by a fixed slack for very large writes
    fn ensure(&mut self, additional: usize) {
        let count = self.buf.len();
        if count + additional <= self.buf.capacity() {
            return;
        }
        let new_capacity = if additional > LARGE_WRITE_THRESHOLD {
            count + additional + LARGE_WRITE_SLACK
        }
        else {
            (count + additional) * 2
        };
        self.buf.reserve(new_capacity - count);
    }

    /// Advance the write position, leaving zeroed bytes to be patched later
    pub fn skip(&mut self, n: usize) {
        self.ensure(n);
        self.buf.put_bytes(0, n);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(if value { 1 } else { 0 });
    }

    pub fn write_u8(&mut self, value: u8) {
        self.ensure(1);
        self.buf.put_u8(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.ensure(1);
        self.buf.put_i8(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.ensure(2);
        self.buf.put_i16(value);
    }

    pub fn write_char(&mut self, value: u16) {
        self.ensure(2);
        self.buf.put_u16(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.ensure(4);
        self.buf.put_i32(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.ensure(8);
        self.buf.put_i64(value);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_i32(value.to_bits() as i32);
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_i64(value.to_bits() as i64);
    }

    /// raw bytes without a length prefix
    pub fn write_raw(&mut self, value: &[u8]) {
        self.ensure(value.len());
        self.buf.put_slice(value);
    }

    /// A byte block, prefixed with its length as a signed 32 bit integer
    pub fn write_bytes(&mut self, value: &[u8]) -> TgResult<()> {
        if value.len() > i32::MAX as usize {
            return Err(TgError::CorruptData(format!("byte block of {} bytes exceeds the maximum block length", value.len())));
        }
        self.ensure(value.len() + 4);
        self.buf.put_i32(value.len().prechecked_cast());
        self.buf.put_slice(value);
        Ok(())
    }

    /// UTF-16 code units, two bytes each
    pub fn write_chars(&mut self, s: &str) {
        for c in s.encode_utf16() {
            self.write_char(c);
        }
    }

    /// A string in modified UTF-8, prefixed by its encoded length as an unsigned 16 bit integer.
    ///
    /// NB: On failure, the stream is left exactly as it was before the call
    pub fn write_utf(&mut self, s: &str) -> TgResult<()> {
        let start = self.buf.len();
        self.ensure(2 + s.len() * 3);
        self.buf.put_u16(0);

        let len = self.write_utf_string(s);
        if len > MAX_UTF_LEN {
            self.buf.truncate(start);
            return Err(TgError::StringTooLong(len));
        }

        self.write_u16_at_unchecked(start, len.prechecked_cast());
        Ok(())
    }

    /// Modified UTF-8: each UTF-16 code unit is encoded separately, and NUL takes two bytes
    fn write_utf_string(&mut self, s: &str) -> usize {
        let start = self.buf.len();
        for c in s.encode_utf16() {
            match c {
                0x0001..=0x007f => {
                    self.buf.put_u8(c as u8);
                }
                0x0800.. => {
                    self.buf.put_u8(0xe0 | ((c >> 12) & 0x0f) as u8);
                    self.buf.put_u8(0x80 | ((c >> 6) & 0x3f) as u8);
                    self.buf.put_u8(0x80 | (c & 0x3f) as u8);
                }
                _ => {
                    self.buf.put_u8(0xc0 | ((c >> 6) & 0x1f) as u8);
                    self.buf.put_u8(0x80 | (c & 0x3f) as u8);
                }
            }
        }
        self.buf.len() - start
    }

    /// Variable length encoding of an unsigned long:
    ///  * [U64_NULL] is the single byte [U64_PACKED_NULL]
    ///  * up to 0x7f: one byte `0xxxxxxx`
    ///  * up to 0x3fff: two bytes `10xxxxxx ...`
    ///  * up to 0x1fffffff: four bytes `110xxxxx ...`
    ///  * above: a length byte `1110nnnn` followed by the n significant bytes, big-endian
    pub fn write_var_long(&mut self, value: u64) {
        if value == U64_NULL {
            self.write_u8(U64_PACKED_NULL);
            return;
        }

        if value <= 0x7f {
            self.write_u8(value as u8);
            return;
        }

        if value <= 0x3fff {
            self.ensure(2);
            self.buf.put_u16(value as u16 | 0x8000);
            return;
        }

        if value <= 0x1fff_ffff {
            self.ensure(4);
            self.buf.put_u32(value as u32 | 0xc000_0000);
            return;
        }

        let num_bytes = 8 - (value.leading_zeros() / 8) as usize;
        self.ensure(1 + num_bytes);
        self.buf.put_u8(0xe0 | num_bytes as u8);
        self.buf.put_slice(&value.to_be_bytes()[8 - num_bytes..]);
    }

    fn check_position(&self, pos: usize, width: usize) -> TgResult<()> {
        if pos + width > self.buf.len() {
            return Err(TgError::InvalidPosition(pos));
        }
        Ok(())
    }

    fn write_u16_at_unchecked(&mut self, pos: usize, value: u16) {
        self.buf[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
    }

    /// Overwrite previously written bytes, returning the position after the written value
    pub fn write_bool_at(&mut self, pos: usize, value: bool) -> TgResult<usize> {
        self.write_u8_at(pos, if value { 1 } else { 0 })
    }

    pub fn write_u8_at(&mut self, pos: usize, value: u8) -> TgResult<usize> {
        self.check_position(pos, 1)?;
        self.buf[pos] = value;
        Ok(pos + 1)
    }

    pub fn write_i16_at(&mut self, pos: usize, value: i16) -> TgResult<usize> {
        self.check_position(pos, 2)?;
        self.buf[pos..pos + 2].copy_from_slice(&value.to_be_bytes());
        Ok(pos + 2)
    }

    pub fn write_i32_at(&mut self, pos: usize, value: i32) -> TgResult<usize> {
        self.check_position(pos, 4)?;
        self.buf[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
        Ok(pos + 4)
    }

    pub fn write_i64_at(&mut self, pos: usize, value: i64) -> TgResult<usize> {
        self.check_position(pos, 8)?;
        self.buf[pos..pos + 8].copy_from_slice(&value.to_be_bytes());
        Ok(pos + 8)
    }

    pub fn write_f32_at(&mut self, pos: usize, value: f32) -> TgResult<usize> {
        self.write_i32_at(pos, value.to_bits() as i32)
    }

    pub fn write_f64_at(&mut self, pos: usize, value: f64) -> TgResult<usize> {
        self.write_i64_at(pos, value.to_bits() as i64)
    }
}
