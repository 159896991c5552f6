use bytes::Bytes;

use crate::error::{TgError, TgResult};
use crate::pdu::output_stream::{U64_NULL, U64_PACKED_NULL};
use crate::util::safe_converter::SafeCast;

macro_rules! read_fixed {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> TgResult<$ty> {
            const N: usize = std::mem::size_of::<$ty>();
            let bytes = self.take_array::<N>()?;
            Ok(<$ty>::from_be_bytes(bytes))
        }
    };
}

/// Cursor over a complete, already reassembled frame.
pub struct ProtocolInputStream {
    buf: Bytes,
    pos: usize,
    mark: usize,
}

impl ProtocolInputStream {
    pub fn new(buf: Bytes) -> ProtocolInputStream {
        ProtocolInputStream {
            buf,
            pos: 0,
            mark: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, pos: usize) -> TgResult<()> {
        if pos > self.buf.len() {
            return Err(TgError::InvalidPosition(pos));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn mark(&mut self) {
        self.mark = self.pos;
    }

    pub fn reset(&mut self) {
        self.pos = self.mark;
    }

    fn check_available(&self, needed: usize) -> TgResult<()> {
        if self.available() < needed {
            return Err(TgError::EndOfData {
                position: self.pos,
                needed,
                available: self.available(),
            });
        }
        Ok(())
    }

    fn take_array<const N: usize>(&mut self) -> TgResult<[u8; N]> {
        self.check_available(N)?;
        let mut result = [0u8; N];
        result.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(result)
    }

    pub fn skip(&mut self, n: usize) -> TgResult<()> {
        self.check_available(n)?;
        self.pos += n;
        Ok(())
    }

    read_fixed!(read_u8, u8);
    read_fixed!(read_i8, i8);
    read_fixed!(read_i16, i16);
    read_fixed!(read_char, u16);
    read_fixed!(read_i32, i32);
    read_fixed!(read_i64, i64);

    pub fn read_bool(&mut self) -> TgResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_f32(&mut self) -> TgResult<f32> {
        Ok(f32::from_bits(self.read_i32()? as u32))
    }

    pub fn read_f64(&mut self) -> TgResult<f64> {
        Ok(f64::from_bits(self.read_i64()? as u64))
    }

    /// a slice of the underlying buffer, without copying
    pub fn read_raw(&mut self, len: usize) -> TgResult<Bytes> {
        self.check_available(len)?;
        let result = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(result)
    }

    pub fn read_remaining(&mut self) -> Bytes {
        let result = self.buf.slice(self.pos..);
        self.pos = self.buf.len();
        result
    }

    /// A byte block with a signed 32 bit length prefix. A length of -1 marks corrupt data on the
    ///  sender side.
    pub fn read_bytes(&mut self) -> TgResult<Bytes> {
        let start = self.pos;
        let len = self.read_i32()?;
        if len == -1 {
            self.pos = start;
            return Err(TgError::CorruptData(format!("byte block at position {} is marked as corrupt", start)));
        }
        if len < 0 {
            self.pos = start;
            return Err(TgError::CorruptData(format!("negative byte block length {} at position {}", len, start)));
        }
        match self.read_raw(len as usize) {
            Ok(b) => Ok(b),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    /// Modified UTF-8 with an unsigned 16 bit length prefix.
    ///
    /// NB: If decoding fails, the read position is restored to where it was before the call
    pub fn read_utf(&mut self) -> TgResult<String> {
        let start = self.pos;
        let result = self.read_utf_unrestored();
        if result.is_err() {
            self.pos = start;
        }
        result
    }

    fn read_utf_unrestored(&mut self) -> TgResult<String> {
        let len: usize = (self.read_char()?).safe_cast();
        let data = self.read_raw(len)?;
        let data_start = self.pos - len;

        let mut units = Vec::with_capacity(len);
        let mut i = 0;
        while i < len {
            let b = data[i] as u16;
            match b >> 4 {
                0..=7 => {
                    units.push(b);
                    i += 1;
                }
                12 | 13 => {
                    if i + 2 > len {
                        return Err(TgError::Utf8Format(data_start + i));
                    }
                    let b2 = data[i + 1] as u16;
                    if b2 & 0xc0 != 0x80 {
                        return Err(TgError::Utf8Format(data_start + i + 1));
                    }
                    units.push(((b & 0x1f) << 6) | (b2 & 0x3f));
                    i += 2;
                }
                14 => {
                    if i + 3 > len {
                        return Err(TgError::Utf8Format(data_start + i));
                    }
                    let b2 = data[i + 1] as u16;
                    let b3 = data[i + 2] as u16;
                    if b2 & 0xc0 != 0x80 || b3 & 0xc0 != 0x80 {
                        return Err(TgError::Utf8Format(data_start + i + 1));
                    }
                    units.push(((b & 0x0f) << 12) | ((b2 & 0x3f) << 6) | (b3 & 0x3f));
                    i += 3;
                }
                _ => return Err(TgError::Utf8Format(data_start + i)),
            }
        }

        String::from_utf16(&units)
            .map_err(|_| TgError::Utf8Format(data_start))
    }

    /// Mirrors [crate::pdu::output_stream::ProtocolOutputStream::write_var_long].
    ///
    /// NB: If the buffer ends in the middle of a value, the read position is restored
    pub fn read_var_long(&mut self) -> TgResult<u64> {
        let start = self.pos;
        let result = self.read_var_long_unrestored();
        if result.is_err() {
            self.pos = start;
        }
        result
    }

    fn read_var_long_unrestored(&mut self) -> TgResult<u64> {
        let first = self.read_u8()?;
        if first == U64_PACKED_NULL {
            return Ok(U64_NULL);
        }

        if first & 0x80 == 0 {
            return Ok(first as u64);
        }

        if first & 0x40 == 0 {
            let second = self.read_u8()?;
            return Ok((((first & 0x3f) as u64) << 8) | second as u64);
        }

        if first & 0x20 == 0 {
            let rest = self.take_array::<3>()?;
            return Ok((((first & 0x1f) as u64) << 24)
                | ((rest[0] as u64) << 16)
                | ((rest[1] as u64) << 8)
                | rest[2] as u64);
        }

        let count = (first & 0x0f) as usize;
        if count > 8 {
            return Err(TgError::CorruptData(format!("invalid variable length long with {} bytes", count)));
        }
        self.check_available(count)?;
        let mut result = 0u64;
        for _ in 0..count {
            result = (result << 8) | self.read_u8()? as u64;
        }
        Ok(result)
    }
}
