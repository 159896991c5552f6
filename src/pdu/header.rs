use std::fmt::{Debug, Formatter};

use crate::error::{TgError, TgResult};
use crate::pdu::input_stream::ProtocolInputStream;
use crate::pdu::output_stream::ProtocolOutputStream;
use crate::pdu::verb_id::VerbId;
use crate::pdu::{HEADER_LEN, MAGIC, PROTOCOL_VERSION};
use crate::util::safe_converter::PrecheckedCast;

/// The fixed part of every frame:
///
/// ```ascii
/// 0: length (i32, covers the entire frame including this field)
/// 4: magic (i32)
/// 8: protocol version (i16)
/// 10: verb id (i16)
/// 12: sequence number (i64)
/// 20: timestamp (i64)
/// 28: request id (i64)
/// 36: auth token (i64)
/// 44: session id (i64)
/// 52: data offset (i16)
/// 54: payload
/// ```
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct MessageHeader {
    pub verb_id: VerbId,
    pub sequence_no: i64,
    pub timestamp: i64,
    pub request_id: i64,
    pub auth_token: i64,
    pub session_id: i64,
    pub data_offset: i16,
}

impl Debug for MessageHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?} seq={} req={} session={}]", self.verb_id, self.sequence_no, self.request_id, self.session_id)
    }
}

impl MessageHeader {
    pub fn new(verb_id: VerbId) -> MessageHeader {
        MessageHeader {
            verb_id,
            sequence_no: 0,
            timestamp: 0,
            request_id: 0,
            auth_token: 0,
            session_id: 0,
            data_offset: 0,
        }
    }

    /// Writes the header with a zero length placeholder at its start. The caller is responsible
    ///  for patching the frame length once the payload is written.
    pub fn write(&self, out: &mut ProtocolOutputStream) {
        out.write_i32(0);
        out.write_i32(MAGIC);
        out.write_i16(PROTOCOL_VERSION);
        out.write_i16(self.verb_id.id());
        out.write_i64(self.sequence_no);
        out.write_i64(self.timestamp);
        out.write_i64(self.request_id);
        out.write_i64(self.auth_token);
        out.write_i64(self.session_id);
        let data_offset: i16 = (out.position() + 2).prechecked_cast();
        out.write_i16(data_offset);
    }

    /// Reads and validates the header, starting after the length field. The magic number and the
    ///  protocol version are checked before the verb id is even looked at.
    pub fn read(inp: &mut ProtocolInputStream, expected: VerbId) -> TgResult<MessageHeader> {
        check_magic_and_version(inp)?;

        let verb_id = inp.read_i16()?;
        if verb_id != expected.id() {
            return Err(TgError::IncorrectMessageType {
                expected: expected.id(),
                actual: verb_id,
            });
        }

        Ok(MessageHeader {
            verb_id: expected,
            sequence_no: inp.read_i64()?,
            timestamp: inp.read_i64()?,
            request_id: inp.read_i64()?,
            auth_token: inp.read_i64()?,
            session_id: inp.read_i64()?,
            data_offset: inp.read_i16()?,
        })
    }

    /// Determine a complete frame's verb without consuming it
    pub fn peek_verb_id(frame: &[u8]) -> TgResult<VerbId> {
        if frame.len() < HEADER_LEN {
            return Err(TgError::InvalidMessageLength {
                declared: frame.len() as i64,
                actual: frame.len(),
            });
        }
        let mut inp = ProtocolInputStream::new(bytes::Bytes::copy_from_slice(&frame[4..12]));
        check_magic_and_version(&mut inp)?;
        VerbId::from_wire(inp.read_i16()?)
    }
}

fn check_magic_and_version(inp: &mut ProtocolInputStream) -> TgResult<()> {
    let magic = inp.read_i32()?;
    if magic != MAGIC {
        return Err(TgError::BadMagic(magic));
    }

    let version = inp.read_i16()?;
    if version != PROTOCOL_VERSION {
        return Err(TgError::ProtocolNotSupported(version));
    }
    Ok(())
}
