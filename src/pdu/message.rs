use std::fmt::{Debug, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::error::{ExceptionType, TgError, TgResult};
use crate::pdu::header::MessageHeader;
use crate::pdu::input_stream::ProtocolInputStream;
use crate::pdu::output_stream::ProtocolOutputStream;
use crate::pdu::payloads::{ExceptionPayload, Payload};
use crate::pdu::sequence::SequenceGenerator;
use crate::pdu::verb_id::VerbId;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// A complete protocol message: header plus verb specific payload.
///
/// Request ids are not assigned here - that is done by the channel when it registers a pending
///  response for the message.
#[derive(Clone, Eq, PartialEq)]
pub struct ProtocolMessage {
    header: MessageHeader,
    payload: Payload,
    updateable: bool,
}

impl Debug for ProtocolMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}{:?}", self.header, self.payload)
    }
}

impl ProtocolMessage {
    /// A new message, drawing the next sequence number and stamped with the current time
    pub fn new(verb_id: VerbId, payload: Payload, sequence: &SequenceGenerator) -> ProtocolMessage {
        let mut header = MessageHeader::new(verb_id);
        header.sequence_no = sequence.next();
        header.timestamp = now_millis();
        ProtocolMessage {
            header,
            payload,
            updateable: is_updateable_verb(verb_id),
        }
    }

    /// A message with a default payload and zeroed header fields, to be filled by reading a frame
    pub fn empty(verb_id: VerbId) -> ProtocolMessage {
        ProtocolMessage {
            header: MessageHeader::new(verb_id),
            payload: Payload::empty_for(verb_id),
            updateable: is_updateable_verb(verb_id),
        }
    }

    /// An exception message that is created locally to unblock a waiting caller, and never sent
    pub fn local_exception(exception_type: ExceptionType, message: impl Into<String>) -> ProtocolMessage {
        let mut result = ProtocolMessage::empty(VerbId::ExceptionMessage);
        result.header.timestamp = now_millis();
        result.payload = Payload::Exception(ExceptionPayload::new(exception_type, message));
        result
    }

    pub fn verb_id(&self) -> VerbId {
        self.header.verb_id
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: Payload) {
        self.payload = payload;
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn is_updateable(&self) -> bool {
        self.updateable
    }

    pub fn set_updateable(&mut self, updateable: bool) {
        self.updateable = updateable;
    }

    pub fn sequence_no(&self) -> i64 {
        self.header.sequence_no
    }

    pub fn timestamp(&self) -> i64 {
        self.header.timestamp
    }

    pub fn request_id(&self) -> i64 {
        self.header.request_id
    }

    pub fn set_request_id(&mut self, request_id: i64) {
        self.header.request_id = request_id;
    }

    pub fn auth_token(&self) -> i64 {
        self.header.auth_token
    }

    pub fn set_auth_token(&mut self, auth_token: i64) {
        self.header.auth_token = auth_token;
    }

    pub fn session_id(&self) -> i64 {
        self.header.session_id
    }

    pub fn set_session_id(&mut self, session_id: i64) {
        self.header.session_id = session_id;
    }

    /// Prepare a message for being sent again. The timestamp is always refreshed, the sequence
    ///  number only if the message is updateable.
    pub fn update_sequence_and_timestamp(&mut self, sequence: &SequenceGenerator) {
        if self.updateable {
            self.header.sequence_no = sequence.next();
        }
        self.header.timestamp = now_millis();
    }

    pub fn write_header(&self, out: &mut ProtocolOutputStream) {
        self.header.write(out);
    }

    pub fn write_payload(&self, out: &mut ProtocolOutputStream) -> TgResult<()> {
        self.payload.ser(out)
    }

    /// Serialize the complete frame, with the length field patched to the exact frame size
    pub fn to_bytes(&self) -> TgResult<Bytes> {
        let mut out = ProtocolOutputStream::new();
        self.write_header(&mut out);
        self.write_payload(&mut out)?;

        let len = out.position();
        if len > i32::MAX as usize {
            return Err(TgError::InvalidMessageLength { declared: len.safe_cast(), actual: len });
        }
        out.write_i32_at(0, len.prechecked_cast())?;
        Ok(out.freeze())
    }

    /// Read the header following the length field, validating magic, version and verb
    pub fn read_header(&mut self, inp: &mut ProtocolInputStream) -> TgResult<()> {
        self.header = MessageHeader::read(inp, self.header.verb_id)?;
        Ok(())
    }

    pub fn read_payload(&mut self, inp: &mut ProtocolInputStream) -> TgResult<()> {
        self.payload = Payload::deser(self.header.verb_id, inp)?;
        Ok(())
    }

    /// Populate this message from a complete frame. The frame's length field must match the
    ///  frame's actual size.
    pub fn read_frame(&mut self, frame: Bytes) -> TgResult<()> {
        let actual = frame.len();
        let mut inp = ProtocolInputStream::new(frame);
        let declared = inp.read_i32()?;
        if declared as i64 != actual.safe_cast() {
            return Err(TgError::InvalidMessageLength { declared: declared as i64, actual });
        }

        self.read_header(&mut inp)?;
        self.read_payload(&mut inp)
    }

    /// The exception carried by an exception message, if this is one
    pub fn exception(&self) -> Option<&ExceptionPayload> {
        match &self.payload {
            Payload::Exception(e) => Some(e),
            _ => None,
        }
    }
}

/// Messages that may get a fresh sequence number when they are resent: the handshake request and
///  requests built by higher layers.
fn is_updateable_verb(verb_id: VerbId) -> bool {
    use VerbId::*;
    matches!(verb_id,
        HandshakeRequest
        | BeginTransactionRequest
        | CommitTransactionRequest
        | RollbackTransactionRequest
        | QueryRequest
        | TraverseRequest
        | AdminRequest
        | MetadataRequest
        | GetEntityRequest
        | GetLargeObjectRequest
        | BeginExportRequest
        | PartialExportRequest
        | CancelExportRequest
        | BeginImportRequest
        | PartialImportRequest
        | DumpStacktraceRequest
        | DecryptBufferRequest)
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;
    use crate::pdu::payloads::{AuthenticateResponse, HandshakeRequest, HandshakeRequestType};

    fn query(sequence: &SequenceGenerator) -> ProtocolMessage {
        let mut msg = ProtocolMessage::new(VerbId::QueryRequest, Payload::Opaque(Bytes::from_static(b"query text")), sequence);
        msg.set_request_id(17);
        msg.set_auth_token(33);
        msg.set_session_id(44);
        msg
    }

    #[rstest]
    #[case::opaque(VerbId::QueryRequest, Payload::Opaque(Bytes::from_static(b"query text")))]
    #[case::ping(VerbId::Ping, Payload::Ping)]
    #[case::handshake(VerbId::HandshakeRequest, Payload::HandshakeRequest(HandshakeRequest { request_type: HandshakeRequestType::Initiate, ssl_mode: true, challenge: 0 }))]
    #[case::auth(VerbId::AuthenticateResponse, Payload::AuthenticateResponse(AuthenticateResponse::Success { auth_token: 5, session_id: 6, server_certificate: Bytes::new() }))]
    #[case::exception(VerbId::ExceptionMessage, Payload::Exception(ExceptionPayload::new(ExceptionType::GeneralException, "\u{20ac} failure")))]
    fn test_frame_length_integrity(#[case] verb_id: VerbId, #[case] payload: Payload) {
        let sequence = SequenceGenerator::new();
        let msg = ProtocolMessage::new(verb_id, payload, &sequence);
        let frame = msg.to_bytes().unwrap();

        let declared = i32::from_be_bytes(frame[0..4].try_into().unwrap());
        assert_eq!(declared as usize, frame.len());

        let mut read_back = ProtocolMessage::empty(verb_id);
        read_back.read_frame(frame).unwrap();
        assert_eq!(read_back.header().data_offset, 54);
        let mut expected_header = *msg.header();
        expected_header.data_offset = 54;
        assert_eq!(read_back.header(), &expected_header);
        assert_eq!(read_back.payload(), msg.payload());
    }

    #[test]
    fn test_length_mismatch() {
        let sequence = SequenceGenerator::new();
        let frame = query(&sequence).to_bytes().unwrap();
        let truncated = frame.slice(..frame.len() - 1);

        let mut read_back = ProtocolMessage::empty(VerbId::QueryRequest);
        match read_back.read_frame(truncated) {
            Err(TgError::InvalidMessageLength { declared, actual }) => {
                assert_eq!(declared as usize, frame.len());
                assert_eq!(actual, frame.len() - 1);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_wrong_decoder() {
        let sequence = SequenceGenerator::new();
        let frame = query(&sequence).to_bytes().unwrap();
        let mut read_back = ProtocolMessage::empty(VerbId::TraverseRequest);
        assert!(matches!(read_back.read_frame(frame), Err(TgError::IncorrectMessageType { expected: 13, actual: 11 })));
    }

    #[rstest]
    #[case::updateable(VerbId::QueryRequest, true)]
    #[case::handshake(VerbId::HandshakeRequest, true)]
    #[case::not_updateable(VerbId::Ping, false)]
    #[case::response(VerbId::QueryResponse, false)]
    fn test_update_sequence_and_timestamp(#[case] verb_id: VerbId, #[case] updateable: bool) {
        let sequence = SequenceGenerator::new();
        let mut msg = ProtocolMessage::new(verb_id, Payload::empty_for(verb_id), &sequence);
        assert_eq!(msg.sequence_no(), 1);
        assert_eq!(msg.is_updateable(), updateable);

        let original_timestamp = msg.timestamp();
        msg.header.timestamp = 0;
        msg.update_sequence_and_timestamp(&sequence);
        assert!(msg.timestamp() >= original_timestamp);
        assert_eq!(msg.sequence_no(), if updateable { 2 } else { 1 });
    }

    #[test]
    fn test_sequence_is_per_construction() {
        let sequence = SequenceGenerator::new();
        let a = query(&sequence);
        let b = query(&sequence);
        assert_eq!(b.sequence_no(), a.sequence_no() + 1);
        assert_eq!(a.request_id(), b.request_id());
    }
}
