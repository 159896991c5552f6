use std::fmt::Debug;

use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tracing::trace;

use crate::error::{TgError, TgResult};
use crate::pdu::header::MessageHeader;
use crate::pdu::message::ProtocolMessage;
use crate::pdu::verb_id::VerbId;

/// Creates empty messages for a given verb, to be populated from a received frame
#[cfg_attr(test, automock)]
pub trait MessageFactory: Debug + Send + Sync + 'static {
    fn create_message(&self, verb_id: VerbId) -> TgResult<ProtocolMessage>;
}

#[derive(Debug, Default)]
pub struct DefaultMessageFactory {}

impl MessageFactory for DefaultMessageFactory {
    fn create_message(&self, verb_id: VerbId) -> TgResult<ProtocolMessage> {
        match verb_id {
            VerbId::Invalid => Err(TgError::BadVerb(verb_id.id())),
            _ => Ok(ProtocolMessage::empty(verb_id)),
        }
    }
}

/// Decode a complete frame: the length is checked first, then magic and protocol version, and
///  only then is the verb used to select the message to decode into.
pub fn decode_frame(factory: &dyn MessageFactory, frame: Bytes) -> TgResult<ProtocolMessage> {
    if frame.len() >= 4 {
        let declared = i32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        if declared as i64 != frame.len() as i64 {
            return Err(TgError::InvalidMessageLength { declared: declared as i64, actual: frame.len() });
        }
    }

    let verb_id = MessageHeader::peek_verb_id(&frame)?;
    trace!(?verb_id, len = frame.len(), "decoding frame");

    let mut msg = factory.create_message(verb_id)?;
    msg.read_frame(frame)?;
    Ok(msg)
}
