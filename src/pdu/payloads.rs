use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{ExceptionType, TgError, TgResult};
use crate::pdu::input_stream::ProtocolInputStream;
use crate::pdu::output_stream::ProtocolOutputStream;
use crate::pdu::verb_id::VerbId;

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum HandshakeRequestType {
    Invalid = 0,
    Initiate = 1,
    ChallengeAccepted = 2,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum HandshakeStatus {
    Invalid = 0,
    AcceptChallenge = 1,
    ProceedWithAuthentication = 2,
    ChallengeFailed = 3,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeRequest {
    pub request_type: HandshakeRequestType,
    pub ssl_mode: bool,
    pub challenge: i64,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HandshakeResponse {
    pub status: HandshakeStatus,
    pub challenge: i64,
    /// only present if the status is [HandshakeStatus::ChallengeFailed]
    pub error_message: Option<String>,
}

/// The client's answer to a server challenge.
///
/// NB: This is a fixed arithmetic transformation without any shared secret. It exists for wire
///  compatibility only and provides no authentication strength whatsoever. The server treats the
///  challenge as a 32 bit integer, so the arithmetic is done on the truncated value with two's
///  complement overflow.
pub fn accept_challenge(challenge: i64) -> i64 {
    let challenge = challenge as i32;
    (challenge.wrapping_mul(2) / 3) as i64
}

#[derive(Clone, Eq, PartialEq)]
pub struct AuthenticateRequest {
    pub client_id: Option<String>,
    pub inbox_addr: Option<String>,
    pub user_name: Option<String>,
    /// opaque, already encrypted by the caller
    pub password: Bytes,
}

impl Debug for AuthenticateRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthenticateRequest{{client_id:{:?},inbox_addr:{:?},user_name:{:?}}}", self.client_id, self.inbox_addr, self.user_name)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AuthenticateResponse {
    Success {
        auth_token: i64,
        session_id: i64,
        server_certificate: Bytes,
    },
    Failure {
        error_status: i32,
    },
}

/// Shared layout of exception messages and forced session termination
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExceptionPayload {
    pub exception_type: ExceptionType,
    pub message: String,
}

impl ExceptionPayload {
    pub fn new(exception_type: ExceptionType, message: impl Into<String>) -> ExceptionPayload {
        ExceptionPayload {
            exception_type,
            message: message.into(),
        }
    }

    fn ser(&self, out: &mut ProtocolOutputStream) -> TgResult<()> {
        out.write_u8(self.exception_type.into());
        out.write_utf(&self.message)
    }

    fn deser(inp: &mut ProtocolInputStream) -> TgResult<ExceptionPayload> {
        let raw_type = inp.read_u8()?;
        let exception_type = ExceptionType::try_from(raw_type)
            .map_err(|_| TgError::CorruptData(format!("unknown exception type {}", raw_type)))?;
        Ok(ExceptionPayload {
            exception_type,
            message: inp.read_utf()?,
        })
    }
}

/// A message's body. The layout is determined by the verb id in the header.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Payload {
    Ping,
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    AuthenticateRequest(AuthenticateRequest),
    AuthenticateResponse(AuthenticateResponse),
    DisconnectChannel,
    SessionForcefullyTerminated(ExceptionPayload),
    Exception(ExceptionPayload),
    /// Verbs whose bodies are produced and consumed by higher layers. The bytes are passed through
    ///  unchanged.
    Opaque(Bytes),
}

impl Payload {
    /// The payload an empty message for a given verb starts out with, before anything is read
    pub fn empty_for(verb_id: VerbId) -> Payload {
        match verb_id {
            VerbId::Ping => Payload::Ping,
            VerbId::HandshakeRequest => Payload::HandshakeRequest(HandshakeRequest {
                request_type: HandshakeRequestType::Invalid,
                ssl_mode: false,
                challenge: 0,
            }),
            VerbId::HandshakeResponse => Payload::HandshakeResponse(HandshakeResponse {
                status: HandshakeStatus::Invalid,
                challenge: 0,
                error_message: None,
            }),
            VerbId::AuthenticateRequest => Payload::AuthenticateRequest(AuthenticateRequest {
                client_id: None,
                inbox_addr: None,
                user_name: None,
                password: Bytes::new(),
            }),
            VerbId::AuthenticateResponse => Payload::AuthenticateResponse(AuthenticateResponse::Failure { error_status: 0 }),
            VerbId::DisconnectChannelRequest => Payload::DisconnectChannel,
            VerbId::SessionForcefullyTerminated => Payload::SessionForcefullyTerminated(ExceptionPayload::new(ExceptionType::DisconnectedException, "")),
            VerbId::ExceptionMessage => Payload::Exception(ExceptionPayload::new(ExceptionType::GeneralException, "")),
            _ => Payload::Opaque(Bytes::new()),
        }
    }

    pub fn ser(&self, out: &mut ProtocolOutputStream) -> TgResult<()> {
        match self {
            Payload::Ping | Payload::DisconnectChannel => {}
            Payload::HandshakeRequest(p) => {
                out.write_u8(p.request_type.into());
                out.write_bool(p.ssl_mode);
                out.write_i64(p.challenge);
            }
            Payload::HandshakeResponse(p) => {
                out.write_u8(p.status.into());
                out.write_i64(p.challenge);
                if p.status == HandshakeStatus::ChallengeFailed {
                    out.write_bytes(p.error_message.as_deref().unwrap_or_default().as_bytes())?;
                }
            }
            Payload::AuthenticateRequest(p) => {
                write_optional_utf(out, p.client_id.as_deref())?;
                write_optional_utf(out, p.inbox_addr.as_deref())?;
                write_optional_utf(out, p.user_name.as_deref())?;
                out.write_bytes(&p.password)?;
            }
            Payload::AuthenticateResponse(AuthenticateResponse::Success { auth_token, session_id, server_certificate }) => {
                out.write_bool(true);
                out.write_i64(*auth_token);
                out.write_i64(*session_id);
                out.write_bytes(server_certificate)?;
            }
            Payload::AuthenticateResponse(AuthenticateResponse::Failure { error_status }) => {
                out.write_bool(false);
                out.write_i32(*error_status);
            }
            Payload::SessionForcefullyTerminated(p) | Payload::Exception(p) => p.ser(out)?,
            Payload::Opaque(buf) => out.write_raw(buf),
        }
        Ok(())
    }

    pub fn deser(verb_id: VerbId, inp: &mut ProtocolInputStream) -> TgResult<Payload> {
        let result = match verb_id {
            VerbId::Ping => Payload::Ping,
            VerbId::DisconnectChannelRequest => Payload::DisconnectChannel,
            VerbId::HandshakeRequest => {
                let raw_type = inp.read_u8()?;
                let request_type = HandshakeRequestType::try_from(raw_type)
                    .map_err(|_| TgError::CorruptData(format!("unknown handshake request type {}", raw_type)))?;
                Payload::HandshakeRequest(HandshakeRequest {
                    request_type,
                    ssl_mode: inp.read_bool()?,
                    challenge: inp.read_i64()?,
                })
            }
            VerbId::HandshakeResponse => {
                let raw_status = inp.read_u8()?;
                let status = HandshakeStatus::try_from(raw_status)
                    .map_err(|_| TgError::CorruptData(format!("unknown handshake status {}", raw_status)))?;
                let challenge = inp.read_i64()?;
                let error_message = if status == HandshakeStatus::ChallengeFailed {
                    Some(String::from_utf8_lossy(&inp.read_bytes()?).into_owned())
                }
                else {
                    None
                };
                Payload::HandshakeResponse(HandshakeResponse {
                    status,
                    challenge,
                    error_message,
                })
            }
            VerbId::AuthenticateRequest => Payload::AuthenticateRequest(AuthenticateRequest {
                client_id: read_optional_utf(inp)?,
                inbox_addr: read_optional_utf(inp)?,
                user_name: read_optional_utf(inp)?,
                password: inp.read_bytes()?,
            }),
            VerbId::AuthenticateResponse => {
                if inp.read_bool()? {
                    Payload::AuthenticateResponse(AuthenticateResponse::Success {
                        auth_token: inp.read_i64()?,
                        session_id: inp.read_i64()?,
                        server_certificate: inp.read_bytes()?,
                    })
                }
                else {
                    Payload::AuthenticateResponse(AuthenticateResponse::Failure {
                        error_status: inp.read_i32()?,
                    })
                }
            }
            VerbId::SessionForcefullyTerminated => Payload::SessionForcefullyTerminated(ExceptionPayload::deser(inp)?),
            VerbId::ExceptionMessage => Payload::Exception(ExceptionPayload::deser(inp)?),
            _ => Payload::Opaque(inp.read_remaining()),
        };
        Ok(result)
    }
}

/// empty strings go on the wire as null
fn write_optional_utf(out: &mut ProtocolOutputStream, value: Option<&str>) -> TgResult<()> {
    match value {
        Some(s) if !s.is_empty() => {
            out.write_bool(false);
            out.write_utf(s)
        }
        _ => {
            out.write_bool(true);
            Ok(())
        }
    }
}

fn read_optional_utf(inp: &mut ProtocolInputStream) -> TgResult<Option<String>> {
    if inp.read_bool()? {
        Ok(None)
    }
    else {
        Ok(Some(inp.read_utf()?))
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::small(3, 2)]
    #[case::truncating_division(10, 6)]
    #[case::negative(-9, -6)]
    #[case::negative_truncates_toward_zero(-10, -6)]
    #[case::overflow(0x4000_0000, -715827882)]
    #[case::upper_bits_ignored(0x1_0000_0003, 2)]
    fn test_accept_challenge(#[case] challenge: i64, #[case] expected: i64) {
        assert_eq!(accept_challenge(challenge), expected);
    }

    fn ser(payload: &Payload) -> Vec<u8> {
        let mut out = ProtocolOutputStream::new();
        payload.ser(&mut out).unwrap();
        out.freeze().to_vec()
    }

    #[rstest]
    #[case::handshake(Payload::HandshakeRequest(HandshakeRequest { request_type: HandshakeRequestType::ChallengeAccepted, ssl_mode: true, challenge: 6 }),
        b"\x02\x01\0\0\0\0\0\0\0\x06".to_vec())]
    #[case::handshake_failed(Payload::HandshakeResponse(HandshakeResponse { status: HandshakeStatus::ChallengeFailed, challenge: 0, error_message: Some("no".to_string()) }),
        b"\x03\0\0\0\0\0\0\0\0\0\0\0\x02no".to_vec())]
    #[case::auth(Payload::AuthenticateRequest(AuthenticateRequest { client_id: Some("c".to_string()), inbox_addr: None, user_name: Some("u".to_string()), password: Bytes::from_static(b"pw") }),
        b"\0\0\x01c\x01\0\0\x01u\0\0\0\x02pw".to_vec())]
    #[case::auth_failed(Payload::AuthenticateResponse(AuthenticateResponse::Failure { error_status: 7 }),
        b"\0\0\0\0\x07".to_vec())]
    #[case::exception(Payload::Exception(ExceptionPayload::new(ExceptionType::RetryIOException, "x")),
        b"\x09\0\x01x".to_vec())]
    #[case::ping(Payload::Ping, vec![])]
    fn test_layout(#[case] payload: Payload, #[case] expected: Vec<u8>) {
        assert_eq!(ser(&payload), expected);
    }

    #[rstest]
    #[case::handshake_request(VerbId::HandshakeRequest, Payload::HandshakeRequest(HandshakeRequest { request_type: HandshakeRequestType::Initiate, ssl_mode: false, challenge: -1 }))]
    #[case::handshake_response(VerbId::HandshakeResponse, Payload::HandshakeResponse(HandshakeResponse { status: HandshakeStatus::AcceptChallenge, challenge: 12345, error_message: None }))]
    #[case::auth_ok(VerbId::AuthenticateResponse, Payload::AuthenticateResponse(AuthenticateResponse::Success { auth_token: 1, session_id: 2, server_certificate: Bytes::from_static(b"cert") }))]
    #[case::terminated(VerbId::SessionForcefullyTerminated, Payload::SessionForcefullyTerminated(ExceptionPayload::new(ExceptionType::DisconnectedException, "killed by admin")))]
    #[case::opaque(VerbId::QueryResponse, Payload::Opaque(Bytes::from_static(b"\x01\x02\x03")))]
    fn test_read_back(#[case] verb_id: VerbId, #[case] payload: Payload) {
        let mut inp = ProtocolInputStream::new(Bytes::from(ser(&payload)));
        assert_eq!(Payload::deser(verb_id, &mut inp).unwrap(), payload);
        assert_eq!(inp.available(), 0);
    }

    #[test]
    fn test_unknown_exception_type() {
        let mut inp = ProtocolInputStream::new(Bytes::from_static(b"\x63\0\0"));
        assert!(matches!(Payload::deser(VerbId::ExceptionMessage, &mut inp), Err(TgError::CorruptData(_))));
    }

    #[test]
    fn test_password_not_logged() {
        let request = AuthenticateRequest { client_id: None, inbox_addr: None, user_name: Some("scott".to_string()), password: Bytes::from_static(b"tiger") };
        assert!(!format!("{:?}", request).contains("tiger"));
    }
}
