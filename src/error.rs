use std::io;

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub type TgResult<T> = Result<T, TgError>;

/// The exception classification as it travels on the wire in exception and session termination
///  messages.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ExceptionType {
    BadVerb = 1,
    InvalidMessageLength = 2,
    BadMagic = 3,
    ProtocolNotSupported = 4,
    BadAuthentication = 5,
    IOException = 6,
    ConnectionTimeout = 7,
    GeneralException = 8,
    RetryIOException = 9,
    DisconnectedException = 10,
}

#[derive(Debug, thiserror::Error)]
pub enum TgError {
    #[error("bad verb id {0}")]
    BadVerb(i16),
    #[error("incorrect message type: decoder expects verb {expected}, frame has verb {actual}")]
    IncorrectMessageType { expected: i16, actual: i16 },
    #[error("invalid message length: length field is {declared}, frame has {actual} bytes")]
    InvalidMessageLength { declared: i64, actual: usize },
    #[error("bad magic {0:#010x}")]
    BadMagic(i32),
    #[error("unsupported protocol version {0:#06x}")]
    ProtocolNotSupported(i16),

    #[error("end of data: {needed} bytes requested at position {position}, {available} available")]
    EndOfData { position: usize, needed: usize, available: usize },
    #[error("malformed modified UTF-8 at position {0}")]
    Utf8Format(usize),
    #[error("string of {0} encoded bytes is too long for modified UTF-8")]
    StringTooLong(usize),
    #[error("read data corrupt: {0}")]
    CorruptData(String),
    #[error("invalid position specified: {0}")]
    InvalidPosition(usize),

    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("connection timeout: {0}")]
    ConnectionTimeout(String),
    #[error("channel disconnected: {0}")]
    Disconnected(String),
    #[error("transient I/O failure, operation should be retried: {0}")]
    RetryIo(String),
    #[error("no response within {0:?}")]
    ResponseTimeout(std::time::Duration),
    #[error("server reported {exception_type:?}: {message}")]
    Server { exception_type: ExceptionType, message: String },
    #[error("{0}")]
    General(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TgError {
    pub fn exception_type(&self) -> ExceptionType {
        match self {
            TgError::BadVerb(_) | TgError::IncorrectMessageType { .. } => ExceptionType::BadVerb,
            TgError::InvalidMessageLength { .. } => ExceptionType::InvalidMessageLength,
            TgError::BadMagic(_) => ExceptionType::BadMagic,
            TgError::ProtocolNotSupported(_) => ExceptionType::ProtocolNotSupported,
            TgError::EndOfData { .. }
            | TgError::Utf8Format(_)
            | TgError::StringTooLong(_)
            | TgError::CorruptData(_)
            | TgError::InvalidPosition(_)
            | TgError::ResponseTimeout(_)
            | TgError::General(_) => ExceptionType::GeneralException,
            TgError::Authentication(_) => ExceptionType::BadAuthentication,
            TgError::ConnectionTimeout(_) => ExceptionType::ConnectionTimeout,
            TgError::Disconnected(_) => ExceptionType::DisconnectedException,
            TgError::RetryIo(_) => ExceptionType::RetryIOException,
            TgError::Server { exception_type, .. } => *exception_type,
            TgError::Io(_) => ExceptionType::IOException,
        }
    }

    /// Transport level failures are the only ones that may be healed by reconnecting. Codec errors
    ///  indicate corruption or a protocol mismatch and are never retried.
    pub fn is_io(&self) -> bool {
        matches!(self, TgError::Io(_) | TgError::RetryIo(_))
    }

    /// Authentication failures and explicit disconnects end a failover scan immediately
    pub fn is_terminal_for_connect(&self) -> bool {
        matches!(self, TgError::Authentication(_) | TgError::Disconnected(_))
    }

    /// Re-raise an exception that arrived as an exception carrying message
    pub fn from_exception(exception_type: ExceptionType, message: String) -> TgError {
        match exception_type {
            ExceptionType::BadAuthentication => TgError::Authentication(message),
            ExceptionType::ConnectionTimeout => TgError::ConnectionTimeout(message),
            ExceptionType::DisconnectedException => TgError::Disconnected(message),
            ExceptionType::RetryIOException => TgError::RetryIo(message),
            ExceptionType::GeneralException => TgError::General(message),
            exception_type => TgError::Server { exception_type, message },
        }
    }
}
