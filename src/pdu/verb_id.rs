use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{TgError, TgResult};

/// The message type discriminator in a frame's header
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i16)]
pub enum VerbId {
    Ping = 0,
    HandshakeRequest = 1,
    HandshakeResponse = 2,
    AuthenticateRequest = 3,
    AuthenticateResponse = 4,
    BeginTransactionRequest = 5,
    BeginTransactionResponse = 6,
    CommitTransactionRequest = 7,
    CommitTransactionResponse = 8,
    RollbackTransactionRequest = 9,
    RollbackTransactionResponse = 10,
    QueryRequest = 11,
    QueryResponse = 12,
    TraverseRequest = 13,
    TraverseResponse = 14,
    AdminRequest = 15,
    AdminResponse = 16,
    MetadataRequest = 19,
    MetadataResponse = 20,
    GetEntityRequest = 21,
    GetEntityResponse = 22,
    GetLargeObjectRequest = 23,
    GetLargeObjectResponse = 24,
    BeginExportRequest = 25,
    BeginExportResponse = 26,
    PartialExportRequest = 27,
    PartialExportResponse = 28,
    CancelExportRequest = 29,
    BeginImportRequest = 31,
    BeginImportResponse = 32,
    PartialImportRequest = 33,
    PartialImportResponse = 34,
    DumpStacktraceRequest = 39,
    DisconnectChannelRequest = 40,
    SessionForcefullyTerminated = 41,
    DecryptBufferRequest = 44,
    DecryptBufferResponse = 45,
    ExceptionMessage = 100,
    Invalid = -1,
}

impl VerbId {
    /// Resolve a verb id read off the wire. Unknown ids and the explicit 'invalid' marker are both
    ///  rejected.
    pub fn from_wire(id: i16) -> TgResult<VerbId> {
        match VerbId::try_from(id) {
            Ok(VerbId::Invalid) | Err(_) => Err(TgError::BadVerb(id)),
            Ok(verb) => Ok(verb),
        }
    }

    pub fn id(self) -> i16 {
        self.into()
    }
}
