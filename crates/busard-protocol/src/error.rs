use std::fmt;

use crate::MessageId;

/// Protocol-level failure kinds, one per `Error*` message id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The addressed POA index is unknown; a permanent reference failure.
    PoaNotExist,
    /// Slot empty or generation mismatch; retry once after re-resolving.
    ObjectNotExist,
    /// Transport failed (closed, timed out, refused); retryable.
    CommFailure,
    /// Stub/runtime version mismatch in `function_idx`.
    UnknownFunctionIdx,
    /// Stub/runtime version mismatch in `msg_id`.
    UnknownMessageId,
    /// Security policy rejected the call; permanent.
    BadAccess,
    /// Malformed payload; permanent for the current call.
    BadInput,
}

impl ErrorKind {
    /// The message id used to carry this kind on the wire.
    pub fn message_id(self) -> MessageId {
        match self {
            ErrorKind::PoaNotExist => MessageId::ErrorPoaNotExist,
            ErrorKind::ObjectNotExist => MessageId::ErrorObjectNotExist,
            ErrorKind::CommFailure => MessageId::ErrorCommFailure,
            ErrorKind::UnknownFunctionIdx => MessageId::ErrorUnknownFunctionIdx,
            ErrorKind::UnknownMessageId => MessageId::ErrorUnknownMessageId,
            ErrorKind::BadAccess => MessageId::ErrorBadAccess,
            ErrorKind::BadInput => MessageId::ErrorBadInput,
        }
    }

    /// Map an `Error*` message id back to a kind. Returns None for
    /// non-error ids.
    pub fn from_message_id(id: MessageId) -> Option<Self> {
        Some(match id {
            MessageId::ErrorPoaNotExist => ErrorKind::PoaNotExist,
            MessageId::ErrorObjectNotExist => ErrorKind::ObjectNotExist,
            MessageId::ErrorCommFailure => ErrorKind::CommFailure,
            MessageId::ErrorUnknownFunctionIdx => ErrorKind::UnknownFunctionIdx,
            MessageId::ErrorUnknownMessageId => ErrorKind::UnknownMessageId,
            MessageId::ErrorBadAccess => ErrorKind::BadAccess,
            MessageId::ErrorBadInput => ErrorKind::BadInput,
            _ => return None,
        })
    }

    /// Whether a caller may reasonably retry after this failure.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::CommFailure | ErrorKind::ObjectNotExist)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::PoaNotExist => "poa does not exist",
            ErrorKind::ObjectNotExist => "object does not exist",
            ErrorKind::CommFailure => "communication failure",
            ErrorKind::UnknownFunctionIdx => "unknown function index",
            ErrorKind::UnknownMessageId => "unknown message id",
            ErrorKind::BadAccess => "access rejected",
            ErrorKind::BadInput => "malformed payload",
        };
        f.write_str(s)
    }
}
