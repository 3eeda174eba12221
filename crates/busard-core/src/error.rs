use std::fmt;

use busard_flat::FlatError;
use busard_protocol::ErrorKind;

/// Transport-level failure: the byte pipe itself broke or produced
/// something unframeable.
#[derive(Debug)]
pub enum TransportError {
    /// The connection is closed (locally or by the peer).
    Closed,
    Io(std::io::Error),
    /// Framing violation; the session is torn down.
    Protocol(String),
    /// Inbound message exceeds the configured limit.
    TooLarge { len: usize, max: usize },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "connection closed"),
            TransportError::Io(e) => write!(f, "i/o error: {e}"),
            TransportError::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            TransportError::TooLarge { len, max } => {
                write!(f, "message of {len} bytes exceeds limit of {max}")
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// The error surfaced to callers of the invocation engine and to servant
/// dispatch code.
#[derive(Debug)]
pub enum RpcError {
    /// A protocol-level failure of a discriminated [`ErrorKind`], either
    /// detected locally or carried back as an `Error*` reply.
    Kind {
        kind: ErrorKind,
        reason: Option<String>,
    },
    /// A typed user exception: id plus the full reply message, which the
    /// generated exception type demarshalls from offset 16.
    Exception { exception_id: u32, message: Vec<u8> },
}

impl RpcError {
    pub fn kind(kind: ErrorKind) -> Self {
        RpcError::Kind { kind, reason: None }
    }

    pub fn comm(reason: impl Into<String>) -> Self {
        RpcError::Kind {
            kind: ErrorKind::CommFailure,
            reason: Some(reason.into()),
        }
    }

    pub fn timeout() -> Self {
        Self::comm("timeout")
    }

    pub fn closed() -> Self {
        Self::comm("connection closed")
    }

    /// The protocol kind, when this is not a typed exception.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            RpcError::Kind { kind, .. } => Some(*kind),
            RpcError::Exception { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RpcError::Kind { kind: ErrorKind::CommFailure, reason: Some(r) } if r == "timeout"
        )
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Kind {
                kind,
                reason: Some(r),
            } => write!(f, "{kind}: {r}"),
            RpcError::Kind { kind, reason: None } => write!(f, "{kind}"),
            RpcError::Exception { exception_id, .. } => {
                write!(f, "user exception {exception_id}")
            }
        }
    }
}

impl std::error::Error for RpcError {}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        RpcError::comm(e.to_string())
    }
}

impl From<FlatError> for RpcError {
    fn from(e: FlatError) -> Self {
        RpcError::Kind {
            kind: ErrorKind::BadInput,
            reason: Some(e.to_string()),
        }
    }
}
