use std::fmt;

/// Message identifier carried in `Header.msg_id`.
///
/// The numbering is wire-stable: peers compare raw u32 values, so variants
/// must never be reordered.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Request: `CallHeader` + marshalled arguments.
    FunctionCall = 0,
    /// Reply carrying out-arguments and the return value.
    BlockResponse = 1,
    /// Lifetime: increment the remote reference count.
    AddReference = 2,
    /// Lifetime: decrement the remote reference count.
    ReleaseObject = 3,
    /// No-payload acknowledgement.
    Success = 4,
    /// Reply carrying `{exception_id: u32}` + marshalled exception payload.
    Exception = 5,
    /// Open a server→client stream.
    StreamInitialization = 6,
    /// One ordered stream element.
    StreamDataChunk = 7,
    /// Clean stream close.
    StreamCompletion = 8,
    /// Stream close with an error surfaced to the consumer.
    StreamError = 9,
    /// Consumer asks the producer to stop.
    StreamCancellation = 10,

    /// The addressed POA index is unknown to the peer.
    ErrorPoaNotExist = 11,
    /// Slot empty or generation mismatch.
    ErrorObjectNotExist = 12,
    /// Transport failed; payload carries a reason string.
    ErrorCommFailure = 13,
    /// `function_idx` out of range for the interface.
    ErrorUnknownFunctionIdx = 14,
    /// `msg_id` not recognized by the peer.
    ErrorUnknownMessageId = 15,
    /// Security policy rejected the call.
    ErrorBadAccess = 16,
    /// Malformed payload (bounds, alignment or size violation).
    ErrorBadInput = 17,
}

impl MessageId {
    /// Convert from a u32 wire value. Returns None for unknown values.
    pub fn from_u32(val: u32) -> Option<Self> {
        Some(match val {
            0 => MessageId::FunctionCall,
            1 => MessageId::BlockResponse,
            2 => MessageId::AddReference,
            3 => MessageId::ReleaseObject,
            4 => MessageId::Success,
            5 => MessageId::Exception,
            6 => MessageId::StreamInitialization,
            7 => MessageId::StreamDataChunk,
            8 => MessageId::StreamCompletion,
            9 => MessageId::StreamError,
            10 => MessageId::StreamCancellation,
            11 => MessageId::ErrorPoaNotExist,
            12 => MessageId::ErrorObjectNotExist,
            13 => MessageId::ErrorCommFailure,
            14 => MessageId::ErrorUnknownFunctionIdx,
            15 => MessageId::ErrorUnknownMessageId,
            16 => MessageId::ErrorBadAccess,
            17 => MessageId::ErrorBadInput,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// True for the `Error*` subset.
    pub fn is_error(self) -> bool {
        self.as_u32() >= MessageId::ErrorPoaNotExist.as_u32()
    }

    /// True for the `Stream*` subset. Stream frames carry `request_id = 0`
    /// and are routed before request/response correlation.
    pub fn is_stream(self) -> bool {
        matches!(
            self,
            MessageId::StreamInitialization
                | MessageId::StreamDataChunk
                | MessageId::StreamCompletion
                | MessageId::StreamError
                | MessageId::StreamCancellation
        )
    }
}

impl TryFrom<u32> for MessageId {
    type Error = UnknownMessageId;

    fn try_from(val: u32) -> Result<Self, UnknownMessageId> {
        MessageId::from_u32(val).ok_or(UnknownMessageId(val))
    }
}

impl From<MessageId> for u32 {
    fn from(id: MessageId) -> u32 {
        id.as_u32()
    }
}

/// Error when converting from an unknown `msg_id` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownMessageId(pub u32);

impl fmt::Display for UnknownMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message id: {}", self.0)
    }
}

impl std::error::Error for UnknownMessageId {}

/// Message direction carried in `Header.msg_type`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Request = 0,
    Answer = 1,
}

impl MessageType {
    pub fn from_u32(val: u32) -> Option<Self> {
        match val {
            0 => Some(MessageType::Request),
            1 => Some(MessageType::Answer),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_roundtrip() {
        for raw in 0..=17u32 {
            let id = MessageId::from_u32(raw).unwrap();
            assert_eq!(id.as_u32(), raw);
        }
        assert_eq!(MessageId::from_u32(18), None);
        assert_eq!(MessageId::try_from(99), Err(UnknownMessageId(99)));
    }

    #[test]
    fn message_id_values_are_wire_stable() {
        assert_eq!(MessageId::FunctionCall as u32, 0);
        assert_eq!(MessageId::BlockResponse as u32, 1);
        assert_eq!(MessageId::AddReference as u32, 2);
        assert_eq!(MessageId::ReleaseObject as u32, 3);
        assert_eq!(MessageId::Success as u32, 4);
        assert_eq!(MessageId::Exception as u32, 5);
        assert_eq!(MessageId::StreamInitialization as u32, 6);
        assert_eq!(MessageId::StreamDataChunk as u32, 7);
        assert_eq!(MessageId::StreamCompletion as u32, 8);
        assert_eq!(MessageId::StreamError as u32, 9);
        assert_eq!(MessageId::StreamCancellation as u32, 10);
        assert_eq!(MessageId::ErrorBadInput as u32, 17);
    }

    #[test]
    fn error_and_stream_subsets() {
        assert!(MessageId::ErrorPoaNotExist.is_error());
        assert!(MessageId::ErrorBadInput.is_error());
        assert!(!MessageId::Success.is_error());
        assert!(MessageId::StreamDataChunk.is_stream());
        assert!(!MessageId::FunctionCall.is_stream());
    }

    #[test]
    fn message_type_roundtrip() {
        assert_eq!(MessageType::from_u32(0), Some(MessageType::Request));
        assert_eq!(MessageType::from_u32(1), Some(MessageType::Answer));
        assert_eq!(MessageType::from_u32(2), None);
    }
}
