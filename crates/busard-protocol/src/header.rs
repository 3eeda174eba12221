//! Fixed little-endian wire layouts.
//!
//! Every message starts with the 16-byte [`Header`]. Request and stream
//! bodies follow at [`BODY_OFFSET`]. The structs here encode/decode
//! themselves against plain byte slices; growable-buffer plumbing is the
//! codec crate's job.

use crate::{MessageId, MessageType};

/// Size of the message header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Offset of the first body byte (the `CallHeader`, lifetime body or
/// stream body) from the start of the message.
pub const BODY_OFFSET: usize = 16;

#[inline]
fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

#[inline]
fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[inline]
fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

#[inline]
fn write_u16(buf: &mut [u8], at: usize, val: u16) {
    buf[at..at + 2].copy_from_slice(&val.to_le_bytes());
}

#[inline]
fn write_u32(buf: &mut [u8], at: usize, val: u32) {
    buf[at..at + 4].copy_from_slice(&val.to_le_bytes());
}

#[inline]
fn write_u64(buf: &mut [u8], at: usize, val: u64) {
    buf[at..at + 8].copy_from_slice(&val.to_le_bytes());
}

/// Message header: `{size, msg_id, msg_type, request_id}`, little-endian.
///
/// `size` counts everything after itself, i.e. message length minus 4.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub size: u32,
    pub msg_id: u32,
    pub msg_type: u32,
    pub request_id: u32,
}

/// Field offsets within [`Header`].
pub mod header_offsets {
    pub const SIZE: usize = 0;
    pub const MSG_ID: usize = 4;
    pub const MSG_TYPE: usize = 8;
    pub const REQUEST_ID: usize = 12;
}

impl Header {
    pub fn new(msg_id: MessageId, msg_type: MessageType) -> Self {
        Header {
            size: 0,
            msg_id: msg_id.as_u32(),
            msg_type: msg_type.as_u32(),
            request_id: 0,
        }
    }

    /// Decode from the first 16 bytes of a message. Returns None if the
    /// slice is too short.
    pub fn read(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Header {
            size: read_u32(buf, header_offsets::SIZE),
            msg_id: read_u32(buf, header_offsets::MSG_ID),
            msg_type: read_u32(buf, header_offsets::MSG_TYPE),
            request_id: read_u32(buf, header_offsets::REQUEST_ID),
        })
    }

    /// Encode into the first 16 bytes of a message.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`HEADER_SIZE`].
    pub fn write(&self, buf: &mut [u8]) {
        write_u32(buf, header_offsets::SIZE, self.size);
        write_u32(buf, header_offsets::MSG_ID, self.msg_id);
        write_u32(buf, header_offsets::MSG_TYPE, self.msg_type);
        write_u32(buf, header_offsets::REQUEST_ID, self.request_id);
    }

    pub fn message_id(&self) -> Option<MessageId> {
        MessageId::from_u32(self.msg_id)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u32(self.msg_type)
    }
}

/// Call header following the message header on a `FunctionCall`:
/// `{poa_idx u16, interface_idx u8, function_idx u8, pad u32, object_id u64}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallHeader {
    pub poa_idx: u16,
    pub interface_idx: u8,
    pub function_idx: u8,
    pub object_id: u64,
}

impl CallHeader {
    pub const SIZE: usize = 16;

    pub const POA_IDX: usize = 0;
    pub const INTERFACE_IDX: usize = 2;
    pub const FUNCTION_IDX: usize = 3;
    pub const OBJECT_ID: usize = 8;

    pub fn read(body: &[u8]) -> Option<Self> {
        if body.len() < Self::SIZE {
            return None;
        }
        Some(CallHeader {
            poa_idx: read_u16(body, Self::POA_IDX),
            interface_idx: body[Self::INTERFACE_IDX],
            function_idx: body[Self::FUNCTION_IDX],
            object_id: read_u64(body, Self::OBJECT_ID),
        })
    }

    pub fn write(&self, body: &mut [u8]) {
        body[..Self::SIZE].fill(0);
        write_u16(body, Self::POA_IDX, self.poa_idx);
        body[Self::INTERFACE_IDX] = self.interface_idx;
        body[Self::FUNCTION_IDX] = self.function_idx;
        write_u64(body, Self::OBJECT_ID, self.object_id);
    }
}

/// Body of `AddReference` / `ReleaseObject`: `{poa_idx u16, pad, object_id u64}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LifetimeBody {
    pub poa_idx: u16,
    pub object_id: u64,
}

impl LifetimeBody {
    pub const SIZE: usize = 16;

    pub const POA_IDX: usize = 0;
    pub const OBJECT_ID: usize = 8;

    pub fn read(body: &[u8]) -> Option<Self> {
        if body.len() < Self::SIZE {
            return None;
        }
        Some(LifetimeBody {
            poa_idx: read_u16(body, Self::POA_IDX),
            object_id: read_u64(body, Self::OBJECT_ID),
        })
    }

    pub fn write(&self, body: &mut [u8]) {
        body[..Self::SIZE].fill(0);
        write_u16(body, Self::POA_IDX, self.poa_idx);
        write_u64(body, Self::OBJECT_ID, self.object_id);
    }
}

/// Body of `StreamInitialization`, 32 bytes:
/// `{stream_id u64, poa_idx u16, interface_idx u8, pad, object_id u64, func_idx u8, pad}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamInitBody {
    pub stream_id: u64,
    pub poa_idx: u16,
    pub interface_idx: u8,
    pub object_id: u64,
    pub func_idx: u8,
}

impl StreamInitBody {
    pub const SIZE: usize = 32;

    pub const STREAM_ID: usize = 0;
    pub const POA_IDX: usize = 8;
    pub const INTERFACE_IDX: usize = 10;
    pub const OBJECT_ID: usize = 16;
    pub const FUNC_IDX: usize = 24;

    pub fn read(body: &[u8]) -> Option<Self> {
        if body.len() < Self::SIZE {
            return None;
        }
        Some(StreamInitBody {
            stream_id: read_u64(body, Self::STREAM_ID),
            poa_idx: read_u16(body, Self::POA_IDX),
            interface_idx: body[Self::INTERFACE_IDX],
            object_id: read_u64(body, Self::OBJECT_ID),
            func_idx: body[Self::FUNC_IDX],
        })
    }

    pub fn write(&self, body: &mut [u8]) {
        body[..Self::SIZE].fill(0);
        write_u64(body, Self::STREAM_ID, self.stream_id);
        write_u16(body, Self::POA_IDX, self.poa_idx);
        body[Self::INTERFACE_IDX] = self.interface_idx;
        write_u64(body, Self::OBJECT_ID, self.object_id);
        body[Self::FUNC_IDX] = self.func_idx;
    }
}

/// Fixed prefix of a `StreamDataChunk` body:
/// `{stream_id u64, sequence u64, window_size u32, data vector}`.
///
/// The `data` field at [`Self::DATA_FIELD`] is a relative-offset vector of
/// bytes; the codec crate allocates and bounds-checks it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamChunkHeader {
    pub stream_id: u64,
    pub sequence: u64,
    pub window_size: u32,
}

impl StreamChunkHeader {
    /// Size including the 8-byte vector field header.
    pub const SIZE: usize = 28;

    pub const STREAM_ID: usize = 0;
    pub const SEQUENCE: usize = 8;
    pub const WINDOW_SIZE: usize = 16;
    pub const DATA_FIELD: usize = 20;

    pub fn read(body: &[u8]) -> Option<Self> {
        if body.len() < Self::SIZE {
            return None;
        }
        Some(StreamChunkHeader {
            stream_id: read_u64(body, Self::STREAM_ID),
            sequence: read_u64(body, Self::SEQUENCE),
            window_size: read_u32(body, Self::WINDOW_SIZE),
        })
    }

    pub fn write(&self, body: &mut [u8]) {
        write_u64(body, Self::STREAM_ID, self.stream_id);
        write_u64(body, Self::SEQUENCE, self.sequence);
        write_u32(body, Self::WINDOW_SIZE, self.window_size);
    }
}

/// Body of `StreamCompletion`: `{stream_id u64, final_sequence u64}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamCompletionBody {
    pub stream_id: u64,
    pub final_sequence: u64,
}

impl StreamCompletionBody {
    pub const SIZE: usize = 16;

    pub fn read(body: &[u8]) -> Option<Self> {
        if body.len() < Self::SIZE {
            return None;
        }
        Some(StreamCompletionBody {
            stream_id: read_u64(body, 0),
            final_sequence: read_u64(body, 8),
        })
    }

    pub fn write(&self, body: &mut [u8]) {
        write_u64(body, 0, self.stream_id);
        write_u64(body, 8, self.final_sequence);
    }
}

/// Fixed prefix of a `StreamError` body:
/// `{stream_id u64, error_code u32, error_data vector}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamErrorHeader {
    pub stream_id: u64,
    pub error_code: u32,
}

impl StreamErrorHeader {
    /// Size including the 8-byte vector field header.
    pub const SIZE: usize = 20;

    pub const STREAM_ID: usize = 0;
    pub const ERROR_CODE: usize = 8;
    pub const DATA_FIELD: usize = 12;

    pub fn read(body: &[u8]) -> Option<Self> {
        if body.len() < Self::SIZE {
            return None;
        }
        Some(StreamErrorHeader {
            stream_id: read_u64(body, Self::STREAM_ID),
            error_code: read_u32(body, Self::ERROR_CODE),
        })
    }

    pub fn write(&self, body: &mut [u8]) {
        write_u64(body, Self::STREAM_ID, self.stream_id);
        write_u32(body, Self::ERROR_CODE, self.error_code);
    }
}

/// Body of `StreamCancellation`: `{stream_id u64}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamCancelBody {
    pub stream_id: u64,
}

impl StreamCancelBody {
    pub const SIZE: usize = 8;

    pub fn read(body: &[u8]) -> Option<Self> {
        if body.len() < Self::SIZE {
            return None;
        }
        Some(StreamCancelBody {
            stream_id: read_u64(body, 0),
        })
    }

    pub fn write(&self, body: &mut [u8]) {
        write_u64(body, 0, self.stream_id);
    }
}
