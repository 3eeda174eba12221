//! Client-side object references.
//!
//! An [`ObjectPtr`] is a non-owning handle to a remote servant. Handles
//! cloned from the same resolution share one remote reference count: the
//! first `add_ref` sends a single `AddReference`, the last `release` a
//! single `ReleaseObject`. Generated proxies wrap an `ObjectPtr` after a
//! successful `narrow`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use busard_flat::{FlatBuffer, FlatError, Reader, write_string, write_u16_at, write_u64_at};
use busard_protocol::{
    BODY_OFFSET, LifetimeBody, MessageId, MessageType, ObjectFlags, ObjectId,
};

use crate::endpoint::{parse_url_list, select_endpoint};
use crate::{CallReply, Rpc, RpcError, Session};

/// Wire size of the fixed part of a marshalled `ObjectId`:
/// `{object_id u64, poa_idx u16, flags u16, origin 16 bytes, class_id vector, urls vector}`.
pub const OBJECT_ID_WIRE_SIZE: usize = 44;

mod oid_offsets {
    pub const OBJECT_ID: usize = 0;
    pub const POA_IDX: usize = 8;
    pub const FLAGS: usize = 10;
    pub const ORIGIN: usize = 12;
    pub const CLASS_ID: usize = 28;
    pub const URLS: usize = 36;
}

/// Marshal an `ObjectId` into the fixed slot at `at` (the caller has
/// committed [`OBJECT_ID_WIRE_SIZE`] bytes there); string payloads are
/// appended out-of-line.
pub fn write_object_id(fb: &mut FlatBuffer, at: usize, oid: &ObjectId) {
    write_u64_at(fb, at + oid_offsets::OBJECT_ID, oid.object_id);
    write_u16_at(fb, at + oid_offsets::POA_IDX, oid.poa_idx);
    write_u16_at(fb, at + oid_offsets::FLAGS, oid.flags.bits());
    fb.as_mut_slice()[at + oid_offsets::ORIGIN..at + oid_offsets::ORIGIN + 16]
        .copy_from_slice(oid.origin.as_bytes());
    write_string(fb, at + oid_offsets::CLASS_ID, &oid.class_id);
    write_string(fb, at + oid_offsets::URLS, &oid.urls);
}

/// Demarshal an `ObjectId` from the fixed slot at `at`.
pub fn read_object_id(reader: &Reader<'_>, at: usize) -> Result<ObjectId, FlatError> {
    let object_id = reader.u64_at(at + oid_offsets::OBJECT_ID)?;
    let poa_idx = reader.u16_at(at + oid_offsets::POA_IDX)?;
    let flags = ObjectFlags::from_bits_retain(reader.u16_at(at + oid_offsets::FLAGS)?);
    let mut origin = [0u8; 16];
    for (i, byte) in origin.iter_mut().enumerate() {
        *byte = reader.u8_at(at + oid_offsets::ORIGIN + i)?;
    }
    let class_id = reader.string(at + oid_offsets::CLASS_ID)?.to_string();
    let urls = reader.string(at + oid_offsets::URLS)?.to_string();
    Ok(ObjectId {
        object_id,
        poa_idx,
        flags,
        origin: Uuid::from_bytes(origin),
        class_id,
        urls,
    })
}

/// Generated client proxies implement this to participate in `narrow`.
pub trait ProxyObject: Sized {
    const CLASS_ID: &'static str;

    fn from_object(obj: ObjectPtr) -> Self;
}

#[derive(Clone)]
pub struct ObjectPtr {
    shared: Arc<ObjectRef>,
}

impl std::fmt::Debug for ObjectPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPtr")
            .field("object", &self.shared.object)
            .finish_non_exhaustive()
    }
}

struct ObjectRef {
    object: ObjectId,
    /// Absent for tethered references, which never dial.
    rpc: Option<Rpc>,
    session: Mutex<Option<Session>>,
    /// Local handle count; the 0→1 and 1→0 transitions cross the wire.
    local_refs: AtomicU32,
}

impl ObjectPtr {
    pub(crate) fn new(object: ObjectId, rpc: Rpc) -> Self {
        ObjectPtr {
            shared: Arc::new(ObjectRef {
                object,
                rpc: Some(rpc),
                session: Mutex::new(None),
                local_refs: AtomicU32::new(0),
            }),
        }
    }

    /// A reference pinned to the session it travelled over.
    pub(crate) fn tethered(object: ObjectId, session: Session) -> Self {
        ObjectPtr {
            shared: Arc::new(ObjectRef {
                object,
                rpc: None,
                session: Mutex::new(Some(session)),
                local_refs: AtomicU32::new(0),
            }),
        }
    }

    pub fn object(&self) -> &ObjectId {
        &self.shared.object
    }

    pub fn class_id(&self) -> &str {
        &self.shared.object.class_id
    }

    /// Wrap a reference received through this proxy: tethered references
    /// pin to the session the reply travelled over, direct ones dial
    /// through the same runtime.
    pub async fn adopt(&self, object: ObjectId) -> Result<ObjectPtr, RpcError> {
        if object.is_tethered() {
            let session = self.session().await?;
            return Ok(ObjectPtr::tethered(object, session));
        }
        match &self.shared.rpc {
            Some(rpc) => Ok(ObjectPtr::new(object, rpc.clone())),
            None => {
                let session = self.session().await?;
                Ok(ObjectPtr::tethered(object, session))
            }
        }
    }

    /// Typed view, succeeding iff the reference's class tag matches.
    pub fn narrow<T: ProxyObject>(&self) -> Option<T> {
        if self.shared.object.class_id == T::CLASS_ID {
            Some(T::from_object(self.clone()))
        } else {
            None
        }
    }

    /// The session carrying this reference: the pinned one for tethered
    /// references, otherwise a cached or freshly dialed connection to
    /// the best advertised endpoint.
    pub async fn session(&self) -> Result<Session, RpcError> {
        if let Some(session) = self.shared.session.lock().as_ref() {
            if !session.is_closed() {
                return Ok(session.clone());
            }
        }
        let Some(rpc) = &self.shared.rpc else {
            // Tethered and the back-channel is gone.
            return Err(RpcError::comm("tethered session closed"));
        };
        if self.shared.object.is_tethered() {
            return Err(RpcError::comm("tethered session closed"));
        }

        let candidates = parse_url_list(&self.shared.object.urls);
        let endpoint = select_endpoint(&candidates, &rpc.dialable_schemes())
            .ok_or_else(|| RpcError::comm("no dialable endpoint in reference"))?;
        let session = rpc.connect(&endpoint).await?;
        *self.shared.session.lock() = Some(session.clone());
        Ok(session)
    }

    /// Invoke with the runtime's default timeout.
    pub async fn invoke(&self, msg: FlatBuffer) -> Result<CallReply, RpcError> {
        let timeout = self
            .shared
            .rpc
            .as_ref()
            .map(|rpc| rpc.call_timeout())
            .unwrap_or(crate::DEFAULT_CALL_TIMEOUT);
        self.invoke_with_timeout(msg, timeout).await
    }

    pub async fn invoke_with_timeout(
        &self,
        msg: FlatBuffer,
        timeout: Duration,
    ) -> Result<CallReply, RpcError> {
        let session = self.session().await?;
        session.call(msg, timeout).await
    }

    /// Invoke a method declared reliable: over datagram transports the
    /// frame is retransmitted until acknowledged.
    pub async fn invoke_reliable(&self, msg: FlatBuffer) -> Result<CallReply, RpcError> {
        let session = self.session().await?;
        let (timeout, retry) = match &self.shared.rpc {
            Some(rpc) => (rpc.call_timeout(), rpc.udp_retry()),
            None => (crate::DEFAULT_CALL_TIMEOUT, crate::UdpRetryConfig::default()),
        };
        if session.is_datagram() {
            session.call_reliable(msg, timeout, retry).await
        } else {
            session.call(msg, timeout).await
        }
    }

    /// Take a local reference. The first one sends a remote
    /// `AddReference`.
    pub async fn add_ref(&self) -> Result<(), RpcError> {
        let previous = self.shared.local_refs.fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            if let Err(e) = self.send_lifetime(MessageId::AddReference).await {
                self.shared.local_refs.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drop a local reference. The last one sends a remote
    /// `ReleaseObject`.
    pub async fn release(&self) -> Result<(), RpcError> {
        let previous = self.shared.local_refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "release without matching add_ref");
        if previous == 1 {
            self.send_lifetime(MessageId::ReleaseObject).await?;
        }
        Ok(())
    }

    async fn send_lifetime(&self, msg_id: MessageId) -> Result<(), RpcError> {
        let mut fb = FlatBuffer::begin(msg_id, MessageType::Request);
        fb.prepare(LifetimeBody::SIZE);
        fb.commit(LifetimeBody::SIZE);
        LifetimeBody {
            poa_idx: self.shared.object.poa_idx,
            object_id: self.shared.object.object_id,
        }
        .write(&mut fb.as_mut_slice()[BODY_OFFSET..]);
        fb.finalize();

        let session = self.session().await?;
        let timeout = self
            .shared
            .rpc
            .as_ref()
            .map(|rpc| rpc.call_timeout())
            .unwrap_or(crate::DEFAULT_CALL_TIMEOUT);
        match session.call(fb, timeout).await? {
            CallReply::Success => Ok(()),
            CallReply::Block(_) => {
                debug!("unexpected block reply to a lifetime message");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busard_protocol::{HEADER_SIZE, MessageId, MessageType};

    fn sample_oid() -> ObjectId {
        ObjectId {
            object_id: 0x0000_0001_0000_0000,
            poa_idx: 1,
            flags: ObjectFlags::empty(),
            origin: Uuid::from_bytes([9; 16]),
            class_id: "Calc".to_string(),
            urls: "tcp://localhost:9160".to_string(),
        }
    }

    #[test]
    fn object_id_marshal_roundtrip() {
        let oid = sample_oid();
        let mut fb = FlatBuffer::begin(MessageId::BlockResponse, MessageType::Answer);
        fb.prepare(OBJECT_ID_WIRE_SIZE);
        fb.commit(OBJECT_ID_WIRE_SIZE);
        write_object_id(&mut fb, HEADER_SIZE, &oid);
        fb.finalize();

        let reader = Reader::new(fb.as_slice()).unwrap();
        let back = read_object_id(&reader, HEADER_SIZE).unwrap();
        assert_eq!(back, oid);
    }

    #[test]
    fn object_id_marshal_roundtrip_empty_strings() {
        let mut oid = sample_oid();
        oid.class_id = String::new();
        oid.urls = String::new();
        let mut fb = FlatBuffer::begin(MessageId::BlockResponse, MessageType::Answer);
        fb.prepare(OBJECT_ID_WIRE_SIZE);
        fb.commit(OBJECT_ID_WIRE_SIZE);
        write_object_id(&mut fb, HEADER_SIZE, &oid);
        fb.finalize();

        let reader = Reader::new(fb.as_slice()).unwrap();
        let back = read_object_id(&reader, HEADER_SIZE).unwrap();
        assert_eq!(back, oid);
    }
}
