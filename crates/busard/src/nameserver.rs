//! The nameserver wire contract: a single IDL-defined interface with
//! `Bind` and `Resolve`, written out the way the stub generator emits
//! client proxies and server skeletons.
//!
//! Wire shape (little-endian, offsets relative to the argument block at
//! offset 32, after the call header):
//!
//! - `Bind` (function 0): `{obj: ObjectId (44 bytes), name: string}` →
//!   `Success`.
//! - `Resolve` (function 1): `{name: string}` → `BlockResponse`
//!   `{found: bool, obj: optional ObjectId}`; the optional is a relative
//!   offset that is 0 on a miss.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use busard_core::{
    CallContext, DispatchFuture, ObjectPtr, ProxyObject, RpcError, Servant, read_object_id,
    write_object_id,
};
use busard_flat::{FlatBuffer, write_bool_at, write_string, alloc_optional_struct};
use busard_protocol::{
    BODY_OFFSET, CallHeader, ErrorKind, MessageId, MessageType, ObjectId,
};

/// Interface type tag minted into nameserver references.
pub const NAMESERVER_CLASS_ID: &str = "busard.Nameserver";

const INTERFACE_IDX: u8 = 0;
const FN_BIND: u8 = 0;
const FN_RESOLVE: u8 = 1;

/// Argument block offset: right after the call header.
const ARGS: usize = BODY_OFFSET + CallHeader::SIZE;

/// Wire size of a marshalled `ObjectId` (fixed part).
const OBJECT_ID_WIRE: usize = busard_core::OBJECT_ID_WIRE_SIZE;

fn call_message(target: &ObjectId, function_idx: u8, args_size: usize) -> FlatBuffer {
    let mut fb = FlatBuffer::begin(MessageId::FunctionCall, MessageType::Request);
    fb.prepare(CallHeader::SIZE + args_size);
    fb.commit(CallHeader::SIZE + args_size);
    CallHeader {
        poa_idx: target.poa_idx,
        interface_idx: INTERFACE_IDX,
        function_idx,
        object_id: target.object_id,
    }
    .write(&mut fb.as_mut_slice()[BODY_OFFSET..]);
    fb
}

/// Generated-style client proxy.
#[derive(Clone, Debug)]
pub struct NameserverProxy {
    object: ObjectPtr,
}

impl ProxyObject for NameserverProxy {
    const CLASS_ID: &'static str = NAMESERVER_CLASS_ID;

    fn from_object(object: ObjectPtr) -> Self {
        NameserverProxy { object }
    }
}

impl NameserverProxy {
    pub fn object(&self) -> &ObjectPtr {
        &self.object
    }

    /// Associate `name` with an object reference. Ownership of the
    /// server-side reference transfers to the nameserver.
    pub async fn bind(&self, obj: &ObjectId, name: &str) -> Result<(), RpcError> {
        let mut fb = call_message(self.object.object(), FN_BIND, OBJECT_ID_WIRE + 8);
        write_object_id(&mut fb, ARGS, obj);
        write_string(&mut fb, ARGS + OBJECT_ID_WIRE, name);
        fb.finalize();
        self.object.invoke(fb).await?;
        Ok(())
    }

    /// Look `name` up; `Ok(Some)` carries a live reference on a hit.
    pub async fn resolve(&self, name: &str) -> Result<Option<ObjectPtr>, RpcError> {
        let mut fb = call_message(self.object.object(), FN_RESOLVE, 8);
        write_string(&mut fb, ARGS, name);
        fb.finalize();

        let reply = self.object.invoke(fb).await?;
        let Some(block) = reply.into_block() else {
            return Err(RpcError::kind(ErrorKind::BadInput));
        };
        let reader = busard_flat::Reader::new(block.as_slice())?;
        let found = reader.bool_at(BODY_OFFSET)?;
        if !found {
            return Ok(None);
        }
        let slot = reader
            .optional_struct(BODY_OFFSET + 4, OBJECT_ID_WIRE, 4)?
            .ok_or_else(|| RpcError::kind(ErrorKind::BadInput))?;
        let oid = read_object_id(&reader, slot)?;
        Ok(Some(self.object.adopt(oid).await?))
    }
}

/// What a nameserver implementation provides. The skeleton below adapts
/// it to the dispatch seam.
pub trait Nameserver: Send + Sync + 'static {
    fn bind(&self, obj: ObjectId, name: &str) -> Result<(), RpcError>;
    fn resolve(&self, name: &str) -> Result<Option<ObjectId>, RpcError>;
}

/// Generated-style server skeleton: unpacks arguments straight from the
/// receive buffer and switches on the function index.
pub struct NameserverServer<T: Nameserver> {
    imp: T,
}

impl<T: Nameserver> std::fmt::Debug for NameserverServer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameserverServer").finish_non_exhaustive()
    }
}

impl<T: Nameserver> NameserverServer<T> {
    pub fn new(imp: T) -> Self {
        NameserverServer { imp }
    }
}

impl<T: Nameserver> Servant for NameserverServer<T> {
    fn class_id(&self) -> &'static str {
        NAMESERVER_CLASS_ID
    }

    fn dispatch<'a>(&'a self, ctx: &'a mut CallContext) -> DispatchFuture<'a> {
        Box::pin(async move {
            if ctx.call().interface_idx != INTERFACE_IDX {
                return Err(RpcError::kind(ErrorKind::UnknownFunctionIdx));
            }
            match ctx.call().function_idx {
                FN_BIND => {
                    let (obj, name) = {
                        let reader = ctx.reader()?;
                        let obj = read_object_id(&reader, ARGS)?;
                        let name = reader.string(ARGS + OBJECT_ID_WIRE)?.to_string();
                        (obj, name)
                    };
                    self.imp.bind(obj, &name)?;
                    Ok(())
                }
                FN_RESOLVE => {
                    let name = ctx.reader()?.string(ARGS)?.to_string();
                    let hit = self.imp.resolve(&name)?;
                    let fb = ctx.begin_reply();
                    let at = fb.size();
                    fb.prepare(8);
                    fb.commit(8);
                    match hit {
                        Some(oid) => {
                            write_bool_at(fb, at, true);
                            let slot = alloc_optional_struct(fb, at + 4, OBJECT_ID_WIRE, 4);
                            write_object_id(fb, slot, &oid);
                        }
                        None => write_bool_at(fb, at, false),
                    }
                    Ok(())
                }
                _ => Err(RpcError::kind(ErrorKind::UnknownFunctionIdx)),
            }
        })
    }
}

/// In-memory nameserver servant: a guarded map from names to references.
#[derive(Default)]
pub struct InMemoryNameserver {
    entries: Mutex<HashMap<String, ObjectId>>,
}

impl InMemoryNameserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Wrap into the dispatchable servant.
    pub fn into_servant(self) -> Arc<NameserverServer<InMemoryNameserver>> {
        Arc::new(NameserverServer::new(self))
    }
}

impl Nameserver for InMemoryNameserver {
    fn bind(&self, obj: ObjectId, name: &str) -> Result<(), RpcError> {
        debug!(name, class_id = %obj.class_id, "nameserver bind");
        self.entries.lock().insert(name.to_string(), obj);
        Ok(())
    }

    fn resolve(&self, name: &str) -> Result<Option<ObjectId>, RpcError> {
        Ok(self.entries.lock().get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_bind_resolve() {
        let ns = InMemoryNameserver::new();
        let oid = ObjectId {
            object_id: 1,
            poa_idx: 0,
            flags: busard_protocol::ObjectFlags::empty(),
            origin: uuid::Uuid::from_bytes([3; 16]),
            class_id: "Calc".to_string(),
            urls: "tcp://h:1".to_string(),
        };
        ns.bind(oid.clone(), "calc").unwrap();
        assert_eq!(ns.resolve("calc").unwrap(), Some(oid));
        assert_eq!(ns.resolve("missing").unwrap(), None);
        assert_eq!(ns.len(), 1);
    }
}
