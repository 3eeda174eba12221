//! Portable Object Adapters: bounded, policy-governed servant tables.
//!
//! A POA owns its servants. The table is fixed-capacity with a
//! generation-counter free list: an object id packs `slot | generation << 32`,
//! so a stale reference to a recycled slot resolves to "object not exist"
//! instead of a different servant. Servants are held as `Arc`, which gives
//! the deactivation contract for free: the table drops its strong count
//! immediately, the servant itself is destroyed when the last in-flight
//! dispatch returns.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use busard_protocol::{
    ErrorKind, ObjectFlags, ObjectId, compose_object_id, object_id_generation, object_id_slot,
};

use crate::{CallContext, RpcError};

pub type DispatchFuture<'a> = Pin<Box<dyn Future<Output = Result<(), RpcError>> + Send + 'a>>;

/// A user object. Implementations are normally generated skeletons that
/// switch on `interface_idx`/`function_idx` and unpack arguments straight
/// from the receive buffer.
pub trait Servant: std::fmt::Debug + Send + Sync + 'static {
    /// Fully-qualified interface type tag; minted into object references
    /// and checked by `narrow`.
    fn class_id(&self) -> &'static str;

    fn dispatch<'a>(&'a self, ctx: &'a mut CallContext) -> DispatchFuture<'a>;
}

/// Whether minted ids survive a process restart (under a stable origin).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Lifespan {
    #[default]
    Transient,
    Persistent,
}

/// Who picks slot indices at activation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ObjectIdPolicy {
    #[default]
    SystemGenerated,
    UserSupplied,
}

/// POA construction parameters.
#[derive(Clone, Copy, Debug)]
pub struct PoaBuilder {
    pub lifespan: Lifespan,
    pub id_policy: ObjectIdPolicy,
    pub max_objects: u32,
}

impl Default for PoaBuilder {
    fn default() -> Self {
        PoaBuilder {
            lifespan: Lifespan::Transient,
            id_policy: ObjectIdPolicy::SystemGenerated,
            max_objects: 1024,
        }
    }
}

impl PoaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lifespan(mut self, lifespan: Lifespan) -> Self {
        self.lifespan = lifespan;
        self
    }

    pub fn id_policy(mut self, policy: ObjectIdPolicy) -> Self {
        self.id_policy = policy;
        self
    }

    pub fn max_objects(mut self, max: u32) -> Self {
        self.max_objects = max;
        self
    }
}

/// Activation and policy failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoaError {
    /// Every slot is active.
    CapacityExhausted,
    /// Operation conflicts with the POA's id policy.
    PolicyViolation(&'static str),
    /// User-supplied id targets an occupied slot.
    SlotInUse(u32),
    /// User-supplied id is out of range or carries a generation.
    BadUserId(u64),
}

impl fmt::Display for PoaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoaError::CapacityExhausted => write!(f, "object table full"),
            PoaError::PolicyViolation(what) => write!(f, "policy violation: {what}"),
            PoaError::SlotInUse(slot) => write!(f, "slot {slot} already active"),
            PoaError::BadUserId(id) => write!(f, "invalid user-supplied id {id:#x}"),
        }
    }
}

impl std::error::Error for PoaError {}

enum Slot {
    Free { generation: u32, next_free: Option<u32> },
    Active(ActiveSlot),
}

struct ActiveSlot {
    generation: u32,
    servant: Arc<dyn Servant>,
    flags: ObjectFlags,
    /// Remote reference count driven by `AddReference`/`ReleaseObject`.
    remote_refs: u32,
}

struct ObjectTable {
    slots: Vec<Slot>,
    free_head: Option<u32>,
    active: u32,
}

impl ObjectTable {
    fn new(capacity: u32) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        for i in 0..capacity {
            let next = if i + 1 < capacity { Some(i + 1) } else { None };
            slots.push(Slot::Free {
                generation: 0,
                next_free: next,
            });
        }
        ObjectTable {
            slots,
            free_head: if capacity > 0 { Some(0) } else { None },
            active: 0,
        }
    }

    fn allocate(&mut self, servant: Arc<dyn Servant>, flags: ObjectFlags) -> Option<(u32, u32)> {
        let slot_idx = self.free_head?;
        let generation = match &self.slots[slot_idx as usize] {
            Slot::Free {
                generation,
                next_free,
            } => {
                self.free_head = *next_free;
                generation.wrapping_add(1).max(1)
            }
            Slot::Active(_) => unreachable!("free list points at an active slot"),
        };
        self.slots[slot_idx as usize] = Slot::Active(ActiveSlot {
            generation,
            servant,
            flags,
            remote_refs: 0,
        });
        self.active += 1;
        Some((slot_idx, generation))
    }

    fn allocate_at(
        &mut self,
        slot_idx: u32,
        servant: Arc<dyn Servant>,
        flags: ObjectFlags,
    ) -> Result<u32, PoaError> {
        if slot_idx as usize >= self.slots.len() {
            return Err(PoaError::BadUserId(slot_idx as u64));
        }
        let generation = match &self.slots[slot_idx as usize] {
            Slot::Active(_) => return Err(PoaError::SlotInUse(slot_idx)),
            Slot::Free { generation, .. } => generation.wrapping_add(1).max(1),
        };
        self.unlink_free(slot_idx);
        self.slots[slot_idx as usize] = Slot::Active(ActiveSlot {
            generation,
            servant,
            flags,
            remote_refs: 0,
        });
        self.active += 1;
        Ok(generation)
    }

    /// Remove a specific slot from the free chain (user-supplied ids can
    /// claim any free slot, not just the head).
    fn unlink_free(&mut self, slot_idx: u32) {
        let mut cursor = self.free_head;
        let mut prev: Option<u32> = None;
        while let Some(i) = cursor {
            let next = match &self.slots[i as usize] {
                Slot::Free { next_free, .. } => *next_free,
                Slot::Active(_) => unreachable!("free list points at an active slot"),
            };
            if i == slot_idx {
                match prev {
                    Some(p) => {
                        if let Slot::Free { next_free, .. } = &mut self.slots[p as usize] {
                            *next_free = next;
                        }
                    }
                    None => self.free_head = next,
                }
                return;
            }
            prev = Some(i);
            cursor = next;
        }
    }

    fn release_slot(&mut self, slot_idx: u32, generation: u32) {
        self.slots[slot_idx as usize] = Slot::Free {
            generation,
            next_free: self.free_head,
        };
        self.free_head = Some(slot_idx);
        self.active -= 1;
    }

    fn get(&self, object_id: u64) -> Option<&ActiveSlot> {
        let slot_idx = object_id_slot(object_id) as usize;
        let generation = object_id_generation(object_id);
        match self.slots.get(slot_idx) {
            Some(Slot::Active(active)) if active.generation == generation => Some(active),
            _ => None,
        }
    }

    fn get_mut(&mut self, object_id: u64) -> Option<&mut ActiveSlot> {
        let slot_idx = object_id_slot(object_id) as usize;
        let generation = object_id_generation(object_id);
        match self.slots.get_mut(slot_idx) {
            Some(Slot::Active(active)) if active.generation == generation => Some(active),
            _ => None,
        }
    }
}

/// Listening identity shared by every POA of a runtime: the origin UUID
/// and the advertised URL list, fixed once the listeners are bound.
pub struct ObjectHost {
    pub origin: Uuid,
    pub urls: String,
}

impl ObjectHost {
    pub fn detached(origin: Uuid) -> Self {
        ObjectHost {
            origin,
            urls: String::new(),
        }
    }
}

pub struct Poa {
    idx: u16,
    lifespan: Lifespan,
    id_policy: ObjectIdPolicy,
    max_objects: u32,
    host: Arc<ObjectHost>,
    table: Mutex<ObjectTable>,
}

impl Poa {
    fn new(idx: u16, builder: PoaBuilder, host: Arc<ObjectHost>) -> Self {
        Poa {
            idx,
            lifespan: builder.lifespan,
            id_policy: builder.id_policy,
            max_objects: builder.max_objects,
            host,
            table: Mutex::new(ObjectTable::new(builder.max_objects)),
        }
    }

    pub fn idx(&self) -> u16 {
        self.idx
    }

    pub fn lifespan(&self) -> Lifespan {
        self.lifespan
    }

    pub fn max_objects(&self) -> u32 {
        self.max_objects
    }

    pub fn active_objects(&self) -> u32 {
        self.table.lock().active
    }

    fn mint(&self, slot: u32, generation: u32, class_id: &'static str, flags: ObjectFlags) -> ObjectId {
        let mut flags = flags;
        if self.lifespan == Lifespan::Persistent {
            flags |= ObjectFlags::PERSISTENT;
        }
        let urls = if flags.contains(ObjectFlags::TETHERED) {
            String::new()
        } else {
            self.host.urls.clone()
        };
        ObjectId {
            object_id: compose_object_id(slot, generation),
            poa_idx: self.idx,
            flags,
            origin: self.host.origin,
            class_id: class_id.to_string(),
            urls,
        }
    }

    /// Activate under the system-generated id policy: allocate a slot from
    /// the free list, bump its generation, take ownership of the servant.
    pub fn activate(
        &self,
        servant: Arc<dyn Servant>,
        flags: ObjectFlags,
    ) -> Result<ObjectId, PoaError> {
        if self.id_policy != ObjectIdPolicy::SystemGenerated {
            return Err(PoaError::PolicyViolation(
                "activate requires the SystemGenerated id policy",
            ));
        }
        let class_id = servant.class_id();
        let (slot, generation) = self
            .table
            .lock()
            .allocate(servant, flags)
            .ok_or(PoaError::CapacityExhausted)?;
        debug!(poa = self.idx, slot, generation, class_id, "activated object");
        Ok(self.mint(slot, generation, class_id, flags))
    }

    /// Activate at a caller-chosen slot. The id must be below capacity,
    /// unused, and carry no generation bits.
    pub fn activate_with_id(
        &self,
        id: u64,
        servant: Arc<dyn Servant>,
        flags: ObjectFlags,
    ) -> Result<ObjectId, PoaError> {
        if self.id_policy != ObjectIdPolicy::UserSupplied {
            return Err(PoaError::PolicyViolation(
                "activate_with_id requires the UserSupplied id policy",
            ));
        }
        if object_id_generation(id) != 0 {
            return Err(PoaError::BadUserId(id));
        }
        let class_id = servant.class_id();
        let slot = object_id_slot(id);
        let generation = self.table.lock().allocate_at(slot, servant, flags)?;
        debug!(poa = self.idx, slot, generation, class_id, "activated object (user id)");
        Ok(self.mint(slot, generation, class_id, flags))
    }

    /// Free the slot, bumping its generation so outstanding references go
    /// stale. The servant is destroyed once in-flight dispatches drop
    /// their handles.
    pub fn deactivate(&self, object_id: u64) -> bool {
        let mut table = self.table.lock();
        let slot_idx = object_id_slot(object_id);
        let generation = object_id_generation(object_id);
        match table.get(object_id) {
            Some(_) => {
                table.release_slot(slot_idx, generation);
                debug!(poa = self.idx, slot = slot_idx, generation, "deactivated object");
                true
            }
            None => false,
        }
    }

    /// O(1) slot lookup with a generation check.
    pub fn lookup(&self, object_id: u64) -> Result<Arc<dyn Servant>, ErrorKind> {
        self.table
            .lock()
            .get(object_id)
            .map(|active| active.servant.clone())
            .ok_or(ErrorKind::ObjectNotExist)
    }

    /// Current remote reference count, None for stale or free ids.
    pub fn remote_refs(&self, object_id: u64) -> Option<u32> {
        self.table.lock().get(object_id).map(|a| a.remote_refs)
    }

    /// Remote `AddReference` bookkeeping.
    pub fn add_ref(&self, object_id: u64) -> Result<u32, ErrorKind> {
        let mut table = self.table.lock();
        let active = table.get_mut(object_id).ok_or(ErrorKind::ObjectNotExist)?;
        active.remote_refs += 1;
        Ok(active.remote_refs)
    }

    /// Remote `ReleaseObject` bookkeeping. A transient object whose count
    /// reaches zero is deactivated.
    pub fn release(&self, object_id: u64) -> Result<u32, ErrorKind> {
        let mut table = self.table.lock();
        let active = table.get_mut(object_id).ok_or(ErrorKind::ObjectNotExist)?;
        active.remote_refs = active.remote_refs.saturating_sub(1);
        let remaining = active.remote_refs;
        drop(table);

        if remaining == 0 && self.lifespan == Lifespan::Transient {
            self.deactivate(object_id);
        }
        Ok(remaining)
    }
}

/// The set of POAs owned by one runtime, indexed by `poa_idx`.
pub struct PoaRegistry {
    host: Arc<ObjectHost>,
    poas: Mutex<Vec<Arc<Poa>>>,
}

impl PoaRegistry {
    pub fn new(host: Arc<ObjectHost>) -> Self {
        PoaRegistry {
            host,
            poas: Mutex::new(Vec::new()),
        }
    }

    pub fn create_poa(&self, builder: PoaBuilder) -> Arc<Poa> {
        let mut poas = self.poas.lock();
        let idx = poas.len() as u16;
        let poa = Arc::new(Poa::new(idx, builder, self.host.clone()));
        poas.push(poa.clone());
        poa
    }

    pub fn get(&self, idx: u16) -> Option<Arc<Poa>> {
        self.poas.lock().get(idx as usize).cloned()
    }

    pub fn host(&self) -> &Arc<ObjectHost> {
        &self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Dummy;

    impl Servant for Dummy {
        fn class_id(&self) -> &'static str {
            "Dummy"
        }

        fn dispatch<'a>(&'a self, _ctx: &'a mut CallContext) -> DispatchFuture<'a> {
            Box::pin(async { Ok(()) })
        }
    }

    fn registry() -> PoaRegistry {
        PoaRegistry::new(Arc::new(ObjectHost {
            origin: Uuid::from_bytes([1; 16]),
            urls: "tcp://localhost:9160".to_string(),
        }))
    }

    #[test]
    fn first_activation_mints_slot_zero_generation_one() {
        let reg = registry();
        let poa = reg.create_poa(PoaBuilder::new());
        let oid = poa.activate(Arc::new(Dummy), ObjectFlags::empty()).unwrap();
        assert_eq!(oid.object_id, 0x0000_0001_0000_0000);
        assert_eq!(oid.poa_idx, 0);
        assert_eq!(oid.class_id, "Dummy");
        assert_eq!(oid.urls, "tcp://localhost:9160");
    }

    #[test]
    fn tethered_objects_advertise_no_urls() {
        let reg = registry();
        let poa = reg.create_poa(PoaBuilder::new());
        let oid = poa.activate(Arc::new(Dummy), ObjectFlags::TETHERED).unwrap();
        assert!(oid.urls.is_empty());
        assert!(oid.is_tethered());
    }

    #[test]
    fn stale_reference_resolves_object_not_exist() {
        let reg = registry();
        let poa = reg.create_poa(PoaBuilder::new().max_objects(1));
        let first = poa.activate(Arc::new(Dummy), ObjectFlags::empty()).unwrap();
        assert!(poa.lookup(first.object_id).is_ok());
        assert!(poa.deactivate(first.object_id));

        // Same slot, next generation.
        let second = poa.activate(Arc::new(Dummy), ObjectFlags::empty()).unwrap();
        assert_eq!(second.slot(), first.slot());
        assert_eq!(second.generation(), first.generation() + 1);
        assert_eq!(poa.lookup(first.object_id).unwrap_err(), ErrorKind::ObjectNotExist);
        assert!(poa.lookup(second.object_id).is_ok());
    }

    #[test]
    fn stale_after_many_cycles() {
        let reg = registry();
        let poa = reg.create_poa(PoaBuilder::new().max_objects(2));
        let stale = poa.activate(Arc::new(Dummy), ObjectFlags::empty()).unwrap();
        poa.deactivate(stale.object_id);
        for _ in 0..3 {
            let oid = poa.activate(Arc::new(Dummy), ObjectFlags::empty()).unwrap();
            poa.deactivate(oid.object_id);
        }
        assert_eq!(poa.lookup(stale.object_id).unwrap_err(), ErrorKind::ObjectNotExist);
    }

    #[test]
    fn capacity_is_fixed() {
        let reg = registry();
        let poa = reg.create_poa(PoaBuilder::new().max_objects(2));
        poa.activate(Arc::new(Dummy), ObjectFlags::empty()).unwrap();
        poa.activate(Arc::new(Dummy), ObjectFlags::empty()).unwrap();
        assert_eq!(
            poa.activate(Arc::new(Dummy), ObjectFlags::empty()).unwrap_err(),
            PoaError::CapacityExhausted
        );
    }

    #[test]
    fn user_supplied_ids() {
        let reg = registry();
        let poa = reg.create_poa(PoaBuilder::new().id_policy(ObjectIdPolicy::UserSupplied).max_objects(4));
        let oid = poa.activate_with_id(2, Arc::new(Dummy), ObjectFlags::empty()).unwrap();
        assert_eq!(oid.slot(), 2);
        assert_eq!(oid.generation(), 1);

        assert_eq!(
            poa.activate_with_id(2, Arc::new(Dummy), ObjectFlags::empty()).unwrap_err(),
            PoaError::SlotInUse(2)
        );
        assert_eq!(
            poa.activate_with_id(9, Arc::new(Dummy), ObjectFlags::empty()).unwrap_err(),
            PoaError::BadUserId(9)
        );
        assert_eq!(
            poa.activate_with_id(compose_object_id(1, 5), Arc::new(Dummy), ObjectFlags::empty())
                .unwrap_err(),
            PoaError::BadUserId(compose_object_id(1, 5))
        );

        // system-generated activation is rejected under this policy
        assert!(matches!(
            poa.activate(Arc::new(Dummy), ObjectFlags::empty()),
            Err(PoaError::PolicyViolation(_))
        ));
    }

    #[test]
    fn transient_object_dies_when_remote_refs_drop_to_zero() {
        let reg = registry();
        let poa = reg.create_poa(PoaBuilder::new());
        let oid = poa.activate(Arc::new(Dummy), ObjectFlags::empty()).unwrap();
        assert_eq!(poa.add_ref(oid.object_id).unwrap(), 1);
        assert_eq!(poa.add_ref(oid.object_id).unwrap(), 2);
        assert_eq!(poa.release(oid.object_id).unwrap(), 1);
        assert!(poa.lookup(oid.object_id).is_ok());
        assert_eq!(poa.release(oid.object_id).unwrap(), 0);
        assert_eq!(poa.lookup(oid.object_id).unwrap_err(), ErrorKind::ObjectNotExist);
    }

    #[test]
    fn persistent_object_survives_zero_refs() {
        let reg = registry();
        let poa = reg.create_poa(PoaBuilder::new().lifespan(Lifespan::Persistent));
        let oid = poa.activate(Arc::new(Dummy), ObjectFlags::empty()).unwrap();
        assert!(oid.is_persistent());
        poa.add_ref(oid.object_id).unwrap();
        poa.release(oid.object_id).unwrap();
        assert!(poa.lookup(oid.object_id).is_ok());
    }
}
