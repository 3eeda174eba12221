use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bitflags::bitflags;
use uuid::Uuid;

bitflags! {
    /// Flags carried in an [`ObjectId`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ObjectFlags: u16 {
        /// Ids survive the owning process's restart under a stable origin.
        const PERSISTENT = 1 << 0;
        /// The reference is only usable on the session that delivered it;
        /// its URL list is ignored.
        const TETHERED = 1 << 1;
    }
}

/// Prefix of the canonical textual object reference form.
pub const OBJECT_ID_PREFIX: &str = "NPRPC1:";

/// A complete, self-describing reference to a servant.
///
/// `object_id` packs the table slot in the lower 32 bits and the slot
/// generation in the upper 32, so stale references resolve to
/// "object not exist" rather than a recycled servant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectId {
    pub object_id: u64,
    pub poa_idx: u16,
    pub flags: ObjectFlags,
    /// Process UUID of the owning runtime.
    pub origin: Uuid,
    /// Fully-qualified interface type tag, used by `narrow`.
    pub class_id: String,
    /// Semicolon-separated transport URLs the object is reachable on.
    /// Empty for tethered references.
    pub urls: String,
}

/// Pack a slot index and generation into an `object_id` value.
#[inline]
pub fn compose_object_id(slot: u32, generation: u32) -> u64 {
    (slot as u64) | ((generation as u64) << 32)
}

/// Slot index part of an `object_id` value.
#[inline]
pub fn object_id_slot(object_id: u64) -> u32 {
    object_id as u32
}

/// Generation part of an `object_id` value.
#[inline]
pub fn object_id_generation(object_id: u64) -> u32 {
    (object_id >> 32) as u32
}

impl ObjectId {
    pub fn slot(&self) -> u32 {
        object_id_slot(self.object_id)
    }

    pub fn generation(&self) -> u32 {
        object_id_generation(self.object_id)
    }

    pub fn is_tethered(&self) -> bool {
        self.flags.contains(ObjectFlags::TETHERED)
    }

    pub fn is_persistent(&self) -> bool {
        self.flags.contains(ObjectFlags::PERSISTENT)
    }

    /// Iterate over the individual URL entries.
    pub fn url_entries(&self) -> impl Iterator<Item = &str> {
        self.urls.split(';').filter(|s| !s.is_empty())
    }

    /// Encode the canonical textual form:
    /// `NPRPC1:<base64(object_id, poa_idx, flags, origin, class_id, urls)>`,
    /// all integers little-endian, strings length-prefixed with u32.
    pub fn to_text(&self) -> String {
        let class = self.class_id.as_bytes();
        let urls = self.urls.as_bytes();
        let mut raw = Vec::with_capacity(8 + 2 + 2 + 16 + 4 + class.len() + 4 + urls.len());
        raw.extend_from_slice(&self.object_id.to_le_bytes());
        raw.extend_from_slice(&self.poa_idx.to_le_bytes());
        raw.extend_from_slice(&self.flags.bits().to_le_bytes());
        raw.extend_from_slice(self.origin.as_bytes());
        raw.extend_from_slice(&(class.len() as u32).to_le_bytes());
        raw.extend_from_slice(class);
        raw.extend_from_slice(&(urls.len() as u32).to_le_bytes());
        raw.extend_from_slice(urls);
        format!("{}{}", OBJECT_ID_PREFIX, BASE64.encode(raw))
    }

    /// Parse the canonical textual form produced by [`ObjectId::to_text`].
    pub fn from_text(text: &str) -> Result<Self, ObjectIdParseError> {
        let encoded = text
            .strip_prefix(OBJECT_ID_PREFIX)
            .ok_or(ObjectIdParseError::MissingPrefix)?;
        let raw = BASE64
            .decode(encoded)
            .map_err(|_| ObjectIdParseError::BadBase64)?;

        let mut cursor = Cursor { raw: &raw, pos: 0 };
        let object_id = cursor.u64()?;
        let poa_idx = cursor.u16()?;
        let flag_bits = cursor.u16()?;
        let origin = Uuid::from_bytes(cursor.array::<16>()?);
        let class_id = cursor.string()?;
        let urls = cursor.string()?;
        if cursor.pos != raw.len() {
            return Err(ObjectIdParseError::TrailingBytes);
        }

        Ok(ObjectId {
            object_id,
            poa_idx,
            flags: ObjectFlags::from_bits_retain(flag_bits),
            origin,
            class_id,
            urls,
        })
    }
}

struct Cursor<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], ObjectIdParseError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.raw.len())
            .ok_or(ObjectIdParseError::Truncated)?;
        let slice = &self.raw[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, ObjectIdParseError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ObjectIdParseError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, ObjectIdParseError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ObjectIdParseError> {
        let b = self.take(N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(b);
        Ok(arr)
    }

    fn string(&mut self) -> Result<String, ObjectIdParseError> {
        let len = self.u32()? as usize;
        let b = self.take(len)?;
        String::from_utf8(b.to_vec()).map_err(|_| ObjectIdParseError::BadUtf8)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@poa{} slot={} gen={} ({})",
            self.class_id,
            self.poa_idx,
            self.slot(),
            self.generation(),
            if self.is_tethered() { "tethered" } else { self.urls.as_str() },
        )
    }
}

/// Error parsing the textual object reference form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectIdParseError {
    MissingPrefix,
    BadBase64,
    Truncated,
    TrailingBytes,
    BadUtf8,
}

impl fmt::Display for ObjectIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectIdParseError::MissingPrefix => write!(f, "missing NPRPC1 prefix"),
            ObjectIdParseError::BadBase64 => write!(f, "invalid base64 payload"),
            ObjectIdParseError::Truncated => write!(f, "payload truncated"),
            ObjectIdParseError::TrailingBytes => write!(f, "trailing bytes after payload"),
            ObjectIdParseError::BadUtf8 => write!(f, "string field is not valid UTF-8"),
        }
    }
}

impl std::error::Error for ObjectIdParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ObjectId {
        ObjectId {
            object_id: compose_object_id(0, 1),
            poa_idx: 1,
            flags: ObjectFlags::empty(),
            origin: Uuid::from_bytes([7u8; 16]),
            class_id: "Calc".to_string(),
            urls: "tcp://localhost:9160;ws://localhost:9161".to_string(),
        }
    }

    #[test]
    fn slot_generation_packing() {
        let id = compose_object_id(3, 9);
        assert_eq!(object_id_slot(id), 3);
        assert_eq!(object_id_generation(id), 9);
        assert_eq!(id, 0x0000_0009_0000_0003);
    }

    #[test]
    fn text_roundtrip() {
        let obj = sample();
        let text = obj.to_text();
        assert!(text.starts_with("NPRPC1:"));
        let parsed = ObjectId::from_text(&text).unwrap();
        assert_eq!(parsed, obj);
    }

    #[test]
    fn text_roundtrip_tethered_empty_urls() {
        let mut obj = sample();
        obj.flags = ObjectFlags::TETHERED;
        obj.urls = String::new();
        let parsed = ObjectId::from_text(&obj.to_text()).unwrap();
        assert_eq!(parsed, obj);
        assert!(parsed.is_tethered());
        assert_eq!(parsed.url_entries().count(), 0);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(
            ObjectId::from_text("calc"),
            Err(ObjectIdParseError::MissingPrefix)
        );
        assert_eq!(
            ObjectId::from_text("NPRPC1:!!!"),
            Err(ObjectIdParseError::BadBase64)
        );
        // valid base64 but too short
        assert_eq!(
            ObjectId::from_text("NPRPC1:AAAA"),
            Err(ObjectIdParseError::Truncated)
        );
    }

    #[test]
    fn url_entries_split() {
        let obj = sample();
        let urls: Vec<_> = obj.url_entries().collect();
        assert_eq!(urls, vec!["tcp://localhost:9160", "ws://localhost:9161"]);
    }
}
