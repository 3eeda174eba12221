//! Bounds-checked decoder.
//!
//! A [`Reader`] wraps one received message span. Every access validates
//! offsets against the span before touching bytes; a hostile or corrupted
//! message yields [`FlatError`], never an out-of-bounds read.

use busard_protocol::HEADER_SIZE;

use crate::FlatError;

#[derive(Clone, Copy, Debug)]
pub struct Reader<'a> {
    msg: &'a [u8],
}

macro_rules! scalar_reader {
    ($name:ident, $ty:ty, $n:expr) => {
        #[inline]
        pub fn $name(&self, at: usize) -> Result<$ty, FlatError> {
            self.check(at, $n)?;
            let mut b = [0u8; $n];
            b.copy_from_slice(&self.msg[at..at + $n]);
            Ok(<$ty>::from_le_bytes(b))
        }
    };
}

impl<'a> Reader<'a> {
    /// Wrap a message span. Fails if it cannot even hold the header.
    pub fn new(msg: &'a [u8]) -> Result<Self, FlatError> {
        if msg.len() < HEADER_SIZE {
            return Err(FlatError::Truncated);
        }
        Ok(Reader { msg })
    }

    pub fn len(&self) -> usize {
        self.msg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msg.is_empty()
    }

    /// The body span after the fixed header.
    pub fn body(&self) -> &'a [u8] {
        &self.msg[HEADER_SIZE..]
    }

    #[inline]
    fn check(&self, at: usize, n: usize) -> Result<(), FlatError> {
        let end = at.checked_add(n).ok_or(FlatError::Overflow)?;
        if end > self.msg.len() {
            return Err(FlatError::OutOfBounds);
        }
        Ok(())
    }

    scalar_reader!(u16_at, u16, 2);
    scalar_reader!(u32_at, u32, 4);
    scalar_reader!(u64_at, u64, 8);
    scalar_reader!(i16_at, i16, 2);
    scalar_reader!(i32_at, i32, 4);
    scalar_reader!(i64_at, i64, 8);
    scalar_reader!(f32_at, f32, 4);
    scalar_reader!(f64_at, f64, 8);

    #[inline]
    pub fn u8_at(&self, at: usize) -> Result<u8, FlatError> {
        self.check(at, 1)?;
        Ok(self.msg[at])
    }

    #[inline]
    pub fn bool_at(&self, at: usize) -> Result<bool, FlatError> {
        Ok(self.u8_at(at)? != 0)
    }

    /// Resolve a vector field: returns `(data_offset, count)` after
    /// validating the relative offset, the element alignment and that
    /// `count * elem_size` fits inside the message.
    pub fn vector(
        &self,
        field_offset: usize,
        elem_size: usize,
        elem_align: usize,
    ) -> Result<(usize, usize), FlatError> {
        let rel = self.u32_at(field_offset)? as usize;
        let count = self.u32_at(field_offset + 4)? as usize;
        if count == 0 {
            return Ok((0, 0));
        }
        let data = field_offset.checked_add(rel).ok_or(FlatError::Overflow)?;
        if !data.is_multiple_of(elem_align) {
            return Err(FlatError::Misaligned);
        }
        let bytes = count.checked_mul(elem_size).ok_or(FlatError::Overflow)?;
        self.check(data, bytes)?;
        Ok((data, count))
    }

    /// Byte-vector field as a borrowed span.
    pub fn bytes_vector(&self, field_offset: usize) -> Result<&'a [u8], FlatError> {
        let (data, count) = self.vector(field_offset, 1, 1)?;
        Ok(&self.msg[data..data + count])
    }

    /// String field as borrowed UTF-8.
    pub fn string(&self, field_offset: usize) -> Result<&'a str, FlatError> {
        let bytes = self.bytes_vector(field_offset)?;
        std::str::from_utf8(bytes).map_err(|_| FlatError::BadUtf8)
    }

    /// `u32` vector field, decoded element-wise.
    pub fn u32_vector(
        &self,
        field_offset: usize,
    ) -> Result<impl Iterator<Item = u32> + 'a, FlatError> {
        let (data, count) = self.vector(field_offset, 4, 4)?;
        let span = &self.msg[data..data + count * 4];
        Ok(span
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
    }

    /// `u64` vector field, decoded element-wise.
    pub fn u64_vector(
        &self,
        field_offset: usize,
    ) -> Result<impl Iterator<Item = u64> + 'a, FlatError> {
        let (data, count) = self.vector(field_offset, 8, 8)?;
        let span = &self.msg[data..data + count * 8];
        Ok(span.chunks_exact(8).map(|c| {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            u64::from_le_bytes(b)
        }))
    }

    /// Presence flag of a fixed-size optional.
    pub fn optional_flag(&self, field_offset: usize) -> Result<bool, FlatError> {
        self.bool_at(field_offset)
    }

    pub fn optional_u32(&self, field_offset: usize) -> Result<Option<u32>, FlatError> {
        if self.optional_flag(field_offset)? {
            Ok(Some(self.u32_at(field_offset + 4)?))
        } else {
            Ok(None)
        }
    }

    pub fn optional_u64(&self, field_offset: usize) -> Result<Option<u64>, FlatError> {
        if self.optional_flag(field_offset)? {
            Ok(Some(self.u64_at(field_offset + 8)?))
        } else {
            Ok(None)
        }
    }

    /// Variable-size optional: absolute offset of the out-of-line slot,
    /// or None when the relative offset is 0.
    pub fn optional_struct(
        &self,
        field_offset: usize,
        size: usize,
        align: usize,
    ) -> Result<Option<usize>, FlatError> {
        let rel = self.u32_at(field_offset)? as usize;
        if rel == 0 {
            return Ok(None);
        }
        let data = field_offset.checked_add(rel).ok_or(FlatError::Overflow)?;
        if !data.is_multiple_of(align) {
            return Err(FlatError::Misaligned);
        }
        self.check(data, size)?;
        Ok(Some(data))
    }
}
