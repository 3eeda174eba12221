use busard_protocol::{HEADER_SIZE, Header, MessageId, MessageType, header_offsets};

/// Default initial capacity for freshly allocated message buffers.
const INITIAL_CAPACITY: usize = 256;

/// An owned, growable byte region holding exactly one wire message.
///
/// Tracks a committed size separately from capacity: `prepare` guarantees
/// free space, `commit` advances the committed size into it, `consume`
/// retracts. All committed bytes are zero-initialized before first commit,
/// so padding never leaks heap contents.
#[derive(Debug, Clone)]
pub struct FlatBuffer {
    data: Vec<u8>,
    size: usize,
}

impl FlatBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        FlatBuffer {
            data: vec![0; capacity.max(HEADER_SIZE)],
            size: 0,
        }
    }

    /// Take ownership of received message bytes. The whole input is the
    /// committed span.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let size = bytes.len();
        FlatBuffer { data: bytes, size }
    }

    /// Start a message: header committed, `size` field left for
    /// [`FlatBuffer::finalize`].
    pub fn begin(msg_id: MessageId, msg_type: MessageType) -> Self {
        let mut fb = Self::new();
        fb.prepare(HEADER_SIZE);
        fb.commit(HEADER_SIZE);
        Header::new(msg_id, msg_type).write(&mut fb.data);
        fb
    }

    /// Ensure at least `n` bytes of free space past the committed size.
    /// Growth doubles the capacity; new bytes are zeroed.
    pub fn prepare(&mut self, n: usize) {
        let needed = self.size + n;
        if needed > self.data.len() {
            let new_cap = needed.max(self.data.len() * 2);
            self.data.resize(new_cap, 0);
        }
    }

    /// Advance the committed size by `n` previously prepared bytes.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.size + n <= self.data.len(), "commit past prepared space");
        self.size += n;
    }

    /// Retract the committed size by `n` bytes.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.size, "consume past start");
        self.size -= n;
        // Scrub so a later commit re-observes zeroed padding.
        self.data[self.size..self.size + n].fill(0);
    }

    /// Committed message length in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The committed message span.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.size]
    }

    /// Consume the buffer, returning the committed bytes.
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.data.truncate(self.size);
        self.data
    }

    /// Parsed copy of the message header.
    pub fn header(&self) -> Option<Header> {
        Header::read(self.as_slice())
    }

    /// Stamp the header `size` field from the committed length
    /// (`committed − 4`, the wire convention).
    pub fn finalize(&mut self) {
        debug_assert!(self.size >= HEADER_SIZE);
        let size = (self.size - 4) as u32;
        self.data[header_offsets::SIZE..header_offsets::SIZE + 4]
            .copy_from_slice(&size.to_le_bytes());
    }

    /// Stamp the correlation id without re-encoding the rest of the header.
    pub fn set_request_id(&mut self, request_id: u32) {
        debug_assert!(self.size >= HEADER_SIZE);
        self.data[header_offsets::REQUEST_ID..header_offsets::REQUEST_ID + 4]
            .copy_from_slice(&request_id.to_le_bytes());
    }

    pub fn request_id(&self) -> u32 {
        let b = &self.data[header_offsets::REQUEST_ID..header_offsets::REQUEST_ID + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }
}

impl Default for FlatBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_commits_header() {
        let fb = FlatBuffer::begin(MessageId::Success, MessageType::Answer);
        assert_eq!(fb.size(), HEADER_SIZE);
        let hdr = fb.header().unwrap();
        assert_eq!(hdr.msg_id, MessageId::Success.as_u32());
        assert_eq!(hdr.msg_type, MessageType::Answer.as_u32());
        assert_eq!(hdr.request_id, 0);
    }

    #[test]
    fn finalize_counts_everything_after_size_field() {
        let mut fb = FlatBuffer::begin(MessageId::Success, MessageType::Answer);
        fb.prepare(8);
        fb.commit(8);
        fb.finalize();
        let hdr = fb.header().unwrap();
        assert_eq!(hdr.size, (HEADER_SIZE + 8 - 4) as u32);
    }

    #[test]
    fn prepare_grows_and_zeroes() {
        let mut fb = FlatBuffer::with_capacity(16);
        fb.prepare(1024);
        fb.commit(1024);
        assert!(fb.capacity() >= 1024);
        assert!(fb.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn consume_scrubs() {
        let mut fb = FlatBuffer::with_capacity(16);
        fb.prepare(4);
        fb.commit(4);
        fb.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);
        fb.consume(2);
        assert_eq!(fb.size(), 2);
        fb.prepare(2);
        fb.commit(2);
        assert_eq!(&fb.as_slice()[2..], &[0, 0]);
    }

    #[test]
    fn request_id_stamp() {
        let mut fb = FlatBuffer::begin(MessageId::FunctionCall, MessageType::Request);
        fb.set_request_id(0xDEAD);
        assert_eq!(fb.request_id(), 0xDEAD);
        assert_eq!(fb.header().unwrap().request_id, 0xDEAD);
    }
}
