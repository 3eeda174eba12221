//! Dual-mapped SPSC byte ring over POSIX shared memory.
//!
//! Each direction of a channel is one shared memory object:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  Ring header (one page: magic, ring size, head, tail,      │
//! │  writer uuid, attach/closed state)                         │
//! ├────────────────────────────────────────────────────────────┤
//! │  Ring bytes (power of two, page-aligned)                   │
//! ├────────────────────────────────────────────────────────────┤
//! │  Ring bytes again (same physical pages, mapped back-to-    │
//! │  back so a payload wrapping the nominal end reads flat)    │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Messages are `{u32 length, bytes}`. The producer owns `head` and
//! publishes with a release store after the payload is written; the
//! consumer owns `tail` and releases space the same way. Maximum message
//! is half the ring.

use std::ffi::CString;
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use static_assertions::const_assert_eq;

use crate::ShmWakeup;

/// Magic bytes identifying a busard ring segment.
pub const MAGIC: [u8; 8] = *b"BUSARD\0\0";

/// Segment layout version.
pub const SEGMENT_VERSION: u32 = 1;

/// Size of the header page preceding the ring bytes.
pub const HEADER_LEN: usize = 4096;

/// Default ring size per direction (1 MB).
pub const DEFAULT_RING_SIZE: usize = 1 << 20;

/// Spins before the reader backs off to its wakeup policy.
const SPIN_BUDGET: u32 = 4096;

/// Ring header at the start of the segment. Head and tail sit on their
/// own cache lines; everything else is written once during setup.
#[repr(C, align(64))]
pub struct RingHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub ring_size: u32,
    _pad0: [u8; 48],

    /// Producer publication index (bytes ever written).
    pub head: AtomicU64,
    _pad1: [u8; 56],

    /// Consumer index (bytes ever read).
    pub tail: AtomicU64,
    _pad2: [u8; 56],

    /// UUID of the attached writer; pins the producing side after the
    /// handshake.
    pub writer_uuid: [u8; 16],
    /// 0 = created, 1 = peer attached.
    pub state: AtomicU32,
    /// Set by either side on teardown.
    pub closed: AtomicU32,
    _pad3: [u8; 40],
}

const_assert_eq!(std::mem::size_of::<RingHeader>(), 256);

impl RingHeader {
    fn init(&mut self, ring_size: u32) {
        self.magic = MAGIC;
        self.version = SEGMENT_VERSION;
        self.ring_size = ring_size;
        self._pad0 = [0; 48];
        self.head = AtomicU64::new(0);
        self._pad1 = [0; 56];
        self.tail = AtomicU64::new(0);
        self._pad2 = [0; 56];
        self.writer_uuid = [0; 16];
        self.state = AtomicU32::new(0);
        self.closed = AtomicU32::new(0);
        self._pad3 = [0; 40];
    }

    fn validate(&self, expected_ring: usize) -> io::Result<()> {
        if self.magic != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad ring magic"));
        }
        if self.version != SEGMENT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("ring segment version {} unsupported", self.version),
            ));
        }
        if self.ring_size as usize != expected_ring {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "ring size disagrees with segment length",
            ));
        }
        Ok(())
    }
}

/// One mapped segment: header page plus dual-mapped ring bytes.
pub struct ShmRegion {
    base: *mut u8,
    ring_size: usize,
    name: CString,
    /// The creator unlinks the object on drop.
    owner: bool,
}

// The region is plain shared memory; all cross-thread access goes through
// the atomics in the header.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

fn errno() -> io::Error {
    io::Error::last_os_error()
}

fn shm_name(name: &str) -> io::Result<CString> {
    CString::new(format!("/{name}"))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul byte in channel name"))
}

impl ShmRegion {
    /// Create and initialize a fresh segment. Any stale object with the
    /// same name (a crashed predecessor) is unlinked first.
    pub fn create(name: &str, ring_size: usize) -> io::Result<Self> {
        assert!(ring_size.is_power_of_two(), "ring size must be power of 2");
        assert!(ring_size.is_multiple_of(page_size()), "ring size must be page-aligned");

        let cname = shm_name(name)?;
        unsafe {
            libc::shm_unlink(cname.as_ptr());
        }
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            return Err(errno());
        }
        let file_len = HEADER_LEN + ring_size;
        let rc = unsafe { libc::ftruncate(fd, file_len as libc::off_t) };
        if rc != 0 {
            let e = errno();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(e);
        }

        let base = unsafe { Self::map(fd, ring_size) };
        unsafe {
            libc::close(fd);
        }
        let base = base?;

        let region = ShmRegion {
            base,
            ring_size,
            name: cname,
            owner: true,
        };
        unsafe {
            (*region.header_mut()).init(ring_size as u32);
        }
        Ok(region)
    }

    /// Attach to an existing segment created by a peer.
    pub fn open(name: &str) -> io::Result<Self> {
        let cname = shm_name(name)?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(errno());
        }

        let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
        let rc = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
        if rc != 0 {
            let e = errno();
            unsafe {
                libc::close(fd);
            }
            return Err(e);
        }
        let file_len = unsafe { stat.assume_init() }.st_size as usize;
        if file_len <= HEADER_LEN {
            unsafe {
                libc::close(fd);
            }
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "ring segment too small",
            ));
        }
        let ring_size = file_len - HEADER_LEN;
        if !ring_size.is_power_of_two() {
            unsafe {
                libc::close(fd);
            }
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "ring segment length is not a power of two",
            ));
        }

        let base = unsafe { Self::map(fd, ring_size) };
        unsafe {
            libc::close(fd);
        }
        let base = base?;

        let region = ShmRegion {
            base,
            ring_size,
            name: cname,
            owner: false,
        };
        region.header().validate(ring_size)?;
        Ok(region)
    }

    /// Map header + ring, then the ring pages a second time directly
    /// after, so reads crossing the nominal end stay contiguous.
    unsafe fn map(fd: libc::c_int, ring_size: usize) -> io::Result<*mut u8> {
        let total = HEADER_LEN + 2 * ring_size;

        // Reserve the whole window, then place the file mappings into it.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(errno());
        }
        let base = base as *mut u8;

        let first = unsafe {
            libc::mmap(
                base as *mut libc::c_void,
                HEADER_LEN + ring_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        if first == libc::MAP_FAILED {
            let e = errno();
            unsafe {
                libc::munmap(base as *mut libc::c_void, total);
            }
            return Err(e);
        }

        let mirror_at = unsafe { base.add(HEADER_LEN + ring_size) };
        let second = unsafe {
            libc::mmap(
                mirror_at as *mut libc::c_void,
                ring_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                HEADER_LEN as libc::off_t,
            )
        };
        if second == libc::MAP_FAILED {
            let e = errno();
            unsafe {
                libc::munmap(base as *mut libc::c_void, total);
            }
            return Err(e);
        }

        Ok(base)
    }

    pub fn header(&self) -> &RingHeader {
        unsafe { &*(self.base as *const RingHeader) }
    }

    fn header_mut(&self) -> *mut RingHeader {
        self.base as *mut RingHeader
    }

    fn ring_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(HEADER_LEN) }
    }

    pub fn ring_size(&self) -> usize {
        self.ring_size
    }

    /// Largest acceptable message (length prefix included): half the ring.
    pub fn max_message(&self) -> usize {
        self.ring_size / 2 - 4
    }

    /// Stamp the writer UUID. Written only before the release store of
    /// `state`, read only after its acquire load.
    pub fn set_writer_uuid(&self, uuid: [u8; 16]) {
        unsafe {
            let hdr = self.header_mut();
            std::ptr::copy_nonoverlapping(uuid.as_ptr(), (*hdr).writer_uuid.as_mut_ptr(), 16);
        }
    }

    pub fn writer_uuid(&self) -> [u8; 16] {
        self.header().writer_uuid
    }

    /// Flip the attach state; pairs with [`ShmRegion::is_attached`].
    pub fn set_attached(&self) {
        self.header().state.store(1, Ordering::Release);
    }

    pub fn is_attached(&self) -> bool {
        self.header().state.load(Ordering::Acquire) == 1
    }

    pub fn mark_closed(&self) {
        self.header().closed.store(1, Ordering::Release);
    }

    pub fn is_marked_closed(&self) -> bool {
        self.header().closed.load(Ordering::Acquire) != 0
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(
                self.base as *mut libc::c_void,
                HEADER_LEN + 2 * self.ring_size,
            );
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn backoff(wakeup: ShmWakeup, spins: &mut u32) {
    *spins += 1;
    if *spins < SPIN_BUDGET {
        std::hint::spin_loop();
        return;
    }
    match wakeup {
        ShmWakeup::Spin => std::hint::spin_loop(),
        ShmWakeup::Yield => std::thread::yield_now(),
    }
}

/// Producer half. Exactly one per region; the handshake pins it.
pub struct RingProducer {
    region: std::sync::Arc<ShmRegion>,
    wakeup: ShmWakeup,
}

impl RingProducer {
    pub fn new(region: std::sync::Arc<ShmRegion>, wakeup: ShmWakeup) -> Self {
        RingProducer { region, wakeup }
    }

    /// Block until the message fits, then write `{len, bytes}` and
    /// publish. Returns false if the channel closed while waiting.
    pub fn push(&self, bytes: &[u8]) -> io::Result<bool> {
        if bytes.len() > self.region.max_message() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "message of {} bytes exceeds ring limit of {}",
                    bytes.len(),
                    self.region.max_message()
                ),
            ));
        }
        let hdr = self.region.header();
        let ring = self.region.ring_size() as u64;
        let need = (4 + bytes.len()) as u64;

        let head = hdr.head.load(Ordering::Relaxed);
        let mut spins = 0u32;
        loop {
            if self.region.is_marked_closed() {
                return Ok(false);
            }
            let tail = hdr.tail.load(Ordering::Acquire);
            if head.wrapping_sub(tail) + need <= ring {
                break;
            }
            backoff(self.wakeup, &mut spins);
        }

        let mask = ring - 1;
        let at = (head & mask) as usize;
        let ptr = self.region.ring_ptr();
        unsafe {
            let len_le = (bytes.len() as u32).to_le_bytes();
            std::ptr::copy_nonoverlapping(len_le.as_ptr(), ptr.add(at), 4);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(at + 4), bytes.len());
        }
        hdr.head.store(head.wrapping_add(need), Ordering::Release);
        Ok(true)
    }
}

/// Consumer half.
pub struct RingConsumer {
    region: std::sync::Arc<ShmRegion>,
    wakeup: ShmWakeup,
}

impl RingConsumer {
    pub fn new(region: std::sync::Arc<ShmRegion>, wakeup: ShmWakeup) -> Self {
        RingConsumer { region, wakeup }
    }

    /// Block until a message is available. Returns None when the channel
    /// closed and the ring drained.
    pub fn pop(&self) -> io::Result<Option<Vec<u8>>> {
        let hdr = self.region.header();
        let ring = self.region.ring_size() as u64;
        let mask = ring - 1;

        let tail = hdr.tail.load(Ordering::Relaxed);
        let mut spins = 0u32;
        let head = loop {
            let head = hdr.head.load(Ordering::Acquire);
            if head != tail {
                break head;
            }
            if self.region.is_marked_closed() {
                return Ok(None);
            }
            backoff(self.wakeup, &mut spins);
        };
        debug_assert!(head.wrapping_sub(tail) >= 4);

        let ptr = self.region.ring_ptr();
        let at = (tail & mask) as usize;
        let mut len_le = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(at), len_le.as_mut_ptr(), 4);
        }
        let len = u32::from_le_bytes(len_le) as usize;
        if len > self.region.max_message() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "corrupt ring: oversized length prefix",
            ));
        }

        let mut out = vec![0u8; len];
        unsafe {
            // Dual mapping keeps this span flat even when it crosses the
            // nominal ring end.
            std::ptr::copy_nonoverlapping(ptr.add(at + 4), out.as_mut_ptr(), len);
        }
        hdr.tail
            .store(tail.wrapping_add((4 + len) as u64), Ordering::Release);
        Ok(Some(out))
    }
}
