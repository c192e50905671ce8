//! Mapped Ring - Double-mapped circular byte buffer.
//!
//! The same `capacity` bytes of a file are mapped twice, back to back:
//!
//! ```text
//!   virtual:  [ view 0: 0..cap ][ view 1: cap..2cap ][ reserved ... ]
//!   file:     [ offset..offset+cap ]  (both views)
//! ```
//!
//! Any span of up to `capacity` bytes starting anywhere in the first view
//! is therefore contiguous in memory, and neither side ever splits a copy
//! at the wrap point.
//!
//! One producer and one consumer own a ring; it does no synchronization.

use crate::config::RingConfig;
use crate::error::{Error, Result};
use crate::region::page_size;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd};
use std::ptr::NonNull;
use tracing::{debug, warn};

pub struct RingBuffer {
    base: NonNull<u8>,
    capacity: usize,
    read: usize,
    write: usize,
    /// Backing for rings created by [`RingBuffer::anonymous`].
    _backing: Option<File>,
}

// SAFETY: the ring owns its mapping outright; moving it to another thread
// moves the only handle to that memory.
unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Map `[offset, offset + 2^order)` of `fd` as a ring.
    ///
    /// `2^order` must be a multiple of the page size, `offset` must be page
    /// aligned, and the file must already be long enough.
    pub fn new(fd: impl AsFd, offset: u64, order: u8) -> Result<Self> {
        let capacity = Self::validate(offset, order)?;

        let raw = fd.as_fd().as_raw_fd();
        let len = file_len(raw).map_err(|source| Error::RingMap { source })?;
        if len < offset + capacity as u64 {
            return Err(Error::Ring {
                reason: format!("backing file holds {len} bytes, ring needs {}", offset + capacity as u64),
            });
        }

        // SAFETY: `raw` is a valid descriptor for the duration of this call
        // and the geometry was validated above.
        let base = unsafe { map_doubled(raw, offset, capacity) }?;
        debug!(capacity, offset, "mapped ring buffer");

        Ok(Self { base, capacity, read: 0, write: 0, _backing: None })
    }

    /// [`new`](Self::new) with geometry from `config`.
    pub fn with_config(fd: impl AsFd, config: &RingConfig) -> Result<Self> {
        Self::new(fd, config.offset, config.order)
    }

    /// A ring over a private in-memory file.
    pub fn anonymous(order: u8) -> Result<Self> {
        let capacity = Self::validate(0, order)?;

        // SAFETY: the name is NUL terminated; the returned descriptor is
        // checked before it is wrapped.
        let fd = unsafe { libc::memfd_create(b"flash-ring\0".as_ptr().cast(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::RingMap { source: io::Error::last_os_error() });
        }
        // SAFETY: `fd` is a fresh descriptor owned by nothing else.
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(capacity as u64).map_err(|source| Error::RingMap { source })?;

        let mut ring = Self::new(&file, 0, order)?;
        ring._backing = Some(file);
        Ok(ring)
    }

    fn validate(offset: u64, order: u8) -> Result<usize> {
        let page = page_size();
        let capacity = 1usize
            .checked_shl(u32::from(order))
            .filter(|cap| cap.checked_mul(4).is_some())
            .ok_or_else(|| Error::Ring { reason: format!("order {order} is too large") })?;
        if capacity % page != 0 {
            return Err(Error::Ring {
                reason: format!("capacity {capacity} is not a multiple of the page size {page}"),
            });
        }
        if offset % page as u64 != 0 {
            return Err(Error::Ring { reason: format!("offset {offset} is not page aligned") });
        }
        Ok(capacity)
    }

    /// Where the producer writes next.
    #[inline]
    pub fn write_address(&mut self) -> *mut u8 {
        // SAFETY: `write < 2 * capacity`, inside the doubled views.
        unsafe { self.base.as_ptr().add(self.write) }
    }

    /// The free space as one contiguous slice.
    #[inline]
    pub fn writable(&mut self) -> &mut [u8] {
        let free = self.free();
        // SAFETY: `[write, write + free)` ends at `read + capacity`, which
        // is below `2 * capacity`, and only the producer touches it.
        unsafe { std::slice::from_raw_parts_mut(self.write_address(), free) }
    }

    /// Publish `count` bytes written at [`write_address`](Self::write_address).
    #[inline]
    pub fn write_advance(&mut self, count: usize) {
        debug_assert!(count <= self.free(), "write_advance past free space");
        self.write += count.min(self.free());
    }

    /// Where the consumer reads next.
    #[inline]
    pub fn read_address(&self) -> *const u8 {
        // SAFETY: `read < capacity`.
        unsafe { self.base.as_ptr().add(self.read) }
    }

    /// The unread bytes as one contiguous slice.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        // SAFETY: `[read, write)` lies inside the doubled views.
        unsafe { std::slice::from_raw_parts(self.read_address(), self.size()) }
    }

    /// Consume `count` bytes. Once the read cursor leaves the first view,
    /// both cursors move back by `capacity`.
    #[inline]
    pub fn read_advance(&mut self, count: usize) {
        debug_assert!(count <= self.size(), "read_advance past written data");
        self.read += count.min(self.size());
        if self.read >= self.capacity {
            self.read -= self.capacity;
            self.write -= self.capacity;
        }
    }

    /// Unread bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.write - self.read
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.capacity - self.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// Drop everything unread.
    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        // SAFETY: the whole reservation was mapped by `map_doubled` and is
        // released once; this also removes both overlays.
        let ret = unsafe { libc::munmap(self.base.as_ptr().cast(), self.capacity * 4) };
        if ret != 0 {
            warn!(error = %io::Error::last_os_error(), "ring buffer munmap failed");
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("read", &self.read)
            .field("write", &self.write)
            .finish()
    }
}

fn file_len(fd: libc::c_int) -> io::Result<u64> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: fstat fills `stat` on success and we only read it then.
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { stat.assume_init() }.st_size as u64)
}

/// Reserve `4 * capacity` bytes of address space and overlay the first two
/// quarters with the same `capacity` bytes of `fd`.
///
/// # Safety
/// `fd` must be valid and at least `offset + capacity` bytes long.
unsafe fn map_doubled(fd: libc::c_int, offset: u64, capacity: usize) -> Result<NonNull<u8>> {
    let reserve = capacity * 4;
    let base = libc::mmap(
        std::ptr::null_mut(),
        reserve,
        libc::PROT_NONE,
        libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
        -1,
        0,
    );
    if base == libc::MAP_FAILED {
        return Err(Error::RingMap { source: io::Error::last_os_error() });
    }
    let base = base.cast::<u8>();

    for view in 0..2 {
        let want = base.add(view * capacity);
        let got = libc::mmap(
            want.cast(),
            capacity,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_FIXED | libc::MAP_SHARED,
            fd,
            offset as libc::off_t,
        );
        if got != want.cast() {
            let source = io::Error::last_os_error();
            libc::munmap(base.cast(), reserve);
            return Err(Error::RingMap { source });
        }
    }

    NonNull::new(base).ok_or_else(|| Error::Ring { reason: "mmap returned null".into() })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Smallest order that is a whole number of pages.
    fn page_order() -> u8 {
        page_size().trailing_zeros() as u8
    }

    #[test]
    fn test_views_alias_same_bytes() {
        let mut ring = RingBuffer::anonymous(page_order()).unwrap();
        let cap = ring.capacity();
        unsafe {
            *ring.write_address() = 0x5A;
            assert_eq!(*ring.write_address().add(cap), 0x5A);
            *ring.write_address().add(cap + 1) = 0xA5;
            assert_eq!(*ring.write_address().add(1), 0xA5);
        }
    }

    #[test]
    fn test_wrap_is_contiguous() {
        let mut ring = RingBuffer::anonymous(page_order()).unwrap();
        let cap = ring.capacity();

        // Park both cursors just before the end of the first view.
        ring.write_advance(cap - 3);
        ring.read_advance(cap - 3);
        assert!(ring.is_empty());

        let msg = b"wraps around";
        ring.writable()[..msg.len()].copy_from_slice(msg);
        ring.write_advance(msg.len());
        assert_eq!(ring.size(), msg.len());
        assert_eq!(ring.readable(), msg);

        ring.read_advance(msg.len());
        assert!(ring.is_empty());
        // Cursors were normalized back into the first view.
        assert_eq!(ring.read_address(), ring.write_address() as *const u8);
        assert_eq!(ring.free(), cap);
    }

    #[test]
    fn test_full_ring_and_clear() {
        let mut ring = RingBuffer::anonymous(page_order()).unwrap();
        let cap = ring.capacity();
        ring.writable().fill(7);
        ring.write_advance(cap);
        assert_eq!(ring.free(), 0);
        assert_eq!(ring.size(), cap);
        assert!(ring.writable().is_empty());
        assert!(ring.readable().iter().all(|&b| b == 7));

        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.free(), cap);
    }

    #[test]
    fn test_rejects_bad_geometry() {
        assert!(matches!(RingBuffer::anonymous(3), Err(Error::Ring { .. })));
        assert!(matches!(RingBuffer::anonymous(70), Err(Error::Ring { .. })));

        let file = tempfile::tempfile().unwrap();
        file.set_len(page_size() as u64 * 4).unwrap();
        let order = page_order();
        assert!(matches!(RingBuffer::new(&file, 1, order), Err(Error::Ring { .. })));
        assert!(matches!(
            RingBuffer::new(&file, page_size() as u64 * 4, order),
            Err(Error::Ring { .. })
        ));
    }

    #[test]
    fn test_file_backed_ring_at_offset() {
        let page = page_size();
        let file = tempfile::tempfile().unwrap();
        file.set_len(page as u64 * 2).unwrap();

        let config = RingConfig { order: page_order(), offset: page as u64 };
        let mut ring = RingBuffer::with_config(&file, &config).unwrap();
        ring.writable()[..5].copy_from_slice(b"hello");
        ring.write_advance(5);
        drop(ring);

        let mut bytes = vec![0u8; page * 2];
        use std::io::Read;
        let mut f = &file;
        f.read_exact(&mut bytes).unwrap();
        assert_eq!(&bytes[page..page + 5], b"hello");
        assert!(bytes[..page].iter().all(|&b| b == 0));
    }
}
