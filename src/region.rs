//! Mapped Regions - Lifecycle of one file-backed memory mapping.
//!
//! A [`RegionMapper`] owns a file descriptor and at most one mapping of it.
//! Regions are opened (creating or growing the file as needed), mapped,
//! synced, unmapped and closed explicitly, and dropping a region releases
//! whatever is still held.
//!
//! [`TypedScalarRegion`] narrows a region to exactly one `T`, constructed and
//! destroyed in place. The value's lifetime is tied to the mapping, not to
//! the heap.

use crate::error::{Error, Result};
use memmap2::{Advice, MmapOptions, MmapRaw};
use std::fs::{File, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::mem::{align_of, needs_drop, size_of};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::debug;

/// Returns the system page size in bytes.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// A live mapping: either placed by the kernel (managed by memmap2) or
/// overlaid at a caller-reserved address.
enum Mapping {
    Managed(MmapRaw),
    Fixed { ptr: NonNull<u8>, len: usize },
}

impl Mapping {
    #[inline]
    fn as_ptr(&self) -> *mut u8 {
        match self {
            Mapping::Managed(map) => map.as_mut_ptr(),
            Mapping::Fixed { ptr, .. } => ptr.as_ptr(),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        match self {
            Mapping::Managed(map) => map.len(),
            Mapping::Fixed { len, .. } => *len,
        }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Mapping::Fixed { ptr, len } = *self {
            // SAFETY: `ptr..ptr+len` was returned by a successful mmap and is
            // unmapped exactly once, here.
            let ret = unsafe { libc::munmap(ptr.as_ptr().cast(), len) };
            if ret != 0 {
                tracing::warn!(error = %io::Error::last_os_error(), "munmap of fixed region failed");
            }
        }
    }
}

/// One file and its (optional) memory mapping.
///
/// Invariant: `mapped() ⇒ opened()`.
pub struct RegionMapper {
    path: PathBuf,
    file: Option<File>,
    size: u64,
    readonly: bool,
    grown: bool,
    mapping: Option<Mapping>,
}

// SAFETY: the raw mapping pointer is only dereferenced through methods that
// callers synchronize themselves (the region hands out raw pointers, never
// references), and the mapping itself is process-wide.
unsafe impl Send for RegionMapper {}
unsafe impl Sync for RegionMapper {}

impl RegionMapper {
    /// Open (or create) `path` and map it in full.
    pub fn new(path: impl AsRef<Path>, size: u64, readonly: bool) -> Result<Self> {
        let mut region = Self::open(path, size, readonly)?;
        region.mmap(0)?;
        Ok(region)
    }

    /// Open or create `path` without mapping it.
    ///
    /// A read-only open or `size == 0` adopts the file's current length;
    /// otherwise the file is grown to `size` if it is shorter.
    pub fn open(path: impl AsRef<Path>, size: u64, readonly: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let construction = |source: io::Error| Error::Construction { path: path.clone(), source };

        let file = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .create(!readonly)
            .mode(0o600)
            .open(&path)
            .map_err(construction)?;

        let current = file.metadata().map_err(construction)?.len();

        let size = if readonly || size == 0 { current } else { size };
        let grown = size > current;
        if grown {
            file.set_len(size).map_err(construction)?;
        }

        debug!(path = %path.display(), size, readonly, grown, "opened region");

        Ok(Self {
            path,
            file: Some(file),
            size,
            readonly,
            grown,
            mapping: None,
        })
    }

    /// Map `[offset, size)` with protection matching the open mode.
    ///
    /// Fails with [`Error::AlreadyMapped`] if a mapping is live; the existing
    /// mapping is left untouched.
    pub fn mmap(&mut self, offset: u64) -> Result<()> {
        let len = self.prepare_map(offset)?;
        let file = self.file.as_ref().ok_or(Error::NotMapped)?;

        let mut options = MmapOptions::new();
        options.offset(offset).len(len);
        let map = if self.readonly {
            options.map_raw_read_only(file)
        } else {
            options.map_raw(file)
        }
        .map_err(|source| Error::Map { path: self.path.clone(), source })?;

        self.mapping = Some(Mapping::Managed(map));
        Ok(())
    }

    /// Map `[offset, size)` at exactly `addr`, replacing whatever the caller
    /// reserved there.
    ///
    /// # Safety
    /// `addr..addr + (size - offset)` must be a page-aligned range the caller
    /// owns (typically a `PROT_NONE` reservation) and nothing may reference
    /// the memory previously mapped there.
    pub unsafe fn mmap_fixed(&mut self, addr: NonNull<u8>, offset: u64) -> Result<()> {
        let len = self.prepare_map(offset)?;
        let fd = self.file.as_ref().ok_or(Error::NotMapped)?.as_raw_fd();
        let prot = if self.readonly {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };

        let ptr = libc::mmap(
            addr.as_ptr().cast(),
            len,
            prot,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            offset as libc::off_t,
        );
        if ptr == libc::MAP_FAILED || ptr.cast::<u8>() != addr.as_ptr() {
            return Err(Error::Map { path: self.path.clone(), source: io::Error::last_os_error() });
        }

        self.mapping = Some(Mapping::Fixed { ptr: addr, len });
        Ok(())
    }

    fn prepare_map(&self, offset: u64) -> Result<usize> {
        if self.mapped() {
            return Err(Error::AlreadyMapped);
        }
        if !self.opened() {
            return Err(Error::NotMapped);
        }
        if offset > self.size {
            return Err(Error::Map {
                path: self.path.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "offset beyond end of file"),
            });
        }
        Ok((self.size - offset) as usize)
    }

    /// Release the mapping. Returns [`Error::NotMapped`] if there was none.
    pub fn munmap(&mut self) -> Result<()> {
        match self.mapping.take() {
            Some(_) => Ok(()),
            None => Err(Error::NotMapped),
        }
    }

    /// Unmap (if needed) and close the file.
    pub fn close(&mut self) {
        self.mapping = None;
        self.file = None;
    }

    /// Flush dirty pages, asynchronously or blocking.
    pub fn sync(&self, asynchronous: bool) -> Result<()> {
        let mapping = self.mapping.as_ref().ok_or(Error::NotMapped)?;
        let res = match mapping {
            Mapping::Managed(map) if asynchronous => map.flush_async(),
            Mapping::Managed(map) => map.flush(),
            Mapping::Fixed { ptr, len } => {
                let flags = if asynchronous { libc::MS_ASYNC } else { libc::MS_SYNC };
                // SAFETY: the range is a live mapping owned by this region.
                match unsafe { libc::msync(ptr.as_ptr().cast(), *len, flags) } {
                    0 => Ok(()),
                    _ => Err(io::Error::last_os_error()),
                }
            }
        };
        res.map_err(|source| Error::Sync { source })
    }

    /// Resize the backing file. Does not touch the mapping.
    pub fn ftruncate(&self, size: u64) -> Result<()> {
        let file = self.file.as_ref().ok_or(Error::NotMapped)?;
        file.set_len(size)
            .map_err(|source| Error::Truncate { path: self.path.clone(), source })
    }

    /// Best-effort residency hint over `[offset, offset + len)` of the
    /// mapping. The range is clamped to the mapping.
    pub fn advise(&self, advice: Advice, offset: usize, len: usize) -> io::Result<()> {
        let mapping = match self.mapping.as_ref() {
            Some(m) => m,
            None => return Err(io::Error::from_raw_os_error(libc::EBADF)),
        };
        let total = mapping.len();
        if offset >= total || len == 0 {
            return Ok(());
        }
        let len = len.min(total - offset);
        match mapping {
            Mapping::Managed(map) => map.advise_range(advice, offset, len),
            Mapping::Fixed { .. } => Err(io::Error::from(io::ErrorKind::Unsupported)),
        }
    }

    /// Base address of the mapping, or null when unmapped.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.mapping.as_ref().map_or(std::ptr::null_mut(), Mapping::as_ptr)
    }

    /// Byte size of the region (the file size it was opened with).
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn opened(&self) -> bool {
        self.file.is_some()
    }

    #[inline]
    pub fn mapped(&self) -> bool {
        self.mapping.is_some()
    }

    #[inline]
    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// True if `open` extended the file (it was new or shorter).
    #[inline]
    pub fn was_grown(&self) -> bool {
        self.grown
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for RegionMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionMapper")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("readonly", &self.readonly)
            .field("opened", &self.opened())
            .field("mapped", &self.mapped())
            .finish()
    }
}

/// A mapping holding exactly one `T`.
///
/// The value may be written in place on construction; on drop its
/// destructor runs in place (writable mappings only) before the page is
/// unmapped.
pub struct TypedScalarRegion<T> {
    region: RegionMapper,
    value: NonNull<T>,
    _marker: PhantomData<T>,
}

// SAFETY: the region only hands out `&T`, so sharing follows `T`'s own
// thread-safety.
unsafe impl<T: Send> Send for TypedScalarRegion<T> {}
unsafe impl<T: Sync> Sync for TypedScalarRegion<T> {}

impl<T> TypedScalarRegion<T> {
    /// Open `path` as a `size_of::<T>()` region and map it.
    ///
    /// With `init = Some(v)`, `v` is written in place when the open created
    /// or extended the file. An existing value is adopted as is.
    pub fn open(path: impl AsRef<Path>, readonly: bool, init: Option<T>) -> Result<Self> {
        debug_assert!(align_of::<T>() <= page_size());

        let want = size_of::<T>() as u64;
        let mut region = RegionMapper::open(path, want, readonly)?;
        if region.size() < want {
            return Err(Error::Construction {
                path: region.path().to_path_buf(),
                source: io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("file holds {} bytes, need {}", region.size(), want),
                ),
            });
        }
        region.mmap(0)?;

        let value = NonNull::new(region.as_ptr().cast::<T>()).ok_or(Error::NotMapped)?;
        if let Some(init) = init {
            if !readonly && region.was_grown() {
                // SAFETY: the mapping is at least size_of::<T>() bytes,
                // page aligned, and writable.
                unsafe { value.as_ptr().write(init) };
            }
        }

        Ok(Self { region, value, _marker: PhantomData })
    }

    /// The value living in the mapping.
    #[inline]
    pub fn get(&self) -> &T {
        // SAFETY: the mapping stays live for as long as `self`.
        unsafe { self.value.as_ref() }
    }

    /// True when the backing file was created or extended by this open.
    #[inline]
    pub fn was_grown(&self) -> bool {
        self.region.was_grown()
    }

    pub fn region(&self) -> &RegionMapper {
        &self.region
    }
}

impl<T> std::fmt::Debug for TypedScalarRegion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedScalarRegion")
            .field("type", &std::any::type_name::<T>())
            .field("region", &self.region)
            .finish()
    }
}

impl<T> Drop for TypedScalarRegion<T> {
    fn drop(&mut self) {
        if needs_drop::<T>() && self.region.mapped() && !self.region.readonly() {
            // SAFETY: the value was constructed in (or adopted from) the
            // mapping and is dropped once; the page itself is released by
            // the region.
            unsafe { std::ptr::drop_in_place(self.value.as_ptr()) };
        }
    }
}
