//! Append Log - Lock-free, multi-writer, memory-mapped event log.
//!
//! A log is two files:
//!
//! | File            | Contents                                        |
//! |-----------------|-------------------------------------------------|
//! | `<path>`        | record bytes, sparse, reserved to `capacity`    |
//! | `<path>.offset` | 8-byte native-endian committed length (`u64`)  |
//!
//! Writers claim disjoint byte ranges with one `fetch_add` on the mapped
//! counter and then copy their payload in, with no lock on the hot path.
//! On clean shutdown the data file is truncated to the committed length.
//!
//! # Visibility
//!
//! The counter moves before the payload is copied. A reader sampling
//! [`AppendLog::size`] can therefore see bytes that are reserved but still
//! zero. The record decoder treats a zero kind byte as "not yet published"
//! and retries, so the only bytes a reader trusts are those behind a
//! non-zero header.

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::region::{page_size, RegionMapper, TypedScalarRegion};
use crate::timer::TimerListener;
use memmap2::Advice;
use parking_lot::Mutex;
use std::io::IoSlice;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, trace, warn};

/// Returns the counter file path for a log at `path`.
pub fn offset_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".offset");
    PathBuf::from(name)
}

/// An append-only log shared by any number of writer threads.
///
/// `AppendLog` is `Sync`: share it with `Arc` and call [`write`](Self::write)
/// from every producer concurrently.
pub struct AppendLog {
    path: PathBuf,
    config: LogConfig,
    page: usize,
    /// Serializes maintenance hints with shutdown truncation.
    maint: Mutex<()>,
    data: RegionMapper,
    committed: TypedScalarRegion<AtomicU64>,
    closed: bool,
}

impl AppendLog {
    /// Open (or create) the log at `path`.
    ///
    /// Writers reserve `config.capacity` bytes of sparse file and address
    /// space. Readers adopt whatever the files currently hold.
    pub fn open(path: impl AsRef<Path>, config: &LogConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let readonly = config.readonly;

        let reserve = if readonly { 0 } else { config.capacity };
        let data = RegionMapper::new(&path, reserve, readonly)?;
        let committed =
            TypedScalarRegion::open(offset_path(&path), readonly, Some(AtomicU64::new(0)))?;

        let log = Self {
            path,
            config: config.clone(),
            page: page_size(),
            maint: Mutex::new(()),
            data,
            committed,
            closed: false,
        };

        if config.advise_sequential {
            let _guard = log.maint.lock();
            if let Err(e) = log.data.advise(Advice::Sequential, 0, log.capacity() as usize) {
                warn!(path = %log.path.display(), error = %e, "sequential advice failed");
            }
        }

        debug!(
            path = %log.path.display(),
            capacity = log.capacity(),
            committed = log.size(),
            readonly,
            "opened append log"
        );
        Ok(log)
    }

    /// Reserve `buf.len()` bytes and copy `buf` into them.
    ///
    /// Safe to call from any number of threads at once. Returns the number
    /// of bytes written; an empty `buf` reserves nothing and returns 0.
    ///
    /// # Errors
    /// - [`Error::ReadOnly`] if the log was opened for reading.
    /// - [`Error::SpaceExhausted`] if the reservation runs past capacity.
    ///   The counter has already advanced by `buf.len()`, so the bytes
    ///   between the old committed size and capacity are lost to the log.
    ///
    /// # Complexity
    /// One atomic add plus a `memcpy`.
    #[inline]
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.config.readonly {
            return Err(Error::ReadOnly);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let len = buf.len() as u64;
        let offset = self.counter().fetch_add(len, Ordering::AcqRel);
        let capacity = self.capacity();
        if offset.checked_add(len).map_or(true, |end| end > capacity) {
            return Err(Error::SpaceExhausted { offset, len, capacity });
        }

        // SAFETY: [offset, offset + len) lies inside the writable mapping
        // and was handed to this call alone by the fetch_add above.
        unsafe {
            ptr::copy_nonoverlapping(buf.as_ptr(), self.data.as_ptr().add(offset as usize), buf.len());
        }
        Ok(buf.len())
    }

    /// Write each slice with its own [`write`](Self::write).
    ///
    /// Not atomic across the vector: other writers may interleave between
    /// slices. Returns the bytes written before the first failure, or the
    /// failure itself if nothing was written.
    pub fn writev(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        let mut total = 0;
        for buf in bufs {
            match self.write(buf) {
                Ok(n) => total += n,
                Err(e) if total == 0 => return Err(e),
                Err(e) => {
                    debug!(written = total, error = %e, "writev stopped early");
                    break;
                }
            }
        }
        Ok(total)
    }

    /// The committed prefix of the log.
    ///
    /// The tail of the slice may still be under copy by a concurrent
    /// writer; see the module docs.
    pub fn as_readonly_buffer(&self) -> &[u8] {
        let base = self.data.as_ptr();
        let len = self.size() as usize;
        if base.is_null() || len == 0 {
            return &[];
        }
        // SAFETY: `len <= capacity`, the mapping lives as long as `self`,
        // and no byte below the committed size is reserved twice.
        unsafe { std::slice::from_raw_parts(base, len) }
    }

    /// Committed length in bytes, clamped to capacity.
    #[inline]
    pub fn size(&self) -> u64 {
        self.counter().load(Ordering::Acquire).min(self.capacity())
    }

    /// Size of the data mapping in bytes.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.data.size()
    }

    /// Issue residency hints over the window just past the committed size.
    ///
    /// Iterations 0 and 1 hint `low_refresh_pages` pages; later iterations
    /// hint `high_refresh_pages` pages and also ask the kernel to prefetch
    /// them. Read-only logs do nothing. All hints are best effort.
    pub fn maintain(&self, iteration: u64) {
        if self.config.readonly {
            return;
        }
        let _guard = self.maint.lock();

        let aggressive = iteration >= 2;
        let pages = if aggressive {
            self.config.high_refresh_pages
        } else {
            self.config.low_refresh_pages
        };
        let page = self.page as u64;
        let start = (self.size() / page) * page;
        let len = pages.saturating_mul(page);

        trace!(iteration, start, len, aggressive, "maintaining append log");

        if let Err(e) = self.data.advise(Advice::Sequential, start as usize, len as usize) {
            warn!(path = %self.path.display(), error = %e, "sequential advice failed");
        }
        if aggressive {
            if let Err(e) = self.data.advise(Advice::WillNeed, start as usize, len as usize) {
                warn!(path = %self.path.display(), error = %e, "willneed advice failed");
            }
        }
    }

    /// Flush the committed prefix and the counter to disk.
    pub fn flush(&self) -> Result<()> {
        self.data.sync(false)?;
        self.committed.region().sync(false)
    }

    /// Shut the log down, truncating the data file to the committed size.
    ///
    /// Unlike dropping, a failed truncation is returned rather than fatal.
    pub fn close(mut self) -> Result<()> {
        let res = self.truncate_to_committed();
        self.closed = true;
        res
    }

    fn truncate_to_committed(&self) -> Result<()> {
        if self.config.readonly {
            return Ok(());
        }
        let _guard = self.maint.lock();
        let size = self.size();
        self.data.ftruncate(size)?;
        debug!(path = %self.path.display(), size, "truncated append log");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.config.readonly
    }

    #[inline]
    fn counter(&self) -> &AtomicU64 {
        self.committed.get()
    }
}

impl Drop for AppendLog {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.truncate_to_committed() {
            error!(path = %self.path.display(), error = %e, "append log truncation failed");
            panic!("append log {} left at reserved size: {e}", self.path.display());
        }
    }
}

impl TimerListener for AppendLog {
    fn on_timer(&self, iteration: u64) {
        self.maintain(iteration);
    }
}

impl std::fmt::Debug for AppendLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendLog")
            .field("path", &self.path)
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .field("readonly", &self.config.readonly)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn small() -> LogConfig {
        LogConfig::default().with_capacity(1 << 20)
    }

    #[test]
    fn test_offset_path_appends_suffix() {
        assert_eq!(offset_path(Path::new("/tmp/orders.log")), PathBuf::from("/tmp/orders.log.offset"));
    }

    #[test]
    fn test_three_writes_commit_and_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.log");

        let log = AppendLog::open(&path, &small()).unwrap();
        assert_eq!(log.capacity(), 1 << 20);
        assert_eq!(log.write(&[b'A'; 10]).unwrap(), 10);
        assert_eq!(log.write(&[b'B'; 20]).unwrap(), 20);
        assert_eq!(log.write(&[b'C'; 15]).unwrap(), 15);
        assert_eq!(log.size(), 45);

        let buf = log.as_readonly_buffer();
        assert_eq!(&buf[..10], &[b'A'; 10]);
        assert_eq!(&buf[10..30], &[b'B'; 20]);
        assert_eq!(&buf[30..45], &[b'C'; 15]);

        log.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 45);
        assert_eq!(std::fs::metadata(offset_path(&path)).unwrap().len(), 8);
    }

    #[test]
    fn test_drop_truncates_to_committed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drop.log");
        {
            let log = AppendLog::open(&path, &small()).unwrap();
            assert_eq!(std::fs::metadata(&path).unwrap().len(), 1 << 20);
            log.write(b"hello").unwrap();
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_empty_write_reserves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log = AppendLog::open(dir.path().join("empty.log"), &small()).unwrap();
        assert_eq!(log.write(&[]).unwrap(), 0);
        assert_eq!(log.size(), 0);
        assert!(log.as_readonly_buffer().is_empty());
    }

    #[test]
    fn test_capacity_enforced_and_prefix_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("full.log");
        let log = AppendLog::open(&path, &LogConfig::default().with_capacity(100)).unwrap();

        log.write(&[7u8; 90]).unwrap();
        let err = log.write(&[9u8; 20]).unwrap_err();
        assert!(matches!(err, Error::SpaceExhausted { offset: 90, len: 20, capacity: 100 }));
        assert!(err.is_recoverable());

        // The counter has moved past capacity; readers see a clamped size.
        assert_eq!(log.size(), 100);
        assert_eq!(&log.as_readonly_buffer()[..90], &[7u8; 90][..]);
        assert!(log.as_readonly_buffer()[90..].iter().all(|&b| b == 0));

        // A later write that would have fitted before the failure no longer does.
        assert!(matches!(log.write(&[1u8; 5]), Err(Error::SpaceExhausted { offset: 110, .. })));

        log.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);
    }

    #[test]
    fn test_exact_fit_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let log = AppendLog::open(dir.path().join("exact.log"), &LogConfig::default().with_capacity(64)).unwrap();
        assert_eq!(log.write(&[1u8; 64]).unwrap(), 64);
        assert_eq!(log.size(), 64);
    }

    #[test]
    fn test_writev_reports_partial_progress() {
        let dir = tempfile::tempdir().unwrap();
        let log = AppendLog::open(dir.path().join("vec.log"), &LogConfig::default().with_capacity(32)).unwrap();

        let a = [1u8; 10];
        let b = [2u8; 10];
        let c = [3u8; 20];
        let n = log.writev(&[IoSlice::new(&a), IoSlice::new(&b), IoSlice::new(&c)]).unwrap();
        assert_eq!(n, 20);

        let err = log.writev(&[IoSlice::new(&a)]).unwrap_err();
        assert!(matches!(err, Error::SpaceExhausted { .. }));
    }

    #[test]
    fn test_readonly_rejects_writes_and_skips_maintenance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.log");
        {
            let log = AppendLog::open(&path, &small()).unwrap();
            log.write(b"committed").unwrap();
        }

        let reader = AppendLog::open(&path, &LogConfig::reader()).unwrap();
        assert!(reader.is_readonly());
        assert_eq!(reader.capacity(), 9);
        assert_eq!(reader.as_readonly_buffer(), b"committed");
        assert!(matches!(reader.write(b"x"), Err(Error::ReadOnly)));
        reader.maintain(5);
        drop(reader);

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 9);
    }

    #[test]
    fn test_readonly_missing_log_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppendLog::open(dir.path().join("absent.log"), &LogConfig::reader()).unwrap_err();
        assert!(matches!(err, Error::Construction { .. }));
    }

    #[test]
    fn test_reopen_continues_at_committed_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.log");
        {
            let log = AppendLog::open(&path, &small()).unwrap();
            log.write(b"first,").unwrap();
        }
        {
            let log = AppendLog::open(&path, &small()).unwrap();
            assert_eq!(log.size(), 6);
            log.write(b"second").unwrap();
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"first,second");
    }

    #[test]
    fn test_live_reader_sees_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.log");
        let writer = AppendLog::open(&path, &small()).unwrap();
        let reader = AppendLog::open(&path, &LogConfig::reader()).unwrap();

        assert_eq!(reader.size(), 0);
        writer.write(b"tick").unwrap();
        assert_eq!(reader.as_readonly_buffer(), b"tick");

        drop(reader);
        writer.close().unwrap();
    }

    #[test]
    fn test_maintain_all_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let log = AppendLog::open(dir.path().join("maint.log"), &small().with_refresh_pages(1, 4)).unwrap();
        log.write(&[5u8; 5000]).unwrap();
        for iteration in 0..4 {
            log.on_timer(iteration);
        }
        assert_eq!(log.size(), 5000);
    }

    #[test]
    fn test_concurrent_writers_partition_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(AppendLog::open(dir.path().join("mt.log"), &small()).unwrap());

        let handles: Vec<_> = (0..4u8)
            .map(|id| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for _ in 0..250 {
                        log.write(&[id + 1; 16]).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(log.size(), 4 * 250 * 16);
        let buf = log.as_readonly_buffer();
        let mut counts = [0usize; 5];
        for chunk in buf.chunks(16) {
            assert!(chunk.iter().all(|&b| b == chunk[0]), "torn write");
            counts[chunk[0] as usize] += 1;
        }
        assert_eq!(&counts[1..], &[250; 4]);
    }
}
