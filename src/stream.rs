//! Record Stream - Pull-based replay over a buffer that may still be growing.
//!
//! The stream keeps a cursor into a [`RecordSource`] and decodes one record
//! per [`RecordStream::next`] call, handing it to every registered
//! listener. A record that is only partly visible (the writer has reserved
//! it but not finished copying) leaves the cursor where it is, so the same
//! record is retried on the next poll.

use crate::append_log::AppendLog;
use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::listener::{BoxedListener, ReplayListener};
use crate::record::{Record, RecordHeader, RecordKind, HEADER_LEN};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Anything exposing a (possibly growing) byte buffer of records.
pub trait RecordSource {
    /// The bytes currently available, starting at record zero.
    fn buffer(&self) -> &[u8];
}

impl RecordSource for AppendLog {
    #[inline]
    fn buffer(&self) -> &[u8] {
        self.as_readonly_buffer()
    }
}

impl RecordSource for Arc<AppendLog> {
    #[inline]
    fn buffer(&self) -> &[u8] {
        self.as_readonly_buffer()
    }
}

impl RecordSource for Vec<u8> {
    #[inline]
    fn buffer(&self) -> &[u8] {
        self
    }
}

impl RecordSource for &[u8] {
    #[inline]
    fn buffer(&self) -> &[u8] {
        self
    }
}

/// Outcome of decoding at one position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// One record of this many bytes was decoded and dispatched.
    Record(usize),
    /// Fewer bytes than a header, or a header not yet published.
    HeaderIncomplete,
    /// The header declares more body than is available.
    BodyIncomplete,
}

/// Decode the record at the front of `buf` and dispatch it to `listeners`.
///
/// `offset` is the position of `buf` in the stream, used in error reports.
/// A known kind whose body is too short is only corrupt once `buf` is long
/// enough to hold a whole record of that kind; before that the header may
/// still be landing and the record is reported incomplete.
///
/// # Errors
/// [`Error::StreamCorruption`] if the bytes cannot be a record: a known
/// kind whose body is shorter than its fixed size.
pub fn decode(buf: &[u8], offset: u64, listeners: &mut [BoxedListener]) -> Result<Decoded> {
    let header = match RecordHeader::parse(buf) {
        Some(h) => h,
        None => return Ok(Decoded::HeaderIncomplete),
    };
    // Reserved but not yet copied: the sparse file still reads as zeros.
    if header.kind == RecordKind::Unknown as u8 {
        return Ok(Decoded::HeaderIncomplete);
    }

    let len = header.record_len();
    if len > buf.len() {
        return Ok(Decoded::BodyIncomplete);
    }

    let body = &buf[HEADER_LEN..len];
    let record = match Record::parse(header.kind, body) {
        Some(record) => record,
        None => {
            let kind = RecordKind::from_u8(header.kind).unwrap_or(RecordKind::Unknown);
            if HEADER_LEN + kind.min_body_len() > buf.len() {
                trace!(offset, %kind, body_len = body.len(), "short body at the tail");
                return Ok(Decoded::BodyIncomplete);
            }
            return Err(Error::StreamCorruption {
                offset,
                reason: format!(
                    "{kind} body is {} bytes, need at least {}",
                    body.len(),
                    kind.min_body_len()
                ),
            });
        }
    };

    for listener in listeners.iter_mut() {
        listener.on_record(header.timestamp, &record);
    }
    Ok(Decoded::Record(len))
}

/// Result of one [`RecordStream::next`] step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// A record of this many bytes was consumed.
    Record(usize),
    /// The next record is not fully published yet; retry later.
    Pending,
    /// The cursor is at the live end of the buffer.
    End,
}

/// A replay cursor over a [`RecordSource`].
pub struct RecordStream<S: RecordSource> {
    source: S,
    listeners: Vec<BoxedListener>,
    /// Base address and length of the buffer at the last sample.
    base: usize,
    len: usize,
    pos: usize,
    poisoned: bool,
}

/// A stream over a log opened read-only.
pub type FileRecordStream = RecordStream<Arc<AppendLog>>;

impl RecordStream<Arc<AppendLog>> {
    /// Open the log at `path` for reading and start at its first record.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let log = AppendLog::open(path, &LogConfig::reader())?;
        Ok(Self::new(Arc::new(log)))
    }
}

impl<S: RecordSource> RecordStream<S> {
    pub fn new(source: S) -> Self {
        let mut stream = Self {
            source,
            listeners: Vec::new(),
            base: 0,
            len: 0,
            pos: 0,
            poisoned: false,
        };
        stream.rewind();
        stream
    }

    pub fn register_listener<L>(&mut self, listener: L)
    where
        L: ReplayListener + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn register_listeners(&mut self, listeners: impl IntoIterator<Item = BoxedListener>) {
        self.listeners.extend(listeners);
    }

    /// Move the cursor back to the first record and re-sample the buffer.
    ///
    /// Also clears a previous corruption, so the next pass starts fresh.
    pub fn rewind(&mut self) {
        let buf = self.source.buffer();
        self.base = buf.as_ptr() as usize;
        self.len = buf.len();
        self.pos = 0;
        self.poisoned = false;
    }

    /// True when there is nothing more to read right now.
    ///
    /// Re-samples the buffer on every call. Also true, and logged, if the
    /// buffer moved or shrank since the last sample, or after corruption.
    pub fn at_end(&mut self) -> bool {
        if self.poisoned {
            return true;
        }

        let buf = self.source.buffer();
        let base = buf.as_ptr() as usize;
        let len = buf.len();

        // An empty buffer has no meaningful address; adopt the first real one.
        if self.len > 0 && len > 0 && base != self.base {
            warn!(position = self.pos, "record buffer start address changed");
            return true;
        }
        if len < self.len {
            warn!(position = self.pos, was = self.len, now = len, "record buffer shrank");
            return true;
        }

        if len > 0 {
            self.base = base;
        }
        self.len = len;
        self.pos >= self.len
    }

    /// Decode and dispatch exactly one record.
    ///
    /// # Errors
    /// [`Error::StreamCorruption`]; the stream is then poisoned and reports
    /// [`Progress::End`] until rewound.
    pub fn next(&mut self) -> Result<Progress> {
        if self.at_end() {
            return Ok(Progress::End);
        }

        let buf = &self.source.buffer()[self.pos..self.len];
        match decode(buf, self.pos as u64, &mut self.listeners) {
            Ok(Decoded::Record(n)) => {
                self.pos += n;
                Ok(Progress::Record(n))
            }
            Ok(incomplete) => {
                trace!(position = self.pos, ?incomplete, "record not yet published");
                Ok(Progress::Pending)
            }
            Err(e) => {
                error!(position = self.pos, error = %e, "record stream corrupt");
                self.poisoned = true;
                Err(e)
            }
        }
    }

    /// Decode records until the end of what is published. Returns how many
    /// were decoded.
    ///
    /// Listeners hear [`ReplayListener::on_caught_up`] if anything was
    /// delivered, also when the pass ends on corruption.
    pub fn catch_up(&mut self) -> Result<usize> {
        let mut records = 0;
        let outcome = loop {
            match self.next() {
                Ok(Progress::Record(_)) => records += 1,
                Ok(_) => break Ok(records),
                Err(e) => break Err(e),
            }
        };
        if records > 0 {
            self.notify_caught_up();
        }
        outcome
    }

    /// Tell every listener the stream has delivered all it can for now.
    pub fn notify_caught_up(&mut self) {
        for listener in self.listeners.iter_mut() {
            listener.on_caught_up();
        }
    }

    /// Rewind, then decode everything published.
    ///
    /// Stops at an incomplete tail instead of waiting for it.
    pub fn replay(&mut self) -> Result<usize> {
        self.rewind();
        self.catch_up()
    }

    /// Byte offset of the next record to decode.
    #[inline]
    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    #[inline]
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }
}

impl<S: RecordSource> std::fmt::Debug for RecordStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStream")
            .field("position", &self.pos)
            .field("sampled_len", &self.len)
            .field("listeners", &self.listeners.len())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}
