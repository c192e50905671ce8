//! Error types for the log, the ring and the replay decoder.
//!
//! Incomplete records are not errors: the decoder reports them through
//! [`Decoded`](crate::stream::Decoded) so readers can poll again later.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Opening, stat'ing or sizing a backing file failed.
    #[error("failed to open {path}: {source}")]
    Construction {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// `mmap` of an opened file failed.
    #[error("failed to map {path}: {source}")]
    Map {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The region already has a live mapping.
    #[error("region is already mapped")]
    AlreadyMapped,

    /// The region is not mapped (or was closed).
    #[error("region is not mapped")]
    NotMapped,

    /// A write was attempted on a log opened read-only.
    #[error("log is read-only")]
    ReadOnly,

    /// The reservation `[offset, offset + len)` does not fit.
    ///
    /// The committed counter has already moved past `offset` when this is
    /// returned.
    #[error("space exhausted: reservation at {offset} of {len} bytes exceeds capacity {capacity}")]
    SpaceExhausted { offset: u64, len: u64, capacity: u64 },

    /// Resizing the backing file failed.
    #[error("failed to truncate {path}: {source}")]
    Truncate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// `msync` failed.
    #[error("failed to sync mapping: {source}")]
    Sync {
        #[source]
        source: io::Error,
    },

    /// The record stream contains bytes that cannot be a record.
    #[error("stream corruption at offset {offset}: {reason}")]
    StreamCorruption { offset: u64, reason: String },

    /// Invalid ring buffer geometry.
    #[error("invalid ring buffer: {reason}")]
    Ring { reason: String },

    /// Reserving or overlaying the ring window failed.
    #[error("failed to map ring buffer: {source}")]
    RingMap {
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Returns true if the error only concerns the reader that hit it.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::StreamCorruption { .. })
    }

    /// Returns true if the caller may keep using the component.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::SpaceExhausted { .. } | Error::ReadOnly)
    }
}
