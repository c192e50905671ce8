//! # Flash-Log
//!
//! A lock-free, memory-mapped order-event log for a trading engine.
//!
//! ## Design Principles
//!
//! - **Lock-Free Appends**: Writers claim disjoint ranges with one atomic add
//! - **Reserved Address Space**: The log maps its whole capacity up front
//! - **Poll, Don't Block**: Readers tolerate a tail that is still being written
//! - **Double-Mapped Rings**: Wraparound never splits a copy
//!
//! ## Architecture
//!
//! ```text
//! [Writer Threads] --write()--> [AppendLog: <path> + <path>.offset]
//!                                      |
//!                          as_readonly_buffer()
//!                                      |
//!                    [RecordStream] --> [ReplayListeners]
//!                          ^
//!                   [FollowTask thread]
//!
//! [Producer] --> [RingBuffer (double-mapped)] --> [Consumer]
//! ```

pub mod append_log;
pub mod config;
pub mod error;
pub mod follow;
pub mod listener;
pub mod record;
pub mod region;
pub mod registry;
pub mod ring;
pub mod stream;
pub mod timer;

// Re-exports for convenience
pub use append_log::{offset_path, AppendLog};
pub use config::{FollowConfig, LogConfig, RingConfig};
pub use error::{Error, Result};
pub use follow::{FollowSummary, FollowTask};
pub use listener::{BoxedListener, CsvSink, KindCounts, ReplayListener};
pub use record::{encode_record, encode_session_data, Record, RecordHeader, RecordKind};
pub use region::{RegionMapper, TypedScalarRegion};
pub use registry::LogRegistry;
pub use ring::RingBuffer;
pub use stream::{decode, Decoded, FileRecordStream, Progress, RecordSource, RecordStream};
pub use timer::{MaintenanceTimer, TimerListener};

#[cfg(feature = "runtime")]
pub use listener::{ChannelSink, ReplayEvent};
