//! Tunables for logs, rings and follow threads.
//!
//! Loading these from files is the host engine's job; every struct here
//! deserializes with serde defaults so it can be embedded in a larger config.

use serde::Deserialize;
use std::time::Duration;

/// Default reserved window for a log: 1 TiB of virtual address space.
pub const DEFAULT_LOG_CAPACITY: u64 = 1 << 40;

/// Maintenance window for the first iterations, in pages (16 MiB at 4 KiB).
pub const LOW_REFRESH_PAGES: u64 = 4 * 1024;

/// Aggressive maintenance window, in pages (64 MiB at 4 KiB).
pub const HIGH_REFRESH_PAGES: u64 = 16 * 1024;

/// Default ring order: 2^27 = 128 MiB.
pub const DEFAULT_RING_ORDER: u8 = 27;

/// Configuration for [`AppendLog`](crate::AppendLog).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Size of the reserved data window in bytes.
    pub capacity: u64,
    /// Open the log for reading only.
    pub readonly: bool,
    /// Issue a sequential-access hint over the whole window on open.
    pub advise_sequential: bool,
    /// Window hinted by `maintain` on iterations 0 and 1.
    pub low_refresh_pages: u64,
    /// Window hinted by `maintain` from iteration 2 on.
    pub high_refresh_pages: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LOG_CAPACITY,
            readonly: false,
            advise_sequential: true,
            low_refresh_pages: LOW_REFRESH_PAGES,
            high_refresh_pages: HIGH_REFRESH_PAGES,
        }
    }
}

impl LogConfig {
    /// Config for a reader of an existing log.
    pub fn reader() -> Self {
        Self { readonly: true, ..Self::default() }
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn with_refresh_pages(mut self, low: u64, high: u64) -> Self {
        self.low_refresh_pages = low;
        self.high_refresh_pages = high;
        self
    }
}

/// Configuration for [`RingBuffer`](crate::RingBuffer).
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RingConfig {
    /// Capacity is `2^order` bytes.
    pub order: u8,
    /// Byte offset of the ring inside its backing file.
    pub offset: u64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self { order: DEFAULT_RING_ORDER, offset: 0 }
    }
}

/// Configuration for [`FollowTask`](crate::FollowTask).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FollowConfig {
    /// Sleep between polls when the log has nothing new.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Pin the follow thread to the last available core.
    pub pin_to_core: bool,
    /// Name given to the spawned thread.
    pub thread_name: String,
}

impl Default for FollowConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            pin_to_core: false,
            thread_name: "log-follow".to_string(),
        }
    }
}

impl FollowConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_pin_to_core(mut self, pin: bool) -> Self {
        self.pin_to_core = pin;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
