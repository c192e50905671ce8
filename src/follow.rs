//! Follow Task - Continuous tail of a live log on a background thread.
//!
//! The thread polls its stream: it decodes one record at a time until
//! nothing more is published, then sleeps for the poll interval. It stops
//! when asked to, or when the stream reports corruption. Every record that
//! reached the listeners is counted, including those before a corrupt one.

use crate::config::FollowConfig;
use crate::error::Error;
use crate::listener::CsvSink;
use crate::stream::{Progress, RecordSource, RecordStream};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Consecutive idle polls stuck on an incomplete record before warning.
const PENDING_WARN_POLLS: u32 = 100;

/// What a follow thread hands back when it stops.
pub struct FollowSummary<S: RecordSource> {
    /// The stream, positioned after the last record delivered.
    pub stream: RecordStream<S>,
    /// Records delivered by this task.
    pub records: u64,
    /// Set if the thread stopped on corruption.
    pub error: Option<Error>,
}

/// A background thread tailing a [`RecordStream`].
pub struct FollowTask<S: RecordSource + Send + 'static> {
    stop: Arc<AtomicBool>,
    records: Arc<AtomicU64>,
    handle: Option<JoinHandle<FollowSummary<S>>>,
}

impl<S: RecordSource + Send + 'static> FollowTask<S> {
    /// Start tailing `stream` with the listeners already registered on it.
    pub fn spawn(stream: RecordStream<S>, config: FollowConfig) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let records = Arc::new(AtomicU64::new(0));

        let flag = Arc::clone(&stop);
        let seen = Arc::clone(&records);
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || follow(stream, &config, &flag, &seen))?;

        Ok(Self { stop, records, handle: Some(handle) })
    }

    /// Start tailing `stream`, writing every record as CSV to `out`.
    pub fn spawn_with_output<W>(
        mut stream: RecordStream<S>,
        out: W,
        config: FollowConfig,
    ) -> std::io::Result<Self>
    where
        W: Write + Send + 'static,
    {
        stream.register_listener(CsvSink::new(out));
        Self::spawn(stream, config)
    }

    /// Records delivered so far.
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    /// True once the thread has exited (stopped or hit corruption).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Ask the thread to stop after its current step, then join it.
    ///
    /// A panic on the follow thread is resumed on the caller.
    pub fn stop(mut self) -> FollowSummary<S> {
        self.stop.store(true, Ordering::Release);
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => unreachable!("follow task joined twice"),
        };
        handle.thread().unpark();
        match handle.join() {
            Ok(summary) => summary,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl<S: RecordSource + Send + 'static> Drop for FollowTask<S> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("follow thread panicked");
            }
        }
    }
}

fn pin_to_last_core() {
    match core_affinity::get_core_ids().and_then(|ids| ids.last().copied()) {
        Some(core) if core_affinity::set_for_current(core) => {
            debug!(core = core.id, "follow thread pinned")
        }
        _ => warn!("could not pin follow thread"),
    }
}

fn follow<S: RecordSource>(
    mut stream: RecordStream<S>,
    config: &FollowConfig,
    stop: &AtomicBool,
    seen: &AtomicU64,
) -> FollowSummary<S> {
    if config.pin_to_core {
        pin_to_last_core();
    }
    info!(position = stream.position(), "follow started");

    let mut records = 0u64;
    // Delivered since listeners last heard `on_caught_up`.
    let mut unannounced = 0u64;
    let mut stuck_polls = 0u32;
    let mut error = None;

    while !stop.load(Ordering::Acquire) {
        match stream.next() {
            Ok(Progress::Record(_)) => {
                records += 1;
                unannounced += 1;
                seen.fetch_add(1, Ordering::Relaxed);
                stuck_polls = 0;
            }
            Ok(progress) => {
                if unannounced > 0 {
                    stream.notify_caught_up();
                    unannounced = 0;
                }
                if progress == Progress::End {
                    stuck_polls = 0;
                } else {
                    stuck_polls += 1;
                    if stuck_polls == PENDING_WARN_POLLS {
                        warn!(position = stream.position(), "tail record still incomplete");
                    }
                }
                thread::park_timeout(config.poll_interval);
            }
            Err(e) => {
                error!(position = stream.position(), error = %e, "follow stopped on corrupt log");
                error = Some(e);
                break;
            }
        }
    }

    if unannounced > 0 {
        stream.notify_caught_up();
    }
    info!(records, position = stream.position(), "follow stopped");
    FollowSummary { stream, records, error }
}
