//! Periodic maintenance driver.
//!
//! The host engine's event loop normally owns the timer and calls
//! [`TimerListener::on_timer`] itself. [`MaintenanceTimer`] is a minimal
//! stand-in for processes without such a loop (tools, tests, replayers).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Receiver of periodic timer ticks.
///
/// `iteration` counts ticks from 0 for the lifetime of the timer.
pub trait TimerListener: Send + Sync {
    fn on_timer(&self, iteration: u64);
}

impl<T: TimerListener + ?Sized> TimerListener for Arc<T> {
    fn on_timer(&self, iteration: u64) {
        (**self).on_timer(iteration)
    }
}

/// A background thread ticking a [`TimerListener`] at a fixed period.
///
/// Stopping is cooperative: the flag is checked between ticks, never during
/// one. Dropping the timer stops and joins it.
pub struct MaintenanceTimer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<u64>>,
}

impl MaintenanceTimer {
    /// Start ticking `listener` every `period`. The first tick fires
    /// immediately.
    pub fn spawn<L>(listener: L, period: Duration) -> std::io::Result<Self>
    where
        L: TimerListener + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("log-maintenance".to_string())
            .spawn(move || {
                let mut iteration = 0u64;
                while !flag.load(Ordering::Acquire) {
                    listener.on_timer(iteration);
                    iteration += 1;
                    thread::park_timeout(period);
                }
                iteration
            })?;

        debug!(?period, "maintenance timer started");
        Ok(Self { stop, handle: Some(handle) })
    }

    /// Stop the timer and return how many ticks fired.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        self.stop.store(true, Ordering::Release);
        match self.handle.take() {
            Some(handle) => {
                handle.thread().unpark();
                handle.join().unwrap_or_else(|_| {
                    warn!("maintenance timer thread panicked");
                    0
                })
            }
            None => 0,
        }
    }
}

impl Drop for MaintenanceTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
