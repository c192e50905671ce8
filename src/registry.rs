//! Named logs shared across an engine.
//!
//! The registry is an ordinary value: create one at startup and hand it to
//! whatever needs to look logs up by name.

use crate::append_log::AppendLog;
use crate::timer::TimerListener;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
pub struct LogRegistry {
    logs: RwLock<FxHashMap<String, Arc<AppendLog>>>,
}

impl LogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `log` under `name`, returning the log it replaced.
    pub fn insert(&self, name: impl Into<String>, log: Arc<AppendLog>) -> Option<Arc<AppendLog>> {
        let name = name.into();
        debug!(%name, path = %log.path().display(), "registered log");
        self.logs.write().insert(name, log)
    }

    pub fn get(&self, name: &str) -> Option<Arc<AppendLog>> {
        self.logs.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<AppendLog>> {
        self.logs.write().remove(name)
    }

    pub fn len(&self) -> usize {
        self.logs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.read().is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.logs.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

/// Maintains every registered log on each tick.
impl TimerListener for LogRegistry {
    fn on_timer(&self, iteration: u64) {
        let logs: Vec<_> = self.logs.read().values().cloned().collect();
        for log in logs {
            log.maintain(iteration);
        }
    }
}
