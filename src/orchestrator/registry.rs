// =============================================================================
// Instance Registry - the single source of truth for "is this key active"
// =============================================================================
//
// Keyed map of instance key -> control handle, safe to use from any thread.
// An entry is inserted, under the write lock, before its thread has finished
// initialising, so a second start for the same key always sees it.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ControlError;
use crate::types::{now_ms, InstanceKey, InstanceState, Side};

/// Live figures an instance reports after every closed bar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct InstanceStats {
    pub buffered_bars: usize,
    /// Open time of the newest buffered bar.
    pub last_bar_time: Option<i64>,
    pub capital: f64,
    pub open_position: Option<Side>,
    pub closed_trades: usize,
}

/// What an instance thread receives to report its state and observe stop
/// requests.
#[derive(Clone)]
pub struct InstanceHandle {
    pub cancel: CancellationToken,
    pub state: Arc<RwLock<InstanceState>>,
    pub stats: Arc<RwLock<InstanceStats>>,
}

impl InstanceHandle {
    pub fn set_state(&self, state: InstanceState) {
        *self.state.write() = state;
    }

    pub fn record_stats(&self, stats: InstanceStats) {
        *self.stats.write() = stats;
    }

    /// Starting -> Running. A stop that already began is left in place.
    pub fn mark_running(&self) {
        let mut state = self.state.write();
        if *state == InstanceState::Starting {
            *state = InstanceState::Running;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStatus {
    pub key: InstanceKey,
    pub state: InstanceState,
    pub started_at: i64,
    pub stats: InstanceStats,
}

struct Entry {
    handle: InstanceHandle,
    thread: Option<JoinHandle<()>>,
    started_at: i64,
}

impl Entry {
    /// The thread ended without a stop request (runtime failure or panic).
    fn is_dead(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| t.is_finished())
            && *self.handle.state.read() != InstanceState::Stopping
    }

    fn status(&self, key: &InstanceKey) -> InstanceStatus {
        InstanceStatus {
            key: key.clone(),
            state: *self.handle.state.read(),
            started_at: self.started_at,
            stats: *self.handle.stats.read(),
        }
    }
}

#[derive(Default)]
pub struct InstanceRegistry {
    entries: RwLock<HashMap<InstanceKey, Entry>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` and start its thread with `spawn`.
    ///
    /// Rejects with [`ControlError::AlreadyRunning`] while an entry for the
    /// key is live in any state. A dead entry is replaced.
    pub fn register<F>(&self, key: InstanceKey, spawn: F) -> Result<(), ControlError>
    where
        F: FnOnce(InstanceHandle) -> std::io::Result<JoinHandle<()>>,
    {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&key) {
            if !existing.is_dead() {
                return Err(ControlError::AlreadyRunning(key));
            }
            warn!(instance = %key, "replacing instance whose thread exited on its own");
            entries.remove(&key);
        }

        let handle = InstanceHandle {
            cancel: CancellationToken::new(),
            state: Arc::new(RwLock::new(InstanceState::Starting)),
            stats: Arc::default(),
        };
        let thread = spawn(handle.clone())?;
        entries.insert(
            key.clone(),
            Entry {
                handle,
                thread: Some(thread),
                started_at: now_ms(),
            },
        );
        debug!(instance = %key, "instance registered");
        Ok(())
    }

    /// Mark `key` as stopping, signal cancellation and hand back its thread
    /// for joining. The entry stays registered until [`remove`](Self::remove).
    pub fn begin_stop(&self, key: &InstanceKey) -> Result<Option<JoinHandle<()>>, ControlError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| ControlError::NotRunning(key.clone()))?;
        if *entry.handle.state.read() == InstanceState::Stopping {
            return Err(ControlError::NotRunning(key.clone()));
        }
        entry.handle.set_state(InstanceState::Stopping);
        entry.handle.cancel.cancel();
        Ok(entry.thread.take())
    }

    pub fn remove(&self, key: &InstanceKey) {
        if let Some(entry) = self.entries.write().remove(key) {
            entry.handle.set_state(InstanceState::Stopped);
        }
    }

    pub fn status(&self, key: &InstanceKey) -> Option<InstanceStatus> {
        self.entries.read().get(key).map(|entry| entry.status(key))
    }

    pub fn keys(&self) -> Vec<InstanceKey> {
        self.entries.read().keys().cloned().collect()
    }

    /// Snapshot of every registered instance, ordered by key.
    pub fn list(&self) -> Vec<InstanceStatus> {
        let mut all: Vec<InstanceStatus> = self
            .entries
            .read()
            .iter()
            .map(|(key, entry)| entry.status(key))
            .collect();
        all.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));
        all
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
