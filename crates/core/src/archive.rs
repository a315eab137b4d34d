//! Time- and size-bounded archive of transient server-side results.
//!
//! Query/retrieve cursors and in-progress export buffers live here between
//! requests, keyed by an opaque handle. Entries are disposable by design:
//! eviction is driven by capacity and age, never by content correctness, and
//! losing an entry must never corrupt persisted state. Callers treat a
//! missing handle as a normal outcome.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Opaque handle naming an archived value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ArchiveHandle(String);

impl ArchiveHandle {
    fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wraps an externally supplied handle string (e.g. parsed from a URL).
    pub fn from_string(handle: String) -> Self {
        Self(handle)
    }
}

impl std::fmt::Display for ArchiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

struct Entry<T> {
    value: Arc<T>,
    created_at: Instant,
}

struct ArchiveState<T> {
    entries: HashMap<ArchiveHandle, Entry<T>>,
    /// Oldest handle at the front.
    order: VecDeque<ArchiveHandle>,
}

/// Bounded handle → value map with FIFO capacity eviction and an age bound.
pub struct SharedArchive<T> {
    capacity: usize,
    max_age: Duration,
    state: Mutex<ArchiveState<T>>,
}

impl<T> SharedArchive<T> {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            max_age,
            state: Mutex::new(ArchiveState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Stores a value and returns its handle. The oldest entries are evicted
    /// first when the archive is at capacity.
    pub fn add(&self, value: T) -> ArchiveHandle {
        let mut state = self.lock();
        Self::sweep_expired(&mut state, self.max_age);

        let handle = ArchiveHandle::new();
        state.entries.insert(
            handle.clone(),
            Entry {
                value: Arc::new(value),
                created_at: Instant::now(),
            },
        );
        state.order.push_back(handle.clone());

        while state.entries.len() > self.capacity {
            match state.order.pop_front() {
                Some(oldest) => {
                    state.entries.remove(&oldest);
                }
                None => break,
            }
        }

        handle
    }

    /// Looks a value up. `None` is an expected outcome: the entry may have
    /// been evicted at any time.
    pub fn get(&self, handle: &ArchiveHandle) -> Option<Arc<T>> {
        let mut state = self.lock();
        Self::sweep_expired(&mut state, self.max_age);
        state.entries.get(handle).map(|entry| entry.value.clone())
    }

    /// Removes a value. Removing an absent handle is a no-op.
    pub fn remove(&self, handle: &ArchiveHandle) {
        let mut state = self.lock();
        if state.entries.remove(handle).is_some() {
            if let Some(pos) = state.order.iter().position(|h| h == handle) {
                state.order.remove(pos);
            }
        }
    }

    pub fn len(&self) -> usize {
        let mut state = self.lock();
        Self::sweep_expired(&mut state, self.max_age);
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep_expired(state: &mut ArchiveState<T>, max_age: Duration) {
        while let Some(front) = state.order.front() {
            let expired = state
                .entries
                .get(front)
                .map(|entry| entry.created_at.elapsed() >= max_age)
                .unwrap_or(true);
            if !expired {
                break;
            }
            if let Some(front) = state.order.pop_front() {
                state.entries.remove(&front);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ArchiveState<T>> {
        // Archive contents are disposable; a poisoned lock is recovered
        // rather than escalated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> std::fmt::Debug for SharedArchive<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedArchive")
            .field("capacity", &self.capacity)
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}
