//! In-memory write buffers.
//!
//! A memtable accumulates writes between two commit-log positions: it only
//! accepts operations at or past the position it was created at, and once a
//! switch barrier is installed it stops accepting writer groups that started
//! after the switch. The accumulator is a concurrent skip list so readers
//! and writers never block each other.

use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use crossbeam_skiplist::SkipMap;
use serde::{Deserialize, Serialize};

/// A position in the commit log, ordered by segment then offset.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CommitLogPosition {
    pub segment: u64,
    pub offset: u64,
}

impl CommitLogPosition {
    pub fn new(segment: u64, offset: u64) -> Self {
        Self { segment, offset }
    }
}

impl Display for CommitLogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

/// Opaque ordering token for a group of writes. Groups are numbered
/// monotonically by the write path; a memtable's switch barrier excludes
/// groups that started after the switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct OpGroup(pub u64);

/// An in-memory write buffer with a monotonically assigned generation.
pub struct Memtable {
    generation: u64,
    min_position: CommitLogPosition,
    switch_barrier: OnceLock<u64>,
    data: SkipMap<Vec<u8>, Vec<u8>>,
    live_bytes: AtomicUsize,
}

impl Memtable {
    /// Create a buffer accepting writes ordered at or after `min_position`.
    pub fn new(generation: u64, min_position: CommitLogPosition) -> Self {
        Self {
            generation,
            min_position,
            switch_barrier: OnceLock::new(),
            data: SkipMap::new(),
            live_bytes: AtomicUsize::new(0),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Commit-log position marking this buffer's minimum accepted write.
    pub fn min_position(&self) -> CommitLogPosition {
        self.min_position
    }

    /// True iff this buffer is willing to receive a write from `group`
    /// ordered at `position`.
    pub fn accepts(&self, group: OpGroup, position: CommitLogPosition) -> bool {
        if position < self.min_position {
            return false;
        }
        self.switch_barrier.get().map_or(true, |barrier| group.0 < *barrier)
    }

    /// Installs the switch barrier: groups numbered at or past `first_excluded`
    /// are turned away. Set exactly once, at switch time; returns false if a
    /// barrier was already installed.
    pub fn set_switch_barrier(&self, first_excluded: u64) -> bool {
        self.switch_barrier.set(first_excluded).is_ok()
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        self.live_bytes
            .fetch_add(key.len() + value.len(), Ordering::Relaxed);
        self.data.insert(key, value);
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }
}

impl PartialEq for Memtable {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation
    }
}

impl Eq for Memtable {}

impl Hash for Memtable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.generation.hash(state);
    }
}

impl Display for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "memtable-{}", self.generation)
    }
}

impl std::fmt::Debug for Memtable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Memtable")
            .field("generation", &self.generation)
            .field("min_position", &self.min_position)
            .field("live_bytes", &self.live_bytes())
            .finish()
    }
}
