//! The immutable, point-in-time snapshot of a table's live data.
//!
//! A view is a pure value: every mutation constructs a new instance via one
//! of the transform constructors below, and the tracker swaps whole views
//! atomically. Readers sample the current view once and then operate on it
//! without further coordination.

use std::collections::HashSet;
use std::sync::Arc;

use crate::dht::Token;
use crate::error::{Error, Result};
use crate::memtable::Memtable;
use crate::sstable::SSTableReader;

/// Spatial index over the live sstables, keyed by their covered key
/// interval, for read-path pruning. Entries are sorted by interval start.
#[derive(Clone)]
pub struct IntervalIndex {
    entries: Vec<(Token, Token, Arc<SSTableReader>)>,
}

impl IntervalIndex {
    fn build(live: &HashSet<Arc<SSTableReader>>) -> Self {
        let mut entries: Vec<_> = live
            .iter()
            .map(|s| (s.first(), s.last(), s.clone()))
            .collect();
        entries.sort_by_key(|(first, last, s)| (*first, *last, s.descriptor().generation()));
        Self { entries }
    }

    /// All sstables whose interval intersects `[start, end]`.
    pub fn matching(&self, start: Token, end: Token) -> Vec<Arc<SSTableReader>> {
        self.entries
            .iter()
            .take_while(|(first, _, _)| *first <= end)
            .filter(|(_, last, _)| *last >= start)
            .map(|(_, _, s)| s.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Immutable snapshot of one table's live write buffers and sstables.
#[derive(Clone)]
pub struct View {
    /// Ordered by generation; index 0 is oldest, the last entry is the
    /// current write target.
    live_buffers: Vec<Arc<Memtable>>,
    /// Buffers no longer accepting writes but not yet replaced by sstables.
    flushing_buffers: Vec<Arc<Memtable>>,
    live: HashSet<Arc<SSTableReader>>,
    /// Subset of the live set claimed by an active transaction.
    compacting: HashSet<Arc<SSTableReader>>,
    interval_index: IntervalIndex,
}

impl View {
    pub(crate) fn empty(initial_buffer: Option<Arc<Memtable>>) -> Self {
        let live = HashSet::new();
        Self {
            live_buffers: initial_buffer.into_iter().collect(),
            flushing_buffers: Vec::new(),
            interval_index: IntervalIndex::build(&live),
            live,
            compacting: HashSet::new(),
        }
    }

    pub fn live_buffers(&self) -> &[Arc<Memtable>] {
        &self.live_buffers
    }

    pub fn flushing_buffers(&self) -> &[Arc<Memtable>] {
        &self.flushing_buffers
    }

    /// The buffer new writes are directed to.
    pub fn current_buffer(&self) -> Option<&Arc<Memtable>> {
        self.live_buffers.last()
    }

    pub fn live_sstables(&self) -> &HashSet<Arc<SSTableReader>> {
        &self.live
    }

    pub fn compacting(&self) -> &HashSet<Arc<SSTableReader>> {
        &self.compacting
    }

    /// Live sstables not claimed by any transaction.
    pub fn noncompacting(&self) -> Vec<Arc<SSTableReader>> {
        self.live
            .iter()
            .filter(|s| !self.compacting.contains(*s))
            .cloned()
            .collect()
    }

    /// Live sstables whose key interval intersects `[start, end]`.
    pub fn sstables_in_range(&self, start: Token, end: Token) -> Vec<Arc<SSTableReader>> {
        self.interval_index.matching(start, end)
    }

    pub fn interval_index(&self) -> &IntervalIndex {
        &self.interval_index
    }

    /// Checks the structural invariants every observable view must satisfy.
    pub fn validate(&self) -> Result<()> {
        for claimed in &self.compacting {
            if !self.live.contains(claimed) {
                return Err(Error::Invariant(format!(
                    "compacting sstable {} is not live",
                    claimed.descriptor()
                )));
            }
        }
        let ordered = self
            .live_buffers
            .windows(2)
            .all(|w| w[0].generation() < w[1].generation());
        if !ordered {
            return Err(Error::Invariant("write buffers out of order".into()));
        }
        if self.interval_index.len() != self.live.len() {
            return Err(Error::Invariant(format!(
                "interval index covers {} of {} live sstables",
                self.interval_index.len(),
                self.live.len()
            )));
        }
        Ok(())
    }

    // TRANSFORM CONSTRUCTORS
    //
    // Each returns a pure function from one view to the next; the tracker
    // applies them inside its atomic swap. Transforms may run more than once
    // and must stay cheap and side-effect free.

    pub fn update_live_set(
        remove: HashSet<Arc<SSTableReader>>,
        add: Vec<Arc<SSTableReader>>,
    ) -> impl Fn(&View) -> View {
        move |v| {
            let mut live = v.live.clone();
            for r in &remove {
                if !live.remove(r) {
                    tracing::warn!(sstable = %r.descriptor(), "removing sstable that is not live");
                }
            }
            for a in &add {
                assert!(
                    live.insert(a.clone()),
                    "sstable {} added to the live set twice",
                    a.descriptor()
                );
            }
            View {
                live_buffers: v.live_buffers.clone(),
                flushing_buffers: v.flushing_buffers.clone(),
                interval_index: IntervalIndex::build(&live),
                live,
                compacting: v.compacting.clone(),
            }
        }
    }

    pub fn update_compacting(
        remove: HashSet<Arc<SSTableReader>>,
        add: Vec<Arc<SSTableReader>>,
    ) -> impl Fn(&View) -> View {
        move |v| {
            let mut compacting = v.compacting.clone();
            for r in &remove {
                compacting.remove(r);
            }
            for a in &add {
                assert!(
                    v.live.contains(a),
                    "claimed sstable {} is not live",
                    a.descriptor()
                );
                compacting.insert(a.clone());
            }
            View {
                live_buffers: v.live_buffers.clone(),
                flushing_buffers: v.flushing_buffers.clone(),
                live: v.live.clone(),
                compacting,
                interval_index: v.interval_index.clone(),
            }
        }
    }

    /// True iff none of `xs` is currently claimed.
    pub fn permit_compacting(xs: Vec<Arc<SSTableReader>>) -> impl Fn(&View) -> bool {
        move |v| xs.iter().all(|x| !v.compacting.contains(x))
    }

    /// Appends a new current write target.
    pub fn switch_buffer(new_buffer: Arc<Memtable>) -> impl Fn(&View) -> View {
        move |v| {
            if let Some(last) = v.live_buffers.last() {
                assert!(
                    last.generation() < new_buffer.generation(),
                    "switched-in buffer must have a later generation"
                );
            }
            let mut live_buffers = v.live_buffers.clone();
            live_buffers.push(new_buffer.clone());
            View {
                live_buffers,
                flushing_buffers: v.flushing_buffers.clone(),
                live: v.live.clone(),
                compacting: v.compacting.clone(),
                interval_index: v.interval_index.clone(),
            }
        }
    }

    /// Moves a buffer from the live list to the flushing set.
    pub fn mark_flushing(buffer: Arc<Memtable>) -> impl Fn(&View) -> View {
        move |v| {
            let mut live_buffers = v.live_buffers.clone();
            let mut flushing_buffers = v.flushing_buffers.clone();
            if let Some(pos) = live_buffers.iter().position(|b| *b == buffer) {
                flushing_buffers.push(live_buffers.remove(pos));
            } else {
                tracing::warn!(buffer = %buffer, "marking unknown buffer as flushing");
            }
            View {
                live_buffers,
                flushing_buffers,
                live: v.live.clone(),
                compacting: v.compacting.clone(),
                interval_index: v.interval_index.clone(),
            }
        }
    }

    /// Retires a flushed buffer, installing its outputs (possibly none) into
    /// the live set.
    pub fn replace_flushed(
        buffer: Arc<Memtable>,
        outputs: Vec<Arc<SSTableReader>>,
    ) -> impl Fn(&View) -> View {
        move |v| {
            let mut flushing_buffers = v.flushing_buffers.clone();
            match flushing_buffers.iter().position(|b| *b == buffer) {
                Some(pos) => {
                    flushing_buffers.remove(pos);
                }
                None => {
                    tracing::warn!(buffer = %buffer, "replacing buffer that is not flushing");
                }
            }
            let mut live = v.live.clone();
            for output in &outputs {
                assert!(
                    live.insert(output.clone()),
                    "flush output {} already live",
                    output.descriptor()
                );
            }
            View {
                live_buffers: v.live_buffers.clone(),
                flushing_buffers,
                interval_index: IntervalIndex::build(&live),
                live,
                compacting: v.compacting.clone(),
            }
        }
    }
}
