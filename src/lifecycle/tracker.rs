//! Owner of a table's current [`View`] and of every transition between views.
//!
//! All mutation primitives are expressed as an atomic swap of the view
//! reference guarded by an optional permit. Readers clone the current view
//! and never coordinate with writers; change notifications are published
//! after the swap succeeds, so subscribers never observe a state that was
//! never current.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use super::oblog::ObsoletionLog;
use super::transaction::LifecycleTransaction;
use super::view::View;
use super::OperationKind;
use crate::config::TrackerConfig;
use crate::descriptor::BACKUPS_SUBDIR;
use crate::error::{maybe_fail, merge, Error, Result};
use crate::memtable::{CommitLogPosition, Memtable, OpGroup};
use crate::notifications::{Notification, NotificationConsumer, Subscribers};
use crate::sstable::SSTableReader;

/// Identity of the tracked table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableMetadata {
    pub keyspace: String,
    pub name: String,
    /// Hex id suffix of the table directory.
    pub id: String,
}

impl TableMetadata {
    pub fn new(
        keyspace: impl Into<String>,
        name: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            keyspace: keyspace.into(),
            name: name.into(),
            id: id.into(),
        }
    }

    /// `<data>/<ks>/<cf>-<id>/`
    pub fn table_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir
            .join(&self.keyspace)
            .join(format!("{}-{}", self.name, self.id))
    }
}

impl std::fmt::Display for TableMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.keyspace, self.name)
    }
}

/// Schema-side validity of the owning table, supplied by the surrounding
/// metadata module. Decides between dropping files and merely unloading
/// them when the table goes away.
pub trait TableStatus: Send + Sync {
    fn is_valid(&self) -> bool;
    /// Only meaningful once `is_valid` returns false.
    fn should_drop_data(&self) -> bool;
}

/// The common case: a table that is never invalidated.
pub struct AlwaysValid;

impl TableStatus for AlwaysValid {
    fn is_valid(&self) -> bool {
        true
    }

    fn should_drop_data(&self) -> bool {
        false
    }
}

/// Tracks the live view of the data store for one table.
pub struct Tracker {
    metadata: TableMetadata,
    config: TrackerConfig,
    status: Arc<dyn TableStatus>,
    view: RwLock<Arc<View>>,
    subscribers: Subscribers,
    live_bytes: AtomicI64,
    total_bytes: AtomicI64,
}

impl Tracker {
    pub fn new(
        metadata: TableMetadata,
        config: TrackerConfig,
        status: Arc<dyn TableStatus>,
        initial_buffer: Option<Arc<Memtable>>,
    ) -> Self {
        Self {
            metadata,
            config,
            status,
            view: RwLock::new(Arc::new(View::empty(initial_buffer))),
            subscribers: Subscribers::new(),
            live_bytes: AtomicI64::new(0),
            total_bytes: AtomicI64::new(0),
        }
    }

    pub fn metadata(&self) -> &TableMetadata {
        &self.metadata
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn table_dir(&self) -> PathBuf {
        self.metadata.table_dir(&self.config.data_dir)
    }

    /// The current snapshot. Operate on it freely; it never mutates.
    pub fn view(&self) -> Arc<View> {
        self.view.read().unwrap().clone()
    }

    // ATOMICALLY MODIFYING THE VIEW
    //
    // Permit and transform are evaluated together under the swap lock, so a
    // granted permit can never be invalidated by a concurrent swap.
    // Transforms must stay pure, side-effect free and cheap.

    pub(crate) fn apply<F>(&self, transform: F) -> (Arc<View>, Arc<View>)
    where
        F: Fn(&View) -> View,
    {
        self.apply_if(|_| true, transform)
            .expect("unconditional transform was rejected")
    }

    /// Tests `permit` against the current view and swaps in `transform`'s
    /// result if it holds, returning the before and after snapshots.
    /// Returns `None` when the permit is denied.
    pub(crate) fn apply_if<P, F>(&self, permit: P, transform: F) -> Option<(Arc<View>, Arc<View>)>
    where
        P: Fn(&View) -> bool,
        F: Fn(&View) -> View,
    {
        let mut slot = self.view.write().unwrap();
        if !permit(&slot) {
            return None;
        }
        let before = slot.clone();
        let after = Arc::new(transform(&before));
        *slot = after.clone();
        Some((before, after))
    }

    /// Returns a transaction over `sstables` iff none of them is already
    /// claimed by another operation. Never blocks; contention is reported by
    /// `None` and the caller retries with its own policy. An empty claim
    /// yields a trivial transaction.
    pub fn try_modify(
        &self,
        sstables: Vec<Arc<SSTableReader>>,
        op: OperationKind,
    ) -> Option<LifecycleTransaction<'_>> {
        self.try_modify_with_id(sstables, op, Uuid::new_v4())
    }

    pub fn try_modify_with_id(
        &self,
        sstables: Vec<Arc<SSTableReader>>,
        op: OperationKind,
        id: Uuid,
    ) -> Option<LifecycleTransaction<'_>> {
        if sstables.is_empty() {
            return Some(LifecycleTransaction::new(self, op, sstables, id));
        }
        self.apply_if(
            View::permit_compacting(sstables.clone()),
            View::update_compacting(HashSet::new(), sstables.clone()),
        )?;
        tracing::debug!(table = %self.metadata, op = %op, claimed = sstables.len(), id = %id, "claimed sstables");
        Some(LifecycleTransaction::new(self, op, sstables, id))
    }

    pub(crate) fn unmark_compacting(&self, sstables: &[Arc<SSTableReader>]) {
        if sstables.is_empty() {
            return;
        }
        let release: HashSet<_> = sstables.iter().cloned().collect();
        self.apply(View::update_compacting(release, Vec::new()));
    }

    // FLUSHING

    /// The buffer an ordered write should be directed to: the oldest live
    /// buffer that accepts it. Newer buffers appended concurrently are for
    /// operations that started after us, so scanning oldest-first is safe.
    ///
    /// # Panics
    ///
    /// When no live buffer accepts the write, which violates the buffer
    /// ordering invariant and is unrecoverable.
    pub fn current_buffer(&self, group: OpGroup, position: CommitLogPosition) -> Arc<Memtable> {
        let view = self.view();
        for buffer in view.live_buffers() {
            if buffer.accepts(group, position) {
                return buffer.clone();
            }
        }
        panic!(
            "no live write buffer of {} accepts position {position}",
            self.metadata
        );
    }

    /// Atomically appends `new_buffer` as the write target, returning the
    /// previously current buffer. The pair switch + `replace_flushed` must
    /// not be interleaved for one buffer.
    pub fn switch_buffer(&self, truncating: bool, new_buffer: Arc<Memtable>) -> Arc<Memtable> {
        let (before, _) = self.apply(View::switch_buffer(new_buffer.clone()));
        let previous = before
            .current_buffer()
            .cloned()
            .expect("switched a tracker with no live write buffer");
        let notification = if truncating {
            Notification::BufferRenewed { buffer: new_buffer }
        } else {
            Notification::BufferSwitched {
                buffer: previous.clone(),
            }
        };
        self.subscribers.publish(&notification, None);
        previous
    }

    /// Moves `buffer` from the live list to the flushing set.
    pub fn mark_flushing(&self, buffer: Arc<Memtable>) {
        self.apply(View::mark_flushing(buffer));
    }

    /// Retires a flushed buffer, installing its outputs into the live set.
    /// An empty output set (nothing needed retaining) only discards the
    /// buffer.
    pub fn replace_flushed(
        &self,
        buffer: Arc<Memtable>,
        outputs: Vec<Arc<SSTableReader>>,
        op_id: Option<Uuid>,
    ) -> Result<()> {
        if outputs.is_empty() {
            self.apply(View::replace_flushed(buffer.clone(), Vec::new()));
            self.subscribers
                .publish(&Notification::BufferDiscarded { buffer }, None);
            return Ok(());
        }

        // back up before publishing the outputs anywhere
        let mut accumulate = self.maybe_incremental_backup(&outputs, None);

        self.apply(View::replace_flushed(buffer.clone(), outputs.clone()));

        accumulate = self.update_size_tracking(&[], &outputs, accumulate);
        accumulate = self.subscribers.publish(
            &Notification::BufferDiscarded {
                buffer: buffer.clone(),
            },
            accumulate,
        );
        accumulate = self.subscribers.publish(
            &Notification::Added {
                added: outputs,
                op: OperationKind::Flush,
                op_id,
                flushed_from: Some(buffer),
            },
            accumulate,
        );
        accumulate = self.drop_or_unload_if_invalid("during flush", accumulate);
        maybe_fail(accumulate)
    }

    // SETUP / CLEANUP

    /// Bulk insert at startup: no incremental backup, `initial-added`
    /// notification.
    pub fn add_initial_sstables(&self, sstables: Vec<Arc<SSTableReader>>) -> Result<()> {
        self.add_internal(sstables, OperationKind::Unknown, true, false)
    }

    /// Inserts sstables produced by `op`, taking an incremental backup when
    /// enabled.
    pub fn add_sstables(&self, sstables: Vec<Arc<SSTableReader>>, op: OperationKind) -> Result<()> {
        self.add_internal(sstables, op, false, true)
    }

    fn add_internal(
        &self,
        sstables: Vec<Arc<SSTableReader>>,
        op: OperationKind,
        initial: bool,
        backup: bool,
    ) -> Result<()> {
        self.apply(View::update_live_set(HashSet::new(), sstables.clone()));
        let mut accumulate = self.update_size_tracking(&[], &sstables, None);
        if backup {
            accumulate = self.maybe_incremental_backup(&sstables, accumulate);
        }
        let notification = if initial {
            Notification::InitialAdded { added: sstables }
        } else {
            Notification::Added {
                added: sstables,
                op,
                op_id: None,
                flushed_from: None,
            }
        };
        accumulate = self.subscribers.publish(&notification, accumulate);
        maybe_fail(accumulate)
    }

    /// Drops every live sstable that is not busy compacting.
    pub fn drop_sstables(&self, op: OperationKind) -> Result<()> {
        maybe_fail(self.drop_sstables_if(|_| true, op, None))
    }

    /// Removes all non-compacting sstables matching `remove` from the live
    /// set, obsoletes them through a durable log, and publishes one list
    /// change. On a log failure the removal is rolled back while the table
    /// is still valid; when the table was dropped concurrently the change is
    /// published anyway so downstream catalogs converge.
    pub fn drop_sstables_if<F>(
        &self,
        remove: F,
        op: OperationKind,
        mut accumulate: Option<Error>,
    ) -> Option<Error>
    where
        F: Fn(&SSTableReader) -> bool,
    {
        let id = Uuid::new_v4();
        let mut log = ObsoletionLog::new(&self.table_dir(), op, id);

        let (before, after) = self.apply(|v| {
            let toremove: HashSet<_> = v
                .live_sstables()
                .iter()
                .filter(|s| remove(s) && !v.compacting().contains(*s))
                .cloned()
                .collect();
            View::update_live_set(toremove, Vec::new())(v)
        });
        let removed: Vec<_> = before
            .live_sstables()
            .difference(after.live_sstables())
            .cloned()
            .collect();
        if removed.is_empty() {
            return accumulate;
        }

        let staged = removed
            .iter()
            .try_for_each(|s| log.record_remove(s.descriptor()))
            .and_then(|()| log.commit());
        match staged {
            Ok(()) => {
                accumulate = self.mark_obsolete_and_notify(&removed, accumulate);
                accumulate = self.update_size_tracking(&removed, &[], accumulate);
                accumulate = self.subscribers.publish(
                    &Notification::ListChanged {
                        added: Vec::new(),
                        removed: removed.clone(),
                        op,
                        op_id: Some(id),
                    },
                    accumulate,
                );
                tracing::debug!(table = %self.metadata, op = %op, removed = removed.len(), "dropped sstables");
            }
            Err(e) => {
                tracing::error!(table = %self.metadata, op = %op, error = %e, "failed to commit obsoletion log");
                let mut err = log.abort().err();
                if err.is_none() && self.status.is_valid() {
                    // the obsoletion was cancelled and the files are still
                    // valid, put them back
                    self.apply(View::update_live_set(HashSet::new(), removed.clone()));
                } else if !self.status.is_valid() {
                    // the table was dropped underneath us; downstream
                    // bookkeeping still needs to hear about the removal
                    err = self.subscribers.publish(
                        &Notification::ListChanged {
                            added: Vec::new(),
                            removed: removed.clone(),
                            op,
                            op_id: Some(id),
                        },
                        err,
                    );
                } else {
                    tracing::error!(table = %self.metadata,
                        "failed to abort obsoletion, sstables missing from live set");
                }
                if let Some(err) = err {
                    accumulate = merge(accumulate, err);
                }
                accumulate = merge(accumulate, e);
            }
        }
        accumulate
    }

    /// Removes non-compacting sstables from the view without deleting their
    /// files. Claimed sstables are released by their owning transaction.
    pub fn unload_sstables(&self) -> Result<()> {
        maybe_fail(self.unload_sstables_accumulate(None))
    }

    pub fn unload_sstables_accumulate(&self, accumulate: Option<Error>) -> Option<Error> {
        let (before, after) = self.apply(|v| {
            let unload: HashSet<_> = v.noncompacting().into_iter().collect();
            View::update_live_set(unload, Vec::new())(v)
        });
        let unloaded = before.live_sstables().len() - after.live_sstables().len();
        tracing::debug!(table = %self.metadata, unloaded, "unloaded sstables");
        accumulate
    }

    /// Removes every sstable under `directory` from the view, deleting the
    /// files.
    pub fn remove_unreadable(&self, directory: &Path) -> Result<()> {
        let directory = std::path::absolute(directory).unwrap_or_else(|_| directory.to_path_buf());
        maybe_fail(self.drop_sstables_if(
            |s| s.descriptor().directory() == directory,
            OperationKind::RemoveUnreadable,
            None,
        ))
    }

    /// When the owning table has been invalidated, either drops its sstables
    /// (schema says the data goes too) or unloads them (files are kept).
    pub fn drop_or_unload_if_invalid(
        &self,
        reason: &str,
        accumulate: Option<Error>,
    ) -> Option<Error> {
        if self.status.is_valid() {
            return accumulate;
        }
        if self.status.should_drop_data() {
            tracing::info!(table = %self.metadata, reason, "dropping sstables for invalidated table");
            self.drop_sstables_if(|_| true, OperationKind::DropTable, accumulate)
        } else {
            tracing::info!(table = %self.metadata, reason, "unloading sstables for invalidated table");
            self.unload_sstables_accumulate(accumulate)
        }
    }

    /// Reinitializes the view, purging all references.
    pub fn reset(&self, buffer: Option<Arc<Memtable>>) {
        *self.view.write().unwrap() = Arc::new(View::empty(buffer));
    }

    // MISCELLANEOUS utility calls

    pub fn live_sstables(&self) -> Vec<Arc<SSTableReader>> {
        self.view().live_sstables().iter().cloned().collect()
    }

    pub fn compacting(&self) -> Vec<Arc<SSTableReader>> {
        self.view().compacting().iter().cloned().collect()
    }

    pub fn noncompacting(&self) -> Vec<Arc<SSTableReader>> {
        self.view().noncompacting()
    }

    /// Net bytes of the live set.
    pub fn live_bytes(&self) -> i64 {
        self.live_bytes.load(Ordering::SeqCst)
    }

    /// Bytes ever added; only decremented once files are actually deleted.
    pub fn total_bytes(&self) -> i64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    pub(crate) fn update_size_tracking(
        &self,
        old: &[Arc<SSTableReader>],
        new: &[Arc<SSTableReader>],
        accumulate: Option<Error>,
    ) -> Option<Error> {
        let mut add = 0i64;
        for sstable in new {
            tracing::trace!(table = %self.metadata, sstable = %sstable.descriptor(), "tracking file");
            add += sstable.bytes_on_disk() as i64;
        }
        let mut subtract = 0i64;
        for sstable in old {
            tracing::trace!(table = %self.metadata, sstable = %sstable.descriptor(), "untracking file");
            subtract += sstable.bytes_on_disk() as i64;
        }
        self.live_bytes.fetch_add(add - subtract, Ordering::SeqCst);
        self.total_bytes.fetch_add(add, Ordering::SeqCst);
        accumulate
    }

    /// Hard-links each sstable's components into `backups/` when incremental
    /// backups are enabled.
    fn maybe_incremental_backup(
        &self,
        sstables: &[Arc<SSTableReader>],
        mut accumulate: Option<Error>,
    ) -> Option<Error> {
        if !self.config.incremental_backups {
            return accumulate;
        }
        let backups_dir = self.table_dir().join(BACKUPS_SUBDIR);
        if let Err(e) = fs::create_dir_all(&backups_dir) {
            return merge(accumulate, e.into());
        }
        for sstable in sstables {
            let descriptor = sstable.descriptor();
            for component in sstable.components() {
                let source = descriptor.file_for(*component);
                if !source.exists() {
                    continue;
                }
                let target = backups_dir.join(descriptor.filename(*component));
                match fs::hard_link(&source, &target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(e) => accumulate = merge(accumulate, e.into()),
                }
            }
        }
        accumulate
    }

    pub(crate) fn mark_obsolete_and_notify(
        &self,
        sstables: &[Arc<SSTableReader>],
        mut accumulate: Option<Error>,
    ) -> Option<Error> {
        for sstable in sstables {
            sstable.mark_obsolete();
            accumulate = self.subscribers.publish(
                &Notification::Deleting {
                    sstable: sstable.clone(),
                },
                accumulate,
            );
        }
        accumulate
    }

    // NOTIFICATION

    pub fn subscribe(&self, consumer: Arc<dyn NotificationConsumer>) {
        self.subscribers.subscribe(consumer);
    }

    pub fn unsubscribe(&self, consumer: &Arc<dyn NotificationConsumer>) {
        self.subscribers.unsubscribe(consumer);
    }

    pub(crate) fn publish(
        &self,
        notification: &Notification,
        accumulate: Option<Error>,
    ) -> Option<Error> {
        self.subscribers.publish(notification, accumulate)
    }

    pub fn notify_truncated(&self, replay_after: CommitLogPosition, truncated_at: u64) {
        self.subscribers.publish(
            &Notification::Truncated {
                replay_after,
                truncated_at,
            },
            None,
        );
    }

    pub fn notify_repair_status_changed(&self, sstables: Vec<Arc<SSTableReader>>) {
        self.subscribers
            .publish(&Notification::RepairStatusChanged { sstables }, None);
    }

    // TEST HOOKS

    /// Removes sstables from the live set with no logging, obsoletion or
    /// notification.
    pub fn remove_unsafe(&self, sstables: HashSet<Arc<SSTableReader>>) {
        self.apply(View::update_live_set(sstables, Vec::new()));
    }

    /// Releases claims with no transaction bookkeeping.
    pub fn remove_compacting_unsafe(&self, sstables: HashSet<Arc<SSTableReader>>) {
        self.apply(View::update_compacting(sstables, Vec::new()));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::descriptor::{Component, Descriptor, SSTableFormat};
    use crate::dht::Token;
    use std::sync::Mutex;

    pub(crate) struct RecordingConsumer {
        pub notifications: Mutex<Vec<Notification>>,
    }

    impl RecordingConsumer {
        pub(crate) fn subscribed(tracker: &Tracker) -> Arc<Self> {
            let consumer = Arc::new(Self {
                notifications: Mutex::new(Vec::new()),
            });
            tracker.subscribe(consumer.clone());
            consumer
        }

        pub(crate) fn list_changes(&self) -> Vec<(usize, usize)> {
            self.notifications
                .lock()
                .unwrap()
                .iter()
                .filter_map(|n| match n {
                    Notification::ListChanged { added, removed, .. } => {
                        Some((added.len(), removed.len()))
                    }
                    _ => None,
                })
                .collect()
        }
    }

    impl NotificationConsumer for RecordingConsumer {
        fn handle(&self, notification: &Notification) -> Result<()> {
            self.notifications.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    pub(crate) fn test_tracker(data_dir: &Path) -> Tracker {
        let buffer = Arc::new(Memtable::new(1, CommitLogPosition::default()));
        Tracker::new(
            TableMetadata::new("ks", "cf", "aa01"),
            TrackerConfig::new(data_dir),
            Arc::new(AlwaysValid),
            Some(buffer),
        )
    }

    pub(crate) fn stub_sstable(tracker: &Tracker, generation: u64) -> Arc<SSTableReader> {
        let descriptor = Descriptor::new(
            tracker.table_dir(),
            &tracker.metadata().keyspace,
            &tracker.metadata().name,
            generation,
            SSTableFormat::Big,
        );
        SSTableReader::for_testing(descriptor, 1 << generation, Token(0), Token(100))
    }

    fn sstable_with_files(tracker: &Tracker, generation: u64) -> Arc<SSTableReader> {
        let sstable = stub_sstable(tracker, generation);
        fs::create_dir_all(tracker.table_dir()).unwrap();
        fs::write(sstable.descriptor().file_for(Component::Data), b"payload").unwrap();
        sstable
    }

    #[test]
    fn test_empty_drop_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = test_tracker(dir.path());
        let consumer = RecordingConsumer::subscribed(&tracker);

        let initial: Vec<_> = (1..=3).map(|g| sstable_with_files(&tracker, g)).collect();
        tracker.add_initial_sstables(initial.clone()).unwrap();

        tracker.drop_sstables_if(|_| false, OperationKind::DropTable, None);

        assert_eq!(tracker.live_sstables().len(), 3);
        assert!(consumer.list_changes().iter().all(|(_, removed)| *removed == 0));
        // no obsoletion log was committed
        let logs: Vec<_> = fs::read_dir(tracker.table_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |x| x == "oblog"))
            .collect();
        assert!(logs.is_empty());
    }

    #[test]
    fn test_drop_deletes_files_and_notifies_once() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = test_tracker(dir.path());
        let consumer = RecordingConsumer::subscribed(&tracker);

        let a = sstable_with_files(&tracker, 1);
        let b = sstable_with_files(&tracker, 2);
        let a_data = a.descriptor().file_for(Component::Data);
        let b_data = b.descriptor().file_for(Component::Data);
        tracker.add_initial_sstables(vec![a.clone(), b.clone()]).unwrap();
        let live_before = tracker.live_bytes();
        drop((a, b));

        tracker.drop_sstables(OperationKind::DropTable).unwrap();

        assert!(tracker.live_sstables().is_empty());
        assert_eq!(consumer.list_changes(), vec![(0, 2)]);
        assert_eq!(tracker.live_bytes(), live_before - 6);

        // the recorded notifications hold the last references; once they go,
        // the obsolete files go too
        assert!(a_data.exists() && b_data.exists());
        consumer.notifications.lock().unwrap().clear();
        assert!(!a_data.exists() && !b_data.exists());
    }

    #[test]
    fn test_drop_skips_compacting_sstables() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = test_tracker(dir.path());

        let a = sstable_with_files(&tracker, 1);
        let b = sstable_with_files(&tracker, 2);
        tracker.add_initial_sstables(vec![a.clone(), b.clone()]).unwrap();

        let txn = tracker
            .try_modify(vec![a.clone()], OperationKind::Compaction)
            .unwrap();
        tracker.drop_sstables(OperationKind::DropTable).unwrap();

        let live = tracker.live_sstables();
        assert_eq!(live, vec![a.clone()]);
        drop(txn);
        assert!(tracker.compacting().is_empty());
    }

    #[test]
    fn test_try_modify_contention() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = test_tracker(dir.path());
        let a = stub_sstable(&tracker, 1);
        let b = stub_sstable(&tracker, 2);
        tracker.add_initial_sstables(vec![a.clone(), b.clone()]).unwrap();

        let first = tracker.try_modify(vec![a.clone(), b.clone()], OperationKind::Compaction);
        assert!(first.is_some());
        // overlapping claim fails fast
        assert!(tracker.try_modify(vec![b.clone()], OperationKind::DropTable).is_none());
        drop(first);
        assert!(tracker.try_modify(vec![b], OperationKind::DropTable).is_some());
    }

    #[test]
    fn test_concurrent_claims_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(test_tracker(dir.path()));
        let shared = stub_sstable(&tracker, 1);
        tracker.add_initial_sstables(vec![shared.clone()]).unwrap();

        std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    let tracker = &tracker;
                    let shared = shared.clone();
                    // return the claim itself so no thread releases before
                    // every claim has been attempted
                    scope.spawn(move || tracker.try_modify(vec![shared], OperationKind::Compaction))
                })
                .collect();
            let claims: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
            let granted = claims.iter().filter(|c| c.is_some()).count();
            assert_eq!(granted, 1);
        });
    }

    #[test]
    fn test_flush_cycle_with_empty_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = test_tracker(dir.path());
        let consumer = RecordingConsumer::subscribed(&tracker);

        let replacement = Arc::new(Memtable::new(2, CommitLogPosition::new(1, 0)));
        let old = tracker.switch_buffer(false, replacement.clone());
        assert_eq!(old.generation(), 1);

        tracker.mark_flushing(old.clone());
        assert_eq!(tracker.view().flushing_buffers().len(), 1);

        tracker.replace_flushed(old.clone(), Vec::new(), None).unwrap();

        let view = tracker.view();
        assert!(view.flushing_buffers().is_empty());
        assert_eq!(view.live_buffers(), &[replacement]);

        let notifications = consumer.notifications.lock().unwrap();
        assert!(notifications
            .iter()
            .any(|n| matches!(n, Notification::BufferSwitched { buffer } if buffer.generation() == 1)));
        assert!(notifications
            .iter()
            .any(|n| matches!(n, Notification::BufferDiscarded { buffer } if buffer.generation() == 1)));
        assert!(!notifications.iter().any(|n| matches!(n, Notification::Added { .. })));
    }

    #[test]
    fn test_flush_installs_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = test_tracker(dir.path());
        let consumer = RecordingConsumer::subscribed(&tracker);

        let replacement = Arc::new(Memtable::new(2, CommitLogPosition::new(1, 0)));
        let old = tracker.switch_buffer(false, replacement);
        tracker.mark_flushing(old.clone());

        let output = stub_sstable(&tracker, 7);
        let op_id = Uuid::new_v4();
        tracker
            .replace_flushed(old, vec![output.clone()], Some(op_id))
            .unwrap();

        assert_eq!(tracker.live_sstables(), vec![output.clone()]);
        assert_eq!(tracker.live_bytes(), output.bytes_on_disk() as i64);
        let notifications = consumer.notifications.lock().unwrap();
        assert!(notifications.iter().any(|n| matches!(
            n,
            Notification::Added { added, op: OperationKind::Flush, op_id: Some(i), flushed_from: Some(_) }
                if added.len() == 1 && *i == op_id
        )));
    }

    #[test]
    fn test_current_buffer_prefers_oldest_accepting() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = test_tracker(dir.path());

        let second = Arc::new(Memtable::new(2, CommitLogPosition::new(5, 0)));
        let first = tracker.switch_buffer(false, second.clone());

        // both buffers accept this position; the oldest wins
        let chosen = tracker.current_buffer(OpGroup(0), CommitLogPosition::new(6, 0));
        assert_eq!(chosen, first);

        // once the old buffer is barriered, writes land in the new one
        first.set_switch_barrier(0);
        let chosen = tracker.current_buffer(OpGroup(1), CommitLogPosition::new(6, 0));
        assert_eq!(chosen, second);
    }

    #[test]
    fn test_remove_unreadable_drops_by_directory() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = test_tracker(dir.path());
        let consumer = RecordingConsumer::subscribed(&tracker);

        let inside = sstable_with_files(&tracker, 1);
        let elsewhere = {
            let other_dir = dir.path().join("ks").join("other-bb02");
            fs::create_dir_all(&other_dir).unwrap();
            let descriptor = Descriptor::new(&other_dir, "ks", "other", 9, SSTableFormat::Big);
            SSTableReader::for_testing(descriptor, 64, Token(0), Token(1))
        };
        tracker
            .add_initial_sstables(vec![inside.clone(), elsewhere.clone()])
            .unwrap();

        tracker.remove_unreadable(&tracker.table_dir()).unwrap();

        assert_eq!(tracker.live_sstables(), vec![elsewhere]);
        assert_eq!(consumer.list_changes(), vec![(0, 1)]);
    }

    #[test]
    fn test_unload_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = test_tracker(dir.path());
        let sstable = sstable_with_files(&tracker, 1);
        let data = sstable.descriptor().file_for(Component::Data);
        tracker.add_initial_sstables(vec![sstable.clone()]).unwrap();
        drop(sstable);

        tracker.unload_sstables().unwrap();

        assert!(tracker.live_sstables().is_empty());
        assert!(data.exists());
    }

    #[test]
    fn test_drop_or_unload_honours_table_status() {
        struct Dropped;
        impl TableStatus for Dropped {
            fn is_valid(&self) -> bool {
                false
            }
            fn should_drop_data(&self) -> bool {
                true
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(Memtable::new(1, CommitLogPosition::default()));
        let tracker = Tracker::new(
            TableMetadata::new("ks", "cf", "aa01"),
            TrackerConfig::new(dir.path()),
            Arc::new(Dropped),
            Some(buffer),
        );
        fs::create_dir_all(tracker.table_dir()).unwrap();
        let sstable = stub_sstable(&tracker, 1);
        tracker.add_initial_sstables(vec![sstable]).unwrap();

        assert!(tracker.drop_or_unload_if_invalid("test", None).is_none());
        assert!(tracker.live_sstables().is_empty());
    }

    #[test]
    fn test_incremental_backup_links_new_sstables() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(Memtable::new(1, CommitLogPosition::default()));
        let tracker = Tracker::new(
            TableMetadata::new("ks", "cf", "aa01"),
            TrackerConfig::new(dir.path()).incremental_backups(true),
            Arc::new(AlwaysValid),
            Some(buffer),
        );

        let sstable = sstable_with_files(&tracker, 1);
        tracker
            .add_sstables(vec![sstable.clone()], OperationKind::Stream)
            .unwrap();

        let backup = tracker
            .table_dir()
            .join(BACKUPS_SUBDIR)
            .join(sstable.descriptor().filename(Component::Data));
        assert!(backup.exists());
    }

    #[test]
    fn test_reset_purges_references() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = test_tracker(dir.path());
        tracker
            .add_initial_sstables(vec![stub_sstable(&tracker, 1)])
            .unwrap();

        tracker.reset(Some(Arc::new(Memtable::new(9, CommitLogPosition::default()))));

        let view = tracker.view();
        assert!(view.live_sstables().is_empty());
        assert_eq!(view.live_buffers().len(), 1);
        assert_eq!(view.current_buffer().unwrap().generation(), 9);
    }
}
