//! Scoped, uniquely-identified claims over sets of sstables.
//!
//! A transaction is created by [`Tracker::try_modify`] and owns its claimed
//! sstables until it is closed. Produced outputs are staged without touching
//! the live view; `commit` swaps originals for staged outputs in one atomic
//! view transition, and `abort` releases the claim untouched. Whatever the
//! exit path, dropping the transaction closes it.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use super::oblog::ObsoletionLog;
use super::tracker::Tracker;
use super::view::View;
use super::OperationKind;
use crate::error::{maybe_fail, Error, Result};
use crate::notifications::Notification;
use crate::sstable::SSTableReader;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TxnState {
    InProgress,
    Committed,
    Aborted,
}

/// A claim over `originals` for one structural operation, plus the staged
/// replacements produced so far.
pub struct LifecycleTransaction<'a> {
    tracker: &'a Tracker,
    id: Uuid,
    op: OperationKind,
    originals: Vec<Arc<SSTableReader>>,
    staged: Vec<Arc<SSTableReader>>,
    obsolete_originals: bool,
    log: Option<ObsoletionLog>,
    /// Staged entries already recorded in the log by a checkpoint.
    logged_staged: usize,
    state: TxnState,
}

impl<'a> LifecycleTransaction<'a> {
    pub(crate) fn new(
        tracker: &'a Tracker,
        op: OperationKind,
        originals: Vec<Arc<SSTableReader>>,
        id: Uuid,
    ) -> Self {
        Self {
            tracker,
            id,
            op,
            originals,
            staged: Vec::new(),
            obsolete_originals: false,
            log: None,
            logged_staged: 0,
            state: TxnState::InProgress,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn op(&self) -> OperationKind {
        self.op
    }

    pub fn originals(&self) -> &[Arc<SSTableReader>] {
        &self.originals
    }

    pub fn staged(&self) -> &[Arc<SSTableReader>] {
        &self.staged
    }

    fn log_mut(&mut self) -> &mut ObsoletionLog {
        if self.log.is_none() {
            self.log = Some(ObsoletionLog::new(
                &self.tracker.table_dir(),
                self.op,
                self.id,
            ));
        }
        self.log.as_mut().expect("obsoletion log was just created")
    }

    /// Stages a produced sstable. The live view is not altered until commit.
    pub fn update(&mut self, sstable: Arc<SSTableReader>) -> Result<()> {
        if self.state != TxnState::InProgress {
            return Err(Error::Invariant(format!(
                "update on finished transaction {}",
                self.id
            )));
        }
        if self.staged.contains(&sstable) || self.originals.contains(&sstable) {
            return Err(Error::Invariant(format!(
                "sstable {} staged twice",
                sstable.descriptor()
            )));
        }
        self.staged.push(sstable);
        Ok(())
    }

    pub fn update_all(
        &mut self,
        sstables: impl IntoIterator<Item = Arc<SSTableReader>>,
    ) -> Result<()> {
        for sstable in sstables {
            self.update(sstable)?;
        }
        Ok(())
    }

    /// Marks that on commit the originals disappear and the staged outputs
    /// take their place.
    pub fn obsolete_originals(&mut self) {
        self.obsolete_originals = true;
    }

    /// Records staged outputs in the obsoletion log and fsyncs it, so a
    /// crash from here on deletes half-written outputs instead of leaking
    /// them.
    pub fn checkpoint(&mut self) -> Result<()> {
        if self.logged_staged == self.staged.len() && self.log.is_none() {
            return Ok(());
        }
        let descriptors: Vec<_> = self.staged[self.logged_staged..]
            .iter()
            .map(|s| s.descriptor().clone())
            .collect();
        let log = self.log_mut();
        for descriptor in &descriptors {
            log.record_add(descriptor)?;
        }
        log.sync()?;
        self.logged_staged = self.staged.len();
        Ok(())
    }

    /// Atomically swaps originals for staged outputs and releases the claim.
    /// The obsoletion log is committed (fsync) before the swap becomes
    /// visible. Calling commit twice is a no-op the second time.
    pub fn commit(&mut self) -> Result<()> {
        match self.state {
            TxnState::Committed => return Ok(()),
            TxnState::Aborted => {
                return Err(Error::Invariant(format!(
                    "commit on aborted transaction {}",
                    self.id
                )))
            }
            TxnState::InProgress => {}
        }

        if self.originals.is_empty() && self.staged.is_empty() {
            self.state = TxnState::Committed;
            return Ok(());
        }

        let obsoleting = self.obsolete_originals && !self.originals.is_empty();
        if !self.staged.is_empty() || obsoleting {
            self.checkpoint()
                .map_err(|e| Error::ObsoletionFailed(e.to_string()))?;
            if obsoleting {
                let removals: Vec<_> = self
                    .originals
                    .iter()
                    .map(|s| s.descriptor().clone())
                    .collect();
                let log = self.log_mut();
                for descriptor in &removals {
                    log.record_remove(descriptor)
                        .map_err(|e| Error::ObsoletionFailed(e.to_string()))?;
                }
            }
            self.log_mut().commit()?;
        }

        let removed = if self.obsolete_originals {
            self.originals.clone()
        } else {
            Vec::new()
        };
        let removed_set: HashSet<_> = removed.iter().cloned().collect();
        let claimed: HashSet<_> = self.originals.iter().cloned().collect();
        let staged = std::mem::take(&mut self.staged);

        self.tracker.apply(|v| {
            let swapped = View::update_live_set(removed_set.clone(), staged.clone())(v);
            View::update_compacting(claimed.clone(), Vec::new())(&swapped)
        });

        let mut accumulate = self.tracker.mark_obsolete_and_notify(&removed, None);
        accumulate = self.tracker.update_size_tracking(&removed, &staged, accumulate);
        // release our claim references before publishing
        self.originals.clear();
        if !staged.is_empty() || !removed.is_empty() {
            accumulate = self.tracker.publish(
                &Notification::ListChanged {
                    added: staged,
                    removed,
                    op: self.op,
                    op_id: Some(self.id),
                },
                accumulate,
            );
        }

        self.state = TxnState::Committed;
        tracing::debug!(id = %self.id, op = %self.op, "committed transaction");
        maybe_fail(accumulate)
    }

    /// Releases the claim without altering the live set. Staged outputs
    /// already written to disk are obsoleted through the log.
    pub fn abort(&mut self) -> Result<()> {
        if self.state != TxnState::InProgress {
            return Ok(());
        }

        self.tracker.unmark_compacting(&self.originals);

        let mut result = Ok(());
        if self.log.is_some() || !self.staged.is_empty() {
            result = self.checkpoint().and_then(|()| self.log_mut().abort());
            for staged in &self.staged {
                staged.mark_obsolete();
            }
        }
        self.staged.clear();
        self.originals.clear();
        self.state = TxnState::Aborted;
        tracing::debug!(id = %self.id, op = %self.op, "aborted transaction");
        result
    }

    /// Commit or abort must have happened by the time the scope ends; close
    /// aborts if neither did.
    pub fn close(&mut self) -> Result<()> {
        if self.state == TxnState::InProgress {
            self.abort()
        } else {
            Ok(())
        }
    }
}

impl Drop for LifecycleTransaction<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(id = %self.id, error = %e, "failed to close transaction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Component;
    use crate::lifecycle::tracker::tests::{stub_sstable, test_tracker, RecordingConsumer};
    use std::fs;

    #[test]
    fn test_compaction_swap() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = test_tracker(dir.path());
        let consumer = RecordingConsumer::subscribed(&tracker);

        let a = stub_sstable(&tracker, 1);
        let b = stub_sstable(&tracker, 2);
        tracker.add_initial_sstables(vec![a.clone(), b.clone()]).unwrap();

        let mut txn = tracker
            .try_modify(vec![a.clone(), b.clone()], OperationKind::Compaction)
            .unwrap();
        // a concurrent claim over an overlapping set must fail
        assert!(tracker.try_modify(vec![b.clone()], OperationKind::DropTable).is_none());

        let x = stub_sstable(&tracker, 3);
        txn.update(x.clone()).unwrap();
        txn.obsolete_originals();
        txn.commit().unwrap();

        assert_eq!(tracker.live_sstables(), vec![x]);
        assert!(tracker.compacting().is_empty());
        assert_eq!(consumer.list_changes(), vec![(1, 2)]);
        assert!(a.is_obsolete() && b.is_obsolete());
    }

    #[test]
    fn test_commit_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = test_tracker(dir.path());
        let consumer = RecordingConsumer::subscribed(&tracker);

        let a = stub_sstable(&tracker, 1);
        tracker.add_initial_sstables(vec![a.clone()]).unwrap();

        let mut txn = tracker.try_modify(vec![a], OperationKind::Compaction).unwrap();
        txn.obsolete_originals();
        txn.commit().unwrap();
        txn.commit().unwrap();

        assert_eq!(consumer.list_changes(), vec![(0, 1)]);
    }

    #[test]
    fn test_commit_without_obsoletion_keeps_originals() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = test_tracker(dir.path());

        let a = stub_sstable(&tracker, 1);
        tracker.add_initial_sstables(vec![a.clone()]).unwrap();

        let mut txn = tracker
            .try_modify(vec![a.clone()], OperationKind::UpgradeSSTables)
            .unwrap();
        let upgraded = stub_sstable(&tracker, 2);
        txn.update(upgraded.clone()).unwrap();
        txn.commit().unwrap();

        let live = tracker.live_sstables();
        assert_eq!(live.len(), 2);
        assert!(live.contains(&a) && live.contains(&upgraded));
        assert!(!a.is_obsolete());
        assert!(tracker.compacting().is_empty());
    }

    #[test]
    fn test_abort_releases_claim_and_obsoletes_staged() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = test_tracker(dir.path());

        let a = stub_sstable(&tracker, 1);
        tracker.add_initial_sstables(vec![a.clone()]).unwrap();

        let staged = stub_sstable(&tracker, 2);
        fs::create_dir_all(tracker.table_dir()).unwrap();
        let staged_data = staged.descriptor().file_for(Component::Data);
        fs::write(&staged_data, b"half written").unwrap();

        let mut txn = tracker
            .try_modify(vec![a.clone()], OperationKind::Compaction)
            .unwrap();
        txn.update(staged.clone()).unwrap();
        txn.checkpoint().unwrap();
        txn.abort().unwrap();

        assert!(tracker.compacting().is_empty());
        assert_eq!(tracker.live_sstables(), vec![a]);

        // the staged output is gone once the last reference drops
        assert!(staged.is_obsolete());
        drop(staged);
        assert!(!staged_data.exists());
    }

    #[test]
    fn test_drop_without_commit_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = test_tracker(dir.path());

        let a = stub_sstable(&tracker, 1);
        tracker.add_initial_sstables(vec![a.clone()]).unwrap();

        {
            let _txn = tracker.try_modify(vec![a.clone()], OperationKind::Scrub).unwrap();
            assert_eq!(tracker.compacting(), vec![a.clone()]);
        }
        assert!(tracker.compacting().is_empty());
        assert_eq!(tracker.live_sstables(), vec![a]);
    }

    #[test]
    fn test_empty_claim_yields_trivial_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = test_tracker(dir.path());
        let consumer = RecordingConsumer::subscribed(&tracker);

        let mut txn = tracker.try_modify(Vec::new(), OperationKind::Cleanup).unwrap();
        txn.commit().unwrap();

        assert!(consumer.notifications.lock().unwrap().is_empty());
        assert!(!tracker.table_dir().exists());
    }
}
