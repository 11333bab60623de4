//! Change notifications published by the tracker.
//!
//! The notification set is a closed sum type; subscribers match on kind.
//! The subscriber list is copy-on-write so delivery iterates a snapshot
//! without holding any lock, and a subscriber fault never prevents delivery
//! to the remaining subscribers.

use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::error::{merge, Error, Result};
use crate::lifecycle::OperationKind;
use crate::memtable::{CommitLogPosition, Memtable};
use crate::sstable::SSTableReader;

#[derive(Clone, Debug)]
pub enum Notification {
    /// SSTables loaded at startup.
    InitialAdded { added: Vec<Arc<SSTableReader>> },
    /// New sstables entered the live set.
    Added {
        added: Vec<Arc<SSTableReader>>,
        op: OperationKind,
        op_id: Option<Uuid>,
        /// The write buffer these sstables were flushed from, if any.
        flushed_from: Option<Arc<Memtable>>,
    },
    /// An atomic swap replaced part of the live set.
    ListChanged {
        added: Vec<Arc<SSTableReader>>,
        removed: Vec<Arc<SSTableReader>>,
        op: OperationKind,
        op_id: Option<Uuid>,
    },
    /// Repair status flipped on the given sstables.
    RepairStatusChanged { sstables: Vec<Arc<SSTableReader>> },
    /// An sstable is scheduled for physical deletion.
    Deleting { sstable: Arc<SSTableReader> },
    /// The table was truncated.
    Truncated {
        replay_after: CommitLogPosition,
        truncated_at: u64,
    },
    /// The write buffer was replaced due to truncation.
    BufferRenewed { buffer: Arc<Memtable> },
    /// The write buffer was switched out for flushing.
    BufferSwitched { buffer: Arc<Memtable> },
    /// A flushed buffer left the view.
    BufferDiscarded { buffer: Arc<Memtable> },
}

pub trait NotificationConsumer: Send + Sync {
    fn handle(&self, notification: &Notification) -> Result<()>;
}

/// Copy-on-write subscriber list.
pub struct Subscribers {
    list: RwLock<Arc<Vec<Arc<dyn NotificationConsumer>>>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self {
            list: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn subscribe(&self, consumer: Arc<dyn NotificationConsumer>) {
        let mut list = self.list.write().unwrap();
        let mut next = (**list).clone();
        next.push(consumer);
        *list = Arc::new(next);
    }

    pub fn unsubscribe(&self, consumer: &Arc<dyn NotificationConsumer>) {
        let mut list = self.list.write().unwrap();
        let next: Vec<_> = list
            .iter()
            .filter(|c| !Arc::ptr_eq(c, consumer))
            .cloned()
            .collect();
        *list = Arc::new(next);
    }

    /// Delivers to every subscriber, merging faults into `accumulate`
    /// instead of aborting the pass.
    pub fn publish(
        &self,
        notification: &Notification,
        mut accumulate: Option<Error>,
    ) -> Option<Error> {
        let snapshot = self.list.read().unwrap().clone();
        for subscriber in snapshot.iter() {
            if let Err(e) = subscriber.handle(notification) {
                tracing::warn!(error = %e, "notification subscriber failed");
                accumulate = merge(accumulate, Error::Subscriber(e.to_string()));
            }
        }
        accumulate
    }
}

impl Default for Subscribers {
    fn default() -> Self {
        Self::new()
    }
}
