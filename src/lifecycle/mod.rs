//! Live-data lifecycle: the tracker, its immutable view, scoped transactions
//! over sstables, and the durable obsoletion log that makes swaps
//! crash-safe.

pub mod oblog;
pub mod tracker;
pub mod transaction;
pub mod view;

pub use oblog::{recover_obsoletion_logs, ObsoletionLog, RecoveredLog};
pub use tracker::{AlwaysValid, TableMetadata, TableStatus, Tracker};
pub use transaction::LifecycleTransaction;
pub use view::View;

use serde::{Deserialize, Serialize};

/// The structural operation a transaction or notification belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Flush,
    Compaction,
    Cleanup,
    Scrub,
    UpgradeSSTables,
    DropTable,
    RemoveUnreadable,
    Truncate,
    Stream,
    Unknown,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Flush => "flush",
            OperationKind::Compaction => "compaction",
            OperationKind::Cleanup => "cleanup",
            OperationKind::Scrub => "scrub",
            OperationKind::UpgradeSSTables => "upgrade_sstables",
            OperationKind::DropTable => "drop_table",
            OperationKind::RemoveUnreadable => "remove_unreadable",
            OperationKind::Truncate => "truncate",
            OperationKind::Stream => "stream",
            OperationKind::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            OperationKind::Flush,
            OperationKind::Compaction,
            OperationKind::Cleanup,
            OperationKind::Scrub,
            OperationKind::UpgradeSSTables,
            OperationKind::DropTable,
            OperationKind::RemoveUnreadable,
            OperationKind::Truncate,
            OperationKind::Stream,
            OperationKind::Unknown,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == s)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
