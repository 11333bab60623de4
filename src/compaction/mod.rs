//! Compaction support utilities.
//!
//! Compaction policy itself lives outside this crate; workers claim their
//! inputs through [`crate::lifecycle::Tracker::try_modify`] and swap results
//! in via the returned transaction. This module carries the writer-side
//! helpers those workers share.

pub mod split_writer;

pub use split_writer::{SplittingSizeWriter, DEFAULT_SMALLEST_SSTABLE_BYTES};
