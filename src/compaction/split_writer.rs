//! Geometric output partitioning for compaction writers.
//!
//! A compaction expecting `T` output bytes writes sstables of `T/2`, `T/4`,
//! `T/8`, ... until the next size would fall below a configured floor; the
//! remainder goes into one final sstable. The writer driving the compaction
//! asks [`SplittingSizeWriter::should_switch_writer`] after each partition
//! whether to close the current output and open the next.

use crate::config::TrackerConfig;

/// Floor below which no further split is worthwhile.
pub const DEFAULT_SMALLEST_SSTABLE_BYTES: u64 = 50_000_000;

const MAX_SPLITS: usize = 20;

/// Tracks the geometrically decreasing size schedule of one compaction's
/// outputs.
pub struct SplittingSizeWriter {
    ratios: Vec<f64>,
    total_size: u64,
    estimated_total_keys: u64,
    current_index: usize,
}

impl SplittingSizeWriter {
    pub fn new(total_size: u64, estimated_total_keys: u64, smallest_sstable_bytes: u64) -> Self {
        let mut ratios = Vec::with_capacity(MAX_SPLITS);
        let mut ratio = 1.0;
        for _ in 0..MAX_SPLITS {
            ratio /= 2.0;
            ratios.push(ratio);
            if (ratio * total_size as f64) < smallest_sstable_bytes as f64 {
                break;
            }
        }
        Self {
            ratios,
            total_size,
            estimated_total_keys,
            current_index: 0,
        }
    }

    /// Schedule with the floor taken from the table's configuration.
    pub fn for_table(config: &TrackerConfig, total_size: u64, estimated_total_keys: u64) -> Self {
        Self::new(
            total_size,
            estimated_total_keys,
            config.smallest_split_sstable_bytes,
        )
    }

    pub fn ratios(&self) -> &[f64] {
        &self.ratios
    }

    /// Byte budget of the sstable currently being written.
    pub fn expected_write_size(&self) -> u64 {
        (self.total_size as f64 * self.ratios[self.current_index]).round() as u64
    }

    /// Keys expected in the current sstable, proportional to its share of
    /// the total.
    pub fn estimated_keys_for_current(&self) -> u64 {
        (self.estimated_total_keys as f64 * self.ratios[self.current_index]).round() as u64
    }

    /// Called with the bytes written to the current output so far; advances
    /// the schedule and returns true when the output should be closed and a
    /// new one opened. The last target absorbs any underestimate.
    pub fn should_switch_writer(&mut self, bytes_written: u64) -> bool {
        if bytes_written > self.expected_write_size()
            && self.current_index < self.ratios.len() - 1
        {
            self.current_index += 1;
            tracing::debug!(
                bytes_to_write = self.expected_write_size(),
                "switching compaction output"
            );
            return true;
        }
        false
    }
}
