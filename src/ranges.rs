//! Locally-owned token ranges, sorted and weighted, with cached splits.

use std::collections::HashMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use itertools::Itertools;

use crate::dht::{Partitioner, Range, SplitType, Token};

/// Ownership weight of a fully-replicated range.
pub const FULL_RANGE_WEIGHT: f64 = 1.0;
/// Ownership weight of a transiently-replicated range.
pub const TRANSIENT_RANGE_WEIGHT: f64 = 0.1;

/// A token range with an ownership weight in `(0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WeightedRange {
    weight: f64,
    range: Range,
}

impl WeightedRange {
    pub fn new(weight: f64, range: Range) -> Self {
        debug_assert!(weight > 0.0 && weight <= 1.0);
        Self { weight, range }
    }

    /// A fully-owned range.
    pub fn full(range: Range) -> Self {
        Self::new(FULL_RANGE_WEIGHT, range)
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn left(&self) -> Token {
        self.range.left
    }

    pub fn right(&self) -> Token {
        self.range.right
    }

    /// Width scaled by ownership weight, for equal-weight splitting.
    pub fn weighted_width(&self) -> f64 {
        self.range.width() as f64 * self.weight
    }
}

impl Display for WeightedRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}x{}", self.weight, self.range)
    }
}

/// Shared, monotonically advancing ring version. Cluster membership bumps
/// this on every topology change.
#[derive(Debug, Default)]
pub struct RingMetadata {
    version: AtomicU64,
}

impl RingMetadata {
    pub fn new(version: u64) -> Self {
        Self {
            version: AtomicU64::new(version),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn advance(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// The ranges replicated to the local node at one ring version, as supplied
/// by the cluster membership module.
#[derive(Debug, Clone)]
pub struct RingSnapshot {
    pub version: u64,
    /// Identity of the local node the snapshot was taken for.
    pub endpoint: SocketAddr,
    pub full: Vec<Range>,
    pub transient: Vec<Range>,
}

/// The local ranges for a given table, sorted. Immutable once built; split
/// boundaries are computed lazily and cached per part count.
pub struct SortedLocalRanges {
    partitioner: Arc<dyn Partitioner>,
    ring: Arc<RingMetadata>,
    ring_version: u64,
    ranges: Vec<WeightedRange>,
    splits: Mutex<HashMap<usize, Arc<Vec<Token>>>>,
    valid: AtomicBool,
}

impl SortedLocalRanges {
    /// Build from a ring snapshot: weight full and transient replicas,
    /// unwrap any wrapping range at the ring boundary, sort by left endpoint.
    pub fn create(
        partitioner: Arc<dyn Partitioner>,
        ring: Arc<RingMetadata>,
        snapshot: &RingSnapshot,
    ) -> Self {
        let weighted = snapshot
            .full
            .iter()
            .map(|r| (FULL_RANGE_WEIGHT, r))
            .chain(snapshot.transient.iter().map(|r| (TRANSIENT_RANGE_WEIGHT, r)))
            .flat_map(|(weight, range)| {
                range
                    .unwrap(partitioner.as_ref())
                    .into_iter()
                    .map(move |unwrapped| WeightedRange::new(weight, unwrapped))
            })
            .sorted_by_key(|wr| wr.left())
            .collect();

        tracing::trace!(
            endpoint = %snapshot.endpoint,
            ring_version = snapshot.version,
            "built sorted local ranges"
        );

        Self::from_parts(partitioner, ring, snapshot.version, weighted)
    }

    /// A fixed-version instance for tests. `None` means the whole ring.
    pub fn for_testing(
        partitioner: Arc<dyn Partitioner>,
        ranges: Option<Vec<WeightedRange>>,
    ) -> Self {
        let ranges = ranges.unwrap_or_else(|| {
            vec![WeightedRange::full(Range::new(
                partitioner.min_token(),
                partitioner.max_token(),
            ))]
        });
        Self::from_parts(partitioner, Arc::new(RingMetadata::new(0)), 0, ranges)
    }

    fn from_parts(
        partitioner: Arc<dyn Partitioner>,
        ring: Arc<RingMetadata>,
        ring_version: u64,
        ranges: Vec<WeightedRange>,
    ) -> Self {
        Self {
            partitioner,
            ring,
            ring_version,
            ranges,
            splits: Mutex::new(HashMap::new()),
            valid: AtomicBool::new(true),
        }
    }

    pub fn ranges(&self) -> &[WeightedRange] {
        &self.ranges
    }

    pub fn ring_version(&self) -> u64 {
        self.ring_version
    }

    /// Split the local ranges into `num_parts` equally-weighted parts,
    /// returning the interior boundaries. Cached per part count.
    pub fn split(&self, num_parts: usize) -> Arc<Vec<Token>> {
        let mut splits = self.splits.lock().unwrap();
        splits
            .entry(num_parts)
            .or_insert_with(|| Arc::new(self.do_split(num_parts)))
            .clone()
    }

    fn do_split(&self, num_parts: usize) -> Vec<Token> {
        match self.partitioner.splitter() {
            None => {
                tracing::debug!(
                    num_parts,
                    "no splitter available, falling back to range endpoints"
                );
                self.ranges.iter().map(WeightedRange::right).collect()
            }
            Some(splitter) => {
                let boundaries =
                    splitter.split_owned_ranges(num_parts, &self.ranges, SplitType::AlwaysSplit);
                tracing::debug!(num_parts, boundaries = boundaries.len(), "split local ranges");
                boundaries
            }
        }
    }

    /// Intersection of the local ranges with `range`, dropping empty pieces
    /// and preserving weights.
    pub fn subrange(&self, range: &Range) -> Vec<WeightedRange> {
        self.ranges
            .iter()
            .filter_map(|wr| {
                wr.range()
                    .intersection_non_wrapping(range)
                    .map(|intersection| WeightedRange::new(wr.weight(), intersection))
            })
            .collect()
    }

    /// True once invalidated or when the live ring version has advanced.
    pub fn is_out_of_date(&self) -> bool {
        !self.valid.load(Ordering::SeqCst) || self.ring_version != self.ring.version()
    }

    /// One-shot, monotonic: an invalidated instance never becomes valid again.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }
}

impl PartialEq for SortedLocalRanges {
    fn eq(&self, other: &Self) -> bool {
        self.ring_version == other.ring_version && self.ranges == other.ranges
    }
}

impl std::fmt::Debug for SortedLocalRanges {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SortedLocalRanges")
            .field("ring_version", &self.ring_version)
            .field("ranges", &self.ranges)
            .finish()
    }
}

impl Display for SortedLocalRanges {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "LocalRanges{{ring version={}, num ranges={}}}",
            self.ring_version,
            self.ranges.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::{LocalPartitioner, LongTokenPartitioner, Splitter};
    use std::sync::atomic::AtomicUsize;

    fn snapshot(version: u64, full: Vec<Range>, transient: Vec<Range>) -> RingSnapshot {
        RingSnapshot {
            version,
            endpoint: "127.0.0.1:7000".parse().unwrap(),
            full,
            transient,
        }
    }

    #[test]
    fn test_create_sorts_and_unwraps() {
        let partitioner: Arc<dyn Partitioner> = Arc::new(LongTokenPartitioner);
        let ring = Arc::new(RingMetadata::new(3));
        // the wrapping range must be cut at the ring boundary
        let snap = snapshot(3, vec![Range::new(Token(100), Token(-100))], vec![Range::new(Token(0), Token(50))]);
        let local = SortedLocalRanges::create(partitioner, ring, &snap);

        let lefts: Vec<Token> = local.ranges().iter().map(WeightedRange::left).collect();
        assert_eq!(lefts, vec![Token(i64::MIN), Token(0), Token(100)]);
        assert_eq!(local.ranges()[1].weight(), TRANSIENT_RANGE_WEIGHT);
        assert_eq!(local.ranges()[2].weight(), FULL_RANGE_WEIGHT);
    }

    #[test]
    fn test_split_caches_per_part_count() {
        struct CountingPartitioner {
            calls: AtomicUsize,
        }
        impl Partitioner for CountingPartitioner {
            fn min_token(&self) -> Token {
                Token(i64::MIN)
            }
            fn max_token(&self) -> Token {
                Token(i64::MAX)
            }
            fn splitter(&self) -> Option<&dyn Splitter> {
                Some(self)
            }
        }
        impl Splitter for CountingPartitioner {
            fn split_owned_ranges(
                &self,
                parts: usize,
                ranges: &[WeightedRange],
                split_type: SplitType,
            ) -> Vec<Token> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                LongTokenPartitioner.split_owned_ranges(parts, ranges, split_type)
            }
        }

        let partitioner = Arc::new(CountingPartitioner {
            calls: AtomicUsize::new(0),
        });
        let local = SortedLocalRanges::for_testing(partitioner.clone(), None);

        let first = local.split(8);
        let second = local.split(8);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(partitioner.calls.load(Ordering::SeqCst), 1);
        assert!(first.len() <= 7);
        assert!(first.windows(2).all(|w| w[0] < w[1]));

        local.split(4);
        assert_eq!(partitioner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_split_without_splitter_uses_endpoints() {
        let partitioner: Arc<dyn Partitioner> = Arc::new(LocalPartitioner);
        let ranges = vec![
            WeightedRange::full(Range::new(Token(0), Token(10))),
            WeightedRange::full(Range::new(Token(10), Token(20))),
        ];
        let local = SortedLocalRanges::for_testing(partitioner, Some(ranges));
        assert_eq!(*local.split(5), vec![Token(10), Token(20)]);
    }

    #[test]
    fn test_subrange_preserves_weights() {
        let partitioner: Arc<dyn Partitioner> = Arc::new(LongTokenPartitioner);
        let ranges = vec![
            WeightedRange::new(1.0, Range::new(Token(0), Token(100))),
            WeightedRange::new(0.1, Range::new(Token(200), Token(300))),
        ];
        let local = SortedLocalRanges::for_testing(partitioner, Some(ranges));

        let sub = local.subrange(&Range::new(Token(50), Token(250)));
        assert_eq!(
            sub,
            vec![
                WeightedRange::new(1.0, Range::new(Token(50), Token(100))),
                WeightedRange::new(0.1, Range::new(Token(200), Token(250))),
            ]
        );
    }

    #[test]
    fn test_out_of_date_on_ring_advance_or_invalidate() {
        let partitioner: Arc<dyn Partitioner> = Arc::new(LongTokenPartitioner);
        let ring = Arc::new(RingMetadata::new(1));
        let snap = snapshot(1, vec![Range::new(Token(0), Token(100))], vec![]);
        let local = SortedLocalRanges::create(partitioner, ring.clone(), &snap);

        assert!(!local.is_out_of_date());
        ring.advance();
        assert!(local.is_out_of_date());

        let fixed = SortedLocalRanges::for_testing(Arc::new(LongTokenPartitioner), None);
        assert!(!fixed.is_out_of_date());
        fixed.invalidate();
        assert!(fixed.is_out_of_date());
    }

    #[test]
    fn test_value_equality() {
        let a = SortedLocalRanges::for_testing(Arc::new(LongTokenPartitioner), None);
        let b = SortedLocalRanges::for_testing(Arc::new(LongTokenPartitioner), None);
        assert_eq!(a, b);

        let c = SortedLocalRanges::for_testing(
            Arc::new(LongTokenPartitioner),
            Some(vec![WeightedRange::full(Range::new(Token(0), Token(1)))]),
        );
        assert!(a != c);
    }
}
