//! Offset Tracker - Tracks contiguous completion per partition
//!
//! Records are dispatched to workers in fetch order but may complete in any
//! order. The tracker keeps, for every assigned partition, the offsets that
//! were handed out and the ones that finished early, and only moves the
//! partition watermark over a run of offsets that have all completed. Every
//! advance stages `watermark + 1` (the next offset to consume) with an
//! [`OffsetStore`], usually the [`OffsetCommitter`](crate::kafka::offset_committer::OffsetCommitter).
//!
//! The set of partitions is fixed at construction. A tracker lives for one
//! assignment and is dropped with the pool generation that owns it.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::kafka::metrics_consts::OUT_OF_ORDER_COMPLETIONS;
use crate::kafka::types::{Partition, PartitionOffset};

/// Receives the next offset to commit whenever a partition watermark advances
#[cfg_attr(test, mockall::automock)]
pub trait OffsetStore: Send + Sync {
    fn store_offset(&self, offset: PartitionOffset);
}

/// Completion window for a single partition
#[derive(Debug)]
pub struct PartitionOffsets {
    /// Offsets in dispatch order that have not been passed by the watermark
    arrival: VecDeque<i64>,
    /// Offsets completed ahead of the queue head
    pending: BTreeSet<i64>,
    last_offset: i64,
}

impl Default for PartitionOffsets {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionOffsets {
    pub fn new() -> Self {
        Self {
            arrival: VecDeque::new(),
            pending: BTreeSet::new(),
            last_offset: -1,
        }
    }

    pub fn add_offset(&mut self, offset: i64) {
        self.arrival.push_back(offset);
    }

    /// Returns true when the watermark moved.
    pub fn mark_processed(&mut self, offset: i64) -> bool {
        match self.arrival.front() {
            None => false,
            Some(&head) if head != offset => {
                self.pending.insert(offset);
                false
            }
            Some(_) => {
                self.arrival.pop_front();
                self.last_offset = offset;

                while let Some(&next) = self.arrival.front() {
                    if !self.pending.remove(&next) {
                        break;
                    }
                    self.arrival.pop_front();
                    self.last_offset = next;
                }

                true
            }
        }
    }

    /// Highest offset below which everything dispatched has completed, -1 if none
    pub fn last_offset(&self) -> i64 {
        self.last_offset
    }

    pub fn in_flight(&self) -> usize {
        self.arrival.len()
    }

    /// Completions held back behind an unfinished lower offset
    pub fn completed_ahead(&self) -> usize {
        self.pending.len()
    }
}

/// Per-partition completion tracking for one assignment.
///
/// Each partition has its own lock; operations on different partitions never
/// contend. The map itself is immutable after construction.
pub struct OffsetTracker {
    partitions: HashMap<Partition, Mutex<PartitionOffsets>>,
    store: Arc<dyn OffsetStore>,
}

impl OffsetTracker {
    pub fn new(store: Arc<dyn OffsetStore>, partitions: impl IntoIterator<Item = Partition>) -> Self {
        Self {
            partitions: partitions
                .into_iter()
                .map(|partition| (partition, Mutex::new(PartitionOffsets::new())))
                .collect(),
            store,
        }
    }

    /// Register a dispatched offset. Must be called before the record reaches a worker.
    pub fn add_offset(&self, partition: &Partition, offset: i64) {
        match self.partitions.get(partition) {
            Some(window) => window.lock().add_offset(offset),
            None => debug!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = offset,
                "Ignoring offset for partition outside the current assignment"
            ),
        }
    }

    /// Record completion of `offset`. Stages the next offset to commit when the
    /// watermark advances and returns whether it did.
    pub fn mark_processed(&self, partition: &Partition, offset: i64) -> bool {
        let Some(window) = self.partitions.get(partition) else {
            return false;
        };

        let mut window = window.lock();
        if !window.mark_processed(offset) {
            if window.in_flight() > 0 {
                metrics::counter!(
                    OUT_OF_ORDER_COMPLETIONS,
                    "topic" => partition.topic().to_string(),
                    "partition" => partition.partition_number().to_string()
                )
                .increment(1);
            }
            return false;
        }

        let next_offset = window.last_offset() + 1;
        trace!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            next_offset = next_offset,
            "Watermark advanced"
        );
        // Staged while the partition lock is held so stores arrive in watermark order
        self.store
            .store_offset(PartitionOffset::new(partition.clone(), next_offset));

        true
    }

    pub fn last_offset(&self, partition: &Partition) -> Option<i64> {
        self.partitions
            .get(partition)
            .map(|window| window.lock().last_offset())
    }

    /// In-flight and early-completed counts for a partition
    pub fn window_sizes(&self, partition: &Partition) -> Option<(usize, usize)> {
        self.partitions.get(partition).map(|window| {
            let window = window.lock();
            (window.in_flight(), window.completed_ahead())
        })
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.keys()
    }

    pub fn contains(&self, partition: &Partition) -> bool {
        self.partitions.contains_key(partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    use mockall::predicate::eq;

    fn test_partition() -> Partition {
        Partition::new("test-topic", 0)
    }

    struct NoopStore;

    impl OffsetStore for NoopStore {
        fn store_offset(&self, _offset: PartitionOffset) {}
    }

    #[test]
    fn test_new_window_has_no_watermark() {
        let window = PartitionOffsets::new();
        assert_eq!(window.last_offset(), -1);
        assert_eq!(window.in_flight(), 0);
    }

    #[test]
    fn test_gap_sequence() {
        let mut window = PartitionOffsets::new();
        for offset in [1, 2, 4, 5, 7, 8, 15, 20, 50] {
            window.add_offset(offset);
        }

        let mut advanced = Vec::new();
        let mut last_offsets = Vec::new();
        for offset in [7, 1, 2, 20, 5, 8, 4, 15, 50] {
            advanced.push(window.mark_processed(offset));
            last_offsets.push(window.last_offset());
        }

        assert_eq!(
            advanced,
            vec![false, true, true, false, false, false, true, true, true]
        );
        assert_eq!(last_offsets, vec![-1, 1, 2, 2, 2, 2, 8, 20, 50]);
        assert_eq!(window.in_flight(), 0);
    }

    #[test]
    fn test_mark_processed_on_empty_window_is_noop() {
        let mut window = PartitionOffsets::new();
        assert!(!window.mark_processed(5));
        assert_eq!(window.last_offset(), -1);

        window.add_offset(5);
        assert!(window.mark_processed(5));
        assert_eq!(window.last_offset(), 5);
    }

    #[test]
    fn test_reverse_completion_stores_once() {
        let partition = test_partition();
        let mut store = MockOffsetStore::new();
        store
            .expect_store_offset()
            .with(eq(PartitionOffset::new(partition.clone(), 4)))
            .times(1)
            .return_const(());

        let tracker = OffsetTracker::new(Arc::new(store), vec![partition.clone()]);
        for offset in 1..=3 {
            tracker.add_offset(&partition, offset);
        }

        assert!(!tracker.mark_processed(&partition, 3));
        assert!(!tracker.mark_processed(&partition, 2));
        assert!(tracker.mark_processed(&partition, 1));
        assert_eq!(tracker.last_offset(&partition), Some(3));
    }

    #[test]
    fn test_unknown_partition_is_ignored() {
        let mut store = MockOffsetStore::new();
        store.expect_store_offset().never();

        let tracker = OffsetTracker::new(Arc::new(store), vec![test_partition()]);
        let unknown = Partition::new("test-topic", 9);

        tracker.add_offset(&unknown, 1);
        assert!(!tracker.mark_processed(&unknown, 1));
        assert!(!tracker.contains(&unknown));
        assert_eq!(tracker.last_offset(&unknown), None);
    }

    #[test]
    fn test_partitions_are_independent() {
        let p0 = Partition::new("test-topic", 0);
        let p1 = Partition::new("test-topic", 1);
        let mut store = MockOffsetStore::new();
        store
            .expect_store_offset()
            .with(eq(PartitionOffset::new(p1.clone(), 11)))
            .times(1)
            .return_const(());

        let tracker = OffsetTracker::new(Arc::new(store), vec![p0.clone(), p1.clone()]);
        tracker.add_offset(&p0, 5);
        tracker.add_offset(&p0, 6);
        tracker.add_offset(&p1, 10);

        assert!(!tracker.mark_processed(&p0, 6));
        assert!(tracker.mark_processed(&p1, 10));
        assert_eq!(tracker.last_offset(&p0), Some(-1));
        assert_eq!(tracker.last_offset(&p1), Some(10));
    }

    #[test]
    fn test_concurrent_completion_reaches_max() {
        let partitions: Vec<Partition> = (0..4).map(|p| Partition::new("test-topic", p)).collect();
        let tracker = Arc::new(OffsetTracker::new(Arc::new(NoopStore), partitions.clone()));

        for partition in &partitions {
            for offset in 0..1000 {
                tracker.add_offset(partition, offset);
            }
        }

        let mut handles = vec![];
        for partition in partitions.clone() {
            for lane in 0..2 {
                let tracker = tracker.clone();
                let partition = partition.clone();
                handles.push(thread::spawn(move || {
                    // Two threads per partition finish interleaved halves in reverse
                    for offset in (0..1000).rev().filter(|o| o % 2 == lane) {
                        tracker.mark_processed(&partition, offset);
                    }
                }));
            }
        }

        for handle in handles {
            handle.join().unwrap();
        }

        for partition in &partitions {
            assert_eq!(tracker.last_offset(partition), Some(999));
        }
    }
}
