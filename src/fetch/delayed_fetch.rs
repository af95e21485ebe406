//! A single held fetch request and the context it needs to decide whether
//! it can complete.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::cleaner::Partition;

/// What the delayed-fetch machinery needs to know about a partition without
/// owning the log itself; a real broker implements this over its log
/// manager and replica state, tests implement it over a fixed table.
pub trait FetchContext: Send + Sync {
    /// `None` when this node has no local leader replica for `partition`
    /// (case A) or the partition is entirely unknown (case B); the two are
    /// collapsed here because both complete the fetch immediately with an
    /// error attached to that partition.
    fn leader_end_offset(&self, partition: &Partition) -> Result<u64, FetchError>;

    /// Whether `requested_offset` still falls within the active segment,
    /// i.e. no truncation or roll has invalidated it since the fetch was
    /// issued (case C). Only meaningful when `leader_end_offset` succeeded.
    fn offset_still_valid(&self, partition: &Partition, requested_offset: u64) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchError {
    UnknownTopicOrPartition,
    NotLeaderForPartition,
}

/// One partition's slice of a fetch request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchPartitionStatus {
    pub partition: Partition,
    pub requested_offset: u64,
    pub max_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionFetchResult {
    pub partition: Partition,
    pub error: Option<FetchError>,
    pub bytes_available: u64,
}

pub type FetchResult = Vec<PartitionFetchResult>;

/// A fetch request parked until it can be satisfied or its deadline
/// passes. `try_complete` may be called concurrently and as often as
/// needed (idempotent); the response callback registered at construction
/// fires exactly once, enforced by `completed`.
pub struct DelayedFetch {
    partitions: Vec<FetchPartitionStatus>,
    fetch_min_bytes: u64,
    deadline: Instant,
    completed: AtomicBool,
    callback: Mutex<Option<Box<dyn FnOnce(FetchResult) + Send>>>,
}

impl DelayedFetch {
    pub fn new(
        partitions: Vec<FetchPartitionStatus>,
        fetch_min_bytes: u64,
        deadline: Instant,
        callback: impl FnOnce(FetchResult) + Send + 'static,
    ) -> Self {
        Self {
            partitions,
            fetch_min_bytes,
            deadline,
            completed: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(callback))),
        }
    }

    pub fn partitions(&self) -> &[FetchPartitionStatus] {
        &self.partitions
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Re-evaluate readiness against `ctx` at time `now`. Returns `true` if
    /// this call was the one that completed the fetch (cases A-D or
    /// timeout); a `false` return means the fetch is still pending.
    pub fn try_complete(&self, ctx: &dyn FetchContext, now: Instant) -> bool {
        if self.is_completed() {
            return false;
        }

        let mut bytes_available = 0u64;
        let mut results = Vec::with_capacity(self.partitions.len());
        let mut force = now >= self.deadline;

        for status in &self.partitions {
            match ctx.leader_end_offset(&status.partition) {
                Err(error) => {
                    force = true;
                    results.push(PartitionFetchResult {
                        partition: status.partition.clone(),
                        error: Some(error),
                        bytes_available: 0,
                    });
                }
                Ok(end_offset) => {
                    if !ctx.offset_still_valid(&status.partition, status.requested_offset) {
                        force = true;
                    }
                    let available = end_offset.saturating_sub(status.requested_offset).min(status.max_bytes);
                    bytes_available += available;
                    results.push(PartitionFetchResult {
                        partition: status.partition.clone(),
                        error: None,
                        bytes_available: available,
                    });
                }
            }
        }

        if !force && bytes_available < self.fetch_min_bytes {
            return false;
        }

        self.force_complete(results)
    }

    fn force_complete(&self, results: FetchResult) -> bool {
        if self.completed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return false;
        }
        if let Some(callback) = self.callback.lock().take() {
            callback(results);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    struct FixedContext {
        end_offsets: std::collections::HashMap<Partition, u64>,
        errors: std::collections::HashMap<Partition, FetchError>,
        invalid: std::collections::HashSet<Partition>,
    }

    impl FetchContext for FixedContext {
        fn leader_end_offset(&self, partition: &Partition) -> Result<u64, FetchError> {
            if let Some(&e) = self.errors.get(partition) {
                return Err(e);
            }
            Ok(*self.end_offsets.get(partition).unwrap_or(&0))
        }
        fn offset_still_valid(&self, partition: &Partition, _requested_offset: u64) -> bool {
            !self.invalid.contains(partition)
        }
    }

    fn status(topic: &str, requested_offset: u64, max_bytes: u64) -> FetchPartitionStatus {
        FetchPartitionStatus {
            partition: Partition::new(topic, 0),
            requested_offset,
            max_bytes,
        }
    }

    #[test]
    fn completes_once_min_bytes_reached() {
        let fire_count = Arc::new(AtomicUsize::new(0));
        let fire_count_clone = fire_count.clone();
        let fetch = DelayedFetch::new(
            vec![status("t", 0, 1024)],
            512,
            Instant::now() + Duration::from_secs(10),
            move |_| {
                fire_count_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        let mut ends = std::collections::HashMap::new();
        ends.insert(Partition::new("t", 0), 100u64);
        let ctx = FixedContext {
            end_offsets: ends,
            errors: Default::default(),
            invalid: Default::default(),
        };

        assert!(!fetch.try_complete(&ctx, Instant::now()));
        assert_eq!(fire_count.load(Ordering::SeqCst), 0);

        let mut ends2 = std::collections::HashMap::new();
        ends2.insert(Partition::new("t", 0), 600u64);
        let ctx2 = FixedContext {
            end_offsets: ends2,
            errors: Default::default(),
            invalid: Default::default(),
        };
        assert!(fetch.try_complete(&ctx2, Instant::now()));
        assert_eq!(fire_count.load(Ordering::SeqCst), 1);

        // Further calls are no-ops; the callback never fires twice.
        assert!(!fetch.try_complete(&ctx2, Instant::now()));
        assert_eq!(fire_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_partition_completes_immediately() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let fetch = DelayedFetch::new(
            vec![status("missing", 0, 1024)],
            1_000_000,
            Instant::now() + Duration::from_secs(10),
            move |results| {
                assert_eq!(results[0].error, Some(FetchError::UnknownTopicOrPartition));
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        let mut errors = std::collections::HashMap::new();
        errors.insert(Partition::new("missing", 0), FetchError::UnknownTopicOrPartition);
        let ctx = FixedContext {
            end_offsets: Default::default(),
            errors,
            invalid: Default::default(),
        };

        assert!(fetch.try_complete(&ctx, Instant::now()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_forces_completion_with_partial_bytes() {
        let fetch = DelayedFetch::new(vec![status("t", 0, 1024)], 1_000_000, Instant::now(), |_| {});
        let mut ends = std::collections::HashMap::new();
        ends.insert(Partition::new("t", 0), 10u64);
        let ctx = FixedContext {
            end_offsets: ends,
            errors: Default::default(),
            invalid: Default::default(),
        };
        assert!(fetch.try_complete(&ctx, Instant::now() + Duration::from_millis(1)));
    }
}
