//! A time-ordered collection of [`DelayedFetch`] waiters, driven either by
//! a reaper sweeping expired deadlines or by produce-side activity calling
//! [`DelayedFetchPurgatory::try_complete_all`] for a partition it just
//! appended to.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::cleaner::Partition;

use super::delayed_fetch::FetchContext;
use super::DelayedFetch;

struct HeapEntry {
    id: u64,
    deadline: Instant,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the earliest deadline first.
        other.deadline.cmp(&self.deadline)
    }
}

struct PurgatoryState {
    heap: BinaryHeap<HeapEntry>,
    by_id: HashMap<u64, Arc<DelayedFetch>>,
    by_partition: HashMap<Partition, Vec<u64>>,
}

pub struct DelayedFetchPurgatory {
    next_id: AtomicU64,
    state: Mutex<PurgatoryState>,
    condvar: Condvar,
}

impl Default for DelayedFetchPurgatory {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayedFetchPurgatory {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            state: Mutex::new(PurgatoryState {
                heap: BinaryHeap::new(),
                by_id: HashMap::new(),
                by_partition: HashMap::new(),
            }),
            condvar: Condvar::new(),
        }
    }

    /// Register a waiter. First tries to complete it immediately (it may
    /// already be satisfiable, in which case it never touches the heap).
    pub fn watch(&self, fetch: Arc<DelayedFetch>, ctx: &dyn FetchContext) {
        if fetch.try_complete(ctx, Instant::now()) {
            return;
        }

        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let deadline = fetch.deadline();
        let partitions: Vec<Partition> = fetch.partitions().iter().map(|p| p.partition.clone()).collect();

        let mut state = self.state.lock();
        state.heap.push(HeapEntry { id, deadline });
        state.by_id.insert(id, fetch);
        for partition in partitions {
            state.by_partition.entry(partition).or_default().push(id);
        }
    }

    /// Re-evaluate every watcher registered for `partition`, removing the
    /// ones that complete. Called after a produce appends new data, so
    /// waiters don't have to sit until the reaper's next sweep.
    pub fn try_complete_all(&self, partition: &Partition, ctx: &dyn FetchContext) -> usize {
        let ids = {
            let state = self.state.lock();
            state.by_partition.get(partition).cloned().unwrap_or_default()
        };

        let mut completed = 0;
        for id in ids {
            let fetch = {
                let state = self.state.lock();
                state.by_id.get(&id).cloned()
            };
            let Some(fetch) = fetch else { continue };
            if fetch.try_complete(ctx, Instant::now()) {
                self.remove(id);
                completed += 1;
            }
        }
        if completed > 0 {
            self.condvar.notify_all();
        }
        completed
    }

    /// Pop every watcher whose deadline has passed and force them to
    /// complete with whatever is available. Intended to run on a dedicated
    /// reaper thread, woken by `wait_for_work`.
    pub fn reap_expired(&self, ctx: &dyn FetchContext) -> usize {
        let now = Instant::now();
        let mut expired_ids = Vec::new();
        {
            let mut state = self.state.lock();
            while let Some(entry) = state.heap.peek() {
                if entry.deadline > now {
                    break;
                }
                let entry = state.heap.pop().unwrap();
                if state.by_id.contains_key(&entry.id) {
                    expired_ids.push(entry.id);
                }
            }
        }

        let mut completed = 0;
        for id in expired_ids {
            let fetch = {
                let state = self.state.lock();
                state.by_id.get(&id).cloned()
            };
            if let Some(fetch) = fetch {
                // Deadline already passed; `try_complete` will force it
                // regardless of how much data is available.
                fetch.try_complete(ctx, now);
                self.remove(id);
                completed += 1;
            }
        }
        completed
    }

    /// Block the calling (reaper) thread until either the earliest
    /// deadline elapses or `max_wait` passes, whichever comes first.
    pub fn wait_for_work(&self, max_wait: Duration) {
        let mut state = self.state.lock();
        let wait = state
            .heap
            .peek()
            .map(|e| e.deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(max_wait)
            .min(max_wait);
        self.condvar.wait_for(&mut state, wait);
    }

    fn remove(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some(fetch) = state.by_id.remove(&id) {
            for status in fetch.partitions() {
                if let Some(ids) = state.by_partition.get_mut(&status.partition) {
                    ids.retain(|&i| i != id);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::delayed_fetch::{FetchContext, FetchError, FetchPartitionStatus};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering2};
    use std::time::Duration;

    struct FixedContext {
        end_offset: u64,
    }
    impl FetchContext for FixedContext {
        fn leader_end_offset(&self, _partition: &Partition) -> Result<u64, FetchError> {
            Ok(self.end_offset)
        }
        fn offset_still_valid(&self, _partition: &Partition, _requested_offset: u64) -> bool {
            true
        }
    }

    #[test]
    fn watch_completes_immediately_when_already_satisfiable() {
        let purgatory = DelayedFetchPurgatory::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let fetch = Arc::new(DelayedFetch::new(
            vec![FetchPartitionStatus { partition: Partition::new("t", 0), requested_offset: 0, max_bytes: 10 }],
            1,
            Instant::now() + Duration::from_secs(10),
            move |_| {
                fired_clone.fetch_add(1, AtomicOrdering2::SeqCst);
            },
        ));
        purgatory.watch(fetch, &FixedContext { end_offset: 100 });
        assert_eq!(fired.load(AtomicOrdering2::SeqCst), 1);
        assert!(purgatory.is_empty());
    }

    #[test]
    fn try_complete_all_wakes_pending_watcher_on_produce() {
        let purgatory = DelayedFetchPurgatory::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let partition = Partition::new("t", 0);
        let fetch = Arc::new(DelayedFetch::new(
            vec![FetchPartitionStatus { partition: partition.clone(), requested_offset: 0, max_bytes: 1000 }],
            500,
            Instant::now() + Duration::from_secs(10),
            move |_| {
                fired_clone.fetch_add(1, AtomicOrdering2::SeqCst);
            },
        ));
        purgatory.watch(fetch, &FixedContext { end_offset: 10 });
        assert_eq!(purgatory.len(), 1);

        let completed = purgatory.try_complete_all(&partition, &FixedContext { end_offset: 10 });
        assert_eq!(completed, 0);

        let completed = purgatory.try_complete_all(&partition, &FixedContext { end_offset: 600 });
        assert_eq!(completed, 1);
        assert_eq!(fired.load(AtomicOrdering2::SeqCst), 1);
        assert!(purgatory.is_empty());
    }

    #[test]
    fn reap_expired_forces_timed_out_watchers() {
        let purgatory = DelayedFetchPurgatory::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let fetch = Arc::new(DelayedFetch::new(
            vec![FetchPartitionStatus { partition: Partition::new("t", 0), requested_offset: 0, max_bytes: 10 }],
            1_000_000,
            Instant::now() + Duration::from_millis(1),
            move |_| {
                fired_clone.fetch_add(1, AtomicOrdering2::SeqCst);
            },
        ));
        purgatory.watch(fetch, &FixedContext { end_offset: 0 });
        std::thread::sleep(Duration::from_millis(5));
        let completed = purgatory.reap_expired(&FixedContext { end_offset: 0 });
        assert_eq!(completed, 1);
        assert_eq!(fired.load(AtomicOrdering2::SeqCst), 1);
    }
}
