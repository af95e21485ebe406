//! The batching queue itself: `append` from many producer threads, `ready`
//! and `drain` from a single dispatcher thread.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::cleaner::Partition;

use super::buffer_pool::BufferPool;
use super::record_batch::{RecordBatch, RecordMetadata};
use super::AccumulatorError;

pub type NodeId = i32;

pub trait ClusterMetadata: Send + Sync {
    fn leader_node(&self, partition: &Partition) -> Option<NodeId>;
}

#[derive(Clone, Debug)]
pub struct AccumulatorOptions {
    pub batch_size: usize,
    pub total_memory: usize,
    pub linger_ms: i64,
    pub retry_backoff_ms: i64,
    pub request_timeout_ms: i64,
}

impl Default for AccumulatorOptions {
    fn default() -> Self {
        Self {
            batch_size: 16 * 1024,
            total_memory: 32 * 1024 * 1024,
            linger_ms: 0,
            retry_backoff_ms: 100,
            request_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Default)]
pub struct ReadyResult {
    pub ready_nodes: HashSet<NodeId>,
    /// Milliseconds until the next partition becomes sendable purely by
    /// waiting; `i64::MAX` if nothing is pending.
    pub next_delay_ms: i64,
    pub has_unknown_leader: bool,
}

pub type DrainResult = HashMap<NodeId, Vec<Arc<RecordBatch>>>;

type Deque = Arc<Mutex<VecDeque<Arc<RecordBatch>>>>;

pub struct RecordAccumulator {
    options: AccumulatorOptions,
    batches: RwLock<Arc<HashMap<Partition, Deque>>>,
    incomplete: Mutex<Vec<Arc<RecordBatch>>>,
    free: BufferPool,
    appends_in_progress: AtomicIsize,
    flushes_in_progress: AtomicIsize,
    muted: Mutex<HashSet<Partition>>,
    drain_index: AtomicUsize,
}

impl RecordAccumulator {
    pub fn new(options: AccumulatorOptions) -> Self {
        let free = BufferPool::new(options.total_memory, options.batch_size);
        Self {
            options,
            batches: RwLock::new(Arc::new(HashMap::new())),
            incomplete: Mutex::new(Vec::new()),
            free,
            appends_in_progress: AtomicIsize::new(0),
            flushes_in_progress: AtomicIsize::new(0),
            muted: Mutex::new(HashSet::new()),
            drain_index: AtomicUsize::new(0),
        }
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.free
    }

    fn deque_for(&self, partition: &Partition) -> Deque {
        if let Some(deque) = self.batches.read().get(partition) {
            return deque.clone();
        }
        let mut write_guard = self.batches.write();
        if let Some(deque) = write_guard.get(partition) {
            return deque.clone();
        }
        let mut next = HashMap::clone(&write_guard);
        let deque: Deque = Arc::new(Mutex::new(VecDeque::new()));
        next.insert(partition.clone(), deque.clone());
        *write_guard = Arc::new(next);
        deque
    }

    /// Append one record, batching it with whatever is already queued for
    /// `partition`. May block up to `max_block_ms` if the buffer pool is
    /// exhausted.
    pub fn append(
        &self,
        partition: Partition,
        timestamp: i64,
        key: Option<Bytes>,
        value: Option<Bytes>,
        now: i64,
        max_block_ms: u64,
        callback: impl FnOnce(RecordMetadata) + Send + 'static,
    ) -> Result<usize, AccumulatorError> {
        self.appends_in_progress.fetch_add(1, Ordering::AcqRel);
        let _guard = scopeguard::guard((), |_| {
            self.appends_in_progress.fetch_sub(1, Ordering::AcqRel);
        });

        let deque = self.deque_for(&partition);
        let key_len = key.as_ref().map_or(0, |k| k.len());
        let value_len = value.as_ref().map_or(0, |v| v.len());
        let encoded_len = crate::record::frame_len(key_len, value_len);
        let record_size = 64 + key_len + value_len;

        {
            let guard = deque.lock();
            if guard.back().is_some_and(|last| last.has_room(encoded_len)) {
                let offset = guard.back().unwrap().try_append(timestamp, key, value, now, callback).expect(
                    "has_room was just checked under the same lock",
                );
                return Ok(offset);
            }
        }

        let alloc_size = self.options.batch_size.max(record_size);
        let buffer = self.free.allocate(alloc_size, Duration::from_millis(max_block_ms))?;

        let mut guard = deque.lock();
        if guard.back().is_some_and(|last| last.has_room(encoded_len)) {
            let offset = guard
                .back()
                .unwrap()
                .try_append(timestamp, key, value, now, callback)
                .expect("has_room was just checked under the same lock");
            self.free.deallocate(buffer, alloc_size);
            return Ok(offset);
        }

        let batch = Arc::new(RecordBatch::new(partition, buffer, alloc_size, now));
        let offset = batch
            .try_append(timestamp, key, value, now, callback)
            .expect("freshly allocated batch always fits the record that sized it");
        guard.push_back(batch);
        Ok(offset)
    }

    /// Determine which destination nodes have sendable data.
    pub fn ready(&self, cluster: &dyn ClusterMetadata, now: i64) -> ReadyResult {
        let mut result = ReadyResult { next_delay_ms: i64::MAX, ..Default::default() };
        let snapshot = self.batches.read().clone();
        let flush_in_progress = self.flushes_in_progress.load(Ordering::Acquire) > 0;
        let exhausted = self.free.free_bytes() == 0;

        for (partition, deque) in snapshot.iter() {
            let guard = deque.lock();
            let Some(head) = guard.front() else { continue };

            let waited = now - head.last_attempt_ms();
            let wait_for = if head.attempts() > 0 { self.options.retry_backoff_ms } else { self.options.linger_ms };
            let backing_off = head.attempts() > 0 && head.last_attempt_ms() + self.options.retry_backoff_ms > now;
            let full = guard.len() > 1 || head.is_full();
            let expired = waited >= wait_for;
            drop(guard);

            let sendable = (full || expired || exhausted || flush_in_progress) && !backing_off;

            match cluster.leader_node(partition) {
                None => result.has_unknown_leader = true,
                Some(node) => {
                    if sendable {
                        result.ready_nodes.insert(node);
                    } else {
                        result.next_delay_ms = result.next_delay_ms.min(wait_for - waited);
                    }
                }
            }
        }
        result
    }

    /// Drain head batches for each of `nodes`, round-robin across their
    /// partitions, until adding the next batch would exceed `max_size`.
    pub fn drain(&self, cluster: &dyn ClusterMetadata, nodes: &[NodeId], max_size: usize, now: i64) -> DrainResult {
        let snapshot = self.batches.read().clone();
        let muted = self.muted.lock();
        let mut result = DrainResult::new();

        for &node in nodes {
            let mut partitions: Vec<&Partition> = snapshot
                .keys()
                .filter(|p| cluster.leader_node(p) == Some(node) && !muted.contains(*p))
                .collect();
            partitions.sort_unstable();
            if partitions.is_empty() {
                continue;
            }

            let start = self.drain_index.load(Ordering::Relaxed) % partitions.len();
            let mut drained = Vec::new();
            let mut size = 0usize;

            for i in 0..partitions.len() {
                let partition = partitions[(start + i) % partitions.len()];
                let deque = &snapshot[partition];
                let mut guard = deque.lock();
                let Some(head) = guard.front() else { continue };
                let batch_size = head.size_bytes();
                if !drained.is_empty() && size + batch_size > max_size {
                    continue;
                }
                let batch = guard.pop_front().unwrap();
                batch.seal();
                batch.record_attempt(now);
                size += batch_size;
                drained.push(batch.clone());
                self.incomplete.lock().push(batch);
            }

            if !drained.is_empty() {
                result.insert(node, drained);
            }
        }

        self.drain_index.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Push a batch that failed to send back onto the front of its
    /// partition's deque, preserving order for the next drain.
    pub fn reenqueue(&self, batch: Arc<RecordBatch>, now: i64) {
        batch.record_attempt(now);
        batch.mark_retry();
        let deque = self.deque_for(&batch.partition.clone());
        deque.lock().push_front(batch);
    }

    /// Acknowledge that `batch` was fully processed (sent, or permanently
    /// failed); fires its thunks and releases it from the incomplete set.
    pub fn acknowledge(&self, batch: &Arc<RecordBatch>) {
        batch.complete();
        self.incomplete.lock().retain(|b| !Arc::ptr_eq(b, batch));
    }

    /// Expire batches that have been waiting past `request_timeout_ms`.
    /// Returns the expired batches for the caller to fail; they are
    /// removed from their partition's deque.
    pub fn abort_expired_batches(&self, now: i64) -> Vec<Arc<RecordBatch>> {
        let timeout = self.options.request_timeout_ms;
        let snapshot = self.batches.read().clone();
        let muted = self.muted.lock();
        let mut expired = Vec::new();

        for (partition, deque) in snapshot.iter() {
            if muted.contains(partition) {
                continue;
            }
            let mut guard = deque.lock();
            while let Some(head) = guard.front() {
                let is_expired = if head.is_retry() {
                    now > head.last_attempt_ms() + self.options.retry_backoff_ms + timeout
                } else {
                    (head.is_full() && now - head.last_append_time() > timeout)
                        || now > head.created_ms() + self.options.linger_ms + timeout
                };
                if !is_expired {
                    break;
                }
                expired.push(guard.pop_front().unwrap());
            }
        }
        expired
    }

    pub fn mute(&self, partition: Partition) {
        self.muted.lock().insert(partition);
    }

    pub fn unmute(&self, partition: &Partition) {
        self.muted.lock().remove(partition);
    }

    pub fn incomplete_count(&self) -> usize {
        self.incomplete.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct SingleLeader(NodeId);
    impl ClusterMetadata for SingleLeader {
        fn leader_node(&self, _partition: &Partition) -> Option<NodeId> {
            Some(self.0)
        }
    }

    #[test]
    fn append_batches_into_one_buffer() {
        let accumulator = RecordAccumulator::new(AccumulatorOptions { batch_size: 1024, ..Default::default() });
        let partition = Partition::new("t", 0);
        let fired = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..5 {
            let fired = fired.clone();
            accumulator
                .append(partition.clone(), 0, None, Some(Bytes::from_static(b"v")), 0, 1000, move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        let deque = accumulator.deque_for(&partition);
        assert_eq!(deque.lock().len(), 1);
        assert_eq!(deque.lock().back().unwrap().record_count(), 5);
    }

    #[test]
    fn ready_reports_linger_expiry() {
        let accumulator = RecordAccumulator::new(AccumulatorOptions {
            batch_size: 1024,
            linger_ms: 100,
            ..Default::default()
        });
        let partition = Partition::new("t", 0);
        accumulator.append(partition.clone(), 0, None, Some(Bytes::from_static(b"v")), 0, 1000, |_| {}).unwrap();

        let cluster = SingleLeader(7);
        let result = accumulator.ready(&cluster, 50);
        assert!(result.ready_nodes.is_empty());
        assert_eq!(result.next_delay_ms, 50);

        let result = accumulator.ready(&cluster, 100);
        assert!(result.ready_nodes.contains(&7));
    }

    #[test]
    fn ready_reports_full_batch_before_linger_elapses() {
        // S5: a single batch that is already full overrides linger, even
        // with only one batch in the deque (no second batch needed to
        // force a send).
        let accumulator = RecordAccumulator::new(AccumulatorOptions {
            batch_size: 1,
            linger_ms: 100,
            ..Default::default()
        });
        let partition = Partition::new("t", 0);
        accumulator.append(partition.clone(), 0, None, Some(Bytes::from_static(b"v")), 0, 1000, |_| {}).unwrap();

        let deque = accumulator.deque_for(&partition);
        assert_eq!(deque.lock().len(), 1);
        assert!(deque.lock().back().unwrap().is_full());

        let cluster = SingleLeader(7);
        let result = accumulator.ready(&cluster, 1);
        assert!(result.ready_nodes.contains(&7), "a full single batch must be sendable before linger elapses");
    }

    #[test]
    fn drain_seals_and_tracks_incomplete() {
        let accumulator = RecordAccumulator::new(AccumulatorOptions { batch_size: 1024, ..Default::default() });
        let partition = Partition::new("t", 0);
        accumulator.append(partition.clone(), 0, None, Some(Bytes::from_static(b"v")), 0, 1000, |_| {}).unwrap();

        let cluster = SingleLeader(7);
        let drained = accumulator.drain(&cluster, &[7], 1024 * 1024, 0);
        let batches = drained.get(&7).unwrap();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_sealed());
        assert_eq!(accumulator.incomplete_count(), 1);
    }

    #[test]
    fn reenqueue_preserves_head_position() {
        let accumulator = RecordAccumulator::new(AccumulatorOptions { batch_size: 1024, ..Default::default() });
        let partition = Partition::new("t", 0);
        accumulator.append(partition.clone(), 0, None, Some(Bytes::from_static(b"first")), 0, 1000, |_| {}).unwrap();

        let cluster = SingleLeader(7);
        let drained = accumulator.drain(&cluster, &[7], 1024 * 1024, 0);
        let batch = drained.get(&7).unwrap()[0].clone();

        accumulator.append(partition.clone(), 0, None, Some(Bytes::from_static(b"second")), 0, 1000, |_| {}).unwrap();
        accumulator.reenqueue(batch, 10);

        let deque = accumulator.deque_for(&partition);
        assert_eq!(deque.lock().front().unwrap().record_count(), 1);
        assert!(deque.lock().front().unwrap().is_retry());
    }
}
