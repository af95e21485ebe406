//! A single producer batch: a fixed-capacity buffer of encoded records
//! destined for one partition, plus the per-record callbacks waiting on
//! its eventual send.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::cleaner::Partition;
use crate::record::{encode_record, Compression, Record};

/// Delivery metadata handed to a record's callback once its batch has been
/// sent (sending itself -- the network dispatcher -- is out of scope here;
/// `complete` just fires callbacks with the partition and the record's
/// position within the batch).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordMetadata {
    pub partition: Partition,
    pub relative_offset: usize,
}

pub struct Thunk {
    pub callback: Box<dyn FnOnce(RecordMetadata) + Send>,
}

/// `{partition, memoryBuffer, recordCount, attempts, createdMs,
/// lastAttemptMs, lastAppendTime, thunks, retry}` from the data model,
/// backed by a plain growable buffer (the pooled allocation itself is
/// handed in by the accumulator, which owns pool accounting).
pub struct RecordBatch {
    pub partition: Partition,
    buffer: Mutex<Vec<u8>>,
    capacity: usize,
    record_count: AtomicUsize,
    attempts: AtomicU32,
    created_ms: i64,
    last_attempt_ms: AtomicI64,
    last_append_time: AtomicI64,
    thunks: Mutex<Vec<Thunk>>,
    retry: AtomicBool,
    sealed: AtomicBool,
}

impl RecordBatch {
    pub fn new(partition: Partition, buffer: Vec<u8>, capacity: usize, now: i64) -> Self {
        Self {
            partition,
            buffer: Mutex::new(buffer),
            capacity,
            record_count: AtomicUsize::new(0),
            attempts: AtomicU32::new(0),
            created_ms: now,
            last_attempt_ms: AtomicI64::new(now),
            last_append_time: AtomicI64::new(now),
            thunks: Mutex::new(Vec::new()),
            retry: AtomicBool::new(false),
            sealed: AtomicBool::new(false),
        }
    }

    pub fn record_count(&self) -> usize {
        self.record_count.load(Ordering::Acquire)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn created_ms(&self) -> i64 {
        self.created_ms
    }

    pub fn last_attempt_ms(&self) -> i64 {
        self.last_attempt_ms.load(Ordering::Acquire)
    }

    pub fn last_append_time(&self) -> i64 {
        self.last_append_time.load(Ordering::Acquire)
    }

    pub fn is_retry(&self) -> bool {
        self.retry.load(Ordering::Acquire)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn size_bytes(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.sealed.load(Ordering::Acquire) || (self.record_count() > 0 && self.size_bytes() >= self.capacity)
    }

    /// Whether a record encoding to `encoded_len` bytes would fit without
    /// sealing or overflowing this batch. Callers are expected to check
    /// this (under the same lock they'll call `try_append` with) before
    /// committing to a callback that `try_append` would otherwise have to
    /// drop on a failed attempt.
    pub fn has_room(&self, encoded_len: usize) -> bool {
        if self.sealed.load(Ordering::Acquire) {
            return false;
        }
        let current_len = self.buffer.lock().len();
        current_len == 0 || current_len + encoded_len <= self.capacity
    }

    /// Reclaim the batch's underlying buffer, e.g. to return it to the
    /// buffer pool once the batch has been fully acknowledged.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer.into_inner()
    }

    /// Append one record. The caller must already have established (via
    /// [`RecordBatch::has_room`], under the same lock) that the record
    /// fits; this is only a defensive re-check, since `callback` is
    /// consumed unconditionally and would otherwise be lost on a failed
    /// attempt.
    pub fn try_append(
        &self,
        timestamp: i64,
        key: Option<Bytes>,
        value: Option<Bytes>,
        now: i64,
        callback: impl FnOnce(RecordMetadata) + Send + 'static,
    ) -> Option<usize> {
        let record = Record { offset: 0, timestamp, key, value, compression: Compression::None };
        if !self.has_room(record.encoded_len()) {
            return None;
        }

        let mut buffer = self.buffer.lock();
        encode_record(&record, &mut *buffer).expect("writing to an in-memory Vec cannot fail");
        drop(buffer);

        let relative_offset = self.record_count.fetch_add(1, Ordering::AcqRel);
        self.last_append_time.store(now, Ordering::Release);
        self.thunks.lock().push(Thunk { callback: Box::new(callback) });
        Some(relative_offset)
    }

    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn record_attempt(&self, now: i64) {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        self.last_attempt_ms.store(now, Ordering::Release);
    }

    pub fn mark_retry(&self) {
        self.retry.store(true, Ordering::Release);
    }

    /// Fire every registered thunk, in append order. Intended to be called
    /// exactly once, by the dispatcher, after the batch has actually been
    /// sent (or finally given up on).
    pub fn complete(&self) {
        let thunks = std::mem::take(&mut *self.thunks.lock());
        for (relative_offset, thunk) in thunks.into_iter().enumerate() {
            (thunk.callback)(RecordMetadata { partition: self.partition.clone(), relative_offset });
        }
    }
}
