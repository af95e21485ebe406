//! A bounded pool of byte buffers shared by every partition's batches in a
//! [`super::RecordAccumulator`], with FIFO-ordered blocking allocation.
//!
//! Buffers sized exactly `poolable_size` (the configured batch size) are
//! recycled through a free list; any other size is carved directly out of
//! `available_memory` and released back to it on deallocation rather than
//! queued, since keeping odd-sized buffers around wouldn't help a future
//! allocation of the common size.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::AccumulatorError;

struct PoolState {
    free: VecDeque<Vec<u8>>,
    available_memory: usize,
    /// Tickets of threads currently waiting, oldest first. A waiter is
    /// only allowed to allocate once it reaches the front, so concurrent
    /// allocators are served in arrival order instead of whichever one the
    /// OS condvar happens to wake first.
    waiters: VecDeque<u64>,
}

pub struct BufferPool {
    total_memory: usize,
    poolable_size: usize,
    state: Mutex<PoolState>,
    condvar: Condvar,
    next_ticket: AtomicU64,
}

impl BufferPool {
    pub fn new(total_memory: usize, poolable_size: usize) -> Self {
        Self {
            total_memory,
            poolable_size,
            state: Mutex::new(PoolState {
                free: VecDeque::new(),
                available_memory: total_memory,
                waiters: VecDeque::new(),
            }),
            condvar: Condvar::new(),
            next_ticket: AtomicU64::new(0),
        }
    }

    pub fn total_memory(&self) -> usize {
        self.total_memory
    }

    /// Bytes not presently handed out to a caller, whether sitting in the
    /// poolable-size free list or in general `available_memory`.
    pub fn free_bytes(&self) -> usize {
        let state = self.state.lock();
        state.available_memory + state.free.len() * self.poolable_size
    }

    pub fn allocated_bytes(&self) -> usize {
        self.total_memory - self.free_bytes()
    }

    /// Take a buffer of exactly `size` bytes, blocking up to `max_block` if
    /// the pool is temporarily exhausted.
    pub fn allocate(&self, size: usize, max_block: Duration) -> Result<Vec<u8>, AccumulatorError> {
        if size > self.total_memory {
            return Err(AccumulatorError::OversizedAllocation { requested: size, total: self.total_memory });
        }

        if size == self.poolable_size {
            let mut state = self.state.lock();
            if let Some(buf) = state.free.pop_front() {
                return Ok(buf);
            }
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + max_block;
        let mut state = self.state.lock();
        state.waiters.push_back(ticket);

        let result = loop {
            let free_list_bytes = state.free.len() * self.poolable_size;
            let is_our_turn = state.waiters.front() == Some(&ticket);
            if is_our_turn && state.available_memory + free_list_bytes >= size {
                while state.available_memory < size && !state.free.is_empty() {
                    state.free.pop_back();
                    state.available_memory += self.poolable_size;
                }
                state.available_memory -= size;
                break Ok(vec![0u8; size]);
            }

            let now = Instant::now();
            if now >= deadline {
                break Err(AccumulatorError::AllocTimeout);
            }
            self.condvar.wait_for(&mut state, deadline - now);
        };

        state.waiters.retain(|&t| t != ticket);
        if result.is_ok() {
            // Freeing memory for us may also have freed enough for the
            // next waiter in line (e.g. several small allocations fit in
            // the memory reclaimed from one evicted free-list buffer).
            self.condvar.notify_all();
        }
        result
    }

    /// Return `buffer` to the pool. `size` must be the size it was
    /// allocated with (the pool does not store sizes per-buffer).
    pub fn deallocate(&self, mut buffer: Vec<u8>, size: usize) {
        let mut state = self.state.lock();
        if size == self.poolable_size {
            buffer.clear();
            state.free.push_back(buffer);
        } else {
            drop(buffer);
            state.available_memory += size;
        }
        drop(state);
        self.condvar.notify_all();
    }
}
