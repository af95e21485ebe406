//! The producer-side record accumulator (spec component C4): a bounded,
//! multi-producer batching queue that coalesces records per destination
//! partition and exposes a readiness oracle to a single I/O dispatcher.

mod accumulator;
mod buffer_pool;
mod record_batch;

pub use accumulator::{AccumulatorOptions, DrainResult, ReadyResult, RecordAccumulator};
pub use buffer_pool::BufferPool;
pub use record_batch::{RecordBatch, RecordMetadata, Thunk};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccumulatorError {
    #[error("buffer pool exhausted: no memory became available within the blocking deadline")]
    AllocTimeout,
    #[error("requested buffer size {requested} exceeds total pool memory {total}")]
    OversizedAllocation { requested: usize, total: usize },
}
