//! The sparse, memory-mapped offset index (spec component C2).
//!
//! Modeled directly on `commitlog::index::indexfile`: a fixed-capacity,
//! memory-mapped region of packed fixed-size entries, with the same
//! create-or-open-existing dance and the same "append must be monotonic"
//! contract. The entry layout differs (`u32` relative offset + `u32` file
//! position, big-endian, rather than the teacher's `u64`/`u64` key-value
//! pairs) because this index is keyed by *log offset*, which the segment
//! roll policy guarantees fits in 32 bits relative to the segment's base
//! offset.

mod mapped_region;
mod offset_index;

pub use mapped_region::MappedRegion;
pub use offset_index::{OffsetIndex, ENTRY_SIZE};

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("offset {new} does not exceed last indexed offset {last}")]
    InvalidOffset { new: u64, last: u64 },

    #[error("index is full: {entries} entries already occupy the configured capacity")]
    Full { entries: usize },

    #[error("index sanity check failed: {0}")]
    CorruptIndex(String),
}
