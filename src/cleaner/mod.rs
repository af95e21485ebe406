//! The log cleaner (spec components C1b and C1c): per-segment compaction
//! plus the manager that selects which partition to clean next and
//! coordinates abort/pause with whatever external code truncates logs.

mod checkpoint;
mod cleaner;
mod manager;

pub use checkpoint::Checkpoint;
pub use cleaner::{CleanOutcome, Cleaner, CleanerOptions};
pub use manager::{CleanerManager, LogCleaningState, LogRegistry, LogToClean};

use std::fmt;
use std::io;

use thiserror::Error;

/// A `(topic, partition)` pair, the unit of cleaning selection.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct Partition {
    pub topic: String,
    pub partition: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.topic, self.partition)
    }
}

#[derive(Debug, Error)]
pub enum CleanerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cleaning of {0} was aborted")]
    CleaningAborted(Partition),

    #[error("cleaner thread is shutting down")]
    ThreadShutdown,

    #[error("{partition}: dedupe buffer could not fit a single full segment; increase dedupeBufferSize")]
    DedupeBufferTooSmall { partition: Partition },

    #[error("{partition}: {source}")]
    MessageTooLarge {
        partition: Partition,
        #[source]
        source: io::Error,
    },

    #[error("segment error: {0}")]
    Segment(#[from] crate::segment::SegmentError),

    #[error("index error: {0}")]
    Index(#[from] crate::index::IndexError),
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("partition {0} is not eligible for {1}: current state is {2:?}")]
    IllegalState(Partition, &'static str, Option<LogCleaningState>),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
