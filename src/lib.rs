//! Core subsystems of a partitioned, append-only commit log broker.
//!
//! This crate implements the pieces that make log compaction, offset
//! indexing, delayed fetch completion, producer-side batching, and consumer
//! group membership correct and concurrency-safe. Everything outside of
//! these subsystems (wire protocol framing, replication, network I/O,
//! metrics emission, authentication) is treated as an external collaborator
//! and is not modeled here, beyond the minimal traits needed to exercise the
//! core logic in isolation.

pub mod accumulator;
pub mod cleaner;
pub mod codec;
pub mod fetch;
pub mod group;
pub mod index;
pub mod offset_map;
pub mod record;
pub mod segment;

pub use group::{GroupError, GroupMetadata, GroupState, MemberMetadata};
pub use record::{Compression, Record};
pub use segment::{FileSegmentLog, Segment, SegmentLog};
