//! The delayed-fetch operation and its purgatory (spec component C3): a
//! fetch request is held until enough data is available, its source
//! partitions become invalid, or a deadline passes.

mod delayed_fetch;
mod purgatory;

pub use delayed_fetch::{
    DelayedFetch, FetchContext, FetchError, FetchPartitionStatus, FetchResult, PartitionFetchResult,
};
pub use purgatory::DelayedFetchPurgatory;
