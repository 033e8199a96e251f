//! Cache module for the remote document
//!
//! This module provides a single-flight cache that serves the document from
//! memory while it is fresh, refreshes it at most once at a time when it is
//! not, and persists every successful fetch to disk. Failed refreshes degrade
//! gracefully to the last known content, in memory or on disk.

mod single_flight;
mod store;

pub use single_flight::{
    CacheEntry, CacheStatus, Clock, FetchError, SingleFlightCache, SystemClock,
};
pub use store::{PersistentStore, StorageError, CACHE_FILE_NAME};
