//! Roster Cache Library
//!
//! Fetches a remote HTML document, caches it on disk and in memory, and
//! serves it to concurrent readers with at most one fetch in flight.

pub mod cache;
pub mod cli;
pub mod fetch;
pub mod logging;
pub mod refresh;
