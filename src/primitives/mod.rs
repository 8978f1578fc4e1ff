//! Low-level building blocks of the paged store.
//!
//! Byte codecs, positioned file I/O, the 2Q page cache, the write-ahead log,
//! the writer lock and the pager that ties them together.

/// Varints and bounds-checked byte readers/writers.
pub mod bytes;

/// Arena-backed 2Q page cache.
pub mod cache;

/// Cross-process writer lock.
pub mod concurrency;

/// Positioned file I/O.
pub mod io;

/// Page allocation, transactions and recovery.
pub mod pager;

/// Write-ahead log of committed page images.
pub mod wal;
