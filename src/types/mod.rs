#![forbid(unsafe_code)]
//! Shared identifiers, the error taxonomy and on-disk page metadata.

/// Page checksums.
pub mod checksum;
/// Page header layout and codec.
pub mod page;

pub use checksum::{chunked_crc32, page_crc32, Checksum, Crc32Fast};

use std::fmt;

/// Position of a page in the database file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

/// Log sequence number of a committed file transaction.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Lsn(pub u64);

/// Dense id assigned to a location by the on-disk dictionary.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct LocationId(pub u32);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A source file as seen by the index: its portable path and the host's
/// modification stamp at the time it was handed to the index.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SourceFile {
    /// Portable, workspace-relative path.
    pub path: String,
    /// Modification stamp reported by the host.
    pub modification_stamp: u64,
}

impl SourceFile {
    /// Creates a source file handle.
    pub fn new(path: impl Into<String>, modification_stamp: u64) -> Self {
        Self {
            path: path.into(),
            modification_stamp,
        }
    }
}

impl fmt::Display for SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Programming or version-skew errors. They abort the current operation and
/// are never retried.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum FatalError {
    /// A pinned page was selected for eviction.
    #[error("attempted to evict pinned page {0}")]
    PinnedEviction(PageId),
    /// A layer ordinal was assigned twice.
    #[error("layer `{layer}` already has ordinal {existing}")]
    OrdinalReassigned {
        /// Layer name.
        layer: String,
        /// Ordinal assigned first.
        existing: u16,
    },
    /// A record carries a layer ordinal the running configuration does not know.
    #[error("record references layer ordinal {0} unknown to this configuration")]
    UnknownOrdinal(u16),
}

/// Details of a "requires full rebuild" failure.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RebuildRequired {
    /// Human readable cause.
    pub reason: String,
    /// Sources that still need indexing once the store is recreated.
    pub outstanding: Vec<SourceFile>,
    /// Whether the rebuild should be surfaced to the user. A first run with
    /// no index on disk is expected and stays quiet.
    pub report_as_error: bool,
}

/// Error type shared by every layer of the index.
#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Undecodable bytes found on disk.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Undecodable bytes found on disk, with context.
    #[error("corruption: {0}")]
    CorruptionOwned(String),
    /// The store is mid-rebuild or momentarily inconsistent.
    #[error("index temporarily unavailable: {0}")]
    Unavailable(&'static str),
    /// The store must be discarded and recomputed.
    #[error("index requires full rebuild: {}", .0.reason)]
    RebuildRequired(Box<RebuildRequired>),
    /// Logic or version-skew bug.
    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),
    /// Invalid argument supplied by the caller.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Invalid argument supplied by the caller, with context.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// A contributor failed to process a file.
    #[error("contributor `{contributor}` failed on {path}: {message}")]
    Contributor {
        /// Contributor name.
        contributor: String,
        /// File being processed.
        path: String,
        /// Failure description.
        message: String,
    },
    /// The operation processor has shut down.
    #[error("index operation processor stopped")]
    Stopped,
    /// The operation unwound before it produced a result.
    #[error("index operation `{0}` aborted")]
    Aborted(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, IndexError>;

/// How a caller should react to an [`IndexError`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FailureClass {
    /// Retry later, after backoff.
    Transient,
    /// Discard the store and rebuild it.
    RequiresRebuild,
    /// Bug; abort the operation, never retry.
    Fatal,
    /// The request itself failed; retrying the same input will fail again.
    Failed,
}

impl IndexError {
    /// Classifies the error for retry decisions.
    pub fn class(&self) -> FailureClass {
        match self {
            IndexError::Io(_) | IndexError::Unavailable(_) => FailureClass::Transient,
            IndexError::Corruption(_)
            | IndexError::CorruptionOwned(_)
            | IndexError::RebuildRequired(_) => FailureClass::RequiresRebuild,
            IndexError::Fatal(_) => FailureClass::Fatal,
            IndexError::Invalid(_)
            | IndexError::InvalidOwned(_)
            | IndexError::Contributor { .. }
            | IndexError::Stopped
            | IndexError::Aborted(_) => FailureClass::Failed,
        }
    }

    /// Builds a rebuild request.
    pub fn rebuild_required(
        reason: impl Into<String>,
        outstanding: Vec<SourceFile>,
        report_as_error: bool,
    ) -> Self {
        IndexError::RebuildRequired(Box::new(RebuildRequired {
            reason: reason.into(),
            outstanding,
            report_as_error,
        }))
    }

    /// Escalates corruption into a rebuild request carrying `outstanding`.
    /// Sources already attached to an existing rebuild request are kept and
    /// `outstanding` is appended without duplicates. Other errors pass through.
    pub fn escalate(self, outstanding: Vec<SourceFile>) -> Self {
        match self {
            IndexError::Corruption(msg) => IndexError::rebuild_required(msg, outstanding, true),
            IndexError::CorruptionOwned(msg) => {
                IndexError::rebuild_required(msg, outstanding, true)
            }
            IndexError::RebuildRequired(mut details) => {
                for file in outstanding {
                    if !details.outstanding.iter().any(|f| f.path == file.path) {
                        details.outstanding.push(file);
                    }
                }
                IndexError::RebuildRequired(details)
            }
            other => other,
        }
    }

    /// Returns rebuild details when this is a rebuild request.
    pub fn as_rebuild(&self) -> Option<&RebuildRequired> {
        match self {
            IndexError::RebuildRequired(details) => Some(details),
            _ => None,
        }
    }

    /// Shorthand for a contributor failure.
    pub fn contributor(
        contributor: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        IndexError::Contributor {
            contributor: contributor.into(),
            path: path.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        assert_eq!(
            IndexError::Unavailable("rebuilding").class(),
            FailureClass::Transient
        );
        assert_eq!(
            IndexError::Corruption("bad marker").class(),
            FailureClass::RequiresRebuild
        );
        assert_eq!(
            IndexError::from(FatalError::PinnedEviction(PageId(3))).class(),
            FailureClass::Fatal
        );
        assert_eq!(
            IndexError::contributor("dart", "a.dart", "boom").class(),
            FailureClass::Failed
        );
    }

    #[test]
    fn escalate_attaches_outstanding_sources() {
        let a = SourceFile::new("a.dart", 1);
        let b = SourceFile::new("b.dart", 2);
        let err = IndexError::Corruption("page crc mismatch").escalate(vec![a.clone()]);
        let err = err.escalate(vec![a.clone(), b.clone()]);
        let details = err.as_rebuild().expect("rebuild details");
        assert_eq!(details.reason, "page crc mismatch");
        assert_eq!(details.outstanding, vec![a, b]);
        assert!(details.report_as_error);
    }

    #[test]
    fn escalate_leaves_other_errors_alone() {
        let err = IndexError::Invalid("nope").escalate(vec![SourceFile::new("x", 0)]);
        assert!(matches!(err, IndexError::Invalid("nope")));
    }
}
