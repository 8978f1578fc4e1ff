//! Incremental, disk-backed cross-reference index.
//!
//! Contributors turn source files into locations, layer edges and
//! dependencies; a [`FileTransaction`] applies one file's edits atomically
//! to a paged, write-ahead-logged store; an [`IndexService`] serializes all
//! updates and queries through one worker thread and rebuilds the store
//! when it turns out to be corrupt.

#![warn(missing_docs)]

/// Index options loaded from TOML.
pub mod config;
/// Update protocol, read view, queries and the contributor registry.
pub mod index;
/// Locations, layers and per-file aggregates.
pub mod model;
/// Operation queue, worker thread and rebuild backoff.
pub mod ops;
/// Byte codecs, page cache, pager and write-ahead log.
pub mod primitives;
/// Paged storage of layer payloads, file infos and dependents.
pub mod storage;
/// Identifiers, errors and the page header.
pub mod types;

mod service;

pub use config::{ConfigError, IndexOptions};
pub use index::{
    Contributor, FileTransaction, FnContributor, IndexConfiguration, LayerUpdater, Query,
};
pub use model::{FileInfo, Layer, LayerKind, Location, LocationInfo, LocationType};
pub use service::IndexService;
pub use storage::PagedStorage;
pub use types::{FailureClass, IndexError, Result, SourceFile};
