//! Index data model: locations, layers, per-location payloads and per-file
//! aggregates, with their byte codecs.

/// Per-file aggregates.
pub mod file_info;
/// Layers and per-location payloads.
pub mod layer;
/// Reference sites.
pub mod location;

pub use file_info::{Dependency, Edge, FileInfo};
pub use layer::{Layer, LayerId, LayerInfo, LayerKind, LayerSchema, LayerSet, LocationInfo};
pub use location::{Location, LocationType};
