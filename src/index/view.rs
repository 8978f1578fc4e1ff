//! Read view handed to queries on the worker thread.

use std::collections::BTreeSet;

use crate::model::{FileInfo, Layer, LayerSet, Location, LocationInfo};
use crate::storage::PagedStorage;
use crate::types::{IndexError, Result, SourceFile};

/// Consistent view of the index for the duration of one query.
///
/// Only the worker constructs it, between operations, so no transaction is
/// ever open while a query runs.
pub struct Index<'a> {
    storage: &'a mut PagedStorage,
    layers: &'a LayerSet,
}

impl<'a> Index<'a> {
    /// View over `storage` resolving ordinals through `layers`.
    pub fn new(storage: &'a mut PagedStorage, layers: &'a LayerSet) -> Self {
        Self { storage, layers }
    }

    /// Layers of the running configuration.
    pub fn layers(&self) -> &LayerSet {
        self.layers
    }

    fn check_layer(&self, layer: &Layer) -> Result<()> {
        if self.layers.contains(layer) {
            Ok(())
        } else {
            Err(IndexError::InvalidOwned(format!(
                "layer `{}` is not registered with this index",
                layer.id()
            )))
        }
    }

    /// Payload of `location` in `layer`; empty when nothing references it.
    pub fn location_info(&mut self, layer: &Layer, location: &Location) -> Result<LocationInfo> {
        self.check_layer(layer)?;
        self.storage.read_location_info(layer, location)
    }

    /// Locations referencing `location` in `layer`.
    pub fn references(&mut self, layer: &Layer, location: &Location) -> Result<BTreeSet<Location>> {
        Ok(match self.location_info(layer, location)? {
            LocationInfo::ReverseEdges { sources } | LocationInfo::Bidirectional { sources, .. } => {
                sources
            }
        })
    }

    /// Locations `location` references in a bidirectional `layer`.
    pub fn forward_references(
        &mut self,
        layer: &Layer,
        location: &Location,
    ) -> Result<BTreeSet<Location>> {
        if !layer.is_bidirectional() {
            return Err(IndexError::InvalidOwned(format!(
                "layer `{}` does not record forward edges",
                layer.id()
            )));
        }
        Ok(match self.location_info(layer, location)? {
            LocationInfo::Bidirectional { destinations, .. } => destinations,
            LocationInfo::ReverseEdges { .. } => BTreeSet::new(),
        })
    }

    /// Stored file info for `path`, if the file is indexed.
    pub fn file_info(&mut self, path: &str) -> Result<Option<FileInfo>> {
        self.storage.read_file_info(path)
    }

    /// `(path, modification stamp)` of every indexed file.
    pub fn load_all_file_headers(&mut self) -> Result<Vec<SourceFile>> {
        self.storage.all_files()
    }

    /// Files whose last pass was flagged with errors.
    pub fn files_with_errors(&mut self) -> Result<Vec<SourceFile>> {
        self.storage.files_with_errors()
    }

    /// Human readable rendering of every stored record.
    pub fn disk_index_as_string(&mut self) -> Result<String> {
        self.storage.dump(Some(self.layers))
    }
}

/// A read-only request executed on the worker against an [`Index`].
pub trait Query: Send + 'static {
    /// Result handed back through the query's ticket.
    type Output: Send + 'static;

    /// Computes the result. Called exactly once, on the worker thread.
    fn execute_using(&mut self, index: &mut Index<'_>) -> Result<Self::Output>;
}

/// Who references a location in a layer.
#[derive(Clone, Debug)]
pub struct ReferencesQuery {
    /// Layer to look in.
    pub layer: Layer,
    /// Referenced location.
    pub location: Location,
}

impl Query for ReferencesQuery {
    type Output = BTreeSet<Location>;

    fn execute_using(&mut self, index: &mut Index<'_>) -> Result<Self::Output> {
        index.references(&self.layer, &self.location)
    }
}

/// What a location references in a bidirectional layer.
#[derive(Clone, Debug)]
pub struct ForwardReferencesQuery {
    /// Bidirectional layer to look in.
    pub layer: Layer,
    /// Referencing location.
    pub location: Location,
}

impl Query for ForwardReferencesQuery {
    type Output = BTreeSet<Location>;

    fn execute_using(&mut self, index: &mut Index<'_>) -> Result<Self::Output> {
        index.forward_references(&self.layer, &self.location)
    }
}

/// Stored [`FileInfo`] of one file.
#[derive(Clone, Debug)]
pub struct FileInfoQuery {
    /// Path the file was indexed under.
    pub path: String,
}

impl Query for FileInfoQuery {
    type Output = Option<FileInfo>;

    fn execute_using(&mut self, index: &mut Index<'_>) -> Result<Self::Output> {
        index.file_info(&self.path)
    }
}

/// Every indexed file with its modification stamp.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileHeadersQuery;

impl Query for FileHeadersQuery {
    type Output = Vec<SourceFile>;

    fn execute_using(&mut self, index: &mut Index<'_>) -> Result<Self::Output> {
        index.load_all_file_headers()
    }
}

/// Files whose last pass was flagged with errors.
#[derive(Clone, Copy, Debug, Default)]
pub struct FilesWithErrorsQuery;

impl Query for FilesWithErrorsQuery {
    type Output = Vec<SourceFile>;

    fn execute_using(&mut self, index: &mut Index<'_>) -> Result<Self::Output> {
        index.files_with_errors()
    }
}

/// Text dump of the whole index.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiskIndexQuery;

impl Query for DiskIndexQuery {
    type Output = String;

    fn execute_using(&mut self, index: &mut Index<'_>) -> Result<Self::Output> {
        index.disk_index_as_string()
    }
}
