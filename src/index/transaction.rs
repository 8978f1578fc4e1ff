//! Per-file update protocol.

use std::collections::btree_map::Entry as MapEntry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::registry::IndexConfiguration;
use crate::model::{Dependency, Edge, FileInfo, Layer, LayerSet, Location, LocationInfo};
use crate::storage::PagedStorage;
use crate::types::{FailureClass, IndexError, Lsn, Result, SourceFile};

/// What a committed transaction changed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommitSummary {
    /// Log sequence number of the commit; `None` when nothing changed.
    pub lsn: Option<Lsn>,
    /// Edges the file contributes that the index did not hold.
    pub edges_added: usize,
    /// Edges of the previous pass that are gone.
    pub edges_retracted: usize,
    /// New dependency edges.
    pub dependencies_added: usize,
    /// Dependency edges of the previous pass that are gone.
    pub dependencies_retracted: usize,
}

/// Edits produced by (re)indexing one file.
///
/// Contributors fill the transaction through [`FileTransaction::add_reference`]
/// and friends without touching storage. [`FileTransaction::commit`] then
/// diffs the new edge set against the file's previous [`FileInfo`], retracts
/// stale edges, records new ones and replaces the file info, all inside one
/// storage transaction.
pub struct FileTransaction {
    layers: Arc<LayerSet>,
    original: Option<FileInfo>,
    pending: FileInfo,
}

impl FileTransaction {
    /// Starts a transaction for `file`, loading what the index currently
    /// holds for it.
    ///
    /// # Errors
    /// * `IndexError::Corruption*` - the stored file info cannot be decoded
    pub fn begin(storage: &mut PagedStorage, layers: Arc<LayerSet>, file: SourceFile) -> Result<Self> {
        let original = storage.read_file_info(&file.path)?;
        Ok(Self::with_original(layers, file, original))
    }

    fn with_original(layers: Arc<LayerSet>, file: SourceFile, original: Option<FileInfo>) -> Self {
        let mut pending = FileInfo::new(file);
        pending
            .source_locations
            .insert(Location::compilation_unit(&pending.file.path));
        Self {
            layers,
            original,
            pending,
        }
    }

    /// File being indexed.
    pub fn file(&self) -> &SourceFile {
        &self.pending.file
    }

    /// What the index held for the file before this transaction.
    pub fn original_file_info(&self) -> Option<&FileInfo> {
        self.original.as_ref()
    }

    /// The file info this transaction will write.
    pub fn pending_file_info(&self) -> &FileInfo {
        &self.pending
    }

    /// Layers edges may be recorded in.
    pub fn layers(&self) -> &LayerSet {
        &self.layers
    }

    fn owned(&self, location: Location) -> Location {
        if location.file().is_some() {
            location
        } else {
            location.with_file(self.pending.file.path.as_str())
        }
    }

    /// Declares a location of this file.
    pub fn add_source_location(&mut self, location: Location) {
        let location = self.owned(location);
        self.pending.source_locations.insert(location);
    }

    /// Records that `source` (in this file) references `destination` in
    /// `layer`.
    ///
    /// # Errors
    /// * `IndexError::InvalidOwned` - `layer` is not part of the configuration
    pub fn add_reference(&mut self, layer: &Layer, source: Location, destination: Location) -> Result<()> {
        if !self.layers.contains(layer) {
            return Err(IndexError::InvalidOwned(format!(
                "layer `{}` is not registered with this index",
                layer.id()
            )));
        }
        let ordinal = layer.ordinal()?;
        let source = self.owned(source);
        self.pending.references.insert(Edge {
            ordinal,
            source,
            destination,
        });
        Ok(())
    }

    /// Records that `dependent` (in this file) must be re-indexed when the
    /// file declaring `master` goes away.
    pub fn add_dependency(&mut self, master: Location, dependent: Location) {
        let dependent = self.owned(dependent);
        self.pending
            .dependencies
            .insert(Dependency { master, dependent });
    }

    /// Flags the file as indexed with errors.
    pub fn mark_errors(&mut self) {
        self.pending.has_errors = true;
    }

    /// Applies every edit as one unit.
    ///
    /// # Errors
    /// Any failure rolls the storage transaction back, leaving the index as
    /// it was. Corruption found while reading existing payloads surfaces as
    /// `IndexError::Corruption*` for the caller to escalate; an edge whose
    /// stored ordinal is unknown to the configuration is
    /// `IndexError::Fatal(UnknownOrdinal)`.
    pub fn commit(self, storage: &mut PagedStorage) -> Result<CommitSummary> {
        let start = Instant::now();
        storage.begin()?;
        let applied = self
            .apply(storage)
            .and_then(|summary| storage.write_file_info(&self.pending).map(|()| summary));
        let mut summary = match applied {
            Ok(summary) => summary,
            Err(err) => {
                if let Err(rollback) = storage.rollback() {
                    warn!(error = %rollback, "index.transaction.rollback_failed");
                }
                debug!(file = %self.pending.file, error = %err, "index.transaction.aborted");
                return Err(err);
            }
        };
        summary.lsn = Some(storage.commit()?);
        debug!(
            file = %self.pending.file,
            added = summary.edges_added,
            retracted = summary.edges_retracted,
            elapsed_us = start.elapsed().as_micros() as u64,
            "index.transaction.commit"
        );
        Ok(summary)
    }

    fn apply(&self, storage: &mut PagedStorage) -> Result<CommitSummary> {
        let empty = FileInfo::new(self.pending.file.clone());
        let original = self.original.as_ref().unwrap_or(&empty);
        let mut summary = CommitSummary::default();

        let mut payloads: BTreeMap<(u16, Location), LocationInfo> = BTreeMap::new();
        for edge in original.references.difference(&self.pending.references) {
            let layer = self.layers.require(edge.ordinal)?;
            payload(&mut payloads, storage, layer, &edge.destination)?.remove_source(&edge.source);
            if layer.is_bidirectional() {
                payload(&mut payloads, storage, layer, &edge.source)?
                    .remove_destination(&edge.destination);
            }
            summary.edges_retracted += 1;
        }
        for edge in self.pending.references.difference(&original.references) {
            let layer = self.layers.require(edge.ordinal)?;
            payload(&mut payloads, storage, layer, &edge.destination)?.add_source(edge.source.clone());
            if layer.is_bidirectional() {
                payload(&mut payloads, storage, layer, &edge.source)?
                    .add_destination(edge.destination.clone())?;
            }
            summary.edges_added += 1;
        }
        for ((ordinal, location), info) in &payloads {
            let layer = self.layers.require(*ordinal)?;
            storage.write_location_info(layer, location, info)?;
        }

        let mut dependents: BTreeMap<Location, BTreeSet<Location>> = BTreeMap::new();
        for dep in original.dependencies.difference(&self.pending.dependencies) {
            dependent_set(&mut dependents, storage, &dep.master)?.remove(&dep.dependent);
            summary.dependencies_retracted += 1;
        }
        for dep in self.pending.dependencies.difference(&original.dependencies) {
            let set = dependent_set(&mut dependents, storage, &dep.master)?;
            // Replace so the stored copy carries the dependent's current file.
            set.remove(&dep.dependent);
            set.insert(dep.dependent.clone());
            summary.dependencies_added += 1;
        }
        for (master, set) in &dependents {
            storage.write_dependents(master, set)?;
        }
        Ok(summary)
    }
}

fn payload<'w>(
    payloads: &'w mut BTreeMap<(u16, Location), LocationInfo>,
    storage: &mut PagedStorage,
    layer: &Layer,
    location: &Location,
) -> Result<&'w mut LocationInfo> {
    let key = (layer.ordinal()?, location.clone());
    match payloads.entry(key) {
        MapEntry::Occupied(entry) => Ok(entry.into_mut()),
        MapEntry::Vacant(entry) => {
            let info = storage.read_location_info(layer, location)?;
            Ok(entry.insert(info))
        }
    }
}

fn dependent_set<'w>(
    sets: &'w mut BTreeMap<Location, BTreeSet<Location>>,
    storage: &mut PagedStorage,
    master: &Location,
) -> Result<&'w mut BTreeSet<Location>> {
    match sets.entry(master.clone()) {
        MapEntry::Occupied(entry) => Ok(entry.into_mut()),
        MapEntry::Vacant(entry) => {
            let set = storage.read_dependents(master)?;
            Ok(entry.insert(set))
        }
    }
}

/// Batches one file's edits to a single layer.
pub struct LayerUpdater<'t> {
    layer: Layer,
    transaction: &'t mut FileTransaction,
}

impl<'t> LayerUpdater<'t> {
    /// Updater for `layer` writing into `transaction`.
    pub fn new(layer: Layer, transaction: &'t mut FileTransaction) -> Self {
        Self { layer, transaction }
    }

    /// Layer this updater writes to.
    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    /// Adds `source` to the payload of `destination`; bidirectional layers
    /// also record the forward edge.
    pub fn add_reference(&mut self, source: Location, destination: Location) -> Result<()> {
        self.transaction
            .add_reference(&self.layer, source, destination)
    }
}

/// Runs every contributor that accepts `file` and commits the result.
///
/// # Errors
/// A contributor failure aborts the file without touching the index and is
/// reported as `IndexError::Contributor` unless it already carries a
/// storage-level class.
pub fn reindex_file(
    storage: &mut PagedStorage,
    configuration: &IndexConfiguration,
    file: SourceFile,
) -> Result<CommitSummary> {
    let mut transaction = FileTransaction::begin(storage, configuration.layers_arc(), file.clone())?;
    for contributor in configuration.find_processors(&file) {
        contributor
            .process_file(&file, &mut transaction)
            .map_err(|err| match err.class() {
                FailureClass::Failed if !matches!(err, IndexError::Contributor { .. }) => {
                    IndexError::contributor(contributor.name(), file.path.as_str(), err.to_string())
                }
                _ => err,
            })?;
    }
    transaction.commit(storage)
}

/// Retracts everything `path` contributed and deletes its file info.
///
/// Returns the other indexed files owning locations that depend on a
/// location `path` declared; they need re-indexing.
///
/// # Errors
/// Failures roll back; nothing is retracted.
pub fn remove_file(storage: &mut PagedStorage, layers: Arc<LayerSet>, path: &str) -> Result<Vec<SourceFile>> {
    let Some(original) = storage.read_file_info(path)? else {
        return Ok(Vec::new());
    };
    let mut affected_paths = BTreeSet::new();
    for location in &original.source_locations {
        for dependent in storage.read_dependents(location)? {
            if let Some(owner) = dependent.file() {
                if owner != path {
                    affected_paths.insert(owner.to_owned());
                }
            }
        }
    }
    let mut affected = Vec::with_capacity(affected_paths.len());
    for owner in affected_paths {
        if let Some(info) = storage.read_file_info(&owner)? {
            affected.push(info.file);
        }
    }

    let file = original.file.clone();
    let mut transaction = FileTransaction::with_original(layers, file, Some(original));
    transaction.pending.source_locations.clear();
    storage.begin()?;
    let applied = transaction
        .apply(storage)
        .and_then(|_| storage.delete_file_info(path));
    if let Err(err) = applied {
        if let Err(rollback) = storage.rollback() {
            warn!(error = %rollback, "index.transaction.rollback_failed");
        }
        return Err(err);
    }
    storage.commit()?;
    info!(path, affected = affected.len(), "index.remove_file");
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LocationType;
    use crate::primitives::pager::PagerOptions;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: PagedStorage,
        layers: Arc<LayerSet>,
        calls: Layer,
        overrides: Layer,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let calls = Layer::unidirectional("calls");
        let overrides = Layer::bidirectional("overrides");
        let mut layers = LayerSet::new();
        layers.register(calls.clone()).unwrap();
        layers.register(overrides.clone()).unwrap();
        let storage = PagedStorage::create(
            &dir.path().join("index"),
            &PagerOptions::default(),
            layers.schema(),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            storage,
            layers: Arc::new(layers),
            calls,
            overrides,
        }
    }

    fn method(id: &str) -> Location {
        Location::new(LocationType::Method, id)
    }

    #[test]
    fn committing_the_same_edge_twice_keeps_one_source() {
        let mut fx = fixture();
        for _ in 0..2 {
            let mut tx = FileTransaction::begin(
                &mut fx.storage,
                fx.layers.clone(),
                SourceFile::new("a.dart", 1),
            )
            .unwrap();
            tx.add_reference(&fx.calls, method("main"), method("print"))
                .unwrap();
            tx.add_reference(&fx.calls, method("main"), method("print"))
                .unwrap();
            tx.commit(&mut fx.storage).unwrap();
        }
        let info = fx
            .storage
            .read_location_info(&fx.calls, &method("print"))
            .unwrap();
        assert_eq!(info.sources().len(), 1);
        assert_eq!(info.sources().iter().next().unwrap().file(), Some("a.dart"));
    }

    #[test]
    fn reindex_retracts_stale_edges() {
        let mut fx = fixture();
        let mut tx =
            FileTransaction::begin(&mut fx.storage, fx.layers.clone(), SourceFile::new("a.dart", 1))
                .unwrap();
        tx.add_reference(&fx.calls, method("main"), method("old"))
            .unwrap();
        tx.add_reference(&fx.overrides, method("Sub.m"), method("Base.m"))
            .unwrap();
        tx.commit(&mut fx.storage).unwrap();

        let mut tx =
            FileTransaction::begin(&mut fx.storage, fx.layers.clone(), SourceFile::new("a.dart", 2))
                .unwrap();
        assert_eq!(tx.original_file_info().unwrap().references.len(), 2);
        tx.add_reference(&fx.calls, method("main"), method("new"))
            .unwrap();
        let summary = tx.commit(&mut fx.storage).unwrap();
        assert_eq!(summary.edges_added, 1);
        assert_eq!(summary.edges_retracted, 2);

        assert!(fx
            .storage
            .read_location_info(&fx.calls, &method("old"))
            .unwrap()
            .is_empty());
        assert!(fx
            .storage
            .read_location_info(&fx.overrides, &method("Sub.m"))
            .unwrap()
            .is_empty());
        assert_eq!(
            fx.storage
                .read_location_info(&fx.calls, &method("new"))
                .unwrap()
                .sources()
                .len(),
            1
        );
        let stored = fx.storage.read_file_info("a.dart").unwrap().unwrap();
        assert_eq!(stored.file.modification_stamp, 2);
    }

    #[test]
    fn bidirectional_layer_records_forward_edge() {
        let mut fx = fixture();
        let mut tx =
            FileTransaction::begin(&mut fx.storage, fx.layers.clone(), SourceFile::new("a.dart", 1))
                .unwrap();
        let mut updater = fx.overrides.create_layer_updater(&mut tx);
        updater
            .add_reference(method("Sub.m"), method("Base.m"))
            .unwrap();
        tx.commit(&mut fx.storage).unwrap();
        let forward = fx
            .storage
            .read_location_info(&fx.overrides, &method("Sub.m"))
            .unwrap();
        assert_eq!(forward.destinations().cloned().collect::<Vec<_>>(), vec![method("Base.m")]);
    }

    #[test]
    fn unregistered_layer_is_rejected() {
        let mut fx = fixture();
        let mut tx =
            FileTransaction::begin(&mut fx.storage, fx.layers.clone(), SourceFile::new("a.dart", 1))
                .unwrap();
        let stray = Layer::unidirectional("calls");
        assert!(tx.add_reference(&stray, method("a"), method("b")).is_err());
    }

    #[test]
    fn remove_file_reports_dependents() {
        let mut fx = fixture();
        let lib = Location::in_file(LocationType::Type, "Widget", "lib.dart");
        let mut tx =
            FileTransaction::begin(&mut fx.storage, fx.layers.clone(), SourceFile::new("lib.dart", 1))
                .unwrap();
        tx.add_source_location(lib.clone());
        tx.add_reference(&fx.calls, lib.clone(), method("build"))
            .unwrap();
        tx.commit(&mut fx.storage).unwrap();

        let mut tx =
            FileTransaction::begin(&mut fx.storage, fx.layers.clone(), SourceFile::new("app.dart", 9))
                .unwrap();
        tx.add_dependency(lib.clone(), Location::compilation_unit("app.dart"));
        tx.commit(&mut fx.storage).unwrap();

        let affected = remove_file(&mut fx.storage, fx.layers.clone(), "lib.dart").unwrap();
        assert_eq!(affected, vec![SourceFile::new("app.dart", 9)]);
        assert!(fx.storage.read_file_info("lib.dart").unwrap().is_none());
        assert!(fx
            .storage
            .read_location_info(&fx.calls, &method("build"))
            .unwrap()
            .is_empty());
        assert!(remove_file(&mut fx.storage, fx.layers.clone(), "lib.dart")
            .unwrap()
            .is_empty());
    }
}
