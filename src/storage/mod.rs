//! Paged storage for layer payloads, file infos and dependency edges.
//!
//! Maps `(column, Location)` to a serialized blob on top of the [`Pager`]:
//! the `Dictionary` turns locations into dense ids, the `Directory`
//! maps `(id, column)` to the record page holding the blob, and
//! `RecordStore` packs blobs into record pages and overflow chains.
//!
//! Columns `0..layer_count` hold [`LocationInfo`] payloads by layer ordinal,
//! column `layer_count` holds [`FileInfo`] (keyed by the file's compilation
//! unit) and column `layer_count + 1` holds dependents of a master location.

mod dictionary;
mod directory;
mod records;

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use dictionary::Dictionary;
use directory::Directory;
use records::RecordStore;

use crate::model::{FileInfo, Layer, LayerSchema, LayerSet, Location, LocationInfo, LocationType};
use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::primitives::pager::{Pager, PagerOptions, PagerStats};
use crate::types::{page::NO_PAGE, IndexError, LocationId, Lsn, PageId, Result, SourceFile};

/// Size and activity counters of an open store.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct StorageStats {
    /// Pager, cache and log counters.
    pub pager: PagerStats,
    /// Page size of the file.
    pub page_size: usize,
    /// Pages handed out so far, page 0 included.
    pub allocated_pages: u64,
    /// Pages on the free list.
    pub free_pages: u64,
    /// Interned locations.
    pub locations: usize,
    /// Pages in the dictionary chain.
    pub dictionary_pages: usize,
    /// Pages in the directory chain.
    pub directory_pages: usize,
    /// Layers in the stored configuration.
    pub layer_count: u16,
    /// LSN of the last committed transaction.
    pub last_lsn: u64,
}

/// Disk-backed `(Layer, Location) -> LocationInfo` store.
pub struct PagedStorage {
    pager: Pager,
    dictionary: Dictionary,
    directory: Directory,
    layer_count: u16,
}

impl PagedStorage {
    /// Creates an empty store for `schema`, replacing anything at `path`.
    pub fn create(path: &Path, options: &PagerOptions, schema: LayerSchema) -> Result<Self> {
        let mut pager = Pager::create(path, options.clone())?;
        pager.begin()?;
        {
            let meta = pager.meta_mut()?;
            meta.layer_count = schema.layer_count;
            meta.layer_fingerprint = schema.fingerprint;
        }
        pager.commit()?;
        pager.checkpoint()?;
        info!(
            path = %path.display(),
            layers = schema.layer_count,
            "storage.create"
        );
        Self::assemble(pager)
    }

    /// Opens an existing store. When `expected` is given, a store written by
    /// a different layer configuration requires a rebuild. A missing file is
    /// a quiet rebuild request.
    pub fn open(path: &Path, options: &PagerOptions, expected: Option<LayerSchema>) -> Result<Self> {
        if !path.exists() {
            return Err(IndexError::rebuild_required(
                format!("no index at {}", path.display()),
                Vec::new(),
                false,
            ));
        }
        let pager = Pager::open(path, options.clone())?;
        if let Some(expected) = expected {
            let meta = pager.meta();
            let stored = LayerSchema {
                layer_count: meta.layer_count,
                fingerprint: meta.layer_fingerprint,
            };
            if stored != expected {
                warn!(
                    stored_layers = stored.layer_count,
                    expected_layers = expected.layer_count,
                    "storage.schema_mismatch"
                );
                return Err(IndexError::rebuild_required(
                    "layer configuration changed since the index was written",
                    Vec::new(),
                    true,
                ));
            }
        }
        let storage = Self::assemble(pager)?;
        debug!(
            path = %path.display(),
            locations = storage.dictionary.len(),
            "storage.open"
        );
        Ok(storage)
    }

    fn assemble(mut pager: Pager) -> Result<Self> {
        let layer_count = pager.meta().layer_count;
        let columns = layer_count
            .checked_add(2)
            .ok_or(IndexError::Corruption("layer count out of range"))?;
        let dictionary = Dictionary::load(&mut pager)?;
        let directory = Directory::load(&mut pager, columns)?;
        Ok(Self {
            pager,
            dictionary,
            directory,
            layer_count,
        })
    }

    /// Removes the store and its log from disk.
    pub fn destroy(path: &Path) -> Result<()> {
        Pager::destroy(path)
    }

    /// Data file path.
    pub fn path(&self) -> PathBuf {
        self.pager.path().to_path_buf()
    }

    /// Layers the store was opened with.
    pub fn layer_count(&self) -> u16 {
        self.layer_count
    }

    /// Column holding [`FileInfo`] blobs.
    pub fn file_info_column(&self) -> u16 {
        self.layer_count
    }

    /// Column holding dependents of master locations.
    pub fn dependents_column(&self) -> u16 {
        self.layer_count + 1
    }

    /// Starts a write transaction.
    pub fn begin(&mut self) -> Result<()> {
        self.pager.begin()?;
        self.dictionary.begin();
        self.directory.begin();
        Ok(())
    }

    /// Commits the open transaction. A failed commit is rolled back.
    pub fn commit(&mut self) -> Result<Lsn> {
        match self.pager.commit() {
            Ok(lsn) => {
                self.dictionary.commit();
                self.directory.commit();
                Ok(lsn)
            }
            Err(err) => {
                self.dictionary.rollback();
                self.directory.rollback();
                Err(err)
            }
        }
    }

    /// Discards the open transaction.
    pub fn rollback(&mut self) -> Result<()> {
        self.dictionary.rollback();
        self.directory.rollback();
        self.pager.rollback()
    }

    /// True while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.pager.in_transaction()
    }

    /// Copies logged pages into the data file and resets the log.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.pager.checkpoint()
    }

    /// True when the log holds frames not yet checkpointed.
    pub fn has_pending_log(&self) -> bool {
        self.pager.has_pending_log()
    }

    /// Id of an interned location.
    pub fn lookup(&self, location: &Location) -> Option<LocationId> {
        self.dictionary.lookup(location)
    }

    /// Interns `location`; only inside a transaction.
    pub fn intern(&mut self, location: &Location) -> Result<LocationId> {
        self.dictionary.intern(&mut self.pager, location)
    }

    /// Raw record of `(location, column)`.
    pub fn read_record(&mut self, location: LocationId, column: u16) -> Result<Option<Vec<u8>>> {
        let Some(page_id) = self.directory.get(&mut self.pager, location, column)? else {
            return Ok(None);
        };
        let blob = RecordStore::new(&mut self.pager).read(page_id, column, location)?;
        if blob.is_none() {
            return Err(IndexError::CorruptionOwned(format!(
                "directory entry ({location}, {column}) points at page {page_id} without the record"
            )));
        }
        Ok(blob)
    }

    /// Replaces the record of `(location, column)`; `None` deletes it.
    pub fn write_record(
        &mut self,
        location: LocationId,
        column: u16,
        blob: Option<&[u8]>,
    ) -> Result<()> {
        let current = self.directory.get(&mut self.pager, location, column)?;
        match (blob, current) {
            (Some(blob), current) => {
                let home = RecordStore::new(&mut self.pager).write(current, column, location, blob)?;
                if current != Some(home) {
                    self.directory
                        .set(&mut self.pager, location, column, Some(home))?;
                }
            }
            (None, Some(page_id)) => {
                RecordStore::new(&mut self.pager).delete(page_id, column, location)?;
                self.directory.set(&mut self.pager, location, column, None)?;
            }
            (None, None) => {}
        }
        Ok(())
    }

    fn layer_column(&self, layer: &Layer) -> Result<u16> {
        let ordinal = layer.ordinal()?;
        if ordinal >= self.layer_count {
            return Err(IndexError::InvalidOwned(format!(
                "layer `{}` has ordinal {ordinal} but the store holds {} layers",
                layer.id(),
                self.layer_count
            )));
        }
        Ok(ordinal)
    }

    /// Payload of `location` in `layer`; empty when nothing is stored.
    pub fn read_location_info(&mut self, layer: &Layer, location: &Location) -> Result<LocationInfo> {
        let column = self.layer_column(layer)?;
        let Some(id) = self.lookup(location) else {
            return Ok(layer.create_empty_location_info());
        };
        match self.read_record(id, column)? {
            Some(blob) => {
                let mut reader = ByteReader::new(&blob);
                let info = layer.load_location_info(&mut reader)?;
                reader.finish()?;
                Ok(info)
            }
            None => Ok(layer.create_empty_location_info()),
        }
    }

    /// Stores `info`; an empty payload removes the record.
    pub fn write_location_info(
        &mut self,
        layer: &Layer,
        location: &Location,
        info: &LocationInfo,
    ) -> Result<()> {
        let column = self.layer_column(layer)?;
        if info.is_empty() {
            return match self.lookup(location) {
                Some(id) => self.write_record(id, column, None),
                None => Ok(()),
            };
        }
        let mut out = ByteWriter::new();
        layer.save(info, &mut out)?;
        let id = self.intern(location)?;
        self.write_record(id, column, Some(out.as_slice()))
    }

    /// Stored info of the file at `path`.
    pub fn read_file_info(&mut self, path: &str) -> Result<Option<FileInfo>> {
        let Some(id) = self.lookup(&Location::compilation_unit(path)) else {
            return Ok(None);
        };
        let column = self.file_info_column();
        let Some(blob) = self.read_record(id, column)? else {
            return Ok(None);
        };
        let mut reader = ByteReader::new(&blob);
        let info = FileInfo::load(&mut reader)?;
        reader.finish()?;
        if info.file.path != path {
            return Err(IndexError::CorruptionOwned(format!(
                "file info for {path} names {}",
                info.file.path
            )));
        }
        Ok(Some(info))
    }

    /// Replaces the stored info of `info.file`; only inside a transaction.
    pub fn write_file_info(&mut self, info: &FileInfo) -> Result<()> {
        let mut out = ByteWriter::new();
        info.save(&mut out);
        let id = self.intern(&Location::compilation_unit(&info.file.path))?;
        let column = self.file_info_column();
        self.write_record(id, column, Some(out.as_slice()))
    }

    /// Removes the file info of `path`. Returns false if none was stored.
    pub fn delete_file_info(&mut self, path: &str) -> Result<bool> {
        let Some(id) = self.lookup(&Location::compilation_unit(path)) else {
            return Ok(false);
        };
        let column = self.file_info_column();
        if self.directory.get(&mut self.pager, id, column)?.is_none() {
            return Ok(false);
        }
        self.write_record(id, column, None)?;
        Ok(true)
    }

    /// Locations depending on `master`.
    pub fn read_dependents(&mut self, master: &Location) -> Result<BTreeSet<Location>> {
        let Some(id) = self.lookup(master) else {
            return Ok(BTreeSet::new());
        };
        let column = self.dependents_column();
        match self.read_record(id, column)? {
            Some(blob) => decode_locations(&blob),
            None => Ok(BTreeSet::new()),
        }
    }

    /// Replaces the dependents of `master`; an empty set deletes them.
    pub fn write_dependents(&mut self, master: &Location, dependents: &BTreeSet<Location>) -> Result<()> {
        let column = self.dependents_column();
        if dependents.is_empty() {
            return match self.lookup(master) {
                Some(id) => self.write_record(id, column, None),
                None => Ok(()),
            };
        }
        let id = self.intern(master)?;
        self.write_record(id, column, Some(&encode_locations(dependents)))
    }

    /// Paths of every compilation unit the dictionary has seen. Reads no
    /// pages, so it works on a store whose record pages are damaged.
    pub fn known_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .dictionary
            .iter()
            .filter(|(_, loc)| loc.kind() == LocationType::CompilationUnit)
            .map(|(_, loc)| loc.identifier().to_owned())
            .collect();
        paths.sort();
        paths
    }

    /// Every stored file info, ordered by path.
    pub fn file_infos(&mut self) -> Result<Vec<FileInfo>> {
        let mut out = Vec::new();
        for path in self.known_paths() {
            if let Some(info) = self.read_file_info(&path)? {
                out.push(info);
            }
        }
        Ok(out)
    }

    /// `(path, modification stamp)` of every indexed file.
    pub fn all_files(&mut self) -> Result<Vec<SourceFile>> {
        Ok(self.file_infos()?.into_iter().map(|info| info.file).collect())
    }

    /// Files whose stored info is flagged with errors.
    pub fn files_with_errors(&mut self) -> Result<Vec<SourceFile>> {
        Ok(self
            .file_infos()?
            .into_iter()
            .filter(|info| info.has_errors)
            .map(|info| info.file)
            .collect())
    }

    /// Renders every record grouped by location. Layer columns are named
    /// from `layers` when given, otherwise printed by ordinal.
    pub fn dump(&mut self, layers: Option<&LayerSet>) -> Result<String> {
        let locations: Vec<(LocationId, Location)> = self
            .dictionary
            .iter()
            .map(|(id, loc)| (id, loc.clone()))
            .collect();
        let file_column = self.file_info_column();
        let dependents_column = self.dependents_column();
        let mut out = String::new();
        for (id, location) in locations {
            let mut lines = Vec::new();
            for column in 0..=dependents_column {
                let Some(blob) = self.read_record(id, column)? else {
                    continue;
                };
                let mut reader = ByteReader::new(&blob);
                if column == file_column {
                    let info = FileInfo::load(&mut reader)?;
                    lines.push(format!(
                        "  file-info: stamp={} errors={} declares={} edges={} dependencies={}",
                        info.file.modification_stamp,
                        info.has_errors,
                        info.source_locations.len(),
                        info.references.len(),
                        info.dependencies.len()
                    ));
                } else if column == dependents_column {
                    let dependents = decode_locations(&blob)?;
                    lines.push(format!("  dependents: {}", join(dependents.iter())));
                } else {
                    let name = match layers {
                        Some(layers) => layers.require(column)?.id().to_string(),
                        None => format!("layer#{column}"),
                    };
                    let info = LocationInfo::load(&mut reader)?;
                    let mut line = format!("  {name}: sources=[{}]", join(info.sources().iter()));
                    if matches!(info, LocationInfo::Bidirectional { .. }) {
                        let _ = write!(line, " destinations=[{}]", join(info.destinations()));
                    }
                    lines.push(line);
                }
            }
            if !lines.is_empty() {
                let _ = writeln!(out, "{location} (#{id})");
                for line in lines {
                    let _ = writeln!(out, "{line}");
                }
            }
        }
        Ok(out)
    }

    /// Counters for the inspection tooling. Walks the free list.
    pub fn stats(&mut self) -> Result<StorageStats> {
        let meta = self.pager.meta().clone();
        let mut free_pages = 0u64;
        let mut cursor = meta.free_head;
        while cursor.0 != NO_PAGE {
            if free_pages >= meta.next_page.0 {
                return Err(IndexError::Corruption("free list loops"));
            }
            free_pages += 1;
            cursor = PageId(crate::types::page::next_of(self.pager.page(cursor)?));
        }
        Ok(StorageStats {
            pager: self.pager.stats(),
            page_size: self.pager.page_size(),
            allocated_pages: meta.next_page.0,
            free_pages,
            locations: self.dictionary.len(),
            dictionary_pages: self.dictionary.page_count(),
            directory_pages: self.directory.page_count(),
            layer_count: self.layer_count,
            last_lsn: meta.last_lsn.0,
        })
    }
}

fn encode_locations(set: &BTreeSet<Location>) -> Vec<u8> {
    let mut out = ByteWriter::new();
    out.put_var(set.len() as u64);
    for loc in set {
        loc.save(&mut out);
    }
    out.into_inner()
}

fn decode_locations(blob: &[u8]) -> Result<BTreeSet<Location>> {
    let mut reader = ByteReader::new(blob);
    let count = reader.get_var()?;
    if count > reader.remaining() as u64 {
        return Err(IndexError::Corruption("dependents count exceeds record"));
    }
    let mut set = BTreeSet::new();
    for _ in 0..count {
        set.insert(Location::load(&mut reader)?);
    }
    reader.finish()?;
    Ok(set)
}

fn join<'a>(locations: impl Iterator<Item = &'a Location>) -> String {
    locations
        .map(|loc| loc.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
