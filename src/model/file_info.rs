//! Per-file aggregate written by every (re)index of a file.

use std::collections::BTreeSet;

use super::location::Location;
use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::types::{IndexError, Result, SourceFile};

const FILE_INFO_MARKER: u8 = b'I';

/// One edge a file contributed to a layer.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Edge {
    /// Ordinal of the layer the edge belongs to.
    pub ordinal: u16,
    /// Referencing location.
    pub source: Location,
    /// Referenced location.
    pub destination: Location,
}

/// A dependency of `dependent` (declared in this file) on `master`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Dependency {
    /// Location depended on.
    pub master: Location,
    /// Location declared in this file.
    pub dependent: Location,
}

/// Everything the index knows about one file. Replaced wholesale by each
/// committed transaction for that file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FileInfo {
    /// The file and the stamp it was indexed at.
    pub file: SourceFile,
    /// Set when a contributor reported errors while indexing the file.
    pub has_errors: bool,
    /// Locations the file declares.
    pub source_locations: BTreeSet<Location>,
    /// Edges the file contributed, used to retract them on re-index.
    pub references: BTreeSet<Edge>,
    /// Dependencies the file declared.
    pub dependencies: BTreeSet<Dependency>,
}

impl FileInfo {
    /// Empty info for `file`.
    pub fn new(file: SourceFile) -> Self {
        Self {
            file,
            has_errors: false,
            source_locations: BTreeSet::new(),
            references: BTreeSet::new(),
            dependencies: BTreeSet::new(),
        }
    }

    /// Encodes the whole aggregate.
    pub fn save(&self, out: &mut ByteWriter) {
        out.put_u8(FILE_INFO_MARKER);
        out.put_str(&self.file.path);
        out.put_u64(self.file.modification_stamp);
        out.put_bool(self.has_errors);
        out.put_var(self.source_locations.len() as u64);
        for loc in &self.source_locations {
            loc.save(out);
        }
        out.put_var(self.references.len() as u64);
        for edge in &self.references {
            out.put_u16(edge.ordinal);
            edge.source.save(out);
            edge.destination.save(out);
        }
        out.put_var(self.dependencies.len() as u64);
        for dep in &self.dependencies {
            dep.master.save(out);
            dep.dependent.save(out);
        }
    }

    /// Decodes an aggregate written by [`FileInfo::save`].
    pub fn load(input: &mut ByteReader<'_>) -> Result<Self> {
        if input.get_u8()? != FILE_INFO_MARKER {
            return Err(IndexError::Corruption("file info marker mismatch"));
        }
        let path = input.get_str()?.to_owned();
        let modification_stamp = input.get_u64()?;
        let has_errors = input.get_bool()?;
        let mut info = FileInfo::new(SourceFile::new(path, modification_stamp));
        info.has_errors = has_errors;
        for _ in 0..bounded_count(input)? {
            info.source_locations.insert(Location::load(input)?);
        }
        for _ in 0..bounded_count(input)? {
            let ordinal = input.get_u16()?;
            info.references.insert(Edge {
                ordinal,
                source: Location::load(input)?,
                destination: Location::load(input)?,
            });
        }
        for _ in 0..bounded_count(input)? {
            info.dependencies.insert(Dependency {
                master: Location::load(input)?,
                dependent: Location::load(input)?,
            });
        }
        Ok(info)
    }
}

fn bounded_count(input: &mut ByteReader<'_>) -> Result<u64> {
    let count = input.get_var()?;
    if count > input.remaining() as u64 {
        return Err(IndexError::Corruption("file info count exceeds record"));
    }
    Ok(count)
}
