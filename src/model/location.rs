//! Reference sites and their persisted codec.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::types::{IndexError, Result};

/// Kind of a reference site. Each kind persists as a one byte marker so a
/// reader can dispatch without knowing the registered layers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LocationType {
    /// A whole source file.
    CompilationUnit,
    /// A field of a type.
    Field,
    /// A top-level function.
    Function,
    /// A named function type.
    FunctionTypeAlias,
    /// A method of a type.
    Method,
    /// A site with no declaration in source.
    Synthetic,
    /// A class, mixin or enum.
    Type,
    /// A top-level variable.
    Variable,
}

impl LocationType {
    /// Every kind, in marker order.
    pub const ALL: [LocationType; 8] = [
        LocationType::CompilationUnit,
        LocationType::Field,
        LocationType::Function,
        LocationType::FunctionTypeAlias,
        LocationType::Method,
        LocationType::Synthetic,
        LocationType::Type,
        LocationType::Variable,
    ];

    /// Persisted marker byte.
    pub const fn marker(self) -> u8 {
        match self {
            LocationType::CompilationUnit => b'C',
            LocationType::Field => b'F',
            LocationType::Function => b'N',
            LocationType::FunctionTypeAlias => b'A',
            LocationType::Method => b'M',
            LocationType::Synthetic => b'Z',
            LocationType::Type => b'T',
            LocationType::Variable => b'V',
        }
    }

    /// Kind for a marker byte; unknown markers are corruption.
    pub fn from_marker(marker: u8) -> Result<Self> {
        match marker {
            b'C' => Ok(LocationType::CompilationUnit),
            b'F' => Ok(LocationType::Field),
            b'N' => Ok(LocationType::Function),
            b'A' => Ok(LocationType::FunctionTypeAlias),
            b'M' => Ok(LocationType::Method),
            b'Z' => Ok(LocationType::Synthetic),
            b'T' => Ok(LocationType::Type),
            b'V' => Ok(LocationType::Variable),
            other => Err(IndexError::CorruptionOwned(format!(
                "unknown location marker {other:#04x}"
            ))),
        }
    }

    /// Human readable name used in dumps.
    pub const fn name(self) -> &'static str {
        match self {
            LocationType::CompilationUnit => "compilation-unit",
            LocationType::Field => "field",
            LocationType::Function => "function",
            LocationType::FunctionTypeAlias => "function-type-alias",
            LocationType::Method => "method",
            LocationType::Synthetic => "synthetic",
            LocationType::Type => "type",
            LocationType::Variable => "variable",
        }
    }
}

/// Identity of a reference site.
///
/// Equality, ordering and hashing use the kind and identifier only; the
/// owning file is carried along for diagnostics and dependency tracking.
#[derive(Clone)]
pub struct Location {
    kind: LocationType,
    identifier: Arc<str>,
    file: Option<Arc<str>>,
}

impl Location {
    /// Location with no owning file.
    pub fn new(kind: LocationType, identifier: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            file: None,
        }
    }

    /// Location owned by `file`.
    pub fn in_file(
        kind: LocationType,
        identifier: impl Into<Arc<str>>,
        file: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            kind,
            identifier: identifier.into(),
            file: Some(file.into()),
        }
    }

    /// The compilation unit of a source file; its owning file is itself.
    pub fn compilation_unit(path: &str) -> Self {
        Self::in_file(LocationType::CompilationUnit, path, path)
    }

    /// Kind of the site.
    pub fn kind(&self) -> LocationType {
        self.kind
    }

    /// Identifier unique within the kind.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Owning file, when known.
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    /// Copy of this location owned by `file`.
    pub fn with_file(&self, file: impl Into<Arc<str>>) -> Self {
        Self {
            kind: self.kind,
            identifier: Arc::clone(&self.identifier),
            file: Some(file.into()),
        }
    }

    /// Marker followed by the identifier; stable across runs.
    pub fn unique_identifier(&self) -> String {
        let mut out = String::with_capacity(self.identifier.len() + 1);
        out.push(self.kind.marker() as char);
        out.push_str(&self.identifier);
        out
    }

    /// Inverse of [`Location::unique_identifier`]. The result has no file.
    pub fn by_unique_identifier(unique: &str) -> Result<Self> {
        let mut chars = unique.chars();
        let marker = chars
            .next()
            .ok_or(IndexError::Invalid("empty unique identifier"))?;
        if !marker.is_ascii() {
            return Err(IndexError::InvalidOwned(format!(
                "unique identifier `{unique}` has a non-ASCII marker"
            )));
        }
        let kind = LocationType::from_marker(marker as u8)
            .map_err(|_| IndexError::InvalidOwned(format!("unknown marker in `{unique}`")))?;
        Ok(Self::new(kind, chars.as_str()))
    }

    /// Encodes the marker, identifier and owning file.
    pub fn save(&self, out: &mut ByteWriter) {
        out.put_u8(self.kind.marker());
        out.put_str(&self.identifier);
        match &self.file {
            Some(file) => {
                out.put_bool(true);
                out.put_str(file);
            }
            None => out.put_bool(false),
        }
    }

    /// Decodes a location written by [`Location::save`].
    pub fn load(input: &mut ByteReader<'_>) -> Result<Self> {
        let kind = LocationType::from_marker(input.get_u8()?)?;
        let identifier: Arc<str> = Arc::from(input.get_str()?);
        let file = if input.get_bool()? {
            Some(Arc::from(input.get_str()?))
        } else {
            None
        };
        Ok(Self {
            kind,
            identifier,
            file,
        })
    }
}

impl PartialEq for Location {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.identifier == other.identifier
    }
}

impl Eq for Location {}

impl Hash for Location {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.identifier.hash(state);
    }
}

impl PartialOrd for Location {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Location {
    fn cmp(&self, other: &Self) -> Ordering {
        self.kind
            .cmp(&other.kind)
            .then_with(|| self.identifier.cmp(&other.identifier))
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.name(), self.identifier)?;
        if let Some(file) = &self.file {
            if self.kind != LocationType::CompilationUnit {
                write!(f, " @ {file}")?;
            }
        }
        Ok(())
    }
}
