//! Relationship layers and their per-location payloads.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock};

use rustc_hash::FxHashMap;

use super::location::Location;
use crate::index::{FileTransaction, LayerUpdater};
use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::types::{Checksum, Crc32Fast, FatalError, IndexError, Result};

const REVERSE_EDGES_MARKER: u8 = b'R';
const BIDIRECTIONAL_MARKER: u8 = b'B';

/// Name of a relationship kind, e.g. `"overrides"` or `"calls"`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct LayerId(Arc<str>);

impl LayerId {
    /// Wraps a layer name.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// The name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Direction of a layer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum LayerKind {
    /// Stores only who references a location.
    Unidirectional,
    /// Also stores what a location references.
    Bidirectional,
}

impl LayerKind {
    const fn tag(self) -> u8 {
        match self {
            LayerKind::Unidirectional => b'U',
            LayerKind::Bidirectional => b'B',
        }
    }
}

/// Registration record of a layer. The ordinal is assigned once, when the
/// layer joins a [`LayerSet`], and never changes afterwards.
#[derive(Debug)]
pub struct LayerInfo {
    id: LayerId,
    kind: LayerKind,
    ordinal: OnceLock<u16>,
}

impl LayerInfo {
    /// Name of the layer.
    pub fn id(&self) -> &LayerId {
        &self.id
    }

    /// Direction of the layer.
    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    /// Assigns the ordinal. A second assignment is a fatal configuration bug.
    pub fn assign_ordinal(&self, ordinal: u16) -> Result<()> {
        self.ordinal.set(ordinal).map_err(|_| {
            let existing = self.ordinal.get().copied().unwrap_or(ordinal);
            IndexError::Fatal(FatalError::OrdinalReassigned {
                layer: self.id.to_string(),
                existing,
            })
        })
    }

    /// Ordinal, once assigned.
    pub fn ordinal(&self) -> Option<u16> {
        self.ordinal.get().copied()
    }
}

/// Per-(layer, location) payload: the unique set of sources referencing the
/// location and, for bidirectional layers, the locations it references.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LocationInfo {
    /// Payload of a unidirectional layer.
    ReverseEdges {
        /// Locations referencing this one.
        sources: BTreeSet<Location>,
    },
    /// Payload of a bidirectional layer.
    Bidirectional {
        /// Locations referencing this one.
        sources: BTreeSet<Location>,
        /// Locations this one references.
        destinations: BTreeSet<Location>,
    },
}

impl LocationInfo {
    /// Empty payload of the shape `kind` stores.
    pub fn empty(kind: LayerKind) -> Self {
        match kind {
            LayerKind::Unidirectional => LocationInfo::ReverseEdges {
                sources: BTreeSet::new(),
            },
            LayerKind::Bidirectional => LocationInfo::Bidirectional {
                sources: BTreeSet::new(),
                destinations: BTreeSet::new(),
            },
        }
    }

    /// Layer direction this payload belongs to.
    pub fn kind(&self) -> LayerKind {
        match self {
            LocationInfo::ReverseEdges { .. } => LayerKind::Unidirectional,
            LocationInfo::Bidirectional { .. } => LayerKind::Bidirectional,
        }
    }

    /// Locations referencing this one.
    pub fn sources(&self) -> &BTreeSet<Location> {
        match self {
            LocationInfo::ReverseEdges { sources } | LocationInfo::Bidirectional { sources, .. } => {
                sources
            }
        }
    }

    /// Forward edges; always empty for reverse-only payloads.
    pub fn destinations(&self) -> impl Iterator<Item = &Location> {
        let set = match self {
            LocationInfo::ReverseEdges { .. } => None,
            LocationInfo::Bidirectional { destinations, .. } => Some(destinations),
        };
        set.into_iter().flatten()
    }

    /// Returns true when `source` was not present yet.
    pub fn add_source(&mut self, source: Location) -> bool {
        match self {
            LocationInfo::ReverseEdges { sources } | LocationInfo::Bidirectional { sources, .. } => {
                sources.insert(source)
            }
        }
    }

    /// Returns true when `source` was present.
    pub fn remove_source(&mut self, source: &Location) -> bool {
        match self {
            LocationInfo::ReverseEdges { sources } | LocationInfo::Bidirectional { sources, .. } => {
                sources.remove(source)
            }
        }
    }

    /// Records a forward edge. Fails on reverse-only payloads.
    pub fn add_destination(&mut self, destination: Location) -> Result<bool> {
        match self {
            LocationInfo::Bidirectional { destinations, .. } => Ok(destinations.insert(destination)),
            LocationInfo::ReverseEdges { .. } => Err(IndexError::Invalid(
                "forward edge recorded in a unidirectional layer",
            )),
        }
    }

    /// Returns true when `destination` was present.
    pub fn remove_destination(&mut self, destination: &Location) -> bool {
        match self {
            LocationInfo::Bidirectional { destinations, .. } => destinations.remove(destination),
            LocationInfo::ReverseEdges { .. } => false,
        }
    }

    /// True when no edge remains in either direction.
    pub fn is_empty(&self) -> bool {
        match self {
            LocationInfo::ReverseEdges { sources } => sources.is_empty(),
            LocationInfo::Bidirectional {
                sources,
                destinations,
            } => sources.is_empty() && destinations.is_empty(),
        }
    }

    /// Encodes the payload with its variant marker.
    pub fn save(&self, out: &mut ByteWriter) {
        match self {
            LocationInfo::ReverseEdges { sources } => {
                out.put_u8(REVERSE_EDGES_MARKER);
                save_set(sources, out);
            }
            LocationInfo::Bidirectional {
                sources,
                destinations,
            } => {
                out.put_u8(BIDIRECTIONAL_MARKER);
                save_set(sources, out);
                save_set(destinations, out);
            }
        }
    }

    /// Decodes a payload of either variant.
    pub fn load(input: &mut ByteReader<'_>) -> Result<Self> {
        match input.get_u8()? {
            REVERSE_EDGES_MARKER => Ok(LocationInfo::ReverseEdges {
                sources: load_set(input)?,
            }),
            BIDIRECTIONAL_MARKER => Ok(LocationInfo::Bidirectional {
                sources: load_set(input)?,
                destinations: load_set(input)?,
            }),
            other => Err(IndexError::CorruptionOwned(format!(
                "unknown location info marker {other:#04x}"
            ))),
        }
    }
}

fn save_set(set: &BTreeSet<Location>, out: &mut ByteWriter) {
    out.put_var(set.len() as u64);
    for loc in set {
        loc.save(out);
    }
}

fn load_set(input: &mut ByteReader<'_>) -> Result<BTreeSet<Location>> {
    let count = input.get_var()?;
    if count > input.remaining() as u64 {
        return Err(IndexError::Corruption("location set count exceeds record"));
    }
    let mut set = BTreeSet::new();
    for _ in 0..count {
        set.insert(Location::load(input)?);
    }
    Ok(set)
}

/// A relationship kind with its behavior. Cloning shares the registration.
#[derive(Clone, Debug)]
pub struct Layer {
    info: Arc<LayerInfo>,
}

impl Layer {
    /// New unregistered layer.
    pub fn new(name: impl Into<Arc<str>>, kind: LayerKind) -> Self {
        Self {
            info: Arc::new(LayerInfo {
                id: LayerId::new(name),
                kind,
                ordinal: OnceLock::new(),
            }),
        }
    }

    /// New layer storing only reverse edges.
    pub fn unidirectional(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, LayerKind::Unidirectional)
    }

    /// New layer storing edges in both directions.
    pub fn bidirectional(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, LayerKind::Bidirectional)
    }

    /// Shared registration record.
    pub fn info(&self) -> &LayerInfo {
        &self.info
    }

    /// Name of the layer.
    pub fn id(&self) -> &LayerId {
        &self.info.id
    }

    /// True when forward edges are stored too.
    pub fn is_bidirectional(&self) -> bool {
        self.info.kind == LayerKind::Bidirectional
    }

    /// Ordinal assigned at registration.
    pub fn ordinal(&self) -> Result<u16> {
        self.info.ordinal().ok_or_else(|| {
            IndexError::InvalidOwned(format!("layer `{}` is not registered", self.info.id))
        })
    }

    /// Empty payload for a location in this layer.
    pub fn create_empty_location_info(&self) -> LocationInfo {
        LocationInfo::empty(self.info.kind)
    }

    /// Batches edits of one file to this layer.
    pub fn create_layer_updater<'t>(&self, transaction: &'t mut FileTransaction) -> LayerUpdater<'t> {
        LayerUpdater::new(self.clone(), transaction)
    }

    /// Decodes a payload and checks it belongs to this layer's kind.
    pub fn load_location_info(&self, input: &mut ByteReader<'_>) -> Result<LocationInfo> {
        let info = LocationInfo::load(input)?;
        if info.kind() != self.info.kind {
            return Err(IndexError::CorruptionOwned(format!(
                "layer `{}` record has the wrong payload kind",
                self.info.id
            )));
        }
        Ok(info)
    }

    /// Encodes `info`, rejecting payloads of the other kind.
    pub fn save(&self, info: &LocationInfo, out: &mut ByteWriter) -> Result<()> {
        if info.kind() != self.info.kind {
            return Err(IndexError::InvalidOwned(format!(
                "payload kind does not match layer `{}`",
                self.info.id
            )));
        }
        info.save(out);
        Ok(())
    }

    /// True when both handles share one registration.
    pub fn same_as(&self, other: &Layer) -> bool {
        Arc::ptr_eq(&self.info, &other.info)
    }
}

/// Persisted shape of a layer configuration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LayerSchema {
    /// Number of registered layers.
    pub layer_count: u16,
    /// Crc32 of the ordered layer names and kinds.
    pub fingerprint: u64,
}

/// Registered layers in ordinal order.
#[derive(Clone, Debug, Default)]
pub struct LayerSet {
    layers: Vec<Layer>,
    by_name: FxHashMap<LayerId, u16>,
}

impl LayerSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next ordinal to `layer`.
    pub fn register(&mut self, layer: Layer) -> Result<u16> {
        if self.by_name.contains_key(layer.id()) {
            return Err(IndexError::InvalidOwned(format!(
                "layer `{}` registered twice",
                layer.id()
            )));
        }
        let ordinal = u16::try_from(self.layers.len())
            .map_err(|_| IndexError::Invalid("too many layers"))?;
        layer.info.assign_ordinal(ordinal)?;
        self.by_name.insert(layer.id().clone(), ordinal);
        self.layers.push(layer);
        Ok(ordinal)
    }

    /// Layer registered under `ordinal`.
    pub fn get(&self, ordinal: u16) -> Option<&Layer> {
        self.layers.get(ordinal as usize)
    }

    /// Layer for a record ordinal; unknown ordinals are fatal.
    pub fn require(&self, ordinal: u16) -> Result<&Layer> {
        self.get(ordinal)
            .ok_or(IndexError::Fatal(FatalError::UnknownOrdinal(ordinal)))
    }

    /// Layer registered under `name`.
    pub fn by_name(&self, name: &str) -> Option<&Layer> {
        let ordinal = *self.by_name.get(&LayerId::new(name))?;
        self.get(ordinal)
    }

    /// Checks that `layer` is the registered instance for its ordinal.
    pub fn contains(&self, layer: &Layer) -> bool {
        layer
            .info
            .ordinal()
            .and_then(|ordinal| self.get(ordinal))
            .map(|registered| registered.same_as(layer))
            .unwrap_or(false)
    }

    /// Number of registered layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layers in ordinal order.
    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    /// Count and crc32 fingerprint of the ordered names and kinds.
    pub fn schema(&self) -> LayerSchema {
        let mut hasher = Crc32Fast::default();
        for layer in &self.layers {
            hasher.update(layer.id().as_str().as_bytes());
            hasher.update(&[0, layer.info.kind.tag()]);
        }
        LayerSchema {
            layer_count: self.layers.len() as u16,
            fingerprint: u64::from(hasher.finalize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LocationType;

    fn loc(id: &str) -> Location {
        Location::new(LocationType::Method, id)
    }

    #[test]
    fn ordinals_follow_registration_order() {
        let mut set = LayerSet::new();
        let calls = Layer::unidirectional("calls");
        let overrides = Layer::bidirectional("overrides");
        assert_eq!(set.register(calls.clone()).unwrap(), 0);
        assert_eq!(set.register(overrides.clone()).unwrap(), 1);
        assert_eq!(calls.ordinal().unwrap(), 0);
        assert_eq!(overrides.ordinal().unwrap(), 1);
        assert!(set.by_name("overrides").unwrap().is_bidirectional());
        assert!(set.contains(&calls));
        assert!(!set.contains(&Layer::unidirectional("calls")));
    }

    #[test]
    fn second_ordinal_assignment_is_fatal() {
        let layer = Layer::unidirectional("calls");
        let mut first = LayerSet::new();
        first.register(layer.clone()).unwrap();
        let mut second = LayerSet::new();
        second.register(Layer::unidirectional("other")).unwrap();
        let err = second.register(layer).unwrap_err();
        assert!(matches!(
            err,
            IndexError::Fatal(FatalError::OrdinalReassigned { existing: 0, .. })
        ));
    }

    #[test]
    fn unregistered_layer_has_no_ordinal() {
        assert!(Layer::unidirectional("x").ordinal().is_err());
    }

    #[test]
    fn unknown_ordinal_is_fatal() {
        let set = LayerSet::new();
        assert!(matches!(
            set.require(3),
            Err(IndexError::Fatal(FatalError::UnknownOrdinal(3)))
        ));
    }

    #[test]
    fn schema_depends_on_order_and_kind() {
        let mut a = LayerSet::new();
        a.register(Layer::unidirectional("calls")).unwrap();
        a.register(Layer::bidirectional("overrides")).unwrap();
        let mut b = LayerSet::new();
        b.register(Layer::bidirectional("overrides")).unwrap();
        b.register(Layer::unidirectional("calls")).unwrap();
        let mut c = LayerSet::new();
        c.register(Layer::unidirectional("calls")).unwrap();
        c.register(Layer::unidirectional("overrides")).unwrap();
        assert_eq!(a.schema().layer_count, 2);
        assert_ne!(a.schema(), b.schema());
        assert_ne!(a.schema(), c.schema());
    }

    #[test]
    fn sources_are_a_set() {
        let layer = Layer::unidirectional("calls");
        let mut info = layer.create_empty_location_info();
        assert!(info.add_source(loc("a")));
        assert!(!info.add_source(loc("a")));
        assert_eq!(info.sources().len(), 1);
        assert!(info.add_destination(loc("b")).is_err());
        assert!(info.remove_source(&loc("a")));
        assert!(info.is_empty());
    }

    #[test]
    fn payload_codec_checks_kind() {
        let bidi = Layer::bidirectional("overrides");
        let mut info = bidi.create_empty_location_info();
        info.add_source(loc("sub"));
        info.add_destination(loc("super")).unwrap();
        let mut w = ByteWriter::new();
        bidi.save(&info, &mut w).unwrap();
        let bytes = w.into_inner();

        let back = bidi
            .load_location_info(&mut ByteReader::new(&bytes))
            .unwrap();
        assert_eq!(back, info);
        assert_eq!(back.destinations().count(), 1);

        let uni = Layer::unidirectional("calls");
        assert!(uni
            .load_location_info(&mut ByteReader::new(&bytes))
            .is_err());
        assert!(matches!(
            LocationInfo::load(&mut ByteReader::new(b"X")),
            Err(IndexError::CorruptionOwned(_))
        ));
    }
}
