//! Map element model: nodes, ways and relations.
//!
//! Every element carries the same identity, version, tag and edit-state
//! header. The kind-specific payload lives in [`Geometry`], a closed variant
//! over coordinates, node lists and member lists.
//!
//! # Examples
//! ```
//! use geo::Coord;
//! use mapsync_core::{EditState, Element, ElementKind, OsmId};
//!
//! # fn main() -> Result<(), mapsync_core::ElementError> {
//! let id = OsmId::from_raw(5)?;
//! let node = Element::node(id, 3, Coord { x: 13.4, y: 52.5 })
//!     .with_tags([("amenity", "cafe")]);
//! assert_eq!(node.kind(), ElementKind::Node);
//! assert_eq!(node.state, EditState::Unchanged);
//! assert_eq!(node.key().to_string(), "n5");
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;

use geo::Coord;
use thiserror::Error;

/// OpenStreetMap-style key/value tags. Keys are unique.
pub type Tags = BTreeMap<String, String>;

/// Largest magnitude accepted for an identifier in either id space.
const MAX_SERVER_ID: u64 = i64::MAX.unsigned_abs();
const MAX_LOCAL_ID: u64 = i64::MIN.unsigned_abs();

/// The three element kinds of the map graph.
///
/// Variant order doubles as the dependency rank used when ordering uploads:
/// nodes before ways before relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum ElementKind {
    /// A point with a coordinate.
    Node,
    /// An ordered list of node references.
    Way,
    /// An ordered list of typed, role-annotated members.
    Relation,
}

impl ElementKind {
    /// Return the kind as a lowercase `&str`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Way => "way",
            Self::Relation => "relation",
        }
    }

    /// Single-letter prefix used when displaying element references.
    #[must_use]
    pub const fn prefix(self) -> char {
        match self {
            Self::Node => 'n',
            Self::Way => 'w',
            Self::Relation => 'r',
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElementKind {
    type Err = ElementError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "node" | "n" => Ok(Self::Node),
            "way" | "w" => Ok(Self::Way),
            "relation" | "r" => Ok(Self::Relation),
            other => Err(ElementError::UnknownKind(other.to_owned())),
        }
    }
}

/// Element identity, split into the server and local id spaces.
///
/// Local ids belong to elements created offline that the remote service has
/// not yet assigned an id. On the wire they are negative integers; zero is
/// never a valid id.
///
/// # Examples
/// ```
/// use mapsync_core::OsmId;
///
/// # fn main() -> Result<(), mapsync_core::ElementError> {
/// let local = OsmId::from_raw(-3)?;
/// assert!(local.is_local());
/// assert_eq!(local.raw(), -3);
/// assert!(OsmId::from_raw(0).is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "i64", into = "i64")
)]
pub enum OsmId {
    /// An id assigned by the remote service.
    Server(NonZeroU64),
    /// A placeholder id for an element created locally.
    Local(NonZeroU64),
}

impl OsmId {
    /// Construct a server id, rejecting zero and values beyond `i64::MAX`.
    pub fn server(value: u64) -> Result<Self, ElementError> {
        if value > MAX_SERVER_ID {
            return Err(ElementError::IdOutOfRange { value });
        }
        NonZeroU64::new(value)
            .map(Self::Server)
            .ok_or(ElementError::ZeroId)
    }

    /// Construct a local id from its magnitude.
    pub fn local(magnitude: u64) -> Result<Self, ElementError> {
        if magnitude > MAX_LOCAL_ID {
            return Err(ElementError::IdOutOfRange { value: magnitude });
        }
        NonZeroU64::new(magnitude)
            .map(Self::Local)
            .ok_or(ElementError::ZeroId)
    }

    /// Decode a signed wire id: positive values are server ids, negative
    /// values are local ids.
    pub fn from_raw(raw: i64) -> Result<Self, ElementError> {
        if raw < 0 {
            Self::local(raw.unsigned_abs())
        } else {
            Self::server(raw.unsigned_abs())
        }
    }

    /// Encode the id in the signed wire convention.
    #[must_use]
    pub fn raw(self) -> i64 {
        match self {
            Self::Server(value) => i64::try_from(value.get()).unwrap_or(i64::MAX),
            Self::Local(magnitude) => 0_i64
                .checked_sub_unsigned(magnitude.get())
                .unwrap_or(i64::MIN),
        }
    }

    /// Whether the id is a local placeholder.
    #[must_use]
    pub const fn is_local(self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Magnitude of the id, regardless of id space.
    #[must_use]
    pub const fn magnitude(self) -> u64 {
        match self {
            Self::Server(value) | Self::Local(value) => value.get(),
        }
    }
}

impl fmt::Display for OsmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw())
    }
}

impl TryFrom<i64> for OsmId {
    type Error = ElementError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        Self::from_raw(raw)
    }
}

impl From<OsmId> for i64 {
    fn from(id: OsmId) -> Self {
        id.raw()
    }
}

/// Storage key: an element kind paired with an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ElementRef {
    /// Element kind.
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub kind: ElementKind,
    /// Element id.
    pub id: OsmId,
}

impl ElementRef {
    /// Pair a kind with an id.
    #[must_use]
    pub const fn new(kind: ElementKind, id: OsmId) -> Self {
        Self { kind, id }
    }

    /// Reference to a node.
    #[must_use]
    pub const fn node(id: OsmId) -> Self {
        Self::new(ElementKind::Node, id)
    }

    /// Reference to a way.
    #[must_use]
    pub const fn way(id: OsmId) -> Self {
        Self::new(ElementKind::Way, id)
    }

    /// Reference to a relation.
    #[must_use]
    pub const fn relation(id: OsmId) -> Self {
        Self::new(ElementKind::Relation, id)
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.id)
    }
}

/// Local edit status relative to the last known server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum EditState {
    /// Identical to the last known server state.
    #[default]
    Unchanged,
    /// Created locally; carries a local id.
    Created,
    /// Edited locally since the last sync.
    Modified,
    /// Deleted locally; kept as a tombstone until uploaded.
    Deleted,
}

impl EditState {
    /// Whether the element needs uploading.
    #[must_use]
    pub const fn is_dirty(self) -> bool {
        !matches!(self, Self::Unchanged)
    }

    /// Return the state as a lowercase `&str`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EditState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EditState {
    type Err = ElementError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "unchanged" => Ok(Self::Unchanged),
            "created" => Ok(Self::Created),
            "modified" => Ok(Self::Modified),
            "deleted" => Ok(Self::Deleted),
            other => Err(ElementError::UnknownState(other.to_owned())),
        }
    }
}

/// A relation member: a typed reference with a role.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Member {
    /// Kind of the referenced element.
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub kind: ElementKind,
    /// Id of the referenced element.
    pub id: OsmId,
    /// Free-form role, possibly empty.
    pub role: String,
}

impl Member {
    /// Build a member from its parts.
    pub fn new(kind: ElementKind, id: OsmId, role: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            role: role.into(),
        }
    }

    /// The referenced element.
    #[must_use]
    pub const fn target(&self) -> ElementRef {
        ElementRef::new(self.kind, self.id)
    }
}

/// Kind-specific element content.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum Geometry {
    /// WGS84 coordinate with `x = longitude` and `y = latitude`.
    Node(Coord<f64>),
    /// Ordered node ids; closed ways repeat the first id as the last.
    Way(Vec<OsmId>),
    /// Ordered relation members.
    Relation(Vec<Member>),
}

impl Geometry {
    /// The element kind this geometry belongs to.
    #[must_use]
    pub const fn kind(&self) -> ElementKind {
        match self {
            Self::Node(_) => ElementKind::Node,
            Self::Way(_) => ElementKind::Way,
            Self::Relation(_) => ElementKind::Relation,
        }
    }

    /// Every element referenced by this geometry, in order, duplicates kept.
    #[must_use]
    pub fn references(&self) -> Vec<ElementRef> {
        match self {
            Self::Node(_) => Vec::new(),
            Self::Way(nodes) => nodes.iter().copied().map(ElementRef::node).collect(),
            Self::Relation(members) => members.iter().map(Member::target).collect(),
        }
    }

    /// Rewrite every reference to `target` so it points at `new_id`.
    pub fn remap_reference(&mut self, target: ElementRef, new_id: OsmId) -> bool {
        let mut changed = false;
        match self {
            Self::Node(_) => {}
            Self::Way(nodes) => {
                if target.kind == ElementKind::Node {
                    for node in nodes.iter_mut().filter(|node| **node == target.id) {
                        *node = new_id;
                        changed = true;
                    }
                }
            }
            Self::Relation(members) => {
                for member in members.iter_mut().filter(|m| m.target() == target) {
                    member.id = new_id;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Drop every reference to `target`.
    pub fn strip_reference(&mut self, target: ElementRef) -> bool {
        let before = self.references().len();
        match self {
            Self::Node(_) => {}
            Self::Way(nodes) => {
                if target.kind == ElementKind::Node {
                    nodes.retain(|node| *node != target.id);
                }
            }
            Self::Relation(members) => members.retain(|m| m.target() != target),
        }
        self.references().len() != before
    }
}

/// A node, way or relation with its shared header.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Element {
    /// Identity within the element's kind.
    pub id: OsmId,
    /// Last version known to be authoritative; `0` for local creations.
    pub version: u64,
    /// Key/value tags.
    #[cfg_attr(feature = "serde", serde(default))]
    pub tags: Tags,
    /// Local edit status.
    #[cfg_attr(feature = "serde", serde(default))]
    pub state: EditState,
    /// Kind-specific content.
    pub geometry: Geometry,
}

impl Element {
    /// Build an element. Local ids start out `Created`, server ids
    /// `Unchanged`.
    #[must_use]
    pub fn new(id: OsmId, version: u64, geometry: Geometry) -> Self {
        let state = if id.is_local() {
            EditState::Created
        } else {
            EditState::Unchanged
        };
        Self {
            id,
            version,
            tags: Tags::new(),
            state,
            geometry,
        }
    }

    /// Build a node at `location`.
    #[must_use]
    pub fn node(id: OsmId, version: u64, location: Coord<f64>) -> Self {
        Self::new(id, version, Geometry::Node(location))
    }

    /// Build a way over `nodes`.
    #[must_use]
    pub fn way(id: OsmId, version: u64, nodes: Vec<OsmId>) -> Self {
        Self::new(id, version, Geometry::Way(nodes))
    }

    /// Build a relation over `members`.
    #[must_use]
    pub fn relation(id: OsmId, version: u64, members: Vec<Member>) -> Self {
        Self::new(id, version, Geometry::Relation(members))
    }

    /// Replace the tags.
    #[must_use]
    pub fn with_tags<I, K, V>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.tags = tags
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self
    }

    /// Override the edit state.
    #[must_use]
    pub fn with_state(mut self, state: EditState) -> Self {
        self.state = state;
        self
    }

    /// Element kind, derived from the geometry.
    #[must_use]
    pub const fn kind(&self) -> ElementKind {
        self.geometry.kind()
    }

    /// Storage key of this element.
    #[must_use]
    pub const fn key(&self) -> ElementRef {
        ElementRef::new(self.kind(), self.id)
    }

    /// Whether the element carries a local id.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        self.id.is_local()
    }

    /// Every element referenced by this one.
    #[must_use]
    pub fn references(&self) -> Vec<ElementRef> {
        self.geometry.references()
    }

    /// Node ids of a way, `None` for other kinds.
    #[must_use]
    pub fn node_refs(&self) -> Option<&[OsmId]> {
        match &self.geometry {
            Geometry::Way(nodes) => Some(nodes),
            Geometry::Node(_) | Geometry::Relation(_) => None,
        }
    }

    /// Members of a relation, `None` for other kinds.
    #[must_use]
    pub fn members(&self) -> Option<&[Member]> {
        match &self.geometry {
            Geometry::Relation(members) => Some(members),
            Geometry::Node(_) | Geometry::Way(_) => None,
        }
    }

    /// Coordinate of a node, `None` for other kinds.
    #[must_use]
    pub const fn location(&self) -> Option<Coord<f64>> {
        match &self.geometry {
            Geometry::Node(location) => Some(*location),
            Geometry::Way(_) | Geometry::Relation(_) => None,
        }
    }

    /// Whether tags and geometry match, ignoring version and state.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.tags == other.tags && self.geometry == other.geometry
    }

    /// Rewrite every reference to `target` so it points at `new_id`.
    ///
    /// Returns `true` when at least one reference changed.
    pub fn remap_reference(&mut self, target: ElementRef, new_id: OsmId) -> bool {
        self.geometry.remap_reference(target, new_id)
    }

    /// Drop every reference to `target`.
    ///
    /// Returns `true` when at least one reference was removed.
    pub fn strip_reference(&mut self, target: ElementRef) -> bool {
        self.geometry.strip_reference(target)
    }

    /// Check the identity/state invariants.
    ///
    /// `Created` holds exactly for local ids, local ids carry version `0`,
    /// and node coordinates must be finite WGS84 values.
    pub fn validate(&self) -> Result<(), ElementError> {
        let key = self.key();
        if self.is_local() != (self.state == EditState::Created) {
            return Err(ElementError::StateMismatch {
                key,
                state: self.state,
            });
        }
        if self.is_local() && self.version != 0 {
            return Err(ElementError::LocalVersion {
                key,
                version: self.version,
            });
        }
        if let Some(location) = self.location()
            && !valid_location(location)
        {
            return Err(ElementError::InvalidLocation { key });
        }
        Ok(())
    }
}

fn valid_location(location: Coord<f64>) -> bool {
    location.x.is_finite()
        && location.y.is_finite()
        && (-180.0..=180.0).contains(&location.x)
        && (-90.0..=90.0).contains(&location.y)
}

/// Errors raised while constructing or validating elements.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ElementError {
    /// Zero is not a valid id in either id space.
    #[error("element id must not be zero")]
    ZeroId,
    /// The id does not fit the signed wire representation.
    #[error("element id {value} is outside the supported range")]
    IdOutOfRange {
        /// Magnitude that failed the conversion.
        value: u64,
    },
    /// An element kind name was not recognised.
    #[error("unknown element kind `{0}`")]
    UnknownKind(String),
    /// An edit state name was not recognised.
    #[error("unknown edit state `{0}`")]
    UnknownState(String),
    /// `Created` was used with a server id, or a local id was not `Created`.
    #[error("{key} cannot be {state}: created state and local ids must coincide")]
    StateMismatch {
        /// Offending element.
        key: ElementRef,
        /// State carried by the element.
        state: EditState,
    },
    /// A local element claimed a server version.
    #[error("{key} has a local id but version {version}")]
    LocalVersion {
        /// Offending element.
        key: ElementRef,
        /// Version carried by the element.
        version: u64,
    },
    /// A node coordinate was not a finite WGS84 value.
    #[error("{key} has an invalid coordinate")]
    InvalidLocation {
        /// Offending element.
        key: ElementRef,
    },
}
