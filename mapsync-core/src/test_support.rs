//! Fixture builders shared by unit and behaviour tests.
//!
//! Ids are given in the signed wire convention; negative ids produce
//! `Created` elements with version `0`. The helpers panic on invalid input,
//! which is what a broken fixture should do.
//!
//! Available to unit tests and, through the `test-support` feature, to
//! integration tests and dependent crates.

use geo::Coord;

use crate::{DirtyTracker, Element, ElementKind, Member, OsmId, Storage};

/// Decode a signed wire id.
///
/// # Panics
/// Panics when `raw` is zero.
#[must_use]
pub fn id(raw: i64) -> OsmId {
    OsmId::from_raw(raw).unwrap_or_else(|err| panic!("invalid fixture id {raw}: {err}"))
}

/// A node at the origin.
#[must_use]
pub fn node(raw: i64, version: u64) -> Element {
    Element::node(id(raw), version, Coord { x: 0.0, y: 0.0 })
}

/// A node at `(lon, lat)`.
#[must_use]
pub fn node_at(raw: i64, version: u64, lon: f64, lat: f64) -> Element {
    Element::node(id(raw), version, Coord { x: lon, y: lat })
}

/// A way over the given node ids.
#[must_use]
pub fn way(raw: i64, version: u64, nodes: &[i64]) -> Element {
    Element::way(id(raw), version, nodes.iter().copied().map(id).collect())
}

/// A relation over `(kind, id, role)` members.
#[must_use]
pub fn relation(raw: i64, version: u64, members: &[(ElementKind, i64, &str)]) -> Element {
    Element::relation(
        id(raw),
        version,
        members
            .iter()
            .map(|(kind, member, role)| Member::new(*kind, id(*member), *role))
            .collect(),
    )
}

/// Storage pre-populated with `elements`.
///
/// # Panics
/// Panics when an element is rejected by [`Storage::insert`].
#[must_use]
pub fn storage_with<I>(elements: I) -> Storage
where
    I: IntoIterator<Item = Element>,
{
    let mut storage = Storage::new();
    for element in elements {
        let key = element.key();
        storage
            .insert(element)
            .unwrap_or_else(|err| panic!("fixture element {key} rejected: {err}"));
    }
    storage
}

/// A tracker over storage pre-populated with `elements`.
#[must_use]
pub fn tracker_with<I>(elements: I) -> DirtyTracker
where
    I: IntoIterator<Item = Element>,
{
    DirtyTracker::from_storage(storage_with(elements))
}
