//! Authoritative in-memory element storage.
//!
//! [`Storage`] owns every current element keyed by [`ElementRef`] and keeps a
//! reverse-reference index patched inside each mutating call, so referential
//! checks never see a stale index. Readers take a [`Snapshot`], which shares
//! element allocations and is unaffected by later writes.
//!
//! # Examples
//! ```
//! use geo::Coord;
//! use mapsync_core::{Element, ElementRef, OsmId, RemoveMode, Storage, StorageError};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut storage = Storage::new();
//! let n1 = OsmId::from_raw(1)?;
//! let n2 = OsmId::from_raw(2)?;
//! storage.insert(Element::node(n1, 1, Coord { x: 0.0, y: 0.0 }))?;
//! storage.insert(Element::node(n2, 1, Coord { x: 1.0, y: 0.0 }))?;
//! storage.insert(Element::way(OsmId::from_raw(10)?, 1, vec![n1, n2]))?;
//!
//! let err = storage.remove(ElementRef::node(n1), RemoveMode::Strict);
//! assert!(matches!(err, Err(StorageError::DanglingReference { .. })));
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::{EditState, Element, ElementError, ElementKind, ElementRef, Member, OsmId};

mod index;

use index::ReverseIndex;

/// How [`Storage::remove`] treats elements that are still referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemoveMode {
    /// Refuse to remove a referenced element.
    #[default]
    Strict,
    /// Remove anyway and leave the references dangling.
    Force,
    /// Remove the element and strip it from every referrer.
    Cascade,
}

/// Errors raised by [`Storage`] mutations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorageError {
    /// An element with the same kind and id already exists.
    #[error("{key} already exists")]
    DuplicateId {
        /// Conflicting key.
        key: ElementRef,
    },
    /// The element is still referenced by other elements.
    #[error("{target} is still referenced by {}", RefList(.referrers))]
    DanglingReference {
        /// Element whose removal was refused.
        target: ElementRef,
        /// Elements still referring to it.
        referrers: Vec<ElementRef>,
    },
    /// No element exists under the key.
    #[error("{key} does not exist")]
    NotFound {
        /// Missing key.
        key: ElementRef,
    },
    /// The element no longer holds the value a recorded edit started from.
    #[error("{key} changed since the edit was recorded")]
    StaleEdit {
        /// Element that moved on.
        key: ElementRef,
    },
    /// The element failed validation.
    #[error(transparent)]
    InvalidElement(#[from] ElementError),
}

/// Formats a list of element references as `n1, w2`.
pub(crate) struct RefList<'a>(pub(crate) &'a [ElementRef]);

impl fmt::Display for RefList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, key) in self.0.iter().enumerate() {
            if position > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}")?;
        }
        Ok(())
    }
}

/// The collection of all current elements plus derived reverse indices.
#[derive(Debug, Default, Clone)]
pub struct Storage {
    elements: BTreeMap<ElementRef, Arc<Element>>,
    index: ReverseIndex,
    last_local_id: u64,
}

impl Storage {
    /// Create an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an element.
    #[must_use]
    pub fn get(&self, key: ElementRef) -> Option<&Element> {
        self.elements.get(&key).map(Arc::as_ref)
    }

    /// Look up an element by kind and id.
    #[must_use]
    pub fn get_by(&self, kind: ElementKind, id: OsmId) -> Option<&Element> {
        self.get(ElementRef::new(kind, id))
    }

    /// Whether an element exists under `key`.
    #[must_use]
    pub fn contains(&self, key: ElementRef) -> bool {
        self.elements.contains_key(&key)
    }

    /// Number of stored elements, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the storage holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Borrowing iterator in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Element> + '_ {
        self.elements.values().map(Arc::as_ref)
    }

    /// Restartable, isolated view of every element at this instant.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            elements: self.elements.values().cloned().collect(),
        }
    }

    /// Insert a new element.
    ///
    /// Local ids advance the local id allocator so restored placeholders are
    /// never handed out twice.
    pub fn insert(&mut self, element: Element) -> Result<(), StorageError> {
        element.validate()?;
        let key = element.key();
        if self.elements.contains_key(&key) {
            return Err(StorageError::DuplicateId { key });
        }
        if element.is_local() {
            self.last_local_id = self.last_local_id.max(element.id.magnitude());
        }
        self.index.link(&element);
        self.elements.insert(key, Arc::new(element));
        Ok(())
    }

    /// Replace an existing element, patching the reverse index.
    ///
    /// Returns the previous value.
    pub fn replace(&mut self, element: Element) -> Result<Element, StorageError> {
        element.validate()?;
        let key = element.key();
        let Some(previous) = self.elements.get(&key).cloned() else {
            return Err(StorageError::NotFound { key });
        };
        self.index.unlink(&previous);
        self.index.link(&element);
        self.elements.insert(key, Arc::new(element));
        Ok(Arc::unwrap_or_clone(previous))
    }

    /// Apply `edit` to a copy of the element under `key` and store the result.
    pub fn update<F>(&mut self, key: ElementRef, edit: F) -> Result<Element, StorageError>
    where
        F: FnOnce(&mut Element),
    {
        let mut next = self
            .get(key)
            .cloned()
            .ok_or(StorageError::NotFound { key })?;
        edit(&mut next);
        self.replace(next)
    }

    /// Remove an element.
    ///
    /// Returns `Ok(None)` when nothing is stored under `key`.
    pub fn remove(
        &mut self,
        key: ElementRef,
        mode: RemoveMode,
    ) -> Result<Option<Element>, StorageError> {
        if !self.elements.contains_key(&key) {
            return Ok(None);
        }
        let referrers: Vec<ElementRef> = self
            .referrers(key)
            .into_iter()
            .filter(|referrer| *referrer != key)
            .collect();
        match mode {
            RemoveMode::Strict if !referrers.is_empty() => {
                return Err(StorageError::DanglingReference {
                    target: key,
                    referrers,
                });
            }
            RemoveMode::Cascade => {
                for referrer in referrers {
                    self.update(referrer, |element| {
                        element.strip_reference(key);
                    })?;
                    debug!("stripped {key} from {referrer}");
                }
            }
            RemoveMode::Strict | RemoveMode::Force => {}
        }
        let removed = self.elements.remove(&key);
        Ok(removed.map(|element| {
            self.index.unlink(&element);
            Arc::unwrap_or_clone(element)
        }))
    }

    /// Every element referring to `key`, whatever its state.
    #[must_use]
    pub fn referrers(&self, key: ElementRef) -> Vec<ElementRef> {
        self.index.referrers(&key).collect()
    }

    /// Stored, non-deleted elements referring to `key`.
    #[must_use]
    pub fn live_referrers(&self, key: ElementRef) -> Vec<ElementRef> {
        self.index
            .referrers(&key)
            .filter(|referrer| {
                self.get(*referrer)
                    .is_some_and(|element| element.state != EditState::Deleted)
            })
            .collect()
    }

    /// Allocate a fresh local id.
    pub fn next_local_id(&mut self) -> Result<OsmId, ElementError> {
        let next = self
            .last_local_id
            .checked_add(1)
            .ok_or(ElementError::IdOutOfRange {
                value: self.last_local_id,
            })?;
        let id = OsmId::local(next)?;
        self.last_local_id = next;
        Ok(id)
    }

    /// Move the element stored under `(kind, old)` to `new`, rewriting every
    /// way and relation that referred to the old id.
    pub fn remap_id(
        &mut self,
        kind: ElementKind,
        old: OsmId,
        new: OsmId,
    ) -> Result<(), StorageError> {
        let old_key = ElementRef::new(kind, old);
        let new_key = ElementRef::new(kind, new);
        if self.elements.contains_key(&new_key) {
            return Err(StorageError::DuplicateId { key: new_key });
        }
        let Some(moved) = self.elements.remove(&old_key) else {
            return Err(StorageError::NotFound { key: old_key });
        };
        self.index.unlink(&moved);
        for referrer in self.referrers(old_key) {
            let Some(current) = self.elements.get(&referrer).cloned() else {
                continue;
            };
            let mut rewritten = Arc::unwrap_or_clone(current);
            rewritten.remap_reference(old_key, new);
            self.replace_unchecked(rewritten);
        }
        let mut element = Arc::unwrap_or_clone(moved);
        element.id = new;
        element.remap_reference(old_key, new);
        self.index.link(&element);
        self.elements.insert(new_key, Arc::new(element));
        debug!("remapped {old_key} to {new_key}");
        Ok(())
    }

    /// Report incomplete ways and dangling relation members.
    ///
    /// Tombstones do not count as present for live referrers.
    #[must_use]
    pub fn integrity_report(&self) -> IntegrityReport {
        let mut report = IntegrityReport::default();
        let present = |key: ElementRef| {
            self.get(key)
                .is_some_and(|element| element.state != EditState::Deleted)
        };
        for element in self.iter().filter(|e| e.state != EditState::Deleted) {
            if let Some(nodes) = element.node_refs() {
                let missing: Vec<OsmId> = nodes
                    .iter()
                    .copied()
                    .filter(|node| !present(ElementRef::node(*node)))
                    .collect();
                if !missing.is_empty() {
                    report.incomplete_ways.push(IncompleteWay {
                        way: element.id,
                        missing_nodes: missing,
                    });
                }
            }
            if let Some(members) = element.members() {
                report.dangling_members.extend(
                    members
                        .iter()
                        .filter(|member| !present(member.target()))
                        .map(|member| DanglingMember {
                            relation: element.id,
                            member: member.clone(),
                        }),
                );
            }
        }
        report
    }

    fn replace_unchecked(&mut self, element: Element) {
        let key = element.key();
        if let Some(previous) = self.elements.get(&key).cloned() {
            self.index.unlink(&previous);
        }
        self.index.link(&element);
        self.elements.insert(key, Arc::new(element));
    }
}

/// A point-in-time copy of storage contents.
///
/// Cloning is cheap and iteration can be restarted any number of times.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    elements: Arc<[Arc<Element>]>,
}

impl Snapshot {
    /// Iterate the captured elements in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Element> + '_ {
        self.elements.iter().map(Arc::as_ref)
    }

    /// Number of captured elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Element;
    type IntoIter = std::iter::Map<std::slice::Iter<'a, Arc<Element>>, fn(&Arc<Element>) -> &Element>;

    fn into_iter(self) -> Self::IntoIter {
        self.elements.iter().map(shared_element)
    }
}

fn shared_element(element: &Arc<Element>) -> &Element {
    element
}

/// Structural problems found by [`Storage::integrity_report`].
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IntegrityReport {
    /// Live ways with node references that do not resolve.
    pub incomplete_ways: Vec<IncompleteWay>,
    /// Live relation members that do not resolve.
    pub dangling_members: Vec<DanglingMember>,
}

impl IntegrityReport {
    /// Whether no problems were found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.incomplete_ways.is_empty() && self.dangling_members.is_empty()
    }
}

/// A way whose node list does not fully resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IncompleteWay {
    /// Way id.
    pub way: OsmId,
    /// Node ids missing from storage, in way order.
    pub missing_nodes: Vec<OsmId>,
}

/// A relation member whose target is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DanglingMember {
    /// Relation id.
    pub relation: OsmId,
    /// The unresolved member.
    pub member: Member,
}
