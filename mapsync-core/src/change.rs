//! Change documents: ordered create/modify/delete operations.

use std::fmt;
use std::str::FromStr;

use crate::{Element, ElementRef};

/// Operation carried by a change entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum ChangeAction {
    /// Add a new element.
    Create,
    /// Overwrite an existing element.
    Modify,
    /// Remove an element.
    Delete,
}

impl ChangeAction {
    /// Lowercase name as used in change files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "modify" => Ok(Self::Modify),
            "delete" => Ok(Self::Delete),
            other => Err(UnknownAction(other.to_owned())),
        }
    }
}

/// An action name outside `create`, `modify` and `delete`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown change action `{0}`")]
pub struct UnknownAction(pub String);

/// Element snapshot of an entry, or the reason the parser could not build
/// one.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum EntryPayload {
    /// A well-formed element.
    Element(Element),
    /// A record the parser rejected.
    Malformed {
        /// Key of the record, when it could be recovered.
        key: Option<ElementRef>,
        /// Parser diagnostic.
        reason: String,
    },
}

/// One `(operation, element snapshot)` pair.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChangeEntry {
    /// Operation to perform.
    pub action: ChangeAction,
    /// Snapshot the operation applies.
    pub payload: EntryPayload,
}

impl ChangeEntry {
    /// Entry carrying a well-formed element.
    #[must_use]
    pub const fn new(action: ChangeAction, element: Element) -> Self {
        Self {
            action,
            payload: EntryPayload::Element(element),
        }
    }

    /// Entry standing in for a record the parser rejected.
    #[must_use]
    pub fn malformed(
        action: ChangeAction,
        key: Option<ElementRef>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            action,
            payload: EntryPayload::Malformed {
                key,
                reason: reason.into(),
            },
        }
    }

    /// Key of the affected element, if known.
    #[must_use]
    pub fn key(&self) -> Option<ElementRef> {
        match &self.payload {
            EntryPayload::Element(element) => Some(element.key()),
            EntryPayload::Malformed { key, .. } => *key,
        }
    }

    /// The element snapshot, unless the entry is malformed.
    #[must_use]
    pub const fn element(&self) -> Option<&Element> {
        match &self.payload {
            EntryPayload::Element(element) => Some(element),
            EntryPayload::Malformed { .. } => None,
        }
    }
}

/// An ordered diff consumed once by the reconciler.
///
/// Entries keep source order; they are applied in that order.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct ChangeDocument {
    entries: Vec<ChangeEntry>,
}

impl ChangeDocument {
    /// Create an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a `create` entry.
    #[must_use]
    pub fn create(mut self, element: Element) -> Self {
        self.push(ChangeEntry::new(ChangeAction::Create, element));
        self
    }

    /// Append a `modify` entry.
    #[must_use]
    pub fn modify(mut self, element: Element) -> Self {
        self.push(ChangeEntry::new(ChangeAction::Modify, element));
        self
    }

    /// Append a `delete` entry.
    #[must_use]
    pub fn delete(mut self, element: Element) -> Self {
        self.push(ChangeEntry::new(ChangeAction::Delete, element));
        self
    }

    /// Append an entry.
    pub fn push(&mut self, entry: ChangeEntry) {
        self.entries.push(entry);
    }

    /// Append a malformed entry for a record the parser rejected.
    pub fn push_malformed(
        &mut self,
        action: ChangeAction,
        key: Option<ElementRef>,
        reason: impl Into<String>,
    ) {
        self.push(ChangeEntry::malformed(action, key, reason));
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the document has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in document order.
    pub fn iter(&self) -> std::slice::Iter<'_, ChangeEntry> {
        self.entries.iter()
    }
}

impl FromIterator<ChangeEntry> for ChangeDocument {
    fn from_iter<I: IntoIterator<Item = ChangeEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ChangeDocument {
    type Item = &'a ChangeEntry;
    type IntoIter = std::slice::Iter<'a, ChangeEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
