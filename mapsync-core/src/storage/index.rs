//! Reverse-reference index kept in lockstep with [`super::Storage`].

use std::collections::{BTreeSet, HashMap};

use crate::{Element, ElementRef};

/// Maps a referenced element to the set of elements referring to it.
///
/// Entries exist for targets that are absent from storage too, so inserting
/// a late node immediately sees the ways already pointing at it.
#[derive(Debug, Default, Clone)]
pub(crate) struct ReverseIndex {
    referrers: HashMap<ElementRef, BTreeSet<ElementRef>>,
}

impl ReverseIndex {
    pub(crate) fn link(&mut self, element: &Element) {
        let source = element.key();
        for target in element.references() {
            self.referrers.entry(target).or_default().insert(source);
        }
    }

    pub(crate) fn unlink(&mut self, element: &Element) {
        let source = element.key();
        for target in element.references() {
            if let Some(set) = self.referrers.get_mut(&target) {
                set.remove(&source);
                if set.is_empty() {
                    self.referrers.remove(&target);
                }
            }
        }
    }

    pub(crate) fn referrers(&self, target: &ElementRef) -> impl Iterator<Item = ElementRef> + '_ {
        self.referrers
            .get(target)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    #[cfg(test)]
    pub(crate) fn rebuild<'a, I>(elements: I) -> Self
    where
        I: IntoIterator<Item = &'a Element>,
    {
        let mut index = Self::default();
        for element in elements {
            index.link(element);
        }
        index
    }

    #[cfg(test)]
    pub(crate) fn entries(&self) -> BTreeSet<(ElementRef, ElementRef)> {
        self.referrers
            .iter()
            .flat_map(|(target, set)| set.iter().map(move |source| (*target, *source)))
            .collect()
    }
}
