//! Upload ordering over the reference graph.
//!
//! Creations and modifications come first, each element after everything it
//! references. Deletions follow in the opposite direction: referrers before
//! the elements they referred to. Ties break on key order, which ranks nodes
//! before ways before relations.

use std::collections::{BTreeMap, BTreeSet};

use log::warn;

use crate::{EditState, Element, ElementRef, Storage};

/// Every dirty element in an order the remote service can resolve.
pub(crate) fn upload_order(storage: &Storage) -> Vec<Element> {
    let mut upserts = BTreeSet::new();
    let mut deletions = BTreeSet::new();
    for element in storage.iter() {
        match element.state {
            EditState::Created | EditState::Modified => {
                upserts.insert(element.key());
            }
            EditState::Deleted => {
                deletions.insert(element.key());
            }
            EditState::Unchanged => {}
        }
    }

    let ordered_upserts = topological(&upserts, |key| {
        storage
            .get(*key)
            .map(Element::references)
            .unwrap_or_default()
    });
    let ordered_deletions = topological(&deletions, |key| storage.referrers(*key));

    ordered_upserts
        .into_iter()
        .chain(ordered_deletions)
        .filter_map(|key| storage.get(key).cloned())
        .collect()
}

/// Kahn's algorithm over `keys`, where `prerequisites(k)` lists the keys
/// that must precede `k`. Keys outside the set are ignored. Members of a
/// cycle are appended in key order.
fn topological<F>(keys: &BTreeSet<ElementRef>, prerequisites: F) -> Vec<ElementRef>
where
    F: Fn(&ElementRef) -> Vec<ElementRef>,
{
    let mut pending: BTreeMap<ElementRef, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<ElementRef, BTreeSet<ElementRef>> = BTreeMap::new();
    for key in keys {
        let before: BTreeSet<ElementRef> = prerequisites(key)
            .into_iter()
            .filter(|prerequisite| prerequisite != key && keys.contains(prerequisite))
            .collect();
        pending.insert(*key, before.len());
        for prerequisite in before {
            dependents.entry(prerequisite).or_default().insert(*key);
        }
    }

    let mut ready: BTreeSet<ElementRef> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(key, _)| *key)
        .collect();
    let mut ordered = Vec::with_capacity(keys.len());
    while let Some(key) = ready.pop_first() {
        pending.remove(&key);
        ordered.push(key);
        for dependent in dependents.remove(&key).unwrap_or_default() {
            if let Some(count) = pending.get_mut(&dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if !pending.is_empty() {
        warn!(
            "reference cycle among {} elements; uploading them in key order",
            pending.len()
        );
        ordered.extend(pending.into_keys());
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{id, node, relation, storage_with, way};
    use crate::{ElementKind, ElementRef};
    use rstest::rstest;

    fn position(order: &[Element], key: ElementRef) -> usize {
        order
            .iter()
            .position(|element| element.key() == key)
            .unwrap_or_else(|| panic!("{key} missing from upload order"))
    }

    #[rstest]
    fn created_nodes_precede_their_way() {
        let storage = storage_with([
            way(-1, 0, &[-3, -2]),
            node(-2, 0),
            node(-3, 0),
            node(5, 1),
        ]);
        let order = upload_order(&storage);
        assert_eq!(order.len(), 3, "unchanged node 5 is not uploaded");
        let way_at = position(&order, ElementRef::way(id(-1)));
        assert!(position(&order, ElementRef::node(id(-2))) < way_at);
        assert!(position(&order, ElementRef::node(id(-3))) < way_at);
    }

    #[rstest]
    fn nested_relations_follow_their_members() {
        let storage = storage_with([
            relation(-1, 0, &[(ElementKind::Relation, -2, "subarea")]),
            relation(-2, 0, &[(ElementKind::Way, -4, "outer")]),
            way(-4, 0, &[-5]),
            node(-5, 0),
        ]);
        let order = upload_order(&storage);
        let keys: Vec<_> = order.iter().map(Element::key).collect();
        assert_eq!(
            keys,
            vec![
                ElementRef::node(id(-5)),
                ElementRef::way(id(-4)),
                ElementRef::relation(id(-2)),
                ElementRef::relation(id(-1)),
            ]
        );
    }

    #[rstest]
    fn deletions_run_referrers_first() {
        let storage = storage_with([
            node(1, 1).with_state(EditState::Deleted),
            way(10, 1, &[1]).with_state(EditState::Deleted),
            relation(20, 1, &[(ElementKind::Way, 10, "")]).with_state(EditState::Deleted),
            node(-9, 0),
        ]);
        let keys: Vec<_> = upload_order(&storage).iter().map(Element::key).collect();
        assert_eq!(
            keys,
            vec![
                ElementRef::node(id(-9)),
                ElementRef::relation(id(20)),
                ElementRef::way(id(10)),
                ElementRef::node(id(1)),
            ]
        );
    }

    #[rstest]
    fn cycles_do_not_lose_elements() {
        let storage = storage_with([
            relation(-1, 0, &[(ElementKind::Relation, -2, "")]),
            relation(-2, 0, &[(ElementKind::Relation, -1, "")]),
        ]);
        assert_eq!(upload_order(&storage).len(), 2);
    }
}
