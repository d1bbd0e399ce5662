//! Property-based tests for storage and upload ordering.
//!
//! # Invariants tested
//!
//! - **Index consistency:** after any sequence of inserts, replacements and
//!   removals, the reverse index lists exactly the elements whose geometry
//!   references each target.
//! - **Upload order:** every dirty element appears after every dirty element
//!   it references.

use std::collections::{BTreeSet, HashMap};

use mapsync_core::test_support::{id, node, relation, storage_with, way};
use mapsync_core::{Element, ElementKind, ElementRef, RemoveMode, Storage};
use proptest::prelude::*;

const NODES: i64 = 8;

#[derive(Debug, Clone)]
enum Op {
    Rewire { way: i64, nodes: Vec<i64> },
    RemoveWay { way: i64 },
    CascadeNode { node: i64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (10_i64..14, prop::collection::vec(1..=NODES, 1..6))
            .prop_map(|(way, nodes)| Op::Rewire { way, nodes }),
        (10_i64..14).prop_map(|way| Op::RemoveWay { way }),
        (1..=NODES).prop_map(|node| Op::CascadeNode { node }),
    ]
}

fn apply(storage: &mut Storage, op: &Op) {
    match op {
        Op::Rewire { way: way_id, nodes } => {
            let present: Vec<i64> = nodes
                .iter()
                .copied()
                .filter(|n| storage.contains(ElementRef::node(id(*n))))
                .collect();
            let next = way(*way_id, 1, &present);
            if storage.contains(next.key()) {
                let _ = storage.replace(next);
            } else {
                let _ = storage.insert(next);
            }
        }
        Op::RemoveWay { way: way_id } => {
            let _ = storage.remove(ElementRef::way(id(*way_id)), RemoveMode::Strict);
        }
        Op::CascadeNode { node: node_id } => {
            let _ = storage.remove(ElementRef::node(id(*node_id)), RemoveMode::Cascade);
        }
    }
}

fn expected_referrers(storage: &Storage) -> HashMap<ElementRef, BTreeSet<ElementRef>> {
    let mut expected: HashMap<ElementRef, BTreeSet<ElementRef>> = HashMap::new();
    for element in storage.iter() {
        for target in element.references() {
            expected.entry(target).or_default().insert(element.key());
        }
    }
    expected
}

fn dirty_graph() -> impl Strategy<Value = Vec<Element>> {
    (
        prop::collection::vec(prop::collection::vec(1..=6_i64, 1..5), 0..5),
        prop::collection::vec(prop::collection::vec(0..5_usize, 1..4), 0..3),
    )
        .prop_map(|(ways, relations)| {
            let mut elements: Vec<Element> = (1..=6).map(|n| node(-n, 0)).collect();
            let way_count = ways.len();
            for (position, nodes) in ways.into_iter().enumerate() {
                let refs: Vec<i64> = nodes.into_iter().map(|n| -n).collect();
                elements.push(way(-100 - position_id(position), 0, &refs));
            }
            for (position, members) in relations.into_iter().enumerate() {
                let members: Vec<(ElementKind, i64, &str)> = members
                    .into_iter()
                    .filter(|member| *member < way_count)
                    .map(|member| (ElementKind::Way, -100 - position_id(member), "part"))
                    .collect();
                elements.push(relation(-200 - position_id(position), 0, &members));
            }
            elements
        })
}

fn position_id(position: usize) -> i64 {
    i64::try_from(position).unwrap_or(i64::MAX)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the reverse index never goes stale.
    #[test]
    fn reverse_index_matches_geometry(ops in prop::collection::vec(op_strategy(), 0..30)) {
        let mut storage = storage_with((1..=NODES).map(|n| node(n, 1)));
        for op in &ops {
            apply(&mut storage, op);
        }
        let expected = expected_referrers(&storage);
        let targets = (1..=NODES)
            .map(|n| ElementRef::node(id(n)))
            .chain((10..14).map(|w| ElementRef::way(id(w))));
        for target in targets {
            let actual: BTreeSet<ElementRef> = storage.referrers(target).into_iter().collect();
            prop_assert_eq!(&actual, &expected.get(&target).cloned().unwrap_or_default());
        }
    }

    /// Property: cascaded removals leave no references to the removed node.
    #[test]
    fn cascade_leaves_no_dangling_nodes(ops in prop::collection::vec(op_strategy(), 0..30)) {
        let mut storage = storage_with((1..=NODES).map(|n| node(n, 1)));
        for op in &ops {
            apply(&mut storage, op);
        }
        prop_assert!(storage.integrity_report().incomplete_ways.is_empty());
    }

    /// Property: referenced elements are uploaded before their referrers.
    #[test]
    fn upload_order_respects_references(elements in dirty_graph()) {
        let count = elements.len();
        let tracker = mapsync_core::DirtyTracker::from_storage(storage_with(elements));
        let order = tracker.pending_upload();
        prop_assert_eq!(order.len(), count);
        let position: HashMap<ElementRef, usize> = order
            .iter()
            .enumerate()
            .map(|(index, element)| (element.key(), index))
            .collect();
        for element in &order {
            let own = position.get(&element.key()).copied().unwrap_or(usize::MAX);
            for target in element.references() {
                if let Some(before) = position.get(&target) {
                    prop_assert!(*before < own, "{} must precede {}", target, element.key());
                }
            }
        }
    }
}
