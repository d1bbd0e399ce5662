//! JSON element and change records.
//!
//! Records use the flat element layout common to OSM JSON exports: a `type`
//! discriminator, a signed `id`, and `lat`/`lon`, `nodes` or `members`
//! depending on the kind. Negative ids denote locally created elements.

use geo::Coord;
use log::warn;
use mapsync_core::{
    ChangeAction, ChangeEntry, EditState, Element, ElementError, ElementKind, ElementRef,
    Geometry, Member, OsmId, Tags, UnknownAction,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while turning a record into a core value.
#[derive(Debug, Error)]
pub enum ChangeRecordError {
    /// The record carried an invalid id, kind or state.
    #[error(transparent)]
    Element(#[from] ElementError),
    /// A node record has no `lat`/`lon` pair.
    #[error("{key} has no location")]
    MissingLocation {
        /// Offending element.
        key: ElementRef,
    },
    /// A way record has no `nodes` list.
    #[error("{key} has no node list")]
    MissingNodes {
        /// Offending element.
        key: ElementRef,
    },
    /// A relation record has no `members` list.
    #[error("{key} has no member list")]
    MissingMembers {
        /// Offending element.
        key: ElementRef,
    },
    /// The change record names no usable action.
    #[error("change record has no usable action")]
    Action(#[from] UnknownAction),
    /// The record does not have the expected JSON shape.
    #[error("record does not match the element layout")]
    Shape {
        /// Source error produced by `serde_json`.
        #[source]
        source: serde_json::Error,
    },
}

/// One relation member as stored in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    /// Kind of the member element.
    #[serde(rename = "type")]
    pub kind: ElementKind,
    /// Signed id of the member element.
    #[serde(rename = "ref")]
    pub id: i64,
    /// Role of the member; empty when absent.
    #[serde(default)]
    pub role: String,
}

/// One element as stored in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    /// Element kind.
    #[serde(rename = "type")]
    pub kind: ElementKind,
    /// Signed id; negative for local elements.
    pub id: i64,
    /// Server version; `0` for local elements.
    #[serde(default)]
    pub version: u64,
    /// Key/value tags.
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,
    /// Edit state, when the producer tracks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<EditState>,
    /// Latitude of a node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    /// Longitude of a node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    /// Node ids of a way.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<i64>>,
    /// Members of a relation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<MemberRecord>>,
}

impl ElementRecord {
    fn key(&self) -> Result<ElementRef, ElementError> {
        Ok(ElementRef::new(self.kind, OsmId::from_raw(self.id)?))
    }
}

impl TryFrom<ElementRecord> for Element {
    type Error = ChangeRecordError;

    fn try_from(record: ElementRecord) -> Result<Self, Self::Error> {
        let key = record.key()?;
        let geometry = match record.kind {
            ElementKind::Node => {
                let (Some(lat), Some(lon)) = (record.lat, record.lon) else {
                    return Err(ChangeRecordError::MissingLocation { key });
                };
                Geometry::Node(Coord { x: lon, y: lat })
            }
            ElementKind::Way => {
                let nodes = record
                    .nodes
                    .ok_or(ChangeRecordError::MissingNodes { key })?
                    .into_iter()
                    .map(OsmId::from_raw)
                    .collect::<Result<Vec<_>, _>>()?;
                Geometry::Way(nodes)
            }
            ElementKind::Relation => {
                let members = record
                    .members
                    .ok_or(ChangeRecordError::MissingMembers { key })?
                    .into_iter()
                    .map(|member| {
                        let target = OsmId::from_raw(member.id)?;
                        Ok(Member::new(member.kind, target, member.role))
                    })
                    .collect::<Result<Vec<_>, ElementError>>()?;
                Geometry::Relation(members)
            }
        };
        let mut element = Element::new(key.id, record.version, geometry);
        element.tags = record.tags;
        if let Some(state) = record.state {
            element.state = state;
        }
        Ok(element)
    }
}

impl From<&Element> for ElementRecord {
    fn from(element: &Element) -> Self {
        let mut record = Self {
            kind: element.kind(),
            id: element.id.raw(),
            version: element.version,
            tags: element.tags.clone(),
            state: Some(element.state),
            lat: None,
            lon: None,
            nodes: None,
            members: None,
        };
        match &element.geometry {
            Geometry::Node(location) => {
                record.lat = Some(location.y);
                record.lon = Some(location.x);
            }
            Geometry::Way(nodes) => {
                record.nodes = Some(nodes.iter().copied().map(OsmId::raw).collect());
            }
            Geometry::Relation(members) => {
                record.members = Some(
                    members
                        .iter()
                        .map(|member| MemberRecord {
                            kind: member.kind,
                            id: member.id.raw(),
                            role: member.role.clone(),
                        })
                        .collect(),
                );
            }
        }
        record
    }
}

/// One `(action, element)` pair of a change file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Operation to perform.
    pub action: ChangeAction,
    /// Element snapshot.
    pub element: ElementRecord,
}

impl ChangeRecord {
    /// Describe a dirty element as the upload operation it needs.
    ///
    /// Returns `None` for clean elements.
    #[must_use]
    pub fn pending(element: &Element) -> Option<Self> {
        let action = match element.state {
            EditState::Unchanged => return None,
            EditState::Created => ChangeAction::Create,
            EditState::Modified => ChangeAction::Modify,
            EditState::Deleted => ChangeAction::Delete,
        };
        Some(Self {
            action,
            element: ElementRecord::from(element),
        })
    }
}

/// Build a change entry from one raw change record.
///
/// A record whose element cannot be built still yields an entry, marked
/// malformed and carrying the key when it can be recovered. Only a record
/// without a usable action is rejected.
pub fn change_entry(value: &Value) -> Result<ChangeEntry, ChangeRecordError> {
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .parse::<ChangeAction>()?;
    let Some(raw) = value.get("element") else {
        return Ok(ChangeEntry::malformed(action, None, "change record has no element"));
    };
    Ok(match element_from_value(raw) {
        Ok(element) => ChangeEntry::new(action, element),
        Err(error) => ChangeEntry::malformed(action, recover_key(raw), error.to_string()),
    })
}

/// Build a CREATE entry from one raw element record.
#[must_use]
pub fn snapshot_entry(value: &Value) -> ChangeEntry {
    match element_from_value(value) {
        Ok(element) => ChangeEntry::new(ChangeAction::Create, element),
        Err(error) => {
            let key = recover_key(value);
            warn!("Malformed snapshot record {key:?}: {error}");
            ChangeEntry::malformed(ChangeAction::Create, key, error.to_string())
        }
    }
}

fn element_from_value(value: &Value) -> Result<Element, ChangeRecordError> {
    let record = ElementRecord::deserialize(value)
        .map_err(|source| ChangeRecordError::Shape { source })?;
    Element::try_from(record)
}

fn recover_key(value: &Value) -> Option<ElementRef> {
    let kind = value.get("type")?.as_str()?.parse::<ElementKind>().ok()?;
    let id = OsmId::from_raw(value.get("id")?.as_i64()?).ok()?;
    Some(ElementRef::new(kind, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapsync_core::EntryPayload;
    use rstest::rstest;
    use serde_json::json;

    fn id(raw: i64) -> OsmId {
        OsmId::from_raw(raw).expect("non-zero id")
    }

    #[rstest]
    fn converts_node_record() {
        let value = json!({
            "type": "node", "id": 5, "version": 3,
            "lat": 52.5, "lon": 13.4, "tags": {"amenity": "cafe"}
        });
        let element = element_from_value(&value).expect("node");
        assert_eq!(element.key(), ElementRef::node(id(5)));
        assert_eq!(element.location(), Some(Coord { x: 13.4, y: 52.5 }));
        assert_eq!(element.state, EditState::Unchanged);
        assert_eq!(element.tags.get("amenity").map(String::as_str), Some("cafe"));
    }

    #[rstest]
    fn converts_relation_record() {
        let value = json!({
            "type": "relation", "id": -2,
            "members": [{"type": "way", "ref": 10, "role": "outer"}, {"type": "node", "ref": -1}]
        });
        let element = element_from_value(&value).expect("relation");
        assert_eq!(element.state, EditState::Created);
        assert_eq!(
            element.members(),
            Some(
                &[
                    Member::new(ElementKind::Way, id(10), "outer"),
                    Member::new(ElementKind::Node, id(-1), ""),
                ][..]
            )
        );
    }

    #[rstest]
    #[case(json!({"type": "node", "id": 5, "lat": 1.0}), "n5 has no location")]
    #[case(json!({"type": "way", "id": 7}), "w7 has no node list")]
    #[case(json!({"type": "relation", "id": 9}), "r9 has no member list")]
    #[case(json!({"type": "way", "id": 7, "nodes": [1, 0]}), "element id must not be zero")]
    fn incomplete_records_are_rejected(#[case] value: Value, #[case] message: &str) {
        let error = element_from_value(&value).expect_err("incomplete record");
        assert_eq!(error.to_string(), message);
    }

    #[rstest]
    fn malformed_element_keeps_action_and_key() {
        let value = json!({"action": "modify", "element": {"type": "node", "id": 8, "version": "x"}});
        let entry = change_entry(&value).expect("entry");
        assert_eq!(entry.action, ChangeAction::Modify);
        assert_eq!(entry.key(), Some(ElementRef::node(id(8))));
        assert!(matches!(entry.payload, EntryPayload::Malformed { .. }));
    }

    #[rstest]
    #[case(json!({"element": {"type": "node", "id": 1}}))]
    #[case(json!({"action": "upsert", "element": {"type": "node", "id": 1}}))]
    fn records_without_usable_action_are_rejected(#[case] value: Value) {
        let error = change_entry(&value).expect_err("no action");
        assert!(matches!(error, ChangeRecordError::Action(_)));
    }

    #[rstest]
    fn pending_maps_state_to_action() {
        let created = Element::way(id(-4), 0, vec![id(1), id(-1)]);
        let record = ChangeRecord::pending(&created).expect("dirty element");
        assert_eq!(record.action, ChangeAction::Create);
        assert_eq!(record.element.nodes, Some(vec![1, -1]));
        assert_eq!(record.element.state, Some(EditState::Created));

        let clean = Element::node(id(1), 1, Coord { x: 0.0, y: 0.0 });
        assert!(ChangeRecord::pending(&clean).is_none());
    }

    #[rstest]
    fn written_records_read_back() {
        let element = Element::node(id(5), 2, Coord { x: 1.5, y: -2.0 })
            .with_tags([("name", "Well")])
            .with_state(EditState::Modified);
        let value = serde_json::to_value(ElementRecord::from(&element)).expect("serialize");
        assert_eq!(value.get("lat"), Some(&json!(-2.0)));
        assert_eq!(element_from_value(&value).expect("read back"), element);
    }
}
