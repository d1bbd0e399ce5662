//! Pluggable policies for dirty elements whose remote version did not move.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::{Element, Geometry, Tags};

/// Outcome of merging a remote snapshot into a dirty local element.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeDecision {
    /// Store these fields and keep the element dirty.
    Merged {
        /// Merged tags.
        tags: Tags,
        /// Merged geometry.
        geometry: Geometry,
    },
    /// The local element already reflects the remote snapshot.
    KeepLocal,
    /// The sides cannot be merged without a human decision.
    Conflict,
}

/// Decides how a remote snapshot combines with a dirty local element at the
/// same version.
///
/// `base` is the last server-known copy of the element, when one was
/// recorded.
pub trait MergePolicy: fmt::Debug + Send + Sync {
    /// Merge `remote` into `local`.
    fn merge(&self, local: &Element, remote: &Element, base: Option<&Element>) -> MergeDecision;
}

/// Field-wise three-way merge against the base copy.
///
/// A field changed on one side only takes that side's value. A field changed
/// differently on both sides is a conflict, as is any divergence when no
/// base copy is known.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreeWayMerge;

impl MergePolicy for ThreeWayMerge {
    fn merge(&self, local: &Element, remote: &Element, base: Option<&Element>) -> MergeDecision {
        if local.same_content(remote) {
            return MergeDecision::KeepLocal;
        }
        let Some(base) = base else {
            return MergeDecision::Conflict;
        };
        let Some(geometry) = pick(&base.geometry, &local.geometry, &remote.geometry) else {
            return MergeDecision::Conflict;
        };
        let Some(tags) = merge_tags(&base.tags, &local.tags, &remote.tags) else {
            return MergeDecision::Conflict;
        };
        if tags == local.tags && *geometry == local.geometry {
            return MergeDecision::KeepLocal;
        }
        MergeDecision::Merged {
            tags,
            geometry: geometry.clone(),
        }
    }
}

fn pick<'a, T: PartialEq>(base: &'a T, local: &'a T, remote: &'a T) -> Option<&'a T> {
    if local == remote || remote == base {
        Some(local)
    } else if local == base {
        Some(remote)
    } else {
        None
    }
}

fn merge_tags(base: &Tags, local: &Tags, remote: &Tags) -> Option<Tags> {
    let keys: BTreeSet<&String> = base.keys().chain(local.keys()).chain(remote.keys()).collect();
    let mut merged = Tags::new();
    for key in keys {
        let (before, ours, theirs) = (base.get(key), local.get(key), remote.get(key));
        if let Some(value) = pick(&before, &ours, &theirs)? {
            merged.insert(key.clone(), (*value).clone());
        }
    }
    Some(merged)
}

/// Treats any difference between the sides as a conflict.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictOnDivergence;

impl MergePolicy for ConflictOnDivergence {
    fn merge(&self, local: &Element, remote: &Element, _base: Option<&Element>) -> MergeDecision {
        if local.same_content(remote) {
            MergeDecision::KeepLocal
        } else {
            MergeDecision::Conflict
        }
    }
}

/// Always keeps the local element.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferLocal;

impl MergePolicy for PreferLocal {
    fn merge(&self, _local: &Element, _remote: &Element, _base: Option<&Element>) -> MergeDecision {
        MergeDecision::KeepLocal
    }
}

/// Configuration-level choice of [`MergePolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum MergeStrategy {
    /// [`ThreeWayMerge`].
    #[default]
    ThreeWay,
    /// [`ConflictOnDivergence`].
    ConflictOnDivergence,
    /// [`PreferLocal`].
    PreferLocal,
}

impl MergeStrategy {
    /// Kebab-case name used in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ThreeWay => "three-way",
            Self::ConflictOnDivergence => "conflict-on-divergence",
            Self::PreferLocal => "prefer-local",
        }
    }

    /// Instantiate the selected policy.
    #[must_use]
    pub fn into_policy(self) -> Box<dyn MergePolicy> {
        match self {
            Self::ThreeWay => Box::new(ThreeWayMerge),
            Self::ConflictOnDivergence => Box::new(ConflictOnDivergence),
            Self::PreferLocal => Box::new(PreferLocal),
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "three-way" => Ok(Self::ThreeWay),
            "conflict-on-divergence" => Ok(Self::ConflictOnDivergence),
            "prefer-local" => Ok(Self::PreferLocal),
            other => Err(UnknownStrategy(other.to_owned())),
        }
    }
}

/// A merge strategy name that is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown merge strategy `{0}`; expected three-way, conflict-on-divergence or prefer-local")]
pub struct UnknownStrategy(pub String);
