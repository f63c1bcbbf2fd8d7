//! Computes JSON merge patches (RFC 7386) between resource snapshots.
//!
//! A two-way patch moves `current` to `desired`. A three-way patch additionally takes the
//! `original` snapshot the current object was last applied from, so that fields removed from
//! `desired` since then are cleared instead of being left behind.
//!
//! Lists are replaced as a whole, merge patches have no notion of list element identity.

use std::future::Future;

use serde::Serialize;
use serde_json::{Map, Value, json};
use snafu::{ResultExt, Snafu};

use crate::store::{ObjectKey, ResourceStore, StoreError};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize {snapshot} snapshot"))]
    SerializeSnapshot {
        source: serde_json::Error,
        snapshot: &'static str,
    },

    #[snafu(display("failed to apply patch to {key}"))]
    ApplyPatch { source: StoreError, key: ObjectKey },
}

/// A computed merge patch.
#[derive(Clone, Debug, PartialEq)]
pub enum Patch {
    /// Nothing to change, or only changes that are always ignored.
    Empty,
    Applicable(Value),
}

impl Patch {
    fn classify(diff: Option<Value>) -> Self {
        match diff {
            Some(diff) if !is_ignorable(&diff) => Self::Applicable(diff),
            _ => Self::Empty,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Empty => None,
            Self::Applicable(value) => Some(value),
        }
    }
}

/// Diffs that only touch server-populated defaults.
fn is_ignorable(diff: &Value) -> bool {
    let ignored = [
        json!({}),
        json!({"metadata": {"creationTimestamp": null}, "status": {"replicas": 0}}),
        json!({"metadata": {"creationTimestamp": null}}),
        json!({"status": {"replicas": 0}}),
    ];
    ignored.contains(diff)
}

pub fn create_two_way_patch(current: &Value, desired: &Value) -> Patch {
    Patch::classify(diff(current, desired, true))
}

pub fn create_three_way_patch(original: &Value, desired: &Value, current: &Value) -> Patch {
    let changes = diff(current, desired, false);
    let deletions = removed(original, desired, current);
    let combined = match (changes, deletions) {
        (Some(changes), Some(deletions)) => Some(combine(changes, deletions)),
        (changes, deletions) => changes.or(deletions),
    };
    Patch::classify(combined)
}

/// Typed variant of [`create_three_way_patch`].
pub fn three_way_patch<T: Serialize>(original: &T, desired: &T, current: &T) -> Result<Patch> {
    let original = serde_json::to_value(original).context(SerializeSnapshotSnafu {
        snapshot: "original",
    })?;
    let desired = serde_json::to_value(desired).context(SerializeSnapshotSnafu {
        snapshot: "desired",
    })?;
    let current = serde_json::to_value(current).context(SerializeSnapshotSnafu {
        snapshot: "current",
    })?;
    Ok(create_three_way_patch(&original, &desired, &current))
}

/// Computes a three-way patch and, if it is not empty, runs `before_apply` and then applies the
/// patch to the StatefulSet `key`.
///
/// Returns whether a patch was applied.
pub async fn three_way_patch_with_callback<T, F, Fut>(
    store: &dyn ResourceStore,
    key: &ObjectKey,
    original: &T,
    desired: &T,
    current: &T,
    before_apply: F,
) -> Result<bool>
where
    T: Serialize + Sync,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = ()> + Send,
{
    let patch = three_way_patch(original, desired, current)?;
    apply_with_callback(store, key, &patch, before_apply).await
}

/// Applies an already computed patch to the StatefulSet `key`, running `before_apply` first.
///
/// An empty patch is not applied and the callback does not run.
pub async fn apply_with_callback<F, Fut>(
    store: &dyn ResourceStore,
    key: &ObjectKey,
    patch: &Patch,
    before_apply: F,
) -> Result<bool>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = ()> + Send,
{
    let Patch::Applicable(body) = patch else {
        return Ok(false);
    };
    before_apply().await;
    tracing::info!(object = %key, patch = %body, "applying patch");
    store
        .patch_stateful_set(key, body)
        .await
        .context(ApplyPatchSnafu { key: key.clone() })?;
    Ok(true)
}

/// Fields that differ from `from` in `to`. With `deletions`, keys missing from `to` become `null`.
fn diff(from: &Value, to: &Value, deletions: bool) -> Option<Value> {
    match (from, to) {
        (Value::Object(from), Value::Object(to)) => {
            let mut patch = Map::new();
            for (key, to_value) in to {
                match from.get(key) {
                    None if to_value.is_null() => {}
                    None => {
                        patch.insert(key.clone(), to_value.clone());
                    }
                    Some(from_value) => {
                        if let Some(child) = diff(from_value, to_value, deletions) {
                            patch.insert(key.clone(), child);
                        }
                    }
                }
            }
            if deletions {
                for key in from.keys().filter(|key| !to.contains_key(*key)) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        (from, to) if from == to => None,
        (_, to) => Some(to.clone()),
    }
}

/// Keys present in `original` that `desired` no longer has, as `null` entries.
///
/// Keys that are already gone from `current` are left out.
fn removed(original: &Value, desired: &Value, current: &Value) -> Option<Value> {
    let (Value::Object(original), Value::Object(desired), Value::Object(current)) =
        (original, desired, current)
    else {
        return None;
    };
    let mut patch = Map::new();
    for (key, original_value) in original {
        let Some(current_value) = current.get(key) else {
            continue;
        };
        match desired.get(key) {
            None => {
                patch.insert(key.clone(), Value::Null);
            }
            Some(desired_value) => {
                if let Some(child) = removed(original_value, desired_value, current_value) {
                    patch.insert(key.clone(), child);
                }
            }
        }
    }
    (!patch.is_empty()).then_some(Value::Object(patch))
}

/// Merges deletions into a change set. Changes win where both touch the same key.
fn combine(changes: Value, deletions: Value) -> Value {
    match (changes, deletions) {
        (Value::Object(mut changes), Value::Object(deletions)) => {
            for (key, deletion) in deletions {
                match changes.remove(&key) {
                    None => {
                        changes.insert(key, deletion);
                    }
                    Some(change) => {
                        changes.insert(key, combine(change, deletion));
                    }
                }
            }
            Value::Object(changes)
        }
        (changes, _) => changes,
    }
}
