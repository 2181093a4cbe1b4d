use serde_json::{Map, Value};

use crate::model::ResourceSnapshot;

const SERVER_METADATA: &[&str] = &[
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "managedFields",
    "selfLink",
];

#[derive(Debug, Clone, PartialEq)]
pub enum DivergenceVerdict {
    Unchanged,
    RemoteChanged(ResourceSnapshot),
    LocalChanged,
    Conflicting(ResourceSnapshot),
}

impl DivergenceVerdict {
    pub fn can_push(&self) -> bool {
        matches!(self, Self::LocalChanged | Self::Conflicting(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::RemoteChanged(_) => "remote changed",
            Self::LocalChanged => "local changed",
            Self::Conflicting(_) => "conflicting",
        }
    }
}

/// Classifies `remote` against the local copy, relative to the last version both
/// sides were known to agree on.
pub fn classify(
    local: &ResourceSnapshot,
    baseline: Option<&ResourceSnapshot>,
    remote: &ResourceSnapshot,
) -> DivergenceVerdict {
    if structurally_equal(&local.body, &remote.body) {
        return DivergenceVerdict::Unchanged;
    }

    let Some(baseline) = baseline else {
        return DivergenceVerdict::RemoteChanged(remote.clone());
    };

    let remote_moved =
        remote.version != baseline.version && !structurally_equal(&remote.body, &baseline.body);
    let local_moved = !structurally_equal(&local.body, &baseline.body);

    match (local_moved, remote_moved) {
        (false, false) => DivergenceVerdict::Unchanged,
        (false, true) => DivergenceVerdict::RemoteChanged(remote.clone()),
        (true, false) => DivergenceVerdict::LocalChanged,
        (true, true) => DivergenceVerdict::Conflicting(remote.clone()),
    }
}

pub fn structurally_equal(left: &Value, right: &Value) -> bool {
    normalize(left) == normalize(right)
}

/// Comparable form of a resource document: no server-owned metadata, no status,
/// no null fields, no empty label or annotation maps.
pub fn normalize(body: &Value) -> Value {
    let mut body = without_server_metadata(body);
    if let Some(object) = body.as_object_mut() {
        object.remove("status");
        if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in ["labels", "annotations"] {
                if metadata
                    .get(field)
                    .is_some_and(|value| value.as_object().is_some_and(Map::is_empty))
                {
                    metadata.remove(field);
                }
            }
        }
    }
    drop_nulls(body)
}

pub fn without_server_metadata(body: &Value) -> Value {
    let mut body = body.clone();
    if let Some(metadata) = body.get_mut("metadata").and_then(Value::as_object_mut) {
        for field in SERVER_METADATA {
            metadata.remove(*field);
        }
    }
    body
}

fn drop_nulls(value: Value) -> Value {
    match value {
        Value::Object(object) => Value::Object(
            object
                .into_iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(key, value)| (key, drop_nulls(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(drop_nulls).collect()),
        other => other,
    }
}
