use std::collections::BTreeMap;

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// A map of field names to values; also serves as the value tree of a document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the value stored at `path`, descending through nested maps.
    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        find_in_map(self, path.segments())
    }

    /// Writes `value` at `path`, creating intermediate maps and replacing
    /// non-map intermediates.
    pub fn set_field(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_at_segments(&mut self.fields, path.segments(), value);
    }

    /// Removes the value at `path`. Missing intermediates are left untouched.
    pub fn delete_field(&mut self, path: &FieldPath) {
        delete_at_segments(&mut self.fields, path.segments());
    }

    /// Returns every leaf field path; empty nested maps count as leaves.
    pub fn leaf_paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, &mut Vec::new(), &mut paths);
        paths
    }
}

fn find_in_map<'a>(map: &'a MapValue, segments: &[String]) -> Option<&'a FirestoreValue> {
    let (first, rest) = segments.split_first()?;
    let value = map.fields.get(first)?;
    if rest.is_empty() {
        Some(value)
    } else if let ValueKind::Map(child) = value.kind() {
        find_in_map(child, rest)
    } else {
        None
    }
}

fn set_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let mut child_fields = match fields.get(first).map(FirestoreValue::kind) {
        Some(ValueKind::Map(map)) => map.fields().clone(),
        _ => BTreeMap::new(),
    };
    set_at_segments(&mut child_fields, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child_fields));
}

fn delete_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    if let Some(ValueKind::Map(child)) = fields.get(first).map(FirestoreValue::kind) {
        let mut child_fields = child.fields().clone();
        delete_at_segments(&mut child_fields, rest);
        fields.insert(first.clone(), FirestoreValue::from_map(child_fields));
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &mut Vec<String>,
    acc: &mut Vec<FieldPath>,
) {
    for (key, value) in fields {
        prefix.push(key.clone());
        match value.kind() {
            ValueKind::Map(child) if !child.is_empty() && !value.is_server_timestamp() => {
                collect_leaf_paths(child.fields(), prefix, acc);
            }
            _ => {
                if let Ok(path) = FieldPath::new(prefix.clone()) {
                    acc.push(path);
                }
            }
        }
        prefix.pop();
    }
}
