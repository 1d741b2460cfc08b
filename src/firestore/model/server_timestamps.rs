//! Local placeholders for server timestamps that have not been committed yet.
//!
//! A pending server timestamp is stored in the local view as a map with a
//! `__type__` marker, the local write time and (optionally) the value the field
//! held before the write, so snapshots can offer estimates or the previous value.

use std::collections::BTreeMap;

use crate::firestore::model::Timestamp;
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

const TYPE_KEY: &str = "__type__";
const SERVER_TIMESTAMP_SENTINEL: &str = "server_timestamp";
const LOCAL_WRITE_TIME_KEY: &str = "__local_write_time__";
const PREVIOUS_VALUE_KEY: &str = "__previous_value__";

/// How snapshot readers should surface pending server timestamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServerTimestampBehavior {
    /// Pending timestamps read as `null`.
    #[default]
    None,
    /// Pending timestamps read as the local write time.
    Estimate,
    /// Pending timestamps read as the previous committed value, if any.
    Previous,
}

pub fn server_timestamp_placeholder(
    local_write_time: Timestamp,
    previous_value: Option<&FirestoreValue>,
) -> FirestoreValue {
    let mut fields = BTreeMap::new();
    fields.insert(
        TYPE_KEY.to_string(),
        FirestoreValue::from_string(SERVER_TIMESTAMP_SENTINEL),
    );
    fields.insert(
        LOCAL_WRITE_TIME_KEY.to_string(),
        FirestoreValue::from_timestamp(local_write_time),
    );

    // Chained placeholders keep only the original committed value.
    let previous = match previous_value {
        Some(value) if is_server_timestamp(value) => previous_value_of(value).cloned(),
        other => other.cloned(),
    };
    if let Some(previous) = previous {
        fields.insert(PREVIOUS_VALUE_KEY.to_string(), previous);
    }
    FirestoreValue::from_map(fields)
}

pub fn is_server_timestamp(value: &FirestoreValue) -> bool {
    match value.kind() {
        ValueKind::Map(map) => is_server_timestamp_map(map),
        _ => false,
    }
}

fn is_server_timestamp_map(map: &MapValue) -> bool {
    matches!(
        map.fields().get(TYPE_KEY).map(FirestoreValue::kind),
        Some(ValueKind::String(marker)) if marker == SERVER_TIMESTAMP_SENTINEL
    )
}

pub fn local_write_time(map: &MapValue) -> Option<Timestamp> {
    match map.fields().get(LOCAL_WRITE_TIME_KEY).map(FirestoreValue::kind) {
        Some(ValueKind::Timestamp(timestamp)) => Some(*timestamp),
        _ => None,
    }
}

pub fn previous_value_of(value: &FirestoreValue) -> Option<&FirestoreValue> {
    let map = value.as_map()?;
    let previous = map.fields().get(PREVIOUS_VALUE_KEY)?;
    if is_server_timestamp(previous) {
        previous_value_of(previous)
    } else {
        Some(previous)
    }
}

/// Replaces every pending placeholder in `map` according to `behavior`.
pub fn resolve_server_timestamps(map: &MapValue, behavior: ServerTimestampBehavior) -> MapValue {
    let fields = map
        .fields()
        .iter()
        .map(|(key, value)| (key.clone(), resolve_value(value, behavior)))
        .collect();
    MapValue::new(fields)
}

fn resolve_value(value: &FirestoreValue, behavior: ServerTimestampBehavior) -> FirestoreValue {
    if is_server_timestamp(value) {
        return match behavior {
            ServerTimestampBehavior::None => FirestoreValue::null(),
            ServerTimestampBehavior::Estimate => value
                .as_map()
                .and_then(local_write_time)
                .map(FirestoreValue::from_timestamp)
                .unwrap_or_else(FirestoreValue::null),
            ServerTimestampBehavior::Previous => previous_value_of(value)
                .cloned()
                .unwrap_or_else(FirestoreValue::null),
        };
    }
    match value.kind() {
        ValueKind::Map(map) => FirestoreValue::from_map_value(resolve_server_timestamps(map, behavior)),
        ValueKind::Array(array) => FirestoreValue::from_array(
            array
                .values()
                .iter()
                .map(|element| resolve_value(element, behavior))
                .collect(),
        ),
        _ => value.clone(),
    }
}
