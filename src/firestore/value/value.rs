use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

#[derive(Clone, Debug)]
pub struct FirestoreValue {
    kind: ValueKind,
}

/// Sentinel transforms supported during writes.
///
/// Sentinels only appear in user input; the write path turns them into field
/// transforms before a mutation is queued.
#[derive(Clone, Debug, PartialEq)]
pub enum SentinelValue {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(Box<FirestoreValue>),
}

#[derive(Clone, Debug)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
    Sentinel(SentinelValue),
}

const TYPE_ORDER_NULL: u8 = 0;
const TYPE_ORDER_BOOLEAN: u8 = 1;
const TYPE_ORDER_NUMBER: u8 = 2;
const TYPE_ORDER_TIMESTAMP: u8 = 3;
const TYPE_ORDER_SERVER_TIMESTAMP: u8 = 4;
const TYPE_ORDER_STRING: u8 = 5;
const TYPE_ORDER_BYTES: u8 = 6;
const TYPE_ORDER_REFERENCE: u8 = 7;
const TYPE_ORDER_GEO_POINT: u8 = 8;
const TYPE_ORDER_ARRAY: u8 = 9;
const TYPE_ORDER_MAP: u8 = 10;
const TYPE_ORDER_SENTINEL: u8 = 11;

impl FirestoreValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn from_map_value(map: MapValue) -> Self {
        Self {
            kind: ValueKind::Map(map),
        }
    }

    /// Returns a sentinel that instructs the backend to populate the field with
    /// the commit time of the write.
    pub fn server_timestamp() -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::ServerTimestamp),
        }
    }

    /// Returns a sentinel that unions the provided elements with an existing array field.
    pub fn array_union(elements: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::ArrayUnion(elements)),
        }
    }

    /// Returns a sentinel that removes the provided elements from an existing array field.
    pub fn array_remove(elements: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::ArrayRemove(elements)),
        }
    }

    /// Returns a sentinel that increments the targeted numeric field by `operand`.
    pub fn numeric_increment(operand: FirestoreValue) -> Self {
        Self {
            kind: ValueKind::Sentinel(SentinelValue::NumericIncrement(Box::new(operand))),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn into_kind(self) -> ValueKind {
        self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Whether this value is a local placeholder for a pending server timestamp.
    pub fn is_server_timestamp(&self) -> bool {
        crate::firestore::model::server_timestamps::is_server_timestamp(self)
    }

    pub(crate) fn type_order(&self) -> u8 {
        match &self.kind {
            ValueKind::Null => TYPE_ORDER_NULL,
            ValueKind::Boolean(_) => TYPE_ORDER_BOOLEAN,
            ValueKind::Integer(_) | ValueKind::Double(_) => TYPE_ORDER_NUMBER,
            ValueKind::Timestamp(_) => TYPE_ORDER_TIMESTAMP,
            ValueKind::String(_) => TYPE_ORDER_STRING,
            ValueKind::Bytes(_) => TYPE_ORDER_BYTES,
            ValueKind::Reference(_) => TYPE_ORDER_REFERENCE,
            ValueKind::GeoPoint(_) => TYPE_ORDER_GEO_POINT,
            ValueKind::Array(_) => TYPE_ORDER_ARRAY,
            ValueKind::Map(_) if self.is_server_timestamp() => TYPE_ORDER_SERVER_TIMESTAMP,
            ValueKind::Map(_) => TYPE_ORDER_MAP,
            ValueKind::Sentinel(_) => TYPE_ORDER_SENTINEL,
        }
    }

    /// Total ordering across all value types, following the backend's type order.
    pub fn compare(&self, other: &Self) -> Ordering {
        let left_order = self.type_order();
        let right_order = other.type_order();
        if left_order != right_order {
            return left_order.cmp(&right_order);
        }

        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
            (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
            (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
            (ValueKind::Integer(a), ValueKind::Double(b)) => compare_mixed(*a, *b),
            (ValueKind::Double(a), ValueKind::Integer(b)) => compare_mixed(*b, *a).reverse(),
            (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
            (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
            (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
            (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
            (ValueKind::Reference(a), ValueKind::Reference(b)) => compare_references(a, b),
            (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b),
            (ValueKind::Array(a), ValueKind::Array(b)) => compare_arrays(a, b),
            (ValueKind::Map(a), ValueKind::Map(b)) if self.is_server_timestamp() => {
                let left = crate::firestore::model::server_timestamps::local_write_time(a);
                let right = crate::firestore::model::server_timestamps::local_write_time(b);
                left.cmp(&right)
            }
            (ValueKind::Map(a), ValueKind::Map(b)) => compare_maps(a, b),
            _ => Ordering::Equal,
        }
    }

    /// Stable textual representation used to build canonical query ids.
    pub fn canonical_id(&self) -> String {
        match &self.kind {
            ValueKind::Null => "null".to_string(),
            ValueKind::Boolean(value) => value.to_string(),
            ValueKind::Integer(value) => value.to_string(),
            ValueKind::Double(value) => format!("{value:?}"),
            ValueKind::Timestamp(value) => format!("time({},{})", value.seconds, value.nanos),
            ValueKind::String(value) => format!("{value:?}"),
            ValueKind::Bytes(value) => format!("bytes({})", value.to_base64()),
            ValueKind::Reference(value) => format!("ref({value})"),
            ValueKind::GeoPoint(value) => value.to_string(),
            ValueKind::Array(array) => {
                let entries: Vec<String> =
                    array.values().iter().map(FirestoreValue::canonical_id).collect();
                format!("[{}]", entries.join(","))
            }
            ValueKind::Map(map) => {
                let entries: Vec<String> = map
                    .fields()
                    .iter()
                    .map(|(key, value)| format!("{key}:{}", value.canonical_id()))
                    .collect();
                format!("{{{}}}", entries.join(","))
            }
            ValueKind::Sentinel(sentinel) => format!("sentinel({sentinel:?})"),
        }
    }
}

impl PartialEq for FirestoreValue {
    fn eq(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => true,
            (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a == b,
            (ValueKind::Integer(a), ValueKind::Integer(b)) => a == b,
            // NaN equals NaN and -0.0 differs from 0.0 for document equality.
            (ValueKind::Double(a), ValueKind::Double(b)) => a.to_bits() == b.to_bits(),
            (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a == b,
            (ValueKind::String(a), ValueKind::String(b)) => a == b,
            (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a == b,
            (ValueKind::Reference(a), ValueKind::Reference(b)) => a == b,
            (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a == b,
            (ValueKind::Array(a), ValueKind::Array(b)) => a == b,
            (ValueKind::Map(a), ValueKind::Map(b)) => a == b,
            (ValueKind::Sentinel(a), ValueKind::Sentinel(b)) => a == b,
            _ => false,
        }
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    compare_doubles(integer as f64, double)
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left_segments = left.split('/');
    let right_segments = right.split('/');
    left_segments.cmp(right_segments)
}

fn compare_arrays(left: &ArrayValue, right: &ArrayValue) -> Ordering {
    for (l, r) in left.values().iter().zip(right.values().iter()) {
        let ordering = l.compare(r);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.values().len().cmp(&right.values().len())
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    for ((lk, lv), (rk, rv)) in left.fields().iter().zip(right.fields().iter()) {
        let ordering = lk.cmp(rk).then_with(|| lv.compare(rv));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.fields().len().cmp(&right.fields().len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_basic_values() {
        let v = FirestoreValue::from_string("hello");
        match v.kind() {
            ValueKind::String(value) => assert_eq!(value, "hello"),
            _ => panic!("unexpected kind"),
        }
    }

    #[test]
    fn orders_across_types() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-5),
            FirestoreValue::from_double(1.5),
            FirestoreValue::from_integer(2),
            FirestoreValue::from_timestamp(Timestamp::new(10, 0)),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for window in ordered.windows(2) {
            assert_eq!(
                window[0].compare(&window[1]),
                Ordering::Less,
                "{:?} should sort before {:?}",
                window[0],
                window[1]
            );
        }
    }

    #[test]
    fn canonical_ids_distinguish_types() {
        assert_ne!(
            FirestoreValue::from_string("1").canonical_id(),
            FirestoreValue::from_integer(1).canonical_id()
        );
        assert_ne!(
            FirestoreValue::from_integer(1).canonical_id(),
            FirestoreValue::from_double(1.0).canonical_id()
        );
    }

    #[test]
    fn integer_and_double_are_distinct_for_equality() {
        assert_ne!(FirestoreValue::from_integer(1), FirestoreValue::from_double(1.0));
        assert_eq!(
            FirestoreValue::from_integer(1).compare(&FirestoreValue::from_double(1.0)),
            Ordering::Equal
        );
        assert_eq!(
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_double(f64::NAN)
        );
    }
}
