use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, FieldTransform, Mutation, Precondition, TransformOperation,
};
use crate::firestore::value::{FirestoreValue, MapValue, SentinelValue, ValueKind};

/// How a `set` write treats fields already on the document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SetOptions {
    /// Merge every field present in the data into the existing document.
    pub merge: bool,
    /// Merge only these fields. Takes precedence over `merge`.
    pub merge_fields: Option<Vec<FieldPath>>,
}

impl SetOptions {
    pub fn merge_all() -> Self {
        Self {
            merge: true,
            merge_fields: None,
        }
    }

    pub fn merge_fields<I>(fields: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = FieldPath>,
    {
        let unique: Vec<FieldPath> = fields
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if unique.is_empty() {
            return Err(invalid_argument("merge_fields requires at least one field path"));
        }
        Ok(Self {
            merge: false,
            merge_fields: Some(unique),
        })
    }

    pub fn is_merge(&self) -> bool {
        self.merge || self.merge_fields.is_some()
    }
}

/// User data with its sentinels split out into field transforms.
#[derive(Debug, Default)]
struct ParsedData {
    fields: BTreeMap<String, FirestoreValue>,
    /// Leaf paths of the plain (non-sentinel) values.
    field_paths: Vec<FieldPath>,
    transforms: Vec<FieldTransform>,
}

/// Builds the mutation for a `set` of `data` on `key`.
///
/// A plain set replaces the document. A merge becomes a patch without a
/// precondition whose mask covers the merged fields.
pub fn parse_set_data(
    key: DocumentKey,
    data: BTreeMap<String, FirestoreValue>,
    options: &SetOptions,
) -> FirestoreResult<Mutation> {
    let parsed = parse_data(&data)?;
    let value = MapValue::new(parsed.fields);

    let mask = match (&options.merge_fields, options.merge) {
        (Some(fields), _) => {
            for field in fields {
                let covered = parsed.field_paths.contains(field)
                    || parsed.transforms.iter().any(|t| t.field_path() == field);
                if !covered {
                    return Err(invalid_argument(format!(
                        "Field '{}' is specified in your field mask but missing from your input data.",
                        field.canonical_string()
                    )));
                }
            }
            Some(FieldMask::new(fields.iter().cloned()))
        }
        (None, true) => Some(FieldMask::new(
            parsed
                .field_paths
                .iter()
                .chain(parsed.transforms.iter().map(FieldTransform::field_path))
                .cloned(),
        )),
        (None, false) => None,
    };

    let mutation = match mask {
        None => Mutation::set(key, value).with_field_transforms(parsed.transforms),
        Some(mask) => {
            let transforms = parsed
                .transforms
                .into_iter()
                .filter(|transform| mask.covers(transform.field_path()))
                .collect();
            let mask = FieldMask::new(
                mask.fields()
                    .filter(|path| value.field(path).is_some())
                    .cloned()
                    .collect::<Vec<_>>(),
            );
            Mutation::patch(key, value, mask)
                .with_precondition(Precondition::None)
                .with_field_transforms(transforms)
        }
    };
    Ok(mutation)
}

/// Builds the mutation for an `update` of `data` on `key`. Keys are dotted
/// field paths; the document must exist.
pub fn parse_update_data(
    key: DocumentKey,
    data: BTreeMap<String, FirestoreValue>,
) -> FirestoreResult<Mutation> {
    if data.is_empty() {
        return Err(invalid_argument("update requires at least one field/value pair"));
    }
    let mut value = MapValue::empty();
    let mut mask_paths = Vec::new();
    let mut transforms = Vec::new();
    for (path, field_value) in data {
        let path = FieldPath::from_dot_separated(&path)?;
        let mut leaf_paths = Vec::new();
        if let Some(parsed) = parse_value(&field_value, path.segments(), &mut leaf_paths, &mut transforms)? {
            value.set_field(&path, parsed);
            mask_paths.push(path);
        }
    }
    Ok(Mutation::patch(key, value, FieldMask::new(mask_paths)).with_field_transforms(transforms))
}

pub fn delete_mutation(key: DocumentKey) -> Mutation {
    Mutation::delete(key)
}

fn parse_data(data: &BTreeMap<String, FirestoreValue>) -> FirestoreResult<ParsedData> {
    let mut parsed = ParsedData::default();
    parsed.fields = parse_map(data, &[], &mut parsed.field_paths, &mut parsed.transforms)?;
    Ok(parsed)
}

fn parse_map(
    data: &BTreeMap<String, FirestoreValue>,
    parent: &[String],
    field_paths: &mut Vec<FieldPath>,
    transforms: &mut Vec<FieldTransform>,
) -> FirestoreResult<BTreeMap<String, FirestoreValue>> {
    let mut cleaned = BTreeMap::new();
    for (key, value) in data {
        let mut segments = parent.to_vec();
        segments.push(key.clone());
        if let Some(parsed) = parse_value(value, &segments, field_paths, transforms)? {
            cleaned.insert(key.clone(), parsed);
        }
    }
    Ok(cleaned)
}

/// Returns `None` when the value was a sentinel and became a transform.
fn parse_value(
    value: &FirestoreValue,
    segments: &[String],
    field_paths: &mut Vec<FieldPath>,
    transforms: &mut Vec<FieldTransform>,
) -> FirestoreResult<Option<FirestoreValue>> {
    let path = FieldPath::new(segments.to_vec())?;
    match value.kind() {
        ValueKind::Sentinel(sentinel) => {
            transforms.push(FieldTransform::new(path, transform_for(sentinel, segments)?));
            Ok(None)
        }
        ValueKind::Map(map) if !map.is_empty() => {
            let nested = parse_map(map.fields(), segments, field_paths, transforms)?;
            Ok(Some(FirestoreValue::from_map(nested)))
        }
        ValueKind::Array(array) => {
            for element in array.values() {
                reject_nested_sentinel(element, &path)?;
            }
            field_paths.push(path);
            Ok(Some(value.clone()))
        }
        _ => {
            field_paths.push(path);
            Ok(Some(value.clone()))
        }
    }
}

fn transform_for(sentinel: &SentinelValue, segments: &[String]) -> FirestoreResult<TransformOperation> {
    let path = segments.join(".");
    Ok(match sentinel {
        SentinelValue::ServerTimestamp => TransformOperation::ServerTimestamp,
        SentinelValue::ArrayUnion(elements) | SentinelValue::ArrayRemove(elements) => {
            for element in elements {
                reject_nested_sentinel(element, &FieldPath::new(segments.to_vec())?)?;
            }
            if matches!(sentinel, SentinelValue::ArrayUnion(_)) {
                TransformOperation::ArrayUnion(elements.clone())
            } else {
                TransformOperation::ArrayRemove(elements.clone())
            }
        }
        SentinelValue::NumericIncrement(operand) => {
            if !operand.is_number() {
                return Err(invalid_argument(format!(
                    "increment() on field '{path}' requires a numeric operand"
                )));
            }
            TransformOperation::NumericIncrement(operand.as_ref().clone())
        }
    })
}

fn reject_nested_sentinel(value: &FirestoreValue, path: &FieldPath) -> FirestoreResult<()> {
    match value.kind() {
        ValueKind::Sentinel(_) => Err(invalid_argument(format!(
            "Invalid data. Sentinel values cannot be used inside arrays (field '{}').",
            path.canonical_string()
        ))),
        ValueKind::Array(array) => array
            .values()
            .iter()
            .try_for_each(|element| reject_nested_sentinel(element, path)),
        ValueKind::Map(map) => map
            .fields()
            .values()
            .try_for_each(|element| reject_nested_sentinel(element, path)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::MutationKind;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/a").unwrap()
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn plain_set_splits_out_transforms() {
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), FirestoreValue::from_string("Ada"));
        data.insert("updated".to_string(), FirestoreValue::server_timestamp());
        let mutation = parse_set_data(key(), data, &SetOptions::default()).unwrap();

        let MutationKind::Set { value } = mutation.kind() else {
            panic!("expected set mutation");
        };
        assert!(value.field(&path("updated")).is_none());
        assert_eq!(mutation.field_transforms().len(), 1);
        assert_eq!(mutation.field_transforms()[0].field_path(), &path("updated"));
        assert_eq!(mutation.precondition(), &Precondition::None);
    }

    #[test]
    fn merge_set_becomes_unconditional_patch() {
        let mut nested = BTreeMap::new();
        nested.insert("city".to_string(), FirestoreValue::from_string("Paris"));
        let mut data = BTreeMap::new();
        data.insert("address".to_string(), FirestoreValue::from_map(nested));
        data.insert(
            "visits".to_string(),
            FirestoreValue::numeric_increment(FirestoreValue::from_integer(1)),
        );
        let mutation = parse_set_data(key(), data, &SetOptions::merge_all()).unwrap();

        let MutationKind::Patch { mask, .. } = mutation.kind() else {
            panic!("expected patch mutation");
        };
        assert!(mask.covers(&path("address.city")));
        assert_eq!(mutation.precondition(), &Precondition::None);
        assert!(!mask.covers(&path("visits")));
        assert_eq!(mutation.field_transforms().len(), 1);
    }

    #[test]
    fn merge_fields_drop_transforms_outside_the_mask() {
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), FirestoreValue::from_string("Ada"));
        data.insert("updated".to_string(), FirestoreValue::server_timestamp());
        let options = SetOptions::merge_fields([path("name")]).unwrap();
        let mutation = parse_set_data(key(), data, &options).unwrap();
        assert!(mutation.field_transforms().is_empty());
    }

    #[test]
    fn merge_fields_must_appear_in_data() {
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), FirestoreValue::from_string("Ada"));
        let options = SetOptions::merge_fields([path("missing")]).unwrap();
        assert!(parse_set_data(key(), data, &options).is_err());
    }

    #[test]
    fn update_uses_dotted_paths_and_requires_existence() {
        let mut data = BTreeMap::new();
        data.insert("address.city".to_string(), FirestoreValue::from_string("Rome"));
        data.insert(
            "tags".to_string(),
            FirestoreValue::array_union(vec![FirestoreValue::from_string("x")]),
        );
        let mutation = parse_update_data(key(), data).unwrap();
        let MutationKind::Patch { data, mask } = mutation.kind() else {
            panic!("expected patch mutation");
        };
        assert_eq!(
            data.field(&path("address.city")),
            Some(&FirestoreValue::from_string("Rome"))
        );
        assert_eq!(mask.len(), 1);
        assert_eq!(mutation.precondition(), &Precondition::Exists(true));
        assert_eq!(mutation.field_transforms()[0].field_path(), &path("tags"));
    }

    #[test]
    fn sentinels_inside_arrays_are_rejected() {
        let mut data = BTreeMap::new();
        data.insert(
            "list".to_string(),
            FirestoreValue::from_array(vec![FirestoreValue::server_timestamp()]),
        );
        assert!(parse_set_data(key(), data, &SetOptions::default()).is_err());
    }
}
