use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::server_timestamps::server_timestamp_placeholder;
use crate::firestore::model::{
    DocumentKey, FieldMask, FieldPath, MutableDocument, SnapshotVersion, Timestamp,
};
use crate::firestore::value::{ArrayValue, FirestoreValue, MapValue, ValueKind};

/// Condition the current document must satisfy for a mutation to apply.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

/// Write-time operation applied to a single field.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

/// Result of committing a single mutation on the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    /// Version of the document after the write. For deletes this is the
    /// commit version.
    pub version: SnapshotVersion,
    /// Values computed by the backend for the mutation's field transforms.
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: MapValue },
    /// Writes the fields named by `mask`; masked paths missing from `data`
    /// are deleted.
    Patch { data: MapValue, mask: FieldMask },
    Delete,
    /// Asserts the precondition without changing the document.
    Verify,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    precondition: Precondition,
    field_transforms: Vec<FieldTransform>,
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self::new(key, MutationKind::Set { value }, Precondition::None, Vec::new())
    }

    pub fn patch(key: DocumentKey, data: MapValue, mask: FieldMask) -> Self {
        Self::new(
            key,
            MutationKind::Patch { data, mask },
            Precondition::Exists(true),
            Vec::new(),
        )
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self::new(key, MutationKind::Delete, Precondition::None, Vec::new())
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self::new(key, MutationKind::Verify, precondition, Vec::new())
    }

    pub fn new(
        key: DocumentKey,
        kind: MutationKind,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    ) -> Self {
        Self {
            key,
            kind,
            precondition,
            field_transforms,
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_field_transforms(mut self, field_transforms: Vec<FieldTransform>) -> Self {
        self.field_transforms = field_transforms;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    /// Applies the mutation to the locally cached document, producing the
    /// latency-compensated view.
    ///
    /// `previous_mask` is the set of fields modified by earlier mutations to
    /// the same document; `None` means the whole document was overwritten.
    /// Returns the updated mask with the same meaning.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition.is_valid_for(document) {
            return previous_mask;
        }

        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = value.clone();
                self.write_transform_results(&mut data, transform_results);
                take_and_replace(document, |doc| {
                    let version = doc.version();
                    doc.convert_to_found_document(version, data)
                        .with_local_mutations()
                });
                None
            }
            MutationKind::Patch { data, mask } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut merged = document.data().clone();
                apply_patch(&mut merged, data, mask);
                self.write_transform_results(&mut merged, transform_results);
                take_and_replace(document, |doc| {
                    let version = doc.version();
                    doc.convert_to_found_document(version, merged)
                        .with_local_mutations()
                });
                previous_mask.map(|mut previous| {
                    previous.union_with(mask);
                    for transform in &self.field_transforms {
                        previous.insert(transform.field_path().clone());
                    }
                    previous
                })
            }
            MutationKind::Delete => {
                take_and_replace(document, |doc| {
                    let version = doc.version();
                    doc.convert_to_no_document(version).with_local_mutations()
                });
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    /// Applies the backend's result for this mutation to the cached document.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationResult,
    ) -> FirestoreResult<()> {
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.server_transform_results(document, result)?;
                let mut data = value.clone();
                self.write_transform_results(&mut data, transform_results);
                take_and_replace(document, |doc| {
                    doc.convert_to_found_document(result.version, data)
                        .with_committed_mutations()
                });
                Ok(())
            }
            MutationKind::Patch { data, mask } => {
                if !self.precondition.is_valid_for(document) {
                    // The backend applied a patch we cannot reproduce; the
                    // result is unknown until the next watch update.
                    take_and_replace(document, |doc| {
                        doc.convert_to_unknown_document(result.version)
                    });
                    return Ok(());
                }
                let transform_results = self.server_transform_results(document, result)?;
                let mut merged = document.data().clone();
                apply_patch(&mut merged, data, mask);
                self.write_transform_results(&mut merged, transform_results);
                take_and_replace(document, |doc| {
                    doc.convert_to_found_document(result.version, merged)
                        .with_committed_mutations()
                });
                Ok(())
            }
            MutationKind::Delete => {
                take_and_replace(document, |doc| {
                    doc.convert_to_no_document(result.version)
                        .with_committed_mutations()
                });
                Ok(())
            }
            MutationKind::Verify => Err(internal_error(
                "Verify mutations are never applied to cached documents",
            )),
        }
    }

    /// Fields that this mutation reads before writing (numeric increments).
    ///
    /// Returns a patch recording the current values so the write stays
    /// idempotent when the batch is replayed on top of newer remote state.
    pub fn extract_base_value(&self, document: &MutableDocument) -> Option<MapValue> {
        let mut base = MapValue::empty();
        for transform in &self.field_transforms {
            if let TransformOperation::NumericIncrement(_) = transform.operation() {
                let existing = document.field(transform.field_path());
                let base_value = match existing {
                    Some(value) if value.is_number() => value.clone(),
                    _ => FirestoreValue::from_integer(0),
                };
                base.set_field(transform.field_path(), base_value);
            }
        }
        if base.is_empty() {
            None
        } else {
            Some(base)
        }
    }

    fn local_transform_results(
        &self,
        document: &MutableDocument,
        local_write_time: Timestamp,
    ) -> Vec<(FieldPath, FirestoreValue)> {
        self.field_transforms
            .iter()
            .map(|transform| {
                let previous = document.field(transform.field_path());
                let value = match transform.operation() {
                    TransformOperation::ServerTimestamp => {
                        server_timestamp_placeholder(local_write_time, previous)
                    }
                    TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
                    TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
                    TransformOperation::NumericIncrement(operand) => {
                        numeric_increment(previous, operand)
                    }
                };
                (transform.field_path().clone(), value)
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        document: &MutableDocument,
        result: &MutationResult,
    ) -> FirestoreResult<Vec<(FieldPath, FirestoreValue)>> {
        if !result.transform_results.is_empty()
            && result.transform_results.len() != self.field_transforms.len()
        {
            return Err(internal_error(format!(
                "Server transform count ({}) should match field transform count ({})",
                result.transform_results.len(),
                self.field_transforms.len()
            )));
        }

        Ok(self
            .field_transforms
            .iter()
            .enumerate()
            .map(|(index, transform)| {
                let previous = document.field(transform.field_path());
                let server_value = result.transform_results.get(index);
                let value = match (transform.operation(), server_value) {
                    // Array transforms are deterministic; replay them locally.
                    (TransformOperation::ArrayUnion(elements), _) => {
                        array_union(previous, elements)
                    }
                    (TransformOperation::ArrayRemove(elements), _) => {
                        array_remove(previous, elements)
                    }
                    (_, Some(server_value)) => server_value.clone(),
                    (TransformOperation::ServerTimestamp, None) => {
                        FirestoreValue::from_timestamp(result.version.timestamp())
                    }
                    (TransformOperation::NumericIncrement(operand), None) => {
                        numeric_increment(previous, operand)
                    }
                };
                (transform.field_path().clone(), value)
            })
            .collect())
    }

    fn write_transform_results(&self, data: &mut MapValue, results: Vec<(FieldPath, FirestoreValue)>) {
        for (path, value) in results {
            data.set_field(&path, value);
        }
    }
}

fn take_and_replace(
    document: &mut MutableDocument,
    update: impl FnOnce(MutableDocument) -> MutableDocument,
) {
    let placeholder = MutableDocument::new_invalid_document(document.key().clone());
    let current = std::mem::replace(document, placeholder);
    *document = update(current);
}

fn apply_patch(target: &mut MapValue, data: &MapValue, mask: &FieldMask) {
    for path in mask.fields() {
        match data.field(path) {
            Some(value) => target.set_field(path, value.clone()),
            None => target.delete_field(path),
        }
    }
}

fn coerce_array(existing: Option<&FirestoreValue>) -> ArrayValue {
    match existing.map(FirestoreValue::kind) {
        Some(ValueKind::Array(array)) => array.clone(),
        _ => ArrayValue::default(),
    }
}

fn array_union(existing: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    FirestoreValue::from_array(coerce_array(existing).union(additions).into_values())
}

fn array_remove(existing: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    FirestoreValue::from_array(coerce_array(existing).without(removals).into_values())
}

fn numeric_increment(existing: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = match existing.map(FirestoreValue::kind) {
        Some(ValueKind::Integer(value)) => ValueKind::Integer(*value),
        Some(ValueKind::Double(value)) => ValueKind::Double(*value),
        _ => ValueKind::Integer(0),
    };
    match (base, operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => {
            // Integer overflow saturates, matching the backend.
            FirestoreValue::from_integer(current.saturating_add(*delta))
        }
        (ValueKind::Integer(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current as f64 + *delta)
        }
        (ValueKind::Double(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_double(current + *delta as f64)
        }
        (ValueKind::Double(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current + *delta)
        }
        _ => operand.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        MapValue::new(
            entries
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    fn found(data: MapValue) -> MutableDocument {
        MutableDocument::new_found_document(key(), SnapshotVersion::from_micros(1), data)
    }

    #[test]
    fn set_overwrites_document() {
        let mut doc = found(map(&[("a", FirestoreValue::from_integer(1))]));
        let mutation = Mutation::set(key(), map(&[("b", FirestoreValue::from_integer(2))]));
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert!(mask.is_none());
        assert!(doc.has_local_mutations());
        assert_eq!(doc.version(), SnapshotVersion::from_micros(1));
        assert_eq!(doc.data(), &map(&[("b", FirestoreValue::from_integer(2))]));
    }

    #[test]
    fn patch_merges_masked_fields() {
        let mut doc = found(map(&[
            ("a", FirestoreValue::from_integer(1)),
            ("b", FirestoreValue::from_integer(2)),
        ]));
        let mutation = Mutation::patch(
            key(),
            map(&[("a", FirestoreValue::from_integer(10))]),
            FieldMask::new(vec![path("a"), path("b")]),
        );
        let mask = mutation
            .apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now())
            .unwrap();
        assert_eq!(mask.len(), 2);
        assert_eq!(doc.data(), &map(&[("a", FirestoreValue::from_integer(10))]));
    }

    #[test]
    fn patch_on_missing_document_is_skipped_locally() {
        let mut doc = MutableDocument::new_no_document(key(), SnapshotVersion::from_micros(3));
        let before = doc.clone();
        let mutation = Mutation::patch(
            key(),
            map(&[("a", FirestoreValue::from_integer(1))]),
            FieldMask::new(vec![path("a")]),
        );
        mutation.apply_to_local_view(&mut doc, None, Timestamp::now());
        assert_eq!(doc, before);
    }

    #[test]
    fn patch_failing_precondition_remotely_becomes_unknown() {
        let mut doc = MutableDocument::new_invalid_document(key());
        let mutation = Mutation::patch(
            key(),
            map(&[("a", FirestoreValue::from_integer(1))]),
            FieldMask::new(vec![path("a")]),
        );
        let result = MutationResult::new(SnapshotVersion::from_micros(9), Vec::new());
        mutation.apply_to_remote_document(&mut doc, &result).unwrap();
        assert!(doc.is_unknown_document());
        assert_eq!(doc.version(), SnapshotVersion::from_micros(9));
    }

    #[test]
    fn server_timestamp_placeholder_then_commit() {
        let mut doc = found(map(&[]));
        let mutation = Mutation::set(key(), map(&[])).with_field_transforms(vec![
            FieldTransform::new(path("at"), TransformOperation::ServerTimestamp),
        ]);
        mutation.apply_to_local_view(&mut doc, None, Timestamp::new(50, 0));
        assert!(doc.field(&path("at")).unwrap().is_server_timestamp());

        let committed = FirestoreValue::from_timestamp(Timestamp::new(60, 0));
        let result = MutationResult::new(SnapshotVersion::from_micros(60_000_000), vec![committed.clone()]);
        mutation.apply_to_remote_document(&mut doc, &result).unwrap();
        assert_eq!(doc.field(&path("at")), Some(&committed));
        assert!(doc.has_committed_mutations());
    }

    #[test]
    fn increments_and_array_transforms() {
        let mut doc = found(map(&[
            ("n", FirestoreValue::from_integer(i64::MAX)),
            ("tags", FirestoreValue::from_array(vec![FirestoreValue::from_string("a")])),
        ]));
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::empty())
            .with_field_transforms(vec![
                FieldTransform::new(
                    path("n"),
                    TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)),
                ),
                FieldTransform::new(
                    path("tags"),
                    TransformOperation::ArrayUnion(vec![
                        FirestoreValue::from_string("a"),
                        FirestoreValue::from_string("b"),
                    ]),
                ),
            ]);
        let base = mutation.extract_base_value(&doc).unwrap();
        assert_eq!(base.field(&path("n")), Some(&FirestoreValue::from_integer(i64::MAX)));

        mutation.apply_to_local_view(&mut doc, None, Timestamp::now());
        assert_eq!(doc.field(&path("n")), Some(&FirestoreValue::from_integer(i64::MAX)));
        assert_eq!(doc.field(&path("tags")).unwrap().as_array().unwrap().values().len(), 2);
    }

    #[test]
    fn delete_and_preconditions() {
        let mut doc = found(map(&[("a", FirestoreValue::from_integer(1))]));
        assert!(Precondition::Exists(true).is_valid_for(&doc));
        assert!(Precondition::UpdateTime(SnapshotVersion::from_micros(1)).is_valid_for(&doc));
        assert!(!Precondition::Exists(false).is_valid_for(&doc));

        Mutation::delete(key()).apply_to_local_view(&mut doc, None, Timestamp::now());
        assert!(doc.is_no_document());
        assert!(doc.has_local_mutations());
    }
}
