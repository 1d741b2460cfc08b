use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, FieldMask, MutableDocument, Mutation, MutationResult, SnapshotVersion, Timestamp,
};

pub type BatchId = i32;

/// Group of mutations committed atomically by the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    /// Monotonic identifier assigned locally when the batch is queued.
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    /// Mutations capturing the values read by non-idempotent transforms.
    /// They are applied to the local view only, never sent to the backend.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    pub fn affects_key(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|mutation| mutation.key() == key)
    }

    /// Applies the batch's local effect to `document`, base mutations first.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mask: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if mutation.key() == document.key() {
                mask = mutation.apply_to_local_view(document, mask, self.local_write_time);
            }
        }
        mask
    }

    /// Applies the committed results for every mutation touching `document`.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationBatchResult,
    ) -> FirestoreResult<()> {
        if result.mutation_results.len() != self.mutations.len() {
            return Err(internal_error(format!(
                "Mismatch between mutations length ({}) and results length ({})",
                self.mutations.len(),
                result.mutation_results.len()
            )));
        }
        for (mutation, mutation_result) in self.mutations.iter().zip(&result.mutation_results) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, mutation_result)?;
            }
        }
        Ok(())
    }
}

/// Acknowledgement of a batch by the write stream.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each written document reached with this commit.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }

        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();

        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::FieldPath;
    use crate::firestore::value::{FirestoreValue, MapValue};
    use std::collections::BTreeMap;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(field: &str, value: i64) -> MapValue {
        MapValue::new(BTreeMap::from([(
            field.to_string(),
            FirestoreValue::from_integer(value),
        )]))
    }

    #[test]
    fn applies_only_matching_mutations() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            Vec::new(),
            vec![
                Mutation::set(key("c/a"), data("x", 1)),
                Mutation::set(key("c/b"), data("x", 2)),
            ],
        );
        let mut doc = MutableDocument::new_invalid_document(key("c/a"));
        batch.apply_to_local_view(&mut doc, None);
        assert_eq!(
            doc.field(&FieldPath::from_dot_separated("x").unwrap()),
            Some(&FirestoreValue::from_integer(1))
        );
        assert_eq!(batch.keys().len(), 2);
        assert!(batch.affects_key(&key("c/b")));
    }

    #[test]
    fn result_requires_matching_lengths() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::delete(key("c/a"))],
        );
        let err = MutationBatchResult::from(batch.clone(), SnapshotVersion::none(), Vec::new(), Vec::new())
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");

        let version = SnapshotVersion::from_micros(7);
        let result = MutationBatchResult::from(
            batch,
            version,
            vec![MutationResult::new(version, Vec::new())],
            b"token".to_vec(),
        )
        .unwrap();
        assert_eq!(result.doc_versions.get(&key("c/a")), Some(&version));
    }
}
