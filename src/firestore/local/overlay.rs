use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{
    BatchId, DocumentKey, FieldMask, MutableDocument, Mutation, MutationBatch, Timestamp,
};

/// Mutations of one pending batch that touch a single document.
#[derive(Clone, Debug, PartialEq)]
struct OverlayEntry {
    batch_id: BatchId,
    local_write_time: Timestamp,
    mutations: Vec<Mutation>,
}

/// Per-document index of unacknowledged mutations.
///
/// Applying a key's entries in batch order to the remote document yields the
/// latency-compensated document that queries observe before the backend
/// acknowledges the writes.
#[derive(Clone, Debug, Default)]
pub struct OverlayIndex {
    by_key: BTreeMap<DocumentKey, Vec<OverlayEntry>>,
}

impl OverlayIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_batches<'a>(batches: impl IntoIterator<Item = &'a MutationBatch>) -> Self {
        let mut index = Self::new();
        for batch in batches {
            index.add_batch(batch);
        }
        index
    }

    pub fn add_batch(&mut self, batch: &MutationBatch) {
        for key in batch.keys() {
            let mutations: Vec<Mutation> = batch
                .base_mutations
                .iter()
                .chain(batch.mutations.iter())
                .filter(|mutation| mutation.key() == &key)
                .cloned()
                .collect();
            let entries = self.by_key.entry(key).or_default();
            let position = entries
                .iter()
                .position(|entry| entry.batch_id > batch.batch_id)
                .unwrap_or(entries.len());
            entries.insert(
                position,
                OverlayEntry {
                    batch_id: batch.batch_id,
                    local_write_time: batch.local_write_time,
                    mutations,
                },
            );
        }
    }

    /// Drops the entries of `batch_id`, returning the keys it touched.
    pub fn remove_batch(&mut self, batch_id: BatchId) -> BTreeSet<DocumentKey> {
        let mut affected = BTreeSet::new();
        self.by_key.retain(|key, entries| {
            let before = entries.len();
            entries.retain(|entry| entry.batch_id != batch_id);
            if entries.len() != before {
                affected.insert(key.clone());
            }
            !entries.is_empty()
        });
        affected
    }

    pub fn clear(&mut self) {
        self.by_key.clear();
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.by_key.keys()
    }

    pub fn batch_ids_for_key(&self, key: &DocumentKey) -> Vec<BatchId> {
        self.by_key
            .get(key)
            .map(|entries| entries.iter().map(|entry| entry.batch_id).collect())
            .unwrap_or_default()
    }

    /// Layers the pending mutations for the document's key on top of it.
    /// Returns the mask of fields written, `None` if the whole document was
    /// replaced.
    pub fn apply(&self, document: &mut MutableDocument) -> Option<FieldMask> {
        let mut mask = Some(FieldMask::empty());
        let Some(entries) = self.by_key.get(document.key()) else {
            return mask;
        };
        for entry in entries {
            for mutation in &entry.mutations {
                mask = mutation.apply_to_local_view(document, mask, entry.local_write_time);
            }
        }
        mask
    }
}
