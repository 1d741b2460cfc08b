use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

pub type DocumentMap = BTreeMap<DocumentKey, MutableDocument>;

/// Last known server state of every cached document.
#[derive(Clone, Debug, Default)]
pub struct MemoryRemoteDocumentCache {
    documents: DocumentMap,
}

impl MemoryRemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Stores `document`, stamping it with the read time it was received at.
    pub fn add(&mut self, document: MutableDocument, read_time: SnapshotVersion) -> MutableDocument {
        let document = document.with_read_time(read_time);
        self.documents
            .insert(document.key().clone(), document.clone());
        document
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        self.documents.remove(key)
    }

    /// Returns the cached document, or an invalid document when nothing is
    /// known about `key`.
    pub fn get(&self, key: &DocumentKey) -> MutableDocument {
        self.documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()))
    }

    pub fn get_all<'a>(&self, keys: impl IntoIterator<Item = &'a DocumentKey>) -> DocumentMap {
        keys.into_iter()
            .map(|key| (key.clone(), self.get(key)))
            .collect()
    }

    /// Documents inside the query's path whose read time is later than
    /// `since_read_time`. Filters are not applied.
    pub fn documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> DocumentMap {
        self.documents
            .iter()
            .filter(|(key, document)| {
                query.matches_path(key)
                    && document.is_found_document()
                    && document.read_time() > since_read_time
            })
            .map(|(key, document)| (key.clone(), document.clone()))
            .collect()
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.documents.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> {
        self.documents.values()
    }
}
