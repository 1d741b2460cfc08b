use std::collections::BTreeSet;

use crate::firestore::core::Query;
use crate::firestore::local::overlay::OverlayIndex;
use crate::firestore::local::remote_document_cache::{DocumentMap, MemoryRemoteDocumentCache};
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

/// Read-only merge of remote documents with pending local mutations.
pub struct LocalDocumentsView<'a> {
    remote_documents: &'a MemoryRemoteDocumentCache,
    overlays: &'a OverlayIndex,
}

impl<'a> LocalDocumentsView<'a> {
    pub fn new(remote_documents: &'a MemoryRemoteDocumentCache, overlays: &'a OverlayIndex) -> Self {
        Self {
            remote_documents,
            overlays,
        }
    }

    pub fn get_document(&self, key: &DocumentKey) -> MutableDocument {
        let mut document = self.remote_documents.get(key);
        self.overlays.apply(&mut document);
        document
    }

    pub fn get_documents<'k>(&self, keys: impl IntoIterator<Item = &'k DocumentKey>) -> DocumentMap {
        keys.into_iter()
            .map(|key| (key.clone(), self.get_document(key)))
            .collect()
    }

    /// Local documents matching `query`, considering remote documents read
    /// after `since_read_time` and every document with pending mutations.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> DocumentMap {
        if query.is_document_query() {
            return self.get_document_for_query(query);
        }

        let mut results = self
            .remote_documents
            .documents_matching_query(query, since_read_time);

        let overlay_keys: BTreeSet<DocumentKey> = self
            .overlays
            .keys()
            .filter(|key| query.matches_path(key))
            .cloned()
            .collect();
        for key in &overlay_keys {
            if !results.contains_key(key) {
                results.insert(key.clone(), self.remote_documents.get(key));
            }
        }

        results
            .into_iter()
            .filter_map(|(key, mut document)| {
                if overlay_keys.contains(&key) {
                    self.overlays.apply(&mut document);
                }
                query.matches(&document).then_some((key, document))
            })
            .collect()
    }

    fn get_document_for_query(&self, query: &Query) -> DocumentMap {
        let mut results = DocumentMap::new();
        if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
            let document = self.get_document(&key);
            if document.is_found_document() {
                results.insert(key, document);
            }
        }
        results
    }
}
