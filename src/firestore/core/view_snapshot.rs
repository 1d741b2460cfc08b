use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::Query;
use crate::firestore::model::{DocumentKey, MutableDocument};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the pending-write state of the document changed.
    Metadata,
}

impl ChangeType {
    /// Sort rank used when presenting changes: removals, then additions,
    /// then modifications.
    pub(crate) fn rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub doc: MutableDocument,
}

/// Accumulates per-key view changes, collapsing successive changes to the
/// same document into one.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.doc.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange {
                change_type: old_type,
                doc: change.doc,
            }),
            (Modified, Modified) => Some(change),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                doc: change.doc,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                doc: old.doc.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                doc: change.doc,
            }),
            (old_type, new_type) => {
                log::warn!(
                    target: crate::firestore::constants::LOG_TAG_CORE,
                    "Unexpected change {new_type:?} after {old_type:?} for {key}"
                );
                Some(change)
            }
        };

        match merged {
            Some(change) => {
                self.changes.insert(key, change);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Immutable view of a query's results at a point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// Snapshot that presents every document as newly added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let doc_changes = documents
            .iter()
            .map(|doc| DocumentViewChange {
                change_type: ChangeType::Added,
                doc: doc.clone(),
            })
            .collect();
        let old_docs = documents.empty_like();
        Self {
            query,
            docs: documents,
            old_docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    /// Drops metadata-only changes.
    pub fn without_metadata_changes(&self) -> Self {
        let mut snapshot = self.clone();
        snapshot
            .doc_changes
            .retain(|change| change.change_type != ChangeType::Metadata);
        snapshot.excludes_metadata_changes = true;
        snapshot
    }
}
