use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::{DocumentComparator, LimitType};
use crate::firestore::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot,
};
use crate::firestore::core::Query;
use crate::firestore::model::{DocumentKey, MutableDocument};
use crate::firestore::remote::{OnlineState, TargetChange};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Results come from the local cache and may be stale.
    Local,
    /// Results match the backend.
    Synced,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// Intermediate result of [`View::compute_doc_changes`], fed back into the
/// next call when the query needs a refill.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// A limit query lost a document at its edge and must be re-run against
    /// the full local result set.
    pub needs_refill: bool,
    pub mutated_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Result set of a query kept in sync with local and remote changes.
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    sync_state: Option<SyncState>,
    current: bool,
    document_set: DocumentSet,
    /// Keys the backend reported as matching the target.
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let comparator = query.comparator();
        Self {
            document_set: DocumentSet::new(comparator.clone()),
            comparator,
            query,
            sync_state: None,
            current: false,
            synced_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    /// Snapshot presenting the current results as if they were all new, for
    /// a listener attaching to an existing view.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
            false,
        )
    }

    /// Computes how `docs` change this view without applying anything.
    pub fn compute_doc_changes(
        &self,
        docs: &BTreeMap<DocumentKey, MutableDocument>,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (
                previous.change_set,
                previous.document_set,
                previous.mutated_keys,
            ),
            None => (
                DocumentChangeSet::default(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit == Some(old_document_set.len());
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in docs {
            let old_doc = old_document_set.get(key);
            let new_doc = if self.query.matches(entry) {
                Some(entry)
            } else {
                None
            };

            let old_doc_had_pending_mutations =
                old_doc.map_or(false, |doc| self.mutated_keys.contains(doc.key()));
            let new_doc_has_pending_mutations = new_doc.map_or(false, |doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                doc: new_doc.clone(),
                            });
                            change_applied = true;

                            let past_last = last_doc_in_limit.as_ref().map_or(false, |last| {
                                (self.comparator)(new_doc, last).then_with(|| new_doc.key().cmp(last.key()))
                                    == std::cmp::Ordering::Greater
                            });
                            let before_first = first_doc_in_limit.as_ref().map_or(false, |first| {
                                (self.comparator)(new_doc, first).then_with(|| new_doc.key().cmp(first.key()))
                                    == std::cmp::Ordering::Less
                            });
                            if past_last || before_first {
                                // The document moved past the edge of the limit;
                                // another document may need to take its place.
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            doc: new_doc.clone(),
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        doc: new_doc.clone(),
                    });
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        doc: old_doc.clone(),
                    });
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        document_set.insert(new_doc.clone());
                        if new_doc_has_pending_mutations {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(evicted) = evicted else {
                    break;
                };
                document_set.remove(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    doc: evicted,
                });
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            needs_refill,
            mutated_keys,
        }
    }

    /// Applies computed changes and returns a snapshot when anything visible
    /// changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys.clone();

        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            left.change_type
                .rank()
                .cmp(&right.change_type.rank())
                .then_with(|| (self.comparator)(&left.doc, &right.doc))
                .then_with(|| left.doc.key().cmp(right.doc.key()))
        });

        self.apply_target_change(target_change);

        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            docs: doc_changes.document_set,
            old_docs,
            doc_changes: changes,
            mutated_keys: doc_changes.mutated_keys,
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change.map_or(false, |change| !change.resume_token.is_empty()),
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Marks the view as not current when the client goes offline, so the
    /// next snapshot reports `from_cache`.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::default(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            self.apply_changes(unchanged, false, None, false)
        } else {
            ViewChange::default()
        }
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            // Locally written documents are not in limbo; the backend simply
            // has not seen the write yet.
            Some(doc) => !doc.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }

        let old_limbo = std::mem::take(&mut self.limbo_documents);
        let new_limbo: BTreeSet<DocumentKey> = self
            .document_set
            .keys()
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&new_limbo)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            new_limbo
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        self.limbo_documents = new_limbo;
        changes
    }
}

fn should_wait_for_synced_document(old_doc: &MutableDocument, new_doc: &MutableDocument) -> bool {
    // A committed write whose watch update has not arrived yet would briefly
    // show the pre-transform value; keep the optimistic version instead.
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}
