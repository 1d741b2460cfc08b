use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::TargetId;
use crate::firestore::local::TargetPurpose;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

/// Changes to the documents of one target since the previous remote event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the backend sent no new token.
    pub resume_token: Vec<u8>,
    /// Whether the target is consistent with the backend at this snapshot.
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    /// Change used when a view is initialised locally without a watch update.
    pub fn synthesized(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Default::default()
        }
    }
}

/// Consistent set of watch changes materialised at a global snapshot.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose cached results were invalidated by an existence filter
    /// mismatch and must be re-listened with the given purpose.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Limbo documents confirmed deleted or present by their limbo target.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}
