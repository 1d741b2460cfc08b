use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::constants::LOG_TAG_REMOTE;
use crate::firestore::core::{ChangeType, TargetId};
use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetChangeState, WatchTargetChange,
};

/// Gives the aggregator access to the targets the remote store is listening
/// to and the documents the client already associates with them.
pub trait TargetMetadataProvider {
    /// Keys the local store associates with `target_id` as of the last
    /// applied remote event.
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Target data for an active listen, or `None` once it was unlistened.
    fn target_data_for_active_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

/// Per-target bookkeeping between two remote events.
#[derive(Debug, Clone)]
struct TargetState {
    /// Outstanding listen/unlisten requests. Changes for a target are only
    /// trusted once every request has been acknowledged.
    pending_responses: i32,
    current: bool,
    resume_token: Vec<u8>,
    has_pending_changes: bool,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            current: false,
            resume_token: Vec::new(),
            // A fresh target always raises an initial change.
            has_pending_changes: true,
            document_changes: BTreeMap::new(),
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..Default::default()
        };
        for (key, change_type) in &self.document_changes {
            let bucket = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
                ChangeType::Metadata => continue,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Accumulates watch changes until the backend reports a consistent global
/// snapshot, then materialises them as a [`RemoteEvent`].
#[derive(Debug)]
pub struct WatchChangeAggregator {
    database_id: DatabaseId,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Targets each pending document update was reported against.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            target_states: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        change: DocumentWatchChange,
    ) {
        for target_id in &change.updated_target_ids {
            match &change.new_document {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(metadata, *target_id, document.clone());
                }
                other => {
                    self.remove_document_from_target(
                        metadata,
                        *target_id,
                        change.key.clone(),
                        other.clone(),
                    );
                }
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(
                metadata,
                *target_id,
                change.key.clone(),
                change.new_document.clone(),
            );
        }
    }

    /// Applies a target change. An empty `target_ids` list addresses every
    /// target the aggregator knows about.
    pub fn handle_target_change(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        change: &WatchTargetChange,
    ) {
        for target_id in self.affected_targets(change) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(metadata, target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        // A re-added target starts over; anything received
                        // before the add belongs to the previous listen.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        self.target_states.remove(&target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(metadata, target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(metadata, target_id) {
                        self.reset_target(metadata, target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn affected_targets(&self, change: &WatchTargetChange) -> Vec<TargetId> {
        if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        }
    }

    /// Checks the backend's document count for a target against the client's
    /// and resets the target when they disagree.
    pub fn handle_existence_filter(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        filter: ExistenceFilterChange,
    ) {
        let target_id = filter.target_id;
        let expected_count = filter.count;
        let Some(target_data) = metadata.target_data_for_active_target(target_id) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document was deleted before the listen could report it.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    self.remove_document_from_target(
                        metadata,
                        target_id,
                        key.clone(),
                        Some(MutableDocument::new_no_document(key, SnapshotVersion::none())),
                    );
                }
            } else if expected_count != 1 {
                log::warn!(
                    target: LOG_TAG_REMOTE,
                    "Single document existence filter with count {expected_count}"
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(metadata, target_id);
        if current_count == expected_count as i64 {
            return;
        }

        let application = self.apply_bloom_filter(metadata, &filter, current_count);
        if application != BloomFilterApplication::Success {
            log::debug!(
                target: LOG_TAG_REMOTE,
                "Existence filter mismatch for target {target_id}: expected {expected_count}, have {current_count}"
            );
            self.reset_target(metadata, target_id);
            let purpose = if application == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn apply_bloom_filter(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        filter: &ExistenceFilterChange,
        current_count: i64,
    ) -> BloomFilterApplication {
        let Some(bloom_filter) = &filter.bloom_filter else {
            return BloomFilterApplication::Skipped;
        };
        if bloom_filter.bit_count() == 0 || bloom_filter.hash_count() == 0 {
            return BloomFilterApplication::Skipped;
        }

        let removed = self.filter_removed_documents(metadata, bloom_filter, filter.target_id);
        if i64::from(filter.count) != current_count - removed {
            BloomFilterApplication::FalsePositive
        } else {
            BloomFilterApplication::Success
        }
    }

    /// Removes every known document the bloom filter says is gone. Returns
    /// the number removed.
    fn filter_removed_documents(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        bloom_filter: &BloomFilter,
        target_id: TargetId,
    ) -> i64 {
        let root = self.database_id.documents_root();
        let mut removed = 0;
        for key in metadata.remote_keys_for_target(target_id) {
            let name = format!("{root}/{}", key.path().canonical_string());
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(metadata, target_id, key, None);
                removed += 1;
            }
        }
        removed
    }

    /// Materialises the accumulated changes at `snapshot_version` and clears
    /// the pending state.
    pub fn create_remote_event(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        snapshot_version: SnapshotVersion,
    ) -> RemoteEvent {
        // A current document target that never reported its document proves
        // the document does not exist.
        let mut missing_documents = Vec::new();
        for (target_id, state) in &self.target_states {
            let Some(target_data) = metadata.target_data_for_active_target(*target_id) else {
                continue;
            };
            if state.current && target_data.target.is_document_target() {
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(metadata, *target_id, &key)
                    {
                        missing_documents.push((*target_id, key));
                    }
                }
            }
        }
        for (target_id, key) in missing_documents {
            let deleted = MutableDocument::new_no_document(key.clone(), snapshot_version);
            self.remove_document_from_target(metadata, target_id, key, Some(deleted));
        }

        let mut target_changes = BTreeMap::new();
        for (target_id, state) in self.target_states.iter_mut() {
            if metadata.target_data_for_active_target(*target_id).is_none() {
                continue;
            }
            if state.has_pending_changes {
                target_changes.insert(*target_id, state.to_target_change());
                state.clear_pending_changes();
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                metadata
                    .target_data_for_active_target(*target_id)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let document_updates = std::mem::take(&mut self.pending_document_updates)
            .into_iter()
            .map(|(key, document)| (key, document.with_read_time(snapshot_version)))
            .collect();
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Counts an outstanding listen or unlisten request for `target_id`.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).pending_responses += 1;
    }

    /// Forgets everything known about `target_id`, as when the backend
    /// rejected it. A later listen on the same id starts from scratch.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn add_document_to_target(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
        document: MutableDocument,
    ) {
        if !self.is_active_target(metadata, target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(metadata, target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: DocumentKey,
        updated_document: Option<MutableDocument>,
    ) {
        if !self.is_active_target(metadata, target_id) {
            return;
        }
        if self.target_contains_document(metadata, target_id, &key) {
            self.ensure_target_state(target_id)
                .add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // The document was added and removed within the same event.
            self.ensure_target_state(target_id).remove_document_change(&key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key, document);
        }
    }

    fn reset_target(&mut self, metadata: &dyn TargetMetadataProvider, target_id: TargetId) {
        let pending_responses = self
            .target_states
            .get(&target_id)
            .map_or(0, |state| state.pending_responses);
        self.target_states.insert(
            target_id,
            TargetState {
                pending_responses,
                ..Default::default()
            },
        );
        for key in metadata.remote_keys_for_target(target_id) {
            self.remove_document_from_target(metadata, target_id, key, None);
        }
    }

    fn current_document_count_for_target(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> i64 {
        let state = self.ensure_target_state(target_id);
        let mut delta = 0i64;
        for change_type in state.document_changes.values() {
            match change_type {
                ChangeType::Added => delta += 1,
                ChangeType::Removed => delta -= 1,
                _ => {}
            }
        }
        metadata.remote_keys_for_target(target_id).len() as i64 + delta
    }

    fn target_contains_document(
        &self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: &DocumentKey,
    ) -> bool {
        metadata.remote_keys_for_target(target_id).contains(key)
    }

    /// Active means listened to and not waiting on a request acknowledgement.
    fn is_active_target(&self, metadata: &dyn TargetMetadataProvider, target_id: TargetId) -> bool {
        let pending = self
            .target_states
            .get(&target_id)
            .is_some_and(TargetState::is_pending);
        !pending && metadata.target_data_for_active_target(target_id).is_some()
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    /// Drops all per-target state, as when the watch stream restarts.
    pub fn reset(&mut self) {
        self.target_states.clear();
        self.pending_document_updates.clear();
        self.pending_document_target_mapping.clear();
        self.pending_target_resets.clear();
    }
}
