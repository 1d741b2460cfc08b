use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::firestore::constants::LOG_TAG_LOCAL;
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::core::{Query, Target, TargetId};
use crate::firestore::error::{internal_error, unavailable, FirestoreResult};
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::mutation_queue::MemoryMutationQueue;
use crate::firestore::local::overlay::OverlayIndex;
use crate::firestore::local::persistence::LocalStorePersistence;
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::remote_document_cache::{DocumentMap, MemoryRemoteDocumentCache};
use crate::firestore::local::target_cache::MemoryTargetCache;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, DocumentKey, FieldMask, MutableDocument, Mutation, MutationBatch,
    MutationBatchResult, SnapshotVersion, Timestamp, User,
};
use crate::firestore::remote::RemoteEvent;

/// Outcome of a local write.
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    /// Local view of every document the batch touched.
    pub changes: DocumentMap,
}

#[derive(Clone, Debug, Default)]
pub struct QueryResult {
    pub documents: DocumentMap,
    /// Keys the backend last reported for the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Sync state of a view, reported back after each snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
}

impl LocalViewChanges {
    pub fn from_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        Self {
            target_id,
            from_cache: snapshot.from_cache,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct UserChangeResult {
    pub affected_documents: DocumentMap,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

/// Local cache of remote documents, pending writes and target metadata.
///
/// All operations are synchronous and expected to run from the client's
/// serialized queue. Every mutation of cached state is forwarded to the
/// configured [`LocalStorePersistence`].
pub struct LocalStore {
    persistence: Arc<dyn LocalStorePersistence>,
    started: bool,
    user: User,
    mutation_queue: MemoryMutationQueue,
    /// Queues of users other than the current one, keyed by [`User::to_key`].
    inactive_queues: HashMap<String, MemoryMutationQueue>,
    remote_documents: MemoryRemoteDocumentCache,
    target_cache: MemoryTargetCache,
    overlays: OverlayIndex,
    query_engine: QueryEngine,
    active_targets: BTreeSet<TargetId>,
}

impl LocalStore {
    pub fn new(persistence: Arc<dyn LocalStorePersistence>, user: User) -> Self {
        Self {
            persistence,
            started: false,
            user,
            mutation_queue: MemoryMutationQueue::new(),
            inactive_queues: HashMap::new(),
            remote_documents: MemoryRemoteDocumentCache::new(),
            target_cache: MemoryTargetCache::new(),
            overlays: OverlayIndex::new(),
            query_engine: QueryEngine::new(),
            active_targets: BTreeSet::new(),
        }
    }

    /// Restores cached state from persistence and accepts operations.
    pub fn start(&mut self) -> FirestoreResult<()> {
        self.persistence.check_available()?;
        let mut state = self.persistence.load()?;

        for (_, document) in std::mem::take(&mut state.documents) {
            let read_time = document.read_time();
            self.remote_documents.add(document, read_time);
        }

        let mut queues = HashMap::new();
        for (user_key, batches) in std::mem::take(&mut state.batches) {
            let token = state.stream_tokens.remove(&user_key).unwrap_or_default();
            queues.insert(user_key, MemoryMutationQueue::restore(batches, token));
        }
        for (user_key, token) in std::mem::take(&mut state.stream_tokens) {
            queues
                .entry(user_key)
                .or_insert_with(|| MemoryMutationQueue::restore(Vec::new(), token));
        }
        self.mutation_queue = queues.remove(&self.user.to_key()).unwrap_or_default();
        self.inactive_queues = queues;
        self.overlays = OverlayIndex::from_batches(self.mutation_queue.all_batches());

        for (target_id, target_data) in std::mem::take(&mut state.targets) {
            self.target_cache.save_target_data(target_data);
            if let Some(keys) = state.target_keys.get(&target_id) {
                self.target_cache.add_matching_keys(keys, target_id);
            }
        }
        self.target_cache
            .set_last_remote_snapshot_version(state.last_remote_snapshot_version);

        self.started = true;
        log::debug!(
            target: LOG_TAG_LOCAL,
            "Local store started for {} with {} documents, {} pending batches and {} targets",
            self.user,
            self.remote_documents.len(),
            self.mutation_queue.len(),
            self.target_cache.target_count()
        );
        Ok(())
    }

    /// Stops accepting operations. Later calls fail with `unavailable`.
    pub fn shutdown(&mut self) {
        self.started = false;
        self.active_targets.clear();
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    fn ensure_started(&self) -> FirestoreResult<()> {
        if self.started {
            Ok(())
        } else {
            Err(unavailable("The local store is not running"))
        }
    }

    fn ensure_writable(&self) -> FirestoreResult<()> {
        self.ensure_started()?;
        self.persistence.check_available()
    }

    fn documents_view(&self) -> LocalDocumentsView<'_> {
        LocalDocumentsView::new(&self.remote_documents, &self.overlays)
    }

    /// Queues `mutations` as one batch and returns the resulting local view.
    pub fn write(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        self.ensure_writable()?;

        let keys: BTreeSet<DocumentKey> = mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect();
        let existing = self.documents_view().get_documents(&keys);

        // Non-idempotent transforms record the value they read, so replaying
        // the batch on newer remote state keeps the original result.
        let base_mutations: Vec<Mutation> = mutations
            .iter()
            .filter_map(|mutation| {
                let document = existing.get(mutation.key())?;
                let base = mutation.extract_base_value(document)?;
                let mask = FieldMask::new(base.leaf_paths());
                Some(Mutation::patch(mutation.key().clone(), base, mask))
            })
            .collect();

        let batch = self
            .mutation_queue
            .new_batch(Timestamp::now(), base_mutations, mutations);
        // Nothing is queued unless the batch was persisted.
        self.persistence.save_batch(&self.user, &batch)?;
        let batch_id = batch.batch_id;
        self.overlays.add_batch(&batch);
        self.mutation_queue.add_batch(batch)?;

        log::debug!(
            target: LOG_TAG_LOCAL,
            "Queued batch {batch_id} touching {} documents",
            keys.len()
        );
        Ok(LocalWriteResult {
            batch_id,
            changes: self.documents_view().get_documents(&keys),
        })
    }

    /// Applies the backend's commit of the head batch to the remote cache.
    pub fn acknowledge_batch(&mut self, result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        self.ensure_writable()?;
        let batch = &result.batch;
        let keys = batch.keys();

        for key in &keys {
            let mut document = self.remote_documents.get(key);
            let ack_version = result.doc_versions.get(key).copied().ok_or_else(|| {
                internal_error(format!("Missing acknowledged version for {key}"))
            })?;
            if document.version() < ack_version {
                batch.apply_to_remote_document(&mut document, result)?;
                if document.is_valid_document() {
                    let stored = self.remote_documents.add(document, result.commit_version);
                    self.persistence.save_document(&stored)?;
                }
            }
        }

        self.remove_batch(batch.batch_id)?;
        self.mutation_queue
            .set_last_stream_token(result.stream_token.clone());
        self.persistence
            .save_stream_token(&self.user, &result.stream_token)?;
        Ok(self.documents_view().get_documents(&keys))
    }

    /// Drops a batch the backend refused, rolling back its local effect.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        self.ensure_writable()?;
        let keys = self
            .mutation_queue
            .lookup(batch_id)
            .map(MutationBatch::keys)
            .ok_or_else(|| internal_error(format!("Attempt to reject nonexistent batch {batch_id}")))?;
        self.remove_batch(batch_id)?;
        Ok(self.documents_view().get_documents(&keys))
    }

    fn remove_batch(&mut self, batch_id: BatchId) -> FirestoreResult<()> {
        self.mutation_queue.remove_batch(batch_id)?;
        self.overlays.remove_batch(batch_id);
        self.persistence.remove_batch(&self.user, batch_id)
    }

    /// Applies a consistent watch snapshot. Returns the local view of every
    /// document that changed.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        self.ensure_writable()?;
        let remote_version = event.snapshot_version;

        if !event.target_changes.is_empty() {
            let sequence_number = self.target_cache.next_sequence_number();
            for (target_id, change) in &event.target_changes {
                if !self.active_targets.contains(target_id) {
                    continue;
                }
                let Some(old) = self.target_cache.target_data_for_id(*target_id).cloned() else {
                    continue;
                };

                let mut matching_keys = self.target_cache.matching_keys(*target_id);
                for key in &change.removed_documents {
                    matching_keys.remove(key);
                }
                matching_keys.extend(change.added_documents.iter().cloned());

                let mut updated = old.with_sequence_number(sequence_number);
                if event.target_mismatches.contains_key(target_id) {
                    // Cached results can no longer be trusted; the next listen
                    // starts from scratch.
                    updated = updated
                        .with_resume_token(Vec::new(), SnapshotVersion::none())
                        .with_last_limbo_free_snapshot_version(SnapshotVersion::none());
                } else if !change.resume_token.is_empty() && remote_version >= old.snapshot_version {
                    updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                }

                self.persistence.save_target(&updated)?;
                self.persistence.save_target_keys(*target_id, &matching_keys)?;
                self.target_cache
                    .remove_matching_keys(&change.removed_documents, *target_id);
                self.target_cache
                    .add_matching_keys(&change.added_documents, *target_id);
                self.target_cache.save_target_data(updated);
            }
        }

        let mut changed_keys = BTreeSet::new();
        for (key, document) in &event.document_updates {
            let existing = self.remote_documents.get(key);
            if document.is_no_document() && document.version().is_none() {
                // Synthesized deletion: access to the document was lost.
                self.persistence.remove_document(key)?;
                self.remote_documents.remove(key);
                changed_keys.insert(key.clone());
            } else if !existing.is_valid_document()
                || document.version() > existing.version()
                || (document.version() == existing.version() && existing.has_pending_writes())
            {
                let stored = document.clone().with_read_time(remote_version);
                self.persistence.save_document(&stored)?;
                self.remote_documents.add(stored, remote_version);
                changed_keys.insert(key.clone());
            } else {
                log::debug!(
                    target: LOG_TAG_LOCAL,
                    "Ignoring outdated watch update for {key}. Current version: {}, watch version: {}",
                    existing.version(),
                    document.version()
                );
            }
        }

        if !remote_version.is_none() {
            let last = self.target_cache.last_remote_snapshot_version();
            if remote_version < last {
                log::warn!(
                    target: LOG_TAG_LOCAL,
                    "Watch snapshot {remote_version} is older than the last applied snapshot {last}"
                );
            } else {
                self.persistence
                    .save_last_remote_snapshot_version(remote_version)?;
                self.target_cache.set_last_remote_snapshot_version(remote_version);
            }
        }

        Ok(self.documents_view().get_documents(&changed_keys))
    }

    /// Runs `query` against the local cache. With `use_previous_results`,
    /// the target's last known result narrows the scan.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        self.ensure_started()?;
        let target_data = self.target_cache.get_target_data(&query.to_target());
        let (last_limbo_free, remote_keys) = match target_data {
            Some(target_data) => (
                if use_previous_results {
                    target_data.last_limbo_free_snapshot_version
                } else {
                    SnapshotVersion::none()
                },
                self.target_cache.matching_keys(target_data.target_id),
            ),
            None => (SnapshotVersion::none(), BTreeSet::new()),
        };

        let view = self.documents_view();
        let documents = self
            .query_engine
            .get_documents_matching_query(&view, query, last_limbo_free, &remote_keys);
        Ok(QueryResult {
            documents,
            remote_keys,
        })
    }

    /// Local view of `key`, with pending writes applied.
    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        self.ensure_started()?;
        Ok(self.documents_view().get_document(key))
    }

    pub fn local_documents<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
    ) -> FirestoreResult<DocumentMap> {
        self.ensure_started()?;
        Ok(self.documents_view().get_documents(keys))
    }

    /// Returns the target's metadata, assigning a new target id the first
    /// time `target` is seen.
    pub fn allocate_target(&mut self, target: Target) -> FirestoreResult<TargetData> {
        self.ensure_writable()?;
        let target_data = match self.target_cache.get_target_data(&target) {
            Some(existing) => existing.clone(),
            None => {
                let target_id = self.target_cache.allocate_target_id();
                let sequence_number = self.target_cache.next_sequence_number();
                let target_data =
                    TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number);
                self.persistence.save_target(&target_data)?;
                self.target_cache.save_target_data(target_data.clone());
                target_data
            }
        };
        self.active_targets.insert(target_data.target_id);
        Ok(target_data)
    }

    /// Stops tracking `target_id` as active. Its metadata, including the
    /// resume token, stays cached for a later listen.
    pub fn release_target(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        self.ensure_started()?;
        if !self.active_targets.remove(&target_id) {
            return Err(internal_error(format!(
                "Tried to release inactive target {target_id}"
            )));
        }
        Ok(())
    }

    pub fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        self.target_cache.get_target_data(target).cloned()
    }

    pub fn target_data_for_id(&self, target_id: TargetId) -> Option<TargetData> {
        self.target_cache.target_data_for_id(target_id).cloned()
    }

    pub fn is_target_active(&self, target_id: TargetId) -> bool {
        self.active_targets.contains(&target_id)
    }

    pub fn remote_document_keys(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.target_cache.matching_keys(target_id)
    }

    pub fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> Option<MutationBatch> {
        self.mutation_queue.next_batch_after(after_batch_id).cloned()
    }

    pub fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.mutation_queue.highest_unacknowledged_batch_id()
    }

    pub fn pending_batch_ids(&self) -> Vec<BatchId> {
        self.mutation_queue
            .all_batches()
            .map(|batch| batch.batch_id)
            .collect()
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.target_cache.last_remote_snapshot_version()
    }

    /// Advances the limbo-free version of targets whose views are in sync.
    pub fn notify_local_view_changes(&mut self, changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        for change in changes {
            if change.from_cache || !self.active_targets.contains(&change.target_id) {
                continue;
            }
            if let Some(target_data) = self.target_cache.target_data_for_id(change.target_id) {
                let updated = target_data
                    .with_last_limbo_free_snapshot_version(target_data.snapshot_version);
                self.persistence.save_target(&updated)?;
                self.target_cache.save_target_data(updated);
            }
        }
        Ok(())
    }

    pub fn set_last_stream_token(&mut self, token: Vec<u8>) -> FirestoreResult<()> {
        self.ensure_writable()?;
        self.persistence.save_stream_token(&self.user, &token)?;
        self.mutation_queue.set_last_stream_token(token);
        Ok(())
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        self.mutation_queue.last_stream_token().to_vec()
    }

    /// Switches to `user`'s mutation queue. Returns the documents whose
    /// local view may differ because the pending writes changed.
    pub fn handle_user_change(&mut self, user: User) -> FirestoreResult<UserChangeResult> {
        self.ensure_started()?;
        if user == self.user {
            return Ok(UserChangeResult::default());
        }

        let new_queue = self
            .inactive_queues
            .remove(&user.to_key())
            .unwrap_or_default();
        let old_queue = std::mem::replace(&mut self.mutation_queue, new_queue);
        let old_user = std::mem::replace(&mut self.user, user);

        let removed_batch_ids: Vec<BatchId> =
            old_queue.all_batches().map(|batch| batch.batch_id).collect();
        let added_batch_ids = self.pending_batch_ids();

        let mut changed_keys: BTreeSet<DocumentKey> = BTreeSet::new();
        for batch in old_queue.all_batches().chain(self.mutation_queue.all_batches()) {
            changed_keys.extend(batch.keys());
        }
        self.inactive_queues.insert(old_user.to_key(), old_queue);
        self.overlays = OverlayIndex::from_batches(self.mutation_queue.all_batches());

        log::debug!(
            target: LOG_TAG_LOCAL,
            "Switched local store from {old_user} to {}",
            self.user
        );
        Ok(UserChangeResult {
            affected_documents: self.documents_view().get_documents(&changed_keys),
            removed_batch_ids,
            added_batch_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::persistence::{MemoryPersistence, NoopPersistence};
    use crate::firestore::model::{FieldPath, MutationResult, ResourcePath};
    use crate::firestore::remote::TargetChange;
    use crate::firestore::value::{FirestoreValue, MapValue};
    use std::collections::BTreeMap;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(name: &str) -> MapValue {
        MapValue::new(BTreeMap::from([(
            "name".to_string(),
            FirestoreValue::from_string(name),
        )]))
    }

    fn name_of(document: &MutableDocument) -> Option<&FirestoreValue> {
        document.field(&FieldPath::from_dot_separated("name").unwrap())
    }

    fn started_store() -> LocalStore {
        let mut store = LocalStore::new(Arc::new(NoopPersistence), User::unauthenticated());
        store.start().unwrap();
        store
    }

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    fn remote_doc(path: &str, version: i64, name: &str) -> MutableDocument {
        MutableDocument::new_found_document(key(path), SnapshotVersion::from_micros(version), data(name))
    }

    fn event_for(target_id: TargetId, version: i64, docs: Vec<MutableDocument>) -> RemoteEvent {
        let mut change = TargetChange {
            current: true,
            resume_token: format!("token-{version}").into_bytes(),
            ..Default::default()
        };
        change
            .added_documents
            .extend(docs.iter().map(|doc| doc.key().clone()));
        RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(version),
            target_changes: BTreeMap::from([(target_id, change)]),
            document_updates: docs
                .into_iter()
                .map(|doc| (doc.key().clone(), doc))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn reads_own_writes_before_acknowledgement() {
        let mut store = started_store();
        let target = store.allocate_target(rooms().to_target()).unwrap();
        store
            .apply_remote_event(&event_for(target.target_id, 1, vec![remote_doc("rooms/a", 1, "server")]))
            .unwrap();

        let result = store
            .write(vec![Mutation::set(key("rooms/a"), data("local"))])
            .unwrap();
        let local = &result.changes[&key("rooms/a")];
        assert_eq!(name_of(local), Some(&FirestoreValue::from_string("local")));
        assert!(local.has_local_mutations());
        assert_eq!(local.version(), SnapshotVersion::from_micros(1));

        let queried = store.execute_query(&rooms(), false).unwrap();
        assert_eq!(
            name_of(&queried.documents[&key("rooms/a")]),
            Some(&FirestoreValue::from_string("local"))
        );
    }

    #[test]
    fn acknowledgement_commits_and_clears_overlay() {
        let mut store = started_store();
        let write = store
            .write(vec![Mutation::set(key("rooms/a"), data("A"))])
            .unwrap();
        let batch = store.next_mutation_batch(None).unwrap();
        let version = SnapshotVersion::from_micros(5);
        let result = MutationBatchResult::from(
            batch,
            version,
            vec![MutationResult::new(version, Vec::new())],
            b"stream".to_vec(),
        )
        .unwrap();

        let changes = store.acknowledge_batch(&result).unwrap();
        let document = &changes[&key("rooms/a")];
        assert!(document.has_committed_mutations());
        assert!(!document.has_local_mutations());
        assert_eq!(document.version(), version);
        assert_eq!(store.last_stream_token(), b"stream".to_vec());
        assert_eq!(store.highest_unacknowledged_batch_id(), -1);
        assert_eq!(write.batch_id, result.batch.batch_id);
    }

    #[test]
    fn rejection_rolls_back_only_that_batch() {
        let mut store = started_store();
        let first = store
            .write(vec![Mutation::set(key("rooms/a"), data("A"))])
            .unwrap();
        store
            .write(vec![Mutation::set(key("rooms/b"), data("B"))])
            .unwrap();

        let changes = store.reject_batch(first.batch_id).unwrap();
        assert!(!changes[&key("rooms/a")].is_found_document());
        assert!(store.read_document(&key("rooms/b")).unwrap().is_found_document());

        let err = store.reject_batch(99).unwrap_err();
        assert_eq!(err.code_str(), "firestore/internal");
    }

    #[test]
    fn duplicate_remote_event_is_idempotent() {
        let mut store = started_store();
        let target = store.allocate_target(rooms().to_target()).unwrap();
        let event = event_for(target.target_id, 3, vec![remote_doc("rooms/a", 3, "x")]);

        let first = store.apply_remote_event(&event).unwrap();
        let state_after_first = store.read_document(&key("rooms/a")).unwrap();
        let second = store.apply_remote_event(&event).unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(store.read_document(&key("rooms/a")).unwrap(), state_after_first);
        assert_eq!(store.remote_document_keys(target.target_id).len(), 1);
    }

    #[test]
    fn older_versions_do_not_replace_newer_documents() {
        let mut store = started_store();
        let target = store.allocate_target(rooms().to_target()).unwrap();
        store
            .apply_remote_event(&event_for(target.target_id, 5, vec![remote_doc("rooms/a", 5, "new")]))
            .unwrap();
        store
            .apply_remote_event(&event_for(target.target_id, 6, vec![remote_doc("rooms/a", 4, "old")]))
            .unwrap();
        assert_eq!(
            name_of(&store.read_document(&key("rooms/a")).unwrap()),
            Some(&FirestoreValue::from_string("new"))
        );
    }

    #[test]
    fn resume_token_survives_release_and_mismatch_clears_it() {
        let mut store = started_store();
        let target = store.allocate_target(rooms().to_target()).unwrap();
        store
            .apply_remote_event(&event_for(target.target_id, 2, Vec::new()))
            .unwrap();
        store.release_target(target.target_id).unwrap();

        let relisten = store.allocate_target(rooms().to_target()).unwrap();
        assert_eq!(relisten.target_id, target.target_id);
        assert_eq!(relisten.resume_token, b"token-2".to_vec());

        let mut mismatch = event_for(target.target_id, 3, Vec::new());
        mismatch
            .target_mismatches
            .insert(target.target_id, TargetPurpose::ExistenceFilterMismatch);
        store.apply_remote_event(&mismatch).unwrap();
        assert!(store
            .target_data_for_id(target.target_id)
            .unwrap()
            .resume_token
            .is_empty());
    }

    #[test]
    fn unavailable_persistence_rejects_writes() {
        let persistence = MemoryPersistence::new();
        let mut store = LocalStore::new(Arc::new(persistence.clone()), User::unauthenticated());
        store.start().unwrap();
        persistence.set_available(false);
        let err = store
            .write(vec![Mutation::delete(key("rooms/a"))])
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/unavailable");

        persistence.set_available(true);
        assert!(store.write(vec![Mutation::delete(key("rooms/a"))]).is_ok());

        store.shutdown();
        assert_eq!(
            store.read_document(&key("rooms/a")).unwrap_err().code_str(),
            "firestore/unavailable"
        );
    }

    /// Persistence whose next `save_batch` and `save_document` calls fail.
    #[derive(Default)]
    struct FlakySaves {
        fail_batch: std::sync::atomic::AtomicBool,
        fail_document: std::sync::atomic::AtomicBool,
    }

    impl LocalStorePersistence for FlakySaves {
        fn save_batch(&self, _user: &User, _batch: &MutationBatch) -> FirestoreResult<()> {
            if self.fail_batch.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(unavailable("disk busy"));
            }
            Ok(())
        }

        fn save_document(&self, _document: &MutableDocument) -> FirestoreResult<()> {
            if self.fail_document.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(unavailable("disk busy"));
            }
            Ok(())
        }
    }

    #[test]
    fn failed_batch_save_leaves_nothing_queued() {
        let persistence = Arc::new(FlakySaves::default());
        persistence.fail_batch.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut store = LocalStore::new(persistence, User::unauthenticated());
        store.start().unwrap();

        let increment = vec![Mutation::set(key("rooms/a"), data("once"))];
        let err = store.write(increment.clone()).unwrap_err();
        assert_eq!(err.code_str(), "firestore/unavailable");
        assert!(store.pending_batch_ids().is_empty());
        assert!(store.next_mutation_batch(None).is_none());
        assert!(!store.read_document(&key("rooms/a")).unwrap().is_found_document());

        let result = store.write(increment).unwrap();
        assert_eq!(result.batch_id, 1);
        assert_eq!(store.pending_batch_ids(), vec![1]);
    }

    #[test]
    fn failed_document_save_keeps_remote_cache_unchanged() {
        let persistence = Arc::new(FlakySaves::default());
        let mut store = LocalStore::new(persistence.clone(), User::unauthenticated());
        store.start().unwrap();
        let target = store.allocate_target(rooms().to_target()).unwrap();

        persistence.fail_document.store(true, std::sync::atomic::Ordering::SeqCst);
        let event = event_for(target.target_id, 3, vec![remote_doc("rooms/a", 3, "server")]);
        assert!(store.apply_remote_event(&event).is_err());
        assert!(!store.read_document(&key("rooms/a")).unwrap().is_found_document());
        assert_eq!(store.last_remote_snapshot_version(), SnapshotVersion::none());

        let changed = store.apply_remote_event(&event).unwrap();
        assert!(changed[&key("rooms/a")].is_found_document());
        assert_eq!(store.remote_document_keys(target.target_id).len(), 1);
        assert_eq!(store.last_remote_snapshot_version(), SnapshotVersion::from_micros(3));
    }

    #[test]
    fn restart_restores_pending_writes_and_targets() {
        let persistence = MemoryPersistence::new();
        let mut store = LocalStore::new(Arc::new(persistence.clone()), User::unauthenticated());
        store.start().unwrap();
        let target = store.allocate_target(rooms().to_target()).unwrap();
        store
            .apply_remote_event(&event_for(target.target_id, 2, vec![remote_doc("rooms/a", 2, "x")]))
            .unwrap();
        store
            .write(vec![Mutation::set(key("rooms/b"), data("pending"))])
            .unwrap();

        let mut restarted = LocalStore::new(Arc::new(persistence), User::unauthenticated());
        restarted.start().unwrap();
        assert_eq!(restarted.pending_batch_ids(), vec![1]);
        assert!(restarted
            .read_document(&key("rooms/b"))
            .unwrap()
            .has_local_mutations());
        let restored = restarted.get_target_data(&rooms().to_target()).unwrap();
        assert_eq!(restored.resume_token, b"token-2".to_vec());
        assert_eq!(restarted.remote_document_keys(restored.target_id).len(), 1);
        assert_eq!(restarted.last_remote_snapshot_version(), SnapshotVersion::from_micros(2));
    }

    #[test]
    fn user_change_swaps_pending_batches() {
        let mut store = started_store();
        store
            .write(vec![Mutation::set(key("rooms/a"), data("anon"))])
            .unwrap();

        let result = store.handle_user_change(User::authenticated("alice")).unwrap();
        assert_eq!(result.removed_batch_ids, vec![1]);
        assert!(result.added_batch_ids.is_empty());
        assert!(!result.affected_documents[&key("rooms/a")].is_found_document());

        let back = store.handle_user_change(User::unauthenticated()).unwrap();
        assert_eq!(back.added_batch_ids, vec![1]);
        assert!(store.read_document(&key("rooms/a")).unwrap().is_found_document());
    }
}
