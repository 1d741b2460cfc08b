use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use futures::channel::oneshot;

use crate::firestore::constants::{BATCH_ID_UNKNOWN, LOG_TAG_CORE};
use crate::firestore::core::event_manager::QueryTargetRegistry;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::view::{LimboDocumentChange, View, ViewDocumentChanges};
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::core::{Query, Target, TargetId};
use crate::firestore::error::{cancelled, internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{
    DocumentMap, LocalStore, LocalViewChanges, TargetData, TargetPurpose,
};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatch, MutationBatchResult,
    SnapshotVersion, User,
};
use crate::firestore::remote::{OnlineState, RemoteEvent, RemoteSyncer};

/// Resolves once a write is acknowledged or rejected by the backend.
pub type WriteCompletion = oneshot::Receiver<FirestoreResult<()>>;

type CompletionSender = oneshot::Sender<FirestoreResult<()>>;

/// Work the sync engine asks of the remote store.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteCommand {
    Listen(TargetData),
    Unlisten(TargetId),
    /// New local writes are ready to be sent.
    FillWritePipeline,
}

/// Notifications for the event manager.
#[derive(Clone, Debug)]
pub enum SyncEngineEvent {
    Snapshots(Vec<ViewSnapshot>),
    QueryError(Query, FirestoreError),
    OnlineStateChanged(OnlineState),
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

#[derive(Clone, Debug)]
struct LimboResolution {
    key: DocumentKey,
    /// Whether the limbo target has delivered the document. Until it has,
    /// the target contributes no remote keys.
    received_document: bool,
}

/// Coordinates the local store, the views of active queries and the remote
/// store.
///
/// Local writes flow into the local store and out to the write pipeline;
/// remote events flow into the local store and back out as view snapshots.
/// Documents a synced view shows but the backend no longer reports are in
/// limbo and get resolved with single-document targets, at most
/// `max_concurrent_limbo_resolutions` at a time.
pub struct SyncEngine {
    local_store: LocalStore,
    current_user: User,
    online_state: OnlineState,
    max_concurrent_limbo_resolutions: usize,

    query_views_by_query: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,

    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Views (by target id) currently holding each limbo document.
    limbo_document_refs: crate::firestore::local::ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,

    mutation_user_callbacks: HashMap<String, BTreeMap<BatchId, CompletionSender>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<CompletionSender>>,

    remote_commands: Vec<RemoteCommand>,
    events: Vec<SyncEngineEvent>,
}

impl SyncEngine {
    pub fn new(local_store: LocalStore, max_concurrent_limbo_resolutions: usize) -> Self {
        let current_user = local_store.user().clone();
        Self {
            local_store,
            current_user,
            online_state: OnlineState::Unknown,
            max_concurrent_limbo_resolutions,
            query_views_by_query: BTreeMap::new(),
            queries_by_target: BTreeMap::new(),
            enqueued_limbo_resolutions: VecDeque::new(),
            active_limbo_targets_by_key: BTreeMap::new(),
            active_limbo_resolutions_by_target: BTreeMap::new(),
            limbo_document_refs: crate::firestore::local::ReferenceSet::new(),
            limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
            mutation_user_callbacks: HashMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            remote_commands: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local_store
    }

    pub fn local_store_mut(&mut self) -> &mut LocalStore {
        &mut self.local_store
    }

    pub fn current_user(&self) -> &User {
        &self.current_user
    }

    pub fn take_remote_commands(&mut self) -> Vec<RemoteCommand> {
        std::mem::take(&mut self.remote_commands)
    }

    pub fn take_events(&mut self) -> Vec<SyncEngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Keys with an active limbo resolution target, by target id.
    pub fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.active_limbo_targets_by_key.clone()
    }

    pub fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.enqueued_limbo_resolutions.iter().cloned().collect()
    }

    pub fn target_id_for_query(&self, query: &Query) -> Option<TargetId> {
        self.query_views_by_query
            .get(&query.canonical_id())
            .map(|query_view| query_view.target_id)
    }

    /// Starts tracking `query` and returns its first snapshot, computed from
    /// the local cache. Queries with the same target share one listen.
    pub fn listen(&mut self, query: &Query, should_listen_to_remote: bool) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        if let Some(query_view) = self.query_views_by_query.get(&canonical_id) {
            return Ok(query_view.view.compute_initial_snapshot());
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let target_id = target_data.target_id;
        let current = self
            .queries_by_target
            .get(&target_id)
            .and_then(|queries| queries.first())
            .and_then(|shared| self.query_views_by_query.get(&shared.canonical_id()))
            .map_or(false, |shared| shared.view.is_current());

        let snapshot = self.initialize_view_and_compute_snapshot(
            query,
            target_id,
            current,
            target_data.resume_token.clone(),
        )?;

        if should_listen_to_remote {
            self.remote_commands.push(RemoteCommand::Listen(target_data));
        }
        Ok(snapshot)
    }

    fn initialize_view_and_compute_snapshot(
        &mut self,
        query: &Query,
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);
        let synthesized = crate::firestore::remote::TargetChange::synthesized(
            current && self.online_state != OnlineState::Offline,
            resume_token,
        );
        let view_change = view.apply_changes(doc_changes, true, Some(&synthesized), false);
        self.update_tracked_limbos(target_id, view_change.limbo_changes);

        let snapshot = view_change
            .snapshot
            .ok_or_else(|| internal_error("A new view always produces an initial snapshot"))?;

        self.query_views_by_query.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        self.queries_by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());
        Ok(snapshot)
    }

    /// Stops tracking `query`, releasing its target once no other query
    /// shares it.
    pub fn unlisten(&mut self, query: &Query, should_unlisten_to_remote: bool) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let query_view = self.query_views_by_query.remove(&canonical_id).ok_or_else(|| {
            internal_error(format!("Trying to unlisten on query not found: {canonical_id}"))
        })?;
        let target_id = query_view.target_id;

        if let Some(queries) = self.queries_by_target.get_mut(&target_id) {
            if queries.len() > 1 {
                queries.retain(|other| other.canonical_id() != canonical_id);
                return Ok(());
            }
        }

        self.local_store.release_target(target_id)?;
        if should_unlisten_to_remote {
            self.remote_commands.push(RemoteCommand::Unlisten(target_id));
        }
        self.remove_and_cleanup_target(target_id, None);
        Ok(())
    }

    /// Queues `mutations` as one batch, raises latency-compensated snapshots
    /// and returns a completion that resolves when the backend responds.
    pub fn write(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<WriteCompletion> {
        let result = self.local_store.write(mutations)?;
        let (sender, receiver) = oneshot::channel();
        self.mutation_user_callbacks
            .entry(self.current_user.to_key())
            .or_default()
            .insert(result.batch_id, sender);

        self.emit_new_snaps_and_notify_local_store(&result.changes, None)?;
        self.remote_commands.push(RemoteCommand::FillWritePipeline);
        Ok(receiver)
    }

    /// Resolves once every write queued so far has been acknowledged or
    /// rejected.
    pub fn wait_for_pending_writes(&mut self) -> WriteCompletion {
        let (sender, receiver) = oneshot::channel();
        let highest_batch_id = self.local_store.highest_unacknowledged_batch_id();
        if highest_batch_id == BATCH_ID_UNKNOWN {
            let _ = sender.send(Ok(()));
        } else {
            self.pending_writes_callbacks
                .entry(highest_batch_id)
                .or_default()
                .push(sender);
        }
        receiver
    }

    fn process_user_callback(&mut self, batch_id: BatchId, result: FirestoreResult<()>) {
        let user_key = self.current_user.to_key();
        if let Some(callbacks) = self.mutation_user_callbacks.get_mut(&user_key) {
            if let Some(sender) = callbacks.remove(&batch_id) {
                let _ = sender.send(result);
            }
        }
    }

    fn trigger_pending_writes_callbacks(&mut self, batch_id: BatchId) {
        let resolved: Vec<BatchId> = self
            .pending_writes_callbacks
            .range(..=batch_id)
            .map(|(highest, _)| *highest)
            .collect();
        for highest in resolved {
            if let Some(callbacks) = self.pending_writes_callbacks.remove(&highest) {
                for sender in callbacks {
                    let _ = sender.send(Ok(()));
                }
            }
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&mut self, message: &str) {
        for (_, callbacks) in std::mem::take(&mut self.pending_writes_callbacks) {
            for sender in callbacks {
                let _ = sender.send(Err(cancelled(message)));
            }
        }
    }

    fn remove_and_cleanup_target(&mut self, target_id: TargetId, error: Option<FirestoreError>) {
        for query in self.queries_by_target.remove(&target_id).unwrap_or_default() {
            self.query_views_by_query.remove(&query.canonical_id());
            if let Some(error) = &error {
                self.events
                    .push(SyncEngineEvent::QueryError(query, error.clone()));
            }
        }

        for key in self.limbo_document_refs.remove_references_for_id(target_id) {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(&key);
            }
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey) {
        self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        if let Some(limbo_target_id) = self.active_limbo_targets_by_key.remove(key) {
            self.remote_commands
                .push(RemoteCommand::Unlisten(limbo_target_id));
            self.active_limbo_resolutions_by_target
                .remove(&limbo_target_id);
            self.pump_enqueued_limbo_resolutions();
        }
    }

    fn update_tracked_limbos(&mut self, target_id: TargetId, changes: Vec<LimboDocumentChange>) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs
                        .add_reference(key.clone(), target_id);
                    self.track_limbo_change(key);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!(target: LOG_TAG_CORE, "Document no longer in limbo: {key}");
                    self.limbo_document_refs.remove_reference(&key, target_id);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey) {
        if !self.active_limbo_targets_by_key.contains_key(&key)
            && !self.enqueued_limbo_resolutions.contains(&key)
        {
            log::debug!(target: LOG_TAG_CORE, "New document in limbo: {key}");
            self.enqueued_limbo_resolutions.push_back(key);
            self.pump_enqueued_limbo_resolutions();
        }
    }

    /// Starts queued limbo resolutions while below the concurrency cap.
    fn pump_enqueued_limbo_resolutions(&mut self) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = self.limbo_target_id_generator.next_id();
            self.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key
                .insert(key.clone(), limbo_target_id);
            self.remote_commands.push(RemoteCommand::Listen(TargetData::new(
                Target::for_document(&key),
                limbo_target_id,
                TargetPurpose::LimboResolution,
                0,
            )));
        }
    }

    /// Recomputes every view against `changes` and raises the resulting
    /// snapshots.
    fn emit_new_snaps_and_notify_local_store(
        &mut self,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let mut new_snapshots = Vec::new();
        let mut local_view_changes = Vec::new();
        let mut limbo_updates = Vec::new();

        for query_view in self.query_views_by_query.values_mut() {
            let target_id = query_view.target_id;
            let mut doc_changes: ViewDocumentChanges =
                query_view.view.compute_doc_changes(changes, None);
            if doc_changes.needs_refill {
                // A limit query lost documents at its edge; re-run it so that
                // documents past the old limit can move in.
                let result = self
                    .local_store
                    .execute_query(&query_view.query, false)?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&result.documents, Some(doc_changes));
            }

            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let pending_reset = remote_event
                .map_or(false, |event| event.target_mismatches.contains_key(&target_id));
            let view_change =
                query_view
                    .view
                    .apply_changes(doc_changes, true, target_change, pending_reset);
            limbo_updates.push((target_id, view_change.limbo_changes));

            if let Some(snapshot) = view_change.snapshot {
                local_view_changes.push(LocalViewChanges::from_snapshot(target_id, &snapshot));
                new_snapshots.push(snapshot);
            }
        }

        for (target_id, limbo_changes) in limbo_updates {
            self.update_tracked_limbos(target_id, limbo_changes);
        }
        if !new_snapshots.is_empty() {
            self.events.push(SyncEngineEvent::Snapshots(new_snapshots));
        }
        self.local_store
            .notify_local_view_changes(&local_view_changes)
    }

    /// Builds a snapshot of `query` from the local cache alone, without
    /// registering a target.
    pub fn query_local_cache(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let doc_changes = view.compute_doc_changes(&result.documents, None);
        view.apply_changes(doc_changes, false, None, false)
            .snapshot
            .ok_or_else(|| internal_error("A new view always produces an initial snapshot"))
    }
}

impl QueryTargetRegistry for SyncEngine {
    fn listen(
        &mut self,
        query: &Query,
        should_listen_to_remote: bool,
    ) -> FirestoreResult<Option<ViewSnapshot>> {
        SyncEngine::listen(self, query, should_listen_to_remote).map(Some)
    }

    fn unlisten(&mut self, query: &Query, should_unlisten_to_remote: bool) -> FirestoreResult<()> {
        SyncEngine::unlisten(self, query, should_unlisten_to_remote)
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(limbo) = self.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            let touched = change.added_documents.len()
                + change.modified_documents.len()
                + change.removed_documents.len();
            if touched > 1 {
                return Err(internal_error(
                    "Limbo resolution for a single document contained multiple changes",
                ));
            }
            if !change.added_documents.is_empty() {
                limbo.received_document = true;
            } else if !change.modified_documents.is_empty() {
                if !limbo.received_document {
                    return Err(internal_error(
                        "Received change for limbo target document without add",
                    ));
                }
            } else if !change.removed_documents.is_empty() {
                limbo.received_document = false;
            }
        }

        let changes = self.local_store.apply_remote_event(&event)?;
        self.emit_new_snaps_and_notify_local_store(&changes, Some(&event))
    }

    fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        if let Some(limbo) = self.active_limbo_resolutions_by_target.get(&target_id) {
            // The backend refused to tell us about the document; treat it as
            // deleted so views stop waiting on it.
            let key = limbo.key.clone();
            let event = RemoteEvent {
                snapshot_version: SnapshotVersion::none(),
                document_updates: BTreeMap::from([(
                    key.clone(),
                    MutableDocument::new_no_document(key.clone(), SnapshotVersion::none()),
                )]),
                resolved_limbo_documents: BTreeSet::from([key.clone()]),
                ..Default::default()
            };
            // The mapping stays until the event is applied, so a failure here
            // leaves the target to be rejected again after a watch restart.
            self.apply_remote_event(event)?;

            if self.active_limbo_resolutions_by_target.remove(&target_id).is_some() {
                self.active_limbo_targets_by_key.remove(&key);
                self.pump_enqueued_limbo_resolutions();
            }
            return Ok(());
        }

        log::warn!(
            target: LOG_TAG_CORE,
            "Listen for target {target_id} rejected: {error}"
        );
        if self.local_store.is_target_active(target_id) {
            self.local_store.release_target(target_id)?;
        }
        self.remove_and_cleanup_target(target_id, Some(error));
        Ok(())
    }

    fn apply_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(&result)?;
        self.process_user_callback(batch_id, Ok(()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(&changes, None)
    }

    fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let changes = self.local_store.reject_batch(batch_id)?;
        self.process_user_callback(batch_id, Err(error));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(&changes, None)
    }

    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        if let Some(limbo) = self.active_limbo_resolutions_by_target.get(&target_id) {
            if limbo.received_document {
                return BTreeSet::from([limbo.key.clone()]);
            }
            return BTreeSet::new();
        }

        let mut keys = BTreeSet::new();
        for query in self.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = self.query_views_by_query.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.local_store.last_remote_snapshot_version()
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        let snapshots: Vec<ViewSnapshot> = self
            .query_views_by_query
            .values_mut()
            .filter_map(|query_view| query_view.view.apply_online_state_change(online_state).snapshot)
            .collect();
        self.events
            .push(SyncEngineEvent::OnlineStateChanged(online_state));
        if !snapshots.is_empty() {
            self.events.push(SyncEngineEvent::Snapshots(snapshots));
        }
    }

    fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        Ok(self.local_store.next_mutation_batch(after_batch_id))
    }

    fn handle_credential_change(&mut self, user: User) -> FirestoreResult<()> {
        if user == self.current_user {
            return Ok(());
        }
        log::debug!(target: LOG_TAG_CORE, "User changed: {user}");

        let result = self.local_store.handle_user_change(user.clone())?;
        self.current_user = user;
        self.reject_outstanding_pending_writes_callbacks(
            "'wait_for_pending_writes' was cancelled by a user change",
        );
        self.emit_new_snaps_and_notify_local_store(&result.affected_documents, None)
    }

    fn last_stream_token(&self) -> Vec<u8> {
        self.local_store.last_stream_token()
    }

    fn set_last_stream_token(&mut self, token: Vec<u8>) -> FirestoreResult<()> {
        self.local_store.set_last_stream_token(token)
    }
}
