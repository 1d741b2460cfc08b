use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::firestore::constants::{LOG_TAG_REMOTE, MAX_PENDING_WRITES};
use crate::firestore::core::TargetId;
use crate::firestore::error::{
    is_permanent_error, is_permanent_write_error, unavailable, FirestoreError, FirestoreResult,
};
use crate::firestore::local::TargetData;
use crate::firestore::model::{DatabaseId, DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion, User};
use crate::firestore::remote::connection::StreamKind;
use crate::firestore::remote::online_state::{OnlineState, OnlineStateTracker};
use crate::firestore::remote::persistent_stream::{
    PersistentStream, StreamAction, StreamGeneration,
};
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::watch_change::{decode_watch_change, TargetChangeState, WatchChange};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::util::backoff::BackoffConfig;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteStoreSettings {
    pub backoff: BackoffConfig,
    /// Time an unused stream stays open before it is closed.
    pub idle_timeout: Duration,
    /// Time to wait for the first watch stream before reporting offline.
    pub online_state_timeout: Duration,
    pub max_pending_writes: usize,
}

impl Default for RemoteStoreSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            online_state_timeout: DEFAULT_ONLINE_STATE_TIMEOUT,
            max_pending_writes: MAX_PENDING_WRITES,
        }
    }
}

/// Reasons the network is disabled. The network is used only while the set
/// is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    Shutdown,
}

/// Answers the aggregator's questions from the listen targets and the
/// syncer's view of the remote documents.
struct ListenTargetsMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for ListenTargetsMetadata<'_> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.remote_keys_for_target(target_id)
    }

    fn target_data_for_active_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

/// Keeps the watch and write streams in sync with the targets and mutation
/// batches the sync engine wants on the backend.
///
/// The store is sans-IO: methods take the [`RemoteSyncer`] to report results
/// to, and the I/O to perform is collected as [`StreamAction`]s for the
/// driver. Stream events come back tagged with the generation they were
/// produced for.
#[derive(Debug)]
pub struct RemoteStore {
    serializer: JsonProtoSerializer,
    settings: RemoteStoreSettings,
    /// Targets that should be listened to. Updated with resume tokens as
    /// snapshots arrive.
    listen_targets: BTreeMap<TargetId, TargetData>,
    watch_change_aggregator: Option<WatchChangeAggregator>,
    watch_stream: PersistentStream,
    write_stream: PersistentStream,
    /// Batches sent or about to be sent, oldest first.
    write_pipeline: VecDeque<MutationBatch>,
    handshake_complete: bool,
    stream_token: Vec<u8>,
    offline_causes: BTreeSet<OfflineCause>,
    online_state_tracker: OnlineStateTracker,
    actions: Vec<StreamAction>,
}

impl RemoteStore {
    pub fn new(database_id: DatabaseId, settings: RemoteStoreSettings) -> Self {
        let watch_stream =
            PersistentStream::new(StreamKind::Listen, settings.backoff, settings.idle_timeout);
        let write_stream =
            PersistentStream::new(StreamKind::Write, settings.backoff, settings.idle_timeout);
        Self {
            serializer: JsonProtoSerializer::new(database_id),
            settings,
            listen_targets: BTreeMap::new(),
            watch_change_aggregator: None,
            watch_stream,
            write_stream,
            write_pipeline: VecDeque::new(),
            handshake_complete: false,
            stream_token: Vec::new(),
            offline_causes: BTreeSet::new(),
            online_state_tracker: OnlineStateTracker::new(),
            actions: Vec::new(),
        }
    }

    pub fn serializer(&self) -> &JsonProtoSerializer {
        &self.serializer
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state_tracker.state()
    }

    pub fn listen_targets(&self) -> &BTreeMap<TargetId, TargetData> {
        &self.listen_targets
    }

    pub fn write_pipeline_len(&self) -> usize {
        self.write_pipeline.len()
    }

    /// Generation of the current open attempt of the `kind` stream.
    pub fn stream_generation(&self, kind: StreamKind) -> StreamGeneration {
        match kind {
            StreamKind::Listen => self.watch_stream.generation(),
            StreamKind::Write => self.write_stream.generation(),
        }
    }

    pub fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    /// Drains the I/O queued by the last calls.
    pub fn take_actions(&mut self) -> Vec<StreamAction> {
        let mut actions = std::mem::take(&mut self.actions);
        actions.extend(self.watch_stream.take_actions());
        actions.extend(self.write_stream.take_actions());
        actions
    }

    pub fn start(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        self.stream_token = syncer.last_stream_token();
        self.enable_network(syncer)
    }

    pub fn enable_network(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        self.offline_causes.remove(&OfflineCause::UserDisabled);
        let result = self.enable_network_internal(syncer);
        self.raise_online_state_changes(syncer);
        result
    }

    fn enable_network_internal(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else {
            self.online_state_tracker.set(OnlineState::Unknown);
        }
        self.fill_write_pipeline(syncer)
    }

    /// Stops both streams and reports the client offline until
    /// [`RemoteStore::enable_network`] is called.
    pub fn disable_network(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.offline_causes.insert(OfflineCause::UserDisabled);
        self.disable_network_internal();
        self.online_state_tracker.set(OnlineState::Offline);
        self.raise_online_state_changes(syncer);
    }

    fn disable_network_internal(&mut self) {
        self.write_stream.stop();
        self.watch_stream.stop();
        if !self.write_pipeline.is_empty() {
            log::debug!(
                target: LOG_TAG_REMOTE,
                "Stopping write stream with {} pending writes",
                self.write_pipeline.len()
            );
            self.write_pipeline.clear();
        }
        self.clean_up_watch_stream_state();
    }

    pub fn shutdown(&mut self) {
        log::debug!(target: LOG_TAG_REMOTE, "RemoteStore shutting down");
        self.offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal();
        // Shutdown is silent; listeners are torn down separately.
        self.online_state_tracker.set(OnlineState::Unknown);
        self.online_state_tracker.take_changes();
    }

    /// Starts listening to `target_data`, opening the watch stream if needed.
    pub fn listen(&mut self, syncer: &mut dyn RemoteSyncer, target_data: TargetData) {
        let target_id = target_data.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return;
        }
        self.listen_targets.insert(target_id, target_data.clone());

        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else if self.watch_stream.is_open() {
            self.send_watch_request(syncer, target_data);
        }
        self.raise_online_state_changes(syncer);
    }

    pub fn unlisten(&mut self, syncer: &mut dyn RemoteSyncer, target_id: TargetId) {
        if self.listen_targets.remove(&target_id).is_none() {
            log::debug!(target: LOG_TAG_REMOTE, "Unlisten for unknown target {target_id}");
            return;
        }
        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id);
        }
        if self.listen_targets.is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle();
            } else if self.can_use_network() {
                // No listens left and no stream to report on.
                self.online_state_tracker.set(OnlineState::Unknown);
            }
        }
        self.raise_online_state_changes(syncer);
    }

    fn send_watch_request(&mut self, syncer: &dyn RemoteSyncer, target_data: TargetData) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let resumed = !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_none();
        let target_data = if resumed {
            let expected_count = syncer.remote_keys_for_target(target_id).len() as i32;
            target_data.with_expected_count(Some(expected_count))
        } else {
            target_data
        };
        match self.serializer.encode_listen_request(&target_data) {
            Ok(request) => self.watch_stream.send(request),
            Err(err) => {
                log::warn!(target: LOG_TAG_REMOTE, "Failed to encode target {target_id}: {err}");
            }
        }
    }

    fn send_unwatch_request(&mut self, target_id: TargetId) {
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let request = self.serializer.encode_unlisten_request(target_id);
        self.watch_stream.send(request);
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.is_started() && !self.listen_targets.is_empty()
    }

    fn start_watch_stream(&mut self) {
        self.watch_change_aggregator = Some(WatchChangeAggregator::new(
            self.serializer.database_id().clone(),
        ));
        self.watch_stream.start();
        if self.online_state_tracker.handle_watch_stream_start() {
            self.actions.push(StreamAction::ScheduleOnlineStateTimeout {
                delay: self.settings.online_state_timeout,
            });
        }
    }

    fn clean_up_watch_stream_state(&mut self) {
        self.watch_change_aggregator = None;
    }

    pub fn handle_online_state_timeout(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.online_state_tracker.handle_online_state_timeout();
        self.raise_online_state_changes(syncer);
    }

    pub fn handle_watch_stream_open(&mut self, syncer: &mut dyn RemoteSyncer, generation: StreamGeneration) {
        if !self.watch_stream.handle_stream_open(generation) {
            return;
        }
        let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
        for target_data in targets {
            self.send_watch_request(syncer, target_data);
        }
    }

    pub fn handle_watch_stream_message(
        &mut self,
        syncer: &mut dyn RemoteSyncer,
        generation: StreamGeneration,
        message: &JsonValue,
    ) -> FirestoreResult<()> {
        if !self.watch_stream.handle_stream_message(generation) {
            return Ok(());
        }
        // Any data from the backend means the client is online.
        self.online_state_tracker.set(OnlineState::Online);

        let change = match decode_watch_change(&self.serializer, message) {
            Ok(Some(change)) => change,
            Ok(None) => {
                self.raise_online_state_changes(syncer);
                return Ok(());
            }
            Err(err) => {
                log::warn!(target: LOG_TAG_REMOTE, "Closing watch stream after bad frame: {err}");
                self.handle_watch_stream_close(syncer, generation, err);
                return Ok(());
            }
        };

        let result = self.apply_watch_change(syncer, change);
        self.raise_online_state_changes(syncer);
        result
    }

    fn apply_watch_change(&mut self, syncer: &mut dyn RemoteSyncer, change: WatchChange) -> FirestoreResult<()> {
        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Remove {
                if let Some(cause) = &target_change.cause {
                    return self.handle_target_error(syncer, &target_change.target_ids, cause.clone());
                }
            }
        }

        let mut snapshot_version = SnapshotVersion::none();
        let Some(aggregator) = self.watch_change_aggregator.as_mut() else {
            return Ok(());
        };
        let metadata = ListenTargetsMetadata {
            listen_targets: &self.listen_targets,
            syncer: &*syncer,
        };
        match change {
            WatchChange::Document(document_change) => {
                aggregator.handle_document_change(&metadata, document_change);
            }
            WatchChange::ExistenceFilter(filter) => {
                aggregator.handle_existence_filter(&metadata, filter);
            }
            WatchChange::TargetChange(target_change) => {
                aggregator.handle_target_change(&metadata, &target_change);
                // A read time addressed to no target marks a consistent snapshot.
                if target_change.target_ids.is_empty() {
                    snapshot_version = target_change.read_time;
                }
            }
        }

        if !snapshot_version.is_none() && snapshot_version >= syncer.last_remote_snapshot_version() {
            self.raise_watch_snapshot(syncer, snapshot_version)?;
        }
        Ok(())
    }

    /// Turns the aggregated changes into a remote event, records the new
    /// resume tokens and re-listens to targets whose existence filter failed.
    fn raise_watch_snapshot(
        &mut self,
        syncer: &mut dyn RemoteSyncer,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let Some(aggregator) = self.watch_change_aggregator.as_mut() else {
            return Ok(());
        };
        let metadata = ListenTargetsMetadata {
            listen_targets: &self.listen_targets,
            syncer: &*syncer,
        };
        let event = aggregator.create_remote_event(&metadata, snapshot_version);

        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.get_mut(target_id) {
                *target_data = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
            }
        }

        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = self.listen_targets.get(target_id).cloned() else {
                continue;
            };
            // Forget the token so the re-listen performs a full query.
            self.listen_targets.insert(
                *target_id,
                target_data.with_resume_token(Vec::new(), target_data.snapshot_version),
            );
            self.send_unwatch_request(*target_id);
            let request = TargetData::new(
                target_data.target.clone(),
                *target_id,
                *purpose,
                target_data.sequence_number,
            );
            self.send_watch_request(&*syncer, request);
        }

        syncer.apply_remote_event(event)
    }

    fn handle_target_error(
        &mut self,
        syncer: &mut dyn RemoteSyncer,
        target_ids: &[TargetId],
        error: FirestoreError,
    ) -> FirestoreResult<()> {
        for target_id in target_ids {
            if self.listen_targets.contains_key(target_id) {
                syncer.reject_listen(*target_id, error.clone())?;
                self.listen_targets.remove(target_id);
                if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
                    aggregator.remove_target(*target_id);
                }
            }
        }
        Ok(())
    }

    /// The watch stream failed to open or ended with `error`.
    pub fn handle_watch_stream_close(
        &mut self,
        syncer: &mut dyn RemoteSyncer,
        generation: StreamGeneration,
        error: FirestoreError,
    ) {
        if !self.watch_stream.handle_stream_close(generation, error.clone()) {
            return;
        }
        self.on_watch_stream_closed(syncer, Some(error));
    }

    fn on_watch_stream_closed(&mut self, syncer: &mut dyn RemoteSyncer, error: Option<FirestoreError>) {
        self.clean_up_watch_stream_state();
        if self.should_start_watch_stream() {
            let error = error.unwrap_or_else(|| unavailable("Watch stream closed"));
            self.online_state_tracker.handle_watch_stream_failure(&error);
            self.start_watch_stream();
        } else {
            self.online_state_tracker.set(OnlineState::Unknown);
        }
        self.raise_online_state_changes(syncer);
    }

    /// Reads more batches from the syncer until the pipeline is full, then
    /// makes sure the write stream runs if there is anything to send.
    pub fn fill_write_pipeline(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        let mut last_batch_id = self.write_pipeline.back().map(|batch| batch.batch_id);
        while self.can_add_to_write_pipeline() {
            match syncer.next_mutation_batch(last_batch_id)? {
                Some(batch) => {
                    last_batch_id = Some(batch.batch_id);
                    self.add_to_write_pipeline(batch);
                }
                None => {
                    if self.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
            }
        }
        if self.should_start_write_stream() {
            self.start_write_stream();
        }
        Ok(())
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < self.settings.max_pending_writes
    }

    fn add_to_write_pipeline(&mut self, batch: MutationBatch) {
        if self.write_stream.is_open() && self.handshake_complete {
            self.send_write_request(&batch);
        }
        self.write_pipeline.push_back(batch);
    }

    fn send_write_request(&mut self, batch: &MutationBatch) {
        match self.serializer.encode_write_request(&self.stream_token, batch) {
            Ok(request) => self.write_stream.send(request),
            Err(err) => log::warn!(
                target: LOG_TAG_REMOTE,
                "Failed to encode batch {}: {err}",
                batch.batch_id
            ),
        }
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.is_started() && !self.write_pipeline.is_empty()
    }

    fn start_write_stream(&mut self) {
        self.handshake_complete = false;
        self.write_stream.start();
    }

    pub fn handle_write_stream_open(&mut self, generation: StreamGeneration) {
        if !self.write_stream.handle_stream_open(generation) {
            return;
        }
        let handshake = self.serializer.encode_write_handshake();
        self.write_stream.send(handshake);
    }

    pub fn handle_write_stream_message(
        &mut self,
        syncer: &mut dyn RemoteSyncer,
        generation: StreamGeneration,
        message: &JsonValue,
    ) -> FirestoreResult<()> {
        if !self.write_stream.handle_stream_message(generation) {
            return Ok(());
        }
        let response = match self.serializer.decode_write_response(message) {
            Ok(response) => response,
            Err(err) => {
                log::warn!(target: LOG_TAG_REMOTE, "Closing write stream after bad frame: {err}");
                self.handle_write_stream_close(syncer, generation, err);
                return Ok(());
            }
        };
        self.stream_token = response.stream_token.clone();

        if !self.handshake_complete {
            self.handshake_complete = true;
            syncer.set_last_stream_token(response.stream_token)?;
            let batches: Vec<MutationBatch> = self.write_pipeline.iter().cloned().collect();
            for batch in &batches {
                self.send_write_request(batch);
            }
            return Ok(());
        }

        let Some(batch) = self.write_pipeline.pop_front() else {
            log::warn!(target: LOG_TAG_REMOTE, "Write response with an empty pipeline");
            return Ok(());
        };
        let commit_version = response.commit_version.unwrap_or_else(SnapshotVersion::none);
        let result = MutationBatchResult::from(
            batch,
            commit_version,
            response.mutation_results,
            response.stream_token,
        )?;
        syncer.apply_successful_write(result)?;
        self.fill_write_pipeline(syncer)
    }

    /// The write stream failed to open or ended with `error`.
    pub fn handle_write_stream_close(
        &mut self,
        syncer: &mut dyn RemoteSyncer,
        generation: StreamGeneration,
        error: FirestoreError,
    ) {
        if !self.write_stream.handle_stream_close(generation, error.clone()) {
            return;
        }
        if let Err(err) = self.on_write_stream_closed(syncer, error) {
            log::warn!(target: LOG_TAG_REMOTE, "Failed to handle write stream error: {err}");
        }
    }

    fn on_write_stream_closed(&mut self, syncer: &mut dyn RemoteSyncer, error: FirestoreError) -> FirestoreResult<()> {
        if self.write_pipeline.is_empty() {
            return Ok(());
        }
        if self.handshake_complete {
            self.handle_write_error(syncer, error)?;
        } else {
            self.handle_handshake_error(syncer, error)?;
        }
        if self.should_start_write_stream() {
            self.start_write_stream();
        }
        Ok(())
    }

    fn handle_write_error(&mut self, syncer: &mut dyn RemoteSyncer, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            return Ok(());
        }
        // The head batch caused the error: drop it and carry on with the rest.
        let Some(batch) = self.write_pipeline.pop_front() else {
            return Ok(());
        };
        self.write_stream.inhibit_backoff();
        syncer.reject_failed_write(batch.batch_id, error)?;
        self.fill_write_pipeline(syncer)
    }

    fn handle_handshake_error(&mut self, syncer: &mut dyn RemoteSyncer, error: FirestoreError) -> FirestoreResult<()> {
        if is_permanent_error(error.code) {
            log::debug!(
                target: LOG_TAG_REMOTE,
                "RemoteStore error before completed handshake; resetting stream token: {error}"
            );
            self.stream_token.clear();
            syncer.set_last_stream_token(Vec::new())?;
        }
        Ok(())
    }

    /// Closes a stream whose idle timer fired.
    pub fn handle_idle_timeout(
        &mut self,
        syncer: &mut dyn RemoteSyncer,
        kind: StreamKind,
        generation: StreamGeneration,
        timer: u64,
    ) {
        match kind {
            StreamKind::Listen => {
                if self.watch_stream.handle_idle_timeout(generation, timer) {
                    self.on_watch_stream_closed(syncer, None);
                }
            }
            StreamKind::Write => {
                self.write_stream.handle_idle_timeout(generation, timer);
            }
        }
    }

    pub fn handle_backoff_elapsed(&mut self, kind: StreamKind, generation: StreamGeneration) {
        match kind {
            StreamKind::Listen => self.watch_stream.handle_backoff_elapsed(generation),
            StreamKind::Write => self.write_stream.handle_backoff_elapsed(generation),
        };
    }

    /// Restarts the streams under the new user's credentials.
    pub fn handle_credential_change(&mut self, syncer: &mut dyn RemoteSyncer, user: User) -> FirestoreResult<()> {
        self.offline_causes.insert(OfflineCause::CredentialChange);
        self.disable_network_internal();
        self.online_state_tracker.set(OnlineState::Unknown);
        let result = syncer.handle_credential_change(user);
        self.offline_causes.remove(&OfflineCause::CredentialChange);
        self.stream_token = syncer.last_stream_token();
        let enabled = self.enable_network_internal(syncer);
        self.raise_online_state_changes(syncer);
        result.and(enabled)
    }

    fn raise_online_state_changes(&mut self, syncer: &mut dyn RemoteSyncer) {
        for state in self.online_state_tracker.take_changes() {
            syncer.apply_online_state_change(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::model::{BatchId, Mutation, ResourcePath, Timestamp};
    use crate::firestore::remote::RemoteEvent;
    use crate::firestore::value::MapValue;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSyncer {
        events: Vec<RemoteEvent>,
        rejected_listens: Vec<(TargetId, FirestoreErrorCode)>,
        acknowledged: Vec<BatchId>,
        rejected_writes: Vec<BatchId>,
        online_states: Vec<OnlineState>,
        batches: Vec<MutationBatch>,
        remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
        stream_token: Vec<u8>,
        last_remote_version: SnapshotVersion,
    }

    impl RemoteSyncer for RecordingSyncer {
        fn apply_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<()> {
            self.last_remote_version = event.snapshot_version;
            self.events.push(event);
            Ok(())
        }

        fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
            self.rejected_listens.push((target_id, error.code));
            Ok(())
        }

        fn apply_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<()> {
            self.batches.retain(|batch| batch.batch_id != result.batch.batch_id);
            self.acknowledged.push(result.batch.batch_id);
            Ok(())
        }

        fn reject_failed_write(&mut self, batch_id: BatchId, _error: FirestoreError) -> FirestoreResult<()> {
            self.batches.retain(|batch| batch.batch_id != batch_id);
            self.rejected_writes.push(batch_id);
            Ok(())
        }

        fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn last_remote_snapshot_version(&self) -> SnapshotVersion {
            self.last_remote_version
        }

        fn apply_online_state_change(&mut self, online_state: OnlineState) {
            self.online_states.push(online_state);
        }

        fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
            Ok(self
                .batches
                .iter()
                .find(|batch| after_batch_id.map_or(true, |after| batch.batch_id > after))
                .cloned())
        }

        fn handle_credential_change(&mut self, _user: User) -> FirestoreResult<()> {
            Ok(())
        }

        fn last_stream_token(&self) -> Vec<u8> {
            self.stream_token.clone()
        }

        fn set_last_stream_token(&mut self, token: Vec<u8>) -> FirestoreResult<()> {
            self.stream_token = token;
            Ok(())
        }
    }

    fn store() -> RemoteStore {
        RemoteStore::new(DatabaseId::default("project"), RemoteStoreSettings::default())
    }

    fn target_data(target_id: TargetId) -> TargetData {
        let target = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        TargetData::new(target, target_id, TargetPurpose::Listen, 1)
    }

    fn batch(batch_id: BatchId) -> MutationBatch {
        let key = DocumentKey::from_string(&format!("rooms/{batch_id}")).unwrap();
        MutationBatch::new(
            batch_id,
            Timestamp::new(1, 0),
            Vec::new(),
            vec![Mutation::set(key, MapValue::empty())],
        )
    }

    fn open_generation(actions: &[StreamAction], wanted: StreamKind) -> StreamGeneration {
        actions
            .iter()
            .find_map(|action| match action {
                StreamAction::Open { kind, generation } if *kind == wanted => Some(*generation),
                _ => None,
            })
            .expect("stream open action")
    }

    fn sent(actions: &[StreamAction], wanted: StreamKind) -> Vec<JsonValue> {
        actions
            .iter()
            .filter_map(|action| match action {
                StreamAction::Send { kind, message, .. } if *kind == wanted => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn listen_opens_watch_stream_and_sends_targets() {
        let mut syncer = RecordingSyncer::default();
        let mut store = store();
        store.start(&mut syncer).unwrap();
        store.listen(&mut syncer, target_data(2));
        let actions = store.take_actions();
        assert!(actions.contains(&StreamAction::ScheduleOnlineStateTimeout {
            delay: DEFAULT_ONLINE_STATE_TIMEOUT
        }));
        let generation = open_generation(&actions, StreamKind::Listen);

        store.handle_watch_stream_open(&mut syncer, generation);
        let requests = sent(&store.take_actions(), StreamKind::Listen);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["addTarget"]["targetId"], 2);
    }

    #[test]
    fn global_snapshot_raises_remote_event_with_resume_token() {
        let mut syncer = RecordingSyncer::default();
        let mut store = store();
        store.start(&mut syncer).unwrap();
        store.listen(&mut syncer, target_data(2));
        let generation = open_generation(&store.take_actions(), StreamKind::Listen);
        store.handle_watch_stream_open(&mut syncer, generation);

        let frames = [
            json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } }),
            json!({ "documentChange": {
                "document": {
                    "name": "projects/project/databases/(default)/documents/rooms/a",
                    "updateTime": "2024-01-01T00:00:00Z"
                },
                "targetIds": [2]
            }}),
            json!({ "targetChange": {
                "targetChangeType": "CURRENT",
                "targetIds": [2],
                "resumeToken": BASE64_STANDARD.encode(b"r1")
            }}),
            json!({ "targetChange": { "readTime": "2024-01-01T00:00:01Z" } }),
        ];
        for frame in &frames {
            store.handle_watch_stream_message(&mut syncer, generation, frame).unwrap();
        }

        assert_eq!(syncer.online_states.last(), Some(&OnlineState::Online));
        assert_eq!(syncer.events.len(), 1);
        let change = &syncer.events[0].target_changes[&2];
        assert!(change.current);
        assert_eq!(change.added_documents.len(), 1);
        assert_eq!(store.listen_targets()[&2].resume_token, b"r1".to_vec());
    }

    #[test]
    fn target_removal_with_cause_rejects_listen() {
        let mut syncer = RecordingSyncer::default();
        let mut store = store();
        store.start(&mut syncer).unwrap();
        store.listen(&mut syncer, target_data(4));
        let generation = open_generation(&store.take_actions(), StreamKind::Listen);
        store.handle_watch_stream_open(&mut syncer, generation);
        store
            .handle_watch_stream_message(
                &mut syncer,
                generation,
                &json!({ "targetChange": {
                    "targetChangeType": "REMOVE",
                    "targetIds": [4],
                    "cause": { "code": 7, "message": "denied" }
                }}),
            )
            .unwrap();
        assert_eq!(
            syncer.rejected_listens,
            vec![(4, FirestoreErrorCode::PermissionDenied)]
        );
        assert!(store.listen_targets().is_empty());
    }

    #[test]
    fn relisten_after_target_error_waits_for_current() {
        let mut syncer = RecordingSyncer::default();
        let mut store = store();
        store.start(&mut syncer).unwrap();
        store.listen(&mut syncer, target_data(2));
        let generation = open_generation(&store.take_actions(), StreamKind::Listen);
        store.handle_watch_stream_open(&mut syncer, generation);

        let first_listen = [
            json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } }),
            json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [2] } }),
            json!({ "targetChange": { "readTime": "2024-01-01T00:00:01Z" } }),
            json!({ "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [2],
                "cause": { "code": 7, "message": "denied" }
            }}),
        ];
        for frame in &first_listen {
            store.handle_watch_stream_message(&mut syncer, generation, frame).unwrap();
        }
        assert!(syncer.events[0].target_changes[&2].current);
        assert_eq!(syncer.rejected_listens, vec![(2, FirestoreErrorCode::PermissionDenied)]);

        store.listen(&mut syncer, target_data(2));
        let second_listen = [
            json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } }),
            json!({ "documentChange": {
                "document": {
                    "name": "projects/project/databases/(default)/documents/rooms/a",
                    "updateTime": "2024-01-01T00:00:02Z"
                },
                "targetIds": [2]
            }}),
            json!({ "targetChange": { "readTime": "2024-01-01T00:00:03Z" } }),
        ];
        for frame in &second_listen {
            store.handle_watch_stream_message(&mut syncer, generation, frame).unwrap();
        }
        assert_eq!(syncer.events.len(), 2);
        let change = &syncer.events[1].target_changes[&2];
        assert!(!change.current);
        assert_eq!(change.added_documents.len(), 1);
    }

    #[test]
    fn read_time_without_targets_raises_snapshot_for_any_change_type() {
        let mut syncer = RecordingSyncer::default();
        let mut store = store();
        store.start(&mut syncer).unwrap();
        store.listen(&mut syncer, target_data(2));
        let generation = open_generation(&store.take_actions(), StreamKind::Listen);
        store.handle_watch_stream_open(&mut syncer, generation);
        let frames = [
            json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } }),
            json!({ "targetChange": {
                "targetChangeType": "CURRENT",
                "readTime": "2024-01-01T00:00:01Z"
            }}),
        ];
        for frame in &frames {
            store.handle_watch_stream_message(&mut syncer, generation, frame).unwrap();
        }
        assert_eq!(syncer.events.len(), 1);
        assert!(syncer.events[0].target_changes[&2].current);
    }

    #[test]
    fn watch_failure_goes_offline_and_backs_off() {
        let mut syncer = RecordingSyncer::default();
        let mut store = store();
        store.start(&mut syncer).unwrap();
        store.listen(&mut syncer, target_data(2));
        let generation = open_generation(&store.take_actions(), StreamKind::Listen);
        store.handle_watch_stream_close(&mut syncer, generation, unavailable("offline"));
        assert_eq!(syncer.online_states.last(), Some(&OnlineState::Offline));
        let actions = store.take_actions();
        assert!(actions
            .iter()
            .any(|action| matches!(action, StreamAction::ScheduleBackoff { kind: StreamKind::Listen, .. })));
    }

    #[test]
    fn writes_flow_after_handshake_and_are_acknowledged() {
        let mut syncer = RecordingSyncer {
            batches: vec![batch(1), batch(2)],
            ..Default::default()
        };
        let mut store = store();
        store.start(&mut syncer).unwrap();
        assert_eq!(store.write_pipeline_len(), 2);
        let generation = open_generation(&store.take_actions(), StreamKind::Write);

        store.handle_write_stream_open(generation);
        let handshake = sent(&store.take_actions(), StreamKind::Write);
        assert_eq!(handshake, vec![json!({ "database": "projects/project/databases/(default)" })]);

        store
            .handle_write_stream_message(
                &mut syncer,
                generation,
                &json!({ "streamToken": BASE64_STANDARD.encode(b"t1") }),
            )
            .unwrap();
        assert_eq!(syncer.stream_token, b"t1".to_vec());
        let writes = sent(&store.take_actions(), StreamKind::Write);
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0]["streamToken"], BASE64_STANDARD.encode(b"t1"));

        store
            .handle_write_stream_message(
                &mut syncer,
                generation,
                &json!({
                    "streamToken": BASE64_STANDARD.encode(b"t2"),
                    "commitTime": "2024-01-01T00:00:00Z",
                    "writeResults": [{}]
                }),
            )
            .unwrap();
        assert_eq!(syncer.acknowledged, vec![1]);
        assert_eq!(store.write_pipeline_len(), 1);
    }

    #[test]
    fn write_pipeline_holds_at_most_ten_batches() {
        let mut syncer = RecordingSyncer {
            batches: (1..=12).map(batch).collect(),
            ..Default::default()
        };
        let mut store = store();
        store.start(&mut syncer).unwrap();
        assert_eq!(store.write_pipeline_len(), MAX_PENDING_WRITES);
        let generation = open_generation(&store.take_actions(), StreamKind::Write);
        store.handle_write_stream_open(generation);
        store.take_actions();
        store
            .handle_write_stream_message(&mut syncer, generation, &json!({ "streamToken": "" }))
            .unwrap();
        let writes = sent(&store.take_actions(), StreamKind::Write);
        assert_eq!(writes.len(), MAX_PENDING_WRITES);

        store
            .handle_write_stream_message(
                &mut syncer,
                generation,
                &json!({ "commitTime": "2024-01-01T00:00:00Z", "writeResults": [{}] }),
            )
            .unwrap();
        assert_eq!(syncer.acknowledged, vec![1]);
        assert_eq!(store.write_pipeline_len(), MAX_PENDING_WRITES);
        let refill = sent(&store.take_actions(), StreamKind::Write);
        assert_eq!(refill.len(), 1);
        assert!(refill[0]["writes"][0]["update"]["name"]
            .as_str()
            .is_some_and(|name| name.ends_with("/rooms/11")));
    }

    #[test]
    fn permanent_write_error_rejects_head_batch() {
        let mut syncer = RecordingSyncer {
            batches: vec![batch(1), batch(2)],
            ..Default::default()
        };
        let mut store = store();
        store.start(&mut syncer).unwrap();
        let generation = open_generation(&store.take_actions(), StreamKind::Write);
        store.handle_write_stream_open(generation);
        store
            .handle_write_stream_message(&mut syncer, generation, &json!({ "streamToken": "" }))
            .unwrap();
        store.take_actions();

        store.handle_write_stream_close(&mut syncer, generation, permission_denied("nope"));
        assert_eq!(syncer.rejected_writes, vec![1]);
        assert_eq!(store.write_pipeline_len(), 1);
        // Backoff is inhibited, so the stream reopens right away.
        let actions = store.take_actions();
        assert!(actions
            .iter()
            .any(|action| matches!(action, StreamAction::Open { kind: StreamKind::Write, .. })));
    }

    #[test]
    fn handshake_permanent_error_clears_stream_token() {
        let mut syncer = RecordingSyncer {
            batches: vec![batch(1)],
            stream_token: b"stale".to_vec(),
            ..Default::default()
        };
        let mut store = store();
        store.start(&mut syncer).unwrap();
        let generation = open_generation(&store.take_actions(), StreamKind::Write);
        store.handle_write_stream_close(&mut syncer, generation, permission_denied("bad token"));
        assert!(syncer.stream_token.is_empty());
        assert!(syncer.rejected_writes.is_empty());
    }

    #[test]
    fn disable_network_reports_offline_and_clears_pipeline() {
        let mut syncer = RecordingSyncer {
            batches: vec![batch(1)],
            ..Default::default()
        };
        let mut store = store();
        store.start(&mut syncer).unwrap();
        store.disable_network(&mut syncer);
        assert_eq!(store.write_pipeline_len(), 0);
        assert_eq!(syncer.online_states.last(), Some(&OnlineState::Offline));
        store.listen(&mut syncer, target_data(1));
        assert!(!store
            .take_actions()
            .iter()
            .any(|action| matches!(action, StreamAction::Open { kind: StreamKind::Listen, .. })));
    }
}
