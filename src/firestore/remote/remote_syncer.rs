use std::collections::BTreeSet;

use crate::firestore::core::TargetId;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{
    BatchId, DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion, User,
};
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::remote::OnlineState;

/// Callbacks the remote store uses to hand watch and write results to the
/// sync engine.
///
/// All methods run on the client's serialized queue, so implementations take
/// `&mut self` and never need interior locking.
pub trait RemoteSyncer {
    /// Applies a consistent snapshot produced by the watch stream.
    fn apply_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend removed `target_id` with an error.
    fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()>;

    /// The head batch was committed.
    fn apply_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<()>;

    /// The head batch failed with a permanent error.
    fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()>;

    /// Keys the client currently believes match `target_id` on the backend.
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Version of the last remote event applied to the local store.
    fn last_remote_snapshot_version(&self) -> SnapshotVersion;

    fn apply_online_state_change(&mut self, online_state: OnlineState);

    fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>>;

    /// Switches pending writes and views to `user`.
    fn handle_credential_change(&mut self, user: User) -> FirestoreResult<()>;

    fn last_stream_token(&self) -> Vec<u8>;

    fn set_last_stream_token(&mut self, token: Vec<u8>) -> FirestoreResult<()>;
}
