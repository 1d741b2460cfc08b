use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::firestore::core::TargetId;
use crate::firestore::error::{internal_error, unavailable, FirestoreResult};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, MutationBatch, SnapshotVersion, User,
};

/// Durable state a local store can be restored from.
#[derive(Clone, Debug, Default)]
pub struct PersistedState {
    pub documents: BTreeMap<DocumentKey, MutableDocument>,
    /// Pending batches keyed by [`User::to_key`].
    pub batches: BTreeMap<String, Vec<MutationBatch>>,
    pub stream_tokens: BTreeMap<String, Vec<u8>>,
    pub targets: BTreeMap<TargetId, TargetData>,
    pub target_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    pub last_remote_snapshot_version: SnapshotVersion,
}

/// Durability sink for the local store.
///
/// Every method defaults to a no-op, so implementations only override what
/// they persist. Errors surface to the caller of the local store operation.
pub trait LocalStorePersistence: Send + Sync {
    /// Fails with `unavailable` when writes cannot currently be accepted.
    fn check_available(&self) -> FirestoreResult<()> {
        Ok(())
    }

    fn load(&self) -> FirestoreResult<PersistedState> {
        Ok(PersistedState::default())
    }

    fn save_document(&self, _document: &MutableDocument) -> FirestoreResult<()> {
        Ok(())
    }

    fn remove_document(&self, _key: &DocumentKey) -> FirestoreResult<()> {
        Ok(())
    }

    fn save_batch(&self, _user: &User, _batch: &MutationBatch) -> FirestoreResult<()> {
        Ok(())
    }

    fn remove_batch(&self, _user: &User, _batch_id: BatchId) -> FirestoreResult<()> {
        Ok(())
    }

    fn save_stream_token(&self, _user: &User, _token: &[u8]) -> FirestoreResult<()> {
        Ok(())
    }

    fn save_target(&self, _target: &TargetData) -> FirestoreResult<()> {
        Ok(())
    }

    fn save_target_keys(
        &self,
        _target_id: TargetId,
        _keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        Ok(())
    }

    fn save_last_remote_snapshot_version(&self, _version: SnapshotVersion) -> FirestoreResult<()> {
        Ok(())
    }
}

/// Persistence that only checks availability and keeps nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPersistence;

impl LocalStorePersistence for NoopPersistence {}

/// In-memory durability sink whose state outlives the client that wrote it.
///
/// Cloning shares the underlying state, so a second client built from a
/// clone restores everything the first one persisted.
#[derive(Clone, Default)]
pub struct MemoryPersistence {
    state: Arc<Mutex<PersistedState>>,
    unavailable: Arc<AtomicBool>,
    failing_checks: Arc<AtomicU32>,
}

impl Debug for MemoryPersistence {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPersistence")
            .field("unavailable", &self.unavailable.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything persisted so far.
    pub fn snapshot(&self) -> PersistedState {
        match self.state.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Simulates the storage layer going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Makes the next `attempts` availability checks fail.
    pub fn fail_next_checks(&self, attempts: u32) {
        self.failing_checks.store(attempts, Ordering::SeqCst);
    }

    fn with_state<R>(&self, update: impl FnOnce(&mut PersistedState) -> R) -> FirestoreResult<R> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| internal_error("Persisted state lock poisoned"))?;
        Ok(update(&mut state))
    }
}

impl LocalStorePersistence for MemoryPersistence {
    fn check_available(&self) -> FirestoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(unavailable("Local persistence is unavailable"));
        }
        let consumed = self
            .failing_checks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            });
        if consumed.is_ok() {
            return Err(unavailable("Local persistence is temporarily unavailable"));
        }
        Ok(())
    }

    fn load(&self) -> FirestoreResult<PersistedState> {
        self.with_state(|state| state.clone())
    }

    fn save_document(&self, document: &MutableDocument) -> FirestoreResult<()> {
        self.with_state(|state| {
            state
                .documents
                .insert(document.key().clone(), document.clone());
        })
    }

    fn remove_document(&self, key: &DocumentKey) -> FirestoreResult<()> {
        self.with_state(|state| {
            state.documents.remove(key);
        })
    }

    fn save_batch(&self, user: &User, batch: &MutationBatch) -> FirestoreResult<()> {
        self.with_state(|state| {
            let batches = state.batches.entry(user.to_key()).or_default();
            batches.retain(|existing| existing.batch_id != batch.batch_id);
            batches.push(batch.clone());
        })
    }

    fn remove_batch(&self, user: &User, batch_id: BatchId) -> FirestoreResult<()> {
        self.with_state(|state| {
            if let Some(batches) = state.batches.get_mut(&user.to_key()) {
                batches.retain(|batch| batch.batch_id != batch_id);
            }
        })
    }

    fn save_stream_token(&self, user: &User, token: &[u8]) -> FirestoreResult<()> {
        self.with_state(|state| {
            state.stream_tokens.insert(user.to_key(), token.to_vec());
        })
    }

    fn save_target(&self, target: &TargetData) -> FirestoreResult<()> {
        self.with_state(|state| {
            state.targets.insert(target.target_id, target.clone());
        })
    }

    fn save_target_keys(
        &self,
        target_id: TargetId,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        self.with_state(|state| {
            state.target_keys.insert(target_id, keys.clone());
        })
    }

    fn save_last_remote_snapshot_version(&self, version: SnapshotVersion) -> FirestoreResult<()> {
        self.with_state(|state| {
            if version > state.last_remote_snapshot_version {
                state.last_remote_snapshot_version = version;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let persistence = MemoryPersistence::new();
        let clone = persistence.clone();
        clone
            .save_last_remote_snapshot_version(SnapshotVersion::from_micros(9))
            .unwrap();
        assert_eq!(
            persistence.snapshot().last_remote_snapshot_version,
            SnapshotVersion::from_micros(9)
        );
    }

    #[test]
    fn failing_checks_recover() {
        let persistence = MemoryPersistence::new();
        persistence.fail_next_checks(2);
        assert!(persistence.check_available().is_err());
        assert!(persistence.check_available().is_err());
        assert!(persistence.check_available().is_ok());

        persistence.set_available(false);
        assert_eq!(
            persistence.check_available().unwrap_err().code_str(),
            "firestore/unavailable"
        );
    }
}
