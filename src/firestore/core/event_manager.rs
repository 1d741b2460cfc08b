use std::collections::{BTreeMap, HashMap};

use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::core::Query;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::remote::OnlineState;

pub type ListenerId = u64;

/// Callback receiving snapshots (or the terminal error) for one listener.
pub type SnapshotObserver = Box<dyn FnMut(FirestoreResult<ViewSnapshot>) + Send>;

/// Callback fired whenever every raised snapshot reflects the same state.
pub type SnapshotsInSyncObserver = Box<dyn FnMut() + Send>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots for metadata-only changes (pending writes, from-cache).
    pub include_metadata_changes: bool,
    /// Hold back cached initial results while the client might be online.
    pub wait_for_sync_when_online: bool,
}

/// Registers and unregisters query targets on behalf of the event manager.
pub trait QueryTargetRegistry {
    /// Starts listening to `query`, returning the initial snapshot if one
    /// can be computed from the local cache.
    fn listen(
        &mut self,
        query: &Query,
        should_listen_to_remote: bool,
    ) -> FirestoreResult<Option<ViewSnapshot>>;

    fn unlisten(&mut self, query: &Query, should_unlisten_to_remote: bool) -> FirestoreResult<()>;
}

/// One user listener on a query, filtering raw view snapshots into the
/// events the user asked for.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    observer: SnapshotObserver,
    raised_initial_event: bool,
    snap: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: SnapshotObserver) -> Self {
        Self {
            query,
            options,
            observer,
            raised_initial_event: false,
            snap: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Returns whether an event was raised.
    pub fn on_view_snapshot(&mut self, snapshot: &ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot.clone()
        } else {
            snapshot.without_metadata_changes()
        };

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            (self.observer)(Ok(snapshot.clone()));
            raised = true;
        }
        self.snap = Some(snapshot);
        raised
    }

    pub fn on_error(&mut self, error: FirestoreError) {
        (self.observer)(Err(error));
    }

    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        let pending = match &self.snap {
            Some(snapshot)
                if !self.raised_initial_event
                    && self.should_raise_initial_event(snapshot, online_state) =>
            {
                Some(snapshot.clone())
            }
            _ => None,
        };
        match pending {
            Some(snapshot) => {
                self.raise_initial_event(&snapshot);
                true
            }
            None => false,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        !snapshot.docs.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snap
            .as_ref()
            .map_or(false, |previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.docs.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        (self.observer)(Ok(initial));
    }
}

#[derive(Default)]
struct QueryListenersInfo {
    query: Option<Query>,
    view_snap: Option<ViewSnapshot>,
    listeners: BTreeMap<ListenerId, QueryListener>,
}

/// Fans view snapshots out to user listeners, sharing one target per
/// distinct query.
pub struct EventManager {
    queries: HashMap<String, QueryListenersInfo>,
    listener_queries: HashMap<ListenerId, String>,
    snapshots_in_sync_listeners: BTreeMap<ListenerId, SnapshotsInSyncObserver>,
    online_state: OnlineState,
    next_listener_id: ListenerId,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self {
            queries: HashMap::new(),
            listener_queries: HashMap::new(),
            snapshots_in_sync_listeners: BTreeMap::new(),
            online_state: OnlineState::Unknown,
            next_listener_id: 1,
        }
    }

    /// Number of distinct queries with at least one listener.
    pub fn active_query_count(&self) -> usize {
        self.queries.len()
    }

    pub fn listen(
        &mut self,
        mut listener: QueryListener,
        registry: &mut dyn QueryTargetRegistry,
    ) -> Option<ListenerId> {
        let canonical_id = listener.query.canonical_id();

        if !self.queries.contains_key(&canonical_id) {
            match registry.listen(&listener.query, true) {
                Ok(view_snap) => {
                    self.queries.insert(
                        canonical_id.clone(),
                        QueryListenersInfo {
                            query: Some(listener.query.clone()),
                            view_snap,
                            listeners: BTreeMap::new(),
                        },
                    );
                }
                Err(error) => {
                    log::warn!(
                        target: crate::firestore::constants::LOG_TAG_CORE,
                        "Failed to register query: {error}"
                    );
                    listener.on_error(error);
                    return None;
                }
            }
        }

        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listener_queries.insert(id, canonical_id.clone());

        let online_state = self.online_state;
        let info = self.queries.get_mut(&canonical_id)?;
        listener.apply_online_state_change(online_state);
        let raised = match &info.view_snap {
            Some(snapshot) => listener.on_view_snapshot(snapshot),
            None => false,
        };
        info.listeners.insert(id, listener);

        if raised {
            self.raise_snapshots_in_sync_event();
        }
        Some(id)
    }

    pub fn unlisten(
        &mut self,
        listener_id: ListenerId,
        registry: &mut dyn QueryTargetRegistry,
    ) -> FirestoreResult<()> {
        let Some(canonical_id) = self.listener_queries.remove(&listener_id) else {
            return Ok(());
        };
        let Some(info) = self.queries.get_mut(&canonical_id) else {
            return Ok(());
        };
        info.listeners.remove(&listener_id);
        if !info.listeners.is_empty() {
            return Ok(());
        }

        let info = self.queries.remove(&canonical_id);
        match info.and_then(|info| info.query) {
            Some(query) => registry.unlisten(&query, true),
            None => Ok(()),
        }
    }

    pub fn on_watch_change(&mut self, snapshots: Vec<ViewSnapshot>) {
        let mut raised = false;
        for snapshot in snapshots {
            let canonical_id = snapshot.query.canonical_id();
            if let Some(info) = self.queries.get_mut(&canonical_id) {
                for listener in info.listeners.values_mut() {
                    raised |= listener.on_view_snapshot(&snapshot);
                }
                info.view_snap = Some(snapshot);
            }
        }
        if raised {
            self.raise_snapshots_in_sync_event();
        }
    }

    /// Delivers a terminal error to every listener of `query`. The target
    /// has already been released by the sync engine.
    pub fn on_watch_error(&mut self, query: &Query, error: FirestoreError) {
        let canonical_id = query.canonical_id();
        if let Some(mut info) = self.queries.remove(&canonical_id) {
            for (id, listener) in info.listeners.iter_mut() {
                listener.on_error(error.clone());
                self.listener_queries.remove(id);
            }
        }
    }

    pub fn on_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        let mut raised = false;
        for info in self.queries.values_mut() {
            for listener in info.listeners.values_mut() {
                raised |= listener.apply_online_state_change(online_state);
            }
        }
        if raised {
            self.raise_snapshots_in_sync_event();
        }
    }

    pub fn add_snapshots_in_sync_listener(&mut self, mut observer: SnapshotsInSyncObserver) -> ListenerId {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        observer();
        self.snapshots_in_sync_listeners.insert(id, observer);
        id
    }

    pub fn remove_snapshots_in_sync_listener(&mut self, id: ListenerId) {
        self.snapshots_in_sync_listeners.remove(&id);
    }

    fn raise_snapshots_in_sync_event(&mut self) {
        for observer in self.snapshots_in_sync_listeners.values_mut() {
            observer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::document_set::DocumentSet;
    use crate::firestore::error::permission_denied;
    use crate::firestore::model::{DocumentKey, MutableDocument, ResourcePath, SnapshotVersion};
    use crate::firestore::value::MapValue;
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingRegistry {
        listens: Vec<String>,
        unlistens: Vec<String>,
        fail: bool,
    }

    impl QueryTargetRegistry for RecordingRegistry {
        fn listen(&mut self, query: &Query, _: bool) -> FirestoreResult<Option<ViewSnapshot>> {
            if self.fail {
                return Err(permission_denied("denied"));
            }
            self.listens.push(query.canonical_id());
            Ok(None)
        }

        fn unlisten(&mut self, query: &Query, _: bool) -> FirestoreResult<()> {
            self.unlistens.push(query.canonical_id());
            Ok(())
        }
    }

    fn query() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    fn recorder() -> (Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>, SnapshotObserver) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, Box::new(move |event| sink.lock().unwrap().push(event)))
    }

    fn snapshot(from_cache: bool, doc_ids: &[&str]) -> ViewSnapshot {
        let mut docs = DocumentSet::new(query().comparator());
        for id in doc_ids {
            docs.insert(MutableDocument::new_found_document(
                DocumentKey::from_string(&format!("rooms/{id}")).unwrap(),
                SnapshotVersion::from_micros(1),
                MapValue::empty(),
            ));
        }
        ViewSnapshot::from_initial_documents(query(), docs, BTreeSet::new(), from_cache, false)
    }

    #[test]
    fn identical_queries_share_one_registration() {
        let mut manager = EventManager::new();
        let mut registry = RecordingRegistry::default();
        let (first_events, first) = recorder();
        let (second_events, second) = recorder();

        let first_id = manager
            .listen(QueryListener::new(query(), ListenOptions::default(), first), &mut registry)
            .unwrap();
        let _second_id = manager
            .listen(QueryListener::new(query(), ListenOptions::default(), second), &mut registry)
            .unwrap();
        assert_eq!(registry.listens.len(), 1);

        manager.unlisten(first_id, &mut registry).unwrap();
        assert!(registry.unlistens.is_empty());

        manager.on_watch_change(vec![snapshot(false, &["a"])]);
        assert!(first_events.lock().unwrap().is_empty());
        assert_eq!(second_events.lock().unwrap().len(), 1);
    }

    #[test]
    fn last_unlisten_releases_target() {
        let mut manager = EventManager::new();
        let mut registry = RecordingRegistry::default();
        let (_, observer) = recorder();
        let id = manager
            .listen(QueryListener::new(query(), ListenOptions::default(), observer), &mut registry)
            .unwrap();
        manager.unlisten(id, &mut registry).unwrap();
        assert_eq!(registry.unlistens.len(), 1);
        assert_eq!(manager.active_query_count(), 0);
    }

    #[test]
    fn holds_empty_cached_snapshot_until_offline() {
        let mut manager = EventManager::new();
        let mut registry = RecordingRegistry::default();
        let (events, observer) = recorder();
        manager.listen(QueryListener::new(query(), ListenOptions::default(), observer), &mut registry);

        manager.on_watch_change(vec![snapshot(true, &[])]);
        assert!(events.lock().unwrap().is_empty());

        manager.on_online_state_change(OnlineState::Offline);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].as_ref().unwrap().from_cache);
    }

    #[test]
    fn errors_reach_every_listener_and_drop_query() {
        let mut manager = EventManager::new();
        let mut registry = RecordingRegistry::default();
        let (events, observer) = recorder();
        manager.listen(QueryListener::new(query(), ListenOptions::default(), observer), &mut registry);
        manager.on_watch_error(&query(), permission_denied("nope"));
        assert!(events.lock().unwrap()[0].is_err());
        assert_eq!(manager.active_query_count(), 0);
    }

    #[test]
    fn registration_failure_is_reported_to_listener() {
        let mut manager = EventManager::new();
        let mut registry = RecordingRegistry {
            fail: true,
            ..Default::default()
        };
        let (events, observer) = recorder();
        let id = manager.listen(QueryListener::new(query(), ListenOptions::default(), observer), &mut registry);
        assert!(id.is_none());
        assert_eq!(
            events.lock().unwrap()[0].as_ref().unwrap_err().code_str(),
            "firestore/permission-denied"
        );
    }
}
