//! End-to-end flows through the sync engine and the remote store, driven
//! frame by frame without a transport.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use firebase_sync_rs::firestore::core::{
    EventManager, ListenOptions, ListenerId, Query, QueryListener, RemoteCommand, SyncEngine,
    SyncEngineEvent, ViewSnapshot, WriteCompletion,
};
use firebase_sync_rs::firestore::error::unavailable;
use firebase_sync_rs::firestore::local::{LocalStore, NoopPersistence};
use firebase_sync_rs::firestore::model::{
    DatabaseId, DocumentKey, FieldMask, FieldPath, Mutation, ResourcePath, SnapshotVersion, Timestamp,
    User,
};
use firebase_sync_rs::firestore::remote::{
    RemoteStore, RemoteStoreSettings, StreamAction, StreamGeneration, StreamKind,
};
use firebase_sync_rs::firestore::value::{FirestoreValue, MapValue};
use serde_json::{json, Value as JsonValue};

const DOCUMENTS: &str = "projects/project/databases/(default)/documents";

type Snapshots = Arc<Mutex<Vec<ViewSnapshot>>>;

/// Routes sync engine output into the remote store and records the frames
/// the remote store wants to send, the way the client core does.
struct Harness {
    engine: SyncEngine,
    remote: RemoteStore,
    events: EventManager,
    pending_open: BTreeMap<StreamKind, StreamGeneration>,
    pending_backoff: BTreeMap<StreamKind, StreamGeneration>,
    open: BTreeMap<StreamKind, StreamGeneration>,
    watch_sent: Vec<JsonValue>,
    write_sent: Vec<JsonValue>,
}

impl Harness {
    fn new() -> Self {
        let mut local_store = LocalStore::new(Arc::new(NoopPersistence), User::unauthenticated());
        local_store.start().unwrap();
        let mut harness = Self {
            engine: SyncEngine::new(local_store, 100),
            remote: RemoteStore::new(DatabaseId::default("project"), RemoteStoreSettings::default()),
            events: EventManager::new(),
            pending_open: BTreeMap::new(),
            pending_backoff: BTreeMap::new(),
            open: BTreeMap::new(),
            watch_sent: Vec::new(),
            write_sent: Vec::new(),
        };
        harness.remote.start(&mut harness.engine).unwrap();
        harness.pump();
        harness
    }

    fn pump(&mut self) {
        loop {
            let commands = self.engine.take_remote_commands();
            let events = self.engine.take_events();
            if commands.is_empty() && events.is_empty() {
                break;
            }
            for command in commands {
                match command {
                    RemoteCommand::Listen(target_data) => self.remote.listen(&mut self.engine, target_data),
                    RemoteCommand::Unlisten(target_id) => self.remote.unlisten(&mut self.engine, target_id),
                    RemoteCommand::FillWritePipeline => {
                        self.remote.fill_write_pipeline(&mut self.engine).unwrap()
                    }
                }
            }
            for event in events {
                match event {
                    SyncEngineEvent::Snapshots(snapshots) => self.events.on_watch_change(snapshots),
                    SyncEngineEvent::QueryError(query, error) => self.events.on_watch_error(&query, error),
                    SyncEngineEvent::OnlineStateChanged(state) => self.events.on_online_state_change(state),
                }
            }
        }
        for action in self.remote.take_actions() {
            match action {
                StreamAction::Open { kind, generation } => {
                    self.pending_open.insert(kind, generation);
                }
                StreamAction::Send { kind, message, .. } => match kind {
                    StreamKind::Listen => self.watch_sent.push(message),
                    StreamKind::Write => self.write_sent.push(message),
                },
                StreamAction::Close { kind, generation } => {
                    if self.open.get(&kind) == Some(&generation) {
                        self.open.remove(&kind);
                    }
                }
                StreamAction::ScheduleBackoff { kind, generation, .. } => {
                    self.pending_backoff.insert(kind, generation);
                }
                _ => {}
            }
        }
    }

    fn listen(&mut self, query: Query) -> (ListenerId, Snapshots) {
        let snapshots: Snapshots = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&snapshots);
        let listener = QueryListener::new(
            query,
            ListenOptions {
                include_metadata_changes: true,
                ..ListenOptions::default()
            },
            Box::new(move |snapshot| sink.lock().unwrap().push(snapshot.unwrap())),
        );
        let id = self.events.listen(listener, &mut self.engine).unwrap();
        self.pump();
        (id, snapshots)
    }

    fn unlisten(&mut self, id: ListenerId) {
        self.events.unlisten(id, &mut self.engine).unwrap();
        self.pump();
    }

    fn write(&mut self, mutation: Mutation) -> WriteCompletion {
        let completion = self.engine.write(vec![mutation]).unwrap();
        self.pump();
        completion
    }

    fn open_stream(&mut self, kind: StreamKind) {
        let generation = self.pending_open.remove(&kind).expect("stream was not asked to open");
        match kind {
            StreamKind::Listen => self.remote.handle_watch_stream_open(&mut self.engine, generation),
            StreamKind::Write => self.remote.handle_write_stream_open(generation),
        }
        self.open.insert(kind, generation);
        self.pump();
    }

    fn watch(&mut self, frame: JsonValue) {
        let generation = self.open[&StreamKind::Listen];
        self.remote
            .handle_watch_stream_message(&mut self.engine, generation, &frame)
            .unwrap();
        self.pump();
    }

    fn write_response(&mut self, frame: JsonValue) {
        let generation = self.open[&StreamKind::Write];
        self.remote
            .handle_write_stream_message(&mut self.engine, generation, &frame)
            .unwrap();
        self.pump();
    }

    fn fail_watch(&mut self) {
        let generation = self.open[&StreamKind::Listen];
        self.remote
            .handle_watch_stream_close(&mut self.engine, generation, unavailable("connection reset"));
        self.pump();
    }

    fn elapse_backoff(&mut self, kind: StreamKind) {
        let generation = self.pending_backoff.remove(&kind).expect("no backoff pending");
        self.remote.handle_backoff_elapsed(kind, generation);
        self.pump();
    }

    /// Target ids of every `addTarget` sent so far.
    fn added_targets(&self) -> Vec<i64> {
        self.watch_sent
            .iter()
            .filter_map(|request| request["addTarget"]["targetId"].as_i64())
            .collect()
    }

    /// Delivers `documents` for `target_id`, marks it current and raises a
    /// global snapshot at `read_time`.
    fn sync_target(&mut self, target_id: i64, documents: &[(&str, &str)], read_time: &str, token: &[u8]) {
        self.watch(json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [target_id] } }));
        for (path, name) in documents {
            self.watch(document_change(path, name, read_time, target_id));
        }
        self.watch(json!({ "targetChange": {
            "targetChangeType": "CURRENT",
            "targetIds": [target_id],
            "resumeToken": BASE64_STANDARD.encode(token),
        }}));
        self.watch(json!({ "targetChange": { "readTime": read_time } }));
    }
}

fn rooms() -> Query {
    Query::new(ResourcePath::from_string("rooms").unwrap())
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn name_data(name: &str) -> MapValue {
    let mut fields = BTreeMap::new();
    fields.insert("name".to_string(), FirestoreValue::from_string(name));
    MapValue::new(fields)
}

fn document_change(path: &str, name: &str, update_time: &str, target_id: i64) -> JsonValue {
    json!({ "documentChange": {
        "document": {
            "name": format!("{DOCUMENTS}/{path}"),
            "fields": { "name": { "stringValue": name } },
            "updateTime": update_time,
        },
        "targetIds": [target_id],
    }})
}

fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

#[test]
fn local_write_is_from_cache_until_the_server_catches_up() {
    let mut harness = Harness::new();
    let mut completion = harness.write(Mutation::set(key("rooms/a"), name_data("A")));

    let (_, snapshots) = harness.listen(rooms());
    {
        let snapshots = snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].from_cache);
        assert!(snapshots[0].has_pending_writes());
        assert!(snapshots[0].docs.contains(&key("rooms/a")));
    }

    harness.open_stream(StreamKind::Write);
    assert_eq!(harness.write_sent[0]["database"], "projects/project/databases/(default)");
    harness.write_response(json!({ "streamToken": "AQ==" }));
    assert_eq!(harness.write_sent.len(), 2);
    harness.write_response(json!({
        "streamToken": "Ag==",
        "commitTime": "2024-01-01T00:00:10Z",
        "writeResults": [{ "updateTime": "2024-01-01T00:00:10Z" }],
    }));
    assert!(matches!(completion.try_recv(), Ok(Some(Ok(())))));

    harness.open_stream(StreamKind::Listen);
    let target_id = harness.added_targets()[0];
    harness.sync_target(target_id, &[("rooms/a", "A")], "2024-01-01T00:00:10Z", b"t1");

    let snapshots = snapshots.lock().unwrap();
    let last = snapshots.last().unwrap();
    assert!(!last.from_cache);
    assert!(!last.has_pending_writes());
    let doc = last.docs.get(&key("rooms/a")).unwrap();
    assert_eq!(doc.version(), version(1_704_067_210));
}

#[test]
fn identical_queries_share_one_target() {
    let mut harness = Harness::new();
    let (first, first_snapshots) = harness.listen(rooms());
    let (_second, second_snapshots) = harness.listen(rooms());
    harness.open_stream(StreamKind::Listen);
    assert_eq!(harness.added_targets().len(), 1);
    let target_id = harness.added_targets()[0];

    harness.sync_target(target_id, &[("rooms/a", "A")], "2024-01-01T00:00:01Z", b"t1");
    assert_eq!(first_snapshots.lock().unwrap().len(), 1);
    assert_eq!(second_snapshots.lock().unwrap().len(), 1);

    harness.unlisten(first);
    assert!(harness
        .watch_sent
        .iter()
        .all(|request| request.get("removeTarget").is_none()));

    harness.watch(document_change("rooms/b", "B", "2024-01-01T00:00:02Z", target_id));
    harness.watch(json!({ "targetChange": { "readTime": "2024-01-01T00:00:02Z" } }));
    assert_eq!(first_snapshots.lock().unwrap().len(), 1);
    let second = second_snapshots.lock().unwrap();
    assert_eq!(second.len(), 2);
    assert_eq!(second[1].docs.len(), 2);
}

#[test]
fn existence_filter_mismatch_triggers_full_requery() {
    let mut harness = Harness::new();
    let (_, _snapshots) = harness.listen(rooms());
    harness.open_stream(StreamKind::Listen);
    let target_id = harness.added_targets()[0];
    harness.sync_target(
        target_id,
        &[("rooms/a", "A"), ("rooms/b", "B")],
        "2024-01-01T00:00:01Z",
        b"t1",
    );

    let sent_before = harness.watch_sent.len();
    harness.watch(json!({ "filter": { "targetId": target_id, "count": 1 } }));
    harness.watch(json!({ "targetChange": { "readTime": "2024-01-01T00:00:02Z" } }));

    let requests = &harness.watch_sent[sent_before..];
    assert_eq!(requests[0]["removeTarget"], target_id);
    let relisten = &requests[1];
    assert_eq!(relisten["addTarget"]["targetId"], target_id);
    assert!(relisten["addTarget"].get("resumeToken").is_none());
    assert_eq!(relisten["labels"]["goog-listen-tags"], "existence-filter-mismatch");
}

#[test]
fn duplicate_remote_events_are_idempotent() {
    let mut harness = Harness::new();
    let (_, snapshots) = harness.listen(rooms());
    harness.open_stream(StreamKind::Listen);
    let target_id = harness.added_targets()[0];
    harness.sync_target(target_id, &[("rooms/a", "A")], "2024-01-01T00:00:01Z", b"t1");
    assert_eq!(snapshots.lock().unwrap().len(), 1);

    // The same document version delivered again changes nothing.
    harness.watch(document_change("rooms/a", "A", "2024-01-01T00:00:01Z", target_id));
    harness.watch(json!({ "targetChange": { "readTime": "2024-01-01T00:00:03Z" } }));
    assert_eq!(snapshots.lock().unwrap().len(), 1);

    // An older version never replaces the newer cached one.
    harness.watch(document_change("rooms/a", "stale", "2024-01-01T00:00:00Z", target_id));
    harness.watch(json!({ "targetChange": { "readTime": "2024-01-01T00:00:04Z" } }));
    let doc = harness.engine.local_store().read_document(&key("rooms/a")).unwrap();
    assert_eq!(
        doc.field(&FieldPath::from_dot_separated("name").unwrap()),
        Some(&FirestoreValue::from_string("A"))
    );
    assert_eq!(doc.version(), version(1_704_067_201));
}

#[test]
fn restarted_watch_stream_resumes_from_the_last_token() {
    let mut harness = Harness::new();
    let (_, _snapshots) = harness.listen(rooms());
    harness.open_stream(StreamKind::Listen);
    let target_id = harness.added_targets()[0];
    harness.sync_target(target_id, &[("rooms/a", "A")], "2024-01-01T00:00:01Z", b"resume-1");

    harness.fail_watch();
    // The backoff was reset by the messages received, so this delay is zero.
    harness.elapse_backoff(StreamKind::Listen);
    harness.open_stream(StreamKind::Listen);

    let relisten = harness.watch_sent.last().unwrap();
    assert_eq!(relisten["addTarget"]["targetId"], target_id);
    assert_eq!(
        relisten["addTarget"]["resumeToken"],
        BASE64_STANDARD.encode(b"resume-1")
    );
}

#[test]
fn patch_on_missing_document_is_not_visible_until_acknowledged() {
    let mut harness = Harness::new();
    let patch = Mutation::patch(
        key("rooms/ghost"),
        name_data("G"),
        FieldMask::new([FieldPath::from_dot_separated("name").unwrap()]),
    );
    let _completion = harness.write(patch);
    let cached = harness.engine.query_local_cache(&rooms()).unwrap();
    assert!(!cached.docs.contains(&key("rooms/ghost")));
    assert_eq!(harness.engine.local_store().pending_batch_ids().len(), 1);
}
