use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::channel::oneshot;
use serde_json::Value as JsonValue;

use crate::firestore::api::credentials::{CredentialsProvider, EmptyCredentialsProvider};
use crate::firestore::api::settings::FirestoreSettings;
use crate::firestore::api::user_data::{self, SetOptions};
use crate::firestore::constants::LOG_TAG_CORE;
use crate::firestore::core::{
    EventManager, ListenOptions, ListenerId, Query, QueryListener, RemoteCommand, SnapshotObserver,
    SnapshotsInSyncObserver, SyncEngine, SyncEngineEvent, ViewSnapshot, WriteCompletion,
};
use crate::firestore::error::{cancelled, unavailable, FirestoreError, FirestoreResult};
use crate::firestore::local::{LocalStore, LocalStorePersistence, NoopPersistence};
use crate::firestore::model::{DocumentKey, MutableDocument, Mutation, User};
use crate::firestore::remote::{
    Connection, OnlineState, RemoteStore, StreamAction, StreamGeneration, StreamHandle, StreamHeaders,
    StreamKind,
};
use crate::firestore::value::FirestoreValue;
use crate::platform::runtime;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

/// Everything the I/O tasks need to reach the outside world and report back.
#[derive(Clone)]
struct Driver {
    queue: AsyncQueue<ClientCore>,
    connection: Arc<dyn Connection>,
    auth: Arc<dyn CredentialsProvider>,
    app_check: Arc<dyn CredentialsProvider>,
    database_name: String,
}

impl Driver {
    async fn headers(&self) -> FirestoreResult<StreamHeaders> {
        let mut headers = StreamHeaders::new();
        headers.insert("google-cloud-resource-prefix".to_string(), self.database_name.clone());
        headers.insert(
            "x-goog-request-params".to_string(),
            format!("database={}", self.database_name),
        );
        if let Some(token) = self.auth.get_token(false).await? {
            headers.extend(token.headers);
        }
        if let Some(token) = self.app_check.get_token(false).await? {
            headers.extend(token.headers);
        }
        Ok(headers)
    }

    /// Opens the `kind` stream for `generation` and forwards everything it
    /// yields onto the queue until it ends.
    async fn run_stream(self, kind: StreamKind, generation: StreamGeneration) {
        let opened = match self.headers().await {
            Ok(headers) => self.connection.open_stream(kind, headers).await,
            Err(err) => Err(err),
        };
        let handle = match opened {
            Ok(handle) => handle,
            Err(err) => {
                self.report_close(kind, generation, err);
                return;
            }
        };

        let reader = handle.clone();
        self.queue.enqueue_and_forget(move |core| {
            core.handle_stream_open(kind, generation, handle);
            Ok(())
        });
        loop {
            match reader.next().await {
                Some(Ok(message)) => self.queue.enqueue_and_forget(move |core| {
                    core.handle_stream_message(kind, generation, message);
                    Ok(())
                }),
                Some(Err(err)) => {
                    self.report_close(kind, generation, err);
                    return;
                }
                None => {
                    self.report_close(kind, generation, unavailable("Stream closed by the backend"));
                    return;
                }
            }
        }
    }

    fn report_close(&self, kind: StreamKind, generation: StreamGeneration, error: FirestoreError) {
        self.queue.enqueue_and_forget(move |core| {
            core.handle_stream_close(kind, generation, error);
            Ok(())
        });
    }
}

/// State owned by the client's queue: the sync engine, the remote store and
/// the event manager, plus the handles of the open streams.
pub struct ClientCore {
    sync_engine: SyncEngine,
    remote_store: RemoteStore,
    event_manager: EventManager,
    streams: BTreeMap<StreamKind, (StreamGeneration, StreamHandle)>,
    timers: HashMap<TimerId, DelayedOperation>,
    driver: Option<Driver>,
}

impl ClientCore {
    pub fn new(settings: &FirestoreSettings, persistence: Arc<dyn LocalStorePersistence>) -> Self {
        let local_store = LocalStore::new(persistence, User::unauthenticated());
        Self {
            sync_engine: SyncEngine::new(local_store, settings.max_concurrent_limbo_resolutions()),
            remote_store: RemoteStore::new(settings.database_id().clone(), settings.remote_store_settings()),
            event_manager: EventManager::new(),
            streams: BTreeMap::new(),
            timers: HashMap::new(),
            driver: None,
        }
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync_engine
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    pub fn event_manager(&self) -> &EventManager {
        &self.event_manager
    }

    /// Routes the sync engine's requests and notifications until both are
    /// drained, then performs the remote store's pending I/O.
    pub fn pump(&mut self) {
        loop {
            let commands = self.sync_engine.take_remote_commands();
            let events = self.sync_engine.take_events();
            if commands.is_empty() && events.is_empty() {
                break;
            }
            for command in commands {
                match command {
                    RemoteCommand::Listen(target_data) => {
                        self.remote_store.listen(&mut self.sync_engine, target_data)
                    }
                    RemoteCommand::Unlisten(target_id) => {
                        self.remote_store.unlisten(&mut self.sync_engine, target_id)
                    }
                    RemoteCommand::FillWritePipeline => {
                        if let Err(err) = self.remote_store.fill_write_pipeline(&mut self.sync_engine) {
                            log::warn!(target: LOG_TAG_CORE, "Failed to fill the write pipeline: {err}");
                        }
                    }
                }
            }
            for event in events {
                match event {
                    SyncEngineEvent::Snapshots(snapshots) => self.event_manager.on_watch_change(snapshots),
                    SyncEngineEvent::QueryError(query, error) => {
                        self.event_manager.on_watch_error(&query, error)
                    }
                    SyncEngineEvent::OnlineStateChanged(state) => {
                        self.event_manager.on_online_state_change(state)
                    }
                }
            }
        }

        for action in self.remote_store.take_actions() {
            self.perform(action);
        }
    }

    fn perform(&mut self, action: StreamAction) {
        match action {
            StreamAction::Open { kind, generation } => {
                let Some(driver) = self.driver.clone() else {
                    log::debug!(target: LOG_TAG_CORE, "No driver attached, not opening {kind} stream");
                    return;
                };
                runtime::spawn_detached(driver.run_stream(kind, generation));
            }
            StreamAction::Send {
                kind,
                generation,
                message,
            } => match self.streams.get(&kind) {
                Some((current, handle)) if *current == generation => {
                    if let Err(err) = handle.try_send(message) {
                        log::debug!(target: LOG_TAG_CORE, "Dropping {kind} message: {err}");
                    }
                }
                _ => log::debug!(target: LOG_TAG_CORE, "Dropping message for stale {kind} stream"),
            },
            StreamAction::Close { kind, generation } => {
                if matches!(self.streams.get(&kind), Some((current, _)) if *current == generation) {
                    if let Some((_, handle)) = self.streams.remove(&kind) {
                        handle.close();
                    }
                }
            }
            StreamAction::ScheduleBackoff {
                kind,
                generation,
                delay,
            } => {
                let timer_id = match kind {
                    StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
                    StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
                };
                self.schedule(timer_id, delay, move |core| {
                    core.remote_store.handle_backoff_elapsed(kind, generation);
                });
            }
            StreamAction::ScheduleIdleTimeout {
                kind,
                generation,
                timer,
                delay,
            } => {
                let timer_id = match kind {
                    StreamKind::Listen => TimerId::ListenStreamIdle,
                    StreamKind::Write => TimerId::WriteStreamIdle,
                };
                self.schedule(timer_id, delay, move |core| {
                    core.remote_store
                        .handle_idle_timeout(&mut core.sync_engine, kind, generation, timer);
                });
            }
            StreamAction::ScheduleOnlineStateTimeout { delay } => {
                self.schedule(TimerId::OnlineStateTimeout, delay, |core| {
                    core.remote_store.handle_online_state_timeout(&mut core.sync_engine);
                });
            }
            StreamAction::InvalidateCredentials => {
                if let Some(driver) = &self.driver {
                    driver.auth.invalidate_token();
                    driver.app_check.invalidate_token();
                }
            }
        }
    }

    /// Runs `operation` after `delay`, replacing any pending timer with the
    /// same id.
    fn schedule<F>(&mut self, timer_id: TimerId, delay: std::time::Duration, operation: F)
    where
        F: FnOnce(&mut ClientCore) + Send + 'static,
    {
        let Some(driver) = &self.driver else {
            return;
        };
        let delayed = driver.queue.enqueue_after_delay(timer_id, delay, move |core| {
            core.timers.remove(&timer_id);
            operation(core);
            core.pump();
        });
        if let Some(previous) = self.timers.insert(timer_id, delayed) {
            previous.cancel();
        }
    }

    fn handle_stream_open(&mut self, kind: StreamKind, generation: StreamGeneration, handle: StreamHandle) {
        if generation != self.remote_store.stream_generation(kind) {
            handle.close();
            return;
        }
        self.streams.insert(kind, (generation, handle));
        match kind {
            StreamKind::Listen => self
                .remote_store
                .handle_watch_stream_open(&mut self.sync_engine, generation),
            StreamKind::Write => self.remote_store.handle_write_stream_open(generation),
        }
        self.pump();
    }

    fn handle_stream_message(&mut self, kind: StreamKind, generation: StreamGeneration, message: JsonValue) {
        let result = match kind {
            StreamKind::Listen => {
                self.remote_store
                    .handle_watch_stream_message(&mut self.sync_engine, generation, &message)
            }
            StreamKind::Write => {
                self.remote_store
                    .handle_write_stream_message(&mut self.sync_engine, generation, &message)
            }
        };
        if let Err(err) = result {
            log::warn!(target: LOG_TAG_CORE, "Failed to handle {kind} stream message: {err}");
        }
        self.pump();
    }

    fn handle_stream_close(&mut self, kind: StreamKind, generation: StreamGeneration, error: FirestoreError) {
        if matches!(self.streams.get(&kind), Some((current, _)) if *current == generation) {
            self.streams.remove(&kind);
        }
        match kind {
            StreamKind::Listen => self
                .remote_store
                .handle_watch_stream_close(&mut self.sync_engine, generation, error),
            StreamKind::Write => self
                .remote_store
                .handle_write_stream_close(&mut self.sync_engine, generation, error),
        }
        self.pump();
    }

    fn handle_user_change(&mut self, user: User) -> FirestoreResult<()> {
        let result = self
            .remote_store
            .handle_credential_change(&mut self.sync_engine, user);
        self.pump();
        result
    }

    fn shutdown(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.cancel();
        }
        self.remote_store.shutdown();
        self.pump();
        for (_, (_, handle)) in std::mem::take(&mut self.streams) {
            handle.close();
        }
        self.sync_engine.local_store_mut().shutdown();
        self.driver = None;
    }
}

/// Builds a [`FirestoreClient`].
pub struct FirestoreClientBuilder {
    settings: FirestoreSettings,
    connection: Arc<dyn Connection>,
    auth: Arc<dyn CredentialsProvider>,
    app_check: Arc<dyn CredentialsProvider>,
    persistence: Arc<dyn LocalStorePersistence>,
}

impl FirestoreClientBuilder {
    pub fn new(settings: FirestoreSettings, connection: Arc<dyn Connection>) -> Self {
        Self {
            settings,
            connection,
            auth: Arc::new(EmptyCredentialsProvider),
            app_check: Arc::new(EmptyCredentialsProvider),
            persistence: Arc::new(NoopPersistence),
        }
    }

    pub fn with_auth_provider(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.auth = provider;
        self
    }

    pub fn with_app_check_provider(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.app_check = provider;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn LocalStorePersistence>) -> Self {
        self.persistence = persistence;
        self
    }

    /// Starts the client: restores the local cache, subscribes to user
    /// changes and brings the network up.
    pub async fn build(self) -> FirestoreResult<FirestoreClient> {
        let core = ClientCore::new(&self.settings, self.persistence);
        let queue = AsyncQueue::start(core);
        let driver = Driver {
            queue: queue.clone(),
            connection: self.connection,
            auth: Arc::clone(&self.auth),
            app_check: Arc::clone(&self.app_check),
            database_name: self.settings.database_id().resource_name(),
        };
        let attempts = self.settings.persistence_retry_attempts();

        queue
            .enqueue_retryable(attempts, |core| core.sync_engine.local_store_mut().start())
            .await?;
        queue
            .enqueue(move |core| {
                core.driver = Some(driver);
                core.remote_store.start(&mut core.sync_engine)?;
                core.pump();
                Ok(())
            })
            .await?;

        let listener_queue = queue.clone();
        self.auth.start(Arc::new(move |user: User| {
            listener_queue.enqueue_and_forget(move |core| core.handle_user_change(user));
        }));

        Ok(FirestoreClient {
            queue,
            auth: self.auth,
            app_check: self.app_check,
            settings: self.settings,
        })
    }
}

/// Offline-first client: local writes apply immediately, listeners see the
/// local cache merged with the backend's snapshots.
///
/// All work runs on one serialized queue; the methods here only submit
/// operations to it.
#[derive(Clone)]
pub struct FirestoreClient {
    queue: AsyncQueue<ClientCore>,
    auth: Arc<dyn CredentialsProvider>,
    app_check: Arc<dyn CredentialsProvider>,
    settings: FirestoreSettings,
}

impl FirestoreClient {
    pub fn builder(settings: FirestoreSettings, connection: Arc<dyn Connection>) -> FirestoreClientBuilder {
        FirestoreClientBuilder::new(settings, connection)
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.settings
    }

    /// Registers `observer` for snapshots of `query`. Returns `None` when the
    /// query could not be registered; the observer has then received the
    /// error.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: SnapshotObserver,
    ) -> FirestoreResult<Option<ListenerId>> {
        self.queue
            .enqueue(move |core| {
                let listener = QueryListener::new(query, options, observer);
                let id = core.event_manager.listen(listener, &mut core.sync_engine);
                core.pump();
                Ok(id)
            })
            .await
    }

    pub async fn unlisten(&self, listener_id: ListenerId) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |core| {
                let result = core.event_manager.unlisten(listener_id, &mut core.sync_engine);
                core.pump();
                result
            })
            .await
    }

    /// Applies `mutations` locally as one batch and queues them for the
    /// backend. The returned completion resolves once the backend accepted
    /// or rejected the batch.
    ///
    /// # Errors
    /// Fails with `unavailable` when the local cache stayed unavailable for
    /// every configured retry attempt.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteCompletion> {
        let (sender, receiver) = oneshot::channel();
        let mut sender = Some(sender);
        self.queue
            .enqueue_retryable(self.settings.persistence_retry_attempts(), move |core| {
                let completion = core.sync_engine.write(mutations.clone())?;
                core.pump();
                if let Some(sender) = sender.take() {
                    let _ = sender.send(completion);
                }
                Ok(())
            })
            .await?;
        receiver
            .await
            .map_err(|_| cancelled("The write was dropped before it was applied"))
    }

    /// Writes `data` into the document at `path`.
    pub async fn set_doc(
        &self,
        path: &str,
        data: BTreeMap<String, FirestoreValue>,
        options: Option<SetOptions>,
    ) -> FirestoreResult<WriteCompletion> {
        let key = DocumentKey::from_string(path)?;
        let mutation = user_data::parse_set_data(key, data, &options.unwrap_or_default())?;
        self.write(vec![mutation]).await
    }

    /// Updates the dotted field paths in `data` on an existing document.
    pub async fn update_doc(
        &self,
        path: &str,
        data: BTreeMap<String, FirestoreValue>,
    ) -> FirestoreResult<WriteCompletion> {
        let key = DocumentKey::from_string(path)?;
        let mutation = user_data::parse_update_data(key, data)?;
        self.write(vec![mutation]).await
    }

    pub async fn delete_doc(&self, path: &str) -> FirestoreResult<WriteCompletion> {
        let key = DocumentKey::from_string(path)?;
        self.write(vec![user_data::delete_mutation(key)]).await
    }

    /// Resolves once every write issued so far was accepted or rejected.
    /// Fails with `cancelled` if the user changes meanwhile.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let completion = self
            .queue
            .enqueue(|core| Ok(core.sync_engine.wait_for_pending_writes()))
            .await?;
        completion
            .await
            .map_err(|_| cancelled("The client was terminated with pending writes"))?
    }

    /// Runs `query` against the local cache only.
    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        self.queue
            .enqueue(move |core| core.sync_engine.query_local_cache(&query))
            .await
    }

    /// The cached document at `path` with pending writes applied. The result
    /// is an invalid document when nothing is known about it.
    pub async fn get_document_from_local_cache(&self, path: &str) -> FirestoreResult<MutableDocument> {
        let key = DocumentKey::from_string(path)?;
        self.queue
            .enqueue(move |core| core.sync_engine.local_store().read_document(&key))
            .await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.queue
            .enqueue(|core| {
                let result = core.remote_store.enable_network(&mut core.sync_engine);
                core.pump();
                result
            })
            .await
    }

    /// Closes both streams and reports the client offline. Writes keep
    /// applying locally until the network is enabled again.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.queue
            .enqueue(|core| {
                core.remote_store.disable_network(&mut core.sync_engine);
                core.pump();
                Ok(())
            })
            .await
    }

    pub async fn online_state(&self) -> FirestoreResult<OnlineState> {
        self.queue
            .enqueue(|core| Ok(core.remote_store.online_state()))
            .await
    }

    pub async fn add_snapshots_in_sync_listener(
        &self,
        observer: SnapshotsInSyncObserver,
    ) -> FirestoreResult<ListenerId> {
        self.queue
            .enqueue(move |core| Ok(core.event_manager.add_snapshots_in_sync_listener(observer)))
            .await
    }

    pub async fn remove_snapshots_in_sync_listener(&self, id: ListenerId) -> FirestoreResult<()> {
        self.queue
            .enqueue(move |core| {
                core.event_manager.remove_snapshots_in_sync_listener(id);
                Ok(())
            })
            .await
    }

    /// Shuts the client down. Later calls fail with `failed-precondition`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        self.queue.enter_restricted_mode();
        let result = self
            .queue
            .enqueue_even_while_restricted(|core| {
                core.shutdown();
                Ok(())
            })
            .await;
        self.auth.shutdown();
        self.app_check.shutdown();
        self.queue.close();
        result
    }
}
