use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::firestore::constants::LOG_TAG_REMOTE;
use crate::firestore::error::{FirestoreError, FirestoreErrorCode};
use crate::firestore::remote::connection::StreamKind;
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};

/// Identifies one open attempt of a stream. Events tagged with an older
/// generation belong to a stream that was already torn down.
pub type StreamGeneration = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Not started, or stopped cleanly. The next start is immediate.
    Initial,
    /// Waiting for credentials and the connection.
    Starting,
    Open,
    /// Closed by an error. The next start backs off first.
    Error,
    /// Waiting out the backoff delay before reconnecting.
    Backoff,
}

/// I/O the driver must perform on behalf of the remote store.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamAction {
    /// Fetch credentials and open a new stream for `generation`.
    Open {
        kind: StreamKind,
        generation: StreamGeneration,
    },
    Send {
        kind: StreamKind,
        generation: StreamGeneration,
        message: JsonValue,
    },
    /// Tear down the stream opened for `generation`.
    Close {
        kind: StreamKind,
        generation: StreamGeneration,
    },
    /// Report back through `handle_backoff_elapsed` after `delay`.
    ScheduleBackoff {
        kind: StreamKind,
        generation: StreamGeneration,
        delay: Duration,
    },
    /// Report back through `handle_idle_timeout` after `delay`.
    ScheduleIdleTimeout {
        kind: StreamKind,
        generation: StreamGeneration,
        timer: u64,
        delay: Duration,
    },
    ScheduleOnlineStateTimeout {
        delay: Duration,
    },
    /// The backend rejected the credentials; force a refresh on next use.
    InvalidateCredentials,
}

/// State machine for one of the two persistent streams.
///
/// The stream performs no I/O itself. Every transition records the actions
/// the driver must carry out, and the driver reports stream events back with
/// the generation they belong to.
#[derive(Debug)]
pub struct PersistentStream {
    kind: StreamKind,
    state: StreamState,
    generation: StreamGeneration,
    backoff: ExponentialBackoff,
    idle_timeout: Duration,
    idle_timer: Option<u64>,
    next_timer: u64,
    actions: Vec<StreamAction>,
}

impl PersistentStream {
    pub fn new(kind: StreamKind, backoff: BackoffConfig, idle_timeout: Duration) -> Self {
        Self {
            kind,
            state: StreamState::Initial,
            generation: 0,
            backoff: ExponentialBackoff::new(backoff),
            idle_timeout,
            idle_timer: None,
            next_timer: 0,
            actions: Vec::new(),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn generation(&self) -> StreamGeneration {
        self.generation
    }

    /// Started means a start was requested and the stream has not been
    /// stopped or closed since, even if it is not open yet.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state,
            StreamState::Starting | StreamState::Open | StreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    pub fn start(&mut self) {
        if self.state == StreamState::Error {
            self.perform_backoff();
            return;
        }
        if self.state != StreamState::Initial {
            log::debug!(target: LOG_TAG_REMOTE, "{} stream already started", self.kind);
            return;
        }
        self.open();
    }

    /// Closes the stream without error. The next start is immediate.
    pub fn stop(&mut self) {
        if self.is_started() {
            self.close(StreamState::Initial, None);
        }
    }

    /// Makes the next start skip the backoff delay, as after a permanent
    /// error the client has already dealt with.
    pub fn inhibit_backoff(&mut self) {
        debug_assert!(!self.is_started(), "Can only inhibit backoff in a stopped state");
        self.state = StreamState::Initial;
        self.backoff.reset();
    }

    /// Arms the idle timer if the stream is open and no timer is pending.
    pub fn mark_idle(&mut self) {
        if self.is_open() && self.idle_timer.is_none() {
            let timer = self.next_timer;
            self.next_timer += 1;
            self.idle_timer = Some(timer);
            self.actions.push(StreamAction::ScheduleIdleTimeout {
                kind: self.kind,
                generation: self.generation,
                timer,
                delay: self.idle_timeout,
            });
        }
    }

    /// Queues `message` on the open stream and cancels any idle timer.
    pub fn send(&mut self, message: JsonValue) {
        debug_assert!(self.is_open(), "Sending on a stream that is not open");
        self.idle_timer = None;
        self.actions.push(StreamAction::Send {
            kind: self.kind,
            generation: self.generation,
            message,
        });
    }

    /// The connection for `generation` is open. Returns false for a stale
    /// generation.
    pub fn handle_stream_open(&mut self, generation: StreamGeneration) -> bool {
        if !self.is_current(generation) || self.state != StreamState::Starting {
            return false;
        }
        self.state = StreamState::Open;
        true
    }

    /// A message arrived on the stream. Returns false for a stale generation.
    pub fn handle_stream_message(&mut self, generation: StreamGeneration) -> bool {
        if !self.is_current(generation) || !self.is_open() {
            return false;
        }
        // Any response proves the connection is healthy.
        self.backoff.reset();
        true
    }

    /// The stream for `generation` failed to open or ended with `error`.
    /// Returns false for a stale generation.
    pub fn handle_stream_close(&mut self, generation: StreamGeneration, error: FirestoreError) -> bool {
        if !self.is_current(generation) || !self.is_started() {
            return false;
        }
        self.close(StreamState::Error, Some(error));
        true
    }

    /// The backoff delay for `generation` elapsed. Returns false if the
    /// stream was stopped or restarted meanwhile.
    pub fn handle_backoff_elapsed(&mut self, generation: StreamGeneration) -> bool {
        if !self.is_current(generation) || self.state != StreamState::Backoff {
            return false;
        }
        self.open();
        true
    }

    /// The idle timer fired. Closes the stream and returns true when the
    /// timer is still armed.
    pub fn handle_idle_timeout(&mut self, generation: StreamGeneration, timer: u64) -> bool {
        if !self.is_current(generation) || self.idle_timer != Some(timer) || !self.is_open() {
            return false;
        }
        log::debug!(target: LOG_TAG_REMOTE, "Closing idle {} stream", self.kind);
        self.close(StreamState::Initial, None);
        true
    }

    pub fn take_actions(&mut self) -> Vec<StreamAction> {
        std::mem::take(&mut self.actions)
    }

    fn is_current(&self, generation: StreamGeneration) -> bool {
        generation == self.generation
    }

    fn open(&mut self) {
        self.generation += 1;
        self.state = StreamState::Starting;
        self.actions.push(StreamAction::Open {
            kind: self.kind,
            generation: self.generation,
        });
    }

    fn perform_backoff(&mut self) {
        self.state = StreamState::Backoff;
        let delay = self.backoff.next_delay();
        self.actions.push(StreamAction::ScheduleBackoff {
            kind: self.kind,
            generation: self.generation,
            delay,
        });
    }

    fn close(&mut self, final_state: StreamState, error: Option<FirestoreError>) {
        self.idle_timer = None;

        match &error {
            None => self.backoff.reset(),
            Some(error) if error.code == FirestoreErrorCode::ResourceExhausted => {
                log::debug!(
                    target: LOG_TAG_REMOTE,
                    "{} stream exhausted backend resources, using max backoff: {error}",
                    self.kind
                );
                self.backoff.reset_to_max();
            }
            Some(error) if error.code == FirestoreErrorCode::Unauthenticated => {
                self.actions.push(StreamAction::InvalidateCredentials);
            }
            Some(error) => {
                log::debug!(target: LOG_TAG_REMOTE, "{} stream closed: {error}", self.kind);
            }
        }

        self.actions.push(StreamAction::Close {
            kind: self.kind,
            generation: self.generation,
        });
        // Anything still in flight for the closed stream is now stale.
        self.generation += 1;
        self.state = final_state;
    }
}
