use std::fmt::{Display, Formatter};

use crate::firestore::constants::LOG_TAG_REMOTE;
use crate::firestore::error::FirestoreError;

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OnlineState {
    /// No connection attempt has succeeded or failed conclusively yet.
    #[default]
    Unknown,
    Online,
    Offline,
}

impl Display for OnlineState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OnlineState::Unknown => "Unknown",
            OnlineState::Online => "Online",
            OnlineState::Offline => "Offline",
        };
        f.write_str(label)
    }
}

/// Number of watch stream failures tolerated while the state is unknown.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Derives the [`OnlineState`] from watch stream outcomes.
///
/// While the state is unknown, the client goes offline after a stream
/// failure or once the connect timeout fires, so cached results are raised
/// without waiting on a backend that may never answer.
#[derive(Debug, Default)]
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    /// Armed while waiting for the first watch stream to open.
    timer_armed: bool,
    should_warn_client_is_offline: bool,
    changes: Vec<OnlineState>,
}

impl OnlineStateTracker {
    pub fn new() -> Self {
        Self {
            should_warn_client_is_offline: true,
            ..Default::default()
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Called when a watch stream starts. Returns true when the caller must
    /// schedule the connect timeout.
    pub fn handle_watch_stream_start(&mut self) -> bool {
        if self.watch_stream_failures == 0 {
            self.set_and_broadcast(OnlineState::Unknown);
            self.timer_armed = true;
            return true;
        }
        false
    }

    /// Called when the connect timeout fires.
    pub fn handle_online_state_timeout(&mut self) {
        if !self.timer_armed {
            return;
        }
        self.timer_armed = false;
        if self.state == OnlineState::Unknown {
            self.log_client_offline_warning_if_necessary(
                "Backend didn't respond within the connect timeout",
            );
            self.set_and_broadcast(OnlineState::Offline);
        }
    }

    pub fn handle_watch_stream_failure(&mut self, error: &FirestoreError) {
        if self.state == OnlineState::Online {
            self.set_and_broadcast(OnlineState::Unknown);
            return;
        }

        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
            self.timer_armed = false;
            self.log_client_offline_warning_if_necessary(&format!(
                "Connection failed {} times. Most recent error: {error}",
                self.watch_stream_failures
            ));
            self.set_and_broadcast(OnlineState::Offline);
        }
    }

    /// Sets the state directly, as when the watch stream delivers data or the
    /// network is disabled.
    pub fn set(&mut self, state: OnlineState) {
        self.timer_armed = false;
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.should_warn_client_is_offline = false;
        }
        self.set_and_broadcast(state);
    }

    /// Whether the connect timeout is still pending.
    pub fn timer_armed(&self) -> bool {
        self.timer_armed
    }

    /// Drains the state transitions recorded since the last call.
    pub fn take_changes(&mut self) -> Vec<OnlineState> {
        std::mem::take(&mut self.changes)
    }

    fn set_and_broadcast(&mut self, state: OnlineState) {
        if state != self.state {
            self.state = state;
            self.changes.push(state);
        }
    }

    fn log_client_offline_warning_if_necessary(&mut self, details: &str) {
        if self.should_warn_client_is_offline {
            log::warn!(
                target: LOG_TAG_REMOTE,
                "Could not reach Cloud Firestore backend. {details}. \
                 The client will operate in offline mode until it is able to reach the backend."
            );
            self.should_warn_client_is_offline = false;
        } else {
            log::debug!(target: LOG_TAG_REMOTE, "{details}");
        }
    }
}
