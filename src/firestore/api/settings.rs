//! Client configuration.
//!
//! Every knob has a default matching the hosted backend's expectations, so
//! `FirestoreSettings::new(database_id)` is enough for most callers.

use std::time::Duration;

use crate::firestore::constants::{DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS, MAX_PENDING_WRITES};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::DatabaseId;
use crate::firestore::remote::remote_store::{DEFAULT_IDLE_TIMEOUT, DEFAULT_ONLINE_STATE_TIMEOUT};
use crate::firestore::remote::RemoteStoreSettings;
use crate::util::backoff::BackoffConfig;

/// Attempts made for a local write while persistence reports `unavailable`.
pub const DEFAULT_PERSISTENCE_RETRY_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreSettings {
    database_id: DatabaseId,
    max_concurrent_limbo_resolutions: usize,
    backoff: BackoffConfig,
    idle_timeout: Duration,
    online_state_timeout: Duration,
    max_pending_writes: usize,
    persistence_retry_attempts: u32,
}

impl FirestoreSettings {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            backoff: BackoffConfig::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            online_state_timeout: DEFAULT_ONLINE_STATE_TIMEOUT,
            max_pending_writes: MAX_PENDING_WRITES,
            persistence_retry_attempts: DEFAULT_PERSISTENCE_RETRY_ATTEMPTS,
        }
    }

    pub fn builder(database_id: DatabaseId) -> FirestoreSettingsBuilder {
        FirestoreSettingsBuilder::new(database_id)
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn max_concurrent_limbo_resolutions(&self) -> usize {
        self.max_concurrent_limbo_resolutions
    }

    pub fn backoff(&self) -> BackoffConfig {
        self.backoff
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn online_state_timeout(&self) -> Duration {
        self.online_state_timeout
    }

    pub fn max_pending_writes(&self) -> usize {
        self.max_pending_writes
    }

    pub fn persistence_retry_attempts(&self) -> u32 {
        self.persistence_retry_attempts
    }

    pub fn remote_store_settings(&self) -> RemoteStoreSettings {
        RemoteStoreSettings {
            backoff: self.backoff,
            idle_timeout: self.idle_timeout,
            online_state_timeout: self.online_state_timeout,
            max_pending_writes: self.max_pending_writes,
        }
    }
}

/// Settings for the `demo-project` placeholder project, as used against an
/// emulator or the in-memory connection.
impl Default for FirestoreSettings {
    fn default() -> Self {
        Self::new(DatabaseId::default("demo-project"))
    }
}

#[derive(Clone, Debug)]
pub struct FirestoreSettingsBuilder {
    settings: FirestoreSettings,
}

impl FirestoreSettingsBuilder {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            settings: FirestoreSettings::new(database_id),
        }
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, value: usize) -> Self {
        self.settings.max_concurrent_limbo_resolutions = value;
        self
    }

    pub fn with_backoff(mut self, initial_delay: Duration, backoff_factor: f64, max_delay: Duration) -> Self {
        self.settings.backoff = BackoffConfig {
            initial_delay,
            backoff_factor,
            max_delay,
        };
        self
    }

    pub fn with_idle_timeout(mut self, value: Duration) -> Self {
        self.settings.idle_timeout = value;
        self
    }

    pub fn with_online_state_timeout(mut self, value: Duration) -> Self {
        self.settings.online_state_timeout = value;
        self
    }

    pub fn with_max_pending_writes(mut self, value: usize) -> Self {
        self.settings.max_pending_writes = value;
        self
    }

    pub fn with_persistence_retry_attempts(mut self, value: u32) -> Self {
        self.settings.persistence_retry_attempts = value;
        self
    }

    pub fn build(self) -> FirestoreResult<FirestoreSettings> {
        let settings = self.settings;
        if settings.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument(
                "max_concurrent_limbo_resolutions must be greater than zero",
            ));
        }
        if settings.max_pending_writes == 0 {
            return Err(invalid_argument("max_pending_writes must be greater than zero"));
        }
        if settings.backoff.backoff_factor < 1.0 {
            return Err(invalid_argument("backoff factor must be at least 1.0"));
        }
        if settings.backoff.initial_delay > settings.backoff.max_delay {
            return Err(invalid_argument(
                "initial backoff delay cannot exceed the max delay",
            ));
        }
        if settings.persistence_retry_attempts == 0 {
            return Err(invalid_argument(
                "persistence_retry_attempts must be greater than zero",
            ));
        }
        Ok(settings)
    }
}
