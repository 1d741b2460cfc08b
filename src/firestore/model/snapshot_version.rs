use std::fmt::{Display, Formatter};

use crate::firestore::model::Timestamp;

/// Version of a document or of a consistent watch snapshot.
///
/// `SnapshotVersion::none()` sorts before every real version and marks
/// documents or targets that have never been observed from the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotVersion {
    timestamp: Timestamp,
}

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_micros(micros: i64) -> Self {
        Self::new(Timestamp::new(
            micros.div_euclid(1_000_000),
            (micros.rem_euclid(1_000_000) * 1000) as i32,
        ))
    }

    pub fn is_none(&self) -> bool {
        *self == Self::none()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({})", self.timestamp)
    }
}
