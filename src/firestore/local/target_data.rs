use crate::firestore::core::{Target, TargetId};
use crate::firestore::model::SnapshotVersion;

pub type ListenSequenceNumber = i64;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    /// A user-initiated listen.
    Listen,
    /// Re-listen after an existence filter mismatch.
    ExistenceFilterMismatch,
    /// Re-listen after a mismatch that the Bloom filter could not resolve.
    ExistenceFilterMismatchBloom,
    /// Single-document target resolving a limbo document.
    LimboResolution,
}

/// A target together with the metadata the client tracks for it.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Version of the last consistent snapshot received for this target.
    pub snapshot_version: SnapshotVersion,
    /// Latest snapshot version at which the target had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    /// Opaque backend cursor for resuming the listen.
    pub resume_token: Vec<u8>,
    /// Number of documents expected to match when resuming, if known.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::none(),
            last_limbo_free_snapshot_version: SnapshotVersion::none(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// New resume position. Clears any expected count, which only applies
    /// to the token it was recorded with.
    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: Option<i32>) -> Self {
        Self {
            expected_count,
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }

    pub fn with_purpose(&self, purpose: TargetPurpose) -> Self {
        Self {
            purpose,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DocumentKey, SnapshotVersion};

    #[test]
    fn resume_token_resets_expected_count() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let data = TargetData::new(Target::for_document(&key), 2, TargetPurpose::Listen, 1)
            .with_expected_count(Some(3));
        let resumed = data.with_resume_token(b"t".to_vec(), SnapshotVersion::from_micros(4));
        assert_eq!(resumed.expected_count, None);
        assert_eq!(resumed.resume_token, b"t".to_vec());
        assert_eq!(resumed.target_id, 2);
    }
}
