use std::cmp::Ordering;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Opaque binary field value. Sorts bytewise.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BytesValue(Vec<u8>);

impl BytesValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Decodes the wire form. The backend pads its output but older
    /// caches hold unpadded strings, so both are accepted.
    pub fn from_base64(encoded: &str) -> FirestoreResult<Self> {
        let trimmed = encoded.trim_end_matches('=');
        STANDARD_NO_PAD
            .decode(trimmed)
            .map(Self)
            .map_err(|err| invalid_argument(format!("Invalid base64 bytes value: {err}")))
    }

    /// Padded standard alphabet, as the REST and JSON wire formats expect.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl PartialOrd for BytesValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BytesValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.as_slice().cmp(other.0.as_slice())
    }
}

impl From<Vec<u8>> for BytesValue {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl From<&[u8]> for BytesValue {
    fn from(value: &[u8]) -> Self {
        Self::new(value.to_vec())
    }
}
