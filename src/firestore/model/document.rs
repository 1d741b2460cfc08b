use crate::firestore::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

/// What the client knows about a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocumentType {
    /// Nothing is known; placeholder for a key that was never loaded.
    Invalid,
    FoundDocument,
    NoDocument,
    /// The backend committed a write whose result the client cannot compute
    /// (for example a patch on a document it never saw).
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A document as cached locally, possibly with pending writes applied on top.
///
/// Documents carrying local mutations keep the version of the last server
/// state they were derived from until the write is reconciled.
#[derive(Clone, Debug, PartialEq)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    data: MapValue,
    state: DocumentState,
}

impl MutableDocument {
    pub fn new_invalid_document(key: DocumentKey) -> Self {
        Self {
            key,
            document_type: DocumentType::Invalid,
            version: SnapshotVersion::none(),
            read_time: SnapshotVersion::none(),
            data: MapValue::empty(),
            state: DocumentState::Synced,
        }
    }

    pub fn new_found_document(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        Self::new_invalid_document(key).convert_to_found_document(version, data)
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::new_invalid_document(key).convert_to_no_document(version)
    }

    pub fn new_unknown_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::new_invalid_document(key).convert_to_unknown_document(version)
    }

    pub fn convert_to_found_document(mut self, version: SnapshotVersion, data: MapValue) -> Self {
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(mut self, version: SnapshotVersion) -> Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = MapValue::empty();
        self.state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown_document(mut self, version: SnapshotVersion) -> Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = MapValue::empty();
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn with_local_mutations(mut self) -> Self {
        self.state = DocumentState::HasLocalMutations;
        self
    }

    pub fn with_committed_mutations(mut self) -> Self {
        self.state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn with_read_time(mut self, read_time: SnapshotVersion) -> Self {
        self.read_time = read_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn data(&self) -> &MapValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut MapValue {
        &mut self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.field(path)
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }

    pub fn has_local_mutations(&self) -> bool {
        self.state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }
}
