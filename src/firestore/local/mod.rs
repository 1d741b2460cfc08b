//! Client-side cache: documents, pending writes and target metadata.

pub mod local_documents_view;
pub mod local_store;
pub mod mutation_queue;
pub mod overlay;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod target_cache;
pub mod target_data;

#[doc(inline)]
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult};
#[doc(inline)]
pub use persistence::{LocalStorePersistence, MemoryPersistence, NoopPersistence, PersistedState};
pub use reference_set::ReferenceSet;
pub use remote_document_cache::{DocumentMap, MemoryRemoteDocumentCache};
pub use target_data::{ListenSequenceNumber, TargetData, TargetPurpose};
