mod database_id;
mod document;
mod document_key;
mod field_mask;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod resource_path;
pub mod server_timestamps;
mod snapshot_version;
mod timestamp;
mod user;

pub use database_id::DatabaseId;
pub use document::{DocumentState, DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use field_mask::FieldMask;
pub use field_path::FieldPath;
pub use geo_point::GeoPoint;
pub use mutation::{
    FieldTransform, Mutation, MutationKind, MutationResult, Precondition, TransformOperation,
};
pub use mutation_batch::{BatchId, MutationBatch, MutationBatchResult};
pub use resource_path::ResourcePath;
pub use server_timestamps::ServerTimestampBehavior;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
pub use user::User;
