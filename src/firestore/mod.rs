pub mod api;
mod constants;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod value;

pub use api::{
    CredentialsProvider, FirestoreClient, FirestoreClientBuilder, FirestoreSettings, SetOptions,
};
pub use self::core::{ListenOptions, ListenerId, Query, ViewSnapshot, WriteCompletion};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use model::{DatabaseId, DocumentKey, Mutation, User};
pub use value::FirestoreValue;
