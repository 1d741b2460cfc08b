//! Public client surface: the queue-driven client, its settings and the
//! credential providers it authenticates with.

pub mod client;
pub mod credentials;
pub mod settings;
pub mod user_data;

pub use client::{ClientCore, FirestoreClient, FirestoreClientBuilder};
pub use credentials::{
    AppCheckCredentialsProvider, AppCheckTokenSource, AuthStateListener, AuthToken, AuthTokenSource,
    CredentialChangeListener, CredentialsProvider, EmptyCredentialsProvider, FirstPartyCredentialsProvider,
    OAuthCredentialsProvider, Token, TokenError,
};
pub use settings::{FirestoreSettings, FirestoreSettingsBuilder};
pub use user_data::SetOptions;
