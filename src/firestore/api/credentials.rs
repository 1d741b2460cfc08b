//! Credential providers feeding request metadata to the streams.
//!
//! The client asks its providers for a [`Token`] each time it opens a stream
//! and learns about user changes through the listener passed to
//! [`CredentialsProvider::start`].

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_lock::Mutex as AsyncMutex;
use async_trait::async_trait;

use crate::firestore::constants::LOG_TAG_REMOTE;
use crate::firestore::error::{unauthenticated, FirestoreResult};
use crate::firestore::model::User;

/// Error returned by external token sources.
#[derive(Debug, Clone)]
pub struct TokenError {
    message: String,
}

impl TokenError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn from_error(err: impl Error) -> Self {
        Self::new(err.to_string())
    }
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for TokenError {}

/// Request headers proving the identity of `user`.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub headers: BTreeMap<String, String>,
    pub user: User,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.headers.keys().map(String::as_str).collect();
        f.debug_struct("Token")
            .field("headers", &names)
            .field("user", &self.user)
            .finish()
    }
}

/// Invoked with the current user when the provider starts and whenever the
/// signed-in user changes.
pub type CredentialChangeListener = Arc<dyn Fn(User) + Send + Sync>;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// Returns the headers for the next request, or `None` when the client
    /// runs unauthenticated.
    async fn get_token(&self, force_refresh: bool) -> FirestoreResult<Option<Token>>;

    /// Makes the next `get_token` bypass any cached token.
    fn invalidate_token(&self);

    fn start(&self, listener: CredentialChangeListener);

    /// Stops notifying the listener passed to `start`.
    fn shutdown(&self);
}

/// Provider for clients that never authenticate.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyCredentialsProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self, _force_refresh: bool) -> FirestoreResult<Option<Token>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn start(&self, listener: CredentialChangeListener) {
        listener(User::unauthenticated());
    }

    fn shutdown(&self) {}
}

/// Produces the `Authorization` header of a first-party session.
pub type AuthHeaderFactory = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Credentials for Google-internal (first-party) clients.
pub struct FirstPartyCredentialsProvider {
    session_index: String,
    iam_token: Option<String>,
    auth_header_factory: Option<AuthHeaderFactory>,
}

impl FirstPartyCredentialsProvider {
    pub fn new(session_index: impl Into<String>) -> Self {
        Self {
            session_index: session_index.into(),
            iam_token: None,
            auth_header_factory: None,
        }
    }

    pub fn with_iam_token(mut self, token: impl Into<String>) -> Self {
        self.iam_token = Some(token.into());
        self
    }

    pub fn with_auth_header_factory(mut self, factory: AuthHeaderFactory) -> Self {
        self.auth_header_factory = Some(factory);
        self
    }

    fn token(&self) -> Token {
        let mut headers = BTreeMap::new();
        headers.insert("X-Goog-AuthUser".to_string(), self.session_index.clone());
        if let Some(authorization) = self.auth_header_factory.as_ref().and_then(|factory| factory()) {
            headers.insert("Authorization".to_string(), authorization);
        }
        if let Some(iam_token) = &self.iam_token {
            headers.insert("X-Goog-Iam-Authorization-Token".to_string(), iam_token.clone());
        }
        Token {
            headers,
            user: User::first_party(),
        }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for FirstPartyCredentialsProvider {
    async fn get_token(&self, _force_refresh: bool) -> FirestoreResult<Option<Token>> {
        Ok(Some(self.token()))
    }

    fn invalidate_token(&self) {}

    fn start(&self, listener: CredentialChangeListener) {
        listener(User::first_party());
    }

    fn shutdown(&self) {}
}

/// An OAuth access token with the uid it was minted for.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub access_token: String,
    pub uid: Option<String>,
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("access_token", &"<redacted>")
            .field("uid", &self.uid)
            .finish()
    }
}

/// Receives the uid of the signed-in user, `None` once signed out.
pub type AuthStateListener = Arc<dyn Fn(Option<String>) + Send + Sync>;

/// An external authentication system, such as an auth SDK instance.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait AuthTokenSource: Send + Sync + 'static {
    async fn get_token(&self, force_refresh: bool) -> Result<Option<AuthToken>, TokenError>;

    /// Registers `listener`. It is invoked right away with the current uid.
    fn add_token_listener(&self, listener: AuthStateListener);
}

struct OAuthState {
    user: User,
    listener: Option<CredentialChangeListener>,
}

/// Bearer-token credentials backed by an [`AuthTokenSource`].
pub struct OAuthCredentialsProvider {
    source: Arc<dyn AuthTokenSource>,
    force_refresh: AtomicBool,
    /// Bumped on every user change, so a token fetched across a change is
    /// discarded.
    token_counter: Arc<AtomicU64>,
    state: Arc<Mutex<OAuthState>>,
}

impl OAuthCredentialsProvider {
    pub fn new(source: Arc<dyn AuthTokenSource>) -> Self {
        Self {
            source,
            force_refresh: AtomicBool::new(false),
            token_counter: Arc::new(AtomicU64::new(0)),
            state: Arc::new(Mutex::new(OAuthState {
                user: User::unauthenticated(),
                listener: None,
            })),
        }
    }

    fn current_user(&self) -> User {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .user
            .clone()
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for OAuthCredentialsProvider {
    async fn get_token(&self, force_refresh: bool) -> FirestoreResult<Option<Token>> {
        loop {
            let counter = self.token_counter.load(Ordering::SeqCst);
            let force = self.force_refresh.swap(false, Ordering::SeqCst) || force_refresh;
            let token = self
                .source
                .get_token(force)
                .await
                .map_err(|err| unauthenticated(format!("Failed to get auth token: {err}")))?;

            if counter != self.token_counter.load(Ordering::SeqCst) {
                log::debug!(
                    target: LOG_TAG_REMOTE,
                    "Auth token changed while the request was in flight, retrying"
                );
                continue;
            }

            return Ok(token.map(|token| {
                let mut headers = BTreeMap::new();
                headers.insert(
                    "Authorization".to_string(),
                    format!("Bearer {}", token.access_token),
                );
                let user = match token.uid {
                    Some(uid) => User::authenticated(uid),
                    None => self.current_user(),
                };
                Token { headers, user }
            }));
        }
    }

    fn invalidate_token(&self) {
        self.force_refresh.store(true, Ordering::SeqCst);
    }

    fn start(&self, listener: CredentialChangeListener) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listener = Some(listener);

        let state = Arc::clone(&self.state);
        let token_counter = Arc::clone(&self.token_counter);
        self.source.add_token_listener(Arc::new(move |uid: Option<String>| {
            let user = uid.map(User::authenticated).unwrap_or_default();
            let listener = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                token_counter.fetch_add(1, Ordering::SeqCst);
                state.user = user.clone();
                state.listener.clone()
            };
            if let Some(listener) = listener {
                listener(user);
            }
        }));
    }

    fn shutdown(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listener = None;
    }
}

/// Issuer of App Check tokens.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait AppCheckTokenSource: Send + Sync + 'static {
    async fn get_token(&self, force_refresh: bool) -> Result<Option<String>, TokenError>;
}

/// Attaches the `X-Firebase-AppCheck` header. App Check does not identify a
/// user, so the listener only ever sees the unauthenticated user.
pub struct AppCheckCredentialsProvider {
    source: Arc<dyn AppCheckTokenSource>,
    force_refresh: AtomicBool,
    latest_token: AsyncMutex<Option<String>>,
}

impl AppCheckCredentialsProvider {
    pub fn new(source: Arc<dyn AppCheckTokenSource>) -> Self {
        Self {
            source,
            force_refresh: AtomicBool::new(false),
            latest_token: AsyncMutex::new(None),
        }
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for AppCheckCredentialsProvider {
    async fn get_token(&self, force_refresh: bool) -> FirestoreResult<Option<Token>> {
        let force = self.force_refresh.swap(false, Ordering::SeqCst) || force_refresh;
        let mut latest = self.latest_token.lock().await;
        match self.source.get_token(force).await {
            Ok(token) => *latest = token,
            // A stale token still lets the backend attribute the request.
            Err(err) => {
                log::warn!(
                    target: LOG_TAG_REMOTE,
                    "Error getting App Check token; using the previous token if any: {err}"
                );
            }
        }
        Ok(latest.clone().map(|token| {
            let mut headers = BTreeMap::new();
            headers.insert("X-Firebase-AppCheck".to_string(), token);
            Token {
                headers,
                user: User::unauthenticated(),
            }
        }))
    }

    fn invalidate_token(&self) {
        self.force_refresh.store(true, Ordering::SeqCst);
    }

    fn start(&self, _listener: CredentialChangeListener) {}

    fn shutdown(&self) {}
}
