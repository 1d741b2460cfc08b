use std::fmt::{Display, Formatter};

/// Identity that scopes the mutation queue and credential tokens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn authenticated(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    /// Principal used by first-party (Google-internal) credentials.
    pub fn first_party() -> Self {
        Self::authenticated("first-party-uid")
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key used to partition per-user local state.
    pub fn to_key(&self) -> String {
        self.uid.clone().unwrap_or_else(|| "anonymous-user".to_string())
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "User({uid})"),
            None => write!(f, "User(unauthenticated)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_users() {
        assert_eq!(User::unauthenticated().to_key(), "anonymous-user");
        assert_eq!(User::authenticated("u1").to_key(), "u1");
        assert!(!User::default().is_authenticated());
    }
}
