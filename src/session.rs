use crate::types::notification::{AuthResponse, User};
use log::info;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Opaque bearer token. Cloning is cheap and `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::from(token.into()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Value for an `Authorization` header.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Answer of the session owner when the server refuses the realtime handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectionPolicy {
    /// Keep retrying within the reconnect budget.
    #[default]
    Retry,
    /// Stop now and leave the status at `error`.
    GiveUp,
}

/// Boundary to whatever owns the user's authentication lifecycle.
///
/// The realtime and REST layers only ever read the credential through this
/// trait; they never store it.
pub trait SessionGate: Send + Sync {
    fn current_credential(&self) -> Option<Credential>;

    fn is_authenticated(&self) -> bool {
        self.current_credential().is_some()
    }

    /// Called when the realtime handshake is rejected with `reason`.
    fn handshake_rejected(&self, _reason: &str) -> RejectionPolicy {
        RejectionPolicy::Retry
    }

    /// Called when a REST call comes back `401 Unauthorized`.
    fn unauthorized(&self) {}
}

#[derive(Debug, Clone)]
struct SignedIn {
    credential: Credential,
    user: Option<User>,
}

/// In-memory session holding the token handed out by the token issuer.
#[derive(Debug, Default)]
pub struct TokenSession {
    state: RwLock<Option<SignedIn>>,
    give_up_on_rejection: bool,
}

impl TokenSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let session = Self::new();
        session.set(Some(SignedIn {
            credential: Credential::new(token),
            user: None,
        }));
        session
    }

    /// Make a rejected realtime handshake final instead of retrying it.
    pub fn give_up_on_rejection(mut self, give_up: bool) -> Self {
        self.give_up_on_rejection = give_up;
        self
    }

    pub fn sign_in(&self, auth: AuthResponse) {
        info!(target: "Session", "Signed in as {}", auth.user.email);
        self.set(Some(SignedIn {
            credential: Credential::new(auth.access_token),
            user: Some(auth.user),
        }));
    }

    pub fn sign_out(&self) {
        if self.state.read().unwrap_or_else(PoisonError::into_inner).is_some() {
            info!(target: "Session", "Signed out");
        }
        self.set(None);
    }

    pub fn user(&self) -> Option<User> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|s| s.user.clone())
    }

    fn set(&self, value: Option<SignedIn>) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

impl SessionGate for TokenSession {
    fn current_credential(&self) -> Option<Credential> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.credential.clone())
    }

    fn handshake_rejected(&self, _reason: &str) -> RejectionPolicy {
        if self.give_up_on_rejection {
            RejectionPolicy::GiveUp
        } else {
            RejectionPolicy::Retry
        }
    }

    fn unauthorized(&self) {
        self.sign_out();
    }
}
