//! Bearer credential access.
//!
//! Token issuance lives outside this crate. Both the request executor and
//! the stream client read the current token through [`CredentialProvider`]
//! at the moment they need it, so a refreshed token is picked up on the next
//! attempt or reconnect.

use std::sync::{Arc, RwLock};

use secrecy::SecretString;

/// Synchronous accessor for the current bearer credential.
pub trait CredentialProvider: Send + Sync {
    /// Returns the current token, or `None` when the user is signed out.
    fn bearer_token(&self) -> Option<SecretString>;
}

impl<F> CredentialProvider for F
where
    F: Fn() -> Option<SecretString> + Send + Sync,
{
    fn bearer_token(&self) -> Option<SecretString> {
        self()
    }
}

/// In-memory credential slot that can be swapped at runtime.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentials {
    token: Arc<RwLock<Option<SecretString>>>,
}

impl StaticCredentials {
    /// Creates a provider holding `token`.
    pub fn new(token: SecretString) -> Self {
        Self {
            token: Arc::new(RwLock::new(Some(token))),
        }
    }

    /// Creates a provider that yields no credential.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Replaces the stored token. `None` signs out.
    pub fn set(&self, token: Option<SecretString>) {
        let mut slot = self
            .token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = token;
    }
}

impl CredentialProvider for StaticCredentials {
    fn bearer_token(&self) -> Option<SecretString> {
        self.token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Shared handle used by clients.
pub type SharedCredentials = Arc<dyn CredentialProvider>;
