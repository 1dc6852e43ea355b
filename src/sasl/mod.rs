//! Pluggable SASL mechanism set.
//!
//! A [`MechanismProvider`] creates a fresh [`SaslMechanism`] for every
//! authentication attempt. [`SaslProviders`] keeps providers in preference
//! order and picks the ones usable against what the server offers.

mod plain;
mod scram;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub use plain::{Plain, PlainProvider};
pub use scram::{Scram, ScramHash, ScramProvider};

/// Client-side failure while running a mechanism.
#[derive(Debug, Error)]
pub enum SaslError {
    #[error("malformed server message: {0}")]
    MalformedChallenge(String),

    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,

    #[error("server signature verification failed")]
    BadServerSignature,

    #[error("server reported: {0}")]
    ServerError(String),

    #[error("unexpected {0} from the server")]
    UnexpectedMessage(&'static str),

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Authorization identity, when it differs from the authenticated one.
    pub authzid: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("authzid", &self.authzid)
            .finish()
    }
}

/// One running authentication exchange.
pub trait SaslMechanism: Send {
    fn name(&self) -> &str;

    /// Payload of `<auth/>`, `None` when the mechanism waits for a challenge.
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, SaslError>;

    fn challenge(&mut self, data: &[u8]) -> Result<Vec<u8>, SaslError>;

    /// Verify the additional data carried by `<success/>`.
    fn success(&mut self, data: &[u8]) -> Result<(), SaslError>;
}

pub trait MechanismProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower values are tried first.
    fn priority(&self) -> u32;

    /// Mechanisms that expose the password are refused on plaintext streams.
    fn requires_tls(&self) -> bool {
        false
    }

    fn create(&self, credentials: &Credentials) -> Box<dyn SaslMechanism>;
}

#[derive(Clone)]
pub struct SaslProviders {
    providers: Vec<Arc<dyn MechanismProvider>>,
}

impl SaslProviders {
    pub fn empty() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Add a provider, replacing any provider with the same name.
    pub fn register(&mut self, provider: Arc<dyn MechanismProvider>) {
        self.providers.retain(|p| p.name() != provider.name());
        self.providers.push(provider);
        self.providers.sort_by_key(|p| p.priority());
    }

    pub fn unregister(&mut self, name: &str) {
        self.providers.retain(|p| p.name() != name);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Providers the server offers and the transport allows, in preference order.
    pub fn select(
        &self,
        offered: &[String],
        secure: bool,
        allow_plain_without_tls: bool,
    ) -> Vec<Arc<dyn MechanismProvider>> {
        self.providers
            .iter()
            .filter(|p| offered.iter().any(|o| o == p.name()))
            .filter(|p| secure || !p.requires_tls() || allow_plain_without_tls)
            .cloned()
            .collect()
    }
}

impl Default for SaslProviders {
    fn default() -> Self {
        let mut providers = SaslProviders::empty();
        providers.register(Arc::new(ScramProvider::new(ScramHash::Sha256)));
        providers.register(Arc::new(ScramProvider::new(ScramHash::Sha1)));
        providers.register(Arc::new(PlainProvider));
        providers
    }
}

impl fmt::Debug for SaslProviders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offered(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_preference_order() {
        let providers = SaslProviders::default();
        assert_eq!(providers.names(), vec!["SCRAM-SHA-256", "SCRAM-SHA-1", "PLAIN"]);
    }

    #[test]
    fn test_select_keeps_preference_not_server_order() {
        let providers = SaslProviders::default();
        let selected = providers.select(&offered(&["PLAIN", "SCRAM-SHA-1"]), true, false);
        let names: Vec<_> = selected.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["SCRAM-SHA-1", "PLAIN"]);
    }

    #[test]
    fn test_plain_refused_without_tls() {
        let providers = SaslProviders::default();
        assert!(providers.select(&offered(&["PLAIN"]), false, false).is_empty());
        assert_eq!(providers.select(&offered(&["PLAIN"]), false, true).len(), 1);
    }

    #[test]
    fn test_no_common_mechanism() {
        let providers = SaslProviders::default();
        assert!(providers
            .select(&offered(&["X-OAUTH2", "EXTERNAL"]), true, true)
            .is_empty());
    }

    #[test]
    fn test_register_replaces_same_name() {
        let mut providers = SaslProviders::default();
        providers.unregister("SCRAM-SHA-256");
        providers.register(Arc::new(PlainProvider));
        assert_eq!(providers.names(), vec!["SCRAM-SHA-1", "PLAIN"]);
    }
}
