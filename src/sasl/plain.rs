//! SASL PLAIN (RFC 4616).

use super::{Credentials, MechanismProvider, SaslError, SaslMechanism};

pub struct PlainProvider;

impl MechanismProvider for PlainProvider {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn priority(&self) -> u32 {
        410
    }

    fn requires_tls(&self) -> bool {
        true
    }

    fn create(&self, credentials: &Credentials) -> Box<dyn SaslMechanism> {
        Box::new(Plain {
            credentials: credentials.clone(),
        })
    }
}

pub struct Plain {
    credentials: Credentials,
}

impl SaslMechanism for Plain {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, SaslError> {
        let authzid = self.credentials.authzid.as_deref().unwrap_or("");
        let mut out = Vec::with_capacity(
            authzid.len() + self.credentials.username.len() + self.credentials.password.len() + 2,
        );
        out.extend_from_slice(authzid.as_bytes());
        out.push(0);
        out.extend_from_slice(self.credentials.username.as_bytes());
        out.push(0);
        out.extend_from_slice(self.credentials.password.as_bytes());
        Ok(Some(out))
    }

    fn challenge(&mut self, _data: &[u8]) -> Result<Vec<u8>, SaslError> {
        Err(SaslError::UnexpectedMessage("challenge"))
    }

    fn success(&mut self, _data: &[u8]) -> Result<(), SaslError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_initial_response() {
        let creds = Credentials {
            username: "juliet".to_string(),
            password: "r0m30".to_string(),
            authzid: None,
        };
        let mut plain = PlainProvider.create(&creds);
        assert_eq!(
            plain.initial_response().unwrap().unwrap(),
            b"\0juliet\0r0m30".to_vec()
        );
        assert!(plain.challenge(b"anything").is_err());
    }
}
