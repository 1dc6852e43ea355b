//! SCRAM-SHA-1 and SCRAM-SHA-256 (RFC 5802, RFC 7677), without channel binding.

use std::num::NonZeroU32;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use ring::{digest, hmac, pbkdf2};

use super::{Credentials, MechanismProvider, SaslError, SaslMechanism};

const CLIENT_NONCE_LENGTH: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramHash {
    Sha1,
    Sha256,
}

impl ScramHash {
    fn mechanism(&self) -> &'static str {
        match self {
            ScramHash::Sha1 => "SCRAM-SHA-1",
            ScramHash::Sha256 => "SCRAM-SHA-256",
        }
    }

    fn pbkdf2(&self) -> pbkdf2::Algorithm {
        match self {
            ScramHash::Sha1 => pbkdf2::PBKDF2_HMAC_SHA1,
            ScramHash::Sha256 => pbkdf2::PBKDF2_HMAC_SHA256,
        }
    }

    fn hmac(&self) -> hmac::Algorithm {
        match self {
            ScramHash::Sha1 => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            ScramHash::Sha256 => hmac::HMAC_SHA256,
        }
    }

    fn digest(&self) -> &'static digest::Algorithm {
        match self {
            ScramHash::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            ScramHash::Sha256 => &digest::SHA256,
        }
    }

    fn output_len(&self) -> usize {
        self.digest().output_len()
    }
}

pub struct ScramProvider {
    hash: ScramHash,
}

impl ScramProvider {
    pub fn new(hash: ScramHash) -> Self {
        Self { hash }
    }
}

impl MechanismProvider for ScramProvider {
    fn name(&self) -> &'static str {
        self.hash.mechanism()
    }

    fn priority(&self) -> u32 {
        match self.hash {
            ScramHash::Sha256 => 100,
            ScramHash::Sha1 => 110,
        }
    }

    fn create(&self, credentials: &Credentials) -> Box<dyn SaslMechanism> {
        Box::new(Scram::new(self.hash, credentials, generate_nonce()))
    }
}

fn generate_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CLIENT_NONCE_LENGTH)
        .map(char::from)
        .collect()
}

enum ScramState {
    Initial,
    ClientFirstSent,
    ClientFinalSent { server_signature: Vec<u8> },
    Verified,
}

pub struct Scram {
    hash: ScramHash,
    credentials: Credentials,
    client_nonce: String,
    gs2_header: String,
    client_first_bare: String,
    state: ScramState,
}

impl Scram {
    pub fn new(hash: ScramHash, credentials: &Credentials, client_nonce: String) -> Self {
        let gs2_header = match &credentials.authzid {
            Some(authzid) => format!("n,a={},", escape_name(authzid)),
            None => "n,,".to_string(),
        };
        let client_first_bare = format!(
            "n={},r={}",
            escape_name(&credentials.username),
            client_nonce
        );
        Self {
            hash,
            credentials: credentials.clone(),
            client_nonce,
            gs2_header,
            client_first_bare,
            state: ScramState::Initial,
        }
    }

    fn hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let key = hmac::Key::new(self.hash.hmac(), key);
        hmac::sign(&key, data).as_ref().to_vec()
    }

    fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>, SaslError> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|e| SaslError::MalformedChallenge(e.to_string()))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            match part.split_once('=') {
                Some(("r", value)) => nonce = Some(value),
                Some(("s", value)) => salt = Some(BASE64.decode(value)?),
                Some(("i", value)) => iterations = value.parse::<u32>().ok(),
                Some(("m", _)) => {
                    return Err(SaslError::MalformedChallenge(
                        "mandatory extension not supported".to_string(),
                    ))
                }
                Some(("e", value)) => return Err(SaslError::ServerError(value.to_string())),
                _ => {}
            }
        }
        let nonce =
            nonce.ok_or_else(|| SaslError::MalformedChallenge("missing nonce".to_string()))?;
        let salt = salt.ok_or_else(|| SaslError::MalformedChallenge("missing salt".to_string()))?;
        let iterations = iterations
            .and_then(NonZeroU32::new)
            .ok_or_else(|| SaslError::MalformedChallenge("missing iteration count".to_string()))?;
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(SaslError::NonceMismatch);
        }

        let mut salted_password = vec![0u8; self.hash.output_len()];
        pbkdf2::derive(
            self.hash.pbkdf2(),
            iterations,
            &salt,
            self.credentials.password.as_bytes(),
            &mut salted_password,
        );
        let client_key = self.hmac(&salted_password, b"Client Key");
        let stored_key = digest::digest(self.hash.digest(), &client_key);

        let without_proof = format!(
            "c={},r={}",
            BASE64.encode(self.gs2_header.as_bytes()),
            nonce
        );
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );
        let client_signature = self.hmac(stored_key.as_ref(), auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = self.hmac(&salted_password, b"Server Key");
        let server_signature = self.hmac(&server_key, auth_message.as_bytes());
        self.state = ScramState::ClientFinalSent { server_signature };

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    fn verify_server_final(&mut self, data: &[u8]) -> Result<(), SaslError> {
        let ScramState::ClientFinalSent { server_signature } = &self.state else {
            return Err(SaslError::UnexpectedMessage("server-final message"));
        };
        let server_final = std::str::from_utf8(data)
            .map_err(|e| SaslError::MalformedChallenge(e.to_string()))?;
        if let Some(error) = server_final.strip_prefix("e=") {
            return Err(SaslError::ServerError(error.to_string()));
        }
        let verifier = server_final
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or_else(|| SaslError::MalformedChallenge("missing verifier".to_string()))?;
        if BASE64.decode(verifier)? != *server_signature {
            return Err(SaslError::BadServerSignature);
        }
        self.state = ScramState::Verified;
        Ok(())
    }
}

impl SaslMechanism for Scram {
    fn name(&self) -> &str {
        self.hash.mechanism()
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, SaslError> {
        self.state = ScramState::ClientFirstSent;
        Ok(Some(
            format!("{}{}", self.gs2_header, self.client_first_bare).into_bytes(),
        ))
    }

    fn challenge(&mut self, data: &[u8]) -> Result<Vec<u8>, SaslError> {
        match self.state {
            ScramState::ClientFirstSent => self.client_final(data),
            // Some servers send the verifier as a challenge and an empty success
            ScramState::ClientFinalSent { .. } => {
                self.verify_server_final(data)?;
                Ok(Vec::new())
            }
            ScramState::Initial | ScramState::Verified => {
                Err(SaslError::UnexpectedMessage("challenge"))
            }
        }
    }

    fn success(&mut self, data: &[u8]) -> Result<(), SaslError> {
        match self.state {
            ScramState::Verified if data.is_empty() => Ok(()),
            _ => self.verify_server_final(data),
        }
    }
}

/// `saslname` escaping of RFC 5802 §5.1.
fn escape_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}
