// Request signing
// The signature header value is "{digest},{timestamp_ms},{nonce}" where the
// digest covers timestamp, nonce and client key. The digest algorithm is a
// pluggable capability.

use crate::error::SigningError;
use crate::model::{hex, Credentials};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Digest capability used by [`Signer`].
pub trait SignatureAlgorithm: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Returns the lowercase hex digest of `input`.
    fn digest(&self, input: &[u8]) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Signature;

impl SignatureAlgorithm for Sha256Signature {
    fn name(&self) -> &str {
        "sha256"
    }

    fn digest(&self, input: &[u8]) -> String {
        hex(&Sha256::digest(input))
    }
}

/// Source of per-request nonces.
pub trait NonceSource: Send + Sync + fmt::Debug {
    fn next_nonce(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RandomNonce;

impl NonceSource for RandomNonce {
    fn next_nonce(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

/// Always yields the same nonce. Only useful where signatures must be
/// reproducible.
#[derive(Debug, Clone)]
pub struct FixedNonce(pub String);

impl NonceSource for FixedNonce {
    fn next_nonce(&self) -> String {
        self.0.clone()
    }
}

#[derive(Debug, Clone)]
pub struct Signer {
    algorithm: Arc<dyn SignatureAlgorithm>,
    nonces: Arc<dyn NonceSource>,
}

impl Signer {
    pub fn new(algorithm: Arc<dyn SignatureAlgorithm>, nonces: Arc<dyn NonceSource>) -> Self {
        Signer { algorithm, nonces }
    }

    pub fn algorithm(&self) -> &dyn SignatureAlgorithm {
        self.algorithm.as_ref()
    }

    /// Signs with explicit inputs. Identical inputs give identical output.
    pub fn sign(
        &self,
        credentials: &Credentials,
        timestamp_ms: i64,
        nonce: &str,
    ) -> Result<String, SigningError> {
        if credentials.application_id.is_empty() {
            return Err(SigningError::MissingApplicationId);
        }
        if credentials.client_key.is_empty() {
            return Err(SigningError::MissingClientKey);
        }

        let input = format!("{}{}{}", timestamp_ms, nonce, credentials.client_key);
        let digest = self.algorithm.digest(input.as_bytes());
        Ok(format!("{},{},{}", digest, timestamp_ms, nonce))
    }

    /// Signs with the current wall-clock time and a fresh nonce.
    pub fn sign_now(&self, credentials: &Credentials) -> Result<String, SigningError> {
        let nonce = self.nonces.next_nonce();
        self.sign(credentials, Utc::now().timestamp_millis(), &nonce)
    }
}

impl Default for Signer {
    fn default() -> Self {
        Signer::new(Arc::new(Sha256Signature), Arc::new(RandomNonce))
    }
}
