//! Threshold signature collection.
//!
//! The coordinator fans a signing request out to the configured verifiers,
//! verifies every returned signature by public-key recovery, and succeeds
//! once the threshold is met. Individual signer failures are tolerated up to
//! the point where the threshold becomes unreachable.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{eyre, Result};
use futures::future::join_all;
use reqwest::Client;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::Direction;

/// A 65-byte recoverable signature: 64 compact bytes plus the recovery id.
pub type Signature65 = [u8; 65];

/// What a signing request is for; verifiers audit the records before
/// signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRequest {
    /// Unsigned transaction bytes, hex.
    pub raw_tx: String,
    /// 32-byte multisig digest the signature must cover, hex.
    pub digest: String,
    /// Transfer direction the transaction settles.
    pub direction: Direction,
    /// The records covered by the transaction.
    pub records: Vec<RecordSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSummary {
    pub id: String,
    pub asset: String,
    pub amount: String,
    pub recipient: String,
}

/// Per-verifier signing transport.
#[async_trait]
pub trait SignerClient: Send + Sync {
    /// Ask the verifier at `endpoint` to sign `request`; returns the raw
    /// signature bytes.
    async fn request_signature(&self, endpoint: &str, request: &SignRequest) -> Result<Vec<u8>>;
}

#[async_trait]
impl<T: SignerClient + ?Sized> SignerClient for std::sync::Arc<T> {
    async fn request_signature(&self, endpoint: &str, request: &SignRequest) -> Result<Vec<u8>> {
        (**self).request_signature(endpoint, request).await
    }
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: String,
}

/// HTTP signer transport: POST the request as JSON, expect
/// `{"signature": "0x..."}`.
pub struct HttpSignerClient {
    client: Client,
}

impl HttpSignerClient {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SignerClient for HttpSignerClient {
    async fn request_signature(&self, endpoint: &str, request: &SignRequest) -> Result<Vec<u8>> {
        let response: SignResponse = self
            .client
            .post(endpoint)
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(crate::types::decode_hex(&response.signature)?)
    }
}

/// A configured verifier: where to reach it and the key its signatures must
/// recover to.
#[derive(Debug, Clone)]
pub struct Verifier {
    pub endpoint: String,
    pub pubkey: PublicKey,
}

/// Retry policy for signer requests.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per signer before giving up on it for this round.
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
    /// Wall-clock limit per attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }
}

#[derive(Debug, Error)]
pub enum CollectError {
    /// Fewer valid signatures than the threshold after all retries. Not
    /// transient: the batch is closed out as failed.
    #[error("collected {got} valid signatures, threshold is {need}")]
    Shortfall { got: usize, need: usize },
}

/// Collects M-of-N recoverable signatures over a digest.
pub struct SignatureCoordinator<C> {
    client: C,
    verifiers: Vec<Verifier>,
    threshold: usize,
    retry: RetryConfig,
}

impl<C: SignerClient> SignatureCoordinator<C> {
    pub fn new(client: C, verifiers: Vec<Verifier>, threshold: usize, retry: RetryConfig) -> Self {
        Self {
            client,
            verifiers,
            threshold,
            retry,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn verifiers(&self) -> &[Verifier] {
        &self.verifiers
    }

    /// Gather signatures over `digest` from all verifiers and return exactly
    /// `threshold` valid ones, ordered by the configured verifier order.
    pub async fn collect(
        &self,
        digest: &[u8; 32],
        request: &SignRequest,
    ) -> Result<Vec<Signature65>, CollectError> {
        let rounds = self
            .verifiers
            .iter()
            .map(|verifier| self.collect_from(verifier, digest, request));
        let results = join_all(rounds).await;

        // Deduplicate by recovered key in case two endpoints share one.
        let mut seen: HashSet<PublicKey> = HashSet::new();
        let mut signatures = Vec::new();
        for (verifier, signature) in self.verifiers.iter().zip(results) {
            let Some(signature) = signature else {
                continue;
            };
            if !seen.insert(verifier.pubkey) {
                warn!(endpoint = %verifier.endpoint, "duplicate verifier key, dropping signature");
                continue;
            }
            signatures.push(signature);
            if signatures.len() == self.threshold {
                break;
            }
        }

        if signatures.len() < self.threshold {
            return Err(CollectError::Shortfall {
                got: signatures.len(),
                need: self.threshold,
            });
        }
        Ok(signatures)
    }

    /// One verifier's round: bounded attempts, each under a timeout, the
    /// returned signature checked by recovery against the configured key.
    async fn collect_from(
        &self,
        verifier: &Verifier,
        digest: &[u8; 32],
        request: &SignRequest,
    ) -> Option<Signature65> {
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.backoff_for_attempt(attempt - 1)).await;
            }

            let outcome = tokio::time::timeout(
                self.retry.attempt_timeout,
                self.client.request_signature(&verifier.endpoint, request),
            )
            .await;

            let raw = match outcome {
                Ok(Ok(raw)) => raw,
                Ok(Err(e)) => {
                    warn!(endpoint = %verifier.endpoint, attempt, error = %e, "signer request failed");
                    continue;
                }
                Err(_) => {
                    warn!(endpoint = %verifier.endpoint, attempt, "signer request timed out");
                    continue;
                }
            };

            match verify_signature(&raw, digest, &verifier.pubkey) {
                Ok(signature) => {
                    debug!(endpoint = %verifier.endpoint, attempt, "valid signature collected");
                    return Some(signature);
                }
                Err(e) => {
                    // A bad signature will not get better on retry.
                    warn!(endpoint = %verifier.endpoint, error = %e, "invalid signature rejected");
                    return None;
                }
            }
        }
        None
    }
}

/// Check a 65-byte signature by recovering the signing key from the digest
/// and comparing it with the expected one.
pub fn verify_signature(
    raw: &[u8],
    digest: &[u8; 32],
    expected: &PublicKey,
) -> Result<Signature65> {
    if raw.len() != 65 {
        return Err(eyre!("signature must be 65 bytes, got {}", raw.len()));
    }
    let recovery_id = RecoveryId::from_i32(raw[64] as i32)
        .map_err(|e| eyre!("bad recovery id {}: {e}", raw[64]))?;
    let signature = RecoverableSignature::from_compact(&raw[..64], recovery_id)
        .map_err(|e| eyre!("malformed signature: {e}"))?;

    let message = Message::from_digest(*digest);
    let recovered = Secp256k1::new()
        .recover_ecdsa(&message, &signature)
        .map_err(|e| eyre!("signature recovery failed: {e}"))?;
    if &recovered != expected {
        return Err(eyre!("signature recovers to an unexpected key"));
    }

    let mut out = [0u8; 65];
    out.copy_from_slice(raw);
    Ok(out)
}

/// Produce a 65-byte recoverable signature over a digest. Used for the local
/// hot-key signature on every built transaction.
pub fn sign_recoverable(secret: &SecretKey, digest: &[u8; 32]) -> Signature65 {
    let message = Message::from_digest(*digest);
    let signature = Secp256k1::new().sign_ecdsa_recoverable(&message, secret);
    let (recovery_id, compact) = signature.serialize_compact();

    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&compact);
    out[64] = recovery_id.to_i32() as u8;
    out
}
