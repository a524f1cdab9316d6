//! custodial signing: key service adapters and the process-wide signer
//!
//! the private key never leaves the key service. [`Signer`] fetches the
//! public key once, derives the address, and from then on only sends
//! 32-byte digests out for signing.

use crate::address::Address;
use crate::error::{PayoutError, Result};
use crate::retry::{with_backoff, RetryPolicy};
use crate::signature::{self, RawSignature};
use crate::tx;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::pkcs8::{DecodePublicKey, EncodePublicKey};
use k256::PublicKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// remote key-management service
#[async_trait]
pub trait KeyManagementService: Send + Sync {
    /// DER-encoded SubjectPublicKeyInfo
    async fn get_public_key(&self, key_id: &str) -> Result<Vec<u8>>;

    /// sign a 32-byte digest; `s` may come back in either form
    async fn sign(&self, key_id: &str, digest: &[u8; 32]) -> Result<RawSignature>;
}

/// JSON key service speaking the `TrentService` wire protocol
pub struct HttpKms {
    endpoint: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct GetPublicKeyRequest<'a> {
    #[serde(rename = "KeyId")]
    key_id: &'a str,
}

#[derive(Deserialize)]
struct GetPublicKeyResponse {
    #[serde(rename = "PublicKey")]
    public_key: String,
}

#[derive(Serialize)]
struct SignMessageRequest<'a> {
    #[serde(rename = "KeyId")]
    key_id: &'a str,
    #[serde(rename = "Message")]
    message: String,
    #[serde(rename = "MessageType")]
    message_type: &'static str,
    #[serde(rename = "SigningAlgorithm")]
    signing_algorithm: &'static str,
}

#[derive(Deserialize)]
struct SignResponse {
    #[serde(rename = "Signature")]
    signature: String,
}

impl HttpKms {
    pub fn new(endpoint: &str, retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PayoutError::Config(format!("kms client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
            retry,
        })
    }

    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        target: &str,
        body: &Req,
    ) -> Result<Resp> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Amz-Target", format!("TrentService.{}", target))
            .header("Content-Type", "application/x-amz-json-1.1")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PayoutError::Kms(format!("{} returned {}: {}", target, status, text)));
        }
        response
            .json()
            .await
            .map_err(|e| PayoutError::Kms(format!("{} response: {}", target, e)))
    }
}

#[async_trait]
impl KeyManagementService for HttpKms {
    async fn get_public_key(&self, key_id: &str) -> Result<Vec<u8>> {
        let request = GetPublicKeyRequest { key_id };
        let resp: GetPublicKeyResponse = with_backoff(&self.retry, "kms get_public_key", || {
            self.call("GetPublicKey", &request)
        })
        .await?;
        BASE64
            .decode(resp.public_key)
            .map_err(|e| PayoutError::MalformedPublicKey(format!("base64: {}", e)))
    }

    async fn sign(&self, key_id: &str, digest: &[u8; 32]) -> Result<RawSignature> {
        let request = SignMessageRequest {
            key_id,
            message: BASE64.encode(digest),
            message_type: "DIGEST",
            signing_algorithm: "ECDSA_SHA_256",
        };
        let resp: SignResponse =
            with_backoff(&self.retry, "kms sign", || self.call("Sign", &request)).await?;
        let der = BASE64
            .decode(resp.signature)
            .map_err(|e| PayoutError::Kms(format!("signature base64: {}", e)))?;
        RawSignature::from_der(&der)
    }
}

/// in-process key service for tests and local runs
pub struct LocalKms {
    key: SigningKey,
    high_s: bool,
}

impl LocalKms {
    pub fn from_secret(secret: &[u8]) -> Result<Self> {
        let key = SigningKey::from_slice(secret)
            .map_err(|e| PayoutError::Config(format!("invalid secret key: {}", e)))?;
        Ok(Self { key, high_s: false })
    }

    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_hex.trim().trim_start_matches("0x"))
            .map_err(|e| PayoutError::Config(format!("secret key hex: {}", e)))?;
        Self::from_secret(&bytes)
    }

    /// return `n - s` instead of the low form, like an HSM that does not
    /// normalize
    pub fn with_high_s(mut self) -> Self {
        self.high_s = true;
        self
    }
}

#[async_trait]
impl KeyManagementService for LocalKms {
    async fn get_public_key(&self, _key_id: &str) -> Result<Vec<u8>> {
        let public = PublicKey::from(self.key.verifying_key());
        let der = public
            .to_public_key_der()
            .map_err(|e| PayoutError::Kms(format!("spki encode: {}", e)))?;
        Ok(der.as_bytes().to_vec())
    }

    async fn sign(&self, _key_id: &str, digest: &[u8; 32]) -> Result<RawSignature> {
        let sig: Signature = self
            .key
            .sign_prehash(digest)
            .map_err(|e| PayoutError::Kms(format!("sign: {}", e)))?;
        let (r, s) = sig.split_bytes();
        let mut raw = RawSignature {
            r: [0u8; 32],
            s: [0u8; 32],
        };
        raw.r.copy_from_slice(&r);
        raw.s.copy_from_slice(&s);
        if self.high_s && raw.is_low_s() {
            raw.s = signature::complement(&raw.s);
        }
        Ok(raw)
    }
}

/// uncompressed sec1 point from a DER SubjectPublicKeyInfo
pub fn uncompressed_from_spki(der: &[u8]) -> Result<Vec<u8>> {
    let key = PublicKey::from_public_key_der(der)
        .map_err(|e| PayoutError::MalformedPublicKey(e.to_string()))?;
    Ok(key.to_encoded_point(false).as_bytes().to_vec())
}

/// signed transaction bytes and their id
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedTx {
    pub bytes: Vec<u8>,
    pub tx_id: String,
}

impl SignedTx {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let tx_id = tx::tx_id(&bytes);
        Self { bytes, tx_id }
    }
}

/// immutable signing handle built once at startup
pub struct Signer {
    kms: Arc<dyn KeyManagementService>,
    key_id: String,
    public_key: Vec<u8>,
    address: Address,
}

impl Signer {
    /// fetch and validate the public key; a malformed key is a configuration
    /// error and is not retried
    pub async fn connect(kms: Arc<dyn KeyManagementService>, key_id: &str) -> Result<Self> {
        let der = kms.get_public_key(key_id).await?;
        let public_key = uncompressed_from_spki(&der)?;
        let address = Address::from_public_key(&public_key)?;
        info!(%address, key_id, "signer ready");
        Ok(Self {
            kms,
            key_id: key_id.to_string(),
            public_key,
            address,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// uncompressed public key
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// canonical DER signature over `digest`
    pub async fn sign_digest(&self, digest: &[u8; 32]) -> Result<Vec<u8>> {
        let raw = self.kms.sign(&self.key_id, digest).await?;
        if !raw.is_low_s() {
            debug!("normalizing high-s signature");
        }
        raw.to_canonical_der()
    }

    /// sign encoded unsigned transaction bytes
    pub async fn sign_transaction(&self, unsigned: &[u8]) -> Result<SignedTx> {
        let digest = tx::message_hash(unsigned);
        let signature = self.sign_digest(&digest).await?;
        let signed = tx::append_signature(unsigned, &signature)?;
        Ok(SignedTx::from_bytes(signed))
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("key_id", &self.key_id)
            .field("address", &self.address)
            .finish()
    }
}
