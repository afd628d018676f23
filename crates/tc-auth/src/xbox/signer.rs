//! Xbox Live request signatures
//!
//! Every request to the Xbox authentication services carries a `Signature`
//! header proving possession of the key whose public half travels in the
//! payload as `ProofKey`. The signed message is
//!
//! ```text
//! i32 BE policy version | 0x00 | u64 BE windows timestamp | 0x00 |
//! "POST" 0x00 | path+query 0x00 | authorization token 0x00 | body 0x00
//! ```
//!
//! and the header is base64 of `i32 BE policy version | u64 BE timestamp | r || s`.

use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use chrono::Utc;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{AuthError, Result};

const POLICY_VERSION: i32 = 1;

/// Seconds between 1601-01-01 and 1970-01-01
const WINDOWS_EPOCH_OFFSET_SECS: u64 = 11_644_473_600;

/// JSON Web Key projection of the session's public signing key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofKey {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub key_use: String,
}

/// Windows-epoch timestamp in 100ns ticks, truncated to whole seconds
pub fn windows_timestamp(unix_ms: i64) -> u64 {
    let unix_secs = (unix_ms / 1000).max(0) as u64;
    (unix_secs + WINDOWS_EPOCH_OFFSET_SECS) * 10_000_000
}

/// Ephemeral P-256 key pair signing one session's Xbox requests
pub struct RequestSigner {
    key: SigningKey,
    proof_key: ProofKey,
}

impl RequestSigner {
    /// Generate a fresh key pair; it lives only as long as the signer
    pub fn generate() -> Result<Self> {
        loop {
            let mut secret = zeroize::Zeroizing::new([0u8; 32]);
            getrandom::fill(secret.as_mut())
                .map_err(|e| AuthError::Signing(format!("RNG failure: {e}")))?;
            // Out-of-range scalars are rejected; draw again
            if let Ok(key) = SigningKey::from_slice(secret.as_ref()) {
                return Ok(Self::from_signing_key(key));
            }
        }
    }

    pub fn from_signing_key(key: SigningKey) -> Self {
        let proof_key = project_jwk(key.verifying_key());
        Self { key, proof_key }
    }

    pub fn proof_key(&self) -> &ProofKey {
        &self.proof_key
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.key.verifying_key()
    }

    /// The exact byte string covered by the signature
    pub fn signing_payload(
        timestamp: u64,
        path_and_query: &str,
        authorization_token: &str,
        body: &[u8],
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            4 + 1
                + 8
                + 1
                + 5
                + path_and_query.len()
                + 1
                + authorization_token.len()
                + 1
                + body.len()
                + 1,
        );
        buf.extend_from_slice(&POLICY_VERSION.to_be_bytes());
        buf.push(0);
        buf.extend_from_slice(&timestamp.to_be_bytes());
        buf.push(0);
        buf.extend_from_slice(b"POST\0");
        buf.extend_from_slice(path_and_query.as_bytes());
        buf.push(0);
        buf.extend_from_slice(authorization_token.as_bytes());
        buf.push(0);
        buf.extend_from_slice(body);
        buf.push(0);
        buf
    }

    /// Header bytes (`policy | timestamp | signature`) for a POST to `url`
    pub fn sign_at(
        &self,
        url: &str,
        authorization_token: &str,
        body: &[u8],
        timestamp: u64,
    ) -> Result<Vec<u8>> {
        let url = Url::parse(url)?;
        let path_and_query = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        let payload = Self::signing_payload(timestamp, &path_and_query, authorization_token, body);
        let signature: Signature = self.key.sign(&payload);

        let mut header = Vec::with_capacity(4 + 8 + 64);
        header.extend_from_slice(&POLICY_VERSION.to_be_bytes());
        header.extend_from_slice(&timestamp.to_be_bytes());
        header.extend_from_slice(&signature.to_bytes());
        Ok(header)
    }

    /// Base64 `Signature` header value for a POST to `url`, stamped now
    pub fn signature_header(
        &self,
        url: &str,
        authorization_token: &str,
        body: &[u8],
    ) -> Result<String> {
        let timestamp = windows_timestamp(Utc::now().timestamp_millis());
        let header = self.sign_at(url, authorization_token, body, timestamp)?;
        Ok(STANDARD.encode(header))
    }
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("proof_key", &self.proof_key)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

fn project_jwk(key: &VerifyingKey) -> ProofKey {
    let point = key.as_affine().to_encoded_point(false);
    let coordinate =
        |c: Option<&p256::FieldBytes>| c.map(|c| URL_SAFE_NO_PAD.encode(c)).unwrap_or_default();
    ProofKey {
        kty: "EC".to_string(),
        crv: "P-256".to_string(),
        x: coordinate(point.x()),
        y: coordinate(point.y()),
        alg: "ES256".to_string(),
        key_use: "sig".to_string(),
    }
}
