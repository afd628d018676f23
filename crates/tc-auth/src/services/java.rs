use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tc_cache::{Cache, Namespace, now_ms};
use tracing::{debug, instrument};
use uuid::Uuid;
use zeroize::Zeroizing;

use super::{Cached, ServiceSlot, ServiceTokenManager, fetch_json};
use crate::config::Endpoints;
use crate::errors::{AuthError, Result};
use crate::expiry::{after_seconds, iso_to_ms};
use crate::xbox::models::XstsToken;

const LOGIN_STEP: &str = "Minecraft Java login";
const PROFILE_STEP: &str = "Minecraft Java profile";
const LICENSE_STEP: &str = "Minecraft Java entitlements";
const CERTIFICATE_STEP: &str = "Minecraft Java certificates";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    identity_token: String,
}

/// `login_with_xbox` response, cached as-is
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JavaToken {
    #[serde(default)]
    pub username: String,
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    pub expires_in: u64,
}

impl std::fmt::Debug for JavaToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JavaToken")
            .field("username", &self.username)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// Minecraft profile response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JavaProfile {
    /// UUID without dashes
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub skins: Vec<serde_json::Value>,
    #[serde(default)]
    pub capes: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entitlement {
    pub name: String,
    #[serde(default)]
    pub source: Option<String>,
}

/// Product licenses attached to the account
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Entitlements {
    #[serde(default)]
    pub items: Vec<Entitlement>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub key_id: Option<String>,
}

impl Entitlements {
    pub fn owns(&self, name: &str) -> bool {
        self.items.iter().any(|item| item.name == name)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertificateResponse {
    key_pair: CertificateKeyPair,
    public_key_signature: String,
    #[serde(default)]
    public_key_signature_v2: Option<String>,
    expires_at: String,
    refreshed_after: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertificateKeyPair {
    private_key: String,
    public_key: String,
}

/// Chat signing key pair issued for the profile
pub struct ProfileKeys {
    pub public_pem: String,
    pub private_pem: Zeroizing<String>,
    pub public_der: Vec<u8>,
    pub private_der: Zeroizing<Vec<u8>>,
    pub signature: Vec<u8>,
    pub signature_v2: Option<Vec<u8>>,
    /// Epoch milliseconds
    pub expires_on: Option<i64>,
    pub refresh_after: Option<i64>,
}

impl std::fmt::Debug for ProfileKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileKeys")
            .field("public_pem", &self.public_pem)
            .field("private_pem", &"[REDACTED]")
            .field("expires_on", &self.expires_on)
            .field("refresh_after", &self.refresh_after)
            .finish_non_exhaustive()
    }
}

/// Strip the armor lines of a PEM block and decode its body
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    STANDARD
        .decode(body)
        .map_err(|e| AuthError::invalid_response(CERTIFICATE_STEP, format!("bad PEM body: {e}")))
}

fn decode_signature(signature: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(signature)
        .map_err(|e| AuthError::invalid_response(CERTIFICATE_STEP, format!("bad signature: {e}")))
}

/// Minecraft Java services (`mca` cache)
pub struct JavaTokenManager {
    http: Client,
    slot: ServiceSlot,
    endpoints: Endpoints,
}

impl JavaTokenManager {
    pub fn new(http: Client, cache: Arc<dyn Cache>, endpoints: Endpoints) -> Self {
        Self {
            http,
            slot: ServiceSlot::new(cache, Namespace::Java),
            endpoints,
        }
    }

    #[instrument(skip(self, access_token))]
    pub async fn fetch_profile(&self, access_token: &str) -> Result<JavaProfile> {
        debug!("Fetching Minecraft profile");
        fetch_json(
            PROFILE_STEP,
            self.http.get(&self.endpoints.java_profile).bearer_auth(access_token),
        )
        .await
    }

    #[instrument(skip(self, access_token))]
    pub async fn fetch_entitlements(&self, access_token: &str) -> Result<Entitlements> {
        let mut url = url::Url::parse(&self.endpoints.java_license)?;
        url.query_pairs_mut()
            .append_pair("requestId", &Uuid::new_v4().to_string());

        debug!("Fetching entitlements");
        fetch_json(LICENSE_STEP, self.http.get(url).bearer_auth(access_token)).await
    }

    #[instrument(skip(self, access_token))]
    pub async fn fetch_certificates(&self, access_token: &str) -> Result<ProfileKeys> {
        debug!("Fetching profile key pair");
        let cert: CertificateResponse = fetch_json(
            CERTIFICATE_STEP,
            self.http
                .post(&self.endpoints.java_certificates)
                .bearer_auth(access_token),
        )
        .await?;

        Ok(ProfileKeys {
            public_der: pem_to_der(&cert.key_pair.public_key)?,
            private_der: Zeroizing::new(pem_to_der(&cert.key_pair.private_key)?),
            public_pem: cert.key_pair.public_key,
            private_pem: Zeroizing::new(cert.key_pair.private_key),
            signature: decode_signature(&cert.public_key_signature)?,
            signature_v2: cert
                .public_key_signature_v2
                .as_deref()
                .map(decode_signature)
                .transpose()?,
            expires_on: iso_to_ms(&cert.expires_at),
            refresh_after: iso_to_ms(&cert.refreshed_after),
        })
    }
}

#[async_trait]
impl ServiceTokenManager for JavaTokenManager {
    type Upstream = XstsToken;
    type Options = ();
    type Token = JavaToken;

    async fn get_cached(&self) -> Result<Cached<JavaToken>> {
        self.slot.get().await
    }

    #[instrument(skip(self, xsts, _options))]
    async fn get_access_token(&self, xsts: &XstsToken, _options: &()) -> Result<JavaToken> {
        let request = LoginRequest {
            identity_token: xsts.authorization_header(),
        };

        debug!("Authenticating with Minecraft Java services");
        let obtained_on = now_ms();
        let token: JavaToken = fetch_json(
            LOGIN_STEP,
            self.http.post(&self.endpoints.java_login_with_xbox).json(&request),
        )
        .await?;

        self.slot
            .put(&token, obtained_on, Some(after_seconds(obtained_on, token.expires_in)))
            .await?;
        Ok(token)
    }
}

impl std::fmt::Debug for JavaTokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JavaTokenManager").finish_non_exhaustive()
    }
}
