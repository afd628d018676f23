use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tc_cache::{Cache, Namespace};
use tracing::{debug, instrument};

use super::playfab::{MINECRAFT_TITLE_ID, PlayfabLogin};
use super::{Cached, ServiceSlot, ServiceTokenManager, fetch_json};
use crate::config::Endpoints;
use crate::errors::{AuthError, Result};
use crate::expiry::iso_to_ms;

const STEP: &str = "Bedrock services session start";

/// Device description sent with `session/start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    pub application_type: String,
    pub game_version: String,
    #[serde(rename = "id")]
    pub device_id: String,
    #[serde(rename = "memory")]
    pub device_memory: String,
    pub platform: String,
    #[serde(rename = "playFabTitleId")]
    pub playfab_title_id: String,
    pub store_platform: String,
    #[serde(rename = "type")]
    pub device_type: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            application_type: "MinecraftPE".to_string(),
            game_version: "1.20.62".to_string(),
            device_id: "c1681ad3-415e-30cd-abd3-3b8f51e771d1".to_string(),
            device_memory: (8u64 * 1024 * 1024 * 1024).to_string(),
            platform: "Windows10".to_string(),
            playfab_title_id: MINECRAFT_TITLE_ID.to_string(),
            store_platform: "uwp.store".to_string(),
            device_type: "Windows10".to_string(),
        }
    }
}

impl SessionOptions {
    pub fn with_game_version(mut self, version: impl Into<String>) -> Self {
        self.game_version = version.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct SessionUser<'a> {
    token: &'a str,
    #[serde(rename = "tokenType")]
    token_type: &'a str,
}

#[derive(Debug, Serialize)]
struct SessionStartRequest<'a> {
    device: &'a SessionOptions,
    user: SessionUser<'a>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResult {
    #[serde(default)]
    authorization_header: Option<String>,
    valid_until: Option<String>,
    #[serde(default)]
    treatments: Option<serde_json::Value>,
    #[serde(default)]
    configurations: Option<serde_json::Value>,
    #[serde(default)]
    treatment_context: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SessionEnvelope {
    result: SessionResult,
}

/// Bedrock services session credential
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    /// Ready-to-use `Authorization` header value
    pub mc_token: String,
    pub valid_until: String,
    #[serde(default)]
    pub treatments: Option<serde_json::Value>,
    #[serde(default)]
    pub configurations: Option<serde_json::Value>,
    #[serde(default)]
    pub treatment_context: Option<serde_json::Value>,
}

/// Minecraft Bedrock services session (`mcs` cache)
pub struct SessionTokenManager {
    http: Client,
    slot: ServiceSlot,
    endpoints: Endpoints,
}

impl SessionTokenManager {
    pub fn new(http: Client, cache: Arc<dyn Cache>, endpoints: Endpoints) -> Self {
        Self {
            http,
            slot: ServiceSlot::new(cache, Namespace::Session),
            endpoints,
        }
    }
}

#[async_trait]
impl ServiceTokenManager for SessionTokenManager {
    type Upstream = PlayfabLogin;
    type Options = SessionOptions;
    type Token = SessionToken;

    async fn get_cached(&self) -> Result<Cached<SessionToken>> {
        self.slot.get().await
    }

    #[instrument(skip(self, playfab, options))]
    async fn get_access_token(
        &self,
        playfab: &PlayfabLogin,
        options: &SessionOptions,
    ) -> Result<SessionToken> {
        let request = SessionStartRequest {
            device: options,
            user: SessionUser {
                token: &playfab.session_ticket,
                token_type: "PlayFab",
            },
        };

        debug!("Starting Bedrock services session");
        let envelope: SessionEnvelope = fetch_json(
            STEP,
            self.http.post(&self.endpoints.bedrock_session_start).json(&request),
        )
        .await?;
        let result = envelope.result;

        let mc_token = result
            .authorization_header
            .filter(|header| !header.is_empty())
            .ok_or_else(|| AuthError::ResponseInvariant {
                step: STEP,
                message: "missing authorizationHeader".to_string(),
            })?;
        let valid_until = result
            .valid_until
            .ok_or_else(|| AuthError::invalid_response(STEP, "missing validUntil"))?;
        let expires_on = iso_to_ms(&valid_until)
            .ok_or_else(|| AuthError::invalid_response(STEP, "unparseable validUntil"))?;

        let token = SessionToken {
            mc_token,
            valid_until,
            treatments: result.treatments,
            configurations: result.configurations,
            treatment_context: result.treatment_context,
        };
        self.slot.put_now(&token, Some(expires_on)).await?;
        Ok(token)
    }
}

impl std::fmt::Debug for SessionTokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTokenManager").finish_non_exhaustive()
    }
}
