use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tc_cache::{Cache, Namespace};
use tracing::{debug, instrument, warn};

use super::{Cached, ServiceSlot, ServiceTokenManager};
use crate::config::Endpoints;
use crate::errors::{AuthError, Result};
use crate::expiry::{jwt_claims, jwt_exp_ms};
use crate::xbox::models::XstsToken;

const STEP: &str = "Minecraft Bedrock authentication";

pub const MISSING_PUBLIC_KEY: &str = "Need to specify a ECDH x509 URL encoded public key";

#[derive(Debug, Clone, Default)]
pub struct BedrockOptions {
    /// Client ECDH public key, base64 X.509 SubjectPublicKeyInfo
    pub public_key: String,
    /// Require the title id claim the title-authenticated chain carries
    pub title_auth: bool,
}

impl BedrockOptions {
    pub fn new(public_key: impl Into<String>, title_auth: bool) -> Self {
        Self {
            public_key: public_key.into(),
            title_auth,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.public_key.trim().is_empty() {
            return Err(AuthError::InvalidInput(MISSING_PUBLIC_KEY.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthenticateRequest<'a> {
    identity_public_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthenticateResponse {
    #[serde(default)]
    chain: Vec<String>,
}

/// Signed JWT chain presented to Bedrock servers, bound to one client public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BedrockToken {
    pub chain: Vec<String>,
    pub identity_public_key: String,
}

/// Minecraft Bedrock multiplayer authentication (`bed` cache)
pub struct BedrockTokenManager {
    http: Client,
    slot: ServiceSlot,
    endpoints: Endpoints,
}

impl BedrockTokenManager {
    pub fn new(http: Client, cache: Arc<dyn Cache>, endpoints: Endpoints) -> Self {
        Self {
            http,
            slot: ServiceSlot::new(cache, Namespace::Bedrock),
            endpoints,
        }
    }

    /// A title-authenticated chain must name the title in its second link
    fn check_title_claim(chain: &[String]) -> Result<()> {
        let link = chain.get(1).ok_or_else(|| AuthError::ResponseInvariant {
            step: STEP,
            message: "chain has no title-authenticated link".to_string(),
        })?;
        let claims = jwt_claims(STEP, link)?;
        let title_id = claims
            .get("extraData")
            .and_then(|extra| extra.get("titleId"))
            .and_then(|id| id.as_str())
            .filter(|id| !id.is_empty());
        if title_id.is_none() {
            return Err(AuthError::ResponseInvariant {
                step: STEP,
                message: "missing titleId in response".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceTokenManager for BedrockTokenManager {
    type Upstream = XstsToken;
    type Options = BedrockOptions;
    type Token = BedrockToken;

    async fn get_cached(&self) -> Result<Cached<BedrockToken>> {
        self.slot.get().await
    }

    #[instrument(skip(self, xsts, options))]
    async fn get_access_token(
        &self,
        xsts: &XstsToken,
        options: &BedrockOptions,
    ) -> Result<BedrockToken> {
        options.validate()?;

        debug!("Authenticating with Minecraft Bedrock");
        let response = self
            .http
            .post(&self.endpoints.bedrock_authenticate)
            .header("User-Agent", "MCPE/UWP")
            .header("Authorization", xsts.authorization_header())
            .json(&AuthenticateRequest {
                identity_public_key: &options.public_key,
            })
            .send()
            .await
            .map_err(AuthError::network(STEP))?;

        if !response.status().is_success() {
            if response.status() == StatusCode::UNAUTHORIZED {
                warn!("Ensure that you are able to sign-in to Minecraft with this account");
            }
            return Err(AuthError::from_response(STEP, response).await);
        }
        let body: AuthenticateResponse = response
            .json()
            .await
            .map_err(|e| AuthError::invalid_response(STEP, e.to_string()))?;

        let first = body
            .chain
            .first()
            .ok_or_else(|| AuthError::invalid_response(STEP, "missing chain information"))?;
        let expires_on = jwt_exp_ms(STEP, first)?;

        if options.title_auth {
            Self::check_title_claim(&body.chain)?;
        }

        let token = BedrockToken {
            chain: body.chain,
            identity_public_key: options.public_key.clone(),
        };
        self.slot.put_now(&token, expires_on).await?;
        Ok(token)
    }
}

impl std::fmt::Debug for BedrockTokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BedrockTokenManager").finish_non_exhaustive()
    }
}
