use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tc_cache::{Cache, Namespace};
use tracing::{debug, instrument};

use super::{Cached, ServiceSlot, ServiceTokenManager, fetch_json};
use crate::config::Endpoints;
use crate::errors::{AuthError, Result};
use crate::expiry::iso_to_ms;
use crate::xbox::models::XstsToken;

const STEP: &str = "PlayFab login";

/// PlayFab title of Minecraft
pub const MINECRAFT_TITLE_ID: &str = "20CA2";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EntityToken {
    pub entity_token: String,
    pub token_expiration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<serde_json::Value>,
}

/// `data` member of the LoginWithXbox response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlayfabLogin {
    pub session_ticket: String,
    #[serde(default)]
    pub play_fab_id: Option<String>,
    #[serde(default)]
    pub newly_created: Option<bool>,
    pub entity_token: EntityToken,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct LoginEnvelope {
    data: PlayfabLogin,
}

/// PlayFab LoginWithXbox, the third-party login (`pfb` cache)
pub struct PlayfabTokenManager {
    http: Client,
    slot: ServiceSlot,
    endpoints: Endpoints,
}

impl PlayfabTokenManager {
    pub fn new(http: Client, cache: Arc<dyn Cache>, endpoints: Endpoints) -> Self {
        Self {
            http,
            slot: ServiceSlot::new(cache, Namespace::ThirdPartyLogin),
            endpoints,
        }
    }
}

#[async_trait]
impl ServiceTokenManager for PlayfabTokenManager {
    type Upstream = XstsToken;
    type Options = ();
    type Token = PlayfabLogin;

    async fn get_cached(&self) -> Result<Cached<PlayfabLogin>> {
        self.slot.get().await
    }

    #[instrument(skip(self, xsts, _options))]
    async fn get_access_token(&self, xsts: &XstsToken, _options: &()) -> Result<PlayfabLogin> {
        let body = json!({
            "CreateAccount": true,
            "EncryptedRequest": null,
            "InfoRequestParameters": {
                "GetCharacterInventories": false,
                "GetCharacterList": false,
                "GetPlayerProfile": true,
                "GetPlayerStatistics": false,
                "GetTitleData": false,
                "GetUserAccountInfo": true,
                "GetUserData": false,
                "GetUserInventory": false,
                "GetUserReadOnlyData": false,
                "GetUserVirtualCurrency": false,
                "PlayerStatisticNames": null,
                "ProfileConstraints": null,
                "TitleDataKeys": null,
                "UserDataKeys": null,
                "UserReadOnlyDataKeys": null
            },
            "PlayerSecret": null,
            "TitleId": MINECRAFT_TITLE_ID,
            "XboxToken": xsts.authorization_header(),
        });

        debug!("Logging in to PlayFab");
        let envelope: LoginEnvelope = fetch_json(
            STEP,
            self.http.post(&self.endpoints.playfab_login_with_xbox).json(&body),
        )
        .await?;
        let login = envelope.data;

        let expires_on = iso_to_ms(&login.entity_token.token_expiration).ok_or_else(|| {
            AuthError::invalid_response(STEP, "unparseable EntityToken.TokenExpiration")
        })?;
        self.slot.put_now(&login, Some(expires_on)).await?;
        Ok(login)
    }
}

impl std::fmt::Debug for PlayfabTokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayfabTokenManager").finish_non_exhaustive()
    }
}
