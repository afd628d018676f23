use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tc_cache::{Cache, now_ms};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::device_code;
use super::{
    AccessTokenState, AccountInfo, DeviceCodeNotice, IdentityStore, IdentityTokenManager,
    IdentityTokens, InteractiveLogin,
};
use crate::errors::{AuthError, Result};
use crate::expiry::jwt_claims;
use crate::retry::cancellable;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const REFRESH_STEP: &str = "identity platform token refresh";

/// Identity tokens from the Microsoft identity platform (federated flow)
///
/// `offline_access` is always requested so a refresh token is issued.
pub struct MsaTokenManager {
    http: Client,
    client_id: String,
    authority: String,
    scopes: Vec<String>,
    store: IdentityStore,
    cancellation: Option<CancellationToken>,
}

impl MsaTokenManager {
    pub fn new(
        http: Client,
        client_id: impl Into<String>,
        authority: impl Into<String>,
        scopes: Vec<String>,
        cache: Arc<dyn Cache>,
        cancellation: Option<CancellationToken>,
    ) -> Self {
        let mut scopes = scopes;
        if !scopes.iter().any(|s| s == "offline_access") {
            scopes.push("offline_access".to_string());
        }
        Self {
            http,
            client_id: client_id.into(),
            authority: authority.into().trim_end_matches('/').to_string(),
            scopes,
            store: IdentityStore::new(cache),
            cancellation,
        }
    }

    fn device_code_url(&self) -> String {
        format!("{}/oauth2/v2.0/devicecode", self.authority)
    }

    fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority)
    }

    fn scope(&self) -> String {
        self.scopes.join(" ")
    }

    /// Account details from the id token, when one was issued
    fn account(tokens: &IdentityTokens) -> Option<AccountInfo> {
        let claims = jwt_claims("identity platform id token", tokens.id_token.as_deref()?).ok()?;
        let text = |name: &str| claims.get(name).and_then(|v| v.as_str()).map(str::to_string);
        Some(AccountInfo {
            user_id: text("oid").or_else(|| text("sub")),
            username: text("preferred_username"),
        })
    }
}

#[async_trait]
impl IdentityTokenManager for MsaTokenManager {
    async fn verify(&self) -> Result<bool> {
        let Some((tokens, state)) = self.store.load().await? else {
            return Ok(false);
        };
        if state.valid {
            debug!("Using cached identity platform tokens");
            return Ok(true);
        }
        if tokens.refresh_token.is_none() {
            return Ok(false);
        }

        match self.refresh().await {
            Ok(_) => Ok(true),
            Err(AuthError::Cancelled) => Err(AuthError::Cancelled),
            Err(e) => {
                warn!("Error refreshing identity platform token: {}", e);
                Ok(false)
            }
        }
    }

    #[instrument(skip(self, notice))]
    async fn obtain_interactive(&self, notice: DeviceCodeNotice) -> Result<InteractiveLogin> {
        let acquired_on = now_ms();
        let scope = self.scope();
        let request = [("client_id", self.client_id.as_str()), ("scope", scope.as_str())];

        debug!("Requesting device code from {}", self.authority);
        let device = device_code::request_device_code(
            &self.http,
            &self.device_code_url(),
            &request,
            self.cancellation.as_ref(),
        )
        .await?;
        notice.send(&device.prompt(acquired_on));

        let poll = [
            ("grant_type", DEVICE_CODE_GRANT),
            ("client_id", self.client_id.as_str()),
            ("device_code", device.device_code.as_str()),
        ];
        let tokens = device_code::poll_for_tokens(
            &self.http,
            &self.token_url(),
            &poll,
            &device,
            self.cancellation.as_ref(),
        )
        .await?;

        let tokens = self.store.save(tokens).await?;
        Ok(InteractiveLogin {
            account: Self::account(&tokens),
            access_token: tokens.access_token,
        })
    }

    #[instrument(skip(self))]
    async fn refresh(&self) -> Result<String> {
        let refresh_token = self
            .store
            .refresh_token()
            .await?
            .ok_or(AuthError::MissingRefreshToken)?;

        let scope = self.scope();
        let form = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("scope", scope.as_str()),
        ];

        debug!("Refreshing identity platform access token");
        let response = cancellable(
            self.cancellation.as_ref(),
            self.http.post(self.token_url()).form(&form).send(),
        )
        .await?
        .map_err(AuthError::network(REFRESH_STEP))?;

        if !response.status().is_success() {
            return Err(AuthError::from_response(REFRESH_STEP, response).await);
        }
        let tokens: IdentityTokens = response
            .json()
            .await
            .map_err(|e| AuthError::invalid_response(REFRESH_STEP, e.to_string()))?;

        Ok(self.store.save(tokens).await?.access_token)
    }

    async fn access_token(&self) -> Result<Option<AccessTokenState>> {
        Ok(self.store.load().await?.map(|(_, state)| state))
    }

    fn is_federated(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for MsaTokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsaTokenManager")
            .field("client_id", &self.client_id)
            .field("authority", &self.authority)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiry::fake_jwt;
    use crate::identity::LogPromptHandler;
    use serde_json::json;
    use tc_cache::MemoryCache;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn manager(server: &MockServer) -> MsaTokenManager {
        MsaTokenManager::new(
            Client::new(),
            "client",
            format!("{}/consumers/", server.uri()),
            vec!["XboxLive.signin".to_string()],
            Arc::new(MemoryCache::new()),
            None,
        )
    }

    #[test]
    fn test_offline_access_appended_once() {
        let msa = MsaTokenManager::new(
            Client::new(),
            "client",
            "https://login.microsoftonline.com/consumers",
            vec!["XboxLive.signin".into(), "offline_access".into()],
            Arc::new(MemoryCache::new()),
            None,
        );
        assert_eq!(msa.scope(), "XboxLive.signin offline_access");
        assert_eq!(
            msa.token_url(),
            "https://login.microsoftonline.com/consumers/oauth2/v2.0/token"
        );
    }

    #[tokio::test]
    async fn test_device_code_with_slow_down() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/devicecode"))
            .and(body_string_contains("offline_access"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "user_code": "ABCD",
                "device_code": "dc",
                "verification_uri": "https://microsoft.com/devicelogin",
                "expires_in": 60,
                "interval": 0,
                "message": "Go to https://microsoft.com/devicelogin"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "error": "slow_down" })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/consumers/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "AT",
                "refresh_token": "RT",
                "expires_in": 3600,
                "id_token": fake_jwt(&json!({ "oid": "oid-1", "preferred_username": "player@example.com" }))
            })))
            .mount(&server)
            .await;

        let msa = manager(&server);
        let started = std::time::Instant::now();
        let login = msa
            .obtain_interactive(DeviceCodeNotice::new(Arc::new(LogPromptHandler)))
            .await
            .unwrap();

        assert!(started.elapsed() >= std::time::Duration::from_secs(5));
        assert_eq!(login.access_token, "AT");
        let account = login.account.unwrap();
        assert_eq!(account.username.as_deref(), Some("player@example.com"));
        assert_eq!(account.user_id.as_deref(), Some("oid-1"));
        assert!(msa.is_federated());
    }
}
