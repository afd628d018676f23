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
use crate::retry::cancellable;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const REFRESH_STEP: &str = "live.com token refresh";

/// live.com OAuth endpoints for one client id
#[derive(Debug, Clone)]
pub struct LiveEndpoints {
    pub device_code: String,
    pub token: String,
}

/// Identity tokens from live.com (direct and combined flows)
pub struct LiveTokenManager {
    http: Client,
    client_id: String,
    scopes: Vec<String>,
    endpoints: LiveEndpoints,
    store: IdentityStore,
    cancellation: Option<CancellationToken>,
}

impl LiveTokenManager {
    pub fn new(
        http: Client,
        client_id: impl Into<String>,
        scopes: Vec<String>,
        endpoints: LiveEndpoints,
        cache: Arc<dyn Cache>,
        cancellation: Option<CancellationToken>,
    ) -> Self {
        Self {
            http,
            client_id: client_id.into(),
            scopes,
            endpoints,
            store: IdentityStore::new(cache),
            cancellation,
        }
    }

    fn scope(&self) -> String {
        self.scopes.join(" ")
    }

    fn poll_url(&self) -> Result<String> {
        let mut url = url::Url::parse(&self.endpoints.token)?;
        url.query_pairs_mut().append_pair("client_id", &self.client_id);
        Ok(url.to_string())
    }
}

#[async_trait]
impl IdentityTokenManager for LiveTokenManager {
    async fn verify(&self) -> Result<bool> {
        let Some((tokens, state)) = self.store.load().await? else {
            return Ok(false);
        };
        if state.valid && tokens.refresh_token.is_some() {
            debug!("Using cached live.com tokens");
            return Ok(true);
        }
        if tokens.refresh_token.is_none() {
            return Ok(false);
        }

        match self.refresh().await {
            Ok(_) => Ok(true),
            Err(AuthError::Cancelled) => Err(AuthError::Cancelled),
            Err(e) => {
                warn!("Error refreshing live.com token: {}", e);
                Ok(false)
            }
        }
    }

    #[instrument(skip(self, notice))]
    async fn obtain_interactive(&self, notice: DeviceCodeNotice) -> Result<InteractiveLogin> {
        let acquired_on = now_ms();
        let scope = self.scope();
        let request = [
            ("scope", scope.as_str()),
            ("client_id", self.client_id.as_str()),
            ("response_type", "device_code"),
        ];

        debug!("Requesting live.com device code");
        let device = device_code::request_device_code(
            &self.http,
            &self.endpoints.device_code,
            &request,
            self.cancellation.as_ref(),
        )
        .await?;
        notice.send(&device.prompt(acquired_on));

        let poll = [
            ("client_id", self.client_id.as_str()),
            ("device_code", device.device_code.as_str()),
            ("grant_type", DEVICE_CODE_GRANT),
        ];
        let tokens = device_code::poll_for_tokens(
            &self.http,
            &self.poll_url()?,
            &poll,
            &device,
            self.cancellation.as_ref(),
        )
        .await?;

        let tokens = self.store.save(tokens).await?;
        let account = tokens.user_id.clone().map(|user_id| AccountInfo {
            user_id: Some(user_id),
            username: None,
        });
        Ok(InteractiveLogin {
            access_token: tokens.access_token,
            account,
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
            ("scope", scope.as_str()),
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
        ];

        debug!("Refreshing live.com access token");
        let response = cancellable(
            self.cancellation.as_ref(),
            self.http.post(&self.endpoints.token).form(&form).send(),
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
        false
    }
}

impl std::fmt::Debug for LiveTokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveTokenManager")
            .field("client_id", &self.client_id)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{DeviceCodePrompt, PromptHandler};
    use serde_json::json;
    use std::sync::Mutex;
    use tc_cache::{MemoryCache, Namespace, SetOptions};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<DeviceCodePrompt>>);

    impl PromptHandler for Recorder {
        fn on_device_code(&self, prompt: &DeviceCodePrompt) {
            self.0.lock().unwrap().push(prompt.clone());
        }
    }

    fn manager(
        server: &MockServer,
        cache: Arc<dyn Cache>,
        cancel: Option<CancellationToken>,
    ) -> LiveTokenManager {
        LiveTokenManager::new(
            Client::new(),
            "00000000441cc96b",
            vec![crate::config::LIVE_SCOPE.to_string()],
            LiveEndpoints {
                device_code: format!("{}/oauth20_connect.srf", server.uri()),
                token: format!("{}/oauth20_token.srf", server.uri()),
            },
            cache,
            cancel,
        )
    }

    fn device_code_body(expires_in: u64) -> serde_json::Value {
        json!({
            "user_code": "ABCD",
            "device_code": "dc-1",
            "verification_uri": "https://www.microsoft.com/link",
            "expires_in": expires_in,
            "interval": 0
        })
    }

    #[tokio::test]
    async fn test_device_code_flow_polls_until_granted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth20_connect.srf"))
            .and(body_string_contains("response_type=device_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(device_code_body(60)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth20_token.srf"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "authorization_pending",
                "error_description": "waiting"
            })))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth20_token.srf"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "AT",
                "refresh_token": "RT",
                "expires_in": 3600,
                "token_type": "bearer",
                "user_id": "abc123"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let live = manager(&server, cache.clone(), None);
        let recorder = Arc::new(Recorder::default());

        let login = live
            .obtain_interactive(DeviceCodeNotice::new(recorder.clone()))
            .await
            .unwrap();
        assert_eq!(login.access_token, "AT");
        assert_eq!(login.account.unwrap().user_id.as_deref(), Some("abc123"));

        let prompts = recorder.0.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].user_code, "ABCD");

        let state = live.access_token().await.unwrap().unwrap();
        assert!(state.valid);
        assert_eq!(state.token, "AT");
        assert!(live.verify().await.unwrap());
    }

    #[tokio::test]
    async fn test_rejected_code_is_terminal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth20_connect.srf"))
            .respond_with(ResponseTemplate::new(200).set_body_json(device_code_body(60)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth20_token.srf"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "authorization_declined",
                "error_description": "The user declined"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let live = manager(&server, Arc::new(MemoryCache::new()), None);
        let error = live
            .obtain_interactive(DeviceCodeNotice::new(Arc::new(Recorder::default())))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            AuthError::DeviceCodeRejected { ref code, .. } if code == "authorization_declined"
        ));
    }

    #[tokio::test]
    async fn test_expired_code_times_out() {
        let server = MockServer::start().await;
        let mut body = device_code_body(1);
        body["interval"] = json!(1);
        Mock::given(method("POST"))
            .and(path("/oauth20_connect.srf"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/oauth20_token.srf"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "error": "authorization_pending" })),
            )
            .mount(&server)
            .await;

        let live = manager(&server, Arc::new(MemoryCache::new()), None);
        let error = live
            .obtain_interactive(DeviceCodeNotice::new(Arc::new(Recorder::default())))
            .await
            .unwrap_err();
        assert!(matches!(error, AuthError::DeviceCodeTimeout));
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let server = MockServer::start().await;
        let mut body = device_code_body(600);
        body["interval"] = json!(30);
        Mock::given(method("POST"))
            .and(path("/oauth20_connect.srf"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let live = manager(&server, Arc::new(MemoryCache::new()), Some(cancel.clone()));

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let error = live
            .obtain_interactive(DeviceCodeNotice::new(Arc::new(Recorder::default())))
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(matches!(error, AuthError::Cancelled));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token() {
        let server = MockServer::start().await;
        let live = manager(&server, Arc::new(MemoryCache::new()), None);
        assert!(matches!(live.refresh().await, Err(AuthError::MissingRefreshToken)));
        assert!(!live.verify().await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_refreshes_stale_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth20_token.srf"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=RT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "AT2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        cache
            .set(
                &Namespace::Identity,
                json!({ "access_token": "AT1", "refresh_token": "RT", "expires_in": 3600 }),
                SetOptions::expiring_at(now_ms() - 10),
            )
            .await
            .unwrap();

        let live = manager(&server, cache, None);
        assert!(live.verify().await.unwrap());

        let state = live.access_token().await.unwrap().unwrap();
        assert_eq!(state.token, "AT2");
        assert!(state.valid);
    }
}
