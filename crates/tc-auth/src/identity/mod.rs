//! Identity providers issuing the access token at the root of the chain
//!
//! [`LiveTokenManager`] talks to live.com and serves the direct and combined
//! flows; [`MsaTokenManager`] talks to the Microsoft identity platform and
//! serves the federated flow. Both persist their token pair in the
//! [`Namespace::Identity`] slot of their own cache.

mod device_code;
pub mod live;
pub mod msa;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tc_cache::{Cache, Namespace, now_ms};
use tracing::{debug, info};

use crate::errors::Result;
use crate::expiry::{after_seconds, set_options};

pub use device_code::DeviceCodeResponse;
pub use live::LiveTokenManager;
pub use msa::MsaTokenManager;

/// What the user needs to complete a device code sign-in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCodePrompt {
    pub user_code: String,
    pub verification_uri: String,
    pub device_code: String,
    /// Epoch milliseconds after which the code is no longer accepted
    pub expires_on: i64,
    pub expires_in_seconds: u64,
    pub poll_interval_seconds: u64,
    pub message: String,
}

/// Receives the device code prompt; display is up to the embedding application
pub trait PromptHandler: Send + Sync {
    fn on_device_code(&self, prompt: &DeviceCodePrompt);
}

/// Writes the prompt message to the log at `info`
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPromptHandler;

impl PromptHandler for LogPromptHandler {
    fn on_device_code(&self, prompt: &DeviceCodePrompt) {
        info!("First time signing in. Please authenticate now:");
        info!("{}", prompt.message);
    }
}

/// Delivers a device code prompt at most once
///
/// Consumed by [`DeviceCodeNotice::send`], so a second delivery cannot compile.
pub struct DeviceCodeNotice {
    handler: Arc<dyn PromptHandler>,
}

impl DeviceCodeNotice {
    pub fn new(handler: Arc<dyn PromptHandler>) -> Self {
        Self { handler }
    }

    pub fn send(self, prompt: &DeviceCodePrompt) {
        self.handler.on_device_code(prompt);
    }
}

impl std::fmt::Debug for DeviceCodeNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCodeNotice").finish_non_exhaustive()
    }
}

/// Account details reported by the provider alongside the tokens
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountInfo {
    pub user_id: Option<String>,
    pub username: Option<String>,
}

/// Outcome of an interactive sign-in
#[derive(Clone)]
pub struct InteractiveLogin {
    pub access_token: String,
    pub account: Option<AccountInfo>,
}

impl std::fmt::Debug for InteractiveLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveLogin")
            .field("access_token", &"[REDACTED]")
            .field("account", &self.account)
            .finish()
    }
}

/// Cached access token with its validity at read time
#[derive(Clone)]
pub struct AccessTokenState {
    pub token: String,
    pub valid: bool,
    pub expires_on: i64,
}

impl std::fmt::Debug for AccessTokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessTokenState")
            .field("valid", &self.valid)
            .field("expires_on", &self.expires_on)
            .finish_non_exhaustive()
    }
}

/// Common contract of the identity providers
#[async_trait]
pub trait IdentityTokenManager: Send + Sync {
    /// Whether a valid access token is available, refreshing once if it is stale
    async fn verify(&self) -> Result<bool>;

    /// Device code sign-in; `notice` is delivered once the code is issued
    async fn obtain_interactive(&self, notice: DeviceCodeNotice) -> Result<InteractiveLogin>;

    /// Redeem the cached refresh token
    async fn refresh(&self) -> Result<String>;

    async fn access_token(&self) -> Result<Option<AccessTokenState>>;

    /// `true` when tokens come from the Microsoft identity platform
    fn is_federated(&self) -> bool;
}

/// OAuth token endpoint response, also the persisted shape of the identity slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

/// Identity slot reads and writes shared by both providers
#[derive(Clone)]
pub(crate) struct IdentityStore {
    cache: Arc<dyn Cache>,
}

impl IdentityStore {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub async fn load(&self) -> Result<Option<(IdentityTokens, AccessTokenState)>> {
        let Some(lookup) = self.cache.get(&Namespace::Identity).await? else {
            return Ok(None);
        };
        let Some(tokens) = lookup.parse::<IdentityTokens>() else {
            return Ok(None);
        };
        let state = AccessTokenState {
            token: tokens.access_token.clone(),
            valid: lookup.valid,
            expires_on: lookup.expires_on,
        };
        Ok(Some((tokens, state)))
    }

    /// Persist a fresh token pair, keeping the previous refresh token if none was returned
    pub async fn save(&self, mut tokens: IdentityTokens) -> Result<IdentityTokens> {
        if tokens.refresh_token.is_none() {
            if let Some((previous, _)) = self.load().await? {
                tokens.refresh_token = previous.refresh_token;
            }
        }

        let obtained_on = now_ms();
        let expires_on =
            (tokens.expires_in > 0).then(|| after_seconds(obtained_on, tokens.expires_in));
        self.cache
            .set(
                &Namespace::Identity,
                serde_json::to_value(&tokens)?,
                set_options(obtained_on, expires_on),
            )
            .await?;
        debug!("Stored identity tokens");
        Ok(tokens)
    }

    pub async fn refresh_token(&self) -> Result<Option<String>> {
        Ok(self.load().await?.and_then(|(tokens, _)| tokens.refresh_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tc_cache::MemoryCache;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl PromptHandler for Recorder {
        fn on_device_code(&self, prompt: &DeviceCodePrompt) {
            self.0.lock().unwrap().push(prompt.user_code.clone());
        }
    }

    fn prompt() -> DeviceCodePrompt {
        DeviceCodePrompt {
            user_code: "ABCD".into(),
            verification_uri: "https://microsoft.com/link".into(),
            device_code: "dc".into(),
            expires_on: 0,
            expires_in_seconds: 900,
            poll_interval_seconds: 5,
            message: "go".into(),
        }
    }

    #[test]
    fn test_notice_delivers_once() {
        let recorder = Arc::new(Recorder::default());
        let notice = DeviceCodeNotice::new(recorder.clone());
        notice.send(&prompt());
        assert_eq!(*recorder.0.lock().unwrap(), vec!["ABCD".to_string()]);
    }

    #[tokio::test]
    async fn test_save_keeps_previous_refresh_token() {
        let store = IdentityStore::new(Arc::new(MemoryCache::new()));
        store
            .save(IdentityTokens {
                access_token: "a1".into(),
                refresh_token: Some("r1".into()),
                expires_in: 3600,
                token_type: None,
                scope: None,
                user_id: None,
                id_token: None,
            })
            .await
            .unwrap();

        let saved = store
            .save(IdentityTokens {
                access_token: "a2".into(),
                refresh_token: None,
                expires_in: 3600,
                token_type: None,
                scope: None,
                user_id: None,
                id_token: None,
            })
            .await
            .unwrap();
        assert_eq!(saved.refresh_token.as_deref(), Some("r1"));

        let (tokens, state) = store.load().await.unwrap().unwrap();
        assert_eq!(tokens.access_token, "a2");
        assert!(state.valid);
        assert!(state.expires_on > now_ms() + 3_000_000);
    }
}
