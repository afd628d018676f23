//! Xbox Live token chain: user, device and title tokens feeding XSTS
//!
//! Two strategies produce an [`XstsToken`]:
//!
//! - sequential: user, device and title tokens are each requested (or reused
//!   from cache) and then traded at `xsts/authorize`
//! - combined: a single signed SISU request returns user, title and XSTS tokens
//!
//! Every request is signed with the session's [`RequestSigner`].

pub mod models;
pub mod password;
pub mod signer;

use std::sync::Arc;

use reqwest::Client;
use serde::Serialize;
use tc_cache::{Cache, Namespace, now_ms};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::{DeviceIdentity, Endpoints, relying_party};
use crate::errors::{AuthError, Result, XstsError};
use crate::expiry::{iso_to_ms, set_options};
use models::*;
use signer::RequestSigner;

const USER_STEP: &str = "Xbox user authentication";
const DEVICE_STEP: &str = "Xbox device authentication";
const TITLE_STEP: &str = "Xbox title authentication";
const XSTS_STEP: &str = "XSTS authorization";
const SISU_STEP: &str = "SISU authorization";

/// Valid tokens currently held in the `xbl` cache for one relying party
#[derive(Debug, Clone, Default)]
pub struct CachedXboxTokens {
    pub user_token: Option<String>,
    pub device_token: Option<String>,
    pub title_token: Option<String>,
    pub xsts: Option<XstsToken>,
}

/// Inputs of an `xsts/authorize` request
#[derive(Debug, Clone)]
pub struct XstsInputs {
    pub user_token: String,
    pub device_token: Option<String>,
    pub title_token: Option<String>,
}

/// Issues and caches Xbox Live tokens
pub struct XboxTokenManager {
    http: Client,
    cache: Arc<dyn Cache>,
    signer: Arc<RequestSigner>,
    endpoints: Endpoints,
}

impl XboxTokenManager {
    pub fn new(
        http: Client,
        cache: Arc<dyn Cache>,
        signer: Arc<RequestSigner>,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            http,
            cache,
            signer,
            endpoints,
        }
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    async fn valid_token(&self, namespace: &Namespace) -> Result<Option<String>> {
        let Some(lookup) = self.cache.get(namespace).await? else {
            return Ok(None);
        };
        if !lookup.valid {
            return Ok(None);
        }
        Ok(lookup.parse::<XboxTokenResponse>().map(|t| t.token))
    }

    /// Read every chain slot relevant to `relying_party`; stale or malformed entries read as absent
    pub async fn cached_tokens(&self, relying_party: &str) -> Result<CachedXboxTokens> {
        let xsts = match self.cache.get(&Namespace::xsts(relying_party)).await? {
            Some(lookup) if lookup.valid => lookup.parse::<XstsToken>(),
            _ => None,
        };

        let tokens = CachedXboxTokens {
            user_token: self.valid_token(&Namespace::XboxUser).await?,
            device_token: self.valid_token(&Namespace::XboxDevice).await?,
            title_token: self.valid_token(&Namespace::XboxTitle).await?,
            xsts,
        };
        debug!(
            user = tokens.user_token.is_some(),
            device = tokens.device_token.is_some(),
            title = tokens.title_token.is_some(),
            xsts = tokens.xsts.is_some(),
            "Cached Xbox tokens for {}",
            relying_party
        );
        Ok(tokens)
    }

    async fn store(&self, namespace: &Namespace, response: &XboxTokenResponse) -> Result<()> {
        let expires_on = response.not_after.as_deref().and_then(iso_to_ms);
        self.cache
            .set(namespace, serde_json::to_value(response)?, set_options(now_ms(), expires_on))
            .await?;
        Ok(())
    }

    async fn store_xsts(&self, relying_party: &str, token: &XstsToken) -> Result<()> {
        self.cache
            .set(
                &Namespace::xsts(relying_party),
                serde_json::to_value(token)?,
                set_options(now_ms(), iso_to_ms(&token.expires_on)),
            )
            .await?;
        Ok(())
    }

    /// POST a JSON body with the `Signature` header and the usual Xbox headers
    async fn signed_post<T: Serialize>(
        &self,
        step: &'static str,
        url: &str,
        payload: &T,
        contract_version: Option<&str>,
    ) -> Result<reqwest::Response> {
        let body = serde_json::to_vec(payload)?;
        let signature = self.signer.signature_header(url, "", &body)?;

        let mut request = self
            .http
            .post(url)
            .header("Signature", signature)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json");
        if let Some(version) = contract_version {
            request = request
                .header("Cache-Control", "no-store, must-revalidate, no-cache")
                .header("x-xbl-contract-version", version);
        }

        request
            .body(body)
            .send()
            .await
            .map_err(AuthError::network(step))
    }

    async fn token_response(
        step: &'static str,
        response: reqwest::Response,
    ) -> Result<XboxTokenResponse> {
        if !response.status().is_success() {
            return Err(AuthError::from_response(step, response).await);
        }
        response
            .json()
            .await
            .map_err(|e| AuthError::invalid_response(step, e.to_string()))
    }

    /// Trade an identity access token for a user token
    ///
    /// Federated (Microsoft identity platform) tokens use the `d=` ticket prefix,
    /// live.com tokens use `t=`.
    #[instrument(skip(self, access_token))]
    pub async fn get_user_token(&self, access_token: &str, federated: bool) -> Result<String> {
        let preamble = if federated { "d=" } else { "t=" };
        let payload = UserAuthRequest {
            relying_party: relying_party::XBOX_AUTH.to_string(),
            token_type: "JWT".to_string(),
            properties: UserAuthProperties {
                auth_method: "RPS".to_string(),
                site_name: "user.auth.xboxlive.com".to_string(),
                rps_ticket: format!("{preamble}{access_token}"),
            },
        };

        debug!("Requesting Xbox user token");
        let response = self
            .signed_post(USER_STEP, &self.endpoints.xbox_user_auth, &payload, Some("2"))
            .await?;
        let token = Self::token_response(USER_STEP, response).await?;
        self.store(&Namespace::XboxUser, &token).await?;
        Ok(token.token)
    }

    /// Request a device token asserting `device` as the hardware
    #[instrument(skip(self))]
    pub async fn get_device_token(&self, device: &DeviceIdentity) -> Result<String> {
        let payload = DeviceAuthRequest {
            relying_party: relying_party::XBOX_AUTH.to_string(),
            token_type: "JWT".to_string(),
            properties: DeviceAuthProperties {
                auth_method: "ProofOfPossession".to_string(),
                id: format!("{{{}}}", Uuid::new_v4()),
                device_type: device.device_type.clone(),
                serial_number: format!("{{{}}}", Uuid::new_v4()),
                version: device.device_version.clone(),
                proof_key: self.signer.proof_key().clone(),
            },
        };

        debug!("Requesting Xbox device token");
        let response = self
            .signed_post(DEVICE_STEP, &self.endpoints.xbox_device_auth, &payload, Some("1"))
            .await?;
        let token = Self::token_response(DEVICE_STEP, response).await?;
        self.store(&Namespace::XboxDevice, &token).await?;
        Ok(token.token)
    }

    /// Request a title token; only live.com access tokens are accepted
    #[instrument(skip(self, access_token, device_token))]
    pub async fn get_title_token(&self, access_token: &str, device_token: &str) -> Result<String> {
        let payload = TitleAuthRequest {
            relying_party: relying_party::XBOX_AUTH.to_string(),
            token_type: "JWT".to_string(),
            properties: TitleAuthProperties {
                auth_method: "RPS".to_string(),
                device_token: device_token.to_string(),
                rps_ticket: format!("t={access_token}"),
                site_name: "user.auth.xboxlive.com".to_string(),
                proof_key: self.signer.proof_key().clone(),
            },
        };

        debug!("Requesting Xbox title token");
        let response = self
            .signed_post(TITLE_STEP, &self.endpoints.xbox_title_auth, &payload, Some("1"))
            .await?;
        let token = Self::token_response(TITLE_STEP, response).await?;
        self.store(&Namespace::XboxTitle, &token).await?;
        Ok(token.token)
    }

    /// Authorize the chain for `relying_party`
    ///
    /// Denials carrying an `XErr` code become [`AuthError::Xsts`].
    #[instrument(skip(self, inputs))]
    pub async fn get_xsts_token(
        &self,
        inputs: XstsInputs,
        relying_party: &str,
    ) -> Result<XstsToken> {
        let payload = XstsAuthRequest {
            relying_party: relying_party.to_string(),
            token_type: "JWT".to_string(),
            properties: XstsAuthProperties {
                user_tokens: vec![inputs.user_token],
                device_token: inputs.device_token,
                title_token: inputs.title_token,
                optional_display_claims: None,
                proof_key: self.signer.proof_key().clone(),
                sandbox_id: "RETAIL".to_string(),
            },
        };

        debug!("Requesting XSTS token");
        let response = self
            .signed_post(XSTS_STEP, &self.endpoints.xsts_authorize, &payload, Some("1"))
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(denial) = serde_json::from_str::<XErrResponse>(&body) {
                warn!("XSTS denied for {} with XErr {}", relying_party, denial.xerr);
                return Err(AuthError::Xsts {
                    relying_party: relying_party.to_string(),
                    error: XstsError::from_xerr(denial.xerr, body),
                });
            }
            return Err(AuthError::Http {
                step: XSTS_STEP,
                status,
                body_snippet: body.chars().take(200).collect(),
            });
        }

        let response: XboxTokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::invalid_response(XSTS_STEP, e.to_string()))?;
        let xsts = Self::xsts_from(XSTS_STEP, response)?;
        self.store_xsts(relying_party, &xsts).await?;
        Ok(xsts)
    }

    /// One signed SISU request yielding user, title and XSTS tokens together
    #[instrument(skip(self, access_token, device_token))]
    pub async fn do_sisu_auth(
        &self,
        access_token: &str,
        device_token: &str,
        app_id: &str,
        relying_party: &str,
    ) -> Result<XstsToken> {
        let payload = SisuAuthRequest {
            access_token: format!("t={access_token}"),
            app_id: app_id.to_string(),
            device_token: device_token.to_string(),
            sandbox: "RETAIL".to_string(),
            use_modern_gamertag: true,
            site_name: "user.auth.xboxlive.com".to_string(),
            relying_party: relying_party.to_string(),
            proof_key: self.signer.proof_key().clone(),
        };

        debug!("Requesting SISU authorization for title {}", app_id);
        let response = self
            .signed_post(SISU_STEP, &self.endpoints.sisu_authorize, &payload, None)
            .await?;

        let status = response.status();
        if !status.is_success() {
            let xerr = response
                .headers()
                .get("x-err")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            if let Some(code) = xerr {
                warn!("SISU denied for {} with XErr {}", relying_party, code);
                let body = serde_json::json!({
                    "status": status.as_u16(),
                    "statusText": status.canonical_reason().unwrap_or_default(),
                })
                .to_string();
                return Err(AuthError::Xsts {
                    relying_party: relying_party.to_string(),
                    error: XstsError::from_xerr(code, body),
                });
            }
            return Err(AuthError::from_response(SISU_STEP, response).await);
        }

        let sisu: SisuAuthResponse = response
            .json()
            .await
            .map_err(|e| AuthError::invalid_response(SISU_STEP, e.to_string()))?;

        self.store(&Namespace::XboxUser, &sisu.user_token).await?;
        self.store(&Namespace::XboxTitle, &sisu.title_token).await?;
        let xsts = Self::xsts_from(SISU_STEP, sisu.authorization_token)?;
        self.store_xsts(relying_party, &xsts).await?;
        Ok(xsts)
    }

    fn xsts_from(step: &'static str, response: XboxTokenResponse) -> Result<XstsToken> {
        let claims = response
            .display_claims
            .xui
            .into_iter()
            .next()
            .ok_or_else(|| AuthError::invalid_response(step, "missing xui display claims"))?;

        let expires_on = response.not_after.unwrap_or_else(|| {
            chrono::DateTime::from_timestamp_millis(now_ms() + tc_cache::DEFAULT_HORIZON_MS)
                .unwrap_or_default()
                .to_rfc3339()
        });

        Ok(XstsToken {
            user_xuid: claims.xid,
            user_hash: claims.uhs,
            xsts_token: response.token,
            expires_on,
        })
    }
}

impl std::fmt::Debug for XboxTokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XboxTokenManager")
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tc_cache::{MemoryCache, SetOptions};
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn manager(server: &MockServer) -> (XboxTokenManager, Arc<dyn Cache>) {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let signer = Arc::new(RequestSigner::generate().unwrap());
        let endpoints = Endpoints::rebased(&server.uri()).unwrap();
        (
            XboxTokenManager::new(Client::new(), cache.clone(), signer, endpoints),
            cache,
        )
    }

    fn token_body(token: &str) -> serde_json::Value {
        json!({
            "Token": token,
            "NotAfter": "2099-01-01T00:00:00.0000000Z",
            "DisplayClaims": { "xui": [{ "uhs": "uhs1", "xid": "2535" }] }
        })
    }

    #[tokio::test]
    async fn test_user_token_is_signed_and_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/user/authenticate"))
            .and(header_exists("Signature"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("ut")))
            .expect(1)
            .mount(&server)
            .await;

        let (xbl, _) = manager(&server).await;
        assert_eq!(xbl.get_user_token("at", false).await.unwrap(), "ut");

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["Properties"]["RpsTicket"], "t=at");
        assert_eq!(
            requests[0].headers.get("x-xbl-contract-version").unwrap().to_str().unwrap(),
            "2"
        );

        let cached = xbl.cached_tokens("http://xboxlive.com").await.unwrap();
        assert_eq!(cached.user_token.as_deref(), Some("ut"));
        assert!(cached.xsts.is_none());
    }

    #[tokio::test]
    async fn test_federated_user_ticket_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/user/authenticate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("ut")))
            .mount(&server)
            .await;

        let (xbl, _) = manager(&server).await;
        xbl.get_user_token("at", true).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["Properties"]["RpsTicket"], "d=at");
    }

    #[tokio::test]
    async fn test_device_token_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/device/authenticate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Token": "dt",
                "NotAfter": "2099-01-01T00:00:00Z"
            })))
            .mount(&server)
            .await;

        let (xbl, _) = manager(&server).await;
        let device = DeviceIdentity {
            device_type: "Android".into(),
            device_version: "8.0.0".into(),
        };
        assert_eq!(xbl.get_device_token(&device).await.unwrap(), "dt");

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let properties = &body["Properties"];
        assert_eq!(properties["AuthMethod"], "ProofOfPossession");
        assert_eq!(properties["DeviceType"], "Android");
        assert_eq!(properties["Version"], "8.0.0");
        assert!(properties["Id"].as_str().unwrap().starts_with('{'));
        assert_eq!(properties["ProofKey"]["crv"], "P-256");
    }

    #[tokio::test]
    async fn test_xsts_xerr_maps_to_typed_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/xsts/authorize"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "Identity": "0",
                "XErr": 2148916233u64,
                "Message": "",
                "Redirect": "https://start.ui.xboxlive.com/CreateAccount"
            })))
            .mount(&server)
            .await;

        let (xbl, _) = manager(&server).await;
        let inputs = XstsInputs {
            user_token: "ut".into(),
            device_token: None,
            title_token: None,
        };
        let error = xbl.get_xsts_token(inputs, "http://xboxlive.com").await.unwrap_err();
        assert!(matches!(
            error,
            AuthError::Xsts {
                error: XstsError::NoXboxProfile,
                ..
            }
        ));
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_sisu_reads_xerr_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/authorize"))
            .respond_with(ResponseTemplate::new(403).insert_header("x-err", "2148916238"))
            .mount(&server)
            .await;

        let (xbl, _) = manager(&server).await;
        let error = xbl
            .do_sisu_auth("at", "dt", "00000000441cc96b", "http://xboxlive.com")
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            AuthError::Xsts {
                error: XstsError::ChildAccountRequiresFamily,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_sisu_stores_every_slot() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/authorize"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "UserToken": token_body("ut"),
                "TitleToken": token_body("tt"),
                "AuthorizationToken": token_body("xsts"),
            })))
            .mount(&server)
            .await;

        let (xbl, cache) = manager(&server).await;
        let rp = "http://xboxlive.com";
        let xsts = xbl.do_sisu_auth("at", "dt", "00000000441cc96b", rp).await.unwrap();
        assert_eq!(xsts.xsts_token, "xsts");
        assert_eq!(xsts.user_xuid.as_deref(), Some("2535"));

        let cached = xbl.cached_tokens(rp).await.unwrap();
        assert_eq!(cached.user_token.as_deref(), Some("ut"));
        assert_eq!(cached.title_token.as_deref(), Some("tt"));
        assert_eq!(cached.xsts, Some(xsts));
        assert!(cache.get(&Namespace::XboxDevice).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_slots_read_as_absent() {
        let server = MockServer::start().await;
        let (xbl, cache) = manager(&server).await;
        cache
            .set(
                &Namespace::XboxUser,
                token_body("old"),
                SetOptions::expiring_at(now_ms() - 1),
            )
            .await
            .unwrap();
        cache
            .set(&Namespace::XboxDevice, json!("not a token"), SetOptions::default())
            .await
            .unwrap();

        let cached = xbl.cached_tokens("http://xboxlive.com").await.unwrap();
        assert!(cached.user_token.is_none());
        assert!(cached.device_token.is_none());
    }
}
