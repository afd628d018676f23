use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{DeviceCodePrompt, IdentityTokens};
use crate::errors::{AuthError, Result};
use crate::expiry::after_seconds;
use crate::retry::cancellable;

const REQUEST_STEP: &str = "device code request";
const POLL_STEP: &str = "device code polling";

const DEFAULT_INTERVAL_SECS: u64 = 5;
const SLOW_DOWN_SECS: u64 = 5;
/// Lower bound on the polling interval
const MIN_INTERVAL: Duration = Duration::from_secs(1);
/// Stop polling slightly before the provider's own expiry
const EXPIRY_MARGIN: Duration = Duration::from_millis(100);

/// Device authorization response shared by live.com and the identity platform
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeResponse {
    pub user_code: String,
    pub device_code: String,
    #[serde(alias = "verification_url")]
    pub verification_uri: String,
    pub expires_in: u64,
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl DeviceCodeResponse {
    pub fn prompt(&self, acquired_on: i64) -> DeviceCodePrompt {
        let message = self.message.clone().unwrap_or_else(|| {
            format!(
                "To sign in, use a web browser to open the page {} and use the code {} or visit http://microsoft.com/link?otc={}",
                self.verification_uri, self.user_code, self.user_code
            )
        });
        DeviceCodePrompt {
            user_code: self.user_code.clone(),
            verification_uri: self.verification_uri.clone(),
            device_code: self.device_code.clone(),
            expires_on: after_seconds(acquired_on, self.expires_in),
            expires_in_seconds: self.expires_in,
            poll_interval_seconds: self.interval.unwrap_or(DEFAULT_INTERVAL_SECS),
            message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// POST the device authorization request
pub(crate) async fn request_device_code(
    http: &Client,
    url: &str,
    form: &[(&str, &str)],
    cancellation: Option<&CancellationToken>,
) -> Result<DeviceCodeResponse> {
    let response = cancellable(cancellation, http.post(url).form(form).send())
        .await?
        .map_err(AuthError::network(REQUEST_STEP))?;

    if !response.status().is_success() {
        return Err(AuthError::from_response(REQUEST_STEP, response).await);
    }

    response
        .json()
        .await
        .map_err(|e| AuthError::invalid_response(REQUEST_STEP, e.to_string()))
}

enum PollOutcome {
    Granted(IdentityTokens),
    Pending,
    SlowDown,
}

async fn poll_once(http: &Client, url: &str, form: &[(&str, &str)]) -> Result<PollOutcome> {
    let response = http
        .post(url)
        .form(form)
        .send()
        .await
        .map_err(AuthError::network(POLL_STEP))?;
    let status = response.status();
    let body = response.text().await.map_err(AuthError::network(POLL_STEP))?;

    if let Ok(error) = serde_json::from_str::<OAuthErrorBody>(&body) {
        let description = error.error_description.unwrap_or_default();
        return match error.error.as_str() {
            "authorization_pending" => {
                debug!("Still waiting: {}", description);
                Ok(PollOutcome::Pending)
            }
            "slow_down" => Ok(PollOutcome::SlowDown),
            "expired_token" => Err(AuthError::DeviceCodeTimeout),
            code => Err(AuthError::DeviceCodeRejected {
                code: code.to_string(),
                description,
            }),
        };
    }

    if !status.is_success() {
        return Err(AuthError::Http {
            step: POLL_STEP,
            status,
            body_snippet: body.chars().take(200).collect(),
        });
    }

    let tokens = serde_json::from_str(&body)
        .map_err(|e| AuthError::invalid_response(POLL_STEP, e.to_string()))?;
    Ok(PollOutcome::Granted(tokens))
}

/// Poll the token endpoint until the user redeems the code
///
/// Transient failures keep polling; provider rejections and expiry end it.
pub(crate) async fn poll_for_tokens(
    http: &Client,
    url: &str,
    form: &[(&str, &str)],
    device: &DeviceCodeResponse,
    cancellation: Option<&CancellationToken>,
) -> Result<IdentityTokens> {
    let deadline =
        Instant::now() + Duration::from_secs(device.expires_in).saturating_sub(EXPIRY_MARGIN);
    let mut interval =
        Duration::from_secs(device.interval.unwrap_or(DEFAULT_INTERVAL_SECS)).max(MIN_INTERVAL);

    loop {
        cancellable(cancellation, tokio::time::sleep(interval)).await?;
        if Instant::now() >= deadline {
            return Err(AuthError::DeviceCodeTimeout);
        }

        match cancellable(cancellation, poll_once(http, url, form)).await? {
            Ok(PollOutcome::Granted(tokens)) => return Ok(tokens),
            Ok(PollOutcome::Pending) => {}
            Ok(PollOutcome::SlowDown) => {
                interval += Duration::from_secs(SLOW_DOWN_SECS);
                debug!("Provider asked to slow down, polling every {:?}", interval);
            }
            Err(e) if e.is_retryable() => warn!("Device code poll failed, will retry: {}", e),
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prompt_fills_default_message() {
        let response: DeviceCodeResponse = serde_json::from_value(json!({
            "user_code": "ABCD-EFGH",
            "device_code": "dc",
            "verification_uri": "https://www.microsoft.com/link",
            "expires_in": 900,
            "interval": 5
        }))
        .unwrap();

        let prompt = response.prompt(1_000);
        assert_eq!(prompt.expires_on, 901_000);
        assert_eq!(prompt.poll_interval_seconds, 5);
        assert!(prompt.message.contains("ABCD-EFGH"));
        assert!(prompt.message.contains("https://www.microsoft.com/link"));
    }

    #[test]
    fn test_provider_message_is_kept() {
        let response: DeviceCodeResponse = serde_json::from_value(json!({
            "user_code": "X",
            "device_code": "dc",
            "verification_url": "https://microsoft.com/devicelogin",
            "expires_in": 60,
            "message": "Enter X"
        }))
        .unwrap();
        let prompt = response.prompt(0);
        assert_eq!(prompt.message, "Enter X");
        assert_eq!(prompt.poll_interval_seconds, DEFAULT_INTERVAL_SECS);
    }

    #[tokio::test]
    async fn test_zero_interval_is_raised_to_floor() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "error": "authorization_pending" })),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "AT" })))
            .mount(&server)
            .await;
        let device = DeviceCodeResponse {
            user_code: "ABCD".into(),
            device_code: "dc".into(),
            verification_uri: "https://www.microsoft.com/link".into(),
            expires_in: 60,
            interval: Some(0),
            message: None,
        };

        let started = Instant::now();
        let url = format!("{}/token", server.uri());
        let tokens = poll_for_tokens(&Client::new(), &url, &[("device_code", "dc")], &device, None)
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "AT");
        assert!(started.elapsed() >= MIN_INTERVAL * 2);
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_completion() {
        let token = CancellationToken::new();
        token.cancel();
        let result = cancellable(Some(&token), std::future::pending::<()>()).await;
        assert!(matches!(result, Err(AuthError::Cancelled)));
    }
}
