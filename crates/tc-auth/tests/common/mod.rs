#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::{Value, json};
use tc_auth::{AuthFlowConfig, Authflow, DeviceCodePrompt, Endpoints, PromptHandler, RetryPolicy};
use tc_cache::{CacheFactory, MemoryCacheFactory};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const USER: &str = "player@example.com";

/// Keeps every prompt it receives
#[derive(Default)]
pub struct RecordingPrompt {
    prompts: Mutex<Vec<DeviceCodePrompt>>,
}

impl RecordingPrompt {
    pub fn count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<DeviceCodePrompt> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

impl PromptHandler for RecordingPrompt {
    fn on_device_code(&self, prompt: &DeviceCodePrompt) {
        self.prompts.lock().unwrap().push(prompt.clone());
    }
}

/// Point every endpoint at `server` and keep retries quick
pub fn local(config: AuthFlowConfig, server: &MockServer) -> AuthFlowConfig {
    config
        .with_endpoints(Endpoints::rebased(&server.uri()).unwrap())
        .with_retry(RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_millis(10),
        })
}

/// Route chain logs to the test harness output
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub async fn authflow(
    server: &MockServer,
    config: AuthFlowConfig,
    factory: Arc<dyn CacheFactory>,
    prompt: Arc<RecordingPrompt>,
) -> Authflow {
    init_tracing();
    Authflow::new(USER, factory, local(config, server), prompt)
        .await
        .unwrap()
}

pub async fn memory_authflow(
    server: &MockServer,
    config: AuthFlowConfig,
) -> (Authflow, Arc<RecordingPrompt>) {
    let prompt = Arc::new(RecordingPrompt::default());
    let flow = authflow(server, config, Arc::new(MemoryCacheFactory::new()), prompt.clone()).await;
    (flow, prompt)
}

pub fn xbox_token(token: &str) -> Value {
    json!({
        "IssueInstant": "2024-01-01T00:00:00.0000000Z",
        "NotAfter": "2099-01-01T00:00:00.0000000Z",
        "Token": token,
        "DisplayClaims": { "xui": [{ "uhs": "uhs1", "xid": "2535400000000000" }] }
    })
}

pub fn device_code_body() -> Value {
    json!({
        "user_code": "ABCD-EFGH",
        "device_code": "device-code",
        "verification_uri": "https://www.microsoft.com/link",
        "expires_in": 60,
        "interval": 0
    })
}

pub fn live_tokens(access_token: &str) -> Value {
    json!({
        "token_type": "bearer",
        "expires_in": 3600,
        "scope": "service::user.auth.xboxlive.com::MBI_SSL",
        "access_token": access_token,
        "refresh_token": "refresh-token",
        "user_id": "live-user"
    })
}

/// live.com device code and token endpoints, each hit `calls` times
pub async fn mount_live(server: &MockServer, calls: u64) {
    Mock::given(method("POST"))
        .and(path("/oauth20_connect.srf"))
        .respond_with(ResponseTemplate::new(200).set_body_json(device_code_body()))
        .expect(calls)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth20_token.srf"))
        .respond_with(ResponseTemplate::new(200).set_body_json(live_tokens("live-at")))
        .expect(calls)
        .mount(server)
        .await;
}

pub async fn mount_xbox(server: &MockServer, endpoint: &str, token: &str, calls: u64) {
    Mock::given(method("POST"))
        .and(path(endpoint))
        .respond_with(ResponseTemplate::new(200).set_body_json(xbox_token(token)))
        .expect(calls)
        .mount(server)
        .await;
}

/// User, device, title and XSTS endpoints of the sequential chain
pub async fn mount_sequential(server: &MockServer, calls: u64) {
    mount_xbox(server, "/user/authenticate", "ut", calls).await;
    mount_xbox(server, "/device/authenticate", "dt", calls).await;
    mount_xbox(server, "/title/authenticate", "tt", calls).await;
    mount_xbox(server, "/xsts/authorize", "xsts", calls).await;
}

/// Unsigned JWT carrying `claims`
pub fn jwt(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES384","x5u":"key"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.signature")
}
