use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;
use zeroize::Zeroizing;

use crate::errors::{AuthError, Result};

/// Known application (title) identifiers
pub mod titles {
    pub const MINECRAFT_NINTENDO_SWITCH: &str = "00000000441cc96b";
    pub const MINECRAFT_JAVA: &str = "00000000402b5328";
    /// Public client registered on the Microsoft identity platform
    pub const FEDERATED_DEFAULT_CLIENT: &str = "389b1b32-b5d5-43b2-bddc-84ce938d6737";
}

/// Relying parties XSTS tokens can be scoped to
pub mod relying_party {
    pub const XBOX_AUTH: &str = "http://auth.xboxlive.com";
    pub const XBOXLIVE: &str = "http://xboxlive.com";
    pub const MINECRAFT_JAVA: &str = "rp://api.minecraftservices.com/";
    pub const MINECRAFT_BEDROCK: &str = "https://multiplayer.minecraft.net/";
    pub const PLAYFAB: &str = "https://b980a380.minecraft.playfabapi.com/";
}

/// live.com scope granting an RPS ticket for Xbox user authentication
pub const LIVE_SCOPE: &str = "service::user.auth.xboxlive.com::MBI_SSL";

/// Default scope of the federated flow; `offline_access` is always appended
pub const FEDERATED_SCOPE: &str = "XboxLive.signin";

pub const FEDERATED_AUTHORITY: &str = "https://login.microsoftonline.com/consumers";

/// Every remote URL the chain talks to
///
/// Defaults point at the production services; tests rebase them onto a mock server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub live_authorize: String,
    pub live_device_code: String,
    pub live_token: String,
    pub xbox_user_auth: String,
    pub xbox_device_auth: String,
    pub xbox_title_auth: String,
    pub xsts_authorize: String,
    pub sisu_authorize: String,
    pub java_login_with_xbox: String,
    pub java_profile: String,
    pub java_license: String,
    pub java_certificates: String,
    pub bedrock_authenticate: String,
    pub bedrock_session_start: String,
    pub playfab_login_with_xbox: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            live_authorize: "https://login.live.com/oauth20_authorize.srf".to_string(),
            live_device_code: "https://login.live.com/oauth20_connect.srf".to_string(),
            live_token: "https://login.live.com/oauth20_token.srf".to_string(),
            xbox_user_auth: "https://user.auth.xboxlive.com/user/authenticate".to_string(),
            xbox_device_auth: "https://device.auth.xboxlive.com/device/authenticate".to_string(),
            xbox_title_auth: "https://title.auth.xboxlive.com/title/authenticate".to_string(),
            xsts_authorize: "https://xsts.auth.xboxlive.com/xsts/authorize".to_string(),
            sisu_authorize: "https://sisu.xboxlive.com/authorize".to_string(),
            java_login_with_xbox: "https://api.minecraftservices.com/authentication/login_with_xbox"
                .to_string(),
            java_profile: "https://api.minecraftservices.com/minecraft/profile".to_string(),
            java_license: "https://api.minecraftservices.com/entitlements/license".to_string(),
            java_certificates: "https://api.minecraftservices.com/player/certificates".to_string(),
            bedrock_authenticate: "https://multiplayer.minecraft.net/authentication".to_string(),
            bedrock_session_start:
                "https://authorization.franchise.minecraft-services.net/api/v1.0/session/start"
                    .to_string(),
            playfab_login_with_xbox: "https://20ca2.playfabapi.com/Client/LoginWithXbox".to_string(),
        }
    }
}

impl Endpoints {
    /// Keep every path but swap scheme, host, and port for those of `base`
    pub fn rebased(base: &str) -> Result<Self> {
        let base = Url::parse(base)?;
        let rebase = |endpoint: &str| -> Result<String> {
            let original = Url::parse(endpoint)?;
            let mut url = base.clone();
            url.set_path(original.path());
            url.set_query(original.query());
            Ok(url.to_string())
        };

        let defaults = Self::default();
        Ok(Self {
            live_authorize: rebase(&defaults.live_authorize)?,
            live_device_code: rebase(&defaults.live_device_code)?,
            live_token: rebase(&defaults.live_token)?,
            xbox_user_auth: rebase(&defaults.xbox_user_auth)?,
            xbox_device_auth: rebase(&defaults.xbox_device_auth)?,
            xbox_title_auth: rebase(&defaults.xbox_title_auth)?,
            xsts_authorize: rebase(&defaults.xsts_authorize)?,
            sisu_authorize: rebase(&defaults.sisu_authorize)?,
            java_login_with_xbox: rebase(&defaults.java_login_with_xbox)?,
            java_profile: rebase(&defaults.java_profile)?,
            java_license: rebase(&defaults.java_license)?,
            java_certificates: rebase(&defaults.java_certificates)?,
            bedrock_authenticate: rebase(&defaults.bedrock_authenticate)?,
            bedrock_session_start: rebase(&defaults.bedrock_session_start)?,
            playfab_login_with_xbox: rebase(&defaults.playfab_login_with_xbox)?,
        })
    }

    fn all(&self) -> [&str; 15] {
        [
            self.live_authorize.as_str(),
            self.live_device_code.as_str(),
            self.live_token.as_str(),
            self.xbox_user_auth.as_str(),
            self.xbox_device_auth.as_str(),
            self.xbox_title_auth.as_str(),
            self.xsts_authorize.as_str(),
            self.sisu_authorize.as_str(),
            self.java_login_with_xbox.as_str(),
            self.java_profile.as_str(),
            self.java_license.as_str(),
            self.java_certificates.as_str(),
            self.bedrock_authenticate.as_str(),
            self.bedrock_session_start.as_str(),
            self.playfab_login_with_xbox.as_str(),
        ]
    }
}

/// Identity flow variant, with the parameters each one needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// live.com device code, sequential Xbox chain with title authentication
    Direct { client_id: String, scopes: Vec<String> },

    /// Microsoft identity platform device code, sequential Xbox chain without title authentication
    Federated {
        client_id: String,
        authority: String,
        scopes: Vec<String>,
    },

    /// live.com device code, combined SISU Xbox chain
    Combined { client_id: String },
}

impl Flow {
    pub fn client_id(&self) -> &str {
        match self {
            Self::Direct { client_id, .. }
            | Self::Federated { client_id, .. }
            | Self::Combined { client_id } => client_id,
        }
    }

    /// Cache name holding this flow's identity tokens
    pub fn cache_name(&self) -> &'static str {
        match self {
            Self::Direct { .. } => "live",
            Self::Federated { .. } => "msal",
            Self::Combined { .. } => "sisu",
        }
    }

    /// Whether device and title tokens accompany XSTS requests
    pub fn title_auth(&self) -> bool {
        !matches!(self, Self::Federated { .. })
    }

    pub fn is_federated(&self) -> bool {
        matches!(self, Self::Federated { .. })
    }

    pub fn is_combined(&self) -> bool {
        matches!(self, Self::Combined { .. })
    }
}

/// Hardware identity asserted when requesting a device token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_type: String,
    pub device_version: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            device_type: "Nintendo".to_string(),
            device_version: "0.0.0".to_string(),
        }
    }
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpTimeouts {
    pub connect: Duration,
    pub request: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            request: Duration::from_secs(30),
        }
    }
}

/// Bounded retry with a fixed delay between attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_millis(2000),
        }
    }
}

/// Immutable per-session configuration of an [`crate::Authflow`]
#[derive(Clone)]
pub struct AuthFlowConfig {
    pub flow: Flow,
    pub device: DeviceIdentity,
    /// Default relying party for [`crate::Authflow::get_xbox_token`]
    pub relying_party: String,
    /// Static password; when set the device code prompt is never used
    pub password: Option<Zeroizing<String>>,
    /// Wipe every cache of the user before the first request
    pub force_refresh: bool,
    pub cancellation: Option<CancellationToken>,
    pub endpoints: Endpoints,
    pub http_timeouts: HttpTimeouts,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl AuthFlowConfig {
    fn with_flow(flow: Flow) -> Self {
        Self {
            flow,
            device: DeviceIdentity::default(),
            relying_party: relying_party::XBOXLIVE.to_string(),
            password: None,
            force_refresh: false,
            cancellation: None,
            endpoints: Endpoints::default(),
            http_timeouts: HttpTimeouts::default(),
            user_agent: Some("MinecraftLauncher/2.2.10675".to_string()),
            retry: RetryPolicy::default(),
        }
    }

    /// live.com device code flow for `client_id` (e.g. [`titles::MINECRAFT_NINTENDO_SWITCH`])
    pub fn direct(client_id: impl Into<String>) -> Self {
        Self::with_flow(Flow::Direct {
            client_id: client_id.into(),
            scopes: vec![LIVE_SCOPE.to_string()],
        })
    }

    /// Microsoft identity platform flow for an Azure app registration
    pub fn federated(client_id: impl Into<String>) -> Self {
        Self::with_flow(Flow::Federated {
            client_id: client_id.into(),
            authority: FEDERATED_AUTHORITY.to_string(),
            scopes: vec![FEDERATED_SCOPE.to_string()],
        })
    }

    /// SISU flow; only titles allowed to use SISU accept this
    pub fn combined(client_id: impl Into<String>) -> Self {
        Self::with_flow(Flow::Combined {
            client_id: client_id.into(),
        })
    }

    pub fn with_scopes(mut self, new_scopes: Vec<String>) -> Self {
        match &mut self.flow {
            Flow::Direct { scopes, .. } | Flow::Federated { scopes, .. } => *scopes = new_scopes,
            Flow::Combined { .. } => {}
        }
        self
    }

    pub fn with_authority(mut self, new_authority: impl Into<String>) -> Self {
        if let Flow::Federated { authority, .. } = &mut self.flow {
            *authority = new_authority.into();
        }
        self
    }

    pub fn with_device(
        mut self,
        device_type: impl Into<String>,
        device_version: impl Into<String>,
    ) -> Self {
        self.device = DeviceIdentity {
            device_type: device_type.into(),
            device_version: device_version.into(),
        };
        self
    }

    pub fn with_relying_party(mut self, relying_party: impl Into<String>) -> Self {
        self.relying_party = relying_party.into();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Reject configurations that could only fail later, mid-chain
    pub fn validate(&self) -> Result<()> {
        if self.flow.client_id().trim().is_empty() {
            return Err(AuthError::InvalidInput(format!(
                "Please specify an application id when using the {} flow",
                self.flow.cache_name()
            )));
        }

        match &self.flow {
            Flow::Direct { scopes, .. } | Flow::Federated { scopes, .. } if scopes.is_empty() => {
                return Err(AuthError::InvalidInput(
                    "At least one scope must be requested".to_string(),
                ));
            }
            Flow::Federated { authority, .. } => {
                Url::parse(authority)?;
            }
            _ => {}
        }

        if self.relying_party.trim().is_empty() {
            return Err(AuthError::InvalidInput(
                "Relying party must not be empty".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(AuthError::InvalidInput(
                "Retry policy needs at least one attempt".to_string(),
            ));
        }

        for endpoint in self.endpoints.all() {
            Url::parse(endpoint)?;
        }

        Ok(())
    }
}

impl std::fmt::Debug for AuthFlowConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthFlowConfig")
            .field("flow", &self.flow)
            .field("device", &self.device)
            .field("relying_party", &self.relying_party)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("force_refresh", &self.force_refresh)
            .field("cancellable", &self.cancellation.is_some())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
