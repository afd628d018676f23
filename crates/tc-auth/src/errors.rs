use thiserror::Error;

/// Error type shared by every stage of the credential chain
///
/// Errors are either terminal (surfaced immediately, never retried) or
/// transient (retried by the engine's bounded policy); see
/// [`AuthError::is_retryable`].
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Authentication was cancelled")]
    Cancelled,

    #[error("Authentication failed, timed out waiting for the device code to be redeemed")]
    DeviceCodeTimeout,

    #[error("Failed to acquire authorization code from device token ({code}) - {description}")]
    DeviceCodeRejected { code: String, description: String },

    #[error("Cannot refresh without refresh token")]
    MissingRefreshToken,

    #[error("Network error during {step}: {source}")]
    Network {
        step: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{step} failed with HTTP {status}: {body_snippet}")]
    Http {
        step: &'static str,
        status: reqwest::StatusCode,
        body_snippet: String,
    },

    #[error("XSTS authorization for {relying_party} denied: {error}")]
    Xsts {
        relying_party: String,
        #[source]
        error: XstsError,
    },

    #[error("Two-factor authentication is enabled on this account; password sign-in is not possible")]
    TwoFactorRequired,

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Invalid response from {step}: {message}")]
    InvalidResponse { step: &'static str, message: String },

    #[error("Unexpected response from {step}: {message}")]
    ResponseInvariant { step: &'static str, message: String },

    #[error("Request signing failed: {0}")]
    Signing(String),

    #[error("JSON serialization/deserialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Token cache error: {0}")]
    Cache(#[from] tc_cache::CacheError),
}

impl AuthError {
    /// Whether the engine may retry the failed step after refreshing its upstream
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::Http { .. }
                | Self::InvalidResponse { .. }
                | Self::Serde(_)
                | Self::Cache(_)
        )
    }

    pub(crate) fn network(step: &'static str) -> impl FnOnce(reqwest::Error) -> Self {
        move |source| Self::Network { step, source }
    }

    pub(crate) fn invalid_response(step: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidResponse {
            step,
            message: message.into(),
        }
    }

    /// Build an [`AuthError::Http`] from a failed response, keeping a short body snippet
    pub(crate) async fn from_response(step: &'static str, response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Self::Http {
            step,
            status,
            body_snippet: body.chars().take(200).collect(),
        }
    }
}

/// Account states Xbox Live reports through the `XErr` code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XstsError {
    #[error(
        "Your account was banned by Xbox for violating one or more Community Standards for Xbox and is unable to be used (XErr: 2148916227)"
    )]
    Banned,

    #[error(
        "Your account is currently restricted and your guardian has not given you permission to play online. Login to https://account.microsoft.com/family/ and have your guardian change your permissions (XErr: 2148916229)"
    )]
    GuardianRestricted,

    #[error(
        "Your account currently does not have an Xbox profile. Please create one at https://signup.live.com/signup (XErr: 2148916233)"
    )]
    NoXboxProfile,

    #[error("Your account has not accepted Xbox's Terms of Service. Please login and accept them (XErr: 2148916234)")]
    TermsNotAccepted,

    #[error(
        "Your account resides in a region that Xbox has not authorized use from. Xbox has blocked your attempt at logging in (XErr: 2148916235)"
    )]
    RegionNotSupported,

    #[error(
        "Your account requires proof of age. Please login to https://login.live.com/login.srf and provide proof of age (XErr: 2148916236)"
    )]
    ProofOfAgeRequired,

    #[error("Your account has reached its limit for playtime and has been blocked from logging in (XErr: 2148916237)")]
    PlaytimeLimitReached,

    #[error(
        "The account date of birth is under 18 years and cannot proceed unless the account is added to a family by an adult (XErr: 2148916238)"
    )]
    ChildAccountRequiresFamily,

    #[error("Xbox Live authentication failed to obtain a XSTS token. XErr: {code}\n{body}")]
    Unknown { code: u64, body: String },
}

impl XstsError {
    pub fn from_xerr(code: u64, body: impl Into<String>) -> Self {
        match code {
            2148916227 => Self::Banned,
            2148916229 => Self::GuardianRestricted,
            2148916233 => Self::NoXboxProfile,
            2148916234 => Self::TermsNotAccepted,
            2148916235 => Self::RegionNotSupported,
            2148916236 => Self::ProofOfAgeRequired,
            2148916237 => Self::PlaytimeLimitReached,
            2148916238 => Self::ChildAccountRequiresFamily,
            code => Self::Unknown {
                code,
                body: body.into(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
