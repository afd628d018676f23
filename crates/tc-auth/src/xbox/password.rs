//! Static password sign-in against the live.com login form
//!
//! The form is scraped for its `PPFT` anti-forgery value and `urlPost` target,
//! credentials are posted with the session cookies, and the resulting redirect
//! carries the access token in its fragment. Accounts protected by two-factor
//! authentication cannot complete this exchange.

use reqwest::{Client, StatusCode, redirect};
use tracing::{debug, info, instrument, warn};
use url::Url;
use zeroize::Zeroizing;

use crate::config::{Endpoints, HttpTimeouts};
use crate::errors::{AuthError, Result};

/// Client registered for the live.com desktop redirect
pub const LOGIN_CLIENT_ID: &str = "000000004C12AE6F";
const LOGIN_REDIRECT: &str = "https://login.live.com/oauth20_desktop.srf";
const LOGIN_SCOPE: &str = "service::user.auth.xboxlive.com::MBI_SSL";

const FORM_STEP: &str = "live.com login form";
const POST_STEP: &str = "live.com credential post";

/// Hidden form fields needed to post credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginForm {
    pub ppft: String,
    pub url_post: String,
}

/// Access token recovered from the post-login redirect
#[derive(Clone)]
pub struct PasswordLogin {
    pub access_token: Zeroizing<String>,
    pub expires_in: Option<u64>,
}

impl std::fmt::Debug for PasswordLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordLogin")
            .field("access_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Find the login form fields in the live.com authorize page
///
/// Accepted markup:
/// - `PPFT`: an `<input name="PPFT" ... value="...">` tag with double quotes and
///   `name` before `value`
/// - `urlPost`: either the inline script form `urlPost:'...'` or the JSON form
///   `"urlPost":"..."`
pub fn parse_login_form(html: &str) -> Result<LoginForm> {
    let ppft = html
        .find("name=\"PPFT\"")
        .and_then(|start| extract_between(&html[start..], "value=\"", "\""))
        .ok_or_else(|| AuthError::invalid_response(FORM_STEP, "PPFT value not found"))?;

    let url_post = extract_between(html, "urlPost:'", "'")
        .or_else(|| extract_between(html, "urlPost\":\"", "\""))
        .ok_or_else(|| AuthError::invalid_response(FORM_STEP, "urlPost not found"))?;

    Ok(LoginForm {
        ppft: ppft.to_string(),
        url_post: url_post.to_string(),
    })
}

fn extract_between<'a>(haystack: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = haystack.find(open)? + open.len();
    let len = haystack[start..].find(close)?;
    Some(&haystack[start..start + len])
}

/// Pull `access_token` (and `expires_in`) out of a redirect URL fragment
pub fn token_from_redirect(location: &str) -> Option<PasswordLogin> {
    let url = Url::parse(location).ok()?;
    let fragment = url.fragment()?;

    let mut access_token = None;
    let mut expires_in = None;
    for (key, value) in url::form_urlencoded::parse(fragment.as_bytes()) {
        match key.as_ref() {
            "access_token" => access_token = Some(Zeroizing::new(value.into_owned())),
            "expires_in" => expires_in = value.parse().ok(),
            _ => {}
        }
    }

    access_token.map(|access_token| PasswordLogin {
        access_token,
        expires_in,
    })
}

fn classify_failure(body: &str) -> AuthError {
    if body.contains("Help us protect your account")
        || body.contains("identity/confirm")
        || body.contains("proofs/Add")
    {
        return AuthError::TwoFactorRequired;
    }
    if body.contains("sErrTxt") || body.contains("account or password is incorrect") {
        return AuthError::InvalidCredentials(
            "Your account or password is incorrect".to_string(),
        );
    }
    AuthError::InvalidCredentials("live.com did not return an access token".to_string())
}

/// Signs in to live.com with an email and password
pub struct PasswordAuthenticator {
    http: Client,
    authorize_url: String,
}

impl PasswordAuthenticator {
    /// Build a cookie-keeping client that stops at the first redirect
    pub fn new(
        endpoints: &Endpoints,
        timeouts: &HttpTimeouts,
        user_agent: Option<&str>,
    ) -> Result<Self> {
        let http = Client::builder()
            .cookie_store(true)
            .redirect(redirect::Policy::none())
            .connect_timeout(timeouts.connect)
            .timeout(timeouts.request)
            .user_agent(user_agent.unwrap_or(concat!("tokenchain/", env!("CARGO_PKG_VERSION"))))
            .build()
            .map_err(AuthError::network("HTTP client setup"))?;

        Ok(Self {
            http,
            authorize_url: endpoints.live_authorize.clone(),
        })
    }

    fn login_page_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.authorize_url)?;
        url.query_pairs_mut()
            .append_pair("client_id", LOGIN_CLIENT_ID)
            .append_pair("redirect_uri", LOGIN_REDIRECT)
            .append_pair("scope", LOGIN_SCOPE)
            .append_pair("display", "touch")
            .append_pair("response_type", "token")
            .append_pair("locale", "en");
        Ok(url)
    }

    #[instrument(skip(self))]
    async fn fetch_form(&self) -> Result<LoginForm> {
        let response = self
            .http
            .get(self.login_page_url()?)
            .send()
            .await
            .map_err(AuthError::network(FORM_STEP))?;
        if !response.status().is_success() {
            return Err(AuthError::from_response(FORM_STEP, response).await);
        }
        let html = response.text().await.map_err(AuthError::network(FORM_STEP))?;
        parse_login_form(&html)
    }

    /// Run the form exchange; terminal errors for wrong credentials and two-factor accounts
    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<PasswordLogin> {
        let form = self.fetch_form().await?;
        debug!("Posting credentials to {}", form.url_post);

        let fields = [
            ("login", email),
            ("loginfmt", email),
            ("passwd", password),
            ("PPFT", form.ppft.as_str()),
        ];
        let response = self
            .http
            .post(&form.url_post)
            .form(&fields)
            .send()
            .await
            .map_err(AuthError::network(POST_STEP))?;

        let status = response.status();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some(login) = location.as_deref().and_then(token_from_redirect) {
            info!("Signed in to live.com with a password");
            return Ok(login);
        }

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AuthError::from_response(POST_STEP, response).await);
        }

        let body = response.text().await.unwrap_or_default();
        let error = classify_failure(&body);
        warn!("Password sign-in failed: {}", error);
        Err(error)
    }
}

impl std::fmt::Debug for PasswordAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordAuthenticator")
            .field("authorize_url", &self.authorize_url)
            .finish_non_exhaustive()
    }
}
