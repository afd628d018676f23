use std::sync::Arc;

use reqwest::Client;
use tc_cache::{Cache, CacheFactory, Namespace};
use tracing::{debug, info, instrument, warn};

use crate::config::{AuthFlowConfig, Flow, relying_party};
use crate::errors::{AuthError, Result};
use crate::identity::live::LiveEndpoints;
use crate::identity::{
    DeviceCodeNotice, IdentityTokenManager, LiveTokenManager, MsaTokenManager, PromptHandler,
};
use crate::retry::retry;
use crate::services::{
    BedrockOptions, BedrockToken, BedrockTokenManager, Entitlements, JavaProfile, JavaToken,
    JavaTokenManager, PlayfabLogin, PlayfabTokenManager, ProfileKeys, ServiceTokenManager,
    SessionOptions, SessionToken, SessionTokenManager,
};
use crate::xbox::models::XstsToken;
use crate::xbox::password::PasswordAuthenticator;
use crate::xbox::signer::{ProofKey, RequestSigner};
use crate::xbox::{XboxTokenManager, XstsInputs};

/// Optional calls made after a Java login
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JavaOptions {
    pub fetch_profile: bool,
    pub fetch_entitlements: bool,
    pub fetch_certificates: bool,
}

/// Java services credential plus whichever extras were requested and succeeded
#[derive(Debug)]
pub struct JavaSession {
    pub token: JavaToken,
    pub profile: Option<JavaProfile>,
    pub entitlements: Option<Entitlements>,
    pub certificates: Option<ProfileKeys>,
}

/// Cache handles of one user
struct CacheSet {
    identity: Arc<dyn Cache>,
    xbl: Arc<dyn Cache>,
    bed: Arc<dyn Cache>,
    mca: Arc<dyn Cache>,
    mcs: Arc<dyn Cache>,
    pfb: Arc<dyn Cache>,
}

impl CacheSet {
    async fn open(factory: &dyn CacheFactory, flow: &Flow, user: &str) -> Result<Self> {
        Ok(Self {
            identity: factory.create_cache(flow.cache_name(), user).await?,
            xbl: factory.create_cache("xbl", user).await?,
            bed: factory.create_cache("bed", user).await?,
            mca: factory.create_cache("mca", user).await?,
            mcs: factory.create_cache("mcs", user).await?,
            pfb: factory.create_cache("pfb", user).await?,
        })
    }

    fn all(&self) -> [&Arc<dyn Cache>; 6] {
        [&self.identity, &self.xbl, &self.bed, &self.mca, &self.mcs, &self.pfb]
    }

    fn for_namespace(&self, namespace: &Namespace) -> &Arc<dyn Cache> {
        match namespace {
            Namespace::Identity => &self.identity,
            Namespace::XboxUser
            | Namespace::XboxDevice
            | Namespace::XboxTitle
            | Namespace::Xsts(_) => &self.xbl,
            Namespace::Java => &self.mca,
            Namespace::Bedrock => &self.bed,
            Namespace::Session => &self.mcs,
            Namespace::ThirdPartyLogin => &self.pfb,
        }
    }
}

/// Credential chain of one user
///
/// Each `get_*` call returns a valid cached credential without touching the
/// network, or re-derives it from its upstream (identity token, Xbox chain,
/// game service) under the configured retry policy. The device code prompt is
/// only shown when no cached or refreshable identity token exists.
///
/// ```no_run
/// use std::sync::Arc;
/// use tc_auth::{AuthFlowConfig, Authflow, LogPromptHandler, titles};
/// use tc_cache::FileCacheFactory;
///
/// # async fn example() -> tc_auth::Result<()> {
/// let factory = FileCacheFactory::new(FileCacheFactory::default_cache_dir()?).await?;
/// let flow = Authflow::new(
///     "player@example.com",
///     Arc::new(factory),
///     AuthFlowConfig::direct(titles::MINECRAFT_NINTENDO_SWITCH),
///     Arc::new(LogPromptHandler),
/// )
/// .await?;
///
/// let java = flow.get_java_token(Default::default()).await?;
/// println!("Logged in as {}", java.token.username);
/// # Ok(())
/// # }
/// ```
pub struct Authflow {
    user: String,
    config: AuthFlowConfig,
    prompt: Arc<dyn PromptHandler>,
    caches: CacheSet,
    signer: Arc<RequestSigner>,
    identity: Box<dyn IdentityTokenManager>,
    password: Option<PasswordAuthenticator>,
    xbox: XboxTokenManager,
    java: JavaTokenManager,
    bedrock: BedrockTokenManager,
    playfab: PlayfabTokenManager,
    session: SessionTokenManager,
}

impl Authflow {
    #[instrument(skip(factory, config, prompt), fields(flow = config.flow.cache_name()))]
    pub async fn new(
        user: impl Into<String> + std::fmt::Debug,
        factory: Arc<dyn CacheFactory>,
        config: AuthFlowConfig,
        prompt: Arc<dyn PromptHandler>,
    ) -> Result<Self> {
        config.validate()?;
        let user = user.into();

        let http = Client::builder()
            .connect_timeout(config.http_timeouts.connect)
            .timeout(config.http_timeouts.request)
            .user_agent(
                config
                    .user_agent
                    .as_deref()
                    .unwrap_or(concat!("tokenchain/", env!("CARGO_PKG_VERSION"))),
            )
            .cookie_store(true)
            .build()
            .map_err(AuthError::network("HTTP client setup"))?;

        let caches = CacheSet::open(factory.as_ref(), &config.flow, &user).await?;
        if config.force_refresh {
            info!("Force refresh requested, clearing cached tokens");
            for cache in caches.all() {
                cache.reset().await?;
            }
        }

        let signer = Arc::new(RequestSigner::generate()?);
        let endpoints = config.endpoints.clone();
        let cancellation = config.cancellation.clone();

        let identity: Box<dyn IdentityTokenManager> = match &config.flow {
            Flow::Direct { client_id, scopes } => Box::new(LiveTokenManager::new(
                http.clone(),
                client_id.clone(),
                scopes.clone(),
                LiveEndpoints {
                    device_code: endpoints.live_device_code.clone(),
                    token: endpoints.live_token.clone(),
                },
                caches.identity.clone(),
                cancellation,
            )),
            Flow::Combined { client_id } => Box::new(LiveTokenManager::new(
                http.clone(),
                client_id.clone(),
                vec![crate::config::LIVE_SCOPE.to_string()],
                LiveEndpoints {
                    device_code: endpoints.live_device_code.clone(),
                    token: endpoints.live_token.clone(),
                },
                caches.identity.clone(),
                cancellation,
            )),
            Flow::Federated {
                client_id,
                authority,
                scopes,
            } => Box::new(MsaTokenManager::new(
                http.clone(),
                client_id.clone(),
                authority.clone(),
                scopes.clone(),
                caches.identity.clone(),
                cancellation,
            )),
        };

        let password = if config.password.is_some() {
            Some(PasswordAuthenticator::new(
                &endpoints,
                &config.http_timeouts,
                config.user_agent.as_deref(),
            )?)
        } else {
            None
        };

        debug!("Credential chain ready");
        Ok(Self {
            xbox: XboxTokenManager::new(
                http.clone(),
                caches.xbl.clone(),
                signer.clone(),
                endpoints.clone(),
            ),
            java: JavaTokenManager::new(http.clone(), caches.mca.clone(), endpoints.clone()),
            bedrock: BedrockTokenManager::new(http.clone(), caches.bed.clone(), endpoints.clone()),
            playfab: PlayfabTokenManager::new(http.clone(), caches.pfb.clone(), endpoints.clone()),
            session: SessionTokenManager::new(http, caches.mcs.clone(), endpoints),
            user,
            config,
            prompt,
            caches,
            signer,
            identity,
            password,
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn config(&self) -> &AuthFlowConfig {
        &self.config
    }

    /// Key bound to this session's signed Xbox requests
    pub fn proof_key(&self) -> &ProofKey {
        self.signer.proof_key()
    }

    /// Identity access token, prompting for a device code only as a last resort
    #[instrument(skip(self), fields(user = %self.user))]
    pub async fn get_identity_token(&self) -> Result<String> {
        if self.identity.verify().await? {
            if let Some(state) = self.identity.access_token().await? {
                debug!("Identity token valid until {}", state.expires_on);
                return Ok(state.token);
            }
        }

        debug!("No usable identity token, starting device code sign-in");
        let login = self
            .identity
            .obtain_interactive(DeviceCodeNotice::new(self.prompt.clone()))
            .await?;

        match login.account.as_ref().and_then(|a| a.username.as_deref().or(a.user_id.as_deref())) {
            Some(name) => info!("Signed in as {}", name),
            None => info!("Signed in with Microsoft"),
        }
        Ok(login.access_token)
    }

    /// XSTS token for `relying_party` (the configured default when `None`)
    ///
    /// `force` skips the cached XSTS token but still reuses valid user, device
    /// and title tokens.
    #[instrument(skip(self), fields(user = %self.user))]
    pub async fn get_xbox_token(
        &self,
        relying_party: Option<&str>,
        force: bool,
    ) -> Result<XstsToken> {
        let relying_party = relying_party.unwrap_or(self.config.relying_party.as_str());

        if !force {
            if let Some(xsts) = self.xbox.cached_tokens(relying_party).await?.xsts {
                debug!("Using cached XSTS token for {}", relying_party);
                return Ok(xsts);
            }
        }

        let this = self;
        if let Some(password) = &self.config.password {
            return retry(
                &self.config.retry,
                "Xbox password sign-in",
                self.config.cancellation.as_ref(),
                move || async move { this.xsts_with_password(password, relying_party).await },
                || async { Ok::<(), AuthError>(()) },
            )
            .await;
        }

        retry(
            &self.config.retry,
            "Xbox token chain",
            self.config.cancellation.as_ref(),
            move || async move { this.xsts_from_identity(relying_party).await },
            move || async move { this.invalidate(&Namespace::Identity).await },
        )
        .await
    }

    async fn xsts_with_password(&self, password: &str, relying_party: &str) -> Result<XstsToken> {
        let authenticator = self.password.as_ref().ok_or_else(|| {
            AuthError::InvalidInput("password sign-in is not configured".to_string())
        })?;
        let login = authenticator.login(&self.user, password).await?;
        let user_token = self.xbox.get_user_token(&login.access_token, false).await?;
        self.xbox
            .get_xsts_token(
                XstsInputs {
                    user_token,
                    device_token: None,
                    title_token: None,
                },
                relying_party,
            )
            .await
    }

    async fn xsts_from_identity(&self, relying_party: &str) -> Result<XstsToken> {
        let access_token = self.get_identity_token().await?;
        let cached = self.xbox.cached_tokens(relying_party).await?;

        if self.config.flow.is_combined()
            && (cached.user_token.is_none()
                || cached.device_token.is_none()
                || cached.title_token.is_none())
        {
            let device_token = match cached.device_token {
                Some(token) => token,
                None => self.xbox.get_device_token(&self.config.device).await?,
            };
            debug!("Using SISU for {}", relying_party);
            return self
                .xbox
                .do_sisu_auth(
                    &access_token,
                    &device_token,
                    self.config.flow.client_id(),
                    relying_party,
                )
                .await;
        }

        let user_token = match cached.user_token {
            Some(token) => token,
            None => {
                self.xbox
                    .get_user_token(&access_token, self.identity.is_federated())
                    .await?
            }
        };

        let mut inputs = XstsInputs {
            user_token,
            device_token: None,
            title_token: None,
        };
        if self.config.flow.title_auth() {
            let device_token = match cached.device_token {
                Some(token) => token,
                None => self.xbox.get_device_token(&self.config.device).await?,
            };
            let title_token = match cached.title_token {
                Some(token) => token,
                None => self.xbox.get_title_token(&access_token, &device_token).await?,
            };
            inputs.device_token = Some(device_token);
            inputs.title_token = Some(title_token);
        }

        self.xbox.get_xsts_token(inputs, relying_party).await
    }

    /// Minecraft Java services token, with the requested extras
    ///
    /// Extras are best-effort: a failed extra is logged and left empty.
    #[instrument(skip(self), fields(user = %self.user))]
    pub async fn get_java_token(&self, options: JavaOptions) -> Result<JavaSession> {
        let token = match self.java.get_cached().await?.into_valid() {
            Some(token) => {
                debug!("Using cached Minecraft Java token");
                token
            }
            None => {
                let this = self;
                retry(
                    &self.config.retry,
                    "Minecraft Java login",
                    self.config.cancellation.as_ref(),
                    move || async move {
                        let xsts = this
                            .get_xbox_token(Some(relying_party::MINECRAFT_JAVA), false)
                            .await?;
                        this.java.get_access_token(&xsts, &()).await
                    },
                    move || async move {
                        this.invalidate(&Namespace::xsts(relying_party::MINECRAFT_JAVA))
                            .await
                    },
                )
                .await?
            }
        };

        let mut session = JavaSession {
            token,
            profile: None,
            entitlements: None,
            certificates: None,
        };
        let access_token = session.token.access_token.clone();

        if options.fetch_profile {
            match self.java.fetch_profile(&access_token).await {
                Ok(profile) => session.profile = Some(profile),
                Err(e) => warn!("Failed to obtain Minecraft profile: {}", e),
            }
        }
        if options.fetch_entitlements {
            match self.java.fetch_entitlements(&access_token).await {
                Ok(entitlements) => session.entitlements = Some(entitlements),
                Err(e) => warn!("Failed to obtain entitlements: {}", e),
            }
        }
        if options.fetch_certificates {
            match self.java.fetch_certificates(&access_token).await {
                Ok(keys) => session.certificates = Some(keys),
                Err(e) => warn!("Failed to obtain profile keys: {}", e),
            }
        }

        Ok(session)
    }

    /// Minecraft Bedrock chain for the client's ECDH `public_key`
    ///
    /// A cached chain is reused only when it was issued for the same key.
    #[instrument(skip(self, public_key), fields(user = %self.user))]
    pub async fn get_bedrock_token(&self, public_key: &str) -> Result<BedrockToken> {
        let options = BedrockOptions::new(public_key, self.config.flow.title_auth());
        options.validate()?;

        if let Some(cached) = self.bedrock.get_cached().await?.into_valid() {
            if cached.identity_public_key == options.public_key {
                debug!("Using cached Minecraft Bedrock chain");
                return Ok(cached);
            }
            debug!("Cached Bedrock chain was issued for another key");
        }

        let this = self;
        let options = &options;
        retry(
            &self.config.retry,
            "Minecraft Bedrock authentication",
            self.config.cancellation.as_ref(),
            move || async move {
                let xsts = this
                    .get_xbox_token(Some(relying_party::MINECRAFT_BEDROCK), false)
                    .await?;
                this.bedrock.get_access_token(&xsts, options).await
            },
            move || async move {
                this.invalidate(&Namespace::xsts(relying_party::MINECRAFT_BEDROCK))
                    .await
            },
        )
        .await
    }

    /// PlayFab `LoginWithXbox` result
    #[instrument(skip(self), fields(user = %self.user))]
    pub async fn get_playfab_login(&self) -> Result<PlayfabLogin> {
        if let Some(login) = self.playfab.get_cached().await?.into_valid() {
            debug!("Using cached PlayFab login");
            return Ok(login);
        }

        let this = self;
        retry(
            &self.config.retry,
            "PlayFab login",
            self.config.cancellation.as_ref(),
            move || async move {
                let xsts = this.get_xbox_token(Some(relying_party::PLAYFAB), false).await?;
                this.playfab.get_access_token(&xsts, &()).await
            },
            move || async move { this.invalidate(&Namespace::xsts(relying_party::PLAYFAB)).await },
        )
        .await
    }

    /// Minecraft Bedrock services session, started from the PlayFab login
    #[instrument(skip(self, options), fields(user = %self.user))]
    pub async fn get_session_token(&self, options: &SessionOptions) -> Result<SessionToken> {
        if let Some(token) = self.session.get_cached().await?.into_valid() {
            debug!("Using cached Bedrock services session");
            return Ok(token);
        }

        let this = self;
        retry(
            &self.config.retry,
            "Bedrock services session",
            self.config.cancellation.as_ref(),
            move || async move {
                let playfab = this.get_playfab_login().await?;
                this.session.get_access_token(&playfab, options).await
            },
            move || async move { this.invalidate(&Namespace::ThirdPartyLogin).await },
        )
        .await
    }

    /// Mark one slot stale; the next request re-derives it
    pub async fn invalidate(&self, namespace: &Namespace) -> Result<()> {
        debug!("Invalidating {}", namespace);
        self.caches.for_namespace(namespace).invalidate(namespace).await?;
        Ok(())
    }

    /// Drop every cached credential of this user
    pub async fn reset(&self) -> Result<()> {
        for cache in self.caches.all() {
            cache.reset().await?;
        }
        info!("Cleared cached tokens for {}", self.user);
        Ok(())
    }
}

impl std::fmt::Debug for Authflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authflow")
            .field("user", &self.user)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
