//! Xbox Live credential chain for Minecraft clients
//!
//! Turns one Microsoft account into the short-lived tokens game services
//! expect, caching every link so the user is only prompted when nothing
//! cached or refreshable remains.
//!
//! # Chain
//!
//! 1. Identity access token: live.com (direct and combined flows) or the
//!    Microsoft identity platform (federated flow), obtained with a device code
//! 2. Xbox Live user, device and title tokens, or a single SISU exchange
//! 3. XSTS token scoped to a relying party
//! 4. Game service credential: Minecraft Java, Minecraft Bedrock, PlayFab,
//!    Bedrock services session
//!
//! Every Xbox Live request carries a P-256 signature over a Windows-epoch
//! timestamp, the request path and the body; see [`xbox::signer`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tc_auth::{AuthFlowConfig, Authflow, LogPromptHandler, relying_party, titles};
//! use tc_cache::MemoryCacheFactory;
//!
//! # async fn example() -> tc_auth::Result<()> {
//! let flow = Authflow::new(
//!     "player@example.com",
//!     Arc::new(MemoryCacheFactory::new()),
//!     AuthFlowConfig::direct(titles::MINECRAFT_NINTENDO_SWITCH),
//!     Arc::new(LogPromptHandler),
//! )
//! .await?;
//!
//! let xsts = flow.get_xbox_token(Some(relying_party::XBOXLIVE), false).await?;
//! println!("Signed in as XUID {:?}", xsts.user_xuid);
//! # Ok(())
//! # }
//! ```
//!
//! # Errors
//!
//! Every operation returns [`AuthError`]. Terminal errors (account denials,
//! invalid input, two-factor accounts, cancellation) surface at once;
//! transient ones are retried by the engine's [`RetryPolicy`].

pub mod config;
pub mod engine;
pub mod errors;
pub mod expiry;
pub mod identity;
pub mod retry;
pub mod services;
pub mod settings;
pub mod xbox;

pub use config::{
    AuthFlowConfig, DeviceIdentity, Endpoints, Flow, HttpTimeouts, RetryPolicy, relying_party,
    titles,
};
pub use engine::{Authflow, JavaOptions, JavaSession};
pub use errors::{AuthError, Result, XstsError};
pub use identity::{DeviceCodePrompt, LogPromptHandler, PromptHandler};
pub use services::{
    BedrockToken, Entitlements, JavaProfile, JavaToken, PlayfabLogin, ProfileKeys, SessionOptions,
    SessionToken,
};
pub use settings::{FlowKind, FlowSettings};
pub use xbox::models::XstsToken;
