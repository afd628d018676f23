//! Game services that trade an upstream token for their own credential
//!
//! Each manager owns one cache slot and normalizes whatever lifetime format
//! its provider uses into an absolute expiry before writing it.

pub mod bedrock;
pub mod java;
pub mod playfab;
pub mod session;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tc_cache::{Cache, Namespace, now_ms};

use crate::errors::{AuthError, Result};
use crate::expiry::set_options;

pub use bedrock::{BedrockOptions, BedrockToken, BedrockTokenManager};
pub use java::{Entitlements, JavaProfile, JavaToken, JavaTokenManager, ProfileKeys};
pub use playfab::{PlayfabLogin, PlayfabTokenManager};
pub use session::{SessionOptions, SessionToken, SessionTokenManager};

/// Cached service credential as read at call time
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub valid: bool,
    pub data: Option<T>,
    pub expires_on: Option<i64>,
}

impl<T> Cached<T> {
    pub fn missing() -> Self {
        Self {
            valid: false,
            data: None,
            expires_on: None,
        }
    }

    /// The data, only while it is still valid
    pub fn into_valid(self) -> Option<T> {
        if self.valid { self.data } else { None }
    }
}

/// Uniform contract of the downstream service managers
#[async_trait]
pub trait ServiceTokenManager: Send + Sync {
    type Upstream: Send + Sync;
    type Options: Send + Sync;
    type Token: Send + Sync;

    async fn get_cached(&self) -> Result<Cached<Self::Token>>;

    /// Exchange `upstream` for a fresh credential and cache it
    async fn get_access_token(
        &self,
        upstream: &Self::Upstream,
        options: &Self::Options,
    ) -> Result<Self::Token>;
}

/// One manager's cache slot
#[derive(Clone)]
pub(crate) struct ServiceSlot {
    cache: Arc<dyn Cache>,
    namespace: Namespace,
}

impl ServiceSlot {
    pub fn new(cache: Arc<dyn Cache>, namespace: Namespace) -> Self {
        Self { cache, namespace }
    }

    pub async fn get<T: DeserializeOwned>(&self) -> Result<Cached<T>> {
        let Some(lookup) = self.cache.get(&self.namespace).await? else {
            return Ok(Cached::missing());
        };
        let data = lookup.parse::<T>();
        Ok(Cached {
            valid: lookup.valid && data.is_some(),
            data,
            expires_on: Some(lookup.expires_on),
        })
    }

    pub async fn put<T: Serialize>(
        &self,
        value: &T,
        obtained_on: i64,
        expires_on: Option<i64>,
    ) -> Result<()> {
        self.cache
            .set(
                &self.namespace,
                serde_json::to_value(value)?,
                set_options(obtained_on, expires_on),
            )
            .await?;
        Ok(())
    }

    pub async fn put_now<T: Serialize>(&self, value: &T, expires_on: Option<i64>) -> Result<()> {
        self.put(value, now_ms(), expires_on).await
    }
}

/// Send a request and decode its JSON body, classifying failures for `step`
pub(crate) async fn fetch_json<T: DeserializeOwned>(
    step: &'static str,
    request: RequestBuilder,
) -> Result<T> {
    let response = request.send().await.map_err(AuthError::network(step))?;
    if !response.status().is_success() {
        return Err(AuthError::from_response(step, response).await);
    }
    response
        .json()
        .await
        .map_err(|e| AuthError::invalid_response(step, e.to_string()))
}
