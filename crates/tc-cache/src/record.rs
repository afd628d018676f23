use std::fmt;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

/// A record is only valid while `now + SAFETY_MARGIN_MS < expires_on`
pub const SAFETY_MARGIN_MS: i64 = 1_000;

/// Expiry applied when a writer does not provide one (30 days)
pub const DEFAULT_HORIZON_MS: i64 = 30 * 24 * 60 * 60 * 1_000;

/// Current wall clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Short stable hash used to key per-relying-party XSTS slots and cache file names
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().take(3).map(|b| format!("{b:02x}")).collect()
}

/// Logical slot of the credential chain a record belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Namespace {
    Identity,
    XboxUser,
    XboxDevice,
    XboxTitle,
    /// XSTS token for one relying party, keyed by [`short_hash`] of its URL
    Xsts(String),
    Java,
    Bedrock,
    Session,
    ThirdPartyLogin,
}

impl Namespace {
    pub fn xsts(relying_party: &str) -> Self {
        Self::Xsts(short_hash(relying_party))
    }

    pub fn key(&self) -> String {
        match self {
            Self::Identity => "identity".to_string(),
            Self::XboxUser => "xboxUser".to_string(),
            Self::XboxDevice => "xboxDevice".to_string(),
            Self::XboxTitle => "xboxTitle".to_string(),
            Self::Xsts(hash) => format!("xsts:{hash}"),
            Self::Java => "java".to_string(),
            Self::Bedrock => "bedrock".to_string(),
            Self::Session => "session".to_string(),
            Self::ThirdPartyLogin => "thirdPartyLogin".to_string(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Stored value plus its lifetime, in epoch milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub value: serde_json::Value,
    pub obtained_on: i64,
    pub expires_on: i64,
}

impl TokenRecord {
    pub fn new(value: serde_json::Value, options: SetOptions) -> Self {
        let now = now_ms();
        let obtained_on = options.obtained_on.unwrap_or(now);
        let expires_on = options.expires_on.unwrap_or(now + DEFAULT_HORIZON_MS);
        Self {
            value,
            obtained_on,
            expires_on,
        }
    }

    pub fn is_valid_at(&self, now: i64) -> bool {
        now + SAFETY_MARGIN_MS < self.expires_on
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_on <= now
    }

    /// Whether the value still carries a refresh token after its access token lapses
    pub fn is_renewable(&self) -> bool {
        self.value
            .get("refresh_token")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|token| !token.is_empty())
    }

    pub fn lookup(&self) -> CacheLookup {
        CacheLookup {
            value: self.value.clone(),
            valid: self.is_valid_at(now_ms()),
            obtained_on: self.obtained_on,
            expires_on: self.expires_on,
        }
    }
}

/// Optional timestamps for [`crate::Cache::set`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub obtained_on: Option<i64>,
    pub expires_on: Option<i64>,
}

impl SetOptions {
    pub fn expiring_at(expires_on: i64) -> Self {
        Self {
            obtained_on: None,
            expires_on: Some(expires_on),
        }
    }

    pub fn obtained_at(mut self, obtained_on: i64) -> Self {
        self.obtained_on = Some(obtained_on);
        self
    }
}

/// Result of a cache read; `valid` is computed at read time
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup {
    pub value: serde_json::Value,
    pub valid: bool,
    pub obtained_on: i64,
    pub expires_on: i64,
}

impl CacheLookup {
    /// Decode the stored value, treating a format mismatch as a cache miss
    pub fn parse<T: DeserializeOwned>(&self) -> Option<T> {
        match serde_json::from_value(self.value.clone()) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring cache entry with unexpected format: {}", e);
                None
            }
        }
    }
}
